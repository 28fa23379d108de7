//! Audience constraints attached to a message. Evaluation lives in the
//! segmentation crate; this module only owns the shape and its parsing.

use serde::{Deserialize, Serialize};

use crate::error::{CampaignError, CampaignResult};
use crate::tag_selector::TagSelector;

/// What happens to a triggered schedule whose audience no longer matches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissBehavior {
    #[default]
    Cancel,
}

/// Inclusive range over the app's numeric version code.
///
/// Parses from a flat `{at_least, at_most}` range, from a JSON matcher
/// `{"key": "version", "value": {..range..}}`, or from an `and`/`or`
/// predicate wrapping exactly one such matcher. Serializes as the flat range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "VersionMatcherJson")]
pub struct VersionMatcher {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at_least: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at_most: Option<u64>,
}

#[derive(Deserialize)]
struct RangeJson {
    #[serde(default)]
    at_least: Option<f64>,
    #[serde(default)]
    at_most: Option<f64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum VersionMatcherJson {
    And { and: Vec<VersionMatcherJson> },
    Or { or: Vec<VersionMatcherJson> },
    Matcher { value: RangeJson },
    Range(RangeJson),
}

fn version_bound(value: Option<f64>, round: fn(f64) -> f64) -> CampaignResult<Option<u64>> {
    match value {
        Some(v) if !v.is_finite() || v < 0.0 => Err(CampaignError::validation(format!(
            "invalid app version bound: {v}"
        ))),
        Some(v) => Ok(Some(round(v) as u64)),
        None => Ok(None),
    }
}

impl TryFrom<VersionMatcherJson> for VersionMatcher {
    type Error = CampaignError;

    fn try_from(json: VersionMatcherJson) -> CampaignResult<Self> {
        match json {
            VersionMatcherJson::And { and: mut items } | VersionMatcherJson::Or { or: mut items } => {
                match (items.pop(), items.is_empty()) {
                    (Some(item), true) => Self::try_from(item),
                    _ => Err(CampaignError::validation(
                        "app version predicate must wrap exactly one matcher",
                    )),
                }
            }
            VersionMatcherJson::Matcher { value: range } | VersionMatcherJson::Range(range) => Self::range(
                version_bound(range.at_least, f64::ceil)?,
                version_bound(range.at_most, f64::floor)?,
            ),
        }
    }
}

impl VersionMatcher {
    pub fn range(at_least: Option<u64>, at_most: Option<u64>) -> CampaignResult<Self> {
        if let (Some(min), Some(max)) = (at_least, at_most) {
            if min > max {
                return Err(CampaignError::validation(format!(
                    "version range is empty: {min} > {max}"
                )));
            }
        }
        Ok(Self { at_least, at_most })
    }

    pub fn matches(&self, version: u64) -> bool {
        self.at_least.map_or(true, |min| version >= min)
            && self.at_most.map_or(true, |max| version <= max)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Audience {
    #[serde(default, rename = "notification_opt_in", skip_serializing_if = "Option::is_none")]
    pub notifications_opt_in: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_opt_in: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_user: Option<bool>,
    #[serde(default, rename = "app_version", skip_serializing_if = "Option::is_none")]
    pub version_matcher: Option<VersionMatcher>,
    #[serde(default, rename = "locale", skip_serializing_if = "Vec::is_empty")]
    pub language_tags: Vec<String>,
    #[serde(
        default,
        alias = "tags",
        skip_serializing_if = "Option::is_none"
    )]
    pub tag_selector: Option<TagSelector>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub test_devices: Vec<String>,
    #[serde(default)]
    pub miss_behavior: MissBehavior,
}

impl Audience {
    pub fn builder() -> AudienceBuilder {
        AudienceBuilder::default()
    }

    pub fn from_json(value: &serde_json::Value) -> CampaignResult<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }

    /// True when no constraint is set.
    pub fn is_empty(&self) -> bool {
        self.notifications_opt_in.is_none()
            && self.location_opt_in.is_none()
            && self.new_user.is_none()
            && self.version_matcher.is_none()
            && self.language_tags.is_empty()
            && self.tag_selector.is_none()
            && self.test_devices.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct AudienceBuilder {
    audience: Audience,
}

impl AudienceBuilder {
    pub fn notifications_opt_in(mut self, opt_in: bool) -> Self {
        self.audience.notifications_opt_in = Some(opt_in);
        self
    }

    pub fn location_opt_in(mut self, opt_in: bool) -> Self {
        self.audience.location_opt_in = Some(opt_in);
        self
    }

    pub fn new_user(mut self, new_user: bool) -> Self {
        self.audience.new_user = Some(new_user);
        self
    }

    pub fn version_matcher(mut self, matcher: VersionMatcher) -> Self {
        self.audience.version_matcher = Some(matcher);
        self
    }

    pub fn language_tag(mut self, tag: impl Into<String>) -> Self {
        self.audience.language_tags.push(tag.into());
        self
    }

    pub fn tag_selector(mut self, selector: TagSelector) -> Self {
        self.audience.tag_selector = Some(selector);
        self
    }

    pub fn test_device(mut self, digest: impl Into<String>) -> Self {
        self.audience.test_devices.push(digest.into());
        self
    }

    pub fn miss_behavior(mut self, behavior: MissBehavior) -> Self {
        self.audience.miss_behavior = behavior;
        self
    }

    pub fn build(self) -> Audience {
        self.audience
    }
}
