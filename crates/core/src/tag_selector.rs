//! Boolean expression tree over device tags and channel tag groups.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{CampaignError, CampaignResult};

/// Tag group name → tags in that group.
pub type TagGroups = HashMap<String, HashSet<String>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum TagSelector {
    Tag { tag: String, group: Option<String> },
    And(Vec<TagSelector>),
    Or(Vec<TagSelector>),
    Not(Box<TagSelector>),
}

impl TagSelector {
    pub fn tag(tag: impl Into<String>) -> Self {
        Self::Tag {
            tag: tag.into(),
            group: None,
        }
    }

    pub fn group_tag(tag: impl Into<String>, group: impl Into<String>) -> Self {
        Self::Tag {
            tag: tag.into(),
            group: Some(group.into()),
        }
    }

    pub fn and(selectors: Vec<TagSelector>) -> Self {
        Self::And(selectors)
    }

    pub fn or(selectors: Vec<TagSelector>) -> Self {
        Self::Or(selectors)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(selector: TagSelector) -> Self {
        Self::Not(Box::new(selector))
    }

    /// Evaluates against device tags only. Group-qualified leaves are false.
    pub fn apply(&self, tags: &HashSet<String>) -> bool {
        self.apply_with_groups(tags, &TagGroups::new())
    }

    /// Evaluates against device tags plus resolved tag groups.
    pub fn apply_with_groups(&self, tags: &HashSet<String>, tag_groups: &TagGroups) -> bool {
        match self {
            Self::Tag { tag, group: None } => tags.contains(tag),
            Self::Tag {
                tag,
                group: Some(group),
            } => tag_groups
                .get(group)
                .is_some_and(|group_tags| group_tags.contains(tag)),
            Self::Not(inner) => !inner.apply_with_groups(tags, tag_groups),
            Self::And(selectors) => selectors
                .iter()
                .all(|s| s.apply_with_groups(tags, tag_groups)),
            Self::Or(selectors) => selectors
                .iter()
                .any(|s| s.apply_with_groups(tags, tag_groups)),
        }
    }

    pub fn contains_tag_groups(&self) -> bool {
        match self {
            Self::Tag { group, .. } => group.is_some(),
            Self::Not(inner) => inner.contains_tag_groups(),
            Self::And(selectors) | Self::Or(selectors) => {
                selectors.iter().any(TagSelector::contains_tag_groups)
            }
        }
    }

    /// Every group referenced by the tree with the tags it is queried for.
    pub fn tag_groups(&self) -> TagGroups {
        let mut groups = TagGroups::new();
        self.collect_tag_groups(&mut groups);
        groups
    }

    fn collect_tag_groups(&self, out: &mut TagGroups) {
        match self {
            Self::Tag {
                tag,
                group: Some(group),
            } => {
                out.entry(group.clone()).or_default().insert(tag.clone());
            }
            Self::Tag { group: None, .. } => {}
            Self::Not(inner) => inner.collect_tag_groups(out),
            Self::And(selectors) | Self::Or(selectors) => {
                for selector in selectors {
                    selector.collect_tag_groups(out);
                }
            }
        }
    }

    pub fn from_json(value: &Value) -> CampaignResult<Self> {
        let map = value.as_object().ok_or_else(|| {
            CampaignError::validation(format!("tag selector must be an object: {value}"))
        })?;

        if let Some(tag) = map.get("tag") {
            let tag = tag.as_str().ok_or_else(|| {
                CampaignError::validation(format!("tag selector expected a tag: {tag}"))
            })?;
            let group = match map.get("group") {
                None | Some(Value::Null) => None,
                Some(Value::String(group)) => Some(group.clone()),
                Some(other) => {
                    return Err(CampaignError::validation(format!(
                        "tag selector group must be a string: {other}"
                    )))
                }
            };
            return Ok(Self::Tag {
                tag: tag.to_string(),
                group,
            });
        }
        if let Some(list) = map.get("or") {
            return Ok(Self::Or(Self::parse_list("or", list)?));
        }
        if let Some(list) = map.get("and") {
            return Ok(Self::And(Self::parse_list("and", list)?));
        }
        if let Some(inner) = map.get("not") {
            return Ok(Self::not(Self::from_json(inner)?));
        }

        Err(CampaignError::validation(format!(
            "json value did not contain a valid selector: {value}"
        )))
    }

    fn parse_list(op: &str, value: &Value) -> CampaignResult<Vec<TagSelector>> {
        let items = value.as_array().ok_or_else(|| {
            CampaignError::validation(format!(
                "{op} selector expected an array of tag selectors: {value}"
            ))
        })?;
        if items.is_empty() {
            return Err(CampaignError::validation(format!(
                "{op} selector expected 1 or more selectors"
            )));
        }
        items.iter().map(Self::from_json).collect()
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Tag { tag, group } => {
                let mut map = Map::new();
                map.insert("tag".into(), Value::String(tag.clone()));
                if let Some(group) = group {
                    map.insert("group".into(), Value::String(group.clone()));
                }
                Value::Object(map)
            }
            Self::And(selectors) => {
                json!({ "and": selectors.iter().map(TagSelector::to_json).collect::<Vec<_>>() })
            }
            Self::Or(selectors) => {
                json!({ "or": selectors.iter().map(TagSelector::to_json).collect::<Vec<_>>() })
            }
            Self::Not(inner) => json!({ "not": inner.to_json() }),
        }
    }
}

impl TryFrom<Value> for TagSelector {
    type Error = CampaignError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_json(&value)
    }
}

impl From<TagSelector> for Value {
    fn from(selector: TagSelector) -> Self {
        selector.to_json()
    }
}
