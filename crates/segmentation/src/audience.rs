//! Evaluates message audiences against a snapshot of device state.

use std::collections::HashSet;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use campaign_cache::{ChannelTags, TagGroupCache};
use campaign_core::audience::Audience;
use campaign_core::tag_selector::{TagGroups, TagSelector};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

/// Device state an audience is evaluated against.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub channel_id: Option<String>,
    pub notifications_opt_in: bool,
    pub location_opt_in: bool,
    /// Numeric app version code, when known.
    pub app_version: Option<u64>,
    /// BCP-47 style locale, e.g. `en-US` or `en_US`.
    pub locale: String,
    pub tags: HashSet<String>,
    pub channel_tag_registration: bool,
}

impl DeviceSnapshot {
    pub fn channel_tags(&self) -> ChannelTags<'_> {
        ChannelTags {
            channel_id: self.channel_id.as_deref(),
            device_tags: &self.tags,
            tag_registration: self.channel_tag_registration,
        }
    }
}

/// Supplies the current device state at evaluation time.
pub trait DeviceStateProvider: Send + Sync {
    fn snapshot(&self) -> DeviceSnapshot;
}

impl DeviceStateProvider for RwLock<DeviceSnapshot> {
    fn snapshot(&self) -> DeviceSnapshot {
        self.read().clone()
    }
}

pub struct AudienceEvaluator {
    tag_groups: Option<Arc<TagGroupCache>>,
}

impl AudienceEvaluator {
    pub fn new(tag_groups: Arc<TagGroupCache>) -> Self {
        Self {
            tag_groups: Some(tag_groups),
        }
    }

    /// Evaluator with no tag-group lookup; grouped selectors never match.
    pub fn without_tag_groups() -> Self {
        Self { tag_groups: None }
    }

    /// Groups that have to be looked up before `audience` can be checked.
    /// `None` when device state alone decides it.
    pub fn tag_groups_needed(&self, audience: &Audience) -> Option<TagGroups> {
        self.tag_groups.as_ref()?;
        let selector = audience.tag_selector.as_ref()?;
        selector
            .contains_tag_groups()
            .then(|| selector.tag_groups())
    }

    /// Looks the groups up through the cache. This may go to the network,
    /// so it never runs on the delivery loop.
    pub async fn resolve_tag_groups(
        &self,
        requested: &TagGroups,
        device: &DeviceSnapshot,
    ) -> Option<TagGroups> {
        let cache = self.tag_groups.as_ref()?;
        cache.get_tags(device.channel_tags(), requested).await
    }

    /// Display-time check: opt-ins, version, locale and tags. Grouped tag
    /// selectors are evaluated against `tag_groups` and fail without them.
    pub fn check_audience(
        &self,
        audience: &Audience,
        device: &DeviceSnapshot,
        tag_groups: Option<&TagGroups>,
    ) -> bool {
        if let Some(expected) = audience.notifications_opt_in {
            if expected != device.notifications_opt_in {
                debug!(expected, "Audience miss: notification opt-in");
                return false;
            }
        }
        if let Some(expected) = audience.location_opt_in {
            if expected != device.location_opt_in {
                debug!(expected, "Audience miss: location opt-in");
                return false;
            }
        }
        if let Some(matcher) = &audience.version_matcher {
            if !device.app_version.is_some_and(|v| matcher.matches(v)) {
                debug!(app_version = ?device.app_version, "Audience miss: app version");
                return false;
            }
        }
        if !audience.language_tags.is_empty()
            && !locale_matches(&device.locale, &audience.language_tags)
        {
            debug!(locale = %device.locale, "Audience miss: locale");
            return false;
        }
        if let Some(selector) = &audience.tag_selector {
            if !check_tags(selector, device, tag_groups) {
                debug!("Audience miss: tag selector");
                return false;
            }
        }
        true
    }

    /// Scheduling-time check: the display-time rules plus `new_user` and
    /// `test_devices`.
    pub fn check_audience_for_scheduling(
        &self,
        audience: &Audience,
        device: &DeviceSnapshot,
        is_new_user: bool,
        tag_groups: Option<&TagGroups>,
    ) -> bool {
        if let Some(expected) = audience.new_user {
            if expected != is_new_user {
                debug!(expected, is_new_user, "Audience miss: new user");
                return false;
            }
        }
        if !audience.test_devices.is_empty() {
            let Some(channel_id) = device.channel_id.as_deref() else {
                debug!("Audience miss: test devices without a channel");
                return false;
            };
            let digest = test_device_digest(channel_id);
            if !audience
                .test_devices
                .iter()
                .any(|candidate| candidate.trim() == digest)
            {
                debug!("Audience miss: not a test device");
                return false;
            }
        }
        self.check_audience(audience, device, tag_groups)
    }
}

fn check_tags(selector: &TagSelector, device: &DeviceSnapshot, tag_groups: Option<&TagGroups>) -> bool {
    if !selector.contains_tag_groups() {
        return selector.apply(&device.tags);
    }
    match tag_groups {
        Some(groups) => selector.apply_with_groups(&device.tags, groups),
        None => {
            debug!("Tag groups unavailable, failing audience check");
            false
        }
    }
}

/// Base64 of the first 16 bytes of the channel id's SHA-256.
pub fn test_device_digest(channel_id: &str) -> String {
    let hash = Sha256::digest(channel_id.as_bytes());
    STANDARD.encode(&hash[..16])
}

fn normalize_locale(locale: &str) -> String {
    locale
        .trim()
        .replace('_', "-")
        .trim_end_matches('-')
        .to_lowercase()
}

/// Matches either the full locale or its bare language.
fn locale_matches(device_locale: &str, language_tags: &[String]) -> bool {
    let device = normalize_locale(device_locale);
    let language = device.split('-').next().unwrap_or_default();
    language_tags.iter().any(|tag| {
        let tag = normalize_locale(tag);
        !tag.is_empty() && (tag == device || tag == language)
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use campaign_cache::TagGroupSource;
    use campaign_core::audience::VersionMatcher;
    use campaign_core::clock::ManualClock;
    use campaign_core::config::TagGroupsConfig;
    use chrono::Utc;

    struct StaticSource(TagGroups);

    #[async_trait]
    impl TagGroupSource for StaticSource {
        async fn lookup(&self, _channel_id: &str, _requested: &TagGroups) -> anyhow::Result<TagGroups> {
            Ok(self.0.clone())
        }
    }

    fn device() -> DeviceSnapshot {
        DeviceSnapshot {
            channel_id: Some("channel-1".into()),
            notifications_opt_in: true,
            location_opt_in: false,
            app_version: Some(42),
            locale: "en_US".into(),
            tags: ["vip".to_string()].into_iter().collect(),
            channel_tag_registration: true,
        }
    }

    fn evaluator_with_groups(groups: TagGroups) -> (AudienceEvaluator, Arc<TagGroupCache>) {
        let cache = Arc::new(TagGroupCache::new(
            Arc::new(StaticSource(groups)),
            Arc::new(ManualClock::new(Utc::now())),
        ));
        (AudienceEvaluator::new(cache.clone()), cache)
    }

    #[test]
    fn test_empty_audience_passes() {
        let evaluator = AudienceEvaluator::without_tag_groups();
        assert!(evaluator.check_audience(&Audience::default(), &device(), None));
        assert!(evaluator.check_audience_for_scheduling(&Audience::default(), &device(), false, None));
    }

    #[test]
    fn test_opt_ins_and_version() {
        let evaluator = AudienceEvaluator::without_tag_groups();
        let audience = Audience::builder()
            .notifications_opt_in(true)
            .location_opt_in(false)
            .version_matcher(VersionMatcher::range(Some(40), Some(50)).unwrap())
            .build();
        assert!(evaluator.check_audience(&audience, &device(), None));

        let mut old = device();
        old.app_version = Some(39);
        assert!(!evaluator.check_audience(&audience, &old, None));

        let mut unknown = device();
        unknown.app_version = None;
        assert!(!evaluator.check_audience(&audience, &unknown, None));
    }

    #[test]
    fn test_locale_matching() {
        assert!(locale_matches("en_US", &["en".into()]));
        assert!(locale_matches("en-us", &["EN_US".into()]));
        assert!(locale_matches("en-US", &["en-".into()]));
        assert!(!locale_matches("en-US", &["en-GB".into()]));
        assert!(!locale_matches("fr-FR", &["en".into()]));
    }

    #[test]
    fn test_new_user_only_checked_when_scheduling() {
        let evaluator = AudienceEvaluator::without_tag_groups();
        let audience = Audience::builder().new_user(true).build();
        assert!(evaluator.check_audience(&audience, &device(), None));
        assert!(!evaluator.check_audience_for_scheduling(&audience, &device(), false, None));
        assert!(evaluator.check_audience_for_scheduling(&audience, &device(), true, None));
    }

    #[test]
    fn test_test_devices() {
        let evaluator = AudienceEvaluator::without_tag_groups();
        let digest = test_device_digest("channel-1");
        assert_eq!(digest.len(), 24);

        let audience = Audience::builder()
            .test_device(format!(" {digest} "))
            .build();
        assert!(evaluator.check_audience_for_scheduling(&audience, &device(), false, None));

        let mut other = device();
        other.channel_id = Some("channel-2".into());
        assert!(!evaluator.check_audience_for_scheduling(&audience, &other, false, None));
    }

    #[tokio::test]
    async fn test_grouped_selector_uses_resolved_groups() {
        let mut groups = TagGroups::new();
        groups.insert("loyalty".into(), ["gold".to_string()].into_iter().collect());
        let (evaluator, cache) = evaluator_with_groups(groups);

        let audience = Audience::builder()
            .tag_selector(TagSelector::and(vec![
                TagSelector::tag("vip"),
                TagSelector::group_tag("gold", "loyalty"),
            ]))
            .build();
        let requested = evaluator.tag_groups_needed(&audience).unwrap();
        assert!(requested.contains_key("loyalty"));

        let resolved = evaluator.resolve_tag_groups(&requested, &device()).await;
        assert!(evaluator.check_audience(&audience, &device(), resolved.as_ref()));

        cache.apply_remote_config(&TagGroupsConfig {
            enabled: false,
            ..TagGroupsConfig::default()
        });
        let resolved = evaluator.resolve_tag_groups(&requested, &device()).await;
        assert!(resolved.is_none());
        assert!(!evaluator.check_audience(&audience, &device(), resolved.as_ref()));
    }

    #[test]
    fn test_device_tags_need_no_lookup() {
        let (evaluator, _cache) = evaluator_with_groups(TagGroups::new());
        let audience = Audience::builder()
            .tag_selector(TagSelector::tag("vip"))
            .build();
        assert!(evaluator.tag_groups_needed(&audience).is_none());
        assert!(evaluator.check_audience(&audience, &device(), None));
    }

    #[test]
    fn test_grouped_selector_without_cache_fails_closed() {
        let evaluator = AudienceEvaluator::without_tag_groups();
        let audience = Audience::builder()
            .tag_selector(TagSelector::group_tag("gold", "loyalty"))
            .build();
        assert!(evaluator.tag_groups_needed(&audience).is_none());
        assert!(!evaluator.check_audience(&audience, &device(), None));
    }
}
