//! Per-channel cache of tag-group membership in front of a remote lookup.
//!
//! Lookups are served from a fresh cached response when it covers the
//! requested groups; otherwise the source is asked again, and a cached copy
//! within the stale-read window is served if that fails. Local tag edits made
//! after the response was generated are replayed on top of it.
//!
//! The source is remote, so [`TagGroupCache::get_tags`] is async. Callers on
//! the delivery loop resolve groups from a spawned task and post the result
//! back.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use campaign_core::clock::Clock;
use campaign_core::config::TagGroupsConfig;
use campaign_core::tag_selector::TagGroups;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const DEVICE_GROUP: &str = "device";
pub const MIN_CACHE_MAX_AGE_SECS: u64 = 60;

/// Remote tag-group lookup. Implemented by the host's network layer.
#[async_trait]
pub trait TagGroupSource: Send + Sync {
    async fn lookup(&self, channel_id: &str, requested: &TagGroups) -> anyhow::Result<TagGroups>;
}

/// The channel a lookup is made for.
#[derive(Debug, Clone, Copy)]
pub struct ChannelTags<'a> {
    pub channel_id: Option<&'a str>,
    pub device_tags: &'a HashSet<String>,
    /// Whether the device's own tags are the source of truth for `device`.
    pub tag_registration: bool,
}

/// Local add/remove/set edit to tag groups.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TagGroupsMutation {
    #[serde(default)]
    pub add: TagGroups,
    #[serde(default)]
    pub remove: TagGroups,
    #[serde(default)]
    pub set: TagGroups,
}

impl TagGroupsMutation {
    pub fn add(group: impl Into<String>, tags: impl IntoIterator<Item = String>) -> Self {
        let mut mutation = Self::default();
        mutation.add.insert(group.into(), tags.into_iter().collect());
        mutation
    }

    pub fn remove(group: impl Into<String>, tags: impl IntoIterator<Item = String>) -> Self {
        let mut mutation = Self::default();
        mutation.remove.insert(group.into(), tags.into_iter().collect());
        mutation
    }

    pub fn set(group: impl Into<String>, tags: impl IntoIterator<Item = String>) -> Self {
        let mut mutation = Self::default();
        mutation.set.insert(group.into(), tags.into_iter().collect());
        mutation
    }

    /// Adds, then removes, then replaces whole groups.
    pub fn apply(&self, groups: &mut TagGroups) {
        for (group, tags) in &self.add {
            groups
                .entry(group.clone())
                .or_default()
                .extend(tags.iter().cloned());
        }
        for (group, tags) in &self.remove {
            if let Some(current) = groups.get_mut(group) {
                current.retain(|tag| !tags.contains(tag));
            }
        }
        for (group, tags) in &self.set {
            groups.insert(group.clone(), tags.clone());
        }
    }
}

struct CachedLookup {
    response: TagGroups,
    requested: TagGroups,
    created_at: DateTime<Utc>,
}

struct MutationRecord {
    recorded_at: DateTime<Utc>,
    mutation: TagGroupsMutation,
}

pub struct TagGroupCache {
    source: Arc<dyn TagGroupSource>,
    clock: Arc<dyn Clock>,
    settings: RwLock<TagGroupsConfig>,
    entries: DashMap<String, CachedLookup>,
    history: Mutex<VecDeque<MutationRecord>>,
}

impl TagGroupCache {
    pub fn new(source: Arc<dyn TagGroupSource>, clock: Arc<dyn Clock>) -> Self {
        Self::with_config(source, clock, TagGroupsConfig::default())
    }

    pub fn with_config(
        source: Arc<dyn TagGroupSource>,
        clock: Arc<dyn Clock>,
        config: TagGroupsConfig,
    ) -> Self {
        Self {
            source,
            clock,
            settings: RwLock::new(config),
            entries: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.read().enabled
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.settings.write().enabled = enabled;
    }

    /// Replace the cache settings with the `tag_groups` remote config block.
    pub fn apply_remote_config(&self, config: &TagGroupsConfig) {
        info!(
            enabled = config.enabled,
            max_age_secs = config.cache_max_age_seconds,
            stale_read_secs = config.cache_stale_read_time_seconds,
            prefer_local_secs = config.cache_prefer_local_until_seconds,
            "Applying tag group remote config"
        );
        *self.settings.write() = config.clone();
        self.prune_history();
    }

    pub fn max_age(&self) -> Duration {
        let secs = self
            .settings
            .read()
            .cache_max_age_seconds
            .max(MIN_CACHE_MAX_AGE_SECS);
        seconds(secs)
    }

    pub fn stale_read_age(&self) -> Duration {
        seconds(self.settings.read().cache_stale_read_time_seconds)
    }

    pub fn prefer_local_for(&self) -> Duration {
        seconds(self.settings.read().cache_prefer_local_until_seconds)
    }

    /// Record a tag edit made on this device so it can be overlaid on
    /// responses generated before the backend saw it.
    pub fn record_mutation(&self, mutation: TagGroupsMutation) {
        self.history.lock().push_back(MutationRecord {
            recorded_at: self.clock.now(),
            mutation,
        });
        self.prune_history();
    }

    /// Resolve the requested groups for a channel. `None` means no usable
    /// data: the cache is disabled, there is no channel, or the refresh
    /// failed with nothing fresh enough to fall back on.
    pub async fn get_tags(&self, channel: ChannelTags<'_>, requested: &TagGroups) -> Option<TagGroups> {
        if !self.is_enabled() {
            debug!("Tag group lookups are disabled");
            return None;
        }
        if requested.is_empty() {
            return Some(TagGroups::new());
        }
        if requested.len() == 1 && requested.contains_key(DEVICE_GROUP) && channel.tag_registration
        {
            let mut device = TagGroups::new();
            device.insert(DEVICE_GROUP.to_string(), channel.device_tags.clone());
            return Some(device);
        }
        let channel_id = channel.channel_id?;

        let now = self.clock.now();
        if let Some(groups) = self.cached(channel, requested, self.max_age(), now) {
            metrics::counter!("tag_groups.cache.hit").increment(1);
            return Some(groups);
        }
        metrics::counter!("tag_groups.cache.miss").increment(1);

        self.refresh(channel_id, requested).await;

        let stale_read = self.stale_read_age();
        let window = if stale_read <= Duration::zero() {
            Duration::MAX
        } else {
            stale_read
        };
        let groups = self.cached(channel, requested, window, now);
        if groups.is_none() && self.entries.contains_key(channel_id) {
            warn!(channel_id = %channel_id, "Cached tag groups are too stale to use");
        }
        groups
    }

    /// Cached response for the channel when it covers `requested` and is
    /// younger than `max_age`.
    fn cached(
        &self,
        channel: ChannelTags<'_>,
        requested: &TagGroups,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Option<TagGroups> {
        let entry = self.entries.get(channel.channel_id?)?;
        if !contains_all(&entry.requested, requested) || now - entry.created_at >= max_age {
            return None;
        }
        Some(self.generate(channel, requested, &entry.response, entry.created_at))
    }

    async fn refresh(&self, channel_id: &str, requested: &TagGroups) {
        match self.source.lookup(channel_id, requested).await {
            Ok(response) => {
                debug!(channel_id = %channel_id, groups = response.len(), "Refreshed tag groups");
                self.entries.insert(
                    channel_id.to_string(),
                    CachedLookup {
                        response,
                        requested: requested.clone(),
                        created_at: self.clock.now(),
                    },
                );
            }
            Err(e) => {
                metrics::counter!("tag_groups.refresh.failed").increment(1);
                warn!(channel_id = %channel_id, error = %e, "Failed to refresh tag groups");
            }
        }
    }

    fn generate(
        &self,
        channel: ChannelTags<'_>,
        requested: &TagGroups,
        response: &TagGroups,
        created_at: DateTime<Utc>,
    ) -> TagGroups {
        let mut current = response.clone();
        let since = created_at - self.prefer_local_for();
        for record in self.history.lock().iter() {
            if record.recorded_at >= since {
                record.mutation.apply(&mut current);
            }
        }
        if requested.contains_key(DEVICE_GROUP) && channel.tag_registration {
            current.insert(DEVICE_GROUP.to_string(), channel.device_tags.clone());
        }
        intersect(requested, &current)
    }

    fn prune_history(&self) {
        let max_age = self.stale_read_age() + self.prefer_local_for();
        let cutoff = self.clock.now() - max_age;
        self.history
            .lock()
            .retain(|record| record.recorded_at >= cutoff);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn seconds(secs: u64) -> Duration {
    Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1_000))
}

fn contains_all(cached: &TagGroups, requested: &TagGroups) -> bool {
    requested.iter().all(|(group, tags)| {
        cached
            .get(group)
            .is_some_and(|cached_tags| tags.is_subset(cached_tags))
    })
}

fn intersect(requested: &TagGroups, current: &TagGroups) -> TagGroups {
    requested
        .iter()
        .filter_map(|(group, tags)| {
            let present = current.get(group)?;
            let shared: HashSet<String> = tags.intersection(present).cloned().collect();
            Some((group.clone(), shared))
        })
        .collect()
}
