//! Turns remote message snapshots into schedule creates and edits.
//!
//! Snapshots are applied in arrival order, each one completely before the
//! next. A message that disappears from the feed is not cancelled: its
//! schedule is edited to start and end at the snapshot timestamp so the
//! engine expires it on its own terms.
//!
//! [`SnapshotFeed`] stamps every snapshot with a sequence number before it
//! goes anywhere. Snapshots whose audiences need tag groups have them looked
//! up off the loop, and the reconciler holds back any snapshot that arrives
//! ahead of its turn.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use campaign_core::error::{CampaignError, CampaignResult};
use campaign_core::message::{InAppMessage, MessageSource};
use campaign_core::schedule::{ScheduleEdits, ScheduleInfo, Trigger};
use campaign_core::tag_selector::TagGroups;
use campaign_segmentation::{AudienceEvaluator, DeviceStateProvider};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, error, info, warn};

use crate::adapter::ExtenderSlot;
use crate::event_loop::LoopHandle;
use crate::scheduler::Scheduler;

pub const PAYLOAD_TYPE: &str = "in_app_messages";

/// One message listing from the remote feed.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSnapshot {
    pub timestamp: DateTime<Utc>,
    pub metadata: Value,
    pub entries: Vec<RemoteMessageEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteMessageEntry {
    pub message: InAppMessage,
    pub triggers: Vec<Trigger>,
    pub limit: Option<u32>,
    pub priority: Option<i32>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub edit_grace_period_days: Option<u64>,
    pub interval_secs: Option<u64>,
    pub created: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Deserialize)]
struct EntryJson {
    message: Value,
    #[serde(default)]
    triggers: Vec<Trigger>,
    limit: Option<u32>,
    priority: Option<i32>,
    start: Option<String>,
    end: Option<String>,
    edit_grace_period: Option<u64>,
    interval: Option<u64>,
    created: String,
    last_updated: String,
}

/// Parses ISO-8601 timestamps with or without an offset; offset-less
/// values are taken as UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc())
}

fn required_timestamp(value: &str, field: &str) -> CampaignResult<DateTime<Utc>> {
    parse_timestamp(value)
        .ok_or_else(|| CampaignError::validation(format!("invalid {field} timestamp: {value}")))
}

fn optional_timestamp(value: Option<&str>, field: &str) -> CampaignResult<Option<DateTime<Utc>>> {
    value.map(|v| required_timestamp(v, field)).transpose()
}

impl RemoteMessageEntry {
    pub fn from_json(value: &Value) -> CampaignResult<Self> {
        let json: EntryJson = serde_json::from_value(value.clone())?;
        let message = InAppMessage::from_json(&json.message)?
            .into_builder()
            .source(MessageSource::RemoteData)
            .build()?;

        Ok(Self {
            message,
            triggers: json.triggers,
            limit: json.limit,
            priority: json.priority,
            start: optional_timestamp(json.start.as_deref(), "start")?,
            end: optional_timestamp(json.end.as_deref(), "end")?,
            edit_grace_period_days: json.edit_grace_period,
            interval_secs: json.interval,
            created: required_timestamp(&json.created, "created")?,
            last_updated: required_timestamp(&json.last_updated, "last_updated")?,
        })
    }

    pub fn message_id(&self) -> &str {
        self.message.id()
    }

    fn edit_grace_period(&self) -> Option<Duration> {
        self.edit_grace_period_days
            .map(|days| Duration::from_secs(days.saturating_mul(24 * 60 * 60)))
    }

    pub fn to_schedule_info(&self, message: InAppMessage) -> CampaignResult<ScheduleInfo> {
        let mut builder = ScheduleInfo::builder()
            .message(message)
            .triggers(self.triggers.clone())
            .start(self.start)
            .end(self.end);
        if let Some(limit) = self.limit {
            builder = builder.limit(limit);
        }
        if let Some(priority) = self.priority {
            builder = builder.priority(priority);
        }
        if let Some(secs) = self.interval_secs {
            builder = builder.interval(Duration::from_secs(secs));
        }
        if let Some(grace) = self.edit_grace_period() {
            builder = builder.edit_grace_period(grace);
        }
        builder.build()
    }

    /// Full edit for a changed entry. An absent end clears any end set by
    /// an earlier removal.
    pub fn to_edits(&self, message: InAppMessage, metadata: &Value) -> ScheduleEdits {
        let mut builder = ScheduleEdits::builder()
            .message(message)
            .start(self.start)
            .end(self.end)
            .limit(self.limit.unwrap_or(1))
            .priority(self.priority.unwrap_or_default())
            .interval(Duration::from_secs(self.interval_secs.unwrap_or_default()))
            .metadata(metadata.clone());
        if let Some(grace) = self.edit_grace_period() {
            builder = builder.edit_grace_period(grace);
        }
        builder.build()
    }
}

impl RemoteSnapshot {
    /// Parses a `{type, timestamp, metadata, data: {in_app_messages}}`
    /// payload. Entries that fail to parse are logged and dropped.
    pub fn from_json(value: &Value) -> CampaignResult<Self> {
        let payload_type = value.get("type").and_then(Value::as_str).unwrap_or_default();
        if payload_type != PAYLOAD_TYPE {
            return Err(CampaignError::validation(format!(
                "unexpected payload type: {payload_type}"
            )));
        }
        let timestamp = value
            .get("timestamp")
            .and_then(Value::as_str)
            .ok_or_else(|| CampaignError::validation("payload timestamp is required"))
            .and_then(|raw| required_timestamp(raw, "payload"))?;
        let metadata = value
            .get("metadata")
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));

        let raw_entries = value
            .pointer("/data/in_app_messages")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        let mut entries = Vec::with_capacity(raw_entries.len());
        for raw in raw_entries {
            match RemoteMessageEntry::from_json(raw) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    metrics::counter!("inapp.remote_data.invalid_entry").increment(1);
                    warn!(error = %e, "Skipping invalid in-app message entry");
                }
            }
        }

        Ok(Self {
            timestamp,
            metadata,
            entries,
        })
    }
}

/// Counts of engine calls made for one snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub scheduled: usize,
    pub edited: usize,
    pub ended: usize,
    pub skipped: usize,
    /// Entries whose extender or engine call failed. A snapshot with
    /// failures is not marked applied, so delivering it again retries them.
    pub failed: usize,
}

enum EditOutcome {
    Edited,
    Gone,
    Failed,
}

enum Adoption {
    /// Adopted the engine's schedule, or there was none to adopt.
    Proceed,
    Duplicate,
    Failed,
}

struct QueuedSnapshot {
    snapshot: RemoteSnapshot,
    tag_groups: Option<TagGroups>,
    reply: oneshot::Sender<ReconcileSummary>,
}

pub struct RemoteDataReconciler {
    scheduler: Arc<dyn Scheduler>,
    audience: Arc<AudienceEvaluator>,
    device: Arc<dyn DeviceStateProvider>,
    extender: ExtenderSlot,
    new_user_cutoff: Option<DateTime<Utc>>,
    schedule_ids: HashMap<String, String>,
    applied: HashMap<String, (RemoteMessageEntry, Value)>,
    live: HashSet<String>,
    last_snapshot: Option<(DateTime<Utc>, Value)>,
    next_seq: u64,
    queued: BTreeMap<u64, QueuedSnapshot>,
}

impl RemoteDataReconciler {
    pub fn new(
        scheduler: Arc<dyn Scheduler>,
        audience: Arc<AudienceEvaluator>,
        device: Arc<dyn DeviceStateProvider>,
        extender: ExtenderSlot,
    ) -> Self {
        Self {
            scheduler,
            audience,
            device,
            extender,
            new_user_cutoff: None,
            schedule_ids: HashMap::new(),
            applied: HashMap::new(),
            live: HashSet::new(),
            last_snapshot: None,
            next_seq: 0,
            queued: BTreeMap::new(),
        }
    }

    /// Messages created at or before the cutoff may target new users.
    pub fn set_new_user_cutoff(&mut self, cutoff: Option<DateTime<Utc>>) {
        self.new_user_cutoff = cutoff;
    }

    pub fn schedule_id(&self, message_id: &str) -> Option<&str> {
        self.schedule_ids.get(message_id).map(String::as_str)
    }

    /// Takes snapshot `seq` from a [`SnapshotFeed`] and applies every queued
    /// snapshot whose turn has come.
    fn receive(
        &mut self,
        seq: u64,
        snapshot: RemoteSnapshot,
        tag_groups: Option<TagGroups>,
        reply: oneshot::Sender<ReconcileSummary>,
    ) {
        self.queued.insert(
            seq,
            QueuedSnapshot {
                snapshot,
                tag_groups,
                reply,
            },
        );
        while let Some(queued) = self.queued.remove(&self.next_seq) {
            self.next_seq += 1;
            let summary = self.apply_with_tag_groups(&queued.snapshot, queued.tag_groups.as_ref());
            let _ = queued.reply.send(summary);
        }
        if !self.queued.is_empty() {
            debug!(waiting = self.queued.len(), next = self.next_seq, "Snapshots waiting for their turn");
        }
    }

    /// Applies a snapshot whose audiences need no tag groups.
    pub fn apply(&mut self, snapshot: &RemoteSnapshot) -> ReconcileSummary {
        self.apply_with_tag_groups(snapshot, None)
    }

    /// Applies a snapshot. `tag_groups` are the groups looked up ahead of
    /// time for grouped tag selectors; without them those audiences fail.
    pub fn apply_with_tag_groups(
        &mut self,
        snapshot: &RemoteSnapshot,
        tag_groups: Option<&TagGroups>,
    ) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        let key = (snapshot.timestamp, snapshot.metadata.clone());
        if self.last_snapshot.as_ref() == Some(&key) {
            debug!(timestamp = %snapshot.timestamp, "Snapshot already applied");
            return summary;
        }

        let mut incoming = HashSet::with_capacity(snapshot.entries.len());
        let mut new_entries = Vec::new();

        for entry in &snapshot.entries {
            let message_id = entry.message_id().to_string();
            if !incoming.insert(message_id.clone()) {
                warn!(message_id = %message_id, "Duplicate message in snapshot");
                continue;
            }

            let fingerprint = (entry.clone(), snapshot.metadata.clone());
            if self.applied.get(&message_id) == Some(&fingerprint) {
                continue;
            }

            if !self.schedule_ids.contains_key(&message_id) {
                match self.adopt_existing(&message_id) {
                    Adoption::Proceed => {}
                    Adoption::Duplicate => {
                        summary.skipped += 1;
                        continue;
                    }
                    Adoption::Failed => {
                        summary.failed += 1;
                        continue;
                    }
                }
            }

            match self.schedule_ids.get(&message_id).cloned() {
                Some(schedule_id) => match self.edit_entry(&schedule_id, entry, &snapshot.metadata) {
                    EditOutcome::Edited => {
                        summary.edited += 1;
                        self.applied.insert(message_id, fingerprint);
                    }
                    EditOutcome::Gone => new_entries.push(entry),
                    EditOutcome::Failed => summary.failed += 1,
                },
                None => new_entries.push(entry),
            }
        }

        self.schedule_entries(&new_entries, snapshot, tag_groups, &mut summary);

        let removed: Vec<String> = self.live.difference(&incoming).cloned().collect();
        for message_id in removed {
            self.applied.remove(&message_id);
            let Some(schedule_id) = self.schedule_ids.get(&message_id) else {
                continue;
            };
            let edits = ScheduleEdits::builder()
                .start(Some(snapshot.timestamp))
                .end(Some(snapshot.timestamp))
                .metadata(snapshot.metadata.clone())
                .build();
            match self.scheduler.edit_schedule(schedule_id, &edits) {
                Ok(_) => {
                    info!(message_id = %message_id, schedule_id = %schedule_id, "Ended removed in-app message");
                    summary.ended += 1;
                }
                Err(e) => {
                    error!(message_id = %message_id, error = %e, "Failed to end removed in-app message");
                }
            }
        }

        self.live = incoming;
        self.last_snapshot = (summary.failed == 0).then_some(key);
        metrics::counter!("inapp.remote_data.snapshots").increment(1);
        info!(
            timestamp = %snapshot.timestamp,
            scheduled = summary.scheduled,
            edited = summary.edited,
            ended = summary.ended,
            skipped = summary.skipped,
            failed = summary.failed,
            "Applied remote snapshot"
        );
        summary
    }

    /// Picks up a schedule the engine already has for this message.
    fn adopt_existing(&mut self, message_id: &str) -> Adoption {
        match self.scheduler.get_schedules_by_group(message_id) {
            Ok(existing) if existing.len() > 1 => {
                error!(message_id = %message_id, count = existing.len(), "Duplicate schedules for in-app message");
                Adoption::Duplicate
            }
            Ok(existing) => {
                if let Some(schedule) = existing.into_iter().next() {
                    debug!(message_id = %message_id, schedule_id = %schedule.id, "Adopting existing schedule");
                    self.schedule_ids.insert(message_id.to_string(), schedule.id);
                }
                Adoption::Proceed
            }
            Err(e) => {
                error!(message_id = %message_id, error = %e, "Failed to look up schedules");
                Adoption::Failed
            }
        }
    }

    /// A schedule the engine no longer knows is forgotten so the entry gets
    /// scheduled afresh.
    fn edit_entry(&mut self, schedule_id: &str, entry: &RemoteMessageEntry, metadata: &Value) -> EditOutcome {
        let message_id = entry.message_id();
        let message = match self.extender.extend(entry.message.clone()) {
            Ok(message) => message,
            Err(e) => {
                warn!(message_id = %message_id, error = %e, "Message extender failed, edit skipped");
                return EditOutcome::Failed;
            }
        };
        let edits = entry.to_edits(message, metadata);
        match self.scheduler.edit_schedule(schedule_id, &edits) {
            Ok(Some(_)) => {
                debug!(message_id = %message_id, schedule_id = %schedule_id, "Updated in-app message");
                EditOutcome::Edited
            }
            Ok(None) => {
                debug!(message_id = %message_id, schedule_id = %schedule_id, "Schedule gone, rescheduling");
                self.schedule_ids.remove(message_id);
                EditOutcome::Gone
            }
            Err(e) => {
                error!(message_id = %message_id, error = %e, "Failed to edit in-app message");
                EditOutcome::Failed
            }
        }
    }

    fn schedule_entries(
        &mut self,
        entries: &[&RemoteMessageEntry],
        snapshot: &RemoteSnapshot,
        tag_groups: Option<&TagGroups>,
        summary: &mut ReconcileSummary,
    ) {
        if entries.is_empty() {
            return;
        }
        let device = self.device.snapshot();
        let mut infos = Vec::with_capacity(entries.len());
        for entry in entries {
            let message_id = entry.message_id().to_string();
            // Recorded up front so an unchanged entry is not re-evaluated.
            self.applied
                .insert(message_id.clone(), ((*entry).clone(), snapshot.metadata.clone()));

            if let Some(audience) = entry.message.audience() {
                let is_new_user = self
                    .new_user_cutoff
                    .is_some_and(|cutoff| entry.created <= cutoff);
                if !self
                    .audience
                    .check_audience_for_scheduling(audience, &device, is_new_user, tag_groups)
                {
                    debug!(message_id = %message_id, "Audience excludes device, not scheduling");
                    summary.skipped += 1;
                    continue;
                }
            }

            let info = self
                .extender
                .extend(entry.message.clone())
                .and_then(|message| Ok(entry.to_schedule_info(message)?));
            match info {
                Ok(info) => infos.push(info),
                Err(e) => {
                    self.applied.remove(&message_id);
                    summary.failed += 1;
                    warn!(message_id = %message_id, error = %e, "Failed to build schedule for in-app message");
                }
            }
        }

        if infos.is_empty() {
            return;
        }
        let count = infos.len();
        match self.scheduler.schedule(infos, snapshot.metadata.clone()) {
            Ok(created) => {
                for schedule in &created {
                    let message_id = schedule.message().id().to_string();
                    info!(message_id = %message_id, schedule_id = %schedule.id, "Scheduled in-app message");
                    self.schedule_ids.insert(message_id, schedule.id.clone());
                }
                summary.scheduled += created.len();
            }
            Err(e) => {
                error!(error = %e, "Failed to schedule in-app messages");
                for entry in entries {
                    self.applied.remove(entry.message_id());
                }
                summary.failed += count;
            }
        }
    }
}

impl AsMut<RemoteDataReconciler> for RemoteDataReconciler {
    fn as_mut(&mut self) -> &mut RemoteDataReconciler {
        self
    }
}

/// Union of the tag groups the snapshot's audiences need, if any.
fn tag_groups_needed(audience: &AudienceEvaluator, snapshot: &RemoteSnapshot) -> Option<TagGroups> {
    let mut requested = TagGroups::new();
    for groups in snapshot
        .entries
        .iter()
        .filter_map(|entry| entry.message.audience())
        .filter_map(|entry_audience| audience.tag_groups_needed(entry_audience))
    {
        for (group, tags) in groups {
            requested.entry(group).or_default().extend(tags);
        }
    }
    (!requested.is_empty()).then_some(requested)
}

/// Hands snapshots to the reconciler on the loop, in submission order.
pub struct SnapshotFeed<S> {
    handle: LoopHandle<S>,
    audience: Arc<AudienceEvaluator>,
    device: Arc<dyn DeviceStateProvider>,
    next_seq: Arc<AtomicU64>,
}

impl<S> Clone for SnapshotFeed<S> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            audience: self.audience.clone(),
            device: self.device.clone(),
            next_seq: self.next_seq.clone(),
        }
    }
}

impl<S: AsMut<RemoteDataReconciler> + 'static> SnapshotFeed<S> {
    pub fn new(
        handle: LoopHandle<S>,
        audience: Arc<AudienceEvaluator>,
        device: Arc<dyn DeviceStateProvider>,
    ) -> Self {
        Self {
            handle,
            audience,
            device,
            next_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Queues a snapshot. The receiver resolves once it has been applied.
    /// Snapshots that need tag groups must be submitted within a tokio
    /// runtime; the lookup runs on it.
    pub fn submit(&self, snapshot: RemoteSnapshot) -> oneshot::Receiver<ReconcileSummary> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let (reply, receiver) = oneshot::channel();
        match tag_groups_needed(&self.audience, &snapshot) {
            None => {
                self.handle.post(move |state: &mut S, _: &LoopHandle<S>| {
                    state.as_mut().receive(seq, snapshot, None, reply);
                });
            }
            Some(requested) => {
                debug!(seq, groups = requested.len(), "Resolving tag groups for snapshot");
                let audience = self.audience.clone();
                let device = self.device.snapshot();
                self.handle.spawn_then(
                    async move { audience.resolve_tag_groups(&requested, &device).await },
                    move |state: &mut S, _: &LoopHandle<S>, groups: Option<TagGroups>| {
                        state.as_mut().receive(seq, snapshot, groups, reply);
                    },
                );
            }
        }
        receiver
    }
}

/// Feeds each snapshot from `stream` into `feed` in arrival order.
pub fn subscribe<S, St>(stream: St, feed: SnapshotFeed<S>) -> JoinHandle<()>
where
    S: AsMut<RemoteDataReconciler> + 'static,
    St: Stream<Item = RemoteSnapshot> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::pin!(stream);
        while let Some(snapshot) = stream.next().await {
            drop(feed.submit(snapshot));
        }
        debug!("Remote data stream closed");
    })
}
