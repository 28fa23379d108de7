//! Schedules pair a message with triggers and timing/limit rules. The
//! external engine persists them; everything here is validation and the
//! pure edit-application rules.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CampaignError, CampaignResult};
use crate::message::InAppMessage;

pub const MAX_TRIGGERS: usize = 10;
pub const DEFAULT_EDIT_GRACE_PERIOD: Duration = Duration::from_secs(10 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    AppInit,
    Foreground,
    Background,
    ScreenView,
    ActiveSession,
    RegionEnter,
    RegionExit,
    CustomEventCount,
    CustomEventValue,
    Version,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    pub goal: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<Value>,
}

impl Trigger {
    pub fn new(trigger_type: TriggerType, goal: f64) -> Self {
        Self {
            trigger_type,
            goal,
            predicate: None,
        }
    }

    pub fn foreground(goal: f64) -> Self {
        Self::new(TriggerType::Foreground, goal)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleInfo {
    message: InAppMessage,
    triggers: Vec<Trigger>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    priority: i32,
    limit: u32,
    #[serde(with = "duration_secs")]
    interval: Duration,
    #[serde(with = "duration_secs")]
    edit_grace_period: Duration,
    group: Option<String>,
}

impl ScheduleInfo {
    pub fn builder() -> ScheduleInfoBuilder {
        ScheduleInfoBuilder::default()
    }

    pub fn message(&self) -> &InAppMessage {
        &self.message
    }

    pub fn triggers(&self) -> &[Trigger] {
        &self.triggers
    }

    pub fn start(&self) -> Option<DateTime<Utc>> {
        self.start
    }

    pub fn end(&self) -> Option<DateTime<Utc>> {
        self.end
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn edit_grace_period(&self) -> Duration {
        self.edit_grace_period
    }

    /// Explicit group, falling back to the message id.
    pub fn group(&self) -> &str {
        self.group.as_deref().unwrap_or_else(|| self.message.id())
    }

    /// Swaps in a new message, e.g. after an extender rewrote it.
    pub fn with_message(mut self, message: InAppMessage) -> Self {
        self.message = message;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleInfoBuilder {
    message: Option<InAppMessage>,
    triggers: Vec<Trigger>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    priority: i32,
    limit: u32,
    interval: Duration,
    edit_grace_period: Duration,
    group: Option<String>,
}

impl Default for ScheduleInfoBuilder {
    fn default() -> Self {
        Self {
            message: None,
            triggers: Vec::new(),
            start: None,
            end: None,
            priority: 0,
            limit: 1,
            interval: Duration::ZERO,
            edit_grace_period: DEFAULT_EDIT_GRACE_PERIOD,
            group: None,
        }
    }
}

impl ScheduleInfoBuilder {
    pub fn message(mut self, message: InAppMessage) -> Self {
        self.message = Some(message);
        self
    }

    pub fn trigger(mut self, trigger: Trigger) -> Self {
        self.triggers.push(trigger);
        self
    }

    pub fn triggers(mut self, triggers: Vec<Trigger>) -> Self {
        self.triggers = triggers;
        self
    }

    pub fn start(mut self, start: Option<DateTime<Utc>>) -> Self {
        self.start = start;
        self
    }

    pub fn end(mut self, end: Option<DateTime<Utc>>) -> Self {
        self.end = end;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn edit_grace_period(mut self, grace: Duration) -> Self {
        self.edit_grace_period = grace;
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn build(self) -> CampaignResult<ScheduleInfo> {
        let message = self
            .message
            .ok_or_else(|| CampaignError::validation("schedule requires a message"))?;
        if self.triggers.is_empty() {
            return Err(CampaignError::validation(
                "schedule requires at least one trigger",
            ));
        }
        if self.triggers.len() > MAX_TRIGGERS {
            return Err(CampaignError::validation(format!(
                "schedule allows at most {MAX_TRIGGERS} triggers"
            )));
        }
        validate_window(self.start, self.end)?;

        Ok(ScheduleInfo {
            message,
            triggers: self.triggers,
            start: self.start,
            end: self.end,
            priority: self.priority,
            limit: self.limit,
            interval: self.interval,
            edit_grace_period: self.edit_grace_period,
            group: self.group,
        })
    }
}

fn validate_window(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> CampaignResult<()> {
    if let (Some(start), Some(end)) = (start, end) {
        if end < start {
            return Err(CampaignError::validation(format!(
                "schedule end {end} is before start {start}"
            )));
        }
    }
    Ok(())
}

/// Partial override applied to an existing schedule.
///
/// `start`/`end` use a nested option: `None` keeps the current value,
/// `Some(None)` clears it and `Some(Some(t))` sets it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScheduleEdits {
    pub message: Option<InAppMessage>,
    pub start: Option<Option<DateTime<Utc>>>,
    pub end: Option<Option<DateTime<Utc>>>,
    pub limit: Option<u32>,
    pub priority: Option<i32>,
    pub interval: Option<Duration>,
    pub edit_grace_period: Option<Duration>,
    pub metadata: Option<Value>,
}

impl ScheduleEdits {
    pub fn builder() -> ScheduleEditsBuilder {
        ScheduleEditsBuilder::default()
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScheduleEditsBuilder {
    edits: ScheduleEdits,
}

impl ScheduleEditsBuilder {
    pub fn message(mut self, message: InAppMessage) -> Self {
        self.edits.message = Some(message);
        self
    }

    pub fn start(mut self, start: Option<DateTime<Utc>>) -> Self {
        self.edits.start = Some(start);
        self
    }

    pub fn end(mut self, end: Option<DateTime<Utc>>) -> Self {
        self.edits.end = Some(end);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.edits.limit = Some(limit);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.edits.priority = Some(priority);
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.edits.interval = Some(interval);
        self
    }

    pub fn edit_grace_period(mut self, grace: Duration) -> Self {
        self.edits.edit_grace_period = Some(grace);
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.edits.metadata = Some(metadata);
        self
    }

    pub fn build(self) -> ScheduleEdits {
        self.edits
    }
}

/// A persisted schedule as the engine reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub group: String,
    pub metadata: Value,
    pub info: ScheduleInfo,
    #[serde(default)]
    pub execution_count: u32,
    #[serde(default)]
    pub trigger_progress: Vec<f64>,
}

impl Schedule {
    pub fn new(id: impl Into<String>, info: ScheduleInfo, metadata: Value) -> Self {
        let trigger_progress = vec![0.0; info.triggers.len()];
        Self {
            id: id.into(),
            group: info.group().to_string(),
            metadata,
            info,
            execution_count: 0,
            trigger_progress,
        }
    }

    pub fn message(&self) -> &InAppMessage {
        &self.info.message
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.info.end.is_some_and(|end| end <= now)
    }

    pub fn is_limit_reached(&self) -> bool {
        self.info.limit > 0 && self.execution_count >= self.info.limit
    }

    /// Applies edits in place. Id, group, triggers and progress survive; the
    /// schedule is left untouched when the result would be invalid.
    pub fn apply_edits(&mut self, edits: &ScheduleEdits) -> CampaignResult<()> {
        let start = edits.start.unwrap_or(self.info.start);
        let end = edits.end.unwrap_or(self.info.end);
        validate_window(start, end)?;

        if let Some(message) = &edits.message {
            self.info.message = message.clone();
        }
        self.info.start = start;
        self.info.end = end;
        if let Some(limit) = edits.limit {
            self.info.limit = limit;
        }
        if let Some(priority) = edits.priority {
            self.info.priority = priority;
        }
        if let Some(interval) = edits.interval {
            self.info.interval = interval;
        }
        if let Some(grace) = edits.edit_grace_period {
            self.info.edit_grace_period = grace;
        }
        if let Some(metadata) = &edits.metadata {
            self.metadata = metadata.clone();
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::message::DisplayContent;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    fn message(id: &str) -> InAppMessage {
        InAppMessage::builder()
            .id(id)
            .display_content(DisplayContent::custom(json!({"key": "value"})))
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_defaults() {
        let info = ScheduleInfo::builder()
            .message(message("m1"))
            .trigger(Trigger::foreground(1.0))
            .build()
            .unwrap();

        assert_eq!(info.limit(), 1);
        assert_eq!(info.group(), "m1");
        assert_eq!(info.edit_grace_period(), DEFAULT_EDIT_GRACE_PERIOD);
        assert_eq!(info.interval(), Duration::ZERO);
    }

    #[test]
    fn test_build_requires_message_and_triggers() {
        let no_message = ScheduleInfo::builder()
            .trigger(Trigger::foreground(1.0))
            .build();
        assert!(matches!(no_message, Err(CampaignError::Validation(_))));

        let no_triggers = ScheduleInfo::builder().message(message("m1")).build();
        assert!(matches!(no_triggers, Err(CampaignError::Validation(_))));

        let too_many = ScheduleInfo::builder()
            .message(message("m1"))
            .triggers(vec![Trigger::foreground(1.0); MAX_TRIGGERS + 1])
            .build();
        assert!(matches!(too_many, Err(CampaignError::Validation(_))));
    }

    #[test]
    fn test_end_before_start_is_rejected() {
        let now = Utc::now();
        let result = ScheduleInfo::builder()
            .message(message("m1"))
            .trigger(Trigger::foreground(1.0))
            .start(Some(now))
            .end(Some(now - ChronoDuration::seconds(1)))
            .build();
        assert!(matches!(result, Err(CampaignError::Validation(_))));
    }

    #[test]
    fn test_apply_edits_preserves_identity() {
        let info = ScheduleInfo::builder()
            .message(message("m1"))
            .trigger(Trigger::foreground(3.0))
            .build()
            .unwrap();
        let mut schedule = Schedule::new("sched-1", info, json!({}));
        schedule.trigger_progress = vec![2.0];
        schedule.execution_count = 1;

        let now = Utc::now();
        let edits = ScheduleEdits::builder()
            .message(message("m1"))
            .start(Some(now))
            .end(Some(now))
            .limit(5)
            .metadata(json!({"etag": "2"}))
            .build();
        schedule.apply_edits(&edits).unwrap();

        assert_eq!(schedule.id, "sched-1");
        assert_eq!(schedule.trigger_progress, vec![2.0]);
        assert_eq!(schedule.execution_count, 1);
        assert_eq!(schedule.info.limit(), 5);
        assert_eq!(schedule.info.start(), Some(now));
        assert_eq!(schedule.info.end(), Some(now));
        assert_eq!(schedule.metadata, json!({"etag": "2"}));
    }

    #[test]
    fn test_invalid_edits_leave_schedule_untouched() {
        let now = Utc::now();
        let info = ScheduleInfo::builder()
            .message(message("m1"))
            .trigger(Trigger::foreground(1.0))
            .start(Some(now))
            .build()
            .unwrap();
        let mut schedule = Schedule::new("sched-1", info.clone(), json!({}));

        let edits = ScheduleEdits::builder()
            .end(Some(now - ChronoDuration::hours(1)))
            .limit(9)
            .build();
        assert!(schedule.apply_edits(&edits).is_err());
        assert_eq!(schedule.info, info);

        let clear = ScheduleEdits::builder().start(None).build();
        schedule.apply_edits(&clear).unwrap();
        assert_eq!(schedule.info.start(), None);
    }
}
