//! Seam to the automation engine that persists schedules and counts
//! triggers, plus an in-memory engine used by tests and the demo runner.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use campaign_core::clock::Clock;
use campaign_core::schedule::{Schedule, ScheduleEdits, ScheduleInfo};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outcome of the prepare step as reported to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrepareScheduleResult {
    Continue,
    /// Nothing can display this schedule right now; skip this execution.
    Skip,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionResult {
    Finished,
    Cancel,
    /// Nothing was displayed because the schedule was no longer ready.
    /// The execution does not count; try again later.
    NotReady,
}

/// One-shot completion signal the engine hands over on execution.
#[derive(Debug)]
pub struct ExecutionCallback {
    sender: oneshot::Sender<ExecutionResult>,
}

impl ExecutionCallback {
    pub fn new() -> (Self, oneshot::Receiver<ExecutionResult>) {
        let (sender, receiver) = oneshot::channel();
        (Self { sender }, receiver)
    }

    pub fn finish(self, result: ExecutionResult) {
        if self.sender.send(result).is_err() {
            debug!(?result, "Execution callback receiver dropped");
        }
    }
}

pub trait Scheduler: Send + Sync {
    fn schedule(&self, infos: Vec<ScheduleInfo>, metadata: Value) -> anyhow::Result<Vec<Schedule>>;

    /// `Ok(None)` when the schedule is unknown or past its edit grace period.
    fn edit_schedule(&self, schedule_id: &str, edits: &ScheduleEdits) -> anyhow::Result<Option<Schedule>>;

    fn cancel(&self, schedule_id: &str) -> anyhow::Result<bool>;

    fn cancel_group(&self, group: &str) -> anyhow::Result<usize>;

    fn cancel_groups(&self, groups: &[String]) -> anyhow::Result<usize> {
        groups
            .iter()
            .try_fold(0, |total, group| Ok(total + self.cancel_group(group)?))
    }

    fn get_schedule(&self, schedule_id: &str) -> anyhow::Result<Option<Schedule>>;

    fn get_schedules_by_group(&self, group: &str) -> anyhow::Result<Vec<Schedule>>;

    fn get_schedules(&self) -> anyhow::Result<Vec<Schedule>>;

    fn set_paused(&self, paused: bool);

    fn is_paused(&self) -> bool;

    /// Readiness may have changed; re-evaluate schedules waiting to execute.
    fn check_pending_schedules(&self);

    fn on_prepare_result(&self, schedule_id: &str, result: PrepareScheduleResult);
}

/// Calls recorded by [`InMemoryScheduler`].
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerCall {
    Schedule { message_ids: Vec<String> },
    Edit { schedule_id: String, edits: ScheduleEdits },
    Cancel { schedule_id: String },
    CancelGroup { group: String },
}

pub struct InMemoryScheduler {
    clock: Arc<dyn Clock>,
    schedules: DashMap<String, Schedule>,
    expired: Mutex<HashSet<String>>,
    prepare_results: DashMap<String, PrepareScheduleResult>,
    calls: Mutex<Vec<SchedulerCall>>,
    paused: AtomicBool,
    pending_checks: AtomicUsize,
}

impl InMemoryScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            schedules: DashMap::new(),
            expired: Mutex::new(HashSet::new()),
            prepare_results: DashMap::new(),
            calls: Mutex::new(Vec::new()),
            paused: AtomicBool::new(false),
            pending_checks: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> Vec<SchedulerCall> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn edits_for(&self, schedule_id: &str) -> Vec<ScheduleEdits> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                SchedulerCall::Edit { schedule_id: id, edits } if id == schedule_id => {
                    Some(edits.clone())
                }
                _ => None,
            })
            .collect()
    }

    pub fn prepare_result(&self, schedule_id: &str) -> Option<PrepareScheduleResult> {
        self.prepare_results.get(schedule_id).map(|r| *r)
    }

    pub fn pending_checks(&self) -> usize {
        self.pending_checks.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.schedules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schedules.is_empty()
    }

    /// Books a finished execution. Schedules that hit their limit or were
    /// cancelled by the execution are removed.
    pub fn complete_execution(&self, schedule_id: &str, result: ExecutionResult) {
        if result == ExecutionResult::NotReady {
            debug!(schedule_id = %schedule_id, "Execution deferred, schedule stays prepared");
            return;
        }
        self.prepare_results.remove(schedule_id);
        let finished = match result {
            ExecutionResult::Cancel => true,
            ExecutionResult::Finished => match self.schedules.get_mut(schedule_id) {
                Some(mut schedule) => {
                    schedule.execution_count += 1;
                    schedule.is_limit_reached()
                }
                None => false,
            },
            ExecutionResult::NotReady => false,
        };
        if finished {
            self.schedules.remove(schedule_id);
            debug!(schedule_id = %schedule_id, ?result, "Schedule finished");
        }
    }

    /// Schedules whose end passed since the last call. They stay editable
    /// until their grace period runs out.
    pub fn take_expired(&self) -> Vec<Schedule> {
        let now = self.clock.now();
        let mut expired = self.expired.lock();
        let newly: Vec<Schedule> = self
            .schedules
            .iter()
            .filter(|s| s.is_expired_at(now) && !expired.contains(&s.id))
            .map(|s| s.clone())
            .collect();
        for schedule in &newly {
            expired.insert(schedule.id.clone());
        }
        drop(expired);
        self.prune(now);
        newly
    }

    fn prune(&self, now: DateTime<Utc>) {
        let mut expired = self.expired.lock();
        self.schedules.retain(|id, schedule| {
            let keep = !past_grace(schedule, now);
            if !keep {
                expired.remove(id);
            }
            keep
        });
    }

    fn record(&self, call: SchedulerCall) {
        self.calls.lock().push(call);
    }
}

fn past_grace(schedule: &Schedule, now: DateTime<Utc>) -> bool {
    let grace = Duration::from_std(schedule.info.edit_grace_period())
        .unwrap_or_else(|_| Duration::days(36_500));
    schedule
        .info
        .end()
        .and_then(|end| end.checked_add_signed(grace))
        .is_some_and(|deadline| deadline < now)
}

impl Scheduler for InMemoryScheduler {
    fn schedule(&self, infos: Vec<ScheduleInfo>, metadata: Value) -> anyhow::Result<Vec<Schedule>> {
        self.record(SchedulerCall::Schedule {
            message_ids: infos.iter().map(|i| i.message().id().to_string()).collect(),
        });
        let created: Vec<Schedule> = infos
            .into_iter()
            .map(|info| Schedule::new(Uuid::new_v4().to_string(), info, metadata.clone()))
            .collect();
        for schedule in &created {
            info!(schedule_id = %schedule.id, group = %schedule.group, "Schedule created");
            self.schedules.insert(schedule.id.clone(), schedule.clone());
        }
        Ok(created)
    }

    fn edit_schedule(&self, schedule_id: &str, edits: &ScheduleEdits) -> anyhow::Result<Option<Schedule>> {
        self.record(SchedulerCall::Edit {
            schedule_id: schedule_id.to_string(),
            edits: edits.clone(),
        });
        let now = self.clock.now();
        let Some(mut schedule) = self.schedules.get_mut(schedule_id) else {
            return Ok(None);
        };
        if past_grace(&schedule, now) {
            warn!(schedule_id = %schedule_id, "Edit dropped, schedule is past its grace period");
            return Ok(None);
        }
        schedule.apply_edits(edits)?;
        let edited = schedule.clone();
        drop(schedule);
        if !edited.is_expired_at(now) {
            self.expired.lock().remove(schedule_id);
        }
        Ok(Some(edited))
    }

    fn cancel(&self, schedule_id: &str) -> anyhow::Result<bool> {
        self.record(SchedulerCall::Cancel {
            schedule_id: schedule_id.to_string(),
        });
        self.prepare_results.remove(schedule_id);
        Ok(self.schedules.remove(schedule_id).is_some())
    }

    fn cancel_group(&self, group: &str) -> anyhow::Result<usize> {
        self.record(SchedulerCall::CancelGroup {
            group: group.to_string(),
        });
        let before = self.schedules.len();
        self.schedules.retain(|_, schedule| schedule.group != group);
        Ok(before - self.schedules.len())
    }

    fn get_schedule(&self, schedule_id: &str) -> anyhow::Result<Option<Schedule>> {
        Ok(self.schedules.get(schedule_id).map(|s| s.clone()))
    }

    fn get_schedules_by_group(&self, group: &str) -> anyhow::Result<Vec<Schedule>> {
        Ok(self
            .schedules
            .iter()
            .filter(|s| s.group == group)
            .map(|s| s.clone())
            .collect())
    }

    fn get_schedules(&self) -> anyhow::Result<Vec<Schedule>> {
        Ok(self.schedules.iter().map(|s| s.clone()).collect())
    }

    fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn check_pending_schedules(&self) {
        self.pending_checks.fetch_add(1, Ordering::SeqCst);
    }

    fn on_prepare_result(&self, schedule_id: &str, result: PrepareScheduleResult) {
        debug!(schedule_id = %schedule_id, ?result, "Prepare result");
        if result == PrepareScheduleResult::Cancel {
            self.schedules.remove(schedule_id);
        }
        self.prepare_results.insert(schedule_id.to_string(), result);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use campaign_core::clock::ManualClock;
    use campaign_core::message::{DisplayContent, InAppMessage};
    use campaign_core::schedule::Trigger;
    use serde_json::json;

    fn info(message_id: &str) -> ScheduleInfo {
        ScheduleInfo::builder()
            .message(
                InAppMessage::builder()
                    .id(message_id)
                    .display_content(DisplayContent::custom(json!({})))
                    .build()
                    .unwrap(),
            )
            .trigger(Trigger::foreground(1.0))
            .limit(2)
            .build()
            .unwrap()
    }

    fn setup() -> (Arc<ManualClock>, InMemoryScheduler) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let scheduler = InMemoryScheduler::new(clock.clone());
        (clock, scheduler)
    }

    #[test]
    fn test_schedule_assigns_ids_and_groups() {
        let (_clock, scheduler) = setup();
        let created = scheduler
            .schedule(vec![info("m1"), info("m2")], json!({"source": "test"}))
            .unwrap();

        assert_eq!(created.len(), 2);
        assert_ne!(created[0].id, created[1].id);
        assert_eq!(created[0].group, "m1");
        assert_eq!(scheduler.get_schedules_by_group("m2").unwrap().len(), 1);
        assert_eq!(created[1].metadata, json!({"source": "test"}));
    }

    #[test]
    fn test_execution_limit_removes_schedule() {
        let (_clock, scheduler) = setup();
        let id = scheduler.schedule(vec![info("m1")], json!({})).unwrap()[0].id.clone();

        scheduler.complete_execution(&id, ExecutionResult::Finished);
        assert_eq!(scheduler.get_schedule(&id).unwrap().unwrap().execution_count, 1);

        scheduler.complete_execution(&id, ExecutionResult::Finished);
        assert!(scheduler.get_schedule(&id).unwrap().is_none());
    }

    #[test]
    fn test_not_ready_execution_is_not_counted() {
        let (_clock, scheduler) = setup();
        let id = scheduler.schedule(vec![info("m1")], json!({})).unwrap()[0].id.clone();
        scheduler.on_prepare_result(&id, PrepareScheduleResult::Continue);

        scheduler.complete_execution(&id, ExecutionResult::NotReady);
        assert_eq!(scheduler.get_schedule(&id).unwrap().unwrap().execution_count, 0);
        assert_eq!(scheduler.prepare_result(&id), Some(PrepareScheduleResult::Continue));
    }

    #[test]
    fn test_edits_dropped_after_grace_period() {
        let (clock, scheduler) = setup();
        let id = scheduler.schedule(vec![info("m1")], json!({})).unwrap()[0].id.clone();
        let now = clock.now();

        let end_now = ScheduleEdits::builder().start(Some(now)).end(Some(now)).build();
        assert!(scheduler.edit_schedule(&id, &end_now).unwrap().is_some());

        clock.advance(Duration::seconds(1));
        assert_eq!(scheduler.take_expired().len(), 1);
        assert!(scheduler.take_expired().is_empty());

        clock.advance(Duration::days(11));
        let revive = ScheduleEdits::builder().end(None).build();
        assert!(scheduler.edit_schedule(&id, &revive).unwrap().is_none());
    }

    #[test]
    fn test_cancel_group() {
        let (_clock, scheduler) = setup();
        scheduler.schedule(vec![info("m1"), info("m2")], json!({})).unwrap();

        assert_eq!(scheduler.cancel_groups(&["m1".into(), "m2".into()]).unwrap(), 2);
        assert!(scheduler.is_empty());
    }

    #[tokio::test]
    async fn test_execution_callback() {
        let (callback, receiver) = ExecutionCallback::new();
        callback.finish(ExecutionResult::Cancel);
        assert_eq!(receiver.await.unwrap(), ExecutionResult::Cancel);
    }
}
