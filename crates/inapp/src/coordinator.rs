//! Enforces one message on screen at a time plus a cool-down between
//! displays.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::event_loop::{LoopHandle, TaskHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorState {
    Ready,
    Locked,
    CoolingDown,
}

/// Called once a cool-down elapses and the coordinator is ready again.
pub type ReadyObserver = Arc<dyn Fn() + Send + Sync>;

pub struct DisplayCoordinator {
    state: CoordinatorState,
    interval: Duration,
    locked_by: Option<String>,
    cooldown: Option<TaskHandle>,
    on_ready: Option<ReadyObserver>,
}

impl DisplayCoordinator {
    pub fn new(interval: Duration) -> Self {
        Self {
            state: CoordinatorState::Ready,
            interval,
            locked_by: None,
            cooldown: None,
            on_ready: None,
        }
    }

    pub fn set_ready_observer(&mut self, observer: ReadyObserver) {
        self.on_ready = Some(observer);
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Applies to cool-downs started after the call.
    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    /// Schedule currently holding the display lock.
    pub fn locked_by(&self) -> Option<&str> {
        self.locked_by.as_deref()
    }

    pub fn is_ready(&self) -> bool {
        self.state == CoordinatorState::Ready
    }

    /// Readiness for immediate messages: the cool-down is skipped, the lock
    /// is not.
    pub fn is_ready_immediate(&self) -> bool {
        self.state != CoordinatorState::Locked
    }

    pub fn on_display_started(&mut self, schedule_id: &str) {
        if self.state == CoordinatorState::Locked {
            warn!(
                schedule_id = %schedule_id,
                locked_by = ?self.locked_by,
                "Display started while another display holds the lock"
            );
        }
        if let Some(cooldown) = self.cooldown.take() {
            cooldown.cancel();
        }
        debug!(schedule_id = %schedule_id, "Display lock acquired");
        self.state = CoordinatorState::Locked;
        self.locked_by = Some(schedule_id.to_string());
    }

    pub fn on_display_finished<S>(&mut self, schedule_id: &str, handle: &LoopHandle<S>)
    where
        S: AsMut<DisplayCoordinator> + 'static,
    {
        if self.state != CoordinatorState::Locked
            || self.locked_by.as_deref() != Some(schedule_id)
        {
            warn!(
                schedule_id = %schedule_id,
                state = ?self.state,
                locked_by = ?self.locked_by,
                "Display finished without a matching start"
            );
        }
        debug!(schedule_id = %schedule_id, interval_ms = self.interval.as_millis() as u64, "Cooling down");
        self.state = CoordinatorState::CoolingDown;
        self.locked_by = None;
        if let Some(previous) = self.cooldown.take() {
            previous.cancel();
        }
        self.cooldown = Some(handle.post_delayed(self.interval, |state: &mut S, _| {
            state.as_mut().finish_cooldown();
        }));
    }

    fn finish_cooldown(&mut self) {
        if self.state != CoordinatorState::CoolingDown {
            return;
        }
        self.state = CoordinatorState::Ready;
        self.cooldown = None;
        debug!("Display coordinator ready");
        if let Some(observer) = &self.on_ready {
            observer();
        }
    }
}

impl AsMut<DisplayCoordinator> for DisplayCoordinator {
    fn as_mut(&mut self) -> &mut DisplayCoordinator {
        self
    }
}
