//! Per-schedule prepare/display cycle between the automation engine and
//! the display adapters.
//!
//! The engine drives a schedule through `on_prepare_schedule`,
//! `is_schedule_ready_to_execute` and `on_execute_triggered_schedule`. The
//! driver answers through [`Scheduler`] calls and the execution callback, all
//! keyed by schedule id. Every method runs on the event loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use campaign_core::event_bus::{make_event, noop_sink, EventSink};
use campaign_core::message::{DisplayBehavior, InAppMessage};
use campaign_core::resolution::ResolutionInfo;
use campaign_core::schedule::Schedule;
use campaign_core::tag_selector::TagGroups;
use campaign_segmentation::{AudienceEvaluator, DeviceStateProvider};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::adapter::{AdapterRegistry, DisplayAdapter, DisplayEvent, DisplayHandler, PrepareResult};
use crate::coordinator::DisplayCoordinator;
use crate::event_loop::{LoopHandle, TaskHandle};
use crate::scheduler::{ExecutionCallback, ExecutionResult, PrepareScheduleResult, Scheduler};

/// Runs the action map attached to a message or button.
pub trait ActionRunner: Send + Sync {
    fn run(&self, schedule_id: &str, actions: &HashMap<String, Value>);
}

pub struct NoOpActionRunner;

impl ActionRunner for NoOpActionRunner {
    fn run(&self, _schedule_id: &str, _actions: &HashMap<String, Value>) {}
}

/// Observes display lifecycle.
pub trait DeliveryListener: Send + Sync {
    fn on_message_displayed(&self, _schedule_id: &str, _message: &InAppMessage) {}

    fn on_message_finished(
        &self,
        _schedule_id: &str,
        _message: &InAppMessage,
        _resolution: &ResolutionInfo,
    ) {
    }
}

/// State a driver method can reach back into from a posted task.
pub trait DriverState: AsMut<DeliveryDriver> + AsMut<DisplayCoordinator> + 'static {}

impl<T> DriverState for T where T: AsMut<DeliveryDriver> + AsMut<DisplayCoordinator> + 'static {}

fn driver<S: AsMut<DeliveryDriver>>(state: &mut S) -> &mut DeliveryDriver {
    state.as_mut()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Preparing,
    Prepared,
    /// Executing, waiting on a tag-group lookup before the audience check.
    CheckingAudience,
    Displaying,
    /// Interrupted display waiting for the surface to come back.
    PendingRedisplay,
}

struct Cycle {
    schedule: Schedule,
    adapter: Box<dyn DisplayAdapter>,
    state: CycleState,
    retry: Option<TaskHandle>,
    callback: Option<ExecutionCallback>,
    display_started: Option<Duration>,
}

impl Cycle {
    fn is_executing(&self) -> bool {
        matches!(
            self.state,
            CycleState::CheckingAudience | CycleState::Displaying | CycleState::PendingRedisplay
        )
    }
}

pub struct DeliveryDriver {
    scheduler: Arc<dyn Scheduler>,
    adapters: AdapterRegistry,
    audience: Arc<AudienceEvaluator>,
    device: Arc<dyn DeviceStateProvider>,
    events: Arc<dyn EventSink>,
    actions: Arc<dyn ActionRunner>,
    listeners: Vec<Arc<dyn DeliveryListener>>,
    coordinator: DisplayCoordinator,
    cycles: HashMap<String, Cycle>,
    current_display: Option<String>,
    surface_resumed: bool,
    paused: bool,
}

impl DeliveryDriver {
    pub fn new(
        scheduler: Arc<dyn Scheduler>,
        adapters: AdapterRegistry,
        audience: Arc<AudienceEvaluator>,
        device: Arc<dyn DeviceStateProvider>,
        display_interval: Duration,
    ) -> Self {
        let mut coordinator = DisplayCoordinator::new(display_interval);
        let engine = scheduler.clone();
        coordinator.set_ready_observer(Arc::new(move || engine.check_pending_schedules()));

        Self {
            scheduler,
            adapters,
            audience,
            device,
            events: noop_sink(),
            actions: Arc::new(NoOpActionRunner),
            listeners: Vec::new(),
            coordinator,
            cycles: HashMap::new(),
            current_display: None,
            surface_resumed: false,
            paused: false,
        }
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_action_runner(mut self, actions: Arc<dyn ActionRunner>) -> Self {
        self.actions = actions;
        self
    }

    pub fn add_listener(&mut self, listener: Arc<dyn DeliveryListener>) {
        self.listeners.push(listener);
    }

    pub fn coordinator(&self) -> &DisplayCoordinator {
        &self.coordinator
    }

    pub fn set_display_interval(&mut self, interval: Duration) {
        self.coordinator.set_interval(interval);
    }

    pub fn cycle_state(&self, schedule_id: &str) -> Option<CycleState> {
        self.cycles.get(schedule_id).map(|cycle| cycle.state)
    }

    pub fn current_display(&self) -> Option<&str> {
        self.current_display.as_deref()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Engine asks for a schedule to be prepared. The outcome is reported
    /// through `Scheduler::on_prepare_result`.
    pub fn on_prepare_schedule<S: DriverState>(&mut self, schedule: Schedule, handle: &LoopHandle<S>) {
        let schedule_id = schedule.id.clone();
        if let Some(existing) = self.cycles.get(&schedule_id) {
            if existing.is_executing() {
                warn!(schedule_id = %schedule_id, "Prepare requested while executing, ignoring");
                return;
            }
            self.drop_cycle(&schedule_id);
        }

        let adapter = match self.adapters.create(schedule.message()) {
            Some(Ok(adapter)) => adapter,
            Some(Err(e)) => {
                error!(schedule_id = %schedule_id, error = %e, "Failed to create display adapter");
                self.scheduler
                    .on_prepare_result(&schedule_id, PrepareScheduleResult::Skip);
                return;
            }
            None => {
                warn!(
                    schedule_id = %schedule_id,
                    display_type = schedule.message().display_type().as_str(),
                    "No display adapter registered"
                );
                self.scheduler
                    .on_prepare_result(&schedule_id, PrepareScheduleResult::Skip);
                return;
            }
        };

        self.cycles.insert(
            schedule_id.clone(),
            Cycle {
                schedule,
                adapter,
                state: CycleState::Preparing,
                retry: None,
                callback: None,
                display_started: None,
            },
        );
        self.run_prepare(&schedule_id, handle);
    }

    fn run_prepare<S: DriverState>(&mut self, schedule_id: &str, handle: &LoopHandle<S>) {
        let Some(cycle) = self.cycles.get_mut(schedule_id) else {
            return;
        };
        if cycle.state != CycleState::Preparing {
            return;
        }
        cycle.retry = None;

        match cycle.adapter.prepare() {
            PrepareResult::Ok => {
                debug!(schedule_id = %schedule_id, "Schedule prepared");
                cycle.state = CycleState::Prepared;
                self.scheduler
                    .on_prepare_result(schedule_id, PrepareScheduleResult::Continue);
            }
            PrepareResult::Retry => {
                debug!(schedule_id = %schedule_id, "Prepare asked for retry");
                metrics::counter!("inapp.prepare.retry").increment(1);
                let id = schedule_id.to_string();
                cycle.retry = Some(handle.post(move |state: &mut S, handle: &LoopHandle<S>| {
                    driver(state).run_prepare(&id, handle);
                }));
            }
            PrepareResult::Cancel => {
                info!(schedule_id = %schedule_id, "Prepare cancelled schedule");
                self.cycles.remove(schedule_id);
                self.scheduler
                    .on_prepare_result(schedule_id, PrepareScheduleResult::Cancel);
            }
        }
    }

    pub fn is_schedule_ready_to_execute(&self, schedule_id: &str) -> bool {
        let Some(cycle) = self.cycles.get(schedule_id) else {
            return false;
        };
        if cycle.state != CycleState::Prepared
            || !self.surface_resumed
            || self.paused
            || self.current_display.is_some()
        {
            return false;
        }
        let coordinator_ready = match cycle.schedule.message().display_behavior() {
            DisplayBehavior::Immediate => self.coordinator.is_ready_immediate(),
            DisplayBehavior::Default => self.coordinator.is_ready(),
        };
        coordinator_ready && cycle.adapter.is_ready()
    }

    /// Engine executes a ready schedule. Readiness is checked again in the
    /// same turn that takes the display, so of two schedules that both
    /// looked ready only the first one executes; the other finishes with
    /// `NotReady`. The callback is resolved once the display finishes, or
    /// right away when the audience no longer matches.
    pub fn on_execute_triggered_schedule<S: DriverState>(
        &mut self,
        schedule_id: &str,
        callback: ExecutionCallback,
        handle: &LoopHandle<S>,
    ) {
        let Some(cycle) = self.cycles.get(schedule_id) else {
            error!(schedule_id = %schedule_id, "Execute for unknown schedule");
            callback.finish(ExecutionResult::Finished);
            return;
        };
        if cycle.state != CycleState::Prepared {
            error!(schedule_id = %schedule_id, state = ?cycle.state, "Execute for schedule that is not prepared");
            callback.finish(ExecutionResult::Finished);
            return;
        }
        if !self.is_schedule_ready_to_execute(schedule_id) {
            warn!(schedule_id = %schedule_id, "Execute for schedule that is no longer ready");
            metrics::counter!("inapp.execute.not_ready").increment(1);
            callback.finish(ExecutionResult::NotReady);
            return;
        }

        let requested = cycle
            .schedule
            .message()
            .audience()
            .and_then(|audience| self.audience.tag_groups_needed(audience));
        let Some(cycle) = self.cycles.get_mut(schedule_id) else {
            return;
        };
        cycle.callback = Some(callback);

        match requested {
            Some(requested) => {
                debug!(schedule_id = %schedule_id, "Resolving tag groups for audience check");
                cycle.state = CycleState::CheckingAudience;
                // Holds the display slot until the lookup comes back.
                self.current_display = Some(schedule_id.to_string());
                let audience = self.audience.clone();
                let device = self.device.snapshot();
                let id = schedule_id.to_string();
                handle.spawn_then(
                    async move { audience.resolve_tag_groups(&requested, &device).await },
                    move |state: &mut S, handle: &LoopHandle<S>, groups: Option<TagGroups>| {
                        driver(state).on_tag_groups_resolved(&id, groups, handle);
                    },
                );
            }
            None => self.check_audience_then_display(schedule_id, None, handle),
        }
    }

    fn on_tag_groups_resolved<S: DriverState>(
        &mut self,
        schedule_id: &str,
        groups: Option<TagGroups>,
        handle: &LoopHandle<S>,
    ) {
        if self.cycle_state(schedule_id) != Some(CycleState::CheckingAudience) {
            debug!(schedule_id = %schedule_id, "Tag groups resolved for schedule no longer executing");
            return;
        }
        self.current_display = None;
        self.check_audience_then_display(schedule_id, groups.as_ref(), handle);
    }

    fn check_audience_then_display<S: DriverState>(
        &mut self,
        schedule_id: &str,
        tag_groups: Option<&TagGroups>,
        handle: &LoopHandle<S>,
    ) {
        let Some(cycle) = self.cycles.get(schedule_id) else {
            return;
        };
        if let Some(audience) = cycle.schedule.message().audience() {
            if !self
                .audience
                .check_audience(audience, &self.device.snapshot(), tag_groups)
            {
                info!(
                    schedule_id = %schedule_id,
                    miss_behavior = ?audience.miss_behavior,
                    "Audience check failed at display time"
                );
                metrics::counter!("inapp.audience.miss").increment(1);
                if let Some(callback) = self.cycles.remove(schedule_id).and_then(|c| c.callback) {
                    callback.finish(ExecutionResult::Cancel);
                }
                return;
            }
        }
        self.start_display(schedule_id, handle);
    }

    fn start_display<S: DriverState>(&mut self, schedule_id: &str, handle: &LoopHandle<S>) {
        let Some(cycle) = self.cycles.get_mut(schedule_id) else {
            return;
        };
        // A redisplay already holds the lock.
        if self.coordinator.locked_by() != Some(schedule_id) {
            self.coordinator.on_display_started(schedule_id);
        }
        self.current_display = Some(schedule_id.to_string());
        cycle.state = CycleState::Displaying;
        if cycle.display_started.is_none() {
            cycle.display_started = Some(handle.now());
        }

        let display_handler = DisplayHandler::new(schedule_id, event_sender(handle));
        match cycle.adapter.display(display_handler) {
            Ok(()) => {
                info!(
                    schedule_id = %schedule_id,
                    message_id = %cycle.schedule.message().id(),
                    "Displaying in-app message"
                );
                metrics::counter!("inapp.display.started").increment(1);
                for listener in &self.listeners {
                    listener.on_message_displayed(schedule_id, cycle.schedule.message());
                }
            }
            Err(e) => {
                error!(schedule_id = %schedule_id, error = %e, "Display failed");
                self.coordinator.on_display_finished(schedule_id, handle);
                self.current_display = None;
                if let Some(cycle) = self.cycles.remove(schedule_id) {
                    if let Some(callback) = cycle.callback {
                        callback.finish(ExecutionResult::Finished);
                    }
                }
            }
        }
    }

    fn handle_display_event<S: DriverState>(
        &mut self,
        schedule_id: &str,
        event: DisplayEvent,
        handle: &LoopHandle<S>,
    ) {
        match event {
            DisplayEvent::Finished(resolution) => {
                self.on_display_finished(schedule_id, resolution, handle)
            }
            DisplayEvent::ContinueOnNextActivity => self.continue_on_next_activity(schedule_id),
            DisplayEvent::CancelFutureDisplays => {
                if let Err(e) = self.scheduler.cancel(schedule_id) {
                    error!(schedule_id = %schedule_id, error = %e, "Failed to cancel schedule");
                }
            }
        }
    }

    /// The displayed message resolved: report it, run its actions, release
    /// the lock into a cool-down and complete the execution.
    pub fn on_display_finished<S: DriverState>(
        &mut self,
        schedule_id: &str,
        resolution: ResolutionInfo,
        handle: &LoopHandle<S>,
    ) {
        let Some(cycle) = self.cycles.get(schedule_id) else {
            warn!(schedule_id = %schedule_id, "Display finished for unknown schedule");
            return;
        };
        if cycle.state != CycleState::Displaying {
            warn!(schedule_id = %schedule_id, state = ?cycle.state, "Display finished while not displaying");
            return;
        }

        let message = cycle.schedule.message();
        let display_time = cycle
            .display_started
            .map(|started| handle.now().saturating_sub(started))
            .unwrap_or_default();
        if message.is_reporting_enabled() {
            self.events.emit(make_event(
                schedule_id,
                message.id(),
                message.campaigns().cloned(),
                resolution.to_event_payload(display_time),
            ));
        }

        if !message.actions().is_empty() {
            self.actions.run(schedule_id, message.actions());
        }
        if let ResolutionInfo::ButtonPressed { button } = &resolution {
            if !button.actions.is_empty() {
                self.actions.run(schedule_id, &button.actions);
            }
        }
        for listener in &self.listeners {
            listener.on_message_finished(schedule_id, message, &resolution);
        }
        info!(
            schedule_id = %schedule_id,
            resolution = resolution.event_type(),
            display_ms = display_time.as_millis() as u64,
            "In-app message finished"
        );

        self.coordinator.on_display_finished(schedule_id, handle);
        self.current_display = None;

        if resolution.cancels_schedule() {
            if let Err(e) = self.scheduler.cancel(schedule_id) {
                error!(schedule_id = %schedule_id, error = %e, "Failed to cancel schedule");
            }
        }
        self.schedule_executed(schedule_id);
    }

    /// Resolves the stored execution callback.
    pub fn schedule_executed(&mut self, schedule_id: &str) {
        let Some(cycle) = self.cycles.remove(schedule_id) else {
            warn!(schedule_id = %schedule_id, "No execution in flight");
            return;
        };
        match cycle.callback {
            Some(callback) => callback.finish(ExecutionResult::Finished),
            None => warn!(schedule_id = %schedule_id, "No execution callback stored"),
        }
    }

    /// The display lost its surface. The message keeps the lock and shows
    /// again on the next resume, without a cool-down.
    pub fn continue_on_next_activity(&mut self, schedule_id: &str) {
        match self.cycles.get_mut(schedule_id) {
            Some(cycle) if cycle.state == CycleState::Displaying => {
                debug!(schedule_id = %schedule_id, "Pending redisplay");
                cycle.state = CycleState::PendingRedisplay;
            }
            _ => warn!(schedule_id = %schedule_id, "Continue requested for schedule that is not displaying"),
        }
    }

    pub fn on_surface_resumed<S: DriverState>(&mut self, handle: &LoopHandle<S>) {
        self.surface_resumed = true;
        if self.paused {
            debug!("Surface resumed while paused");
            return;
        }
        self.redisplay_or_check(handle);
    }

    fn redisplay_or_check<S: DriverState>(&mut self, handle: &LoopHandle<S>) {
        let pending = self
            .cycles
            .iter()
            .find(|(_, cycle)| cycle.state == CycleState::PendingRedisplay)
            .map(|(id, _)| id.clone());
        match pending {
            Some(schedule_id) => {
                info!(schedule_id = %schedule_id, "Redisplaying interrupted message");
                self.start_display(&schedule_id, handle);
            }
            None => self.scheduler.check_pending_schedules(),
        }
    }

    pub fn on_surface_paused(&mut self) {
        self.surface_resumed = false;
    }

    /// Unpausing on a resumed surface shows any interrupted message again.
    pub fn set_paused<S: DriverState>(&mut self, paused: bool, handle: &LoopHandle<S>) {
        self.paused = paused;
        if paused {
            return;
        }
        if self.surface_resumed {
            self.redisplay_or_check(handle);
        } else {
            self.scheduler.check_pending_schedules();
        }
    }

    /// Engine cancelled the schedule. A display in progress runs to its end.
    pub fn on_schedule_cancelled(&mut self, schedule_id: &str) {
        if matches!(
            self.cycle_state(schedule_id),
            Some(CycleState::Displaying | CycleState::PendingRedisplay)
        ) {
            debug!(schedule_id = %schedule_id, "Cancelled while displaying, letting display finish");
            return;
        }
        self.drop_cycle(schedule_id);
    }

    /// Engine expired the schedule: report it and drop any prepared state.
    pub fn on_schedule_expired(&mut self, schedule: &Schedule) {
        let message = schedule.message();
        if message.is_reporting_enabled() {
            let mut payload = json!({"type": "expired"});
            if let Some(end) = schedule.info.end() {
                payload["expiry"] = json!(end.to_rfc3339());
            }
            self.events.emit(make_event(
                &schedule.id,
                message.id(),
                message.campaigns().cloned(),
                payload,
            ));
        }
        info!(schedule_id = %schedule.id, "In-app message expired");
        self.on_schedule_cancelled(&schedule.id);
    }

    fn drop_cycle(&mut self, schedule_id: &str) {
        if self.current_display.as_deref() == Some(schedule_id) {
            self.current_display = None;
        }
        if let Some(cycle) = self.cycles.remove(schedule_id) {
            if let Some(retry) = cycle.retry {
                retry.cancel();
            }
            if let Some(callback) = cycle.callback {
                callback.finish(ExecutionResult::Cancel);
            }
        }
    }
}

fn event_sender<S: DriverState>(handle: &LoopHandle<S>) -> Arc<dyn Fn(String, DisplayEvent) + Send + Sync> {
    let handle = handle.clone();
    Arc::new(move |schedule_id: String, event: DisplayEvent| {
        handle.post(move |state: &mut S, handle: &LoopHandle<S>| {
            driver(state).handle_display_event(&schedule_id, event, handle);
        });
    })
}

impl AsMut<DeliveryDriver> for DeliveryDriver {
    fn as_mut(&mut self) -> &mut DeliveryDriver {
        self
    }
}

impl AsMut<DisplayCoordinator> for DeliveryDriver {
    fn as_mut(&mut self) -> &mut DisplayCoordinator {
        &mut self.coordinator
    }
}
