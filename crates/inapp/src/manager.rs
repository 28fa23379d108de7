//! Public entry point. The manager owns the engine seam and a handle onto the
//! event loop; everything that touches driver or reconciler state is posted
//! onto the loop, engine calls go straight through.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use campaign_cache::TagGroupCache;
use campaign_core::config::{AppConfig, InAppConfig};
use campaign_core::error::{CampaignError, CampaignResult};
use campaign_core::event_bus::{noop_sink, EventSink};
use campaign_core::message::DisplayType;
use campaign_core::schedule::{Schedule, ScheduleEdits, ScheduleInfo};
use campaign_segmentation::{AudienceEvaluator, DeviceStateProvider};
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::Stream;
use tracing::{debug, info};

use crate::adapter::{AdapterFactory, AdapterRegistry, ExtenderSlot, MessageExtender};
use crate::coordinator::DisplayCoordinator;
use crate::driver::{ActionRunner, DeliveryDriver, DeliveryListener, NoOpActionRunner};
use crate::event_loop::{EventLoop, LoopHandle};
use crate::remote_data::{self, ReconcileSummary, RemoteDataReconciler, RemoteSnapshot, SnapshotFeed};
use crate::scheduler::{ExecutionCallback, ExecutionResult, Scheduler};

/// State owned by the event loop.
pub struct InAppRuntime {
    pub driver: DeliveryDriver,
    pub reconciler: RemoteDataReconciler,
}

impl AsMut<DeliveryDriver> for InAppRuntime {
    fn as_mut(&mut self) -> &mut DeliveryDriver {
        &mut self.driver
    }
}

impl AsMut<DisplayCoordinator> for InAppRuntime {
    fn as_mut(&mut self) -> &mut DisplayCoordinator {
        self.driver.as_mut()
    }
}

impl AsMut<RemoteDataReconciler> for InAppRuntime {
    fn as_mut(&mut self) -> &mut RemoteDataReconciler {
        &mut self.reconciler
    }
}

pub type RuntimeHandle = LoopHandle<InAppRuntime>;

fn engine_error(e: anyhow::Error) -> CampaignError {
    CampaignError::Scheduler(format!("{e:#}"))
}

pub struct InAppMessageManagerBuilder {
    config: InAppConfig,
    scheduler: Arc<dyn Scheduler>,
    device: Arc<dyn DeviceStateProvider>,
    adapters: AdapterRegistry,
    tag_groups: Option<Arc<TagGroupCache>>,
    events: Arc<dyn EventSink>,
    actions: Arc<dyn ActionRunner>,
    listeners: Vec<Arc<dyn DeliveryListener>>,
}

impl InAppMessageManagerBuilder {
    pub fn config(mut self, config: InAppConfig) -> Self {
        self.config = config;
        self
    }

    pub fn adapter(mut self, display_type: DisplayType, factory: Arc<dyn AdapterFactory>) -> Self {
        self.adapters.register(display_type, factory);
        self
    }

    pub fn tag_groups(mut self, cache: Arc<TagGroupCache>) -> Self {
        self.tag_groups = Some(cache);
        self
    }

    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn action_runner(mut self, actions: Arc<dyn ActionRunner>) -> Self {
        self.actions = actions;
        self
    }

    pub fn listener(mut self, listener: Arc<dyn DeliveryListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Manager plus a loop on the tokio clock. Spawn `EventLoop::run` to
    /// drive it.
    pub fn build(self) -> (InAppMessageManager, EventLoop<InAppRuntime>) {
        self.assemble(EventLoop::new)
    }

    /// Manager plus a loop whose clock only moves when advanced.
    pub fn build_manual(self) -> (InAppMessageManager, EventLoop<InAppRuntime>) {
        self.assemble(EventLoop::manual)
    }

    fn assemble(
        self,
        make_loop: fn(InAppRuntime) -> EventLoop<InAppRuntime>,
    ) -> (InAppMessageManager, EventLoop<InAppRuntime>) {
        let audience = Arc::new(match &self.tag_groups {
            Some(cache) => AudienceEvaluator::new(cache.clone()),
            None => AudienceEvaluator::without_tag_groups(),
        });
        let extender = ExtenderSlot::default();

        let mut driver = DeliveryDriver::new(
            self.scheduler.clone(),
            self.adapters,
            audience.clone(),
            self.device.clone(),
            Duration::from_millis(self.config.display_interval_ms),
        )
        .with_event_sink(self.events)
        .with_action_runner(self.actions);
        for listener in self.listeners {
            driver.add_listener(listener);
        }

        let mut reconciler = RemoteDataReconciler::new(
            self.scheduler.clone(),
            audience.clone(),
            self.device.clone(),
            extender.clone(),
        );
        reconciler.set_new_user_cutoff(self.config.new_user_cutoff);

        let event_loop = make_loop(InAppRuntime { driver, reconciler });
        let manager = InAppMessageManager {
            scheduler: self.scheduler,
            handle: event_loop.handle(),
            feed: SnapshotFeed::new(event_loop.handle(), audience, self.device),
            extender,
            tag_groups: self.tag_groups,
            enabled: AtomicBool::new(true),
        };
        manager.set_enabled(self.config.enabled);
        (manager, event_loop)
    }
}

pub struct InAppMessageManager {
    scheduler: Arc<dyn Scheduler>,
    handle: RuntimeHandle,
    feed: SnapshotFeed<InAppRuntime>,
    extender: ExtenderSlot,
    tag_groups: Option<Arc<TagGroupCache>>,
    enabled: AtomicBool,
}

impl InAppMessageManager {
    pub fn builder(
        scheduler: Arc<dyn Scheduler>,
        device: Arc<dyn DeviceStateProvider>,
    ) -> InAppMessageManagerBuilder {
        InAppMessageManagerBuilder {
            config: InAppConfig::default(),
            scheduler,
            device,
            adapters: AdapterRegistry::new(),
            tag_groups: None,
            events: noop_sink(),
            actions: Arc::new(NoOpActionRunner),
            listeners: Vec::new(),
        }
    }

    pub fn handle(&self) -> RuntimeHandle {
        self.handle.clone()
    }

    /// Runs `f` on the loop and hands back its result.
    pub fn with_runtime<R, F>(&self, f: F) -> oneshot::Receiver<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut InAppRuntime, &RuntimeHandle) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.handle.post(move |runtime: &mut InAppRuntime, handle: &RuntimeHandle| {
            let _ = tx.send(f(runtime, handle));
        });
        rx
    }

    // ─── Scheduling ─────────────────────────────────────────────────────

    pub fn schedule_message(&self, info: ScheduleInfo) -> CampaignResult<Schedule> {
        self.schedule(vec![info])?
            .pop()
            .ok_or_else(|| CampaignError::Scheduler("engine created no schedule".into()))
    }

    /// Runs the message extender over each message, then schedules the batch.
    pub fn schedule(&self, infos: Vec<ScheduleInfo>) -> CampaignResult<Vec<Schedule>> {
        let infos = infos
            .into_iter()
            .map(|info| -> CampaignResult<ScheduleInfo> {
                let message = self.extender.extend(info.message().clone())?;
                Ok(info.with_message(message))
            })
            .collect::<CampaignResult<Vec<_>>>()?;
        let schedules = self
            .scheduler
            .schedule(infos, json!({}))
            .map_err(engine_error)?;
        info!(count = schedules.len(), "Scheduled in-app messages");
        Ok(schedules)
    }

    pub fn edit_schedule(&self, schedule_id: &str, edits: ScheduleEdits) -> CampaignResult<Option<Schedule>> {
        let mut edits = edits;
        if let Some(message) = edits.message.take() {
            edits.message = Some(self.extender.extend(message)?);
        }
        self.scheduler
            .edit_schedule(schedule_id, &edits)
            .map_err(engine_error)
    }

    pub fn cancel_schedule(&self, schedule_id: &str) -> CampaignResult<bool> {
        let cancelled = self.scheduler.cancel(schedule_id).map_err(engine_error)?;
        if cancelled {
            self.notify_cancelled(vec![schedule_id.to_string()]);
        }
        Ok(cancelled)
    }

    /// Cancels every schedule in the message's group.
    pub fn cancel_message(&self, message_id: &str) -> CampaignResult<usize> {
        self.cancel_messages(&[message_id.to_string()])
    }

    pub fn cancel_messages(&self, message_ids: &[String]) -> CampaignResult<usize> {
        let mut ids = Vec::new();
        for message_id in message_ids {
            let schedules = self
                .scheduler
                .get_schedules_by_group(message_id)
                .map_err(engine_error)?;
            ids.extend(schedules.into_iter().map(|s| s.id));
        }
        let cancelled = self
            .scheduler
            .cancel_groups(message_ids)
            .map_err(engine_error)?;
        self.notify_cancelled(ids);
        Ok(cancelled)
    }

    fn notify_cancelled(&self, schedule_ids: Vec<String>) {
        if schedule_ids.is_empty() {
            return;
        }
        self.handle.post(move |runtime: &mut InAppRuntime, _| {
            for id in &schedule_ids {
                runtime.driver.on_schedule_cancelled(id);
            }
        });
    }

    pub fn get_schedule(&self, schedule_id: &str) -> CampaignResult<Option<Schedule>> {
        self.scheduler.get_schedule(schedule_id).map_err(engine_error)
    }

    pub fn get_schedules_for_message(&self, message_id: &str) -> CampaignResult<Vec<Schedule>> {
        self.scheduler
            .get_schedules_by_group(message_id)
            .map_err(engine_error)
    }

    // ─── Switches ───────────────────────────────────────────────────────

    /// Disabling pauses the engine; nothing is prepared or displayed.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        self.scheduler.set_paused(!enabled);
        info!(enabled, "In-app messaging toggled");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Pausing holds displays back; schedules keep triggering.
    pub fn set_paused(&self, paused: bool) {
        self.handle.post(move |runtime: &mut InAppRuntime, handle: &RuntimeHandle| {
            runtime.driver.set_paused(paused, handle);
        });
    }

    pub fn set_display_interval(&self, interval: Duration) {
        self.handle.post(move |runtime: &mut InAppRuntime, _| {
            runtime.driver.set_display_interval(interval);
        });
    }

    pub fn set_message_extender(&self, extender: Option<Arc<dyn MessageExtender>>) {
        self.extender.set(extender);
    }

    pub fn apply_remote_config(&self, config: &AppConfig) {
        self.set_enabled(config.in_app.enabled);
        self.set_display_interval(Duration::from_millis(config.in_app.display_interval_ms));
        let cutoff = config.in_app.new_user_cutoff;
        self.handle.post(move |runtime: &mut InAppRuntime, _| {
            runtime.reconciler.set_new_user_cutoff(cutoff);
        });
        if let Some(cache) = &self.tag_groups {
            cache.apply_remote_config(&config.tag_groups);
        }
        debug!("Applied in-app remote config");
    }

    // ─── Remote data ────────────────────────────────────────────────────

    /// Queues a snapshot for the reconciler. Snapshots apply in the order
    /// they are submitted, even when some wait on a tag-group lookup.
    pub fn submit_snapshot(&self, snapshot: RemoteSnapshot) -> oneshot::Receiver<ReconcileSummary> {
        self.feed.submit(snapshot)
    }

    /// Parses a raw remote payload and queues it.
    pub fn submit_payload(&self, payload: &Value) -> CampaignResult<oneshot::Receiver<ReconcileSummary>> {
        Ok(self.submit_snapshot(RemoteSnapshot::from_json(payload)?))
    }

    pub fn subscribe<St>(&self, snapshots: St) -> JoinHandle<()>
    where
        St: Stream<Item = RemoteSnapshot> + Send + 'static,
    {
        remote_data::subscribe(snapshots, self.feed.clone())
    }

    // ─── Surface ────────────────────────────────────────────────────────

    pub fn on_surface_resumed(&self) {
        self.handle.post(|runtime: &mut InAppRuntime, handle: &RuntimeHandle| {
            runtime.driver.on_surface_resumed(handle);
        });
    }

    pub fn on_surface_paused(&self) {
        self.handle.post(|runtime: &mut InAppRuntime, _| {
            runtime.driver.on_surface_paused();
        });
    }

    // ─── Engine callbacks ───────────────────────────────────────────────

    pub fn prepare_schedule(&self, schedule: Schedule) {
        self.handle.post(move |runtime: &mut InAppRuntime, handle: &RuntimeHandle| {
            runtime.driver.on_prepare_schedule(schedule, handle);
        });
    }

    pub fn is_schedule_ready(&self, schedule_id: &str) -> oneshot::Receiver<bool> {
        let id = schedule_id.to_string();
        self.with_runtime(move |runtime, _| runtime.driver.is_schedule_ready_to_execute(&id))
    }

    /// Executes a ready schedule. Readiness is checked again on the loop
    /// before anything is displayed; a schedule that lost the race resolves
    /// with `NotReady`. Otherwise the receiver resolves when the display
    /// finishes or the audience check fails.
    pub fn execute_schedule(&self, schedule_id: &str) -> oneshot::Receiver<ExecutionResult> {
        let (callback, receiver) = ExecutionCallback::new();
        let id = schedule_id.to_string();
        self.handle.post(move |runtime: &mut InAppRuntime, handle: &RuntimeHandle| {
            runtime.driver.on_execute_triggered_schedule(&id, callback, handle);
        });
        receiver
    }

    pub fn schedule_expired(&self, schedule: Schedule) {
        self.handle.post(move |runtime: &mut InAppRuntime, _| {
            runtime.driver.on_schedule_expired(&schedule);
        });
    }
}
