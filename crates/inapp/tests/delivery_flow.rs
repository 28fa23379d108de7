//! End-to-end delivery: remote snapshots through the reconciler into the
//! engine, then prepare/display/cool-down through the driver. Time is manual.

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::{HashSet, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use campaign_cache::{TagGroupCache, TagGroupSource};
    use campaign_core::audience::Audience;
    use campaign_core::clock::ManualClock;
    use campaign_core::event_bus::{capture_sink, CaptureSink};
    use campaign_core::message::{DisplayContent, DisplayType, InAppMessage};
    use campaign_core::resolution::ResolutionInfo;
    use campaign_core::schedule::{ScheduleInfo, Trigger};
    use campaign_core::tag_selector::{TagGroups, TagSelector};
    use campaign_inapp::{
        AdapterFactory, CycleState, DisplayAdapter, DisplayHandler, EventLoop, ExecutionResult,
        InAppMessageManager, InAppRuntime, InMemoryScheduler, PrepareResult,
        PrepareScheduleResult, SchedulerCall,
    };
    use campaign_segmentation::{DeviceSnapshot, DeviceStateProvider};
    use chrono::{DateTime, Utc};
    use parking_lot::{Mutex, RwLock};
    use serde_json::{json, Value};
    use tokio::sync::oneshot;

    #[derive(Clone, Default)]
    struct Recorder {
        prepares: Arc<AtomicUsize>,
        displays: Arc<AtomicUsize>,
        results: Arc<Mutex<VecDeque<PrepareResult>>>,
        handler: Arc<Mutex<Option<DisplayHandler>>>,
    }

    struct RecordingAdapter(Recorder);

    impl DisplayAdapter for RecordingAdapter {
        fn prepare(&mut self) -> PrepareResult {
            self.0.prepares.fetch_add(1, Ordering::SeqCst);
            self.0.results.lock().pop_front().unwrap_or(PrepareResult::Ok)
        }

        fn display(&mut self, handler: DisplayHandler) -> anyhow::Result<()> {
            self.0.displays.fetch_add(1, Ordering::SeqCst);
            *self.0.handler.lock() = Some(handler);
            Ok(())
        }
    }

    /// Answers loyalty:gold. The first lookup waits until released.
    #[derive(Default)]
    struct LoyaltySource {
        gate: Mutex<Option<oneshot::Receiver<()>>>,
    }

    impl LoyaltySource {
        fn gated() -> (Self, oneshot::Sender<()>) {
            let (release, gate) = oneshot::channel();
            let source = Self {
                gate: Mutex::new(Some(gate)),
            };
            (source, release)
        }
    }

    #[async_trait]
    impl TagGroupSource for LoyaltySource {
        async fn lookup(&self, _channel_id: &str, _requested: &TagGroups) -> anyhow::Result<TagGroups> {
            let gate = self.gate.lock().take();
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            let mut groups = TagGroups::new();
            groups.insert("loyalty".into(), HashSet::from(["gold".to_string()]));
            Ok(groups)
        }
    }

    fn loyalty_cache(source: LoyaltySource) -> Arc<TagGroupCache> {
        Arc::new(TagGroupCache::new(
            Arc::new(source),
            Arc::new(ManualClock::new(Utc::now())),
        ))
    }

    struct Harness {
        manager: InAppMessageManager,
        event_loop: EventLoop<InAppRuntime>,
        scheduler: Arc<InMemoryScheduler>,
        recorder: Recorder,
        events: Arc<CaptureSink>,
        device: Arc<RwLock<DeviceSnapshot>>,
    }

    impl Harness {
        fn new(tag_groups: Option<Arc<TagGroupCache>>) -> Self {
            let scheduler = Arc::new(InMemoryScheduler::new(Arc::new(ManualClock::new(Utc::now()))));
            let device = Arc::new(RwLock::new(DeviceSnapshot {
                channel_id: Some("channel-1".into()),
                ..DeviceSnapshot::default()
            }));
            let provider: Arc<dyn DeviceStateProvider> = device.clone();
            let recorder = Recorder::default();
            let factory_recorder = recorder.clone();
            let factory: Arc<dyn AdapterFactory> =
                Arc::new(move |_: &InAppMessage| -> anyhow::Result<Box<dyn DisplayAdapter>> {
                    Ok(Box::new(RecordingAdapter(factory_recorder.clone())))
                });
            let events = capture_sink();

            let mut builder = InAppMessageManager::builder(scheduler.clone(), provider)
                .adapter(DisplayType::Custom, factory)
                .event_sink(events.clone());
            if let Some(cache) = tag_groups {
                builder = builder.tag_groups(cache);
            }
            let (manager, mut event_loop) = builder.build_manual();
            manager.on_surface_resumed();
            event_loop.drain();

            Self {
                manager,
                event_loop,
                scheduler,
                recorder,
                events,
                device,
            }
        }

        fn submit(&mut self, payload: Value) {
            let _summary = self.manager.submit_payload(&payload).unwrap();
            self.event_loop.drain();
        }

        fn schedule_id(&self, message_id: &str) -> String {
            self.manager.get_schedules_for_message(message_id).unwrap()[0]
                .id
                .clone()
        }

        fn is_ready(&mut self, schedule_id: &str) -> bool {
            let mut ready = self.manager.is_schedule_ready(schedule_id);
            self.event_loop.drain();
            ready.try_recv().unwrap()
        }

        fn prepare(&mut self, schedule_id: &str) {
            let schedule = self.manager.get_schedule(schedule_id).unwrap().unwrap();
            self.manager.prepare_schedule(schedule);
            self.event_loop.drain();
        }

        /// Drains while spawned lookups finish, until `receiver` resolves.
        async fn settle<T>(&mut self, mut receiver: oneshot::Receiver<T>) -> T {
            for _ in 0..100 {
                self.event_loop.drain();
                if let Ok(value) = receiver.try_recv() {
                    return value;
                }
                tokio::task::yield_now().await;
            }
            panic!("event loop never produced a result");
        }

        async fn settle_until(&mut self, done: impl Fn(&Self) -> bool) {
            for _ in 0..100 {
                self.event_loop.drain();
                if done(self) {
                    return;
                }
                tokio::task::yield_now().await;
            }
            panic!("event loop never settled");
        }
    }

    fn entry(id: &str, last_updated: &str) -> Value {
        json!({
            "message": {
                "message_id": id,
                "display_type": "custom",
                "display": {"custom": {"body": id}}
            },
            "triggers": [{"type": "foreground", "goal": 1.0}],
            "created": "2024-01-01T00:00:00Z",
            "last_updated": last_updated
        })
    }

    fn payload(timestamp: &str, entries: Vec<Value>) -> Value {
        json!({
            "type": "in_app_messages",
            "timestamp": timestamp,
            "data": {"in_app_messages": entries}
        })
    }

    fn targeted(id: &str) -> Value {
        let mut value = entry(id, "2024-01-01T00:00:00Z");
        value["message"]["audience"] = json!({
            "tags": {"and": [
                {"tag": "gold", "group": "loyalty"},
                {"not": {"tag": "opted_out"}}
            ]}
        });
        value
    }

    fn custom_info(id: &str) -> ScheduleInfo {
        custom_info_with_audience(id, None)
    }

    fn custom_info_with_audience(id: &str, audience: Option<Audience>) -> ScheduleInfo {
        let message = InAppMessage::builder()
            .id(id)
            .display_content(DisplayContent::custom(json!({"body": id})))
            .audience(audience)
            .build()
            .unwrap();
        ScheduleInfo::builder()
            .message(message)
            .trigger(Trigger::foreground(1.0))
            .build()
            .unwrap()
    }

    #[test]
    fn test_reapplying_snapshot_makes_no_engine_calls() {
        let mut harness = Harness::new(None);
        let entries = vec![
            entry("welcome", "2024-01-01T00:00:00Z"),
            entry("promo", "2024-01-01T00:00:00Z"),
        ];
        harness.submit(payload("2024-02-01T00:00:00Z", entries.clone()));
        assert_eq!(harness.scheduler.len(), 2);
        harness.scheduler.clear_calls();

        harness.submit(payload("2024-02-01T00:00:00Z", entries.clone()));
        assert!(harness.scheduler.calls().is_empty());

        harness.submit(payload("2024-02-02T00:00:00Z", entries));
        assert!(harness.scheduler.calls().is_empty());
    }

    #[test]
    fn test_updated_entry_is_edited_in_place() {
        let mut harness = Harness::new(None);
        harness.submit(payload(
            "2024-02-01T00:00:00Z",
            vec![entry("welcome", "2024-01-01T00:00:00Z")],
        ));
        let schedule_id = harness.schedule_id("welcome");

        let mut changed = entry("welcome", "2024-01-05T00:00:00Z");
        changed["priority"] = json!(3);
        harness.submit(payload("2024-02-02T00:00:00Z", vec![changed]));

        let edits = harness.scheduler.edits_for(&schedule_id);
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].priority, Some(3));
        assert_eq!(harness.scheduler.len(), 1);
        let schedule = harness.manager.get_schedule(&schedule_id).unwrap().unwrap();
        assert_eq!(schedule.info.priority(), 3);
    }

    #[test]
    fn test_metadata_change_alone_edits_schedule() {
        let mut harness = Harness::new(None);
        let entries = vec![entry("welcome", "2024-01-01T00:00:00Z")];
        let mut first = payload("2024-02-01T00:00:00Z", entries.clone());
        first["metadata"] = json!({"etag": "a"});
        harness.submit(first);
        let schedule_id = harness.schedule_id("welcome");
        harness.scheduler.clear_calls();

        let mut second = payload("2024-02-02T00:00:00Z", entries);
        second["metadata"] = json!({"etag": "b"});
        harness.submit(second);

        let edits = harness.scheduler.edits_for(&schedule_id);
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].metadata, Some(json!({"etag": "b"})));
        assert_eq!(harness.scheduler.len(), 1);
    }

    #[test]
    fn test_removed_message_is_ended_not_cancelled() {
        let mut harness = Harness::new(None);
        harness.submit(payload(
            "2024-02-01T00:00:00Z",
            vec![
                entry("welcome", "2024-01-01T00:00:00Z"),
                entry("promo", "2024-01-01T00:00:00Z"),
            ],
        ));
        let welcome_id = harness.schedule_id("welcome");
        let promo_id = harness.schedule_id("promo");
        harness.scheduler.clear_calls();

        harness.submit(payload(
            "2024-02-03T00:00:00Z",
            vec![entry("welcome", "2024-01-01T00:00:00Z")],
        ));

        let removed_at: DateTime<Utc> = "2024-02-03T00:00:00Z".parse().unwrap();
        let edits = harness.scheduler.edits_for(&promo_id);
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].start, Some(Some(removed_at)));
        assert_eq!(edits[0].end, Some(Some(removed_at)));
        assert!(harness.scheduler.edits_for(&welcome_id).is_empty());
        assert!(!harness
            .scheduler
            .calls()
            .iter()
            .any(|call| matches!(call, SchedulerCall::Cancel { .. } | SchedulerCall::CancelGroup { .. })));
    }

    #[test]
    fn test_one_display_at_a_time_then_cooldown() {
        let mut harness = Harness::new(None);
        let schedules = harness
            .manager
            .schedule(vec![custom_info("first"), custom_info("second")])
            .unwrap();
        let (first, second) = (schedules[0].id.clone(), schedules[1].id.clone());
        harness.prepare(&first);
        harness.prepare(&second);
        assert!(harness.is_ready(&first));
        assert!(harness.is_ready(&second));

        let mut execution = harness.manager.execute_schedule(&first);
        harness.event_loop.drain();
        assert_eq!(harness.recorder.displays.load(Ordering::SeqCst), 1);
        assert!(!harness.is_ready(&second));

        let handler = harness.recorder.handler.lock().clone().unwrap();
        handler.finished(ResolutionInfo::dismissed(Duration::from_secs(2)));
        harness.event_loop.drain();
        let result = execution.try_recv().unwrap();
        assert_eq!(result, ExecutionResult::Finished);
        harness.scheduler.complete_execution(&first, result);
        assert_eq!(harness.events.count_type("user_dismissed"), 1);

        assert!(!harness.is_ready(&second));
        harness.event_loop.advance(Duration::from_secs(30));
        harness.event_loop.drain();
        assert!(harness.is_ready(&second));
        assert!(harness.manager.get_schedule(&first).unwrap().is_none());
    }

    #[test]
    fn test_back_to_back_executions_display_once() {
        let mut harness = Harness::new(None);
        let schedules = harness
            .manager
            .schedule(vec![custom_info("first"), custom_info("second")])
            .unwrap();
        let (first, second) = (schedules[0].id.clone(), schedules[1].id.clone());
        harness.prepare(&first);
        harness.prepare(&second);
        assert!(harness.is_ready(&first));
        assert!(harness.is_ready(&second));

        let mut first_execution = harness.manager.execute_schedule(&first);
        let mut second_execution = harness.manager.execute_schedule(&second);
        harness.event_loop.drain();

        assert_eq!(harness.recorder.displays.load(Ordering::SeqCst), 1);
        assert!(first_execution.try_recv().is_err());
        let result = second_execution.try_recv().unwrap();
        assert_eq!(result, ExecutionResult::NotReady);
        harness.scheduler.complete_execution(&second, result);
        assert_eq!(harness.manager.get_schedule(&second).unwrap().unwrap().execution_count, 0);

        let handler = harness.recorder.handler.lock().clone().unwrap();
        handler.finished(ResolutionInfo::dismissed(Duration::from_secs(1)));
        harness.event_loop.drain();
        assert_eq!(first_execution.try_recv().unwrap(), ExecutionResult::Finished);
        harness.event_loop.advance(Duration::from_secs(30));
        harness.event_loop.drain();
        assert!(harness.is_ready(&second));
    }

    #[test]
    fn test_retry_prepares_again_after_one_drain() {
        let mut harness = Harness::new(None);
        harness.recorder.results.lock().push_back(PrepareResult::Retry);
        let schedule = harness.manager.schedule_message(custom_info("slow")).unwrap();

        harness.prepare(&schedule.id);
        assert_eq!(harness.recorder.prepares.load(Ordering::SeqCst), 1);
        assert_eq!(harness.scheduler.prepare_result(&schedule.id), None);

        harness.event_loop.drain();
        assert_eq!(harness.recorder.prepares.load(Ordering::SeqCst), 2);
        assert_eq!(
            harness.scheduler.prepare_result(&schedule.id),
            Some(PrepareScheduleResult::Continue)
        );
    }

    #[test]
    fn test_audience_miss_never_displays() {
        let mut harness = Harness::new(None);
        let mut gated = entry("gated", "2024-01-01T00:00:00Z");
        gated["message"]["audience"] = json!({"notification_opt_in": true});
        harness.device.write().notifications_opt_in = true;
        harness.submit(payload("2024-02-01T00:00:00Z", vec![gated]));
        let schedule_id = harness.schedule_id("gated");
        harness.prepare(&schedule_id);

        harness.device.write().notifications_opt_in = false;
        let mut execution = harness.manager.execute_schedule(&schedule_id);
        harness.event_loop.drain();

        let result = execution.try_recv().unwrap();
        assert_eq!(result, ExecutionResult::Cancel);
        assert_eq!(harness.recorder.displays.load(Ordering::SeqCst), 0);
        harness.scheduler.complete_execution(&schedule_id, result);
        assert!(harness.manager.get_schedule(&schedule_id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_grouped_tag_selector_uses_tag_groups() {
        let cache = loyalty_cache(LoyaltySource::default());
        let mut harness = Harness::new(Some(cache.clone()));

        let first = harness
            .manager
            .submit_payload(&payload("2024-02-01T00:00:00Z", vec![targeted("gold-offer")]))
            .unwrap();
        assert_eq!(harness.settle(first).await.scheduled, 1);
        assert_eq!(harness.manager.get_schedules_for_message("gold-offer").unwrap().len(), 1);

        cache.set_enabled(false);
        let second = harness
            .manager
            .submit_payload(&payload(
                "2024-02-02T00:00:00Z",
                vec![targeted("gold-offer"), targeted("second-offer")],
            ))
            .unwrap();
        let summary = harness.settle(second).await;
        assert_eq!(summary.scheduled, 0);
        assert!(harness
            .manager
            .get_schedules_for_message("second-offer")
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_waiting_on_tag_groups_keeps_its_place() {
        let (source, release) = LoyaltySource::gated();
        let mut harness = Harness::new(Some(loyalty_cache(source)));

        let first = harness
            .manager
            .submit_payload(&payload("2024-02-01T00:00:00Z", vec![targeted("gold-offer")]))
            .unwrap();
        let mut second = harness
            .manager
            .submit_payload(&payload(
                "2024-02-02T00:00:00Z",
                vec![entry("plain", "2024-01-01T00:00:00Z")],
            ))
            .unwrap();
        tokio::task::yield_now().await;
        harness.event_loop.drain();
        assert!(second.try_recv().is_err());
        assert!(harness.scheduler.is_empty());

        release.send(()).unwrap();
        let first = harness.settle(first).await;
        let second = harness.settle(second).await;
        assert_eq!(first.scheduled, 1);
        assert_eq!(second.scheduled, 1);
        assert_eq!(second.ended, 1);
    }

    #[tokio::test]
    async fn test_loop_keeps_draining_during_tag_group_lookup() {
        let (source, release) = LoyaltySource::gated();
        let mut harness = Harness::new(Some(loyalty_cache(source)));
        let gold_only = Audience::builder()
            .tag_selector(TagSelector::group_tag("gold", "loyalty"))
            .build();
        let schedules = harness
            .manager
            .schedule(vec![
                custom_info_with_audience("gold-offer", Some(gold_only)),
                custom_info("plain"),
            ])
            .unwrap();
        let (gated, plain) = (schedules[0].id.clone(), schedules[1].id.clone());
        harness.prepare(&gated);
        harness.prepare(&plain);
        assert!(harness.is_ready(&plain));

        let mut execution = harness.manager.execute_schedule(&gated);
        harness.event_loop.drain();
        tokio::task::yield_now().await;
        harness.event_loop.drain();

        assert_eq!(
            harness.event_loop.state().driver.cycle_state(&gated),
            Some(CycleState::CheckingAudience)
        );
        assert_eq!(harness.recorder.displays.load(Ordering::SeqCst), 0);
        // The loop still answers while the lookup is out; the slot is held.
        assert!(!harness.is_ready(&plain));
        assert!(execution.try_recv().is_err());

        release.send(()).unwrap();
        harness
            .settle_until(|h| h.recorder.displays.load(Ordering::SeqCst) == 1)
            .await;
        assert_eq!(
            harness.event_loop.state().driver.current_display(),
            Some(gated.as_str())
        );
        assert_eq!(
            harness.event_loop.state().driver.cycle_state(&gated),
            Some(CycleState::Displaying)
        );
    }
}
