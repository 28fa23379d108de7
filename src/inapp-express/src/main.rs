//! In-App Express: replays remote message snapshots through the delivery
//! pipeline with a logging display adapter and a minimal polling engine.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use campaign_core::clock::SystemClock;
use campaign_core::config::AppConfig;
use campaign_core::event_bus::{EventSink, InAppEvent};
use campaign_core::message::{DisplayType, InAppMessage};
use campaign_core::resolution::ResolutionInfo;
use campaign_core::schedule::Schedule;
use campaign_inapp::{
    AdapterFactory, DisplayAdapter, DisplayHandler, ExecutionResult, InAppMessageManager,
    InMemoryScheduler, PrepareResult, PrepareScheduleResult, Scheduler,
};
use campaign_segmentation::{DeviceSnapshot, DeviceStateProvider};
use chrono::Utc;
use clap::Parser;
use parking_lot::RwLock;
use serde_json::json;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "inapp-express")]
#[command(about = "Replays in-app message snapshots through the delivery pipeline")]
#[command(version)]
struct Cli {
    /// Remote data payloads (JSON), applied in order
    snapshots: Vec<PathBuf>,

    /// Optional TOML config file
    #[arg(long, env = "CAMPAIGN_INAPP__CONFIG_FILE")]
    config: Option<String>,

    /// Minimum gap between displays (overrides config)
    #[arg(long, env = "CAMPAIGN_INAPP__IN_APP__DISPLAY_INTERVAL_MS")]
    display_interval_ms: Option<u64>,

    /// Channel id of the simulated device
    #[arg(long, default_value = "demo-channel")]
    channel_id: String,

    /// Whether the simulated device is opted in to notifications
    #[arg(long, default_value_t = false)]
    notifications_opt_in: bool,

    /// How long each logged display stays up before timing out
    #[arg(long, default_value_t = 2_000)]
    display_ms: u64,

    /// Stop after this many seconds
    #[arg(long, default_value_t = 10)]
    run_for_secs: u64,
}

/// Writes resolution events to the log.
struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: InAppEvent) {
        info!(
            schedule_id = %event.schedule_id,
            message_id = %event.message_id,
            event_type = event.event_type(),
            payload = %event.payload,
            "In-app event"
        );
    }
}

/// Logs the message and times it out after a fixed duration.
struct LogAdapter {
    message_id: String,
    display_type: DisplayType,
    display_for: Duration,
}

impl DisplayAdapter for LogAdapter {
    fn prepare(&mut self) -> PrepareResult {
        PrepareResult::Ok
    }

    fn display(&mut self, handler: DisplayHandler) -> anyhow::Result<()> {
        info!(
            schedule_id = %handler.schedule_id(),
            message_id = %self.message_id,
            display_type = self.display_type.as_str(),
            "Displaying message"
        );
        let display_for = self.display_for;
        tokio::spawn(async move {
            tokio::time::sleep(display_for).await;
            handler.finished(ResolutionInfo::TimedOut);
        });
        Ok(())
    }
}

fn log_adapter_factory(display_for: Duration) -> Arc<dyn AdapterFactory> {
    Arc::new(move |message: &InAppMessage| -> anyhow::Result<Box<dyn DisplayAdapter>> {
        Ok(Box::new(LogAdapter {
            message_id: message.id().to_string(),
            display_type: message.display_type(),
            display_for,
        }))
    })
}

/// Stand-in for the automation engine: every active schedule counts as
/// triggered; schedules are prepared, executed one at a time and booked.
async fn drive_engine(
    manager: Arc<InAppMessageManager>,
    scheduler: Arc<InMemoryScheduler>,
    mut stop: oneshot::Receiver<()>,
) {
    let mut preparing: HashSet<String> = HashSet::new();
    let mut skipped: HashSet<String> = HashSet::new();
    let mut ticker = tokio::time::interval(Duration::from_millis(250));

    loop {
        tokio::select! {
            _ = &mut stop => break,
            _ = ticker.tick() => {}
        }

        if scheduler.is_paused() {
            continue;
        }

        for schedule in scheduler.take_expired() {
            preparing.remove(&schedule.id);
            manager.schedule_expired(schedule);
        }

        let schedules = match scheduler.get_schedules() {
            Ok(schedules) => schedules,
            Err(e) => {
                error!(error = %e, "Failed to list schedules");
                continue;
            }
        };
        let now = Utc::now();
        for schedule in schedules.into_iter().filter(|s| is_active(s, now)) {
            if preparing.contains(&schedule.id) || skipped.contains(&schedule.id) {
                continue;
            }
            preparing.insert(schedule.id.clone());
            manager.prepare_schedule(schedule);
        }

        let ids: Vec<String> = preparing.iter().cloned().collect();
        for id in ids {
            match scheduler.prepare_result(&id) {
                Some(PrepareScheduleResult::Continue) => {}
                Some(PrepareScheduleResult::Skip) => {
                    preparing.remove(&id);
                    skipped.insert(id);
                    continue;
                }
                Some(PrepareScheduleResult::Cancel) => {
                    preparing.remove(&id);
                    continue;
                }
                None => continue,
            }

            if !manager.is_schedule_ready(&id).await.unwrap_or(false) {
                continue;
            }
            let result = match manager.execute_schedule(&id).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(schedule_id = %id, "Execution dropped without a result");
                    continue;
                }
            };
            scheduler.complete_execution(&id, result);
            if result == ExecutionResult::NotReady {
                debug!(schedule_id = %id, "Lost the display slot, retrying next tick");
                continue;
            }
            info!(schedule_id = %id, ?result, "Execution finished");
            preparing.remove(&id);
        }
    }
}

fn is_active(schedule: &Schedule, now: chrono::DateTime<Utc>) -> bool {
    schedule.info.start().map_or(true, |start| start <= now)
        && !schedule.is_expired_at(now)
        && !schedule.is_limit_reached()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "inapp_express=info,campaign_inapp=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("In-App Express starting up");

    let mut config = AppConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });
    if let Some(interval) = cli.display_interval_ms {
        config.in_app.display_interval_ms = interval;
    }
    info!(
        enabled = config.in_app.enabled,
        display_interval_ms = config.in_app.display_interval_ms,
        snapshots = cli.snapshots.len(),
        "Configuration loaded"
    );

    let scheduler = Arc::new(InMemoryScheduler::new(Arc::new(SystemClock)));
    let device: Arc<dyn DeviceStateProvider> = Arc::new(RwLock::new(DeviceSnapshot {
        channel_id: Some(cli.channel_id.clone()),
        notifications_opt_in: cli.notifications_opt_in,
        ..DeviceSnapshot::default()
    }));

    let display_for = Duration::from_millis(cli.display_ms);
    let mut builder = InAppMessageManager::builder(scheduler.clone(), device)
        .config(config.in_app.clone())
        .event_sink(Arc::new(LogSink));
    for display_type in [
        DisplayType::Banner,
        DisplayType::Fullscreen,
        DisplayType::Html,
        DisplayType::Custom,
    ] {
        builder = builder.adapter(display_type, log_adapter_factory(display_for));
    }
    let (manager, event_loop) = builder.build();
    let manager = Arc::new(manager);

    let (loop_stop_tx, loop_stop_rx) = oneshot::channel::<()>();
    let event_loop_task = tokio::spawn(event_loop.run(async {
        let _ = loop_stop_rx.await;
    }));

    for path in &cli.snapshots {
        let raw = std::fs::read_to_string(path)?;
        let payload: serde_json::Value = serde_json::from_str(&raw)?;
        match manager.submit_payload(&payload) {
            Ok(summary) => match summary.await {
                Ok(summary) => info!(
                    path = %path.display(),
                    scheduled = summary.scheduled,
                    edited = summary.edited,
                    ended = summary.ended,
                    skipped = summary.skipped,
                    failed = summary.failed,
                    "Snapshot applied"
                ),
                Err(_) => warn!(path = %path.display(), "Event loop stopped before snapshot applied"),
            },
            Err(e) => error!(path = %path.display(), error = %e, "Invalid snapshot"),
        }
    }

    manager.on_surface_resumed();
    let (engine_stop_tx, engine_stop_rx) = oneshot::channel::<()>();
    let engine = tokio::spawn(drive_engine(manager.clone(), scheduler.clone(), engine_stop_rx));

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(cli.run_for_secs)) => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    let _ = engine_stop_tx.send(());
    if let Err(e) = engine.await {
        error!(error = %e, "Engine task failed");
    }
    let _ = loop_stop_tx.send(());
    let runtime = event_loop_task.await?;
    if let Some(schedule_id) = runtime.driver.current_display() {
        warn!(schedule_id = %schedule_id, "Stopped while a message was displayed");
    }

    let summary: Vec<serde_json::Value> = scheduler
        .get_schedules()?
        .iter()
        .map(|s| {
            json!({
                "schedule_id": s.id,
                "message_id": s.message().id(),
                "execution_count": s.execution_count,
                "limit": s.info.limit(),
                "start": s.info.start(),
                "end": s.info.end(),
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&summary)?);

    info!("In-App Express shut down");
    Ok(())
}
