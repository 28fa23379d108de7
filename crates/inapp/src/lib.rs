#![warn(clippy::unwrap_used)]

pub mod adapter;
pub mod coordinator;
pub mod driver;
pub mod event_loop;
pub mod manager;
pub mod remote_data;
pub mod scheduler;

pub use adapter::{
    AdapterFactory, AdapterRegistry, DisplayAdapter, DisplayEvent, DisplayHandler,
    MessageExtender, PrepareResult,
};
pub use coordinator::{CoordinatorState, DisplayCoordinator};
pub use driver::{ActionRunner, CycleState, DeliveryDriver, DeliveryListener};
pub use event_loop::{EventLoop, LoopHandle, TaskHandle};
pub use manager::{InAppMessageManager, InAppMessageManagerBuilder, InAppRuntime, RuntimeHandle};
pub use remote_data::{
    ReconcileSummary, RemoteDataReconciler, RemoteMessageEntry, RemoteSnapshot, SnapshotFeed,
};
pub use scheduler::{
    ExecutionCallback, ExecutionResult, InMemoryScheduler, PrepareScheduleResult, Scheduler,
    SchedulerCall,
};
