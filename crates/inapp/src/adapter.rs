//! Rendering seam. Each display type gets a factory; the driver creates one
//! adapter per prepared schedule and reports back through a
//! [`DisplayHandler`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use campaign_core::message::{DisplayType, InAppMessage};
use campaign_core::resolution::ResolutionInfo;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrepareResult {
    /// Assets are ready; the schedule may display.
    Ok,
    /// Try again on the next drain.
    Retry,
    /// The message can never display; cancel the schedule.
    Cancel,
}

pub trait DisplayAdapter: Send {
    fn prepare(&mut self) -> PrepareResult;

    fn is_ready(&self) -> bool {
        true
    }

    fn display(&mut self, handler: DisplayHandler) -> anyhow::Result<()>;
}

pub trait AdapterFactory: Send + Sync {
    fn create(&self, message: &InAppMessage) -> anyhow::Result<Box<dyn DisplayAdapter>>;
}

impl<F> AdapterFactory for F
where
    F: Fn(&InAppMessage) -> anyhow::Result<Box<dyn DisplayAdapter>> + Send + Sync,
{
    fn create(&self, message: &InAppMessage) -> anyhow::Result<Box<dyn DisplayAdapter>> {
        self(message)
    }
}

#[derive(Default, Clone)]
pub struct AdapterRegistry {
    factories: HashMap<DisplayType, Arc<dyn AdapterFactory>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, display_type: DisplayType, factory: Arc<dyn AdapterFactory>) {
        self.factories.insert(display_type, factory);
    }

    pub fn with(mut self, display_type: DisplayType, factory: Arc<dyn AdapterFactory>) -> Self {
        self.register(display_type, factory);
        self
    }

    pub fn contains(&self, display_type: DisplayType) -> bool {
        self.factories.contains_key(&display_type)
    }

    /// `None` when no factory is registered for the message's display type.
    pub fn create(&self, message: &InAppMessage) -> Option<anyhow::Result<Box<dyn DisplayAdapter>>> {
        self.factories
            .get(&message.display_type())
            .map(|factory| factory.create(message))
    }
}

/// What a displayed message reports back to the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum DisplayEvent {
    Finished(ResolutionInfo),
    ContinueOnNextActivity,
    CancelFutureDisplays,
}

type EventSender = Arc<dyn Fn(String, DisplayEvent) + Send + Sync>;

/// Given to an adapter when it displays. Safe to call from any thread; every
/// call is forwarded onto the event loop.
#[derive(Clone)]
pub struct DisplayHandler {
    schedule_id: String,
    sender: EventSender,
}

impl DisplayHandler {
    pub(crate) fn new(schedule_id: impl Into<String>, sender: EventSender) -> Self {
        Self {
            schedule_id: schedule_id.into(),
            sender,
        }
    }

    pub fn schedule_id(&self) -> &str {
        &self.schedule_id
    }

    pub fn finished(&self, resolution: ResolutionInfo) {
        (self.sender)(self.schedule_id.clone(), DisplayEvent::Finished(resolution));
    }

    /// The surface went away mid-display; show the message again on the
    /// next resume.
    pub fn continue_on_next_activity(&self) {
        (self.sender)(self.schedule_id.clone(), DisplayEvent::ContinueOnNextActivity);
    }

    pub fn cancel_future_displays(&self) {
        (self.sender)(self.schedule_id.clone(), DisplayEvent::CancelFutureDisplays);
    }
}

impl fmt::Debug for DisplayHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisplayHandler")
            .field("schedule_id", &self.schedule_id)
            .finish()
    }
}

/// Host hook that rewrites a message before it is scheduled.
pub trait MessageExtender: Send + Sync {
    fn extend(&self, message: InAppMessage) -> anyhow::Result<InAppMessage>;
}

impl<F> MessageExtender for F
where
    F: Fn(InAppMessage) -> anyhow::Result<InAppMessage> + Send + Sync,
{
    fn extend(&self, message: InAppMessage) -> anyhow::Result<InAppMessage> {
        self(message)
    }
}

/// Shared, swappable extender. Every clone sees the latest value.
#[derive(Clone, Default)]
pub struct ExtenderSlot {
    inner: Arc<RwLock<Option<Arc<dyn MessageExtender>>>>,
}

impl ExtenderSlot {
    pub fn set(&self, extender: Option<Arc<dyn MessageExtender>>) {
        *self.inner.write() = extender;
    }

    /// Passes the message through the extender, if one is set.
    pub fn extend(&self, message: InAppMessage) -> anyhow::Result<InAppMessage> {
        let extender = self.inner.read().clone();
        match extender {
            Some(extender) => extender.extend(message),
            None => Ok(message),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use campaign_core::message::DisplayContent;
    use parking_lot::Mutex;
    use serde_json::json;

    struct NoopAdapter;

    impl DisplayAdapter for NoopAdapter {
        fn prepare(&mut self) -> PrepareResult {
            PrepareResult::Ok
        }

        fn display(&mut self, _handler: DisplayHandler) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn custom_message() -> InAppMessage {
        InAppMessage::builder()
            .id("m1")
            .display_content(DisplayContent::custom(json!({})))
            .build()
            .unwrap()
    }

    #[test]
    fn test_registry_dispatches_by_display_type() {
        let registry = AdapterRegistry::new().with(
            DisplayType::Custom,
            Arc::new(|_: &InAppMessage| -> anyhow::Result<Box<dyn DisplayAdapter>> {
                Ok(Box::new(NoopAdapter))
            }),
        );

        assert!(registry.contains(DisplayType::Custom));
        assert!(!registry.contains(DisplayType::Banner));

        let mut adapter = registry.create(&custom_message()).unwrap().unwrap();
        assert_eq!(adapter.prepare(), PrepareResult::Ok);
        assert!(adapter.is_ready());
    }

    #[test]
    fn test_missing_factory() {
        let registry = AdapterRegistry::new();
        assert!(registry.create(&custom_message()).is_none());
    }

    #[test]
    fn test_handler_forwards_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = DisplayHandler::new(
            "s1",
            Arc::new(move |id, event| sink.lock().push((id, event))),
        );

        handler.finished(ResolutionInfo::MessageClicked);
        handler.continue_on_next_activity();

        let seen = seen.lock();
        assert_eq!(
            seen[0],
            (
                "s1".to_string(),
                DisplayEvent::Finished(ResolutionInfo::MessageClicked)
            )
        );
        assert_eq!(seen[1].1, DisplayEvent::ContinueOnNextActivity);
    }

    #[test]
    fn test_extender_slot() {
        let slot = ExtenderSlot::default();
        let message = custom_message();
        assert_eq!(slot.extend(message.clone()).unwrap(), message);

        slot.set(Some(Arc::new(
            |message: InAppMessage| -> anyhow::Result<InAppMessage> {
                Ok(message.into_builder().reporting_enabled(false).build()?)
            },
        )));
        let shared = slot.clone();
        assert!(!shared.extend(message.clone()).unwrap().is_reporting_enabled());

        slot.set(Some(Arc::new(|_: InAppMessage| -> anyhow::Result<InAppMessage> {
            anyhow::bail!("no assets")
        })));
        assert!(shared.extend(message).is_err());
    }
}
