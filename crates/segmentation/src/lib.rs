//! Audience evaluation for in-app messages.

pub mod audience;

pub use audience::{test_device_digest, AudienceEvaluator, DeviceSnapshot, DeviceStateProvider};
