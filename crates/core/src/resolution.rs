//! Terminal outcome of a displayed message and its analytics payload.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::message::{ButtonBehavior, ButtonInfo};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResolutionInfo {
    ButtonPressed { button: ButtonInfo },
    MessageClicked,
    Dismissed { display_millis: u64 },
    TimedOut,
    Replaced { replacement_id: String },
    DirectOpen,
}

impl ResolutionInfo {
    pub fn button_pressed(button: ButtonInfo) -> Self {
        Self::ButtonPressed { button }
    }

    pub fn dismissed(display_time: Duration) -> Self {
        Self::Dismissed {
            display_millis: u64::try_from(display_time.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn replaced(replacement_id: impl Into<String>) -> Self {
        Self::Replaced {
            replacement_id: replacement_id.into(),
        }
    }

    /// Analytics `type` value for this resolution.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ButtonPressed { .. } => "button_click",
            Self::MessageClicked => "message_click",
            Self::Dismissed { .. } => "user_dismissed",
            Self::TimedOut => "timed_out",
            Self::Replaced { .. } => "replaced",
            Self::DirectOpen => "direct_open",
        }
    }

    /// True when the resolution should cancel the rest of the schedule.
    pub fn cancels_schedule(&self) -> bool {
        matches!(
            self,
            Self::ButtonPressed { button } if button.behavior == ButtonBehavior::Cancel
        )
    }

    /// Event body: `type`, the type-specific fields and `display_time` as
    /// seconds with millisecond precision.
    pub fn to_event_payload(&self, display_time: Duration) -> Value {
        let mut payload = Map::new();
        payload.insert("type".into(), json!(self.event_type()));
        match self {
            Self::ButtonPressed { button } => {
                payload.insert("button_id".into(), json!(button.id));
                let description = button.description.as_deref().unwrap_or(&button.label);
                payload.insert("button_description".into(), json!(description));
            }
            Self::Replaced { replacement_id } => {
                payload.insert("replacement_id".into(), json!(replacement_id));
            }
            _ => {}
        }
        payload.insert("display_time".into(), json!(format_display_time(display_time)));
        Value::Object(payload)
    }
}

pub fn format_display_time(display_time: Duration) -> String {
    format!("{:.3}", display_time.as_secs_f64())
}
