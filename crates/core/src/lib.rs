pub mod audience;
pub mod clock;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod message;
pub mod resolution;
pub mod schedule;
pub mod tag_selector;

pub use audience::{Audience, MissBehavior, VersionMatcher};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AppConfig;
pub use error::{CampaignError, CampaignResult};
pub use message::{
    ButtonBehavior, ButtonInfo, DisplayBehavior, DisplayContent, DisplayType, InAppMessage,
    MessageSource,
};
pub use resolution::ResolutionInfo;
pub use schedule::{Schedule, ScheduleEdits, ScheduleInfo, Trigger, TriggerType};
pub use tag_selector::{TagGroups, TagSelector};
