#![warn(clippy::unwrap_used)]

pub mod tag_groups;

pub use tag_groups::{ChannelTags, TagGroupCache, TagGroupSource, TagGroupsMutation};
