pub mod channels;
pub mod models;

pub use channels::{ALL_CHANNELS, Channel, ChannelSet, Scope};
pub use models::{Plan, PlanUpdate, Setting, Stats, Subscription, User};
