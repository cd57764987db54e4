pub mod event;

pub use event::{Event, EventType, OfflineNotification, PushMessage};
