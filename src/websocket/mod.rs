pub mod handlers;
pub mod message_types;
pub mod registry;
pub mod rooms;

pub use registry::{ConnectionRegistry, Session};
pub use rooms::RoomManager;
