use crate::{
    config::Config,
    delivery::DeliveryRouter,
    websocket::{ConnectionRegistry, RoomManager},
};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub registry: ConnectionRegistry,
    pub rooms: RoomManager,
    pub router: Arc<DeliveryRouter>,
    pub config: Arc<Config>,
}
