//! Pair-room chat over the same connection substrate: local broadcast,
//! cross-instance fanout through the broker, durable copy for the offline
//! peer.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use fanout_service::{
    broker::{BrokerBridge, InMemoryBroker},
    delivery::{DeliveryRouter, RouterConfig},
    models::{Event, PushMessage},
    services::{InMemoryOfflineStore, OfflineStore},
    websocket::{rooms, ConnectionRegistry, RoomManager, Session},
};

struct Instance {
    registry: ConnectionRegistry,
    rooms: RoomManager,
    router: Arc<DeliveryRouter>,
}

fn instance(broker: &Arc<InMemoryBroker>, store: &Arc<InMemoryOfflineStore>) -> Instance {
    let registry = ConnectionRegistry::new(Uuid::new_v4());
    let rooms = RoomManager::new();
    let router = DeliveryRouter::new(
        registry.clone(),
        rooms.clone(),
        Arc::clone(broker) as Arc<dyn BrokerBridge>,
        Arc::clone(store) as Arc<dyn OfflineStore>,
        RouterConfig::default(),
    );
    let _ = router.spawn_broker_listener();
    Instance {
        registry,
        rooms,
        router,
    }
}

fn connect(instance: &Instance, user_id: Uuid) -> (Session, mpsc::Receiver<PushMessage>) {
    let (tx, rx) = mpsc::channel(32);
    let (session, _) = instance.registry.register(user_id, tx);
    (session, rx)
}

async fn recv(rx: &mut mpsc::Receiver<PushMessage>) -> PushMessage {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for push")
        .expect("push channel closed")
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_pair_room_spans_instances() {
    let broker = Arc::new(InMemoryBroker::new());
    let store = Arc::new(InMemoryOfflineStore::new());
    let instance1 = instance(&broker, &store);
    let instance2 = instance(&broker, &store);

    let user_a = Uuid::new_v4();
    let user_b = Uuid::new_v4();
    let room_id = rooms::pair_room_id(user_a, user_b);

    // A is connected to instance 1, B to instance 2; same logical room
    let (session_a, mut rx_a) = connect(&instance1, user_a);
    instance1.rooms.join(&room_id, session_a);
    let (session_b, mut rx_b) = connect(&instance2, user_b);
    instance2.rooms.join(&room_id, session_b.clone());

    // B sends "hi" into the room from instance 2
    let event = Event::to_room(
        room_id.clone(),
        rooms::peer_in_pair_room(&room_id, user_b),
        Some(user_b),
        json!({"text": "hi"}),
    );
    let event_id = event.event_id;
    let outcome = instance2.router.dispatch(event).await.unwrap();

    // B's own session hears the room echo locally
    assert_eq!(outcome.local_deliveries, 1);
    // A is live on instance 1, but the fallback decision is local to the
    // origin: A has no session in instance 2's room materialization, so a
    // durable copy is queued too. Accepted duplicate, dedup'd by event_id.
    assert!(outcome.stored_offline);

    let push_b = recv(&mut rx_b).await;
    assert_eq!(push_b.event_id, event_id);

    // A receives it on instance 1 via the broker
    let push_a = recv(&mut rx_a).await;
    assert_eq!(push_a.event_id, event_id);
    assert_eq!(push_a.payload["text"], "hi");

    settle().await;
    assert!(rx_a.try_recv().is_err(), "exactly once per session");
    assert!(rx_b.try_recv().is_err());
}

#[tokio::test]
async fn test_room_send_to_offline_peer_is_queued_and_drained() {
    let broker = Arc::new(InMemoryBroker::new());
    let store = Arc::new(InMemoryOfflineStore::new());
    let instance1 = instance(&broker, &store);

    let user_a = Uuid::new_v4();
    let user_b = Uuid::new_v4();
    let room_id = rooms::pair_room_id(user_a, user_b);

    // only B is online and in the room
    let (session_b, mut rx_b) = connect(&instance1, user_b);
    instance1.rooms.join(&room_id, session_b);

    let event = Event::to_room(
        room_id.clone(),
        Some(user_a),
        Some(user_b),
        json!({"text": "you there?"}),
    );
    let event_id = event.event_id;
    let outcome = instance1.router.dispatch(event).await.unwrap();

    assert_eq!(outcome.local_deliveries, 1, "sender's own session");
    assert!(outcome.stored_offline, "peer had no session in the room");
    recv(&mut rx_b).await;

    // A reconnects later and drains the chat backlog with the original id
    let (tx, mut rx_a) = mpsc::channel(32);
    let (session_a, was_offline) = instance1.registry.register(user_a, tx);
    assert!(was_offline);
    instance1
        .router
        .drain_backlog(user_a, &session_a)
        .await
        .unwrap();

    let push = recv(&mut rx_a).await;
    assert_eq!(push.event_id, event_id);
    assert_eq!(push.payload["text"], "you there?");
    assert!(store.fetch_undelivered(user_a).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_room_broadcast_reaches_only_joined_sessions() {
    let broker = Arc::new(InMemoryBroker::new());
    let store = Arc::new(InMemoryOfflineStore::new());
    let instance1 = instance(&broker, &store);

    let user_a = Uuid::new_v4();
    let user_b = Uuid::new_v4();
    let room_id = rooms::pair_room_id(user_a, user_b);

    // A has two sessions on this instance but only one joined the room
    let (in_room, mut rx_in_room) = connect(&instance1, user_a);
    let (_outside, mut rx_outside) = connect(&instance1, user_a);
    instance1.rooms.join(&room_id, in_room);

    let event = Event::to_room(room_id, Some(user_a), Some(user_b), json!({"text": "hi"}));
    let outcome = instance1.router.dispatch(event).await.unwrap();

    assert_eq!(outcome.local_deliveries, 1);
    assert!(
        !outcome.stored_offline,
        "recipient was reachable inside the room"
    );
    recv(&mut rx_in_room).await;
    settle().await;
    assert!(
        rx_outside.try_recv().is_err(),
        "room broadcasts only reach sessions joined to the room"
    );
}
