use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use murmur::cluster::{ClusterCoordinator, CoordinatorState};
use murmur::error::{ClusterError, Result};
use murmur::protocol::{Message, MessageHandler, Path};
use murmur::settings::{ClusterConfig, ConflictAction};
use tokio::sync::mpsc;
use tokio::time::timeout;

struct ChannelHandler(mpsc::UnboundedSender<Message>);

impl MessageHandler for ChannelHandler {
    fn handle_message(&self, message: Message) -> Result<()> {
        self.0
            .send(message)
            .map_err(|e| ClusterError::Handler(e.to_string()))
    }
}

fn config(id: u32, remotes: Vec<SocketAddr>) -> ClusterConfig {
    // port 0: the OS picks a free port
    ClusterConfig::new(id, "127.0.0.1", 0, remotes).with_conflict_action(ConflictAction::Notify)
}

async fn node(
    id: u32,
    remotes: Vec<SocketAddr>,
) -> (ClusterCoordinator, mpsc::UnboundedReceiver<Message>) {
    let coordinator = ClusterCoordinator::new(config(id, remotes)).await.unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    coordinator
        .set_message_handler(Arc::new(ChannelHandler(tx)))
        .unwrap();
    (coordinator, rx)
}

#[tokio::test]
async fn test_two_nodes_exchange_messages() {
    let (a, mut rx_a) = node(1, vec![]).await;
    // a only serves joins, it never starts itself
    let a_addr = a.local_address();

    let (b, mut rx_b) = node(2, vec![a_addr]).await;
    b.start().await.unwrap();
    assert_eq!(b.state(), CoordinatorState::Started);
    assert_eq!(b.members().len(), 2);
    assert_eq!(a.members().len(), 2);
    assert_eq!(a.event_counts().joins, 1);

    let mut message = Message::new(Path::new("/chat/room").unwrap(), "hello from b");
    message.id = 1;
    message.node_id = 2;
    assert_eq!(b.broadcast_message(&message).unwrap(), 1);

    let received = timeout(Duration::from_secs(2), rx_a.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, message);
    assert!(rx_b.try_recv().is_err());

    // string traffic never reaches the handler
    assert_eq!(b.broadcast_string("ping").unwrap(), 1);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx_a.try_recv().is_err());

    b.stop().await.unwrap();
    timeout(Duration::from_secs(2), async {
        while a.members().len() != 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(a.event_counts().leaves, 1);
    a.stop().await.unwrap();
}

#[tokio::test]
async fn test_self_seeded_node_starts_alone() {
    let (scratch, _) = node(1, vec![]).await;
    let addr = scratch.local_address();
    scratch.stop().await.unwrap();
    drop(scratch);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let coordinator = ClusterCoordinator::new(
        ClusterConfig::new(1, "127.0.0.1", addr.port(), vec![addr])
            .with_conflict_action(ConflictAction::Notify),
    )
    .await
    .unwrap();
    let (tx, _rx) = mpsc::unbounded_channel();
    coordinator
        .set_message_handler(Arc::new(ChannelHandler(tx)))
        .unwrap();
    coordinator.start().await.unwrap();
    assert_eq!(coordinator.members().len(), 1);
    assert_eq!(coordinator.broadcast_string("nobody listens").unwrap(), 0);
    assert!(coordinator.check().is_ok());
}

#[tokio::test]
async fn test_unreachable_remote_fails_start() {
    let (scratch, _) = node(9, vec![]).await;
    let dead = scratch.local_address();
    scratch.stop().await.unwrap();
    drop(scratch);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let (a, _rx) = node(1, vec![dead]).await;
    let result = a.start().await;
    assert!(matches!(result, Err(ClusterError::Join(_))));
    assert_eq!(a.state(), CoordinatorState::Created);
    assert!(a.health_score() > 0);
}

#[tokio::test]
async fn test_bind_conflict_is_provider_init_error() {
    let (a, _rx) = node(1, vec![]).await;
    let taken = a.local_address();
    let result =
        ClusterCoordinator::new(ClusterConfig::new(2, "127.0.0.1", taken.port(), vec![])).await;
    assert!(matches!(result, Err(ClusterError::ProviderInit(_))));
}

#[tokio::test]
async fn test_handler_required_before_start() {
    let coordinator = ClusterCoordinator::new(config(1, vec![])).await.unwrap();
    assert!(matches!(
        coordinator.start().await,
        Err(ClusterError::Configuration(_))
    ));
}

#[tokio::test]
async fn test_wildcard_bind_node_is_reachable() {
    let (a, mut rx_a) = node(1, vec![]).await;
    let a_addr = a.local_address();

    let wildcard = ClusterConfig::new(2, "0.0.0.0", 0, vec![a_addr])
        .with_conflict_action(ConflictAction::Notify);
    let b = ClusterCoordinator::new(wildcard).await.unwrap();
    let (tx, mut rx_b) = mpsc::unbounded_channel();
    b.set_message_handler(Arc::new(ChannelHandler(tx))).unwrap();
    b.start().await.unwrap();

    let b_seen_by_a = a.members().into_iter().find(|m| m.name == "2").unwrap();
    assert!(!b_seen_by_a.address.ip().is_unspecified());

    let message = Message::new(Path::new("/chat/room").unwrap(), "to b");
    assert_eq!(a.broadcast_message(&message).unwrap(), 1);
    let received = timeout(Duration::from_secs(2), rx_b.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, message);
    assert!(rx_a.try_recv().is_err());
    assert!(b.fatal_signal().borrow().is_none());

    b.stop().await.unwrap();
    a.stop().await.unwrap();
}

#[tokio::test]
async fn test_advertise_host_is_announced() {
    let (a, _rx_a) = node(1, vec![]).await;
    let advertised = ClusterConfig::new(2, "0.0.0.0", 0, vec![a.local_address()])
        .with_advertise_host("127.0.0.1")
        .with_conflict_action(ConflictAction::Notify);
    let b = ClusterCoordinator::new(advertised).await.unwrap();
    let (tx, _rx_b) = mpsc::unbounded_channel();
    b.set_message_handler(Arc::new(ChannelHandler(tx))).unwrap();
    assert_eq!(b.local_address().ip().to_string(), "127.0.0.1");
    assert_ne!(b.local_address().port(), 0);

    b.start().await.unwrap();
    let b_seen_by_a = a.members().into_iter().find(|m| m.name == "2").unwrap();
    assert_eq!(b_seen_by_a.address, b.local_address());

    b.stop().await.unwrap();
    a.stop().await.unwrap();
}
