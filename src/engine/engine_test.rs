use std::io::Write;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use super::*;
use crate::config::PeerEntry;
use crate::subscriber::Subscriber;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

struct CollectingSubscriber {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl CollectingSubscriber {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(CollectingSubscriber { tx }), rx)
    }
}

#[async_trait::async_trait]
impl Subscriber for CollectingSubscriber {
    async fn handle_message(&self, msg: Bytes) -> i32 {
        let _ = self.tx.send(msg);
        0
    }
}

fn udp_communicator() -> Arc<Communicator> {
    Arc::new(Communicator::Udp(crate::udp::UdpEngine::new(
        Config::default(),
        None,
    )))
}

#[tokio::test]
async fn test_communicator_roundtrip() {
    let communicator = udp_communicator();
    communicator.add_listen("127.0.0.1", 0).await.unwrap();

    let (sub, mut rx) = CollectingSubscriber::new();
    communicator.add_subscribe("", 0, sub);

    let listen_addr = match &*communicator {
        Communicator::Udp(engine) => engine.listen_addrs()[0],
        Communicator::Tcp(_) => unreachable!(),
    };
    communicator
        .send("127.0.0.1", listen_addr.port(), b"loop")
        .await
        .unwrap();

    let msg = timeout(RECV_TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(&msg[..], b"loop");

    communicator.shutdown().await;
}

#[tokio::test]
async fn test_send_async_resolves_true() {
    let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let dest = receiver.local_addr().unwrap();

    let communicator = udp_communicator();
    let outcome = communicator
        .send_async("127.0.0.1", dest.port(), b"async")
        .await;
    assert!(outcome.await);

    let mut buf = [0u8; 16];
    let (n, _) = timeout(RECV_TIMEOUT, receiver.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"async");

    communicator.shutdown().await;
}

#[tokio::test]
async fn test_tcp_send_async_goes_through_pool() {
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();

    let accepted = tokio::spawn(async move {
        let (mut stream, _) = server.accept().await.unwrap();
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await.unwrap();
        buf[..n].to_vec()
    });

    let pool = Dispatcher::new(2);
    let communicator = Arc::new(Communicator::Tcp(crate::tcp::TcpEngine::new(
        Config {
            protocol: Protocol::Tcp,
            ..Config::default()
        },
        Some(Arc::clone(&pool)),
    )));

    let outcome = communicator
        .send_async("127.0.0.1", server_addr.port(), b"pooled")
        .await;
    assert!(outcome.await);

    let received = timeout(RECV_TIMEOUT, accepted).await.unwrap().unwrap();
    assert_eq!(&received, b"pooled");

    // Once the pool refuses submissions, the outcome resolves to false
    // instead of falling back to a detached task.
    pool.close().await;
    let outcome = communicator
        .send_async("127.0.0.1", server_addr.port(), b"late")
        .await;
    assert!(!outcome.await);

    communicator.shutdown().await;
}

#[tokio::test]
async fn test_send_async_resolves_false_on_failure() {
    let communicator = udp_communicator();

    // An empty destination ip can never be sent to.
    let outcome = communicator.send_async("", 2233, b"async").await;
    assert!(!outcome.await);

    communicator.shutdown().await;
}

#[tokio::test]
async fn test_engine_from_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engine.yaml");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "protocol: udp").unwrap();
    writeln!(file, "listen_list:").unwrap();
    writeln!(file, "  - {{ IP: \"127.0.0.1\", Port: 0 }}").unwrap();

    let engine = Engine::initialize(Some(path.to_str().unwrap()))
        .await
        .unwrap();
    assert!(!engine.is_closed());

    engine.shutdown().await;
    assert!(engine.is_closed());
    // A second shutdown is a no-op.
    engine.shutdown().await;
}

#[tokio::test]
async fn test_engine_initialize_failure_surfaces() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engine.yaml");
    let mut file = std::fs::File::create(&path).unwrap();
    // An unparsable listen address fails the bind step.
    writeln!(file, "listen_list:").unwrap();
    writeln!(file, "  - {{ IP: \"999.999.0.1\", Port: 2233 }}").unwrap();

    assert!(Engine::initialize(Some(path.to_str().unwrap()))
        .await
        .is_err());
}

#[tokio::test]
async fn test_broadcast_targets_follow_protocol() {
    let config = Config {
        send_list: vec![PeerEntry {
            id: None,
            ip: "127.0.0.1".to_owned(),
            port: 4000,
        }],
        connect_list: vec![PeerEntry {
            id: None,
            ip: "127.0.0.1".to_owned(),
            port: 5000,
        }],
        ..Config::default()
    };

    let engine = Engine {
        config: config.clone(),
        communicator: udp_communicator(),
        scheduler: crate::periodic::PeriodicScheduler::new(udp_communicator()),
        dispatcher: None,
        closed: AtomicBool::new(false),
    };
    assert_eq!(
        engine.broadcast_targets(),
        vec![("127.0.0.1".to_owned(), 4000)]
    );

    let tcp_engine = Engine {
        config: Config {
            protocol: Protocol::Tcp,
            ..config
        },
        communicator: udp_communicator(),
        scheduler: crate::periodic::PeriodicScheduler::new(udp_communicator()),
        dispatcher: None,
        closed: AtomicBool::new(false),
    };
    assert_eq!(
        tcp_engine.broadcast_targets(),
        vec![("127.0.0.1".to_owned(), 5000)]
    );

    engine.shutdown().await;
    tcp_engine.shutdown().await;
}
