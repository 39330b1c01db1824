//! The directory service end to end over the in-memory network.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use blindpost_core::wire::open_directory_reply;
use blindpost_core::{
    Address, ChallengePurpose, Destination, Directory, Handle, HandshakePolicy, IdentityKeypair,
    IdentityStore, MemoryChallengeStore, MemoryIdentityStore, PeerSession, PublicKey, WireMessage,
};
use blindpost_server::{serve, ServerConfig};
use blindpost_transport::{
    Client, ClientConfig, Event, Inbound, MemoryNetwork, MemoryTransport, Transport,
    TransportError,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};

type TestDirectory = Directory<MemoryIdentityStore, MemoryChallengeStore>;

struct Service {
    directory: Arc<TestDirectory>,
    stop: oneshot::Sender<()>,
    task: JoinHandle<Result<(), TransportError>>,
}

fn start<T: Transport + 'static>(transport: T, config: ServerConfig) -> Service {
    let directory = Arc::new(Directory::new(
        IdentityKeypair::generate(),
        MemoryIdentityStore::new(),
        MemoryChallengeStore::new(),
        config.directory_config(),
    ));
    let (stop, stopped) = oneshot::channel::<()>();
    let engine = Arc::clone(&directory);
    let task = tokio::spawn(async move {
        let shutdown = async {
            let _ = stopped.await;
        };
        serve(Arc::new(transport), engine, &config, shutdown).await
    });
    Service {
        directory,
        stop,
        task,
    }
}

/// Fails every send while `failing` is set.
struct FlakyTransport {
    inner: MemoryTransport,
    failing: Arc<AtomicBool>,
    failures: Arc<AtomicUsize>,
}

#[async_trait]
impl Transport for FlakyTransport {
    async fn send(
        &self,
        payload: Vec<u8>,
        destination: Destination,
        reply_budget: u32,
    ) -> Result<(), TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(TransportError::ReplyHandleExhausted);
        }
        self.inner.send(payload, destination, reply_budget).await
    }

    async fn receive(&self) -> Result<Inbound, TransportError> {
        self.inner.receive().await
    }

    fn address(&self) -> &Address {
        self.inner.address()
    }
}

fn h(s: &str) -> Handle {
    Handle::new(s).unwrap()
}

fn directory_address() -> Destination {
    Destination::Address(Address::new("directory").unwrap())
}

fn client_config(key: PublicKey) -> ClientConfig {
    ClientConfig::new(Address::new("directory").unwrap())
        .with_directory_key(key)
        .with_request_timeout(Duration::from_secs(2))
        .with_receive_timeout(Duration::from_secs(2))
}

async fn directory_reply(endpoint: &MemoryTransport, key: &PublicKey) -> WireMessage {
    let inbound = timeout(Duration::from_secs(2), endpoint.receive())
        .await
        .unwrap()
        .unwrap();
    match WireMessage::decode(&inbound.payload).unwrap() {
        WireMessage::DirectoryReply { body, signature } => {
            open_directory_reply(&body, &signature, Some(key)).unwrap()
        }
        other => panic!("expected a directory reply, got {other:?}"),
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached");
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_register_lookup_and_relay() {
    let net = MemoryNetwork::new();
    let service = start(net.join("directory").unwrap(), ServerConfig::default());
    let key = service.directory.public_key();

    let mut alice = Client::new(
        net.join("alice").unwrap(),
        h("alice"),
        IdentityKeypair::generate(),
        client_config(key),
    );
    let mut bob = Client::new(
        net.join("bob").unwrap(),
        h("bob"),
        IdentityKeypair::generate(),
        client_config(key),
    );
    alice.register().await.unwrap();
    bob.register().await.unwrap();
    assert!(service.directory.identities().exists(&h("alice")).unwrap());

    assert_eq!(
        bob.lookup(&h("alice")).await.unwrap(),
        Some(alice.session().public_key())
    );

    bob.send_text(&h("alice"), "ping").await.unwrap();
    loop {
        match alice.next_event().await.unwrap() {
            Event::Message { from, message } => {
                assert_eq!(from, h("bob"));
                assert_eq!(message.as_str(), "ping");
                break;
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
    match bob.next_event().await.unwrap() {
        Event::DeliveryReport { delivered, .. } => assert!(delivered),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn test_many_concurrent_registrations() {
    let net = MemoryNetwork::new();
    let service = start(
        net.join("directory").unwrap(),
        ServerConfig::default().with_max_in_flight(4),
    );
    let key = service.directory.public_key();

    let mut tasks = Vec::new();
    for i in 0..16 {
        let endpoint = net.join(&format!("user-{i}")).unwrap();
        tasks.push(tokio::spawn(async move {
            let mut client = Client::new(
                endpoint,
                Handle::new(format!("user-{i}")).unwrap(),
                IdentityKeypair::generate(),
                client_config(key),
            );
            client.register().await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert_eq!(service.directory.identities().len(), 16);
}

#[tokio::test]
async fn test_undeliverable_challenge_is_abandoned() {
    let net = MemoryNetwork::new();
    let failing = Arc::new(AtomicBool::new(true));
    let failures = Arc::new(AtomicUsize::new(0));
    let transport = FlakyTransport {
        inner: net.join("directory").unwrap(),
        failing: Arc::clone(&failing),
        failures: Arc::clone(&failures),
    };
    let service = start(transport, ServerConfig::default());
    let key = service.directory.public_key();

    let endpoint = net.join("alice").unwrap();
    let session = PeerSession::new(h("alice"), IdentityKeypair::generate(), HandshakePolicy::Manual);

    endpoint
        .send(session.register_request().unwrap(), directory_address(), 5)
        .await
        .unwrap();
    eventually(|| {
        failures.load(Ordering::SeqCst) >= 1 && service.directory.challenges().is_empty()
    })
    .await;

    // Nothing is left pending, so a retry gets a fresh challenge.
    failing.store(false, Ordering::SeqCst);
    endpoint
        .send(session.register_request().unwrap(), directory_address(), 5)
        .await
        .unwrap();
    let nonce = match directory_reply(&endpoint, &key).await {
        WireMessage::Challenge { nonce } => nonce,
        other => panic!("expected a challenge, got {other:?}"),
    };
    let confirm = session
        .answer_challenge(ChallengePurpose::Register, &nonce)
        .unwrap();
    endpoint.send(confirm, directory_address(), 5).await.unwrap();
    assert_eq!(
        directory_reply(&endpoint, &key).await,
        WireMessage::RegisterResult { ok: true }
    );
}

#[tokio::test]
async fn test_expired_challenge_purged_and_refused() {
    let net = MemoryNetwork::new();
    let config = ServerConfig::default()
        .with_challenge_ttl(Duration::from_millis(200))
        .with_cleanup_interval(Duration::from_millis(20));
    let service = start(net.join("directory").unwrap(), config);
    let key = service.directory.public_key();

    let endpoint = net.join("alice").unwrap();
    let session = PeerSession::new(h("alice"), IdentityKeypair::generate(), HandshakePolicy::Manual);
    endpoint
        .send(session.register_request().unwrap(), directory_address(), 5)
        .await
        .unwrap();
    let nonce = match directory_reply(&endpoint, &key).await {
        WireMessage::Challenge { nonce } => nonce,
        other => panic!("expected a challenge, got {other:?}"),
    };
    assert_eq!(service.directory.challenges().len(), 1);

    eventually(|| service.directory.challenges().is_empty()).await;

    let confirm = session
        .answer_challenge(ChallengePurpose::Register, &nonce)
        .unwrap();
    endpoint.send(confirm, directory_address(), 5).await.unwrap();
    assert_eq!(
        directory_reply(&endpoint, &key).await,
        WireMessage::RegisterResult { ok: false }
    );
    assert!(!service.directory.identities().exists(&h("alice")).unwrap());
}

#[tokio::test]
async fn test_shutdown_stops_serving() {
    let net = MemoryNetwork::new();
    let service = start(net.join("directory").unwrap(), ServerConfig::default());

    service.stop.send(()).unwrap();
    let result = timeout(Duration::from_secs(2), service.task)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());

    // The endpoint went away with the service.
    let alice = net.join("alice").unwrap();
    assert!(matches!(
        alice.send(vec![1], directory_address(), 1).await,
        Err(TransportError::Unreachable)
    ));
}
