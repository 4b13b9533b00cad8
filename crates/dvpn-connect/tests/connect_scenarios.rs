//! End-to-end scenarios over in-memory collaborators

use base64::{engine::general_purpose::STANDARD, Engine};
use crossbeam_channel::Receiver;
use dvpn_connect::ledger::mock::{MockLedger, MockNodeApi, MockSigner};
use dvpn_connect::{
    Coin, Collaborators, ConnectOutcome, ConnectionCoordinator, ConnectionError, ConnectionEvent,
    CoordinatorConfig, DisconnectOutcome, MemoryStore, Quota, SessionError, Subscription,
};
use dvpn_tunnel::provider::memory::MemoryProvider;
use dvpn_tunnel::{
    ActivationError, OsStatus, PrivateKey, ProfileId, ProviderError, PublicKey, SessionMaterial,
    TunnelConfigBuilder, TunnelEvent, TunnelManager, TunnelStatus, TunnelsService,
    SESSION_MATERIAL_LEN,
};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const NODE: &str = "sentnode1qx7";
const WALLET: &str = "sent1wallet";
const NODE_URL: &str = "http://51.15.8.9:8585";

struct Setup {
    coordinator: Arc<ConnectionCoordinator>,
    events: Receiver<ConnectionEvent>,
    ledger: Arc<MockLedger>,
    api: Arc<MockNodeApi>,
    provider: Arc<MemoryProvider>,
}

async fn setup(quota: Quota) -> Setup {
    let provider = Arc::new(MemoryProvider::new());
    let (tunnels, tunnel_events) = TunnelManager::create(
        provider.clone(),
        TunnelConfigBuilder::default(),
        Duration::from_millis(20),
    )
    .await
    .unwrap();

    let ledger = Arc::new(MockLedger::new());
    ledger.add_node(NODE, NODE_URL);
    ledger.set_balances(vec![Coin::new("udvpn", "50000000")]);
    ledger.add_subscription(
        Subscription {
            id: 11,
            node: NODE.into(),
            owner: WALLET.into(),
            is_active: true,
        },
        quota,
    );

    let api = Arc::new(MockNodeApi::new());
    let store = Arc::new(MemoryStore::new());
    let (coordinator, events) = ConnectionCoordinator::new(
        Collaborators {
            ledger: ledger.clone(),
            nodes: ledger.clone(),
            node_api: api.clone(),
            signer: Arc::new(MockSigner::new(WALLET)),
            dns: store.clone(),
            connect_info: store,
        },
        tunnels,
        tunnel_events,
        CoordinatorConfig {
            activity_delay: Duration::from_millis(10),
            ..CoordinatorConfig::default()
        },
    );

    Setup {
        coordinator,
        events,
        ledger,
        api,
        provider,
    }
}

fn material() -> SessionMaterial {
    SessionMaterial::new(
        Ipv4Addr::new(10, 8, 0, 3),
        Ipv4Addr::new(51, 15, 8, 9),
        51820,
        PublicKey::from_bytes([3u8; 32]),
    )
}

async fn next_error(events: &Receiver<ConnectionEvent>) -> ConnectionError {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        while let Ok(event) = events.try_recv() {
            if let ConnectionEvent::Error(error) = event {
                return error;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "no error event");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn next_tunnel_event(
    events: &mut mpsc::UnboundedReceiver<TunnelEvent>,
    wanted: impl Fn(&TunnelEvent) -> bool,
) -> TunnelEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(3), events.recv())
            .await
            .expect("timed out waiting for tunnel event")
            .expect("tunnel event stream closed");
        if wanted(&event) {
            return event;
        }
    }
}

fn profile_config(name: &str) -> dvpn_tunnel::TunnelConfiguration {
    TunnelConfigBuilder::new(name)
        .build(&material(), &PrivateKey::from_bytes([8u8; 32]), "1.1.1.1")
        .unwrap()
}

#[tokio::test]
async fn single_tunnel_in_operation() {
    let provider = Arc::new(MemoryProvider::new());
    let (service, _events) = TunnelsService::create(provider.clone(), Duration::from_millis(20))
        .await
        .unwrap();

    let mut ids: Vec<ProfileId> = Vec::new();
    for name in ["alpha", "beta", "gamma"] {
        ids.push(service.add(profile_config(name)).await.unwrap());
    }

    let script: [(usize, bool); 8] = [
        (0, true),
        (1, true),
        (2, true),
        (2, false),
        (0, true),
        (0, true),
        (1, true),
        (1, false),
    ];

    for (index, activate) in script {
        if activate {
            let _ = service.activate(ids[index]).await;
        } else {
            let _ = service.deactivate(ids[index]).await;
        }

        for _ in 0..10 {
            let operating = service
                .tunnels()
                .await
                .iter()
                .filter(|t| t.status.is_operating())
                .count();
            assert!(operating <= 1, "{} tunnels in operation", operating);
            tokio::time::sleep(Duration::from_millis(3)).await;
        }
    }
}

#[tokio::test]
async fn back_to_back_activations_leave_nothing_waiting() {
    let provider = Arc::new(MemoryProvider::manual());
    let (service, mut events) = TunnelsService::create(provider.clone(), Duration::from_millis(20))
        .await
        .unwrap();
    let mut ids: Vec<ProfileId> = Vec::new();
    for name in ["alpha", "beta", "gamma"] {
        ids.push(service.add(profile_config(name)).await.unwrap());
    }

    for &id in &ids {
        service.activate(id).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let tunnels = service.tunnels().await;
    assert!(
        tunnels.iter().all(|t| t.status != TunnelStatus::Waiting),
        "left waiting: {:?}",
        tunnels.iter().map(|t| (t.name.clone(), t.status)).collect::<Vec<_>>()
    );
    assert_eq!(tunnels.iter().filter(|t| t.status.is_operating()).count(), 1);

    let last = ids[2];
    let (started, attempt) = provider.start_attempts().last().cloned().unwrap();
    assert_eq!(started, last);
    provider.set_os_status(last, OsStatus::Connected, Some(attempt));

    next_tunnel_event(&mut events, |e| *e == TunnelEvent::ActivationSucceeded { id: last }).await;
    assert_eq!(service.status(last).await, Some(TunnelStatus::Connected));
    assert_eq!(service.status(ids[0]).await, Some(TunnelStatus::Disconnected));
    assert_eq!(service.status(ids[1]).await, Some(TunnelStatus::Disconnected));
}

#[tokio::test]
async fn activation_gives_up_after_eight_attempts() {
    let provider = Arc::new(MemoryProvider::new());
    let (service, _events) = TunnelsService::create(provider.clone(), Duration::from_millis(20))
        .await
        .unwrap();
    let id = service.add(profile_config("stale")).await.unwrap();
    for _ in 0..12 {
        provider.push_start_result(Err(ProviderError::ConfigurationStale));
    }

    let result = service.activate(id).await;

    assert_eq!(
        result,
        Err(ActivationError::RetryLimitReached {
            last: Some(ProviderError::ConfigurationStale)
        })
    );
    assert_eq!(provider.start_attempts().len(), 8);
    assert_eq!(service.status(id).await, Some(TunnelStatus::Disconnected));
}

#[tokio::test]
async fn activation_succeeds_on_third_attempt() {
    let provider = Arc::new(MemoryProvider::new());
    let (service, mut events) = TunnelsService::create(provider.clone(), Duration::from_millis(20))
        .await
        .unwrap();
    let id = service.add(profile_config("flaky")).await.unwrap();
    provider.push_start_result(Err(ProviderError::ConfigurationStale));
    provider.push_start_result(Err(ProviderError::ConfigurationStale));

    service.activate(id).await.unwrap();
    next_tunnel_event(&mut events, |e| matches!(e, TunnelEvent::ActivationSucceeded { .. })).await;

    assert_eq!(provider.start_attempts().len(), 3);
    assert_eq!(service.status(id).await, Some(TunnelStatus::Connected));
}

#[test]
fn session_material_layout_is_preserved() {
    let mut seed: u32 = 0x2545_f491;
    for _ in 0..16 {
        let blob: Vec<u8> = (0..SESSION_MATERIAL_LEN)
            .map(|_| {
                seed ^= seed << 13;
                seed ^= seed >> 17;
                seed ^= seed << 5;
                seed as u8
            })
            .collect();

        let decoded = SessionMaterial::from_base64(&STANDARD.encode(&blob)).unwrap();
        assert_eq!(decoded.to_bytes().to_vec(), blob);
        assert_eq!(decoded.local_address.octets(), blob[0..4]);
        assert_eq!(decoded.remote_address.octets(), blob[20..24]);
        assert_eq!(decoded.remote_port, u16::from_be_bytes([blob[24], blob[25]]));
    }
}

#[tokio::test]
async fn malformed_material_is_a_parsing_failure() {
    let setup = setup(Quota::new("1000", "0")).await;
    let negotiator = dvpn_connect::SessionNegotiator::new(
        setup.ledger.clone(),
        Arc::new(MockSigner::new(WALLET)),
        setup.api.clone(),
    );

    for len in [0, 57, 59, 116] {
        setup.api.push_result(&STANDARD.encode(vec![1u8; len]));
    }
    setup.api.push_result("not*base64");

    for _ in 0..5 {
        let result = negotiator.fetch_session_material(NODE_URL, 5, WALLET, "sig").await;
        assert_eq!(result.unwrap_err(), SessionError::ConnectionParsingFailed);
    }
}

#[tokio::test]
async fn disconnect_twice_touches_nothing() {
    let setup = setup(Quota::new("1000", "0")).await;
    let before = setup.provider.mutation_count();

    assert_eq!(setup.coordinator.disconnect().await, DisconnectOutcome::AlreadyDisconnected);
    assert_eq!(setup.coordinator.disconnect().await, DisconnectOutcome::AlreadyDisconnected);
    assert_eq!(setup.provider.mutation_count(), before);
}

#[tokio::test]
async fn disconnect_after_connect_is_idempotent() {
    let setup = setup(Quota::new("1000", "0")).await;
    setup.api.push_result(&material().to_base64());
    setup.coordinator.connect(NODE).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !setup.coordinator.tunnels().is_tunnel_active().await {
        assert!(tokio::time::Instant::now() < deadline, "tunnel never came up");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(setup.coordinator.disconnect().await, DisconnectOutcome::Deactivating);
    let after_first = setup.provider.mutation_count();
    assert_eq!(setup.coordinator.disconnect().await, DisconnectOutcome::AlreadyDisconnected);
    assert_eq!(setup.provider.mutation_count(), after_first);
}

#[tokio::test]
async fn connect_without_subscription() {
    let setup = setup(Quota::new("1000", "0")).await;

    assert_eq!(setup.coordinator.connect("sentnode1other").await, ConnectOutcome::Accepted);
    assert_eq!(next_error(&setup.events).await, ConnectionError::NoSubscription);

    assert!(setup.api.calls().is_empty());
    assert_eq!(setup.ledger.calls(MockLedger::START_SESSION), 0);
    assert_eq!(setup.provider.mutation_count(), 0);
    assert!(setup.coordinator.tunnels().last_tunnel().await.is_none());
}

#[tokio::test]
async fn connect_with_exhausted_quota() {
    let setup = setup(Quota::new("1000", "1000")).await;

    setup.coordinator.connect(NODE).await;
    let error = next_error(&setup.events).await;

    assert_eq!(error, ConnectionError::NoQuotaLeft);
    assert!(error.needs_plan());
    assert!(setup.provider.start_attempts().is_empty());
    assert_eq!(setup.ledger.calls(MockLedger::START_SESSION), 0);
}

#[tokio::test]
async fn connect_with_short_session_blob() {
    let setup = setup(Quota::new("1000", "0")).await;
    setup.api.push_result(&STANDARD.encode([0u8; 57]));

    setup.coordinator.connect(NODE).await;

    assert_eq!(
        next_error(&setup.events).await,
        ConnectionError::Session(SessionError::ConnectionParsingFailed)
    );
    assert_eq!(setup.provider.profile_count(), 0);
    assert_eq!(setup.provider.save_count(), 0);
}

#[tokio::test]
async fn connect_without_wallet_sender() {
    let provider = Arc::new(MemoryProvider::new());
    let (tunnels, tunnel_events) = TunnelManager::create(
        provider.clone(),
        TunnelConfigBuilder::default(),
        Duration::from_millis(20),
    )
    .await
    .unwrap();
    let ledger = Arc::new(MockLedger::new());
    ledger.add_node(NODE, NODE_URL);
    ledger.add_subscription(
        Subscription {
            id: 1,
            node: NODE.into(),
            owner: WALLET.into(),
            is_active: true,
        },
        Quota::new("10", "0"),
    );
    let store = Arc::new(MemoryStore::new());

    let (coordinator, events) = ConnectionCoordinator::new(
        Collaborators {
            ledger: ledger.clone(),
            nodes: ledger.clone(),
            node_api: Arc::new(MockNodeApi::new()),
            signer: Arc::new(MockSigner::new(WALLET).without_sender()),
            dns: store.clone(),
            connect_info: store,
        },
        tunnels,
        tunnel_events,
        CoordinatorConfig::default(),
    );

    coordinator.connect(NODE).await;
    assert_eq!(
        next_error(&events).await,
        ConnectionError::Session(SessionError::MissingSigner)
    );
    assert_eq!(ledger.calls(MockLedger::START_SESSION), 0);
}
