//! dVPN client
//!
//! Command line front end over the connection stack: inspect session
//! material, talk to a node, and walk a full connect flow against
//! in-memory collaborators.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dvpn_connect::ledger::mock::{MockLedger, MockNodeApi, MockSigner};
use dvpn_connect::{
    ClientSettings, Coin, Collaborators, ConnectionCoordinator, ConnectionEvent, MemoryStore,
    Quota, Subscription,
};
use dvpn_network::{HttpClient, HttpNodeSessionApi, NodeSessionApi, StartSessionRequest};
use dvpn_tunnel::provider::memory::MemoryProvider;
use dvpn_tunnel::{KeyPair, SessionMaterial, TunnelManager};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "dvpn-client", version, about = "dVPN connection client")]
struct Cli {
    /// Settings file (TOML, or JSON with a .json extension)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Decode base64 session material and print the WireGuard profile it yields
    Decode { material: String },
    /// Generate a WireGuard key pair
    Keygen,
    /// Print the effective settings as TOML
    Settings {
        /// Settings file to read instead of `--config`
        path: Option<PathBuf>,
    },
    /// Request session material from a node
    Session {
        /// Node remote URL
        #[arg(long)]
        url: String,
        /// Wallet address owning the session
        #[arg(long)]
        address: String,
        #[arg(long)]
        id: u64,
        /// Base64 signature over the big-endian session id
        #[arg(long)]
        signature: String,
    },
    /// Run a connect and disconnect cycle against in-memory collaborators
    Simulate {
        #[arg(long, default_value = "sentnode1demo")]
        node: String,
        /// Bytes already consumed from a 1 GB allocation
        #[arg(long, default_value_t = 0)]
        consumed: u64,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default.to_string()));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

fn load_settings(path: Option<&PathBuf>) -> Result<ClientSettings> {
    match path {
        Some(path) => ClientSettings::from_file(path)
            .with_context(|| format!("loading settings from {}", path.display())),
        None => Ok(ClientSettings::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let settings = load_settings(cli.config.as_ref())?;

    match cli.command {
        Command::Decode { material } => decode(&settings, &material),
        Command::Keygen => {
            let pair = KeyPair::generate();
            println!("PrivateKey = {}", pair.private.to_base64());
            println!("PublicKey = {}", pair.public.to_base64());
            Ok(())
        }
        Command::Settings { path } => {
            let settings = match path {
                Some(path) => load_settings(Some(&path))?,
                None => settings,
            };
            print!("{}", settings.to_toml());
            Ok(())
        }
        Command::Session { url, address, id, signature } => {
            session(&settings, &url, &address, id, &signature).await
        }
        Command::Simulate { node, consumed } => simulate(&settings, &node, consumed).await,
    }
}

fn decode(settings: &ClientSettings, material: &str) -> Result<()> {
    let material = SessionMaterial::from_base64(material).context("decoding session material")?;
    info!("Endpoint {}, local address {}", material.endpoint(), material.local_address);

    let pair = KeyPair::generate();
    let configuration = settings
        .tunnel_builder()
        .build(&material, &pair.private, settings.dns.address())
        .context("building tunnel configuration")?;
    print!("{}", configuration.to_wg_quick());
    Ok(())
}

async fn session(
    settings: &ClientSettings,
    url: &str,
    address: &str,
    id: u64,
    signature: &str,
) -> Result<()> {
    let remote_url = url::Url::parse(url).context("parsing node URL")?;
    let api = HttpNodeSessionApi::new(HttpClient::new(settings.http_config()));
    let pair = KeyPair::generate();
    let request = StartSessionRequest {
        key: pair.public.to_base64(),
        signature: signature.to_string(),
    };

    let response = api.create_client(&remote_url, address, id, &request).await?;
    let Some(result) = response.result.filter(|_| response.success) else {
        bail!("node answered without connection data");
    };

    let material = SessionMaterial::from_base64(&result).context("decoding session material")?;
    let configuration = settings
        .tunnel_builder()
        .build(&material, &pair.private, settings.dns.address())?;
    print!("{}", configuration.to_wg_quick());
    Ok(())
}

async fn simulate(settings: &ClientSettings, node: &str, consumed: u64) -> Result<()> {
    let wallet = if settings.wallet_address.is_empty() {
        "sent1demo"
    } else {
        settings.wallet_address.as_str()
    };

    let ledger = Arc::new(MockLedger::new());
    ledger.add_node(node, "http://127.0.0.1:8585");
    ledger.set_balances(vec![Coin::new(settings.fee_denom.clone(), "1000000")]);
    ledger.add_subscription(
        Subscription {
            id: 1,
            node: node.to_string(),
            owner: wallet.to_string(),
            is_active: true,
        },
        Quota::new("1000000000", consumed.to_string()),
    );

    let node_api = Arc::new(MockNodeApi::new());
    let material = SessionMaterial::new(
        Ipv4Addr::new(10, 8, 0, 2),
        Ipv4Addr::new(127, 0, 0, 1),
        51820,
        KeyPair::generate().public,
    );
    node_api.push_result(&material.to_base64());

    let store = Arc::new(MemoryStore::with_dns(settings.dns));
    let (tunnels, tunnel_events) = TunnelManager::create(
        Arc::new(MemoryProvider::new()),
        settings.tunnel_builder(),
        settings.poll_interval(),
    )
    .await?;

    let (coordinator, events) = ConnectionCoordinator::new(
        Collaborators {
            ledger: ledger.clone(),
            nodes: ledger,
            node_api,
            signer: Arc::new(MockSigner::new(wallet)),
            dns: store.clone(),
            connect_info: store,
        },
        tunnels,
        tunnel_events,
        settings.coordinator_config(),
    );

    info!("Connecting to {}: {:?}", node, coordinator.connect(node).await);
    if !drain_until_settled(&events).await {
        return Ok(());
    }

    info!("Disconnecting: {:?}", coordinator.disconnect().await);
    drain_until_settled(&events).await;
    Ok(())
}

/// Print events until the tunnel activity settles. Returns `false` on error.
async fn drain_until_settled(events: &crossbeam_channel::Receiver<ConnectionEvent>) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while tokio::time::Instant::now() < deadline {
        while let Ok(event) = events.try_recv() {
            match event {
                ConnectionEvent::Error(e) => {
                    warn!("Error [{}]: {}", e.code(), e);
                    return false;
                }
                ConnectionEvent::Warning(e) => warn!("Warning [{}]: {}", e.code(), e),
                ConnectionEvent::TunnelActivityChanged { is_active } => {
                    info!("Tunnel active: {}", is_active);
                    return true;
                }
                other => info!("{:?}", other),
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    warn!("No tunnel activity within 30s");
    false
}
