//! Warden server daemon.
//!
//! Runs two listeners: the node API (TLS, server SVID, optional client
//! SVIDs verified against the trust bundle) and the registration API (local
//! loopback listener, implicit admin). The `token` subcommand manages join
//! tokens out-of-band.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_rustls::TlsAcceptor;
use tonic::transport::Server;
use tracing_subscriber::EnvFilter;

use warden_core::{JoinToken, TrustDomain};
use warden_proto::node::v1::node_server::NodeServer;
use warden_proto::registration::v1::registration_server::RegistrationServer;
use warden_proto::FILE_DESCRIPTOR_SET;
use warden_server::attest::{JoinTokenAttestor, PluginRegistry};
use warden_server::ca::CaKeystore;
use warden_server::datastore::{DataStore, SqliteDataStore};
use warden_server::limits::LeakyBucketLimits;
use warden_server::metrics::TracingMetrics;
use warden_server::services::{NodeService, RegistrationService, SvidAuthorizer};
use warden_server::tls::{
    server_svid_identity, ReloadableTlsAcceptor, TlsConnection, TlsServerConfig,
};

/// Connections that do not finish the TLS handshake within this window are
/// dropped.
const TLS_HANDSHAKE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// How often the node listener re-checks the bundle for rotated roots.
const TLS_RELOAD_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

/// Warden server - workload identity control plane
#[derive(Parser)]
#[command(name = "warden-server", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Serve flags apply when no subcommand is given.
    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server (default if no command given)
    Serve(ServeArgs),

    /// Join token management
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },
}

#[derive(clap::Args)]
struct ServeArgs {
    /// Trust domain served by this server, e.g. "example.org"
    #[arg(long, default_value = "example.org")]
    trust_domain: String,

    /// Node API bind address
    #[arg(long, default_value = "0.0.0.0:8081")]
    node_addr: SocketAddr,

    /// Registration API bind address (loopback; callers are implicit admin)
    #[arg(long, default_value = "127.0.0.1:8082")]
    registration_addr: SocketAddr,

    /// Data directory (defaults to the platform data dir)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Skip persisting the CA keypair to disk
    #[arg(long)]
    ephemeral_ca: bool,
}

#[derive(Subcommand)]
enum TokenAction {
    /// Generate a join token
    Generate {
        /// Token validity duration (e.g. "10m", "1h")
        #[arg(long, default_value = "10m")]
        ttl: String,

        /// Data directory (defaults to the platform data dir)
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

fn data_dir(overridden: Option<PathBuf>) -> PathBuf {
    overridden.unwrap_or_else(|| {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("warden")
    })
}

/// Parse a duration string like "30s", "10m" or "1h" into seconds.
fn parse_duration(s: &str) -> Result<i64, String> {
    let s = s.trim();
    let (num_str, unit) = if let Some(rest) = s.strip_suffix('s') {
        (rest, 1)
    } else if let Some(rest) = s.strip_suffix('m') {
        (rest, 60)
    } else if let Some(rest) = s.strip_suffix('h') {
        (rest, 3600)
    } else {
        (s, 1)
    };

    let num: i64 = num_str
        .parse()
        .map_err(|_| format!("invalid duration: {s}"))?;
    if num <= 0 {
        return Err(format!("duration must be positive: {s}"));
    }
    Ok(num.saturating_mul(unit))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Token { action }) => cmd_token(action).await,
        Some(Commands::Serve(args)) => cmd_serve(args).await,
        None => cmd_serve(cli.serve).await,
    }
}

/// Handle token subcommands.
async fn cmd_token(action: TokenAction) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        TokenAction::Generate { ttl, data_dir: dir } => {
            let ttl_secs = parse_duration(&ttl)?;
            let dir = data_dir(dir);
            std::fs::create_dir_all(&dir)?;

            let store = SqliteDataStore::open(dir.join("warden.db")).await?;
            let token = JoinToken::generate(ttl_secs);
            store.create_join_token(token.clone()).await?;

            let expires = chrono::DateTime::from_timestamp(token.expires_at, 0)
                .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_else(|| "unknown".to_string());

            println!("Join Token Generated");
            println!("====================");
            println!();
            println!("Token:   {}", token.token);
            println!("Expires: {expires}");
            println!();
            println!("Share this token with the node out-of-band.");
            println!("The token is single-use and expires in {ttl}.");

            Ok(())
        }
    }
}

/// Start the server.
async fn cmd_serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let trust_domain = TrustDomain::new(args.trust_domain.clone())?;
    let dir = data_dir(args.data_dir);
    std::fs::create_dir_all(&dir)?;

    let db_path = dir.join("warden.db");
    tracing::info!(path = %db_path.display(), "Opening data store");
    let datastore: Arc<dyn DataStore> = Arc::new(SqliteDataStore::open(&db_path).await?);

    // Boot the CA: reuse the persisted keypair when present, otherwise
    // self-sign a fresh root for the trust domain.
    let keypair_path = (!args.ephemeral_ca).then(|| dir.join("ca.pem"));
    let ca = Arc::new(
        CaKeystore::open(trust_domain.clone(), datastore.clone(), keypair_path).await?,
    );
    if ca.fetch_certificate().is_none() {
        ca.bootstrap_self_signed().await?;
        tracing::info!(trust_domain = %trust_domain, "Self-signed CA bootstrapped");
    }

    let server_identity = Arc::new(server_svid_identity(&ca)?);
    tracing::info!(spiffe_id = %server_identity.spiffe_id, "Server identity minted");

    let mut plugins = PluginRegistry::new();
    plugins.register_attestor(Arc::new(JoinTokenAttestor::new(
        datastore.clone(),
        trust_domain.clone(),
    )));
    let plugins = Arc::new(plugins);

    let node_service = NodeService::new(
        trust_domain.clone(),
        datastore.clone(),
        ca.clone(),
        Arc::new(LeakyBucketLimits::default()),
        plugins,
        Arc::new(SvidAuthorizer::new(trust_domain.clone(), datastore.clone())),
        Arc::new(TracingMetrics),
    );
    let registration_service = RegistrationService::new(trust_domain.clone(), datastore);

    let node_reflection = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .build_v1()?;
    let registration_reflection = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .build_v1()?;

    let node_server = Server::builder()
        .add_service(node_reflection)
        .add_service(NodeServer::new(node_service));
    let registration_server = Server::builder()
        .add_service(registration_reflection)
        .add_service(RegistrationServer::new(registration_service));

    // Node API TLS: server SVID plus the bundle roots as client trust.
    let tls_config = TlsServerConfig::new_node_api(
        &server_identity,
        ca.bundle().map(|b| b.root_cas).unwrap_or_default(),
    )?;
    let acceptor = ReloadableTlsAcceptor::new(
        TlsAcceptor::from(tls_config.into_rustls_config()),
        server_identity,
    );

    let node_listener = TcpListener::bind(args.node_addr).await?;
    let registration_listener = TcpListener::bind(args.registration_addr).await?;
    tracing::info!(
        node = %args.node_addr,
        registration = %args.registration_addr,
        trust_domain = %trust_domain,
        "Warden server starting"
    );

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let mut shutdown_rx_node = shutdown_tx.subscribe();
    let mut shutdown_rx_registration = shutdown_tx.subscribe();

    let shutdown_tx_clone = shutdown_tx.clone();
    let signal_task = tokio::spawn(async move {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => tracing::info!("Received SIGINT, initiating shutdown"),
            _ = terminate => tracing::info!("Received SIGTERM, initiating shutdown"),
        }
        let _ = shutdown_tx_clone.send(());
    });

    // Node accept loop: TLS with handshake timeout, periodic bundle reload
    // so rotated roots start being accepted without a restart.
    let acceptor_for_loop = acceptor.clone();
    let ca_for_reload = ca.clone();
    let node_incoming = async_stream::stream! {
        let mut reload = tokio::time::interval(TLS_RELOAD_INTERVAL);
        reload.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;

                _ = reload.tick() => {
                    match acceptor_for_loop.reload(&ca_for_reload) {
                        Ok(roots) => tracing::debug!(roots, "Node TLS config reloaded"),
                        Err(e) => tracing::error!(error = %e, "Node TLS reload failed, keeping previous config"),
                    }
                }

                result = node_listener.accept() => {
                    match result {
                        Ok((tcp_stream, peer_addr)) => {
                            let tls = acceptor_for_loop.current().clone();
                            match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, tls.accept(tcp_stream)).await {
                                Ok(Ok(tls_stream)) => {
                                    tracing::debug!(peer = %peer_addr, "Node TLS handshake successful");
                                    yield Ok::<_, std::io::Error>(TlsConnection::new(tls_stream, Some(peer_addr)));
                                }
                                Ok(Err(e)) => {
                                    tracing::debug!(peer = %peer_addr, error = %e, "Node TLS handshake failed");
                                }
                                Err(_) => {
                                    tracing::warn!(peer = %peer_addr, "Node TLS handshake timed out");
                                }
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "Node TCP accept failed"),
                    }
                }

                _ = shutdown_rx_node.recv() => {
                    tracing::info!("Shutdown signal received, stopping node accept loop");
                    break;
                }
            }
        }
    };

    let node_handle =
        tokio::spawn(async move { node_server.serve_with_incoming(node_incoming).await });

    let registration_handle = tokio::spawn(async move {
        registration_server
            .serve_with_incoming_shutdown(
                tokio_stream::wrappers::TcpListenerStream::new(registration_listener),
                async {
                    let _ = shutdown_rx_registration.recv().await;
                },
            )
            .await
    });

    tokio::select! {
        result = node_handle => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Node server task panicked");
            }
        }
        result = registration_handle => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Registration server task panicked");
            }
        }
    }

    let _ = signal_task.await;
    tracing::info!("Server stopped, shutdown complete");
    Ok(())
}
