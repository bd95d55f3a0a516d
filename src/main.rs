mod backend;
mod config;
mod metrics;
mod protocol;
mod router;
mod sescmd;
mod session;
mod users;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::signal;
use tokio::task::JoinSet;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use config::Config;
use protocol::{PrefixClassifier, QueryClassifier};
use router::Router;
use session::Session;
use users::StaticUserRepository;

/// Global connection counter for generating unique session IDs
static CONNECTION_COUNTER: AtomicU32 = AtomicU32::new(1);

/// Graceful shutdown timeout (wait for connections to close)
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Accept backlog: 10 x SOMAXCONN, as the reference gateway configures it.
const LISTEN_BACKLOG: u32 = 10 * 128;

/// Send buffer tuning for client sockets; accepted sockets inherit it from
/// the listener.
const CLIENT_SO_SNDBUF: u32 = 1024 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    // Load configuration
    let config = load_or_default_config();

    let repository = Arc::new(StaticUserRepository::from_entries(&config.users));
    info!(users = config.users.len(), "User catalog loaded");

    let endpoints: Vec<String> = config.backends.iter().map(|b| b.addr.clone()).collect();
    let router = Arc::new(Router::new(endpoints));
    info!(backends = ?router.endpoints(), "Backends configured");

    let classifier: Arc<dyn QueryClassifier> = Arc::new(PrefixClassifier);

    let addr = format!("{}:{}", config.server.listen_addr, config.server.listen_port);
    let listener = bind_listener(&addr)?;

    info!(addr = %addr, "Hydra MySQL proxy listening");

    // Start metrics server in background
    let metrics_addr = format!(
        "{}:{}",
        config.server.listen_addr,
        config.server.listen_port + 1000
    );
    info!(metrics_addr = %metrics_addr, "Metrics server starting");
    tokio::spawn(async move {
        if let Err(e) = metrics::start_metrics_server(&metrics_addr).await {
            error!(error = %e, "Metrics server failed");
        }
    });

    // Track active sessions for graceful shutdown
    let mut sessions: JoinSet<()> = JoinSet::new();

    // Main accept loop with graceful shutdown support
    loop {
        tokio::select! {
            // Handle shutdown signals
            _ = shutdown_signal() => {
                info!("Shutdown signal received, stopping accept loop");
                break;
            }

            // Accept new connections
            accept_result = listener.accept() => {
                let (stream, peer_addr) = match accept_result {
                    Ok(v) => v,
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        continue;
                    }
                };

                let session_id = CONNECTION_COUNTER.fetch_add(1, Ordering::SeqCst);
                let conn_id = connection_id(&stream, session_id);
                let router = router.clone();
                let repository = repository.clone();
                let classifier = classifier.clone();
                let semantics = config.sescmd.semantics;
                let properties = config.sescmd.properties;

                info!(session_id = session_id, peer = %peer_addr, "New connection");
                metrics::metrics().record_connection_accepted();

                sessions.spawn(async move {
                    let session = Session::new(
                        session_id,
                        conn_id,
                        router,
                        repository,
                        Some(classifier),
                        semantics,
                        properties,
                    );
                    if let Err(e) = session.run(stream).await {
                        warn!(session_id = session_id, error = %e, "Session ended with error");
                    } else {
                        info!(session_id = session_id, "Session ended");
                    }
                    metrics::metrics().record_connection_closed();
                });
            }
        }
    }

    // Graceful shutdown: wait for active sessions to complete
    let active_count = sessions.len();
    if active_count > 0 {
        info!(
            active_sessions = active_count,
            timeout_secs = GRACEFUL_SHUTDOWN_TIMEOUT.as_secs(),
            "Waiting for active sessions to complete"
        );

        let shutdown_deadline = tokio::time::Instant::now() + GRACEFUL_SHUTDOWN_TIMEOUT;

        loop {
            if sessions.is_empty() {
                info!("All sessions completed gracefully");
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep_until(shutdown_deadline) => {
                    let remaining = sessions.len();
                    warn!(
                        remaining_sessions = remaining,
                        "Graceful shutdown timeout, aborting remaining sessions"
                    );
                    sessions.abort_all();
                    break;
                }

                Some(result) = sessions.join_next() => {
                    if let Err(e) = result {
                        if !e.is_cancelled() {
                            error!(error = %e, "Session task panicked");
                        }
                    }
                }
            }
        }
    }

    info!("Hydra MySQL proxy shutdown complete");
    Ok(())
}

/// Bind the client listener with the reference gateway's socket options:
/// SO_REUSEADDR, a tuned send buffer and a deep accept backlog. Accepted
/// sockets are non-blocking by construction under tokio.
fn bind_listener(addr: &str) -> anyhow::Result<TcpListener> {
    let addr: SocketAddr = addr.parse()?;
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.set_send_buffer_size(CLIENT_SO_SNDBUF)?;
    socket.bind(addr)?;
    Ok(socket.listen(LISTEN_BACKLOG)?)
}

/// Connection id reported in the handshake: pid XOR fd, unique within the
/// process. Falls back to the session counter where fds are not a thing.
#[cfg(unix)]
fn connection_id(stream: &TcpStream, _session_id: u32) -> u32 {
    use std::os::unix::io::AsRawFd;
    std::process::id() ^ stream.as_raw_fd() as u32
}

#[cfg(not(unix))]
fn connection_id(_stream: &TcpStream, session_id: u32) -> u32 {
    session_id
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn load_or_default_config() -> Config {
    let config_paths = ["config/hydra.toml", "hydra.toml"];

    for path in config_paths {
        match config::load_config(path) {
            Ok(config) => {
                info!(path = path, "Loaded configuration");
                return config;
            }
            Err(e) => {
                warn!(path = path, error = %e, "Failed to load config");
            }
        }
    }

    info!("Using default configuration");
    Config::default()
}
