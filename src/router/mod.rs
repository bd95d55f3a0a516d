use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::stream::FuturesUnordered;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::backend::{BackendAuth, BackendConnection, ConnectionError};
use crate::metrics::metrics;
use crate::protocol::{is_eof_packet, is_err_packet, is_ok_packet, Packet, PacketCodec};
use crate::sescmd::{Attach, BackendId, SescmdError, SessionCommand, SessionCommandList};

/// Router errors
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("client IO error: {0}")]
    Client(#[from] std::io::Error),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Sescmd(#[from] SescmdError),
}

/// Result of broadcasting one session command.
#[derive(Debug, Default)]
pub struct BroadcastStatus {
    /// A canonical reply was forwarded to the client.
    pub replied: bool,
    /// A divergent reply poisoned the session.
    pub poisoned: bool,
}

/// Result of routing one ordinary query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteStatus {
    /// The full response was forwarded to the client.
    Completed,
    /// No live backend to route to; nothing was written to the client.
    NoBackend,
    /// The chosen backend failed before any response byte was forwarded;
    /// it has been detached and the session may continue.
    BackendLost,
    /// The backend failed mid-response; the client stream is no longer
    /// aligned to a packet boundary and the session must close.
    Broken,
}

const FAILURE_LOG_THRESHOLD: u32 = 3;

#[derive(Debug, Default)]
struct EndpointHealth {
    consecutive_failures: u32,
}

/// Process-wide backend selection state: the configured endpoints and their
/// connect-health bookkeeping. Per-session fan-out lives in
/// [`RoutingSession`].
pub struct Router {
    endpoints: Vec<String>,
    next_backend_id: AtomicU64,
    health: DashMap<String, EndpointHealth>,
}

impl Router {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            endpoints,
            next_backend_id: AtomicU64::new(0),
            health: DashMap::new(),
        }
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    fn next_backend_id(&self) -> BackendId {
        BackendId(self.next_backend_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn record_success(&self, addr: &str) {
        self.health.entry(addr.to_string()).or_default().consecutive_failures = 0;
    }

    fn record_failure(&self, addr: &str) {
        let mut entry = self.health.entry(addr.to_string()).or_default();
        entry.consecutive_failures += 1;
        if entry.consecutive_failures >= FAILURE_LOG_THRESHOLD {
            warn!(
                addr = %addr,
                consecutive_failures = entry.consecutive_failures,
                "Backend endpoint keeps failing"
            );
        }
    }

    /// Connect every configured endpoint and attach it to the session's
    /// command list. Endpoints that fail to connect are skipped; a session
    /// with zero backends is valid and answers queries with ERR 2003 until
    /// it is closed.
    pub async fn establish(
        &self,
        auth: &BackendAuth,
        scl: Arc<SessionCommandList>,
    ) -> RoutingSession<TcpStream> {
        let mut session = RoutingSession::new(scl);

        for addr in &self.endpoints {
            let id = self.next_backend_id();
            match BackendConnection::connect(id, addr, auth).await {
                Ok(conn) => {
                    self.record_success(addr);
                    if let Err(e) = session.attach(conn).await {
                        warn!(addr = %addr, %id, error = %e, "Backend attach failed");
                    }
                }
                Err(e) => {
                    self.record_failure(addr);
                    warn!(addr = %addr, error = %e, "Backend connect failed");
                }
            }
        }

        info!(
            backends = session.live_count(),
            configured = self.endpoints.len(),
            "Routing session established"
        );
        session
    }
}

/// The per-client fan-out to backends.
///
/// Ordinary queries go to one backend, chosen round-robin; session commands
/// are journaled and broadcast to all. Attaching replays the journal before
/// the backend joins the live pool.
pub struct RoutingSession<S = TcpStream> {
    backends: Vec<BackendConnection<S>>,
    scl: Arc<SessionCommandList>,
    next_rr: usize,
}

impl<S: AsyncRead + AsyncWrite + Unpin> RoutingSession<S> {
    pub fn new(scl: Arc<SessionCommandList>) -> Self {
        Self {
            backends: Vec::new(),
            scl,
            next_rr: 0,
        }
    }

    pub fn scl(&self) -> &Arc<SessionCommandList> {
        &self.scl
    }

    /// Backends currently eligible for live dispatch.
    pub fn live_count(&self) -> usize {
        self.backends.len()
    }

    /// Attach a connected backend: create its cursor and replay the journal
    /// before it joins the live pool.
    pub async fn attach(&mut self, mut conn: BackendConnection<S>) -> Result<(), RouterError> {
        let id = conn.id();

        match self.scl.attach(id) {
            Attach::AlreadyAttached => {
                warn!(%id, "Backend already attached");
                return Ok(());
            }
            Attach::Live => {}
            Attach::Replaying => {
                if let Err(e) = self.replay(&mut conn).await {
                    self.scl.detach(id);
                    return Err(e);
                }
                debug!(%id, "Backend replay complete");
            }
        }

        self.backends.push(conn);
        metrics().record_backend_attached();
        Ok(())
    }

    /// Drive a newly attached cursor through the journal. Replies are
    /// accounted but never forwarded: they only resynchronize the backend.
    async fn replay(&self, conn: &mut BackendConnection<S>) -> Result<(), RouterError> {
        let id = conn.id();

        while let Some(cmd) = self.scl.current_command(id)? {
            debug!(%id, command_id = cmd.id(), "Replaying session command");
            conn.send(Packet::new(0, cmd.payload().clone())).await?;
            let reply = conn.read_command_reply(cmd.opcode()).await?;
            self.scl.advance(id, reply)?;
            metrics().record_command_replay();
        }

        Ok(())
    }

    /// Detach a backend from the command list and drop its connection.
    pub fn detach(&mut self, id: BackendId) {
        self.scl.detach(id);
        let before = self.backends.len();
        self.backends.retain(|conn| conn.id() != id);
        if self.backends.len() < before {
            metrics().record_backend_detached();
        }
    }

    /// Forward COM_QUIT to every backend. No replies are expected and the
    /// client gets none.
    pub async fn quit(&mut self, packet: &Packet) {
        for conn in &mut self.backends {
            if let Err(e) = conn.send(Packet::new(0, packet.payload.clone())).await {
                debug!(id = %conn.id(), error = %e, "Backend quit delivery failed");
            }
        }
    }

    /// Broadcast a journaled command to every live backend, reconcile the
    /// replies through the command list and forward the canonical reply to
    /// the client the moment the semantics allow it.
    pub async fn broadcast<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        cmd: &Arc<SessionCommand>,
    ) -> Result<BroadcastStatus, RouterError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        // Send phase: a backend that fails here is detached before the
        // fan-in so its reply is never waited for.
        let mut dead = Vec::new();
        for conn in &mut self.backends {
            self.scl.current_command(conn.id())?;
            if let Err(e) = conn.send(Packet::new(0, cmd.payload().clone())).await {
                warn!(id = %conn.id(), error = %e, "Backend send failed, detaching");
                dead.push(conn.id());
            }
        }
        for id in dead {
            self.detach(id);
        }

        let mut status = BroadcastStatus::default();

        // Fan-in: replies are accounted in arrival order; the canonical one
        // is forwarded as soon as the semantics select it, while the rest
        // keep draining.
        {
            let opcode = cmd.opcode();
            let scl = &self.scl;
            let mut replies: FuturesUnordered<_> = self
                .backends
                .iter_mut()
                .map(|conn| {
                    let id = conn.id();
                    async move { (id, conn.read_command_reply(opcode).await) }
                })
                .collect();

            let mut dead = Vec::new();
            while let Some((id, result)) = replies.next().await {
                match result {
                    Ok(reply) => {
                        let outcome = scl.advance(id, reply)?;
                        if let Some(canonical) = outcome.forward {
                            for packet in canonical.packets {
                                client.send(packet).await?;
                            }
                            status.replied = true;
                        }
                        if outcome.poisoned {
                            status.poisoned = true;
                        }
                    }
                    Err(e) => {
                        warn!(%id, error = %e, "Backend reply failed, detaching");
                        dead.push(id);
                    }
                }
            }
            drop(replies);

            for id in dead {
                self.detach(id);
            }
        }

        // A detach may have been what settled the canonical reply.
        if !status.replied {
            if let Some(canonical) = cmd.canonical_reply() {
                for packet in canonical.packets {
                    client.send(packet).await?;
                }
                status.replied = true;
            }
        }

        Ok(status)
    }

    /// Route one ordinary query to a single backend and forward its full
    /// response to the client.
    pub async fn route_query<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        packet: &Packet,
    ) -> Result<RouteStatus, RouterError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        if self.backends.is_empty() {
            return Ok(RouteStatus::NoBackend);
        }

        let idx = self.next_rr % self.backends.len();
        self.next_rr = self.next_rr.wrapping_add(1);
        let id = self.backends[idx].id();

        if let Err(e) = self.backends[idx]
            .send(Packet::new(0, packet.payload.clone()))
            .await
        {
            warn!(%id, error = %e, "Backend send failed, detaching");
            self.detach(id);
            return Ok(RouteStatus::BackendLost);
        }

        match Self::forward_response(&mut self.backends[idx], client).await {
            Ok(()) => Ok(RouteStatus::Completed),
            Err(ForwardError::Client(e)) => Err(RouterError::Client(e)),
            Err(ForwardError::Backend { error, forwarded }) => {
                warn!(%id, error = %error, "Backend failed mid-query, detaching");
                self.detach(id);
                if forwarded {
                    Ok(RouteStatus::Broken)
                } else {
                    Ok(RouteStatus::BackendLost)
                }
            }
        }
    }

    /// Relay one backend response to the client: a lone OK/ERR, or a result
    /// set (column definitions, EOF, rows, EOF), honoring the backend's
    /// DEPRECATE_EOF negotiation.
    async fn forward_response<C>(
        conn: &mut BackendConnection<S>,
        client: &mut Framed<C, PacketCodec>,
    ) -> Result<(), ForwardError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let caps = conn.capabilities();
        let mut forwarded = false;
        let backend_err = |error: ConnectionError, forwarded: bool| ForwardError::Backend {
            error,
            forwarded,
        };

        let first = conn.recv().await.map_err(|e| backend_err(e, forwarded))?;

        if is_ok_packet(&first.payload) || is_err_packet(&first.payload) {
            client.send(first).await?;
            return Ok(());
        }

        // Result set: column count, definitions, EOF, then rows.
        client.send(first).await?;
        forwarded = true;

        loop {
            let packet = conn.recv().await.map_err(|e| backend_err(e, forwarded))?;
            let is_end = is_ok_packet(&packet.payload)
                || is_err_packet(&packet.payload)
                || is_eof_packet(&packet.payload, caps);
            client.send(packet).await?;
            if is_end {
                break;
            }
        }

        // Without DEPRECATE_EOF the loop above ended at the column EOF; the
        // rows and their terminator follow.
        if caps & crate::protocol::capabilities::CLIENT_DEPRECATE_EOF == 0 {
            loop {
                let packet = conn.recv().await.map_err(|e| backend_err(e, forwarded))?;
                let is_end = is_ok_packet(&packet.payload)
                    || is_err_packet(&packet.payload)
                    || is_eof_packet(&packet.payload, caps);
                client.send(packet).await?;
                if is_end {
                    break;
                }
            }
        }

        Ok(())
    }
}

impl<S> Drop for RoutingSession<S> {
    fn drop(&mut self) {
        // Cancellation detaches every cursor, which may settle commands
        // still waiting on these backends.
        for conn in &self.backends {
            self.scl.detach(conn.id());
            metrics().record_backend_detached();
        }
    }
}

enum ForwardError {
    Client(std::io::Error),
    Backend {
        error: ConnectionError,
        forwarded: bool,
    },
}

impl From<std::io::Error> for ForwardError {
    fn from(e: std::io::Error) -> Self {
        ForwardError::Client(e)
    }
}
