use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, error};

use crate::protocol::{
    capabilities, is_eof_packet, is_err_packet, is_ok_packet, token_from_stage1, Command,
    ErrPacket, HandshakeResponse, InitialHandshake, Packet, PacketCodec,
};
use crate::sescmd::{BackendId, Reply};

/// Credential material used to authenticate against backends.
///
/// Only the stage-1 hash recovered during client authentication is carried;
/// the cleartext password never exists on the proxy.
#[derive(Debug, Clone)]
pub struct BackendAuth {
    pub username: String,
    pub stage1: Option<[u8; 20]>,
    pub database: Option<String>,
}

/// A framed connection to one backend MySQL server.
///
/// Generic over the stream so the replay and fan-out paths can be exercised
/// against in-memory pipes.
pub struct BackendConnection<S = TcpStream> {
    framed: Framed<S, PacketCodec>,
    id: BackendId,
    addr: String,
    capabilities: u32,
    closed: bool,
}

impl BackendConnection<TcpStream> {
    /// Connect and authenticate with the session's replayed credentials.
    pub async fn connect(
        id: BackendId,
        addr: &str,
        auth: &BackendAuth,
    ) -> Result<Self, ConnectionError> {
        debug!(addr = %addr, %id, "Connecting to backend");

        let stream = TcpStream::connect(addr).await.map_err(|e| {
            error!(addr = %addr, error = %e, "Failed to connect to backend");
            ConnectionError::Connect(e.to_string())
        })?;

        let mut framed = Framed::new(stream, PacketCodec::default());

        let handshake_packet = framed
            .next()
            .await
            .ok_or(ConnectionError::Disconnected)?
            .map_err(ConnectionError::from)?;

        let backend_handshake = InitialHandshake::parse(&handshake_packet.payload)
            .ok_or_else(|| ConnectionError::Protocol("invalid backend handshake".into()))?;

        debug!(
            addr = %addr,
            server_version = %backend_handshake.server_version,
            "Received backend handshake"
        );

        let auth_response = match &auth.stage1 {
            Some(stage1) => token_from_stage1(&backend_handshake.scramble, stage1),
            None => Vec::new(),
        };

        let mut caps = capabilities::DEFAULT_CAPABILITIES & backend_handshake.capability_flags;
        if auth.database.is_some() {
            caps |= capabilities::CLIENT_CONNECT_WITH_DB;
        }

        let response = HandshakeResponse {
            capability_flags: caps,
            max_packet_size: 16 * 1024 * 1024,
            character_set: 0x08,
            username: auth.username.clone(),
            auth_response,
            database: auth.database.clone(),
            auth_plugin_name: backend_handshake.auth_plugin_name.clone(),
        };

        framed.send(response.encode(1)).await?;

        let reply = framed
            .next()
            .await
            .ok_or(ConnectionError::Disconnected)?
            .map_err(ConnectionError::from)?;

        if is_err_packet(&reply.payload) {
            let err = ErrPacket::parse(&reply.payload)
                .unwrap_or_else(ErrPacket::access_denied);
            error!(
                addr = %addr,
                error_code = err.error_code,
                error_message = %err.error_message,
                "Backend authentication failed"
            );
            return Err(ConnectionError::Auth(err.error_message));
        }

        if !is_ok_packet(&reply.payload) {
            return Err(ConnectionError::Protocol(
                "expected OK packet from backend".into(),
            ));
        }

        debug!(addr = %addr, %id, "Backend authenticated");

        Ok(Self {
            framed,
            id,
            addr: addr.to_string(),
            capabilities: caps,
            closed: false,
        })
    }
}

impl<S> BackendConnection<S> {
    /// Wrap an already-established stream. Used when the handshake has been
    /// performed elsewhere (tests drive this with in-memory pipes).
    pub fn from_parts(id: BackendId, framed: Framed<S, PacketCodec>, capabilities: u32) -> Self {
        Self {
            framed,
            id,
            addr: String::new(),
            capabilities,
            closed: false,
        }
    }

    pub fn id(&self) -> BackendId {
        self.id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn capabilities(&self) -> u32 {
        self.capabilities
    }

    pub fn is_usable(&self) -> bool {
        !self.closed
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> BackendConnection<S> {
    /// Send a packet to the backend
    pub async fn send(&mut self, packet: Packet) -> Result<(), ConnectionError> {
        match self.framed.send(packet).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.closed = true;
                Err(ConnectionError::Io(e.to_string()))
            }
        }
    }

    /// Receive a packet from the backend
    pub async fn recv(&mut self) -> Result<Packet, ConnectionError> {
        match self.framed.next().await {
            Some(Ok(packet)) => Ok(packet),
            Some(Err(e)) => {
                self.closed = true;
                Err(ConnectionError::Io(e.to_string()))
            }
            None => {
                self.closed = true;
                Err(ConnectionError::Disconnected)
            }
        }
    }

    /// Read the complete reply to a session command.
    ///
    /// Most session commands answer with a single OK or ERR packet. A
    /// successful COM_STMT_PREPARE answers with a head packet followed by
    /// parameter and column definitions; those are read to completion so the
    /// connection never desynchronizes, and the reply is classified by its
    /// head packet either way.
    pub async fn read_command_reply(&mut self, opcode: u8) -> Result<Reply, ConnectionError> {
        let first = self.recv().await?;
        let head = first.payload.clone();
        let mut packets = vec![first];

        if is_err_packet(&head) || is_eof_packet(&head, self.capabilities) {
            return Ok(Reply::new(packets));
        }

        if Command::from(opcode) == Command::StmtPrepare && is_ok_packet(&head) {
            // COM_STMT_PREPARE_OK: stmt id, then column and parameter counts.
            if head.len() >= 9 {
                let num_columns = u16::from_le_bytes([head[5], head[6]]) as usize;
                let num_params = u16::from_le_bytes([head[7], head[8]]) as usize;
                let deprecate_eof =
                    self.capabilities & capabilities::CLIENT_DEPRECATE_EOF != 0;

                for count in [num_params, num_columns] {
                    if count > 0 {
                        for _ in 0..count {
                            packets.push(self.recv().await?);
                        }
                        if !deprecate_eof {
                            packets.push(self.recv().await?);
                        }
                    }
                }
            }
            return Ok(Reply::new(packets));
        }

        if is_ok_packet(&head) {
            return Ok(Reply::new(packets));
        }

        // Unexpected result set: drain it so the stream stays framed.
        loop {
            let packet = self.recv().await?;
            let is_end = is_ok_packet(&packet.payload)
                || is_err_packet(&packet.payload)
                || is_eof_packet(&packet.payload, self.capabilities);
            packets.push(packet);
            if is_end {
                break;
            }
        }
        if self.capabilities & capabilities::CLIENT_DEPRECATE_EOF == 0 {
            loop {
                let packet = self.recv().await?;
                let is_end = is_ok_packet(&packet.payload)
                    || is_err_packet(&packet.payload)
                    || is_eof_packet(&packet.payload, self.capabilities);
                packets.push(packet);
                if is_end {
                    break;
                }
            }
        }

        Ok(Reply::new(packets))
    }
}

/// Connection errors
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("connection disconnected")]
    Disconnected,
}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e.to_string())
    }
}
