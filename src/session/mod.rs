mod state;

pub use state::{Phase, SessionState};

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::backend::BackendAuth;
use crate::metrics::metrics;
use crate::protocol::{
    classify, gen_scramble, verify_native_password, ClientCommand, Command, Dispatch, ErrPacket,
    HandshakeResponse, InitialHandshake, OkPacket, Packet, PacketCodec, QueryClassifier,
    SCRAMBLE_SIZE,
};
use crate::router::{BroadcastStatus, Router, RouterError, RouteStatus, RoutingSession};
use crate::sescmd::{
    Properties, ReplyType, Semantics, SescmdError, SessionCommandList,
};
use crate::users::{Credential, UserRepository};

/// Outcome of verifying a client's credentials.
enum AuthVerdict {
    Granted { stage1: Option<[u8; 20]> },
    Denied,
}

/// Handle a single client connection: handshake, authentication, then the
/// command loop that journals session commands and routes queries.
pub struct Session {
    /// Unique session ID for logging
    pub id: u32,
    /// Connection id reported in the handshake (pid ^ fd on unix)
    conn_id: u32,
    /// Session state
    pub state: SessionState,
    router: Arc<Router>,
    repository: Arc<dyn UserRepository>,
    classifier: Option<Arc<dyn QueryClassifier>>,
    semantics: Semantics,
    properties: Properties,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u32,
        conn_id: u32,
        router: Arc<Router>,
        repository: Arc<dyn UserRepository>,
        classifier: Option<Arc<dyn QueryClassifier>>,
        semantics: Semantics,
        properties: Properties,
    ) -> Self {
        Self {
            id,
            conn_id,
            state: SessionState::new(),
            router,
            repository,
            classifier,
            semantics,
            properties,
        }
    }

    /// Run the session over the accepted client stream.
    pub async fn run<C>(mut self, client_stream: C) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let mut client = Framed::new(client_stream, PacketCodec::default());

        // Handshake: challenge the client with a fresh scramble.
        let scramble = gen_scramble();
        self.state.scramble = scramble;
        client
            .send(InitialHandshake::new(self.conn_id, scramble).encode())
            .await?;
        self.state.phase = Phase::HandshakeSent;

        let response_packet = client
            .next()
            .await
            .ok_or(SessionError::ClientDisconnected)??;

        let response = HandshakeResponse::parse(&response_packet.payload)
            .ok_or_else(|| SessionError::Protocol("malformed handshake response".into()))?;

        debug!(
            session_id = self.id,
            username = %response.username,
            database = ?response.database,
            "Received handshake response"
        );

        self.state.set_from_handshake(
            response.username.clone(),
            response.database.clone(),
            response.capability_flags,
            response.character_set,
        );

        let stage1 = match self.authenticate(&response, &scramble) {
            AuthVerdict::Granted { stage1 } => stage1,
            AuthVerdict::Denied => {
                self.state.phase = Phase::AuthFailed;
                metrics().record_auth_failure();
                warn!(
                    session_id = self.id,
                    username = %response.username,
                    "Authentication failed"
                );
                client
                    .send(
                        ErrPacket::access_denied().encode(2, self.state.capability_flags),
                    )
                    .await?;
                self.state.phase = Phase::Disconnected;
                return Err(SessionError::AuthFailed(response.username));
            }
        };
        self.state.phase = Phase::AuthReceived;
        self.state.stage1 = stage1;

        // Allocate the routing session before acknowledging the client.
        let scl = Arc::new(SessionCommandList::new(self.semantics, self.properties));
        let auth = BackendAuth {
            username: self.state.username.clone(),
            stage1: self.state.stage1,
            database: self.state.database.clone(),
        };
        let mut routing = self.router.establish(&auth, scl).await;

        client
            .send(OkPacket::new().encode(2, self.state.capability_flags))
            .await?;
        self.state.phase = Phase::Idle;

        info!(
            session_id = self.id,
            username = %self.state.username,
            backends = routing.live_count(),
            "Client authenticated"
        );

        let result = self.command_loop(&mut client, &mut routing).await;

        // Dropping the routing session detaches every cursor.
        drop(routing);
        result
    }

    /// Check the client's token against the stored double-SHA1 digest.
    fn authenticate(
        &self,
        response: &HandshakeResponse,
        scramble: &[u8; SCRAMBLE_SIZE],
    ) -> AuthVerdict {
        let Some(credential) = self.repository.lookup_password_sha1(&response.username) else {
            return AuthVerdict::Denied;
        };

        match credential {
            Credential::PasswordLess => {
                if response.auth_response.is_empty() {
                    AuthVerdict::Granted { stage1: None }
                } else {
                    AuthVerdict::Denied
                }
            }
            Credential::DoubleSha1(stored) => {
                if response.auth_response.is_empty() {
                    return AuthVerdict::Denied;
                }
                match verify_native_password(scramble, &response.auth_response, &stored) {
                    Some(stage1) => AuthVerdict::Granted {
                        stage1: Some(stage1),
                    },
                    None => AuthVerdict::Denied,
                }
            }
        }
    }

    /// Main command processing loop
    async fn command_loop<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        routing: &mut RoutingSession<TcpStream>,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let packet = match client.next().await {
                Some(Ok(p)) => p,
                Some(Err(e)) => {
                    self.state.phase = Phase::Disconnected;
                    warn!(session_id = self.id, error = %e, "Client read error");
                    return Err(e.into());
                }
                None => {
                    self.state.phase = Phase::Disconnected;
                    info!(session_id = self.id, "Client disconnected");
                    return Ok(());
                }
            };

            // A divergence during an earlier fan-out or replay closes the
            // connection on the next client event.
            if routing.scl().is_poisoned() {
                self.state.phase = Phase::Disconnected;
                return Err(SessionError::ReplayDivergence);
            }

            let dispatch = classify(&packet.payload, self.classifier.as_deref());
            debug!(
                session_id = self.id,
                command = ?ClientCommand::parse(&packet.payload),
                dispatch = ?dispatch,
                "Received command"
            );

            match dispatch {
                Dispatch::Quit => {
                    info!(session_id = self.id, "Client sent QUIT");
                    // Every backend sees COM_QUIT; the client gets no reply.
                    routing.quit(&packet).await;
                    self.state.phase = Phase::Disconnected;
                    return Ok(());
                }
                Dispatch::SessionCommand => {
                    self.handle_session_command(client, routing, packet).await?;
                }
                Dispatch::Route => {
                    self.handle_route(client, routing, packet).await?;
                }
            }
        }
    }

    /// Journal a session-modifying command and broadcast it to all backends.
    async fn handle_session_command<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        routing: &mut RoutingSession<TcpStream>,
        packet: Packet,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        if routing.live_count() == 0 {
            client
                .send(ErrPacket::backend_lost().encode(1, self.state.capability_flags))
                .await?;
            return Ok(());
        }

        self.state.phase = Phase::Routing;

        let cmd = match routing.scl().append(packet.payload.clone()) {
            Ok(cmd) => cmd,
            Err(SescmdError::CapacityExceeded { max_len }) => {
                warn!(
                    session_id = self.id,
                    max_len, "Session command journal full, rejecting command"
                );
                client
                    .send(
                        ErrPacket::new(1105, "HY000", "session command journal full")
                            .encode(1, self.state.capability_flags),
                    )
                    .await?;
                self.state.phase = Phase::Idle;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        metrics().record_session_command();

        self.state.phase = Phase::WaitingResult;
        let status: BroadcastStatus = routing.broadcast(client, &cmd).await?;

        if status.poisoned {
            metrics().record_divergence();
            self.state.phase = Phase::Disconnected;
            return Err(SessionError::ReplayDivergence);
        }

        if !status.replied {
            // Every backend died before a canonical reply was chosen.
            client
                .send(ErrPacket::backend_lost().encode(1, self.state.capability_flags))
                .await?;
        } else if cmd.opcode() == Command::InitDb as u8
            && cmd.reply_type() == Some(ReplyType::Ok)
        {
            let db = String::from_utf8_lossy(&packet.payload[1..]).to_string();
            self.state.change_database(db);
        }

        self.state.phase = Phase::Idle;
        Ok(())
    }

    /// Route an ordinary query to a single backend.
    async fn handle_route<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        routing: &mut RoutingSession<TcpStream>,
        packet: Packet,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        self.state.phase = Phase::Routing;
        let started = std::time::Instant::now();

        let status = routing.route_query(client, &packet).await?;
        self.state.phase = Phase::WaitingResult;

        match status {
            RouteStatus::Completed => {
                metrics().record_query(
                    packet.opcode().unwrap_or(0),
                    started.elapsed().as_secs_f64(),
                );
            }
            RouteStatus::NoBackend | RouteStatus::BackendLost => {
                client
                    .send(ErrPacket::backend_lost().encode(1, self.state.capability_flags))
                    .await?;
            }
            RouteStatus::Broken => {
                self.state.phase = Phase::Disconnected;
                return Err(SessionError::BackendDisconnected);
            }
        }

        self.state.phase = Phase::Idle;
        Ok(())
    }
}

/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("client disconnected")]
    ClientDisconnected,

    #[error("access denied for user '{0}'")]
    AuthFailed(String),

    #[error("backend disconnected")]
    BackendDisconnected,

    #[error("session poisoned by divergent backend reply")]
    ReplayDivergence,

    #[error(transparent)]
    Sescmd(#[from] SescmdError),

    #[error(transparent)]
    Router(#[from] RouterError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{build_client_token, digest_to_hex, double_sha1};
    use crate::users::StaticUserRepository;
    use crate::config::UserEntry;
    use bytes::{Buf, BytesMut};
    use tokio::io::DuplexStream;

    fn repository(entries: &[(&str, &str)]) -> Arc<StaticUserRepository> {
        let entries: Vec<UserEntry> = entries
            .iter()
            .map(|(user, pwd)| UserEntry {
                username: user.to_string(),
                password_sha1: if pwd.is_empty() {
                    String::new()
                } else {
                    digest_to_hex(&double_sha1(pwd.as_bytes()))
                },
            })
            .collect();
        Arc::new(StaticUserRepository::from_entries(&entries))
    }

    fn spawn_session(
        repo: Arc<StaticUserRepository>,
    ) -> (
        Framed<DuplexStream, PacketCodec>,
        tokio::task::JoinHandle<Result<(), SessionError>>,
    ) {
        let (client_side, server_side) = tokio::io::duplex(64 * 1024);
        let classifier: Arc<dyn QueryClassifier> = Arc::new(crate::protocol::PrefixClassifier);
        let session = Session::new(
            1,
            0x1234,
            Arc::new(Router::new(vec![])),
            repo,
            Some(classifier),
            Semantics::default(),
            Properties::default(),
        );
        let handle = tokio::spawn(session.run(server_side));
        (Framed::new(client_side, PacketCodec::default()), handle)
    }

    async fn do_handshake(
        client: &mut Framed<DuplexStream, PacketCodec>,
        username: &str,
        password: &str,
    ) -> Packet {
        let handshake_packet = client.next().await.unwrap().unwrap();
        let handshake = InitialHandshake::parse(&handshake_packet.payload).unwrap();
        assert_eq!(handshake_packet.sequence_id, 0);
        assert_eq!(handshake.protocol_version, 10);

        let response = HandshakeResponse {
            capability_flags: crate::protocol::capabilities::DEFAULT_CAPABILITIES,
            max_packet_size: 16 * 1024 * 1024,
            character_set: 0x08,
            username: username.to_string(),
            auth_response: build_client_token(&handshake.scramble, password),
            database: None,
            auth_plugin_name: crate::protocol::NATIVE_PASSWORD_PLUGIN.to_string(),
        };
        client.send(response.encode(1)).await.unwrap();

        client.next().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_auth_happy_path() {
        let (mut client, handle) = spawn_session(repository(&[("alice", "secret")]));

        let reply = do_handshake(&mut client, "alice", "secret").await;
        assert_eq!(reply.sequence_id, 2);
        assert_eq!(reply.payload[0], 0x00, "expected OK packet");

        drop(client);
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_auth_failure_unknown_user() {
        let (mut client, handle) = spawn_session(repository(&[("alice", "secret")]));

        let reply = do_handshake(&mut client, "mallory", "whatever").await;
        assert_eq!(reply.sequence_id, 2);
        let err = ErrPacket::parse(&reply.payload).expect("expected ERR packet");
        assert_eq!(err.error_code, 1045);
        assert_eq!(err.sql_state, "28000");
        assert_eq!(err.error_message, "Access denied!");

        // The session closes after the error.
        assert!(client.next().await.is_none());
        assert!(matches!(
            handle.await.unwrap(),
            Err(SessionError::AuthFailed(u)) if u == "mallory"
        ));
    }

    #[tokio::test]
    async fn test_auth_failure_wrong_password() {
        let (mut client, handle) = spawn_session(repository(&[("alice", "secret")]));

        let reply = do_handshake(&mut client, "alice", "not-secret").await;
        let err = ErrPacket::parse(&reply.payload).expect("expected ERR packet");
        assert_eq!(err.error_code, 1045);
        assert!(matches!(handle.await.unwrap(), Err(SessionError::AuthFailed(_))));
    }

    #[tokio::test]
    async fn test_password_less_account() {
        let (mut client, handle) = spawn_session(repository(&[("anon", "")]));

        let reply = do_handshake(&mut client, "anon", "").await;
        assert_eq!(reply.payload[0], 0x00, "empty token authenticates");

        drop(client);
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_quit_closes_without_reply() {
        let (mut client, handle) = spawn_session(repository(&[("alice", "secret")]));
        do_handshake(&mut client, "alice", "secret").await;

        client
            .send(Packet::new(0, &[0x01u8][..]))
            .await
            .unwrap();

        // No OK/ERR comes back; the stream just closes.
        assert!(client.next().await.is_none());
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_query_without_backends_gets_err_2003() {
        let (mut client, handle) = spawn_session(repository(&[("alice", "secret")]));
        do_handshake(&mut client, "alice", "secret").await;

        client
            .send(Packet::new(0, &b"\x03SELECT 1"[..]))
            .await
            .unwrap();

        let reply = client.next().await.unwrap().unwrap();
        let err = ErrPacket::parse(&reply.payload).expect("expected ERR packet");
        assert_eq!(err.error_code, 2003);
        assert_eq!(err.error_message, "Connection to backend lost");

        // The session stays idle: a second query is still answered.
        client
            .send(Packet::new(0, &b"\x03SELECT 2"[..]))
            .await
            .unwrap();
        let reply = client.next().await.unwrap().unwrap();
        assert!(ErrPacket::parse(&reply.payload).is_some());

        drop(client);
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_malformed_auth_packet_closes() {
        let (mut client, handle) = spawn_session(repository(&[("alice", "secret")]));

        let _handshake = client.next().await.unwrap().unwrap();
        client
            .send(Packet::new(1, &[0u8; 5][..]))
            .await
            .unwrap();

        assert!(client.next().await.is_none());
        assert!(matches!(
            handle.await.unwrap(),
            Err(SessionError::Protocol(_))
        ));
    }

    #[test]
    fn test_handshake_connection_id_layout() {
        // conn id travels little-endian at a fixed offset after the version
        // string.
        let handshake = InitialHandshake::new(0xDEADBEEF, [b'x'; SCRAMBLE_SIZE]);
        let packet = handshake.encode();
        let mut at = &packet.payload[1 + crate::protocol::SERVER_VERSION.len() + 1..];
        assert_eq!(at.get_u32_le(), 0xDEADBEEF);
    }

    #[test]
    fn test_oversize_query_reassembled() {
        // A logical payload split over two frames reaches the session whole.
        let mut codec = PacketCodec::default();
        let mut payload = vec![0x03u8];
        payload.extend(std::iter::repeat(b'a').take(crate::protocol::MAX_PACKET_SIZE + 100));
        let original = Packet::new(0, payload);

        let mut wire = BytesMut::new();
        original.encode(&mut wire);
        let mut codec_in = wire;
        let decoded = tokio_util::codec::Decoder::decode(&mut codec, &mut codec_in)
            .unwrap()
            .unwrap();
        assert_eq!(decoded.payload.len(), crate::protocol::MAX_PACKET_SIZE + 101);
    }
}
