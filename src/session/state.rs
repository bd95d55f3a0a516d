use crate::protocol::SCRAMBLE_SIZE;

/// Protocol phase of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Allocated,
    HandshakeSent,
    AuthReceived,
    AuthFailed,
    Idle,
    Routing,
    WaitingResult,
    Disconnected,
}

/// Per-connection state owned by the protocol handler.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub phase: Phase,
    /// Authenticated username
    pub username: String,
    /// Current default schema
    pub database: Option<String>,
    /// Capabilities from the client's handshake response
    pub capability_flags: u32,
    /// Character set from the client's handshake response
    pub character_set: u8,
    /// Challenge sent in the initial handshake
    pub scramble: [u8; SCRAMBLE_SIZE],
    /// `SHA1(password)` recovered during authentication; None for
    /// password-less accounts. The only credential forwarded to backends.
    pub stage1: Option<[u8; 20]>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            phase: Phase::Allocated,
            username: String::new(),
            database: None,
            capability_flags: 0,
            character_set: 0,
            scramble: [0u8; SCRAMBLE_SIZE],
            stage1: None,
        }
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update state after parsing the handshake response.
    pub fn set_from_handshake(
        &mut self,
        username: String,
        database: Option<String>,
        capabilities: u32,
        charset: u8,
    ) {
        self.username = username;
        self.database = database;
        self.capability_flags = capabilities;
        self.character_set = charset;
    }

    /// The default schema changed (successful COM_INIT_DB).
    pub fn change_database(&mut self, database: String) {
        self.database = Some(database);
    }
}
