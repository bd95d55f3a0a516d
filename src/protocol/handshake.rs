use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::packet::{capabilities::*, get_lenc_int, put_lenc_int, put_u16_le, put_u32_le, Packet};

/// Version string reported to clients in the initial handshake.
pub const SERVER_VERSION: &str = "8.0.0-hydra-proxy";

/// Length of the scramble challenge.
pub const SCRAMBLE_SIZE: usize = 20;

/// Authentication plugin the proxy speaks.
pub const NATIVE_PASSWORD_PLUGIN: &str = "mysql_native_password";

/// MySQL initial handshake packet (server -> client)
#[derive(Debug, Clone)]
pub struct InitialHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub capability_flags: u32,
    pub character_set: u8,
    pub status_flags: u16,
    pub scramble: [u8; SCRAMBLE_SIZE],
    pub auth_plugin_name: String,
}

impl InitialHandshake {
    /// Create the handshake the proxy sends for a new client connection.
    pub fn new(connection_id: u32, scramble: [u8; SCRAMBLE_SIZE]) -> Self {
        Self {
            protocol_version: 10,
            server_version: SERVER_VERSION.to_string(),
            connection_id,
            capability_flags: DEFAULT_CAPABILITIES,
            character_set: 0x08, // latin1_swedish_ci, as the reference server defaults
            status_flags: 0x0002, // SERVER_STATUS_AUTOCOMMIT
            scramble,
            auth_plugin_name: NATIVE_PASSWORD_PLUGIN.to_string(),
        }
    }

    /// Encode to packet, sequence 0.
    pub fn encode(&self) -> Packet {
        let mut buf = BytesMut::new();

        buf.put_u8(self.protocol_version);

        buf.extend_from_slice(self.server_version.as_bytes());
        buf.put_u8(0);

        put_u32_le(&mut buf, self.connection_id);

        // First 8 bytes of the scramble, then a filler byte.
        buf.extend_from_slice(&self.scramble[..8]);
        buf.put_u8(0);

        put_u16_le(&mut buf, (self.capability_flags & 0xFFFF) as u16);
        buf.put_u8(self.character_set);
        put_u16_le(&mut buf, self.status_flags);
        put_u16_le(&mut buf, ((self.capability_flags >> 16) & 0xFFFF) as u16);

        // Scramble length: 20 bytes of challenge + terminating NUL.
        buf.put_u8((SCRAMBLE_SIZE + 1) as u8);

        buf.extend_from_slice(&[0u8; 10]);

        // Remaining 12 bytes of the scramble, NUL terminated.
        buf.extend_from_slice(&self.scramble[8..]);
        buf.put_u8(0);

        buf.extend_from_slice(self.auth_plugin_name.as_bytes());
        buf.put_u8(0);

        Packet::new(0, buf.freeze())
    }

    /// Parse a handshake received from a backend server.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut buf = payload;

        if buf.len() < 2 {
            return None;
        }
        let protocol_version = buf.get_u8();

        let null_pos = buf.iter().position(|&b| b == 0)?;
        let server_version = String::from_utf8_lossy(&buf[..null_pos]).to_string();
        buf.advance(null_pos + 1);

        if buf.len() < 4 + 8 + 1 + 2 + 1 + 2 + 2 + 1 + 10 {
            return None;
        }
        let connection_id = buf.get_u32_le();

        let mut scramble = [0u8; SCRAMBLE_SIZE];
        scramble[..8].copy_from_slice(&buf[..8]);
        buf.advance(8);

        // Filler
        buf.advance(1);

        let capability_low = buf.get_u16_le() as u32;
        let character_set = buf.get_u8();
        let status_flags = buf.get_u16_le();
        let capability_high = buf.get_u16_le() as u32;
        let capability_flags = capability_low | (capability_high << 16);

        let auth_data_len = buf.get_u8() as usize;
        buf.advance(10);

        if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            // Second scramble half: at least 12 bytes, NUL terminated.
            let len = auth_data_len.saturating_sub(8).max(13) - 1;
            if buf.len() < len {
                return None;
            }
            let take = len.min(SCRAMBLE_SIZE - 8);
            scramble[8..8 + take].copy_from_slice(&buf[..take]);
            buf.advance((len + 1).min(buf.len()));
        }

        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && !buf.is_empty() {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            String::from_utf8_lossy(&buf[..null_pos]).to_string()
        } else {
            NATIVE_PASSWORD_PLUGIN.to_string()
        };

        Some(Self {
            protocol_version,
            server_version,
            connection_id,
            capability_flags,
            character_set,
            status_flags,
            scramble,
            auth_plugin_name,
        })
    }
}

/// MySQL handshake response packet (client -> server)
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    pub capability_flags: u32,
    pub max_packet_size: u32,
    pub character_set: u8,
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub auth_plugin_name: String,
}

impl HandshakeResponse {
    /// Parse from packet payload. Every length is bounds-checked; malformed
    /// packets yield None and the connection is torn down by the caller.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        // Fixed header: capabilities, max packet, charset, 23 reserved bytes.
        if payload.len() < 32 {
            return None;
        }

        let mut buf = payload;

        let capability_flags = buf.get_u32_le();
        let max_packet_size = buf.get_u32_le();
        let character_set = buf.get_u8();
        buf.advance(23);

        let null_pos = buf.iter().position(|&b| b == 0)?;
        let username = String::from_utf8_lossy(&buf[..null_pos]).to_string();
        buf.advance(null_pos + 1);

        let auth_response = if capability_flags & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            let (len, head) = get_lenc_int(buf)?;
            let len = len as usize;
            if buf.len() < head + len {
                return None;
            }
            let data = buf[head..head + len].to_vec();
            buf.advance(head + len);
            data
        } else if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            if buf.is_empty() {
                return None;
            }
            let len = buf.get_u8() as usize;
            if buf.len() < len {
                return None;
            }
            let data = buf[..len].to_vec();
            buf.advance(len);
            data
        } else {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            let data = buf[..null_pos].to_vec();
            buf.advance((null_pos + 1).min(buf.len()));
            data
        };

        let database = if capability_flags & CLIENT_CONNECT_WITH_DB != 0 && !buf.is_empty() {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            let db = String::from_utf8_lossy(&buf[..null_pos]).to_string();
            buf.advance((null_pos + 1).min(buf.len()));
            if db.is_empty() {
                None
            } else {
                Some(db)
            }
        } else {
            None
        };

        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && !buf.is_empty() {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            String::from_utf8_lossy(&buf[..null_pos]).to_string()
        } else {
            NATIVE_PASSWORD_PLUGIN.to_string()
        };

        Some(Self {
            capability_flags,
            max_packet_size,
            character_set,
            username,
            auth_response,
            database,
            auth_plugin_name,
        })
    }

    /// Encode to packet (used when authenticating against a backend).
    pub fn encode(&self, sequence_id: u8) -> Packet {
        let mut buf = BytesMut::new();

        put_u32_le(&mut buf, self.capability_flags);
        put_u32_le(&mut buf, self.max_packet_size);
        buf.put_u8(self.character_set);
        buf.extend_from_slice(&[0u8; 23]);

        buf.extend_from_slice(self.username.as_bytes());
        buf.put_u8(0);

        if self.capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            buf.put_u8(self.auth_response.len() as u8);
            buf.extend_from_slice(&self.auth_response);
        } else {
            buf.extend_from_slice(&self.auth_response);
            buf.put_u8(0);
        }

        if self.capability_flags & CLIENT_CONNECT_WITH_DB != 0 {
            if let Some(ref db) = self.database {
                buf.extend_from_slice(db.as_bytes());
            }
            buf.put_u8(0);
        }

        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            buf.extend_from_slice(self.auth_plugin_name.as_bytes());
            buf.put_u8(0);
        }

        Packet::new(sequence_id, buf.freeze())
    }
}

/// OK packet
#[derive(Debug, Clone)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    pub message: Option<String>,
}

impl OkPacket {
    pub fn new() -> Self {
        Self {
            affected_rows: 0,
            last_insert_id: 0,
            status_flags: 0x0002, // SERVER_STATUS_AUTOCOMMIT
            warnings: 0,
            message: None,
        }
    }

    pub fn encode(&self, sequence_id: u8, capabilities: u32) -> Packet {
        let mut buf = BytesMut::new();

        buf.put_u8(0x00);
        put_lenc_int(&mut buf, self.affected_rows);
        put_lenc_int(&mut buf, self.last_insert_id);

        if capabilities & CLIENT_PROTOCOL_41 != 0 {
            put_u16_le(&mut buf, self.status_flags);
            put_u16_le(&mut buf, self.warnings);
        }

        if let Some(ref msg) = self.message {
            buf.extend_from_slice(msg.as_bytes());
        }

        Packet::new(sequence_id, buf.freeze())
    }
}

impl Default for OkPacket {
    fn default() -> Self {
        Self::new()
    }
}

/// ERR packet
#[derive(Debug, Clone)]
pub struct ErrPacket {
    pub error_code: u16,
    pub sql_state: String,
    pub error_message: String,
}

impl ErrPacket {
    pub fn new(error_code: u16, sql_state: &str, error_message: &str) -> Self {
        Self {
            error_code,
            sql_state: sql_state.to_string(),
            error_message: error_message.to_string(),
        }
    }

    /// ERR 1045: client credentials rejected.
    pub fn access_denied() -> Self {
        Self::new(1045, "28000", "Access denied!")
    }

    /// ERR 2003: no backend available to serve the session.
    pub fn backend_lost() -> Self {
        Self::new(2003, "HY000", "Connection to backend lost")
    }

    pub fn encode(&self, sequence_id: u8, capabilities: u32) -> Packet {
        let mut buf = BytesMut::new();

        buf.put_u8(0xFF);
        put_u16_le(&mut buf, self.error_code);

        if capabilities & CLIENT_PROTOCOL_41 != 0 {
            buf.put_u8(b'#');
            buf.extend_from_slice(self.sql_state.as_bytes());
        }

        buf.extend_from_slice(self.error_message.as_bytes());

        Packet::new(sequence_id, buf.freeze())
    }

    /// Parse from packet payload
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.first() != Some(&0xFF) {
            return None;
        }

        let mut buf = &payload[1..];
        if buf.len() < 2 {
            return None;
        }

        let error_code = buf.get_u16_le();

        let (sql_state, error_message) = if buf.first() == Some(&b'#') && buf.len() >= 6 {
            let sql_state = String::from_utf8_lossy(&buf[1..6]).to_string();
            (sql_state, String::from_utf8_lossy(&buf[6..]).to_string())
        } else {
            ("HY000".to_string(), String::from_utf8_lossy(buf).to_string())
        };

        Some(Self {
            error_code,
            sql_state,
            error_message,
        })
    }
}

/// EOF packet
#[derive(Debug, Clone)]
pub struct EofPacket {
    pub warnings: u16,
    pub status_flags: u16,
}

impl EofPacket {
    pub fn encode(&self, sequence_id: u8) -> Packet {
        let mut buf = BytesMut::new();
        buf.put_u8(0xFE);
        put_u16_le(&mut buf, self.warnings);
        put_u16_le(&mut buf, self.status_flags);
        Packet::new(sequence_id, buf.freeze())
    }
}

/// Check if packet is OK packet
pub fn is_ok_packet(payload: &Bytes) -> bool {
    payload.first() == Some(&0x00)
}

/// Check if packet is ERR packet
pub fn is_err_packet(payload: &Bytes) -> bool {
    payload.first() == Some(&0xFF)
}

/// Check if packet is EOF packet
pub fn is_eof_packet(payload: &Bytes, capabilities: u32) -> bool {
    if capabilities & CLIENT_DEPRECATE_EOF != 0 {
        false
    } else {
        payload.first() == Some(&0xFE) && payload.len() < 9
    }
}
