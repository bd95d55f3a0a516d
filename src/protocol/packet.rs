use bytes::{Buf, BufMut, Bytes, BytesMut};

/// MySQL packet header size: 3 bytes length + 1 byte sequence
pub const PACKET_HEADER_SIZE: usize = 4;
/// Maximum payload carried by a single wire frame (16MB - 1)
pub const MAX_PACKET_SIZE: usize = 0xFF_FF_FF;

/// MySQL wire protocol packet
///
/// A `Packet` is one logical payload. Payloads of `MAX_PACKET_SIZE` bytes or
/// more are carried as several wire frames; `encode` splits and the codec
/// reassembles, so everything above the codec sees whole payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub sequence_id: u8,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(sequence_id: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            sequence_id,
            payload: payload.into(),
        }
    }

    /// First payload byte, i.e. the command opcode for client packets.
    pub fn opcode(&self) -> Option<u8> {
        self.payload.first().copied()
    }

    /// Encode to wire frames (header + payload per frame).
    ///
    /// Payloads >= MAX_PACKET_SIZE are split into continuation frames with
    /// consecutive sequence numbers; an exact multiple of the frame size is
    /// terminated by an empty frame so the peer can detect the end.
    pub fn encode(&self, dst: &mut BytesMut) {
        let mut seq = self.sequence_id;
        let mut rest = &self.payload[..];

        loop {
            let chunk = rest.len().min(MAX_PACKET_SIZE);
            put_u24_le(dst, chunk as u32);
            dst.put_u8(seq);
            dst.extend_from_slice(&rest[..chunk]);
            rest = &rest[chunk..];
            seq = seq.wrapping_add(1);

            // A full-sized frame promises a continuation, possibly empty.
            if chunk < MAX_PACKET_SIZE {
                break;
            }
        }
    }

    /// Try to decode a single wire frame, returns None if not enough data.
    ///
    /// A frame with a full-sized payload is a continuation; the codec is
    /// responsible for stitching continuations into one `Packet`.
    pub fn decode_frame(src: &mut BytesMut) -> Option<Self> {
        if src.len() < PACKET_HEADER_SIZE {
            return None;
        }

        let len = get_u24_le(&src[..3]) as usize;

        let total_len = PACKET_HEADER_SIZE + len;
        if src.len() < total_len {
            return None;
        }

        let sequence_id = src[3];
        src.advance(PACKET_HEADER_SIZE);
        let payload = src.split_to(len).freeze();

        Some(Self {
            sequence_id,
            payload,
        })
    }
}

/// Write a 16-bit little-endian integer.
pub fn put_u16_le(buf: &mut BytesMut, v: u16) {
    buf.put_u16_le(v);
}

/// Write a 24-bit little-endian integer.
pub fn put_u24_le(buf: &mut BytesMut, v: u32) {
    buf.put_u8((v & 0xFF) as u8);
    buf.put_u8(((v >> 8) & 0xFF) as u8);
    buf.put_u8(((v >> 16) & 0xFF) as u8);
}

/// Write a 32-bit little-endian integer.
pub fn put_u32_le(buf: &mut BytesMut, v: u32) {
    buf.put_u32_le(v);
}

/// Read a 24-bit little-endian integer from the first 3 bytes.
pub fn get_u24_le(data: &[u8]) -> u32 {
    data[0] as u32 | ((data[1] as u32) << 8) | ((data[2] as u32) << 16)
}

/// Read a 32-bit little-endian integer from the first 4 bytes.
pub fn get_u32_le(data: &[u8]) -> u32 {
    u32::from_le_bytes([data[0], data[1], data[2], data[3]])
}

/// Write a length-encoded integer.
pub fn put_lenc_int(buf: &mut BytesMut, value: u64) {
    if value < 251 {
        buf.put_u8(value as u8);
    } else if value < 65536 {
        buf.put_u8(0xFC);
        buf.put_u16_le(value as u16);
    } else if value < 16777216 {
        buf.put_u8(0xFD);
        put_u24_le(buf, value as u32);
    } else {
        buf.put_u8(0xFE);
        buf.put_u64_le(value);
    }
}

/// Read a length-encoded integer; returns (value, bytes consumed).
pub fn get_lenc_int(data: &[u8]) -> Option<(u64, usize)> {
    match *data.first()? {
        v @ 0..=0xFA => Some((v as u64, 1)),
        0xFC if data.len() >= 3 => Some((u16::from_le_bytes([data[1], data[2]]) as u64, 3)),
        0xFD if data.len() >= 4 => Some((get_u24_le(&data[1..4]) as u64, 4)),
        0xFE if data.len() >= 9 => {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&data[1..9]);
            Some((u64::from_le_bytes(bytes), 9))
        }
        _ => None,
    }
}

/// Read a length-encoded byte string; returns (bytes, total consumed).
pub fn get_lenc_bytes(data: &[u8]) -> Option<(&[u8], usize)> {
    let (len, head) = get_lenc_int(data)?;
    let len = len as usize;
    if data.len() < head + len {
        return None;
    }
    Some((&data[head..head + len], head + len))
}

/// MySQL capability flags
#[allow(dead_code)]
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_FOUND_ROWS: u32 = 1 << 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_NO_SCHEMA: u32 = 1 << 4;
    pub const CLIENT_COMPRESS: u32 = 1 << 5;
    pub const CLIENT_ODBC: u32 = 1 << 6;
    pub const CLIENT_LOCAL_FILES: u32 = 1 << 7;
    pub const CLIENT_IGNORE_SPACE: u32 = 1 << 8;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_INTERACTIVE: u32 = 1 << 10;
    pub const CLIENT_SSL: u32 = 1 << 11;
    pub const CLIENT_IGNORE_SIGPIPE: u32 = 1 << 13;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 14;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_MULTI_STATEMENTS: u32 = 1 << 16;
    pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
    pub const CLIENT_PS_MULTI_RESULTS: u32 = 1 << 18;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_CONNECT_ATTRS: u32 = 1 << 20;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;

    /// Capabilities advertised in the proxy handshake.
    ///
    /// CLIENT_SSL and CLIENT_COMPRESS are intentionally NOT included: the
    /// proxy speaks neither, and advertising them would make clients attempt
    /// an upgrade the backend fan-out cannot carry.
    ///
    /// CLIENT_DEPRECATE_EOF is NOT included either, so result sets keep
    /// their EOF delimiters and can be relayed without rewriting.
    pub const DEFAULT_CAPABILITIES: u32 = CLIENT_LONG_PASSWORD
        | CLIENT_FOUND_ROWS
        | CLIENT_LONG_FLAG
        | CLIENT_CONNECT_WITH_DB
        | CLIENT_PROTOCOL_41
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_MULTI_RESULTS
        | CLIENT_PLUGIN_AUTH;
}

/// MySQL command opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Sleep = 0x00,
    Quit = 0x01,
    InitDb = 0x02,
    Query = 0x03,
    FieldList = 0x04,
    CreateDb = 0x05,
    DropDb = 0x06,
    Refresh = 0x07,
    Shutdown = 0x08,
    Statistics = 0x09,
    ProcessInfo = 0x0a,
    Connect = 0x0b,
    ProcessKill = 0x0c,
    Debug = 0x0d,
    Ping = 0x0e,
    Time = 0x0f,
    DelayedInsert = 0x10,
    ChangeUser = 0x11,
    BinlogDump = 0x12,
    TableDump = 0x13,
    ConnectOut = 0x14,
    RegisterSlave = 0x15,
    StmtPrepare = 0x16,
    StmtExecute = 0x17,
    StmtSendLongData = 0x18,
    StmtClose = 0x19,
    StmtReset = 0x1a,
    SetOption = 0x1b,
    StmtFetch = 0x1c,
    Daemon = 0x1d,
    BinlogDumpGtid = 0x1e,
    ResetConnection = 0x1f,
    Unknown = 0xff,
}

impl From<u8> for Command {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Command::Sleep,
            0x01 => Command::Quit,
            0x02 => Command::InitDb,
            0x03 => Command::Query,
            0x04 => Command::FieldList,
            0x05 => Command::CreateDb,
            0x06 => Command::DropDb,
            0x07 => Command::Refresh,
            0x08 => Command::Shutdown,
            0x09 => Command::Statistics,
            0x0a => Command::ProcessInfo,
            0x0b => Command::Connect,
            0x0c => Command::ProcessKill,
            0x0d => Command::Debug,
            0x0e => Command::Ping,
            0x0f => Command::Time,
            0x10 => Command::DelayedInsert,
            0x11 => Command::ChangeUser,
            0x12 => Command::BinlogDump,
            0x13 => Command::TableDump,
            0x14 => Command::ConnectOut,
            0x15 => Command::RegisterSlave,
            0x16 => Command::StmtPrepare,
            0x17 => Command::StmtExecute,
            0x18 => Command::StmtSendLongData,
            0x19 => Command::StmtClose,
            0x1a => Command::StmtReset,
            0x1b => Command::SetOption,
            0x1c => Command::StmtFetch,
            0x1d => Command::Daemon,
            0x1e => Command::BinlogDumpGtid,
            0x1f => Command::ResetConnection,
            _ => Command::Unknown,
        }
    }
}
