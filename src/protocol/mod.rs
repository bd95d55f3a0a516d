mod codec;
mod command;
mod handshake;
mod packet;
mod scramble;

pub use codec::PacketCodec;
pub use command::{classify, ClientCommand, Dispatch, PrefixClassifier, QueryClassifier};
pub use handshake::{
    is_eof_packet, is_err_packet, is_ok_packet, EofPacket, ErrPacket, HandshakeResponse,
    InitialHandshake, OkPacket, NATIVE_PASSWORD_PLUGIN, SCRAMBLE_SIZE, SERVER_VERSION,
};
pub use packet::{capabilities, Command, Packet, MAX_PACKET_SIZE, PACKET_HEADER_SIZE};
pub use scramble::{
    build_client_token, digest_to_hex, double_sha1, gen_scramble, hex_to_digest, sha1,
    token_from_stage1, verify_native_password,
};
