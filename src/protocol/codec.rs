use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use super::packet::{Packet, MAX_PACKET_SIZE};

/// MySQL packet codec for use with tokio Framed.
///
/// The decoder yields whole logical payloads: frames carrying exactly
/// MAX_PACKET_SIZE bytes are continuations and are buffered until the
/// terminating short frame arrives. The encoder re-splits symmetrically.
#[derive(Debug, Default)]
pub struct PacketCodec {
    /// Pending reassembly: sequence id of the first frame + accumulated payload.
    partial: Option<(u8, BytesMut)>,
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(frame) = Packet::decode_frame(src) {
            let full = frame.payload.len() == MAX_PACKET_SIZE;

            match self.partial.take() {
                None if !full => return Ok(Some(frame)),
                None => {
                    let mut acc = BytesMut::with_capacity(frame.payload.len() * 2);
                    acc.extend_from_slice(&frame.payload);
                    self.partial = Some((frame.sequence_id, acc));
                }
                Some((first_seq, mut acc)) => {
                    acc.extend_from_slice(&frame.payload);
                    if full {
                        self.partial = Some((first_seq, acc));
                    } else {
                        return Ok(Some(Packet::new(first_seq, acc.freeze())));
                    }
                }
            }
        }

        Ok(None)
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn test_decode_single() {
        let mut codec = PacketCodec::default();
        let mut buf = BytesMut::new();
        Packet::new(0, &b"\x0e"[..]).encode(&mut buf);

        let packet = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(packet.sequence_id, 0);
        assert_eq!(&packet.payload[..], b"\x0e");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_incomplete_returns_none() {
        let mut codec = PacketCodec::default();
        let mut buf = BytesMut::from(&[10u8, 0, 0, 1, b'x'][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        // Nothing consumed until the frame completes.
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn test_reassembles_continuation_frames() {
        let mut codec = PacketCodec::default();
        let payload = vec![7u8; MAX_PACKET_SIZE + 5];
        let mut wire = BytesMut::new();
        Packet::new(0, payload.clone()).encode(&mut wire);

        // Feed the first frame alone: no logical packet yet.
        let first_frame_len = 4 + MAX_PACKET_SIZE;
        let mut buf = wire.split_to(first_frame_len);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        // Feed the short terminator frame.
        let mut buf = wire;
        let packet = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(packet.sequence_id, 0);
        assert_eq!(packet.payload.len(), MAX_PACKET_SIZE + 5);
        assert!(packet.payload.iter().all(|&b| b == 7));
    }

    #[test]
    fn test_encode_decode_oversize_roundtrip() {
        let mut codec = PacketCodec::default();
        let mut payload = Vec::with_capacity(MAX_PACKET_SIZE + 123);
        for i in 0..MAX_PACKET_SIZE + 123 {
            payload.put_u8((i % 251) as u8);
        }
        let original = Packet::new(2, payload);

        let mut wire = BytesMut::new();
        codec.encode(original.clone(), &mut wire).unwrap();
        let decoded = codec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(decoded, original);
    }
}
