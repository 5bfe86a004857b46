//! The payload codec (§4.2): an ordered sequence of packets carried in a
//! single polling HTTP body, concatenated with the record separator `0x1E`.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::EngineError;
use crate::packet::Packet;

/// Maximum decoded packet count per payload (§3).
pub const MAX_PACKETS_PER_PAYLOAD: usize = 16;

const RECORD_SEPARATOR: u8 = 0x1E;

/// An ordered group of packets carried in one polling HTTP body.
#[derive(Debug, Default)]
pub struct Payload {
    packets: Vec<Packet>,
}

impl Payload {
    pub fn new(packets: Vec<Packet>) -> Self {
        Self { packets }
    }

    pub fn packets(&self) -> &[Packet] {
        &self.packets
    }

    pub fn into_packets(self) -> Vec<Packet> {
        self.packets
    }

    /// Encode the payload as the `0x1E`-joined concatenation of each
    /// packet's text form.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::new();
        for (i, packet) in self.packets.iter().enumerate() {
            if i > 0 {
                out.put_u8(RECORD_SEPARATOR);
            }
            out.put(packet.encode_text());
        }
        out.freeze()
    }

    /// Encode the payload wrapped as a JSONP response body: the inner
    /// payload is JSON-string-escaped and wrapped as `___eio[n]("…");`.
    /// Only emitted by the dispatcher when a `j=<digits>` query parameter
    /// was present on the request.
    pub fn encode_jsonp(&self, index: u32) -> Bytes {
        let inner = self.encode();
        let inner_str = String::from_utf8_lossy(&inner);
        let escaped = serde_json::to_string(inner_str.as_ref()).expect("string always encodes");
        Bytes::from(format!("___eio[{index}]({escaped});"))
    }

    /// Decode a payload body. Fails if any packet fails to decode, or if
    /// the packet count exceeds [`MAX_PACKETS_PER_PAYLOAD`].
    pub fn decode(body: &[u8]) -> Result<Self, EngineError> {
        if body.is_empty() {
            return Ok(Self::default());
        }

        let mut packets = Vec::new();
        for part in body.split(|&b| b == RECORD_SEPARATOR) {
            if packets.len() >= MAX_PACKETS_PER_PAYLOAD {
                return Err(EngineError::Decode(format!(
                    "payload exceeds the {MAX_PACKETS_PER_PAYLOAD}-packet cap"
                )));
            }
            packets.push(Packet::decode_text(part)?);
        }

        Ok(Self::new(packets))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Data;

    #[test]
    fn roundtrips_a_list_of_packets() {
        let payload = Payload::new(vec![
            Packet::message_text("hi"),
            Packet::ping(None),
            Packet::message_json(serde_json::json!({"a": 1})),
        ]);
        let encoded = payload.encode();
        let decoded = Payload::decode(&encoded).unwrap();
        assert_eq!(decoded.packets().len(), 3);
        assert_eq!(decoded.packets()[0].data(), &Data::Text("hi".to_owned()));
    }

    #[test]
    fn empty_body_decodes_to_empty_payload() {
        let decoded = Payload::decode(b"").unwrap();
        assert!(decoded.packets().is_empty());
    }

    #[test]
    fn exceeding_the_packet_cap_is_an_error() {
        let body = vec![b'4'; 1]
            .into_iter()
            .chain(std::iter::once(RECORD_SEPARATOR))
            .collect::<Vec<u8>>()
            .repeat(MAX_PACKETS_PER_PAYLOAD + 1);
        assert!(Payload::decode(&body).is_err());
    }

    #[test]
    fn jsonp_wraps_the_encoded_payload() {
        let payload = Payload::new(vec![Packet::message_text("hi")]);
        let wrapped = payload.encode_jsonp(3);
        let wrapped = String::from_utf8(wrapped.to_vec()).unwrap();
        assert!(wrapped.starts_with("___eio[3](\""));
        assert!(wrapped.ends_with("\");"));
    }
}
