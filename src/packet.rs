//! The packet codec (§4.1): a single framed unit with a type and optional
//! payload, encodable on both text and binary transports.

use base64::Engine as _;
use bytes::Bytes;
use serde_json::Value;
use std::sync::OnceLock;

use crate::error::EngineError;

/// An Engine.IO packet type, encoded on the wire as a single ASCII digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Open = 0,
    Close = 1,
    Ping = 2,
    Pong = 3,
    Message = 4,
    Upgrade = 5,
    Noop = 6,
}

impl PacketType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Close => "CLOSE",
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::Message => "MESSAGE",
            Self::Upgrade => "UPGRADE",
            Self::Noop => "NOOP",
        }
    }

    fn from_digit(digit: u8) -> Result<Self, EngineError> {
        Ok(match digit {
            0 => Self::Open,
            1 => Self::Close,
            2 => Self::Ping,
            3 => Self::Pong,
            4 => Self::Message,
            5 => Self::Upgrade,
            6 => Self::Noop,
            other => return Err(EngineError::Decode(format!("unknown packet type {other}"))),
        })
    }
}

/// A guard against gratuitously large integer literals in a decoded text
/// payload. Integers with more digits than this are kept as strings instead
/// of being parsed. The protocol does not mandate this; it is preserved from
/// the reference implementation's JSON guard as a historical safety valve.
const MAX_INTEGER_DIGITS: usize = 100;

/// A packet's payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Data {
    None,
    Text(String),
    Binary(Bytes),
    Json(Value),
}

/// An immutable Engine.IO packet.
///
/// Only [`PacketType::Message`] may carry binary data; all other types carry
/// text or nothing (an invariant enforced by [`Packet::new`]).
#[derive(Debug, Clone)]
pub struct Packet {
    packet_type: PacketType,
    data: Data,
    encoded_text: OnceLock<Bytes>,
}

impl Packet {
    pub fn new(packet_type: PacketType, data: Data) -> Self {
        debug_assert!(
            packet_type == PacketType::Message || !matches!(data, Data::Binary(_)),
            "only MESSAGE packets may carry binary data"
        );
        Self {
            packet_type,
            data,
            encoded_text: OnceLock::new(),
        }
    }

    pub fn open(data: Value) -> Self {
        Self::new(PacketType::Open, Data::Json(data))
    }

    pub fn close() -> Self {
        Self::new(PacketType::Close, Data::None)
    }

    pub fn ping(data: Option<&str>) -> Self {
        Self::new(
            PacketType::Ping,
            data.map_or(Data::None, |s| Data::Text(s.to_owned())),
        )
    }

    pub fn pong(data: Option<&str>) -> Self {
        Self::new(
            PacketType::Pong,
            data.map_or(Data::None, |s| Data::Text(s.to_owned())),
        )
    }

    pub fn message_text(text: impl Into<String>) -> Self {
        Self::new(PacketType::Message, Data::Text(text.into()))
    }

    pub fn message_binary(bytes: impl Into<Bytes>) -> Self {
        Self::new(PacketType::Message, Data::Binary(bytes.into()))
    }

    pub fn message_json(value: Value) -> Self {
        Self::new(PacketType::Message, Data::Json(value))
    }

    pub fn upgrade() -> Self {
        Self::new(PacketType::Upgrade, Data::None)
    }

    pub fn noop() -> Self {
        Self::new(PacketType::Noop, Data::None)
    }

    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    pub fn data(&self) -> &Data {
        &self.data
    }

    /// Whether this packet carries binary data, per the `binary` derived
    /// field in the data model.
    pub fn is_binary(&self) -> bool {
        matches!(self.data, Data::Binary(_))
    }

    /// Replace this packet's data, invalidating any cached encoded form.
    pub fn set_data(&mut self, data: Data) {
        self.data = data;
        self.encoded_text = OnceLock::new();
    }

    /// Encode in text form (§4.1): the ASCII type digit followed by the
    /// payload. Binary data is base64'd with a leading `'b'` marker.
    pub fn encode_text(&self) -> Bytes {
        self.encoded_text
            .get_or_init(|| Bytes::from(self.encode_text_uncached()))
            .clone()
    }

    fn encode_text_uncached(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match &self.data {
            Data::Binary(bytes) => {
                out.push(b'b');
                out.push(b'0' + self.packet_type as u8);
                let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
                out.extend_from_slice(encoded.as_bytes());
            }
            Data::Text(text) => {
                out.push(b'0' + self.packet_type as u8);
                out.extend_from_slice(text.as_bytes());
            }
            Data::Json(value) => {
                out.push(b'0' + self.packet_type as u8);
                let rendered =
                    serde_json::to_string(value).expect("Value always serializes to JSON");
                out.extend_from_slice(rendered.as_bytes());
            }
            Data::None => {
                out.push(b'0' + self.packet_type as u8);
            }
        }
        out
    }

    /// Encode in binary form (§4.1): raw bytes with no prefix, used on a
    /// WebSocket binary frame for a MESSAGE carrying bytes.
    pub fn encode_binary(&self) -> Bytes {
        match &self.data {
            Data::Binary(bytes) => bytes.clone(),
            _ => Bytes::new(),
        }
    }

    /// Decode a single text-form packet. Empty input is a [`DecodeError`].
    pub fn decode_text(input: &[u8]) -> Result<Self, EngineError> {
        if input.is_empty() {
            return Err(EngineError::Decode("empty encoded packet".into()));
        }

        let (is_b64_binary, rest) = if input[0] == b'b' {
            (true, &input[1..])
        } else {
            (false, input)
        };

        if rest.is_empty() {
            return Err(EngineError::Decode("missing packet type digit".into()));
        }

        let type_digit = rest[0];
        if !(b'0'..=b'6').contains(&type_digit) {
            return Err(EngineError::Decode(format!(
                "invalid packet type digit: {type_digit}"
            )));
        }
        let packet_type = PacketType::from_digit(type_digit - b'0')?;
        let body = &rest[1..];

        let data = if is_b64_binary {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(body)
                .map_err(|e| EngineError::Decode(format!("invalid base64: {e}")))?;
            Data::Binary(Bytes::from(decoded))
        } else if body.is_empty() {
            Data::None
        } else {
            Self::decode_body(body)
        };

        Ok(Self::new(packet_type, data))
    }

    /// Parse the text body: JSON if it looks like an object/array, or a
    /// too-long integer literal is kept as a string (§4.1 guard); otherwise
    /// attempt JSON and fall back to a raw string on failure.
    fn decode_body(body: &[u8]) -> Data {
        let text = match std::str::from_utf8(body) {
            Ok(text) => text,
            Err(_) => return Data::Text(String::from_utf8_lossy(body).into_owned()),
        };

        let looks_like_json_container =
            text.starts_with('{') || text.starts_with('[') || text == "true" || text == "false";
        let looks_numeric = text
            .chars()
            .all(|c| c.is_ascii_digit() || c == '-' || c == '.' || c == 'e' || c == 'E' || c == '+');

        if looks_numeric && !looks_like_json_container {
            let digit_count = text.chars().filter(|c| c.is_ascii_digit()).count();
            if digit_count > MAX_INTEGER_DIGITS {
                return Data::Text(text.to_owned());
            }
        }

        if looks_like_json_container || looks_numeric {
            match serde_json::from_str::<Value>(text) {
                Ok(value) => Data::Json(value),
                Err(_) => Data::Text(text.to_owned()),
            }
        } else {
            Data::Text(text.to_owned())
        }
    }

    /// Decode a packet that arrived as a raw WebSocket binary frame: the
    /// frame kind tells us `type = MESSAGE` and the bytes are the payload
    /// verbatim (binary form, §4.1).
    pub fn decode_binary_frame(bytes: Bytes) -> Self {
        Self::new(PacketType::Message, Data::Binary(bytes))
    }
}

impl PartialEq for Packet {
    fn eq(&self, other: &Self) -> bool {
        self.packet_type == other.packet_type && self.data == other.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_open_packet_as_json_text() {
        let packet = Packet::open(serde_json::json!({"sid": "abc"}));
        assert_eq!(packet.encode_text(), Bytes::from_static(b"0{\"sid\":\"abc\"}"));
    }

    #[test]
    fn encodes_and_decodes_message_text_roundtrip() {
        let packet = Packet::message_text("hello");
        let encoded = packet.encode_text();
        let decoded = Packet::decode_text(&encoded).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn encodes_and_decodes_binary_message_b64_roundtrip() {
        let packet = Packet::message_binary(Bytes::from_static(&[1, 2, 3]));
        let encoded = packet.encode_text();
        assert!(encoded.starts_with(b"b4"));
        let decoded = Packet::decode_text(&encoded).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn binary_form_roundtrips_for_message_packets() {
        let packet = Packet::message_binary(Bytes::from_static(&[9, 9, 9]));
        let binary = packet.encode_binary();
        let decoded = Packet::decode_binary_frame(binary);
        assert_eq!(decoded, packet);
    }

    #[test]
    fn decode_empty_input_is_error() {
        assert!(Packet::decode_text(b"").is_err());
    }

    #[test]
    fn decode_invalid_type_digit_is_error() {
        assert!(Packet::decode_text(b"9hello").is_err());
    }

    #[test]
    fn huge_integer_literal_is_kept_as_string() {
        let huge = "1".repeat(MAX_INTEGER_DIGITS + 1);
        let mut encoded = Vec::new();
        encoded.push(b'4');
        encoded.extend_from_slice(huge.as_bytes());
        let decoded = Packet::decode_text(&encoded).unwrap();
        assert_eq!(decoded.data(), &Data::Text(huge));
    }

    #[test]
    fn reasonable_integer_literal_parses_as_json_number() {
        let decoded = Packet::decode_text(b"442").unwrap();
        assert_eq!(decoded.data(), &Data::Json(serde_json::json!(42)));
    }

    #[test]
    fn malformed_json_payload_is_kept_as_raw_string_not_an_error() {
        let decoded = Packet::decode_text(b"4{not json").unwrap();
        assert_eq!(decoded.data(), &Data::Text("{not json".to_owned()));
    }

    #[test]
    fn mutating_data_invalidates_the_encode_cache() {
        let mut packet = Packet::message_text("a");
        let first = packet.encode_text();
        packet.set_data(Data::Text("b".to_owned()));
        let second = packet.encode_text();
        assert_ne!(first, second);
    }
}
