//! Pub/Sub Frame Codec
//!
//! Encodes and decodes the MQTT 3.1.1 subset the gateway speaks with
//! devices: CONNECT/CONNACK, PUBLISH (QoS 0), SUBSCRIBE/SUBACK,
//! PINGREQ/PINGRESP and DISCONNECT. Partial frames are buffered; a packet
//! is only emitted once fully accumulated.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::GatewayError;

/// Largest accepted remaining-length. Anything bigger is a protocol error.
pub const MAX_PACKET_SIZE: usize = 64 * 1024;

pub const TYPE_CONNECT: u8 = 0x10;
pub const TYPE_CONNACK: u8 = 0x20;
pub const TYPE_PUBLISH: u8 = 0x30;
pub const TYPE_SUBSCRIBE: u8 = 0x80;
pub const TYPE_SUBACK: u8 = 0x90;
pub const TYPE_PINGREQ: u8 = 0xC0;
pub const TYPE_PINGRESP: u8 = 0xD0;
pub const TYPE_DISCONNECT: u8 = 0xE0;

/// A decoded inbound control packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Connect(Connect),
    Publish(Publish),
    Subscribe(Subscribe),
    PingReq,
    Disconnect,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Connect {
    pub protocol_name: String,
    pub protocol_level: u8,
    pub client_id: String,
    /// Declared keep-alive interval in seconds; 0 disables checking.
    pub keep_alive_secs: u16,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Publish {
    pub topic: String,
    pub qos: u8,
    /// Present only when qos > 0.
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subscribe {
    pub packet_id: u16,
    /// Topic filters with their requested QoS (ignored by the gateway).
    pub filters: Vec<(String, u8)>,
}

/// Streaming decoder over a TCP byte stream.
///
/// Feed raw bytes into the caller's `BytesMut` and call [`Codec::decode`]
/// until it returns `Ok(None)`.
#[derive(Debug, Default)]
pub struct Codec;

impl Codec {
    pub fn new() -> Self {
        Self
    }

    /// Decodes one packet from the buffer.
    ///
    /// Returns `Ok(Some(packet))` when a complete frame was consumed,
    /// `Ok(None)` when more bytes are needed, or `Err` on a protocol error.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Packet>, GatewayError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let first = buf[0];
        let (remaining_len, header_len) = match decode_remaining_length(&buf[1..])? {
            Some(v) => v,
            None => return Ok(None),
        };

        if remaining_len > MAX_PACKET_SIZE {
            return Err(GatewayError::PacketTooLarge(remaining_len));
        }

        let total = 1 + header_len + remaining_len;
        if buf.len() < total {
            return Ok(None);
        }

        let mut frame = buf.split_to(total).freeze();
        frame.advance(1 + header_len);

        let packet_type = first & 0xF0;
        let flags = first & 0x0F;

        match packet_type {
            TYPE_CONNECT => parse_connect(frame).map(Some),
            TYPE_PUBLISH => parse_publish(flags, frame).map(Some),
            TYPE_SUBSCRIBE => {
                if flags != 0x02 {
                    return Err(GatewayError::Protocol("bad SUBSCRIBE flags"));
                }
                parse_subscribe(frame).map(Some)
            }
            TYPE_PINGREQ => Ok(Some(Packet::PingReq)),
            TYPE_DISCONNECT => Ok(Some(Packet::Disconnect)),
            other => Err(GatewayError::UnexpectedPacket(other)),
        }
    }
}

/// Decodes the variable-length remaining-length field.
///
/// Returns `(value, bytes consumed)`, or `None` when the buffer ends before
/// the field does.
fn decode_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>, GatewayError> {
    let mut value = 0usize;
    let mut shift = 0u32;
    for (i, byte) in buf.iter().enumerate() {
        if i >= 4 {
            return Err(GatewayError::Protocol("remaining length too long"));
        }
        value |= ((byte & 0x7F) as usize) << shift;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        shift += 7;
    }
    if buf.len() >= 4 {
        return Err(GatewayError::Protocol("remaining length too long"));
    }
    Ok(None)
}

fn encode_remaining_length(mut len: usize, buf: &mut Vec<u8>) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if len == 0 {
            break;
        }
    }
}

fn read_string(frame: &mut Bytes) -> Result<String, GatewayError> {
    let bytes = read_binary(frame)?;
    String::from_utf8(bytes).map_err(|_| GatewayError::Protocol("invalid UTF-8 string"))
}

fn read_binary(frame: &mut Bytes) -> Result<Vec<u8>, GatewayError> {
    if frame.len() < 2 {
        return Err(GatewayError::Protocol("truncated length prefix"));
    }
    let len = frame.get_u16() as usize;
    if frame.len() < len {
        return Err(GatewayError::Protocol("truncated field"));
    }
    Ok(frame.split_to(len).to_vec())
}

fn parse_connect(mut frame: Bytes) -> Result<Packet, GatewayError> {
    let protocol_name = read_string(&mut frame)?;
    if frame.len() < 4 {
        return Err(GatewayError::Protocol("truncated CONNECT header"));
    }
    let protocol_level = frame.get_u8();
    let connect_flags = frame.get_u8();
    let keep_alive_secs = frame.get_u16();

    let client_id = read_string(&mut frame)?;

    // Will fields are consumed to keep the cursor aligned, then discarded.
    if connect_flags & 0x04 != 0 {
        let _will_topic = read_string(&mut frame)?;
        let _will_payload = read_binary(&mut frame)?;
    }

    let username = if connect_flags & 0x80 != 0 {
        Some(read_string(&mut frame)?)
    } else {
        None
    };
    let password = if connect_flags & 0x40 != 0 {
        Some(read_binary(&mut frame)?)
    } else {
        None
    };

    Ok(Packet::Connect(Connect {
        protocol_name,
        protocol_level,
        client_id,
        keep_alive_secs,
        username,
        password,
    }))
}

fn parse_publish(flags: u8, mut frame: Bytes) -> Result<Packet, GatewayError> {
    let qos = (flags >> 1) & 0x03;
    if qos == 3 {
        return Err(GatewayError::Protocol("reserved QoS value"));
    }
    let topic = read_string(&mut frame)?;
    let packet_id = if qos > 0 {
        if frame.len() < 2 {
            return Err(GatewayError::Protocol("truncated packet id"));
        }
        Some(frame.get_u16())
    } else {
        None
    };

    Ok(Packet::Publish(Publish {
        topic,
        qos,
        packet_id,
        payload: frame,
    }))
}

fn parse_subscribe(mut frame: Bytes) -> Result<Packet, GatewayError> {
    if frame.len() < 2 {
        return Err(GatewayError::Protocol("truncated packet id"));
    }
    let packet_id = frame.get_u16();

    let mut filters = Vec::new();
    while !frame.is_empty() {
        let filter = read_string(&mut frame)?;
        if frame.is_empty() {
            return Err(GatewayError::Protocol("missing requested QoS"));
        }
        let qos = frame.get_u8();
        filters.push((filter, qos));
    }
    if filters.is_empty() {
        return Err(GatewayError::Protocol("SUBSCRIBE without filters"));
    }

    Ok(Packet::Subscribe(Subscribe { packet_id, filters }))
}

/// Encodes a CONNACK with the given return code (session-present = 0).
pub fn encode_connack(return_code: u8) -> Vec<u8> {
    vec![TYPE_CONNACK, 0x02, 0x00, return_code]
}

/// Encodes a SUBACK answering each filter with return code 0.
pub fn encode_suback(packet_id: u16, filter_count: usize) -> Vec<u8> {
    let mut buf = vec![TYPE_SUBACK];
    encode_remaining_length(2 + filter_count, &mut buf);
    buf.put_u16(packet_id);
    buf.extend(std::iter::repeat(0u8).take(filter_count));
    buf
}

pub fn encode_pingresp() -> Vec<u8> {
    vec![TYPE_PINGRESP, 0x00]
}

/// Encodes a QoS 0 PUBLISH to the given topic.
pub fn encode_publish(topic: &str, payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![TYPE_PUBLISH];
    encode_remaining_length(2 + topic.len() + payload.len(), &mut buf);
    buf.put_u16(topic.len() as u16);
    buf.extend_from_slice(topic.as_bytes());
    buf.extend_from_slice(payload);
    buf
}
