//! Wire encoding for the MQTT 3.1.1 subset.
//!
//! [`decode`] is incremental: it consumes exactly one packet from the
//! front of the buffer when a complete one is available and leaves the
//! buffer untouched otherwise. WebSocket messages may split or
//! concatenate MQTT packets arbitrarily, so callers append every received
//! chunk to one `BytesMut` and drain it through `decode` in a loop.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

use super::{ConnAck, Connect, ConnectReturnCode, Packet, Publish, QoS, SubAck, Subscribe};

/// Largest remaining-length value encodable in four bytes.
const MAX_REMAINING_LENGTH: usize = 268_435_455;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Unknown or unexpected packet type. The offending packet has been
    /// consumed from the buffer; the connection is still usable.
    #[error("unknown or unexpected packet type {0:#04x}")]
    UnknownPacket(u8),
    #[error("malformed remaining length")]
    MalformedRemainingLength,
    #[error("packet body is truncated or carries trailing garbage")]
    MalformedPacket,
    #[error("topic or string field is not valid UTF-8")]
    InvalidString,
    #[error("invalid QoS bits {0}")]
    InvalidQos(u8),
    #[error("invalid CONNACK return code {0}")]
    InvalidReturnCode(u8),
}

/// Encodes one packet into `buf`.
pub fn encode(packet: &Packet, buf: &mut BytesMut) {
    match packet {
        Packet::Connect(connect) => encode_connect(connect, buf),
        Packet::ConnAck(ack) => {
            buf.put_u8(0x20);
            buf.put_u8(2);
            buf.put_u8(u8::from(ack.session_present));
            buf.put_u8(match ack.code {
                ConnectReturnCode::Accepted => 0,
                ConnectReturnCode::UnacceptableProtocol => 1,
                ConnectReturnCode::IdentifierRejected => 2,
                ConnectReturnCode::ServerUnavailable => 3,
                ConnectReturnCode::BadCredentials => 4,
                ConnectReturnCode::NotAuthorized => 5,
            });
        }
        Packet::Publish(publish) => encode_publish(publish, buf),
        Packet::PubAck { pkid } => {
            buf.put_u8(0x40);
            buf.put_u8(2);
            buf.put_u16(*pkid);
        }
        Packet::Subscribe(subscribe) => encode_subscribe(subscribe, buf),
        Packet::SubAck(ack) => {
            buf.put_u8(0x90);
            encode_remaining_length(2 + ack.return_codes.len(), buf);
            buf.put_u16(ack.pkid);
            buf.put_slice(&ack.return_codes);
        }
        Packet::PingReq => {
            buf.put_u8(0xC0);
            buf.put_u8(0);
        }
        Packet::PingResp => {
            buf.put_u8(0xD0);
            buf.put_u8(0);
        }
        Packet::Disconnect => {
            buf.put_u8(0xE0);
            buf.put_u8(0);
        }
    }
}

fn encode_connect(connect: &Connect, buf: &mut BytesMut) {
    // Variable header: protocol name, level, flags, keep-alive.
    let mut flags = 0x80 | 0x40; // username + password always present
    if connect.clean_session {
        flags |= 0x02;
    }
    let remaining = 10
        + 2
        + connect.client_id.len()
        + 2
        + connect.username.len()
        + 2
        + connect.password.len();
    buf.put_u8(0x10);
    encode_remaining_length(remaining, buf);
    encode_string("MQTT", buf);
    buf.put_u8(super::PROTOCOL_LEVEL);
    buf.put_u8(flags);
    buf.put_u16(connect.keep_alive_secs);
    encode_string(&connect.client_id, buf);
    encode_string(&connect.username, buf);
    encode_string(&connect.password, buf);
}

fn encode_publish(publish: &Publish, buf: &mut BytesMut) {
    let mut header = 0x30 | (publish.qos.bits() << 1);
    if publish.retain {
        header |= 0x01;
    }
    if publish.dup {
        header |= 0x08;
    }
    let pkid_len = if publish.qos == QoS::AtLeastOnce { 2 } else { 0 };
    let remaining = 2 + publish.topic.len() + pkid_len + publish.payload.len();
    buf.put_u8(header);
    encode_remaining_length(remaining, buf);
    encode_string(&publish.topic, buf);
    if publish.qos == QoS::AtLeastOnce {
        buf.put_u16(publish.pkid.unwrap_or(0));
    }
    buf.put_slice(&publish.payload);
}

fn encode_subscribe(subscribe: &Subscribe, buf: &mut BytesMut) {
    let remaining = 2
        + subscribe
            .filters
            .iter()
            .map(|(topic, _)| 2 + topic.len() + 1)
            .sum::<usize>();
    buf.put_u8(0x82);
    encode_remaining_length(remaining, buf);
    buf.put_u16(subscribe.pkid);
    for (topic, qos) in &subscribe.filters {
        encode_string(topic, buf);
        buf.put_u8(qos.bits());
    }
}

fn encode_string(s: &str, buf: &mut BytesMut) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn encode_remaining_length(mut len: usize, buf: &mut BytesMut) {
    debug_assert!(len <= MAX_REMAINING_LENGTH);
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if len == 0 {
            break;
        }
    }
}

/// Tries to decode one packet from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete packet
/// (nothing is consumed). On `Err(CodecError::UnknownPacket)` the packet
/// has been skipped and decoding may continue; every other error means the
/// byte stream is unrecoverable and the connection must be dropped.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Packet>, CodecError> {
    let Some((header, remaining, header_len)) = peek_fixed_header(buf)? else {
        return Ok(None);
    };
    if buf.len() < header_len + remaining {
        return Ok(None);
    }
    buf.advance(header_len);
    let mut body = buf.split_to(remaining);

    let packet_type = header >> 4;
    let result = match packet_type {
        0x02 => decode_connack(&mut body),
        0x03 => decode_publish(header, &mut body),
        0x04 => decode_puback(&mut body),
        0x09 => decode_suback(&mut body),
        0x0C => Ok(Packet::PingReq),
        0x0D => Ok(Packet::PingResp),
        0x0E => Ok(Packet::Disconnect),
        // CONNECT/SUBSCRIBE are client-to-server only; anything else is
        // outside the subset. The body was already consumed above.
        _ => return Err(CodecError::UnknownPacket(header)),
    }?;

    if !body.is_empty() && !matches!(result, Packet::Publish(_)) {
        return Err(CodecError::MalformedPacket);
    }
    Ok(Some(result))
}

/// Reads the fixed header without consuming: (first byte, remaining
/// length, total header length).
fn peek_fixed_header(buf: &BytesMut) -> Result<Option<(u8, usize, usize)>, CodecError> {
    if buf.is_empty() {
        return Ok(None);
    }
    let header = buf[0];
    let mut remaining: usize = 0;
    let mut multiplier: usize = 1;
    for (i, byte) in buf.iter().skip(1).take(4).enumerate() {
        remaining += (*byte as usize & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((header, remaining, i + 2)));
        }
        multiplier *= 128;
    }
    if buf.len() >= 5 {
        // Four continuation bytes without a terminator.
        return Err(CodecError::MalformedRemainingLength);
    }
    Ok(None)
}

fn decode_connack(body: &mut BytesMut) -> Result<Packet, CodecError> {
    if body.len() != 2 {
        return Err(CodecError::MalformedPacket);
    }
    let session_present = body.get_u8() & 0x01 != 0;
    let code_byte = body.get_u8();
    let code =
        ConnectReturnCode::from_byte(code_byte).ok_or(CodecError::InvalidReturnCode(code_byte))?;
    Ok(Packet::ConnAck(ConnAck {
        session_present,
        code,
    }))
}

fn decode_publish(header: u8, body: &mut BytesMut) -> Result<Packet, CodecError> {
    let qos_bits = (header >> 1) & 0x03;
    let qos = QoS::from_bits(qos_bits).ok_or(CodecError::InvalidQos(qos_bits))?;
    let topic = decode_string(body)?;
    let pkid = if qos == QoS::AtLeastOnce {
        if body.len() < 2 {
            return Err(CodecError::MalformedPacket);
        }
        Some(body.get_u16())
    } else {
        None
    };
    let payload = body.split().to_vec();
    Ok(Packet::Publish(Publish {
        topic,
        payload,
        qos,
        pkid,
        retain: header & 0x01 != 0,
        dup: header & 0x08 != 0,
    }))
}

fn decode_puback(body: &mut BytesMut) -> Result<Packet, CodecError> {
    if body.len() != 2 {
        return Err(CodecError::MalformedPacket);
    }
    Ok(Packet::PubAck {
        pkid: body.get_u16(),
    })
}

fn decode_suback(body: &mut BytesMut) -> Result<Packet, CodecError> {
    if body.len() < 3 {
        return Err(CodecError::MalformedPacket);
    }
    let pkid = body.get_u16();
    let return_codes = body.split().to_vec();
    Ok(Packet::SubAck(SubAck { pkid, return_codes }))
}

fn decode_string(body: &mut BytesMut) -> Result<String, CodecError> {
    if body.len() < 2 {
        return Err(CodecError::MalformedPacket);
    }
    let len = body.get_u16() as usize;
    if body.len() < len {
        return Err(CodecError::MalformedPacket);
    }
    let bytes = body.split_to(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidString)
}
