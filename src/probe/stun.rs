//! STUN probe implementation (RFC 5389 Binding over UDP).
//!
//! Also holds the message codec reused by the TURN probe.

use std::net::SocketAddr;
use std::time::Duration;

use super::{millis, udp_exchange, ProbeError, Reply};

pub(crate) const MAGIC_COOKIE: u32 = 0x2112_A442;
pub(crate) const HEADER_LEN: usize = 20;

pub(crate) const BINDING_REQUEST: u16 = 0x0001;
pub(crate) const BINDING_SUCCESS: u16 = 0x0101;
pub(crate) const BINDING_ERROR: u16 = 0x0111;

pub(crate) const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
pub(crate) const ATTR_ERROR_CODE: u16 = 0x0009;
pub(crate) const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

pub(crate) type TransactionId = [u8; 12];

/// A decoded STUN message. Attribute values are kept raw.
#[derive(Debug, Clone)]
pub(crate) struct StunMessage {
    pub msg_type: u16,
    pub transaction_id: TransactionId,
    pub attributes: Vec<(u16, Vec<u8>)>,
}

impl StunMessage {
    pub fn attribute(&self, attr_type: u16) -> Option<&[u8]> {
        self.attributes
            .iter()
            .find(|(t, _)| *t == attr_type)
            .map(|(_, v)| v.as_slice())
    }

    /// Numeric ERROR-CODE (class * 100 + number), if present and well formed.
    pub fn error_code(&self) -> Option<u16> {
        let value = self.attribute(ATTR_ERROR_CODE)?;
        if value.len() < 4 {
            return None;
        }
        let class = (value[2] & 0x07) as u16;
        let number = value[3] as u16;
        Some(class * 100 + number)
    }
}

/// Encode a request with the given attributes, padded to 4-byte boundaries.
pub(crate) fn build_message(msg_type: u16, transaction_id: &TransactionId, attributes: &[(u16, &[u8])]) -> Vec<u8> {
    let body_len: usize = attributes.iter().map(|(_, v)| 4 + padded(v.len())).sum();

    let mut packet = Vec::with_capacity(HEADER_LEN + body_len);
    packet.extend_from_slice(&msg_type.to_be_bytes());
    packet.extend_from_slice(&(body_len as u16).to_be_bytes());
    packet.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    packet.extend_from_slice(transaction_id);

    for (attr_type, value) in attributes {
        packet.extend_from_slice(&attr_type.to_be_bytes());
        packet.extend_from_slice(&(value.len() as u16).to_be_bytes());
        packet.extend_from_slice(value);
        packet.resize(packet.len() + padded(value.len()) - value.len(), 0);
    }

    packet
}

/// Decode a STUN message, rejecting anything structurally invalid.
pub(crate) fn parse_message(buf: &[u8]) -> Result<StunMessage, ProbeError> {
    if buf.len() < HEADER_LEN {
        return Err(ProbeError::MalformedResponse(format!(
            "response too short: {} bytes",
            buf.len()
        )));
    }

    let msg_type = u16::from_be_bytes([buf[0], buf[1]]);
    if msg_type & 0xC000 != 0 {
        return Err(ProbeError::MalformedResponse(
            "leading bits of message type are set".to_string(),
        ));
    }

    let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    if length % 4 != 0 || HEADER_LEN + length > buf.len() {
        return Err(ProbeError::MalformedResponse(format!(
            "bad message length {} for {} byte datagram",
            length,
            buf.len()
        )));
    }

    let cookie = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if cookie != MAGIC_COOKIE {
        return Err(ProbeError::MalformedResponse(format!(
            "bad magic cookie {:#010x}",
            cookie
        )));
    }

    let mut transaction_id = [0u8; 12];
    transaction_id.copy_from_slice(&buf[8..20]);

    let mut attributes = Vec::new();
    let body = &buf[HEADER_LEN..HEADER_LEN + length];
    let mut offset = 0;
    while offset < body.len() {
        if offset + 4 > body.len() {
            return Err(ProbeError::MalformedResponse("truncated attribute header".to_string()));
        }
        let attr_type = u16::from_be_bytes([body[offset], body[offset + 1]]);
        let attr_len = u16::from_be_bytes([body[offset + 2], body[offset + 3]]) as usize;
        let start = offset + 4;
        if start + attr_len > body.len() {
            return Err(ProbeError::MalformedResponse(format!(
                "attribute {:#06x} overruns message",
                attr_type
            )));
        }
        attributes.push((attr_type, body[start..start + attr_len].to_vec()));
        offset = start + padded(attr_len);
    }

    Ok(StunMessage {
        msg_type,
        transaction_id,
        attributes,
    })
}

fn padded(len: usize) -> usize {
    (len + 3) & !3
}

pub(crate) fn new_transaction_id() -> TransactionId {
    rand::random()
}

/// Whether a datagram carries our transaction id; others are ignored.
pub(crate) fn is_reply_to(buf: &[u8], transaction_id: &TransactionId) -> bool {
    buf.len() >= HEADER_LEN && &buf[8..20] == transaction_id
}

/// Run a STUN probe: a Binding request answered by a Binding success
/// response carrying the mapped address.
pub async fn run_stun_probe(addr: SocketAddr, timeout: Duration) -> Result<f64, ProbeError> {
    let transaction_id = new_transaction_id();
    let request = build_message(BINDING_REQUEST, &transaction_id, &[]);

    let elapsed = udp_exchange(addr, &request, timeout, |buf| {
        if !is_reply_to(buf, &transaction_id) {
            return Reply::Ignore;
        }
        Reply::Done(parse_message(buf).and_then(|msg| validate_binding_response(&msg)))
    })
    .await?;

    Ok(millis(elapsed))
}

fn validate_binding_response(msg: &StunMessage) -> Result<(), ProbeError> {
    match msg.msg_type {
        BINDING_SUCCESS => {
            if msg.attribute(ATTR_XOR_MAPPED_ADDRESS).is_some()
                || msg.attribute(ATTR_MAPPED_ADDRESS).is_some()
            {
                Ok(())
            } else {
                Err(ProbeError::MalformedResponse(
                    "binding response has no mapped address".to_string(),
                ))
            }
        }
        BINDING_ERROR => Err(ProbeError::Protocol(format!(
            "binding rejected with error {}",
            msg.error_code().unwrap_or(0)
        ))),
        other => Err(ProbeError::Protocol(format!(
            "unexpected message type {:#06x}",
            other
        ))),
    }
}
