//! TURN probe implementation (RFC 5766 Allocate over UDP).

use std::net::SocketAddr;
use std::time::Duration;

use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha1::Sha1;
use tokio::net::UdpSocket;

use super::stun::{
    build_message, is_reply_to, new_transaction_id, parse_message, StunMessage, TransactionId, HEADER_LEN,
};
use super::{connect_udp, millis, udp_request, ProbeError, Reply};
use crate::uptime::Credentials;

type HmacSha1 = Hmac<Sha1>;

const ALLOCATE_REQUEST: u16 = 0x0003;
const ALLOCATE_SUCCESS: u16 = 0x0103;
const ALLOCATE_ERROR: u16 = 0x0113;

const ATTR_USERNAME: u16 = 0x0006;
const ATTR_MESSAGE_INTEGRITY: u16 = 0x0008;
const ATTR_REALM: u16 = 0x0014;
const ATTR_NONCE: u16 = 0x0015;
const ATTR_XOR_RELAYED_ADDRESS: u16 = 0x0016;
const ATTR_REQUESTED_TRANSPORT: u16 = 0x0019;

/// Attribute header plus a 20 byte HMAC-SHA1.
const INTEGRITY_ATTR_LEN: usize = 24;

/// Protocol number 17 (UDP) followed by three reserved bytes.
const REQUESTED_UDP: [u8; 4] = [17, 0, 0, 0];

/// Unauthorized and Stale Nonce: the server wants long-term credentials.
const AUTH_CHALLENGES: [u16; 2] = [401, 438];

/// What the server sent back for an Allocate.
#[derive(Debug, PartialEq)]
enum AllocateReply {
    /// Allocation succeeded and a relayed address was handed out.
    Relayed,
    Challenge(Challenge),
}

#[derive(Debug, PartialEq)]
struct Challenge {
    realm: Vec<u8>,
    nonce: Vec<u8>,
}

/// Run a TURN probe.
///
/// Without credentials, an allocation or an authentication challenge both
/// prove a live TURN server. With credentials, a challenge is answered once
/// on the same socket and only a relayed allocation counts.
pub async fn run_turn_probe(
    addr: SocketAddr,
    credentials: Option<&Credentials>,
    timeout: Duration,
) -> Result<f64, ProbeError> {
    let socket = connect_udp(addr, timeout).await?;

    let (elapsed, reply) = allocate(&socket, None, timeout).await?;
    let challenge = match reply {
        AllocateReply::Relayed => return Ok(millis(elapsed)),
        AllocateReply::Challenge(challenge) => challenge,
    };
    let credentials = match credentials {
        Some(credentials) => credentials,
        None => return Ok(millis(elapsed)),
    };

    if challenge.realm.is_empty() || challenge.nonce.is_empty() {
        return Err(ProbeError::MalformedResponse(
            "challenge without realm or nonce".to_string(),
        ));
    }

    let (elapsed, reply) = allocate(&socket, Some((credentials, &challenge)), timeout).await?;
    match reply {
        AllocateReply::Relayed => Ok(millis(elapsed)),
        AllocateReply::Challenge(_) => Err(ProbeError::Protocol(format!(
            "credentials for {} were rejected",
            credentials.user
        ))),
    }
}

async fn allocate(
    socket: &UdpSocket,
    auth: Option<(&Credentials, &Challenge)>,
    timeout: Duration,
) -> Result<(Duration, AllocateReply), ProbeError> {
    let transaction_id = new_transaction_id();
    let request = match auth {
        Some((credentials, challenge)) => authenticated_allocate(&transaction_id, credentials, challenge)?,
        None => build_message(
            ALLOCATE_REQUEST,
            &transaction_id,
            &[(ATTR_REQUESTED_TRANSPORT, &REQUESTED_UDP[..])],
        ),
    };

    udp_request(socket, &request, timeout, |buf| {
        if !is_reply_to(buf, &transaction_id) {
            return Reply::Ignore;
        }
        Reply::Done(parse_message(buf).and_then(|msg| classify_allocate_response(&msg)))
    })
    .await
}

fn authenticated_allocate(
    transaction_id: &TransactionId,
    credentials: &Credentials,
    challenge: &Challenge,
) -> Result<Vec<u8>, ProbeError> {
    let mut packet = build_message(
        ALLOCATE_REQUEST,
        transaction_id,
        &[
            (ATTR_REQUESTED_TRANSPORT, &REQUESTED_UDP[..]),
            (ATTR_USERNAME, credentials.user.as_bytes()),
            (ATTR_REALM, challenge.realm.as_slice()),
            (ATTR_NONCE, challenge.nonce.as_slice()),
        ],
    );
    let key = long_term_key(credentials, &challenge.realm);
    append_message_integrity(&mut packet, &key)?;
    Ok(packet)
}

/// MD5(username ":" realm ":" password), per RFC 5389 section 15.4.
fn long_term_key(credentials: &Credentials, realm: &[u8]) -> Vec<u8> {
    let mut hasher = Md5::new();
    hasher.update(credentials.user.as_bytes());
    hasher.update(b":");
    hasher.update(realm);
    hasher.update(b":");
    hasher.update(credentials.password.as_bytes());
    hasher.finalize().to_vec()
}

/// Append MESSAGE-INTEGRITY over the whole packet. The header length must
/// already count the attribute when the HMAC is taken.
fn append_message_integrity(packet: &mut Vec<u8>, key: &[u8]) -> Result<(), ProbeError> {
    let length = (packet.len() - HEADER_LEN + INTEGRITY_ATTR_LEN) as u16;
    packet[2..4].copy_from_slice(&length.to_be_bytes());

    let mut mac = HmacSha1::new_from_slice(key).map_err(|e| ProbeError::Protocol(e.to_string()))?;
    mac.update(packet.as_slice());
    let tag = mac.finalize().into_bytes();

    packet.extend_from_slice(&ATTR_MESSAGE_INTEGRITY.to_be_bytes());
    packet.extend_from_slice(&(tag.len() as u16).to_be_bytes());
    packet.extend_from_slice(&tag);
    Ok(())
}

fn classify_allocate_response(msg: &StunMessage) -> Result<AllocateReply, ProbeError> {
    match msg.msg_type {
        ALLOCATE_SUCCESS => {
            if msg.attribute(ATTR_XOR_RELAYED_ADDRESS).is_some() {
                Ok(AllocateReply::Relayed)
            } else {
                Err(ProbeError::MalformedResponse(
                    "allocate response has no relayed address".to_string(),
                ))
            }
        }
        ALLOCATE_ERROR => match msg.error_code() {
            Some(code) if AUTH_CHALLENGES.contains(&code) => Ok(AllocateReply::Challenge(Challenge {
                realm: msg.attribute(ATTR_REALM).unwrap_or_default().to_vec(),
                nonce: msg.attribute(ATTR_NONCE).unwrap_or_default().to_vec(),
            })),
            Some(code) => Err(ProbeError::Protocol(format!(
                "allocate rejected with error {}",
                code
            ))),
            None => Err(ProbeError::MalformedResponse(
                "allocate error response without error code".to_string(),
            )),
        },
        other => Err(ProbeError::Protocol(format!(
            "unexpected message type {:#06x}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::stun::ATTR_ERROR_CODE;

    const REALM: &[u8] = b"example.org";
    const NONCE: &[u8] = b"f00dfeed";

    fn error_response(code: u16) -> StunMessage {
        let value = [0u8, 0, (code / 100) as u8, (code % 100) as u8];
        parse_message(&build_message(
            ALLOCATE_ERROR,
            &[9u8; 12],
            &[(ATTR_ERROR_CODE, &value[..])],
        ))
        .unwrap()
    }

    fn challenge_reply(transaction_id: &TransactionId) -> Vec<u8> {
        let unauthorized = [0u8, 0, 4, 1];
        build_message(
            ALLOCATE_ERROR,
            transaction_id,
            &[
                (ATTR_ERROR_CODE, &unauthorized[..]),
                (ATTR_REALM, REALM),
                (ATTR_NONCE, NONCE),
            ],
        )
    }

    fn relayed_reply(transaction_id: &TransactionId) -> Vec<u8> {
        let relayed = [0u8, 0x01, 0x21, 0x13, 0x5e, 0x12, 0xa4, 0x43];
        build_message(
            ALLOCATE_SUCCESS,
            transaction_id,
            &[(ATTR_XOR_RELAYED_ADDRESS, &relayed[..])],
        )
    }

    /// Check the trailing MESSAGE-INTEGRITY of a raw request.
    fn integrity_is_valid(raw: &[u8], user: &str, password: &str) -> bool {
        if raw.len() < HEADER_LEN + INTEGRITY_ATTR_LEN {
            return false;
        }
        let at = raw.len() - INTEGRITY_ATTR_LEN;
        if raw[at..at + 2] != ATTR_MESSAGE_INTEGRITY.to_be_bytes() {
            return false;
        }

        let mut key_input = format!("{}:", user).into_bytes();
        key_input.extend_from_slice(REALM);
        key_input.extend_from_slice(format!(":{}", password).as_bytes());
        let key = Md5::digest(&key_input);

        let mut mac = HmacSha1::new_from_slice(&key).unwrap();
        mac.update(&raw[..at]);
        mac.verify_slice(&raw[at + 4..]).is_ok()
    }

    #[test]
    fn test_allocate_request_layout() {
        let packet = build_message(
            ALLOCATE_REQUEST,
            &[0u8; 12],
            &[(ATTR_REQUESTED_TRANSPORT, &REQUESTED_UDP[..])],
        );
        assert_eq!(packet.len(), 28);
        assert_eq!(packet[0..2], [0x00, 0x03]);
        assert_eq!(packet[20..22], [0x00, 0x19]);
        assert_eq!(packet[24], 17);
    }

    #[test]
    fn test_auth_challenges_are_recognized() {
        for code in AUTH_CHALLENGES {
            assert!(matches!(
                classify_allocate_response(&error_response(code)),
                Ok(AllocateReply::Challenge(_))
            ));
        }
    }

    #[test]
    fn test_other_errors_are_protocol_errors() {
        assert!(matches!(
            classify_allocate_response(&error_response(486)),
            Err(ProbeError::Protocol(_))
        ));
        let no_code = parse_message(&build_message(ALLOCATE_ERROR, &[9u8; 12], &[])).unwrap();
        assert!(matches!(
            classify_allocate_response(&no_code),
            Err(ProbeError::MalformedResponse(_))
        ));
        let no_relay = parse_message(&build_message(ALLOCATE_SUCCESS, &[9u8; 12], &[])).unwrap();
        assert!(matches!(
            classify_allocate_response(&no_relay),
            Err(ProbeError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_authenticated_allocate_is_signed() {
        let credentials = Credentials::new("alice", "s3cret").unwrap();
        let challenge = Challenge {
            realm: REALM.to_vec(),
            nonce: NONCE.to_vec(),
        };
        let packet = authenticated_allocate(&[7u8; 12], &credentials, &challenge).unwrap();

        let msg = parse_message(&packet).unwrap();
        assert_eq!(msg.attribute(ATTR_USERNAME), Some(&b"alice"[..]));
        assert_eq!(msg.attribute(ATTR_REALM), Some(REALM));
        assert_eq!(msg.attribute(ATTR_NONCE), Some(NONCE));
        assert!(integrity_is_valid(&packet, "alice", "s3cret"));
        assert!(!integrity_is_valid(&packet, "alice", "wrong"));
    }

    #[tokio::test]
    async fn test_challenge_without_credentials_counts_as_alive() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (n, peer) = server.recv_from(&mut buf).await.unwrap();
            let request = parse_message(&buf[..n]).unwrap();
            assert_eq!(request.msg_type, ALLOCATE_REQUEST);
            assert_eq!(
                request.attribute(ATTR_REQUESTED_TRANSPORT),
                Some(&REQUESTED_UDP[..])
            );
            server
                .send_to(&challenge_reply(&request.transaction_id), peer)
                .await
                .unwrap();
        });

        assert!(run_turn_probe(addr, None, Duration::from_secs(2)).await.is_ok());
    }

    #[tokio::test]
    async fn test_challenge_is_answered_with_credentials() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        let fake = tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (n, peer) = server.recv_from(&mut buf).await.unwrap();
            let first = parse_message(&buf[..n]).unwrap();
            assert_eq!(first.attribute(ATTR_USERNAME), None);
            server
                .send_to(&challenge_reply(&first.transaction_id), peer)
                .await
                .unwrap();

            let (n, retry_peer) = server.recv_from(&mut buf).await.unwrap();
            let second = parse_message(&buf[..n]).unwrap();
            assert_eq!(second.msg_type, ALLOCATE_REQUEST);
            assert_ne!(second.transaction_id, first.transaction_id);
            assert_eq!(second.attribute(ATTR_USERNAME), Some(&b"alice"[..]));
            assert_eq!(second.attribute(ATTR_REALM), Some(REALM));
            assert_eq!(second.attribute(ATTR_NONCE), Some(NONCE));
            assert!(integrity_is_valid(&buf[..n], "alice", "s3cret"));
            server
                .send_to(&relayed_reply(&second.transaction_id), retry_peer)
                .await
                .unwrap();
            retry_peer == peer
        });

        let credentials = Credentials::new("alice", "s3cret").unwrap();
        let result = run_turn_probe(addr, Some(&credentials), Duration::from_secs(2)).await;
        assert!(result.is_ok(), "{:?}", result);
        // The retry reuses the challenged socket.
        assert!(fake.await.unwrap());
    }

    #[tokio::test]
    async fn test_rejected_credentials_fail() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            for _ in 0..2 {
                let (n, peer) = server.recv_from(&mut buf).await.unwrap();
                let request = parse_message(&buf[..n]).unwrap();
                server
                    .send_to(&challenge_reply(&request.transaction_id), peer)
                    .await
                    .unwrap();
            }
        });

        let credentials = Credentials::new("alice", "wrong").unwrap();
        let err = run_turn_probe(addr, Some(&credentials), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Protocol(_)));
    }
}
