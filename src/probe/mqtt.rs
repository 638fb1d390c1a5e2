//! MQTT probe implementation (MQTT 3.1.1 CONNECT/CONNACK over TCP).

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{millis, ProbeError};

const CONNECT: u8 = 0x10;
const CONNACK: u8 = 0x20;
const DISCONNECT: [u8; 2] = [0xE0, 0x00];

const PROTOCOL_LEVEL: u8 = 4;
const CLEAN_SESSION: u8 = 0x02;
const KEEP_ALIVE_SECS: u16 = 30;

/// Run an MQTT probe: connect, send CONNECT, and expect an accepting CONNACK.
pub async fn run_mqtt_probe(addr: SocketAddr, timeout: Duration) -> Result<f64, ProbeError> {
    let start = Instant::now();
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|e| ProbeError::from_io(e, timeout))?;

    let client_id = format!("dogdorm-{:08x}", rand::random::<u32>());
    stream
        .write_all(&build_connect(&client_id))
        .await
        .map_err(|e| ProbeError::from_io(e, timeout))?;

    let mut connack = [0u8; 4];
    stream
        .read_exact(&mut connack)
        .await
        .map_err(|e| ProbeError::from_io(e, timeout))?;
    let elapsed = start.elapsed();

    // Best effort; the verdict is already known.
    let _ = stream.write_all(&DISCONNECT).await;

    validate_connack(&connack)?;
    Ok(millis(elapsed))
}

/// Build a CONNECT packet with a clean session and no credentials.
fn build_connect(client_id: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(12 + client_id.len());
    // Variable header: protocol name, level, flags, keep alive.
    body.extend_from_slice(&4u16.to_be_bytes());
    body.extend_from_slice(b"MQTT");
    body.push(PROTOCOL_LEVEL);
    body.push(CLEAN_SESSION);
    body.extend_from_slice(&KEEP_ALIVE_SECS.to_be_bytes());
    // Payload: client identifier.
    body.extend_from_slice(&(client_id.len() as u16).to_be_bytes());
    body.extend_from_slice(client_id.as_bytes());

    let mut packet = vec![CONNECT];
    encode_remaining_length(body.len(), &mut packet);
    packet.extend_from_slice(&body);
    packet
}

/// MQTT variable-length integer: 7 bits per byte, high bit marks continuation.
fn encode_remaining_length(mut len: usize, out: &mut Vec<u8>) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
}

fn validate_connack(packet: &[u8; 4]) -> Result<(), ProbeError> {
    if packet[0] != CONNACK {
        return Err(ProbeError::Protocol(format!(
            "expected CONNACK, got packet type {:#04x}",
            packet[0]
        )));
    }
    if packet[1] != 2 || packet[2] & 0xFE != 0 {
        return Err(ProbeError::MalformedResponse("malformed CONNACK".to_string()));
    }

    match packet[3] {
        0 => Ok(()),
        1 => Err(ProbeError::Protocol("unacceptable protocol version".to_string())),
        2 => Err(ProbeError::Protocol("identifier rejected".to_string())),
        3 => Err(ProbeError::Protocol("server unavailable".to_string())),
        4 => Err(ProbeError::Protocol("bad user name or password".to_string())),
        5 => Err(ProbeError::Protocol("not authorized".to_string())),
        code => Err(ProbeError::Protocol(format!("connect refused with code {}", code))),
    }
}
