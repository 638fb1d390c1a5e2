//! NTP probe implementation using raw UDP packets.

use std::net::SocketAddr;
use std::time::Duration;

use chrono::Utc;

use super::{millis, udp_exchange, ProbeError, Reply};

const PACKET_LEN: usize = 48;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

const MODE_CLIENT: u8 = 3;
const MODE_SERVER: u8 = 4;
const VERSION: u8 = 4;

/// Run an NTP probe against the given server.
///
/// Sends a client request and waits for a server reply echoing our transmit
/// timestamp.
pub async fn run_ntp_probe(addr: SocketAddr, timeout: Duration) -> Result<f64, ProbeError> {
    let transmit = ntp_timestamp_now();
    let packet = build_ntp_request(transmit);

    let elapsed = udp_exchange(addr, &packet, timeout, |buf| {
        Reply::Done(validate_ntp_reply(buf, transmit))
    })
    .await?;

    Ok(millis(elapsed))
}

/// Current time as a 64-bit NTP timestamp (32.32 fixed point).
fn ntp_timestamp_now() -> u64 {
    let now = Utc::now();
    let secs = now.timestamp() as u64 + NTP_UNIX_OFFSET;
    let fraction = ((now.timestamp_subsec_nanos() as u64) << 32) / 1_000_000_000;
    (secs << 32) | fraction
}

/// Build a 48 byte client request. LI=0, VN=4, Mode=3.
fn build_ntp_request(transmit: u64) -> [u8; PACKET_LEN] {
    let mut packet = [0u8; PACKET_LEN];
    packet[0] = (VERSION << 3) | MODE_CLIENT;
    packet[40..48].copy_from_slice(&transmit.to_be_bytes());
    packet
}

fn validate_ntp_reply(buf: &[u8], sent_transmit: u64) -> Result<(), ProbeError> {
    if buf.len() < PACKET_LEN {
        return Err(ProbeError::MalformedResponse(format!(
            "response too short: {} bytes",
            buf.len()
        )));
    }

    let mode = buf[0] & 0x07;
    let version = (buf[0] >> 3) & 0x07;
    if mode != MODE_SERVER {
        return Err(ProbeError::MalformedResponse(format!("unexpected mode {}", mode)));
    }
    if !(1..=4).contains(&version) {
        return Err(ProbeError::MalformedResponse(format!(
            "unsupported version {}",
            version
        )));
    }

    let originate = read_u64(&buf[24..32]);
    if originate != sent_transmit {
        return Err(ProbeError::MalformedResponse(
            "originate timestamp does not match request".to_string(),
        ));
    }

    let transmit = read_u64(&buf[40..48]);
    if transmit == 0 {
        return Err(ProbeError::MalformedResponse("zero transmit timestamp".to_string()));
    }

    let stratum = buf[1];
    if stratum == 0 {
        let code = String::from_utf8_lossy(&buf[12..16]).trim_end_matches('\0').to_string();
        return Err(ProbeError::Protocol(format!("kiss-o'-death {}", code)));
    }
    if stratum > 15 {
        return Err(ProbeError::Protocol(format!("unsynchronized (stratum {})", stratum)));
    }

    Ok(())
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(raw)
}
