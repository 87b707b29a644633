//! Minimal SNTP client used as the device's [`TimeSource`].
//!
//! Sends one SNTPv3 client-mode request per server and reads the transmit
//! timestamp from the reply. Servers are tried in the configured order until
//! one answers with a usable response.

use crate::clock::TimeSource;
use crate::error::ClockError;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;
use tracing::{debug, warn};

/// Well-known NTP port.
pub const NTP_PORT: u16 = 123;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

const PACKET_LEN: usize = 48;

/// LI = 0, VN = 3, Mode = 3 (client).
const CLIENT_REQUEST_HEADER: u8 = 0x1B;

const MODE_SERVER: u8 = 4;
const MODE_BROADCAST: u8 = 5;

/// SNTP time source over UDP.
#[derive(Debug, Clone)]
pub struct SntpClient {
    servers: Vec<String>,
    timeout: Duration,
}

impl SntpClient {
    pub fn new(servers: Vec<String>, timeout: Duration) -> Self {
        Self { servers, timeout }
    }

    /// Query a single server.
    pub fn query(&self, server: &str) -> Result<u64, ClockError> {
        let addr = resolve(server)?;
        let bind_addr = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr).map_err(unreachable)?;
        socket
            .set_read_timeout(Some(self.timeout))
            .map_err(unreachable)?;

        let mut request = [0u8; PACKET_LEN];
        request[0] = CLIENT_REQUEST_HEADER;
        socket.send_to(&request, addr).map_err(unreachable)?;

        let mut response = [0u8; PACKET_LEN * 2];
        let (len, from) = socket.recv_from(&mut response).map_err(unreachable)?;
        if from.ip() != addr.ip() {
            return Err(ClockError::InvalidResponse(format!(
                "reply from unexpected peer {from}"
            )));
        }

        parse_response(&response[..len])
    }
}

impl TimeSource for SntpClient {
    fn fetch_epoch(&mut self) -> Result<u64, ClockError> {
        let mut last_error = ClockError::SourceUnreachable("no time servers configured".into());

        for server in self.servers.iter().filter(|s| !s.trim().is_empty()) {
            match self.query(server) {
                Ok(epoch) => {
                    debug!(server = %server, epoch, "SNTP reply");
                    return Ok(epoch);
                }
                Err(e) => {
                    warn!(server = %server, error = %e, "SNTP query failed");
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    fn describe(&self) -> String {
        format!("sntp[{}]", self.servers.join(","))
    }
}

/// Accepts `host`, `host:port`, an IPv4 or bare IPv6 literal, or
/// `[v6]:port`. Entries without a port use [`NTP_PORT`].
fn resolve(server: &str) -> Result<SocketAddr, ClockError> {
    if let Ok(ip) = server.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, NTP_PORT));
    }
    if let Ok(addr) = server.parse::<SocketAddr>() {
        return Ok(addr);
    }

    let target = match server.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        Some(literal) => format!("[{literal}]:{NTP_PORT}"),
        None if server.contains(':') => server.to_string(),
        None => format!("{server}:{NTP_PORT}"),
    };

    target
        .to_socket_addrs()
        .map_err(|e| ClockError::SourceUnreachable(format!("{server}: {e}")))?
        .next()
        .ok_or_else(|| ClockError::SourceUnreachable(format!("{server}: no address")))
}

fn unreachable(e: std::io::Error) -> ClockError {
    ClockError::SourceUnreachable(e.to_string())
}

/// Extract Unix seconds from an SNTP reply.
pub fn parse_response(packet: &[u8]) -> Result<u64, ClockError> {
    if packet.len() < PACKET_LEN {
        return Err(ClockError::InvalidResponse(format!(
            "short packet: {} bytes",
            packet.len()
        )));
    }

    let mode = packet[0] & 0x07;
    if mode != MODE_SERVER && mode != MODE_BROADCAST {
        return Err(ClockError::InvalidResponse(format!("unexpected mode {mode}")));
    }

    // Stratum 0 is a kiss-of-death packet
    if packet[1] == 0 {
        return Err(ClockError::InvalidResponse("kiss-of-death".to_string()));
    }

    let ntp_secs = u32::from_be_bytes([packet[40], packet[41], packet[42], packet[43]]) as u64;
    if ntp_secs == 0 {
        return Err(ClockError::InvalidResponse(
            "empty transmit timestamp".to_string(),
        ));
    }

    // Values below the offset belong to NTP era 1 (after 2036-02-07)
    let unix_secs = if ntp_secs >= NTP_UNIX_OFFSET {
        ntp_secs - NTP_UNIX_OFFSET
    } else {
        ntp_secs + (1u64 << 32) - NTP_UNIX_OFFSET
    };

    Ok(unix_secs)
}
