//! UDP Datagram Codec and Mux
//!
//! Audio datagrams carry a fixed 16-byte header followed by AES-128-CTR
//! ciphertext. The mux routes each inbound datagram to the owning device
//! connection by the MAC embedded in the header; everything else about the
//! datagram (cookie, sequence, decryption) is the session's business.
//!
//! Datagram layout, network byte order:
//!
//! ```text
//! offset  size  field
//!  0      1     type (1 = audio)
//!  1      1     flags (ignored)
//!  2      2     payload length
//!  4      6     MAC
//! 10      2     cookie
//! 12      4     sequence
//! 16      N     ciphertext
//! ```

use std::io;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::ConfigManager;
use crate::metrics::GatewayMetrics;
use crate::registry::DeviceRegistry;

pub const HEADER_LEN: usize = 16;
pub const TYPE_AUDIO: u8 = 1;

/// Parsed 16-byte datagram header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramHeader {
    pub packet_type: u8,
    pub payload_len: u16,
    pub mac: [u8; 6],
    pub cookie: u16,
    pub sequence: u32,
}

impl DatagramHeader {
    pub fn new(payload_len: u16, mac: [u8; 6], cookie: u16, sequence: u32) -> Self {
        DatagramHeader {
            packet_type: TYPE_AUDIO,
            payload_len,
            mac,
            cookie,
            sequence,
        }
    }

    /// Parses the header from the front of a datagram. Returns `None` when
    /// the datagram is shorter than the header or the declared payload.
    pub fn parse(datagram: &[u8]) -> Option<DatagramHeader> {
        if datagram.len() < HEADER_LEN {
            return None;
        }
        let payload_len = u16::from_be_bytes([datagram[2], datagram[3]]);
        if datagram.len() < HEADER_LEN + payload_len as usize {
            return None;
        }

        let mut mac = [0u8; 6];
        mac.copy_from_slice(&datagram[4..10]);

        Some(DatagramHeader {
            packet_type: datagram[0],
            payload_len,
            mac,
            cookie: u16::from_be_bytes([datagram[10], datagram[11]]),
            sequence: u32::from_be_bytes([
                datagram[12],
                datagram[13],
                datagram[14],
                datagram[15],
            ]),
        })
    }

    /// Encodes the header into a fresh 16-byte array.
    ///
    /// Always a new allocation: the array is handed to both the cipher (as
    /// counter block) and the socket, and concurrent encodes must never
    /// share backing storage.
    pub fn encode(&self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        buf[0] = self.packet_type;
        buf[2..4].copy_from_slice(&self.payload_len.to_be_bytes());
        buf[4..10].copy_from_slice(&self.mac);
        buf[10..12].copy_from_slice(&self.cookie.to_be_bytes());
        buf[12..16].copy_from_slice(&self.sequence.to_be_bytes());
        buf
    }

    /// The MAC in the canonical lowercase hex-colon form used as the
    /// registry key.
    pub fn mac_string(&self) -> String {
        format_mac(&self.mac)
    }
}

pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Parses `aa:bb:cc:dd:ee:ff` into raw bytes.
pub fn parse_mac(mac: &str) -> Option<[u8; 6]> {
    let mut out = [0u8; 6];
    let mut parts = mac.split(':');
    for slot in out.iter_mut() {
        let part = parts.next()?;
        if part.len() != 2 {
            return None;
        }
        *slot = u8::from_str_radix(part, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(out)
}

/// Runs the shared UDP ingress loop until shutdown.
///
/// Malformed datagrams and unknown MACs are dropped; a socket error ends the
/// loop with `Err` (the server treats that as fatal).
pub async fn run_ingress(
    socket: Arc<UdpSocket>,
    registry: Arc<DeviceRegistry>,
    config: Arc<ConfigManager>,
    metrics: GatewayMetrics,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let mut buf = [0u8; 2048];
    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                let (len, peer) = result?;
                let datagram = &buf[..len];

                let header = match DatagramHeader::parse(datagram) {
                    Some(h) => h,
                    None => {
                        metrics.udp_dropped.inc();
                        continue;
                    }
                };
                if header.packet_type != TYPE_AUDIO {
                    metrics.udp_dropped.inc();
                    continue;
                }

                let conn = match registry.get(&header.mac_string()) {
                    Some(c) => c,
                    None => {
                        debug!("UDP datagram for unregistered MAC {}", header.mac_string());
                        metrics.udp_dropped.inc();
                        continue;
                    }
                };

                let mut iv = [0u8; 16];
                iv.copy_from_slice(&datagram[..HEADER_LEN]);
                let ciphertext = &datagram[HEADER_LEN..HEADER_LEN + header.payload_len as usize];

                let snapshot = config.snapshot();
                if conn.handle_datagram(peer, &header, &iv, ciphertext, snapshot.log_invalid_cookie) {
                    metrics.udp_received.inc();
                } else {
                    metrics.udp_dropped.inc();
                }
            }
            _ = shutdown.changed() => {
                info!("UDP ingress stopping");
                return Ok(());
            }
        }
    }
}
