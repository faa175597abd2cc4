//! Gateway Error Types
//!
//! One error enum shared across the codec, connection and session layers.
//! Protocol errors tear down the offending connection; they never affect
//! other devices.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed wire data (bad length prefix, truncated field, bad UTF-8).
    #[error("malformed packet: {0}")]
    Protocol(&'static str),

    /// Remaining-length exceeds the packet ceiling.
    #[error("packet too large: {0} bytes")]
    PacketTooLarge(usize),

    /// A packet type the gateway does not accept from devices.
    #[error("unexpected packet type 0x{0:02x}")]
    UnexpectedPacket(u8),

    /// PUBLISH with QoS other than 0.
    #[error("unsupported QoS {0}")]
    UnsupportedQos(u8),

    /// Client-id failed the `<board>@@@<mac>@@@<uuid>` grammar.
    #[error("invalid client id")]
    InvalidClientId,

    /// Device hello carried a version other than 3.
    #[error("unsupported hello version")]
    BadHelloVersion,

    /// No chat servers configured for this device's class.
    #[error("no chat servers configured")]
    NoChatServers,

    /// Upstream WebSocket failed before the handshake resolved.
    #[error("upstream handshake failed: {0}")]
    Upstream(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
