// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Device Connection Handling
//!
//! One [`Connection`] per accepted TCP socket. The socket task drives a
//! small state machine: AWAIT_CONNECT until a valid CONNECT arrives, then
//! REGISTERED until the device disconnects, a protocol error occurs, or the
//! keep-alive sweeper closes it. While registered, QoS 0 PUBLISH payloads
//! carry the JSON control plane: `hello` opens an upstream session,
//! `goodbye` closes it, everything else is forwarded to the live session.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use regex::Regex;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::mqtt::{self, Codec, Packet, Publish};
use crate::server::GatewayContext;
use crate::session::Session;
use crate::udp::DatagramHeader;

/// Topic the gateway publishes on for a given device.
pub const REPLY_TOPIC_PREFIX: &str = "devices/p2p/";

/// Required version in device hello messages.
const HELLO_VERSION: u64 = 3;

fn mac_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("^[0-9a-f]{2}(:[0-9a-f]{2}){5}$").unwrap())
}

/// Derives the canonical MAC from a `<board>@@@<mac>@@@<uuid>` client-id.
///
/// The MAC segment is always the second part; underscores become colons.
/// Returns `None` when the grammar or the MAC shape fails.
pub fn mac_from_client_id(client_id: &str) -> Option<String> {
    let parts: Vec<&str> = client_id.split("@@@").collect();
    if parts.len() < 2 {
        return None;
    }
    let mac = parts[1].replace('_', ":");
    if mac_regex().is_match(&mac) {
        Some(mac)
    } else {
        None
    }
}

/// A registered device connection.
pub struct Connection {
    mac: String,
    reply_topic: String,
    keep_alive: Duration,
    writer: mpsc::Sender<Vec<u8>>,
    shutdown: Notify,
    closing: AtomicBool,
    state: Mutex<ConnState>,
}

struct ConnState {
    last_activity: Instant,
    session: Option<Arc<Session>>,
    /// Admin commands awaiting a device response, keyed by message type.
    pending: HashMap<String, oneshot::Sender<Value>>,
}

impl Connection {
    pub fn new(mac: String, keep_alive_secs: u16, writer: mpsc::Sender<Vec<u8>>) -> Arc<Self> {
        let reply_topic = format!("{}{}", REPLY_TOPIC_PREFIX, mac);
        Arc::new(Connection {
            mac,
            reply_topic,
            keep_alive: Duration::from_secs(keep_alive_secs as u64),
            writer,
            shutdown: Notify::new(),
            closing: AtomicBool::new(false),
            state: Mutex::new(ConnState {
                last_activity: Instant::now(),
                session: None,
                pending: HashMap::new(),
            }),
        })
    }

    /// A connection with no transport behind it, for unit tests.
    pub fn for_tests(mac: &str, keep_alive_secs: u16) -> Arc<Self> {
        let (tx, _rx) = mpsc::channel(8);
        Self::new(mac.to_string(), keep_alive_secs, tx)
    }

    pub fn mac(&self) -> &str {
        &self.mac
    }

    pub fn reply_topic(&self) -> &str {
        &self.reply_topic
    }

    /// Records inbound bytes; called on every socket read, not per packet.
    pub fn touch(&self) {
        self.state.lock().unwrap().last_activity = Instant::now();
    }

    /// Queues a raw pre-encoded frame for the device.
    pub fn send_frame(&self, frame: Vec<u8>) {
        if self.writer.try_send(frame).is_err() {
            debug!("dropping frame for {}: writer gone or full", self.mac);
        }
    }

    /// Publishes a payload on the device's reply topic.
    pub fn publish(&self, payload: &[u8]) {
        self.send_frame(mqtt::encode_publish(&self.reply_topic, payload));
    }

    pub fn publish_json(&self, value: &Value) {
        self.publish(value.to_string().as_bytes());
    }

    pub fn attach_session(&self, session: Arc<Session>) {
        self.state.lock().unwrap().session = Some(session);
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.state.lock().unwrap().session.clone()
    }

    pub fn take_session(&self) -> Option<Arc<Session>> {
        self.state.lock().unwrap().session.take()
    }

    /// Clears the session slot, but only if it still holds this session.
    /// A replaced session's late teardown must not clear its successor.
    pub fn clear_session(&self, session: &Arc<Session>) {
        let mut state = self.state.lock().unwrap();
        if let Some(current) = &state.session {
            if Arc::ptr_eq(current, session) {
                state.session = None;
            }
        }
    }

    /// True while an upstream session's WebSocket is open.
    pub fn is_alive(&self) -> bool {
        self.session().map(|s| s.is_open()).unwrap_or(false)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Starts closing this connection. With a live session the transport
    /// stays up until the session's goodbye has been published; without one
    /// it closes immediately.
    pub fn begin_close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        match self.session() {
            Some(session) => session.begin_close(),
            None => self.shutdown.notify_one(),
        }
    }

    /// Used by session teardown once the goodbye is out.
    pub(crate) fn notify_shutdown(&self) {
        self.shutdown.notify_one();
    }

    pub(crate) async fn closed(&self) {
        self.shutdown.notified().await;
    }

    /// Closes the connection if it has been idle longer than its declared
    /// keep-alive. The comparison is deliberately literal (no 1.5x slack):
    /// a device pinging exactly at the interval may be closed.
    pub fn check_keep_alive(&self, now: Instant) {
        if self.keep_alive.is_zero() || self.is_closing() {
            return;
        }
        let last = self.state.lock().unwrap().last_activity;
        if now.duration_since(last) > self.keep_alive {
            info!("keep-alive expired for {}", self.mac);
            self.begin_close();
        }
    }

    /// Registers an admin command waiting for a device response of the
    /// given type. A newer command for the same type supersedes the older
    /// waiter.
    pub fn register_pending(&self, msg_type: String) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        self.state.lock().unwrap().pending.insert(msg_type, tx);
        rx
    }

    /// Hands a device message to a waiting admin command, if any.
    fn resolve_pending(&self, value: &Value) -> bool {
        let msg_type = match value.get("type").and_then(Value::as_str) {
            Some(t) => t,
            None => return false,
        };
        let sender = self.state.lock().unwrap().pending.remove(msg_type);
        match sender {
            Some(tx) => tx.send(value.clone()).is_ok(),
            None => false,
        }
    }

    /// Routes an inbound UDP datagram into the live session. Returns true
    /// when the payload was accepted and forwarded.
    pub fn handle_datagram(
        &self,
        peer: SocketAddr,
        header: &DatagramHeader,
        iv: &[u8; 16],
        ciphertext: &[u8],
        log_invalid_cookie: bool,
    ) -> bool {
        match self.session() {
            Some(session) => session.handle_datagram(peer, header, iv, ciphertext, log_invalid_cookie),
            None => false,
        }
    }
}

/// Drives one device socket from accept to close.
pub async fn serve_connection(stream: TcpStream, ctx: GatewayContext) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let (mut read_half, mut write_half) = stream.into_split();

    let mut codec = Codec::new();
    let mut buf = BytesMut::with_capacity(4096);

    // AWAIT_CONNECT: nothing but a CONNECT is acceptable, and an invalid
    // client-id closes the socket without a CONNACK.
    let connect = loop {
        match codec.decode(&mut buf) {
            Ok(Some(Packet::Connect(c))) => break c,
            Ok(Some(other)) => {
                debug!("{}: {:?} before CONNECT", peer, other);
                return;
            }
            Ok(None) => match read_half.read_buf(&mut buf).await {
                Ok(0) => return,
                Ok(_) => {}
                Err(e) => {
                    debug!("{}: read failed before CONNECT: {}", peer, e);
                    return;
                }
            },
            Err(e) => {
                debug!("{}: protocol error before CONNECT: {}", peer, e);
                return;
            }
        }
    };

    let mac = match mac_from_client_id(&connect.client_id) {
        Some(mac) => mac,
        None => {
            debug!("{}: invalid client id {:?}", peer, connect.client_id);
            return;
        }
    };

    let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(64);
    tokio::spawn(async move {
        while let Some(frame) = writer_rx.recv().await {
            if write_half.write_all(&frame).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    let conn = Connection::new(mac.clone(), connect.keep_alive_secs, writer_tx);
    ctx.registry.insert(conn.clone());
    ctx.metrics.connections_total.inc();
    ctx.metrics.connections_active.inc();

    conn.send_frame(mqtt::encode_connack(0));
    info!(
        "device {} registered from {} (keep-alive {}s)",
        mac, peer, connect.keep_alive_secs
    );

    if let Err(e) = registered_loop(&conn, &ctx, &mut read_half, &mut codec, &mut buf).await {
        debug!("closing {}: {}", mac, e);
    }

    // Teardown: the session (if any) still owes its goodbye; the writer
    // keeps the socket alive until every Connection handle is gone.
    if let Some(session) = conn.take_session() {
        session.begin_close();
    }
    ctx.registry.remove(&conn);
    ctx.metrics.connections_active.dec();
    info!("device {} disconnected", mac);
}

/// REGISTERED state: process packets in arrival order until the socket
/// closes, a protocol error occurs, or the connection is asked to close.
async fn registered_loop(
    conn: &Arc<Connection>,
    ctx: &GatewayContext,
    read_half: &mut OwnedReadHalf,
    codec: &mut Codec,
    buf: &mut BytesMut,
) -> Result<(), GatewayError> {
    loop {
        while let Some(packet) = codec.decode(buf)? {
            if !handle_packet(conn, ctx, packet).await? {
                return Ok(());
            }
        }

        tokio::select! {
            _ = conn.closed() => return Ok(()),
            result = read_half.read_buf(buf) => {
                if result? == 0 {
                    return Ok(());
                }
                conn.touch();
            }
        }
    }
}

/// Returns `Ok(false)` on a clean DISCONNECT, `Err` on protocol errors.
async fn handle_packet(
    conn: &Arc<Connection>,
    ctx: &GatewayContext,
    packet: Packet,
) -> Result<bool, GatewayError> {
    match packet {
        Packet::Publish(publish) => {
            if publish.qos != 0 {
                return Err(GatewayError::UnsupportedQos(publish.qos));
            }
            handle_publish(conn, ctx, publish).await?;
            Ok(true)
        }
        Packet::Subscribe(subscribe) => {
            // The gateway keeps no subscription state; the device is
            // implicitly subscribed to its reply topic.
            conn.send_frame(mqtt::encode_suback(
                subscribe.packet_id,
                subscribe.filters.len(),
            ));
            Ok(true)
        }
        Packet::PingReq => {
            conn.send_frame(mqtt::encode_pingresp());
            Ok(true)
        }
        Packet::Disconnect => Ok(false),
        Packet::Connect(_) => Err(GatewayError::Protocol("duplicate CONNECT")),
    }
}

async fn handle_publish(
    conn: &Arc<Connection>,
    ctx: &GatewayContext,
    publish: Publish,
) -> Result<(), GatewayError> {
    let value: Value = match serde_json::from_slice(&publish.payload) {
        Ok(v) => v,
        Err(e) => {
            warn!("{}: unparsable publish payload: {}", conn.mac(), e);
            return Ok(());
        }
    };

    match value.get("type").and_then(Value::as_str) {
        Some("hello") => {
            if value.get("version").and_then(Value::as_u64) != Some(HELLO_VERSION) {
                return Err(GatewayError::BadHelloVersion);
            }
            start_session(conn, ctx, &value).await;
            Ok(())
        }
        Some("goodbye") => {
            if let Some(session) = conn.take_session() {
                session.begin_close();
            }
            Ok(())
        }
        _ => {
            if conn.resolve_pending(&value) {
                return Ok(());
            }
            match conn.session() {
                Some(session) => {
                    // Forward the device's JSON verbatim as WebSocket text.
                    let text = String::from_utf8_lossy(&publish.payload).into_owned();
                    session.forward_text(text);
                }
                None => {
                    let reply = json!({
                        "type": "goodbye",
                        "session_id": value.get("session_id").cloned().unwrap_or(Value::Null),
                    });
                    conn.publish_json(&reply);
                }
            }
            Ok(())
        }
    }
}

/// Opens a session for a device hello, replacing any prior one.
async fn start_session(conn: &Arc<Connection>, ctx: &GatewayContext, hello: &Value) {
    if let Some(old) = conn.take_session() {
        old.begin_close();
        // Let the old WebSocket finish its close so the goodbye for the
        // defunct session is published before the new hello reply.
        old.wait_closed(Duration::from_millis(100)).await;
    }

    match Session::open(conn.clone(), ctx.clone(), hello).await {
        Ok(session) => {
            conn.attach_session(session.clone());
            conn.publish_json(&session.hello_reply(&ctx.env.public_ip, ctx.env.udp_port));
        }
        Err(e) => {
            warn!("session setup for {} failed: {}", conn.mac(), e);
            ctx.metrics.upstream_failures.inc();
            conn.publish_json(&json!({
                "type": "error",
                "message": "处理 hello 消息失败",
            }));
        }
    }
}
