// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Session Bridge
//!
//! One [`Session`] per active voice dialogue. It owns exactly one upstream
//! WebSocket and shuttles traffic for its lifetime: device JSON travels as
//! text frames, audio travels as binary frames on the WebSocket side and as
//! encrypted UDP datagrams on the device side. Teardown always publishes a
//! goodbye on the device's reply topic, exactly once.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::crypto;
use crate::error::GatewayError;
use crate::metrics::GatewayMetrics;
use crate::server::GatewayContext;
use crate::udp::{self, DatagramHeader};
use crate::upstream;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One device-to-upstream dialogue.
pub struct Session {
    session_id: String,
    cookie: u16,
    key: [u8; 16],
    mac_bytes: [u8; 6],
    /// The 16-byte header at sequence 0, handed to the device at hello so
    /// both sides derive CTR counter blocks the same way.
    nonce: [u8; 16],
    /// Upstream-negotiated audio parameters, echoed in the hello reply.
    audio_params: Value,
    udp: Arc<UdpSocket>,
    ws_out: mpsc::Sender<Message>,
    close_requested: Notify,
    closed: AtomicBool,
    closed_notify: Notify,
    started: Instant,
    state: Mutex<SessionState>,
}

struct SessionState {
    local_seq: u32,
    remote_seq: u32,
    peer: Option<SocketAddr>,
}

impl Session {
    /// Opens the upstream WebSocket, completes the hello handshake and
    /// spawns the pump tasks. The returned session is live.
    pub async fn open(
        conn: Arc<Connection>,
        ctx: GatewayContext,
        device_hello: &Value,
    ) -> Result<Arc<Session>, GatewayError> {
        let chat = ctx.chat.snapshot();
        let url = upstream::select_chat_server(&chat, conn.mac())?;
        let request = upstream::build_request(&url, conn.mac(), &ctx.env.upstream_token)?;

        debug!("{}: dialing {}", conn.mac(), url);
        let (ws_stream, _) = tokio_tungstenite::connect_async(request).await?;
        let (mut write, mut read) = ws_stream.split();

        let client_hello = json!({
            "type": "hello",
            "version": 1,
            "transport": "websocket",
            "audio_params": device_hello.get("audio_params").cloned().unwrap_or(Value::Null),
        });
        write.send(Message::Text(client_hello.to_string())).await?;

        let server_hello = await_server_hello(&mut read).await?;
        let session_id = server_hello
            .get("session_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let audio_params = server_hello
            .get("audio_params")
            .cloned()
            .unwrap_or(Value::Null);

        let mac_bytes =
            udp::parse_mac(conn.mac()).ok_or(GatewayError::InvalidClientId)?;
        let cookie: u16 = rand::random();
        let key: [u8; 16] = rand::random();
        let nonce = DatagramHeader::new(0, mac_bytes, cookie, 0).encode();

        let (ws_out, mut ws_out_rx) = mpsc::channel::<Message>(64);

        let session = Arc::new(Session {
            session_id,
            cookie,
            key,
            mac_bytes,
            nonce,
            audio_params,
            udp: ctx.udp.clone(),
            ws_out,
            close_requested: Notify::new(),
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
            started: Instant::now(),
            state: Mutex::new(SessionState {
                local_seq: 0,
                remote_seq: 0,
                peer: None,
            }),
        });

        tokio::spawn(async move {
            while let Some(msg) = ws_out_rx.recv().await {
                let is_close = matches!(msg, Message::Close(_));
                if write.send(msg).await.is_err() || is_close {
                    break;
                }
            }
        });

        let pump = session.clone();
        let metrics = ctx.metrics.clone();
        tokio::spawn(async move {
            pump.run(read, conn, metrics).await;
        });

        ctx.metrics.sessions_opened.inc();
        Ok(session)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn cookie(&self) -> u16 {
        self.cookie
    }

    /// The hello reply published to the device, carrying everything it
    /// needs to start the UDP audio flow.
    pub fn hello_reply(&self, public_ip: &str, udp_port: u16) -> Value {
        json!({
            "type": "hello",
            "transport": "udp",
            "session_id": self.session_id,
            "audio_params": self.audio_params,
            "udp": {
                "server": public_ip,
                "port": udp_port,
                "encryption": crypto::CIPHER_NAME,
                "key": hex::encode(self.key),
                "nonce": hex::encode(self.nonce),
            },
        })
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// Asks the session to close. Teardown (goodbye, summary log, slot
    /// clearing) runs on the pump task.
    pub fn begin_close(&self) {
        let _ = self.ws_out.try_send(Message::Close(None));
        self.close_requested.notify_one();
    }

    /// Waits for teardown to finish, up to `cap`. Used when a new hello
    /// replaces a live session so the goodbyes stay ordered.
    pub async fn wait_closed(&self, cap: std::time::Duration) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let _ = tokio::time::timeout(cap, self.closed_notify.notified()).await;
    }

    /// Forwards device JSON upstream as a text frame.
    pub fn forward_text(&self, text: String) {
        if self.ws_out.try_send(Message::Text(text)).is_err() {
            debug!("dropping text frame: session writer gone or full");
        }
    }

    /// Accepts an inbound audio datagram: cookie must match, sequence must
    /// not regress. Returns true when the decrypted payload was forwarded
    /// upstream.
    pub fn handle_datagram(
        &self,
        peer: SocketAddr,
        header: &DatagramHeader,
        iv: &[u8; 16],
        ciphertext: &[u8],
        log_invalid_cookie: bool,
    ) -> bool {
        if header.cookie != self.cookie {
            if log_invalid_cookie {
                info!(
                    "invalid cookie from {}: got {:#06x}, session has {:#06x}",
                    peer, header.cookie, self.cookie
                );
            }
            return false;
        }

        {
            let mut state = self.state.lock().unwrap();
            if header.sequence < state.remote_seq {
                return false;
            }
            state.remote_seq = header.sequence;
            state.peer = Some(peer);
        }

        let mut plain = ciphertext.to_vec();
        crypto::apply(&self.key, iv, &mut plain);
        self.ws_out.try_send(Message::Binary(plain)).is_ok()
    }

    /// Sends one upstream audio frame to the device over UDP.
    ///
    /// The sequence is incremented strictly before the frame leaves and
    /// never resets within the session; the header is built fresh per frame
    /// so the cipher and the socket never share a buffer.
    async fn send_audio(&self, plain: &[u8], metrics: &GatewayMetrics) {
        if plain.len() > u16::MAX as usize {
            warn!("oversized audio frame ({} bytes) dropped", plain.len());
            return;
        }

        let (header, peer) = {
            let mut state = self.state.lock().unwrap();
            let peer = match state.peer {
                Some(p) => p,
                // The device has not sent any datagram yet, so there is no
                // route back to it.
                None => return,
            };
            state.local_seq += 1;
            (
                DatagramHeader::new(plain.len() as u16, self.mac_bytes, self.cookie, state.local_seq)
                    .encode(),
                peer,
            )
        };

        let mut payload = plain.to_vec();
        crypto::apply(&self.key, &header, &mut payload);

        let mut datagram = Vec::with_capacity(header.len() + payload.len());
        datagram.extend_from_slice(&header);
        datagram.extend_from_slice(&payload);

        match self.udp.send_to(&datagram, peer).await {
            Ok(_) => metrics.udp_sent.inc(),
            Err(e) => debug!("UDP send to {} failed: {}", peer, e),
        }
    }

    /// Pumps upstream frames until the WebSocket closes or a close is
    /// requested, then runs teardown.
    async fn run(
        self: Arc<Self>,
        mut read: SplitStream<WsStream>,
        conn: Arc<Connection>,
        metrics: GatewayMetrics,
    ) {
        loop {
            tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        // The handshake hello was consumed in open(); any
                        // later hello is not for the device.
                        let is_hello = serde_json::from_str::<Value>(&text)
                            .ok()
                            .and_then(|v| v.get("type").and_then(Value::as_str).map(|t| t == "hello"))
                            .unwrap_or(false);
                        if !is_hello {
                            conn.publish(text.as_bytes());
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        self.send_audio(&data, &metrics).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("{}: upstream error: {}", conn.mac(), e);
                        break;
                    }
                },
                _ = self.close_requested.notified() => break,
            }
        }

        self.teardown(&conn, &metrics);
    }

    /// Publishes the goodbye, logs the session summary and clears the
    /// session from its connection. Runs exactly once.
    fn teardown(self: &Arc<Self>, conn: &Arc<Connection>, metrics: &GatewayMetrics) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        conn.publish_json(&json!({
            "type": "goodbye",
            "session_id": self.session_id,
        }));
        info!(
            "session {} for {} closed after {}s",
            self.session_id,
            conn.mac(),
            self.started.elapsed().as_secs()
        );

        conn.clear_session(self);
        if conn.is_closing() {
            conn.notify_shutdown();
        }
        metrics.sessions_closed.inc();
        self.closed_notify.notify_one();
    }
}

/// Reads upstream frames until the server's hello text frame arrives.
async fn await_server_hello(read: &mut SplitStream<WsStream>) -> Result<Value, GatewayError> {
    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let value: Value = serde_json::from_str(&text)
                    .map_err(|e| GatewayError::Upstream(format!("bad hello: {}", e)))?;
                if value.get("type").and_then(Value::as_str) == Some("hello") {
                    return Ok(value);
                }
                debug!("ignoring pre-hello upstream frame");
            }
            Ok(Message::Close(_)) => {
                return Err(GatewayError::Upstream("closed before hello".to_string()));
            }
            Ok(_) => {}
            Err(e) => return Err(GatewayError::Upstream(e.to_string())),
        }
    }
    Err(GatewayError::Upstream("stream ended before hello".to_string()))
}
