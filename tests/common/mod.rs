//! Common test utilities for gateway integration tests.

use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use voice_gateway::config::{ChatBucket, ChatConfig, ConfigManager, GatewayConfig};
use voice_gateway::server::Gateway;

pub const TEST_MAC: &str = "a0:85:e3:f4:49:34";
pub const TEST_CLIENT_ID: &str = "board@@@a0_85_e3_f4_49_34@@@uuid-1";

/// What the fake upstream observed.
#[derive(Debug)]
pub enum UpstreamEvent {
    Connected,
    Text(Value),
    Binary(Vec<u8>),
}

/// Handle to the in-process fake chat server.
pub struct FakeUpstream {
    pub url: String,
    pub events: mpsc::UnboundedReceiver<UpstreamEvent>,
    senders: Arc<Mutex<Vec<mpsc::UnboundedSender<Message>>>>,
}

#[allow(dead_code)]
impl FakeUpstream {
    /// Sends a frame to the device through the most recent session.
    pub fn send_to_session(&self, msg: Message) {
        let senders = self.senders.lock().unwrap();
        let tx = senders.last().expect("no upstream session");
        tx.send(msg).expect("session writer gone");
    }

    pub async fn next_event(&mut self) -> UpstreamEvent {
        tokio::time::timeout(std::time::Duration::from_secs(5), self.events.recv())
            .await
            .expect("timed out waiting for upstream event")
            .expect("upstream channel closed")
    }

    /// Returns `None` when nothing arrives within the window.
    pub async fn try_next_event(&mut self, window_ms: u64) -> Option<UpstreamEvent> {
        tokio::time::timeout(
            std::time::Duration::from_millis(window_ms),
            self.events.recv(),
        )
        .await
        .ok()
        .flatten()
    }
}

/// Starts a WebSocket chat server that answers each client hello with
/// `session_id: "sess-<n>"` and reports every received frame.
#[allow(dead_code)]
pub async fn start_fake_upstream() -> FakeUpstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let senders: Arc<Mutex<Vec<mpsc::UnboundedSender<Message>>>> =
        Arc::new(Mutex::new(Vec::new()));

    let task_senders = senders.clone();
    tokio::spawn(async move {
        let mut session_counter = 0u32;
        while let Ok((stream, _)) = listener.accept().await {
            session_counter += 1;
            let session_id = format!("sess-{}", session_counter);
            let events = event_tx.clone();
            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
            task_senders.lock().unwrap().push(out_tx);

            tokio::spawn(async move {
                let ws = match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws) => ws,
                    Err(_) => return,
                };
                let _ = events.send(UpstreamEvent::Connected);
                let (mut write, mut read) = ws.split();

                loop {
                    tokio::select! {
                        msg = read.next() => match msg {
                            Some(Ok(Message::Text(text))) => {
                                let value: Value = serde_json::from_str(&text).unwrap();
                                if value["type"] == "hello" {
                                    let reply = serde_json::json!({
                                        "type": "hello",
                                        "session_id": session_id,
                                        "audio_params": {
                                            "format": "opus",
                                            "sample_rate": 24000,
                                        },
                                    });
                                    if write.send(Message::Text(reply.to_string())).await.is_err() {
                                        break;
                                    }
                                } else {
                                    let _ = events.send(UpstreamEvent::Text(value));
                                }
                            }
                            Some(Ok(Message::Binary(data))) => {
                                let _ = events.send(UpstreamEvent::Binary(data));
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(_)) => break,
                        },
                        out = out_rx.recv() => match out {
                            Some(msg) => {
                                if write.send(msg).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        },
                    }
                }
            });
        }
    });

    FakeUpstream {
        url,
        events: event_rx,
        senders,
    }
}

/// Starts a gateway on ephemeral ports routing every device to `upstream`.
#[allow(dead_code)]
pub async fn start_gateway(upstream_url: &str) -> Gateway {
    let chat = ChatConfig {
        production: ChatBucket {
            mac_addresss: Vec::new(),
            chat_servers: vec![upstream_url.to_string()],
        },
        ..Default::default()
    };
    let env = GatewayConfig {
        mqtt_port: 0,
        udp_port: 0,
        public_ip: "127.0.0.1".to_string(),
        ..Default::default()
    };
    Gateway::start(env, Arc::new(ConfigManager::fixed(chat)))
        .await
        .expect("gateway failed to start")
}

/// A raw-TCP pub/sub client the way device firmware speaks it.
pub struct DeviceClient {
    stream: TcpStream,
    buf: Vec<u8>,
}

#[allow(dead_code)]
impl DeviceClient {
    pub async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        DeviceClient {
            stream,
            buf: Vec::new(),
        }
    }

    /// Sends CONNECT and returns the CONNACK return code.
    pub async fn send_connect(&mut self, client_id: &str, keep_alive: u16) {
        let mut body = Vec::new();
        body.extend_from_slice(&4u16.to_be_bytes());
        body.extend_from_slice(b"MQTT");
        body.push(4); // protocol level
        body.push(0x02); // clean session
        body.extend_from_slice(&keep_alive.to_be_bytes());
        body.extend_from_slice(&(client_id.len() as u16).to_be_bytes());
        body.extend_from_slice(client_id.as_bytes());

        let frame = frame_with_length(0x10, &body);
        self.stream.write_all(&frame).await.unwrap();
    }

    pub async fn expect_connack(&mut self) -> u8 {
        let (first, body) = self.read_frame().await.expect("expected CONNACK");
        assert_eq!(first, 0x20, "expected CONNACK, got 0x{:02x}", first);
        body[1]
    }

    /// Publishes a QoS 0 message.
    pub async fn publish(&mut self, topic: &str, payload: &[u8]) {
        let mut body = Vec::new();
        body.extend_from_slice(&(topic.len() as u16).to_be_bytes());
        body.extend_from_slice(topic.as_bytes());
        body.extend_from_slice(payload);

        let frame = frame_with_length(0x30, &body);
        self.stream.write_all(&frame).await.unwrap();
    }

    /// Publishes with QoS 1 (which the gateway must reject).
    pub async fn publish_qos1(&mut self, topic: &str, payload: &[u8]) {
        let mut body = Vec::new();
        body.extend_from_slice(&(topic.len() as u16).to_be_bytes());
        body.extend_from_slice(topic.as_bytes());
        body.extend_from_slice(&1u16.to_be_bytes()); // packet id
        body.extend_from_slice(payload);

        let frame = frame_with_length(0x32, &body);
        self.stream.write_all(&frame).await.unwrap();
    }

    pub async fn send_pingreq(&mut self) {
        self.stream.write_all(&[0xC0, 0x00]).await.unwrap();
    }

    pub async fn send_subscribe(&mut self, packet_id: u16, filter: &str) {
        let mut body = Vec::new();
        body.extend_from_slice(&packet_id.to_be_bytes());
        body.extend_from_slice(&(filter.len() as u16).to_be_bytes());
        body.extend_from_slice(filter.as_bytes());
        body.push(0); // requested QoS

        let frame = frame_with_length(0x82, &body);
        self.stream.write_all(&frame).await.unwrap();
    }

    pub async fn expect_pingresp(&mut self) {
        let (first, _) = self.read_frame().await.expect("expected PINGRESP");
        assert_eq!(first, 0xD0, "expected PINGRESP, got 0x{:02x}", first);
    }

    /// Waits for a SUBACK and returns its return codes.
    pub async fn expect_suback(&mut self, packet_id: u16) -> Vec<u8> {
        let (first, body) = self.read_frame().await.expect("expected SUBACK");
        assert_eq!(first, 0x90, "expected SUBACK, got 0x{:02x}", first);
        assert_eq!(u16::from_be_bytes([body[0], body[1]]), packet_id);
        body[2..].to_vec()
    }

    pub async fn send_disconnect(&mut self) {
        self.stream.write_all(&[0xE0, 0x00]).await.unwrap();
    }

    /// Waits for a PUBLISH from the gateway and returns (topic, payload).
    pub async fn expect_publish(&mut self) -> (String, Vec<u8>) {
        loop {
            let (first, body) = self.read_frame().await.expect("expected PUBLISH");
            if first & 0xF0 != 0x30 {
                // PINGRESP or SUBACK interleaved with publishes.
                continue;
            }
            let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
            let topic = String::from_utf8(body[2..2 + topic_len].to_vec()).unwrap();
            let payload = body[2 + topic_len..].to_vec();
            return (topic, payload);
        }
    }

    pub async fn expect_publish_json(&mut self) -> (String, Value) {
        let (topic, payload) = self.expect_publish().await;
        (topic, serde_json::from_slice(&payload).unwrap())
    }

    /// Returns true once the gateway has closed the socket.
    pub async fn expect_eof(&mut self) -> bool {
        loop {
            match self.read_frame_or_eof().await {
                Some(Some(_)) => continue, // drain whatever is still queued
                Some(None) => return true,
                None => return false,
            }
        }
    }

    /// Reads one frame; panics on EOF.
    async fn read_frame(&mut self) -> Option<(u8, Vec<u8>)> {
        match self.read_frame_or_eof().await {
            Some(Some(frame)) => Some(frame),
            _ => None,
        }
    }

    /// `Some(Some(frame))` on a frame, `Some(None)` on clean EOF, `None` on
    /// timeout.
    async fn read_frame_or_eof(&mut self) -> Option<Option<(u8, Vec<u8>)>> {
        let deadline = std::time::Duration::from_secs(5);
        loop {
            if let Some(frame) = try_parse_frame(&mut self.buf) {
                return Some(Some(frame));
            }
            let mut chunk = [0u8; 1024];
            match tokio::time::timeout(deadline, self.stream.read(&mut chunk)).await {
                Ok(Ok(0)) => return Some(None),
                Ok(Ok(n)) => self.buf.extend_from_slice(&chunk[..n]),
                Ok(Err(_)) => return Some(None),
                Err(_) => return None,
            }
        }
    }
}

/// The device end of the UDP audio channel, configured from a hello reply.
pub struct UdpPeer {
    socket: tokio::net::UdpSocket,
    gateway_addr: std::net::SocketAddr,
    key: [u8; 16],
    nonce: [u8; 16],
}

#[allow(dead_code)]
impl UdpPeer {
    pub async fn from_hello(hello: &Value, gateway_addr: std::net::SocketAddr) -> Self {
        let udp = &hello["udp"];
        let key_bytes = hex::decode(udp["key"].as_str().unwrap()).unwrap();
        let nonce_bytes = hex::decode(udp["nonce"].as_str().unwrap()).unwrap();

        let mut key = [0u8; 16];
        key.copy_from_slice(&key_bytes);
        let mut nonce = [0u8; 16];
        nonce.copy_from_slice(&nonce_bytes);

        // The gateway binds on all interfaces; aim the datagrams at loopback.
        let gateway_addr = std::net::SocketAddr::new(
            std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            gateway_addr.port(),
        );

        UdpPeer {
            socket: tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            gateway_addr,
            key,
            nonce,
        }
    }

    /// The session cookie as embedded in the nonce header.
    pub fn cookie(&self) -> u16 {
        u16::from_be_bytes([self.nonce[10], self.nonce[11]])
    }

    fn mac_bytes(&self) -> [u8; 6] {
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&self.nonce[4..10]);
        mac
    }

    pub async fn send_audio(&self, sequence: u32, plain: &[u8]) {
        self.send_audio_with_cookie(self.cookie(), sequence, plain).await;
    }

    pub async fn send_audio_with_cookie(&self, cookie: u16, sequence: u32, plain: &[u8]) {
        let header = voice_gateway::udp::DatagramHeader::new(
            plain.len() as u16,
            self.mac_bytes(),
            cookie,
            sequence,
        )
        .encode();

        let mut payload = plain.to_vec();
        voice_gateway::crypto::apply(&self.key, &header, &mut payload);

        let mut datagram = header.to_vec();
        datagram.extend_from_slice(&payload);
        self.socket
            .send_to(&datagram, self.gateway_addr)
            .await
            .unwrap();
    }

    /// Receives one datagram and returns `(sequence, cookie, plaintext)`.
    pub async fn recv_audio(&self) -> (u32, u16, Vec<u8>) {
        let mut buf = [0u8; 2048];
        let (len, _) = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            self.socket.recv_from(&mut buf),
        )
        .await
        .expect("timed out waiting for UDP audio")
        .unwrap();

        let header = voice_gateway::udp::DatagramHeader::parse(&buf[..len]).unwrap();
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&buf[..16]);

        let mut plain = buf[16..16 + header.payload_len as usize].to_vec();
        voice_gateway::crypto::apply(&self.key, &iv, &mut plain);
        (header.sequence, header.cookie, plain)
    }
}

/// Frames a packet with the MQTT variable-length remaining length.
#[allow(dead_code)]
pub fn frame_with_length(first_byte: u8, body: &[u8]) -> Vec<u8> {
    let mut frame = vec![first_byte];
    let mut len = body.len();
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        frame.push(byte);
        if len == 0 {
            break;
        }
    }
    frame.extend_from_slice(body);
    frame
}

/// Pops one complete `(first_byte, body)` frame off the front of `buf`.
fn try_parse_frame(buf: &mut Vec<u8>) -> Option<(u8, Vec<u8>)> {
    if buf.len() < 2 {
        return None;
    }
    let first = buf[0];
    let mut len = 0usize;
    let mut shift = 0u32;
    let mut header = 1usize;
    for byte in &buf[1..] {
        len |= ((byte & 0x7F) as usize) << shift;
        header += 1;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if header > 5 {
            panic!("bad remaining length from gateway");
        }
    }
    if buf.len() < header + len {
        return None;
    }
    let body = buf[header..header + len].to_vec();
    buf.drain(..header + len);
    Some((first, body))
}
