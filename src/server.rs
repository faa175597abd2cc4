// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Gateway Server
//!
//! Binds the pub/sub TCP listener and the shared UDP socket, spawns the
//! per-connection tasks, the UDP ingress loop, the keep-alive sweeper and
//! the config reload task, and coordinates graceful shutdown. Everything a
//! task needs travels in an explicit [`GatewayContext`]; there is no
//! process-global state.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::{ConfigManager, GatewayConfig};
use crate::connection::serve_connection;
use crate::metrics::GatewayMetrics;
use crate::registry::DeviceRegistry;
use crate::sweeper;
use crate::udp;

/// Shared handles cloned into every task.
#[derive(Clone)]
pub struct GatewayContext {
    pub env: Arc<GatewayConfig>,
    pub chat: Arc<ConfigManager>,
    pub registry: Arc<DeviceRegistry>,
    pub metrics: GatewayMetrics,
    pub udp: Arc<UdpSocket>,
}

/// A running gateway.
pub struct Gateway {
    ctx: GatewayContext,
    tcp_addr: SocketAddr,
    udp_addr: SocketAddr,
    /// Stops the sweeper and config reload task.
    service_shutdown: watch::Sender<bool>,
    /// Stops the accept loop and UDP ingress; fired after the drain.
    listener_shutdown: watch::Sender<bool>,
}

impl Gateway {
    /// Binds both listeners and spawns the background tasks.
    pub async fn start(env: GatewayConfig, chat: Arc<ConfigManager>) -> io::Result<Gateway> {
        let tcp = TcpListener::bind(("0.0.0.0", env.mqtt_port)).await?;
        let udp_socket = Arc::new(UdpSocket::bind(("0.0.0.0", env.udp_port)).await?);
        let tcp_addr = tcp.local_addr()?;
        let udp_addr = udp_socket.local_addr()?;

        let ctx = GatewayContext {
            env: Arc::new(env),
            chat: chat.clone(),
            registry: Arc::new(DeviceRegistry::new()),
            metrics: GatewayMetrics::new(),
            udp: udp_socket.clone(),
        };

        let (service_tx, service_rx) = watch::channel(false);
        let (listener_tx, listener_rx) = watch::channel(false);

        tokio::spawn(chat.run_reload(service_rx.clone()));
        tokio::spawn(sweeper::run(ctx.registry.clone(), service_rx));

        let ingress = udp::run_ingress(
            udp_socket,
            ctx.registry.clone(),
            ctx.chat.clone(),
            ctx.metrics.clone(),
            listener_rx.clone(),
        );
        tokio::spawn(async move {
            if let Err(e) = ingress.await {
                // The gateway is useless without its audio path.
                error!("UDP listener error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
                std::process::exit(1);
            }
        });

        let accept_ctx = ctx.clone();
        let mut accept_shutdown = listener_rx;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = tcp.accept() => match result {
                        Ok((stream, _addr)) => {
                            tokio::spawn(serve_connection(stream, accept_ctx.clone()));
                        }
                        Err(e) => warn!("accept error: {}", e),
                    },
                    _ = accept_shutdown.changed() => {
                        info!("pub/sub listener stopping");
                        break;
                    }
                }
            }
        });

        info!("pub/sub listening on {}", tcp_addr);
        info!("UDP audio listening on {}", udp_addr);

        Ok(Gateway {
            ctx,
            tcp_addr,
            udp_addr,
            service_shutdown: service_tx,
            listener_shutdown: listener_tx,
        })
    }

    pub fn context(&self) -> &GatewayContext {
        &self.ctx
    }

    pub fn registry(&self) -> Arc<DeviceRegistry> {
        self.ctx.registry.clone()
    }

    pub fn metrics(&self) -> GatewayMetrics {
        self.ctx.metrics.clone()
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    pub fn udp_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    /// Graceful shutdown: stop the sweeper, close every connection, give
    /// the sessions ~300 ms to publish their goodbyes, then close the
    /// listeners.
    pub async fn shutdown(&self) {
        info!("shutting down");
        let _ = self.service_shutdown.send(true);

        for conn in self.ctx.registry.snapshot() {
            conn.begin_close();
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        let _ = self.listener_shutdown.send(true);
    }
}
