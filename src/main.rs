// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Voice Gateway
//!
//! Terminates constrained-device pub/sub connections plus their encrypted
//! UDP audio channel, and bridges each device session to an upstream chat
//! service over WebSocket. Provides:
//! - MQTT 3.1.1-subset TCP listener for device control traffic
//! - AES-128-CTR encrypted UDP relay for opus audio
//! - HTTP admin API for command push and device status
//! - Hot-reloaded routing configuration

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter};

use voice_gateway::config::{ConfigManager, GatewayConfig};
use voice_gateway::http::{create_router, AdminState};
use voice_gateway::server::Gateway;

fn level_filter(debug: bool) -> EnvFilter {
    let directive = if debug {
        "voice_gateway=debug"
    } else {
        "voice_gateway=info"
    };
    EnvFilter::from_default_env().add_directive(directive.parse().unwrap())
}

#[tokio::main]
async fn main() {
    // Load configuration
    let env_config = GatewayConfig::from_env();
    let chat = Arc::new(ConfigManager::from_file(env_config.config_file.clone()));

    // Initialize logging; the filter is reloadable so the config file's
    // debug flag can toggle verbosity at runtime.
    let (filter, filter_handle) = reload::Layer::new(level_filter(chat.snapshot().debug));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    {
        let mut changes = chat.subscribe();
        tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let debug_enabled = changes.borrow_and_update().debug;
                let _ = filter_handle.reload(level_filter(debug_enabled));
                info!("debug logging {}", if debug_enabled { "enabled" } else { "disabled" });
            }
        });
    }

    info!(
        "Starting Voice Gateway v{}",
        env!("CARGO_PKG_VERSION")
    );
    info!("Pub/sub port: {}", env_config.mqtt_port);
    info!("UDP port: {}", env_config.udp_port);
    info!("Public address: {}", env_config.public_ip);
    info!("Admin port: {}", env_config.admin_port);
    info!("Routing config: {}", env_config.config_file.display());

    let gateway = Gateway::start(env_config.clone(), chat)
        .await
        .expect("Failed to bind gateway listeners");

    // Start the HTTP admin API
    let admin_state = AdminState {
        registry: gateway.registry(),
        metrics: gateway.metrics(),
        signature_key: env_config.signature_key.clone(),
    };
    let admin_router = create_router(admin_state);
    let admin_addr = format!("0.0.0.0:{}", env_config.admin_port);
    let admin_listener = TcpListener::bind(&admin_addr)
        .await
        .expect("Failed to bind admin listener");

    tokio::spawn(async move {
        info!("admin API listening on {}", admin_addr);
        axum::serve(admin_listener, admin_router).await.unwrap();
    });

    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for SIGINT");
    info!("SIGINT received");
    gateway.shutdown().await;
}
