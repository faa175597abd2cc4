// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod config;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod http;
pub mod metrics;
pub mod mqtt;
pub mod registry;
pub mod server;
pub mod session;
pub mod sweeper;
pub mod udp;
pub mod upstream;
