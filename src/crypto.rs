// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Audio Frame Encryption
//!
//! AES-128-CTR over UDP audio payloads. The 16-byte datagram header doubles
//! as the CTR counter block, so no IV ever travels separately: both sides
//! rebuild it from the header they already have. Within one session the key
//! is fresh and the sequence field is strictly increasing, so a counter
//! block never repeats under the same key.

use aes::cipher::{KeyIvInit, StreamCipher};

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

/// Name advertised to devices in the hello reply.
pub const CIPHER_NAME: &str = "aes-128-ctr";

/// Encrypts or decrypts `payload` in place (CTR mode is symmetric).
///
/// `header` is the full 16-byte datagram header used as the counter block.
pub fn apply(key: &[u8; 16], header: &[u8; 16], payload: &mut [u8]) {
    let mut cipher = Aes128Ctr::new(key.into(), header.into());
    cipher.apply_keystream(payload);
}
