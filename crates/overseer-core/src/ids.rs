//! Opaque short identifiers

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;

/// Generate an opaque record ID: 8 random bytes, base64url without padding.
///
/// Eleven URL-safe characters, usable in paths and JSON keys without escaping.
pub fn new_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
