//! Basic authentication for privileged admin verbs.

use base64::engine::general_purpose::STANDARD as base64_engine;
use base64::Engine;
use crate::traits::ClientRequest;

/// Checks `Authorization: Basic` against the configured credentials.
/// The comparison runs over the base64 token in constant time.
pub fn authorized(request: &ClientRequest, user: &str, password: &str) -> bool {
    let Some(header) = request.header("Authorization") else {
        return false;
    };
    let Some(token) = header.strip_prefix("Basic ") else {
        return false;
    };
    let expected = base64_engine.encode(format!("{user}:{password}"));
    constant_time_eq(token.trim().as_bytes(), expected.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
