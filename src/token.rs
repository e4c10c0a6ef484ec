//! Secret token generation and comparison

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Length of generated session and server tokens
pub const TOKEN_LENGTH: usize = 48;

/// Random alphanumeric token
pub fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect()
}

/// Compare two secrets without short-circuiting on the first mismatch
pub fn constant_time_eq(expected: &str, provided: &str) -> bool {
    let a = expected.as_bytes();
    let b = provided.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
