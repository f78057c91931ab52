/// Token generation and hashing helpers
///
/// Session tokens and one-time tokens are generated here and only ever stored
/// as their lower-case hex SHA-256 digest.

use rand::{distributions::Alphanumeric, Rng};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Length of the random part of a session token
pub const SESSION_TOKEN_LENGTH: usize = 40;

/// Generate a random alphanumeric token of `length` characters
pub fn generate_token(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// Lower-case hex SHA-256 of a token
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Generate a new record id
pub fn generate_id() -> String {
    Uuid::new_v4().simple().to_string()
}
