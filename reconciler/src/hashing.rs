//! Password hashes for the pooler's auth file.
//!
//! Hashes are derived from the plaintext password and the username only, so
//! the whole auth file can be regenerated when the auth mode changes.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use md5::Md5;
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

type HmacSha256 = Hmac<Sha256>;

const PASSWORD_LENGTH: usize = 24;
const SCRAM_ITERATIONS: u32 = 4096;
const SCRAM_SALT_LENGTH: usize = 16;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthMode {
    #[default]
    #[serde(rename = "md5")]
    Md5,
    #[serde(rename = "scram-sha-256")]
    ScramSha256,
}

impl AuthMode {
    /// Value of the pooler's `auth_type` setting.
    pub const fn as_str(&self) -> &'static str {
        match self {
            AuthMode::Md5 => "md5",
            AuthMode::ScramSha256 => "scram-sha-256",
        }
    }
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("unsupported auth type: {0}")]
pub struct UnknownAuthMode(pub String);

impl FromStr for AuthMode {
    type Err = UnknownAuthMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "md5" => Ok(AuthMode::Md5),
            "scram-sha-256" => Ok(AuthMode::ScramSha256),
            other => Err(UnknownAuthMode(other.to_string())),
        }
    }
}

pub fn hash_password(mode: AuthMode, username: &str, password: &str) -> String {
    match mode {
        AuthMode::Md5 => md5_hash(username, password),
        AuthMode::ScramSha256 => scram_hash(username, password),
    }
}

pub fn generate_password() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LENGTH)
        .map(char::from)
        .collect()
}

// Legacy postgres format: "md5" + md5(password || username).
fn md5_hash(username: &str, password: &str) -> String {
    let digest = Md5::digest(format!("{password}{username}").as_bytes());
    format!("md5{digest:x}")
}

// SCRAM-SHA-256$<iterations>:<salt>$<StoredKey>:<ServerKey>, with the salt
// taken from the username so the verifier is reproducible.
fn scram_hash(username: &str, password: &str) -> String {
    let salt_digest = Sha256::digest(format!("pgbouncer-scram:{username}").as_bytes());
    let salt = &salt_digest[..SCRAM_SALT_LENGTH];

    let mut salted_password = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(
        password.as_bytes(),
        salt,
        SCRAM_ITERATIONS,
        &mut salted_password,
    );

    let client_key = hmac_sha256(&salted_password, b"Client Key");
    let stored_key = Sha256::digest(client_key);
    let server_key = hmac_sha256(&salted_password, b"Server Key");

    format!(
        "SCRAM-SHA-256${SCRAM_ITERATIONS}:{}${}:{}",
        STANDARD.encode(salt),
        STANDARD.encode(stored_key),
        STANDARD.encode(server_key)
    )
}

fn hmac_sha256(key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}
