use std::{fmt, str::FromStr};

use rand::{rngs::OsRng, RngCore};
use serde::Serialize;
use sha2::{Digest, Sha512};
use uuid::Uuid;

/// Longest token we'll accept from a client. Tokens issued by older
/// deployments were 128 hex chars, ours are 32.
const TOKEN_MAX_LEN: usize = 128;

/// `hex(sha512(salt || password))`, lowercase.
///
/// Existing password hashes were produced with exactly this scheme, so it must
/// not change.
pub fn hash_password(password: &str, salt: &str) -> String {
    let mut hasher = Sha512::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn new_salt() -> String {
    let mut salt = [0u8; 16];
    OsRng.fill_bytes(&mut salt);
    hex::encode(salt)
}

/// Opaque bearer credential handed out at login.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(into = "String")]
pub struct SessionToken(String);

impl SessionToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Enough of the token to correlate log lines, not enough to replay it.
    pub fn short(&self) -> &str {
        let end = self.0.char_indices().nth(8).map_or(self.0.len(), |(i, _)| i);
        &self.0[..end]
    }
}

impl FromStr for SessionToken {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = !s.is_empty()
            && s.len() <= TOKEN_MAX_LEN
            && s.bytes().all(|b| b.is_ascii_alphanumeric());

        valid.then(|| Self(s.to_string())).ok_or(())
    }
}

impl From<SessionToken> for String {
    fn from(token: SessionToken) -> Self {
        token.0
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}", self.0)
    }
}
