use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

const DIGEST_HEX_LEN: usize = 32;
const SECS_PER_HOUR: i64 = 3600;

/// Irreversible digest of a user identifier. There is no constructor from a digest string.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserDigest(String);

impl UserDigest {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Digests stay out of logs even at debug level.
impl fmt::Debug for UserDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserDigest(..)")
    }
}

/// Opaque id of a pseudonymized sub-population ("family").
/// Derived from a channel signature, never from a user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterId(String);

impl ClusterId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Salted one-way hashing of identifiers.
#[derive(Debug, Clone)]
pub struct Pseudonymizer {
    salt: String,
}

impl Pseudonymizer {
    pub fn new(salt: impl Into<String>) -> Self {
        Self { salt: salt.into() }
    }

    /// Deterministic: the same raw identifier always yields the same digest.
    pub fn hash_identifier(&self, raw: &str) -> UserDigest {
        UserDigest(self.digest("user", raw))
    }

    /// Cluster id for a set of channels. Order-insensitive.
    pub fn cluster_id<S: AsRef<str>>(&self, channels: &[S]) -> ClusterId {
        let mut names: Vec<&str> = channels.iter().map(|c| c.as_ref()).collect();
        names.sort_unstable();
        names.dedup();
        ClusterId(self.digest("family", &names.join("\u{1f}")))
    }

    fn digest(&self, domain: &str, input: &str) -> String {
        let mut h = Sha256::new();
        h.update(domain.as_bytes());
        h.update([0u8]);
        h.update(self.salt.as_bytes());
        h.update([0u8]);
        h.update(input.as_bytes());
        let mut hex = format!("{:x}", h.finalize());
        hex.truncate(DIGEST_HEX_LEN);
        hex
    }
}

/// Rounds down to the start of the enclosing UTC hour.
pub fn bucket_timestamp(t: DateTime<Utc>) -> DateTime<Utc> {
    let secs = t.timestamp().div_euclid(SECS_PER_HOUR) * SECS_PER_HOUR;
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}
