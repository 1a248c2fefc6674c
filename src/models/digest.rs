//! SHA-256 content address, lowercase hex encoded.

use serde::{Deserialize, Serialize};
use sha2::{Sha256, digest::Output};
use std::fmt;

/// Length of a hex-encoded SHA-256 digest.
pub const DIGEST_HEX_LEN: usize = 64;

/// Content address of an object: the lowercase hex SHA-256 of its exact bytes.
///
/// Construction goes through [`Digest::from_hash`] or [`Digest::parse`], so a
/// `Digest` is always 64 lowercase hex characters and safe to use as a file
/// name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct Digest(String);

impl Digest {
    /// Wrap the output of a finished SHA-256 hasher.
    pub fn from_hash(hash: Output<Sha256>) -> Self {
        Self(hex::encode(hash))
    }

    /// Parse a hex digest, rejecting anything that is not 64 lowercase hex chars.
    pub fn parse(value: &str) -> Option<Self> {
        let valid = value.len() == DIGEST_HEX_LEN
            && value
                .bytes()
                .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        valid.then(|| Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Two-level shard directories (`aa`, `bb`) taken from the digest prefix.
    pub fn shards(&self) -> (&str, &str) {
        (&self.0[0..2], &self.0[2..4])
    }

    /// Leading byte of the digest, used to pick a lock stripe.
    pub fn leading_byte(&self) -> u8 {
        u8::from_str_radix(&self.0[0..2], 16).unwrap_or_default()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
