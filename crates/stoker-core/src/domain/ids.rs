//! Job identifier.
//!
//! `JobId` wraps a ULID (Universally Unique Lexicographically Sortable
//! Identifier):
//! - **time-ordered**: the timestamp sits in the high bits, so ids sort by
//!   creation time — the store relies on this for stable claim ordering
//! - **coordination-free**: multiple worker processes can mint ids without
//!   talking to each other
//! - **UUID-sized**: 128 bits

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

#[repr(transparent)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct JobId(Ulid);

impl JobId {
    /// Mint a fresh id from the current wall clock plus random bits.
    pub fn generate() -> Self {
        let timestamp_ms = Utc::now().timestamp_millis() as u64;
        Self(Ulid::from_parts(timestamp_ms, rand::random()))
    }

    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl From<Ulid> for JobId {
    fn from(ulid: Ulid) -> Self {
        Self(ulid)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
