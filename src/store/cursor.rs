//! Typed sync cursor.
//!
//! Persisted as `generation:sequence`. Legacy rows written before
//! generation tracking hold a bare sequence. The raw string is parsed
//! eagerly at the persistence boundary and never passed around.

use std::fmt;

/// Position of an account's synchronization within one mailbox
/// generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncCursor {
    /// Server-assigned mailbox generation (UIDVALIDITY). `None` only
    /// on legacy rows that predate generation tracking.
    pub generation: Option<u32>,
    /// Highest contiguously handled UID within the generation.
    pub sequence: u32,
}

impl SyncCursor {
    pub fn new(generation: u32, sequence: u32) -> Self {
        Self {
            generation: Some(generation),
            sequence,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        match raw.split_once(':') {
            Some((generation, sequence)) => Some(Self {
                generation: Some(generation.parse().ok()?),
                sequence: sequence.parse().ok()?,
            }),
            None => Some(Self {
                generation: None,
                sequence: raw.parse().ok()?,
            }),
        }
    }

    /// Wire form. New cursors always carry a generation; the bare form
    /// exists only to round-trip legacy rows unchanged.
    pub fn encode(&self) -> String {
        match self.generation {
            Some(generation) => format!("{}:{}", generation, self.sequence),
            None => self.sequence.to_string(),
        }
    }

    /// Starting sequence for candidate discovery against the server's
    /// current generation. A generation mismatch resets to the origin;
    /// a legacy cursor adopts the current generation unchanged.
    pub fn start_sequence(&self, server_generation: u32) -> u32 {
        match self.generation {
            Some(generation) if generation != server_generation => 0,
            _ => self.sequence,
        }
    }
}

impl fmt::Display for SyncCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}
