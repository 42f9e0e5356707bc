//! Distribution and backpressure policies.
//!
//! Every policy is a closed enum, parsed once when a channel is configured
//! or when a hello arrives. Nothing downstream dispatches on strings.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Whether a consumer shares process memory with its producer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryLocation {
    /// Same process. Only chunk handles cross the connection.
    Local,
    /// Different process or host. Chunks are serialized.
    #[default]
    Remote,
}

/// The role a consumer plays in fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataDistribution {
    /// Each chunk goes to exactly one shared consumer.
    Shared,
    /// Every chunk goes to every copy consumer.
    #[default]
    Copy,
}

/// How an output channel picks among its shared consumers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DistributionMode {
    /// Strict rotation in registration order, regardless of readiness.
    RoundRobin,
    /// First consumer to have signalled readiness wins.
    #[default]
    LoadBalanced,
}

/// What to do when the selected consumer cannot take a chunk right now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlownessPolicy {
    /// Discard the chunk and release it.
    Drop,
    /// Park the chunk id until the consumer is ready.
    Queue,
    /// Fail the producer's `update()`.
    Throw,
    /// Block the producer until the consumer is ready.
    #[default]
    Wait,
}

/// Minimum number of buffered tokens before the owner may compute.
///
/// Configured as a plain integer: `0` means "everything up to
/// end-of-stream", `0xFFFFFFFF` disables gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum MinData {
    All,
    Count(u32),
    Any,
}

impl MinData {
    pub const ANY_SENTINEL: u32 = u32::MAX;

    /// Number of tokens that makes the inactive buffer eligible for a swap.
    /// `None` means only end-of-stream completes a buffer.
    pub fn swap_threshold(self) -> Option<usize> {
        match self {
            MinData::All => None,
            MinData::Count(n) => Some(n as usize),
            MinData::Any => Some(1),
        }
    }
}

impl From<u32> for MinData {
    fn from(value: u32) -> Self {
        match value {
            0 => MinData::All,
            MinData::ANY_SENTINEL => MinData::Any,
            n => MinData::Count(n),
        }
    }
}

impl From<MinData> for u32 {
    fn from(value: MinData) -> u32 {
        match value {
            MinData::All => 0,
            MinData::Count(n) => n,
            MinData::Any => MinData::ANY_SENTINEL,
        }
    }
}

// ── String forms ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value:?}")]
pub struct ParsePolicyError {
    kind: &'static str,
    value: String,
}

macro_rules! string_forms {
    ($ty:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ParsePolicyError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(ParsePolicyError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

string_forms!(MemoryLocation, "memory location", {
    Local => "local",
    Remote => "remote",
});

string_forms!(DataDistribution, "data distribution", {
    Shared => "shared",
    Copy => "copy",
});

string_forms!(DistributionMode, "distribution mode", {
    RoundRobin => "round-robin",
    LoadBalanced => "load-balanced",
});

string_forms!(SlownessPolicy, "slowness policy", {
    Drop => "drop",
    Queue => "queue",
    Throw => "throw",
    Wait => "wait",
});
