//! Cursor types for the all-stream and for individual streams
//!
//! Committed messages carry plain `u64` ordinals; the sentinels exist
//! only in cursors. `Start` sits before every message and `End` after
//! every message, so `Start < At(n) < End` for any `n`.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Direction of a paged read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadDirection {
    /// Ascending position/version order
    Forward,
    /// Descending position/version order
    Backward,
}

macro_rules! define_cursor {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            /// Before the first message
            Start,
            /// A concrete ordinal
            At(u64),
            /// After the last message ("read from the tail")
            End,
        }

        impl $name {
            /// The concrete ordinal, if this cursor holds one.
            pub fn at(self) -> Option<u64> {
                match self {
                    Self::At(n) => Some(n),
                    Self::Start | Self::End => None,
                }
            }
        }

        impl Ord for $name {
            fn cmp(&self, other: &Self) -> Ordering {
                match (self, other) {
                    (Self::Start, Self::Start) | (Self::End, Self::End) => Ordering::Equal,
                    (Self::Start, _) | (_, Self::End) => Ordering::Less,
                    (_, Self::Start) | (Self::End, _) => Ordering::Greater,
                    (Self::At(a), Self::At(b)) => a.cmp(b),
                }
            }
        }

        impl PartialOrd for $name {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    Self::Start => write!(f, "start"),
                    Self::At(n) => write!(f, "{n}"),
                    Self::End => write!(f, "end"),
                }
            }
        }

        impl From<u64> for $name {
            fn from(n: u64) -> Self {
                Self::At(n)
            }
        }
    };
}

define_cursor!(Position, "Cursor into the all-stream global log.");
define_cursor!(Version, "Cursor into a single stream, by 0-based version.");

/// Conversion between 0-based logical ordinals and the 1-based physical
/// ordinals some engines use natively (sqlite rowids among them).
pub mod ordinal {
    /// Logical ordinal to 1-based physical ordinal.
    pub const fn to_physical(logical: u64) -> u64 {
        logical + 1
    }

    /// 1-based physical ordinal back to the logical ordinal.
    ///
    /// `physical` must be at least 1; the pair round-trips:
    /// `to_logical(to_physical(p)) == p`.
    pub const fn to_logical(physical: u64) -> u64 {
        physical - 1
    }
}
