//! Segment codec and integrity engine
//!
//! The payload is a sequence of independently sealed AES-256-GCM segments.
//! [`writer`] produces them, [`reader`] verifies and decrypts them in any
//! order, and [`integrity`] holds the signature rules both share.

pub mod integrity;
pub mod reader;
pub mod writer;

pub use integrity::{SegmentEntry, SegmentLayout};
pub use reader::{ReaderState, TdfReader};
pub use writer::{SealedPayload, TdfWriter};
