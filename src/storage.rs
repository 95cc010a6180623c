//! Disk-backed piece storage.
//!
//! [`PieceStore`] owns everything piece-shaped: the mapping from
//! (piece, offset, length) to byte ranges of the on-disk files, buffering of
//! partially downloaded pieces, SHA-1 verification, the completion bitfield,
//! and the reservation table that assigns pieces to peers (rarest-first,
//! with endgame re-reservation).
//!
//! All disk reads and writes go through a bounded [`Semaphore`] and
//! `tokio::fs`, and hashing runs on the blocking pool, so the network tasks
//! never stall on the filesystem. In-memory state sits behind a short-lived
//! `parking_lot` mutex that is never held across an await point.
//!
//! [`Semaphore`]: tokio::sync::Semaphore

mod error;
mod layout;
mod store;

pub use error::StorageError;
pub use layout::{FileLayout, FileSpan};
pub use store::{BlockOutcome, PieceStore};
