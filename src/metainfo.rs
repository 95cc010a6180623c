//! Torrent metainfo parsing.
//!
//! A `.torrent` file is a bencoded dictionary carrying tracker URLs and an
//! `info` dictionary describing the payload: file layout, piece length and
//! the SHA-1 hash of every piece. The SHA-1 of the canonically encoded
//! `info` dictionary is the torrent's identity (the info-hash) and is what
//! peers and trackers key on.

mod error;
mod info_hash;
mod torrent;

pub use error::MetainfoError;
pub use info_hash::InfoHash;
pub use torrent::{FileEntry, Info, Metainfo};

#[cfg(test)]
mod tests;
