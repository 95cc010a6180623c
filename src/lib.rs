//! riptide - a BitTorrent client core.
//!
//! The crate covers the hard middle of a BitTorrent client: discovering
//! peers through HTTP and UDP trackers, driving many concurrent peer-wire
//! connections, pipelined block requesting with endgame racing, SHA-1
//! verification of pieces against disk-backed storage, and a tit-for-tat
//! choke scheduler deciding who earns our upload bandwidth.
//!
//! # Modules
//!
//! - [`bencode`] - the serialization format of torrent files and trackers
//! - [`metainfo`] - `.torrent` parsing and info-hash computation
//! - [`tracker`] - HTTP and UDP announce protocols
//! - [`peer`] - peer wire protocol, request pipelining, choking policy
//! - [`storage`] - piece/file mapping, verification, reservations
//! - [`session`] - the coordinator tying all of the above together
//! - [`config`] - protocol constants and tunables

pub mod bencode;
pub mod config;
pub mod metainfo;
pub mod peer;
pub mod session;
pub mod storage;
pub mod tracker;

pub use config::Config;
pub use metainfo::{InfoHash, Metainfo};
pub use session::{Session, SessionError};
