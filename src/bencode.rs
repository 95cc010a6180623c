//! Bencode encoding and decoding.
//!
//! Bencode is the serialization format used by `.torrent` files and HTTP
//! tracker responses. It has four terms: integers (`i42e`), byte strings
//! (`4:spam`), lists (`l...e`) and dictionaries (`d...e`) whose keys are
//! byte strings in lexicographic order.
//!
//! Dictionaries are kept in a [`BTreeMap`](std::collections::BTreeMap), so
//! encoding a decoded value reproduces the canonical byte sequence — which
//! is what makes info-hash computation possible.
//!
//! ```
//! use riptide::bencode::{decode, encode, Value};
//!
//! let value = decode(b"d3:bar4:spam3:fooi7ee").unwrap();
//! assert_eq!(value.get(b"foo").and_then(Value::as_int), Some(7));
//! assert_eq!(encode(&value), b"d3:bar4:spam3:fooi7ee");
//! ```

mod decode;
mod encode;
mod error;
mod value;

pub use decode::decode;
pub use encode::{encode, encode_into};
pub use error::BencodeError;
pub use value::Value;
