use super::error::MetainfoError;
use super::info_hash::InfoHash;
use crate::bencode::{decode, encode, Value};
use std::path::PathBuf;

/// A parsed `.torrent` file.
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// The info dictionary: file layout and piece hashes.
    pub info: Info,
    /// SHA-1 of the bencoded info dictionary.
    pub info_hash: InfoHash,
    /// Primary tracker URL.
    pub announce: Option<String>,
    /// Tiered tracker list; flattened by [`Metainfo::trackers`].
    pub announce_list: Vec<Vec<String>>,
}

/// The decoded `info` dictionary.
#[derive(Debug, Clone)]
pub struct Info {
    /// Suggested name for the file or top-level directory.
    pub name: String,
    /// Bytes per piece (the last piece may be shorter).
    pub piece_length: u64,
    /// SHA-1 hash of each piece.
    pub pieces: Vec<[u8; 20]>,
    /// Files in payload order, with absolute offsets into the byte stream.
    pub files: Vec<FileEntry>,
    /// Total payload size.
    pub total_length: u64,
}

/// One file of the torrent payload.
///
/// `offset` is the file's position in the concatenated byte stream; pieces
/// that straddle a file boundary map onto consecutive entries.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub path: PathBuf,
    pub length: u64,
    pub offset: u64,
}

impl Metainfo {
    pub fn from_bytes(data: &[u8]) -> Result<Self, MetainfoError> {
        let root = decode(data)?;
        let dict = root.as_dict().ok_or(MetainfoError::InvalidField("root"))?;

        let info_value = dict
            .get(b"info".as_slice())
            .ok_or(MetainfoError::MissingField("info"))?;

        // Re-encoding through the sorted dictionary restores the canonical
        // bytes the info-hash is defined over.
        let info_hash = InfoHash::from_info_bytes(&encode(info_value));
        let info = parse_info(info_value)?;

        let announce = dict
            .get(b"announce".as_slice())
            .and_then(|v| v.as_str())
            .map(String::from);

        let announce_list = dict
            .get(b"announce-list".as_slice())
            .and_then(|v| v.as_list())
            .map(|tiers| {
                tiers
                    .iter()
                    .filter_map(|tier| {
                        tier.as_list().map(|urls| {
                            urls.iter()
                                .filter_map(|u| u.as_str().map(String::from))
                                .collect()
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            info,
            info_hash,
            announce,
            announce_list,
        })
    }

    /// All tracker URLs, primary first, deduplicated.
    pub fn trackers(&self) -> Vec<String> {
        let mut urls = Vec::new();

        if let Some(ref announce) = self.announce {
            urls.push(announce.clone());
        }

        for tier in &self.announce_list {
            for url in tier {
                if !urls.contains(url) {
                    urls.push(url.clone());
                }
            }
        }

        urls
    }
}

impl Info {
    /// Number of pieces.
    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Length of piece `index`; only the final piece may be short.
    pub fn piece_size(&self, index: u32) -> u64 {
        if (index as usize) + 1 < self.pieces.len() {
            self.piece_length
        } else {
            self.total_length - self.piece_length * (self.pieces.len() as u64 - 1)
        }
    }
}

fn parse_info(value: &Value) -> Result<Info, MetainfoError> {
    let dict = value.as_dict().ok_or(MetainfoError::InvalidField("info"))?;

    let name = dict
        .get(b"name".as_slice())
        .and_then(|v| v.as_str())
        .ok_or(MetainfoError::MissingField("name"))?
        .to_string();

    let piece_length = dict
        .get(b"piece length".as_slice())
        .and_then(|v| v.as_int())
        .filter(|&len| len > 0)
        .ok_or(MetainfoError::InvalidField("piece length"))? as u64;

    let pieces_bytes = dict
        .get(b"pieces".as_slice())
        .and_then(|v| v.as_bytes())
        .ok_or(MetainfoError::MissingField("pieces"))?;

    if pieces_bytes.is_empty() || pieces_bytes.len() % 20 != 0 {
        return Err(MetainfoError::InvalidField("pieces"));
    }

    let pieces: Vec<[u8; 20]> = pieces_bytes
        .chunks_exact(20)
        .map(|chunk| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect();

    let (files, total_length) = parse_files(dict, &name)?;

    // The piece table must cover the payload exactly.
    let expected = total_length.div_ceil(piece_length) as usize;
    if pieces.len() != expected {
        return Err(MetainfoError::InvalidField("pieces"));
    }

    Ok(Info {
        name,
        piece_length,
        pieces,
        files,
        total_length,
    })
}

fn parse_files(
    dict: &std::collections::BTreeMap<bytes::Bytes, Value>,
    name: &str,
) -> Result<(Vec<FileEntry>, u64), MetainfoError> {
    if let Some(length) = dict.get(b"length".as_slice()).and_then(|v| v.as_int()) {
        // Single-file torrent: the payload is the name itself.
        let length = length as u64;
        let file = FileEntry {
            path: PathBuf::from(name),
            length,
            offset: 0,
        };
        return Ok((vec![file], length));
    }

    let entries = dict
        .get(b"files".as_slice())
        .and_then(|v| v.as_list())
        .ok_or(MetainfoError::MissingField("length or files"))?;

    let mut files = Vec::new();
    let mut offset = 0u64;

    for entry in entries {
        let file_dict = entry.as_dict().ok_or(MetainfoError::InvalidField("files"))?;

        let length = file_dict
            .get(b"length".as_slice())
            .and_then(|v| v.as_int())
            .ok_or(MetainfoError::MissingField("file length"))? as u64;

        let components = file_dict
            .get(b"path".as_slice())
            .and_then(|v| v.as_list())
            .ok_or(MetainfoError::MissingField("file path"))?;

        let path: PathBuf = std::iter::once(name.to_string())
            .chain(
                components
                    .iter()
                    .filter_map(|c| c.as_str().map(String::from)),
            )
            .collect();

        files.push(FileEntry {
            path,
            length,
            offset,
        });
        offset += length;
    }

    if files.is_empty() {
        return Err(MetainfoError::InvalidField("files"));
    }

    Ok((files, offset))
}
