use super::error::StorageError;
use crate::metainfo::FileEntry;
use std::path::{Component, Path};

/// A contiguous byte range within one file of the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpan {
    pub file_index: usize,
    pub file_offset: u64,
    pub length: u64,
}

/// Maps ranges of the torrent's logical byte stream onto files.
///
/// The logical stream is the concatenation of all files in payload order;
/// a piece or block that straddles a file boundary resolves to spans over
/// consecutive files.
#[derive(Debug, Clone)]
pub struct FileLayout {
    files: Vec<FileEntry>,
    total_length: u64,
}

impl FileLayout {
    pub fn new(files: Vec<FileEntry>) -> Result<Self, StorageError> {
        for file in &files {
            validate_path(&file.path)?;
        }
        let total_length = files.iter().map(|f| f.length).sum();
        Ok(Self {
            files,
            total_length,
        })
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Resolves `[offset, offset + length)` of the logical stream to file
    /// spans. The range must lie within the payload.
    pub fn spans(&self, offset: u64, length: u64) -> Vec<FileSpan> {
        debug_assert!(offset + length <= self.total_length);

        let mut spans = Vec::new();
        let mut cursor = offset;
        let mut remaining = length;

        for (file_index, file) in self.files.iter().enumerate() {
            if remaining == 0 {
                break;
            }

            let file_end = file.offset + file.length;
            if cursor >= file_end || cursor < file.offset {
                continue;
            }

            let take = remaining.min(file_end - cursor);
            spans.push(FileSpan {
                file_index,
                file_offset: cursor - file.offset,
                length: take,
            });

            cursor += take;
            remaining -= take;
        }

        spans
    }
}

fn validate_path(path: &Path) -> Result<(), StorageError> {
    for component in path.components() {
        match component {
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StorageError::PathTraversal(path.display().to_string()));
            }
            _ => {}
        }
    }
    Ok(())
}
