use super::error::StorageError;
use super::layout::FileLayout;
use crate::config::BLOCK_SIZE;
use crate::metainfo::Info;
use crate::peer::{Bitfield, BlockRequest, PeerId};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng as _;
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex as TokioMutex, Semaphore};

const VERIFY_BATCH: usize = 16;

/// Result of feeding one block into the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Block buffered; the piece is still incomplete.
    Accepted,
    /// We already had this block (or the whole piece).
    Duplicate,
    /// Geometry was invalid (bad index, misaligned offset, out of range).
    /// The block was dropped; the sender is misbehaving.
    Rejected,
    /// The final block arrived, the hash matched, and the piece is on disk.
    PieceComplete(u32),
    /// The assembled piece failed verification. All buffered blocks were
    /// discarded and the piece is downloadable again; `sources` are the
    /// peers that contributed to the bad assembly.
    PieceCorrupt { piece: u32, sources: Vec<PeerId> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PieceStatus {
    Missing,
    Reserved,
    Complete,
}

#[derive(Default)]
struct PieceProgress {
    blocks: BTreeMap<u32, Bytes>,
    sources: HashSet<PeerId>,
}

struct StoreState {
    pieces: Vec<PieceStatus>,
    progress: HashMap<u32, PieceProgress>,
    /// piece index -> peers currently downloading it. One holder in normal
    /// mode; several during endgame.
    reservations: HashMap<u32, HashSet<PeerId>>,
    /// How many connected peers advertise each piece (rarest-first input).
    availability: Vec<u32>,
    peer_bitfields: HashMap<PeerId, Bitfield>,
}

/// Disk-backed piece storage with verification and reservations. See the
/// [module docs](crate::storage).
pub struct PieceStore {
    layout: FileLayout,
    piece_hashes: Arc<Vec<[u8; 20]>>,
    piece_length: u64,
    total_length: u64,
    handles: HandleCache,
    io_permits: Semaphore,
    state: Mutex<StoreState>,
}

impl PieceStore {
    pub fn new(
        base_path: PathBuf,
        info: &Info,
        disk_permits: usize,
    ) -> Result<Self, StorageError> {
        let layout = FileLayout::new(info.files.clone())?;
        let piece_count = info.pieces.len();

        Ok(Self {
            handles: HandleCache::new(base_path, &layout),
            layout,
            piece_hashes: Arc::new(info.pieces.clone()),
            piece_length: info.piece_length,
            total_length: info.total_length,
            io_permits: Semaphore::new(disk_permits.max(1)),
            state: Mutex::new(StoreState {
                pieces: vec![PieceStatus::Missing; piece_count],
                progress: HashMap::new(),
                reservations: HashMap::new(),
                availability: vec![0; piece_count],
                peer_bitfields: HashMap::new(),
            }),
        })
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Length of piece `index`; only the final piece may be short.
    pub fn piece_size(&self, index: u32) -> u64 {
        if (index as usize) + 1 < self.piece_count() {
            self.piece_length
        } else {
            self.total_length - self.piece_length * (self.piece_count() as u64 - 1)
        }
    }

    pub fn has_piece(&self, index: u32) -> bool {
        let state = self.state.lock();
        state
            .pieces
            .get(index as usize)
            .is_some_and(|&s| s == PieceStatus::Complete)
    }

    /// Our completion bitfield.
    pub fn bitfield(&self) -> Bitfield {
        let state = self.state.lock();
        let mut bf = Bitfield::new(state.pieces.len());
        for (i, &status) in state.pieces.iter().enumerate() {
            if status == PieceStatus::Complete {
                bf.set(i);
            }
        }
        bf
    }

    pub fn complete_count(&self) -> usize {
        let state = self.state.lock();
        state
            .pieces
            .iter()
            .filter(|&&s| s == PieceStatus::Complete)
            .count()
    }

    /// Pieces not yet verified on disk (Missing or Reserved).
    pub fn remaining(&self) -> usize {
        self.piece_count() - self.complete_count()
    }

    pub fn is_finished(&self) -> bool {
        self.remaining() == 0
    }

    /// Bytes still to download (the `left` figure trackers expect).
    pub fn bytes_left(&self) -> u64 {
        let state = self.state.lock();
        state
            .pieces
            .iter()
            .enumerate()
            .filter(|(_, &status)| status != PieceStatus::Complete)
            .map(|(i, _)| self.piece_size(i as u32))
            .sum()
    }

    // ---------------------------------------------------------------- peers

    /// Registers a connected peer's bitfield for availability accounting.
    /// Replaces any previous bitfield for the peer.
    pub fn register_peer(&self, peer: PeerId, bitfield: Bitfield) {
        let mut state = self.state.lock();
        if let Some(old) = state.peer_bitfields.remove(&peer) {
            for i in 0..old.len() {
                if old.has(i) {
                    state.availability[i] = state.availability[i].saturating_sub(1);
                }
            }
        }
        for i in 0..bitfield.len().min(state.availability.len()) {
            if bitfield.has(i) {
                state.availability[i] += 1;
            }
        }
        state.peer_bitfields.insert(peer, bitfield);
    }

    /// Records a `have` from the peer.
    pub fn peer_has(&self, peer: PeerId, piece: u32) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if piece as usize >= state.availability.len() {
            return;
        }
        let bitfield = state
            .peer_bitfields
            .entry(peer)
            .or_insert_with(|| Bitfield::new(self.piece_hashes.len()));
        if !bitfield.has(piece as usize) {
            bitfield.set(piece as usize);
            state.availability[piece as usize] += 1;
        }
    }

    /// True if the peer advertises a piece we still need.
    pub fn peer_is_useful(&self, peer: PeerId) -> bool {
        let state = self.state.lock();
        let Some(bitfield) = state.peer_bitfields.get(&peer) else {
            return false;
        };
        state
            .pieces
            .iter()
            .enumerate()
            .any(|(i, &s)| s != PieceStatus::Complete && bitfield.has(i))
    }

    /// Drops a peer: availability is decremented and every reservation it
    /// held is released. A reservation left with no holders reverts the
    /// piece to Missing.
    pub fn release_peer(&self, peer: PeerId) {
        let mut state = self.state.lock();
        if let Some(bitfield) = state.peer_bitfields.remove(&peer) {
            for i in 0..bitfield.len().min(state.availability.len()) {
                if bitfield.has(i) {
                    state.availability[i] = state.availability[i].saturating_sub(1);
                }
            }
        }
        release_holdings(&mut state, peer, None);
    }

    // --------------------------------------------------------- reservations

    /// Picks a piece for `peer` to download and reserves it.
    ///
    /// Normal mode considers only unreserved Missing pieces the peer
    /// advertises, preferring the lowest availability (rarest-first) and
    /// breaking ties at random. In endgame, already-reserved but incomplete
    /// pieces may be handed out again, fewest current holders first.
    pub fn reserve_piece(&self, peer: PeerId, endgame: bool) -> Option<u32> {
        let mut state = self.state.lock();
        let bitfield = state.peer_bitfields.get(&peer)?.clone();

        let mut rarest: Vec<u32> = Vec::new();
        let mut rarest_avail = u32::MAX;
        for (i, &status) in state.pieces.iter().enumerate() {
            if status != PieceStatus::Missing || !bitfield.has(i) {
                continue;
            }
            let avail = state.availability[i];
            match avail.cmp(&rarest_avail) {
                std::cmp::Ordering::Less => {
                    rarest_avail = avail;
                    rarest.clear();
                    rarest.push(i as u32);
                }
                std::cmp::Ordering::Equal => rarest.push(i as u32),
                std::cmp::Ordering::Greater => {}
            }
        }

        if !rarest.is_empty() {
            let pick = rarest[rand::rng().random_range(0..rarest.len())];
            state.pieces[pick as usize] = PieceStatus::Reserved;
            state
                .reservations
                .entry(pick)
                .or_default()
                .insert(peer);
            return Some(pick);
        }

        if !endgame {
            return None;
        }

        // Endgame: join the least-crowded reserved piece we don't already
        // hold, racing the current downloader(s).
        let mut best: Option<(usize, u32)> = None;
        for (i, &status) in state.pieces.iter().enumerate() {
            if status != PieceStatus::Reserved || !bitfield.has(i) {
                continue;
            }
            let holders = state
                .reservations
                .get(&(i as u32))
                .map(HashSet::len)
                .unwrap_or(0);
            if state
                .reservations
                .get(&(i as u32))
                .is_some_and(|set| set.contains(&peer))
            {
                continue;
            }
            if best.is_none_or(|(count, _)| holders < count) {
                best = Some((holders, i as u32));
            }
        }

        let (_, pick) = best?;
        state
            .reservations
            .entry(pick)
            .or_default()
            .insert(peer);
        Some(pick)
    }

    /// True while `peer` still holds a reservation on `piece`. Pipelines
    /// poll this to notice corruption resets and peer releases.
    pub fn holds_reservation(&self, piece: u32, peer: PeerId) -> bool {
        let state = self.state.lock();
        state
            .reservations
            .get(&piece)
            .is_some_and(|set| set.contains(&peer))
    }

    /// Every peer currently reserved on `piece` (endgame cancel targets).
    pub fn reservation_holders(&self, piece: u32) -> Vec<PeerId> {
        let state = self.state.lock();
        state
            .reservations
            .get(&piece)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Releases one peer's reservation on one piece.
    pub fn release_reservation(&self, piece: u32, peer: PeerId) {
        let mut state = self.state.lock();
        release_holdings(&mut state, peer, Some(piece));
    }

    // --------------------------------------------------------------- blocks

    /// Blocks of `piece` that have not been received yet.
    pub fn missing_blocks(&self, piece: u32) -> Vec<BlockRequest> {
        let piece_size = self.piece_size(piece);
        let state = self.state.lock();

        if state.pieces[piece as usize] == PieceStatus::Complete {
            return Vec::new();
        }

        let have = state.progress.get(&piece);
        let mut requests = Vec::new();
        let mut offset = 0u32;
        while (offset as u64) < piece_size {
            let length = block_length(piece_size, offset);
            if have.is_none_or(|p| !p.blocks.contains_key(&offset)) {
                requests.push(BlockRequest {
                    piece,
                    offset,
                    length,
                });
            }
            offset += length;
        }
        requests
    }

    /// Accepts one downloaded block. When the final block of a piece
    /// arrives the piece is assembled, hashed off-thread, and written to
    /// disk on a match; on a mismatch everything buffered is discarded and
    /// the contributing peers are reported.
    pub async fn submit_block(
        &self,
        piece: u32,
        offset: u32,
        data: Bytes,
        from: PeerId,
    ) -> Result<BlockOutcome, StorageError> {
        if piece as usize >= self.piece_count() {
            return Ok(BlockOutcome::Rejected);
        }
        let piece_size = self.piece_size(piece);
        if data.is_empty()
            || offset % BLOCK_SIZE != 0
            || offset as u64 + data.len() as u64 > piece_size
        {
            return Ok(BlockOutcome::Rejected);
        }

        let assembled = {
            let mut state = self.state.lock();
            if state.pieces[piece as usize] == PieceStatus::Complete {
                return Ok(BlockOutcome::Duplicate);
            }

            let progress = state.progress.entry(piece).or_default();
            progress.sources.insert(from);
            if progress.blocks.contains_key(&offset) {
                return Ok(BlockOutcome::Duplicate);
            }
            progress.blocks.insert(offset, data);

            if progress.blocks.len() as u32 != block_count(piece_size) {
                return Ok(BlockOutcome::Accepted);
            }

            // Final block: take the buffers out for hashing.
            let progress = state.progress.remove(&piece).unwrap_or_default();
            let mut bytes = Vec::with_capacity(piece_size as usize);
            for block in progress.blocks.values() {
                bytes.extend_from_slice(block);
            }
            (bytes, progress.sources)
        };

        let (bytes, sources) = assembled;
        let hashes = Arc::clone(&self.piece_hashes);
        let (bytes, matches) = tokio::task::spawn_blocking(move || {
            let digest: [u8; 20] = Sha1::digest(&bytes).into();
            let matches = digest == hashes[piece as usize];
            (bytes, matches)
        })
        .await
        .map_err(|e| StorageError::Io(std::io::Error::other(e)))?;

        if matches {
            self.write_range(piece as u64 * self.piece_length, &bytes)
                .await?;
            let mut state = self.state.lock();
            state.pieces[piece as usize] = PieceStatus::Complete;
            state.reservations.remove(&piece);
            state.progress.remove(&piece);
            Ok(BlockOutcome::PieceComplete(piece))
        } else {
            let mut state = self.state.lock();
            if state.pieces[piece as usize] != PieceStatus::Complete {
                state.pieces[piece as usize] = PieceStatus::Missing;
                state.reservations.remove(&piece);
                state.progress.remove(&piece);
            }
            Ok(BlockOutcome::PieceCorrupt {
                piece,
                sources: sources.into_iter().collect(),
            })
        }
    }

    /// Reads a block of a completed piece (the serving path).
    pub async fn read_block(
        &self,
        piece: u32,
        offset: u32,
        length: u32,
    ) -> Result<Bytes, StorageError> {
        if piece as usize >= self.piece_count() {
            return Err(StorageError::InvalidPieceIndex(piece));
        }
        if !self.has_piece(piece) {
            return Err(StorageError::PieceNotComplete(piece));
        }

        let start = piece as u64 * self.piece_length + offset as u64;
        let bytes = self.read_range(start, length as u64).await?;
        Ok(Bytes::from(bytes))
    }

    // --------------------------------------------------------- verification

    /// Re-hashes whatever is already on disk and seeds the completion
    /// bitfield with the pieces that check out. Unreadable or short data
    /// counts as absent, never as an error.
    pub async fn verify_existing(&self) -> Result<Bitfield, StorageError> {
        let piece_count = self.piece_count();

        for batch_start in (0..piece_count).step_by(VERIFY_BATCH) {
            let batch_end = (batch_start + VERIFY_BATCH).min(piece_count);
            let checks = (batch_start..batch_end).map(|i| self.verify_piece(i as u32));
            let results = futures::future::join_all(checks).await;

            let mut state = self.state.lock();
            for (i, valid) in results.into_iter().enumerate() {
                if valid? {
                    state.pieces[batch_start + i] = PieceStatus::Complete;
                }
            }
        }

        let complete = self.complete_count();
        if complete > 0 {
            tracing::info!(complete, total = piece_count, "resuming from existing data");
        }
        Ok(self.bitfield())
    }

    async fn verify_piece(&self, piece: u32) -> Result<bool, StorageError> {
        let start = piece as u64 * self.piece_length;
        let size = self.piece_size(piece);

        let bytes = match self.read_range(start, size).await {
            Ok(bytes) => bytes,
            // Anything unreadable is simply not there yet.
            Err(StorageError::Io(_)) => return Ok(false),
            Err(e) => return Err(e),
        };

        let hashes = Arc::clone(&self.piece_hashes);
        let valid = tokio::task::spawn_blocking(move || {
            let digest: [u8; 20] = Sha1::digest(&bytes).into();
            digest == hashes[piece as usize]
        })
        .await
        .map_err(|e| StorageError::Io(std::io::Error::other(e)))?;

        Ok(valid)
    }

    /// Flushes every open file handle to disk.
    pub async fn flush(&self) -> Result<(), StorageError> {
        self.handles.flush_all().await
    }

    // ------------------------------------------------------------- raw I/O

    async fn write_range(&self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        let _permit = self.io_permit().await?;

        let mut cursor = 0usize;
        for span in self.layout.spans(offset, data.len() as u64) {
            let handle = self.handles.open(span.file_index).await?;
            let mut file = handle.lock().await;
            file.seek(SeekFrom::Start(span.file_offset)).await?;
            file.write_all(&data[cursor..cursor + span.length as usize])
                .await?;
            cursor += span.length as usize;
        }
        Ok(())
    }

    async fn read_range(&self, offset: u64, length: u64) -> Result<Vec<u8>, StorageError> {
        let _permit = self.io_permit().await?;

        let mut data = Vec::with_capacity(length as usize);
        for span in self.layout.spans(offset, length) {
            let handle = self.handles.open(span.file_index).await?;
            let mut file = handle.lock().await;
            file.seek(SeekFrom::Start(span.file_offset)).await?;

            let mut buf = vec![0u8; span.length as usize];
            file.read_exact(&mut buf).await?;
            data.extend_from_slice(&buf);
        }
        Ok(data)
    }

    async fn io_permit(&self) -> Result<tokio::sync::SemaphorePermit<'_>, StorageError> {
        self.io_permits
            .acquire()
            .await
            .map_err(|_| StorageError::Io(std::io::Error::other("semaphore closed")))
    }
}

fn release_holdings(state: &mut StoreState, peer: PeerId, only_piece: Option<u32>) {
    let pieces: Vec<u32> = state
        .reservations
        .iter()
        .filter(|(&piece, holders)| {
            only_piece.is_none_or(|p| p == piece) && holders.contains(&peer)
        })
        .map(|(&piece, _)| piece)
        .collect();

    for piece in pieces {
        let empty = match state.reservations.get_mut(&piece) {
            Some(holders) => {
                holders.remove(&peer);
                holders.is_empty()
            }
            None => false,
        };
        if empty {
            state.reservations.remove(&piece);
            if state.pieces[piece as usize] == PieceStatus::Reserved {
                state.pieces[piece as usize] = PieceStatus::Missing;
            }
        }
    }
}

fn block_count(piece_size: u64) -> u32 {
    piece_size.div_ceil(BLOCK_SIZE as u64) as u32
}

fn block_length(piece_size: u64, offset: u32) -> u32 {
    (piece_size - offset as u64).min(BLOCK_SIZE as u64) as u32
}

struct HandleCache {
    base: PathBuf,
    paths: Vec<PathBuf>,
    handles: DashMap<usize, Arc<TokioMutex<File>>>,
}

impl HandleCache {
    fn new(base: PathBuf, layout: &FileLayout) -> Self {
        Self {
            base,
            paths: layout.files().iter().map(|f| f.path.clone()).collect(),
            handles: DashMap::new(),
        }
    }

    async fn open(&self, file_index: usize) -> Result<Arc<TokioMutex<File>>, StorageError> {
        if let Some(handle) = self.handles.get(&file_index) {
            return Ok(handle.clone());
        }

        let path = self.base.join(&self.paths[file_index]);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await?;

        let handle = Arc::new(TokioMutex::new(file));
        self.handles.insert(file_index, handle.clone());
        Ok(handle)
    }

    async fn flush_all(&self) -> Result<(), StorageError> {
        let handles: Vec<_> = self.handles.iter().map(|r| r.value().clone()).collect();
        for handle in handles {
            let file = handle.lock().await;
            file.sync_data().await?;
        }
        Ok(())
    }
}
