//! Chunked table save files.
//!
//! One save file holds the rows of one table — the whole table for a
//! replicated table, or the slice owned by one originating host for a
//! partitioned table. Rows are stored as a sequence of independently
//! CRC-framed row-batch chunks so a reader can stream the file without
//! materializing it, and so corruption in one chunk never poisons the rest.
//!
//! ## File format
//!
//! ```text
//! [preamble]
//!   magic: [u8; 4]           = b"SSAV"
//!   version: u8              = 1
//!   flags: u8                = 0 (reserved for a compression codec id)
//!   complete: u8             = 0, patched to 1 in place on finish
//!   header_len: u32le
//!   header: [u8; header_len] = postcard(SaveFileHeader)
//!
//! [chunks]
//!   for each chunk:
//!     tag: u8                = 0x01
//!     partition_hint: u32le  (0xFFFF_FFFF for replicated tables)
//!     payload_len: u32le
//!     crc32: u32le           (CRC-32/ISO-HDLC over payload)
//!     payload: [u8; payload_len] = postcard(RowBatch)
//!
//! [terminator]
//!   tag: u8 = 0xFF
//! ```
//!
//! The completeness byte is authoritative: a writer that crashes before
//! `finish` leaves it zero, and the scan phase reports such files as scan
//! warnings rather than restore failures.

use std::{
    collections::BTreeSet,
    fs::File,
    io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use crc::{Crc, CRC_32_ISO_HDLC};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use stratadb_types::{codec, ClusterInstanceId, HostId, PartitionId, RowBatch, TxnId};

/// Save file magic bytes.
pub const SAVE_MAGIC: [u8; 4] = *b"SSAV";

/// Current save file format version.
pub const SAVE_VERSION: u8 = 1;

/// File extension for chunked table save files.
pub const SAVE_FILE_EXT: &str = "sav";

/// Byte offset of the completeness flag, patched in place by `finish`.
const COMPLETE_OFFSET: u64 = 6;

/// Frame tag introducing a chunk.
const CHUNK_TAG: u8 = 0x01;

/// Frame tag terminating a complete file.
const END_TAG: u8 = 0xFF;

/// Partition hint stored for replicated-table chunks.
const REPLICATED_HINT: u32 = u32::MAX;

/// Upper bound on a single chunk payload, to reject absurd lengths before
/// allocating.
const MAX_CHUNK_BYTES: usize = 64 * 1024 * 1024;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Errors produced by save file reading and writing.
#[derive(Debug, Snafu)]
pub enum SaveFileError {
    /// I/O error.
    #[snafu(display("Save file I/O error: {source}"))]
    Io {
        /// The underlying IO error.
        source: std::io::Error,
    },

    /// The file does not start with the save-file magic.
    #[snafu(display("Invalid save file magic: expected SSAV, got {found:?}"))]
    BadMagic {
        /// The bytes found in place of the magic.
        found: [u8; 4],
    },

    /// The file was written by a newer format version.
    #[snafu(display("Unsupported save file version: {version} (expected <= {SAVE_VERSION})"))]
    UnsupportedVersion {
        /// The version byte found.
        version: u8,
    },

    /// The file ended before an expected structure.
    #[snafu(display("Save file truncated: {reason}"))]
    Truncated {
        /// What was being read when EOF hit.
        reason: String,
    },

    /// An unknown frame tag; the stream cannot be realigned past it.
    #[snafu(display("Unknown frame tag {tag:#04x} at chunk index {index}"))]
    BadFrameTag {
        /// The offending tag byte.
        tag: u8,
        /// Ordinal of the frame at which it appeared.
        index: u64,
    },

    /// Failed to encode or decode the file header.
    #[snafu(display("Save file header codec error: {source}"))]
    HeaderCodec {
        /// The underlying codec error.
        source: stratadb_types::CodecError,
    },

    /// The header does not fit the u32 length prefix.
    #[snafu(display("Save file header too large: {len} bytes"))]
    HeaderTooLarge {
        /// Encoded header size.
        len: usize,
    },

    /// A chunk's CRC did not match its payload. The stream remains aligned;
    /// the next chunk is still readable.
    #[snafu(display("Chunk {index} checksum mismatch: expected {expected:#010x}, got {actual:#010x}"))]
    ChunkChecksum {
        /// Ordinal of the corrupt chunk.
        index: u64,
        /// CRC stored in the frame.
        expected: u32,
        /// CRC computed over the payload.
        actual: u32,
    },

    /// A chunk payload failed to decode. The stream remains aligned.
    #[snafu(display("Chunk {index} decode error: {source}"))]
    ChunkCodec {
        /// Ordinal of the undecodable chunk.
        index: u64,
        /// The underlying codec error.
        source: stratadb_types::CodecError,
    },

    /// A frame declared an impossibly large payload.
    #[snafu(display("Chunk {index} declares {len} bytes, exceeding the {MAX_CHUNK_BYTES} limit"))]
    OversizeChunk {
        /// Ordinal of the offending chunk.
        index: u64,
        /// Declared payload length.
        len: usize,
    },
}

/// Result type for save file operations.
pub type Result<T> = std::result::Result<T, SaveFileError>;

/// Metadata stored in a save file's header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveFileHeader {
    /// Table whose rows this file holds.
    pub table: String,
    /// Whether the table was replicated when saved.
    pub is_replicated: bool,
    /// Partition ids contained in this file. Empty for replicated tables.
    pub partition_ids: Vec<PartitionId>,
    /// Total partition count of the cluster at save time.
    pub total_partitions: u32,
    /// Host that produced this file.
    pub source_host: HostId,
    /// Identity of the cluster instance that produced the snapshot.
    pub cluster_instance: ClusterInstanceId,
    /// Transaction id the snapshot was taken at.
    pub txn_id: TxnId,
}

/// One decoded chunk: the partition it belongs to (None for replicated
/// tables) and its row batch.
#[derive(Debug)]
pub struct Chunk {
    /// Destination partition recorded at save time, if any.
    pub partition: Option<PartitionId>,
    /// The decoded rows.
    pub batch: RowBatch,
}

/// Builds the canonical file name for a table save file.
///
/// Replicated tables produce one file per snapshot; partitioned tables one
/// file per originating host.
pub fn save_file_name(nonce: &str, table: &str, source_host: Option<HostId>) -> String {
    match source_host {
        Some(host) => format!("{nonce}-{table}-host_{host}.{SAVE_FILE_EXT}"),
        None => format!("{nonce}-{table}.{SAVE_FILE_EXT}"),
    }
}

// ============================================================================
// SaveFileWriter
// ============================================================================

/// Writes a chunked table save file.
///
/// The completeness flag stays zero until [`finish`](Self::finish) succeeds,
/// so readers can always tell an interrupted save from a finished one.
pub struct SaveFileWriter {
    writer: BufWriter<File>,
    chunks_written: u64,
}

impl SaveFileWriter {
    /// Creates the file and writes the preamble with the completeness flag
    /// cleared.
    ///
    /// # Errors
    ///
    /// Returns [`SaveFileError::Io`] on file creation/write failure, or
    /// [`SaveFileError::HeaderCodec`] if the header does not serialize.
    pub fn create(path: &Path, header: &SaveFileHeader) -> Result<Self> {
        let file = File::create(path).context(IoSnafu)?;
        let mut writer = BufWriter::new(file);

        writer.write_all(&SAVE_MAGIC).context(IoSnafu)?;
        writer.write_all(&[SAVE_VERSION, 0, 0]).context(IoSnafu)?;

        let header_bytes = codec::encode(header).context(HeaderCodecSnafu)?;
        let header_len = u32::try_from(header_bytes.len())
            .map_err(|_| SaveFileError::HeaderTooLarge { len: header_bytes.len() })?;
        writer.write_all(&header_len.to_le_bytes()).context(IoSnafu)?;
        writer.write_all(&header_bytes).context(IoSnafu)?;

        Ok(Self { writer, chunks_written: 0 })
    }

    /// Appends one chunk.
    ///
    /// `partition` must be `Some` for partitioned tables and `None` for
    /// replicated ones.
    ///
    /// # Errors
    ///
    /// Returns [`SaveFileError`] on encode or write failure.
    pub fn write_chunk(&mut self, partition: Option<PartitionId>, batch: &RowBatch) -> Result<()> {
        let index = self.chunks_written;
        let payload = codec::encode(batch)
            .map_err(|source| SaveFileError::ChunkCodec { index, source })?;
        if payload.len() > MAX_CHUNK_BYTES {
            return Err(SaveFileError::OversizeChunk { index, len: payload.len() });
        }
        let hint = partition.unwrap_or(REPLICATED_HINT);
        let crc = CRC32.checksum(&payload);

        self.writer.write_all(&[CHUNK_TAG]).context(IoSnafu)?;
        self.writer.write_all(&hint.to_le_bytes()).context(IoSnafu)?;
        self.writer
            .write_all(&(payload.len() as u32).to_le_bytes())
            .context(IoSnafu)?;
        self.writer.write_all(&crc.to_le_bytes()).context(IoSnafu)?;
        self.writer.write_all(&payload).context(IoSnafu)?;
        self.chunks_written += 1;
        Ok(())
    }

    /// Writes the terminator, flushes, and patches the completeness flag.
    ///
    /// # Errors
    ///
    /// Returns [`SaveFileError::Io`] if any of those steps fail; the file is
    /// then left incomplete, which is the intended crash-consistency signal.
    pub fn finish(mut self) -> Result<()> {
        self.writer.write_all(&[END_TAG]).context(IoSnafu)?;
        self.writer.flush().context(IoSnafu)?;

        let mut file = self
            .writer
            .into_inner()
            .map_err(|e| SaveFileError::Io { source: e.into_error() })?;
        file.seek(SeekFrom::Start(COMPLETE_OFFSET)).context(IoSnafu)?;
        file.write_all(&[1]).context(IoSnafu)?;
        file.sync_all().context(IoSnafu)?;
        Ok(())
    }
}

// ============================================================================
// ChunkedTableFile
// ============================================================================

/// Sequential reader over one chunked table save file.
///
/// Chunks are yielded strictly in on-disk order. A reader opened with a
/// relevant-partition set silently skips chunks belonging to other
/// partitions without decoding them.
#[derive(Debug)]
pub struct ChunkedTableFile {
    reader: BufReader<File>,
    header: SaveFileHeader,
    complete: bool,
    relevant: Option<BTreeSet<PartitionId>>,
    path: PathBuf,
    /// Ordinal of the next frame, for error attribution.
    next_index: u64,
    /// One read-ahead slot filled by `has_more_chunks`.
    peeked: Option<Result<Chunk>>,
    at_end: bool,
}

impl ChunkedTableFile {
    /// Opens a save file and parses its preamble.
    ///
    /// # Errors
    ///
    /// Returns [`SaveFileError`] if the preamble is missing, foreign, or
    /// truncated.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_relevant(path, None)
    }

    /// Opens a save file, restricting iteration to the given partitions.
    ///
    /// Chunks whose partition hint is outside `relevant` are skipped without
    /// checksum verification or decoding. Replicated-table chunks are never
    /// skipped.
    ///
    /// # Errors
    ///
    /// Returns [`SaveFileError`] if the preamble is missing, foreign, or
    /// truncated.
    pub fn open_relevant(
        path: &Path,
        relevant: Option<BTreeSet<PartitionId>>,
    ) -> Result<Self> {
        let file = File::open(path).context(IoSnafu)?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        read_exact_or_truncated(&mut reader, &mut magic, "magic bytes")?;
        if magic != SAVE_MAGIC {
            return Err(SaveFileError::BadMagic { found: magic });
        }

        let mut meta = [0u8; 3];
        read_exact_or_truncated(&mut reader, &mut meta, "version/flags/complete")?;
        let [version, _flags, complete] = meta;
        if version > SAVE_VERSION {
            return Err(SaveFileError::UnsupportedVersion { version });
        }

        let mut len_buf = [0u8; 4];
        read_exact_or_truncated(&mut reader, &mut len_buf, "header length")?;
        let header_len = u32::from_le_bytes(len_buf) as usize;
        if header_len > MAX_CHUNK_BYTES {
            return Err(SaveFileError::OversizeChunk { index: 0, len: header_len });
        }
        let mut header_bytes = vec![0u8; header_len];
        read_exact_or_truncated(&mut reader, &mut header_bytes, "header")?;
        let header: SaveFileHeader =
            codec::decode(&header_bytes).context(HeaderCodecSnafu)?;

        Ok(Self {
            reader,
            header,
            complete: complete == 1,
            relevant,
            path: path.to_path_buf(),
            next_index: 0,
            peeked: None,
            at_end: false,
        })
    }

    /// Whether another chunk (or a per-chunk error) remains to be consumed.
    pub fn has_more_chunks(&mut self) -> bool {
        if self.peeked.is_some() {
            return true;
        }
        if self.at_end {
            return false;
        }
        match self.read_frame() {
            Ok(Some(chunk)) => {
                self.peeked = Some(Ok(chunk));
                true
            }
            Ok(None) => false,
            // Errors are stashed so the caller still observes them through
            // next_chunk rather than silently losing the chunk.
            Err(e) => {
                self.peeked = Some(Err(e));
                true
            }
        }
    }

    /// Returns the next chunk in on-disk order, or `None` at end of data.
    ///
    /// # Errors
    ///
    /// [`SaveFileError::ChunkChecksum`] and [`SaveFileError::ChunkCodec`]
    /// are per-chunk: the stream stays aligned and the following chunk is
    /// still readable. All other errors are terminal for the file.
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        if let Some(stashed) = self.peeked.take() {
            return stashed.map(Some);
        }
        self.read_frame()
    }

    fn read_frame(&mut self) -> Result<Option<Chunk>> {
        loop {
            let mut tag = [0u8; 1];
            match self.reader.read_exact(&mut tag) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    // A complete file must end in the terminator; an
                    // incomplete one just stops wherever the writer died.
                    if self.complete {
                        return Err(SaveFileError::Truncated {
                            reason: format!(
                                "complete file {} ended without terminator",
                                self.path.display()
                            ),
                        });
                    }
                    self.at_end = true;
                    return Ok(None);
                }
                Err(e) => return Err(SaveFileError::Io { source: e }),
            }

            match tag[0] {
                END_TAG => {
                    self.at_end = true;
                    return Ok(None);
                }
                CHUNK_TAG => {}
                other => {
                    return Err(SaveFileError::BadFrameTag { tag: other, index: self.next_index })
                }
            }

            let mut buf = [0u8; 4];
            read_exact_or_truncated(&mut self.reader, &mut buf, "partition hint")?;
            let hint = u32::from_le_bytes(buf);
            read_exact_or_truncated(&mut self.reader, &mut buf, "payload length")?;
            let len = u32::from_le_bytes(buf) as usize;
            read_exact_or_truncated(&mut self.reader, &mut buf, "chunk crc")?;
            let expected_crc = u32::from_le_bytes(buf);

            let index = self.next_index;
            self.next_index += 1;

            if len > MAX_CHUNK_BYTES {
                return Err(SaveFileError::OversizeChunk { index, len });
            }

            let mut payload = vec![0u8; len];
            read_exact_or_truncated(&mut self.reader, &mut payload, "chunk payload")?;

            let partition = (hint != REPLICATED_HINT).then_some(hint);
            if let (Some(p), Some(relevant)) = (partition, self.relevant.as_ref()) {
                if !relevant.contains(&p) {
                    continue;
                }
            }

            let actual_crc = CRC32.checksum(&payload);
            if actual_crc != expected_crc {
                return Err(SaveFileError::ChunkChecksum {
                    index,
                    expected: expected_crc,
                    actual: actual_crc,
                });
            }

            let batch: RowBatch = codec::decode(&payload)
                .map_err(|source| SaveFileError::ChunkCodec { index, source })?;
            return Ok(Some(Chunk { partition, batch }));
        }
    }

    /// The parsed file header.
    pub fn header(&self) -> &SaveFileHeader {
        &self.header
    }

    /// Table name this file holds rows for.
    pub fn table(&self) -> &str {
        &self.header.table
    }

    /// Whether the table was replicated when saved.
    pub fn is_replicated(&self) -> bool {
        self.header.is_replicated
    }

    /// Partition ids contained in this file.
    pub fn partition_ids(&self) -> &[PartitionId] {
        &self.header.partition_ids
    }

    /// Whether the writer finished this file.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Host that produced this file.
    pub fn source_host(&self) -> HostId {
        self.header.source_host
    }

    /// Path this reader was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Releases the underlying descriptor.
    pub fn close(self) {
        drop(self);
    }
}

/// Reads exactly `buf.len()` bytes, converting EOF to a `Truncated` error.
fn read_exact_or_truncated<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
    context: &str,
) -> Result<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            SaveFileError::Truncated {
                reason: format!("unexpected EOF reading {context} ({} bytes)", buf.len()),
            }
        } else {
            SaveFileError::Io { source: e }
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods, clippy::panic)]
mod tests {
    use stratadb_types::{Column, ColumnType, Value};
    use uuid::Uuid;

    use super::*;

    fn test_header(table: &str, partitions: Vec<PartitionId>) -> SaveFileHeader {
        SaveFileHeader {
            table: table.to_string(),
            is_replicated: partitions.is_empty(),
            partition_ids: partitions,
            total_partitions: 4,
            source_host: 7,
            cluster_instance: Uuid::new_v4(),
            txn_id: 9000,
        }
    }

    fn batch_with_ids(ids: &[i64]) -> RowBatch {
        let mut batch = RowBatch::new(vec![Column::new("id", ColumnType::I64)]);
        for id in ids {
            batch.push_row(vec![Value::I64(*id)]).unwrap();
        }
        batch
    }

    #[test]
    fn test_write_read_round_trip_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.sav");

        let mut writer = SaveFileWriter::create(&path, &test_header("t", vec![0, 1])).unwrap();
        writer.write_chunk(Some(0), &batch_with_ids(&[1, 2])).unwrap();
        writer.write_chunk(Some(1), &batch_with_ids(&[3])).unwrap();
        writer.write_chunk(Some(0), &batch_with_ids(&[4])).unwrap();
        writer.finish().unwrap();

        let mut file = ChunkedTableFile::open(&path).unwrap();
        assert!(file.is_complete());
        assert_eq!(file.table(), "t");
        assert_eq!(file.partition_ids(), &[0, 1]);

        let mut seen = Vec::new();
        while file.has_more_chunks() {
            let chunk = file.next_chunk().unwrap().unwrap();
            seen.push((chunk.partition, chunk.batch.len()));
        }
        assert_eq!(seen, vec![(Some(0), 2), (Some(1), 1), (Some(0), 1)]);
        assert!(file.next_chunk().unwrap().is_none());
    }

    #[test]
    fn test_unfinished_file_reads_as_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.sav");

        let mut writer = SaveFileWriter::create(&path, &test_header("t", vec![0])).unwrap();
        writer.write_chunk(Some(0), &batch_with_ids(&[1])).unwrap();
        // No finish: simulate a writer crash. Flush what the BufWriter holds.
        writer.writer.flush().unwrap();
        drop(writer);

        let mut file = ChunkedTableFile::open(&path).unwrap();
        assert!(!file.is_complete());
        assert!(file.next_chunk().unwrap().is_some());
        assert!(file.next_chunk().unwrap().is_none());
    }

    #[test]
    fn test_corrupt_chunk_does_not_poison_the_next() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.sav");

        let header = test_header("t", vec![0]);
        let batches = [batch_with_ids(&[1]), batch_with_ids(&[2]), batch_with_ids(&[3])];
        let mut writer = SaveFileWriter::create(&path, &header).unwrap();
        for b in &batches {
            writer.write_chunk(Some(0), b).unwrap();
        }
        writer.finish().unwrap();

        // Flip one byte inside the second chunk's payload.
        let header_len = codec::encode(&header).unwrap().len();
        let frame = |b: &RowBatch| 1 + 4 + 4 + 4 + codec::encode(b).unwrap().len();
        let preamble = 4 + 3 + 4 + header_len;
        let corrupt_at = preamble + frame(&batches[0]) + 13 + 2;
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[corrupt_at] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let mut file = ChunkedTableFile::open(&path).unwrap();
        assert!(file.next_chunk().unwrap().is_some());
        let err = file.next_chunk().unwrap_err();
        assert!(matches!(err, SaveFileError::ChunkChecksum { index: 1, .. }));
        // The third chunk is still intact and readable.
        let third = file.next_chunk().unwrap().unwrap();
        assert_eq!(third.batch.rows[0], vec![Value::I64(3)]);
        assert!(file.next_chunk().unwrap().is_none());
    }

    #[test]
    fn test_relevant_partition_filter_skips_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.sav");

        let mut writer = SaveFileWriter::create(&path, &test_header("t", vec![0, 1, 2])).unwrap();
        writer.write_chunk(Some(0), &batch_with_ids(&[1])).unwrap();
        writer.write_chunk(Some(1), &batch_with_ids(&[2])).unwrap();
        writer.write_chunk(Some(2), &batch_with_ids(&[3])).unwrap();
        writer.write_chunk(Some(1), &batch_with_ids(&[4])).unwrap();
        writer.finish().unwrap();

        let relevant: BTreeSet<PartitionId> = [1].into_iter().collect();
        let mut file = ChunkedTableFile::open_relevant(&path, Some(relevant)).unwrap();
        let mut seen = Vec::new();
        while let Some(chunk) = file.next_chunk().unwrap() {
            seen.push(chunk.batch.rows[0].clone());
        }
        assert_eq!(seen, vec![vec![Value::I64(2)], vec![Value::I64(4)]]);
    }

    #[test]
    fn test_foreign_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not_a_save");
        std::fs::write(&path, b"JUNKJUNKJUNK").unwrap();
        let err = ChunkedTableFile::open(&path).unwrap_err();
        assert!(matches!(err, SaveFileError::BadMagic { .. }));
    }

    #[test]
    fn test_save_file_names() {
        assert_eq!(save_file_name("snap1", "orders", None), "snap1-orders.sav");
        assert_eq!(save_file_name("snap1", "orders", Some(3)), "snap1-orders-host_3.sav");
    }
}
