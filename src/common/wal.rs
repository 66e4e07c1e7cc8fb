//! Write-Ahead Log (WAL) implementation
//!
//! Append-only record store shared by the coordinator's decision log and each
//! participant's phase log. A record is durable once `append` returns: the
//! frame has been written, flushed and forced to storage with `sync_all`.
//!
//! WAL format: [MAGIC][SEQUENCE][LEN][PAYLOAD][CRC32]
//!
//! The payload is the JSON encoding of the record. The checksum covers the
//! sequence, length and payload. A torn or corrupt tail (crash mid-append) is
//! cut off when the log is reopened, so replay always ends at the last
//! complete record.

use crate::common::{crc32, Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

const WAL_MAGIC: [u8; 4] = [0x43, 0x4B, 0x57, 0x31]; // "CKW1"
const HEADER_LEN: usize = 4 + 8 + 4;
const MAX_RECORD_LEN: u32 = 16 * 1024 * 1024;

/// WAL entry
#[derive(Debug, Clone, PartialEq)]
pub struct WalEntry<R> {
    pub sequence: u64,
    pub record: R,
}

/// Write-Ahead Log over records of type `R`.
pub struct Wal<R> {
    path: PathBuf,
    file: File,
    next_sequence: u64,
    /// Byte length of the valid prefix; the file never extends past it
    /// except during an in-progress append.
    len: u64,
    _record: PhantomData<fn() -> R>,
}

impl<R> std::fmt::Debug for Wal<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("path", &self.path)
            .field("next_sequence", &self.next_sequence)
            .field("len", &self.len)
            .finish()
    }
}

impl<R: Serialize + DeserializeOwned> Wal<R> {
    /// Open or create WAL file.
    /// If the file exists, finds the last sequence number to continue
    /// appending and truncates anything after the last intact entry.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;

        let (next_sequence, valid_len) = Self::scan(&path)?;
        let file_len = file.metadata()?.len();
        if file_len > valid_len {
            tracing::warn!(
                path = %path.display(),
                dropped_bytes = file_len - valid_len,
                "Truncating torn WAL tail"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        Ok(Self {
            path,
            file,
            next_sequence,
            len: valid_len,
            _record: PhantomData,
        })
    }

    /// Walk every intact entry, returning the next sequence number and the
    /// byte length of the intact prefix.
    fn scan(path: &Path) -> Result<(u64, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((0, 0)),
            Err(e) => return Err(e.into()),
        };

        let mut reader = BufReader::new(file);
        let mut next_sequence = 0;
        let mut valid_len = 0u64;

        loop {
            match Self::read_entry_internal(&mut reader) {
                Ok(Some((entry, frame_len))) => {
                    next_sequence = next_sequence.max(entry.sequence + 1);
                    valid_len += frame_len;
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }

        Ok((next_sequence, valid_len))
    }

    /// Append a record and force it to storage.
    /// Returns the sequence number assigned to the record. On failure the
    /// file is cut back to its previous length and the error is returned;
    /// the caller must not act on the record.
    pub fn append(&mut self, record: &R) -> Result<u64> {
        let sequence = self.next_sequence;
        let frame = Self::encode_frame(sequence, record)?;

        if let Err(e) = self.write_frame(&frame) {
            tracing::error!(path = %self.path.display(), error = %e, "WAL append failed");
            if let Err(trunc) = self.file.set_len(self.len) {
                tracing::error!(error = %trunc, "Failed to roll back partial WAL frame");
            }
            return Err(e);
        }

        self.len += frame.len() as u64;
        self.next_sequence += 1;
        Ok(sequence)
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.file.write_all(frame)?;
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    fn encode_frame(sequence: u64, record: &R) -> Result<Vec<u8>> {
        let payload = serde_json::to_vec(record)?;
        let payload_len = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len <= MAX_RECORD_LEN)
            .ok_or_else(|| Error::Wal(format!("record too large: {} bytes", payload.len())))?;

        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len() + 4);
        frame.extend_from_slice(&WAL_MAGIC);
        frame.extend_from_slice(&sequence.to_le_bytes());
        frame.extend_from_slice(&payload_len.to_le_bytes());
        frame.extend_from_slice(&payload);

        let checksum = crc32(&frame[WAL_MAGIC.len()..]);
        frame.extend_from_slice(&checksum.to_le_bytes());
        Ok(frame)
    }

    /// Replay WAL entries in append order.
    pub fn replay<F>(path: impl AsRef<Path>, mut callback: F) -> Result<()>
    where
        F: FnMut(WalEntry<R>) -> Result<()>,
    {
        let file = match File::open(path.as_ref()) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mut reader = BufReader::new(file);

        loop {
            match Self::read_entry_internal(&mut reader) {
                Ok(Some((entry, _))) => callback(entry)?,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("WAL replay stopped at corrupted entry: {}", e);
                    break;
                }
            }
        }

        Ok(())
    }

    /// Read a single entry, returning it with its frame length.
    fn read_entry_internal<Rd: Read>(reader: &mut Rd) -> Result<Option<(WalEntry<R>, u64)>> {
        let mut magic = [0u8; 4];
        match reader.read_exact(&mut magic) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        if magic != WAL_MAGIC {
            return Err(Error::Wal("Invalid WAL magic".into()));
        }

        let mut seq_bytes = [0u8; 8];
        reader.read_exact(&mut seq_bytes)?;
        let sequence = u64::from_le_bytes(seq_bytes);

        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let payload_len = u32::from_le_bytes(len_bytes);
        if payload_len > MAX_RECORD_LEN {
            return Err(Error::Corrupted(format!(
                "record length {} exceeds limit",
                payload_len
            )));
        }

        let mut payload = vec![0u8; payload_len as usize];
        reader.read_exact(&mut payload)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);

        let mut checksum_data = Vec::with_capacity(12 + payload.len());
        checksum_data.extend_from_slice(&seq_bytes);
        checksum_data.extend_from_slice(&len_bytes);
        checksum_data.extend_from_slice(&payload);

        if crc32(&checksum_data) != stored_checksum {
            return Err(Error::Wal("Checksum mismatch".into()));
        }

        let record = serde_json::from_slice(&payload)
            .map_err(|e| Error::Corrupted(format!("undecodable record {}: {}", sequence, e)))?;

        let frame_len = (HEADER_LEN + payload.len() + 4) as u64;
        Ok(Some((WalEntry { sequence, record }, frame_len)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }
}
