use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::StoreEvent;

const LEN_BYTES: usize = 4;
const CRC_BYTES: usize = 4;

/// Frame one event as `[u32 len][bincode][u32 crc32]`, little-endian.
fn frame_into(buf: &mut Vec<u8>, event: &StoreEvent) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "store event too large"))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&payload);
    buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    Ok(())
}

/// Iterates the intact frames at the start of a log image.
///
/// Stops at the first short, corrupt or undecodable frame; `offset` is then
/// the length of the valid prefix.
struct Frames<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Frames<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }
}

impl Iterator for Frames<'_> {
    type Item = StoreEvent;

    fn next(&mut self) -> Option<StoreEvent> {
        let rest = &self.bytes[self.offset..];
        let (len, rest) = rest.split_first_chunk::<LEN_BYTES>()?;
        let len = u32::from_le_bytes(*len) as usize;
        if rest.len() < len + CRC_BYTES {
            return None;
        }
        let (payload, rest) = rest.split_at(len);
        let (crc, _) = rest.split_first_chunk::<CRC_BYTES>()?;
        if u32::from_le_bytes(*crc) != crc32fast::hash(payload) {
            return None;
        }
        let event = bincode::deserialize(payload).ok()?;
        self.offset += LEN_BYTES + len + CRC_BYTES;
        Some(event)
    }
}

/// What survived in a log file.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Recovered {
    pub events: Vec<StoreEvent>,
    /// Byte length of the intact prefix.
    pub valid_len: u64,
    /// Bytes after the intact prefix, from a torn or corrupt write.
    pub discarded: u64,
}

/// Read every intact event in the log at `path`. A missing file is empty.
pub fn recover(path: &Path) -> io::Result<Recovered> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Recovered::default()),
        Err(e) => return Err(e),
    };
    let mut frames = Frames::new(&bytes);
    let events: Vec<StoreEvent> = frames.by_ref().collect();
    let valid_len = frames.offset as u64;
    Ok(Recovered {
        events,
        valid_len,
        discarded: bytes.len() as u64 - valid_len,
    })
}

/// Append-only event log behind the timeslot store.
///
/// Events are staged in memory and written by `commit`, which issues one
/// fsync for everything staged since the previous commit.
pub struct Wal {
    file: File,
    path: PathBuf,
    staged: Vec<u8>,
    staged_events: u64,
    since_rewrite: u64,
}

impl Wal {
    /// Recover the log at `path`, cut off any torn tail, and open it for
    /// appending. Returns the log with the events it already held.
    pub fn open(path: &Path) -> io::Result<(Self, Vec<StoreEvent>)> {
        let recovered = recover(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if recovered.discarded > 0 {
            warn!(
                "discarding {} trailing bytes of {}",
                recovered.discarded,
                path.display()
            );
            file.set_len(recovered.valid_len)?;
            file.sync_all()?;
        }
        let wal = Self {
            file,
            path: path.to_path_buf(),
            staged: Vec::new(),
            staged_events: 0,
            since_rewrite: 0,
        };
        Ok((wal, recovered.events))
    }

    pub fn stage(&mut self, event: &StoreEvent) -> io::Result<()> {
        frame_into(&mut self.staged, event)?;
        self.staged_events += 1;
        Ok(())
    }

    /// Write and fsync staged events. Staged bytes are dropped either way,
    /// so a failed commit never leaks into the next one.
    pub fn commit(&mut self) -> io::Result<()> {
        let bytes = std::mem::take(&mut self.staged);
        let count = std::mem::take(&mut self.staged_events);
        if bytes.is_empty() {
            return Ok(());
        }
        self.file.write_all(&bytes)?;
        self.file.sync_data()?;
        self.since_rewrite += count;
        Ok(())
    }

    /// Replace the whole log with `events`, atomically via rename.
    pub fn rewrite(&mut self, events: &[StoreEvent]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        let mut image = Vec::new();
        for event in events {
            frame_into(&mut image, event)?;
        }
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(&image)?;
        tmp.sync_all()?;
        fs::rename(&tmp_path, &self.path)?;

        self.file = OpenOptions::new().append(true).open(&self.path)?;
        self.staged.clear();
        self.staged_events = 0;
        self.since_rewrite = 0;
        Ok(())
    }

    /// Events committed since the log was opened or last rewritten.
    pub fn appends_since_compact(&self) -> u64 {
        self.since_rewrite
    }
}
