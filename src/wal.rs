use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Bytes of framing around each payload: u32 length prefix + u32 CRC.
const FRAME_OVERHEAD: u64 = 8;

/// Encode a single event to [len][bincode][crc32] format. Returns the
/// frame's size in bytes.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<u64> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(len as u64 + FRAME_OVERHEAD)
}

/// Append-only Write-Ahead Log of committed reservations.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - A torn or corrupt tail (crash mid-write) ends replay. `open` cuts the
///   file back to the last good entry so later appends stay reachable.
/// - A failed flush is undone with `rollback`, which cuts the file back to
///   the end of the last synced entry and drops whatever is still buffered.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    /// File length as of the last successful `flush_sync`.
    synced_len: u64,
    /// Bytes appended since then.
    pending: u64,
    #[cfg(test)]
    fail_next_flush: bool,
}

impl Wal {
    /// Open (or create) the WAL file at `path`, discarding any torn tail.
    pub fn open(path: &Path) -> io::Result<Self> {
        let (_, valid_len) = scan(path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let on_disk = file.metadata()?.len();
        if on_disk > valid_len {
            tracing::warn!(
                path = %path.display(),
                discarded = on_disk - valid_len,
                "truncating torn WAL tail"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            synced_len: valid_len,
            pending: 0,
            #[cfg(test)]
            fail_next_flush: false,
        })
    }

    /// Append a single event to the WAL and fsync. The writer task uses
    /// `append_buffered` + `flush_sync` instead, for group commit.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Append a single event to the BufWriter without flushing or syncing.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        self.pending += encode_event(&mut self.writer, event)?;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        #[cfg(test)]
        {
            if std::mem::take(&mut self.fail_next_flush) {
                return self.fail_half_written();
            }
        }
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        self.synced_len += self.pending;
        self.pending = 0;
        Ok(())
    }

    /// Undo everything appended since the last successful `flush_sync`:
    /// drop the buffered bytes, cut the file back and fsync. If this fails
    /// the file may still hold unacknowledged bytes, and the caller must
    /// stop appending.
    pub fn rollback(&mut self) -> io::Result<()> {
        let file = self.writer.get_ref().try_clone()?;
        // into_parts, not drop: dropping a BufWriter flushes its buffer.
        let (_, _discarded) = std::mem::replace(&mut self.writer, BufWriter::new(file)).into_parts();
        self.pending = 0;
        let file = self.writer.get_ref();
        file.set_len(self.synced_len)?;
        file.sync_all()
    }

    /// Length of the file up to the last synced entry.
    pub fn synced_len(&self) -> u64 {
        self.synced_len
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Make the next `flush_sync` write half of the buffered bytes, as a full
    /// disk would, then fail.
    #[cfg(test)]
    pub(crate) fn fail_next_flush(&mut self) {
        self.fail_next_flush = true;
    }

    #[cfg(test)]
    fn fail_half_written(&mut self) -> io::Result<()> {
        let half = self.writer.buffer().len() / 2;
        let partial = self.writer.buffer()[..half].to_vec();
        self.writer.get_mut().write_all(&partial)?;
        Err(io::Error::new(io::ErrorKind::StorageFull, "no space left on device"))
    }

    /// Replay the WAL from disk, returning all valid events.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        scan(path).map(|(events, _)| events)
    }
}

/// Read every intact entry. Returns the events and the byte offset just past
/// the last intact entry.
fn scan(path: &Path) -> io::Result<(Vec<Event>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut events = Vec::new();
    let mut valid_len = 0u64;

    loop {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
        let len = u32::from_le_bytes(len_buf) as usize;

        let mut payload = vec![0u8; len];
        match reader.read_exact(&mut payload) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }

        let mut crc_buf = [0u8; 4];
        match reader.read_exact(&mut crc_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
        if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
            tracing::warn!(path = %path.display(), offset = valid_len, "WAL checksum mismatch, stopping replay");
            break;
        }

        match bincode::deserialize::<Event>(&payload) {
            Ok(event) => events.push(event),
            Err(e) => {
                tracing::warn!(path = %path.display(), offset = valid_len, "undecodable WAL entry: {e}");
                break;
            }
        }
        valid_len += len as u64 + FRAME_OVERHEAD;
    }

    Ok((events, valid_len))
}
