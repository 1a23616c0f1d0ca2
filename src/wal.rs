use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

/// One committed transaction: every event in it is applied or none is.
pub type Txn = Vec<Event>;

/// Encode one transaction as `[len][bincode][crc32]`.
fn encode_txn(writer: &mut impl Write, txn: &[Event]) -> io::Result<()> {
    let payload =
        bincode::serialize(txn).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "transaction too large"))?;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Append-only transaction log backing the `time_slots` and `appointments` tables.
///
/// Format per record: `[u32: len][bincode: Vec<Event>][u32: crc32]`.
/// A torn or corrupt trailing record is dropped as a whole on replay, so a crash
/// mid-commit never leaves half a transaction behind. `recover` also cuts it
/// off the file before reopening, so later appends stay readable.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append and fsync a single transaction. Tests only; the engine batches
    /// through `append_buffered` + `flush_sync`.
    #[cfg(test)]
    pub fn append(&mut self, txn: &[Event]) -> io::Result<()> {
        self.append_buffered(txn)?;
        self.flush_sync()
    }

    pub fn append_buffered(&mut self, txn: &[Event]) -> io::Result<()> {
        encode_txn(&mut self.writer, txn)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a snapshot to `<wal>.tmp` and fsync it. Slow; runs before the swap.
    pub fn write_compact_file(path: &Path, snapshot: &[Event]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        encode_txn(&mut writer, snapshot)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Rename the snapshot over the log and reopen for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Read back every intact transaction, in commit order.
    pub fn replay(path: &Path) -> io::Result<Vec<Txn>> {
        Ok(scan(path)?.0)
    }

    /// Replay the log, cut off any torn or corrupt tail, and open it for
    /// appends. New records must never land behind bytes replay cannot read.
    pub fn recover(path: &Path) -> io::Result<(Vec<Txn>, Self)> {
        let (txns, valid_len) = scan(path)?;
        if let Ok(meta) = fs::metadata(path)
            && meta.len() > valid_len
        {
            warn!(
                path = %path.display(),
                valid_len,
                discarded = meta.len() - valid_len,
                "truncating torn WAL tail"
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        Ok((txns, Self::open(path)?))
    }
}

/// Every intact transaction plus the byte length of the intact prefix.
fn scan(path: &Path) -> io::Result<(Vec<Txn>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut txns = Vec::new();
    let mut valid_len = 0u64;

    while let Some(payload) = read_record(&mut reader)? {
        match bincode::deserialize::<Txn>(&payload) {
            Ok(txn) => txns.push(txn),
            Err(_) => break,
        }
        // len prefix + payload + crc
        valid_len += 8 + payload.len() as u64;
    }

    Ok((txns, valid_len))
}

/// Next CRC-verified payload, or `None` at a clean end, a torn tail, or a bad checksum.
fn read_record(reader: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    if !read_or_eof(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;

    let mut payload = vec![0u8; len];
    if !read_or_eof(reader, &mut payload)? {
        return Ok(None);
    }

    let mut crc_buf = [0u8; 4];
    if !read_or_eof(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(Some(payload))
}

fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ulid::Ulid;

    use crate::model::{Stamp, TimeSlot};

    fn stamp(h: u32) -> Stamp {
        NaiveDate::from_ymd_opt(2031, 6, 3)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    fn slot_created(h: u32) -> Event {
        Event::SlotCreated(TimeSlot::new(Ulid::new(), stamp(h), true, stamp(8)))
    }

    #[test]
    fn append_and_replay_preserves_transaction_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("txns.wal");

        let first = vec![slot_created(9), slot_created(10)];
        let second = vec![slot_created(11)];
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
            wal.append(&second).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![first, second]);
    }

    #[test]
    fn torn_tail_drops_whole_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("torn.wal");

        let committed = vec![slot_created(9)];
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&committed).unwrap();
        }

        // Half of a second record: valid length prefix, short payload.
        let partial = bincode::serialize(&vec![slot_created(10), slot_created(11)]).unwrap();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(partial.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&partial[..partial.len() / 2]).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![committed]);
    }

    #[test]
    fn recover_truncates_garbage_so_later_appends_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recover.wal");

        let committed = vec![slot_created(9)];
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&committed).unwrap();
        }
        let good_len = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&100u32.to_le_bytes()).unwrap();
            f.write_all(&[1, 2, 3]).unwrap();
        }

        let (txns, mut wal) = Wal::recover(&path).unwrap();
        assert_eq!(txns, vec![committed.clone()]);
        assert_eq!(fs::metadata(&path).unwrap().len(), good_len);

        let later = vec![slot_created(10)];
        wal.append(&later).unwrap();
        drop(wal);

        assert_eq!(Wal::replay(&path).unwrap(), vec![committed, later]);
    }

    #[test]
    fn missing_file_replays_empty() {
        let dir = tempfile::tempdir().unwrap();
        let replayed = Wal::replay(&dir.path().join("absent.wal")).unwrap();
        assert!(replayed.is_empty());
    }

    #[test]
    fn bad_checksum_stops_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crc.wal");

        let payload = bincode::serialize(&vec![Event::SlotDeleted { id: Ulid::new() }]).unwrap();
        {
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }

        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn compaction_replaces_history_with_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("compact.wal");

        let slot = Ulid::new();
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&[Event::SlotCreated(TimeSlot::new(slot, stamp(9), true, stamp(8)))])
            .unwrap();
        for i in 0..20 {
            wal.append(&[Event::SlotAvailabilityChanged {
                id: slot,
                is_available: i % 2 == 0,
                at: stamp(8),
            }])
            .unwrap();
        }
        assert_eq!(wal.appends_since_compact(), 21);
        let before = fs::metadata(&path).unwrap().len();

        let snapshot = vec![Event::SlotCreated(TimeSlot::new(slot, stamp(9), false, stamp(8)))];
        Wal::write_compact_file(&path, &snapshot).unwrap();
        wal.swap_compact_file().unwrap();
        assert_eq!(wal.appends_since_compact(), 0);

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "snapshot should be smaller: {after} < {before}");

        let tail = vec![Event::SlotDeleted { id: slot }];
        wal.append(&tail).unwrap();
        drop(wal);

        assert_eq!(Wal::replay(&path).unwrap(), vec![snapshot, tail]);
    }
}
