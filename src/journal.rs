use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Append-only booking journal.
///
/// Record layout: `[u32: len][bincode: Event][u32: crc32]`
/// - `len` counts the bincode payload only (not the CRC).
/// - A truncated or corrupt tail (crash mid-append) is discarded on
///   replay via the length prefix + CRC check.
pub struct Journal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

fn encode_record(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

impl Journal {
    /// Open (or create) the journal file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append one event and fsync. Tests only — production goes through
    /// `append_buffered` + `flush_sync` for group commit.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one event without flushing. Call `flush_sync()` after the
    /// batch to durably commit everything buffered.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_record(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush the buffer and fsync the file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Write a compacted event set to a sibling temp file and fsync it.
    /// This is the slow I/O phase — run it OUTSIDE the journal lock.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let tmp_path = path.with_extension("journal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for event in events {
            encode_record(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Atomic swap: rename the temp file over the journal and reopen.
    /// Fast — run while holding the journal lock.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("journal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Both compaction phases in one call. Tests only.
    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    /// Replay the journal from disk, returning every valid event.
    /// A truncated or corrupt tail is silently dropped.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();

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
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }

            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                // Corrupt record — stop replaying here
                break;
            }

            match bincode::deserialize::<Event>(&payload) {
                Ok(event) => events.push(event),
                Err(_) => break, // corrupt payload
            }
        }

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use chrono::{NaiveDate, NaiveTime};
    use ulid::Ulid;

    use crate::model::{SlotSpec, WeeklyTemplate};

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotwire_test_journal");
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    fn date() -> NaiveDate {
        NaiveDate::parse_from_str("2025-01-06", "%Y-%m-%d").unwrap()
    }

    fn time(hhmm: &str) -> NaiveTime {
        NaiveTime::parse_from_str(hhmm, "%H:%M").unwrap()
    }

    fn override_event(expert_id: Ulid) -> Event {
        Event::OverrideSet {
            expert_id,
            date: date(),
            slots: vec![SlotSpec {
                start: time("09:00"),
                end: time("10:00"),
                message: None,
            }],
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.journal");
        let _ = fs::remove_file(&path);

        let expert = Ulid::new();
        let events = vec![
            Event::WeeklySet {
                expert_id: expert,
                template: WeeklyTemplate::default(),
            },
            override_event(expert),
            Event::ClaimRequested {
                expert_id: expert,
                date: date(),
                start: time("09:00"),
                end: time("10:00"),
                user_id: Ulid::new(),
                message: None,
                created_at: 1_736_121_600_000,
            },
        ];

        {
            let mut journal = Journal::open(&path).unwrap();
            for e in &events {
                journal.append(e).unwrap();
            }
        }

        let replayed = Journal::replay(&path).unwrap();
        assert_eq!(replayed, events);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_handles_truncation() {
        let path = tmp_path("truncation.journal");
        let _ = fs::remove_file(&path);

        let event = override_event(Ulid::new());
        {
            let mut journal = Journal::open(&path).unwrap();
            journal.append(&event).unwrap();
        }

        // Garbage tail simulating a crash mid-append
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0u8; 6]).unwrap();
        }

        let replayed = Journal::replay(&path).unwrap();
        assert_eq!(replayed, vec![event]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.journal");
        let _ = fs::remove_file(&path);
        assert!(Journal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_stops_at_corrupt_crc() {
        let path = tmp_path("corrupt_crc.journal");
        let _ = fs::remove_file(&path);

        let good = override_event(Ulid::new());
        let bad = Event::OverrideRemoved { expert_id: Ulid::new(), date: date() };

        {
            let mut journal = Journal::open(&path).unwrap();
            journal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&bad).unwrap();
            let len = payload.len() as u32;
            let bad_crc: u32 = 0xDEADBEEF;
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&len.to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&bad_crc.to_le_bytes()).unwrap();
        }

        let replayed = Journal::replay(&path).unwrap();
        assert_eq!(replayed, vec![good]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_reduces_journal() {
        let path = tmp_path("compact_reduce.journal");
        let _ = fs::remove_file(&path);

        let expert = Ulid::new();
        {
            let mut journal = Journal::open(&path).unwrap();
            journal.append(&override_event(expert)).unwrap();
            // Churn: repeated claim request/cancel pairs
            for _ in 0..10 {
                let user = Ulid::new();
                journal
                    .append(&Event::ClaimRequested {
                        expert_id: expert,
                        date: date(),
                        start: time("09:00"),
                        end: time("10:00"),
                        user_id: user,
                        message: None,
                        created_at: 1_736_121_600_000,
                    })
                    .unwrap();
                journal
                    .append(&Event::ClaimCancelled {
                        expert_id: expert,
                        date: date(),
                        start: time("09:00"),
                        end: time("10:00"),
                        user_id: user,
                    })
                    .unwrap();
            }
        }

        let before = fs::metadata(&path).unwrap().len();
        assert!(before > 0);

        // Final state: just the override, no claims
        let compacted = vec![override_event(expert)];
        {
            let mut journal = Journal::open(&path).unwrap();
            journal.compact(&compacted).unwrap();
        }

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted journal should be smaller: {after} < {before}");

        assert_eq!(Journal::replay(&path).unwrap(), compacted);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.journal");
        let _ = fs::remove_file(&path);

        let expert = Ulid::new();
        let compacted = vec![override_event(expert)];
        let new_event = Event::OverrideRemoved { expert_id: expert, date: date() };

        {
            let mut journal = Journal::open(&path).unwrap();
            journal.append(&compacted[0]).unwrap();
            journal.compact(&compacted).unwrap();
            journal.append(&new_event).unwrap();
        }

        let replayed = Journal::replay(&path).unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0], compacted[0]);
        assert_eq!(replayed[1], new_event);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn append_buffered_then_flush_sync() {
        let path = tmp_path("buffered_flush.journal");
        let _ = fs::remove_file(&path);

        let events: Vec<Event> = (0..5).map(|_| override_event(Ulid::new())).collect();

        {
            let mut journal = Journal::open(&path).unwrap();
            for e in &events {
                journal.append_buffered(e).unwrap();
            }
            assert_eq!(journal.appends_since_compact(), 5);
            journal.flush_sync().unwrap();
        }

        assert_eq!(Journal::replay(&path).unwrap(), events);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn blocked_dates_roundtrip() {
        let path = tmp_path("blocked_dates.journal");
        let _ = fs::remove_file(&path);

        let mut dates = BTreeSet::new();
        dates.insert(date());
        let event = Event::BlockedDatesSet { expert_id: Ulid::new(), dates };

        {
            let mut journal = Journal::open(&path).unwrap();
            journal.append(&event).unwrap();
        }

        assert_eq!(Journal::replay(&path).unwrap(), vec![event]);

        let _ = fs::remove_file(&path);
    }
}
