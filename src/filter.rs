use std::sync::Mutex;

use bloomfilter::Bloom;
use byteorder::{ByteOrder, LittleEndian};

use crate::error::Result;
use crate::fsys::Fsys;

/// Expected live entries; past this the false positive rate degrades but
/// misses stay definitive.
const EXPECTED_ITEMS: usize = 1_000_000;
const FALSE_POSITIVE_RATE: f64 = 0.01;

/// Append-only membership filter over sequence numbers.
///
/// Deletes and expiries consult the filter first: a miss proves the seq was
/// never indexed, so the index block read is skipped. The filter is
/// persisted next to the index on every sync and reloaded on open.
pub struct Filter {
    bloom: Mutex<Bloom<u64>>,
    file: Fsys,
}

impl Filter {
    pub fn open(file: Fsys) -> Result<Self> {
        let bloom = if file.size() > 0 {
            load(&file)?
        } else {
            Bloom::new_for_fp_rate(EXPECTED_ITEMS, FALSE_POSITIVE_RATE)
        };
        Ok(Self {
            bloom: Mutex::new(bloom),
            file,
        })
    }

    pub fn append(&self, seq: u64) {
        self.bloom.lock().unwrap().set(&seq);
    }

    /// Returns false only when the seq has definitely never been indexed.
    pub fn test(&self, seq: u64) -> bool {
        self.bloom.lock().unwrap().check(&seq)
    }

    /// Persists the filter bitmap; called from the sync pass after index
    /// blocks for the appended seqs have been written.
    pub fn write(&self) -> Result<()> {
        let bloom = self.bloom.lock().unwrap();
        let bitmap = bloom.bitmap();
        let sip_keys = bloom.sip_keys();

        let mut buf = vec![0u8; 44 + bitmap.len()];
        LittleEndian::write_u64(&mut buf[0..8], bloom.number_of_bits());
        LittleEndian::write_u32(&mut buf[8..12], bloom.number_of_hash_functions());
        LittleEndian::write_u64(&mut buf[12..20], sip_keys[0].0);
        LittleEndian::write_u64(&mut buf[20..28], sip_keys[0].1);
        LittleEndian::write_u64(&mut buf[28..36], sip_keys[1].0);
        LittleEndian::write_u64(&mut buf[36..44], sip_keys[1].1);
        buf[44..].copy_from_slice(&bitmap);

        self.file.truncate(0)?;
        self.file.write_at(&buf, 0)?;
        self.file.sync()
    }
}

fn load(file: &Fsys) -> Result<Bloom<u64>> {
    let size = file.size();
    if size < 44 {
        return Err(crate::errcorrupt!("filter file too short: {size}"));
    }
    let buf = file.slice(0, size)?;
    let num_bits = LittleEndian::read_u64(&buf[0..8]);
    let num_hashes = LittleEndian::read_u32(&buf[8..12]);
    let sip_keys = [
        (
            LittleEndian::read_u64(&buf[12..20]),
            LittleEndian::read_u64(&buf[20..28]),
        ),
        (
            LittleEndian::read_u64(&buf[28..36]),
            LittleEndian::read_u64(&buf[36..44]),
        ),
    ];
    Ok(Bloom::from_existing(
        &buf[44..],
        num_bits,
        num_hashes,
        sip_keys,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_filter() -> (tempfile::TempDir, Filter) {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let file = Fsys::open(dir.path().join("t.filter")).expect("Failed to open file");
        let filter = Filter::open(file).expect("Failed to open filter");
        (dir, filter)
    }

    #[test]
    fn test_append_and_test() {
        let (_dir, filter) = temp_filter();
        for seq in 1..100u64 {
            filter.append(seq);
        }
        for seq in 1..100u64 {
            assert!(filter.test(seq), "appended seq must test positive");
        }
    }

    #[test]
    fn test_absent_mostly_negative() {
        let (_dir, filter) = temp_filter();
        for seq in 1..100u64 {
            filter.append(seq);
        }
        // With 1% FPR over a million-slot filter, a hundred distant probes
        // should essentially all miss.
        let hits = (1_000_000..1_000_100u64).filter(|s| filter.test(*s)).count();
        assert!(hits < 5, "unexpected false positive burst: {hits}");
    }

    #[test]
    fn test_persist_round_trip() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("t.filter");

        {
            let file = Fsys::open(&path).expect("Failed to open file");
            let filter = Filter::open(file).expect("Failed to open filter");
            filter.append(7);
            filter.append(8);
            filter.write().expect("Failed to persist filter");
        }

        let file = Fsys::open(&path).expect("Failed to reopen file");
        let filter = Filter::open(file).expect("Failed to reload filter");
        assert!(filter.test(7));
        assert!(filter.test(8));
        // Reloaded filters keep appending.
        filter.append(9);
        assert!(filter.test(9));
    }
}
