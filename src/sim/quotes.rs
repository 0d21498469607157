// Shared quote matrix reader - lock-free, written by the market-data service
//
// Layout: MAX_SLOTS u64 version counters, then MAX_SLOTS 64-byte quote slots.
// A writer bumps a slot's seqlock to odd, writes, bumps it to even, then
// raises the slot's version.
use memmap2::Mmap;
use std::path::Path;
use std::sync::atomic::{compiler_fence, AtomicU32, AtomicU64, Ordering};

use super::instrument::InstrumentTable;
use crate::core::{Error, Result};

pub const MAX_SLOTS: usize = 2048;
const SLOT_SIZE: usize = 64;
const VERSION_SIZE: usize = 8;
const SLOTS_OFFSET: usize = MAX_SLOTS * VERSION_SIZE;
pub const MATRIX_LEN: usize = SLOTS_OFFSET + MAX_SLOTS * SLOT_SIZE;

#[repr(C, align(64))]
#[derive(Clone, Copy, Debug, Default)]
pub struct QuoteSlot {
    pub seqlock: u32,
    pub _pad: u32,
    pub last_price: f64,
    pub bid_price1: f64,
    pub ask_price1: f64,
    pub upper_limit: f64,
    pub lower_limit: f64,
    pub pre_settlement: f64,
    pub _reserved: [u8; 8],
}

const _: () = assert!(std::mem::size_of::<QuoteSlot>() == SLOT_SIZE);

pub struct QuoteMatrix {
    mmap: Mmap,
    local_versions: Vec<u64>,
}

impl QuoteMatrix {
    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        // SAFETY: the file is only ever accessed through atomics and
        // seqlock-validated volatile reads.
        let mmap = unsafe { Mmap::map(&file)? };
        if mmap.len() < MATRIX_LEN {
            return Err(Error::ChannelCorrupt(format!(
                "{}: quote matrix is {} bytes, need {}",
                path.display(),
                mmap.len(),
                MATRIX_LEN
            )));
        }
        Ok(Self { mmap, local_versions: vec![0; MAX_SLOTS] })
    }

    #[inline(always)]
    fn load_version(&self, slot: usize) -> u64 {
        let ptr = unsafe { self.mmap.as_ptr().add(slot * VERSION_SIZE) as *const AtomicU64 };
        unsafe { (*ptr).load(Ordering::Acquire) }
    }

    /// Consistent copy of one slot.
    pub fn read(&self, slot: usize) -> QuoteSlot {
        let ptr = unsafe { self.mmap.as_ptr().add(SLOTS_OFFSET + slot * SLOT_SIZE) };
        let seq_ptr = ptr as *const AtomicU32;
        loop {
            let seq1 = unsafe { (*seq_ptr).load(Ordering::Acquire) };
            if seq1 & 1 != 0 {
                std::hint::spin_loop();
                continue;
            }
            compiler_fence(Ordering::Acquire);
            let quote = unsafe { core::ptr::read_volatile(ptr as *const QuoteSlot) };
            compiler_fence(Ordering::Acquire);
            let seq2 = unsafe { (*seq_ptr).load(Ordering::Acquire) };
            if seq1 == seq2 {
                return quote;
            }
        }
    }

    /// Copy fresh quotes into every instrument that has a matrix slot.
    /// Returns how many instruments were updated.
    pub fn poll_into(&mut self, table: &mut InstrumentTable) -> usize {
        let mut updated = 0;
        for ins in table.iter_mut() {
            let Some(slot) = ins.md_slot.map(usize::from).filter(|s| *s < MAX_SLOTS) else {
                continue;
            };
            let version = self.load_version(slot);
            if version <= self.local_versions[slot] {
                continue;
            }
            self.local_versions[slot] = version;
            let quote = self.read(slot);
            ins.last_price = quote.last_price;
            ins.bid_price1 = quote.bid_price1;
            ins.ask_price1 = quote.ask_price1;
            ins.upper_limit = quote.upper_limit;
            ins.lower_limit = quote.lower_limit;
            ins.pre_settlement = quote.pre_settlement;
            updated += 1;
        }
        updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::channel::tests::scratch_dir;
    use crate::sim::instrument::Instrument;
    use memmap2::MmapMut;
    use std::fs::OpenOptions;

    fn publish(map: &mut MmapMut, slot: usize, quote: QuoteSlot) {
        let base = map.as_mut_ptr();
        unsafe {
            let slot_ptr = base.add(SLOTS_OFFSET + slot * SLOT_SIZE);
            let seq = &*(slot_ptr as *const AtomicU32);
            let s = seq.load(Ordering::Relaxed);
            seq.store(s + 1, Ordering::Release);
            let body = QuoteSlot { seqlock: s + 1, ..quote };
            core::ptr::write_volatile(slot_ptr as *mut QuoteSlot, body);
            seq.store(s + 2, Ordering::Release);
            let version = &*(base.add(slot * VERSION_SIZE) as *const AtomicU64);
            version.fetch_add(1, Ordering::Release);
        }
    }

    fn table() -> InstrumentTable {
        InstrumentTable::from_json(
            r#"[{"symbol":"SHFE.cu2501","price_tick":10,"md_slot":7},
                {"symbol":"SHFE.al2501","price_tick":5}]"#,
        )
        .unwrap()
    }

    #[test]
    fn test_poll_picks_up_new_quotes_once() {
        let dir = scratch_dir("quotes");
        let path = dir.join("matrix");
        let file = OpenOptions::new().read(true).write(true).create(true).open(&path).unwrap();
        file.set_len(MATRIX_LEN as u64).unwrap();
        let mut writer = unsafe { MmapMut::map_mut(&file).unwrap() };

        let mut matrix = QuoteMatrix::open(&path).unwrap();
        let mut table = table();
        assert_eq!(matrix.poll_into(&mut table), 0);

        let quote = QuoteSlot {
            last_price: 75010.0,
            bid_price1: 75000.0,
            ask_price1: 75020.0,
            upper_limit: 80000.0,
            lower_limit: 70000.0,
            pre_settlement: 74900.0,
            ..Default::default()
        };
        publish(&mut writer, 7, quote);
        assert_eq!(matrix.poll_into(&mut table), 1);
        let cu = table.get("SHFE.cu2501").unwrap();
        assert_eq!(cu.ask_price1, 75020.0);
        assert_eq!(cu.mark_price(), 75010.0);
        assert!(table.get("SHFE.al2501").unwrap().ask_price1.is_nan());

        assert_eq!(matrix.poll_into(&mut table), 0);
        assert_eq!(matrix.read(7).seqlock, 2);
    }

    #[test]
    fn test_short_file_is_rejected() {
        let dir = scratch_dir("quotes");
        let path = dir.join("short");
        std::fs::write(&path, [0u8; 128]).unwrap();
        assert!(QuoteMatrix::open(&path).is_err());
    }

    #[test]
    fn test_unused_instrument_fields_untouched() {
        let mut ins: Instrument = serde_json::from_str(r#"{"symbol":"X.y","price_tick":1}"#).unwrap();
        ins.md_slot = Some(u16::MAX);
        let mut table: InstrumentTable = [ins].into_iter().collect();
        let dir = scratch_dir("quotes");
        let path = dir.join("matrix");
        std::fs::write(&path, vec![0u8; MATRIX_LEN]).unwrap();
        let mut matrix = QuoteMatrix::open(&path).unwrap();
        assert_eq!(matrix.poll_into(&mut table), 0);
    }
}
