//! Doorbells
//!
//! A doorbell is one 64-bit register write telling the adapter that a
//! producer index moved or that notifications should be (re)armed.
//!
//! Word layout:
//! - bits 23:0   index
//! - bit  24     epoch
//! - bits 26:25  toggle
//! - bits 51:32  resource id (xid)
//! - bit  58     valid
//! - bits 63:60  type

use log::debug;
use parking_lot::Mutex;
use std::sync::Arc;

pub const DB_INDEX_MASK: u64 = 0x00ff_ffff;
pub const DB_EPOCH_SHIFT: u32 = 24;
pub const DB_TOGGLE_SHIFT: u32 = 25;
pub const DB_TOGGLE_MASK: u64 = 0x3;
pub const DB_XID_SHIFT: u32 = 32;
pub const DB_XID_MASK: u64 = 0x000f_ffff;
pub const DB_VALID: u64 = 1 << 58;
pub const DB_TYPE_SHIFT: u32 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DoorbellType {
    Sq = 0x0,
    Rq = 0x1,
    Srq = 0x2,
    SrqArm = 0x3,
    Cq = 0x4,
    CqArmSe = 0x5,
    CqArmAll = 0x6,
    CqArmEna = 0x7,
    SrqArmEna = 0x8,
    CqCutoffAck = 0x9,
    /// Command ring producer (control channel)
    Cmdq = 0xa,
    /// Event ring consumer (control channel)
    Creq = 0xb,
    Null = 0xf,
}

impl DoorbellType {
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0x0 => Self::Sq,
            0x1 => Self::Rq,
            0x2 => Self::Srq,
            0x3 => Self::SrqArm,
            0x4 => Self::Cq,
            0x5 => Self::CqArmSe,
            0x6 => Self::CqArmAll,
            0x7 => Self::CqArmEna,
            0x8 => Self::SrqArmEna,
            0x9 => Self::CqCutoffAck,
            0xa => Self::Cmdq,
            0xb => Self::Creq,
            0xf => Self::Null,
            _ => return None,
        })
    }
}

/// Decoded doorbell word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoorbellWord {
    pub xid: u32,
    pub kind: DoorbellType,
    pub index: u32,
    pub epoch: bool,
    pub toggle: u8,
}

impl DoorbellWord {
    pub fn encode(&self) -> u64 {
        let lo = (self.index as u64 & DB_INDEX_MASK)
            | ((self.epoch as u64) << DB_EPOCH_SHIFT)
            | ((self.toggle as u64 & DB_TOGGLE_MASK) << DB_TOGGLE_SHIFT);
        let hi = ((self.xid as u64 & DB_XID_MASK) << DB_XID_SHIFT)
            | DB_VALID
            | ((self.kind as u64) << DB_TYPE_SHIFT);
        hi | lo
    }

    /// Returns None for words without the valid bit or with an unknown type
    pub fn decode(value: u64) -> Option<Self> {
        if value & DB_VALID == 0 {
            return None;
        }
        Some(Self {
            xid: ((value >> DB_XID_SHIFT) & DB_XID_MASK) as u32,
            kind: DoorbellType::from_raw((value >> DB_TYPE_SHIFT) as u8)?,
            index: (value & DB_INDEX_MASK) as u32,
            epoch: (value >> DB_EPOCH_SHIFT) & 1 == 1,
            toggle: ((value >> DB_TOGGLE_SHIFT) & DB_TOGGLE_MASK) as u8,
        })
    }
}

/// A mapped register region that accepts 64-bit doorbell writes
pub trait DoorbellRegion: Send + Sync {
    fn write64(&self, offset: u64, value: u64);
}

/// Doorbell region backed by a mapped device BAR
pub struct MmioDoorbell {
    base: *mut u8,
    len: usize,
}

unsafe impl Send for MmioDoorbell {}
unsafe impl Sync for MmioDoorbell {}

impl MmioDoorbell {
    /// # Safety
    /// `base` must point at a mapping of at least `len` bytes that stays
    /// valid for the lifetime of this value.
    pub unsafe fn new(base: *mut u8, len: usize) -> Self {
        Self { base, len }
    }
}

impl DoorbellRegion for MmioDoorbell {
    fn write64(&self, offset: u64, value: u64) {
        let offset = offset as usize;
        if offset % 8 != 0 || offset + 8 > self.len {
            log::error!("Doorbell write at 0x{:x} outside mapped region", offset);
            return;
        }
        // SAFETY: bounds and alignment checked above; mapping validity is the
        // caller's contract from `new`
        unsafe {
            std::ptr::write_volatile(self.base.add(offset) as *mut u64, value.to_le());
        }
    }
}

/// Records every write; used where no adapter is attached
#[derive(Default)]
pub struct RecordingDoorbell {
    writes: Mutex<Vec<(u64, u64)>>,
}

impl RecordingDoorbell {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn writes(&self) -> Vec<(u64, u64)> {
        self.writes.lock().clone()
    }

    pub fn last(&self) -> Option<DoorbellWord> {
        self.writes
            .lock()
            .last()
            .and_then(|&(_, value)| DoorbellWord::decode(value))
    }

    pub fn clear(&self) {
        self.writes.lock().clear();
    }
}

impl DoorbellRegion for RecordingDoorbell {
    fn write64(&self, offset: u64, value: u64) {
        self.writes.lock().push((offset, value));
    }
}

/// Per-queue doorbell state. Rung while the owning queue's lock is held,
/// which serializes writers for a given resource id.
#[derive(Clone)]
pub struct DoorbellInfo {
    region: Arc<dyn DoorbellRegion>,
    offset: u64,
    xid: u32,
}

impl DoorbellInfo {
    pub fn new(region: Arc<dyn DoorbellRegion>, offset: u64, xid: u32) -> Self {
        Self { region, offset, xid }
    }

    pub fn xid(&self) -> u32 {
        self.xid
    }

    pub(crate) fn set_xid(&mut self, xid: u32) {
        self.xid = xid;
    }

    pub fn ring(&self, kind: DoorbellType, index: u32, epoch: bool, toggle: u8) {
        let word = DoorbellWord {
            xid: self.xid,
            kind,
            index,
            epoch,
            toggle,
        };
        debug!(
            "DB: xid=0x{:x}, type={:?}, index=0x{:x}, epoch={}",
            self.xid, kind, index, epoch
        );
        self.region.write64(self.offset, word.encode());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_layout() {
        let word = DoorbellWord {
            xid: 0x12345,
            kind: DoorbellType::CqArmAll,
            index: 0xabcdef,
            epoch: true,
            toggle: 2,
        };
        let value = word.encode();
        assert_eq!(value & DB_INDEX_MASK, 0xabcdef);
        assert_eq!((value >> 24) & 1, 1);
        assert_eq!((value >> 25) & 3, 2);
        assert_eq!((value >> 32) & DB_XID_MASK, 0x12345);
        assert_eq!(value >> 60, DoorbellType::CqArmAll as u64);
        assert_eq!(DoorbellWord::decode(value), Some(word));
    }

    #[test]
    fn test_index_and_xid_truncated() {
        let word = DoorbellWord {
            xid: 0xfff_ffff,
            kind: DoorbellType::Sq,
            index: 0x1ff_ffff,
            epoch: false,
            toggle: 0,
        };
        let decoded = DoorbellWord::decode(word.encode()).unwrap();
        assert_eq!(decoded.index, 0xff_ffff);
        assert_eq!(decoded.xid, 0xf_ffff);
    }

    #[test]
    fn test_decode_rejects_invalid() {
        assert_eq!(DoorbellWord::decode(0), None);
        assert_eq!(DoorbellWord::decode(DB_VALID | (0xc << DB_TYPE_SHIFT)), None);
    }

    #[test]
    fn test_info_rings_region() {
        let region = RecordingDoorbell::new();
        let info = DoorbellInfo::new(region.clone(), 0x40, 7);
        info.ring(DoorbellType::Rq, 5, false, 0);

        let writes = region.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, 0x40);
        let word = region.last().unwrap();
        assert_eq!(word.xid, 7);
        assert_eq!(word.kind, DoorbellType::Rq);
        assert_eq!(word.index, 5);
    }

    #[test]
    fn test_mmio_write() {
        let mut bar = vec![0u64; 4];
        let region = unsafe { MmioDoorbell::new(bar.as_mut_ptr() as *mut u8, 32) };
        region.write64(8, 0x55);
        region.write64(32, 0x66); // out of range, dropped
        assert_eq!(bar[1], 0x55);
    }
}
