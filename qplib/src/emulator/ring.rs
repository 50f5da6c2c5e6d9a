//! Adapter-side view of a host ring: walks the page tables over the bus

use crate::dma::HostDma;
use crate::hwq::{translate, PageTableInfo};
use crate::Result;

/// Index + epoch into a ring described by a page table
#[derive(Debug, Clone, Copy)]
pub(crate) struct Cursor {
    pub table: PageTableInfo,
    pub idx: u32,
    pub epoch: bool,
}

impl Cursor {
    pub fn new(table: PageTableInfo) -> Self {
        Self {
            table,
            idx: 0,
            epoch: false,
        }
    }

    pub fn depth(&self) -> u32 {
        self.table.depth
    }

    fn slot_addr(&self, dma: &HostDma, idx: u32) -> Result<u64> {
        let byte = (idx % self.table.depth) as u64 * self.table.stride as u64;
        translate(dma, &self.table, byte)
    }

    /// Read one slot at `offset` slots past the cursor
    pub fn read(&self, dma: &HostDma, offset: u32, buf: &mut [u8]) -> Result<()> {
        let addr = self.slot_addr(dma, self.idx + offset)?;
        let len = buf.len().min(self.table.stride as usize);
        dma.read_bus(addr, &mut buf[..len])
    }

    /// Read `slots` consecutive slots starting at the cursor
    pub fn read_slots(&self, dma: &HostDma, slots: u32) -> Result<Vec<u8>> {
        let stride = self.table.stride as usize;
        let mut out = vec![0u8; slots as usize * stride];
        for (i, chunk) in out.chunks_mut(stride).enumerate() {
            self.read(dma, i as u32, chunk)?;
        }
        Ok(out)
    }

    /// Write one slot at the cursor
    pub fn write(&self, dma: &HostDma, data: &[u8]) -> Result<()> {
        let addr = self.slot_addr(dma, self.idx)?;
        dma.write_bus(addr, data)
    }

    pub fn read_aux(&self, dma: &HostDma, index: u32, stride: usize, buf: &mut [u8]) -> Result<()> {
        let addr = translate(dma, &self.table, self.table.aux_offset + (index as usize * stride) as u64)?;
        dma.read_bus(addr, buf)
    }

    pub fn write_aux(&self, dma: &HostDma, index: u32, stride: usize, data: &[u8]) -> Result<()> {
        let addr = translate(dma, &self.table, self.table.aux_offset + (index as usize * stride) as u64)?;
        dma.write_bus(addr, data)
    }

    pub fn advance(&mut self, n: u32) {
        let total = self.idx as u64 + n as u64;
        let depth = self.table.depth as u64;
        if (total / depth) % 2 == 1 {
            self.epoch = !self.epoch;
        }
        self.idx = (total % depth) as u32;
    }

    /// Toggle a producer writes into the entry at the cursor
    pub fn toggle(&self) -> bool {
        !self.epoch
    }

    /// True if the cursor sits at (`idx`, `epoch`)
    pub fn at(&self, idx: u32, epoch: bool) -> bool {
        self.idx == idx % self.table.depth && self.epoch == epoch
    }

    /// Position in the doubled index space used to compare two cursors
    pub fn position(idx: u32, epoch: bool, depth: u32) -> u64 {
        idx as u64 + if epoch { depth as u64 } else { 0 }
    }

    /// Slots from (`idx`, `epoch`) up to the cursor
    pub fn distance_from(&self, idx: u32, epoch: bool) -> u32 {
        let span = 2 * self.table.depth as u64;
        let mine = Self::position(self.idx, self.epoch, self.table.depth);
        let theirs = Self::position(idx, epoch, self.table.depth);
        ((mine + span - theirs) % span) as u32
    }

    /// Slots from the cursor up to (`idx`, `epoch`)
    pub fn pending_to(&self, idx: u32, epoch: bool) -> u32 {
        Self {
            idx: idx % self.table.depth,
            epoch,
            ..*self
        }
        .distance_from(self.idx, self.epoch)
    }
}
