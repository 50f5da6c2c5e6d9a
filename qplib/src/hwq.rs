//! Hardware queues
//!
//! A ring of fixed-size slots backed by DMA pages. The adapter finds the
//! pages through 0, 1 or 2 levels of page tables:
//! - level 0: the root is the single data page
//! - level 1: the root is a page of PTEs, one per data page
//! - level 2: the root is a page of PDEs, each pointing at a PTE page
//!
//! Pages are kept in an arena indexed by (level, page, slot). The data
//! pages always sit at the deepest level. The queue itself is not locked;
//! owners keep it behind their own mutex.

use crate::dma::{DmaAllocator, DmaBlock, HostDma};
use crate::{QplibError, Result, PAGE_SIZE};
use bitflags::bitflags;
use log::debug;

pub const PTE_VALID: u64 = 0x1;
pub const PTE_LAST: u64 = 0x2;
pub const PTE_NEXT_TO_LAST: u64 = 0x4;
pub const PDE_VALID: u64 = 0x1;

const ADDR_MASK: u64 = !(PAGE_SIZE as u64 - 1);

/// Table entries per page
pub const ENTRIES_PER_PAGE: usize = PAGE_SIZE / 8;

/// Page-table indirection depth
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PageLevel {
    L0 = 0,
    L1 = 1,
    L2 = 2,
}

impl PageLevel {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::L0),
            1 => Some(Self::L1),
            2 => Some(Self::L2),
            _ => None,
        }
    }
}

/// Pick the indirection depth for a queue of `bytes` total size
pub fn select_level(bytes: usize) -> Result<PageLevel> {
    let npages = bytes.div_ceil(PAGE_SIZE).max(1);
    if npages == 1 {
        Ok(PageLevel::L0)
    } else if npages <= ENTRIES_PER_PAGE {
        Ok(PageLevel::L1)
    } else if npages <= ENTRIES_PER_PAGE * ENTRIES_PER_PAGE {
        Ok(PageLevel::L2)
    } else {
        Err(QplibError::InvalidArgument(format!(
            "queue of {} bytes exceeds two-level page table reach",
            bytes
        )))
    }
}

/// What the queue is used for; rings get wraparound markers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwqType {
    Queue,
    Completion,
    Context,
}

/// Queue geometry requested by the owner
#[derive(Debug, Clone, Copy)]
pub struct HwqAttr {
    /// Slot count; rounded up to a power of two
    pub depth: u32,
    /// Slot size in bytes; power of two no larger than a page
    pub stride: u32,
    /// Auxiliary (sequence search) area entries, 0 for none
    pub aux_depth: u32,
    pub aux_stride: u32,
    pub kind: HwqType,
}

impl HwqAttr {
    pub fn ring(depth: u32, stride: u32, kind: HwqType) -> Self {
        Self {
            depth,
            stride,
            aux_depth: 0,
            aux_stride: 0,
            kind,
        }
    }
}

/// Location of a queue as the adapter sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableInfo {
    pub root: u64,
    pub level: PageLevel,
    pub depth: u32,
    pub stride: u32,
    /// Byte offset of the auxiliary area from the start of the queue
    pub aux_offset: u64,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EpochFlags: u8 {
        const CONS = 1 << 0;
        const PROD = 1 << 1;
    }
}

pub struct HardwareQueue {
    depth: u32,
    stride: u32,
    level: PageLevel,
    kind: HwqType,
    // arena[level][page]; the deepest level holds data pages
    arena: Vec<Vec<DmaBlock>>,
    ring_pages: usize,
    aux_depth: u32,
    aux_stride: u32,
    prod: u32,
    cons: u32,
    epochs: EpochFlags,
}

impl HardwareQueue {
    /// Allocate the data pages and the page tables that reach them.
    ///
    /// On failure every block allocated so far is released before the
    /// error is returned.
    pub fn allocate(dma: &dyn DmaAllocator, attr: &HwqAttr) -> Result<Self> {
        if attr.depth == 0 {
            return Err(QplibError::InvalidArgument("queue depth is zero".into()));
        }
        if !attr.stride.is_power_of_two() || attr.stride as usize > PAGE_SIZE {
            return Err(QplibError::InvalidArgument(format!(
                "stride {} must be a power of two no larger than a page",
                attr.stride
            )));
        }

        let depth = attr.depth.next_power_of_two();
        let ring_bytes = depth as usize * attr.stride as usize;
        let ring_pages = ring_bytes.div_ceil(PAGE_SIZE);
        let aux_bytes = attr.aux_depth as usize * attr.aux_stride as usize;
        let aux_pages = aux_bytes.div_ceil(PAGE_SIZE);
        let total_pages = ring_pages + aux_pages;
        let level = select_level(total_pages * PAGE_SIZE)?;

        let data = (0..total_pages)
            .map(|_| dma.alloc(PAGE_SIZE))
            .collect::<Result<Vec<_>>>()
            .map_err(|e| {
                debug!("HWQ data page allocation failed, unwinding");
                e
            })?;

        let arena = match level {
            PageLevel::L0 => vec![data],
            PageLevel::L1 => {
                let ptes = Self::build_ptes(dma, &data, attr.kind)?;
                vec![ptes, data]
            }
            PageLevel::L2 => {
                let ptes = Self::build_ptes(dma, &data, attr.kind)?;
                let pde = dma.alloc(PAGE_SIZE)?;
                for (i, pte_page) in ptes.iter().enumerate() {
                    pde.write_u64(i * 8, pte_page.bus_addr() | PDE_VALID)?;
                }
                vec![vec![pde], ptes, data]
            }
        };

        debug!(
            "HWQ allocated: depth={}, stride={}, level={:?}, pages={}",
            depth, attr.stride, level, total_pages
        );

        Ok(Self {
            depth,
            stride: attr.stride,
            level,
            kind: attr.kind,
            arena,
            ring_pages,
            aux_depth: attr.aux_depth,
            aux_stride: attr.aux_stride,
            prod: 0,
            cons: 0,
            epochs: EpochFlags::empty(),
        })
    }

    fn build_ptes(dma: &dyn DmaAllocator, data: &[DmaBlock], kind: HwqType) -> Result<Vec<DmaBlock>> {
        let count = data.len();
        let pte_pages = count.div_ceil(ENTRIES_PER_PAGE);
        let pages = (0..pte_pages)
            .map(|_| dma.alloc(PAGE_SIZE))
            .collect::<Result<Vec<_>>>()?;

        for (i, block) in data.iter().enumerate() {
            let mut entry = block.bus_addr() | PTE_VALID;
            if kind == HwqType::Queue {
                if i + 1 == count {
                    entry |= PTE_LAST;
                } else if i + 2 == count {
                    entry |= PTE_NEXT_TO_LAST;
                }
            }
            pages[i / ENTRIES_PER_PAGE].write_u64((i % ENTRIES_PER_PAGE) * 8, entry)?;
        }
        Ok(pages)
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn level(&self) -> PageLevel {
        self.level
    }

    pub fn kind(&self) -> HwqType {
        self.kind
    }

    pub fn prod(&self) -> u32 {
        self.prod
    }

    pub fn cons(&self) -> u32 {
        self.cons
    }

    pub fn prod_epoch(&self) -> bool {
        self.epochs.contains(EpochFlags::PROD)
    }

    pub fn cons_epoch(&self) -> bool {
        self.epochs.contains(EpochFlags::CONS)
    }

    /// Page-table arena access: (level, page) → block
    pub fn table_page(&self, level: usize, page: usize) -> Option<&DmaBlock> {
        self.arena.get(level)?.get(page)
    }

    fn data_pages(&self) -> &[DmaBlock] {
        // arena is never empty; the deepest level holds the data pages
        self.arena.last().map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn page_table(&self) -> PageTableInfo {
        let root = self
            .arena
            .first()
            .and_then(|level| level.first())
            .map(DmaBlock::bus_addr)
            .unwrap_or(0);
        PageTableInfo {
            root,
            level: self.level,
            depth: self.depth,
            stride: self.stride,
            aux_offset: (self.ring_pages * PAGE_SIZE) as u64,
        }
    }

    /// (page, offset) of slot `index`
    fn locate(&self, index: u32) -> (usize, usize) {
        let byte = (index % self.depth) as usize * self.stride as usize;
        (byte / PAGE_SIZE, byte % PAGE_SIZE)
    }

    fn locate_aux(&self, index: u32) -> Result<(usize, usize)> {
        if index >= self.aux_depth {
            return Err(QplibError::InvalidArgument(format!(
                "aux index {} beyond {}",
                index, self.aux_depth
            )));
        }
        let byte = self.ring_pages * PAGE_SIZE + index as usize * self.aux_stride as usize;
        Ok((byte / PAGE_SIZE, byte % PAGE_SIZE))
    }

    pub fn slot_bus_addr(&self, index: u32) -> u64 {
        let (page, offset) = self.locate(index);
        self.data_pages()[page].bus_addr() + offset as u64
    }

    pub fn read_slot(&self, index: u32, buf: &mut [u8]) -> Result<()> {
        let (page, offset) = self.locate(index);
        let n = buf.len().min(self.stride as usize);
        self.data_pages()[page].read(offset, &mut buf[..n])
    }

    /// Write `data` into slot `index` at `offset` bytes within the slot
    pub fn write_slot(&self, index: u32, offset: usize, data: &[u8]) -> Result<()> {
        if offset + data.len() > self.stride as usize {
            return Err(QplibError::InvalidArgument(format!(
                "write of {} bytes at {} overruns {}-byte slot",
                data.len(),
                offset,
                self.stride
            )));
        }
        let (page, base) = self.locate(index);
        self.data_pages()[page].write(base + offset, data)
    }

    pub fn zero_slot(&self, index: u32) -> Result<()> {
        let zeros = vec![0u8; self.stride as usize];
        self.write_slot(index, 0, &zeros)
    }

    pub fn aux_depth(&self) -> u32 {
        self.aux_depth
    }

    pub fn read_aux(&self, index: u32, buf: &mut [u8]) -> Result<()> {
        let (page, offset) = self.locate_aux(index)?;
        self.data_pages()[page].read(offset, buf)
    }

    pub fn write_aux(&self, index: u32, data: &[u8]) -> Result<()> {
        let (page, offset) = self.locate_aux(index)?;
        self.data_pages()[page].write(offset, data)
    }

    /// Advance the producer by `n`, flipping the producer epoch on each wrap
    pub fn advance_producer(&mut self, n: u32) {
        let (idx, flip) = advance(self.prod, n, self.depth);
        self.prod = idx;
        if flip {
            self.epochs.toggle(EpochFlags::PROD);
        }
    }

    /// Advance the consumer by `n`, flipping the consumer epoch on each wrap
    pub fn advance_consumer(&mut self, n: u32) {
        let (idx, flip) = advance(self.cons, n, self.depth);
        self.cons = idx;
        if flip {
            self.epochs.toggle(EpochFlags::CONS);
        }
    }

    /// Slots between consumer and producer
    pub fn used(&self) -> u32 {
        if self.prod_epoch() == self.cons_epoch() {
            self.prod - self.cons
        } else {
            self.depth - self.cons + self.prod
        }
    }

    pub fn free_slots(&self) -> u32 {
        self.depth - self.used()
    }

    /// True if fewer than `slots` slots are free
    pub fn is_full(&self, slots: u32) -> bool {
        self.free_slots() < slots
    }

    /// Toggle value a consumer expects in a freshly produced entry
    pub fn expected_toggle(&self) -> bool {
        !self.cons_epoch()
    }

    /// Toggle value a producer writes into the entry at `prod`
    pub fn producer_toggle(&self) -> bool {
        !self.prod_epoch()
    }

    /// Forget all indices; memory is zeroed so stale entries read invalid
    pub fn reset(&mut self) {
        self.prod = 0;
        self.cons = 0;
        self.epochs = EpochFlags::empty();
        for page in self.data_pages() {
            page.zero();
        }
    }
}

/// Add `n` to `idx` modulo `depth`; the flag reports an odd number of wraps
fn advance(idx: u32, n: u32, depth: u32) -> (u32, bool) {
    let total = idx as u64 + n as u64;
    let wraps = total / depth as u64;
    ((total % depth as u64) as u32, wraps % 2 == 1)
}

/// Resolve a byte offset within a queue to a bus address by walking its
/// page tables through the bus, the way the adapter does.
pub fn translate(dma: &HostDma, table: &PageTableInfo, byte_offset: u64) -> Result<u64> {
    let page = byte_offset / PAGE_SIZE as u64;
    let offset = byte_offset % PAGE_SIZE as u64;
    let entries = ENTRIES_PER_PAGE as u64;

    let data_page = match table.level {
        PageLevel::L0 => {
            if page != 0 {
                return Err(QplibError::InvalidArgument(format!(
                    "offset 0x{:x} beyond level-0 queue",
                    byte_offset
                )));
            }
            table.root
        }
        PageLevel::L1 => {
            let pte = dma.read_bus_u64(table.root + page * 8)?;
            check_valid(pte, PTE_VALID)?
        }
        PageLevel::L2 => {
            let pde = dma.read_bus_u64(table.root + (page / entries) * 8)?;
            let pte_page = check_valid(pde, PDE_VALID)?;
            let pte = dma.read_bus_u64(pte_page + (page % entries) * 8)?;
            check_valid(pte, PTE_VALID)?
        }
    };
    Ok(data_page + offset)
}

fn check_valid(entry: u64, valid: u64) -> Result<u64> {
    if entry & valid == 0 {
        return Err(QplibError::InvalidArgument(format!(
            "page table entry 0x{:x} not valid",
            entry
        )));
    }
    Ok(entry & ADDR_MASK)
}
