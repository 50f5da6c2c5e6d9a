//! DMA-visible memory
//!
//! Rings, page tables and side buffers live in blocks handed out by a
//! `DmaAllocator`. Each block has a CPU view and a bus address the adapter
//! uses. `HostDma` backs blocks with host memory and keeps a bus-address
//! registry so a device model can reach them the way hardware would.

use crate::{QplibError, Result, PAGE_SIZE};
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Source of DMA-capable memory
pub trait DmaAllocator: Send + Sync {
    /// Allocate a zeroed block of at least `size` bytes, page aligned on the bus
    fn alloc(&self, size: usize) -> Result<DmaBlock>;
}

/// A DMA block: CPU view plus bus address. Clones share the same memory;
/// the memory goes back to the allocator when the last clone drops.
#[derive(Clone)]
pub struct DmaBlock {
    inner: Arc<BlockInner>,
}

struct BlockInner {
    bus_addr: u64,
    mem: Mutex<Box<[u8]>>,
    registry: Weak<Registry>,
}

impl Drop for BlockInner {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.release(self.bus_addr);
        }
    }
}

impl fmt::Debug for DmaBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaBlock")
            .field("bus_addr", &format_args!("0x{:x}", self.bus_addr()))
            .field("len", &self.len())
            .finish()
    }
}

impl DmaBlock {
    pub fn bus_addr(&self) -> u64 {
        self.inner.bus_addr
    }

    pub fn len(&self) -> usize {
        self.inner.mem.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy bytes out of the block
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let mem = self.inner.mem.lock();
        let src = mem
            .get(offset..offset + buf.len())
            .ok_or_else(|| out_of_range(self.bus_addr(), offset, buf.len()))?;
        buf.copy_from_slice(src);
        Ok(())
    }

    /// Copy bytes into the block
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        let mut mem = self.inner.mem.lock();
        let bus_addr = self.inner.bus_addr;
        let dst = mem
            .get_mut(offset..offset + data.len())
            .ok_or_else(|| out_of_range(bus_addr, offset, data.len()))?;
        dst.copy_from_slice(data);
        Ok(())
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        let mut raw = [0u8; 4];
        self.read(offset, &mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    pub fn write_u32(&self, offset: usize, value: u32) -> Result<()> {
        self.write(offset, &value.to_le_bytes())
    }

    pub fn read_u64(&self, offset: usize) -> Result<u64> {
        let mut raw = [0u8; 8];
        self.read(offset, &mut raw)?;
        Ok(u64::from_le_bytes(raw))
    }

    pub fn write_u64(&self, offset: usize, value: u64) -> Result<()> {
        self.write(offset, &value.to_le_bytes())
    }

    /// Run `f` with the block's memory borrowed mutably
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut mem = self.inner.mem.lock();
        f(&mut mem)
    }

    pub fn zero(&self) {
        self.inner.mem.lock().fill(0);
    }
}

fn out_of_range(bus_addr: u64, offset: usize, len: usize) -> QplibError {
    QplibError::InvalidArgument(format!(
        "DMA access 0x{:x}+{}..+{} out of range",
        bus_addr, offset, len
    ))
}

struct Registry {
    blocks: RwLock<BTreeMap<u64, Weak<BlockInner>>>,
    outstanding: AtomicUsize,
}

impl Registry {
    fn release(&self, bus_addr: u64) {
        self.blocks.write().remove(&bus_addr);
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }

    fn lookup(&self, bus_addr: u64) -> Option<(Arc<BlockInner>, usize)> {
        let blocks = self.blocks.read();
        let (base, weak) = blocks.range(..=bus_addr).next_back()?;
        let block = weak.upgrade()?;
        let offset = (bus_addr - base) as usize;
        Some((block, offset))
    }
}

/// Host-memory DMA allocator with a bus-address registry
pub struct HostDma {
    registry: Arc<Registry>,
    next_bus_addr: AtomicU64,
    // Remaining successful allocations before failing; None = unlimited
    failure_budget: Mutex<Option<usize>>,
}

impl HostDma {
    const BUS_BASE: u64 = 0x1_0000_0000;

    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            registry: Arc::new(Registry {
                blocks: RwLock::new(BTreeMap::new()),
                outstanding: AtomicUsize::new(0),
            }),
            next_bus_addr: AtomicU64::new(Self::BUS_BASE),
            failure_budget: Mutex::new(None),
        })
    }

    /// Fail allocations once `allowed` more have succeeded
    pub fn set_failure_budget(&self, allowed: Option<usize>) {
        *self.failure_budget.lock() = allowed;
    }

    /// Number of live blocks
    pub fn outstanding(&self) -> usize {
        self.registry.outstanding.load(Ordering::Acquire)
    }

    /// Read through a bus address, as the adapter would
    pub fn read_bus(&self, bus_addr: u64, buf: &mut [u8]) -> Result<()> {
        let (block, offset) = self.resolve(bus_addr)?;
        DmaBlock { inner: block }.read(offset, buf)
    }

    /// Write through a bus address, as the adapter would
    pub fn write_bus(&self, bus_addr: u64, data: &[u8]) -> Result<()> {
        let (block, offset) = self.resolve(bus_addr)?;
        DmaBlock { inner: block }.write(offset, data)
    }

    pub fn read_bus_u64(&self, bus_addr: u64) -> Result<u64> {
        let mut raw = [0u8; 8];
        self.read_bus(bus_addr, &mut raw)?;
        Ok(u64::from_le_bytes(raw))
    }

    /// True if `len` bytes starting at `bus_addr` are backed by one block
    pub fn is_mapped(&self, bus_addr: u64, len: usize) -> bool {
        match self.registry.lookup(bus_addr) {
            Some((block, offset)) => offset + len <= block.mem.lock().len(),
            None => false,
        }
    }

    fn resolve(&self, bus_addr: u64) -> Result<(Arc<BlockInner>, usize)> {
        self.registry.lookup(bus_addr).ok_or_else(|| {
            QplibError::InvalidArgument(format!("bus address 0x{:x} not mapped", bus_addr))
        })
    }
}

impl DmaAllocator for HostDma {
    fn alloc(&self, size: usize) -> Result<DmaBlock> {
        if size == 0 {
            return Err(QplibError::InvalidArgument("zero-sized DMA block".into()));
        }

        {
            let mut budget = self.failure_budget.lock();
            if let Some(remaining) = budget.as_mut() {
                if *remaining == 0 {
                    warn!("DMA allocation of {} bytes refused (failure budget)", size);
                    return Err(QplibError::OutOfMemory(format!("DMA block of {} bytes", size)));
                }
                *remaining -= 1;
            }
        }

        let span = size.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let bus_addr = self.next_bus_addr.fetch_add(span as u64, Ordering::Relaxed);
        let inner = Arc::new(BlockInner {
            bus_addr,
            mem: Mutex::new(vec![0u8; size].into_boxed_slice()),
            registry: Arc::downgrade(&self.registry),
        });

        self.registry
            .blocks
            .write()
            .insert(bus_addr, Arc::downgrade(&inner));
        self.registry.outstanding.fetch_add(1, Ordering::AcqRel);

        debug!("DMA alloc: bus=0x{:x}, len={}", bus_addr, size);
        Ok(DmaBlock { inner })
    }
}
