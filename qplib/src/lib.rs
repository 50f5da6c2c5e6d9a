//! Queue-pair library for a RoCE adapter
//!
//! Sits between the adapter driver and the on-card firmware:
//! - `hwq`: rings backed by 0/1/2-level DMA page tables
//! - `rcfw`: command/response channel to firmware (cookie matching, stall detection)
//! - `qp`, `cq`, `srq`: data-path life cycle, posting, polling, flushing
//! - `device`: the driver-instance context that owns all of the above
//!
//! The `emulator` feature (default) provides a software model of the adapter
//! side so the whole layer runs without hardware.

use thiserror::Error;

pub mod config;
pub mod cq;
pub mod device;
pub mod dma;
pub mod doorbell;
pub mod hsi;
pub mod hwq;
pub mod qp;
pub mod rcfw;
pub mod reftbl;
pub mod sp;
pub mod srq;
pub mod worker;

#[cfg(feature = "emulator")]
pub mod emulator;

#[cfg(feature = "emulator")]
pub use emulator::Emulator;

pub use config::{ChipCaps, QplibConfig, QueueConfig, RcfwConfig, WqeMode};
pub use cq::{CompletionQueue, Cqe, CqeOpcode, CqeStatus, NotifyArm};
pub use device::{Collaborators, Device, DeviceAttributes, EventSink, InterruptLine};
pub use dma::{DmaAllocator, DmaBlock, HostDma};
pub use doorbell::{DoorbellRegion, DoorbellType};
pub use hwq::{HardwareQueue, HwqAttr, HwqType, PageLevel};
pub use qp::{
    ModifyMask, Payload, QpAttrs, QpInitAttrs, QpState, QpType, QueuePair, RecvWqe, SendOp, SendWqe, Sge,
    UdDest, WqeFlags,
};
pub use rcfw::{AsyncEvent, AsyncHandler, ControlChannel, Opcode, SendOptions, WaitStrategy};
pub use sp::{Access, AddressHandle, AhAttrs, MemoryRegion};
pub use srq::{SharedReceiveQueue, SrqInitAttrs, SrqQuery};

/// Adapter page size; page tables, rings and side buffers are built from these.
pub const PAGE_SIZE: usize = 4096;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QplibError {
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Queue full")]
    QueueFull,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Resource 0x{0:x} not found")]
    NotFound(u32),

    #[error("Resource 0x{0:x} already destroyed")]
    AlreadyDestroyed(u32),

    #[error("Firmware failed {opcode:?} with status 0x{status:x}")]
    Firmware { opcode: Opcode, status: u8 },

    #[error("Timeout waiting for firmware response to {0:?}")]
    Timeout(Opcode),

    #[error("Firmware stalled, channel refuses new commands")]
    Stalled,

    #[error("Device detached")]
    Detached,

    #[error("{0:?} not permitted before firmware initialization")]
    NotInitialized(Opcode),

    #[error("Budget exhausted, try again")]
    Again,

    #[error("Resource busy: {0}")]
    Busy(String),
}

pub type Result<T> = std::result::Result<T, QplibError>;
