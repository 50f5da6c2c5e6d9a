//! Slow path: device attributes, address handles, memory keys and the GID
//! table. Each operation is a single control-channel command.

use crate::device::Device;
use crate::hsi::{WireReader, WireWriter};
use crate::rcfw::cmd::{CreateAhReq, RegisterMrReq};
use crate::rcfw::{Command, SendOptions};
use crate::{QplibError, Result};
use bitflags::bitflags;
use log::{debug, info, warn};
use serde::Serialize;

/// Limits reported by firmware for this function
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceAttributes {
    /// major.minor.build.rev, one byte each
    pub fw_version: u32,
    pub max_qp: u32,
    pub max_qp_wqes: u32,
    pub max_sge: u32,
    pub max_cq: u32,
    pub max_cqe: u32,
    pub max_srq: u32,
    pub max_srq_wqes: u32,
    pub max_mr: u32,
    pub max_ah: u32,
    pub max_gid: u32,
    pub max_inline: u32,
    pub max_rd_atomic: u32,
}

impl DeviceAttributes {
    pub fn encode(&self, w: &mut WireWriter) {
        w.u32(self.fw_version)
            .u32(self.max_qp)
            .u32(self.max_qp_wqes)
            .u32(self.max_sge)
            .u32(self.max_cq)
            .u32(self.max_cqe)
            .u32(self.max_srq)
            .u32(self.max_srq_wqes)
            .u32(self.max_mr)
            .u32(self.max_ah)
            .u32(self.max_gid)
            .u32(self.max_inline)
            .u32(self.max_rd_atomic);
    }

    pub fn decode(r: &mut WireReader<'_>) -> Self {
        Self {
            fw_version: r.u32(),
            max_qp: r.u32(),
            max_qp_wqes: r.u32(),
            max_sge: r.u32(),
            max_cq: r.u32(),
            max_cqe: r.u32(),
            max_srq: r.u32(),
            max_srq_wqes: r.u32(),
            max_mr: r.u32(),
            max_ah: r.u32(),
            max_gid: r.u32(),
            max_inline: r.u32(),
            max_rd_atomic: r.u32(),
        }
    }

    pub fn fw_version_string(&self) -> String {
        let v = self.fw_version.to_be_bytes();
        format!("{}.{}.{}.{}", v[0], v[1], v[2], v[3])
    }
}

bitflags! {
    /// Memory region access rights
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Access: u32 {
        const LOCAL_WRITE = 1 << 0;
        const REMOTE_WRITE = 1 << 1;
        const REMOTE_READ = 1 << 2;
        const REMOTE_ATOMIC = 1 << 3;
        const MW_BIND = 1 << 4;
    }
}

/// Destination of UD sends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AhAttrs {
    pub pd_id: u32,
    pub dgid: [u8; 16],
    pub sgid_index: u8,
    pub hop_limit: u8,
    pub traffic_class: u8,
    pub flow_label: u32,
    pub dest_mac: [u8; 6],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressHandle {
    pub id: u32,
    pub attrs: AhAttrs,
}

/// A registered memory region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Serves as both lkey and rkey
    pub key: u32,
    pub va: u64,
    pub length: u64,
    pub access: Access,
}

impl Device {
    /// Ask firmware for this function's resource limits
    pub fn query_device(&self) -> Result<DeviceAttributes> {
        let resp = self.rcfw.send(&Command::QueryFunc, SendOptions::default())?;
        let sbuf = resp.sbuf.unwrap_or_default();
        let attrs = DeviceAttributes::decode(&mut WireReader::new(&sbuf));
        debug!("Device attributes: {:?}", attrs);
        Ok(attrs)
    }

    pub fn create_ah(&self, attrs: &AhAttrs) -> Result<AddressHandle> {
        let req = CreateAhReq {
            pd_id: attrs.pd_id,
            dgid: attrs.dgid,
            sgid_index: attrs.sgid_index,
            hop_limit: attrs.hop_limit,
            traffic_class: attrs.traffic_class,
            flow_label: attrs.flow_label,
            dest_mac: attrs.dest_mac,
        };
        let resp = self.rcfw.send(&Command::CreateAh(req), SendOptions::default())?;
        debug!("Created AH 0x{:x}", resp.xid);
        Ok(AddressHandle {
            id: resp.xid,
            attrs: *attrs,
        })
    }

    pub fn destroy_ah(&self, ah: &AddressHandle) -> Result<()> {
        self.rcfw
            .send(&Command::DestroyAh { ah_id: ah.id }, SendOptions::default())?;
        debug!("Destroyed AH 0x{:x}", ah.id);
        Ok(())
    }

    /// Allocate a memory key (region or window)
    pub fn alloc_mrw(&self, pd_id: u32, is_mw: bool) -> Result<u32> {
        let resp = self
            .rcfw
            .send(&Command::AllocateMrw { pd_id, is_mw }, SendOptions::default())?;
        Ok(resp.xid)
    }

    pub fn dealloc_key(&self, key: u32) -> Result<()> {
        self.rcfw
            .send(&Command::DeallocateKey { key }, SendOptions::default())?;
        Ok(())
    }

    /// Allocate a key and register `length` bytes at `va` under it
    pub fn register_mr(&self, pd_id: u32, va: u64, length: u64, access: Access) -> Result<MemoryRegion> {
        if length == 0 {
            return Err(QplibError::InvalidArgument("empty memory region".into()));
        }
        let key = self.alloc_mrw(pd_id, false)?;
        let req = RegisterMrReq {
            key,
            va,
            length,
            access: access.bits(),
        };
        if let Err(e) = self.rcfw.send(&Command::RegisterMr(req), SendOptions::default()) {
            if let Err(cleanup) = self.dealloc_key(key) {
                warn!("Failed to free key 0x{:x} after failed registration: {}", key, cleanup);
            }
            return Err(e);
        }
        info!("Registered MR key 0x{:x}: {} bytes at 0x{:x}", key, length, va);
        Ok(MemoryRegion {
            key,
            va,
            length,
            access,
        })
    }

    pub fn deregister_mr(&self, mr: &MemoryRegion) -> Result<()> {
        self.rcfw
            .send(&Command::DeregisterMr { key: mr.key }, SendOptions::default())?;
        self.dealloc_key(mr.key)?;
        debug!("Deregistered MR key 0x{:x}", mr.key);
        Ok(())
    }

    /// Add a GID table entry.
    ///
    /// # Returns
    /// The table index firmware chose. Firmware failures are logged by the
    /// channel and not returned.
    pub fn add_gid(&self, gid: [u8; 16], vlan_id: u16) -> Result<u16> {
        let resp = self
            .rcfw
            .send(&Command::AddGid { gid, vlan_id }, SendOptions::default())?;
        Ok(resp.data as u16)
    }

    pub fn delete_gid(&self, index: u16) -> Result<()> {
        self.rcfw
            .send(&Command::DeleteGid { index }, SendOptions::default())?;
        Ok(())
    }

    /// (GID, VLAN id) at `index`
    pub fn query_gid(&self, index: u16) -> Result<([u8; 16], u16)> {
        let resp = self
            .rcfw
            .send(&Command::QueryGid { index }, SendOptions::default())?;
        let sbuf = resp.sbuf.unwrap_or_default();
        let mut r = WireReader::new(&sbuf);
        let mut gid = [0u8; 16];
        gid.copy_from_slice(&r.bytes(16));
        Ok((gid, r.u16()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rcfw::cmd::QUERY_FUNC_SBUF_SIZE;

    #[test]
    fn test_attributes_fit_side_buffer() {
        let attrs = DeviceAttributes {
            fw_version: 0x0114_0203,
            max_qp: 1024,
            max_qp_wqes: 4096,
            max_sge: 6,
            max_cq: 1024,
            max_cqe: 65536,
            max_srq: 256,
            max_srq_wqes: 4096,
            max_mr: 4096,
            max_ah: 1024,
            max_gid: 32,
            max_inline: 96,
            max_rd_atomic: 16,
        };
        let mut w = WireWriter::new();
        attrs.encode(&mut w);
        let buf = w.finish();
        assert!(buf.len() <= QUERY_FUNC_SBUF_SIZE);
        assert_eq!(DeviceAttributes::decode(&mut WireReader::new(&buf)), attrs);
        assert_eq!(attrs.fw_version_string(), "1.20.2.3");
    }

    #[test]
    fn test_short_buffer_reads_zero() {
        let attrs = DeviceAttributes::decode(&mut WireReader::new(&[1, 0, 0, 0]));
        assert_eq!(attrs.fw_version, 1);
        assert_eq!(attrs.max_qp, 0);
    }
}
