//! Guest-memory layout of the legacy split virtqueue.
//!
//! The rings live in guest DRAM, so the device reads them through the bus
//! with the field offsets below. The `repr(C)` structs document the layout
//! the offsets are derived from; the driver and device agree on it
//! bit-for-bit.

use std::mem::size_of;

use crate::param::DESC_NUM;

#[repr(C)]
pub struct VirtqDesc {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

#[repr(C)]
pub struct VirtqAvail {
    pub flags: u16,
    pub idx: u16,
    pub ring: [u16; DESC_NUM],
    pub used_event: u16,
}

#[repr(C)]
pub struct VirtqUsedElem {
    pub id: u32,
    pub len: u32,
}

#[repr(C)]
pub struct VirtqUsed {
    pub flags: u16,
    pub idx: u16,
    pub ring: [VirtqUsedElem; DESC_NUM],
    pub avail_event: u16,
}

#[repr(C)]
pub struct VirtioBlkRequest {
    pub iotype: u32,
    pub reserved: u32,
    pub sector: u64,
}

/// Stride of one descriptor table entry.
pub const VIRTQ_DESC_SIZE: u64 = size_of::<VirtqDesc>() as u64;

// VirtqDesc field offsets.
pub const VIRTQ_DESC_ADDR: u64 = 0;
pub const VIRTQ_DESC_LEN: u64 = 8;
pub const VIRTQ_DESC_NEXT: u64 = 14;

// VirtqAvail field offsets.
pub const VIRTQ_AVAIL_IDX: u64 = 2;
pub const VIRTQ_AVAIL_RING: u64 = 4;

// VirtqUsed field offsets.
pub const VIRTQ_USED_IDX: u64 = 2;

// VirtioBlkRequest field offsets.
pub const VIRTIO_BLK_REQ_IOTYPE: u64 = 0;
pub const VIRTIO_BLK_REQ_SECTOR: u64 = 8;

#[cfg(test)]
mod test {
    use super::*;
    use std::mem::offset_of;

    #[test]
    fn offsets_match_struct_layout() {
        assert_eq!(VIRTQ_DESC_SIZE, 16);
        assert_eq!(offset_of!(VirtqDesc, addr) as u64, VIRTQ_DESC_ADDR);
        assert_eq!(offset_of!(VirtqDesc, len) as u64, VIRTQ_DESC_LEN);
        assert_eq!(offset_of!(VirtqDesc, next) as u64, VIRTQ_DESC_NEXT);
        assert_eq!(offset_of!(VirtqAvail, idx) as u64, VIRTQ_AVAIL_IDX);
        assert_eq!(offset_of!(VirtqAvail, ring) as u64, VIRTQ_AVAIL_RING);
        assert_eq!(offset_of!(VirtqUsed, idx) as u64, VIRTQ_USED_IDX);
        assert_eq!(
            offset_of!(VirtioBlkRequest, iotype) as u64,
            VIRTIO_BLK_REQ_IOTYPE
        );
        assert_eq!(
            offset_of!(VirtioBlkRequest, sector) as u64,
            VIRTIO_BLK_REQ_SECTOR
        );
    }
}
