//! Virtio MMIO transport (virtio v2 / modern).
//!
//! Register offsets and split-virtqueue access per the virtio spec §4.2.
//! The device reads the guest's rings directly out of guest RAM through
//! the [`GuestRam`] accessor.

pub mod gpu;

use crate::memory::GuestRam;
use std::sync::atomic::{fence, Ordering};

// Virtio MMIO magic value ("virt")
pub const VIRTIO_MMIO_MAGIC: u32 = 0x74726976;
pub const VIRTIO_MMIO_VERSION: u32 = 2;
// "QEMU" in ASCII — the de-facto standard vendor ID recognized by virtio drivers.
pub const VIRTIO_MMIO_VENDOR: u32 = 0x554D4551;

// Virtio MMIO register offsets
pub const REG_MAGIC_VALUE: u64 = 0x000;
pub const REG_VERSION: u64 = 0x004;
pub const REG_DEVICE_ID: u64 = 0x008;
pub const REG_VENDOR_ID: u64 = 0x00C;
pub const REG_DEVICE_FEATURES: u64 = 0x010;
pub const REG_DEVICE_FEATURES_SEL: u64 = 0x014;
pub const REG_DRIVER_FEATURES: u64 = 0x020;
pub const REG_DRIVER_FEATURES_SEL: u64 = 0x024;
pub const REG_QUEUE_SEL: u64 = 0x030;
pub const REG_QUEUE_NUM_MAX: u64 = 0x034;
pub const REG_QUEUE_NUM: u64 = 0x038;
pub const REG_QUEUE_READY: u64 = 0x044;
pub const REG_QUEUE_NOTIFY: u64 = 0x050;
pub const REG_INTERRUPT_STATUS: u64 = 0x060;
pub const REG_INTERRUPT_ACK: u64 = 0x064;
pub const REG_STATUS: u64 = 0x070;
pub const REG_QUEUE_DESC_LOW: u64 = 0x080;
pub const REG_QUEUE_DESC_HIGH: u64 = 0x084;
pub const REG_QUEUE_DRIVER_LOW: u64 = 0x090;
pub const REG_QUEUE_DRIVER_HIGH: u64 = 0x094;
pub const REG_QUEUE_DEVICE_LOW: u64 = 0x0A0;
pub const REG_QUEUE_DEVICE_HIGH: u64 = 0x0A4;
pub const REG_CONFIG_GENERATION: u64 = 0x0FC;
pub const REG_CONFIG_BASE: u64 = 0x100;

// Virtqueue descriptor flags
pub const VIRTQ_DESC_F_NEXT: u16 = 1;
pub const VIRTQ_DESC_F_WRITE: u16 = 2;

/// State of a single virtqueue.
///
/// The three ring addresses, once set, stay in effect until the driver
/// clears `ready` or resets the device.
#[derive(Clone)]
pub struct VirtqState {
    pub num_max: u32, // Max queue size
    pub num: u32,     // Current queue size (set by driver)
    pub ready: bool,
    pub desc_addr: u64,  // Guest physical address of descriptor table
    pub avail_addr: u64, // Guest physical address of available ring
    pub used_addr: u64,  // Guest physical address of used ring
    pub last_avail_idx: u16,
}

impl VirtqState {
    pub fn new(num_max: u32) -> Self {
        VirtqState {
            num_max,
            num: 0,
            ready: false,
            desc_addr: 0,
            avail_addr: 0,
            used_addr: 0,
            last_avail_idx: 0,
        }
    }
}

// Guest memory is written by the guest vCPU through the stage-2 mapping.
// The GuestRam scalar accessors are volatile; the SeqCst fences here
// (`dmb ish` on ARM64, a full barrier) make preceding guest stores
// visible before the loads that depend on them. A load-only barrier is
// not enough for stores coming from another agent.

/// Read a descriptor from the descriptor table in guest memory.
pub fn read_descriptor(ram: &GuestRam, desc_addr: u64, index: u16) -> Option<(u64, u32, u16, u16)> {
    let entry = desc_addr.checked_add((index as u64) * 16)?;

    fence(Ordering::SeqCst);
    let addr = ram.read_u64(entry)?;
    let len = ram.read_u32(entry + 8)?;
    let flags = ram.read_u16(entry + 12)?;
    let next = ram.read_u16(entry + 14)?;

    Some((addr, len, flags, next))
}

/// Read the current available ring index.
pub fn read_avail_idx(ram: &GuestRam, avail_addr: u64) -> Option<u16> {
    fence(Ordering::SeqCst);
    ram.read_u16(avail_addr.checked_add(2)?)
}

/// Read an entry from the available ring.
pub fn read_avail_ring(ram: &GuestRam, avail_addr: u64, idx: u16, queue_size: u32) -> Option<u16> {
    let slot = (idx % queue_size as u16) as u64;
    fence(Ordering::SeqCst);
    ram.read_u16(avail_addr.checked_add(4 + slot * 2)?)
}

/// Write an entry to the used ring.
pub fn write_used_elem(
    ram: &mut GuestRam,
    used_addr: u64,
    used_idx: u16,
    queue_size: u32,
    desc_id: u32,
    len: u32,
) -> Option<()> {
    let slot = (used_idx % queue_size as u16) as u64;
    let entry = used_addr.checked_add(4 + slot * 8)?;
    ram.write_u32(entry, desc_id)?;
    ram.write_u32(entry + 4, len)?;
    Some(())
}

/// Publish the used ring index. Must happen after the slot it indexes has
/// been written, or a polling guest can read a stale entry.
pub fn write_used_idx(ram: &mut GuestRam, used_addr: u64, idx: u16) -> Option<()> {
    fence(Ordering::Release);
    ram.write_u16(used_addr.checked_add(2)?, idx)
}

/// Read the current used ring index.
pub fn read_used_idx(ram: &GuestRam, used_addr: u64) -> Option<u16> {
    ram.read_u16(used_addr.checked_add(2)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u64 = 0x7000_0000;

    #[test]
    fn test_descriptor_layout() {
        let mut ram = GuestRam::new(BASE, 64 * 1024).unwrap();
        let desc_addr = BASE + 0x1000;

        // descriptor 3: addr/len/flags/next
        let entry = ram.get_mut(desc_addr + 3 * 16, 16).unwrap();
        entry[0..8].copy_from_slice(&0x7000_8000u64.to_le_bytes());
        entry[8..12].copy_from_slice(&24u32.to_le_bytes());
        entry[12..14].copy_from_slice(&VIRTQ_DESC_F_NEXT.to_le_bytes());
        entry[14..16].copy_from_slice(&4u16.to_le_bytes());

        assert_eq!(
            read_descriptor(&ram, desc_addr, 3),
            Some((0x7000_8000, 24, VIRTQ_DESC_F_NEXT, 4))
        );
        // an entry past the end of RAM is unreadable
        assert_eq!(read_descriptor(&ram, BASE + 64 * 1024, 0), None);
    }

    #[test]
    fn test_used_publication_order() {
        let mut ram = GuestRam::new(BASE, 64 * 1024).unwrap();
        let used_addr = BASE + 0x2000;

        write_used_elem(&mut ram, used_addr, 0, 8, 5, 24).unwrap();
        write_used_idx(&mut ram, used_addr, 1).unwrap();

        assert_eq!(read_used_idx(&ram, used_addr), Some(1));
        assert_eq!(ram.read_u32(used_addr + 4), Some(5)); // id
        assert_eq!(ram.read_u32(used_addr + 8), Some(24)); // len

        // slot index wraps at the queue size
        write_used_elem(&mut ram, used_addr, 9, 8, 7, 0).unwrap();
        assert_eq!(ram.read_u32(used_addr + 4 + 8), Some(7));
    }

    #[test]
    fn test_avail_ring_wrap() {
        let mut ram = GuestRam::new(BASE, 64 * 1024).unwrap();
        let avail_addr = BASE + 0x3000;

        ram.write_u16(avail_addr + 2, 17).unwrap(); // idx
        ram.write_u16(avail_addr + 4, 9).unwrap(); // ring[0]

        assert_eq!(read_avail_idx(&ram, avail_addr), Some(17));
        // entry 16 of an 8-deep ring lands back on slot 0
        assert_eq!(read_avail_ring(&ram, avail_addr, 16, 8), Some(9));
    }
}
