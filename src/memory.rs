//! Guest RAM: one contiguous anonymous mapping exposed to the VM, plus the
//! single guest-physical → host translation everything else goes through.

use anyhow::{Context, Result};
use memmap2::MmapMut;

/// Contiguous guest-physical RAM region backed by an anonymous mapping.
///
/// All guest-side structure access (virtqueue rings, command payloads,
/// backing pages, instruction fetch) goes through this type so that the
/// `[base, base + len)` bound is enforced in exactly one place.
pub struct GuestRam {
    map: MmapMut,
    base: u64,
}

// ── Volatile access to guest-shared memory ──────────────────────────────
// The guest vCPU writes ring indices and descriptors through the
// hypervisor's stage-2 mapping, so plain reads could be cached or folded
// by the compiler. The u16/u32/u64 accessors below use volatile loads and
// stores; the fences that order them against guest stores live at the
// virtqueue call sites. Ring control fields are naturally aligned per the
// virtio layout; if a guest hands us an unaligned pointer anyway, the
// accessors fall back to byte-wise access rather than fault.

impl GuestRam {
    pub fn new(base: u64, size: usize) -> Result<Self> {
        let map = MmapMut::map_anon(size).context("Failed to allocate guest RAM")?;
        Ok(GuestRam { map, base })
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Host pointer to the start of the region, for the stage-2 map call.
    pub fn as_host_ptr(&mut self) -> *mut u8 {
        self.map.as_mut_ptr()
    }

    /// Translate a guest-physical range to an offset into the backing
    /// mapping. None if any byte falls outside `[base, base + len)`.
    pub fn checked_offset(&self, gpa: u64, len: usize) -> Option<usize> {
        let offset = gpa.checked_sub(self.base)?;
        let offset = usize::try_from(offset).ok()?;
        if offset.checked_add(len)? > self.map.len() {
            return None;
        }
        Some(offset)
    }

    pub fn get(&self, gpa: u64, len: usize) -> Option<&[u8]> {
        let offset = self.checked_offset(gpa, len)?;
        Some(&self.map[offset..offset + len])
    }

    pub fn get_mut(&mut self, gpa: u64, len: usize) -> Option<&mut [u8]> {
        let offset = self.checked_offset(gpa, len)?;
        Some(&mut self.map[offset..offset + len])
    }

    pub fn read_u16(&self, gpa: u64) -> Option<u16> {
        let offset = self.checked_offset(gpa, 2)?;
        let ptr = unsafe { self.map.as_ptr().add(offset) };
        if ptr as usize % 2 == 0 {
            Some(u16::from_le(unsafe {
                std::ptr::read_volatile(ptr as *const u16)
            }))
        } else {
            Some(u16::from_le_bytes(
                self.map[offset..offset + 2].try_into().unwrap(),
            ))
        }
    }

    pub fn read_u32(&self, gpa: u64) -> Option<u32> {
        let offset = self.checked_offset(gpa, 4)?;
        let ptr = unsafe { self.map.as_ptr().add(offset) };
        if ptr as usize % 4 == 0 {
            Some(u32::from_le(unsafe {
                std::ptr::read_volatile(ptr as *const u32)
            }))
        } else {
            Some(u32::from_le_bytes(
                self.map[offset..offset + 4].try_into().unwrap(),
            ))
        }
    }

    pub fn read_u64(&self, gpa: u64) -> Option<u64> {
        let offset = self.checked_offset(gpa, 8)?;
        let ptr = unsafe { self.map.as_ptr().add(offset) };
        if ptr as usize % 8 == 0 {
            Some(u64::from_le(unsafe {
                std::ptr::read_volatile(ptr as *const u64)
            }))
        } else {
            Some(u64::from_le_bytes(
                self.map[offset..offset + 8].try_into().unwrap(),
            ))
        }
    }

    pub fn write_u16(&mut self, gpa: u64, value: u16) -> Option<()> {
        let offset = self.checked_offset(gpa, 2)?;
        let ptr = unsafe { self.map.as_mut_ptr().add(offset) };
        if ptr as usize % 2 == 0 {
            unsafe { std::ptr::write_volatile(ptr as *mut u16, value.to_le()) };
        } else {
            self.map[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
        }
        Some(())
    }

    pub fn write_u32(&mut self, gpa: u64, value: u32) -> Option<()> {
        let offset = self.checked_offset(gpa, 4)?;
        let ptr = unsafe { self.map.as_mut_ptr().add(offset) };
        if ptr as usize % 4 == 0 {
            unsafe { std::ptr::write_volatile(ptr as *mut u32, value.to_le()) };
        } else {
            self.map[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        }
        Some(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u64 = 0x7000_0000;

    fn ram() -> GuestRam {
        GuestRam::new(BASE, 64 * 1024).unwrap()
    }

    #[test]
    fn test_translation_bounds() {
        let r = ram();
        assert!(r.checked_offset(BASE, 4).is_some());
        assert!(r.checked_offset(BASE + 64 * 1024 - 4, 4).is_some());
        // one past the end
        assert!(r.checked_offset(BASE + 64 * 1024 - 3, 4).is_none());
        // below the base
        assert!(r.checked_offset(BASE - 1, 1).is_none());
        assert!(r.checked_offset(0, 4).is_none());
    }

    #[test]
    fn test_wraparound_rejected() {
        let r = ram();
        assert!(r.checked_offset(u64::MAX, 4).is_none());
        assert!(r.checked_offset(BASE + 8, usize::MAX).is_none());
    }

    #[test]
    fn test_scalar_round_trip() {
        let mut r = ram();
        r.write_u32(BASE + 0x100, 0xDEAD_BEEF).unwrap();
        assert_eq!(r.read_u32(BASE + 0x100), Some(0xDEAD_BEEF));

        r.write_u16(BASE + 0x200, 0x1234).unwrap();
        assert_eq!(r.read_u16(BASE + 0x200), Some(0x1234));

        r.get_mut(BASE + 0x300, 8)
            .unwrap()
            .copy_from_slice(&0x1122_3344_5566_7788u64.to_le_bytes());
        assert_eq!(r.read_u64(BASE + 0x300), Some(0x1122_3344_5566_7788));
    }

    #[test]
    fn test_unaligned_access() {
        let mut r = ram();
        // 2-byte-aligned u32 (the avail idx field is only 2-aligned)
        r.write_u32(BASE + 0x102, 0xCAFE_F00D).unwrap();
        assert_eq!(r.read_u32(BASE + 0x102), Some(0xCAFE_F00D));
        // 4-byte-aligned u64 (packed command payload fields)
        r.get_mut(BASE + 0x404, 8)
            .unwrap()
            .copy_from_slice(&0xAABB_CCDD_EEFF_0011u64.to_le_bytes());
        assert_eq!(r.read_u64(BASE + 0x404), Some(0xAABB_CCDD_EEFF_0011));
    }
}
