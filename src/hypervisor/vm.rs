use super::ffi::*;
use anyhow::Result;
use std::ffi::c_void;

/// Owner of the process-wide VM. Hypervisor.framework allows exactly one
/// VM per process; destroying it on drop releases the stage-2 mappings.
pub struct Vm {
    _marker: std::marker::PhantomData<()>,
}

impl Vm {
    /// Create the VM instance
    pub fn new() -> Result<Self> {
        let ret = unsafe { hv_vm_create_wrapper(0) };

        if ret != HV_SUCCESS {
            anyhow::bail!("Failed to create VM: error code {ret}");
        }

        Ok(Vm {
            _marker: std::marker::PhantomData,
        })
    }

    /// Map host memory into guest physical address space
    pub fn map_memory(
        &self,
        host_addr: *mut c_void,
        guest_addr: u64,
        size: usize,
        flags: u64,
    ) -> Result<()> {
        let ret = unsafe { hv_vm_map_wrapper(host_addr, guest_addr, size, flags) };

        if ret != HV_SUCCESS {
            anyhow::bail!("Failed to map memory at 0x{guest_addr:x}: error code {ret}");
        }

        Ok(())
    }

}

impl Drop for Vm {
    fn drop(&mut self) {
        unsafe {
            let ret = hv_vm_destroy_wrapper();
            if ret != HV_SUCCESS {
                log::warn!("Failed to destroy VM: error code {ret}");
            }
        }
    }
}
