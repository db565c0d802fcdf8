use super::ffi::*;
use anyhow::Result;
use std::ptr;

/// One virtual CPU and the exit-info block the framework reports through.
pub struct Vcpu {
    id: HvVcpu,
    exit_info: *mut HvVcpuExit,
}

impl Vcpu {
    /// Create a new virtual CPU
    pub fn new() -> Result<Self> {
        let mut id: HvVcpu = 0;
        let mut exit_info: *mut HvVcpuExit = ptr::null_mut();

        let ret = unsafe { hv_vcpu_create_wrapper(&mut id, &mut exit_info) };

        if ret != HV_SUCCESS {
            anyhow::bail!("Failed to create VCPU: error code {ret}");
        }

        Ok(Vcpu { id, exit_info })
    }

    /// Run the virtual CPU until the next exit. Returns the exit reason.
    pub fn run(&self) -> Result<u32> {
        let ret = unsafe { hv_vcpu_run_wrapper(self.id) };

        if ret != HV_SUCCESS {
            anyhow::bail!("Failed to run VCPU: error code {ret}");
        }

        let reason = unsafe { (*self.exit_info).reason };
        Ok(reason)
    }

    /// Read a CPU register
    pub fn read_register(&self, reg: HvReg) -> Result<u64> {
        let mut value: u64 = 0;
        let ret = unsafe { hv_vcpu_read_register_wrapper(self.id, reg as u32, &mut value) };

        if ret != HV_SUCCESS {
            anyhow::bail!("Failed to read register: error code {ret}");
        }

        Ok(value)
    }

    /// Write a CPU register
    pub fn write_register(&self, reg: HvReg, value: u64) -> Result<()> {
        let ret = unsafe { hv_vcpu_write_register_wrapper(self.id, reg as u32, value) };

        if ret != HV_SUCCESS {
            anyhow::bail!("Failed to write register: error code {ret}");
        }

        Ok(())
    }

    /// Read an ARM64 system register
    pub fn read_sys_register(&self, reg: HvSysReg) -> Result<u64> {
        let mut value: u64 = 0;
        let ret = unsafe { hv_vcpu_read_sys_reg_wrapper(self.id, reg as u32, &mut value) };

        if ret != HV_SUCCESS {
            anyhow::bail!("Failed to read system register: error code {ret}");
        }

        Ok(value)
    }

    /// Write an ARM64 system register
    pub fn write_sys_register(&self, reg: HvSysReg, value: u64) -> Result<()> {
        let ret = unsafe { hv_vcpu_write_sys_reg_wrapper(self.id, reg as u32, value) };

        if ret != HV_SUCCESS {
            anyhow::bail!("Failed to write system register: error code {ret}");
        }

        Ok(())
    }

    pub fn read_exception_syndrome(&self) -> Result<u64> {
        if self.exit_info.is_null() {
            anyhow::bail!("Exit info is NULL");
        }

        unsafe { Ok((*self.exit_info).exception.syndrome) }
    }

    pub fn read_fault_address(&self) -> Result<u64> {
        if self.exit_info.is_null() {
            anyhow::bail!("Exit info is NULL");
        }

        unsafe { Ok((*self.exit_info).exception.physical_address) }
    }

    /// Mask or unmask the virtual timer. Masking acknowledges a
    /// VTIMER_ACTIVATED exit so the vCPU can resume.
    pub fn set_vtimer_mask(&self, masked: bool) -> Result<()> {
        let ret = unsafe { hv_vcpu_set_vtimer_mask_wrapper(self.id, masked) };

        if ret != HV_SUCCESS {
            anyhow::bail!("Failed to set vtimer mask: error code {ret}");
        }

        Ok(())
    }
}

impl Drop for Vcpu {
    fn drop(&mut self) {
        unsafe {
            let ret = hv_vcpu_destroy_wrapper(self.id);
            if ret != HV_SUCCESS {
                log::warn!("Failed to destroy VCPU: error code {ret}");
            }
        }
    }
}
