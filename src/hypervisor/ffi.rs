#![allow(dead_code)]

use std::ffi::c_void;

pub type HvReturn = i32;
pub type HvVcpu = u32;

pub const HV_SUCCESS: HvReturn = 0;

// Memory permissions
pub const HV_MEMORY_READ: u64 = 1 << 0;
pub const HV_MEMORY_WRITE: u64 = 1 << 1;
pub const HV_MEMORY_EXEC: u64 = 1 << 2;

// vCPU exit reasons
pub const HV_EXIT_REASON_CANCELED: u32 = 0;
pub const HV_EXIT_REASON_EXCEPTION: u32 = 1;
pub const HV_EXIT_REASON_VTIMER_ACTIVATED: u32 = 2;

// CPU registers - ARM64 architecture
#[repr(u32)]
pub enum HvReg {
    X0 = 0,
    X1 = 1,
    X2 = 2,
    X3 = 3,
    X4 = 4,
    X5 = 5,
    X6 = 6,
    X7 = 7,
    X8 = 8,
    X9 = 9,
    X10 = 10,
    X11 = 11,
    X12 = 12,
    X13 = 13,
    X14 = 14,
    X15 = 15,
    X16 = 16,
    X17 = 17,
    X18 = 18,
    X19 = 19,
    X20 = 20,
    X21 = 21,
    X22 = 22,
    X23 = 23,
    X24 = 24,
    X25 = 25,
    X26 = 26,
    X27 = 27,
    X28 = 28,
    Fp = 29,   // Frame pointer (X29)
    Lr = 30,   // Link register (X30)
    Pc = 31,   // Program counter
    Fpcr = 32, // Floating-point control register
    Fpsr = 33, // Floating-point status register
    Cpsr = 34, // Current Program Status Register
}

impl HvReg {
    /// Map an instruction-encoded GPR index (0-30 = X0-LR) to a register
    /// id. Returns None for 31, the zero register.
    pub fn from_gpr(rt: u8) -> Option<HvReg> {
        if rt <= 30 {
            // discriminants 0..=30 line up with X0..=Lr
            Some(unsafe { std::mem::transmute::<u32, HvReg>(rt as u32) })
        } else {
            None
        }
    }
}

// ARM64 system registers written at boot. Syndrome and fault address come
// from the exit-info struct, not from sysreg reads.
#[repr(u32)]
pub enum HvSysReg {
    SctlrEl1 = 0xc080, // System Control Register

    SpEl0 = 0xc208, // Stack Pointer (EL0)
    SpEl1 = 0xe208, // Stack Pointer (EL1)
}

#[repr(C)]
pub struct HvVcpuExitException {
    pub syndrome: u64,
    pub virtual_address: u64,
    pub physical_address: u64,
}

#[repr(C)]
pub struct HvVcpuExit {
    pub reason: u32,
    pub exception: HvVcpuExitException,
}

#[link(name = "hvffi", kind = "static")]
extern "C" {
    pub fn hv_vm_create_wrapper(flags: u64) -> HvReturn;
    pub fn hv_vm_destroy_wrapper() -> HvReturn;
    pub fn hv_vm_map_wrapper(addr: *mut c_void, gpa: u64, size: usize, flags: u64) -> HvReturn;
    pub fn hv_vcpu_create_wrapper(vcpu: *mut HvVcpu, exit_info: *mut *mut HvVcpuExit) -> HvReturn;
    pub fn hv_vcpu_destroy_wrapper(vcpu: HvVcpu) -> HvReturn;
    pub fn hv_vcpu_run_wrapper(vcpu: HvVcpu) -> HvReturn;
    pub fn hv_vcpu_read_register_wrapper(vcpu: HvVcpu, reg: u32, value: *mut u64) -> HvReturn;
    pub fn hv_vcpu_write_register_wrapper(vcpu: HvVcpu, reg: u32, value: u64) -> HvReturn;
    pub fn hv_vcpu_read_sys_reg_wrapper(vcpu: HvVcpu, reg: u32, value: *mut u64) -> HvReturn;
    pub fn hv_vcpu_write_sys_reg_wrapper(vcpu: HvVcpu, reg: u32, value: u64) -> HvReturn;
    pub fn hv_vcpu_set_vtimer_mask_wrapper(vcpu: HvVcpu, vtimer_is_masked: bool) -> HvReturn;
}
