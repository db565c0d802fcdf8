//! VM construction and the vCPU exit loop.

use crate::cli::Args;
use crate::decode::{self, DataAbort};
use crate::hypervisor::{
    self, HvReg, HvSysReg, Vcpu, Vm, HV_EXIT_REASON_CANCELED, HV_EXIT_REASON_EXCEPTION,
    HV_EXIT_REASON_VTIMER_ACTIVATED, HV_MEMORY_EXEC, HV_MEMORY_READ, HV_MEMORY_WRITE,
};
use crate::memory::GuestRam;
use crate::uart::Pl011;
use crate::virtio::gpu::VirtioGpuDevice;
use anyhow::{Context, Result};
use log::{debug, error, trace, warn};
use std::ffi::c_void;

// ARM64 guest physical memory layout.
// All addresses are GPAs (Guest Physical Addresses). The MMIO regions sit
// below RAM and are not mapped, so every device access faults out to the
// exit loop. The guest kernel is built against these constants.
mod mem_layout {
    // Guest RAM base address. The kernel image is loaded here and the
    // vCPU starts executing at this address.
    pub const RAM_BASE: u64 = 0x70000000;

    // PL011 UART MMIO region (absolute address, not an offset from
    // RAM_BASE). Guest stores here become host stdout bytes.
    pub const UART_BASE: u64 = 0x09000000;
    pub const UART_SIZE: u64 = 0x1000;

    // Virtio-mmio GPU region.
    pub const GPU_BASE: u64 = 0x0A000000;
    pub const GPU_SIZE: u64 = 0x1000;
}

use mem_layout::*;

// Stage-2 mappings need 16 KiB-aligned host backing on Apple Silicon.
const STAGE2_ALIGN: usize = 16 * 1024;

// Outer bound on the exit loop
const MAX_ITERATIONS: u64 = 100_000_000;

// EL1h with DAIF masked: the guest starts in kernel mode with all
// asynchronous interrupts off.
const BOOT_CPSR: u64 = 0x3C5;

pub struct VmmInstance {
    vm: Vm,
    ram: GuestRam,
    uart: Pl011,
    gpu: VirtioGpuDevice,
}

impl VmmInstance {
    /// Write to a guest general-purpose register by index (0-30 = X0-LR, 31 = XZR).
    fn write_guest_register(vcpu: &Vcpu, rt: u8, value: u64) -> Result<()> {
        match HvReg::from_gpr(rt) {
            Some(reg) => vcpu.write_register(reg, value),
            None => Ok(()), // XZR (zero register) - writes are discarded
        }
    }

    /// Read from a guest general-purpose register by index (0-30 = X0-LR, 31 = XZR).
    fn read_guest_register(vcpu: &Vcpu, rt: u8) -> Result<u64> {
        match HvReg::from_gpr(rt) {
            Some(reg) => vcpu.read_register(reg),
            None => Ok(0), // XZR (zero register) - always reads 0
        }
    }

    pub fn new(args: &Args) -> Result<Self> {
        hypervisor::init().context("Failed to initialize hypervisor")?;

        let vm = Vm::new().context("Failed to create VM")?;

        let memory_size = args.memory * 1024 * 1024;
        let ram = GuestRam::new(RAM_BASE, memory_size).context("Failed to allocate guest RAM")?;

        Ok(VmmInstance {
            vm,
            ram,
            uart: Pl011::new(),
            gpu: VirtioGpuDevice::new(args.output_prefix.clone()),
        })
    }

    pub fn setup(&mut self) -> Result<()> {
        let host_ptr = self.ram.as_host_ptr();
        if (host_ptr as usize) % STAGE2_ALIGN != 0 {
            anyhow::bail!("guest RAM backing is not {STAGE2_ALIGN}-byte aligned");
        }

        let flags = HV_MEMORY_READ | HV_MEMORY_WRITE | HV_MEMORY_EXEC;
        self.vm
            .map_memory(host_ptr as *mut c_void, RAM_BASE, self.ram.len(), flags)
            .context("Failed to map guest RAM")?;

        debug!(
            "Guest RAM mapped at 0x{:x} ({} MB)",
            RAM_BASE,
            self.ram.len() / (1024 * 1024)
        );

        Ok(())
    }

    /// Copy the flat kernel image to the base of guest RAM, where the vCPU
    /// starts executing.
    pub fn load_kernel(&mut self, kernel_data: &[u8]) -> Result<()> {
        if kernel_data.is_empty() {
            anyhow::bail!("Kernel image is empty");
        }

        let dst = self
            .ram
            .get_mut(RAM_BASE, kernel_data.len())
            .with_context(|| {
                format!(
                    "Kernel too large for VM memory ({} bytes, memory {} bytes)",
                    kernel_data.len(),
                    self.ram.len()
                )
            })?;
        dst.copy_from_slice(kernel_data);

        debug!(
            "Kernel loaded at 0x{:x} ({} bytes)",
            RAM_BASE,
            kernel_data.len()
        );

        Ok(())
    }

    pub fn run(&mut self) -> Result<()> {
        let vcpu = Vcpu::new().context("Failed to create vCPU")?;

        // Boot state: PC at the first kernel instruction, EL1h with all
        // interrupts masked, X0 = 0 (no device tree), MMU and caches off.
        vcpu.write_register(HvReg::Pc, RAM_BASE)?;
        vcpu.write_register(HvReg::Cpsr, BOOT_CPSR)?;
        vcpu.write_register(HvReg::X0, 0)?;
        vcpu.write_sys_register(HvSysReg::SctlrEl1, 0)?;

        // Stack pointers near the top of RAM; the kernel sets up its own
        let sp_addr = RAM_BASE + (self.ram.len() as u64) - 0x10000;
        vcpu.write_sys_register(HvSysReg::SpEl0, sp_addr)?;
        vcpu.write_sys_register(HvSysReg::SpEl1, sp_addr)?;

        debug!("--- Entering VCPU run loop ---");

        let mut iteration: u64 = 0;

        loop {
            iteration += 1;

            if iteration > MAX_ITERATIONS {
                warn!("Stopped after {} iterations", iteration - 1);
                break;
            }

            if iteration % 1_000_000 == 0 {
                let pc = vcpu.read_register(HvReg::Pc).unwrap_or(0);
                debug!("iter={}M, PC=0x{:x}", iteration / 1_000_000, pc);
            }

            let exit_reason = match vcpu.run() {
                Ok(r) => r,
                Err(e) => {
                    let pc = vcpu.read_register(HvReg::Pc).unwrap_or(0);
                    error!("hv_vcpu_run error at PC=0x{pc:x}: {e}");
                    return Err(e);
                }
            };

            match exit_reason {
                HV_EXIT_REASON_CANCELED => {
                    debug!("vCPU run canceled by host");
                    break;
                }

                HV_EXIT_REASON_EXCEPTION => {
                    let pc = vcpu.read_register(HvReg::Pc)?;
                    let syndrome = vcpu.read_exception_syndrome()?;
                    let ec = decode::syndrome_ec(syndrome);
                    let iss = decode::syndrome_iss(syndrome);

                    if iteration <= 30 {
                        let fault_addr = vcpu.read_fault_address().unwrap_or(0);
                        trace!(
                            "#{iteration}: PC=0x{pc:x} EC=0x{ec:x} ISS=0x{iss:x} fault=0x{fault_addr:x}"
                        );
                    }

                    match ec {
                        decode::EC_WFX => {
                            // the guest parked itself: treat as a halt
                            debug!("WFI at PC=0x{pc:x}, halting");
                            break;
                        }

                        decode::EC_HVC => {
                            debug!("HVC #0x{:x} at PC=0x{pc:x} ignored", iss & 0xFFFF);
                            vcpu.write_register(HvReg::Pc, pc + 4)?;
                        }

                        decode::EC_DABT_LOWER | decode::EC_DABT_SAME => {
                            let fault_addr = vcpu.read_fault_address()?;
                            self.handle_mmio(&vcpu, pc, iss, fault_addr)?;
                            // every emulated access resumes at the next instruction
                            vcpu.write_register(HvReg::Pc, pc + 4)?;
                        }

                        _ => {
                            let fault_addr = vcpu.read_fault_address().unwrap_or(0);
                            error!(
                                "Unhandled EC=0x{ec:x} at PC=0x{pc:x}, ISS=0x{iss:x}, fault=0x{fault_addr:x}"
                            );
                            anyhow::bail!("unhandled exception class 0x{ec:x} at PC=0x{pc:x}");
                        }
                    }
                }

                HV_EXIT_REASON_VTIMER_ACTIVATED => {
                    // Mask the timer and resume. The guest runs with IRQs
                    // masked and polls, so the timer is never delivered.
                    vcpu.set_vtimer_mask(true)?;
                }

                reason => {
                    error!("Unknown exit reason: {reason}");
                    anyhow::bail!("unknown vCPU exit reason {reason}");
                }
            }
        }

        if log::log_enabled!(log::Level::Debug) {
            let final_pc = vcpu.read_register(HvReg::Pc).unwrap_or(0);
            debug!("Final PC: 0x{final_pc:x}");
            debug!("Total iterations: {iteration}");
            debug!("Snapshots written: {}", self.gpu.flush_count());
        }

        Ok(())
    }

    /// Fetch the 32-bit instruction at the faulting PC and extract its
    /// register field. The guest accesses devices through an identity
    /// mapping, so the PC can be used as a guest-physical address.
    fn insn_rt_at(&self, pc: u64) -> Option<u8> {
        self.ram.read_u32(pc).map(decode::insn_rt)
    }

    /// Emulate one faulting device access. The caller advances the PC.
    fn handle_mmio(&mut self, vcpu: &Vcpu, pc: u64, iss: u64, fault_addr: u64) -> Result<()> {
        let abort = DataAbort::parse(iss);

        if abort.write {
            // The syndrome's ISV/SRT fields are not populated reliably for
            // device stores on this host: always recover the source
            // register from the instruction itself.
            let rt = match self.insn_rt_at(pc) {
                Some(rt) => rt,
                None => {
                    warn!("MMIO store at PC=0x{pc:x} outside guest RAM, dropped");
                    return Ok(());
                }
            };
            let value = Self::read_guest_register(vcpu, rt)? as u32;
            self.mmio_store(fault_addr, value);
        } else {
            let rt = match abort.isv.then_some(abort.srt).or_else(|| self.insn_rt_at(pc)) {
                Some(rt) => rt,
                None => {
                    warn!("MMIO load at PC=0x{pc:x} outside guest RAM, dropped");
                    return Ok(());
                }
            };
            let value = self.mmio_load(fault_addr);
            Self::write_guest_register(vcpu, rt, value as u64)?;
        }

        Ok(())
    }

    fn mmio_store(&mut self, addr: u64, value: u32) {
        if (UART_BASE..UART_BASE + UART_SIZE).contains(&addr) {
            self.uart.write(addr - UART_BASE, value);
        } else if (GPU_BASE..GPU_BASE + GPU_SIZE).contains(&addr) {
            if let Some(queue) = self.gpu.mmio_write(addr - GPU_BASE, value) {
                trace!("virtio-gpu: queue {queue} notified");
                self.gpu.process_queue(queue, &mut self.ram);
            }
        } else {
            debug!("Store of 0x{value:x} to unmapped MMIO 0x{addr:x} dropped");
        }
    }

    fn mmio_load(&mut self, addr: u64) -> u32 {
        if (UART_BASE..UART_BASE + UART_SIZE).contains(&addr) {
            self.uart.read(addr - UART_BASE)
        } else if (GPU_BASE..GPU_BASE + GPU_SIZE).contains(&addr) {
            self.gpu.mmio_read(addr - GPU_BASE)
        } else {
            debug!("Load from unmapped MMIO 0x{addr:x} reads 0");
            0
        }
    }
}

pub fn run(args: Args) -> Result<()> {
    let kernel = std::fs::read(&args.kernel)
        .with_context(|| format!("Failed to read kernel image {:?}", args.kernel))?;

    let mut vmm = VmmInstance::new(&args)?;
    vmm.setup()?;
    vmm.load_kernel(&kernel)?;
    vmm.run()
}
