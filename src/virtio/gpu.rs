//! Virtio-GPU device over the MMIO transport.
//!
//! Implements the 2D subset of the virtio-gpu control protocol: resource
//! lifecycle, guest-to-host transfers into a host-side framebuffer, and a
//! flush that snapshots the framebuffer to a PPM file on disk. The guest
//! polls the used ring; no interrupt is ever injected.

use super::*;
use crate::memory::GuestRam;
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

// Virtio-gpu device ID
const VIRTIO_ID_GPU: u32 = 16;

const QUEUE_NUM_MAX: u32 = 256;
// controlq = 0, cursorq = 1
const NUM_QUEUES: usize = 2;

// Control protocol command types
const CMD_GET_DISPLAY_INFO: u32 = 0x0100;
const CMD_RESOURCE_CREATE_2D: u32 = 0x0101;
const CMD_SET_SCANOUT: u32 = 0x0103;
const CMD_RESOURCE_FLUSH: u32 = 0x0104;
const CMD_TRANSFER_TO_HOST_2D: u32 = 0x0105;
const CMD_RESOURCE_ATTACH_BACKING: u32 = 0x0106;

// Control protocol response types
const RESP_OK_NODATA: u32 = 0x1100;
const RESP_OK_DISPLAY_INFO: u32 = 0x1101;
const RESP_ERR_UNSPEC: u32 = 0x1200;

// Every command and response starts with the same 24-byte header:
// { type:u32, flags:u32, fence_id:u64, ctx_id:u32, padding:u32 }
const CTRL_HDR_SIZE: usize = 24;

// GET_DISPLAY_INFO answers with 16 display entries of 24 bytes each
const MAX_DISPLAYS: usize = 16;
const DISPLAY_ENTRY_SIZE: usize = 24;

// Device config space: { events_read:u32, events_clear:u32, num_scanouts:u32,
// reserved } — 24 bytes at REG_CONFIG_BASE
const CONFIG_SIZE: u64 = 0x18;

const SCANOUT_WIDTH: u32 = 800;
const SCANOUT_HEIGHT: u32 = 600;

// Upper bound on resource dimensions the host framebuffer will follow
const MAX_RESOURCE_DIM: u32 = 4096;

/// A guest 2D resource. Backing is a single linear guest-physical range
/// (the first ATTACH_BACKING entry).
#[derive(Clone, Copy)]
struct GpuResource {
    format: u32,
    width: u32,
    height: u32,
    backing_gpa: u64,
    backing_len: u32,
}

/// Host-side GPU state: the resource table, the scanout binding, and the
/// framebuffer that TRANSFER_TO_HOST_2D copies into and RESOURCE_FLUSH
/// serializes. Owned by the transport, handed to the command handler by
/// exclusive reference.
struct GpuState {
    resources: HashMap<u32, GpuResource>,
    scanout_resource: u32,
    fb: Vec<u8>,
    fb_width: u32,
    fb_height: u32,
    flush_count: u64,
    output_prefix: PathBuf,
}

impl GpuState {
    fn new(output_prefix: PathBuf) -> Self {
        GpuState {
            resources: HashMap::new(),
            scanout_resource: 0,
            fb: Vec::new(),
            fb_width: 0,
            fb_height: 0,
            flush_count: 0,
            output_prefix,
        }
    }

    /// Device reset: drop resources and the scanout binding. The host
    /// framebuffer stays; the next RESOURCE_CREATE_2D re-initializes it.
    fn clear(&mut self) {
        self.resources.clear();
        self.scanout_resource = 0;
    }

    /// Handle one command chain. Returns the number of bytes written into
    /// the response buffer (the used-ring `len`).
    fn handle_command(
        &mut self,
        ram: &mut GuestRam,
        cmd_gpa: u64,
        cmd_len: u32,
        resp_gpa: u64,
        resp_len: u32,
    ) -> u32 {
        let cmd_type = if cmd_len as usize >= CTRL_HDR_SIZE {
            ram.read_u32(cmd_gpa)
        } else {
            None
        };
        let cmd_type = match cmd_type {
            Some(t) => t,
            None => {
                warn!("virtio-gpu: unreadable command header at 0x{cmd_gpa:x} (len {cmd_len})");
                return write_resp_hdr(ram, resp_gpa, resp_len, RESP_ERR_UNSPEC);
            }
        };

        trace!("virtio-gpu: command 0x{cmd_type:04x}");

        let result = match cmd_type {
            CMD_GET_DISPLAY_INFO => return self.get_display_info(ram, resp_gpa, resp_len),
            CMD_RESOURCE_CREATE_2D => self.resource_create_2d(ram, cmd_gpa),
            CMD_SET_SCANOUT => self.set_scanout(ram, cmd_gpa),
            CMD_RESOURCE_FLUSH => self.resource_flush(ram, cmd_gpa),
            CMD_TRANSFER_TO_HOST_2D => self.transfer_to_host_2d(ram, cmd_gpa),
            CMD_RESOURCE_ATTACH_BACKING => self.attach_backing(ram, cmd_gpa),
            other => {
                warn!("virtio-gpu: unknown command 0x{other:04x}");
                None
            }
        };

        match result {
            Some(()) => write_resp_hdr(ram, resp_gpa, resp_len, RESP_OK_NODATA),
            None => write_resp_hdr(ram, resp_gpa, resp_len, RESP_ERR_UNSPEC),
        }
    }

    /// GET_DISPLAY_INFO: header + 16 display entries. Only entry 0 (the
    /// single scanout) is enabled.
    fn get_display_info(&self, ram: &mut GuestRam, resp_gpa: u64, resp_len: u32) -> u32 {
        let mut resp = [0u8; CTRL_HDR_SIZE + MAX_DISPLAYS * DISPLAY_ENTRY_SIZE];
        resp[0..4].copy_from_slice(&RESP_OK_DISPLAY_INFO.to_le_bytes());

        // entry 0: { x, y, width, height, enabled, flags }
        let entry = &mut resp[CTRL_HDR_SIZE..CTRL_HDR_SIZE + DISPLAY_ENTRY_SIZE];
        entry[8..12].copy_from_slice(&SCANOUT_WIDTH.to_le_bytes());
        entry[12..16].copy_from_slice(&SCANOUT_HEIGHT.to_le_bytes());
        entry[16..20].copy_from_slice(&1u32.to_le_bytes());

        let n = resp.len().min(resp_len as usize);
        match ram.get_mut(resp_gpa, n) {
            Some(dst) if n > 0 => {
                dst.copy_from_slice(&resp[..n]);
                n as u32
            }
            _ => {
                warn!("virtio-gpu: display info response buffer 0x{resp_gpa:x} unreachable");
                0
            }
        }
    }

    /// RESOURCE_CREATE_2D: upsert the resource and size the host
    /// framebuffer to match when the dimensions are sane.
    fn resource_create_2d(&mut self, ram: &GuestRam, cmd_gpa: u64) -> Option<()> {
        let id = ram.read_u32(cmd_gpa + 24)?;
        let format = ram.read_u32(cmd_gpa + 28)?;
        let width = ram.read_u32(cmd_gpa + 32)?;
        let height = ram.read_u32(cmd_gpa + 36)?;

        debug!("virtio-gpu: create resource {id} {width}x{height} format {format}");
        self.resources.insert(
            id,
            GpuResource {
                format,
                width,
                height,
                backing_gpa: 0,
                backing_len: 0,
            },
        );

        if (1..=MAX_RESOURCE_DIM).contains(&width) && (1..=MAX_RESOURCE_DIM).contains(&height) {
            self.fb = vec![0u8; width as usize * height as usize * 4];
            self.fb_width = width;
            self.fb_height = height;
        } else {
            warn!("virtio-gpu: resource {id} dimensions {width}x{height} out of range, framebuffer unchanged");
        }
        Some(())
    }

    /// RESOURCE_ATTACH_BACKING: record the first scatter entry as the
    /// resource's linear backing.
    fn attach_backing(&mut self, ram: &GuestRam, cmd_gpa: u64) -> Option<()> {
        let id = ram.read_u32(cmd_gpa + 24)?;
        let nr_entries = ram.read_u32(cmd_gpa + 28)?;
        if nr_entries == 0 {
            warn!("virtio-gpu: ATTACH_BACKING for resource {id} with no entries");
            return Some(());
        }
        let addr = ram.read_u64(cmd_gpa + 32)?;
        let len = ram.read_u32(cmd_gpa + 40)?;
        if nr_entries > 1 {
            debug!("virtio-gpu: resource {id} has {nr_entries} backing entries, using the first");
        }

        match self.resources.get_mut(&id) {
            Some(res) => {
                res.backing_gpa = addr;
                res.backing_len = len;
                debug!("virtio-gpu: resource {id} backed by 0x{addr:x} (+{len})");
            }
            None => warn!("virtio-gpu: ATTACH_BACKING for unknown resource {id}"),
        }
        Some(())
    }

    /// SET_SCANOUT: bind the scanout to a resource. No geometry check.
    fn set_scanout(&mut self, ram: &GuestRam, cmd_gpa: u64) -> Option<()> {
        let scanout_id = ram.read_u32(cmd_gpa + 40)?;
        let resource_id = ram.read_u32(cmd_gpa + 44)?;
        debug!("virtio-gpu: scanout {scanout_id} shows resource {resource_id}");
        self.scanout_resource = resource_id;
        Some(())
    }

    /// TRANSFER_TO_HOST_2D: copy a sub-rectangle from the resource backing
    /// into the host framebuffer, clipping per pixel. The `offset` field is
    /// ignored: backings are linear, base-of-resource layouts here.
    fn transfer_to_host_2d(&mut self, ram: &GuestRam, cmd_gpa: u64) -> Option<()> {
        let x = ram.read_u32(cmd_gpa + 24)? as u64;
        let y = ram.read_u32(cmd_gpa + 28)? as u64;
        let w = ram.read_u32(cmd_gpa + 32)? as u64;
        let h = ram.read_u32(cmd_gpa + 36)? as u64;
        let _offset = ram.read_u64(cmd_gpa + 40)?;
        let id = ram.read_u32(cmd_gpa + 48)?;

        let res = match self.resources.get(&id) {
            Some(res) => *res,
            None => {
                warn!("virtio-gpu: TRANSFER_TO_HOST_2D for unknown resource {id}");
                return Some(());
            }
        };
        if res.backing_gpa == 0 || res.backing_len == 0 {
            warn!("virtio-gpu: resource {id} has no backing, transfer skipped");
            return Some(());
        }
        let src = match ram.get(res.backing_gpa, res.backing_len as usize) {
            Some(src) => src,
            None => {
                warn!(
                    "virtio-gpu: resource {id} backing 0x{:x} not in guest RAM",
                    res.backing_gpa
                );
                return Some(());
            }
        };

        trace!(
            "virtio-gpu: transfer {w}x{h}+{x}+{y} from resource {id} (format {})",
            res.format
        );

        let src_pitch = res.width as u64 * 4;
        let dst_pitch = self.fb_width as u64 * 4;
        for row in 0..h {
            let py = y + row;
            if py >= res.height as u64 {
                continue;
            }
            for col in 0..w {
                let px = x + col;
                if px >= res.width as u64 {
                    continue;
                }
                let src_off = (py * src_pitch + px * 4) as usize;
                let dst_off = (py * dst_pitch + px * 4) as usize;
                if src_off + 4 > src.len() || dst_off + 4 > self.fb.len() {
                    continue;
                }
                self.fb[dst_off..dst_off + 4].copy_from_slice(&src[src_off..src_off + 4]);
            }
        }
        Some(())
    }

    /// RESOURCE_FLUSH: snapshot the framebuffer to `<prefix>-<n>.ppm`.
    /// A failed write is logged but never fails the command.
    fn resource_flush(&mut self, ram: &GuestRam, cmd_gpa: u64) -> Option<()> {
        let id = ram.read_u32(cmd_gpa + 40)?;
        self.flush_count += 1;

        if id != self.scanout_resource {
            debug!(
                "virtio-gpu: flush for resource {id}, scanout shows {}",
                self.scanout_resource
            );
        }
        if self.fb_width == 0 || self.fb_height == 0 {
            warn!("virtio-gpu: RESOURCE_FLUSH for resource {id} with no framebuffer");
            return Some(());
        }

        let path = PathBuf::from(format!(
            "{}-{}.ppm",
            self.output_prefix.display(),
            self.flush_count
        ));
        match self.write_ppm(&path) {
            Ok(()) => debug!(
                "virtio-gpu: flush {} wrote {}x{} snapshot to {}",
                self.flush_count,
                self.fb_width,
                self.fb_height,
                path.display()
            ),
            Err(e) => warn!("virtio-gpu: failed to write {}: {e}", path.display()),
        }
        Some(())
    }

    /// Serialize the framebuffer as binary PPM (P6). Pixels are BGRX in
    /// memory and RGB on disk.
    fn write_ppm(&self, path: &Path) -> std::io::Result<()> {
        let mut out = Vec::with_capacity(32 + self.fb.len() / 4 * 3);
        out.extend_from_slice(format!("P6\n{} {}\n255\n", self.fb_width, self.fb_height).as_bytes());
        for px in self.fb.chunks_exact(4) {
            out.extend_from_slice(&[px[2], px[1], px[0]]);
        }
        std::fs::write(path, out)
    }
}

/// Write a 24-byte response header carrying `code`, clipped to the guest's
/// response buffer. Returns the number of bytes written.
fn write_resp_hdr(ram: &mut GuestRam, resp_gpa: u64, resp_len: u32, code: u32) -> u32 {
    let n = (resp_len as usize).min(CTRL_HDR_SIZE);
    if n == 0 {
        return 0;
    }
    let mut hdr = [0u8; CTRL_HDR_SIZE];
    hdr[0..4].copy_from_slice(&code.to_le_bytes());
    match ram.get_mut(resp_gpa, n) {
        Some(dst) => {
            dst.copy_from_slice(&hdr[..n]);
            n as u32
        }
        None => {
            warn!("virtio-gpu: response buffer 0x{resp_gpa:x} not in guest RAM");
            0
        }
    }
}

/// Virtio-GPU device: MMIO register file plus the GPU state behind it.
pub struct VirtioGpuDevice {
    device_features_sel: u32,
    driver_features: u64,
    driver_features_sel: u32,
    queue_sel: u32,
    queues: [VirtqState; NUM_QUEUES],
    status: u32,
    interrupt_status: u32,
    state: GpuState,
}

impl VirtioGpuDevice {
    pub fn new(output_prefix: PathBuf) -> Self {
        VirtioGpuDevice {
            device_features_sel: 0,
            driver_features: 0,
            driver_features_sel: 0,
            queue_sel: 0,
            queues: [VirtqState::new(QUEUE_NUM_MAX), VirtqState::new(QUEUE_NUM_MAX)],
            status: 0,
            interrupt_status: 0,
            state: GpuState::new(output_prefix),
        }
    }

    /// Number of RESOURCE_FLUSH commands processed so far.
    pub fn flush_count(&self) -> u64 {
        self.state.flush_count
    }

    /// Handle an MMIO read at `offset` within the device's MMIO region.
    pub fn mmio_read(&self, offset: u64) -> u32 {
        match offset {
            REG_MAGIC_VALUE => VIRTIO_MMIO_MAGIC,
            REG_VERSION => VIRTIO_MMIO_VERSION,
            REG_DEVICE_ID => VIRTIO_ID_GPU,
            REG_VENDOR_ID => VIRTIO_MMIO_VENDOR,
            REG_DEVICE_FEATURES => {
                // no feature bits beyond the modern transport baseline
                let features: u64 = 0;
                if self.device_features_sel == 0 {
                    (features & 0xFFFFFFFF) as u32
                } else {
                    ((features >> 32) & 0xFFFFFFFF) as u32
                }
            }
            REG_QUEUE_NUM_MAX => {
                if (self.queue_sel as usize) < NUM_QUEUES {
                    self.queues[self.queue_sel as usize].num_max
                } else {
                    0
                }
            }
            REG_QUEUE_READY => {
                if (self.queue_sel as usize) < NUM_QUEUES {
                    self.queues[self.queue_sel as usize].ready as u32
                } else {
                    0
                }
            }
            REG_INTERRUPT_STATUS => self.interrupt_status,
            REG_STATUS => self.status,
            REG_CONFIG_GENERATION => 0,
            o if (REG_CONFIG_BASE..REG_CONFIG_BASE + CONFIG_SIZE).contains(&o) => {
                // config: { events_read, events_clear, num_scanouts, .. }
                match o - REG_CONFIG_BASE {
                    0x8 => 1, // num_scanouts
                    _ => 0,
                }
            }
            _ => 0,
        }
    }

    /// Handle an MMIO write at `offset` within the device's MMIO region.
    /// Returns Some(queue_index) if QueueNotify was written.
    pub fn mmio_write(&mut self, offset: u64, value: u32) -> Option<u32> {
        match offset {
            REG_DEVICE_FEATURES_SEL => {
                self.device_features_sel = value;
            }
            REG_DRIVER_FEATURES => {
                // accepted and otherwise ignored; the device offers none
                if self.driver_features_sel == 0 {
                    self.driver_features =
                        (self.driver_features & 0xFFFFFFFF00000000) | value as u64;
                } else {
                    self.driver_features =
                        (self.driver_features & 0x00000000FFFFFFFF) | ((value as u64) << 32);
                }
            }
            REG_DRIVER_FEATURES_SEL => {
                self.driver_features_sel = value;
            }
            REG_QUEUE_SEL => {
                self.queue_sel = value;
            }
            REG_QUEUE_NUM => {
                if (self.queue_sel as usize) < NUM_QUEUES {
                    self.queues[self.queue_sel as usize].num = value;
                }
            }
            REG_QUEUE_READY => {
                if (self.queue_sel as usize) < NUM_QUEUES {
                    self.queues[self.queue_sel as usize].ready = value != 0;
                }
            }
            REG_QUEUE_NOTIFY => {
                return Some(value);
            }
            REG_INTERRUPT_ACK => {
                self.interrupt_status &= !value;
            }
            REG_STATUS => {
                self.status = value;
                if value == 0 {
                    self.reset();
                }
            }
            REG_QUEUE_DESC_LOW => {
                if (self.queue_sel as usize) < NUM_QUEUES {
                    let q = &mut self.queues[self.queue_sel as usize];
                    q.desc_addr = (q.desc_addr & 0xFFFFFFFF00000000) | value as u64;
                }
            }
            REG_QUEUE_DESC_HIGH => {
                if (self.queue_sel as usize) < NUM_QUEUES {
                    let q = &mut self.queues[self.queue_sel as usize];
                    q.desc_addr = (q.desc_addr & 0x00000000FFFFFFFF) | ((value as u64) << 32);
                }
            }
            REG_QUEUE_DRIVER_LOW => {
                if (self.queue_sel as usize) < NUM_QUEUES {
                    let q = &mut self.queues[self.queue_sel as usize];
                    q.avail_addr = (q.avail_addr & 0xFFFFFFFF00000000) | value as u64;
                }
            }
            REG_QUEUE_DRIVER_HIGH => {
                if (self.queue_sel as usize) < NUM_QUEUES {
                    let q = &mut self.queues[self.queue_sel as usize];
                    q.avail_addr = (q.avail_addr & 0x00000000FFFFFFFF) | ((value as u64) << 32);
                }
            }
            REG_QUEUE_DEVICE_LOW => {
                if (self.queue_sel as usize) < NUM_QUEUES {
                    let q = &mut self.queues[self.queue_sel as usize];
                    q.used_addr = (q.used_addr & 0xFFFFFFFF00000000) | value as u64;
                }
            }
            REG_QUEUE_DEVICE_HIGH => {
                if (self.queue_sel as usize) < NUM_QUEUES {
                    let q = &mut self.queues[self.queue_sel as usize];
                    q.used_addr = (q.used_addr & 0x00000000FFFFFFFF) | ((value as u64) << 32);
                }
            }
            _ => {}
        }
        None
    }

    /// Status write of 0: back to the freshly-initialized state. Queues and
    /// resources are dropped; the host framebuffer survives until the next
    /// RESOURCE_CREATE_2D re-initializes it.
    fn reset(&mut self) {
        debug!("virtio-gpu: device reset");
        self.status = 0;
        self.interrupt_status = 0;
        self.driver_features = 0;
        for q in &mut self.queues {
            *q = VirtqState::new(QUEUE_NUM_MAX);
        }
        self.state.clear();
    }

    /// Drain the notified queue: walk each new avail entry's descriptor
    /// chain, run the command, and publish a used-ring entry for it.
    /// Returns true if any chain was processed.
    pub fn process_queue(&mut self, queue: u32, ram: &mut GuestRam) -> bool {
        if queue as usize >= NUM_QUEUES {
            debug!("virtio-gpu: notify for queue {queue} out of range");
            return false;
        }
        let q = self.queues[queue as usize].clone();
        if !q.ready || q.num == 0 {
            return false;
        }

        let avail_idx = match read_avail_idx(ram, q.avail_addr) {
            Some(idx) => idx,
            None => return false,
        };

        let mut last_avail = q.last_avail_idx;
        let mut used_idx = read_used_idx(ram, q.used_addr).unwrap_or(0);
        let mut processed = false;

        while last_avail != avail_idx {
            let head = match read_avail_ring(ram, q.avail_addr, last_avail, q.num) {
                Some(head) => head,
                None => break,
            };

            let (cmd, resp) = collect_chain(ram, &q, head);
            let (resp_gpa, resp_len) = resp.unwrap_or((0, 0));
            let written = match cmd {
                Some((cmd_gpa, cmd_len)) => {
                    self.state
                        .handle_command(ram, cmd_gpa, cmd_len, resp_gpa, resp_len)
                }
                None => {
                    warn!("virtio-gpu: chain {head} has no device-readable descriptor");
                    0
                }
            };

            write_used_elem(ram, q.used_addr, used_idx, q.num, head as u32, written);
            used_idx = used_idx.wrapping_add(1);
            // publish idx only after the slot it indexes is in place
            write_used_idx(ram, q.used_addr, used_idx);

            last_avail = last_avail.wrapping_add(1);
            processed = true;
        }

        self.queues[queue as usize].last_avail_idx = last_avail;

        if processed {
            self.interrupt_status |= 1;
        }
        processed
    }
}

/// Walk a descriptor chain and pick out the command buffer (first
/// device-readable descriptor) and the response buffer (first
/// device-writable one). The walk is bounded by the ring size, so a cyclic
/// chain terminates.
fn collect_chain(
    ram: &GuestRam,
    q: &VirtqState,
    head: u16,
) -> (Option<(u64, u32)>, Option<(u64, u32)>) {
    let mut cmd = None;
    let mut resp = None;
    let mut idx = head;
    for _ in 0..q.num {
        let (addr, len, flags, next) = match read_descriptor(ram, q.desc_addr, idx) {
            Some(desc) => desc,
            None => break,
        };
        if flags & VIRTQ_DESC_F_WRITE == 0 {
            if cmd.is_none() {
                cmd = Some((addr, len));
            }
        } else if resp.is_none() {
            resp = Some((addr, len));
        }
        if flags & VIRTQ_DESC_F_NEXT == 0 {
            break;
        }
        idx = next;
    }
    (cmd, resp)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAM_BASE: u64 = 0x7000_0000;
    const RAM_SIZE: usize = 1 << 20;

    const DESC_GPA: u64 = RAM_BASE + 0x1000;
    const AVAIL_GPA: u64 = RAM_BASE + 0x2000;
    const USED_GPA: u64 = RAM_BASE + 0x3000;
    const CMD_GPA: u64 = RAM_BASE + 0x4000;
    const RESP_GPA: u64 = RAM_BASE + 0x5000;
    const BACKING_GPA: u64 = RAM_BASE + 0x8000;

    const QUEUE_SIZE: u32 = 16;

    fn test_ram() -> GuestRam {
        GuestRam::new(RAM_BASE, RAM_SIZE).unwrap()
    }

    fn test_prefix(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("easel-{tag}-{}", std::process::id()))
    }

    /// Run the driver's reset → features → queue setup → DRIVER_OK dance
    /// on queue 0.
    fn ready_device(prefix: PathBuf) -> VirtioGpuDevice {
        let mut gpu = VirtioGpuDevice::new(prefix);
        gpu.mmio_write(REG_STATUS, 0);
        gpu.mmio_write(REG_STATUS, 1); // ACKNOWLEDGE
        gpu.mmio_write(REG_STATUS, 3); // | DRIVER
        gpu.mmio_write(REG_DEVICE_FEATURES_SEL, 0);
        assert_eq!(gpu.mmio_read(REG_DEVICE_FEATURES), 0);
        gpu.mmio_write(REG_DRIVER_FEATURES_SEL, 0);
        gpu.mmio_write(REG_DRIVER_FEATURES, 0);
        gpu.mmio_write(REG_STATUS, 11); // | FEATURES_OK
        setup_queue(&mut gpu, 0);
        gpu.mmio_write(REG_STATUS, 15); // | DRIVER_OK
        gpu
    }

    fn setup_queue(gpu: &mut VirtioGpuDevice, queue: u32) {
        gpu.mmio_write(REG_QUEUE_SEL, queue);
        assert_eq!(gpu.mmio_read(REG_QUEUE_NUM_MAX), 256);
        gpu.mmio_write(REG_QUEUE_NUM, QUEUE_SIZE);
        gpu.mmio_write(REG_QUEUE_DESC_LOW, DESC_GPA as u32);
        gpu.mmio_write(REG_QUEUE_DESC_HIGH, (DESC_GPA >> 32) as u32);
        gpu.mmio_write(REG_QUEUE_DRIVER_LOW, AVAIL_GPA as u32);
        gpu.mmio_write(REG_QUEUE_DRIVER_HIGH, (AVAIL_GPA >> 32) as u32);
        gpu.mmio_write(REG_QUEUE_DEVICE_LOW, USED_GPA as u32);
        gpu.mmio_write(REG_QUEUE_DEVICE_HIGH, (USED_GPA >> 32) as u32);
        gpu.mmio_write(REG_QUEUE_READY, 1);
    }

    fn write_desc(ram: &mut GuestRam, idx: u16, addr: u64, len: u32, flags: u16, next: u16) {
        let entry = ram.get_mut(DESC_GPA + idx as u64 * 16, 16).unwrap();
        entry[0..8].copy_from_slice(&addr.to_le_bytes());
        entry[8..12].copy_from_slice(&len.to_le_bytes());
        entry[12..14].copy_from_slice(&flags.to_le_bytes());
        entry[14..16].copy_from_slice(&next.to_le_bytes());
    }

    /// Queue one command chain in avail slot `slot` using descriptors
    /// 2*slot (command) and 2*slot+1 (response), then bump avail.idx.
    fn push_command(ram: &mut GuestRam, slot: u16, cmd: &[u8], resp_len: u32) {
        let cmd_gpa = CMD_GPA + slot as u64 * 0x100;
        let resp_gpa = RESP_GPA + slot as u64 * 0x200;
        ram.get_mut(cmd_gpa, cmd.len()).unwrap().copy_from_slice(cmd);
        ram.get_mut(resp_gpa, resp_len as usize).unwrap().fill(0);

        let head = slot * 2;
        write_desc(ram, head, cmd_gpa, cmd.len() as u32, VIRTQ_DESC_F_NEXT, head + 1);
        write_desc(ram, head + 1, resp_gpa, resp_len, VIRTQ_DESC_F_WRITE, 0);

        ram.write_u16(AVAIL_GPA + 4 + (slot % QUEUE_SIZE as u16) as u64 * 2, head)
            .unwrap();
        ram.write_u16(AVAIL_GPA + 2, slot + 1).unwrap();
    }

    fn notify(gpu: &mut VirtioGpuDevice, ram: &mut GuestRam) {
        let queue = gpu.mmio_write(REG_QUEUE_NOTIFY, 0).expect("notify returns queue");
        gpu.process_queue(queue, ram);
    }

    fn resp_bytes(ram: &GuestRam, slot: u16, len: usize) -> Vec<u8> {
        ram.get(RESP_GPA + slot as u64 * 0x200, len).unwrap().to_vec()
    }

    fn hdr(cmd_type: u32) -> Vec<u8> {
        let mut cmd = vec![0u8; CTRL_HDR_SIZE];
        cmd[0..4].copy_from_slice(&cmd_type.to_le_bytes());
        cmd
    }

    fn create_2d(id: u32, format: u32, width: u32, height: u32) -> Vec<u8> {
        let mut cmd = hdr(CMD_RESOURCE_CREATE_2D);
        cmd.extend_from_slice(&id.to_le_bytes());
        cmd.extend_from_slice(&format.to_le_bytes());
        cmd.extend_from_slice(&width.to_le_bytes());
        cmd.extend_from_slice(&height.to_le_bytes());
        cmd
    }

    fn attach_backing(id: u32, addr: u64, len: u32) -> Vec<u8> {
        let mut cmd = hdr(CMD_RESOURCE_ATTACH_BACKING);
        cmd.extend_from_slice(&id.to_le_bytes());
        cmd.extend_from_slice(&1u32.to_le_bytes()); // nr_entries
        cmd.extend_from_slice(&addr.to_le_bytes());
        cmd.extend_from_slice(&len.to_le_bytes());
        cmd.extend_from_slice(&0u32.to_le_bytes()); // padding
        cmd
    }

    fn rect_cmd(cmd_type: u32, x: u32, y: u32, w: u32, h: u32) -> Vec<u8> {
        let mut cmd = hdr(cmd_type);
        cmd.extend_from_slice(&x.to_le_bytes());
        cmd.extend_from_slice(&y.to_le_bytes());
        cmd.extend_from_slice(&w.to_le_bytes());
        cmd.extend_from_slice(&h.to_le_bytes());
        cmd
    }

    fn transfer_to_host(id: u32, x: u32, y: u32, w: u32, h: u32) -> Vec<u8> {
        let mut cmd = rect_cmd(CMD_TRANSFER_TO_HOST_2D, x, y, w, h);
        cmd.extend_from_slice(&0u64.to_le_bytes()); // offset
        cmd.extend_from_slice(&id.to_le_bytes());
        cmd.extend_from_slice(&0u32.to_le_bytes()); // padding
        cmd
    }

    fn resource_flush(id: u32, w: u32, h: u32) -> Vec<u8> {
        let mut cmd = rect_cmd(CMD_RESOURCE_FLUSH, 0, 0, w, h);
        cmd.extend_from_slice(&id.to_le_bytes());
        cmd.extend_from_slice(&0u32.to_le_bytes()); // padding
        cmd
    }

    #[test]
    fn test_magic_and_ids() {
        let gpu = VirtioGpuDevice::new(test_prefix("ids"));
        assert_eq!(gpu.mmio_read(REG_MAGIC_VALUE), 0x74726976);
        assert_eq!(gpu.mmio_read(REG_VERSION), 2);
        assert_eq!(gpu.mmio_read(REG_DEVICE_ID), 16);
        assert_eq!(gpu.mmio_read(REG_VENDOR_ID), 0x554D4551);
    }

    #[test]
    fn test_config_space() {
        let gpu = VirtioGpuDevice::new(test_prefix("cfg"));
        assert_eq!(gpu.mmio_read(REG_CONFIG_BASE), 0); // events_read
        assert_eq!(gpu.mmio_read(REG_CONFIG_BASE + 0x4), 0); // events_clear
        assert_eq!(gpu.mmio_read(REG_CONFIG_BASE + 0x8), 1); // num_scanouts
        assert_eq!(gpu.mmio_read(REG_CONFIG_BASE + 0xC), 0);
    }

    #[test]
    fn test_device_features_read_zero_in_both_banks() {
        let mut gpu = VirtioGpuDevice::new(test_prefix("feat"));
        gpu.mmio_write(REG_DEVICE_FEATURES_SEL, 0);
        assert_eq!(gpu.mmio_read(REG_DEVICE_FEATURES), 0);
        gpu.mmio_write(REG_DEVICE_FEATURES_SEL, 1);
        assert_eq!(gpu.mmio_read(REG_DEVICE_FEATURES), 0);
    }

    #[test]
    fn test_get_display_info() {
        let mut ram = test_ram();
        let mut gpu = ready_device(test_prefix("dinfo"));

        push_command(&mut ram, 0, &hdr(CMD_GET_DISPLAY_INFO), 408);
        notify(&mut gpu, &mut ram);

        // used ring: head index published, idx advanced
        assert_eq!(read_used_idx(&ram, USED_GPA), Some(1));
        assert_eq!(ram.read_u32(USED_GPA + 4), Some(0)); // head desc index
        assert_eq!(ram.read_u32(USED_GPA + 8), Some(408)); // bytes written

        let resp = resp_bytes(&ram, 0, 408);
        assert_eq!(&resp[0..4], &RESP_OK_DISPLAY_INFO.to_le_bytes());
        assert_eq!(&resp[24..28], &0u32.to_le_bytes()); // x
        assert_eq!(&resp[28..32], &0u32.to_le_bytes()); // y
        assert_eq!(&resp[32..36], &800u32.to_le_bytes()); // width
        assert_eq!(&resp[36..40], &600u32.to_le_bytes()); // height
        assert_eq!(&resp[40..44], &1u32.to_le_bytes()); // enabled
        // entries 1..15 all zero
        assert!(resp[48..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_resource_create_allocates_framebuffer() {
        let mut ram = test_ram();
        let mut gpu = ready_device(test_prefix("create"));

        push_command(&mut ram, 0, &create_2d(1, 2, 640, 480), 24);
        notify(&mut gpu, &mut ram);

        assert_eq!(&resp_bytes(&ram, 0, 4), &RESP_OK_NODATA.to_le_bytes());
        assert!(gpu.state.resources.contains_key(&1));
        assert_eq!(gpu.state.fb.len(), 640 * 480 * 4);
        assert_eq!((gpu.state.fb_width, gpu.state.fb_height), (640, 480));
    }

    #[test]
    fn test_oversized_resource_leaves_framebuffer() {
        let mut ram = test_ram();
        let mut gpu = ready_device(test_prefix("big"));

        push_command(&mut ram, 0, &create_2d(1, 2, 4, 4), 24);
        notify(&mut gpu, &mut ram);
        push_command(&mut ram, 1, &create_2d(2, 2, 5000, 16), 24);
        notify(&mut gpu, &mut ram);

        // second create is recorded but the framebuffer keeps its shape
        assert!(gpu.state.resources.contains_key(&2));
        assert_eq!((gpu.state.fb_width, gpu.state.fb_height), (4, 4));
        assert_eq!(&resp_bytes(&ram, 1, 4), &RESP_OK_NODATA.to_le_bytes());
    }

    #[test]
    fn test_transfer_and_flush_round_trip() {
        let mut ram = test_ram();
        let prefix = test_prefix("roundtrip");
        let mut gpu = ready_device(prefix.clone());

        // 2x1 BGRX resource backed by a known byte pattern
        let pattern = [0x11u8, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88];
        ram.get_mut(BACKING_GPA, 8).unwrap().copy_from_slice(&pattern);

        push_command(&mut ram, 0, &create_2d(1, 2, 2, 1), 24);
        notify(&mut gpu, &mut ram);
        push_command(&mut ram, 1, &attach_backing(1, BACKING_GPA, 8), 24);
        notify(&mut gpu, &mut ram);
        push_command(&mut ram, 2, &transfer_to_host(1, 0, 0, 2, 1), 24);
        notify(&mut gpu, &mut ram);
        push_command(&mut ram, 3, &resource_flush(1, 2, 1), 24);
        notify(&mut gpu, &mut ram);

        assert_eq!(gpu.flush_count(), 1);

        let path = PathBuf::from(format!("{}-1.ppm", prefix.display()));
        let ppm = std::fs::read(&path).expect("flush wrote a snapshot");
        std::fs::remove_file(&path).ok();

        let header = b"P6\n2 1\n255\n";
        assert_eq!(&ppm[..header.len()], header);
        // BGRX -> RGB swizzle of the pattern
        assert_eq!(&ppm[header.len()..], &[0x33, 0x22, 0x11, 0x77, 0x66, 0x55]);
    }

    #[test]
    fn test_transfer_clips_to_resource_and_framebuffer() {
        let mut ram = test_ram();
        let mut gpu = ready_device(test_prefix("clip"));

        // 2x2 resource, backing fully lit
        ram.get_mut(BACKING_GPA, 16).unwrap().fill(0xFF);
        push_command(&mut ram, 0, &create_2d(1, 2, 2, 2), 24);
        notify(&mut gpu, &mut ram);
        push_command(&mut ram, 1, &attach_backing(1, BACKING_GPA, 16), 24);
        notify(&mut gpu, &mut ram);
        // rect extends past the 2x2 resource on both axes
        push_command(&mut ram, 2, &transfer_to_host(1, 1, 1, 4, 4), 24);
        notify(&mut gpu, &mut ram);

        assert_eq!(&resp_bytes(&ram, 2, 4), &RESP_OK_NODATA.to_le_bytes());
        // only pixel (1,1) was in range
        let fb = &gpu.state.fb;
        assert!(fb[0..4].iter().all(|&b| b == 0));
        assert!(fb[4..8].iter().all(|&b| b == 0));
        assert!(fb[8..12].iter().all(|&b| b == 0));
        assert!(fb[12..16].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_unknown_command_gets_err_unspec() {
        let mut ram = test_ram();
        let mut gpu = ready_device(test_prefix("unknown"));

        // a 3D command on a 2D-only device
        push_command(&mut ram, 0, &hdr(0x0200), 24);
        notify(&mut gpu, &mut ram);

        assert_eq!(&resp_bytes(&ram, 0, 4), &RESP_ERR_UNSPEC.to_le_bytes());
        assert_eq!(ram.read_u32(USED_GPA + 8), Some(24));
    }

    #[test]
    fn test_batch_publishes_used_entries_in_order() {
        let mut ram = test_ram();
        let mut gpu = ready_device(test_prefix("batch"));

        // two chains queued before a single notify
        push_command(&mut ram, 0, &create_2d(1, 2, 4, 4), 24);
        push_command(&mut ram, 1, &hdr(CMD_GET_DISPLAY_INFO), 408);
        notify(&mut gpu, &mut ram);

        assert_eq!(read_used_idx(&ram, USED_GPA), Some(2));
        assert_eq!(ram.read_u32(USED_GPA + 4), Some(0)); // first head
        assert_eq!(ram.read_u32(USED_GPA + 8), Some(24));
        assert_eq!(ram.read_u32(USED_GPA + 12), Some(2)); // second head
        assert_eq!(ram.read_u32(USED_GPA + 16), Some(408));
        assert_eq!(gpu.queues[0].last_avail_idx, 2);

        // re-notifying with no new avail entries publishes nothing
        notify(&mut gpu, &mut ram);
        assert_eq!(read_used_idx(&ram, USED_GPA), Some(2));
    }

    #[test]
    fn test_descriptor_cycle_terminates() {
        let mut ram = test_ram();
        let mut gpu = ready_device(test_prefix("cycle"));

        // desc 0 chains to itself forever
        ram.get_mut(CMD_GPA, CTRL_HDR_SIZE)
            .unwrap()
            .copy_from_slice(&hdr(CMD_GET_DISPLAY_INFO));
        write_desc(&mut ram, 0, CMD_GPA, CTRL_HDR_SIZE as u32, VIRTQ_DESC_F_NEXT, 0);
        ram.write_u16(AVAIL_GPA + 4, 0).unwrap();
        ram.write_u16(AVAIL_GPA + 2, 1).unwrap();

        notify(&mut gpu, &mut ram);

        // chain had no writable descriptor: a zero-length used entry
        assert_eq!(read_used_idx(&ram, USED_GPA), Some(1));
        assert_eq!(ram.read_u32(USED_GPA + 8), Some(0));
    }

    #[test]
    fn test_notify_ignored_until_ready() {
        let mut ram = test_ram();
        let mut gpu = VirtioGpuDevice::new(test_prefix("notready"));
        setup_queue(&mut gpu, 0);
        gpu.mmio_write(REG_QUEUE_SEL, 0);
        gpu.mmio_write(REG_QUEUE_READY, 0);

        push_command(&mut ram, 0, &hdr(CMD_GET_DISPLAY_INFO), 408);
        assert!(!gpu.process_queue(0, &mut ram));
        assert_eq!(read_used_idx(&ram, USED_GPA), Some(0));

        // out-of-range queue index is dropped too
        assert!(!gpu.process_queue(7, &mut ram));
    }

    #[test]
    fn test_attach_backing_unknown_resource_still_ok() {
        let mut ram = test_ram();
        let mut gpu = ready_device(test_prefix("orphan"));

        push_command(&mut ram, 0, &attach_backing(42, BACKING_GPA, 16), 24);
        notify(&mut gpu, &mut ram);

        assert_eq!(&resp_bytes(&ram, 0, 4), &RESP_OK_NODATA.to_le_bytes());
        assert!(gpu.state.resources.is_empty());
    }

    #[test]
    fn test_reset_clears_queues_and_resources() {
        let mut ram = test_ram();
        let mut gpu = ready_device(test_prefix("reset"));

        push_command(&mut ram, 0, &create_2d(1, 2, 4, 4), 24);
        notify(&mut gpu, &mut ram);
        assert!(!gpu.state.resources.is_empty());
        assert_eq!(gpu.mmio_read(REG_INTERRUPT_STATUS), 1);

        gpu.mmio_write(REG_STATUS, 0);

        for queue in 0..2 {
            gpu.mmio_write(REG_QUEUE_SEL, queue);
            assert_eq!(gpu.mmio_read(REG_QUEUE_READY), 0);
            let q = &gpu.queues[queue as usize];
            assert_eq!(q.num, 0);
            assert_eq!((q.desc_addr, q.avail_addr, q.used_addr), (0, 0, 0));
            assert_eq!(q.last_avail_idx, 0);
        }
        assert!(gpu.state.resources.is_empty());
        assert_eq!(gpu.mmio_read(REG_INTERRUPT_STATUS), 0);

        // the device comes back after a fresh handshake
        gpu.mmio_write(REG_STATUS, 1);
        gpu.mmio_write(REG_STATUS, 3);
        gpu.mmio_write(REG_STATUS, 11);
        setup_queue(&mut gpu, 0);
        gpu.mmio_write(REG_STATUS, 15);

        // ring indices in guest memory carry over from before the reset;
        // the fresh queue state starts at last_avail 0 and replays them
        push_command(&mut ram, 1, &hdr(CMD_GET_DISPLAY_INFO), 408);
        notify(&mut gpu, &mut ram);
        let resp = resp_bytes(&ram, 1, 4);
        assert_eq!(&resp, &RESP_OK_DISPLAY_INFO.to_le_bytes());
    }

    #[test]
    fn test_interrupt_ack_clears_status() {
        let mut ram = test_ram();
        let mut gpu = ready_device(test_prefix("ack"));

        push_command(&mut ram, 0, &hdr(CMD_GET_DISPLAY_INFO), 408);
        notify(&mut gpu, &mut ram);
        assert_eq!(gpu.mmio_read(REG_INTERRUPT_STATUS), 1);
        gpu.mmio_write(REG_INTERRUPT_ACK, 1);
        assert_eq!(gpu.mmio_read(REG_INTERRUPT_STATUS), 0);
    }

    #[test]
    fn test_flush_counter_tracks_flushes() {
        let mut ram = test_ram();
        let prefix = test_prefix("count");
        let mut gpu = ready_device(prefix.clone());

        push_command(&mut ram, 0, &create_2d(1, 2, 2, 2), 24);
        notify(&mut gpu, &mut ram);
        for slot in 1..4 {
            push_command(&mut ram, slot, &resource_flush(1, 2, 2), 24);
            notify(&mut gpu, &mut ram);
        }
        assert_eq!(gpu.flush_count(), 3);

        for n in 1..4 {
            let path = PathBuf::from(format!("{}-{n}.ppm", prefix.display()));
            assert!(path.exists());
            std::fs::remove_file(&path).ok();
        }
    }
}
