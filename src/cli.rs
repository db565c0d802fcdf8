use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "easel",
    about = "Run a bare-metal AArch64 kernel and capture its framebuffer",
    long_about = "Boot a flat kernel image in a one-vCPU VM under Hypervisor.framework, \
emulate a PL011 console and a virtio-mmio GPU, and write one PPM snapshot of the guest \
framebuffer per flush"
)]
pub struct Args {
    /// Flat kernel image, loaded byte-for-byte at the base of guest RAM
    pub kernel: PathBuf,

    /// Path prefix for framebuffer snapshots (written as <prefix>-<n>.ppm)
    #[arg(short = 'o', long = "output-prefix", default_value = "frame")]
    pub output_prefix: PathBuf,

    /// Guest memory size in MB
    #[arg(short = 'm', long = "memory", default_value = "512")]
    pub memory: usize,

    /// Verbose output
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}
