mod cli;
mod decode;
#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
mod hypervisor;
mod memory;
mod uart;
mod virtio;
#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
mod vmm;

use anyhow::Result;
use clap::Parser;
use cli::Args;

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
use vmm::run;

// The hypervisor backend needs Hypervisor.framework on Apple Silicon
#[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
fn run(_args: Args) -> Result<()> {
    anyhow::bail!("easel only runs on macOS on Apple Silicon")
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Warn
        })
        .format_timestamp(None)
        .format_target(false)
        .init();

    run(args)
}
