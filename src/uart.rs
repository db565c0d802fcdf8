//! PL011 UART emulation, transmit-only.
//!
//! The guest kernel in this system writes characters to the data register
//! and never polls status, so only DR is meaningful: a 32-bit store emits
//! its low byte on the host side, and every load reads 0.

use log::trace;
use std::io::{self, Write};

/// Register offsets within the 4 KiB PL011 region.
mod reg {
    pub const DR: u64 = 0x000; // Data Register
}

pub struct Pl011 {
    output: Box<dyn Write + Send>,
}

impl Pl011 {
    /// Create a UART that transmits to the host's stdout.
    pub fn new() -> Self {
        Self::with_output(Box::new(io::stdout()))
    }

    /// Create a UART with a custom transmit sink.
    pub fn with_output(output: Box<dyn Write + Send>) -> Self {
        Pl011 { output }
    }

    /// Handle a load from `offset` within the region. Always 0: the guest
    /// driver does not poll flags or status.
    pub fn read(&self, offset: u64) -> u32 {
        trace!("pl011: read offset 0x{offset:x}");
        0
    }

    /// Handle a store to `offset` within the region. Only DR transmits;
    /// stores to every other register are accepted and dropped.
    pub fn write(&mut self, offset: u64, value: u32) {
        if offset == reg::DR {
            let byte = (value & 0xFF) as u8;
            let _ = self.output.write_all(&[byte]);
            let _ = self.output.flush();
        } else {
            trace!("pl011: ignored write of 0x{value:x} to offset 0x{offset:x}");
        }
    }
}

impl Default for Pl011 {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct TestWriter {
        data: Arc<Mutex<Vec<u8>>>,
    }

    impl Write for TestWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.data.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn capture_uart() -> (Pl011, Arc<Mutex<Vec<u8>>>) {
        let data = Arc::new(Mutex::new(Vec::new()));
        let uart = Pl011::with_output(Box::new(TestWriter { data: data.clone() }));
        (uart, data)
    }

    #[test]
    fn test_dr_write_emits_low_byte() {
        let (mut uart, data) = capture_uart();
        uart.write(0, 0x48); // 'H'
        uart.write(0, 0xFFFF_FF69); // 'i', upper bits discarded
        assert_eq!(&*data.lock().unwrap(), b"Hi");
    }

    #[test]
    fn test_other_offsets_are_dropped() {
        let (mut uart, data) = capture_uart();
        uart.write(0x30, 0x301); // CR
        uart.write(0x38, 0x50); // IMSC
        assert!(data.lock().unwrap().is_empty());
    }

    #[test]
    fn test_reads_are_zero() {
        let (uart, _data) = capture_uart();
        assert_eq!(uart.read(0x00), 0);
        assert_eq!(uart.read(0x18), 0); // FR
        assert_eq!(uart.read(0xFE0), 0); // PeriphID0
    }
}
