//! 8250 UART serial port emulation, output and input.
//!
//! Extends a stdout-TX-only 8250 model with input: a bounded host-stdin
//! queue feeds RBR, and the LSR data-ready bit and IRQ injection are
//! tied to it, since the guest kernel's console is also its primary
//! input channel.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use crate::devices::SERIAL_COM1_BASE;
use crate::ioport::PortHandler;
use crate::kvm::IrqLine;

/// 8250 UART register offsets
mod regs {
    /// Transmit Holding Register (write) / Receive Buffer Register (read)
    pub const THR_RBR: u16 = 0;
    /// Interrupt Enable Register
    pub const IER: u16 = 1;
    /// Interrupt Identification Register (read) / FIFO Control Register (write)
    pub const IIR_FCR: u16 = 2;
    /// Line Control Register
    pub const LCR: u16 = 3;
    /// Modem Control Register
    pub const MCR: u16 = 4;
    /// Line Status Register
    pub const LSR: u16 = 5;
    /// Modem Status Register
    pub const MSR: u16 = 6;
    /// Scratch Register
    pub const SCR: u16 = 7;
}

/// Line Status Register bits
mod lsr {
    /// Data Ready
    pub const DR: u8 = 0x01;
    /// Transmitter Holding Register Empty
    pub const THRE: u8 = 0x20;
    /// Transmitter Empty
    pub const TEMT: u8 = 0x40;
}

/// Interrupt Identification Register bits
mod iir {
    /// No interrupt pending
    pub const NO_INT: u8 = 0x01;
}

/// Divisor latch value for 9600 baud at the UART's 1.8432 MHz clock.
const DIVISOR_9600_BAUD: u16 = 12;

const RX_QUEUE_CAPACITY: usize = 10_000;

/// 8250 UART serial port at a fixed base port (COM1, 0x3F8).
pub struct Serial {
    ier: u8,
    lcr: u8,
    mcr: u8,
    scr: u8,
    fcr: u8,
    rx_queue: Arc<Mutex<VecDeque<u8>>>,
    irq: Arc<dyn IrqLine>,
    irq_line: u32,
}

impl Serial {
    pub fn new(irq: Arc<dyn IrqLine>, irq_line: u32) -> Self {
        Self {
            ier: 0,
            lcr: 0,
            mcr: 0,
            scr: 0,
            fcr: 0,
            rx_queue: Arc::new(Mutex::new(VecDeque::new())),
            irq,
            irq_line,
        }
    }

    /// A cloneable handle the (out-of-scope) stdin reader thread uses
    /// to forward host keystrokes into the guest's RBR.
    pub fn rx_handle(&self) -> SerialRxHandle {
        SerialRxHandle {
            queue: self.rx_queue.clone(),
            irq: self.irq.clone(),
            irq_line: self.irq_line,
        }
    }

    /// Snapshot fields per the migration record: IER and LCR.
    pub fn snapshot(&self) -> (u8, u8) {
        (self.ier, self.lcr)
    }

    pub fn restore(&mut self, ier: u8, lcr: u8) {
        self.ier = ier;
        self.lcr = lcr;
    }

    fn dlab(&self) -> bool {
        self.lcr & 0x80 != 0
    }

    fn read_reg(&self, offset: u16) -> u8 {
        match offset {
            regs::THR_RBR if self.dlab() => (DIVISOR_9600_BAUD & 0xff) as u8,
            regs::THR_RBR => self.rx_queue.lock().unwrap().pop_front().unwrap_or(0),
            regs::IER if self.dlab() => (DIVISOR_9600_BAUD >> 8) as u8,
            regs::IER => self.ier,
            // Read-to-clear, mirroring the virtio common header's ISR
            // convention. No distinct cause tracking is needed since
            // every injection here is a self-clearing edge pulse.
            regs::IIR_FCR => iir::NO_INT,
            regs::LCR => self.lcr,
            regs::MCR => self.mcr,
            regs::LSR => {
                let data_ready = if self.rx_queue.lock().unwrap().is_empty() {
                    0
                } else {
                    lsr::DR
                };
                lsr::THRE | lsr::TEMT | data_ready
            }
            regs::MSR => 0xb0,
            regs::SCR => self.scr,
            _ => 0,
        }
    }

    fn write_reg(&mut self, offset: u16, value: u8) {
        match offset {
            regs::THR_RBR if self.dlab() => {} // DLL, divisor is fixed at 9600 baud
            regs::THR_RBR => {
                let _ = io::stdout().write_all(&[value]);
                let _ = io::stdout().flush();
            }
            regs::IER if self.dlab() => {} // DLH
            regs::IER => {
                self.ier = value;
                if value != 0 {
                    self.irq.pulse(self.irq_line);
                }
            }
            regs::IIR_FCR => self.fcr = value,
            regs::LCR => self.lcr = value,
            regs::MCR => self.mcr = value,
            regs::SCR => self.scr = value,
            _ => {}
        }
    }
}

/// Feeds host-stdin bytes into a [`Serial`]'s RX queue from whatever
/// thread is pumping stdin. Bounded at [`RX_QUEUE_CAPACITY`]; once
/// full, new bytes are dropped rather than blocking the pump.
pub struct SerialRxHandle {
    queue: Arc<Mutex<VecDeque<u8>>>,
    irq: Arc<dyn IrqLine>,
    irq_line: u32,
}

impl SerialRxHandle {
    pub fn push_byte(&self, byte: u8) {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= RX_QUEUE_CAPACITY {
            return;
        }
        queue.push_back(byte);
        drop(queue);
        self.irq.pulse(self.irq_line);
    }
}

impl PortHandler for Serial {
    fn io_in(&mut self, port: u16, data: &mut [u8]) {
        if data.len() == 1 {
            data[0] = self.read_reg(port - SERIAL_COM1_BASE);
        }
    }

    fn io_out(&mut self, port: u16, data: &[u8]) {
        if data.len() == 1 {
            self.write_reg(port - SERIAL_COM1_BASE, data[0]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct FakeIrq {
        pulses: AtomicU32,
    }

    impl IrqLine for FakeIrq {
        fn pulse(&self, _irq: u32) {
            self.pulses.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn test_serial() -> Serial {
        Serial::new(Arc::new(FakeIrq::default()), 4)
    }

    #[test]
    fn test_lsr_no_data_by_default() {
        let serial = test_serial();
        assert_eq!(serial.read_reg(regs::LSR) & lsr::DR, 0);
    }

    #[test]
    fn test_rx_handle_sets_data_ready_and_drains_in_order() {
        let serial = test_serial();
        let rx = serial.rx_handle();
        rx.push_byte(b'h');
        rx.push_byte(b'i');

        assert_ne!(serial.read_reg(regs::LSR) & lsr::DR, 0);
        assert_eq!(serial.read_reg(regs::THR_RBR), b'h');
        assert_eq!(serial.read_reg(regs::THR_RBR), b'i');
        assert_eq!(serial.read_reg(regs::LSR) & lsr::DR, 0);
    }

    #[test]
    fn test_rx_queue_drops_beyond_capacity() {
        let serial = test_serial();
        let rx = serial.rx_handle();
        for _ in 0..RX_QUEUE_CAPACITY + 10 {
            rx.push_byte(b'x');
        }
        assert_eq!(serial.rx_queue.lock().unwrap().len(), RX_QUEUE_CAPACITY);
    }

    #[test]
    fn test_scratch_register_roundtrip() {
        let mut serial = test_serial();
        serial.write_reg(regs::SCR, 0x42);
        assert_eq!(serial.read_reg(regs::SCR), 0x42);
    }

    #[test]
    fn test_dlab_selects_divisor_registers() {
        let mut serial = test_serial();
        serial.write_reg(regs::LCR, 0x80);
        assert_eq!(serial.read_reg(regs::THR_RBR), (DIVISOR_9600_BAUD & 0xff) as u8);
        assert_eq!(serial.read_reg(regs::IER), (DIVISOR_9600_BAUD >> 8) as u8);
    }
}
