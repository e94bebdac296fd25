//! The 64K×{in,out} I/O-port dispatch table.
//!
//! Registration happens once during `Machine::new`; after that only the
//! read path runs, from vCPU worker threads, so no synchronization is
//! needed. Lookups are a flat, identity-indexed array rather than a
//! sorted `Vec` scan, since the port space is small enough to afford it.

use std::sync::{Arc, Mutex};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IoPortError {
    #[error("unmapped I/O port {0:#x}")]
    Unmapped(u16),
}

/// Implemented by anything that answers guest port accesses. A single
/// handler instance is free to serve many ports (it receives the port
/// number on every call) and both directions. `Send` because each
/// vCPU exit is dispatched from that vCPU's own OS thread.
pub trait PortHandler: Send {
    fn io_in(&mut self, port: u16, data: &mut [u8]);
    fn io_out(&mut self, port: u16, data: &[u8]);
}

pub type HandlerRef = Arc<Mutex<dyn PortHandler>>;

pub struct IoPortHandlerTable {
    in_handlers: Vec<Option<HandlerRef>>,
    out_handlers: Vec<Option<HandlerRef>>,
}

impl IoPortHandlerTable {
    pub fn new() -> Self {
        Self {
            in_handlers: vec![None; 1 << 16],
            out_handlers: vec![None; 1 << 16],
        }
    }

    /// Registers `handler` for every port in `[start, end)`, in both
    /// directions. `end` itself is left unregistered.
    pub fn register(&mut self, start: u16, end: u32, handler: HandlerRef) {
        for port in (start as u32)..end {
            self.in_handlers[port as usize] = Some(handler.clone());
            self.out_handlers[port as usize] = Some(handler.clone());
        }
    }

    /// As `register`, but lets the in/out paths be served by different
    /// handler instances (used for PCI's split address/data registers
    /// when they are modeled as separate objects).
    pub fn register_split(
        &mut self,
        start: u16,
        end: u32,
        in_handler: Option<HandlerRef>,
        out_handler: Option<HandlerRef>,
    ) {
        for port in (start as u32)..end {
            if let Some(h) = &in_handler {
                self.in_handlers[port as usize] = Some(h.clone());
            }
            if let Some(h) = &out_handler {
                self.out_handlers[port as usize] = Some(h.clone());
            }
        }
    }

    pub fn handle_in(&self, port: u16, data: &mut [u8]) -> Result<(), IoPortError> {
        match &self.in_handlers[port as usize] {
            Some(handler) => {
                handler.lock().unwrap().io_in(port, data);
                Ok(())
            }
            None => Err(IoPortError::Unmapped(port)),
        }
    }

    pub fn handle_out(&self, port: u16, data: &[u8]) -> Result<(), IoPortError> {
        match &self.out_handlers[port as usize] {
            Some(handler) => {
                handler.lock().unwrap().io_out(port, data);
                Ok(())
            }
            None => Err(IoPortError::Unmapped(port)),
        }
    }
}

impl Default for IoPortHandlerTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        reads: u32,
        writes: u32,
        last_write: u8,
    }

    impl PortHandler for Counter {
        fn io_in(&mut self, _port: u16, data: &mut [u8]) {
            self.reads += 1;
            data.fill(0x42);
        }

        fn io_out(&mut self, _port: u16, data: &[u8]) {
            self.writes += 1;
            self.last_write = data[0];
        }
    }

    #[test]
    fn test_unmapped_port_errors() {
        let table = IoPortHandlerTable::new();
        let mut buf = [0u8; 1];
        assert!(matches!(
            table.handle_in(0x1234, &mut buf),
            Err(IoPortError::Unmapped(0x1234))
        ));
    }

    #[test]
    fn test_registered_range_dispatches_and_end_is_excluded() {
        let mut table = IoPortHandlerTable::new();
        let counter = Arc::new(Mutex::new(Counter {
            reads: 0,
            writes: 0,
            last_write: 0,
        }));
        table.register(0x3f8, 0x3f8 + 8, counter.clone());

        let mut buf = [0u8; 1];
        table.handle_in(0x3f8, &mut buf).unwrap();
        assert_eq!(buf[0], 0x42);
        table.handle_out(0x3fa, &[0x07]).unwrap();
        assert_eq!(counter.lock().unwrap().writes, 1);
        assert_eq!(counter.lock().unwrap().last_write, 0x07);

        // end of range (0x3f8 + 8 = 0x400) must remain unregistered.
        assert!(table.handle_in(0x400, &mut buf).is_err());
    }
}
