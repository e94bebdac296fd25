//! PCI configuration-space access mechanism #1 (ports 0xCF8/0xCFC).
//!
//! Follows the same register-then-freeze dispatch style as
//! [`crate::ioport::IoPortHandlerTable`], generalized to decode the
//! address/data register pair instead of a flat table. The config-space
//! and BAR-probing semantics below are written from the mechanism #1
//! wire format directly, since nothing upstream of this core emulated
//! PCI at all.

use crate::ioport::PortHandler;

pub const CONFIG_ADDRESS: u16 = 0xcf8;
pub const CONFIG_DATA: u16 = 0xcfc;

const ENABLE_BIT: u32 = 0x8000_0000;
const CONFIG_SPACE_SIZE: usize = 256;

/// One PCI function's configuration header plus up to 6 BARs.
/// `bar_sizes[i] == 0` marks a BAR as unimplemented (always reads 0,
/// ignores writes).
pub struct DeviceHeader {
    pub vendor_id: u16,
    pub device_id: u16,
    pub subsystem_id: u16,
    pub header_type: u8,
    pub interrupt_pin: u8,
    pub interrupt_line: u8,
    pub bars: [u32; 6],
    pub bar_sizes: [u32; 6],
}

impl DeviceHeader {
    /// A minimal host bridge function (device 0), matching what the
    /// guest's PCI enumeration expects to find there.
    pub fn bridge() -> Self {
        Self {
            vendor_id: 0x8086,
            device_id: 0x1237,
            subsystem_id: 0,
            header_type: 0,
            interrupt_pin: 0,
            interrupt_line: 0,
            bars: [0; 6],
            bar_sizes: [0; 6],
        }
    }

    /// A legacy virtio function exposing one I/O BAR at `bar0_size`
    /// bytes (our common-header + device-config port range).
    pub fn virtio(device_id: u16, irq_line: u8, bar0_size: u32) -> Self {
        let mut bars = [0u32; 6];
        let mut bar_sizes = [0u32; 6];
        bars[0] = 0x1; // I/O space bit set; base address filled in by the guest
        bar_sizes[0] = bar0_size;
        Self {
            vendor_id: 0x1af4, // virtio vendor id
            device_id,
            subsystem_id: device_id,
            header_type: 0,
            interrupt_pin: 1,
            interrupt_line: irq_line,
            bars,
            bar_sizes,
        }
    }

    fn read_u8(&self, offset: u8) -> u8 {
        let mut buf = [0u8; 4];
        self.read_into(offset & 0xfc, &mut buf);
        buf[(offset & 0x3) as usize]
    }

    fn read_into(&self, aligned_offset: u8, buf: &mut [u8; 4]) {
        match aligned_offset {
            0x00 => {
                buf[0..2].copy_from_slice(&self.vendor_id.to_le_bytes());
                buf[2..4].copy_from_slice(&self.device_id.to_le_bytes());
            }
            0x0c => buf[2] = self.header_type,
            0x10..=0x24 => {
                let idx = ((aligned_offset - 0x10) / 4) as usize;
                buf.copy_from_slice(&self.bars[idx].to_le_bytes());
            }
            0x2c => buf[2..4].copy_from_slice(&self.subsystem_id.to_le_bytes()),
            0x3c => {
                buf[0] = self.interrupt_line;
                buf[1] = self.interrupt_pin;
            }
            _ => {}
        }
    }

    fn write_u8(&mut self, offset: u8, value: u8) {
        let aligned = offset & 0xfc;
        let byte_idx = (offset & 0x3) as usize;
        if let 0x10..=0x24 = aligned {
            let idx = ((aligned - 0x10) / 4) as usize;
            if self.bar_sizes[idx] == 0 {
                return;
            }
            let mut bytes = self.bars[idx].to_le_bytes();
            // BAR size probing: the guest writes all-ones, then reads
            // back a mask encoding the region size.
            if value == 0xff {
                bytes[byte_idx] = 0xff;
                let probe = u32::from_le_bytes(bytes);
                if probe == 0xffff_ffff {
                    self.bars[idx] = (!(self.bar_sizes[idx] - 1)) | 0x1;
                    return;
                }
            }
            bytes[byte_idx] = value;
            self.bars[idx] = u32::from_le_bytes(bytes) & !0x3 | (self.bars[idx] & 0x1);
        }
    }
}

#[derive(Clone, Copy, Default)]
struct ConfigAddress(u32);

impl ConfigAddress {
    fn enabled(self) -> bool {
        self.0 & ENABLE_BIT != 0
    }

    fn bus(self) -> u8 {
        ((self.0 >> 16) & 0xff) as u8
    }

    fn device(self) -> u8 {
        ((self.0 >> 11) & 0x1f) as u8
    }

    fn function(self) -> u8 {
        ((self.0 >> 8) & 0x7) as u8
    }

    fn register_offset(self) -> u8 {
        (self.0 & 0xfc) as u8
    }
}

/// Routes config-mechanism-#1 accesses to registered devices by index
/// (device 0 is conventionally the host bridge).
pub struct PciBus {
    address: ConfigAddress,
    devices: Vec<Option<DeviceHeader>>,
}

impl PciBus {
    pub fn new() -> Self {
        Self {
            address: ConfigAddress::default(),
            devices: Vec::new(),
        }
    }

    pub fn register_device(&mut self, device_num: u8, header: DeviceHeader) {
        let idx = device_num as usize;
        if self.devices.len() <= idx {
            self.devices.resize_with(idx + 1, || None);
        }
        self.devices[idx] = Some(header);
    }

    fn target(&mut self) -> Option<&mut DeviceHeader> {
        if !self.address.enabled() || self.address.bus() != 0 || self.address.function() != 0 {
            return None;
        }
        self.devices
            .get_mut(self.address.device() as usize)
            .and_then(|d| d.as_mut())
    }
}

impl Default for PciBus {
    fn default() -> Self {
        Self::new()
    }
}

impl PortHandler for PciBus {
    fn io_in(&mut self, port: u16, data: &mut [u8]) {
        match port {
            CONFIG_ADDRESS => {
                let bytes = self.address.0.to_le_bytes();
                data.copy_from_slice(&bytes[..data.len().min(4)]);
            }
            CONFIG_DATA..=0xcff => {
                let byte_in_word = (port - CONFIG_DATA) as u8;
                let offset = self.address.register_offset();
                match self.target() {
                    Some(device) => {
                        for (i, byte) in data.iter_mut().enumerate() {
                            *byte = device.read_u8(offset.wrapping_add(byte_in_word + i as u8));
                        }
                    }
                    None => data.fill(0xff),
                }
            }
            _ => data.fill(0xff),
        }
    }

    fn io_out(&mut self, port: u16, data: &[u8]) {
        match port {
            CONFIG_ADDRESS => {
                let mut bytes = self.address.0.to_le_bytes();
                bytes[..data.len().min(4)].copy_from_slice(&data[..data.len().min(4)]);
                self.address = ConfigAddress(u32::from_le_bytes(bytes));
            }
            CONFIG_DATA..=0xcff => {
                let byte_in_word = (port - CONFIG_DATA) as u8;
                let offset = self.address.register_offset();
                if let Some(device) = self.target() {
                    for (i, &byte) in data.iter().enumerate() {
                        device.write_u8(offset.wrapping_add(byte_in_word + i as u8), byte);
                    }
                }
            }
            _ => {}
        }
    }
}

const _: () = assert!(CONFIG_SPACE_SIZE >= 0x40);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vendor_device_id_roundtrip() {
        let mut bus = PciBus::new();
        bus.register_device(1, DeviceHeader::virtio(0x1000, 10, 256));

        bus.io_out(CONFIG_ADDRESS, &(0x8000_0800u32).to_le_bytes());
        let mut buf = [0u8; 4];
        bus.io_in(CONFIG_DATA, &mut buf);
        assert_eq!(u16::from_le_bytes([buf[0], buf[1]]), 0x1af4);
        assert_eq!(u16::from_le_bytes([buf[2], buf[3]]), 0x1000);
    }

    #[test]
    fn test_disabled_address_reads_ones() {
        let mut bus = PciBus::new();
        bus.register_device(1, DeviceHeader::virtio(0x1000, 10, 256));
        bus.io_out(CONFIG_ADDRESS, &(0x0000_0800u32).to_le_bytes());
        let mut buf = [0u8; 4];
        bus.io_in(CONFIG_DATA, &mut buf);
        assert_eq!(buf, [0xff, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn test_bar_size_probe() {
        let mut bus = PciBus::new();
        bus.register_device(1, DeviceHeader::virtio(0x1000, 10, 256));
        // select device 1, BAR0 at offset 0x10
        bus.io_out(CONFIG_ADDRESS, &(0x8000_0810u32).to_le_bytes());
        bus.io_out(CONFIG_DATA, &0xffff_ffffu32.to_le_bytes());

        let mut buf = [0u8; 4];
        bus.io_in(CONFIG_DATA, &mut buf);
        let mask = u32::from_le_bytes(buf);
        // Size is 256 bytes; low bit marks I/O space.
        assert_eq!(mask & !0x3, !(256u32 - 1) & !0x3);
        assert_eq!(mask & 0x1, 0x1);
    }
}
