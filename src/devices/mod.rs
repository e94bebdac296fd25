//! Device emulation for the VMM.

mod cmos;
mod noop;
pub mod pci;
mod serial;
mod tap;
pub mod virtio;

pub use cmos::{Cmos, CMOS_PORT_DATA, CMOS_PORT_INDEX};
pub use noop::{Noop, Ps2Controller};
pub use pci::{DeviceHeader, PciBus, CONFIG_ADDRESS, CONFIG_DATA};
pub use serial::{Serial, SerialRxHandle};
pub use tap::Tap;
pub use virtio::blk::VirtioBlk;
pub use virtio::net::VirtioNet;

/// I/O port range for COM1 serial port.
pub const SERIAL_COM1_BASE: u16 = 0x3f8;
pub const SERIAL_COM1_END: u16 = 0x3ff;

/// Port BARs for the two virtio devices, per the external interface
/// table: virtio-net at 0x6200, IRQ 9; virtio-blk at 0x6300, IRQ 10.
pub const VIRTIO_NET_BASE: u16 = 0x6200;
pub const VIRTIO_NET_IRQ: u32 = 9;
pub const VIRTIO_BLK_BASE: u16 = 0x6300;
pub const VIRTIO_BLK_IRQ: u32 = 10;
pub const VIRTIO_BAR_SIZE: u32 = 0x100;
