//! CMOS/RTC register file, exposed on ports 0x70 (index) and 0x71
//! (data) the way every PC-compatible BIOS and the Linux RTC driver
//! expect: select a register by writing its index, then read or write
//! the data port.
//!
//! Nothing here tracks wall-clock time. The guest only needs Status
//! Register A's update-in-progress bit clear and a plausible Status
//! Register D to stop probing; a date fixed at the Unix epoch keeps the
//! boot path simple without a time-of-day dependency.

use crate::ioport::PortHandler;

pub const CMOS_PORT_INDEX: u16 = 0x70;
pub const CMOS_PORT_DATA: u16 = 0x71;

const STATUS_A_IDX: u8 = 0x0a;
const STATUS_B_IDX: u8 = 0x0b;
const STATUS_C_IDX: u8 = 0x0c;
const STATUS_D_IDX: u8 = 0x0d;

const STATUS_A_NOT_UPDATING: u8 = 0x26;
const STATUS_B_24H_BINARY: u8 = 0x02;
const STATUS_C_NO_PENDING_IRQ: u8 = 0x00;
const STATUS_D_TIME_VALID: u8 = 0x80;

/// One frozen RTC snapshot: midnight, January 1st 2000, expressed the
/// way the register file reports it (BCD is the historical default,
/// but Status Register B above selects binary mode, so these are
/// stored as the plain values the guest will read back).
struct FrozenClock;

impl FrozenClock {
    fn register(&self, index: u8) -> Option<u8> {
        match index {
            0x00 => Some(0), // seconds
            0x02 => Some(0), // minutes
            0x04 => Some(0), // hours
            0x06 => Some(1), // day of week, 1 = Sunday
            0x07 => Some(1), // day of month
            0x08 => Some(1), // month
            0x09 => Some(0), // year within century
            0x32 => Some(20), // century
            _ => None,
        }
    }
}

pub struct Cmos {
    selected: u8,
    clock: FrozenClock,
}

impl Cmos {
    pub fn new() -> Self {
        Self {
            selected: 0,
            clock: FrozenClock,
        }
    }

    fn select(&mut self, value: u8) {
        // Bit 7 is the NMI-disable latch shared with port 0x70 on real
        // hardware; this core has no NMI path, so it's dropped.
        self.selected = value & 0x7f;
    }

    fn read_selected(&self) -> u8 {
        if let Some(value) = self.clock.register(self.selected) {
            return value;
        }
        match self.selected {
            STATUS_A_IDX => STATUS_A_NOT_UPDATING,
            STATUS_B_IDX => STATUS_B_24H_BINARY,
            STATUS_C_IDX => STATUS_C_NO_PENDING_IRQ,
            STATUS_D_IDX => STATUS_D_TIME_VALID,
            _ => 0x00,
        }
    }
}

impl Default for Cmos {
    fn default() -> Self {
        Self::new()
    }
}

impl PortHandler for Cmos {
    fn io_in(&mut self, port: u16, data: &mut [u8]) {
        let Some(byte) = data.first_mut() else {
            return;
        };
        *byte = match port {
            CMOS_PORT_DATA => self.read_selected(),
            _ => 0xff,
        };
    }

    fn io_out(&mut self, port: u16, data: &[u8]) {
        let Some(&value) = data.first() else {
            return;
        };
        match port {
            CMOS_PORT_INDEX => self.select(value),
            // Alarm and time-set writes to the data port are accepted
            // and discarded; nothing downstream reads them back.
            CMOS_PORT_DATA => {}
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_register(cmos: &mut Cmos, index: u8) -> u8 {
        cmos.io_out(CMOS_PORT_INDEX, &[index]);
        let mut data = [0u8; 1];
        cmos.io_in(CMOS_PORT_DATA, &mut data);
        data[0]
    }

    #[test]
    fn status_a_reports_no_update_in_progress() {
        let mut cmos = Cmos::new();
        let value = read_register(&mut cmos, STATUS_A_IDX);
        assert_eq!(value & 0x80, 0);
    }

    #[test]
    fn status_d_reports_valid_time() {
        let mut cmos = Cmos::new();
        assert_eq!(read_register(&mut cmos, STATUS_D_IDX), STATUS_D_TIME_VALID);
    }

    #[test]
    fn frozen_clock_reads_midnight_jan_1() {
        let mut cmos = Cmos::new();
        assert_eq!(read_register(&mut cmos, 0x00), 0); // seconds
        assert_eq!(read_register(&mut cmos, 0x04), 0); // hours
        assert_eq!(read_register(&mut cmos, 0x07), 1); // day of month
        assert_eq!(read_register(&mut cmos, 0x08), 1); // month
    }

    #[test]
    fn unselected_register_defaults_to_zero() {
        let mut cmos = Cmos::new();
        assert_eq!(read_register(&mut cmos, 0x55), 0x00);
    }

    #[test]
    fn nmi_disable_bit_is_masked_out_of_selection() {
        let mut cmos = Cmos::new();
        cmos.io_out(CMOS_PORT_INDEX, &[STATUS_D_IDX | 0x80]);
        let mut data = [0u8; 1];
        cmos.io_in(CMOS_PORT_DATA, &mut data);
        assert_eq!(data[0], STATUS_D_TIME_VALID);
    }

    #[test]
    fn reading_any_port_other_than_data_returns_high_byte() {
        let mut cmos = Cmos::new();
        let mut data = [0u8; 1];
        cmos.io_in(CMOS_PORT_INDEX, &mut data);
        assert_eq!(data[0], 0xff);
    }
}
