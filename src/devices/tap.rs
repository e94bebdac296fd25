//! TAP interface acquisition: opens `/dev/net/tun` and binds it to a
//! named host interface via `TUNSETIFF`.
//!
//! The core's virtio-net device only needs something that reads and
//! writes whole Ethernet frames (see [`super::virtio::net::TapStream`]);
//! this is the one concrete implementation of that interface, adapted
//! from virt-do-lumper's `devices::tap::Tap` onto this crate's `nix`
//! dependency instead of `vmm_sys_util`.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd};

use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;

use super::virtio::net::TapStream;

const TUN_DEV_PATH: &str = "/dev/net/tun";
const IFNAMSIZ: usize = 16;

// include/uapi/linux/if_tun.h
const IFF_TAP: i16 = 0x0002;
const IFF_NO_PI: i16 = 0x1000;

#[repr(C)]
struct IfReq {
    name: [u8; IFNAMSIZ],
    flags: i16,
    _reserved: [u8; 22],
}

nix::ioctl_write_ptr!(tunsetiff, b'T', 202, IfReq);

pub struct Tap {
    file: File,
}

impl Tap {
    /// Opens `/dev/net/tun` and attaches it to `if_name`, which must
    /// already exist as a TAP interface on the host (this core does
    /// not create or configure the interface itself).
    pub fn open(if_name: &str) -> io::Result<Self> {
        if if_name.len() >= IFNAMSIZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("interface name {if_name:?} is too long"),
            ));
        }

        let fd = open(TUN_DEV_PATH, OFlag::O_RDWR | OFlag::O_CLOEXEC, Mode::empty())
            .map_err(io::Error::from)?;
        // Safety: `fd` was just opened above and is owned by no one else.
        let file = unsafe { File::from_raw_fd(fd) };

        let mut req = IfReq {
            name: [0u8; IFNAMSIZ],
            flags: IFF_TAP | IFF_NO_PI,
            _reserved: [0u8; 22],
        };
        req.name[..if_name.len()].copy_from_slice(if_name.as_bytes());

        // Safety: `req` is a valid, fully initialized `ifreq`-shaped
        // buffer and `file`'s fd stays open for the call's duration.
        unsafe { tunsetiff(file.as_raw_fd(), &req) }.map_err(io::Error::from)?;

        Ok(Self { file })
    }

    fn try_clone(&self) -> io::Result<Self> {
        Ok(Self {
            file: self.file.try_clone()?,
        })
    }
}

impl Read for Tap {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for Tap {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl TapStream for Tap {
    fn try_clone_stream(&self) -> io::Result<Box<dyn TapStream>> {
        Ok(Box::new(self.try_clone()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlong_interface_name_rejected() {
        let name = "a".repeat(IFNAMSIZ);
        assert!(Tap::open(&name).is_err());
    }
}
