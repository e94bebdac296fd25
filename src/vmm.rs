//! Top-level orchestrator: opens the virt driver, builds a [`Machine`],
//! wires devices onto its port table, loads the guest image (or accepts
//! one over a migration stream), and runs the per-vCPU worker threads.
//!
//! Grounded on virt-do-lumper's `VMM` (`configure`/`run`, one struct
//! owning the whole device+machine graph) merged with an Init → Setup →
//! Boot control flow, split into a type so `main.rs` stays a thin
//! argument-parsing shell.

use std::io::Read;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{info, warn};

use crate::boot::{self, BootConfig, LoadedImage};
use crate::config::VmConfig;
use crate::devices::{
    Cmos, DeviceHeader, Noop, PciBus, Ps2Controller, Serial, Tap, VirtioBlk, VirtioNet,
    CMOS_PORT_DATA, CMOS_PORT_INDEX, CONFIG_ADDRESS, CONFIG_DATA, SERIAL_COM1_BASE,
    SERIAL_COM1_END, VIRTIO_BAR_SIZE, VIRTIO_BLK_BASE, VIRTIO_BLK_IRQ, VIRTIO_NET_BASE,
    VIRTIO_NET_IRQ,
};
use crate::error::Result;
use crate::kvm;
use crate::machine::Machine;
use crate::migration;

/// Legacy PCI device numbers: 0 is the required host bridge, 1/2 are
/// the two virtio functions.
const PCI_DEVICE_BRIDGE: u8 = 0;
const PCI_DEVICE_NET: u8 = 1;
const PCI_DEVICE_BLK: u8 = 2;

/// virtio-net device ID 1, virtio-blk device ID 2, per the virtio PCI
/// device ID block starting at 0x1000.
const VIRTIO_DEVICE_ID_NET: u16 = 0x1000;
const VIRTIO_DEVICE_ID_BLK: u16 = 0x1001;

pub struct Vmm {
    machine: Arc<Machine>,
    config: VmConfig,
    vcpu_threads: Arc<Mutex<Option<Vec<JoinHandle<()>>>>>,
}

impl Vmm {
    /// Opens the virt driver, builds the machine, and registers every
    /// device's port handlers. Kernel loading is deferred to [`Self::run`]
    /// since a migration destination skips it entirely.
    pub fn new(config: VmConfig) -> Result<Self> {
        let vm = kvm::create_vm(&config.driver)?;
        let mut machine = Machine::new(vm, config.mem_size, config.cpus)?;

        let mut pci = PciBus::new();
        pci.register_device(PCI_DEVICE_BRIDGE, DeviceHeader::bridge());

        Self::register_default_port_handlers(&mut machine);

        let serial = Arc::new(Mutex::new(Serial::new(
            machine.irq_injector(),
            SERIAL_COM1_IRQ,
        )));
        machine.register_io_port_handler(
            SERIAL_COM1_BASE,
            SERIAL_COM1_END as u32 + 1,
            serial.clone(),
        );
        machine.attach_serial(serial);

        let cmos: Arc<Mutex<dyn crate::ioport::PortHandler>> = Arc::new(Mutex::new(Cmos::new()));
        machine.register_io_port_handler(CMOS_PORT_INDEX, CMOS_PORT_INDEX as u32 + 1, cmos.clone());
        machine.register_io_port_handler(CMOS_PORT_DATA, CMOS_PORT_DATA as u32 + 1, cmos);

        if let Some(disk) = &config.disk {
            let blk = VirtioBlk::new(
                VIRTIO_BLK_BASE,
                VIRTIO_BLK_IRQ,
                machine.irq_injector(),
                machine.memory().clone(),
                &PathBuf::from(disk),
            )
            .map_err(crate::devices::virtio::VirtioError::from)?;
            let blk = Arc::new(Mutex::new(blk));
            machine.register_io_port_handler(
                VIRTIO_BLK_BASE,
                VIRTIO_BLK_BASE as u32 + VIRTIO_BAR_SIZE,
                blk.clone(),
            );
            pci.register_device(
                PCI_DEVICE_BLK,
                DeviceHeader::virtio(VIRTIO_DEVICE_ID_BLK, VIRTIO_BLK_IRQ as u8, VIRTIO_BAR_SIZE),
            );
            machine.attach_virtio_blk(blk);
            info!(disk = disk.as_str(), "virtio-blk attached");
        }

        if let Some(tap_name) = &config.tap {
            let tap = Tap::open(tap_name)?;
            let net = Arc::new(Mutex::new(VirtioNet::new(
                VIRTIO_NET_BASE,
                VIRTIO_NET_IRQ,
                machine.irq_injector(),
                machine.memory().clone(),
                Box::new(tap),
            )?));
            machine.register_io_port_handler(
                VIRTIO_NET_BASE,
                VIRTIO_NET_BASE as u32 + VIRTIO_BAR_SIZE,
                net.clone(),
            );
            pci.register_device(
                PCI_DEVICE_NET,
                DeviceHeader::virtio(VIRTIO_DEVICE_ID_NET, VIRTIO_NET_IRQ as u8, VIRTIO_BAR_SIZE),
            );
            machine.attach_virtio_net(net);
            info!(tap = tap_name.as_str(), "virtio-net attached");
        }

        let pci = Arc::new(Mutex::new(pci));
        machine.register_io_port_handler(CONFIG_ADDRESS, CONFIG_ADDRESS as u32 + 1, pci.clone());
        machine.register_io_port_handler(CONFIG_DATA, 0xd00, pci);

        Ok(Self {
            machine: Arc::new(machine),
            config,
            vcpu_threads: Arc::new(Mutex::new(None)),
        })
    }

    /// Registers the no-op handlers a Linux boot probes before any real
    /// device answers: VGA, the DMA page registers, the three unused
    /// COM ports, PS/2, and a catch-all over the low ISA/PCI-config
    /// window. Without these, the first unexpected port access is a
    /// fatal unmapped-port error. Registered before the real devices
    /// below so PCI's own CF8/CFC-CFF handlers take priority over the
    /// broad catch-all that covers the same window.
    fn register_default_port_handlers(machine: &mut Machine) {
        let noop: Arc<Mutex<dyn crate::ioport::PortHandler>> = Arc::new(Mutex::new(Noop));
        machine.register_io_port_handler(0x3c0, 0x3db, noop.clone());
        machine.register_io_port_handler(0x3b4, 0x3b7, noop.clone());
        machine.register_io_port_handler(0x80, 0xa0, noop.clone());
        machine.register_io_port_handler(0x2f8, 0x300, noop.clone());
        machine.register_io_port_handler(0x3e8, 0x3f0, noop.clone());
        machine.register_io_port_handler(0x2e8, 0x2f0, noop.clone());
        machine.register_io_port_handler(0xed, 0xee, noop.clone());
        machine.register_io_port_handler(0xc000, 0xd000, noop);

        let ps2: Arc<Mutex<dyn crate::ioport::PortHandler>> = Arc::new(Mutex::new(Ps2Controller));
        machine.register_io_port_handler(0x60, 0x70, ps2);
    }

    /// Either boots a kernel directly or, when `--migrate-dest` was
    /// given, waits for an incoming migration stream before starting
    /// any vCPU.
    pub fn run(self) -> Result<()> {
        if let Some(listen_addr) = self.config.migrate_dest.clone() {
            return self.run_as_migration_destination(&listen_addr);
        }

        let image = self.load_kernel()?;
        for index in 0..self.machine.vcpu_count() {
            self.machine.with_vcpu(index, |vcpu| {
                boot::setup_vcpu_regs(vcpu, self.machine.memory(), &image).map_err(Into::into)
            })?;
        }

        self.spawn_stdin_pump();
        if let Some(socket_path) = self.config.control_socket.clone() {
            self.spawn_control_socket(socket_path);
        }

        self.spawn_vcpu_threads();
        self.join_vcpu_threads();
        Ok(())
    }

    fn load_kernel(&self) -> Result<LoadedImage> {
        let boot_config = BootConfig {
            kernel_path: self.config.kernel.clone(),
            initrd_path: self.config.initrd.clone(),
            cmdline: self.config.cmdline.clone(),
            mem_size: self.config.mem_size,
        };
        boot::setup_boot(self.machine.memory(), &boot_config, self.config.cpus).map_err(Into::into)
    }

    fn run_as_migration_destination(self, listen_addr: &str) -> Result<()> {
        let machine = self.machine.clone();
        let vcpu_threads = self.vcpu_threads.clone();
        let trace_skip = self.config.trace_skip;
        let disk = self.config.disk.clone().map(PathBuf::from);

        migration::migrate_destination(&machine, disk.as_deref(), listen_addr, || {
            spawn_vcpu_threads_into(&machine, &vcpu_threads, trace_skip);
        })?;

        join_vcpu_threads(&vcpu_threads);
        Ok(())
    }

    fn spawn_vcpu_threads(&self) {
        spawn_vcpu_threads_into(&self.machine, &self.vcpu_threads, self.config.trace_skip);
    }

    fn join_vcpu_threads(&self) {
        join_vcpu_threads(&self.vcpu_threads);
    }

    /// Reads raw bytes from stdin and forwards each one to the serial
    /// device's RX queue. Raw-mode toggling is the caller's concern
    /// (out of scope here); this just pumps whatever bytes arrive.
    fn spawn_stdin_pump(&self) {
        let Some(serial) = self.machine.serial().cloned() else {
            return;
        };
        let rx = serial.lock().unwrap().rx_handle();
        std::thread::spawn(move || {
            let mut buf = [0u8; 1];
            loop {
                match std::io::stdin().read(&mut buf) {
                    Ok(0) => return,
                    Ok(_) => rx.push_byte(buf[0]),
                    Err(e) => {
                        warn!(error = %e, "stdin pump exiting");
                        return;
                    }
                }
            }
        });
    }

    /// Spawns the thread that blocks on the control socket for a
    /// `MIGRATE host:port` command, then drives the source side of
    /// migration. On success the guest now lives on the destination,
    /// so this process exits outright rather than resuming vCPUs.
    fn spawn_control_socket(&self, socket_path: PathBuf) {
        let machine = self.machine.clone();
        let vcpu_threads = self.vcpu_threads.clone();
        let disk = self.config.disk.clone().map(PathBuf::from);

        std::thread::spawn(move || loop {
            let dest_addr = match migration::accept_control_command(&socket_path) {
                Ok(addr) => addr,
                Err(e) => {
                    warn!(error = %e, "control socket command rejected");
                    continue;
                }
            };

            info!(dest = dest_addr.as_str(), "migration triggered");
            let machine = machine.clone();
            let vcpu_threads = vcpu_threads.clone();
            let result = migration::migrate_source(&machine, disk.as_deref(), &dest_addr, || {
                machine.request_stop();
                join_vcpu_threads(&vcpu_threads);
            });

            match result {
                Ok(()) => {
                    info!("migration complete, exiting");
                    std::process::exit(0);
                }
                Err(e) => warn!(error = %e, "migration failed, staying resident"),
            }
        });
    }
}

const SERIAL_COM1_IRQ: u32 = 4;

fn spawn_vcpu_threads_into(
    machine: &Arc<Machine>,
    vcpu_threads: &Arc<Mutex<Option<Vec<JoinHandle<()>>>>>,
    trace_skip: u64,
) {
    machine.clear_stop();
    let mut handles = Vec::with_capacity(machine.vcpu_count());
    for index in 0..machine.vcpu_count() {
        let machine = machine.clone();
        handles.push(std::thread::spawn(move || {
            match machine.run_vcpu(index, trace_skip) {
                Ok(()) => info!(vcpu = index, "vCPU worker stopped"),
                Err(e) => warn!(vcpu = index, error = %e, "vCPU worker exited with error"),
            }
            machine.request_stop();
        }));
    }
    *vcpu_threads.lock().unwrap() = Some(handles);
}

fn join_vcpu_threads(vcpu_threads: &Arc<Mutex<Option<Vec<JoinHandle<()>>>>>) {
    let handles = vcpu_threads.lock().unwrap().take();
    if let Some(handles) = handles {
        for handle in handles {
            let _ = handle.join();
        }
    }
}
