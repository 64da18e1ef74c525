//! Headless demonstrator binary: builds one machine profile out of the
//! bus-fabric crates, runs it for a fixed number of frames with
//! [`pcbus_machine::NullCpu`] standing in for real instruction execution,
//! and reports what got wired up. No concrete chipset ships in this crate
//! (§9 "no chipset hardcoded"), so the profile built here only exercises
//! the core plumbing: RAM, a port-80h POST-code logger, and the PIC pair.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{Context, Result};
use clap::Parser;

use pcbus_machine::{
    BringUpError, BusFlags, ConfigResolver, Device, DeviceDesc, FrameOutcome, Machine, MachineDesc, NullCpu, Port,
    PortHandler,
};

/// Runs the generic ISA demo machine for a fixed number of frames.
#[derive(Parser, Debug)]
#[command(name = "pcbus-cli", about = "Demonstrates bring-up of a pcbus machine profile")]
struct Args {
    /// RAM size in KiB.
    #[arg(long, default_value_t = 640)]
    ram_kib: u32,

    /// Number of frames to run before exiting.
    #[arg(long, default_value_t = 60)]
    frames: u32,

    /// CPU cycles budgeted per frame.
    #[arg(long, default_value_t = 70_000)]
    cycles_per_frame: i64,

    /// Directory for persisted NVRAM blobs. If omitted, NVRAM is not saved.
    #[arg(long)]
    nvr_dir: Option<PathBuf>,
}

/// Logs whatever byte is written to port 0x80, the conventional BIOS POST
/// diagnostic-code port.
struct PostCodeLogger {
    last_code: u8,
}

impl PortHandler for PostCodeLogger {
    fn write8(&mut self, _port: Port, value: u8) -> bool {
        self.last_code = value;
        tracing::info!(code = %format!("0x{value:02X}"), "POST code");
        true
    }

    fn read8(&mut self, _port: Port) -> Option<u8> {
        Some(self.last_code)
    }
}

impl Device for PostCodeLogger {}

fn demo_machine_desc() -> MachineDesc {
    MachineDesc {
        name: "pcbus generic ISA demo",
        internal_name: "pcbus-demo",
        ram_min: 64 * 1024,
        ram_max: 64 * 1024 * 1024,
        ram_granularity: 64 * 1024,
        init: |machine, _config| -> Result<(), BringUpError> {
            let handler = Rc::new(RefCell::new(PostCodeLogger { last_code: 0 }));
            machine.io_mut().sethandler(0x80, 1, handler.clone());

            let desc = DeviceDesc {
                name: "Port 80h POST code logger",
                internal_name: "post80",
                flags: BusFlags::ISA | BusFlags::CORE,
                local: 0,
                config: None,
            };
            machine.devices_mut().add(desc, move |_| Ok(Box::new(PostCodeLoggerHandle(handler)) as Box<dyn Device>))?;
            Ok(())
        },
    }
}

/// The device-arena side of the POST logger: owns a clone of the same
/// `Rc<RefCell<..>>` installed into the port table so `reset`/`close`
/// participate in the normal device lifecycle even though the I/O dispatch
/// itself happens through the port table's own handle.
struct PostCodeLoggerHandle(Rc<RefCell<PostCodeLogger>>);

impl Device for PostCodeLoggerHandle {
    fn reset(&mut self) {
        self.0.borrow_mut().last_code = 0;
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let desc = demo_machine_desc();
    let config = ConfigResolver::new();

    let mut machine = Machine::bring_up(&desc, args.ram_kib * 1024, &config)
        .with_context(|| format!("bringing up machine profile '{}'", desc.internal_name))?;

    tracing::info!(devices = machine.devices().len(), ram_kib = args.ram_kib, "machine ready");

    let mut cpu = NullCpu::new(4);
    for frame in 0..args.frames {
        match machine.run_frame(&mut cpu, args.cycles_per_frame) {
            FrameOutcome::Continue => {}
            FrameOutcome::ShutdownRequested => {
                tracing::info!(frame, "shutdown requested, stopping early");
                break;
            }
        }
    }

    tracing::info!(cycles = machine.cycles(), "run complete");

    if let Some(dir) = args.nvr_dir {
        let store = pcbus_machine::file_store(&dir);
        let key = pcbus_machine::nvr_key(&machine.internal_name, "post80");
        pcbus_machine::NvrStore::save(&store, &key, &[0])
            .with_context(|| format!("persisting nvram under {}", dir.display()))?;
    }

    machine.shutdown();
    Ok(())
}
