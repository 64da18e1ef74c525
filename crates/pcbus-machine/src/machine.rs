//! Machine descriptor and bring-up — §4.8, §5, §4.9.
//!
//! A [`Machine`] owns every piece of bus fabric built in the sibling
//! crates plus the device arena. It is intentionally `!Sync`: all of it
//! (RAM, port table, PIC, DMA, PCI config space, devices) is single-threaded
//! state driven by one execution-loop thread, consistent with §5's "host
//! drives the emulated bus single-threaded" model. The only thing that
//! crosses a thread boundary is [`crate::render::RenderHandoff`] and the
//! async UI event channel below.

use thiserror::Error;

use pcbus_device::{ConfigResolver, DeviceArena, DeviceError};
use pcbus_dma::DmaControllers;
use pcbus_io::PortIoTable;
use pcbus_mem::{MemError, MemoryMap, SmmState};
use pcbus_pci::PciBus;
use pcbus_pic::PicPair;
use pcbus_timers::TimerQueue;

use crate::cpu::{BusContract, CpuModel};

#[derive(Debug, Error)]
pub enum BringUpError {
    #[error("requested ram size {requested} outside [{min}, {max}] for this machine")]
    RamSizeOutOfRange { requested: u32, min: u32, max: u32 },
    #[error("requested ram size {requested} is not a multiple of the {granularity}-byte step")]
    RamSizeMisaligned { requested: u32, granularity: u32 },
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Mem(#[from] MemError),
    #[error("missing required artifact: {0}")]
    MissingArtifact(&'static str),
}

/// Immutable record describing one buildable machine profile (§3 "Machine
/// descriptor"). `init` is handed a freshly constructed, otherwise-empty
/// [`Machine`] and is responsible for installing every device the profile
/// needs (§4.8 step 2), typically by calling [`Machine::devices_mut`] and
/// [`pcbus_device::DeviceArena::add`] once per device, wiring IRQ/PIRQ
/// routing and port/memory handlers as it goes.
pub struct MachineDesc {
    pub name: &'static str,
    pub internal_name: &'static str,
    pub ram_min: u32,
    pub ram_max: u32,
    pub ram_granularity: u32,
    pub init: fn(&mut Machine, &ConfigResolver) -> Result<(), BringUpError>,
}

/// Events the host application's UI thread posts into the execution loop
/// (§5 "async UI events"). Delivered through a bounded
/// [`crossbeam_channel`] so a slow or wedged UI thread cannot block the
/// emulated bus from making progress — a full queue simply drops the
/// oldest-pending event's sender-side send, which is acceptable for
/// advisory notifications like these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    Shutdown,
    SpeedChanged,
    ForceRedraw,
}

/// Result of running one batch of cycles via [`Machine::run_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Continue,
    ShutdownRequested,
}

/// The device-composition and bus-dispatch core tying every bus-fabric
/// crate together into one machine instance.
pub struct Machine {
    pub internal_name: String,
    mem: MemoryMap,
    io: PortIoTable,
    timers: TimerQueue,
    pic: PicPair,
    dma: DmaControllers,
    pci: PciBus,
    devices: DeviceArena,
    cycle: i64,
    smm: SmmState,
    smi_requested: bool,
    shutdown_requested: bool,
    ui_tx: crossbeam_channel::Sender<UiEvent>,
    ui_rx: crossbeam_channel::Receiver<UiEvent>,
}

impl Machine {
    fn new_empty(internal_name: &str, ram_size: u32) -> Self {
        let (ui_tx, ui_rx) = crossbeam_channel::bounded(64);
        Self {
            internal_name: internal_name.to_string(),
            mem: MemoryMap::new(ram_size),
            io: PortIoTable::new(),
            timers: TimerQueue::new(),
            pic: PicPair::new(),
            dma: DmaControllers::new(),
            pci: PciBus::new(),
            devices: DeviceArena::new(),
            cycle: 0,
            smm: SmmState::Outside,
            smi_requested: false,
            shutdown_requested: false,
            ui_tx,
            ui_rx,
        }
    }

    /// §4.8: validates the requested RAM size against the descriptor,
    /// builds empty bus fabric, runs `desc.init`, then resets every device
    /// that got installed, in registration order.
    pub fn bring_up(desc: &MachineDesc, ram_size: u32, config: &ConfigResolver) -> Result<Self, BringUpError> {
        if ram_size < desc.ram_min || ram_size > desc.ram_max {
            return Err(BringUpError::RamSizeOutOfRange { requested: ram_size, min: desc.ram_min, max: desc.ram_max });
        }
        if desc.ram_granularity > 0 && ram_size % desc.ram_granularity != 0 {
            return Err(BringUpError::RamSizeMisaligned { requested: ram_size, granularity: desc.ram_granularity });
        }

        let mut machine = Self::new_empty(desc.internal_name, ram_size);
        (desc.init)(&mut machine, config)?;
        machine.devices.reset_all();
        tracing::debug!(machine = desc.internal_name, devices = machine.devices.len(), "machine bring-up complete");
        Ok(machine)
    }

    pub fn mem(&self) -> &MemoryMap {
        &self.mem
    }
    pub fn mem_mut(&mut self) -> &mut MemoryMap {
        &mut self.mem
    }
    pub fn io(&self) -> &PortIoTable {
        &self.io
    }
    pub fn io_mut(&mut self) -> &mut PortIoTable {
        &mut self.io
    }
    pub fn timers(&self) -> &TimerQueue {
        &self.timers
    }
    pub fn timers_mut(&mut self) -> &mut TimerQueue {
        &mut self.timers
    }
    pub fn pic(&self) -> &PicPair {
        &self.pic
    }
    pub fn pic_mut(&mut self) -> &mut PicPair {
        &mut self.pic
    }
    pub fn dma(&self) -> &DmaControllers {
        &self.dma
    }
    pub fn dma_mut(&mut self) -> &mut DmaControllers {
        &mut self.dma
    }
    pub fn pci(&self) -> &PciBus {
        &self.pci
    }
    pub fn pci_mut(&mut self) -> &mut PciBus {
        &mut self.pci
    }
    pub fn devices(&self) -> &DeviceArena {
        &self.devices
    }
    pub fn devices_mut(&mut self) -> &mut DeviceArena {
        &mut self.devices
    }

    pub fn cycles(&self) -> i64 {
        self.cycle
    }

    pub fn smm_state(&self) -> SmmState {
        self.smm
    }
    pub fn enter_smm(&mut self) {
        self.smm = SmmState::InsideOrOpen;
    }
    pub fn exit_smm(&mut self) {
        self.smm = SmmState::Outside;
    }

    /// A device (chipset, ACPI block) calls this to ask the CPU model to
    /// take an SMI on its next poll. There is no explicit clear: the
    /// chipset is expected to drop the request once the CPU observes it
    /// and enters SMM, typically the next time `request_smi` is *not*
    /// called during a given poll — callers that need edge-triggered
    /// behavior should track their own latch and call this unconditionally
    /// each cycle.
    pub fn request_smi(&mut self) {
        self.smi_requested = true;
    }
    pub fn clear_smi(&mut self) {
        self.smi_requested = false;
    }

    /// A clone of the sending half of the UI event channel, handed to the
    /// host application's UI thread so it can post [`UiEvent`]s.
    pub fn ui_sender(&self) -> crossbeam_channel::Sender<UiEvent> {
        self.ui_tx.clone()
    }

    /// Runs at most `cycles_budget` cycles of the execution loop (§4.9),
    /// draining timers and stepping `cpu` until the budget is exhausted,
    /// the CPU reports halted with no pending work, or a shutdown event
    /// arrives. Intended to be called once per host video frame so the
    /// caller can interleave rendering between calls.
    pub fn run_frame(&mut self, cpu: &mut dyn CpuModel, cycles_budget: i64) -> FrameOutcome {
        let start = self.cycle;
        while self.cycle - start < cycles_budget && !self.shutdown_requested {
            self.timers.process_expired(self.cycle);
            cpu.step(self);
            if cpu.halted() {
                break;
            }
        }
        self.drain_ui_events();
        if self.shutdown_requested {
            FrameOutcome::ShutdownRequested
        } else {
            FrameOutcome::Continue
        }
    }

    fn drain_ui_events(&mut self) {
        while let Ok(event) = self.ui_rx.try_recv() {
            match event {
                UiEvent::Shutdown => {
                    tracing::info!("shutdown requested");
                    self.shutdown_requested = true;
                }
                UiEvent::SpeedChanged => self.devices.speed_changed_all(),
                UiEvent::ForceRedraw => self.devices.force_redraw_all(),
            }
        }
    }

    /// Closes every device in reverse registration order (§3 lifecycle).
    pub fn shutdown(&mut self) {
        self.devices.shutdown();
    }
}

impl BusContract for Machine {
    fn mem_read_phys(&self, pa: u32, width: u32) -> u64 {
        self.mem.dispatch_read(pa, width / 8, self.smm)
    }

    fn mem_write_phys(&mut self, pa: u32, width: u32, value: u64) {
        self.mem.dispatch_write(pa, width / 8, value, self.smm);
    }

    fn io_in(&self, port: u16, width: u8) -> u32 {
        self.io.read(port, width)
    }

    fn io_out(&mut self, port: u16, width: u8, value: u32) {
        self.io.write(port, width, value);
    }

    fn irq_ack(&mut self) -> Option<u8> {
        self.pic.ack()
    }

    fn cycles_consume(&mut self, n: u64) {
        self.cycle += n as i64;
    }

    fn smi_pending(&self) -> bool {
        self.smi_requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::NullCpu;
    use pcbus_device::{BusFlags, Device, DeviceDesc};

    struct StubDevice;
    impl Device for StubDevice {}

    fn trivial_desc() -> MachineDesc {
        MachineDesc {
            name: "Trivial Test Machine",
            internal_name: "trivial",
            ram_min: 64 * 1024,
            ram_max: 16 * 1024 * 1024,
            ram_granularity: 64 * 1024,
            init: |machine, _config| {
                machine
                    .devices_mut()
                    .add(
                        DeviceDesc { name: "stub", internal_name: "stub", flags: BusFlags::CORE, local: 0, config: None },
                        |_| Ok(Box::new(StubDevice) as Box<dyn Device>),
                    )
                    .map(|_| ())?;
                Ok(())
            },
        }
    }

    #[test]
    fn bring_up_rejects_ram_outside_the_descriptors_range() {
        let desc = trivial_desc();
        let err = Machine::bring_up(&desc, 32 * 1024, &ConfigResolver::new()).unwrap_err();
        assert!(matches!(err, BringUpError::RamSizeOutOfRange { .. }));
    }

    #[test]
    fn bring_up_rejects_misaligned_ram_size() {
        let desc = trivial_desc();
        let err = Machine::bring_up(&desc, 100 * 1024, &ConfigResolver::new()).unwrap_err();
        assert!(matches!(err, BringUpError::RamSizeMisaligned { .. }));
    }

    #[test]
    fn bring_up_succeeds_and_installs_devices() {
        let desc = trivial_desc();
        let machine = Machine::bring_up(&desc, 640 * 1024, &ConfigResolver::new()).unwrap();
        assert_eq!(machine.devices().len(), 1);
    }

    #[test]
    fn run_frame_consumes_exactly_the_requested_cycle_budget_with_null_cpu() {
        let desc = trivial_desc();
        let mut machine = Machine::bring_up(&desc, 640 * 1024, &ConfigResolver::new()).unwrap();
        let mut cpu = NullCpu::new(1);
        let outcome = machine.run_frame(&mut cpu, 100);
        assert_eq!(outcome, FrameOutcome::Continue);
        assert_eq!(machine.cycles(), 100);
    }

    #[test]
    fn shutdown_event_stops_the_frame_loop_early() {
        let desc = trivial_desc();
        let mut machine = Machine::bring_up(&desc, 640 * 1024, &ConfigResolver::new()).unwrap();
        let tx = machine.ui_sender();
        tx.send(UiEvent::Shutdown).unwrap();
        let mut cpu = NullCpu::new(1);
        // First frame call drains the event only after its inner loop, so it
        // still burns its budget before observing shutdown.
        let outcome = machine.run_frame(&mut cpu, 10);
        assert_eq!(outcome, FrameOutcome::ShutdownRequested);
        let outcome2 = machine.run_frame(&mut cpu, 10);
        assert_eq!(outcome2, FrameOutcome::ShutdownRequested);
        assert_eq!(machine.cycles(), 10);
    }

    #[test]
    fn bus_contract_mem_round_trips_through_the_machine() {
        let desc = trivial_desc();
        let mut machine = Machine::bring_up(&desc, 640 * 1024, &ConfigResolver::new()).unwrap();
        machine.mem_write_phys(0x1000, 32, 0xDEADBEEF);
        assert_eq!(machine.mem_read_phys(0x1000, 32), 0xDEADBEEF);
    }
}
