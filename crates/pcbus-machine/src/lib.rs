//! Machine descriptor, device bring-up, execution loop, and the CPU/NVR
//! contracts that tie the rest of the bus-fabric crates together (§4.8,
//! §4.9, §5, §6).

mod cpu;
mod machine;
mod nvr;
mod render;

pub use cpu::{BusContract, CpuModel, NullCpu};
pub use machine::{BringUpError, FrameOutcome, Machine, MachineDesc, UiEvent};
pub use nvr::{file_store, nvr_key, FileNvrStore, NvrError, NvrStore};
pub use render::RenderHandoff;

pub use pcbus_device::{BusFlags, BusRef, ConfigField, ConfigKind, ConfigResolver, ConfigValue, Device, DeviceArena, DeviceDesc, DeviceError};
pub use pcbus_dma::{DmaControllers, DmaMode, DmaOutcome};
pub use pcbus_io::{Port, PortHandler, PortIoTable};
pub use pcbus_mem::{MemError, MemHandler, MemoryMap, SmmState};
pub use pcbus_pci::{classic_rotation_pirq, CardType, ConfigAddress, IntxPin, PciBus, PciSlot};
pub use pcbus_pic::{Pic8259, PicPair};
pub use pcbus_timers::{Cycle, TimerId, TimerQueue};
