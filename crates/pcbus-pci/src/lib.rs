//! PCI Configuration Mechanism #1 and PIRQ steering — §4.5.
//!
//! `PciBus` owns the `CF8h` index register, the `CFCh` data window, a
//! 32-slot router, and the four PIRQ A-D lines. Resolving a card's interrupt
//! walks `card.INTx -> PIRQx -> IRQ -> PIC.raise` exactly as the spec
//! describes; the actual `raise` call goes through a caller-supplied
//! `pcbus_pic::PicPair` rather than PciBus owning one, since PCI and PIC are
//! independent leaf crates (§0 dependency direction: `pcbus-pci` depends on
//! `pcbus-pic` only for the IRQ-number type, not for PIC ownership).

use pcbus_io::{Port, PortHandler};
use pcbus_pic::PicPair;
use pcbus_regfile::RegisterFile;

pub const PCI_CONFIG_ADDRESS: u16 = 0xCF8;
pub const PCI_CONFIG_DATA: u16 = 0xCFC;

pub const PCI_SLOT_COUNT: usize = 32;

/// PCI interrupt pin, one of the four legal INTx wires a card can drive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntxPin {
    A,
    B,
    C,
    D,
}

impl IntxPin {
    fn index(self) -> usize {
        match self {
            IntxPin::A => 0,
            IntxPin::B => 1,
            IntxPin::C => 2,
            IntxPin::D => 3,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CardType {
    NorthBridge,
    Southbridge,
    Normal,
    Onboard,
    Agp,
}

/// Decoded `CF8h` contents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConfigAddress {
    pub enable: bool,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
    /// DWORD-aligned register offset (bits 7:2 of the index register, shifted).
    pub register: u8,
}

impl ConfigAddress {
    pub fn from_u32(value: u32) -> Self {
        Self {
            enable: value & 0x8000_0000 != 0,
            bus: ((value >> 16) & 0xFF) as u8,
            device: ((value >> 11) & 0x1F) as u8,
            function: ((value >> 8) & 0x07) as u8,
            register: (value & 0xFC) as u8,
        }
    }

    pub fn to_u32(self) -> u32 {
        (self.enable as u32) << 31
            | (self.bus as u32) << 16
            | (self.device as u32) << 11
            | (self.function as u32) << 8
            | (self.register as u32 & 0xFC)
    }
}

/// A populated PCI slot: a 256-byte configuration-space register file plus
/// its static INTx->PIRQ wiring (fixed at machine init, §4.5).
pub struct PciSlot {
    pub card_type: CardType,
    pub config: RegisterFile,
    /// `intx_to_pirq[pin] = Some(pirq_index 0..4)`, or `None` if that pin is
    /// unconnected.
    intx_to_pirq: [Option<usize>; 4],
}

impl PciSlot {
    pub fn new(card_type: CardType, config: RegisterFile) -> Self {
        Self { card_type, config, intx_to_pirq: [None; 4] }
    }

    /// Wires `pin` to PIRQ line `pirq` (0=A .. 3=D). The classic "rotation"
    /// convention (`PIRQ = (slot + pin_offset) % 4`) is computed by the
    /// caller at machine-init time and passed in here per slot.
    pub fn wire_intx(&mut self, pin: IntxPin, pirq: usize) {
        debug_assert!(pirq < 4);
        self.intx_to_pirq[pin.index()] = Some(pirq);
    }
}

/// Computes the classic BIOS "INTA on even slots rotates through PIRQA..D"
/// static wiring for `slot`'s `pin`, per §4.5.
pub fn classic_rotation_pirq(slot: u8, pin: IntxPin) -> usize {
    (slot as usize + pin.index()) % 4
}

pub struct PciBus {
    address: u32,
    slots: [Option<PciSlot>; PCI_SLOT_COUNT],
    /// PIRQ A-D routing registers: `Some(irq 0..16)` or `None` (disabled).
    pirq_routing: [Option<u8>; 4],
}

impl Default for PciBus {
    fn default() -> Self {
        Self::new()
    }
}

impl PciBus {
    pub fn new() -> Self {
        Self { address: 0, slots: std::array::from_fn(|_| None), pirq_routing: [None; 4] }
    }

    pub fn install(&mut self, slot: u8, card: PciSlot) {
        self.slots[slot as usize] = Some(card);
    }

    pub fn route_pirq(&mut self, pirq: usize, irq: Option<u8>) {
        self.pirq_routing[pirq] = irq;
    }

    pub fn pirq_routing(&self, pirq: usize) -> Option<u8> {
        self.pirq_routing[pirq]
    }

    /// `CF8h` index register write/read.
    pub fn write_address(&mut self, value: u32) {
        self.address = value;
    }

    pub fn read_address(&self) -> u32 {
        self.address
    }

    fn decoded(&self) -> ConfigAddress {
        ConfigAddress::from_u32(self.address)
    }

    /// `CFCh..CFFh` read, `byte_offset` in `0..4`. Unoccupied slots (or a
    /// disabled index register) read as all-ones, matching an empty PCI bus.
    pub fn read_data(&mut self, byte_offset: u32) -> u8 {
        let addr = self.decoded();
        if !addr.enable {
            return 0xFF;
        }
        let Some(slot) = self.slots[addr.device as usize].as_mut() else {
            return 0xFF;
        };
        let idx = addr.register as usize + byte_offset as usize;
        if idx >= slot.config.len() {
            return 0xFF;
        }
        slot.config.read(idx)
    }

    /// `CFCh..CFFh` write, `byte_offset` in `0..4`. Writes to an unoccupied
    /// slot, or with the index register's enable bit clear, are dropped.
    pub fn write_data(&mut self, byte_offset: u32, value: u8) {
        let addr = self.decoded();
        if !addr.enable {
            return;
        }
        let Some(slot) = self.slots[addr.device as usize].as_mut() else {
            return;
        };
        let idx = addr.register as usize + byte_offset as usize;
        if idx >= slot.config.len() {
            return;
        }
        slot.config.write(idx, value);
    }

    /// Walks `card.INTx -> PIRQx -> IRQ -> pic.raise`, per §4.5. No-op if the
    /// slot is empty, the pin is unwired, or the resolved PIRQ is routed to
    /// "disabled".
    pub fn raise_intx(&self, slot: u8, pin: IntxPin, pic: &mut PicPair) {
        let Some(card) = self.slots[slot as usize].as_ref() else { return };
        let Some(pirq) = card.intx_to_pirq[pin.index()] else { return };
        let Some(irq) = self.pirq_routing[pirq] else { return };
        pic.raise(irq);
    }

    pub fn lower_intx(&self, slot: u8, pin: IntxPin, pic: &mut PicPair) {
        let Some(card) = self.slots[slot as usize].as_ref() else { return };
        let Some(pirq) = card.intx_to_pirq[pin.index()] else { return };
        let Some(irq) = self.pirq_routing[pirq] else { return };
        pic.lower(irq);
    }
}

/// `PciBus` answers directly at `CF8h` (index, DWORD) and `CFCh..CFFh`
/// (data window, any width); register it with `pcbus-io::PortIoTable` at
/// `PCI_CONFIG_ADDRESS`/`PCI_CONFIG_DATA`, length 4 each.
impl PortHandler for PciBus {
    fn read32(&mut self, port: Port) -> Option<u32> {
        if port == PCI_CONFIG_ADDRESS {
            Some(self.read_address())
        } else {
            None
        }
    }
    fn write32(&mut self, port: Port, value: u32) -> bool {
        if port == PCI_CONFIG_ADDRESS {
            self.write_address(value);
            true
        } else {
            false
        }
    }
    fn read8(&mut self, port: Port) -> Option<u8> {
        if (PCI_CONFIG_DATA..PCI_CONFIG_DATA + 4).contains(&port) {
            Some(self.read_data((port - PCI_CONFIG_DATA) as u32))
        } else {
            None
        }
    }
    fn write8(&mut self, port: Port, value: u8) -> bool {
        if (PCI_CONFIG_DATA..PCI_CONFIG_DATA + 4).contains(&port) {
            self.write_data((port - PCI_CONFIG_DATA) as u32, value);
            true
        } else {
            false
        }
    }
}
