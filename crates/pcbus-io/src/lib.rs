//! 16-bit I/O port dispatch: the port table of §4.2.
//!
//! Every access first looks for a handler that implements the *exact*
//! requested width at the target port. If none exists, the access is
//! decomposed into consecutive single-byte accesses at `port, port+1, ...`,
//! each independently re-dispatched — so a 32-bit read spanning one device's
//! 8-bit handler and three unmapped ports correctly returns three `0xFF`
//! bytes alongside the one real byte.

use std::cell::RefCell;
use std::rc::Rc;

pub type Port = u16;

/// A device's port callback surface. Each method returns `None`/`false` to
/// mean "this handler has no direct implementation for this width" rather
/// than "the access failed" — the table itself decides what to do next.
pub trait PortHandler {
    fn read8(&mut self, port: Port) -> Option<u8> {
        let _ = port;
        None
    }
    fn read16(&mut self, port: Port) -> Option<u16> {
        let _ = port;
        None
    }
    fn read32(&mut self, port: Port) -> Option<u32> {
        let _ = port;
        None
    }
    fn write8(&mut self, port: Port, value: u8) -> bool {
        let _ = (port, value);
        false
    }
    fn write16(&mut self, port: Port, value: u16) -> bool {
        let _ = (port, value);
        false
    }
    fn write32(&mut self, port: Port, value: u32) -> bool {
        let _ = (port, value);
        false
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PortHandlerId(usize);

struct Registration {
    base: Port,
    length: u16,
    handler: Rc<RefCell<dyn PortHandler>>,
    removed: bool,
}

pub struct PortIoTable {
    regs: Vec<Registration>,
    /// Per-port list of registration indices covering it, oldest first.
    slots: Vec<Vec<usize>>,
}

impl Default for PortIoTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PortIoTable {
    pub fn new() -> Self {
        Self {
            regs: Vec::new(),
            slots: vec![Vec::new(); 1 << 16],
        }
    }

    /// Registers `handler` over `[port, port+length)`. Up to a handful of
    /// handlers may alias the same port (legacy ISA mirrors); the
    /// most-recently-registered handler that supports a given width wins
    /// dispatch for it. In debug builds, registering a second handler that
    /// already supports a width some other live registration supports at the
    /// same port logs a collision diagnostic (§4.2).
    pub fn sethandler(&mut self, port: Port, length: u16, handler: Rc<RefCell<dyn PortHandler>>) -> PortHandlerId {
        if cfg!(debug_assertions) {
            self.warn_on_collision(port, length, &handler);
        }
        let idx = self.regs.len();
        self.regs.push(Registration { base: port, length, handler, removed: false });
        for p in port..port.saturating_add(length).max(port) {
            if (p as usize) < self.slots.len() {
                self.slots[p as usize].push(idx);
            }
            if p == u16::MAX {
                break;
            }
        }
        PortHandlerId(idx)
    }

    /// Debug-only diagnostic: warns if a still-live registration already
    /// covers this port. Doesn't probe the new handler's widths (that would
    /// mean invoking its callbacks as a side effect of registration) —
    /// any overlap is surfaced, and actual dispatch still picks whichever
    /// registration is most recent to support the requested width.
    fn warn_on_collision(&self, port: Port, length: u16, _handler: &Rc<RefCell<dyn PortHandler>>) {
        for p in port..port.saturating_add(length).max(port) {
            if let Some(existing) = self.slots.get(p as usize).and_then(|v| v.last()) {
                if !self.regs[*existing].removed {
                    tracing::warn!(port = p, "port handler collision at registration time (debug build)");
                }
            }
            if p == u16::MAX {
                break;
            }
        }
    }

    pub fn removehandler(&mut self, id: PortHandlerId) {
        if let Some(reg) = self.regs.get_mut(id.0) {
            reg.removed = true;
        }
    }

    fn topmost(&self, port: Port) -> Option<&Registration> {
        self.slots
            .get(port as usize)?
            .iter()
            .rev()
            .map(|&idx| &self.regs[idx])
            .find(|r| !r.removed)
    }

    pub fn inb(&self, port: Port) -> u8 {
        match self.topmost(port) {
            Some(r) => r.handler.borrow_mut().read8(port).unwrap_or(0xFF),
            None => 0xFF,
        }
    }

    pub fn inw(&self, port: Port) -> u16 {
        if let Some(r) = self.topmost(port) {
            if let Some(v) = r.handler.borrow_mut().read16(port) {
                return v;
            }
        }
        u16::from_le_bytes([self.inb(port), self.inb(port.wrapping_add(1))])
    }

    pub fn inl(&self, port: Port) -> u32 {
        if let Some(r) = self.topmost(port) {
            if let Some(v) = r.handler.borrow_mut().read32(port) {
                return v;
            }
        }
        u32::from_le_bytes([
            self.inb(port),
            self.inb(port.wrapping_add(1)),
            self.inb(port.wrapping_add(2)),
            self.inb(port.wrapping_add(3)),
        ])
    }

    /// Generic width-parameterized read (`width` in `{1, 2, 4}`), convenient
    /// for CPU `IN`-instruction decode that already knows the operand size.
    pub fn read(&self, port: Port, width: u8) -> u32 {
        match width {
            1 => self.inb(port) as u32,
            2 => self.inw(port) as u32,
            4 => self.inl(port),
            _ => panic!("unsupported port access width {width}"),
        }
    }

    pub fn outb(&self, port: Port, value: u8) {
        if let Some(r) = self.topmost(port) {
            r.handler.borrow_mut().write8(port, value);
        }
    }

    pub fn outw(&self, port: Port, value: u16) {
        if let Some(r) = self.topmost(port) {
            if r.handler.borrow_mut().write16(port, value) {
                return;
            }
        }
        let bytes = value.to_le_bytes();
        self.outb(port, bytes[0]);
        self.outb(port.wrapping_add(1), bytes[1]);
    }

    pub fn outl(&self, port: Port, value: u32) {
        if let Some(r) = self.topmost(port) {
            if r.handler.borrow_mut().write32(port, value) {
                return;
            }
        }
        let bytes = value.to_le_bytes();
        self.outb(port, bytes[0]);
        self.outb(port.wrapping_add(1), bytes[1]);
        self.outb(port.wrapping_add(2), bytes[2]);
        self.outb(port.wrapping_add(3), bytes[3]);
    }

    pub fn write(&self, port: Port, width: u8, value: u32) {
        match width {
            1 => self.outb(port, value as u8),
            2 => self.outw(port, value as u16),
            4 => self.outl(port, value),
            _ => panic!("unsupported port access width {width}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct LastByte {
        last: u8,
    }
    impl PortHandler for LastByte {
        fn read8(&mut self, _port: Port) -> Option<u8> {
            Some(self.last)
        }
        fn write8(&mut self, _port: Port, value: u8) -> bool {
            self.last = value;
            true
        }
    }

    #[test]
    fn unhandled_port_reads_ff_and_drops_writes() {
        let table = PortIoTable::new();
        assert_eq!(table.inb(0x80), 0xFF);
        table.outb(0x80, 0x12); // must not panic
        assert_eq!(table.inl(0x80), 0xFFFF_FFFF);
    }

    /// A 2-byte device register backing §8 scenario 1: each port offset off
    /// `base` keeps its own byte, unlike `LastByte`'s single shared cell.
    struct TwoByte {
        base: Port,
        bytes: [u8; 2],
    }
    impl PortHandler for TwoByte {
        fn read8(&mut self, port: Port) -> Option<u8> {
            Some(self.bytes[(port - self.base) as usize])
        }
        fn write8(&mut self, port: Port, value: u8) -> bool {
            self.bytes[(port - self.base) as usize] = value;
            true
        }
    }

    /// Literal scenario from §8: an 8-bit handler spanning 0x3F0-0x3F1, mixed-
    /// width access sequence, `inl` recombining both handled bytes with the
    /// unmapped upper two as `0xFF`.
    #[test]
    fn port_alias_at_different_widths() {
        let mut table = PortIoTable::new();
        let dev = Rc::new(RefCell::new(TwoByte { base: 0x3F0, bytes: [0, 0] }));
        table.sethandler(0x3F0, 2, dev.clone());

        table.outb(0x3F0, 0xAB);
        assert_eq!(dev.borrow().bytes[0], 0xAB);

        table.outw(0x3F0, 0xCDEF);
        // low byte (0xEF) to 0x3F0, high byte (0xCD) to 0x3F1 — both handled.
        assert_eq!(dev.borrow().bytes, [0xEF, 0xCD]);

        assert_eq!(table.inl(0x3F0), 0xFFFF_CDEF);
    }

    #[test]
    fn exact_width_handler_is_preferred_over_decomposition() {
        struct Wide;
        impl PortHandler for Wide {
            fn read32(&mut self, _port: Port) -> Option<u32> {
                Some(0x1234_5678)
            }
        }
        let mut table = PortIoTable::new();
        table.sethandler(0xCF8, 4, Rc::new(RefCell::new(Wide)));
        assert_eq!(table.inl(0xCF8), 0x1234_5678);
    }

    #[test]
    fn removehandler_reverts_to_unmapped() {
        let mut table = PortIoTable::new();
        let dev = Rc::new(RefCell::new(LastByte { last: 0x42 }));
        let id = table.sethandler(0x60, 1, dev);
        assert_eq!(table.inb(0x60), 0x42);
        table.removehandler(id);
        assert_eq!(table.inb(0x60), 0xFF);
    }
}
