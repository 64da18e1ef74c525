//! Physical address space dispatch: the memory-map table of §4.1.
//!
//! A [`MemoryMap`] owns the machine's flat RAM array plus a registration-order
//! stack of overlay [`MemRange`]s (ROM, MMIO, alias, SMRAM). Dispatch always
//! resolves to the most-recently-registered *enabled* range covering an
//! address; RAM itself is just range zero, registered implicitly by `new`.

use std::cell::RefCell;
use std::rc::Rc;

use bitflags::bitflags;
use thiserror::Error;

pub type PhysAddr = u32;

bitflags! {
    /// Mirrors `spec.md` §3's `MemFlags` set.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MemFlags: u32 {
        /// Access lands on the shared system RAM backing.
        const INTERNAL  = 1 << 0;
        /// Access goes to the range's registered callback.
        const EXTERNAL  = 1 << 1;
        /// Reads hit backing; writes are dropped unless the range also has flash semantics.
        const ROM       = 1 << 2;
        /// Subject to south-bridge ROM chip-select shadow aliasing.
        const ROMCS     = 1 << 3;
        /// Only visible while the CPU is in SMM.
        const SMRAM     = 1 << 4;
        /// Visible in SMM, or outside it when the chipset's D_OPEN bit is set.
        const SMRAM_EX  = 1 << 5;
        /// Forwards to another range at a different base.
        const ALIAS     = 1 << 6;
        /// Registered but inert until [`MemoryMap::enable`].
        const DISABLED  = 1 << 7;
    }
}

const PAGE_SIZE: u32 = 4096;

#[derive(Debug, Error)]
pub enum MemError {
    #[error("range [{base:#x}, {base:#x}+{length:#x}) is invalid")]
    InvalidRange { base: PhysAddr, length: u32 },
    #[error("unknown range id {0:?}")]
    UnknownRange(RangeId),
}

/// Opaque handle returned by [`MemoryMap::add`]; stable across `set_addr`/`set_exec`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RangeId(usize);

/// Callback surface for an `External` range. Default methods synthesize wider
/// or narrower accesses out of whichever width a handler actually implements,
/// the same narrowest-match-preferred convention §4.2 specifies for ports.
pub trait MemHandler {
    fn read8(&mut self, offset: u32) -> u8 {
        let _ = offset;
        0xFF
    }
    fn read16(&mut self, offset: u32) -> u16 {
        u16::from_le_bytes([self.read8(offset), self.read8(offset + 1)])
    }
    fn read32(&mut self, offset: u32) -> u32 {
        u32::from_le_bytes([
            self.read8(offset),
            self.read8(offset + 1),
            self.read8(offset + 2),
            self.read8(offset + 3),
        ])
    }
    fn write8(&mut self, offset: u32, value: u8) {
        let _ = (offset, value);
    }
    fn write16(&mut self, offset: u32, value: u16) {
        let bytes = value.to_le_bytes();
        self.write8(offset, bytes[0]);
        self.write8(offset + 1, bytes[1]);
    }
    fn write32(&mut self, offset: u32, value: u32) {
        let bytes = value.to_le_bytes();
        self.write8(offset, bytes[0]);
        self.write8(offset + 1, bytes[1]);
        self.write8(offset + 2, bytes[2]);
        self.write8(offset + 3, bytes[3]);
    }
}

enum Backing {
    /// Shares the map's flat RAM array; offset is `base` of the owning range.
    Ram,
    Rom(Rc<[u8]>),
    Handler(Rc<RefCell<dyn MemHandler>>),
    /// Forwards every access to `target`'s corresponding offset.
    Alias { target: PhysAddr },
}

struct MemRangeEntry {
    base: PhysAddr,
    length: u32,
    flags: MemFlags,
    backing: Backing,
}

impl MemRangeEntry {
    fn enabled(&self) -> bool {
        !self.flags.contains(MemFlags::DISABLED)
    }

    fn contains(&self, pa: PhysAddr) -> bool {
        pa >= self.base && (pa - self.base) < self.length
    }
}

/// In-SMM visibility query a host passes to [`MemoryMap::dispatch_read`]/`dispatch_write`.
/// Most callers (CPU not in SMM) pass `SmmState::Outside`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SmmState {
    Outside,
    /// SMM is active, or the chipset's D_OPEN bit makes `Smram`/`SmramEx` visible anyway.
    InsideOrOpen,
}

pub struct MemoryMap {
    ram: Vec<u8>,
    ranges: Vec<MemRangeEntry>,
    /// Per-4KiB-page list of range indices covering it, oldest-registered first.
    page_index: Vec<Vec<usize>>,
}

impl MemoryMap {
    /// Creates the map with `ram_size` bytes of system RAM registered as range
    /// zero (`Internal`), covering `[0, ram_size)`. Everything outside that,
    /// until further ranges are `add`ed, reads as `0xFF` and drops writes.
    pub fn new(ram_size: u32) -> Self {
        let mut map = Self {
            ram: vec![0; ram_size as usize],
            ranges: Vec::new(),
            page_index: Vec::new(),
        };
        if ram_size > 0 {
            map.push_range(0, ram_size, MemFlags::INTERNAL, Backing::Ram);
        }
        map
    }

    fn push_range(&mut self, base: PhysAddr, length: u32, flags: MemFlags, backing: Backing) -> RangeId {
        let idx = self.ranges.len();
        self.ranges.push(MemRangeEntry { base, length, flags, backing });
        self.reindex_range(idx);
        RangeId(idx)
    }

    fn reindex_range(&mut self, idx: usize) {
        let (base, length) = {
            let r = &self.ranges[idx];
            (r.base, r.length)
        };
        if length == 0 {
            return;
        }
        let first_page = base / PAGE_SIZE;
        let last_page = base.saturating_add(length - 1) / PAGE_SIZE;
        let needed = last_page as usize + 1;
        if self.page_index.len() < needed {
            self.page_index.resize_with(needed, Vec::new);
        }
        for page in first_page..=last_page {
            self.page_index[page as usize].push(idx);
        }
    }

    fn rebuild_index(&mut self) {
        self.page_index.clear();
        for idx in 0..self.ranges.len() {
            self.reindex_range(idx);
        }
    }

    /// Registers a new overlay range. Ranges may overlap; the most recently
    /// added enabled range covering an address wins dispatch.
    pub fn add(
        &mut self,
        base: PhysAddr,
        length: u32,
        flags: MemFlags,
        handler: Rc<RefCell<dyn MemHandler>>,
    ) -> Result<RangeId, MemError> {
        if length == 0 {
            return Err(MemError::InvalidRange { base, length });
        }
        Ok(self.push_range(base, length, flags | MemFlags::EXTERNAL, Backing::Handler(handler)))
    }

    /// Registers a read-only ROM-backed range.
    pub fn add_rom(&mut self, base: PhysAddr, data: Rc<[u8]>) -> Result<RangeId, MemError> {
        if data.is_empty() {
            return Err(MemError::InvalidRange { base, length: 0 });
        }
        let length = data.len() as u32;
        Ok(self.push_range(base, length, MemFlags::ROM, Backing::Rom(data)))
    }

    /// Registers a range that forwards every access to `target`'s matching
    /// offset (ROM shadow aliasing at `F0000-FFFFF` / `FFFF0000-FFFFFFFF`).
    pub fn add_alias(&mut self, base: PhysAddr, length: u32, target: PhysAddr) -> Result<RangeId, MemError> {
        if length == 0 {
            return Err(MemError::InvalidRange { base, length });
        }
        Ok(self.push_range(base, length, MemFlags::ALIAS, Backing::Alias { target }))
    }

    /// Replaces the handler on an already-registered `External` range.
    pub fn set_handlers(&mut self, id: RangeId, handler: Rc<RefCell<dyn MemHandler>>) -> Result<(), MemError> {
        let r = self.ranges.get_mut(id.0).ok_or(MemError::UnknownRange(id))?;
        r.backing = Backing::Handler(handler);
        Ok(())
    }

    /// Relocates a range's base address (PCI BAR reprogramming, framebuffer
    /// aperture moves). The range keeps its length, flags, and backing.
    pub fn set_addr(&mut self, id: RangeId, new_base: PhysAddr) -> Result<(), MemError> {
        {
            let r = self.ranges.get_mut(id.0).ok_or(MemError::UnknownRange(id))?;
            r.base = new_base;
        }
        self.rebuild_index();
        Ok(())
    }

    /// Rebinds a range onto a different ROM image (flash mode changes).
    pub fn set_exec(&mut self, id: RangeId, data: Rc<[u8]>) -> Result<(), MemError> {
        let r = self.ranges.get_mut(id.0).ok_or(MemError::UnknownRange(id))?;
        r.backing = Backing::Rom(data);
        Ok(())
    }

    pub fn enable(&mut self, id: RangeId) -> Result<(), MemError> {
        let r = self.ranges.get_mut(id.0).ok_or(MemError::UnknownRange(id))?;
        r.flags.remove(MemFlags::DISABLED);
        Ok(())
    }

    pub fn disable(&mut self, id: RangeId) -> Result<(), MemError> {
        let r = self.ranges.get_mut(id.0).ok_or(MemError::UnknownRange(id))?;
        r.flags.insert(MemFlags::DISABLED);
        Ok(())
    }

    /// Returns the index of the topmost enabled, currently-visible range
    /// covering `pa`, resolving one level of `Alias` indirection.
    fn resolve(&self, pa: PhysAddr, smm: SmmState) -> Option<(usize, u32)> {
        let page = (pa / PAGE_SIZE) as usize;
        let candidates = self.page_index.get(page)?;
        for &idx in candidates.iter().rev() {
            let r = &self.ranges[idx];
            if !r.enabled() || !r.contains(pa) {
                continue;
            }
            if (r.flags.contains(MemFlags::SMRAM) || r.flags.contains(MemFlags::SMRAM_EX))
                && smm == SmmState::Outside
            {
                continue;
            }
            return Some((idx, pa - r.base));
        }
        None
    }

    fn read_one(&self, idx: usize, offset: u32) -> Option<MemByteSource> {
        match &self.ranges[idx].backing {
            Backing::Ram => Some(MemByteSource::Ram(offset)),
            Backing::Rom(data) => data.get(offset as usize).copied().map(MemByteSource::Byte),
            Backing::Handler(h) => Some(MemByteSource::Handler(h.clone(), offset)),
            Backing::Alias { target } => {
                let resolved_pa = target.wrapping_add(offset);
                self.resolve(resolved_pa, SmmState::Outside)
                    .and_then(|(idx2, off2)| self.read_one(idx2, off2))
            }
        }
    }

    /// Dispatches a read of `width` bytes (1, 2, 4, or 8) at `pa`. When the
    /// whole access lies inside one covering range, it is dispatched as a
    /// single call into that range's backing — for a `Handler`, its matching
    /// `read16`/`read32` method, per §4.1's width-sensitive register
    /// requirement. Only a `width` of 8 (no wide `MemHandler` method exists
    /// for it), or an access that crosses into a different range or unmapped
    /// space partway through, falls back to byte-by-byte dispatch, recombined
    /// little-endian. Unmapped addresses read as all-`0xFF`.
    pub fn dispatch_read(&self, pa: PhysAddr, width: u32, smm: SmmState) -> u64 {
        debug_assert!(matches!(width, 1 | 2 | 4 | 8));
        if let Some(v) = self.try_wide_read(pa, width, smm) {
            return v;
        }
        let mut bytes = [0xFFu8; 8];
        for i in 0..width {
            let byte_pa = pa.wrapping_add(i);
            bytes[i as usize] = self.read_byte(byte_pa, smm);
        }
        u64::from_le_bytes(bytes)
    }

    /// Returns `Some` when `[pa, pa+width)` stays entirely within the one
    /// range covering `pa`, dispatching the full width directly to that
    /// range's backing; `None` tells the caller to fall back to byte splitting.
    fn try_wide_read(&self, pa: PhysAddr, width: u32, smm: SmmState) -> Option<u64> {
        if width == 1 {
            return None;
        }
        let (idx, offset) = self.resolve(pa, smm)?;
        let r = &self.ranges[idx];
        if offset.checked_add(width)? > r.length {
            return None;
        }
        match &r.backing {
            Backing::Handler(h) => {
                let mut h = h.borrow_mut();
                match width {
                    2 => Some(h.read16(offset) as u64),
                    4 => Some(h.read32(offset) as u64),
                    _ => None,
                }
            }
            Backing::Alias { target } => {
                let resolved_pa = target.wrapping_add(offset);
                Some(self.dispatch_read(resolved_pa, width, SmmState::Outside))
            }
            Backing::Ram | Backing::Rom(_) => None,
        }
    }

    fn read_byte(&self, pa: PhysAddr, smm: SmmState) -> u8 {
        match self.resolve(pa, smm) {
            None => 0xFF,
            Some((idx, offset)) => match self.read_one(idx, offset) {
                Some(MemByteSource::Byte(b)) => b,
                Some(MemByteSource::Ram(off)) => self.ram.get(off as usize).copied().unwrap_or(0xFF),
                Some(MemByteSource::Handler(h, off)) => h.borrow_mut().read8(off),
                None => 0xFF,
            },
        }
    }

    /// Dispatches a write of `width` bytes (1, 2, 4, or 8) at `pa`, preferring
    /// (per [`dispatch_read`](Self::dispatch_read)'s same rule) a single
    /// full-width call into the covering range's backing over a byte split.
    /// Writes to unmapped addresses, or into `Rom`-backed ranges, are
    /// silently dropped.
    pub fn dispatch_write(&mut self, pa: PhysAddr, width: u32, value: u64, smm: SmmState) {
        debug_assert!(matches!(width, 1 | 2 | 4 | 8));
        if self.try_wide_write(pa, width, value, smm) {
            return;
        }
        let bytes = value.to_le_bytes();
        for i in 0..width {
            self.write_byte(pa.wrapping_add(i), bytes[i as usize], smm);
        }
    }

    fn try_wide_write(&mut self, pa: PhysAddr, width: u32, value: u64, smm: SmmState) -> bool {
        if width == 1 {
            return false;
        }
        let Some((idx, offset)) = self.resolve(pa, smm) else {
            return false;
        };
        // Extracted to avoid borrowing `self.ranges[idx]` across the alias recursion below.
        enum Action {
            Handler(Rc<RefCell<dyn MemHandler>>),
            Alias(PhysAddr),
            NoWideMethod,
        }
        let r = &self.ranges[idx];
        if offset.checked_add(width).map_or(true, |end| end > r.length) {
            return false;
        }
        let action = match &r.backing {
            Backing::Handler(h) => Action::Handler(h.clone()),
            Backing::Alias { target } => Action::Alias(target.wrapping_add(offset)),
            Backing::Ram | Backing::Rom(_) => Action::NoWideMethod,
        };
        match action {
            Action::Handler(h) => {
                let mut h = h.borrow_mut();
                match width {
                    2 => {
                        h.write16(offset, value as u16);
                        true
                    }
                    4 => {
                        h.write32(offset, value as u32);
                        true
                    }
                    _ => false,
                }
            }
            Action::Alias(resolved_pa) => {
                self.dispatch_write(resolved_pa, width, value, SmmState::Outside);
                true
            }
            Action::NoWideMethod => false,
        }
    }

    fn write_byte(&mut self, pa: PhysAddr, value: u8, smm: SmmState) {
        let Some((idx, offset)) = self.resolve(pa, smm) else {
            return;
        };
        self.write_one(idx, offset, value, smm);
    }

    fn write_one(&mut self, idx: usize, offset: u32, value: u8, smm: SmmState) {
        // Extracted to avoid borrowing `self.ranges[idx]` across the alias recursion below.
        enum Action {
            Ram,
            Handler(Rc<RefCell<dyn MemHandler>>),
            Alias(PhysAddr),
            Drop,
        }
        let action = match &self.ranges[idx].backing {
            Backing::Ram => Action::Ram,
            Backing::Rom(_) => Action::Drop,
            Backing::Handler(h) => Action::Handler(h.clone()),
            Backing::Alias { target } => Action::Alias(target.wrapping_add(offset)),
        };
        match action {
            Action::Ram => {
                if let Some(slot) = self.ram.get_mut(offset as usize) {
                    *slot = value;
                }
            }
            Action::Handler(h) => h.borrow_mut().write8(offset, value),
            Action::Alias(resolved_pa) => self.write_byte(resolved_pa, value, smm),
            Action::Drop => {}
        }
    }

    pub fn read8(&self, pa: PhysAddr) -> u8 {
        self.dispatch_read(pa, 1, SmmState::Outside) as u8
    }
    pub fn read16(&self, pa: PhysAddr) -> u16 {
        self.dispatch_read(pa, 2, SmmState::Outside) as u16
    }
    pub fn read32(&self, pa: PhysAddr) -> u32 {
        self.dispatch_read(pa, 4, SmmState::Outside) as u32
    }
    pub fn write8(&mut self, pa: PhysAddr, value: u8) {
        self.dispatch_write(pa, 1, value as u64, SmmState::Outside);
    }
    pub fn write16(&mut self, pa: PhysAddr, value: u16) {
        self.dispatch_write(pa, 2, value as u64, SmmState::Outside);
    }
    pub fn write32(&mut self, pa: PhysAddr, value: u32) {
        self.dispatch_write(pa, 4, value as u64, SmmState::Outside);
    }

    /// Bulk copy out of guest RAM/ROM for DMA-style transfers. Refuses to
    /// touch `External` (MMIO) ranges; callers needing MMIO side effects
    /// should go through `dispatch_read`/`dispatch_write` one unit at a time.
    pub fn read_bytes(&self, pa: PhysAddr, out: &mut [u8]) {
        for (i, b) in out.iter_mut().enumerate() {
            *b = self.read_byte(pa.wrapping_add(i as u32), SmmState::Outside);
        }
    }

    pub fn write_bytes(&mut self, pa: PhysAddr, data: &[u8]) {
        for (i, &b) in data.iter().enumerate() {
            self.write_byte(pa.wrapping_add(i as u32), b, SmmState::Outside);
        }
    }
}

enum MemByteSource {
    Byte(u8),
    Ram(u32),
    Handler(Rc<RefCell<dyn MemHandler>>, u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    struct LastByte {
        last: u8,
    }

    impl MemHandler for LastByte {
        fn read8(&mut self, _offset: u32) -> u8 {
            self.last
        }
        fn write8(&mut self, _offset: u32, value: u8) {
            self.last = value;
        }
    }

    #[test]
    fn unmapped_reads_ff_and_drops_writes() {
        let map = MemoryMap::new(0);
        assert_eq!(map.read8(0x1234), 0xFF);
        assert_eq!(map.read32(0x1234), 0xFFFF_FFFF);
    }

    #[test]
    fn ram_round_trips() {
        let mut map = MemoryMap::new(0x10000);
        map.write32(0x100, 0xDEAD_BEEF);
        assert_eq!(map.read32(0x100), 0xDEAD_BEEF);
    }

    #[test]
    fn rom_writes_are_dropped() {
        let mut map = MemoryMap::new(0x1000);
        map.add_rom(0xF0000 & 0xFFF, Rc::from([0xAAu8, 0xBB, 0xCC, 0xDD])).unwrap();
        let base = 0xF0000 & 0xFFF;
        map.write32(base, 0x1122_3344);
        assert_eq!(map.read32(base), 0xDDCC_BBAA);
    }

    #[test]
    fn overlay_shadows_ram_and_disable_restores_it() {
        let mut map = MemoryMap::new(0x2000);
        map.write8(0x100, 0x11);
        let rom: Rc<[u8]> = Rc::from([0x99u8; 16]);
        let id = map.add_rom(0x100, rom).unwrap();
        // ROM overlay (registered after RAM) wins.
        assert_eq!(map.read8(0x100), 0x99);
        map.disable(id).unwrap();
        // RAM shows through again once the overlay is disabled.
        assert_eq!(map.read8(0x100), 0x11);
        map.enable(id).unwrap();
        assert_eq!(map.read8(0x100), 0x99);
    }

    #[test]
    fn mmio_handler_routes_narrow_and_wide_access() {
        let mut map = MemoryMap::new(0x1000);
        let dev = Rc::new(RefCell::new(LastByte { last: 0 }));
        map.add(0x3F0, 4, MemFlags::empty(), dev.clone()).unwrap();
        map.write8(0x3F0, 0xAB);
        assert_eq!(dev.borrow().last, 0xAB);
        map.write16(0x3F0, 0xCDEF);
        // Low byte (0xEF) is written to offset 0, high byte (0xCD) to offset 1;
        // the handler only remembers the most recent byte, so 0xCD lands last.
        assert_eq!(dev.borrow().last, 0xCD);
    }

    /// A width-sensitive register (e.g. a command/status port that behaves
    /// differently on a 16-bit access than on two 8-bit ones) only works if
    /// `dispatch_read`/`dispatch_write` actually reach `read16`/`write32`
    /// rather than always decomposing to `read8`/`write8`.
    struct WidthSensitive {
        last_write_width: u32,
        status: u32,
    }

    impl MemHandler for WidthSensitive {
        fn read8(&mut self, _offset: u32) -> u8 {
            0
        }
        fn read32(&mut self, _offset: u32) -> u32 {
            self.status
        }
        fn write16(&mut self, _offset: u32, value: u16) {
            self.last_write_width = 2;
            self.status = value as u32;
        }
        fn write32(&mut self, _offset: u32, value: u32) {
            self.last_write_width = 4;
            self.status = value;
        }
    }

    #[test]
    fn wide_mmio_handler_methods_are_reachable_within_one_range() {
        let mut map = MemoryMap::new(0x1000);
        let dev = Rc::new(RefCell::new(WidthSensitive { last_write_width: 0, status: 0 }));
        map.add(0x3F0, 4, MemFlags::empty(), dev.clone()).unwrap();

        map.write16(0x3F0, 0x1234);
        assert_eq!(dev.borrow().last_write_width, 2);

        map.write32(0x3F0, 0xCAFE_BABE);
        assert_eq!(dev.borrow().last_write_width, 4);
        assert_eq!(map.read32(0x3F0), 0xCAFE_BABE);
    }

    #[test]
    fn wide_access_crossing_a_range_boundary_still_splits_to_bytes() {
        let mut map = MemoryMap::new(0x1000);
        let dev = Rc::new(RefCell::new(WidthSensitive { last_write_width: 0, status: 0 }));
        // Only 2 bytes wide: a 4-byte write at its base crosses out of it.
        map.add(0x3F0, 2, MemFlags::empty(), dev.clone()).unwrap();
        map.write32(0x3F0, 0xCAFE_BABE);
        // The crossing access never reaches write32/write16; it falls back to
        // write8 (unimplemented here, so a no-op) one byte at a time.
        assert_eq!(dev.borrow().last_write_width, 0);
    }

    #[test]
    fn alias_range_forwards_to_target() {
        let mut map = MemoryMap::new(0x20000);
        map.write32(0x1234, 0x1234_5678);
        map.add_alias(0x10000, 0x10000, 0).unwrap();
        assert_eq!(map.read32(0x10000 + 0x1234), 0x1234_5678);
    }

    #[test]
    fn smram_hidden_outside_smm() {
        let mut map = MemoryMap::new(0x2000);
        let dev = Rc::new(RefCell::new(LastByte { last: 0x55 }));
        map.add(0x1000, 0x10, MemFlags::SMRAM, dev).unwrap();
        // Outside SMM the SMRAM overlay is invisible; RAM (freshly zeroed) shows through.
        assert_eq!(map.read8(0x1000), 0x00);
        assert_eq!(map.dispatch_read(0x1000, 1, SmmState::InsideOrOpen), 0x55);
    }

    proptest::proptest! {
        #[test]
        fn ram_round_trip_prop(addr in 0u32..0xF000, value: u32) {
            let mut map = MemoryMap::new(0x10000);
            map.write32(addr, value);
            proptest::prop_assert_eq!(map.read32(addr), value);
        }
    }
}
