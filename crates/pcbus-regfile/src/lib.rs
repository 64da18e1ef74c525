//! Indexed-byte register files with per-register write masks and
//! side-effect callbacks — §4.7. Every chipset north/south bridge, Super-I/O
//! chip, and flash/ACPI block in the corpus reduces to this one abstraction;
//! centralizing it is what removes most of the chipset boilerplate that a
//! line-by-line port would otherwise duplicate per device.

/// `write_masks`-gated byte array. `write(idx, val)` only ever changes bits
/// the mask allows; `on_write` fires exactly once per call that actually
/// changes a visible byte, carrying old and new values so a chipset callback
/// can reprogram other subsystems (remap a UART, flip a shadow-RAM window).
pub struct RegisterFile {
    regs: Vec<u8>,
    defaults: Vec<u8>,
    write_masks: Vec<u8>,
    on_write: Option<Box<dyn FnMut(usize, u8, u8)>>,
    on_read: Option<Box<dyn FnMut(usize) -> Option<u8>>>,
}

impl RegisterFile {
    /// `size` registers, all zero-valued, fully writable (mask `0xFF`).
    pub fn new(size: usize) -> Self {
        Self::with_defaults(vec![0; size])
    }

    /// `size` registers initialized to `defaults`, fully writable.
    pub fn with_defaults(defaults: Vec<u8>) -> Self {
        let write_masks = vec![0xFF; defaults.len()];
        Self { regs: defaults.clone(), defaults, write_masks, on_write: None, on_read: None }
    }

    pub fn len(&self) -> usize {
        self.regs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regs.is_empty()
    }

    /// Sets the write mask for a single index. Bits clear in the mask are
    /// vendor-fixed (read-only) fields: a write only ever updates the bits
    /// the mask allows, preserving the rest of the byte from its old value.
    pub fn set_write_mask(&mut self, idx: usize, mask: u8) {
        self.write_masks[idx] = mask;
    }

    pub fn set_write_masks(&mut self, masks: &[u8]) {
        debug_assert_eq!(masks.len(), self.write_masks.len());
        self.write_masks.copy_from_slice(masks);
    }

    /// Installs the single post-write callback, invoked with `(idx, old, new)`
    /// whenever a write actually changes a visible byte.
    pub fn set_on_write(&mut self, cb: Box<dyn FnMut(usize, u8, u8)>) {
        self.on_write = Some(cb);
    }

    /// Installs a read interceptor; returning `None` falls back to the stored
    /// byte (used for fields that reflect live hardware status rather than a
    /// passively stored value).
    pub fn set_on_read(&mut self, cb: Box<dyn FnMut(usize) -> Option<u8>>) {
        self.on_read = Some(cb);
    }

    /// `stored = (old & !mask) | (val & mask)`; fires `on_write` iff
    /// `stored != old`.
    pub fn write(&mut self, idx: usize, val: u8) {
        let old = self.regs[idx];
        let mask = self.write_masks[idx];
        let stored = (old & !mask) | (val & mask);
        if stored != old {
            self.regs[idx] = stored;
            if let Some(cb) = &mut self.on_write {
                cb(idx, old, stored);
            }
        }
    }

    /// Reads through the `on_read` hook if one is installed.
    pub fn read(&mut self, idx: usize) -> u8 {
        if let Some(cb) = &mut self.on_read {
            if let Some(v) = cb(idx) {
                return v;
            }
        }
        self.regs[idx]
    }

    /// Reads the stored byte directly, bypassing any `on_read` hook. Used by
    /// callbacks that need the file's own idea of its state rather than the
    /// live-status value a hook might substitute.
    pub fn read_raw(&self, idx: usize) -> u8 {
        self.regs[idx]
    }

    /// Restores every register to its power-on default. Does not fire
    /// `on_write` — a reset is not a guest-visible register write.
    pub fn reset_to_defaults(&mut self) {
        self.regs.copy_from_slice(&self.defaults);
    }
}

/// An indexed region gated by a selector register: writes/reads to indices
/// in `[region_start, region_start + region_len)` are routed to whichever
/// page `base`'s selector byte currently names. Writes to a page beyond the
/// configured set are silent NOPs; reads return `0xFF` (§4.7 "Paged
/// variant").
pub struct PagedRegisterFile {
    base: RegisterFile,
    selector_index: usize,
    region_start: usize,
    region_len: usize,
    pages: Vec<RegisterFile>,
}

impl PagedRegisterFile {
    /// `base` carries the unpaged registers plus the selector byte at
    /// `selector_index`; `pages` (at most 16, per §4.7) each cover
    /// `region_len` bytes mapped at `[region_start, region_start+region_len)`
    /// in the flat index space.
    pub fn new(base: RegisterFile, selector_index: usize, region_start: usize, region_len: usize, pages: Vec<RegisterFile>) -> Self {
        debug_assert!(pages.len() <= 16, "§4.7 caps paged register files at 16 pages");
        debug_assert!(pages.iter().all(|p| p.len() == region_len));
        Self { base, selector_index, region_start, region_len, pages }
    }

    fn in_region(&self, idx: usize) -> bool {
        idx >= self.region_start && idx < self.region_start + self.region_len
    }

    fn current_page(&self) -> Option<usize> {
        let page = self.base.read_raw(self.selector_index) as usize;
        (page < self.pages.len()).then_some(page)
    }

    pub fn write(&mut self, idx: usize, val: u8) {
        if !self.in_region(idx) {
            self.base.write(idx, val);
            return;
        }
        match self.current_page() {
            Some(page) => self.pages[page].write(idx - self.region_start, val),
            None => tracing::trace!(idx, val, "write to unselected paged register ignored"),
        }
    }

    pub fn read(&mut self, idx: usize) -> u8 {
        if !self.in_region(idx) {
            return self.base.read(idx);
        }
        match self.current_page() {
            Some(page) => self.pages[page].read(idx - self.region_start),
            None => 0xFF,
        }
    }

    pub fn reset_to_defaults(&mut self) {
        self.base.reset_to_defaults();
        for page in &mut self.pages {
            page.reset_to_defaults();
        }
    }

    pub fn base(&self) -> &RegisterFile {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut RegisterFile {
        &mut self.base
    }
}
