//! §8 scenario 2: a 430HX-style chipset shadow-RAM register. Writing `0x20`
//! to register `0x59` disables the ROM overlay at `F0000-FFFFF` so reads
//! and writes land on RAM underneath (shadow enabled); writing `0x00` back
//! re-enables the ROM overlay, restoring the original ROM contents on read.
//!
//! The register file's `on_write` hook (§4.7) is exactly the mechanism a
//! real chipset crate would use to wire this: it doesn't know or care about
//! `pcbus-mem`'s range IDs beyond holding the one it was handed at setup.

use std::cell::RefCell;
use std::rc::Rc;

use pcbus_mem::MemoryMap;
use pcbus_regfile::RegisterFile;

const SHADOW_BASE: u32 = 0xF0000;

#[test]
fn writing_register_0x59_flips_shadow_ram_visibility() {
    let map = Rc::new(RefCell::new(MemoryMap::new(0x10_0000)));

    let rom: Rc<[u8]> = Rc::from(vec![0x77u8; 0x10000]);
    let rom_id = map.borrow_mut().add_rom(SHADOW_BASE, rom).unwrap();

    let mut chipset_regs = RegisterFile::new(0x60);
    chipset_regs.set_write_mask(0x59, 0xFF);
    let map_for_hook = map.clone();
    chipset_regs.set_on_write(Box::new(move |idx, _old, new| {
        if idx != 0x59 {
            return;
        }
        let mut m = map_for_hook.borrow_mut();
        if new & 0x20 != 0 {
            m.disable(rom_id).unwrap(); // shadow enabled: RAM shows through
        } else {
            m.enable(rom_id).unwrap(); // shadow disabled: ROM shows through again
        }
    }));

    // Before any shadow toggle, the ROM overlay wins: reads return the ROM byte.
    assert_eq!(map.borrow().read8(SHADOW_BASE), 0x77);

    chipset_regs.write(0x59, 0x20);
    map.borrow_mut().write8(SHADOW_BASE, 0xAA);
    assert_eq!(map.borrow().read8(SHADOW_BASE), 0xAA, "shadow RAM write should land and read back");

    chipset_regs.write(0x59, 0x00);
    assert_eq!(map.borrow().read8(SHADOW_BASE), 0x77, "disabling shadow restores the original ROM byte");
}
