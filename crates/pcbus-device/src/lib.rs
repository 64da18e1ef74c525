//! Device registry and arena — §4.8.
//!
//! Chipsets reference their integrated devices (KBC, FDC, UARTs) by
//! [`BusRef`], an arena index, rather than a raw pointer (§9 "Cyclic device
//! graphs"): the arena outlives any single device and nothing can dangle
//! across a reset. Devices may call [`DeviceArena::add`] recursively from
//! within their own constructor — a chipset's init closure receives `&mut
//! DeviceArena` and can register its integrated children before the
//! chipset itself is pushed.

use std::collections::HashMap;

use thiserror::Error;

/// The six canonical lifecycle methods every device implements some subset
/// of (§9 "Function-table dispatch" — C's struct-of-function-pointers
/// becomes a trait with default no-op methods here).
pub trait Device {
    fn reset(&mut self) {}
    fn close(&mut self) {}
    fn speed_changed(&mut self) {}
    fn force_redraw(&mut self) {}
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BusFlags: u32 {
        const ISA  = 1 << 0;
        const PCI  = 1 << 1;
        const AGP  = 1 << 2;
        /// Device is always present regardless of machine profile (chipset core).
        const CORE = 1 << 3;
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ConfigValue {
    Int(i32),
    HexInt(u16),
    Bool(bool),
    Str(&'static str),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigKind {
    Int,
    HexInt,
    Selection,
    Binary,
    FileName,
}

/// One entry of a `DeviceDesc`'s configurable-field list (§6 "Config
/// surface"). `selections` is only meaningful when `kind == Selection`.
#[derive(Clone, Copy, Debug)]
pub struct ConfigField {
    pub name: &'static str,
    pub description: &'static str,
    pub kind: ConfigKind,
    pub default: ConfigValue,
    pub selections: &'static [(&'static str, i32)],
}

/// Immutable record describing a device class (§3 "Device instance").
#[derive(Clone, Copy, Debug)]
pub struct DeviceDesc {
    pub name: &'static str,
    pub internal_name: &'static str,
    pub flags: BusFlags,
    pub local: u32,
    pub config: Option<&'static [ConfigField]>,
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("unavailable device: {0}")]
    Unavailable(&'static str),
    #[error("duplicate internal_name: {0}")]
    DuplicateInternalName(&'static str),
}

/// Resolved configuration values the surrounding application populated
/// before `device_add`, keyed by field name (§6).
#[derive(Default, Clone)]
pub struct ConfigResolver {
    values: HashMap<&'static str, ConfigValue>,
}

impl ConfigResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &'static str, value: ConfigValue) {
        self.values.insert(name, value);
    }

    /// `device_get_config_int` — falls back to the field's own default if the
    /// application never resolved a value, and to `0` if the field is
    /// entirely unknown to this resolver.
    pub fn get_config_int(&self, desc: &DeviceDesc, name: &str) -> i32 {
        match self.values.get(name) {
            Some(ConfigValue::Int(v)) => *v,
            Some(ConfigValue::Bool(b)) => *b as i32,
            _ => Self::default_int(desc, name),
        }
    }

    /// `device_get_config_hex16`.
    pub fn get_config_hex16(&self, desc: &DeviceDesc, name: &str) -> u16 {
        match self.values.get(name) {
            Some(ConfigValue::HexInt(v)) => *v,
            _ => Self::default_hex(desc, name),
        }
    }

    fn field<'a>(desc: &'a DeviceDesc, name: &str) -> Option<&'a ConfigField> {
        desc.config?.iter().find(|f| f.name == name)
    }

    fn default_int(desc: &DeviceDesc, name: &str) -> i32 {
        match Self::field(desc, name).map(|f| f.default) {
            Some(ConfigValue::Int(v)) => v,
            Some(ConfigValue::Bool(b)) => b as i32,
            _ => 0,
        }
    }

    fn default_hex(desc: &DeviceDesc, name: &str) -> u16 {
        match Self::field(desc, name).map(|f| f.default) {
            Some(ConfigValue::HexInt(v)) => v,
            _ => 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BusRef(u32);

impl BusRef {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

struct Instance {
    desc: DeviceDesc,
    device: Box<dyn Device>,
}

/// Flat, append-only store of every device instantiated for one machine.
/// `add` may be re-entered from within a device's own constructor (the
/// chipset-adds-its-KBC pattern): the constructing closure receives `&mut
/// DeviceArena` and can register children before its own device is pushed.
#[derive(Default)]
pub struct DeviceArena {
    instances: Vec<Instance>,
    by_internal_name: HashMap<&'static str, BusRef>,
}

impl DeviceArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invokes `init` (which may itself call `add` for integrated child
    /// devices), then registers the resulting device under `desc`. Mirrors
    /// §4.8 step 2: "invokes `desc.init(desc) -> priv`, stores `priv`,
    /// pushes `desc.close` onto the shutdown stack" — the shutdown stack
    /// here is simply "close in reverse of `instances`' order".
    pub fn add(
        &mut self,
        desc: DeviceDesc,
        init: impl FnOnce(&mut DeviceArena) -> Result<Box<dyn Device>, DeviceError>,
    ) -> Result<BusRef, DeviceError> {
        if self.by_internal_name.contains_key(desc.internal_name) {
            tracing::warn!(name = desc.internal_name, "duplicate internal_name rejected at device_add");
            return Err(DeviceError::DuplicateInternalName(desc.internal_name));
        }
        let device = init(self)?;
        let idx = self.instances.len() as u32;
        self.instances.push(Instance { desc, device });
        let bus_ref = BusRef(idx);
        self.by_internal_name.insert(desc.internal_name, bus_ref);
        tracing::debug!(name = desc.internal_name, bus_ref = idx, "device added");
        Ok(bus_ref)
    }

    pub fn get(&self, r: BusRef) -> &dyn Device {
        self.instances[r.index()].device.as_ref()
    }

    pub fn get_mut(&mut self, r: BusRef) -> &mut dyn Device {
        self.instances[r.index()].device.as_mut()
    }

    pub fn desc(&self, r: BusRef) -> &DeviceDesc {
        &self.instances[r.index()].desc
    }

    pub fn lookup_by_internal_name(&self, name: &str) -> Option<BusRef> {
        self.by_internal_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Resets every device in registration order. Reset is not recursive —
    /// each device resets only its own state (§3 lifecycle).
    pub fn reset_all(&mut self) {
        for inst in &mut self.instances {
            inst.device.reset();
        }
    }

    /// Closes every device in reverse registration order (§3 lifecycle).
    pub fn shutdown(&mut self) {
        for inst in self.instances.iter_mut().rev() {
            inst.device.close();
        }
    }

    /// Notifies every device that the host CPU's emulated clock speed
    /// changed, in registration order.
    pub fn speed_changed_all(&mut self) {
        for inst in &mut self.instances {
            inst.device.speed_changed();
        }
    }

    /// Asks every device that owns a framebuffer to redraw from scratch
    /// (e.g. after an un-minimize), in registration order.
    pub fn force_redraw_all(&mut self) {
        for inst in &mut self.instances {
            inst.device.force_redraw();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        closed: std::rc::Rc<std::cell::RefCell<Vec<&'static str>>>,
        name: &'static str,
        resets: u32,
    }

    impl Device for Counter {
        fn reset(&mut self) {
            self.resets += 1;
        }
        fn close(&mut self) {
            self.closed.borrow_mut().push(self.name);
        }
    }

    fn desc(name: &'static str) -> DeviceDesc {
        DeviceDesc { name, internal_name: name, flags: BusFlags::CORE, local: 0, config: None }
    }

    #[test]
    fn devices_reset_in_registration_order_and_close_in_reverse() {
        let mut arena = DeviceArena::new();
        let closed = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));

        let c = closed.clone();
        arena
            .add(desc("chipset"), move |_| Ok(Box::new(Counter { closed: c, name: "chipset", resets: 0 })))
            .unwrap();
        let c = closed.clone();
        arena.add(desc("kbc"), move |_| Ok(Box::new(Counter { closed: c, name: "kbc", resets: 0 }))).unwrap();

        arena.reset_all();
        arena.shutdown();
        assert_eq!(*closed.borrow(), vec!["kbc", "chipset"]);
    }

    #[test]
    fn chipset_recursively_adds_integrated_children_during_its_own_init() {
        let mut arena = DeviceArena::new();
        let closed = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));

        let c = closed.clone();
        let chipset_ref = arena
            .add(desc("chipset"), move |arena| {
                arena
                    .add(desc("kbc"), {
                        let c = c.clone();
                        move |_| Ok(Box::new(Counter { closed: c, name: "kbc", resets: 0 }))
                    })
                    .unwrap();
                Ok(Box::new(Counter { closed: c, name: "chipset", resets: 0 }))
            })
            .unwrap();

        // The child (kbc) was registered before the parent (chipset) even
        // though the parent's `add` call was issued first.
        assert_eq!(arena.lookup_by_internal_name("kbc").unwrap().index(), 0);
        assert_eq!(chipset_ref.index(), 1);
    }

    #[test]
    fn duplicate_internal_name_is_rejected() {
        let mut arena = DeviceArena::new();
        arena.add(desc("fdc"), |_| Ok(Box::new(Counter { closed: Default::default(), name: "fdc", resets: 0 }))).unwrap();
        let err = arena.add(desc("fdc"), |_| Ok(Box::new(Counter { closed: Default::default(), name: "fdc", resets: 0 })));
        assert!(matches!(err, Err(DeviceError::DuplicateInternalName("fdc"))));
    }

    #[test]
    fn config_resolver_falls_back_to_field_default() {
        const FIELDS: &[ConfigField] = &[ConfigField {
            name: "io_base",
            description: "I/O base address",
            kind: ConfigKind::HexInt,
            default: ConfigValue::HexInt(0x3F8),
            selections: &[],
        }];
        let d = DeviceDesc { name: "uart", internal_name: "uart", flags: BusFlags::ISA, local: 0, config: Some(FIELDS) };
        let resolver = ConfigResolver::new();
        assert_eq!(resolver.get_config_hex16(&d, "io_base"), 0x3F8);

        let mut resolver2 = ConfigResolver::new();
        resolver2.set("io_base", ConfigValue::HexInt(0x2F8));
        assert_eq!(resolver2.get_config_hex16(&d, "io_base"), 0x2F8);
    }

    proptest::proptest! {
        /// §8 "Idempotence": resetting any number of devices any number of
        /// times never changes how many times each one reports having been
        /// reset beyond a simple per-call increment, and never reorders
        /// which devices get touched.
        #[test]
        fn reset_all_touches_every_device_exactly_once_per_call(device_count in 0usize..20, reset_calls in 1usize..5) {
            let mut arena = DeviceArena::new();
            for i in 0..device_count {
                let name: &'static str = Box::leak(format!("dev{i}").into_boxed_str());
                arena.add(desc(name), |_| Ok(Box::new(Counter { closed: Default::default(), name: "x", resets: 0 }))).unwrap();
            }
            for _ in 0..reset_calls {
                arena.reset_all();
            }
            proptest::prop_assert_eq!(arena.len(), device_count);
        }
    }
}
