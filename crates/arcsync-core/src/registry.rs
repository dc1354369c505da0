//! Name-indexed registry of device state.
//!
//! Devices register each mutable field they own during the registration
//! window (before the machine starts running). The registry keeps a weak,
//! non-owning reference to every block plus its element size and count, in
//! canonical-name order. That order drives both the save body layout and
//! the structural signature.
//!
//! # Lifecycle
//!
//! **Open** (registration allowed) -> **Closed** (registration forbidden).
//! A registration attempted while closed, a duplicate name, or a duplicate
//! hook is an illegal registration. In strict mode it fails immediately;
//! otherwise it is logged and counted, and the next save or load fails with
//! [`SaveError::IllegalRegistrations`].

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use serde::Serialize;
use tracing::{debug, error, warn};

use crate::codec::{Endian, SaveItem, StateData, decode_items, encode_items};
use crate::config::StateConfig;
use crate::serialize::SaveError;

// ---------------------------------------------------------------------------
// Block access
// ---------------------------------------------------------------------------

/// Why a registered block could not be touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockFault {
    /// The owning device dropped its storage.
    Dropped,
    /// The storage is currently borrowed elsewhere.
    Busy,
}

/// Type-erased view of a registered block.
pub(crate) trait BlockAccess {
    /// Current element count, checking that the block is alive and
    /// writable.
    fn len(&self) -> Result<usize, BlockFault>;

    fn encode(&self, endian: Endian, out: &mut Vec<u8>) -> Result<(), BlockFault>;

    fn decode(&self, bytes: &[u8], endian: Endian) -> Result<(), BlockFault>;
}

struct SharedBlock<D: StateData> {
    data: Weak<RefCell<D>>,
}

impl<D: StateData> BlockAccess for SharedBlock<D> {
    fn len(&self) -> Result<usize, BlockFault> {
        let data = self.data.upgrade().ok_or(BlockFault::Dropped)?;
        let guard = data.try_borrow_mut().map_err(|_| BlockFault::Busy)?;
        Ok(guard.items().len())
    }

    fn encode(&self, endian: Endian, out: &mut Vec<u8>) -> Result<(), BlockFault> {
        let data = self.data.upgrade().ok_or(BlockFault::Dropped)?;
        let guard = data.try_borrow().map_err(|_| BlockFault::Busy)?;
        encode_items(guard.items(), endian, out);
        Ok(())
    }

    fn decode(&self, bytes: &[u8], endian: Endian) -> Result<(), BlockFault> {
        let data = self.data.upgrade().ok_or(BlockFault::Dropped)?;
        let mut guard = data.try_borrow_mut().map_err(|_| BlockFault::Busy)?;
        decode_items(bytes, endian, guard.items_mut());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// One registered block.
pub(crate) struct StateEntry {
    pub(crate) name: String,
    pub(crate) element_size: usize,
    pub(crate) element_count: usize,
    block: Box<dyn BlockAccess>,
}

impl StateEntry {
    /// Bytes this entry occupies in a save body.
    pub(crate) fn byte_len(&self) -> usize {
        self.element_size * self.element_count
    }

    fn fault(&self, fault: BlockFault) -> SaveError {
        match fault {
            BlockFault::Dropped => SaveError::EntryDropped {
                name: self.name.clone(),
            },
            BlockFault::Busy => SaveError::EntryBorrowed {
                name: self.name.clone(),
            },
        }
    }

    /// Verify the block is alive, writable, and still the registered length.
    pub(crate) fn check(&self) -> Result<(), SaveError> {
        let found = self.block.len().map_err(|f| self.fault(f))?;
        if found != self.element_count {
            return Err(SaveError::EntryResized {
                name: self.name.clone(),
                expected: self.element_count,
                found,
            });
        }
        Ok(())
    }

    pub(crate) fn encode(&self, endian: Endian, out: &mut Vec<u8>) -> Result<(), SaveError> {
        self.check()?;
        self.block.encode(endian, out).map_err(|f| self.fault(f))
    }

    pub(crate) fn decode(&self, bytes: &[u8], endian: Endian) -> Result<(), SaveError> {
        self.block.decode(bytes, endian).map_err(|f| self.fault(f))
    }

    fn info(&self) -> EntryInfo {
        EntryInfo {
            name: self.name.clone(),
            element_size: self.element_size,
            element_count: self.element_count,
        }
    }
}

impl fmt::Debug for StateEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateEntry")
            .field("name", &self.name)
            .field("element_size", &self.element_size)
            .field("element_count", &self.element_count)
            .finish_non_exhaustive()
    }
}

/// Diagnostic description of a registered entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryInfo {
    pub name: String,
    pub element_size: usize,
    pub element_count: usize,
}

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

/// Which side of a save/load a hook runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    /// Runs immediately before the body is captured.
    Presave,
    /// Runs immediately after the body is restored.
    Postload,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookKind::Presave => f.write_str("presave"),
            HookKind::Postload => f.write_str("postload"),
        }
    }
}

struct Hook {
    /// Address of the context cell; identity for duplicate detection.
    context: usize,
    callback: usize,
    /// Whether the context could be borrowed right now. A dropped context
    /// counts as ready; it is skipped when run.
    ready: Box<dyn Fn() -> bool>,
    /// Returns `Ok(false)` when the context has been dropped.
    run: Box<dyn FnMut() -> Result<bool, BlockFault>>,
}

// ---------------------------------------------------------------------------
// StateRegistry
// ---------------------------------------------------------------------------

/// Build the canonical entry name `module/tag/index/name`, or
/// `module/index/name` for untagged modules.
pub fn canonical_name(module: &str, tag: Option<&str>, index: u32, name: &str) -> String {
    match tag {
        Some(tag) => format!("{module}/{tag}/{index}/{name}"),
        None => format!("{module}/{index}/{name}"),
    }
}

/// The registry of every save-state block in one machine.
pub struct StateRegistry {
    config: StateConfig,
    /// Sorted by name.
    entries: Vec<StateEntry>,
    presave: Vec<Hook>,
    postload: Vec<Hook>,
    closed: bool,
    illegal: usize,
}

impl StateRegistry {
    pub fn new(config: StateConfig) -> Self {
        Self {
            config,
            entries: Vec::new(),
            presave: Vec::new(),
            postload: Vec::new(),
            closed: false,
            illegal: 0,
        }
    }

    pub fn config(&self) -> &StateConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Number of illegal registrations seen so far.
    pub fn illegal_count(&self) -> usize {
        self.illegal
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn entries(&self) -> &[StateEntry] {
        &self.entries
    }

    /// End the registration window. Irreversible.
    pub fn close(&mut self) {
        if !self.closed {
            debug!(entries = self.entries.len(), "state registration closed");
        }
        self.closed = true;
    }

    /// Register `data` under `module/tag/index/name`.
    ///
    /// The registry holds only a weak reference; the device keeps ownership.
    /// The element count is captured now and must not change afterwards.
    ///
    /// Fails with [`SaveError::EntryBorrowed`] if `data` is mutably borrowed
    /// at the time of the call.
    ///
    /// # Panics
    ///
    /// Panics if the element type is not 1, 2, 4, or 8 bytes wide.
    pub fn register_block<D: StateData>(
        &mut self,
        module: &str,
        tag: Option<&str>,
        index: u32,
        name: &str,
        data: &Rc<RefCell<D>>,
    ) -> Result<(), SaveError> {
        let element_size = <D::Item as SaveItem>::SIZE;
        assert!(
            matches!(element_size, 1 | 2 | 4 | 8),
            "invalid state element size {element_size}"
        );
        let full_name = canonical_name(module, tag, index, name);
        if self.closed {
            return self.reject(SaveError::RegistrationClosed { name: full_name });
        }
        let pos = match self
            .entries
            .binary_search_by(|e| e.name.as_str().cmp(full_name.as_str()))
        {
            Ok(_) => return self.reject(SaveError::DuplicateEntry { name: full_name }),
            Err(pos) => pos,
        };
        let element_count = match data.try_borrow() {
            Ok(block) => block.items().len(),
            Err(_) => return Err(SaveError::EntryBorrowed { name: full_name }),
        };
        debug!(name = %full_name, element_size, element_count, "registered state entry");
        self.entries.insert(
            pos,
            StateEntry {
                name: full_name,
                element_size,
                element_count,
                block: Box::new(SharedBlock {
                    data: Rc::downgrade(data),
                }),
            },
        );
        Ok(())
    }

    /// Run `callback` on `context` immediately before every save.
    pub fn register_presave<T: 'static>(
        &mut self,
        context: &Rc<RefCell<T>>,
        callback: fn(&mut T),
    ) -> Result<(), SaveError> {
        self.register_hook(HookKind::Presave, context, callback)
    }

    /// Run `callback` on `context` immediately after every load.
    pub fn register_postload<T: 'static>(
        &mut self,
        context: &Rc<RefCell<T>>,
        callback: fn(&mut T),
    ) -> Result<(), SaveError> {
        self.register_hook(HookKind::Postload, context, callback)
    }

    fn register_hook<T: 'static>(
        &mut self,
        kind: HookKind,
        context: &Rc<RefCell<T>>,
        callback: fn(&mut T),
    ) -> Result<(), SaveError> {
        if self.closed {
            return self.reject(SaveError::RegistrationClosed {
                name: format!("{kind} hook"),
            });
        }
        let context_addr = Rc::as_ptr(context) as *const () as usize;
        let callback_addr = callback as usize;
        let duplicate = self
            .hooks(kind)
            .iter()
            .any(|h| h.context == context_addr && h.callback == callback_addr);
        if duplicate {
            return self.reject(SaveError::DuplicateHook { kind });
        }
        let weak = Rc::downgrade(context);
        let context_ref = weak.clone();
        let ready = move || match context_ref.upgrade() {
            Some(cell) => cell.try_borrow_mut().is_ok(),
            None => true,
        };
        let run = move || match weak.upgrade() {
            Some(cell) => {
                let mut guard = cell.try_borrow_mut().map_err(|_| BlockFault::Busy)?;
                callback(&mut guard);
                Ok(true)
            }
            None => Ok(false),
        };
        let hooks = match kind {
            HookKind::Presave => &mut self.presave,
            HookKind::Postload => &mut self.postload,
        };
        hooks.push(Hook {
            context: context_addr,
            callback: callback_addr,
            ready: Box::new(ready),
            run: Box::new(run),
        });
        Ok(())
    }

    fn hooks(&self, kind: HookKind) -> &[Hook] {
        match kind {
            HookKind::Presave => &self.presave,
            HookKind::Postload => &self.postload,
        }
    }

    /// Fail if any `kind` hook's context is borrowed elsewhere.
    pub(crate) fn check_hooks(&self, kind: HookKind) -> Result<(), SaveError> {
        if self.hooks(kind).iter().all(|hook| (hook.ready)()) {
            return Ok(());
        }
        Err(SaveError::EntryBorrowed {
            name: format!("{kind} hook"),
        })
    }

    pub(crate) fn run_hooks(&mut self, kind: HookKind) -> Result<(), SaveError> {
        let hooks = match kind {
            HookKind::Presave => &mut self.presave,
            HookKind::Postload => &mut self.postload,
        };
        for hook in hooks.iter_mut() {
            match (hook.run)() {
                Ok(true) => {}
                Ok(false) => warn!(%kind, "hook context was dropped; skipping"),
                Err(_) => {
                    return Err(SaveError::EntryBorrowed {
                        name: format!("{kind} hook"),
                    });
                }
            }
        }
        Ok(())
    }

    fn reject(&mut self, err: SaveError) -> Result<(), SaveError> {
        self.illegal += 1;
        if self.config.strict {
            error!(%err, "illegal state registration");
            return Err(err);
        }
        warn!(%err, count = self.illegal, "illegal state registration");
        Ok(())
    }

    /// CRC-32 over every entry's name followed by its little-endian
    /// `(element_count, element_size)` pair, in name order.
    ///
    /// Depends only on the shape of the registered state, never on its
    /// values.
    pub fn compute_signature(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        for entry in &self.entries {
            hasher.update(entry.name.as_bytes());
            hasher.update(&(entry.element_count as u32).to_le_bytes());
            hasher.update(&(entry.element_size as u32).to_le_bytes());
        }
        hasher.finalize()
    }

    /// Describe every entry, logging each at debug level.
    pub fn dump_registry(&self) -> Vec<EntryInfo> {
        self.entries
            .iter()
            .map(|entry| {
                debug!(
                    name = %entry.name,
                    size = entry.element_size,
                    count = entry.element_count,
                    "state entry"
                );
                entry.info()
            })
            .collect()
    }

    /// Look up one entry by canonical name.
    pub fn entry(&self, name: &str) -> Option<EntryInfo> {
        self.entries
            .binary_search_by(|e| e.name.as_str().cmp(name))
            .ok()
            .map(|i| self.entries[i].info())
    }
}

impl Default for StateRegistry {
    fn default() -> Self {
        Self::new(StateConfig::default())
    }
}

impl fmt::Debug for StateRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateRegistry")
            .field("entries", &self.entries)
            .field("presave", &self.presave.len())
            .field("postload", &self.postload.len())
            .field("closed", &self.closed)
            .field("illegal", &self.illegal)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared<T>(v: T) -> Rc<RefCell<T>> {
        Rc::new(RefCell::new(v))
    }

    fn strict() -> StateConfig {
        StateConfig {
            strict: true,
            ..StateConfig::default()
        }
    }

    #[test]
    fn canonical_names() {
        assert_eq!(canonical_name("acia6850", Some("acia"), 0, "status"), "acia6850/acia/0/status");
        assert_eq!(canonical_name("cpu", None, 1, "pc"), "cpu/1/pc");
    }

    #[test]
    fn entries_are_kept_in_name_order() {
        let mut reg = StateRegistry::default();
        let a = shared(0u8);
        let b = shared([0u16; 4]);
        let c = shared(vec![0u32; 3]);
        reg.register_block("zeta", None, 0, "x", &a).unwrap();
        reg.register_block("alpha", None, 0, "y", &b).unwrap();
        reg.register_block("mid", Some("t"), 2, "z", &c).unwrap();

        let names: Vec<_> = reg.dump_registry().into_iter().map(|e| e.name).collect();
        assert_eq!(names, ["alpha/0/y", "mid/t/2/z", "zeta/0/x"]);
        assert_eq!(
            reg.entry("alpha/0/y"),
            Some(EntryInfo {
                name: "alpha/0/y".into(),
                element_size: 2,
                element_count: 4
            })
        );
        assert!(reg.entry("nope").is_none());
    }

    #[test]
    fn signature_ignores_values_and_order() {
        let mut r1 = StateRegistry::default();
        let mut r2 = StateRegistry::default();
        let a1 = shared(1u32);
        let b1 = shared([1u8; 8]);
        let a2 = shared(99u32);
        let b2 = shared([7u8; 8]);
        r1.register_block("dev", None, 0, "a", &a1).unwrap();
        r1.register_block("dev", None, 0, "b", &b1).unwrap();
        r2.register_block("dev", None, 0, "b", &b2).unwrap();
        r2.register_block("dev", None, 0, "a", &a2).unwrap();
        assert_eq!(r1.compute_signature(), r2.compute_signature());
    }

    #[test]
    fn signature_tracks_name_size_and_count() {
        fn sig_of(build: impl FnOnce(&mut StateRegistry)) -> u32 {
            let mut reg = StateRegistry::default();
            build(&mut reg);
            reg.compute_signature()
        }
        let base = sig_of(|r| {
            r.register_block("dev", None, 0, "a", &shared([0u16; 4])).unwrap();
        });
        let renamed = sig_of(|r| {
            r.register_block("dev", None, 0, "b", &shared([0u16; 4])).unwrap();
        });
        let resized = sig_of(|r| {
            r.register_block("dev", None, 0, "a", &shared([0u32; 4])).unwrap();
        });
        let recounted = sig_of(|r| {
            r.register_block("dev", None, 0, "a", &shared([0u16; 5])).unwrap();
        });
        assert_ne!(base, renamed);
        assert_ne!(base, resized);
        assert_ne!(base, recounted);
    }

    #[test]
    fn signature_matches_manual_crc() {
        let mut reg = StateRegistry::default();
        reg.register_block("m", None, 0, "n", &shared([0u16; 3])).unwrap();
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(b"m/0/n");
        hasher.update(&3u32.to_le_bytes());
        hasher.update(&2u32.to_le_bytes());
        assert_eq!(reg.compute_signature(), hasher.finalize());
    }

    #[test]
    fn late_registration_is_counted() {
        let mut reg = StateRegistry::default();
        reg.close();
        let late = shared(0u8);
        assert!(reg.register_block("dev", None, 0, "late", &late).is_ok());
        assert_eq!(reg.illegal_count(), 1);
        assert_eq!(reg.entry_count(), 0);
    }

    #[test]
    fn late_registration_fails_in_strict_mode() {
        let mut reg = StateRegistry::new(strict());
        reg.close();
        let err = reg
            .register_block("dev", None, 0, "late", &shared(0u8))
            .unwrap_err();
        assert!(matches!(err, SaveError::RegistrationClosed { ref name } if name == "dev/0/late"));
        assert_eq!(reg.illegal_count(), 1);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut reg = StateRegistry::new(strict());
        let a = shared(0u8);
        let b = shared(0u8);
        reg.register_block("dev", None, 0, "x", &a).unwrap();
        let err = reg.register_block("dev", None, 0, "x", &b).unwrap_err();
        assert!(matches!(err, SaveError::DuplicateEntry { .. }));
        assert_eq!(reg.entry_count(), 1);
    }

    #[test]
    fn duplicate_hooks_are_rejected() {
        fn rebuild(_: &mut u32) {}
        fn other(_: &mut u32) {}
        let mut reg = StateRegistry::new(strict());
        let ctx = shared(0u32);
        let ctx2 = shared(0u32);
        reg.register_postload(&ctx, rebuild).unwrap();
        reg.register_postload(&ctx, other).unwrap();
        reg.register_postload(&ctx2, rebuild).unwrap();
        reg.register_presave(&ctx, rebuild).unwrap();
        let err = reg.register_postload(&ctx, rebuild).unwrap_err();
        assert!(matches!(err, SaveError::DuplicateHook { kind: HookKind::Postload }));
    }

    #[test]
    fn hooks_run_in_registration_order() {
        let log = shared(Vec::<u8>::new());
        fn first(v: &mut Vec<u8>) {
            v.push(1);
        }
        fn second(v: &mut Vec<u8>) {
            v.push(2);
        }
        let mut reg = StateRegistry::default();
        reg.register_postload(&log, first).unwrap();
        reg.register_postload(&log, second).unwrap();
        reg.run_hooks(HookKind::Postload).unwrap();
        reg.run_hooks(HookKind::Presave).unwrap();
        assert_eq!(*log.borrow(), [1, 2]);
    }

    #[test]
    fn busy_hook_context_is_an_error() {
        fn bump(v: &mut u32) {
            *v += 1;
        }
        let mut reg = StateRegistry::default();
        let ctx = shared(0u32);
        reg.register_presave(&ctx, bump).unwrap();
        {
            let _held = ctx.borrow();
            let err = reg.check_hooks(HookKind::Presave).unwrap_err();
            assert!(matches!(err, SaveError::EntryBorrowed { ref name } if name == "presave hook"));
            assert!(reg.run_hooks(HookKind::Presave).is_err());
        }
        reg.check_hooks(HookKind::Presave).unwrap();
        reg.run_hooks(HookKind::Presave).unwrap();
        assert_eq!(*ctx.borrow(), 1);
    }

    #[test]
    fn dropped_hook_context_is_skipped() {
        fn bump(v: &mut u32) {
            *v += 1;
        }
        let mut reg = StateRegistry::default();
        let ctx = shared(0u32);
        reg.register_postload(&ctx, bump).unwrap();
        drop(ctx);
        reg.check_hooks(HookKind::Postload).unwrap();
        reg.run_hooks(HookKind::Postload).unwrap();
    }

    #[test]
    fn registering_a_borrowed_block_fails() {
        let mut reg = StateRegistry::new(strict());
        let block = shared([0u16; 4]);
        let _held = block.borrow_mut();
        let err = reg.register_block("dev", None, 0, "regs", &block).unwrap_err();
        assert!(matches!(err, SaveError::EntryBorrowed { ref name } if name == "dev/0/regs"));
        assert_eq!(reg.entry_count(), 0);
        assert_eq!(reg.illegal_count(), 0);
    }

    #[test]
    fn entry_check_detects_drop_and_resize() {
        let mut reg = StateRegistry::default();
        let gone = shared(0u8);
        let grow = shared(vec![0u16; 2]);
        reg.register_block("a", None, 0, "gone", &gone).unwrap();
        reg.register_block("b", None, 0, "grow", &grow).unwrap();
        drop(gone);
        grow.borrow_mut().push(5);
        let entries = reg.entries();
        assert!(matches!(entries[0].check(), Err(SaveError::EntryDropped { .. })));
        assert!(matches!(
            entries[1].check(),
            Err(SaveError::EntryResized { expected: 2, found: 3, .. })
        ));
    }
}
