//! Shared test helpers for integration tests and benchmarks.
//!
//! Gated behind `#[cfg(any(test, feature = "test-utils"))]` so these helpers
//! are available in unit tests, integration tests, and benchmarks (via the
//! `test-utils` feature).

use std::cell::RefCell;
use std::rc::Rc;

use crate::config::StateConfig;
use crate::fixed::FixedTime;
use crate::id::TimerId;
use crate::registry::StateRegistry;
use crate::scheduler::Scheduler;

// ===========================================================================
// Small constructors
// ===========================================================================

pub fn shared<T>(value: T) -> Rc<RefCell<T>> {
    Rc::new(RefCell::new(value))
}

pub fn atto(attoseconds: i128) -> FixedTime {
    FixedTime::from_attoseconds(attoseconds)
}

pub fn usec(usec: i64) -> FixedTime {
    FixedTime::from_usec(usec)
}

/// Config with a game id and strict registration.
pub fn strict_config(game_id: &str) -> StateConfig {
    StateConfig {
        game_id: game_id.into(),
        strict: true,
        ..StateConfig::default()
    }
}

// ===========================================================================
// Firing log
// ===========================================================================

/// One recorded timer firing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Firing {
    pub label: &'static str,
    pub time: FixedTime,
    pub param: i64,
}

/// Shared log that recording timers append to.
pub type FiringLog = Rc<RefCell<Vec<Firing>>>;

pub fn firing_log() -> FiringLog {
    shared(Vec::new())
}

/// Allocate a timer that appends `(label, now, param)` to `log` each time it
/// fires.
pub fn recording_timer(scheduler: &mut Scheduler, log: &FiringLog, label: &'static str) -> TimerId {
    let log = Rc::clone(log);
    scheduler.allocate_timer(label, move |sched, param| {
        log.borrow_mut().push(Firing {
            label,
            time: sched.now(),
            param,
        });
    })
}

/// Labels of every firing, in order.
pub fn labels(log: &FiringLog) -> Vec<&'static str> {
    log.borrow().iter().map(|f| f.label).collect()
}

// ===========================================================================
// Registry fixture
// ===========================================================================

/// A small device with one block of every element width.
#[derive(Debug, Clone)]
pub struct FixtureBlocks {
    pub regs: Rc<RefCell<[u8; 4]>>,
    pub ram: Rc<RefCell<Vec<u16>>>,
    pub counter: Rc<RefCell<u32>>,
    pub cycles: Rc<RefCell<i64>>,
    pub latch: Rc<RefCell<bool>>,
}

impl FixtureBlocks {
    pub fn zeroed() -> Self {
        Self {
            regs: shared([0; 4]),
            ram: shared(vec![0; 16]),
            counter: shared(0),
            cycles: shared(0),
            latch: shared(false),
        }
    }

    pub fn patterned() -> Self {
        Self {
            regs: shared([0x12, 0x34, 0x56, 0x78]),
            ram: shared((0..16).map(|i| 0x0101 * i as u16 + 0x8000).collect()),
            counter: shared(0xCAFE_F00D),
            cycles: shared(-123_456_789_012),
            latch: shared(true),
        }
    }

    pub fn snapshot(&self) -> ([u8; 4], Vec<u16>, u32, i64, bool) {
        (
            *self.regs.borrow(),
            self.ram.borrow().clone(),
            *self.counter.borrow(),
            *self.cycles.borrow(),
            *self.latch.borrow(),
        )
    }

    /// Register every block under `module`.
    pub fn register(&self, registry: &mut StateRegistry, module: &str) {
        registry
            .register_block(module, Some("cpu"), 0, "regs", &self.regs)
            .unwrap();
        registry.register_block(module, None, 0, "ram", &self.ram).unwrap();
        registry
            .register_block(module, None, 0, "counter", &self.counter)
            .unwrap();
        registry
            .register_block(module, None, 0, "cycles", &self.cycles)
            .unwrap();
        registry
            .register_block(module, None, 0, "latch", &self.latch)
            .unwrap();
    }
}

/// A closed registry over `blocks` under `config`.
pub fn fixture_registry(config: StateConfig, blocks: &FixtureBlocks) -> StateRegistry {
    let mut registry = StateRegistry::new(config);
    blocks.register(&mut registry, "board");
    registry.close();
    registry
}

/// Install a `tracing` subscriber that writes through the test harness.
/// Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
