//! The per-session context that owns a scheduler and a state registry.
//!
//! Devices are built against a `Machine` in the [`Phase::Setup`] phase,
//! allocating timers and registering state. [`Machine::start`] closes the
//! registration window; from then on the machine can run, save, load, and
//! rewind until [`Machine::stop`] tears it down. Several machines may exist
//! in one process since nothing here is global.

use std::io::{Read, Write};

use tracing::{debug, info};

use crate::config::StateConfig;
use crate::fixed::FixedTime;
use crate::registry::StateRegistry;
use crate::rewind::{RewindBuffer, RewindEntry};
use crate::scheduler::Scheduler;
use crate::serialize::SaveError;
use crate::timeline::Timeline;

/// Module name the scheduler's own state is registered under.
pub const SCHEDULER_MODULE: &str = "scheduler";

/// Lifecycle phase of a [`Machine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Devices are being built; registration is open.
    Setup,
    /// Registration is closed; the machine can run, save, and load.
    Running,
    /// Torn down. Every timer is gone.
    Stopped,
}

/// Errors from driving a [`Machine`].
#[derive(Debug, thiserror::Error)]
pub enum MachineError {
    /// Running, saving, and loading need [`Phase::Running`].
    #[error("machine is not running (phase {0:?})")]
    NotRunning(Phase),
    #[error("machine already left setup (phase {0:?})")]
    AlreadyStarted(Phase),
    #[error("no rewind state available")]
    NoRewind,
    /// The save or load itself failed.
    #[error(transparent)]
    State(#[from] SaveError),
}

/// One emulated machine: its scheduler, its state registry, and the rewind
/// ring built on top of them.
///
/// Saving captures the registered device state together with the scheduler
/// clock and the schedule of every timer allocated during setup, so a load
/// resumes exactly where the save was taken.
#[derive(Debug)]
pub struct Machine {
    scheduler: Scheduler,
    registry: StateRegistry,
    /// Registered at start.
    timeline: Option<Timeline>,
    rewind: RewindBuffer,
    phase: Phase,
}

impl Machine {
    /// A machine in the setup phase.
    pub fn new(config: StateConfig) -> Self {
        let rewind = RewindBuffer::new(config.rewind_capacity);
        Self {
            scheduler: Scheduler::new(),
            registry: StateRegistry::new(config),
            timeline: None,
            rewind,
            phase: Phase::Setup,
        }
    }

    pub fn config(&self) -> &StateConfig {
        self.registry.config()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn now(&self) -> FixedTime {
        self.scheduler.now()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    pub fn registry(&self) -> &StateRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut StateRegistry {
        &mut self.registry
    }

    /// Scheduler and registry together, for building devices that need both.
    pub fn parts_mut(&mut self) -> (&mut Scheduler, &mut StateRegistry) {
        (&mut self.scheduler, &mut self.registry)
    }

    pub fn rewind_buffer(&self) -> &RewindBuffer {
        &self.rewind
    }

    fn ensure_running(&self) -> Result<(), MachineError> {
        match self.phase {
            Phase::Running => Ok(()),
            other => Err(MachineError::NotRunning(other)),
        }
    }

    /// Register the scheduler's state, close registration, and enter the
    /// running phase. Timers allocated after this are not saved.
    pub fn start(&mut self) -> Result<(), MachineError> {
        if self.phase != Phase::Setup {
            return Err(MachineError::AlreadyStarted(self.phase));
        }
        let timeline = Timeline::register(&self.scheduler, &mut self.registry, SCHEDULER_MODULE)?;
        self.timeline = Some(timeline);
        self.registry.close();
        let entries = self.registry.dump_registry();
        let bytes: usize = entries.iter().map(|e| e.element_size * e.element_count).sum();
        info!(
            game = %self.registry.config().game_id,
            entries = entries.len(),
            bytes,
            timers = self.scheduler.timer_count(),
            illegal = self.registry.illegal_count(),
            "machine started"
        );
        self.phase = Phase::Running;
        Ok(())
    }

    /// Advance emulated time by `duration`, returning the callbacks fired.
    pub fn run_for(&mut self, duration: FixedTime) -> Result<u64, MachineError> {
        self.ensure_running()?;
        Ok(self.scheduler.run_for(duration))
    }

    pub fn run_until(&mut self, limit: FixedTime) -> Result<u64, MachineError> {
        self.ensure_running()?;
        Ok(self.scheduler.run_until(limit))
    }

    pub fn save_state<W: Write>(&mut self, writer: &mut W) -> Result<(), MachineError> {
        self.ensure_running()?;
        if let Some(timeline) = &self.timeline {
            timeline.capture(&self.scheduler);
        }
        Ok(self.registry.write(writer)?)
    }

    /// Load a save file, restoring device state, the clock, and every saved
    /// timer. A failed load changes nothing.
    pub fn load_state<R: Read>(&mut self, reader: &mut R) -> Result<(), MachineError> {
        self.ensure_running()?;
        self.registry.read(reader)?;
        self.restore_timeline();
        Ok(())
    }

    fn restore_timeline(&mut self) {
        if let Some(timeline) = &self.timeline {
            timeline.restore(&mut self.scheduler);
        }
    }

    /// Capture the current state into the rewind buffer.
    pub fn capture_rewind(&mut self) -> Result<(), MachineError> {
        let mut data = Vec::with_capacity(self.registry.body_len());
        self.save_state(&mut data)?;
        self.rewind.push(RewindEntry {
            time: self.scheduler.now(),
            data,
        });
        debug!(
            held = self.rewind.len(),
            bytes = self.rewind.byte_len(),
            "rewind point captured"
        );
        Ok(())
    }

    /// Restore the newest rewind capture and discard it.
    ///
    /// Returns the emulated time the capture was taken at, which is also the
    /// clock afterwards. If the load fails the capture stays in the buffer.
    pub fn rewind(&mut self) -> Result<FixedTime, MachineError> {
        self.ensure_running()?;
        let entry = self.rewind.latest().ok_or(MachineError::NoRewind)?;
        self.registry.read(&mut entry.data.as_slice())?;
        let time = entry.time;
        self.rewind.pop_latest();
        let from = self.scheduler.now();
        self.restore_timeline();
        info!(captured_at = %time, from = %from, "rewound");
        Ok(time)
    }

    /// Tear down: drop every timer and rewind capture. Idempotent.
    pub fn stop(&mut self) {
        if self.phase == Phase::Stopped {
            return;
        }
        self.scheduler.clear();
        self.rewind.clear();
        self.phase = Phase::Stopped;
        info!(now = %self.scheduler.now(), "machine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn counter_machine() -> (Machine, Rc<RefCell<u32>>) {
        let mut machine = Machine::new(StateConfig {
            game_id: "test".into(),
            rewind_capacity: 4,
            ..StateConfig::default()
        });
        let count = Rc::new(RefCell::new(0u32));
        machine
            .registry_mut()
            .register_block("counter", None, 0, "value", &count)
            .unwrap();
        let tick = Rc::clone(&count);
        let timer = machine.scheduler_mut().allocate_timer("tick", move |_, _| {
            *tick.borrow_mut() += 1;
        });
        let period = FixedTime::from_msec(1);
        machine.scheduler_mut().adjust(timer, period, 0, period);
        (machine, count)
    }

    #[test]
    fn lifecycle_phases() {
        let (mut m, _count) = counter_machine();
        assert_eq!(m.phase(), Phase::Setup);
        assert!(matches!(
            m.run_for(FixedTime::from_msec(1)),
            Err(MachineError::NotRunning(Phase::Setup))
        ));
        m.start().unwrap();
        assert!(m.registry().is_closed());
        assert!(matches!(m.start(), Err(MachineError::AlreadyStarted(Phase::Running))));
        m.stop();
        m.stop();
        assert_eq!(m.phase(), Phase::Stopped);
        assert_eq!(m.scheduler().timer_count(), 0);
        assert!(matches!(
            m.save_state(&mut Vec::new()),
            Err(MachineError::NotRunning(Phase::Stopped))
        ));
    }

    #[test]
    fn run_save_and_load() {
        let (mut m, count) = counter_machine();
        m.start().unwrap();
        assert_eq!(m.run_for(FixedTime::from_msec(10)).unwrap(), 10);
        let mut saved = Vec::new();
        m.save_state(&mut saved).unwrap();

        m.run_for(FixedTime::from_msec(5)).unwrap();
        assert_eq!(*count.borrow(), 15);
        m.load_state(&mut saved.as_slice()).unwrap();
        assert_eq!(*count.borrow(), 10);
        assert_eq!(m.now(), FixedTime::from_msec(10));

        // The tick timer resumes on its saved schedule.
        assert_eq!(m.run_for(FixedTime::from_msec(5)).unwrap(), 5);
        assert_eq!(*count.borrow(), 15);
        assert_eq!(m.now(), FixedTime::from_msec(15));
    }

    #[test]
    fn start_registers_scheduler_state() {
        let (mut m, _count) = counter_machine();
        m.start().unwrap();
        assert!(m.registry().entry("scheduler/0/now").is_some());
        let times = m.registry().entry("scheduler/0/timer_times").unwrap();
        assert_eq!(times.element_count, 6);
    }

    #[test]
    fn failed_load_keeps_clock() {
        let (mut m, count) = counter_machine();
        m.start().unwrap();
        m.run_for(FixedTime::from_msec(4)).unwrap();
        let mut saved = Vec::new();
        m.save_state(&mut saved).unwrap();
        m.run_for(FixedTime::from_msec(4)).unwrap();

        saved.truncate(saved.len() - 1);
        assert!(m.load_state(&mut saved.as_slice()).is_err());
        assert_eq!(m.now(), FixedTime::from_msec(8));
        assert_eq!(*count.borrow(), 8);
    }

    #[test]
    fn rewind_restores_latest_capture() {
        let (mut m, count) = counter_machine();
        m.start().unwrap();
        m.run_for(FixedTime::from_msec(3)).unwrap();
        m.capture_rewind().unwrap();
        m.run_for(FixedTime::from_msec(3)).unwrap();
        m.capture_rewind().unwrap();
        m.run_for(FixedTime::from_msec(3)).unwrap();

        assert_eq!(m.rewind().unwrap(), FixedTime::from_msec(6));
        assert_eq!(*count.borrow(), 6);
        assert_eq!(m.now(), FixedTime::from_msec(6));
        assert_eq!(m.rewind().unwrap(), FixedTime::from_msec(3));
        assert_eq!(*count.borrow(), 3);
        assert_eq!(m.now(), FixedTime::from_msec(3));
        assert!(matches!(m.rewind(), Err(MachineError::NoRewind)));
    }

    #[test]
    fn late_registration_surfaces_on_save() {
        let (mut m, _count) = counter_machine();
        m.start().unwrap();
        let late = Rc::new(RefCell::new(0u8));
        m.registry_mut()
            .register_block("late", None, 0, "x", &late)
            .unwrap();
        let err = m.save_state(&mut Vec::new()).unwrap_err();
        assert!(matches!(
            err,
            MachineError::State(SaveError::IllegalRegistrations { count: 1 })
        ));
    }
}
