//! Discrete-event timer scheduler.
//!
//! The [`Scheduler`] owns every timer in a machine and drives emulated time
//! forward by jumping straight to the earliest pending expiration, invoking
//! that timer's callback, and repeating. Callbacks run to completion before
//! time advances again.
//!
//! # Ordering
//!
//! Pending timers are kept in a map keyed by `(expiration, allocation
//! sequence)`. Dispatch always takes the first key, so timers that expire at
//! the same instant fire in the order they were allocated, on every run.
//!
//! # Periodic timers
//!
//! A periodic timer is re-armed from its previous expiration, not from the
//! time its callback happened to observe, so a timer armed at `t0` with
//! period `P` fires at exactly `t0 + P`, `t0 + 2P`, ...

use std::collections::BTreeMap;
use std::fmt;

use slotmap::SlotMap;
use tracing::trace;

use crate::fixed::FixedTime;
use crate::id::TimerId;
use crate::screen::ScreenTiming;

/// A timer callback. Receives the scheduler itself as its context (so it can
/// re-arm or reset timers) and the `param` passed to the last
/// [`Scheduler::adjust`].
pub type TimerCallback = Box<dyn FnMut(&mut Scheduler, i64)>;

// ---------------------------------------------------------------------------
// Timer slots
// ---------------------------------------------------------------------------

struct TimerSlot {
    name: String,
    /// Taken out while the callback runs.
    callback: Option<TimerCallback>,
    /// Allocation order; breaks ties between equal expirations.
    seq: u64,
    enabled: bool,
    param: i64,
    /// When the timer was last armed or last fired.
    start: FixedTime,
    expire: FixedTime,
    /// Zero for one-shot timers.
    period: FixedTime,
}

impl TimerSlot {
    fn queue_key(&self) -> Option<(FixedTime, u64)> {
        (self.enabled && !self.expire.is_never()).then_some((self.expire, self.seq))
    }
}

impl fmt::Debug for TimerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerSlot")
            .field("name", &self.name)
            .field("enabled", &self.enabled)
            .field("param", &self.param)
            .field("start", &self.start)
            .field("expire", &self.expire)
            .field("period", &self.period)
            .finish_non_exhaustive()
    }
}

/// Everything about a timer that a save state captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerSchedule {
    pub enabled: bool,
    pub param: i64,
    pub start: FixedTime,
    pub expire: FixedTime,
    pub period: FixedTime,
}

impl TimerSchedule {
    /// A disabled timer that will never fire.
    pub fn disabled(now: FixedTime) -> Self {
        Self {
            enabled: false,
            param: 0,
            start: now,
            expire: FixedTime::NEVER,
            period: FixedTime::ZERO,
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Single-threaded discrete-event scheduler.
#[derive(Debug, Default)]
pub struct Scheduler {
    now: FixedTime,
    timers: SlotMap<TimerId, TimerSlot>,
    queue: BTreeMap<(FixedTime, u64), TimerId>,
    next_seq: u64,
    fired: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current emulated time.
    pub fn now(&self) -> FixedTime {
        self.now
    }

    /// Number of live timers.
    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    /// Total callbacks dispatched since creation.
    pub fn fired_count(&self) -> u64 {
        self.fired
    }

    // -----------------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------------

    /// Allocate a timer bound to `callback`. The timer starts disabled and
    /// never fires until it is [`adjust`](Self::adjust)ed.
    pub fn allocate_timer<F>(&mut self, name: impl Into<String>, callback: F) -> TimerId
    where
        F: FnMut(&mut Scheduler, i64) + 'static,
    {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.timers.insert(TimerSlot {
            name: name.into(),
            callback: Some(Box::new(callback)),
            seq,
            enabled: false,
            param: 0,
            start: self.now,
            expire: FixedTime::NEVER,
            period: FixedTime::ZERO,
        })
    }

    /// Release a timer at device teardown. Returns `false` if it was already
    /// freed. Safe to call from the timer's own callback.
    pub fn free_timer(&mut self, id: TimerId) -> bool {
        self.unqueue(id);
        self.timers.remove(id).is_some()
    }

    /// Release every timer. Used when a machine shuts down.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.timers.clear();
    }

    // -----------------------------------------------------------------------
    // Arming
    // -----------------------------------------------------------------------

    /// Arm `id` to fire `delay` from now with `param`. A non-zero `period`
    /// makes the timer re-arm itself after every firing; a zero period makes
    /// it one-shot. Negative delays and periods are treated as zero.
    ///
    /// # Panics
    ///
    /// Panics if `id` has been freed.
    pub fn adjust(&mut self, id: TimerId, delay: FixedTime, param: i64, period: FixedTime) {
        self.unqueue(id);
        let now = self.now;
        let slot = self.slot_mut(id);
        slot.param = param;
        slot.period = period.max(FixedTime::ZERO);
        slot.start = now;
        slot.expire = now + delay.max(FixedTime::ZERO);
        slot.enabled = true;
        self.enqueue(id);
    }

    /// Disable `id` without freeing it; its expiration becomes `never`.
    ///
    /// # Panics
    ///
    /// Panics if `id` has been freed.
    pub fn reset(&mut self, id: TimerId) {
        self.unqueue(id);
        let now = self.now;
        let slot = self.slot_mut(id);
        slot.enabled = false;
        slot.start = now;
        slot.expire = FixedTime::NEVER;
    }

    /// Enable or disable `id`, keeping its expiration. Returns the previous
    /// enabled state. A timer re-enabled after its expiration has passed
    /// fires at the current time, never in the past.
    ///
    /// # Panics
    ///
    /// Panics if `id` has been freed.
    pub fn enable(&mut self, id: TimerId, enabled: bool) -> bool {
        self.unqueue(id);
        let now = self.now;
        let slot = self.slot_mut(id);
        let was = slot.enabled;
        slot.enabled = enabled;
        // An expiration that passed while disabled fires at the current instant.
        if enabled && slot.expire < now {
            slot.expire = now;
        }
        self.enqueue(id);
        was
    }

    // -----------------------------------------------------------------------
    // Save support
    // -----------------------------------------------------------------------

    /// Every live timer, in allocation order.
    pub fn timer_ids(&self) -> Vec<TimerId> {
        let mut ids: Vec<_> = self.timers.iter().map(|(id, slot)| (slot.seq, id)).collect();
        ids.sort_unstable_by_key(|&(seq, _)| seq);
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// The schedule of `id`, without its callback.
    ///
    /// # Panics
    ///
    /// Panics if `id` has been freed.
    pub fn schedule(&self, id: TimerId) -> TimerSchedule {
        let slot = self.slot(id);
        TimerSchedule {
            enabled: slot.enabled,
            param: slot.param,
            start: slot.start,
            expire: slot.expire,
            period: slot.period,
        }
    }

    /// Move the clock to `now` and overwrite the schedules of `timers`.
    ///
    /// Freed ids are skipped. Timers not listed keep their schedule, except
    /// that an enabled expiration earlier than `now` is moved up to `now`.
    pub fn restore<I>(&mut self, now: FixedTime, timers: I)
    where
        I: IntoIterator<Item = (TimerId, TimerSchedule)>,
    {
        self.now = now;
        for (id, schedule) in timers {
            let Some(slot) = self.timers.get_mut(id) else {
                continue;
            };
            slot.enabled = schedule.enabled;
            slot.param = schedule.param;
            slot.start = schedule.start;
            slot.expire = schedule.expire;
            slot.period = schedule.period.max(FixedTime::ZERO);
        }
        self.queue.clear();
        for (id, slot) in &mut self.timers {
            if slot.enabled && slot.expire < now {
                slot.expire = now;
            }
            if let Some(key) = slot.queue_key() {
                self.queue.insert(key, id);
            }
        }
        trace!(time = %now, timers = self.timers.len(), "scheduler restored");
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Time left before `id` fires, or `never` if it is disabled.
    pub fn remaining(&self, id: TimerId) -> FixedTime {
        let slot = self.slot(id);
        if !slot.enabled || slot.expire.is_never() {
            return FixedTime::NEVER;
        }
        slot.expire - self.now
    }

    /// Time since `id` was last armed or last fired.
    pub fn elapsed(&self, id: TimerId) -> FixedTime {
        self.now - self.slot(id).start
    }

    pub fn is_enabled(&self, id: TimerId) -> bool {
        self.slot(id).enabled
    }

    pub fn param(&self, id: TimerId) -> i64 {
        self.slot(id).param
    }

    pub fn period(&self, id: TimerId) -> FixedTime {
        self.slot(id).period
    }

    pub fn start_time(&self, id: TimerId) -> FixedTime {
        self.slot(id).start
    }

    pub fn expire_time(&self, id: TimerId) -> FixedTime {
        self.slot(id).expire
    }

    pub fn name(&self, id: TimerId) -> &str {
        &self.slot(id).name
    }

    /// Whether `id` still refers to a live timer.
    pub fn contains(&self, id: TimerId) -> bool {
        self.timers.contains_key(id)
    }

    /// Duration from now until the absolute time `target`. Past targets give
    /// zero; `never` stays `never`.
    pub fn time_until(&self, target: FixedTime) -> FixedTime {
        if target.is_never() {
            return FixedTime::NEVER;
        }
        (target - self.now).max(FixedTime::ZERO)
    }

    /// Duration from now until the beam of `screen` reaches (`vpos`, `hpos`).
    pub fn time_until_pos(&self, screen: &ScreenTiming, vpos: u32, hpos: u32) -> FixedTime {
        screen.time_until_pos(self.now, vpos, hpos)
    }

    /// Expiration of the earliest pending timer, or `never` when idle.
    pub fn next_expiration(&self) -> FixedTime {
        self.queue
            .first_key_value()
            .map_or(FixedTime::NEVER, |(&(expire, _), _)| expire)
    }

    /// True when no timer can ever fire again.
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Fire the single earliest pending timer. Returns `false` when idle.
    pub fn step(&mut self) -> bool {
        let Some(((expire, _), id)) = self.queue.pop_first() else {
            return false;
        };
        debug_assert!(expire >= self.now, "timer queue went backwards");
        self.now = expire;

        let slot = &mut self.timers[id];
        let param = slot.param;
        slot.start = expire;
        if slot.period.is_zero() {
            slot.enabled = false;
            slot.expire = FixedTime::NEVER;
        } else {
            slot.expire = expire + slot.period;
            if let Some(key) = slot.queue_key() {
                self.queue.insert(key, id);
            }
        }
        let mut callback = slot.callback.take();
        trace!(timer = %slot.name, time = %expire, param, "timer fired");

        self.fired += 1;
        if let Some(cb) = callback.as_mut() {
            cb(self, param);
        }
        // The callback may have freed its own timer.
        if let Some(slot) = self.timers.get_mut(id) {
            if slot.callback.is_none() {
                slot.callback = callback;
            }
        }
        true
    }

    /// Fire every timer expiring at or before `limit`, in order, then leave
    /// the clock at `limit`. Returns the number of callbacks invoked.
    ///
    /// With `limit == never` this runs until the scheduler is idle, which
    /// never happens while a periodic timer is armed.
    pub fn run_until(&mut self, limit: FixedTime) -> u64 {
        let mut fired = 0;
        while self.next_expiration() <= limit && !self.is_idle() {
            self.step();
            fired += 1;
        }
        if limit > self.now && !limit.is_never() {
            self.now = limit;
        }
        fired
    }

    /// Run for `duration` of emulated time from now.
    pub fn run_for(&mut self, duration: FixedTime) -> u64 {
        self.run_until(self.now + duration)
    }

    // -----------------------------------------------------------------------
    // Internal
    // -----------------------------------------------------------------------

    fn slot(&self, id: TimerId) -> &TimerSlot {
        match self.timers.get(id) {
            Some(slot) => slot,
            None => panic!("use of freed timer {id:?}"),
        }
    }

    fn slot_mut(&mut self, id: TimerId) -> &mut TimerSlot {
        match self.timers.get_mut(id) {
            Some(slot) => slot,
            None => panic!("use of freed timer {id:?}"),
        }
    }

    fn unqueue(&mut self, id: TimerId) {
        if let Some(key) = self.timers.get(id).and_then(TimerSlot::queue_key) {
            self.queue.remove(&key);
        }
    }

    fn enqueue(&mut self, id: TimerId) {
        if let Some(key) = self.timers.get(id).and_then(TimerSlot::queue_key) {
            self.queue.insert(key, id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    type Log = Rc<RefCell<Vec<(&'static str, i128, i64)>>>;

    fn atto(n: i128) -> FixedTime {
        FixedTime::from_attoseconds(n)
    }

    fn recorder(sched: &mut Scheduler, log: &Log, name: &'static str) -> TimerId {
        let log = Rc::clone(log);
        sched.allocate_timer(name, move |s, param| {
            log.borrow_mut().push((name, s.now().as_attoseconds(), param));
        })
    }

    #[test]
    fn new_timer_is_disabled() {
        let mut sched = Scheduler::new();
        let log = Log::default();
        let t = recorder(&mut sched, &log, "t");
        assert!(!sched.is_enabled(t));
        assert!(sched.remaining(t).is_never());
        assert!(sched.is_idle());
        sched.run_for(FixedTime::from_seconds(10));
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn periodic_and_one_shot_interleave() {
        let mut sched = Scheduler::new();
        let log = Log::default();
        let a = recorder(&mut sched, &log, "A");
        let b = recorder(&mut sched, &log, "B");
        sched.adjust(a, FixedTime::ZERO, 0, atto(1000));
        sched.adjust(b, atto(500), 7, FixedTime::ZERO);

        let fired = sched.run_until(atto(3500));

        assert_eq!(fired, 5);
        assert_eq!(
            *log.borrow(),
            vec![("A", 0, 0), ("B", 500, 7), ("A", 1000, 0), ("A", 2000, 0), ("A", 3000, 0)]
        );
        assert_eq!(sched.now(), atto(3500));
        assert!(!sched.is_enabled(b));
        assert_eq!(sched.expire_time(a), atto(4000));
    }

    #[test]
    fn periodic_rearm_is_drift_free() {
        let mut sched = Scheduler::new();
        let log = Log::default();
        let t = recorder(&mut sched, &log, "t");
        let period = FixedTime::from_hz_int(3);
        sched.adjust(t, period, 0, period);
        sched.run_until(FixedTime::from_seconds(100));

        let log = log.borrow();
        assert_eq!(log.len(), 300);
        for (i, &(_, when, _)) in log.iter().enumerate() {
            assert_eq!(when, period.as_attoseconds() * (i as i128 + 1));
        }
    }

    #[test]
    fn ties_fire_in_allocation_order() {
        let mut sched = Scheduler::new();
        let log = Log::default();
        let first = recorder(&mut sched, &log, "first");
        let second = recorder(&mut sched, &log, "second");
        let third = recorder(&mut sched, &log, "third");
        // Arm in reverse order; allocation order must still win.
        sched.adjust(third, atto(10), 0, FixedTime::ZERO);
        sched.adjust(second, atto(10), 0, FixedTime::ZERO);
        sched.adjust(first, atto(10), 0, FixedTime::ZERO);
        sched.run_until(atto(10));
        let names: Vec<_> = log.borrow().iter().map(|e| e.0).collect();
        assert_eq!(names, ["first", "second", "third"]);
    }

    #[test]
    fn reset_cancels_pending_fire() {
        let mut sched = Scheduler::new();
        let log = Log::default();
        let t = recorder(&mut sched, &log, "t");
        sched.adjust(t, atto(100), 0, atto(100));
        sched.reset(t);
        assert!(sched.expire_time(t).is_never());
        sched.run_until(atto(1000));
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn readjust_replaces_pending_fire() {
        let mut sched = Scheduler::new();
        let log = Log::default();
        let t = recorder(&mut sched, &log, "t");
        sched.adjust(t, atto(100), 1, FixedTime::ZERO);
        sched.adjust(t, atto(300), 2, FixedTime::ZERO);
        sched.run_until(atto(1000));
        assert_eq!(*log.borrow(), vec![("t", 300, 2)]);
    }

    #[test]
    fn remaining_and_elapsed() {
        let mut sched = Scheduler::new();
        let log = Log::default();
        let t = recorder(&mut sched, &log, "t");
        sched.run_until(atto(50));
        sched.adjust(t, atto(200), 0, FixedTime::ZERO);
        sched.run_until(atto(120));
        assert_eq!(sched.remaining(t), atto(130));
        assert_eq!(sched.elapsed(t), atto(70));
        sched.run_until(atto(400));
        assert!(sched.remaining(t).is_never());
        assert_eq!(sched.elapsed(t), atto(150));
    }

    #[test]
    fn enable_toggle_keeps_expiration() {
        let mut sched = Scheduler::new();
        let log = Log::default();
        let t = recorder(&mut sched, &log, "t");
        sched.adjust(t, atto(100), 0, FixedTime::ZERO);
        assert!(sched.enable(t, false));
        sched.run_until(atto(50));
        assert!(!sched.enable(t, true));
        sched.run_until(atto(100));
        assert_eq!(*log.borrow(), vec![("t", 100, 0)]);
    }

    #[test]
    fn callback_can_rearm_itself() {
        let mut sched = Scheduler::new();
        let count = Rc::new(RefCell::new(0u32));
        let seen = Rc::clone(&count);
        let slot: Rc<RefCell<Option<TimerId>>> = Rc::default();
        let me = Rc::clone(&slot);
        let t = sched.allocate_timer("bit", move |s, _| {
            *seen.borrow_mut() += 1;
            if *seen.borrow() < 8 {
                let id = me.borrow().expect("timer id set before arming");
                s.adjust(id, atto(10), 0, FixedTime::ZERO);
            }
        });
        *slot.borrow_mut() = Some(t);
        sched.adjust(t, atto(10), 0, FixedTime::ZERO);
        sched.run_until(atto(1000));
        assert_eq!(*count.borrow(), 8);
        assert!(sched.is_idle());
    }

    #[test]
    fn callback_can_free_itself() {
        let mut sched = Scheduler::new();
        let slot: Rc<RefCell<Option<TimerId>>> = Rc::default();
        let me = Rc::clone(&slot);
        let t = sched.allocate_timer("once", move |s, _| {
            let id = me.borrow().expect("timer id set before arming");
            assert!(s.free_timer(id));
        });
        *slot.borrow_mut() = Some(t);
        sched.adjust(t, atto(5), 0, atto(5));
        sched.run_until(atto(100));
        assert!(!sched.contains(t));
        assert_eq!(sched.fired_count(), 1);
        assert_eq!(sched.timer_count(), 0);
    }

    #[test]
    fn zero_delay_fires_at_current_time() {
        let mut sched = Scheduler::new();
        let log = Log::default();
        let t = recorder(&mut sched, &log, "t");
        sched.run_until(atto(40));
        sched.adjust(t, FixedTime::ZERO, 3, FixedTime::ZERO);
        assert!(sched.step());
        assert_eq!(*log.borrow(), vec![("t", 40, 3)]);
        assert!(!sched.step());
    }

    #[test]
    fn time_until_clamps() {
        let mut sched = Scheduler::new();
        sched.run_until(atto(100));
        assert_eq!(sched.time_until(atto(250)), atto(150));
        assert_eq!(sched.time_until(atto(50)), FixedTime::ZERO);
        assert!(sched.time_until(FixedTime::NEVER).is_never());
    }

    #[test]
    fn next_expiration_tracks_queue() {
        let mut sched = Scheduler::new();
        let log = Log::default();
        let a = recorder(&mut sched, &log, "a");
        let b = recorder(&mut sched, &log, "b");
        assert!(sched.next_expiration().is_never());
        sched.adjust(a, atto(30), 0, FixedTime::ZERO);
        sched.adjust(b, atto(20), 0, FixedTime::ZERO);
        assert_eq!(sched.next_expiration(), atto(20));
        sched.free_timer(b);
        assert_eq!(sched.next_expiration(), atto(30));
    }

    #[test]
    #[should_panic(expected = "freed timer")]
    fn adjusting_freed_timer_panics() {
        let mut sched = Scheduler::new();
        let t = sched.allocate_timer("gone", |_, _| {});
        sched.free_timer(t);
        sched.adjust(t, FixedTime::ZERO, 0, FixedTime::ZERO);
    }

    #[test]
    fn reenabling_a_stale_timer_fires_now() {
        let mut sched = Scheduler::new();
        let log = Log::default();
        let t = recorder(&mut sched, &log, "late");
        sched.adjust(t, atto(100), 3, FixedTime::ZERO);
        assert!(sched.enable(t, false));
        sched.run_until(atto(200));
        assert!(log.borrow().is_empty());

        assert!(!sched.enable(t, true));
        assert_eq!(sched.expire_time(t), atto(200));
        sched.run_until(atto(300));
        assert_eq!(*log.borrow(), [("late", 200, 3)]);
        assert_eq!(sched.now(), atto(300));
    }

    #[test]
    fn timer_ids_follow_allocation_order() {
        let mut sched = Scheduler::new();
        let a = sched.allocate_timer("a", |_, _| {});
        let b = sched.allocate_timer("b", |_, _| {});
        let c = sched.allocate_timer("c", |_, _| {});
        sched.free_timer(b);
        let d = sched.allocate_timer("d", |_, _| {});
        assert_eq!(sched.timer_ids(), [a, c, d]);
    }

    #[test]
    fn restore_rewinds_clock_and_schedules() {
        let mut sched = Scheduler::new();
        let log = Log::default();
        let a = recorder(&mut sched, &log, "a");
        let b = recorder(&mut sched, &log, "b");
        sched.adjust(a, atto(10), 1, atto(10));
        sched.run_until(atto(25));
        let now = sched.now();
        let saved = sched.schedule(a);
        assert_eq!(saved.expire, atto(30));

        sched.run_until(atto(100));
        sched.adjust(b, atto(5), 2, FixedTime::ZERO);
        log.borrow_mut().clear();

        sched.restore(now, [(a, saved), (b, TimerSchedule::disabled(now))]);
        assert_eq!(sched.now(), atto(25));
        assert!(!sched.is_enabled(b));
        sched.run_until(atto(50));
        assert_eq!(*log.borrow(), [("a", 30, 1), ("a", 40, 1), ("a", 50, 1)]);
    }

    #[test]
    fn restore_moves_unlisted_past_timers_to_now() {
        let mut sched = Scheduler::new();
        let log = Log::default();
        let t = recorder(&mut sched, &log, "t");
        sched.adjust(t, atto(10), 0, FixedTime::ZERO);
        sched.restore(atto(40), Vec::<(TimerId, TimerSchedule)>::new());
        assert_eq!(sched.expire_time(t), atto(40));
        sched.run_until(atto(50));
        assert_eq!(*log.borrow(), [("t", 40, 0)]);
    }
}
