//! Scheduler state carried in a save file.
//!
//! A [`Timeline`] registers the scheduler's clock and the schedule of every
//! timer that is live at registration time as ordinary state blocks, so a
//! save captures emulated time along with device state and a load puts every
//! pending timer back where it was. Timers are matched by allocation order.
//! Callbacks are code and are never saved.
//!
//! Timers allocated after registration are not captured. On load they keep
//! their schedule, pulled forward to the restored clock if it would
//! otherwise lie in the past.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::debug;

use crate::fixed::{ATTOSECONDS_PER_SECOND, FixedTime};
use crate::id::TimerId;
use crate::registry::StateRegistry;
use crate::scheduler::{Scheduler, TimerSchedule};
use crate::serialize::SaveError;

/// The timer still existed when the state was captured.
const LIVE: u8 = 0x01;
const ENABLED: u8 = 0x02;

/// start, expire, period; each as seconds then attoseconds.
const TIMES_PER_TIMER: usize = 6;

fn split(time: FixedTime) -> [i64; 2] {
    [i64::from(time.seconds()), time.attoseconds() as i64]
}

/// Inverse of [`split`]. Out-of-range input from a hostile file clamps
/// instead of wrapping.
fn join(parts: &[i64]) -> FixedTime {
    FixedTime::from_attoseconds(
        i128::from(parts[0]) * i128::from(ATTOSECONDS_PER_SECOND) + i128::from(parts[1]),
    )
}

/// Registered save blocks mirroring a [`Scheduler`].
#[derive(Debug)]
pub struct Timeline {
    ids: Vec<TimerId>,
    now: Rc<RefCell<[i64; 2]>>,
    flags: Rc<RefCell<Vec<u8>>>,
    params: Rc<RefCell<Vec<i64>>>,
    times: Rc<RefCell<Vec<i64>>>,
}

impl Timeline {
    /// Register the clock and every live timer of `scheduler` under
    /// `module`.
    pub fn register(
        scheduler: &Scheduler,
        registry: &mut StateRegistry,
        module: &str,
    ) -> Result<Self, SaveError> {
        let ids = scheduler.timer_ids();
        let count = ids.len();
        let timeline = Self {
            ids,
            now: Rc::new(RefCell::new([0; 2])),
            flags: Rc::new(RefCell::new(vec![0; count])),
            params: Rc::new(RefCell::new(vec![0; count])),
            times: Rc::new(RefCell::new(vec![0; count * TIMES_PER_TIMER])),
        };
        registry.register_block(module, None, 0, "now", &timeline.now)?;
        registry.register_block(module, None, 0, "timer_flags", &timeline.flags)?;
        registry.register_block(module, None, 0, "timer_params", &timeline.params)?;
        registry.register_block(module, None, 0, "timer_times", &timeline.times)?;
        debug!(module, timers = count, "scheduler state registered");
        Ok(timeline)
    }

    /// Number of timers captured on every save.
    pub fn timer_count(&self) -> usize {
        self.ids.len()
    }

    /// Copy the scheduler's clock and timer schedules into the blocks.
    pub fn capture(&self, scheduler: &Scheduler) {
        *self.now.borrow_mut() = split(scheduler.now());
        let mut flags = self.flags.borrow_mut();
        let mut params = self.params.borrow_mut();
        let mut times = self.times.borrow_mut();
        let slots = flags
            .iter_mut()
            .zip(params.iter_mut())
            .zip(times.chunks_exact_mut(TIMES_PER_TIMER));
        for (&id, ((flag, param), time)) in self.ids.iter().zip(slots) {
            if !scheduler.contains(id) {
                *flag = 0;
                *param = 0;
                time.fill(0);
                continue;
            }
            let schedule = scheduler.schedule(id);
            *flag = LIVE | if schedule.enabled { ENABLED } else { 0 };
            *param = schedule.param;
            time[0..2].copy_from_slice(&split(schedule.start));
            time[2..4].copy_from_slice(&split(schedule.expire));
            time[4..6].copy_from_slice(&split(schedule.period));
        }
    }

    /// Push the blocks back into the scheduler after a load.
    ///
    /// A timer that had been freed when the state was captured comes back
    /// disabled.
    pub fn restore(&self, scheduler: &mut Scheduler) {
        let now = join(&*self.now.borrow());
        let flags = self.flags.borrow();
        let params = self.params.borrow();
        let times = self.times.borrow();
        let timers = self
            .ids
            .iter()
            .zip(flags.iter().zip(params.iter()))
            .zip(times.chunks_exact(TIMES_PER_TIMER))
            .map(|((&id, (&flag, &param)), time)| {
                let schedule = if flag & LIVE == 0 {
                    TimerSchedule::disabled(now)
                } else {
                    TimerSchedule {
                        enabled: flag & ENABLED != 0,
                        param,
                        start: join(&time[0..2]),
                        expire: join(&time[2..4]),
                        period: join(&time[4..6]),
                    }
                };
                (id, schedule)
            });
        scheduler.restore(now, timers);
    }
}
