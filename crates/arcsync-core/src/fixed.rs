//! Attosecond-resolution fixed-point time.
//!
//! [`FixedTime`] is a whole-seconds counter paired with a sub-second count
//! of attoseconds (10^-18 s). All arithmetic is exact integer math; nothing
//! in the scheduling path goes through floating point. Values whose seconds
//! reach [`MAX_SECONDS`] collapse to [`FixedTime::NEVER`], which compares
//! greater than every finite time.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Div, DivAssign, Mul, MulAssign, Sub, SubAssign};

/// Attoseconds in one second.
pub const ATTOSECONDS_PER_SECOND: u64 = 1_000_000_000_000_000_000;

/// Attoseconds in one millisecond.
pub const ATTOSECONDS_PER_MILLISECOND: u64 = ATTOSECONDS_PER_SECOND / 1_000;

/// Attoseconds in one microsecond.
pub const ATTOSECONDS_PER_MICROSECOND: u64 = ATTOSECONDS_PER_SECOND / 1_000_000;

/// Attoseconds in one nanosecond.
pub const ATTOSECONDS_PER_NANOSECOND: u64 = ATTOSECONDS_PER_SECOND / 1_000_000_000;

/// Whole seconds at which a time becomes [`FixedTime::NEVER`] (~31.7 years).
pub const MAX_SECONDS: i32 = 1_000_000_000;

const APS: i128 = ATTOSECONDS_PER_SECOND as i128;

// ---------------------------------------------------------------------------
// FixedTime
// ---------------------------------------------------------------------------

/// A point in emulated time, or a duration.
///
/// Ordering is lexicographic on `(seconds, attoseconds)`. The sub-second part
/// is always normalized into `[0, 10^18)`, so a negative time such as -0.25 s
/// is stored as `seconds = -1, attoseconds = 750_000_000_000_000_000`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "RawFixedTime")]
pub struct FixedTime {
    seconds: i32,
    attoseconds: u64,
}

/// Unnormalized wire form; deserialization funnels through [`FixedTime::new`].
#[derive(Deserialize)]
struct RawFixedTime {
    seconds: i32,
    attoseconds: u64,
}

impl From<RawFixedTime> for FixedTime {
    fn from(raw: RawFixedTime) -> Self {
        FixedTime::new(raw.seconds, raw.attoseconds)
    }
}

impl FixedTime {
    /// Zero seconds.
    pub const ZERO: FixedTime = FixedTime {
        seconds: 0,
        attoseconds: 0,
    };

    /// The "never" sentinel. Absorbs addition and compares above every
    /// finite time.
    pub const NEVER: FixedTime = FixedTime {
        seconds: MAX_SECONDS,
        attoseconds: 0,
    };

    /// Build a time from parts, carrying excess attoseconds into seconds.
    pub fn new(seconds: i32, attoseconds: u64) -> Self {
        let carry = (attoseconds / ATTOSECONDS_PER_SECOND) as i64;
        Self::from_parts(
            seconds as i64 + carry,
            attoseconds % ATTOSECONDS_PER_SECOND,
        )
    }

    /// Clamp an already-normalized `(seconds, attoseconds)` pair into range.
    fn from_parts(seconds: i64, attoseconds: u64) -> Self {
        debug_assert!(attoseconds < ATTOSECONDS_PER_SECOND);
        if seconds >= MAX_SECONDS as i64 {
            return Self::NEVER;
        }
        if seconds < i32::MIN as i64 {
            return Self {
                seconds: i32::MIN,
                attoseconds: 0,
            };
        }
        Self {
            seconds: seconds as i32,
            attoseconds,
        }
    }

    /// Build a time from a signed total attosecond count.
    pub fn from_attoseconds(total: i128) -> Self {
        let seconds = total.div_euclid(APS);
        let attoseconds = total.rem_euclid(APS) as u64;
        if seconds >= MAX_SECONDS as i128 {
            return Self::NEVER;
        }
        Self::from_parts(seconds.max(i32::MIN as i128 - 1) as i64, attoseconds)
    }

    pub fn from_seconds(seconds: i32) -> Self {
        Self::from_parts(seconds as i64, 0)
    }

    pub fn from_msec(msec: i64) -> Self {
        Self::from_attoseconds(msec as i128 * ATTOSECONDS_PER_MILLISECOND as i128)
    }

    pub fn from_usec(usec: i64) -> Self {
        Self::from_attoseconds(usec as i128 * ATTOSECONDS_PER_MICROSECOND as i128)
    }

    pub fn from_nsec(nsec: i64) -> Self {
        Self::from_attoseconds(nsec as i128 * ATTOSECONDS_PER_NANOSECOND as i128)
    }

    /// The period of one cycle at `frequency` Hz.
    ///
    /// # Panics
    ///
    /// Panics if `frequency` is not strictly positive (including NaN).
    pub fn from_hz(frequency: f64) -> Self {
        assert!(
            frequency > 0.0,
            "FixedTime::from_hz requires a positive frequency, got {frequency}"
        );
        if frequency > 1.0 {
            return Self {
                seconds: 0,
                attoseconds: (ATTOSECONDS_PER_SECOND as f64 / frequency) as u64,
            };
        }
        let period = 1.0 / frequency;
        let whole = period.floor();
        if whole >= MAX_SECONDS as f64 {
            return Self::NEVER;
        }
        let frac = ((period - whole) * ATTOSECONDS_PER_SECOND as f64) as u64;
        Self::new(whole as i32, frac)
    }

    /// The period of one cycle at an integral frequency, truncated to whole
    /// attoseconds without a floating-point round trip.
    ///
    /// # Panics
    ///
    /// Panics if `frequency` is zero.
    pub fn from_hz_int(frequency: u64) -> Self {
        assert!(frequency > 0, "FixedTime::from_hz_int requires a non-zero frequency");
        Self::from_attoseconds(APS / frequency as i128)
    }

    /// The time spanned by `ticks` cycles of a `frequency` Hz clock.
    ///
    /// The sub-second part is rounded up to the next attosecond so that
    /// [`as_ticks`](Self::as_ticks) at the same frequency recovers `ticks`
    /// exactly.
    ///
    /// # Panics
    ///
    /// Panics if `frequency` is zero.
    pub fn from_ticks(ticks: u64, frequency: u32) -> Self {
        assert!(frequency > 0, "FixedTime::from_ticks requires a non-zero frequency");
        let freq = frequency as u64;
        let seconds = ticks / freq;
        if seconds >= MAX_SECONDS as u64 {
            return Self::NEVER;
        }
        let remainder = (ticks % freq) as u128;
        let attoseconds = (remainder * ATTOSECONDS_PER_SECOND as u128).div_ceil(freq as u128);
        Self::from_parts(seconds as i64, attoseconds as u64)
    }

    /// Build a time from floating-point seconds. For initialization only.
    pub fn from_secs_f64(secs: f64) -> Self {
        if secs.is_nan() {
            return Self::ZERO;
        }
        if secs >= MAX_SECONDS as f64 {
            return Self::NEVER;
        }
        let whole = secs.floor();
        let frac = ((secs - whole) * ATTOSECONDS_PER_SECOND as f64) as u64;
        Self::from_parts(whole as i64, frac.min(ATTOSECONDS_PER_SECOND - 1))
    }

    #[inline]
    pub const fn seconds(&self) -> i32 {
        self.seconds
    }

    #[inline]
    pub const fn attoseconds(&self) -> u64 {
        self.attoseconds
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.seconds == 0 && self.attoseconds == 0
    }

    #[inline]
    pub fn is_never(&self) -> bool {
        self.seconds >= MAX_SECONDS
    }

    /// True for times strictly below zero.
    #[inline]
    pub fn is_negative(&self) -> bool {
        self.seconds < 0
    }

    /// The signed total number of attoseconds.
    pub fn as_attoseconds(&self) -> i128 {
        self.seconds as i128 * APS + self.attoseconds as i128
    }

    /// Convert to floating-point seconds. For display and audio resampling
    /// only; never feed the result back into the scheduler.
    pub fn as_secs_f64(&self) -> f64 {
        self.seconds as f64 + self.attoseconds as f64 / ATTOSECONDS_PER_SECOND as f64
    }

    /// Whole cycles of a `frequency` Hz clock that fit in this time.
    ///
    /// Negative times yield 0 and [`NEVER`](Self::NEVER) yields `u64::MAX`.
    ///
    /// # Panics
    ///
    /// Panics if `frequency` is zero.
    pub fn as_ticks(&self, frequency: u32) -> u64 {
        assert!(frequency > 0, "FixedTime::as_ticks requires a non-zero frequency");
        if self.is_never() {
            return u64::MAX;
        }
        if self.seconds < 0 {
            return 0;
        }
        let whole = self.seconds as u64 * frequency as u64;
        let frac = self.attoseconds as u128 * frequency as u128 / ATTOSECONDS_PER_SECOND as u128;
        whole + frac as u64
    }
}

impl Default for FixedTime {
    fn default() -> Self {
        Self::ZERO
    }
}

// ---------------------------------------------------------------------------
// Arithmetic
// ---------------------------------------------------------------------------

impl Add for FixedTime {
    type Output = FixedTime;

    fn add(self, rhs: FixedTime) -> FixedTime {
        if self.is_never() || rhs.is_never() {
            return FixedTime::NEVER;
        }
        let mut attoseconds = self.attoseconds + rhs.attoseconds;
        let mut seconds = self.seconds as i64 + rhs.seconds as i64;
        if attoseconds >= ATTOSECONDS_PER_SECOND {
            attoseconds -= ATTOSECONDS_PER_SECOND;
            seconds += 1;
        }
        FixedTime::from_parts(seconds, attoseconds)
    }
}

impl Sub for FixedTime {
    type Output = FixedTime;

    /// Only the minuend is checked for `never`; the result may be negative.
    fn sub(self, rhs: FixedTime) -> FixedTime {
        if self.is_never() {
            return FixedTime::NEVER;
        }
        let mut seconds = self.seconds as i64 - rhs.seconds as i64;
        let attoseconds = if self.attoseconds >= rhs.attoseconds {
            self.attoseconds - rhs.attoseconds
        } else {
            seconds -= 1;
            self.attoseconds + ATTOSECONDS_PER_SECOND - rhs.attoseconds
        };
        FixedTime::from_parts(seconds, attoseconds)
    }
}

impl Mul<u32> for FixedTime {
    type Output = FixedTime;

    fn mul(self, factor: u32) -> FixedTime {
        if self.is_never() {
            return FixedTime::NEVER;
        }
        if factor == 0 {
            return FixedTime::ZERO;
        }
        FixedTime::from_attoseconds(self.as_attoseconds() * factor as i128)
    }
}

impl Div<u32> for FixedTime {
    type Output = FixedTime;

    /// Floor division of the attosecond count.
    ///
    /// # Panics
    ///
    /// Panics if `divisor` is zero.
    fn div(self, divisor: u32) -> FixedTime {
        assert!(divisor != 0, "FixedTime division by zero");
        if self.is_never() {
            return FixedTime::NEVER;
        }
        if divisor == 1 {
            return self;
        }
        FixedTime::from_attoseconds(self.as_attoseconds().div_euclid(divisor as i128))
    }
}

impl AddAssign for FixedTime {
    fn add_assign(&mut self, rhs: FixedTime) {
        *self = *self + rhs;
    }
}

impl SubAssign for FixedTime {
    fn sub_assign(&mut self, rhs: FixedTime) {
        *self = *self - rhs;
    }
}

impl MulAssign<u32> for FixedTime {
    fn mul_assign(&mut self, factor: u32) {
        *self = *self * factor;
    }
}

impl DivAssign<u32> for FixedTime {
    fn div_assign(&mut self, divisor: u32) {
        *self = *self / divisor;
    }
}

impl fmt::Display for FixedTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_never() {
            return f.write_str("never");
        }
        let total = self.as_attoseconds();
        let sign = if total < 0 { "-" } else { "" };
        let magnitude = total.unsigned_abs();
        let aps = ATTOSECONDS_PER_SECOND as u128;
        write!(f, "{sign}{}.{:018}", magnitude / aps, magnitude % aps)
    }
}
