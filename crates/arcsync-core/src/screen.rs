//! Raster timing for video-synchronized devices.
//!
//! A [`ScreenTiming`] describes the periodic refresh signal that scanline
//! interrupts and light-gun latches are timed against. The owner moves
//! `frame_start` forward from its vblank timer; every position query is
//! computed from the attosecond offset into the current frame.

use crate::fixed::FixedTime;

/// Frame geometry and phase of an emulated display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenTiming {
    frame_period: FixedTime,
    scanline_period: FixedTime,
    pixel_period: FixedTime,
    total_lines: u32,
    total_columns: u32,
    frame_start: FixedTime,
}

impl ScreenTiming {
    /// Timing for a display refreshing at `refresh_hz`.
    ///
    /// # Panics
    ///
    /// Panics if `refresh_hz` is not positive or either dimension is zero.
    pub fn new(refresh_hz: f64, total_lines: u32, total_columns: u32) -> Self {
        Self::with_frame_period(FixedTime::from_hz(refresh_hz), total_lines, total_columns)
    }

    /// Timing from an exact frame period.
    ///
    /// # Panics
    ///
    /// Panics if either dimension is zero or the period is not positive.
    pub fn with_frame_period(frame_period: FixedTime, total_lines: u32, total_columns: u32) -> Self {
        assert!(total_lines > 0 && total_columns > 0, "screen dimensions must be non-zero");
        assert!(
            frame_period > FixedTime::ZERO && !frame_period.is_never(),
            "frame period must be positive and finite"
        );
        let scanline_period = frame_period / total_lines;
        let pixel_period = scanline_period / total_columns;
        Self {
            frame_period,
            scanline_period,
            pixel_period,
            total_lines,
            total_columns,
            frame_start: FixedTime::ZERO,
        }
    }

    pub fn frame_period(&self) -> FixedTime {
        self.frame_period
    }

    pub fn scanline_period(&self) -> FixedTime {
        self.scanline_period
    }

    pub fn pixel_period(&self) -> FixedTime {
        self.pixel_period
    }

    pub fn total_lines(&self) -> u32 {
        self.total_lines
    }

    pub fn total_columns(&self) -> u32 {
        self.total_columns
    }

    pub fn frame_start(&self) -> FixedTime {
        self.frame_start
    }

    /// Mark the beginning of a new frame (normally from a vblank callback).
    pub fn set_frame_start(&mut self, start: FixedTime) {
        self.frame_start = start;
    }

    /// Offset of `now` into its frame, in attoseconds.
    fn phase(&self, now: FixedTime) -> i128 {
        (now - self.frame_start)
            .as_attoseconds()
            .rem_euclid(self.frame_period.as_attoseconds())
    }

    /// Frames completed between `frame_start` and `now`.
    pub fn frame_number(&self, now: FixedTime) -> u64 {
        let elapsed = (now - self.frame_start).as_attoseconds();
        if elapsed <= 0 {
            return 0;
        }
        (elapsed / self.frame_period.as_attoseconds()) as u64
    }

    /// The scanline being drawn at `now`.
    pub fn vpos(&self, now: FixedTime) -> u32 {
        let line = self.phase(now) / self.scanline_period.as_attoseconds();
        (line as u32).min(self.total_lines - 1)
    }

    /// The column being drawn at `now`.
    pub fn hpos(&self, now: FixedTime) -> u32 {
        let into_line = self.phase(now) - self.vpos(now) as i128 * self.scanline_period.as_attoseconds();
        let column = into_line / self.pixel_period.as_attoseconds().max(1);
        (column as u32).min(self.total_columns - 1)
    }

    /// Time from `now` until the beam next reaches (`vpos`, `hpos`).
    ///
    /// The result is always strictly positive: a position equal to the
    /// current one resolves to the same position in the next frame.
    /// Coordinates past the edge are clamped to the last line/column.
    pub fn time_until_pos(&self, now: FixedTime, vpos: u32, hpos: u32) -> FixedTime {
        let vpos = vpos.min(self.total_lines - 1);
        let hpos = hpos.min(self.total_columns - 1);
        let target = self.scanline_period * vpos + self.pixel_period * hpos;
        let mut delta = target.as_attoseconds() - self.phase(now);
        if delta <= 0 {
            delta += self.frame_period.as_attoseconds();
        }
        FixedTime::from_attoseconds(delta)
    }
}
