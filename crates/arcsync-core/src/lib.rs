//! Arcsync Core -- timing and save-state core for arcade machine emulation.
//!
//! This crate provides the deterministic time base, the discrete-event timer
//! scheduler that interleaves emulated devices, and the state registry that
//! captures and restores every device's mutable fields as a portable save
//! file.
//!
//! # Emulation loop
//!
//! A [`machine::Machine`] owns one [`scheduler::Scheduler`] and one
//! [`registry::StateRegistry`]:
//!
//! 1. **Setup** -- Devices allocate timers and register state blocks.
//! 2. **Start** -- The registration window closes; later registrations are
//!    illegal.
//! 3. **Run** -- The scheduler jumps to the earliest pending expiration,
//!    fires that callback, and repeats. Equal expirations fire in allocation
//!    order.
//! 4. **Save / load** -- Presave hooks run, every block is encoded in name
//!    order behind a 32-byte header, and on load the header and structural
//!    signature are validated before any state is touched. The scheduler's
//!    clock and timer schedules travel in the same body.
//!
//! ```rust,ignore
//! let mut machine = Machine::new(StateConfig::from_toml_str(config)?);
//! let vblank = machine.scheduler_mut().allocate_timer("vblank", |s, _| { /* ... */ });
//! machine.registry_mut().register_block("video", None, 0, "scroll", &scroll)?;
//! machine.start()?;
//! machine.run_for(FixedTime::from_hz(60.0))?;
//! machine.save_state(&mut file)?;
//! ```
//!
//! # Key Types
//!
//! - [`fixed::FixedTime`] -- Seconds plus attoseconds; exact, with a `never`
//!   sentinel.
//! - [`scheduler::Scheduler`] -- Timers, dispatch loop, and time queries.
//! - [`screen::ScreenTiming`] -- Beam position and raster-relative delays.
//! - [`registry::StateRegistry`] -- Named state blocks, hooks, signature.
//! - [`serialize`] -- Save-file header, error taxonomy, write and read.
//! - [`config::StateConfig`] -- TOML-loadable save-state settings.
//! - [`timeline::Timeline`] -- Scheduler clock and timers as save blocks.
//! - [`rewind::RewindBuffer`] -- Ring of in-memory save states.

pub mod codec;
pub mod config;
pub mod fixed;
pub mod id;
pub mod machine;
pub mod registry;
pub mod rewind;
pub mod scheduler;
pub mod screen;
pub mod serialize;
pub mod timeline;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
