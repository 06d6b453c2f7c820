//! Real-time motion execution engine.
//!
//! Converts queued straight-line moves into a stream of step pulses with
//! trapezoidal velocity profiles, and runs the machine's real-time life
//! cycle around that stream: feed holds, safety-door parking, homing
//! cycles, limits, overrides and status reporting.
//!
//! ## Layout
//! - [`planner`] — block queue: millimeter targets to step-space blocks.
//! - [`prep`] — segment preparer: blocks to fixed-duration segments.
//! - [`ring`] / [`stepper`] — segment ring and the Bresenham pulse tick.
//! - [`engine`] — the [`engine::MotionEngine`] tying it all together; the
//!   executor state machine lives in its `protocol`/`suspend`/`homing`/
//!   `limits` impl blocks.
//! - [`tick`] — the paced tick thread (RT duals under the `rt` feature).
//! - [`port`] — hardware seams and their simulation implementations.

pub mod config;
pub mod engine;
mod homing;
pub mod isr_cell;
mod limits;
pub mod planner;
pub mod port;
pub mod prep;
mod protocol;
pub mod report;
pub mod ring;
pub mod signals;
pub mod stepper;
mod suspend;
pub mod tick;
