//! Kerf Common Library
//!
//! Shared vocabulary for the kerf motion stack: axis masks, machine state,
//! realtime/suspend/step-control flag sets, alarm and rejection codes, and
//! the timing constants the segment preparer and pulse generator agree on.
//!
//! # Module Structure
//!
//! - [`axis`] - axis indices, bitmasks and capacity limits
//! - [`state`] - top-level machine state enum
//! - [`flags`] - realtime request, suspend, step-control and override flags
//! - [`alarm`] - alarm codes (fatal until reset)
//! - [`error`] - operator-class command rejections
//! - [`consts`] - step-timer, segment and override constants
//! - [`prelude`] - common re-exports for convenience

pub mod alarm;
pub mod axis;
pub mod consts;
pub mod error;
pub mod flags;
pub mod prelude;
pub mod state;
