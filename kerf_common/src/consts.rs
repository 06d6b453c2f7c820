//! Timing and sizing constants the segment preparer and pulse generator
//! agree on.
//!
//! | Constant | Value | Meaning |
//! |----------|-------|---------|
//! | `STEP_TIMER_HZ` | 20 MHz | base frequency of the step pulse timer |
//! | `ACCELERATION_TICKS_PER_SECOND` | 100 | velocity resolution of the profile walk |
//! | `DT_SEGMENT` | 1/6000 min | nominal segment duration |
//! | `MAX_AMASS_LEVEL` | 3 | highest Bresenham smoothing shift |
//! | `SEGMENT_RING_SLOTS` | 6 | segment ring capacity (one slot kept free) |
//!
//! The AMASS cutoffs double per level; level 0 covers everything faster
//! than `STEP_TIMER_HZ / 8000` timer counts per step.

use std::time::Duration;

use static_assertions::const_assert;

/// Frequency of the step pulse timer [Hz].
pub const STEP_TIMER_HZ: u32 = 20_000_000;

/// Timer counts per microsecond.
pub const TICKS_PER_MICROSECOND: u32 = STEP_TIMER_HZ / 1_000_000;

/// Velocity profile resolution: segments per second at nominal duration.
pub const ACCELERATION_TICKS_PER_SECOND: u32 = 100;

/// Nominal segment duration [min].
pub const DT_SEGMENT: f32 = 1.0 / (ACCELERATION_TICKS_PER_SECOND as f32 * 60.0);

/// Highest adaptive multi-axis step smoothing level (bit-shift amount).
pub const MAX_AMASS_LEVEL: u32 = 3;

/// Timer counts per step above which AMASS level 1 engages (8 kHz cutoff).
pub const AMASS_LEVEL1_CYCLES: u32 = STEP_TIMER_HZ / 8000;
/// Level 2 cutoff (4 kHz).
pub const AMASS_LEVEL2_CYCLES: u32 = 2 * AMASS_LEVEL1_CYCLES;
/// Level 3 cutoff (2 kHz).
pub const AMASS_LEVEL3_CYCLES: u32 = 4 * AMASS_LEVEL1_CYCLES;

/// Slowest representable timer period; slower step rates clamp to this.
pub const CYCLES_PER_TICK_MAX: u32 = 0xFFFF;

/// Segment ring slot count. The ring keeps one slot free, so five segments
/// (roughly 50 ms of motion) can be in flight.
pub const SEGMENT_RING_SLOTS: usize = 6;

const_assert!(SEGMENT_RING_SLOTS >= 2);
const_assert!(STEP_TIMER_HZ % 1_000_000 == 0);

/// Scalar applied to the minimum travel for one step, so a segment is only
/// attempted when it can round to a whole step.
pub const REQ_MM_INCREMENT_SCALAR: f32 = 1.25;

/// Floor for nominal profile speeds [mm/min], keeping the ramp math away
/// from zero division when overrides drive the rate down.
pub const MINIMUM_FEED_RATE: f32 = 1.0;

/// First homing approach travels `max_travel` times this (must exceed 1 so
/// the switch is guaranteed to engage).
pub const HOMING_SEARCH_SCALAR: f32 = 1.1;

/// Locate phases travel `pulloff` times this (must exceed 1 so the switch
/// is guaranteed to clear).
pub const HOMING_LOCATE_SCALAR: f32 = 5.0;

/// Spindle spin-up wait when restoring from a safety-door suspend.
pub const SAFETY_DOOR_SPINDLE_DELAY: Duration = Duration::from_millis(4000);

/// Coolant restart wait when restoring from a safety-door suspend.
pub const SAFETY_DOOR_COOLANT_DELAY: Duration = Duration::from_millis(1000);

/// Chunk size for suspend-aware delays; abort is re-checked at this rate.
pub const SUSPEND_DELAY_STEP: Duration = Duration::from_millis(50);

/// Feed override bounds and increments [% of programmed rate].
pub mod feed_override {
    pub const DEFAULT: u8 = 100;
    pub const MAX: u8 = 200;
    pub const MIN: u8 = 10;
    pub const COARSE_INCREMENT: u8 = 10;
    pub const FINE_INCREMENT: u8 = 1;
}

/// Rapid override levels [% of rapid rate].
pub mod rapid_override {
    pub const DEFAULT: u8 = 100;
    pub const MEDIUM: u8 = 50;
    pub const LOW: u8 = 25;
}

/// Spindle speed override bounds and increments [% of programmed speed].
pub mod spindle_override {
    pub const DEFAULT: u8 = 100;
    pub const MAX: u8 = 200;
    pub const MIN: u8 = 10;
    pub const COARSE_INCREMENT: u8 = 10;
    pub const FINE_INCREMENT: u8 = 1;
}

/// Parking motion defaults [mm, mm/min]; overridable in configuration.
pub mod parking {
    /// Parking axis target in machine coordinates.
    pub const TARGET_MM: f32 = -5.0;
    /// Fast parking rate after the pull-out.
    pub const RATE: f32 = 800.0;
    /// Slow pull-out / plunge feed rate.
    pub const PULLOUT_RATE: f32 = 250.0;
    /// Incremental pull-out distance above the hold point.
    pub const PULLOUT_INCREMENT_MM: f32 = 5.0;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amass_cutoffs_double_per_level() {
        assert_eq!(AMASS_LEVEL1_CYCLES, 2500);
        assert_eq!(AMASS_LEVEL2_CYCLES, 5000);
        assert_eq!(AMASS_LEVEL3_CYCLES, 10000);
    }

    #[test]
    fn dt_segment_is_ten_milliseconds() {
        // 1/6000 min = 10 ms.
        let dt_ms = DT_SEGMENT * 60.0 * 1000.0;
        assert!((dt_ms - 10.0).abs() < 1e-4);
    }

    #[test]
    fn override_bounds_are_ordered() {
        assert!(feed_override::MIN < feed_override::DEFAULT);
        assert!(feed_override::DEFAULT < feed_override::MAX);
        assert!(spindle_override::MIN < spindle_override::DEFAULT);
        assert!(rapid_override::LOW < rapid_override::MEDIUM);
    }
}
