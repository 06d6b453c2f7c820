//! Segment preparer: slices planner blocks into fixed-duration segments.
//!
//! Each pass walks the active block's velocity profile in nominal
//! [`DT_SEGMENT`] increments and converts the distance covered into a whole
//! number of dominant-axis steps plus a timer period, filling the segment
//! ring until it is full or the queue runs dry. Fractional steps carry over
//! between segments as a time remainder, so the executed step total always
//! matches the planned block exactly.
//!
//! The preparer holds the only mutable view of the active block: it shrinks
//! `millimeters` as it consumes the profile and rewrites `entry_speed_sqr`
//! when a hold or override forces a recompute. Everything it hands to the
//! pulse tick is immutable snapshot data.

use std::sync::Arc;

use kerf_common::axis::MAX_AXES;
use kerf_common::consts::{
    AMASS_LEVEL1_CYCLES, AMASS_LEVEL2_CYCLES, AMASS_LEVEL3_CYCLES, CYCLES_PER_TICK_MAX,
    DT_SEGMENT, MAX_AMASS_LEVEL, REQ_MM_INCREMENT_SCALAR, STEP_TIMER_HZ,
};
use kerf_common::flags::StepControlFlags;

use crate::config::MachineConfig;
use crate::isr_cell::IsrCell;
use crate::planner::{Planner, SpindleState};
use crate::ring::{Segment, StepBlock};
use crate::stepper::SharedIsrState;

/// Override percentages sampled once per fill pass.
#[derive(Debug, Clone, Copy)]
pub struct Overrides {
    pub feed: u8,
    pub rapid: u8,
    pub spindle: u8,
}

impl Default for Overrides {
    fn default() -> Self {
        Self {
            feed: 100,
            rapid: 100,
            spindle: 100,
        }
    }
}

/// Velocity profile phase of the active block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ramp {
    Accel,
    Cruise,
    Decel,
    /// Entry speed exceeds the overridden nominal speed; decelerate down to
    /// it before resuming the normal profile.
    DecelOverride,
}

/// Reload bookkeeping between fill passes.
#[derive(Debug, Clone, Copy, Default)]
struct RecalcFlags {
    /// Recompute the profile of the retained block instead of loading fresh
    /// Bresenham data.
    recalculate: bool,
    /// Next block load enforces deceleration from the held exit speed.
    decel_override: bool,
    /// A hold stopped mid-block; its step progress is retained for resume.
    hold_partial_block: bool,
    /// Currently slicing a parking system motion.
    parking: bool,
}

/// Persistent preparer state across fill passes.
#[derive(Debug)]
pub struct SegmentPrep {
    /// False forces the next pass to load or recompute the head block.
    block_loaded: bool,
    st_block: Option<Arc<StepBlock>>,
    flags: RecalcFlags,
    ramp: Ramp,

    // Step bookkeeping of the active block.
    steps_remaining: f32,
    step_per_mm: f32,
    req_mm_increment: f32,
    dt_remainder: f32,

    // Velocity profile, distances measured from the end of the block.
    current_speed: f32,
    maximum_speed: f32,
    exit_speed: f32,
    accelerate_until: f32,
    decelerate_after: f32,
    mm_complete: f32,

    // Laser power tracking.
    inv_rate: f32,
    current_spindle_rpm: f32,

    // Shadow of the partially completed block across a parking motion.
    last_st_block: Option<Arc<StepBlock>>,
    last_steps_remaining: f32,
    last_dt_remainder: f32,
    last_step_per_mm: f32,
}

impl Default for SegmentPrep {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentPrep {
    pub fn new() -> Self {
        Self {
            block_loaded: false,
            st_block: None,
            flags: RecalcFlags::default(),
            ramp: Ramp::Accel,
            steps_remaining: 0.0,
            step_per_mm: 0.0,
            req_mm_increment: 0.0,
            dt_remainder: 0.0,
            current_speed: 0.0,
            maximum_speed: 0.0,
            exit_speed: 0.0,
            accelerate_until: 0.0,
            decelerate_after: 0.0,
            mm_complete: 0.0,
            inv_rate: 0.0,
            current_spindle_rpm: 0.0,
            last_st_block: None,
            last_steps_remaining: 0.0,
            last_dt_remainder: 0.0,
            last_step_per_mm: 0.0,
        }
    }

    /// Instantaneous profile speed [mm/min]; zero indicates a completed
    /// hold deceleration.
    #[inline]
    pub fn current_speed(&self) -> f32 {
        self.current_speed
    }

    /// A hold stopped the active block mid-profile.
    #[inline]
    pub fn holds_partial_block(&self) -> bool {
        self.flags.hold_partial_block
    }

    /// Forget everything; the next pass starts from a fresh head block.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// A hold or override changed the active profile: persist the running
    /// speed as the block's new entry speed and force a recompute.
    pub fn update_plan_parameters(
        &mut self,
        planner: &mut dyn Planner,
        step_control: StepControlFlags,
    ) {
        if !self.block_loaded {
            return;
        }
        self.flags.recalculate = true;
        let block = if step_control.contains(StepControlFlags::EXECUTE_SYS_MOTION) {
            planner.system_motion_block()
        } else {
            planner.current_block()
        };
        if let Some(block) = block {
            block.entry_speed_sqr = self.current_speed * self.current_speed;
        }
        self.block_loaded = false;
    }

    /// Shelve the partially completed block and switch to slicing a parking
    /// system motion.
    pub fn setup_parking_buffer(&mut self) {
        if self.flags.hold_partial_block {
            self.last_st_block = self.st_block.clone();
            self.last_steps_remaining = self.steps_remaining;
            self.last_dt_remainder = self.dt_remainder;
            self.last_step_per_mm = self.step_per_mm;
        }
        self.flags.parking = true;
        self.flags.recalculate = false;
        self.block_loaded = false;
    }

    /// Restore the shelved block after the parking motion finished, or clear
    /// the parking context entirely when no partial block was held.
    pub fn restore_parking_buffer(&mut self) {
        if self.flags.hold_partial_block {
            self.st_block = self.last_st_block.clone();
            self.steps_remaining = self.last_steps_remaining;
            self.dt_remainder = self.last_dt_remainder;
            self.step_per_mm = self.last_step_per_mm;
            self.req_mm_increment = REQ_MM_INCREMENT_SCALAR / self.step_per_mm;
            self.flags = RecalcFlags {
                recalculate: true,
                hold_partial_block: true,
                ..RecalcFlags::default()
            };
        } else {
            self.flags = RecalcFlags::default();
        }
        self.block_loaded = false;
    }

    /// Fill the segment ring from the planner until it is full, the queue is
    /// empty, or the profile hits a stop condition.
    pub fn fill(
        &mut self,
        planner: &mut dyn Planner,
        config: &MachineConfig,
        step_control: &mut StepControlFlags,
        ovr: Overrides,
        isr: &IsrCell<SharedIsrState>,
    ) {
        if step_control.contains(StepControlFlags::END_MOTION) {
            return;
        }
        loop {
            if isr.with(|shared| shared.ring_is_full()) {
                return;
            }

            let sys_motion = step_control.contains(StepControlFlags::EXECUTE_SYS_MOTION);
            let queue_exit_speed_sqr = if sys_motion {
                0.0
            } else {
                planner.exec_block_exit_speed_sqr()
            };

            let block_available = if sys_motion {
                planner.system_motion_block().is_some()
            } else {
                planner.current_block().is_some()
            };
            if !block_available {
                return;
            }

            if !self.block_loaded {
                self.load_or_recompute(planner, config, step_control, ovr, queue_exit_speed_sqr);
                step_control.insert(StepControlFlags::UPDATE_SPINDLE_RPM);
                self.block_loaded = true;
            }

            let hold = step_control.contains(StepControlFlags::EXECUTE_HOLD);
            let block = if sys_motion {
                planner.system_motion_block()
            } else {
                planner.current_block()
            };
            // Loaded above from the same source.
            let Some(block) = block else {
                return;
            };

            // ── Walk the profile for one nominal segment duration ──
            let mut dt_max = DT_SEGMENT;
            let mut dt = 0.0_f32;
            let mut time_var = dt_max;
            let mut mm_remaining = block.millimeters;
            let minimum_mm = (mm_remaining - self.req_mm_increment).max(0.0);

            loop {
                match self.ramp {
                    Ramp::DecelOverride => {
                        let speed_var = block.acceleration * time_var;
                        if self.current_speed - self.maximum_speed <= speed_var {
                            // Ramp down complete; continue as a cruise.
                            mm_remaining = self.accelerate_until;
                            time_var = 2.0 * (block.millimeters - mm_remaining)
                                / (self.current_speed + self.maximum_speed);
                            self.ramp = Ramp::Cruise;
                            self.current_speed = self.maximum_speed;
                        } else {
                            mm_remaining -= time_var * (self.current_speed - 0.5 * speed_var);
                            self.current_speed -= speed_var;
                        }
                    }
                    Ramp::Accel => {
                        let speed_var = block.acceleration * time_var;
                        mm_remaining -= time_var * (self.current_speed + 0.5 * speed_var);
                        if mm_remaining < self.accelerate_until {
                            // Ramp junction or end of block.
                            mm_remaining = self.accelerate_until;
                            time_var = 2.0 * (block.millimeters - mm_remaining)
                                / (self.current_speed + self.maximum_speed);
                            self.ramp = if mm_remaining == self.decelerate_after {
                                Ramp::Decel
                            } else {
                                Ramp::Cruise
                            };
                            self.current_speed = self.maximum_speed;
                        } else {
                            self.current_speed += speed_var;
                        }
                    }
                    Ramp::Cruise => {
                        let mm_var = mm_remaining - self.maximum_speed * time_var;
                        if mm_var < self.decelerate_after {
                            // End of cruise.
                            time_var = (mm_remaining - self.decelerate_after) / self.maximum_speed;
                            mm_remaining = self.decelerate_after;
                            self.ramp = Ramp::Decel;
                        } else {
                            mm_remaining = mm_var;
                        }
                    }
                    Ramp::Decel => {
                        let speed_var = block.acceleration * time_var;
                        let mut done = false;
                        if self.current_speed > speed_var {
                            let mm_var =
                                mm_remaining - time_var * (self.current_speed - 0.5 * speed_var);
                            if mm_var > self.mm_complete {
                                mm_remaining = mm_var;
                                self.current_speed -= speed_var;
                                done = true;
                            }
                        }
                        if !done {
                            // End of block or of a forced deceleration.
                            time_var = 2.0 * (mm_remaining - self.mm_complete)
                                / (self.current_speed + self.exit_speed);
                            mm_remaining = self.mm_complete;
                            self.current_speed = self.exit_speed;
                        }
                    }
                }

                dt += time_var;
                if dt < dt_max {
                    time_var = dt_max - dt;
                } else if mm_remaining > minimum_mm {
                    // Too slow to round to a whole step yet; extend the
                    // segment by whole nominal durations until one fits.
                    dt_max += DT_SEGMENT;
                    time_var = dt_max - dt;
                } else {
                    break;
                }
                if mm_remaining <= self.mm_complete {
                    break;
                }
            }

            // ── Spindle output for this segment ──
            let rate_adjusted = self
                .st_block
                .as_ref()
                .is_some_and(|st| st.is_rate_adjusted);
            if rate_adjusted || step_control.contains(StepControlFlags::UPDATE_SPINDLE_RPM) {
                if block.spindle != SpindleState::Disable {
                    let mut rpm = block.spindle_speed * 0.01 * f32::from(ovr.spindle);
                    if rate_adjusted {
                        rpm *= self.current_speed * self.inv_rate;
                    }
                    self.current_spindle_rpm = rpm;
                } else {
                    self.current_spindle_rpm = 0.0;
                }
                step_control.remove(StepControlFlags::UPDATE_SPINDLE_RPM);
            }

            // ── Convert distance to whole steps and a timer period ──
            let step_dist_remaining = self.step_per_mm * mm_remaining;
            let n_steps_remaining = step_dist_remaining.ceil();
            let last_n_steps_remaining = self.steps_remaining.ceil();
            let n_step = (last_n_steps_remaining - n_steps_remaining) as u32;

            if n_step == 0 && hold {
                // Less than one step left to stop on; the tick needs whole
                // steps, so end here and let the hold complete.
                step_control.insert(StepControlFlags::END_MOTION);
                if !self.flags.parking {
                    self.flags.hold_partial_block = true;
                }
                return;
            }

            dt += self.dt_remainder;
            let inv_rate = dt / (last_n_steps_remaining - step_dist_remaining);
            let mut cycles = ((STEP_TIMER_HZ * 60) as f32 * inv_rate).ceil() as u32;

            let (amass_level, n_step) = if cycles < AMASS_LEVEL1_CYCLES {
                (0_u8, n_step)
            } else {
                let level: u8 = if cycles < AMASS_LEVEL2_CYCLES {
                    1
                } else if cycles < AMASS_LEVEL3_CYCLES {
                    2
                } else {
                    MAX_AMASS_LEVEL as u8
                };
                cycles >>= level;
                (level, n_step << level)
            };
            let cycles_per_tick = cycles.min(CYCLES_PER_TICK_MAX) as u16;

            let Some(st_block) = self.st_block.as_ref() else {
                return;
            };
            let segment = Segment {
                n_step: n_step.min(u32::from(u16::MAX)) as u16,
                cycles_per_tick,
                amass_level,
                spindle_rpm: self.current_spindle_rpm,
                block: Arc::clone(st_block),
            };
            let enqueued = isr.with(|shared| shared.enqueue_segment(segment));
            debug_assert!(enqueued, "ring full despite producer-side check");

            // Commit the consumed distance and the partial-step time carry.
            block.millimeters = mm_remaining;
            self.steps_remaining = n_steps_remaining;
            self.dt_remainder = (n_steps_remaining - step_dist_remaining) * inv_rate;

            if mm_remaining == self.mm_complete {
                if mm_remaining > 0.0 {
                    // Forced deceleration stopped mid-block.
                    self.current_speed = 0.0;
                    step_control.insert(StepControlFlags::END_MOTION);
                    if !self.flags.parking {
                        self.flags.hold_partial_block = true;
                    }
                    return;
                }
                // Block complete.
                if sys_motion {
                    step_control.insert(StepControlFlags::END_MOTION);
                    return;
                }
                self.block_loaded = false;
                planner.discard_current_block();
            }
        }
    }

    /// Load Bresenham data for a fresh head block, or keep the retained data
    /// and only recompute the profile, then classify the profile shape.
    fn load_or_recompute(
        &mut self,
        planner: &mut dyn Planner,
        config: &MachineConfig,
        step_control: &StepControlFlags,
        ovr: Overrides,
        queue_exit_speed_sqr: f32,
    ) {
        let hold = step_control.contains(StepControlFlags::EXECUTE_HOLD);
        let sys_motion = step_control.contains(StepControlFlags::EXECUTE_SYS_MOTION);
        let laser_mode = config.laser_mode;
        let block = if sys_motion {
            planner.system_motion_block()
        } else {
            planner.current_block()
        };
        let Some(block) = block else {
            return;
        };

        if self.flags.recalculate {
            if self.flags.parking {
                self.flags.recalculate = false;
            } else {
                self.flags = RecalcFlags::default();
            }
        } else {
            let rate_adjusted = laser_mode && block.spindle == SpindleState::Ccw;
            let mut steps = [0_u32; MAX_AXES];
            for (shifted, &count) in steps.iter_mut().zip(block.steps.iter()) {
                *shifted = count << MAX_AMASS_LEVEL;
            }
            self.st_block = Some(Arc::new(StepBlock {
                direction_bits: block.direction_bits,
                steps,
                step_event_count: block.step_event_count << MAX_AMASS_LEVEL,
                is_rate_adjusted: rate_adjusted,
            }));

            self.steps_remaining = block.step_event_count as f32;
            self.step_per_mm = self.steps_remaining / block.millimeters;
            self.req_mm_increment = REQ_MM_INCREMENT_SCALAR / self.step_per_mm;
            self.dt_remainder = 0.0;

            if hold || self.flags.decel_override {
                // Mid-hold load: enforce deceleration from the held speed.
                self.current_speed = self.exit_speed;
                block.entry_speed_sqr = self.exit_speed * self.exit_speed;
                self.flags.decel_override = false;
            } else {
                self.current_speed = block.entry_speed_sqr.sqrt();
            }
            if rate_adjusted {
                self.inv_rate = 1.0 / block.programmed_rate;
            }
        }

        // ── Classify the velocity profile ──
        self.mm_complete = 0.0;
        let inv_2_accel = 0.5 / block.acceleration;

        if hold {
            self.ramp = Ramp::Decel;
            let decel_dist = block.millimeters - inv_2_accel * block.entry_speed_sqr;
            if decel_dist < 0.0 {
                // The stop lands beyond this block.
                self.exit_speed =
                    (block.entry_speed_sqr - 2.0 * block.acceleration * block.millimeters).sqrt();
            } else {
                self.mm_complete = decel_dist;
                self.exit_speed = 0.0;
            }
            return;
        }

        self.ramp = Ramp::Accel;
        self.accelerate_until = block.millimeters;
        let exit_speed_sqr = if sys_motion { 0.0 } else { queue_exit_speed_sqr };
        self.exit_speed = exit_speed_sqr.sqrt();

        let nominal_speed = block.profile_nominal_speed(ovr.feed, ovr.rapid);
        let nominal_speed_sqr = nominal_speed * nominal_speed;
        let intersect_distance =
            0.5 * (block.millimeters + inv_2_accel * (block.entry_speed_sqr - exit_speed_sqr));

        if block.entry_speed_sqr > nominal_speed_sqr {
            // Only reachable through an override reduction mid-block.
            self.accelerate_until =
                block.millimeters - inv_2_accel * (block.entry_speed_sqr - nominal_speed_sqr);
            if self.accelerate_until <= 0.0 {
                // Cannot reach the reduced nominal speed within the block.
                self.ramp = Ramp::Decel;
                self.exit_speed =
                    (block.entry_speed_sqr - 2.0 * block.acceleration * block.millimeters).sqrt();
                self.flags.decel_override = true;
            } else {
                self.decelerate_after = inv_2_accel * (nominal_speed_sqr - exit_speed_sqr);
                self.maximum_speed = nominal_speed;
                self.ramp = Ramp::DecelOverride;
            }
        } else if intersect_distance > 0.0 {
            if intersect_distance < block.millimeters {
                // Trapezoid or triangle.
                self.decelerate_after = inv_2_accel * (nominal_speed_sqr - exit_speed_sqr);
                if self.decelerate_after < intersect_distance {
                    self.maximum_speed = nominal_speed;
                    if block.entry_speed_sqr == nominal_speed_sqr {
                        // Cruise-deceleration or cruise-only.
                        self.ramp = Ramp::Cruise;
                    } else {
                        // Full trapezoid or acceleration-cruise.
                        self.accelerate_until -=
                            inv_2_accel * (nominal_speed_sqr - block.entry_speed_sqr);
                    }
                } else {
                    // Triangle: peak below nominal.
                    self.accelerate_until = intersect_distance;
                    self.decelerate_after = intersect_distance;
                    self.maximum_speed =
                        (2.0 * block.acceleration * intersect_distance + exit_speed_sqr).sqrt();
                }
            } else {
                // Deceleration only.
                self.ramp = Ramp::Decel;
            }
        } else {
            // Acceleration only.
            self.accelerate_until = 0.0;
            self.maximum_speed = self.exit_speed;
        }
    }
}
