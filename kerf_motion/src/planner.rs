//! Planner block source.
//!
//! The motion engine consumes immutable move descriptors through the
//! [`Planner`] trait and never plans moves itself. [`BlockQueue`] is the
//! built-in implementation: a bounded FIFO that converts millimeter targets
//! into step-space blocks with per-axis kinematic limits applied. It plans
//! every junction at zero speed (no lookahead); the trait methods that a
//! lookahead planner would use to replan are present but trivial here.

use std::collections::VecDeque;

use kerf_common::axis::{AxisMask, MAX_AXES};
use kerf_common::consts::MINIMUM_FEED_RATE;
use kerf_common::error::CommandError;

use crate::config::AxisConfig;

/// Queued planner blocks, matching the classic 16-slot block buffer.
pub const BLOCK_QUEUE_DEPTH: usize = 16;

// ─── Block Descriptors ──────────────────────────────────────────────

/// Spindle direction state carried per block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpindleState {
    #[default]
    Disable,
    Cw,
    Ccw,
}

/// Coolant outputs carried per block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CoolantState {
    pub flood: bool,
    pub mist: bool,
}

/// Execution conditions for one block.
#[derive(Debug, Clone, Copy, Default)]
pub struct MotionFlags {
    /// Single-block motion outside the queue (homing, parking).
    pub system_motion: bool,
    /// Feed override must not scale this block's rate.
    pub no_feed_override: bool,
    /// Rapid (seek) motion, scaled by the rapid override instead.
    pub rapid: bool,
    /// Jog motion, cancelled as a group by jog-cancel.
    pub jog: bool,
}

/// Everything the caller specifies about a move besides the target.
#[derive(Debug, Clone, Copy, Default)]
pub struct MoveData {
    /// Programmed feed rate [mm/min]. Ignored for rapid motion.
    pub feed_rate: f32,
    pub spindle: SpindleState,
    pub spindle_speed: f32,
    pub coolant: CoolantState,
    pub motion: MotionFlags,
}

/// One straight-line move in step space.
///
/// The engine shrinks `millimeters` as it slices the block into segments and
/// rewrites `entry_speed_sqr` when a hold forces a profile recompute; all
/// other fields stay as planned.
#[derive(Debug, Clone)]
pub struct PlannerBlock {
    /// Per-axis step counts (unsigned; direction in `direction_bits`).
    pub steps: [u32; MAX_AXES],
    /// Step count of the dominant axis.
    pub step_event_count: u32,
    /// Bit N set = axis N moves negative.
    pub direction_bits: AxisMask,
    /// Remaining profile length [mm].
    pub millimeters: f32,
    /// Acceleration along the move direction [mm/min^2].
    pub acceleration: f32,
    /// Junction entry speed squared [(mm/min)^2].
    pub entry_speed_sqr: f32,
    /// Rate the caller programmed [mm/min].
    pub programmed_rate: f32,
    /// Rate ceiling along the move direction [mm/min].
    pub rapid_rate: f32,
    pub spindle: SpindleState,
    pub spindle_speed: f32,
    pub coolant: CoolantState,
    pub motion: MotionFlags,
}

impl PlannerBlock {
    /// Nominal speed under the current feed/rapid overrides, floored at the
    /// minimum feed rate so the profile math never divides by zero.
    pub fn profile_nominal_speed(&self, feed_override: u8, rapid_override: u8) -> f32 {
        let mut nominal = self.programmed_rate;
        if self.motion.rapid {
            nominal *= 0.01 * f32::from(rapid_override);
        } else {
            if !self.motion.no_feed_override {
                nominal *= 0.01 * f32::from(feed_override);
            }
            if nominal > self.rapid_rate {
                nominal = self.rapid_rate;
            }
        }
        nominal.max(MINIMUM_FEED_RATE)
    }
}

/// Machine position of every axis in millimeters, from a step snapshot.
pub fn steps_to_mpos(position: &[i32; MAX_AXES], axes: &[AxisConfig]) -> [f32; MAX_AXES] {
    let mut mpos = [0.0_f32; MAX_AXES];
    for (idx, axis) in axes.iter().enumerate() {
        mpos[idx] = position[idx] as f32 / axis.steps_per_mm;
    }
    mpos
}

// ─── Planner Contract ───────────────────────────────────────────────

/// Block source the engine executes from.
///
/// `current_block`/`system_motion_block` hand out the head block mutably so
/// the preparer can shrink its remaining length; the head only advances on
/// `discard_current_block`.
pub trait Planner {
    /// Head of the queue, if any. Does not consume it.
    fn current_block(&mut self) -> Option<&mut PlannerBlock>;
    /// The out-of-queue system motion block (homing, parking), if armed.
    fn system_motion_block(&mut self) -> Option<&mut PlannerBlock>;
    /// Mark the head block fully consumed and advance.
    fn discard_current_block(&mut self);
    /// Exit speed squared of the head block, i.e. the entry speed of the
    /// block after it, zero at the end of the queue.
    fn exec_block_exit_speed_sqr(&self) -> f32;
    /// Recompute stored speeds after an override change. A lookahead
    /// planner replans junctions here.
    fn update_velocity_profile_parameters(&mut self, feed_override: u8, rapid_override: u8);
    /// Replan from the current block after a hold completes.
    fn cycle_reinitialize(&mut self);
    /// Drop every queued block and the system slot.
    fn reset(&mut self);
    /// Re-seed the planned position from the authoritative step counters.
    fn sync_position(&mut self, position: &[i32; MAX_AXES]);
}

// ─── Block Queue ────────────────────────────────────────────────────

/// Bounded zero-lookahead block FIFO.
#[derive(Debug, Default)]
pub struct BlockQueue {
    blocks: VecDeque<PlannerBlock>,
    system_block: Option<PlannerBlock>,
    /// Planned end position in steps, the origin of the next move's deltas.
    position: [i32; MAX_AXES],
}

impl BlockQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plan a line to `target_mm` and queue it. Returns `Ok(false)` for a
    /// zero-step move, `Err(QueueFull)` when the queue has no slot.
    pub fn plan_move(
        &mut self,
        axes: &[AxisConfig],
        target_mm: &[f32],
        data: &MoveData,
    ) -> Result<bool, CommandError> {
        if self.blocks.len() >= BLOCK_QUEUE_DEPTH {
            return Err(CommandError::QueueFull);
        }
        match build_block(axes, &self.position, target_mm, data) {
            Some((block, target_steps)) => {
                self.position = target_steps;
                self.blocks.push_back(block);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Arm the system motion slot with a line to `target_mm`, planned from
    /// the given start position rather than the queue's planned position.
    /// Returns false for a zero-step motion.
    pub fn set_system_block(
        &mut self,
        axes: &[AxisConfig],
        start: &[i32; MAX_AXES],
        target_mm: &[f32],
        data: &MoveData,
    ) -> bool {
        match build_block(axes, start, target_mm, data) {
            Some((block, _)) => {
                self.system_block = Some(block);
                true
            }
            None => {
                self.system_block = None;
                false
            }
        }
    }

    pub fn clear_system_block(&mut self) {
        self.system_block = None;
    }

    /// Planned end position in steps.
    pub fn planned_position(&self) -> &[i32; MAX_AXES] {
        &self.position
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl Planner for BlockQueue {
    fn current_block(&mut self) -> Option<&mut PlannerBlock> {
        self.blocks.front_mut()
    }

    fn system_motion_block(&mut self) -> Option<&mut PlannerBlock> {
        self.system_block.as_mut()
    }

    fn discard_current_block(&mut self) {
        self.blocks.pop_front();
    }

    fn exec_block_exit_speed_sqr(&self) -> f32 {
        // Zero lookahead: every junction is planned at a stop.
        match self.blocks.get(1) {
            Some(next) => next.entry_speed_sqr,
            None => 0.0,
        }
    }

    fn update_velocity_profile_parameters(&mut self, _feed_override: u8, _rapid_override: u8) {
        // Nominal speeds are derived per block load; nothing stored here
        // depends on the override values.
    }

    fn cycle_reinitialize(&mut self) {
        // Junctions are already at zero speed; a lookahead planner would
        // replan the chain from the current block.
    }

    fn reset(&mut self) {
        self.blocks.clear();
        self.system_block = None;
    }

    fn sync_position(&mut self, position: &[i32; MAX_AXES]) {
        self.position = *position;
    }
}

/// Convert a millimeter target into a step-space block. Returns the block
/// and the absolute target in steps, or `None` when no axis moves a full
/// step.
fn build_block(
    axes: &[AxisConfig],
    start: &[i32; MAX_AXES],
    target_mm: &[f32],
    data: &MoveData,
) -> Option<(PlannerBlock, [i32; MAX_AXES])> {
    let mut steps = [0_u32; MAX_AXES];
    let mut target_steps = *start;
    let mut unit_vec = [0.0_f32; MAX_AXES];
    let mut direction_bits = AxisMask::empty();
    let mut step_event_count = 0_u32;
    let mut millimeters_sqr = 0.0_f32;

    for (idx, axis) in axes.iter().enumerate() {
        target_steps[idx] = (target_mm[idx] * axis.steps_per_mm).round() as i32;
        let delta = target_steps[idx] - start[idx];
        steps[idx] = delta.unsigned_abs();
        step_event_count = step_event_count.max(steps[idx]);
        let delta_mm = delta as f32 / axis.steps_per_mm;
        unit_vec[idx] = delta_mm;
        millimeters_sqr += delta_mm * delta_mm;
        if delta < 0 {
            direction_bits.set_axis(idx, true);
        }
    }

    if step_event_count == 0 {
        return None;
    }

    let millimeters = millimeters_sqr.sqrt();
    for component in unit_vec.iter_mut() {
        *component /= millimeters;
    }
    let acceleration = limit_value_by_axis_maximum(axes, &unit_vec, |a| a.accel_mm_min2());
    let rapid_rate = limit_value_by_axis_maximum(axes, &unit_vec, |a| a.max_rate);
    let programmed_rate = if data.motion.rapid { rapid_rate } else { data.feed_rate };

    let block = PlannerBlock {
        steps,
        step_event_count,
        direction_bits,
        millimeters,
        acceleration,
        entry_speed_sqr: 0.0,
        programmed_rate,
        rapid_rate,
        spindle: data.spindle,
        spindle_speed: data.spindle_speed,
        coolant: data.coolant,
        motion: data.motion,
    };
    Some((block, target_steps))
}

/// Largest value along the move direction that keeps every axis within its
/// own limit: min over moving axes of `limit / |unit component|`.
fn limit_value_by_axis_maximum(
    axes: &[AxisConfig],
    unit_vec: &[f32; MAX_AXES],
    limit: impl Fn(&AxisConfig) -> f32,
) -> f32 {
    let mut bounded = f32::MAX;
    for (idx, axis) in axes.iter().enumerate() {
        if unit_vec[idx] != 0.0 {
            bounded = bounded.min(limit(axis) / unit_vec[idx].abs());
        }
    }
    bounded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MachineConfig;

    fn axes() -> Vec<AxisConfig> {
        MachineConfig::default_xyz().axes
    }

    fn feed_move(rate: f32) -> MoveData {
        MoveData {
            feed_rate: rate,
            ..MoveData::default()
        }
    }

    #[test]
    fn plan_move_builds_step_block() {
        let axes = axes();
        let mut queue = BlockQueue::new();
        let queued = queue
            .plan_move(&axes, &[10.0, -4.0, 0.0, 0.0, 0.0, 0.0], &feed_move(300.0))
            .unwrap();
        assert!(queued);

        let block = queue.current_block().unwrap();
        assert_eq!(block.steps[0], 2500);
        assert_eq!(block.steps[1], 1000);
        assert_eq!(block.step_event_count, 2500);
        assert_eq!(block.direction_bits, AxisMask::Y);
        let expected_mm = (10.0_f32 * 10.0 + 4.0 * 4.0).sqrt();
        assert!((block.millimeters - expected_mm).abs() < 1e-4);
        assert_eq!(block.programmed_rate, 300.0);
        assert_eq!(block.entry_speed_sqr, 0.0);
    }

    #[test]
    fn zero_step_move_is_not_queued() {
        let axes = axes();
        let mut queue = BlockQueue::new();
        // Under half a step on every axis.
        let queued = queue
            .plan_move(&axes, &[0.001, 0.0, 0.0, 0.0, 0.0, 0.0], &feed_move(100.0))
            .unwrap();
        assert!(!queued);
        assert!(queue.is_empty());
    }

    #[test]
    fn queue_depth_is_bounded() {
        let axes = axes();
        let mut queue = BlockQueue::new();
        for i in 1..=BLOCK_QUEUE_DEPTH {
            let target = [i as f32, 0.0, 0.0, 0.0, 0.0, 0.0];
            queue.plan_move(&axes, &target, &feed_move(100.0)).unwrap();
        }
        let overflow = queue.plan_move(&axes, &[99.0, 0.0, 0.0, 0.0, 0.0, 0.0], &feed_move(100.0));
        assert!(matches!(overflow, Err(CommandError::QueueFull)));
    }

    #[test]
    fn diagonal_move_limits_acceleration_and_rapid_rate() {
        let axes = axes();
        let mut queue = BlockQueue::new();
        queue
            .plan_move(&axes, &[10.0, 10.0, 0.0, 0.0, 0.0, 0.0], &feed_move(100.0))
            .unwrap();
        let block = queue.current_block().unwrap();
        // Unit components are 1/sqrt(2); each axis allows limit/|u|.
        let expected_accel = 10.0 * 3600.0 * (2.0_f32).sqrt();
        let expected_rapid = 1000.0 * (2.0_f32).sqrt();
        assert!((block.acceleration - expected_accel).abs() / expected_accel < 1e-4);
        assert!((block.rapid_rate - expected_rapid).abs() / expected_rapid < 1e-4);
    }

    #[test]
    fn rapid_motion_uses_rapid_rate_as_programmed() {
        let axes = axes();
        let mut queue = BlockQueue::new();
        let data = MoveData {
            motion: MotionFlags {
                rapid: true,
                ..MotionFlags::default()
            },
            ..MoveData::default()
        };
        queue.plan_move(&axes, &[5.0, 0.0, 0.0, 0.0, 0.0, 0.0], &data).unwrap();
        let block = queue.current_block().unwrap();
        assert_eq!(block.programmed_rate, 1000.0);
    }

    #[test]
    fn exit_speed_is_next_block_entry_or_zero() {
        let axes = axes();
        let mut queue = BlockQueue::new();
        queue.plan_move(&axes, &[5.0, 0.0, 0.0, 0.0, 0.0, 0.0], &feed_move(100.0)).unwrap();
        assert_eq!(queue.exec_block_exit_speed_sqr(), 0.0);
        queue.plan_move(&axes, &[10.0, 0.0, 0.0, 0.0, 0.0, 0.0], &feed_move(100.0)).unwrap();
        assert_eq!(queue.exec_block_exit_speed_sqr(), 0.0);

        queue.discard_current_block();
        queue.discard_current_block();
        assert!(queue.is_empty());
    }

    #[test]
    fn moves_chain_from_planned_position() {
        let axes = axes();
        let mut queue = BlockQueue::new();
        queue.plan_move(&axes, &[4.0, 0.0, 0.0, 0.0, 0.0, 0.0], &feed_move(100.0)).unwrap();
        queue.plan_move(&axes, &[6.0, 0.0, 0.0, 0.0, 0.0, 0.0], &feed_move(100.0)).unwrap();
        queue.discard_current_block();
        let second = queue.current_block().unwrap();
        // 2 mm delta at 250 steps/mm.
        assert_eq!(second.steps[0], 500);
        assert!(!second.direction_bits.has_axis(0));
    }

    #[test]
    fn sync_position_reseeds_deltas() {
        let axes = axes();
        let mut queue = BlockQueue::new();
        let position = [250, 0, 0, 0, 0, 0];
        queue.sync_position(&position);
        queue.plan_move(&axes, &[2.0, 0.0, 0.0, 0.0, 0.0, 0.0], &feed_move(100.0)).unwrap();
        let block = queue.current_block().unwrap();
        assert_eq!(block.steps[0], 250);
    }

    #[test]
    fn system_block_is_separate_from_queue() {
        let axes = axes();
        let mut queue = BlockQueue::new();
        queue.plan_move(&axes, &[5.0, 0.0, 0.0, 0.0, 0.0, 0.0], &feed_move(100.0)).unwrap();
        let start = [0_i32; MAX_AXES];
        let data = MoveData {
            feed_rate: 500.0,
            motion: MotionFlags {
                system_motion: true,
                no_feed_override: true,
                ..MotionFlags::default()
            },
            ..MoveData::default()
        };
        assert!(queue.set_system_block(&axes, &start, &[0.0, 0.0, -3.0, 0.0, 0.0, 0.0], &data));
        assert!(queue.system_motion_block().is_some());
        assert_eq!(queue.current_block().unwrap().steps[0], 1250);
        queue.clear_system_block();
        assert!(queue.system_motion_block().is_none());
    }

    #[test]
    fn nominal_speed_respects_overrides_and_floors() {
        let block = PlannerBlock {
            steps: [100, 0, 0, 0, 0, 0],
            step_event_count: 100,
            direction_bits: AxisMask::empty(),
            millimeters: 1.0,
            acceleration: 36000.0,
            entry_speed_sqr: 0.0,
            programmed_rate: 200.0,
            rapid_rate: 300.0,
            spindle: SpindleState::Disable,
            spindle_speed: 0.0,
            coolant: CoolantState::default(),
            motion: MotionFlags::default(),
        };
        assert_eq!(block.profile_nominal_speed(100, 100), 200.0);
        assert_eq!(block.profile_nominal_speed(50, 100), 100.0);
        // Clamped to rapid rate when the override pushes past it.
        assert_eq!(block.profile_nominal_speed(200, 100), 300.0);

        let mut rapid = block.clone();
        rapid.motion.rapid = true;
        rapid.programmed_rate = 300.0;
        assert_eq!(rapid.profile_nominal_speed(100, 50), 150.0);

        let mut held = block;
        held.motion.no_feed_override = true;
        assert_eq!(held.profile_nominal_speed(10, 100), 200.0);

        // The floor keeps the profile math away from zero.
        let mut crawl = held.clone();
        crawl.programmed_rate = 0.0;
        assert_eq!(crawl.profile_nominal_speed(100, 100), MINIMUM_FEED_RATE);
    }
}
