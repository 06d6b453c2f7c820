//! Segment ring buffer types shared between the preparer and the pulse
//! generator.
//!
//! The preparer appends [`Segment`]s at the head, the pulse tick consumes
//! them at the tail, strictly FIFO. A segment never outlives the block data
//! it indexes: each segment carries an `Arc` to its [`StepBlock`], so the
//! planner block itself can be discarded while segments derived from it are
//! still queued.

use std::sync::Arc;

use heapless::spsc::Queue;
use kerf_common::axis::{AxisMask, MAX_AXES};
use kerf_common::consts::SEGMENT_RING_SLOTS;

/// Bresenham snapshot of one planner block.
///
/// Step counts are stored pre-shifted left by `MAX_AMASS_LEVEL` so the pulse
/// tick can derive any smoothing level by right-shifting without ever
/// dividing below the original resolution (integer roundoff there would lose
/// steps).
#[derive(Debug)]
pub struct StepBlock {
    /// Bit N set = axis N moves in the negative direction.
    pub direction_bits: AxisMask,
    /// Per-axis step counts, pre-shifted left by `MAX_AMASS_LEVEL`.
    pub steps: [u32; MAX_AXES],
    /// Dominant-axis step count, same pre-shift as `steps`.
    pub step_event_count: u32,
    /// Spindle output follows the instantaneous rate (laser mode).
    pub is_rate_adjusted: bool,
}

/// One fixed-duration slice of a block's velocity profile.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Steps the pulse tick executes for this segment, scaled by the
    /// smoothing level.
    pub n_step: u16,
    /// Timer period in step-timer cycles, clamped to `u16::MAX`.
    pub cycles_per_tick: u16,
    /// Smoothing level the tick uses to view the block's step counts.
    pub amass_level: u8,
    /// Spindle speed while this segment executes.
    pub spindle_rpm: f32,
    /// Block this segment slices.
    pub block: Arc<StepBlock>,
}

impl Segment {
    /// True when `other` slices the same block as `self`.
    #[inline]
    pub fn same_block(&self, other: &Arc<StepBlock>) -> bool {
        Arc::ptr_eq(&self.block, other)
    }
}

/// SPSC segment queue. One slot stays open, so `SEGMENT_RING_SLOTS - 1`
/// segments are usable, roughly 50 ms of queued motion at the nominal
/// segment duration.
pub type SegmentRing = Queue<Segment, SEGMENT_RING_SLOTS>;

#[cfg(test)]
mod tests {
    use super::*;

    fn test_block() -> Arc<StepBlock> {
        Arc::new(StepBlock {
            direction_bits: AxisMask::empty(),
            steps: [800, 400, 0, 0, 0, 0],
            step_event_count: 800,
            is_rate_adjusted: false,
        })
    }

    fn test_segment(n_step: u16, block: &Arc<StepBlock>) -> Segment {
        Segment {
            n_step,
            cycles_per_tick: 1000,
            amass_level: 0,
            spindle_rpm: 0.0,
            block: Arc::clone(block),
        }
    }

    #[test]
    fn ring_is_fifo_with_one_slot_open() {
        let mut ring = SegmentRing::new();
        let block = test_block();
        for i in 0..(SEGMENT_RING_SLOTS - 1) {
            ring.enqueue(test_segment(i as u16, &block)).unwrap();
        }
        assert!(ring.is_full());
        assert!(ring.enqueue(test_segment(99, &block)).is_err());

        for i in 0..(SEGMENT_RING_SLOTS - 1) {
            assert_eq!(ring.dequeue().unwrap().n_step, i as u16);
        }
        assert!(ring.dequeue().is_none());
    }

    #[test]
    fn segments_share_block_data() {
        let block = test_block();
        let a = test_segment(10, &block);
        let b = test_segment(20, &block);
        assert!(a.same_block(&b.block));
        drop(block);
        // Both segments keep the snapshot alive.
        assert_eq!(a.block.step_event_count, 800);
    }
}
