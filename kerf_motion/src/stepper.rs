//! Pulse generator: the per-tick interrupt body and its shared state.
//!
//! Every timer tick emits the step pulses computed by the previous tick,
//! then runs one Bresenham pass over the active segment to decide the next
//! pulses. Loading a segment reprograms the timer period; when the ring runs
//! dry the tick stops the timer and raises `CYCLE_STOP`, which is the only
//! signal the executor has that motion completed.
//!
//! Everything the tick touches lives in [`SharedIsrState`] behind one
//! [`IsrCell`]. The cooperative side reaches in only through short closures:
//! enqueue a segment, snapshot positions, set the homing axis lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use kerf_common::axis::{AxisMask, MAX_AXES};
use kerf_common::flags::ExecState;
use kerf_common::state::MachineState;

use crate::config::MachineConfig;
use crate::isr_cell::IsrCell;
use crate::port::Ports;
use crate::ring::{Segment, SegmentRing, StepBlock};
use crate::signals::RtSignals;

/// Per-tick constants derived from the machine configuration.
#[derive(Debug, Clone, Copy)]
pub struct TickConfig {
    pub axis_count: usize,
    pub step_invert: AxisMask,
    pub dir_invert: AxisMask,
    pub pulse_us: u32,
}

impl TickConfig {
    pub fn from_config(config: &MachineConfig) -> Self {
        Self {
            axis_count: config.axis_count(),
            step_invert: AxisMask::from_bits_truncate(config.pulse.step_invert_mask),
            dir_invert: AxisMask::from_bits_truncate(config.pulse.dir_invert_mask),
            pulse_us: config.pulse.pulse_us,
        }
    }
}

/// Execution state of the active segment.
#[derive(Debug, Default)]
struct StepperExec {
    /// Bresenham counters, reset to half the event count per block.
    counter: [u32; MAX_AXES],
    /// Active block's step counts viewed at the segment's smoothing level.
    steps: [u32; MAX_AXES],
    /// Ticks left in the active segment.
    step_count: u16,
    exec_segment: Option<Segment>,
    exec_block: Option<Arc<StepBlock>>,
    /// Pulses computed last tick, emitted at the top of this tick.
    step_outbits: AxisMask,
    dir_outbits: AxisMask,
}

/// All state shared between the pulse tick and the cooperative side.
#[derive(Debug)]
pub struct SharedIsrState {
    ring: SegmentRing,
    exec: StepperExec,
    /// Actual machine position in steps; written only by the tick, except
    /// for homing commits and position syncs while the timer is stopped.
    sys_position: [i32; MAX_AXES],
    /// Axes allowed to emit steps; all bits outside homing.
    homing_lock: AxisMask,
    /// Motion ended; drivers await the idle-lock policy.
    idle_pending: bool,
    segments_completed: u64,
}

impl Default for SharedIsrState {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedIsrState {
    pub fn new() -> Self {
        Self {
            ring: SegmentRing::new(),
            exec: StepperExec::default(),
            sys_position: [0; MAX_AXES],
            homing_lock: AxisMask::all(),
            idle_pending: false,
            segments_completed: 0,
        }
    }

    // ── Producer side ──

    #[inline]
    pub fn ring_is_full(&self) -> bool {
        self.ring.is_full()
    }

    #[inline]
    pub fn ring_len(&self) -> usize {
        self.ring.len()
    }

    /// Append a segment; false only if the producer raced its own full check.
    pub fn enqueue_segment(&mut self, segment: Segment) -> bool {
        self.ring.enqueue(segment).is_ok()
    }

    #[cfg(test)]
    pub(crate) fn dequeue_segment(&mut self) -> Option<Segment> {
        self.ring.dequeue()
    }

    // ── Cooperative-side accessors ──

    #[inline]
    pub fn position(&self) -> [i32; MAX_AXES] {
        self.sys_position
    }

    /// Overwrite positions. Only valid while the timer is stopped.
    pub fn set_position(&mut self, position: [i32; MAX_AXES]) {
        self.sys_position = position;
    }

    pub fn set_axis_position(&mut self, axis: usize, steps: i32) {
        self.sys_position[axis] = steps;
    }

    /// Restrict which axes may emit steps (homing approach phases).
    pub fn set_homing_lock(&mut self, lock: AxisMask) {
        self.homing_lock = lock;
    }

    /// Re-admit every axis.
    pub fn clear_homing_lock(&mut self) {
        self.homing_lock = AxisMask::all();
    }

    pub fn take_idle_pending(&mut self) -> bool {
        std::mem::take(&mut self.idle_pending)
    }

    pub fn clear_idle_pending(&mut self) {
        self.idle_pending = false;
    }

    #[inline]
    pub fn segments_completed(&self) -> u64 {
        self.segments_completed
    }

    /// Drop all queued and in-flight motion. Positions are kept; the caller
    /// re-seeds the planner from them.
    pub fn reset(&mut self) {
        while self.ring.dequeue().is_some() {}
        self.exec = StepperExec::default();
        self.homing_lock = AxisMask::all();
        self.idle_pending = false;
    }

    // ── The tick body ──

    /// One pulse-tick pass. Runs inside the critical section.
    pub(crate) fn tick(&mut self, ports: &Ports, cfg: &TickConfig, signals: &RtSignals) {
        // Emit last tick's pulses first so pulse timing never depends on how
        // long the bookkeeping below takes.
        ports.step.begin_pulse(
            self.exec.step_outbits ^ cfg.step_invert,
            self.exec.dir_outbits ^ cfg.dir_invert,
        );
        ports.step.schedule_pulse_off(cfg.pulse_us);

        if self.exec.exec_segment.is_none() {
            match self.ring.dequeue() {
                Some(segment) => {
                    ports.timer.set_period(segment.cycles_per_tick);
                    let new_block = match &self.exec.exec_block {
                        Some(current) => !segment.same_block(current),
                        None => true,
                    };
                    if new_block {
                        self.exec.dir_outbits = segment.block.direction_bits;
                        // Half the event count gives symmetric rounding.
                        self.exec.counter = [segment.block.step_event_count >> 1; MAX_AXES];
                        self.exec.exec_block = Some(Arc::clone(&segment.block));
                    }
                    for axis in 0..cfg.axis_count {
                        self.exec.steps[axis] = segment.block.steps[axis] >> segment.amass_level;
                    }
                    self.exec.step_count = segment.n_step;
                    ports.spindle.set_rpm(segment.spindle_rpm);
                    self.exec.exec_segment = Some(segment);
                }
                None => {
                    self.go_idle(ports, signals);
                    if let Some(block) = &self.exec.exec_block {
                        if block.is_rate_adjusted && signals.state() != MachineState::Jog {
                            ports.spindle.set_rpm(0.0);
                        }
                    }
                    signals.set_exec(ExecState::CYCLE_STOP);
                    return;
                }
            }
        }

        let Some(block) = self.exec.exec_block.as_ref() else {
            return;
        };
        let mut step_outbits = AxisMask::empty();
        for axis in 0..cfg.axis_count {
            self.exec.counter[axis] += self.exec.steps[axis];
            if self.exec.counter[axis] > block.step_event_count {
                step_outbits.set_axis(axis, true);
                self.exec.counter[axis] -= block.step_event_count;
                if block.direction_bits.has_axis(axis) {
                    self.sys_position[axis] -= 1;
                } else {
                    self.sys_position[axis] += 1;
                }
            }
        }
        // Locked axes hold still while their partners keep homing.
        step_outbits &= self.homing_lock;
        self.exec.step_outbits = step_outbits;

        self.exec.step_count = self.exec.step_count.saturating_sub(1);
        if self.exec.step_count == 0 {
            self.exec.exec_segment = None;
            self.segments_completed += 1;
        }
    }

    /// Ring ran dry: stop the timer and decide the driver policy.
    fn go_idle(&mut self, ports: &Ports, signals: &RtSignals) {
        ports.timer.stop();
        self.exec.step_outbits = AxisMask::empty();
        let state = signals.state();
        if state == MachineState::Sleep || signals.alarm_pending() {
            ports.step.set_enabled(false);
        } else if state != MachineState::Homing {
            // Normal completion: the main loop releases the drivers after
            // the configured idle lock time.
            self.idle_pending = true;
        }
    }
}

// ─── Tick Handle ────────────────────────────────────────────────────

/// Cloneable handle the tick driver (or a test thread) runs the pulse
/// generator through, independent of the engine borrow.
#[derive(Clone)]
pub struct IsrHandle {
    isr: Arc<IsrCell<SharedIsrState>>,
    signals: Arc<RtSignals>,
    ports: Ports,
    cfg: TickConfig,
    busy: Arc<AtomicBool>,
}

impl IsrHandle {
    pub fn new(
        isr: Arc<IsrCell<SharedIsrState>>,
        signals: Arc<RtSignals>,
        ports: Ports,
        cfg: TickConfig,
    ) -> Self {
        Self {
            isr,
            signals,
            ports,
            cfg,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run one tick if the timer is running. Returns whether a tick ran;
    /// overlapping invocations are dropped, not queued.
    pub fn tick(&self) -> bool {
        if !self.ports.timer.is_running() {
            return false;
        }
        if self
            .busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        self.isr
            .with(|shared| shared.tick(&self.ports, &self.cfg, &self.signals));
        self.busy.store(false, Ordering::Release);
        true
    }

    /// Current timer period in step-timer cycles.
    #[inline]
    pub fn period(&self) -> u16 {
        self.ports.timer.period()
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.ports.timer.is_running()
    }

    pub fn position(&self) -> [i32; MAX_AXES] {
        self.isr.with(|shared| shared.position())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{StepPort, TimerPort};
    use kerf_common::consts::MAX_AMASS_LEVEL;

    fn test_cfg() -> TickConfig {
        TickConfig {
            axis_count: 3,
            step_invert: AxisMask::empty(),
            dir_invert: AxisMask::empty(),
            pulse_us: 4,
        }
    }

    fn block(steps: [u32; 3], dirs: AxisMask) -> Arc<StepBlock> {
        let mut shifted = [0_u32; MAX_AXES];
        for (out, s) in shifted.iter_mut().zip(steps.iter()) {
            *out = s << MAX_AMASS_LEVEL;
        }
        let event = steps.iter().copied().max().unwrap() << MAX_AMASS_LEVEL;
        Arc::new(StepBlock {
            direction_bits: dirs,
            steps: shifted,
            step_event_count: event,
            is_rate_adjusted: false,
        })
    }

    fn segment(n_step: u16, level: u8, block: &Arc<StepBlock>) -> Segment {
        Segment {
            n_step: n_step << level,
            cycles_per_tick: 2000,
            amass_level: level,
            spindle_rpm: 0.0,
            block: Arc::clone(block),
        }
    }

    #[test]
    fn bresenham_distributes_minor_axis_steps() {
        let (ports, sim) = Ports::sim();
        let signals = RtSignals::new();
        let cfg = test_cfg();
        let mut shared = SharedIsrState::new();

        let blk = block([100, 50, 0], AxisMask::Y);
        assert!(shared.enqueue_segment(segment(100, 0, &blk)));
        sim.timer.start();

        for _ in 0..101 {
            shared.tick(&ports, &cfg, &signals);
        }
        // One trailing tick flushes the last computed pulses.
        assert_eq!(sim.step.pulse_count(0), 100);
        assert_eq!(sim.step.pulse_count(1), 50);
        assert_eq!(shared.position(), [100, -50, 0, 0, 0, 0]);
        assert_eq!(shared.segments_completed(), 1);
    }

    #[test]
    fn amass_level_view_executes_exact_step_total() {
        let (ports, _sim) = Ports::sim();
        let signals = RtSignals::new();
        let cfg = test_cfg();
        let mut shared = SharedIsrState::new();

        let blk = block([40, 13, 7], AxisMask::empty());
        // Two segments at different smoothing levels covering the block.
        assert!(shared.enqueue_segment(segment(25, 3, &blk)));
        assert!(shared.enqueue_segment(segment(15, 1, &blk)));

        let ticks = 25 * 8 + 15 * 2 + 1;
        for _ in 0..ticks {
            shared.tick(&ports, &cfg, &signals);
        }
        assert_eq!(shared.position(), [40, 13, 7, 0, 0, 0]);
    }

    #[test]
    fn empty_ring_stops_timer_and_raises_cycle_stop() {
        let (ports, sim) = Ports::sim();
        let signals = RtSignals::new();
        signals.publish_state(MachineState::Cycle);
        let cfg = test_cfg();
        let mut shared = SharedIsrState::new();
        sim.timer.start();

        shared.tick(&ports, &cfg, &signals);
        assert!(!sim.timer.is_running());
        assert!(signals.exec_state().contains(ExecState::CYCLE_STOP));
        assert!(shared.take_idle_pending());
        assert!(!shared.take_idle_pending());
    }

    #[test]
    fn go_idle_disables_drivers_in_sleep_or_alarm() {
        let (ports, sim) = Ports::sim();
        let signals = RtSignals::new();
        let cfg = test_cfg();
        sim.step.set_enabled(true);

        signals.publish_state(MachineState::Sleep);
        let mut shared = SharedIsrState::new();
        shared.tick(&ports, &cfg, &signals);
        assert!(!sim.step.is_enabled());
        assert!(!shared.take_idle_pending());
    }

    #[test]
    fn homing_lock_masks_pulses_but_partner_continues() {
        let (ports, sim) = Ports::sim();
        let signals = RtSignals::new();
        signals.publish_state(MachineState::Homing);
        let cfg = test_cfg();
        let mut shared = SharedIsrState::new();

        let blk = block([60, 60, 0], AxisMask::empty());
        assert!(shared.enqueue_segment(segment(60, 0, &blk)));
        shared.set_homing_lock(AxisMask::Y);

        for _ in 0..61 {
            shared.tick(&ports, &cfg, &signals);
        }
        assert_eq!(sim.step.pulse_count(0), 0);
        assert_eq!(sim.step.pulse_count(1), 60);
    }

    #[test]
    fn invert_masks_apply_to_outputs_only() {
        let (ports, sim) = Ports::sim();
        let signals = RtSignals::new();
        let cfg = TickConfig {
            dir_invert: AxisMask::X,
            ..test_cfg()
        };
        let mut shared = SharedIsrState::new();

        let blk = block([10, 0, 0], AxisMask::empty());
        assert!(shared.enqueue_segment(segment(10, 0, &blk)));
        for _ in 0..11 {
            shared.tick(&ports, &cfg, &signals);
        }
        // Logical direction positive, physical line inverted.
        assert!(sim.step.last_dir_bits().has_axis(0));
        assert_eq!(shared.position()[0], 10);
    }

    #[test]
    fn handle_skips_ticks_while_timer_stopped() {
        let (ports, sim) = Ports::sim();
        let signals = Arc::new(RtSignals::new());
        let isr = Arc::new(IsrCell::new(SharedIsrState::new()));
        let handle = IsrHandle::new(isr, signals, ports, test_cfg());

        assert!(!handle.tick());
        sim.timer.start();
        assert!(handle.tick());
        // The empty-ring tick stopped the timer again.
        assert!(!handle.tick());
    }

    #[test]
    fn reset_drops_motion_but_keeps_position() {
        let (ports, _sim) = Ports::sim();
        let signals = RtSignals::new();
        let cfg = test_cfg();
        let mut shared = SharedIsrState::new();

        let blk = block([100, 0, 0], AxisMask::empty());
        assert!(shared.enqueue_segment(segment(100, 0, &blk)));
        assert!(shared.enqueue_segment(segment(100, 0, &blk)));
        for _ in 0..10 {
            shared.tick(&ports, &cfg, &signals);
        }
        let pos = shared.position();
        assert!(pos[0] > 0);

        shared.reset();
        assert_eq!(shared.ring_len(), 0);
        assert_eq!(shared.position(), pos);
    }
}
