//! Hardware port seams.
//!
//! The engine never touches pins or timers directly; it drives these traits.
//! The pulse tick calls [`StepPort`] and [`TimerPort`] from interrupt
//! context, so implementations must be wait-free there (latch the request,
//! let hardware or a worker complete it). The simulation ports record
//! everything for inspection and are what the tests and the demo binary run
//! against.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU16, AtomicU32, Ordering};

use kerf_common::axis::{AxisMask, MAX_AXES};

use crate::planner::{CoolantState, SpindleState};

// ─── Traits ─────────────────────────────────────────────────────────

/// Step and direction outputs plus driver enable.
pub trait StepPort: Send + Sync {
    /// Latch direction bits and raise the masked step pins.
    ///
    /// Called from the pulse tick; must not block.
    fn begin_pulse(&self, step_bits: AxisMask, dir_bits: AxisMask);

    /// Arrange for the raised step pins to fall after `pulse_us`. The tick
    /// does not wait for completion.
    fn schedule_pulse_off(&self, pulse_us: u32);

    /// Energize or release the stepper drivers.
    fn set_enabled(&self, enabled: bool);
}

/// The step pulse timer.
pub trait TimerPort: Send + Sync {
    /// Program the tick period in step-timer cycles.
    fn set_period(&self, cycles_per_tick: u16);

    fn period(&self) -> u16;

    fn start(&self);

    fn stop(&self);

    fn is_running(&self) -> bool;
}

/// Spindle output.
pub trait SpindlePort: Send + Sync {
    /// Update speed only; called from the pulse tick at segment loads.
    fn set_rpm(&self, rpm: f32);

    /// Energize/de-energize with a direction and speed.
    fn set_state(&self, state: SpindleState, rpm: f32);
}

/// Coolant outputs.
pub trait CoolantPort: Send + Sync {
    fn set_state(&self, coolant: CoolantState);
}

/// Limit switch inputs.
pub trait LimitPort: Send + Sync {
    /// Triggered switches as an axis mask, polarity already normalized.
    fn state(&self) -> AxisMask;
}

// ─── Simulation Ports ───────────────────────────────────────────────

/// Step port that counts emitted pulses per axis.
#[derive(Debug, Default)]
pub struct SimStepPort {
    pulses: [AtomicU32; MAX_AXES],
    pulse_offs: AtomicU32,
    enabled: AtomicBool,
    last_dir_bits: AtomicU8,
}

impl SimStepPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pulses emitted on `axis` since construction.
    pub fn pulse_count(&self, axis: usize) -> u32 {
        self.pulses[axis].load(Ordering::Acquire)
    }

    pub fn pulse_off_count(&self) -> u32 {
        self.pulse_offs.load(Ordering::Acquire)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn last_dir_bits(&self) -> AxisMask {
        AxisMask::from_bits_truncate(self.last_dir_bits.load(Ordering::Acquire))
    }
}

impl StepPort for SimStepPort {
    fn begin_pulse(&self, step_bits: AxisMask, dir_bits: AxisMask) {
        self.last_dir_bits.store(dir_bits.bits(), Ordering::Release);
        for axis in 0..MAX_AXES {
            if step_bits.has_axis(axis) {
                self.pulses[axis].fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    fn schedule_pulse_off(&self, _pulse_us: u32) {
        self.pulse_offs.fetch_add(1, Ordering::AcqRel);
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }
}

/// Timer port backed by plain state; the simulation scheduler polls it.
#[derive(Debug, Default)]
pub struct SimTimerPort {
    period: AtomicU16,
    running: AtomicBool,
}

impl SimTimerPort {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimerPort for SimTimerPort {
    fn set_period(&self, cycles_per_tick: u16) {
        self.period.store(cycles_per_tick, Ordering::Release);
    }

    fn period(&self) -> u16 {
        self.period.load(Ordering::Acquire)
    }

    fn start(&self) {
        self.running.store(true, Ordering::Release);
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Spindle port recording the last commanded state and speed.
#[derive(Debug, Default)]
pub struct SimSpindlePort {
    inner: Mutex<SimSpindle>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SimSpindle {
    pub state: SpindleState,
    pub rpm: f32,
}

impl SimSpindlePort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> SimSpindle {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SpindlePort for SimSpindlePort {
    fn set_rpm(&self, rpm: f32) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).rpm = rpm;
    }

    fn set_state(&self, state: SpindleState, rpm: f32) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.state = state;
        inner.rpm = rpm;
    }
}

/// Coolant port recording the last commanded outputs.
#[derive(Debug, Default)]
pub struct SimCoolantPort {
    inner: Mutex<CoolantState>,
}

impl SimCoolantPort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CoolantState {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CoolantPort for SimCoolantPort {
    fn set_state(&self, coolant: CoolantState) {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner()) = coolant;
    }
}

type LimitRule = Box<dyn Fn() -> AxisMask + Send>;

/// Limit port combining a directly-set mask with an optional rule closure
/// (e.g. "trigger X once its position passes a threshold").
#[derive(Default)]
pub struct SimLimitPort {
    manual: AtomicU8,
    rule: Mutex<Option<LimitRule>>,
}

impl SimLimitPort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_triggered(&self, mask: AxisMask) {
        self.manual.store(mask.bits(), Ordering::Release);
    }

    /// Install a rule evaluated on every `state()` read.
    pub fn set_rule(&self, rule: impl Fn() -> AxisMask + Send + 'static) {
        *self.rule.lock().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(rule));
    }

    pub fn clear_rule(&self) {
        *self.rule.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

impl std::fmt::Debug for SimLimitPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimLimitPort")
            .field("manual", &self.manual.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl LimitPort for SimLimitPort {
    fn state(&self) -> AxisMask {
        let mut mask = AxisMask::from_bits_truncate(self.manual.load(Ordering::Acquire));
        if let Some(rule) = self.rule.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            mask |= rule();
        }
        mask
    }
}

// ─── Port Bundle ────────────────────────────────────────────────────

/// All hardware seams bundled; the pulse-tick side clones the Arcs it needs.
#[derive(Clone)]
pub struct Ports {
    pub step: std::sync::Arc<dyn StepPort>,
    pub timer: std::sync::Arc<dyn TimerPort>,
    pub spindle: std::sync::Arc<dyn SpindlePort>,
    pub coolant: std::sync::Arc<dyn CoolantPort>,
    pub limits: std::sync::Arc<dyn LimitPort>,
}

/// Concrete handles to the simulation ports for inspection.
#[derive(Clone)]
pub struct SimPorts {
    pub step: std::sync::Arc<SimStepPort>,
    pub timer: std::sync::Arc<SimTimerPort>,
    pub spindle: std::sync::Arc<SimSpindlePort>,
    pub coolant: std::sync::Arc<SimCoolantPort>,
    pub limits: std::sync::Arc<SimLimitPort>,
}

impl Ports {
    /// Build the simulation port set; the second value keeps concrete
    /// handles so callers can inspect and stimulate them.
    pub fn sim() -> (Self, SimPorts) {
        let sim = SimPorts {
            step: std::sync::Arc::new(SimStepPort::new()),
            timer: std::sync::Arc::new(SimTimerPort::new()),
            spindle: std::sync::Arc::new(SimSpindlePort::new()),
            coolant: std::sync::Arc::new(SimCoolantPort::new()),
            limits: std::sync::Arc::new(SimLimitPort::new()),
        };
        let ports = Self {
            step: sim.step.clone(),
            timer: sim.timer.clone(),
            spindle: sim.spindle.clone(),
            coolant: sim.coolant.clone(),
            limits: sim.limits.clone(),
        };
        (ports, sim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_step_port_counts_per_axis() {
        let port = SimStepPort::new();
        port.begin_pulse(AxisMask::X | AxisMask::Z, AxisMask::Z);
        port.begin_pulse(AxisMask::X, AxisMask::empty());
        port.schedule_pulse_off(4);
        assert_eq!(port.pulse_count(0), 2);
        assert_eq!(port.pulse_count(1), 0);
        assert_eq!(port.pulse_count(2), 1);
        assert_eq!(port.pulse_off_count(), 1);
    }

    #[test]
    fn sim_limit_rule_overlays_manual_mask() {
        let port = SimLimitPort::new();
        assert!(port.state().is_empty());
        port.set_triggered(AxisMask::Y);
        assert_eq!(port.state(), AxisMask::Y);

        let hit = std::sync::Arc::new(AtomicBool::new(false));
        let hit_in_rule = hit.clone();
        port.set_rule(move || {
            if hit_in_rule.load(Ordering::Acquire) {
                AxisMask::X
            } else {
                AxisMask::empty()
            }
        });
        assert_eq!(port.state(), AxisMask::Y);
        hit.store(true, Ordering::Release);
        assert_eq!(port.state(), AxisMask::X | AxisMask::Y);
    }

    #[test]
    fn sim_timer_tracks_period_and_running() {
        let timer = SimTimerPort::new();
        assert!(!timer.is_running());
        timer.set_period(1200);
        timer.start();
        assert!(timer.is_running());
        assert_eq!(timer.period(), 1200);
        timer.stop();
        assert!(!timer.is_running());
    }
}
