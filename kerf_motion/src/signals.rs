//! Realtime signal block.
//!
//! One [`RtSignals`] instance is shared by the input side (command bytes),
//! the pulse tick (cycle-stop, position-independent flags) and the executor
//! (which consumes everything). All fields are atomics: input and interrupt
//! contexts OR bits in or bump percent registers without ever taking the
//! critical section guarding stepper state.
//!
//! Command bytes 0x80 and up are pure realtime characters; of the printable
//! set only `!`, `~`, `?` and ctrl-X act immediately.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use kerf_common::alarm::Alarm;
use kerf_common::consts::{feed_override, rapid_override, spindle_override};
use kerf_common::flags::{AccessoryOverride, ExecState};
use kerf_common::state::MachineState;

// ─── Command Bytes ──────────────────────────────────────────────────

/// Realtime command characters, acted on outside the line-based protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cmd {
    Reset = 0x18,
    StatusReport = b'?',
    CycleStart = b'~',
    FeedHold = b'!',
    SafetyDoor = 0x84,
    JogCancel = 0x85,
    FeedOvrReset = 0x90,
    FeedOvrCoarsePlus = 0x91,
    FeedOvrCoarseMinus = 0x92,
    FeedOvrFinePlus = 0x93,
    FeedOvrFineMinus = 0x94,
    RapidOvrReset = 0x95,
    RapidOvrMedium = 0x96,
    RapidOvrLow = 0x97,
    SpindleOvrReset = 0x99,
    SpindleOvrCoarsePlus = 0x9A,
    SpindleOvrCoarseMinus = 0x9B,
    SpindleOvrFinePlus = 0x9C,
    SpindleOvrFineMinus = 0x9D,
    SpindleOvrStop = 0x9E,
    CoolantFloodOvrToggle = 0xA0,
    CoolantMistOvrToggle = 0xA1,
}

impl Cmd {
    pub const fn from_u8(byte: u8) -> Option<Self> {
        Some(match byte {
            0x18 => Self::Reset,
            b'?' => Self::StatusReport,
            b'~' => Self::CycleStart,
            b'!' => Self::FeedHold,
            0x84 => Self::SafetyDoor,
            0x85 => Self::JogCancel,
            0x90 => Self::FeedOvrReset,
            0x91 => Self::FeedOvrCoarsePlus,
            0x92 => Self::FeedOvrCoarseMinus,
            0x93 => Self::FeedOvrFinePlus,
            0x94 => Self::FeedOvrFineMinus,
            0x95 => Self::RapidOvrReset,
            0x96 => Self::RapidOvrMedium,
            0x97 => Self::RapidOvrLow,
            0x99 => Self::SpindleOvrReset,
            0x9A => Self::SpindleOvrCoarsePlus,
            0x9B => Self::SpindleOvrCoarseMinus,
            0x9C => Self::SpindleOvrFinePlus,
            0x9D => Self::SpindleOvrFineMinus,
            0x9E => Self::SpindleOvrStop,
            0xA0 => Self::CoolantFloodOvrToggle,
            0xA1 => Self::CoolantMistOvrToggle,
            _ => return None,
        })
    }
}

/// True when `byte` must be intercepted before line buffering.
pub const fn is_realtime_byte(byte: u8) -> bool {
    byte >= 0x80 || matches!(byte, 0x18 | b'?' | b'~' | b'!')
}

// ─── Signal Block ───────────────────────────────────────────────────

/// Shared realtime request state.
///
/// The `state` register mirrors the executor's machine state so input-side
/// gating (jog cancel only applies while jogging) and status queries work
/// without touching executor data.
#[derive(Debug)]
pub struct RtSignals {
    exec: AtomicU8,
    accessory: AtomicU8,
    alarm: AtomicU8,
    feed_ovr: AtomicU8,
    rapid_ovr: AtomicU8,
    spindle_ovr: AtomicU8,
    abort: AtomicBool,
    door_ajar: AtomicBool,
    state: AtomicU8,
}

impl Default for RtSignals {
    fn default() -> Self {
        Self::new()
    }
}

impl RtSignals {
    pub fn new() -> Self {
        Self {
            exec: AtomicU8::new(0),
            accessory: AtomicU8::new(0),
            alarm: AtomicU8::new(0),
            feed_ovr: AtomicU8::new(feed_override::DEFAULT),
            rapid_ovr: AtomicU8::new(rapid_override::DEFAULT),
            spindle_ovr: AtomicU8::new(spindle_override::DEFAULT),
            abort: AtomicBool::new(false),
            door_ajar: AtomicBool::new(false),
            state: AtomicU8::new(MachineState::default() as u8),
        }
    }

    // ── Exec flags ──

    pub fn set_exec(&self, flags: ExecState) {
        self.exec.fetch_or(flags.bits(), Ordering::Release);
    }

    pub fn exec_state(&self) -> ExecState {
        ExecState::from_bits_truncate(self.exec.load(Ordering::Acquire))
    }

    pub fn clear_exec(&self, flags: ExecState) {
        self.exec.fetch_and(!flags.bits(), Ordering::Release);
    }

    // ── Accessory requests ──

    pub fn set_accessory(&self, flags: AccessoryOverride) {
        self.accessory.fetch_or(flags.bits(), Ordering::Release);
    }

    /// Consume all pending accessory requests.
    pub fn take_accessory(&self) -> AccessoryOverride {
        AccessoryOverride::from_bits_truncate(self.accessory.swap(0, Ordering::AcqRel))
    }

    // ── Alarm ──

    pub fn raise_alarm(&self, alarm: Alarm) {
        self.alarm.store(alarm as u8, Ordering::Release);
    }

    pub fn alarm_pending(&self) -> bool {
        self.alarm.load(Ordering::Acquire) != 0
    }

    pub fn take_alarm(&self) -> Option<Alarm> {
        Alarm::from_u8(self.alarm.swap(0, Ordering::AcqRel))
    }

    // ── Override registers ──

    pub fn feed_override(&self) -> u8 {
        self.feed_ovr.load(Ordering::Relaxed)
    }

    pub fn rapid_override(&self) -> u8 {
        self.rapid_ovr.load(Ordering::Relaxed)
    }

    pub fn spindle_override(&self) -> u8 {
        self.spindle_ovr.load(Ordering::Relaxed)
    }

    // ── Abort / door / state mirror ──

    pub fn set_abort(&self) {
        self.abort.store(true, Ordering::Release);
    }

    pub fn clear_abort(&self) {
        self.abort.store(false, Ordering::Release);
    }

    pub fn abort(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    /// Physical safety-door switch state, fed by the input side.
    pub fn set_door_ajar(&self, ajar: bool) {
        self.door_ajar.store(ajar, Ordering::Release);
    }

    pub fn door_ajar(&self) -> bool {
        self.door_ajar.load(Ordering::Acquire)
    }

    /// Executor publishes its state here after every transition.
    pub fn publish_state(&self, state: MachineState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn state(&self) -> MachineState {
        MachineState::from_u8(self.state.load(Ordering::Acquire)).unwrap_or(MachineState::Alarm)
    }

    // ── Byte intake ──

    /// Decode and apply one realtime command byte. Returns false when the
    /// byte is not a realtime command (callers pass it on to line input).
    pub fn push_realtime(&self, byte: u8) -> bool {
        let Some(cmd) = Cmd::from_u8(byte) else {
            return false;
        };
        match cmd {
            Cmd::Reset => self.set_exec(ExecState::RESET),
            Cmd::StatusReport => self.set_exec(ExecState::STATUS_REPORT),
            Cmd::CycleStart => self.set_exec(ExecState::CYCLE_START),
            Cmd::FeedHold => self.set_exec(ExecState::FEED_HOLD),
            Cmd::SafetyDoor => self.set_exec(ExecState::SAFETY_DOOR),
            Cmd::JogCancel => {
                // Only a jog can be jog-cancelled; otherwise the byte is
                // accepted and dropped.
                if self.state() == MachineState::Jog {
                    self.set_exec(ExecState::MOTION_CANCEL);
                }
            }
            Cmd::FeedOvrReset => self.feed_ovr.store(feed_override::DEFAULT, Ordering::Relaxed),
            Cmd::FeedOvrCoarsePlus => self.step_override(
                &self.feed_ovr,
                i16::from(feed_override::COARSE_INCREMENT),
                feed_override::MIN,
                feed_override::MAX,
            ),
            Cmd::FeedOvrCoarseMinus => self.step_override(
                &self.feed_ovr,
                -i16::from(feed_override::COARSE_INCREMENT),
                feed_override::MIN,
                feed_override::MAX,
            ),
            Cmd::FeedOvrFinePlus => self.step_override(
                &self.feed_ovr,
                i16::from(feed_override::FINE_INCREMENT),
                feed_override::MIN,
                feed_override::MAX,
            ),
            Cmd::FeedOvrFineMinus => self.step_override(
                &self.feed_ovr,
                -i16::from(feed_override::FINE_INCREMENT),
                feed_override::MIN,
                feed_override::MAX,
            ),
            Cmd::RapidOvrReset => self.rapid_ovr.store(rapid_override::DEFAULT, Ordering::Relaxed),
            Cmd::RapidOvrMedium => self.rapid_ovr.store(rapid_override::MEDIUM, Ordering::Relaxed),
            Cmd::RapidOvrLow => self.rapid_ovr.store(rapid_override::LOW, Ordering::Relaxed),
            Cmd::SpindleOvrReset => {
                self.spindle_ovr.store(spindle_override::DEFAULT, Ordering::Relaxed)
            }
            Cmd::SpindleOvrCoarsePlus => self.step_override(
                &self.spindle_ovr,
                i16::from(spindle_override::COARSE_INCREMENT),
                spindle_override::MIN,
                spindle_override::MAX,
            ),
            Cmd::SpindleOvrCoarseMinus => self.step_override(
                &self.spindle_ovr,
                -i16::from(spindle_override::COARSE_INCREMENT),
                spindle_override::MIN,
                spindle_override::MAX,
            ),
            Cmd::SpindleOvrFinePlus => self.step_override(
                &self.spindle_ovr,
                i16::from(spindle_override::FINE_INCREMENT),
                spindle_override::MIN,
                spindle_override::MAX,
            ),
            Cmd::SpindleOvrFineMinus => self.step_override(
                &self.spindle_ovr,
                -i16::from(spindle_override::FINE_INCREMENT),
                spindle_override::MIN,
                spindle_override::MAX,
            ),
            Cmd::SpindleOvrStop => self.set_accessory(AccessoryOverride::SPINDLE_STOP),
            Cmd::CoolantFloodOvrToggle => self.set_accessory(AccessoryOverride::COOLANT_FLOOD_TOGGLE),
            Cmd::CoolantMistOvrToggle => self.set_accessory(AccessoryOverride::COOLANT_MIST_TOGGLE),
        }
        true
    }

    /// Adjust a percent register by `delta`, clamped to `[min, max]`.
    fn step_override(&self, register: &AtomicU8, delta: i16, min: u8, max: u8) {
        let _ = register.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
            let next = (i16::from(current) + delta).clamp(i16::from(min), i16::from(max));
            Some(next as u8)
        });
    }
}
