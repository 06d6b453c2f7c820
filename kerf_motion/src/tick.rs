//! Pulse tick driver.
//!
//! Runs the step generator at the period the segment preparer programmed
//! into the timer port, using `clock_nanosleep(TIMER_ABSTIME)` for
//! drift-free pacing under the `rt` feature and `std::thread::sleep` in
//! simulation. The period is re-read after every tick because a segment
//! load reprograms it.
//!
//! ## RT setup sequence
//! 1. `mlockall(MCL_CURRENT | MCL_FUTURE)` — lock all pages.
//! 2. Prefault stack pages.
//! 3. `sched_setaffinity` — pin to an isolated CPU core.
//! 4. `sched_setscheduler(SCHED_FIFO)` — RT priority.
//!
//! An overrun (tick body longer than the programmed period) stretches the
//! motion instead of corrupting it: step counts are exact regardless of
//! pacing. Overruns are therefore counted, not fatal.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use kerf_common::consts::STEP_TIMER_HZ;

use crate::stepper::IsrHandle;

/// Nanoseconds per step-timer cycle.
const NS_PER_CYCLE: i64 = 1_000_000_000 / STEP_TIMER_HZ as i64;

/// Poll interval while the pulse timer is stopped.
const IDLE_POLL: Duration = Duration::from_micros(200);

// ─── Tick Statistics ────────────────────────────────────────────────

/// O(1) per-tick timing statistics. Updated every tick, no allocation.
#[derive(Debug, Clone)]
pub struct TickStats {
    /// Total ticks executed.
    pub tick_count: u64,
    /// Last tick duration [ns].
    pub last_tick_ns: i64,
    /// Minimum tick duration [ns].
    pub min_tick_ns: i64,
    /// Maximum tick duration [ns].
    pub max_tick_ns: i64,
    /// Running sum for average computation.
    pub sum_tick_ns: i64,
    /// Ticks whose body outlasted the programmed period.
    pub overruns: u64,
    /// Maximum wake-up latency [ns].
    pub max_latency_ns: i64,
}

impl TickStats {
    pub const fn new() -> Self {
        Self {
            tick_count: 0,
            last_tick_ns: 0,
            min_tick_ns: i64::MAX,
            max_tick_ns: 0,
            sum_tick_ns: 0,
            overruns: 0,
            max_latency_ns: 0,
        }
    }

    /// Record one tick duration. O(1), no allocation.
    #[inline]
    pub fn record(&mut self, duration_ns: i64, latency_ns: i64) {
        self.tick_count += 1;
        self.last_tick_ns = duration_ns;
        if duration_ns < self.min_tick_ns {
            self.min_tick_ns = duration_ns;
        }
        if duration_ns > self.max_tick_ns {
            self.max_tick_ns = duration_ns;
        }
        self.sum_tick_ns += duration_ns;
        if latency_ns > self.max_latency_ns {
            self.max_latency_ns = latency_ns;
        }
    }

    /// Average tick time [ns] (zero before the first tick).
    #[inline]
    pub fn avg_tick_ns(&self) -> i64 {
        if self.tick_count == 0 {
            0
        } else {
            self.sum_tick_ns / self.tick_count as i64
        }
    }
}

impl Default for TickStats {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Errors ─────────────────────────────────────────────────────────

/// Errors during RT setup.
#[derive(Debug)]
pub enum TickError {
    /// RT system call failed.
    RtSetup(String),
}

impl std::fmt::Display for TickError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RtSetup(msg) => write!(f, "RT setup error: {msg}"),
        }
    }
}

impl std::error::Error for TickError {}

// ─── RT Setup ───────────────────────────────────────────────────────

/// Lock all current and future memory pages.
///
/// No-op when the `rt` feature is not enabled.
#[cfg(feature = "rt")]
fn rt_mlockall() -> Result<(), TickError> {
    use nix::sys::mman::{MlockallFlags, mlockall};
    mlockall(MlockallFlags::MCL_CURRENT | MlockallFlags::MCL_FUTURE)
        .map_err(|e| TickError::RtSetup(format!("mlockall failed: {e}")))?;
    Ok(())
}

#[cfg(not(feature = "rt"))]
fn rt_mlockall() -> Result<(), TickError> {
    Ok(()) // No-op in simulation mode
}

/// Prefault stack pages to prevent page faults once the loop is hot.
fn prefault_stack() {
    let mut buf = [0u8; 256 * 1024];
    // Prevent the compiler from optimizing away the write.
    for byte in buf.iter_mut() {
        unsafe { core::ptr::write_volatile(byte, 0xFF) };
    }
    core::hint::black_box(&buf);
}

/// Pin the current thread to a specific CPU core.
///
/// No-op when the `rt` feature is not enabled.
#[cfg(feature = "rt")]
fn rt_set_affinity(cpu: usize) -> Result<(), TickError> {
    use nix::sched::{CpuSet, sched_setaffinity};
    use nix::unistd::Pid;

    let mut cpuset = CpuSet::new();
    cpuset
        .set(cpu)
        .map_err(|e| TickError::RtSetup(format!("CpuSet::set({cpu}) failed: {e}")))?;
    sched_setaffinity(Pid::from_raw(0), &cpuset)
        .map_err(|e| TickError::RtSetup(format!("sched_setaffinity failed: {e}")))?;
    Ok(())
}

#[cfg(not(feature = "rt"))]
fn rt_set_affinity(_cpu: usize) -> Result<(), TickError> {
    Ok(()) // No-op in simulation mode
}

/// Set SCHED_FIFO with the given RT priority.
///
/// No-op when the `rt` feature is not enabled.
#[cfg(feature = "rt")]
fn rt_set_scheduler(priority: i32) -> Result<(), TickError> {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    let ret = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        return Err(TickError::RtSetup(format!(
            "sched_setscheduler(SCHED_FIFO, {priority}) failed: {err}"
        )));
    }
    Ok(())
}

#[cfg(not(feature = "rt"))]
fn rt_set_scheduler(_priority: i32) -> Result<(), TickError> {
    Ok(()) // No-op in simulation mode
}

/// Perform the full RT setup sequence for the tick thread.
///
/// In simulation mode (no `rt` feature), all RT calls are no-ops.
pub fn rt_setup(cpu_core: usize, rt_priority: i32) -> Result<(), TickError> {
    rt_mlockall()?;
    prefault_stack();
    rt_set_affinity(cpu_core)?;
    rt_set_scheduler(rt_priority)?;
    Ok(())
}

// ─── Driver ─────────────────────────────────────────────────────────

/// Owns the tick thread's loop: paces [`IsrHandle::tick`] at the programmed
/// period until the stop flag is raised.
pub struct TickDriver {
    handle: IsrHandle,
    running: Arc<AtomicBool>,
    stats: TickStats,
}

impl TickDriver {
    pub fn new(handle: IsrHandle) -> Self {
        Self {
            handle,
            running: Arc::new(AtomicBool::new(true)),
            stats: TickStats::new(),
        }
    }

    /// Shared stop flag; clearing it makes [`Self::run`] return.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Programmed period in nanoseconds, floored at one cycle.
    #[inline]
    fn period_ns(&self) -> i64 {
        i64::from(self.handle.period().max(1)) * NS_PER_CYCLE
    }

    /// Enter the tick loop; returns the accumulated statistics when the
    /// stop flag is cleared.
    pub fn run(mut self) -> Result<TickStats, TickError> {
        #[cfg(feature = "rt")]
        {
            self.run_rt_loop()?;
        }
        #[cfg(not(feature = "rt"))]
        {
            self.run_sim_loop();
        }
        Ok(self.stats)
    }

    /// RT tick loop using `clock_nanosleep(TIMER_ABSTIME)`.
    #[cfg(feature = "rt")]
    fn run_rt_loop(&mut self) -> Result<(), TickError> {
        use nix::time::{ClockId, ClockNanosleepFlags, clock_gettime, clock_nanosleep};

        let clock = ClockId::CLOCK_MONOTONIC;
        let mut next_wake =
            clock_gettime(clock).map_err(|e| TickError::RtSetup(format!("clock_gettime: {e}")))?;

        while self.running.load(Ordering::Acquire) {
            if !self.handle.is_running() {
                // Timer stopped: poll coarsely and re-anchor the schedule.
                std::thread::sleep(IDLE_POLL);
                next_wake = clock_gettime(clock)
                    .map_err(|e| TickError::RtSetup(format!("clock_gettime: {e}")))?;
                continue;
            }

            let tick_start = clock_gettime(clock)
                .map_err(|e| TickError::RtSetup(format!("clock_gettime: {e}")))?;
            let latency_ns = timespec_diff_ns(&tick_start, &next_wake).abs();

            self.handle.tick();

            let tick_end = clock_gettime(clock)
                .map_err(|e| TickError::RtSetup(format!("clock_gettime: {e}")))?;
            let duration_ns = timespec_diff_ns(&tick_end, &tick_start);

            // The segment load inside the tick may have reprogrammed the
            // period; pace the next wake from the fresh value.
            let period_ns = self.period_ns();
            self.stats.record(duration_ns, latency_ns);
            if duration_ns > period_ns {
                self.stats.overruns += 1;
            }

            next_wake = timespec_add_ns(tick_start, period_ns);
            let _ = clock_nanosleep(clock, ClockNanosleepFlags::TIMER_ABSTIME, &next_wake);
        }
        Ok(())
    }

    /// Simulation tick loop using `std::thread::sleep`.
    #[cfg(not(feature = "rt"))]
    fn run_sim_loop(&mut self) {
        use std::time::Instant;

        while self.running.load(Ordering::Acquire) {
            if !self.handle.is_running() {
                std::thread::sleep(IDLE_POLL);
                continue;
            }

            let tick_start = Instant::now();
            self.handle.tick();
            let elapsed = tick_start.elapsed();
            let duration_ns = elapsed.as_nanos() as i64;

            let period_ns = self.period_ns();
            self.stats.record(duration_ns, 0);
            if duration_ns > period_ns {
                self.stats.overruns += 1;
                continue;
            }

            let remaining = Duration::from_nanos((period_ns - duration_ns) as u64);
            std::thread::sleep(remaining);
        }
    }
}

// ─── Time Helpers ───────────────────────────────────────────────────

/// Add nanoseconds to a TimeSpec.
#[cfg(feature = "rt")]
fn timespec_add_ns(ts: nix::sys::time::TimeSpec, ns: i64) -> nix::sys::time::TimeSpec {
    use nix::sys::time::TimeSpec;
    let mut secs = ts.tv_sec();
    let mut nanos = ts.tv_nsec() + ns;
    while nanos >= 1_000_000_000 {
        secs += 1;
        nanos -= 1_000_000_000;
    }
    while nanos < 0 {
        secs -= 1;
        nanos += 1_000_000_000;
    }
    TimeSpec::new(secs, nanos)
}

/// Compute the difference (a - b) in nanoseconds.
#[cfg(feature = "rt")]
fn timespec_diff_ns(a: &nix::sys::time::TimeSpec, b: &nix::sys::time::TimeSpec) -> i64 {
    (a.tv_sec() - b.tv_sec()) * 1_000_000_000 + (a.tv_nsec() - b.tv_nsec())
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MachineConfig;
    use crate::engine::MotionEngine;

    #[test]
    fn tick_stats_basic() {
        let mut stats = TickStats::new();
        assert_eq!(stats.tick_count, 0);
        assert_eq!(stats.avg_tick_ns(), 0);

        stats.record(500, 100);
        assert_eq!(stats.tick_count, 1);
        assert_eq!(stats.min_tick_ns, 500);
        assert_eq!(stats.max_tick_ns, 500);
        assert_eq!(stats.max_latency_ns, 100);

        stats.record(700, 50);
        assert_eq!(stats.min_tick_ns, 500);
        assert_eq!(stats.max_tick_ns, 700);
        assert_eq!(stats.max_latency_ns, 100);
        assert_eq!(stats.avg_tick_ns(), 600);
    }

    #[test]
    fn rt_setup_no_rt_feature_is_noop() {
        #[cfg(not(feature = "rt"))]
        {
            assert!(rt_setup(0, 80).is_ok());
        }
    }

    #[test]
    fn driver_exits_on_stop_flag() {
        let (engine, _sim) = MotionEngine::with_sim(MachineConfig::default_xyz()).unwrap();
        let driver = TickDriver::new(engine.isr_handle());
        let stop = driver.stop_flag();
        let thread = std::thread::spawn(move || driver.run());
        std::thread::sleep(Duration::from_millis(5));
        stop.store(false, Ordering::Release);
        let stats = thread.join().unwrap().unwrap();
        // Timer never started, so the loop only idled.
        assert_eq!(stats.tick_count, 0);
    }
}
