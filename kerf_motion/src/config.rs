//! TOML configuration loader with validation.
//!
//! Loads `MachineConfig` from `machine.toml` in the config directory.
//! Validates: axis table bounds, pulse timing, homing parameters, parking
//! geometry, and coupled-pair wiring. The engine reads the config through a
//! shared reference at block/segment preparation time, so values are never
//! cached beyond one block.

use std::path::Path;

use kerf_common::axis::{AXIS_LETTERS, AxisMask, MAX_AXES};
use kerf_common::consts::parking;
use serde::Deserialize;

// ─── Error Type ─────────────────────────────────────────────────────

/// Configuration loading/validation error.
#[derive(Debug)]
pub enum ConfigError {
    /// File I/O error.
    Io(String),
    /// TOML parse error.
    Parse(String),
    /// Parameter validation error.
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config I/O error: {e}"),
            Self::Parse(e) => write!(f, "config parse error: {e}"),
            Self::Validation(e) => write!(f, "config validation: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

// ─── Config Model ───────────────────────────────────────────────────

/// Per-axis kinematic limits and identity.
#[derive(Debug, Clone, Deserialize)]
pub struct AxisConfig {
    /// Axis name for reports ("X", "Y", ...).
    pub name: String,
    /// Steps per millimeter of travel.
    pub steps_per_mm: f32,
    /// Maximum rate [mm/min].
    pub max_rate: f32,
    /// Acceleration [mm/s^2].
    pub acceleration: f32,
    /// Usable travel from the home position [mm], stored positive.
    pub max_travel: f32,
    /// Axis is a squared gantry member; homing releases it together with
    /// its coupled partner.
    #[serde(default)]
    pub square: bool,
}

impl AxisConfig {
    /// Acceleration converted to the planner's time base [mm/min^2].
    #[inline]
    pub fn accel_mm_min2(&self) -> f32 {
        self.acceleration * 3600.0
    }
}

/// Step pulse shaping, output polarity and driver idling.
#[derive(Debug, Clone, Deserialize)]
pub struct PulseConfig {
    /// Step pulse width [us].
    #[serde(default = "default_pulse_us")]
    pub pulse_us: u32,
    /// Bit N set = axis N's step output is active-low.
    #[serde(default)]
    pub step_invert_mask: u8,
    /// Bit N set = axis N's direction output is inverted.
    #[serde(default)]
    pub dir_invert_mask: u8,
    /// Keep drivers energized this long after motion ends [ms].
    #[serde(default = "default_idle_lock_ms")]
    pub idle_lock_ms: u64,
    /// Never release the drivers when idle (overrides `idle_lock_ms`).
    #[serde(default)]
    pub idle_hold: bool,
}

fn default_pulse_us() -> u32 {
    4
}

fn default_idle_lock_ms() -> u64 {
    25
}

impl Default for PulseConfig {
    fn default() -> Self {
        Self {
            pulse_us: default_pulse_us(),
            step_invert_mask: 0,
            dir_invert_mask: 0,
            idle_lock_ms: default_idle_lock_ms(),
            idle_hold: false,
        }
    }
}

/// Homing cycle parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct HomingConfig {
    /// Homing available at all.
    #[serde(default)]
    pub enable: bool,
    /// Bit N set = axis N approaches its switch in the negative direction.
    #[serde(default)]
    pub dir_invert_mask: u8,
    /// Slow locate rate [mm/min].
    #[serde(default = "default_homing_feed")]
    pub feed_rate: f32,
    /// Fast search rate [mm/min].
    #[serde(default = "default_homing_seek")]
    pub seek_rate: f32,
    /// Switch settle time between phases [ms].
    #[serde(default = "default_homing_debounce")]
    pub debounce_ms: u64,
    /// Retreat distance after each switch trigger [mm].
    #[serde(default = "default_homing_pulloff")]
    pub pulloff_mm: f32,
    /// Number of slow locate repetitions.
    #[serde(default = "default_locate_cycles")]
    pub locate_cycles: u8,
    /// Axis letters homed together, in execution order (e.g. ["Z", "XY"]).
    #[serde(default)]
    pub cycles: Vec<String>,
}

fn default_homing_feed() -> f32 {
    25.0
}

fn default_homing_seek() -> f32 {
    500.0
}

fn default_homing_debounce() -> u64 {
    250
}

fn default_homing_pulloff() -> f32 {
    1.0
}

fn default_locate_cycles() -> u8 {
    1
}

impl Default for HomingConfig {
    fn default() -> Self {
        Self {
            enable: false,
            dir_invert_mask: 0,
            feed_rate: default_homing_feed(),
            seek_rate: default_homing_seek(),
            debounce_ms: default_homing_debounce(),
            pulloff_mm: default_homing_pulloff(),
            locate_cycles: default_locate_cycles(),
            cycles: Vec::new(),
        }
    }
}

/// Safety-door parking motion.
#[derive(Debug, Clone, Deserialize)]
pub struct ParkingConfig {
    #[serde(default)]
    pub enable: bool,
    /// Axis index performing the parking motion.
    #[serde(default = "default_parking_axis")]
    pub axis: usize,
    /// Parking target in machine coordinates [mm].
    #[serde(default = "default_parking_target")]
    pub target_mm: f32,
    /// Fast parking rate after pull-out [mm/min].
    #[serde(default = "default_parking_rate")]
    pub rate: f32,
    /// Slow pull-out / plunge rate [mm/min].
    #[serde(default = "default_pullout_rate")]
    pub pullout_rate: f32,
    /// Incremental pull-out distance above the hold point [mm].
    #[serde(default = "default_pullout_increment")]
    pub pullout_increment_mm: f32,
    /// Parking can be toggled at runtime by the override control.
    #[serde(default)]
    pub override_control: bool,
}

fn default_parking_axis() -> usize {
    2
}

fn default_parking_target() -> f32 {
    parking::TARGET_MM
}

fn default_parking_rate() -> f32 {
    parking::RATE
}

fn default_pullout_rate() -> f32 {
    parking::PULLOUT_RATE
}

fn default_pullout_increment() -> f32 {
    parking::PULLOUT_INCREMENT_MM
}

impl Default for ParkingConfig {
    fn default() -> Self {
        Self {
            enable: false,
            axis: default_parking_axis(),
            target_mm: default_parking_target(),
            rate: default_parking_rate(),
            pullout_rate: default_pullout_rate(),
            pullout_increment_mm: default_pullout_increment(),
            override_control: false,
        }
    }
}

/// Machine geometry facts the motion engine must honor.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GeometryConfig {
    /// Axis pairs that share one homing lock (squared gantries, coupled
    /// motor pairs). An axis appears in at most one pair.
    #[serde(default)]
    pub coupled_pairs: Vec<[usize; 2]>,
}

/// Complete validated machine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MachineConfig {
    /// Spindle power scales with feed; disables parking retracts.
    #[serde(default)]
    pub laser_mode: bool,
    /// Check queued targets against machine travel.
    #[serde(default)]
    pub soft_limits: bool,
    /// React to limit switch edges during motion.
    #[serde(default)]
    pub hard_limits: bool,
    pub axes: Vec<AxisConfig>,
    #[serde(default)]
    pub pulse: PulseConfig,
    #[serde(default)]
    pub homing: HomingConfig,
    #[serde(default)]
    pub parking: ParkingConfig,
    #[serde(default)]
    pub geometry: GeometryConfig,
}

impl MachineConfig {
    /// Number of configured axes.
    #[inline]
    pub fn axis_count(&self) -> usize {
        self.axes.len()
    }

    /// Bit set = axis homes toward the negative machine direction.
    #[inline]
    pub fn homing_dir_mask(&self) -> AxisMask {
        AxisMask::from_bits_truncate(self.homing.dir_invert_mask)
    }

    /// Axis mask for homing cycle `n`, parsed from the config letters.
    pub fn homing_cycle_mask(&self, n: usize) -> Option<AxisMask> {
        self.homing
            .cycles
            .get(n)
            .map(|letters| parse_axis_letters(letters, self.axis_count()).unwrap_or(AxisMask::empty()))
    }

    /// The coupled partner of `axis`, if the geometry declares one.
    pub fn coupled_partner(&self, axis: usize) -> Option<usize> {
        self.geometry.coupled_pairs.iter().find_map(|&[a, b]| {
            if a == axis {
                Some(b)
            } else if b == axis {
                Some(a)
            } else {
                None
            }
        })
    }

    /// Three-axis default used by tests and the demo binary.
    pub fn default_xyz() -> Self {
        let axis = |name: &str| AxisConfig {
            name: name.to_string(),
            steps_per_mm: 250.0,
            max_rate: 1000.0,
            acceleration: 10.0,
            max_travel: 200.0,
            square: false,
        };
        Self {
            laser_mode: false,
            soft_limits: false,
            hard_limits: false,
            axes: vec![axis("X"), axis("Y"), axis("Z")],
            pulse: PulseConfig::default(),
            homing: HomingConfig {
                enable: true,
                cycles: vec!["Z".to_string(), "XY".to_string()],
                ..HomingConfig::default()
            },
            parking: ParkingConfig::default(),
            geometry: GeometryConfig::default(),
        }
    }

    /// Run all validation rules.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_axes(&self.axes)?;
        validate_pulse(&self.pulse, self.axis_count())?;
        if self.homing.enable {
            validate_homing(&self.homing, self.axis_count())?;
        }
        if self.parking.enable {
            validate_parking(self)?;
        }
        validate_geometry(&self.geometry, self.axis_count())?;
        validate_coupled_homing(self)?;
        Ok(())
    }
}

// ─── Loading Functions ──────────────────────────────────────────────

/// Load and validate the machine configuration from `<dir>/machine.toml`.
pub fn load_config(config_dir: &Path) -> Result<MachineConfig, ConfigError> {
    let path = config_dir.join("machine.toml");
    let text = std::fs::read_to_string(&path)
        .map_err(|e| ConfigError::Io(format!("failed to read {}: {e}", path.display())))?;
    load_config_from_str(&text)
}

/// Load config from a TOML string (for testing).
pub fn load_config_from_str(text: &str) -> Result<MachineConfig, ConfigError> {
    let config: MachineConfig =
        toml::from_str(text).map_err(|e| ConfigError::Parse(format!("machine config: {e}")))?;
    config.validate()?;
    Ok(config)
}

/// Parse axis letters ("XY") into a mask, rejecting unknown letters and
/// axes beyond the configured count.
pub fn parse_axis_letters(letters: &str, axis_count: usize) -> Result<AxisMask, String> {
    let mut mask = AxisMask::empty();
    for ch in letters.chars() {
        let upper = ch.to_ascii_uppercase();
        let idx = AXIS_LETTERS
            .iter()
            .position(|&l| l == upper)
            .ok_or_else(|| format!("unknown axis letter '{ch}'"))?;
        if idx >= axis_count {
            return Err(format!("axis '{upper}' beyond configured count {axis_count}"));
        }
        mask.set_axis(idx, true);
    }
    Ok(mask)
}

// ─── Validation Rules ───────────────────────────────────────────────

fn validate_axes(axes: &[AxisConfig]) -> Result<(), ConfigError> {
    if axes.is_empty() {
        return Err(ConfigError::Validation("at least one axis required".into()));
    }
    if axes.len() > MAX_AXES {
        return Err(ConfigError::Validation(format!(
            "{} axes configured, at most {MAX_AXES} supported",
            axes.len()
        )));
    }
    for (idx, ax) in axes.iter().enumerate() {
        if ax.name.is_empty() {
            return Err(ConfigError::Validation(format!("axis {idx} has no name")));
        }
        if ax.steps_per_mm <= 0.0 {
            return Err(ConfigError::Validation(format!(
                "axis {}: steps_per_mm must be positive",
                ax.name
            )));
        }
        if ax.max_rate <= 0.0 {
            return Err(ConfigError::Validation(format!(
                "axis {}: max_rate must be positive",
                ax.name
            )));
        }
        if ax.acceleration <= 0.0 {
            return Err(ConfigError::Validation(format!(
                "axis {}: acceleration must be positive",
                ax.name
            )));
        }
        if ax.max_travel <= 0.0 {
            return Err(ConfigError::Validation(format!(
                "axis {}: max_travel must be positive",
                ax.name
            )));
        }
    }
    Ok(())
}

fn validate_pulse(pulse: &PulseConfig, axis_count: usize) -> Result<(), ConfigError> {
    if pulse.pulse_us == 0 || pulse.pulse_us > 100 {
        return Err(ConfigError::Validation(format!(
            "pulse_us {} out of range [1, 100]",
            pulse.pulse_us
        )));
    }
    let axis_bits = (1u16 << axis_count) - 1;
    if u16::from(pulse.step_invert_mask) & !axis_bits != 0 {
        return Err(ConfigError::Validation(format!(
            "step_invert_mask {:#04x} sets bits beyond the configured {axis_count} axes",
            pulse.step_invert_mask
        )));
    }
    if u16::from(pulse.dir_invert_mask) & !axis_bits != 0 {
        return Err(ConfigError::Validation(format!(
            "dir_invert_mask {:#04x} sets bits beyond the configured {axis_count} axes",
            pulse.dir_invert_mask
        )));
    }
    Ok(())
}

fn validate_homing(homing: &HomingConfig, axis_count: usize) -> Result<(), ConfigError> {
    if homing.feed_rate <= 0.0 || homing.seek_rate <= 0.0 {
        return Err(ConfigError::Validation(
            "homing feed_rate and seek_rate must be positive".into(),
        ));
    }
    if homing.pulloff_mm <= 0.0 {
        return Err(ConfigError::Validation("homing pulloff_mm must be positive".into()));
    }
    if homing.cycles.is_empty() {
        return Err(ConfigError::Validation(
            "homing enabled but no cycles configured".into(),
        ));
    }
    let mut seen = AxisMask::empty();
    for (n, letters) in homing.cycles.iter().enumerate() {
        let mask = parse_axis_letters(letters, axis_count)
            .map_err(|e| ConfigError::Validation(format!("homing cycle {n}: {e}")))?;
        if mask.is_empty() {
            return Err(ConfigError::Validation(format!("homing cycle {n} is empty")));
        }
        if seen.intersects(mask) {
            return Err(ConfigError::Validation(format!(
                "homing cycle {n} repeats an axis from an earlier cycle"
            )));
        }
        seen |= mask;
    }
    Ok(())
}

fn validate_parking(config: &MachineConfig) -> Result<(), ConfigError> {
    let parking = &config.parking;
    if parking.axis >= config.axis_count() {
        return Err(ConfigError::Validation(format!(
            "parking axis {} beyond configured count {}",
            parking.axis,
            config.axis_count()
        )));
    }
    if parking.rate <= 0.0 || parking.pullout_rate <= 0.0 {
        return Err(ConfigError::Validation(
            "parking rates must be positive".into(),
        ));
    }
    if parking.pullout_increment_mm < 0.0 {
        return Err(ConfigError::Validation(
            "parking pullout_increment_mm must not be negative".into(),
        ));
    }
    if !config.homing.enable {
        return Err(ConfigError::Validation(
            "parking requires homing to be enabled".into(),
        ));
    }
    Ok(())
}

fn validate_geometry(geometry: &GeometryConfig, axis_count: usize) -> Result<(), ConfigError> {
    let mut seen = AxisMask::empty();
    for &[a, b] in &geometry.coupled_pairs {
        if a >= axis_count || b >= axis_count {
            return Err(ConfigError::Validation(format!(
                "coupled pair [{a}, {b}] references axes beyond the configured {axis_count}"
            )));
        }
        if a == b {
            return Err(ConfigError::Validation(format!(
                "coupled pair [{a}, {b}] must name two distinct axes"
            )));
        }
        let pair = AxisMask::from_index(a) | AxisMask::from_index(b);
        if seen.intersects(pair) {
            return Err(ConfigError::Validation(format!(
                "axis {} appears in more than one coupled pair",
                if seen.has_axis(a) { a } else { b }
            )));
        }
        seen |= pair;
    }
    Ok(())
}

/// Squared axes need a coupled partner, and a coupled pair must home in
/// the same cycle so the shared lock can be released switch-by-switch.
fn validate_coupled_homing(config: &MachineConfig) -> Result<(), ConfigError> {
    for (idx, ax) in config.axes.iter().enumerate() {
        if ax.square && config.coupled_partner(idx).is_none() {
            return Err(ConfigError::Validation(format!(
                "axis {} is squared but has no coupled pair in [geometry]",
                ax.name
            )));
        }
    }
    if !config.homing.enable {
        return Ok(());
    }
    for &[a, b] in &config.geometry.coupled_pairs {
        for n in 0..config.homing.cycles.len() {
            let mask = config.homing_cycle_mask(n).unwrap_or(AxisMask::empty());
            if mask.has_axis(a) != mask.has_axis(b) {
                return Err(ConfigError::Validation(format!(
                    "coupled pair [{a}, {b}] is split across homing cycles; both axes \
                     must appear in cycle {n} or neither"
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
[[axes]]
name = "X"
steps_per_mm = 250.0
max_rate = 500.0
acceleration = 10.0
max_travel = 200.0

[[axes]]
name = "Y"
steps_per_mm = 250.0
max_rate = 500.0
acceleration = 10.0
max_travel = 200.0
"#
    }

    #[test]
    fn load_valid_config() {
        let config = load_config_from_str(minimal_toml()).unwrap();
        assert_eq!(config.axis_count(), 2);
        assert_eq!(config.pulse.pulse_us, 4);
        assert!(!config.homing.enable);
    }

    #[test]
    fn default_xyz_validates() {
        let config = MachineConfig::default_xyz();
        config.validate().unwrap();
        assert_eq!(config.axis_count(), 3);
        assert_eq!(config.homing_cycle_mask(0), Some(AxisMask::Z));
        assert_eq!(config.homing_cycle_mask(1), Some(AxisMask::X | AxisMask::Y));
        assert_eq!(config.homing_cycle_mask(2), None);
    }

    #[test]
    fn reject_zero_steps_per_mm() {
        let toml = r#"
[[axes]]
name = "X"
steps_per_mm = 0.0
max_rate = 500.0
acceleration = 10.0
max_travel = 200.0
"#;
        let err = load_config_from_str(toml).unwrap_err();
        assert!(err.to_string().contains("steps_per_mm"), "got: {err}");
    }

    #[test]
    fn reject_pulse_width_out_of_range() {
        let toml = format!("{}\n[pulse]\npulse_us = 0\n", minimal_toml());
        let err = load_config_from_str(&toml).unwrap_err();
        assert!(err.to_string().contains("pulse_us"), "got: {err}");
    }

    #[test]
    fn reject_invert_mask_beyond_axes() {
        let toml = format!("{}\n[pulse]\ndir_invert_mask = 0x04\n", minimal_toml());
        let err = load_config_from_str(&toml).unwrap_err();
        assert!(err.to_string().contains("dir_invert_mask"), "got: {err}");
    }

    #[test]
    fn reject_homing_without_cycles() {
        let toml = format!("{}\n[homing]\nenable = true\n", minimal_toml());
        let err = load_config_from_str(&toml).unwrap_err();
        assert!(err.to_string().contains("no cycles"), "got: {err}");
    }

    #[test]
    fn reject_homing_cycle_axis_repeat() {
        let toml = format!(
            "{}\n[homing]\nenable = true\ncycles = [\"X\", \"XY\"]\n",
            minimal_toml()
        );
        let err = load_config_from_str(&toml).unwrap_err();
        assert!(err.to_string().contains("repeats"), "got: {err}");
    }

    #[test]
    fn reject_homing_cycle_unknown_letter() {
        let toml = format!(
            "{}\n[homing]\nenable = true\ncycles = [\"Q\"]\n",
            minimal_toml()
        );
        let err = load_config_from_str(&toml).unwrap_err();
        assert!(err.to_string().contains("unknown axis letter"), "got: {err}");
    }

    #[test]
    fn reject_parking_without_homing() {
        let toml = format!("{}\n[parking]\nenable = true\naxis = 1\n", minimal_toml());
        let err = load_config_from_str(&toml).unwrap_err();
        assert!(err.to_string().contains("requires homing"), "got: {err}");
    }

    #[test]
    fn reject_parking_axis_out_of_range() {
        let toml = format!(
            "{}\n[homing]\nenable = true\ncycles = [\"X\"]\n\n[parking]\nenable = true\naxis = 9\n",
            minimal_toml()
        );
        let err = load_config_from_str(&toml).unwrap_err();
        assert!(err.to_string().contains("parking axis"), "got: {err}");
    }

    #[test]
    fn reject_overlapping_coupled_pairs() {
        let toml = format!(
            "{}\n[geometry]\ncoupled_pairs = [[0, 1], [1, 0]]\n",
            minimal_toml()
        );
        let err = load_config_from_str(&toml).unwrap_err();
        assert!(err.to_string().contains("more than one coupled pair"), "got: {err}");
    }

    #[test]
    fn reject_squared_axis_without_pair() {
        let toml = r#"
[[axes]]
name = "X"
steps_per_mm = 250.0
max_rate = 500.0
acceleration = 10.0
max_travel = 200.0

[[axes]]
name = "Y"
steps_per_mm = 250.0
max_rate = 500.0
acceleration = 10.0
max_travel = 200.0
square = true
"#;
        let err = load_config_from_str(toml).unwrap_err();
        assert!(err.to_string().contains("no coupled pair"), "got: {err}");
    }

    #[test]
    fn reject_coupled_pair_split_across_homing_cycles() {
        let toml = format!(
            "{}\n[homing]\nenable = true\ncycles = [\"X\", \"Y\"]\n\n\
             [geometry]\ncoupled_pairs = [[0, 1]]\n",
            minimal_toml()
        );
        let err = load_config_from_str(&toml).unwrap_err();
        assert!(err.to_string().contains("split across"), "got: {err}");
    }

    #[test]
    fn coupled_partner_lookup() {
        let toml = format!("{}\n[geometry]\ncoupled_pairs = [[0, 1]]\n", minimal_toml());
        let config = load_config_from_str(&toml).unwrap();
        assert_eq!(config.coupled_partner(0), Some(1));
        assert_eq!(config.coupled_partner(1), Some(0));
        assert_eq!(config.coupled_partner(2), None);
    }

    #[test]
    fn reject_malformed_toml() {
        let err = load_config_from_str("this is not valid toml @@@@").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("machine.toml"), minimal_toml()).unwrap();
        let config = load_config(dir.path()).unwrap();
        assert_eq!(config.axis_count(), 2);

        let missing = tempfile::tempdir().unwrap();
        let err = load_config(missing.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn accel_conversion_to_planner_base() {
        let config = MachineConfig::default_xyz();
        let a = &config.axes[0];
        assert!((a.accel_mm_min2() - 36000.0).abs() < 1e-3);
    }
}
