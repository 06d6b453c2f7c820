//! Axis identities and bitmasks.
//!
//! Axes are addressed by index (`0..axis_count`) everywhere; bitmasks carry
//! per-axis booleans (direction, step, limit, homing lock) in one byte with
//! bit N belonging to axis N.

use bitflags::bitflags;
use static_assertions::const_assert;

/// Maximum number of axes the engine can be configured for.
pub const MAX_AXES: usize = 6;

// Masks are a single byte; every axis needs a bit.
const_assert!(MAX_AXES <= 8);

/// Axis letters in index order, used for reports and logs.
pub const AXIS_LETTERS: [char; MAX_AXES] = ['X', 'Y', 'Z', 'A', 'B', 'C'];

bitflags! {
    /// Per-axis bitmask. Bit N corresponds to axis index N.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AxisMask: u8 {
        const X = 1 << 0;
        const Y = 1 << 1;
        const Z = 1 << 2;
        const A = 1 << 3;
        const B = 1 << 4;
        const C = 1 << 5;
    }
}

impl AxisMask {
    /// Mask with only the bit for `axis` set.
    #[inline]
    pub const fn from_index(axis: usize) -> Self {
        Self::from_bits_truncate(1 << axis)
    }

    /// Mask covering axes `0..axis_count`.
    #[inline]
    pub const fn all_axes(axis_count: usize) -> Self {
        Self::from_bits_truncate((1u8 << axis_count).wrapping_sub(1))
    }

    /// Whether the bit for `axis` is set.
    #[inline]
    pub const fn has_axis(&self, axis: usize) -> bool {
        self.bits() & (1 << axis) != 0
    }

    /// Set or clear the bit for `axis`.
    #[inline]
    pub fn set_axis(&mut self, axis: usize, on: bool) {
        if on {
            *self = Self::from_bits_truncate(self.bits() | (1 << axis));
        } else {
            *self = Self::from_bits_truncate(self.bits() & !(1 << axis));
        }
    }

    /// Number of axes set in the mask.
    #[inline]
    pub const fn axis_count(&self) -> u32 {
        self.bits().count_ones()
    }
}

impl Default for AxisMask {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_index_matches_named_flags() {
        assert_eq!(AxisMask::from_index(0), AxisMask::X);
        assert_eq!(AxisMask::from_index(1), AxisMask::Y);
        assert_eq!(AxisMask::from_index(2), AxisMask::Z);
        assert_eq!(AxisMask::from_index(5), AxisMask::C);
    }

    #[test]
    fn all_axes_covers_exactly_the_configured_count() {
        assert_eq!(AxisMask::all_axes(3), AxisMask::X | AxisMask::Y | AxisMask::Z);
        assert_eq!(AxisMask::all_axes(1), AxisMask::X);
        assert!(!AxisMask::all_axes(3).has_axis(3));
    }

    #[test]
    fn set_and_test_axis_bits() {
        let mut m = AxisMask::empty();
        m.set_axis(2, true);
        assert!(m.has_axis(2));
        assert_eq!(m.axis_count(), 1);

        m.set_axis(0, true);
        m.set_axis(2, false);
        assert!(m.has_axis(0));
        assert!(!m.has_axis(2));
    }
}
