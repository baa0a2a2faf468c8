//! Reversible column transforms applied before bit packing.
//!
//! A transform is an N-th order finite difference followed by a zig-zag
//! mapping of signed to unsigned integers:
//!
//! ```text
//! x = [100, 110, 120, 131]
//! order 1  -> [100, 10, 10, 11]
//! order 2  -> [100, -90, 0, 1]
//! zig-zag  -> [200, 179, 0, 2]
//! ```
//!
//! Slowly varying series end up as small non-negative magnitudes, which is
//! what the word packer compresses well. All arithmetic wraps, so
//! `revert(apply(x)) == x` holds for every `i64` input.

use crate::error::{Result, StrataError};

/// Highest supported difference order.
pub const MAX_ORDER: u8 = 3;

/// Maps a signed integer onto an unsigned one, interleaving negatives.
#[inline]
pub fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

/// Inverse of [`zigzag`].
#[inline]
pub fn unzigzag(u: u64) -> i64 {
    ((u >> 1) as i64) ^ -((u & 1) as i64)
}

/// Difference-plus-zig-zag transform of a given order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Transform {
    order: u8,
}

impl Default for Transform {
    fn default() -> Self {
        Self::DELTA
    }
}

impl Transform {
    /// Zig-zag only, no differencing.
    pub const RAW: Self = Self { order: 0 };
    /// First-order difference, the default for value columns.
    pub const DELTA: Self = Self { order: 1 };
    /// Second-order difference; constant sampling intervals become zeros.
    pub const TIME: Self = Self { order: 2 };

    /// Creates a transform of the given difference order.
    ///
    /// # Errors
    ///
    /// Returns `StrataError::Config` if `order` exceeds [`MAX_ORDER`].
    pub fn with_order(order: u8) -> Result<Self> {
        if order > MAX_ORDER {
            return Err(StrataError::Config(format!(
                "difference order {} exceeds maximum {}",
                order, MAX_ORDER
            )));
        }
        Ok(Self { order })
    }

    /// Looks up a transform by its schema name.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "raw" | "none" => Ok(Self::RAW),
            "delta" | "delta1" => Ok(Self::DELTA),
            "delta2" => Ok(Self { order: 2 }),
            "delta3" => Ok(Self { order: 3 }),
            other => Err(StrataError::Config(format!("unknown transform '{}'", other))),
        }
    }

    /// Returns the schema name of this transform.
    pub fn name(&self) -> &'static str {
        match self.order {
            0 => "raw",
            1 => "delta",
            2 => "delta2",
            _ => "delta3",
        }
    }

    /// Returns the difference order.
    pub fn order(&self) -> u8 {
        self.order
    }

    /// Transforms `values` into packer input.
    pub fn apply(&self, values: &[i64]) -> Vec<u64> {
        let mut work = values.to_vec();
        for _ in 0..self.order {
            for i in (1..work.len()).rev() {
                work[i] = work[i].wrapping_sub(work[i - 1]);
            }
        }
        work.into_iter().map(zigzag).collect()
    }

    /// Reverts packer output back to the original values.
    pub fn revert(&self, transformed: &[u64]) -> Vec<i64> {
        let mut out = Vec::with_capacity(transformed.len());
        self.revert_into(transformed, &mut out);
        out
    }

    /// Reverts `transformed` and appends the values to `out`.
    pub fn revert_into(&self, transformed: &[u64], out: &mut Vec<i64>) {
        let base = out.len();
        out.extend(transformed.iter().map(|&u| unzigzag(u)));
        let work = &mut out[base..];
        for _ in 0..self.order {
            for i in 1..work.len() {
                work[i] = work[i].wrapping_add(work[i - 1]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zigzag_small_magnitudes() {
        assert_eq!(zigzag(0), 0);
        assert_eq!(zigzag(-1), 1);
        assert_eq!(zigzag(1), 2);
        assert_eq!(zigzag(-2), 3);
        assert_eq!(zigzag(i64::MAX), u64::MAX - 1);
        assert_eq!(zigzag(i64::MIN), u64::MAX);
        for v in [-5_i64, 0, 7, i64::MIN, i64::MAX] {
            assert_eq!(unzigzag(zigzag(v)), v);
        }
    }

    #[test]
    fn test_time_transform_constant_interval() {
        let times: Vec<i64> = (0..10).map(|i| 1_700_000_000 + i * 10).collect();
        let transformed = Transform::TIME.apply(&times);

        // Only the first two entries are non-zero.
        assert_eq!(transformed[0], zigzag(1_700_000_000));
        assert!(transformed[2..].iter().all(|&v| v == 0));
        assert_eq!(Transform::TIME.revert(&transformed), times);
    }

    #[test]
    fn test_delta_example() {
        let values = vec![100_i64, 110, 120, 131];
        assert_eq!(Transform::DELTA.apply(&values), vec![200, 20, 20, 22]);
        assert_eq!(Transform::TIME.apply(&values), vec![200, 179, 0, 2]);
    }

    #[test]
    fn test_roundtrip_extremes_all_orders() {
        let values = vec![i64::MIN, i64::MAX, 0, -1, 1, i64::MAX, i64::MIN, 42];
        for order in 0..=MAX_ORDER {
            let t = Transform::with_order(order).unwrap();
            assert_eq!(t.revert(&t.apply(&values)), values, "order {}", order);
        }
    }

    #[test]
    fn test_revert_into_appends() {
        let t = Transform::DELTA;
        let mut out = vec![-7_i64];
        t.revert_into(&t.apply(&[5, 6, 8]), &mut out);
        assert_eq!(out, vec![-7, 5, 6, 8]);
    }

    #[test]
    fn test_from_name() {
        assert_eq!(Transform::from_name("raw").unwrap().order(), 0);
        assert_eq!(Transform::from_name("delta").unwrap(), Transform::DELTA);
        assert_eq!(Transform::from_name("delta3").unwrap().order(), 3);
        assert!(Transform::from_name("gorilla").is_err());
        assert!(Transform::with_order(4).is_err());
        assert_eq!(Transform::from_name(Transform::TIME.name()).unwrap(), Transform::TIME);
    }

    #[test]
    fn test_empty_input() {
        assert!(Transform::TIME.apply(&[]).is_empty());
        assert!(Transform::TIME.revert(&[]).is_empty());
    }
}
