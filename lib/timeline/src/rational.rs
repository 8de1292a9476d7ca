//! Exact fractional time bases and timestamp rescaling.

use crate::{Error, Result};
use std::fmt;

/// Sentinel returned by [`convert`] when either time base is unusable.
pub const NOPTS_VALUE: i64 = i64::MIN;

/// A time base expressed as `num / den` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// Both components must be strictly positive.
    pub fn is_valid(&self) -> bool {
        self.num > 0 && self.den > 0
    }

    pub fn validate(self) -> Result<Self> {
        if self.is_valid() {
            Ok(self)
        } else {
            Err(Error::InvalidTimeBase(self))
        }
    }

    pub fn as_f64(&self) -> f64 {
        if self.den == 0 {
            return 0.0;
        }
        f64::from(self.num) / f64::from(self.den)
    }

    pub fn invert(&self) -> Self {
        Self::new(self.den, self.num)
    }
}

impl Default for Rational {
    fn default() -> Self {
        Self::new(0, 1)
    }
}

impl From<(i32, i32)> for Rational {
    fn from((num, den): (i32, i32)) -> Self {
        Self::new(num, den)
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Rescale `ts` from the `from` time base into the `to` time base.
///
/// Computes `ts * from.num * to.den / (from.den * to.num)` in 128-bit arithmetic and rounds
/// half away from zero. Returns [`NOPTS_VALUE`] when either time base is invalid.
pub fn convert(ts: i64, from: Rational, to: Rational) -> i64 {
    if !from.is_valid() || !to.is_valid() {
        return NOPTS_VALUE;
    }

    let n = i128::from(ts) * i128::from(from.num) * i128::from(to.den);
    let d = i128::from(from.den) * i128::from(to.num);

    let rounded = if n >= 0 {
        (2 * n + d) / (2 * d)
    } else {
        -((-2 * n + d) / (2 * d))
    };

    i64::try_from(rounded).unwrap_or(if rounded < 0 { i64::MIN + 1 } else { i64::MAX })
}

/// Like [`convert`] but reports invalid time bases as an error.
pub fn try_convert(ts: i64, from: Rational, to: Rational) -> Result<i64> {
    from.validate()?;
    to.validate()?;
    Ok(convert(ts, from, to))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_valid() {
        assert!(Rational::new(1, 30000).is_valid());
        assert!(!Rational::new(0, 30000).is_valid());
        assert!(!Rational::new(1, 0).is_valid());
        assert!(!Rational::new(-1, 25).is_valid());
        assert!(Rational::new(-1, 25).validate().is_err());
    }

    #[test]
    fn test_convert_exact() {
        let ntsc = Rational::new(1, 30000);
        let mpeg = Rational::new(1, 90000);
        assert_eq!(convert(1001, ntsc, mpeg), 3003);
        assert_eq!(convert(3003, mpeg, ntsc), 1001);
        assert_eq!(convert(0, ntsc, mpeg), 0);
    }

    #[test]
    fn test_convert_rounds_half_away_from_zero() {
        let half = Rational::new(1, 2);
        let unit = Rational::new(1, 1);
        assert_eq!(convert(1, half, unit), 1);
        assert_eq!(convert(-1, half, unit), -1);
        assert_eq!(convert(3, half, unit), 2);

        // 1001 ticks of 1/30000 are 1601.6 ticks of 1/48000
        assert_eq!(convert(1001, Rational::new(1, 30000), Rational::new(1, 48000)), 1602);
    }

    #[test]
    fn test_convert_invalid_time_base() {
        assert_eq!(convert(10, Rational::new(0, 1), Rational::new(1, 25)), NOPTS_VALUE);
        assert!(try_convert(10, Rational::new(1, 25), Rational::new(1, -25)).is_err());
        assert_eq!(try_convert(10, Rational::new(1, 25), Rational::new(1, 50)).unwrap(), 20);
    }

    #[test]
    fn test_convert_round_trip_within_one_unit() {
        let bases = [
            Rational::new(1, 30000),
            Rational::new(1, 48000),
            Rational::new(1, 44100),
            Rational::new(1001, 30000),
            Rational::new(1, 90000),
            Rational::new(1, 25),
            Rational::new(1, 1000),
        ];

        for a in bases {
            for b in bases {
                for v in [0_i64, 1, 7, 1001, 12345, 987_654_321] {
                    let back = convert(convert(v, a, b), b, a);
                    let coarse = convert(1, b, a).max(1);
                    assert!(
                        (back - v).abs() <= coarse,
                        "{v} via {a} -> {b} came back as {back}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(Rational::new(30000, 1001).to_string(), "30000/1001");
        assert!((Rational::new(1, 4).as_f64() - 0.25).abs() < f64::EPSILON);
    }
}
