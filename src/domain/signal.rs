//! Per-rule trading signals.

use std::fmt;

use crate::domain::position::Direction;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Signal {
    Buy,
    Sell,
    Hold,
    /// Signed conviction in [-1, 1].
    Strength(f64),
}

impl Signal {
    /// Build a strength signal, clamping into [-1, 1]. NaN becomes zero.
    pub fn strength(value: f64) -> Self {
        if value.is_nan() {
            Signal::Strength(0.0)
        } else {
            Signal::Strength(value.clamp(-1.0, 1.0))
        }
    }

    /// Numeric value used by weighted combination: BUY = 1, SELL = -1, HOLD = 0.
    pub fn value(self) -> f64 {
        match self {
            Signal::Buy => 1.0,
            Signal::Sell => -1.0,
            Signal::Hold => 0.0,
            Signal::Strength(s) if s.is_nan() => 0.0,
            Signal::Strength(s) => s.clamp(-1.0, 1.0),
        }
    }

    /// Direction this signal votes for, or `None` for HOLD / zero strength.
    pub fn direction(self) -> Option<Direction> {
        let v = self.value();
        if v > 0.0 {
            Some(Direction::Long)
        } else if v < 0.0 {
            Some(Direction::Short)
        } else {
            None
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Buy => write!(f, "BUY"),
            Signal::Sell => write!(f, "SELL"),
            Signal::Hold => write!(f, "HOLD"),
            Signal::Strength(s) => write!(f, "STRENGTH({:.3})", s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discrete_values() {
        assert_eq!(Signal::Buy.value(), 1.0);
        assert_eq!(Signal::Sell.value(), -1.0);
        assert_eq!(Signal::Hold.value(), 0.0);
    }

    #[test]
    fn strength_is_clamped() {
        assert_eq!(Signal::strength(3.0), Signal::Strength(1.0));
        assert_eq!(Signal::strength(-2.0), Signal::Strength(-1.0));
        assert_eq!(Signal::strength(f64::NAN), Signal::Strength(0.0));
    }

    #[test]
    fn strength_direction() {
        assert_eq!(Signal::Strength(0.4).direction(), Some(Direction::Long));
        assert_eq!(Signal::Strength(-0.1).direction(), Some(Direction::Short));
        assert_eq!(Signal::Strength(0.0).direction(), None);
    }

    #[test]
    fn display() {
        assert_eq!(Signal::Buy.to_string(), "BUY");
        assert_eq!(Signal::Strength(0.5).to_string(), "STRENGTH(0.500)");
    }
}
