// crates/aqua-core/src/token.rs
//
// Water token (WTK) amount type.
//
// One token is one litre of allowance. Amounts are signed integers so that
// carry-over and balances can express debt when a deployment permits it.
// Only the allocation algorithm works in floating point; its result is
// rounded into `Tokens` before it touches the ledger.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, Neg, Sub};

/// A water token amount, in whole litres.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tokens {
    pub litres: i64,
}

impl Tokens {
    /// Create an amount from whole litres.
    pub const fn new(litres: i64) -> Self {
        Self { litres }
    }

    /// Returns zero tokens.
    pub const fn zero() -> Self {
        Self { litres: 0 }
    }

    /// Round a floating-point litre figure to the nearest whole token.
    ///
    /// Non-finite inputs become zero. Values beyond the `i64` range saturate.
    ///
    /// # Example
    /// ```
    /// use aqua_core::token::Tokens;
    /// assert_eq!(Tokens::from_litres_f64(329.45), Tokens::new(329));
    /// assert_eq!(Tokens::from_litres_f64(329.5), Tokens::new(330));
    /// ```
    pub fn from_litres_f64(litres: f64) -> Self {
        if !litres.is_finite() {
            return Self::zero();
        }
        Self {
            litres: litres.round() as i64,
        }
    }

    pub fn is_positive(&self) -> bool {
        self.litres > 0
    }

    pub fn is_negative(&self) -> bool {
        self.litres < 0
    }

    /// Clamp into `[lo, hi]`. If the bounds are inverted, `lo` wins.
    pub fn clamp_to(self, lo: Tokens, hi: Tokens) -> Tokens {
        if self > hi {
            hi.max(lo)
        } else if self < lo {
            lo
        } else {
            self
        }
    }

    pub fn checked_add(self, rhs: Tokens) -> Option<Tokens> {
        self.litres.checked_add(rhs.litres).map(Tokens::new)
    }

    pub fn checked_sub(self, rhs: Tokens) -> Option<Tokens> {
        self.litres.checked_sub(rhs.litres).map(Tokens::new)
    }
}

impl Add for Tokens {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            litres: self.litres.saturating_add(rhs.litres),
        }
    }
}

impl Sub for Tokens {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self {
            litres: self.litres.saturating_sub(rhs.litres),
        }
    }
}

impl Neg for Tokens {
    type Output = Self;

    fn neg(self) -> Self::Output {
        Self {
            litres: self.litres.saturating_neg(),
        }
    }
}

impl Sum for Tokens {
    fn sum<I: Iterator<Item = Tokens>>(iter: I) -> Self {
        iter.fold(Tokens::zero(), |acc, t| acc + t)
    }
}

impl<'a> Sum<&'a Tokens> for Tokens {
    fn sum<I: Iterator<Item = &'a Tokens>>(iter: I) -> Self {
        iter.fold(Tokens::zero(), |acc, t| acc + *t)
    }
}

impl fmt::Display for Tokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} WTK", self.litres)
    }
}
