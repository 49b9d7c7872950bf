use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of tinybars in one hbar
pub const TINYBARS_PER_HBAR: i64 = 100_000_000;

/// An amount of the ledger's native currency, held in tinybars
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hbar(i64);

impl Hbar {
    pub const ZERO: Hbar = Hbar(0);

    /// Whole hbars, saturating at the bounds of the tinybar range
    pub const fn new(hbars: i64) -> Self {
        Hbar(hbars.saturating_mul(TINYBARS_PER_HBAR))
    }

    /// Whole hbars, or `None` if the amount does not fit in tinybars
    pub fn checked_from_hbars(hbars: i64) -> Option<Hbar> {
        hbars.checked_mul(TINYBARS_PER_HBAR).map(Hbar)
    }

    pub const fn from_tinybars(tinybars: i64) -> Self {
        Hbar(tinybars)
    }

    pub const fn to_tinybars(self) -> i64 {
        self.0
    }

    pub fn checked_add(self, other: Hbar) -> Option<Hbar> {
        self.0.checked_add(other.0).map(Hbar)
    }

    pub fn checked_sub(self, other: Hbar) -> Option<Hbar> {
        self.0.checked_sub(other.0).map(Hbar)
    }
}

impl fmt::Display for Hbar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / TINYBARS_PER_HBAR;
        let frac = (self.0 % TINYBARS_PER_HBAR).abs();
        if frac == 0 {
            write!(f, "{} ℏ", whole)
        } else {
            let sign = if self.0 < 0 && whole == 0 { "-" } else { "" };
            let digits = format!("{:08}", frac);
            write!(f, "{}{}.{} ℏ", sign, whole, digits.trim_end_matches('0'))
        }
    }
}
