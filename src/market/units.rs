//! Fixed-point quantities used by the ledger and the marketplace.
//!
//! Weights and CO₂ are stored as whole grams (0.001 kg) and money as whole
//! cents, so every sum in the database is exact integer arithmetic. Both
//! types serialize as decimal strings (`"2.500"`, `"12.50"`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Parse a non-negative decimal string into an integer scaled by `10^scale`.
///
/// Extra fractional digits are rounded half-up, so `"2.5049"` at scale 2 is
/// `250` and `"2.505"` is `251`. Values above `max` are rejected.
fn parse_scaled(raw: &str, scale: u32, max: i64) -> Result<i64, String> {
    let s = raw.trim();
    if s.is_empty() {
        return Err("empty quantity".to_string());
    }
    if s.starts_with('-') {
        return Err(format!("negative quantity: {}", s));
    }
    let s = s.strip_prefix('+').unwrap_or(s);
    let (int_part, frac_part) = match s.split_once('.') {
        Some((i, f)) => (i, f),
        None => (s, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(format!("invalid quantity: {}", raw));
    }
    if !int_part.chars().all(|c| c.is_ascii_digit())
        || !frac_part.chars().all(|c| c.is_ascii_digit())
    {
        return Err(format!("invalid quantity: {}", raw));
    }

    let factor = 10i64.pow(scale);
    let whole: i64 = if int_part.is_empty() {
        0
    } else {
        int_part
            .parse()
            .map_err(|_| format!("quantity out of range: {}", raw))?
    };

    let digits: Vec<i64> = frac_part
        .chars()
        .map(|c| i64::from(c as u8 - b'0'))
        .collect();
    let mut frac = 0i64;
    for i in 0..scale as usize {
        frac = frac * 10 + digits.get(i).copied().unwrap_or(0);
    }
    if digits.get(scale as usize).copied().unwrap_or(0) >= 5 {
        frac += 1;
    }

    whole
        .checked_mul(factor)
        .and_then(|w| w.checked_add(frac))
        .filter(|v| *v <= max)
        .ok_or_else(|| format!("quantity out of range: {}", raw))
}

fn format_scaled(value: i64, scale: u32, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let factor = 10i64.pow(scale);
    let sign = if value < 0 { "-" } else { "" };
    let abs = value.unsigned_abs();
    write!(
        f,
        "{}{}.{:0width$}",
        sign,
        abs / factor as u64,
        abs % factor as u64,
        width = scale as usize
    )
}

/// A weight (or CO₂ mass) in grams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Mass(i64);

impl Mass {
    pub const ZERO: Mass = Mass(0);
    /// Largest weight a client may submit: 99 999.999 kg.
    pub const MAX: Mass = Mass(99_999_999);

    pub const fn from_grams(grams: i64) -> Self {
        Self(grams)
    }

    pub const fn from_kg(kg: i64) -> Self {
        Self(kg * 1000)
    }

    pub const fn grams(self) -> i64 {
        self.0
    }

    /// Whole kilograms, rounded down.
    pub const fn whole_kg(self) -> i64 {
        self.0.div_euclid(1000)
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    /// Positive and no heavier than [`Mass::MAX`].
    pub fn is_valid_quantity(self) -> bool {
        self.is_positive() && self <= Self::MAX
    }

    /// Round to the nearest 10 g (0.01 kg), half-up.
    pub fn round_to_centikg(self) -> Self {
        Self((self.0 + 5).div_euclid(10) * 10)
    }
}

impl std::ops::Add for Mass {
    type Output = Mass;

    fn add(self, rhs: Mass) -> Mass {
        Mass(self.0.saturating_add(rhs.0))
    }
}

impl std::ops::AddAssign for Mass {
    fn add_assign(&mut self, rhs: Mass) {
        *self = *self + rhs;
    }
}

impl fmt::Display for Mass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        format_scaled(self.0, 3, f)
    }
}

impl FromStr for Mass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_scaled(s, 3, Self::MAX.0).map(Mass)
    }
}

impl Serialize for Mass {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Mass {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = DecimalInput::deserialize(deserializer)?;
        raw.as_text().parse().map_err(serde::de::Error::custom)
    }
}

/// An amount of money in cents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);
    /// Largest amount a client may submit: 99 999 999.99.
    pub const MAX: Money = Money(9_999_999_999);

    pub const fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    pub const fn cents(self) -> i64 {
        self.0
    }

    /// Price for `mass` at `self` per kilogram, rounded half-up to the cent.
    /// `None` when the total does not fit.
    pub fn per_kg_times(self, mass: Mass) -> Option<Money> {
        let raw = i128::from(self.0) * i128::from(mass.grams());
        i64::try_from((raw + 500).div_euclid(1000)).ok().map(Money)
    }
}

impl std::ops::Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money(self.0.saturating_add(rhs.0))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        format_scaled(self.0, 2, f)
    }
}

impl FromStr for Money {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_scaled(s, 2, Self::MAX.0).map(Money)
    }
}

impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = DecimalInput::deserialize(deserializer)?;
        raw.as_text().parse().map_err(serde::de::Error::custom)
    }
}

/// Clients send quantities either as JSON strings or as JSON numbers.
#[derive(Deserialize)]
#[serde(untagged)]
enum DecimalInput {
    Text(String),
    Number(serde_json::Number),
}

impl DecimalInput {
    fn as_text(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Number(n) => n.to_string(),
        }
    }
}
