use serde::{Deserialize, Serialize};
use std::fmt;

/// ISO 4217 currency code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Currency(pub String);

impl Currency {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into().trim().to_ascii_uppercase())
    }

    pub fn code(&self) -> &str {
        &self.0
    }

    /// Number of decimal digits carried by one minor unit.
    pub fn minor_unit_scale(&self) -> u32 {
        match self.0.as_str() {
            "JPY" | "KRW" | "CLP" | "VND" | "XOF" | "XAF" => 0,
            "KWD" | "BHD" | "OMR" | "JOD" | "TND" => 3,
            _ => 2,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Monetary amount as a scaled integer in the currency's minor unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Money {
    pub amount_minor: i64,
    pub currency: Currency,
}

impl Money {
    pub fn new(amount_minor: i64, currency: Currency) -> Self {
        Self {
            amount_minor,
            currency,
        }
    }

    pub fn zero(currency: Currency) -> Self {
        Self::new(0, currency)
    }

    pub fn is_zero(&self) -> bool {
        self.amount_minor == 0
    }
}

/// Line quantity in thousandths of a unit (`1500` is one and a half units).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Quantity(pub i64);

impl Quantity {
    pub const SCALE: u32 = 3;

    pub const fn units(units: i64) -> Self {
        Self(units * 1000)
    }

    pub const fn milli(self) -> i64 {
        self.0
    }
}

/// Tax rate in hundredths of a percent (`1900` is 19%).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaxRate(pub u32);

impl TaxRate {
    pub const SCALE: u32 = 2;

    pub const fn percent(percent: u32) -> Self {
        Self(percent * 100)
    }

    pub const fn basis(self) -> u32 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Tax on `base_minor`, rounded half away from zero.
    pub fn apply(self, base_minor: i64) -> i64 {
        round_div(i128::from(base_minor) * i128::from(self.0), 10_000) as i64
    }
}

impl fmt::Display for TaxRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_scaled(i64::from(self.0), Self::SCALE, 2, '.'))
    }
}

/// Integer division rounding half away from zero.
pub fn round_div(numerator: i128, denominator: i128) -> i128 {
    if denominator == 0 {
        return 0;
    }
    let quotient = numerator / denominator;
    let remainder = numerator % denominator;
    if remainder.abs() * 2 >= denominator.abs() {
        if (numerator < 0) ^ (denominator < 0) {
            quotient - 1
        } else {
            quotient + 1
        }
    } else {
        quotient
    }
}

/// Renders a scaled integer with a fixed number of decimals.
///
/// `format_scaled(12345, 2, 2, '.')` is `"123.45"`; when `decimals` is smaller
/// than `scale` the value is rounded half away from zero.
pub fn format_scaled(value: i64, scale: u32, decimals: u32, separator: char) -> String {
    let rescaled: i128 = if decimals >= scale {
        i128::from(value) * 10_i128.pow(decimals - scale)
    } else {
        round_div(i128::from(value), 10_i128.pow(scale - decimals))
    };

    let negative = rescaled < 0;
    let digits = rescaled.unsigned_abs();
    let mut rendered = String::new();
    if negative {
        rendered.push('-');
    }

    if decimals == 0 {
        rendered.push_str(&digits.to_string());
        return rendered;
    }

    let divisor = 10_u128.pow(decimals);
    rendered.push_str(&(digits / divisor).to_string());
    rendered.push(separator);
    rendered.push_str(&format!(
        "{:0width$}",
        digits % divisor,
        width = decimals as usize
    ));
    rendered
}
