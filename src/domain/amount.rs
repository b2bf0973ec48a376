use std::fmt;
use std::str::FromStr;

use num_bigint::BigUint;
use num_traits::Zero;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Token amounts are arbitrary-precision non-negative integers.
/// Balances can run well past 10^40, so no machine-width or floating-point type is used.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TokenAmount(BigUint);

impl TokenAmount {
    /// Subtract `other`, returning `None` if the result would be negative.
    pub fn checked_sub(&self, other: &TokenAmount) -> Option<TokenAmount> {
        if self.0 < other.0 {
            None
        } else {
            Some(TokenAmount(&self.0 - &other.0))
        }
    }
}

impl From<u64> for TokenAmount {
    fn from(value: u64) -> Self {
        Self(BigUint::from(value))
    }
}

impl fmt::Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parses an unsigned decimal string, the form balances are stored in.
/// Signs, whitespace and digit separators are rejected.
impl FromStr for TokenAmount {
    type Err = ParseAmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_digits(s).map(TokenAmount)
    }
}

/// Parse a transfer amount.
/// Accepts an optionally signed decimal integer ("250", "+250", "-5") and
/// requires the value to be strictly positive.
pub fn parse_amount(input: &str) -> Result<TokenAmount, ParseAmountError> {
    let (negative, digits) = match input.as_bytes().first() {
        Some(b'-') => (true, &input[1..]),
        Some(b'+') => (false, &input[1..]),
        _ => (false, input),
    };

    let value = parse_digits(digits)?;
    if negative || value.is_zero() {
        return Err(ParseAmountError::NotPositive);
    }
    Ok(TokenAmount(value))
}

fn parse_digits(digits: &str) -> Result<BigUint, ParseAmountError> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseAmountError::InvalidFormat);
    }
    BigUint::parse_bytes(digits.as_bytes(), 10).ok_or(ParseAmountError::InvalidFormat)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseAmountError {
    InvalidFormat,
    NotPositive,
}

impl fmt::Display for ParseAmountError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseAmountError::InvalidFormat => write!(f, "not a decimal integer"),
            ParseAmountError::NotPositive => write!(f, "amount must be positive"),
        }
    }
}

impl std::error::Error for ParseAmountError {}

// Amounts travel as decimal strings so JSON consumers never round them through a double.
impl Serialize for TokenAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for TokenAmount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
