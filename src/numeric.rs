//! Exact arithmetic over on-chain quantities.
//!
//! Gas prices and values are kept as decimal strings in the store and parsed
//! into [`BigUint`] for every comparison. Ratios that end up in API responses
//! are rendered as [`Decimal`] with a fixed number of fractional digits.

use num_bigint::BigUint;
use num_traits::{ToPrimitive, Zero};
use rust_decimal::Decimal;
use thiserror::Error;

/// Fractional digits kept when a ratio or mean is rendered.
const DISPLAY_SCALE: u32 = 6;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid quantity '{0}'")]
pub struct QuantityError(pub String);

/// Parse a decimal (or `0x`-prefixed hexadecimal) quantity.
pub fn parse_quantity(raw: &str) -> Result<BigUint, QuantityError> {
    let trimmed = raw.trim();
    let parsed = match trimmed.strip_prefix("0x") {
        Some(hex) => BigUint::parse_bytes(hex.as_bytes(), 16),
        None => BigUint::parse_bytes(trimmed.as_bytes(), 10),
    };
    parsed.ok_or_else(|| QuantityError(raw.to_string()))
}

/// Parse a stored quantity, treating unparseable values as zero.
///
/// Rows are validated on the way in, so this only matters for rows written by
/// something other than the ingestion path.
pub fn quantity_or_zero(raw: &str) -> BigUint {
    parse_quantity(raw).unwrap_or_default()
}

/// `num / den` rendered with [`DISPLAY_SCALE`] fractional digits (truncated).
pub fn ratio(num: &BigUint, den: &BigUint) -> Decimal {
    if den.is_zero() {
        return Decimal::ZERO;
    }
    let scaled = num * BigUint::from(10u32).pow(DISPLAY_SCALE) / den;
    scaled
        .to_i128()
        .and_then(|v| Decimal::try_from_i128_with_scale(v, DISPLAY_SCALE).ok())
        .map(|d| d.normalize())
        .unwrap_or(Decimal::MAX)
}

/// Unweighted arithmetic mean over the strictly positive gas prices of a set
/// of transactions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GasMean {
    sum: BigUint,
    count: u64,
}

impl GasMean {
    pub fn from_prices<'a, I>(prices: I) -> Self
    where
        I: IntoIterator<Item = &'a BigUint>,
    {
        let mut mean = Self::default();
        for price in prices {
            mean.push(price);
        }
        mean
    }

    /// Add a price to the sample. Zero prices are ignored.
    pub fn push(&mut self, price: &BigUint) {
        if !price.is_zero() {
            self.sum += price;
            self.count += 1;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Number of positive prices in the sample
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Whether `price > multiplier × mean`, evaluated without rounding.
    ///
    /// With `multiplier = m / 10^s` and `mean = sum / n` this is
    /// `price · n · 10^s > m · sum`. An empty sample is never exceeded.
    pub fn exceeded_by(&self, price: &BigUint, multiplier: Decimal) -> bool {
        if self.count == 0 {
            return false;
        }
        let mantissa = multiplier.mantissa();
        if mantissa <= 0 {
            return !price.is_zero();
        }
        let lhs = price * BigUint::from(self.count) * BigUint::from(10u32).pow(multiplier.scale());
        let rhs = BigUint::from(mantissa as u128) * &self.sum;
        lhs > rhs
    }

    /// `price / mean`, or zero for an empty sample.
    pub fn premium(&self, price: &BigUint) -> Decimal {
        if self.count == 0 {
            return Decimal::ZERO;
        }
        ratio(&(price * BigUint::from(self.count)), &self.sum)
    }

    /// Mean rounded down to a whole unit.
    pub fn mean_floor(&self) -> Option<BigUint> {
        if self.count == 0 {
            None
        } else {
            Some(&self.sum / BigUint::from(self.count))
        }
    }

    /// Mean as a decimal string with up to six fractional digits.
    pub fn mean_string(&self) -> Option<String> {
        if self.count == 0 {
            return None;
        }
        let count = BigUint::from(self.count);
        let whole = &self.sum / &count;
        let remainder = &self.sum % &count;
        if remainder.is_zero() {
            return Some(whole.to_string());
        }
        let fraction = remainder * BigUint::from(10u32).pow(DISPLAY_SCALE) / &count;
        let digits = format!("{:0>width$}", fraction.to_string(), width = DISPLAY_SCALE as usize);
        let digits = digits.trim_end_matches('0');
        if digits.is_empty() {
            Some(whole.to_string())
        } else {
            Some(format!("{}.{}", whole, digits))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prices(values: &[u64]) -> Vec<BigUint> {
        values.iter().map(|v| BigUint::from(*v)).collect()
    }

    #[test]
    fn parses_decimal_and_hex_quantities() {
        assert_eq!(parse_quantity("1000").unwrap(), BigUint::from(1000u32));
        assert_eq!(parse_quantity("0x3e8").unwrap(), BigUint::from(1000u32));
        assert!(parse_quantity("12a").is_err());
        assert!(parse_quantity("").is_err());
    }

    #[test]
    fn quantities_beyond_u64_survive() {
        let big = "340282366920938463463374607431768211456"; // 2^128
        let parsed = parse_quantity(big).unwrap();
        assert_eq!(parsed.to_string(), big);
    }

    #[test]
    fn mean_ignores_zero_prices() {
        let sample = prices(&[0, 10, 20, 0]);
        let mean = GasMean::from_prices(&sample);
        assert_eq!(mean.count(), 2);
        assert_eq!(mean.mean_floor(), Some(BigUint::from(15u32)));
    }

    #[test]
    fn exceeded_by_is_exact_at_the_boundary() {
        // mean 15, threshold 1.5 × 15 = 22.5
        let sample = prices(&[21, 10, 21, 8]);
        let mean = GasMean::from_prices(&sample);
        let multiplier = Decimal::new(15, 1);
        assert!(!mean.exceeded_by(&BigUint::from(22u32), multiplier));
        assert!(mean.exceeded_by(&BigUint::from(23u32), multiplier));

        // mean 28, threshold 2 × 28 = 56; exactly 56 does not exceed
        let sample = prices(&[10, 10, 10, 10, 100]);
        let mean = GasMean::from_prices(&sample);
        assert!(!mean.exceeded_by(&BigUint::from(56u32), Decimal::from(2)));
        assert!(mean.exceeded_by(&BigUint::from(57u32), Decimal::from(2)));
    }

    #[test]
    fn mean_string_keeps_fraction() {
        let sample = prices(&[10, 10, 32]);
        assert_eq!(GasMean::from_prices(&sample).mean_string().as_deref(), Some("17.333333"));
        let sample = prices(&[10, 20]);
        assert_eq!(GasMean::from_prices(&sample).mean_string().as_deref(), Some("15"));
        assert_eq!(GasMean::default().mean_string(), None);
    }

    #[test]
    fn premium_is_price_over_mean() {
        let sample = prices(&[10, 10, 10, 10, 100]);
        let mean = GasMean::from_prices(&sample);
        // 100 / 28
        assert_eq!(mean.premium(&BigUint::from(100u32)).to_string(), "3.571428");
    }
}
