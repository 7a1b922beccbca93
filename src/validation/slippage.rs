//! Price slippage between a quoted and an executed amount.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Slippage at or above this percentage is excessive.
pub const EXCESSIVE_SLIPPAGE_PCT: f64 = 5.0;

#[derive(Debug, Error, PartialEq)]
pub enum SlippageError {
    #[error("invalid amount '{0}'")]
    InvalidAmount(String),
    #[error("expected amount must be non-zero")]
    ZeroExpected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlippageReport {
    pub expected: f64,
    pub actual: f64,
    /// Absolute deviation in percent of the expected amount.
    pub slippage_pct: f64,
    pub excessive: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlippageValidation {
    pub valid: bool,
    pub slippage_pct: f64,
    pub max_slippage_pct: f64,
    pub message: String,
}

fn parse_amount(raw: &str) -> Result<f64, SlippageError> {
    let value: f64 = raw
        .trim()
        .parse()
        .map_err(|_| SlippageError::InvalidAmount(raw.to_string()))?;
    if !value.is_finite() {
        return Err(SlippageError::InvalidAmount(raw.to_string()));
    }
    Ok(value)
}

pub fn calculate_slippage(expected: &str, actual: &str) -> Result<SlippageReport, SlippageError> {
    let expected = parse_amount(expected)?;
    let actual = parse_amount(actual)?;
    if expected == 0.0 {
        return Err(SlippageError::ZeroExpected);
    }
    let slippage_pct = (expected - actual).abs() * 100.0 / expected.abs();
    Ok(SlippageReport {
        expected,
        actual,
        slippage_pct,
        excessive: slippage_pct >= EXCESSIVE_SLIPPAGE_PCT,
    })
}

/// Valid when slippage does not exceed `max_slippage_pct`.
pub fn validate_slippage(expected: &str, actual: &str, max_slippage_pct: f64) -> Result<SlippageValidation, SlippageError> {
    let report = calculate_slippage(expected, actual)?;
    let valid = report.slippage_pct <= max_slippage_pct;
    let message = if valid {
        format!("Slippage {:.2}% within {:.2}% limit", report.slippage_pct, max_slippage_pct)
    } else {
        format!("Slippage {:.2}% exceeds {:.2}% limit", report.slippage_pct, max_slippage_pct)
    };
    Ok(SlippageValidation {
        valid,
        slippage_pct: report.slippage_pct,
        max_slippage_pct,
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_slippage_threshold_is_inclusive() {
        let r = calculate_slippage("100", "95").unwrap();
        assert!((r.slippage_pct - 5.0).abs() < 1e-9);
        assert!(r.excessive);
        assert!(!calculate_slippage("100", "96").unwrap().excessive);
        assert!(calculate_slippage("100", "106").unwrap().excessive);
    }

    #[test]
    fn test_validate_slippage() {
        let ok = validate_slippage("100", "98", 5.0).unwrap();
        assert!(ok.valid);
        assert!((ok.slippage_pct - 2.0).abs() < 1e-9);

        let bad = validate_slippage("100", "90", 5.0).unwrap();
        assert!(!bad.valid);
        assert!((bad.slippage_pct - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_rejects_bad_amounts() {
        assert_eq!(calculate_slippage("0", "1"), Err(SlippageError::ZeroExpected));
        assert!(matches!(calculate_slippage("abc", "1"), Err(SlippageError::InvalidAmount(_))));
        assert!(matches!(calculate_slippage("100", "inf"), Err(SlippageError::InvalidAmount(_))));
        assert!(calculate_slippage(" 250.5 ", "250.5").unwrap().slippage_pct.abs() < 1e-12);
    }
}
