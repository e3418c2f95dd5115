//! Kubernetes memory quantity parsing and formatting
//!
//! Only the subset needed for memory accounting is handled: binary suffixes
//! (`Ki`..`Ei`), decimal suffixes (`k`, `M`..`E`), milli (`m`) and
//! exponent notation (`1e9`). Fractional byte results are rounded up, as the
//! API server does for `Quantity::Value()`.

use crate::error::{Error, Result};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

const BINARY_SUFFIXES: &[(&str, i64)] = &[
    ("Ki", 1 << 10),
    ("Mi", 1 << 20),
    ("Gi", 1 << 30),
    ("Ti", 1 << 40),
    ("Pi", 1 << 50),
    ("Ei", 1 << 60),
];

const DECIMAL_SUFFIXES: &[(&str, f64)] = &[
    ("k", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
    ("E", 1e18),
    ("m", 1e-3),
];

/// Parse a quantity string into whole bytes
pub fn parse_bytes(raw: &str) -> Result<i64> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(Error::InvalidQuantity(raw.to_string()));
    }

    for (suffix, multiplier) in BINARY_SUFFIXES {
        if let Some(number) = s.strip_suffix(suffix) {
            let value = parse_number(number, raw)?;
            return Ok((value * *multiplier as f64).ceil() as i64);
        }
    }

    // Exponent form must be checked before the `E` suffix.
    if let Some((mantissa, exponent)) = s.split_once(|c| c == 'e' || c == 'E') {
        let digits = exponent.trim_start_matches(|c| c == '+' || c == '-');
        if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
            let value = parse_number(mantissa, raw)?;
            let exp: i32 = exponent
                .parse()
                .map_err(|_| Error::InvalidQuantity(raw.to_string()))?;
            return Ok((value * 10f64.powi(exp)).ceil() as i64);
        }
    }

    for (suffix, multiplier) in DECIMAL_SUFFIXES {
        if let Some(number) = s.strip_suffix(suffix) {
            let value = parse_number(number, raw)?;
            return Ok((value * multiplier).ceil() as i64);
        }
    }

    Ok(parse_number(s, raw)?.ceil() as i64)
}

fn parse_number(number: &str, raw: &str) -> Result<f64> {
    let value: f64 = number
        .parse()
        .map_err(|_| Error::InvalidQuantity(raw.to_string()))?;
    if !value.is_finite() || value < 0.0 {
        return Err(Error::InvalidQuantity(raw.to_string()));
    }
    Ok(value)
}

/// Parse an optional API quantity, treating absence as zero
pub fn quantity_bytes(quantity: Option<&Quantity>) -> Result<i64> {
    match quantity {
        Some(q) => parse_bytes(&q.0),
        None => Ok(0),
    }
}

/// Render bytes in canonical binary-SI form (largest exact suffix)
pub fn format_binary(bytes: i64) -> String {
    if bytes == 0 {
        return "0".to_string();
    }
    for (suffix, multiplier) in BINARY_SUFFIXES.iter().rev() {
        if bytes % multiplier == 0 {
            return format!("{}{}", bytes / multiplier, suffix);
        }
    }
    bytes.to_string()
}

/// Convert bytes to GiB for diagnostics
pub fn gib(bytes: f64) -> f64 {
    bytes / (1u64 << 30) as f64
}

/// Convert bytes to MiB for diagnostics
pub fn mib(bytes: f64) -> f64 {
    bytes / (1u64 << 20) as f64
}
