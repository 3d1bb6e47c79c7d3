//! Pre-flight capacity guard
//!
//! Rejects a job before it spends cluster time on a model that cannot fit. The estimate is
//! the theoretical weight footprint only:
//!
//! ```text
//! footprint_gb = parameters × bits_per_parameter / 8 / 10⁹
//! ```
//!
//! and the check fails when `footprint + margin > per_device_cap × device_count`.

use crate::error::{MedidorError, Result};

/// Outcome of a passing capacity check
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CapacityReport {
    /// Theoretical model footprint in GB
    pub footprint_gb: f64,
    /// Safety margin in GB
    pub margin_gb: f64,
    /// `per_device_cap × device_count` in GB
    pub budget_gb: f64,
}

impl CapacityReport {
    /// Budget left over after footprint and margin
    #[must_use]
    pub fn headroom_gb(&self) -> f64 {
        self.budget_gb - self.footprint_gb - self.margin_gb
    }
}

/// Parse a magnitude-suffixed parameter count such as `"7B"`, `"8.0B"` or `"137M"`
///
/// # Errors
/// Returns `Configuration` for a missing or unknown suffix or a non-numeric magnitude
pub fn parse_parameter_count(raw: &str) -> Result<f64> {
    let trimmed = raw.trim();
    let Some(suffix) = trimmed.chars().last() else {
        return Err(MedidorError::config("empty parameter count"));
    };

    let multiplier = match suffix.to_ascii_uppercase() {
        'K' => 1e3,
        'M' => 1e6,
        'B' => 1e9,
        'T' => 1e12,
        other => {
            return Err(MedidorError::config(format!(
                "unknown parameter-count suffix '{other}' in '{raw}'"
            )))
        },
    };

    let magnitude = &trimmed[..trimmed.len() - suffix.len_utf8()];
    let value: f64 = magnitude.trim().parse().map_err(|_| {
        MedidorError::config(format!("unparsable parameter count '{raw}'"))
    })?;
    if !value.is_finite() || value <= 0.0 {
        return Err(MedidorError::config(format!(
            "parameter count must be positive, got '{raw}'"
        )));
    }
    Ok(value * multiplier)
}

/// Bit width embedded in a quantization label such as `"Q4_0"`, `"Q5_K_M"`, `"F16"`
///
/// Recognized families: `Q`, `IQ`, `F`, `BF`, `FP`, `INT`. The first digit run after the
/// family prefix is the bit width.
///
/// # Errors
/// Returns `Configuration` for an unknown family or a missing/out-of-range bit width
pub fn parse_quantization_bits(raw: &str) -> Result<u32> {
    let label = raw.trim().to_ascii_uppercase();
    let prefix_len = label.chars().take_while(char::is_ascii_alphabetic).count();
    let (prefix, rest) = label.split_at(prefix_len);

    if !matches!(prefix, "Q" | "IQ" | "F" | "BF" | "FP" | "INT") {
        return Err(MedidorError::config(format!(
            "unparsable quantization label '{raw}'"
        )));
    }

    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    let bits: u32 = digits.parse().map_err(|_| {
        MedidorError::config(format!("quantization label '{raw}' has no bit width"))
    })?;
    if !(1..=64).contains(&bits) {
        return Err(MedidorError::config(format!(
            "quantization label '{raw}' has out-of-range bit width {bits}"
        )));
    }
    Ok(bits)
}

/// Theoretical footprint in GB of a model with the given size and quantization
///
/// # Errors
/// Returns `Configuration` if either string is unparsable
pub fn estimate_footprint_gb(parameter_size: &str, quantization_level: &str) -> Result<f64> {
    let parameters = parse_parameter_count(parameter_size)?;
    let bits = parse_quantization_bits(quantization_level)?;
    Ok(parameters * f64::from(bits) / 8.0 / 1e9)
}

/// Compare a footprint against the memory of `device_count` devices
///
/// # Errors
/// Returns `Capacity` when `footprint_gb + safety_margin_gb > per_device_cap_gb × device_count`
pub fn check(
    footprint_gb: f64,
    safety_margin_gb: f64,
    per_device_cap_gb: f64,
    device_count: usize,
) -> Result<CapacityReport> {
    let budget_gb = per_device_cap_gb * device_count as f64;
    if footprint_gb + safety_margin_gb > budget_gb {
        return Err(MedidorError::Capacity {
            footprint_gb,
            margin_gb: safety_margin_gb,
            budget_gb,
        });
    }
    Ok(CapacityReport {
        footprint_gb,
        margin_gb: safety_margin_gb,
        budget_gb,
    })
}
