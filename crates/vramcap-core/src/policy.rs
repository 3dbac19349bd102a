//! Memory quota policy and the capacity transform.
//!
//! Every reporting entry point goes through [`QuotaPolicy::adjust`], so the
//! device-total, allocation-capacity and NVML queries cannot disagree.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Fraction of device memory hidden when nothing else is configured.
pub const DEFAULT_RESERVED_FRACTION: f64 = 0.5;

/// What happens to allocations that do not fit in the adjusted free memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Enforcement {
    /// Only the reported numbers change; allocations are forwarded as-is.
    #[default]
    Advisory,
    /// Allocations larger than the adjusted free memory fail with
    /// out-of-memory before reaching the driver.
    Strict,
}

impl std::str::FromStr for Enforcement {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "advisory" => Ok(Enforcement::Advisory),
            "strict" => Ok(Enforcement::Strict),
            other => Err(CoreError::InvalidEnforcement(other.to_string())),
        }
    }
}

impl std::fmt::Display for Enforcement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Enforcement::Advisory => f.write_str("advisory"),
            Enforcement::Strict => f.write_str("strict"),
        }
    }
}

/// `(free, used, total)` memory figures, genuine or adjusted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityTriple {
    pub free: u64,
    pub used: u64,
    pub total: u64,
}

impl CapacityTriple {
    /// Build a triple from the `(free, total)` pair the driver reports.
    pub fn from_free_total(free: u64, total: u64) -> Self {
        Self {
            free,
            used: total.saturating_sub(free),
            total,
        }
    }
}

/// Process-wide quota policy. Read-only once built.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuotaPolicy {
    reserved_fraction: f64,
    enforcement: Enforcement,
}

impl QuotaPolicy {
    /// Validate and build a policy. The fraction must lie strictly between 0 and 1.
    pub fn new(reserved_fraction: f64, enforcement: Enforcement) -> Result<Self, CoreError> {
        if !(reserved_fraction > 0.0 && reserved_fraction < 1.0) {
            return Err(CoreError::InvalidFraction(reserved_fraction));
        }
        Ok(Self {
            reserved_fraction,
            enforcement,
        })
    }

    pub fn reserved_fraction(&self) -> f64 {
        self.reserved_fraction
    }

    pub fn enforcement(&self) -> Enforcement {
        self.enforcement
    }

    /// Bytes hidden from a device with `total` bytes: `⌊total × f⌋`.
    pub fn reserved(&self, total: u64) -> u64 {
        // f64 rounding near u64::MAX can overshoot by a few units.
        ((total as f64 * self.reserved_fraction) as u64).min(total)
    }

    /// `total × (1 − f)`, rounded so that `reserved + adjusted == total`.
    pub fn adjusted_total(&self, total: u64) -> u64 {
        total - self.reserved(total)
    }

    /// Apply the policy to a genuine triple.
    ///
    /// Free memory loses the whole reservation and clamps at zero; used memory
    /// is whatever remains of the adjusted total.
    pub fn adjust(&self, genuine: CapacityTriple) -> CapacityTriple {
        let reserved = self.reserved(genuine.total);
        let total = genuine.total - reserved;
        let free = genuine.free.saturating_sub(reserved).min(total);
        CapacityTriple {
            free,
            used: total - free,
            total,
        }
    }

    /// Whether a request of `bytesize` fits the adjusted free memory.
    /// Always true for advisory policies.
    pub fn admits(&self, bytesize: u64, adjusted: &CapacityTriple) -> bool {
        match self.enforcement {
            Enforcement::Advisory => true,
            Enforcement::Strict => bytesize <= adjusted.free,
        }
    }
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            reserved_fraction: DEFAULT_RESERVED_FRACTION,
            enforcement: Enforcement::Advisory,
        }
    }
}
