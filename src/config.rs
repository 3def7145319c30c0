//! Runtime configuration.
//!
//! Values are layered: built-in defaults, then an optional JSON file, then
//! `STRATA_*` environment variables.

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::OffloadError;

/// Capability needed for 16-bit float kernels.
pub const MIN_CC_F16: u32 = 530;

/// Capability needed for integer dot-product instructions (quantized kernels).
pub const MIN_CC_DP4A: u32 = 610;

/// Capability needed for bf16 kernels.
pub const MIN_CC_BF16: u32 = 800;

/// Floating precision of a dense matmul operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    F32,
    F16,
    BF16,
}

impl Precision {
    /// Lowest capability tier that may run this precision.
    pub fn min_capability(self) -> u32 {
        match self {
            Self::F32 => 0,
            Self::F16 => MIN_CC_F16,
            Self::BF16 => MIN_CC_BF16,
        }
    }

    /// Bytes per element.
    pub fn size(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 | Self::BF16 => 2,
        }
    }

    /// Highest precision tier at or below `self` that `capability` supports.
    ///
    /// Order is BF16 → F16 → F32; F32 always runs.
    pub fn degrade_for(self, capability: u32) -> Self {
        let mut p = self;
        while capability < p.min_capability() {
            p = match p {
                Self::BF16 => Self::F16,
                _ => Self::F32,
            };
        }
        p
    }
}

impl std::fmt::Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::F32 => "f32",
            Self::F16 => "f16",
            Self::BF16 => "bf16",
        })
    }
}

/// Matrix-multiply kernel family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatMulStrategy {
    /// Quantized weights × Q8_1 activations, one warp per output row.
    VecQ,
    /// Quantized weights × Q8_1 activations, shared-memory tiles.
    TiledQ,
    /// Decode weights on the fly against f32 activations (single column).
    Dmmv,
    /// Decode weights to a dense precision and run a GEMM.
    Dense(Precision),
}

impl std::fmt::Display for MatMulStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::VecQ => f.write_str("mmvq"),
            Self::TiledQ => f.write_str("mmq"),
            Self::Dmmv => f.write_str("dmmv"),
            Self::Dense(p) => write!(f, "dense-{}", p),
        }
    }
}

impl FromStr for MatMulStrategy {
    type Err = OffloadError;

    /// Accepts `mmvq`, `mmq`, `dmmv`, `dense` (f32), `dense-f32`,
    /// `dense-f16`, `dense-bf16` (case-insensitive).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mmvq" | "vecq" => Ok(Self::VecQ),
            "mmq" | "tiledq" => Ok(Self::TiledQ),
            "dmmv" => Ok(Self::Dmmv),
            "dense" | "dense-f32" => Ok(Self::Dense(Precision::F32)),
            "dense-f16" => Ok(Self::Dense(Precision::F16)),
            "dense-bf16" => Ok(Self::Dense(Precision::BF16)),
            other => Err(OffloadError::Config(format!(
                "unknown matmul strategy '{}'",
                other
            ))),
        }
    }
}

/// Configuration of a [`Runtime`](crate::dispatch::Runtime).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Relative share of split-tensor rows per device. Empty means
    /// proportional to each device's total memory.
    pub tensor_split: Vec<f32>,
    /// Device that assembles multi-device results.
    pub main_device: usize,
    /// Size in bytes of the scratch arena used for intermediate tensors.
    pub scratch_size: usize,
    /// Free memory in bytes below which secondary buffers are evicted.
    pub reserved_vram: usize,
    /// Allocate pinned host memory for host buffers.
    pub pinned_host: bool,
    /// Override for matmul strategy selection (diagnostics).
    pub force_strategy: Option<MatMulStrategy>,
    /// Slot table capacity per device.
    pub pool_slots: usize,
    /// Best-fit scan stops once the size overhead is within this fraction.
    pub pool_tolerance: f32,
    /// Largest column count routed to the tiled quantized kernel.
    pub mmq_max_batch: usize,
    /// Never keep secondary buffers between calls.
    pub no_secondary_offload: bool,
    /// Preferred precision for the dense fallback.
    pub dense_precision: Precision,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tensor_split: Vec::new(),
            main_device: 0,
            scratch_size: 64 * 1024 * 1024,
            reserved_vram: 0,
            pinned_host: true,
            force_strategy: None,
            pool_slots: 256,
            pool_tolerance: 0.05,
            mmq_max_batch: 32,
            no_secondary_offload: false,
            dense_precision: Precision::F16,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `STRATA_*` environment variables.
    pub fn from_env() -> Result<Self, OffloadError> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Read a JSON file; missing fields take their default.
    pub fn from_file(path: &Path) -> Result<Self, OffloadError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        debug!(path = %path.display(), "loaded runtime config");
        Ok(config)
    }

    /// File (when given) then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, OffloadError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (normally the process environment).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), OffloadError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("STRATA_TENSOR_SPLIT") {
            self.tensor_split = parse_split(&v)?;
        }
        if let Some(v) = lookup("STRATA_MAIN_DEVICE") {
            self.main_device = parse_num("STRATA_MAIN_DEVICE", &v)?;
        }
        if let Some(v) = lookup("STRATA_SCRATCH_SIZE") {
            self.scratch_size = parse_num("STRATA_SCRATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("STRATA_RESERVED_VRAM") {
            self.reserved_vram = parse_num("STRATA_RESERVED_VRAM", &v)?;
        }
        if let Some(v) = lookup("STRATA_NO_PINNED") {
            self.pinned_host = !parse_flag(&v);
        }
        if let Some(v) = lookup("STRATA_FORCE_STRATEGY") {
            self.force_strategy = if v.trim().is_empty() {
                None
            } else {
                Some(v.parse()?)
            };
        }
        if let Some(v) = lookup("STRATA_POOL_SLOTS") {
            self.pool_slots = parse_num("STRATA_POOL_SLOTS", &v)?;
        }
        if let Some(v) = lookup("STRATA_NO_SECONDARY_OFFLOAD") {
            self.no_secondary_offload = parse_flag(&v);
        }
        Ok(())
    }

    /// Check the configuration against the number of available devices.
    pub fn validate(&self, device_count: usize) -> Result<(), OffloadError> {
        if device_count == 0 {
            return Err(OffloadError::Config("no devices available".into()));
        }
        if self.main_device >= device_count {
            return Err(OffloadError::Config(format!(
                "main device {} out of range ({} devices)",
                self.main_device, device_count
            )));
        }
        if self.tensor_split.len() > device_count {
            return Err(OffloadError::Config(format!(
                "tensor split has {} entries for {} devices",
                self.tensor_split.len(),
                device_count
            )));
        }
        if self.tensor_split.iter().any(|&s| !(s >= 0.0) || !s.is_finite()) {
            return Err(OffloadError::Config(
                "tensor split entries must be finite and non-negative".into(),
            ));
        }
        if !self.tensor_split.is_empty() && self.tensor_split.iter().sum::<f32>() <= 0.0 {
            return Err(OffloadError::Config("tensor split sums to zero".into()));
        }
        if self.pool_slots == 0 {
            return Err(OffloadError::Config("pool_slots must be at least 1".into()));
        }
        if !(self.pool_tolerance >= 0.0) {
            return Err(OffloadError::Config(
                "pool_tolerance must be non-negative".into(),
            ));
        }
        if self.mmq_max_batch == 0 {
            return Err(OffloadError::Config("mmq_max_batch must be at least 1".into()));
        }
        Ok(())
    }
}

/// Parse `"3,1"` or `"0.75 0.25"` into split weights.
fn parse_split(v: &str) -> Result<Vec<f32>, OffloadError> {
    v.split(|c: char| c == ',' || c == '/' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<f32>().map_err(|_| {
                OffloadError::Config(format!("invalid STRATA_TENSOR_SPLIT entry '{}'", s))
            })
        })
        .collect()
}

fn parse_num(key: &str, v: &str) -> Result<usize, OffloadError> {
    v.trim()
        .parse()
        .map_err(|_| OffloadError::Config(format!("{} must be an integer, got '{}'", key, v)))
}

fn parse_flag(v: &str) -> bool {
    matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_defaults() {
        let c = RuntimeConfig::default();
        assert_eq!(c.pool_slots, 256);
        assert_eq!(c.main_device, 0);
        assert!(c.pinned_host);
        assert!(c.force_strategy.is_none());
        assert!((c.pool_tolerance - 0.05).abs() < 1e-6);
        assert!(c.validate(1).is_ok());
    }

    #[test]
    fn test_overrides_from_lookup() {
        let mut c = RuntimeConfig::default();
        c.apply_overrides(lookup(&[
            ("STRATA_TENSOR_SPLIT", "3,1"),
            ("STRATA_MAIN_DEVICE", "1"),
            ("STRATA_SCRATCH_SIZE", "1048576"),
            ("STRATA_RESERVED_VRAM", "4096"),
            ("STRATA_NO_PINNED", "1"),
            ("STRATA_FORCE_STRATEGY", "dense-bf16"),
            ("STRATA_POOL_SLOTS", "8"),
            ("STRATA_NO_SECONDARY_OFFLOAD", "true"),
        ]))
        .unwrap();
        assert_eq!(c.tensor_split, vec![3.0, 1.0]);
        assert_eq!(c.main_device, 1);
        assert_eq!(c.scratch_size, 1 << 20);
        assert_eq!(c.reserved_vram, 4096);
        assert!(!c.pinned_host);
        assert_eq!(c.force_strategy, Some(MatMulStrategy::Dense(Precision::BF16)));
        assert_eq!(c.pool_slots, 8);
        assert!(c.no_secondary_offload);
        assert!(c.validate(2).is_ok());
        assert!(c.validate(1).is_err());
    }

    #[test]
    fn test_bad_override_is_config_error() {
        let mut c = RuntimeConfig::default();
        let err = c
            .apply_overrides(lookup(&[("STRATA_POOL_SLOTS", "many")]))
            .unwrap_err();
        assert!(matches!(err, OffloadError::Config(_)));
        let err = c
            .apply_overrides(lookup(&[("STRATA_FORCE_STRATEGY", "warp-speed")]))
            .unwrap_err();
        assert!(err.to_string().contains("warp-speed"));
    }

    #[test]
    fn test_strategy_names_roundtrip() {
        for s in [
            MatMulStrategy::VecQ,
            MatMulStrategy::TiledQ,
            MatMulStrategy::Dmmv,
            MatMulStrategy::Dense(Precision::F32),
            MatMulStrategy::Dense(Precision::F16),
            MatMulStrategy::Dense(Precision::BF16),
        ] {
            assert_eq!(s.to_string().parse::<MatMulStrategy>().unwrap(), s);
        }
    }

    #[test]
    fn test_precision_degrades_by_capability() {
        assert_eq!(Precision::BF16.degrade_for(860), Precision::BF16);
        assert_eq!(Precision::BF16.degrade_for(750), Precision::F16);
        assert_eq!(Precision::BF16.degrade_for(520), Precision::F32);
        assert_eq!(Precision::F16.degrade_for(610), Precision::F16);
        assert_eq!(Precision::F32.degrade_for(0), Precision::F32);
    }

    #[test]
    fn test_json_file_with_partial_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime.json");
        std::fs::write(
            &path,
            r#"{"tensor_split": [1.0, 1.0], "force_strategy": {"dense": "f16"}, "pool_slots": 16}"#,
        )
        .unwrap();
        let c = RuntimeConfig::from_file(&path).unwrap();
        assert_eq!(c.tensor_split, vec![1.0, 1.0]);
        assert_eq!(c.force_strategy, Some(MatMulStrategy::Dense(Precision::F16)));
        assert_eq!(c.pool_slots, 16);
        assert_eq!(c.mmq_max_batch, RuntimeConfig::default().mmq_max_batch);
    }

    #[test]
    fn test_json_roundtrip() {
        let mut c = RuntimeConfig::default();
        c.force_strategy = Some(MatMulStrategy::TiledQ);
        let text = serde_json::to_string(&c).unwrap();
        let back: RuntimeConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn test_invalid_json_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            RuntimeConfig::from_file(&path),
            Err(OffloadError::Json(_))
        ));
    }

    #[test]
    fn test_validate_rejects_negative_split() {
        let c = RuntimeConfig {
            tensor_split: vec![1.0, -1.0],
            ..Default::default()
        };
        assert!(c.validate(2).is_err());
    }
}
