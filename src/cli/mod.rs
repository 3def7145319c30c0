//! Shared helpers for the `strata-offload` binary.

use serde::Serialize;

use crate::device::SimDeviceSpec;
use crate::quant::GgmlType;
use crate::tensor::Location;

/// Send runtime logs to stderr.
///
/// At the default `warn` level this shows capability fallbacks, pinned host
/// memory falling back to pageable memory, and pool tables running full.
/// `RUST_LOG=strata_offload=info` adds device discovery; `debug` and `trace`
/// add per-device matmul plans and staging copies. `disable` silences all of
/// it.
pub fn init_logging(disable: bool) {
    use tracing_subscriber::EnvFilter;

    if disable {
        return;
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Parse a byte size such as `512M`, `8G` or `4096`.
pub fn parse_size(s: &str) -> Result<usize, String> {
    let s = s.trim();
    let (digits, shift) = match s.chars().last().map(|c| c.to_ascii_uppercase()) {
        Some('K') => (&s[..s.len() - 1], 10),
        Some('M') => (&s[..s.len() - 1], 20),
        Some('G') => (&s[..s.len() - 1], 30),
        _ => (s, 0),
    };
    let n: usize = digits
        .parse()
        .map_err(|_| format!("'{}' is not a valid size", s))?;
    n.checked_mul(1usize << shift)
        .ok_or_else(|| format!("size '{}' is too large", s))
}

/// Parse simulated devices from capability tiers, e.g. `860,610`.
/// Every device gets `memory` bytes.
pub fn parse_devices(s: &str, memory: usize) -> Result<Vec<SimDeviceSpec>, String> {
    let specs: Vec<SimDeviceSpec> = s
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .enumerate()
        .map(|(i, p)| {
            p.parse::<u32>()
                .map(|cc| SimDeviceSpec::new(format!("sim-{}-cc{}", i, cc), memory, cc))
                .map_err(|_| format!("'{}' is not a capability tier", p))
        })
        .collect::<Result<_, _>>()?;
    if specs.is_empty() {
        return Err("at least one device is required".to_string());
    }
    Ok(specs)
}

/// Parse row split proportions, e.g. `3,1`.
pub fn parse_split(s: &str) -> Result<Vec<f32>, String> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            p.parse::<f32>()
                .ok()
                .filter(|v| v.is_finite() && *v >= 0.0)
                .ok_or_else(|| format!("'{}' is not a valid split proportion", p))
        })
        .collect()
}

/// Parse a weight type by name (`q4_k`, `Q8_0`, `f16`, ...).
pub fn parse_type(s: &str) -> Result<GgmlType, String> {
    GgmlType::from_name(s).ok_or_else(|| format!("Unknown tensor type '{}'", s))
}

/// Parse where the weights live: `host`, `device` or `split`.
pub fn parse_location(s: &str) -> Result<Location, String> {
    match s.to_ascii_lowercase().as_str() {
        "host" => Ok(Location::Host),
        "device" => Ok(Location::Device),
        "split" => Ok(Location::Split),
        _ => Err(format!(
            "Unknown location '{}'. Options: host, device, split",
            s
        )),
    }
}

/// Deviation of a result from its reference.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ErrorStats {
    pub max_abs: f32,
    pub rms: f32,
}

pub fn error_stats(got: &[f32], reference: &[f32]) -> ErrorStats {
    let n = got.len().min(reference.len());
    if n == 0 {
        return ErrorStats { max_abs: 0.0, rms: 0.0 };
    }
    let mut max_abs = 0.0f32;
    let mut sq = 0.0f64;
    for (a, b) in got.iter().zip(reference) {
        let d = (a - b).abs();
        max_abs = max_abs.max(d);
        sq += (d as f64) * (d as f64);
    }
    ErrorStats {
        max_abs,
        rms: (sq / n as f64).sqrt() as f32,
    }
}

/// `out[c * nrows + r] = dot(w[r], y[c])` on the host.
pub fn reference_matmul(w: &[f32], y: &[f32], nrows: usize, k: usize, ncols: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; nrows * ncols];
    for c in 0..ncols {
        let yc = &y[c * k..(c + 1) * k];
        for r in 0..nrows {
            let wr = &w[r * k..(r + 1) * k];
            out[c * nrows + r] = wr.iter().zip(yc).map(|(a, b)| a * b).sum();
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_disabled_installs_nothing() {
        init_logging(true);
        init_logging(true);
        assert!(tracing::dispatcher::get_default(|d| d.is::<tracing::subscriber::NoSubscriber>()));
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("64K").unwrap(), 64 << 10);
        assert_eq!(parse_size("512m").unwrap(), 512 << 20);
        assert_eq!(parse_size("8G").unwrap(), 8 << 30);
        assert!(parse_size("lots").is_err());
        assert!(parse_size("").is_err());
    }

    #[test]
    fn test_parse_devices() {
        let d = parse_devices("860, 610", 1 << 30).unwrap();
        assert_eq!(d.len(), 2);
        assert_eq!(d[1].capability, 610);
        assert_eq!(d[0].total_memory, 1 << 30);
        assert!(parse_devices("", 1).is_err());
        assert!(parse_devices("fast", 1).is_err());
    }

    #[test]
    fn test_parse_split() {
        assert_eq!(parse_split("3, 1").unwrap(), vec![3.0, 1.0]);
        assert!(parse_split("1,-1").is_err());
        assert!(parse_split("half").is_err());
    }

    #[test]
    fn test_parse_type_and_location() {
        assert_eq!(parse_type("q4_k").unwrap(), GgmlType::Q4K);
        assert!(parse_type("q9_9").is_err());
        assert_eq!(parse_location("Split").unwrap(), Location::Split);
        assert!(parse_location("disk").is_err());
    }

    #[test]
    fn test_error_stats() {
        let s = error_stats(&[1.0, 2.0, 3.0], &[1.0, 2.5, 2.0]);
        assert_eq!(s.max_abs, 1.0);
        assert!((s.rms - (1.25f32 / 3.0).sqrt()).abs() < 1e-6);
        assert_eq!(error_stats(&[], &[]).rms, 0.0);
    }

    #[test]
    fn test_reference_matmul() {
        let out = reference_matmul(&[1.0, 2.0, 3.0, 4.0], &[1.0, 1.0], 2, 2, 1);
        assert_eq!(out, vec![3.0, 7.0]);
    }
}
