//! Host memory probe.
//!
//! On unified-memory hosts the GPU shares system RAM, so the probe
//! reports host totals via `sysinfo` plus the kernel's pressure-stall
//! indicators from `/proc/pressure/*` where available.

use serde::{Deserialize, Serialize};
use sysinfo::{MemoryRefreshKind, RefreshKind, System};

const GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Pressure-stall `some avg10` values, percentages.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PsiSnapshot {
    pub cpu: f64,
    pub memory: f64,
    pub io: f64,
}

/// One observation of host memory.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub total_gb: f64,
    pub used_gb: f64,
    pub available_gb: f64,
    pub usage_pct: f64,
    pub psi: PsiSnapshot,
}

/// Source of memory observations; injectable for tests.
pub trait MemoryProbe: Send + Sync {
    fn snapshot(&self) -> MemorySnapshot;
}

/// Production probe backed by `sysinfo` and `/proc/pressure`.
pub struct SysinfoProbe;

impl SysinfoProbe {
    pub fn new() -> Self {
        Self
    }

    fn read_psi() -> PsiSnapshot {
        PsiSnapshot {
            cpu: read_psi_avg10("/proc/pressure/cpu").unwrap_or(0.0),
            memory: read_psi_avg10("/proc/pressure/memory").unwrap_or(0.0),
            io: read_psi_avg10("/proc/pressure/io").unwrap_or(0.0),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn snapshot(&self) -> MemorySnapshot {
        let mut sys = System::new_with_specifics(
            RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
        );
        sys.refresh_memory();

        let total_gb = sys.total_memory() as f64 / GB;
        let available_gb = sys.available_memory() as f64 / GB;
        let used_gb = (total_gb - available_gb).max(0.0);
        let usage_pct = if total_gb > 0.0 {
            used_gb / total_gb * 100.0
        } else {
            0.0
        };

        MemorySnapshot {
            total_gb,
            used_gb,
            available_gb,
            usage_pct,
            psi: Self::read_psi(),
        }
    }
}

/// Parse `some avg10=N.NN ...` from a pressure file.
fn read_psi_avg10(path: &str) -> Option<f64> {
    let content = std::fs::read_to_string(path).ok()?;
    parse_psi_avg10(&content)
}

fn parse_psi_avg10(content: &str) -> Option<f64> {
    let line = content.lines().find(|l| l.starts_with("some"))?;
    line.split_whitespace()
        .find_map(|field| field.strip_prefix("avg10="))
        .and_then(|v| v.parse().ok())
}

/// Test probe returning fixed values.
pub struct FixedProbe {
    pub snapshot: MemorySnapshot,
}

impl FixedProbe {
    pub fn new(total_gb: f64, used_gb: f64) -> Self {
        Self {
            snapshot: MemorySnapshot {
                total_gb,
                used_gb,
                available_gb: (total_gb - used_gb).max(0.0),
                usage_pct: if total_gb > 0.0 {
                    used_gb / total_gb * 100.0
                } else {
                    0.0
                },
                psi: PsiSnapshot::default(),
            },
        }
    }
}

impl MemoryProbe for FixedProbe {
    fn snapshot(&self) -> MemorySnapshot {
        self.snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn psi_parse_extracts_some_avg10() {
        let content = "some avg10=1.23 avg60=0.80 avg300=0.40 total=12345\n\
                       full avg10=0.50 avg60=0.30 avg300=0.10 total=6789\n";
        assert_eq!(parse_psi_avg10(content), Some(1.23));
    }

    #[test]
    fn psi_parse_handles_garbage() {
        assert_eq!(parse_psi_avg10(""), None);
        assert_eq!(parse_psi_avg10("full avg10=0.5"), None);
        assert_eq!(parse_psi_avg10("some avg60=0.5"), None);
    }

    #[test]
    fn fixed_probe_reports_configured_values() {
        let probe = FixedProbe::new(128.0, 32.0);
        let snap = probe.snapshot();
        assert_eq!(snap.total_gb, 128.0);
        assert_eq!(snap.used_gb, 32.0);
        assert_eq!(snap.available_gb, 96.0);
        assert!((snap.usage_pct - 25.0).abs() < 1e-9);
    }

    #[test]
    fn sysinfo_probe_reports_nonzero_total() {
        let snap = SysinfoProbe::new().snapshot();
        assert!(snap.total_gb > 0.0);
        assert!(snap.used_gb >= 0.0);
    }
}
