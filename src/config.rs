//! Engine configuration.
//!
//! Loaded once from JSON and handed to every component through
//! [`crate::video::Context`]. Missing fields fall back to defaults and out of
//! range values are clamped on load.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::util::Result;

/// Device backend to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Software device executing on the CPU.
    Host,
    /// wgpu adapter, falling back to host when none is available.
    Wgpu,
}

/// Fence waits and frame pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub backend: BackendKind,
    pub fence_timeout_ms: u64,
    pub fence_wait_attempts: u32,
    pub frames_in_flight: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Host,
            fence_timeout_ms: 5000,
            fence_wait_attempts: 3,
            frames_in_flight: 5,
        }
    }
}

/// Blit pipeline tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlitConfig {
    /// Workgroup dims of the alpha-test pass.
    pub alpha_test_workgroup: [u32; 3],
    /// Invocations per workgroup of the blit pass.
    pub blit_invocations: u32,
    /// Workgroup size of the normalization pass.
    pub normalization_invocations: u32,
    /// Shared memory the blit pass may use for its tap window, in bytes.
    pub shared_memory_budget: u32,
}

impl Default for BlitConfig {
    fn default() -> Self {
        Self {
            alpha_test_workgroup: [16, 16, 1],
            blit_invocations: 256,
            normalization_invocations: 256,
            shared_memory_budget: 16 * 1024,
        }
    }
}

/// BVH build parameters per build preference.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BvhConfig {
    pub fast_trace_bins: u32,
    pub fast_trace_leaf_size: u32,
    pub fast_build_bins: u32,
    pub fast_build_leaf_size: u32,
}

impl Default for BvhConfig {
    fn default() -> Self {
        Self { fast_trace_bins: 12, fast_trace_leaf_size: 2, fast_build_bins: 4, fast_build_leaf_size: 4 }
    }
}

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub blit: BlitConfig,
    pub bvh: BvhConfig,
}

impl Config {
    /// Default location: `<config dir>/nabla/config.json`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|mut p| {
            p.push("nabla");
            p.push("config.json");
            p
        })
    }

    /// Load from `path`. Parse errors are reported, values are clamped.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&text)?;
        config.sanitize();
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Load from the default location, or defaults if there is no file.
    pub fn load_or_default() -> Self {
        match Self::default_path() {
            Some(path) if path.exists() => match Self::load(&path) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable config");
                    Self::default()
                }
            },
            _ => Self::default(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.device.fence_timeout_ms)
    }

    fn sanitize(&mut self) {
        let d = &mut self.device;
        d.fence_timeout_ms = d.fence_timeout_ms.max(1);
        d.fence_wait_attempts = d.fence_wait_attempts.clamp(1, 64);
        d.frames_in_flight = d.frames_in_flight.clamp(1, 16);

        let b = &mut self.blit;
        for dim in b.alpha_test_workgroup.iter_mut() {
            *dim = (*dim).max(1);
        }
        // blit invocations share one window per tap, keep it a power of two
        b.blit_invocations = b.blit_invocations.clamp(32, 1024).next_power_of_two();
        b.normalization_invocations = b.normalization_invocations.clamp(1, 1024);
        b.shared_memory_budget = b.shared_memory_budget.max(16);

        let v = &mut self.bvh;
        v.fast_trace_bins = v.fast_trace_bins.clamp(2, 64);
        v.fast_build_bins = v.fast_build_bins.clamp(2, 64);
        v.fast_trace_leaf_size = v.fast_trace_leaf_size.clamp(1, 16);
        v.fast_build_leaf_size = v.fast_build_leaf_size.clamp(1, 16);
    }
}
