//! GPU memory tiering (spec §5): "the GPU is a process-global resource; its
//! memory limits are configured once, gated by a `gpu_configured` flag and
//! keyed off physical RAM."
//!
//! Grounded on `web/vram_calculator.rs`'s named-threshold-tier idiom
//! (`SMALL_MODEL_GB`/`MEDIUM_MODEL_GB`/... selecting a layer count), applied
//! here to select a KV-cache tier instead of a GPU-layer count.

use log::info;

pub const TIER_1_RAM_GB: u64 = 8;
pub const TIER_2_RAM_GB: u64 = 16;
pub const TIER_3_RAM_GB: u64 = 32;

pub const CACHE_MIB_TIER_1: u64 = 128;
pub const CACHE_MIB_TIER_2: u64 = 256;
pub const CACHE_MIB_TIER_3: u64 = 512;
pub const CACHE_MIB_TIER_4: u64 = 1024;

/// Fraction of the OS-reported recommended working set the wired memory
/// cap is allowed to reach.
pub const WIRED_WORKING_SET_CAP_RATIO: f64 = 0.90;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuMemoryPlan {
    pub cache_limit_mib: u64,
    pub wired_limit_mib: u64,
}

/// Select a cache tier from detected physical RAM and compute the wired
/// working-set cap from the OS-reported recommended limit.
pub fn plan_for(physical_ram_gb: u64, os_recommended_working_set_mib: u64) -> GpuMemoryPlan {
    let cache_limit_mib = if physical_ram_gb < TIER_1_RAM_GB {
        CACHE_MIB_TIER_1
    } else if physical_ram_gb < TIER_2_RAM_GB {
        CACHE_MIB_TIER_2
    } else if physical_ram_gb < TIER_3_RAM_GB {
        CACHE_MIB_TIER_3
    } else {
        CACHE_MIB_TIER_4
    };

    let wired_limit_mib =
        (os_recommended_working_set_mib as f64 * WIRED_WORKING_SET_CAP_RATIO) as u64;

    info!(
        "GPU memory plan: {physical_ram_gb} GB RAM -> {cache_limit_mib} MiB cache, {wired_limit_mib} MiB wired cap"
    );

    GpuMemoryPlan {
        cache_limit_mib,
        wired_limit_mib,
    }
}

/// Best-effort physical RAM detection, used once per process.
pub fn detect_physical_ram_gb() -> u64 {
    #[cfg(target_os = "macos")]
    {
        if let Ok(output) = std::process::Command::new("sysctl")
            .args(["-n", "hw.memsize"])
            .output()
        {
            if let Ok(text) = String::from_utf8(output.stdout) {
                if let Ok(bytes) = text.trim().parse::<u64>() {
                    return bytes / (1024 * 1024 * 1024);
                }
            }
        }
    }
    16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_ram_selects_smallest_tier() {
        let plan = plan_for(4, 2000);
        assert_eq!(plan.cache_limit_mib, CACHE_MIB_TIER_1);
    }

    #[test]
    fn high_ram_selects_largest_tier() {
        let plan = plan_for(64, 2000);
        assert_eq!(plan.cache_limit_mib, CACHE_MIB_TIER_4);
    }

    #[test]
    fn wired_cap_is_90_percent_of_recommendation() {
        let plan = plan_for(16, 1000);
        assert_eq!(plan.wired_limit_mib, 900);
    }

    #[test]
    fn tier_boundaries_are_half_open() {
        assert_eq!(plan_for(TIER_1_RAM_GB, 0).cache_limit_mib, CACHE_MIB_TIER_2);
        assert_eq!(plan_for(TIER_1_RAM_GB - 1, 0).cache_limit_mib, CACHE_MIB_TIER_1);
    }
}
