//! Process-wide knobs, read once from the environment.
use std::env;

use tracing::warn;

use sysdefs::constants::MAX_EXECUTABLE_MEMORY_SIZE_NEAR_CORECLR;

/// How `MapView` behaves when the OS refuses another native mapping of a
/// file region that is already mapped shared.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SharedMappingPolicy {
    /// Every view gets its own native mapping; exhaustion is an error.
    Independent,
    /// Reuse an existing shared mapping of the same file region, raising its
    /// protection if needed. Kept for platforms that allow only one native
    /// mapping per file region; raising the protection is visible through
    /// the sibling view.
    OnePerFileRegion,
}

#[derive(Clone, Debug)]
pub struct PalConfig {
    /// Keep mapped images away from their preferred base so relocations are
    /// exercised. Only honoured in debug builds.
    pub force_relocs: bool,
    /// Map images at their preferred base address instead of inside the
    /// executable reservation.
    pub use_default_base_addr: bool,
    /// Map read-only sections of over-aligned images shared instead of
    /// private.
    pub map_readonly_pe_huge_page_as_shared: bool,
    /// Upper bound in bytes of the executable sub-allocator's reservation.
    pub executable_reserve_limit: usize,
    /// Share of `RLIMIT_AS` the executable reservation may take, in percent.
    pub executable_reserve_percent: usize,
    pub initialize_executable_allocator: bool,
    pub randomize_executable_start: bool,
    pub shared_mapping_policy: SharedMappingPolicy,
}

impl Default for PalConfig {
    fn default() -> Self {
        PalConfig {
            force_relocs: false,
            use_default_base_addr: false,
            map_readonly_pe_huge_page_as_shared: false,
            executable_reserve_limit: MAX_EXECUTABLE_MEMORY_SIZE_NEAR_CORECLR,
            executable_reserve_percent: 25,
            initialize_executable_allocator: true,
            randomize_executable_start: true,
            shared_mapping_policy: SharedMappingPolicy::Independent,
        }
    }
}

impl PalConfig {
    pub fn from_env() -> Self {
        let mut config = PalConfig::default();

        if cfg!(debug_assertions) {
            config.force_relocs = env::var("PAL_ForceRelocs")
                .map(|v| !v.is_empty())
                .unwrap_or(false);
        }
        config.use_default_base_addr = env_flag("PAL_UseDefaultBaseAddr");
        config.map_readonly_pe_huge_page_as_shared =
            env_flag("PAL_MAP_READONLY_PE_HUGE_PAGE_AS_SHARED");

        if let Some(limit) = env_usize("PAL_ExecutableMemoryReserveLimit") {
            config.executable_reserve_limit = limit.min(MAX_EXECUTABLE_MEMORY_SIZE_NEAR_CORECLR);
        }
        if let Some(percent) = env_usize("PAL_ExecutableMemoryReservePercent") {
            if (1..=100).contains(&percent) {
                config.executable_reserve_percent = percent;
            } else {
                warn!("PAL_ExecutableMemoryReservePercent={} out of range, ignored", percent);
            }
        }
        config
    }

    /// A configuration without the executable sub-allocator.
    pub fn without_executable_allocator() -> Self {
        PalConfig {
            initialize_executable_allocator: false,
            ..PalConfig::default()
        }
    }
}

fn env_flag(name: &str) -> bool {
    matches!(env::var(name).as_deref(), Ok("1"))
}

/// Decimal or `0x`-prefixed hex.
pub(crate) fn parse_size(value: &str) -> Option<usize> {
    let value = value.trim();
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

fn env_usize(name: &str) -> Option<usize> {
    let value = env::var(name).ok()?;
    let parsed = parse_size(&value);
    if parsed.is_none() {
        warn!("ignoring malformed {}={:?}", name, value);
    }
    parsed
}
