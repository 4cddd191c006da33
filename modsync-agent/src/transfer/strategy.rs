//! Transfer strategy selection.
//!
//! Two decisions live here and nowhere else:
//! - which [`StrategyProfile`] a pass runs with (chosen once, from a
//!   connection-quality classification and the size distribution of the files
//!   to fetch, or from a manual preset), and
//! - which [`TransferMode`] a single file is fetched with (chosen per file from
//!   its size and, for very large files, the server's Range support).
//!
//! The tuning table is policy; the transporter and the worker pools only ever
//! consume the resulting typed profile.

use serde::{Deserialize, Serialize};
use std::time::Duration;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * 1024;

/// Files below this size are fetched with a single plain GET.
pub const SIMPLE_LIMIT: u64 = MIB;

/// Files below this size (and at least [`SIMPLE_LIMIT`]) use the resumable path.
pub const RESUMABLE_LIMIT: u64 = 50 * MIB;

/// Byte span each parallel range worker is sized for.
pub const RANGE_PART_SPAN: u64 = 50 * MIB;

const MIN_RANGE_PARTS: usize = 2;

const MAX_WORKERS: usize = 20;
const HUGE_TIER_WORKERS: usize = 1;
const MIN_CHUNK_SIZE: usize = 4 * 1024;
const MAX_CHUNK_SIZE: usize = 4 * 1024 * 1024;
const MAX_RETRIES: u32 = 15;
const MIN_TIMEOUT_SECS: u64 = 5;
const MAX_TIMEOUT_SECS: u64 = 300;

/// Connection quality bucket derived from measured throughput.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionQuality {
    VerySlow,
    Slow,
    Medium,
    Fast,
    VeryFast,
}

impl ConnectionQuality {
    /// Classify an average throughput in megabits per second.
    pub fn from_mbps(mbps: f64) -> Self {
        if mbps < 0.5 {
            ConnectionQuality::VerySlow
        } else if mbps < 2.0 {
            ConnectionQuality::Slow
        } else if mbps < 10.0 {
            ConnectionQuality::Medium
        } else if mbps < 50.0 {
            ConnectionQuality::Fast
        } else {
            ConnectionQuality::VeryFast
        }
    }
}

/// How the pass profile is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyMode {
    /// Pick from connection quality and file distribution.
    #[default]
    Auto,
    StableSequential,
    BalancedAdaptive,
    FastOptimized,
    /// Use the raw values from the `[sync]` config section.
    Custom,
}

/// Size bucket used to give each class of file its own worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeTier {
    /// < 100 KiB
    Tiny,
    /// 100 KiB – 1 MiB
    Small,
    /// 1 – 10 MiB
    Medium,
    /// >= 10 MiB
    Huge,
}

impl SizeTier {
    pub const ALL: [SizeTier; 4] =
        [SizeTier::Tiny, SizeTier::Small, SizeTier::Medium, SizeTier::Huge];

    pub fn of(size: u64) -> Self {
        match size {
            s if s < 100 * KIB => SizeTier::Tiny,
            s if s < MIB => SizeTier::Small,
            s if s < 10 * MIB => SizeTier::Medium,
            _ => SizeTier::Huge,
        }
    }
}

/// Worker pool size per tier. Huge files always go one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierWorkers {
    pub tiny: usize,
    pub small: usize,
    pub medium: usize,
    pub huge: usize,
}

impl TierWorkers {
    fn uniform(n: usize) -> Self {
        Self { tiny: n, small: n, medium: n, huge: HUGE_TIER_WORKERS }
    }

    pub fn for_tier(&self, tier: SizeTier) -> usize {
        match tier {
            SizeTier::Tiny => self.tiny,
            SizeTier::Small => self.small,
            SizeTier::Medium => self.medium,
            SizeTier::Huge => self.huge,
        }
    }
}

/// Share of tiny and huge files among the files a pass has to fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FileDistribution {
    pub total_files: usize,
    /// Percentage (0-100) of files below 100 KiB
    pub tiny_pct: f64,
    /// Percentage (0-100) of files of 10 MiB and more
    pub huge_pct: f64,
}

impl FileDistribution {
    pub fn from_sizes<I: IntoIterator<Item = u64>>(sizes: I) -> Self {
        let mut total = 0usize;
        let mut tiny = 0usize;
        let mut huge = 0usize;
        for size in sizes {
            total += 1;
            match SizeTier::of(size) {
                SizeTier::Tiny => tiny += 1,
                SizeTier::Huge => huge += 1,
                _ => {}
            }
        }
        if total == 0 {
            return Self::default();
        }
        Self {
            total_files: total,
            tiny_pct: tiny as f64 * 100.0 / total as f64,
            huge_pct: huge as f64 * 100.0 / total as f64,
        }
    }
}

/// Concurrency and robustness parameters for one sync pass. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyProfile {
    pub name: String,
    pub chunk_size: usize,
    pub max_concurrent_workers: usize,
    pub tier_workers: TierWorkers,
    pub retry_count: u32,
    pub retry_base_delay: Duration,
    pub timeout: Duration,
    pub resume_enabled: bool,
}

/// Raw, unvalidated profile values (from the table or from config).
#[derive(Debug, Clone, Copy)]
pub struct ProfileParams {
    pub chunk_size: usize,
    pub max_workers: usize,
    pub tier_workers: Option<TierWorkers>,
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub timeout_secs: u64,
    pub resume_enabled: bool,
}

impl StrategyProfile {
    /// Build a profile, clamping every value into its valid range.
    pub fn new(name: &str, p: ProfileParams) -> Self {
        let max_workers = p.max_workers.clamp(1, MAX_WORKERS);
        let tiers = p.tier_workers.unwrap_or_else(|| TierWorkers::uniform(max_workers));
        let clamp = |n: usize| n.clamp(1, MAX_WORKERS);
        Self {
            name: name.to_string(),
            chunk_size: p.chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE),
            max_concurrent_workers: max_workers,
            tier_workers: TierWorkers {
                tiny: clamp(tiers.tiny),
                small: clamp(tiers.small),
                medium: clamp(tiers.medium),
                huge: HUGE_TIER_WORKERS,
            },
            retry_count: p.retry_count.clamp(1, MAX_RETRIES),
            retry_base_delay: p.retry_delay,
            timeout: Duration::from_secs(p.timeout_secs.clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS)),
            resume_enabled: p.resume_enabled,
        }
    }

    /// The single policy function: quality + distribution (or a manual preset) -> profile.
    pub fn select(
        mode: StrategyMode,
        quality: ConnectionQuality,
        distribution: &FileDistribution,
        custom: ProfileParams,
    ) -> Self {
        match mode {
            StrategyMode::Auto => Self::auto(quality, distribution),
            StrategyMode::StableSequential => Self::stable_sequential(),
            StrategyMode::BalancedAdaptive => Self::new(
                "balanced_adaptive",
                params(32 * 1024, 6, Some(tiers(8, 4, 2, 1)), 5, 1, 45, true),
            ),
            StrategyMode::FastOptimized => Self::new(
                "fast_optimized",
                params(128 * 1024, 15, Some(tiers(20, 8, 4, 1)), 3, 1, 30, true),
            ),
            StrategyMode::Custom => Self::new("custom", custom),
        }
    }

    fn stable_sequential() -> Self {
        Self::new("stable_sequential", params(8 * 1024, 1, None, 15, 5, 120, true))
    }

    fn auto(quality: ConnectionQuality, dist: &FileDistribution) -> Self {
        match quality {
            ConnectionQuality::VerySlow => Self::stable_sequential(),
            ConnectionQuality::Slow => Self::new(
                "cautious_parallel",
                params(16 * 1024, 2, Some(tiers(2, 1, 1, 1)), 10, 2, 60, true),
            ),
            ConnectionQuality::Medium if dist.huge_pct > 5.0 => Self::new(
                "balanced_adaptive",
                params(32 * 1024, 4, Some(tiers(6, 3, 2, 1)), 5, 1, 45, true),
            ),
            ConnectionQuality::Medium => Self::new(
                "medium_optimized",
                params(64 * 1024, 6, Some(tiers(8, 4, 2, 1)), 3, 1, 30, true),
            ),
            ConnectionQuality::Fast if dist.tiny_pct > 70.0 => Self::new(
                "tiny_files_optimized",
                params(64 * 1024, 15, Some(tiers(20, 8, 3, 1)), 2, 1, 20, true),
            ),
            ConnectionQuality::Fast => Self::new(
                "fast_balanced",
                params(128 * 1024, 10, Some(tiers(12, 6, 3, 1)), 2, 1, 25, true),
            ),
            ConnectionQuality::VeryFast => Self::new(
                "max_performance",
                params(256 * 1024, 25, Some(tiers(30, 10, 5, 1)), 1, 1, 15, false),
            ),
        }
    }

    pub fn workers_for(&self, tier: SizeTier) -> usize {
        self.tier_workers.for_tier(tier)
    }
}

fn tiers(tiny: usize, small: usize, medium: usize, huge: usize) -> TierWorkers {
    TierWorkers { tiny, small, medium, huge }
}

fn params(
    chunk_size: usize,
    max_workers: usize,
    tier_workers: Option<TierWorkers>,
    retry_count: u32,
    retry_delay_secs: u64,
    timeout_secs: u64,
    resume_enabled: bool,
) -> ProfileParams {
    ProfileParams {
        chunk_size,
        max_workers,
        tier_workers,
        retry_count,
        retry_delay: Duration::from_secs(retry_delay_secs),
        timeout_secs,
        resume_enabled,
    }
}

/// How a single file is fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    /// One GET straight into a temp file; no resume.
    Simple,
    /// GET with `Range: bytes=k-` when a partial temp file survives.
    Resumable,
    /// N concurrent ranged GETs reassembled by offset.
    ParallelRanged,
}

/// Mode for a file of `size` bytes, given whether the server was found to
/// honor Range requests. `ranges_supported` is only consulted at or above
/// [`RESUMABLE_LIMIT`]; below it no probe is needed.
pub fn select_mode(size: u64, ranges_supported: impl FnOnce() -> bool) -> TransferMode {
    if size < SIMPLE_LIMIT {
        TransferMode::Simple
    } else if size < RESUMABLE_LIMIT {
        TransferMode::Resumable
    } else if ranges_supported() {
        TransferMode::ParallelRanged
    } else {
        TransferMode::Resumable
    }
}

/// Whether a file of this size needs a Range-support probe before mode selection.
pub fn needs_range_probe(size: u64) -> bool {
    size >= RESUMABLE_LIMIT
}

/// Number of contiguous ranges a parallel transfer splits into.
pub fn range_parts(size: u64, worker_cap: usize) -> usize {
    let by_size = (size / RANGE_PART_SPAN) as usize;
    by_size.min(worker_cap).max(MIN_RANGE_PARTS)
}

/// Inclusive byte ranges `(start, end)` covering `0..size` in order.
pub fn split_ranges(size: u64, parts: usize) -> Vec<(u64, u64)> {
    if size == 0 {
        return Vec::new();
    }
    let parts = (parts.max(1) as u64).min(size);
    let part_size = size / parts;
    (0..parts)
        .map(|i| {
            let start = i * part_size;
            let end = if i == parts - 1 { size - 1 } else { (i + 1) * part_size - 1 };
            (start, end)
        })
        .collect()
}
