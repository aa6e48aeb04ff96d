//! Tunables, the `KEY=VALUE` config-file grammar, and the CLI-overlay merge.
//!
//! Reading the config file from its two conventional paths is a process
//! concern (it touches real files and belongs to the binary crate); this
//! module only parses file content already in hand and merges it with CLI
//! overrides, so it stays testable without any filesystem access.

use crate::snapshot::MAX_ORDER;

pub const SHORT_PERIODICITY_MS: i64 = 5_000;
pub const MEDIUM_PERIODICITY_MS: i64 = 10_000;
pub const LONG_PERIODICITY_MS: i64 = 30_000;

/// `(max_wsf, max_compaction_order, periodicity_ms)` for one aggressiveness
/// level.
pub fn aggressiveness_triple(level: u8) -> (i64, usize, i64) {
    match level {
        1 => (400, MAX_ORDER - 6, LONG_PERIODICITY_MS),
        3 => (1000, MAX_ORDER - 2, SHORT_PERIODICITY_MS),
        _ => (700, MAX_ORDER - 4, MEDIUM_PERIODICITY_MS),
    }
}

/// Values parsed out of the `KEY=VALUE` config file. Every field is
/// optional: an absent key simply leaves the corresponding [`Config`]
/// default (or CLI override) in place.
#[derive(Debug, Clone, Default)]
pub struct ConfigFileValues {
    pub verbose: Option<u8>,
    pub aggressiveness: Option<u8>,
    pub maxgap_gb: Option<f64>,
    pub enable_free_page_mgmt: Option<bool>,
    pub enable_neg_dentry_mgmt: Option<bool>,
    pub enable_memleak_check: Option<bool>,
    pub neg_dentry_cap: Option<i64>,
}

fn parse_bool_flag(v: &str) -> Option<bool> {
    match v {
        "0" => Some(false),
        "1" => Some(true),
        _ => None,
    }
}

/// Parses `KEY=VALUE` lines, skipping blank and `#`-prefixed lines.
/// An unknown key aborts parsing of the remaining file (values parsed so
/// far are kept) and the second return value carries a warning message for
/// the caller to log; this mirrors the original daemon's "stop at first bad
/// token" behavior.
pub fn parse_config_file(content: &str) -> (ConfigFileValues, Option<String>) {
    let mut values = ConfigFileValues::default();

    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some((key, val)) = trimmed.split_once('=') else {
            return (
                values,
                Some(format!("malformed config line, ignoring rest of file: {trimmed}")),
            );
        };
        let key = key.trim();
        let val = val.trim();

        match key {
            "VERBOSE" => values.verbose = val.parse().ok(),
            "AGGRESSIVENESS" => values.aggressiveness = val.parse().ok(),
            "MAXGAP" => values.maxgap_gb = val.parse().ok(),
            "ENABLE_FREE_PAGE_MGMT" => values.enable_free_page_mgmt = parse_bool_flag(val),
            "ENABLE_NEG_DENTRY_MGMT" => values.enable_neg_dentry_mgmt = parse_bool_flag(val),
            "ENABLE_MEMLEAK_CHECK" => values.enable_memleak_check = parse_bool_flag(val),
            "NEG_DENTRY_CAP" => values.neg_dentry_cap = val.parse().ok(),
            other => {
                return (
                    values,
                    Some(format!("unknown config key '{other}', aborting remaining file")),
                );
            }
        }
    }

    (values, None)
}

/// CLI-side overrides, already parsed by the binary crate's `clap` struct.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    /// `-d`
    pub debug: bool,
    /// Count of `-v` flags.
    pub verbose_bumps: u8,
    /// `-s`
    pub dry_run_script_mode: bool,
    /// `-m <GB>`
    pub max_gap_gb: Option<f64>,
    /// `-a <1|2|3>`
    pub aggressiveness: Option<u8>,
}

/// Fully resolved tunables for one daemon run.
#[derive(Debug, Clone)]
pub struct Config {
    pub max_order: usize,
    pub lookback: usize,
    pub max_nodes: u32,
    pub aggressiveness: u8,
    pub max_wsf: i64,
    pub max_compaction_order: usize,
    pub periodicity_ms: i64,
    pub skip_dma_zone: bool,
    pub neg_dentry_pct: i64,
    pub verbose: u8,
    pub dry_run: bool,
    pub debug_mode: bool,
    /// Operator-pinned watermark gap, in GB. When set, the daemon skips
    /// recomputing `max_wsf` from the reclaimable share each tick.
    pub max_gap_gb: Option<f64>,
    pub enable_free_page_mgmt: bool,
    pub enable_neg_dentry_mgmt: bool,
    pub enable_memleak_check: bool,
}

impl Config {
    pub fn from_sources(file: ConfigFileValues, cli: CliOverrides) -> Self {
        let aggressiveness = cli.aggressiveness.or(file.aggressiveness).unwrap_or(2);
        let (max_wsf, max_compaction_order, periodicity_ms) = aggressiveness_triple(aggressiveness);

        let mut verbose = file.verbose.unwrap_or(0).saturating_add(cli.verbose_bumps);
        let mut debug_mode = cli.debug;
        let mut dry_run = false;

        if cli.dry_run_script_mode {
            verbose = verbose.max(2);
            debug_mode = true;
            dry_run = true;
        }
        verbose = verbose.min(5);

        let max_gap_gb = cli.max_gap_gb.or(file.maxgap_gb);
        let neg_dentry_pct = file.neg_dentry_cap.unwrap_or(15).clamp(1, 100);

        Config {
            max_order: MAX_ORDER,
            lookback: 8,
            max_nodes: 1024,
            aggressiveness,
            max_wsf,
            max_compaction_order,
            periodicity_ms,
            skip_dma_zone: true,
            neg_dentry_pct,
            verbose,
            dry_run,
            debug_mode,
            max_gap_gb,
            enable_free_page_mgmt: file.enable_free_page_mgmt.unwrap_or(true),
            enable_neg_dentry_mgmt: file.enable_neg_dentry_mgmt.unwrap_or(true),
            enable_memleak_check: file.enable_memleak_check.unwrap_or(true),
        }
    }

    /// `max_wsf` derived from a `-m`/`MAXGAP` pin, in `max_wsf` units, given
    /// the running kernel's page size and the node's total managed pages.
    pub fn max_gap_to_wsf(max_gap_gb: f64, total_managed_pages: u64, page_size_bytes: u64) -> i64 {
        if total_managed_pages == 0 || page_size_bytes == 0 {
            return 0;
        }
        let bytes = max_gap_gb * 10_000.0 * (1u64 << 30) as f64;
        (bytes / (total_managed_pages as f64 * page_size_bytes as f64)) as i64
    }
}
