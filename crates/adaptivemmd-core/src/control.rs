//! Sequences the sampler, predictor, rate tracker, actuator, neg-dentry
//! sizer and leak detector once per tick, and owns all per-node state.

use std::collections::HashMap;
use std::fs;
use std::fs::OpenOptions;

use crate::actuator::{self, ActuationOutcome, WatermarkInputs};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::leak::{LeakAlert, LeakDetector, LeakReport};
use crate::negdentry;
use crate::paths::PagePaths;
use crate::predict::{self, PredictContext, Signal};
use crate::regression::LsqWindow;
use crate::sampler::Sampler;
use crate::snapshot::{NodeSnapshot, MAX_ORDER};

struct NodeState {
    windows: Vec<LsqWindow>,
    rate_tracker: crate::rates::RateTracker,
    compaction_requested: bool,
    last_snapshot: Option<NodeSnapshot>,
}

impl NodeState {
    fn new(lookback: usize) -> Self {
        Self {
            windows: (0..MAX_ORDER).map(|_| LsqWindow::new(lookback)).collect(),
            rate_tracker: crate::rates::RateTracker::new(),
            compaction_requested: false,
            last_snapshot: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeTickReport {
    pub node: u32,
    pub signal: Signal,
    pub compaction_written: bool,
}

#[derive(Debug, Clone)]
pub struct TickReport {
    pub nodes: Vec<NodeTickReport>,
    pub watermark_outcome: ActuationOutcome,
    pub neg_dentry: Option<i64>,
    pub leak: LeakReport,
}

pub struct Daemon<P: PagePaths> {
    paths: P,
    config: Config,
    sampler: Sampler,
    nodes: HashMap<u32, NodeState>,
    leak_detector: LeakDetector,
    neg_dentry_initialized: bool,
    page_size_bytes: u64,
}

impl<P: PagePaths> Daemon<P> {
    pub fn new(paths: P, config: Config) -> Result<Self> {
        let page_size_bytes = unsafe { libc::getpagesize() } as u64;
        let page_size_kb = (page_size_bytes / 1024).max(1);

        let daemon = Self {
            paths,
            config,
            sampler: Sampler::new(page_size_kb),
            nodes: HashMap::new(),
            leak_detector: LeakDetector::new(),
            neg_dentry_initialized: false,
            page_size_bytes,
        };
        daemon.verify_watermark_tunable()?;
        Ok(daemon)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Startup check: the watermark tunable must exist and be writable.
    /// Fatal otherwise (§4.7/§7).
    fn verify_watermark_tunable(&self) -> Result<()> {
        let path = self.paths.watermark_scale_factor();
        fs::metadata(&path)
            .map_err(|e| Error::Fatal(format!("watermark tunable {} unreadable: {e}", path.display())))?;
        OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(|e| Error::Fatal(format!("watermark tunable {} not writable: {e}", path.display())))?;
        Ok(())
    }

    fn read_current_wsf(&self) -> Result<i64> {
        let path = self.paths.watermark_scale_factor();
        let content = fs::read_to_string(&path)
            .map_err(|e| Error::io(path.to_string_lossy().into_owned(), e))?;
        content
            .trim()
            .parse::<i64>()
            .map_err(|_| Error::parse(path.to_string_lossy().into_owned(), "not an integer".to_string()))
    }

    /// Runs exactly one control-loop tick (§4.7, steps 1-7; sleeping
    /// between ticks is the caller's responsibility). `now_ms` is the
    /// current monotonic timestamp used as the regression `t` axis.
    pub fn run_once(&mut self, now_ms: i64) -> Result<TickReport> {
        let buddy_path = self.paths.buddyinfo();
        let buddy_content = fs::read_to_string(&buddy_path)
            .map_err(|e| Error::io(buddy_path.to_string_lossy().into_owned(), e))?;
        let nr_free_by_node = self
            .sampler
            .parse_buddyinfo(&buddy_content, self.config.skip_dma_zone)?;

        let zone_path = self.paths.zoneinfo();
        let zone_content = fs::read_to_string(&zone_path)
            .map_err(|e| Error::io(zone_path.to_string_lossy().into_owned(), e))?;
        let watermarks_by_node = self
            .sampler
            .parse_zoneinfo(&zone_content, self.config.skip_dma_zone)?;

        let (total_huge_pages, huge_delta_pct) = self.sampler.read_hugepages(&self.paths)?;

        for &node_id in nr_free_by_node.keys() {
            if node_id >= self.config.max_nodes {
                return Err(Error::parse(
                    buddy_path.to_string_lossy().into_owned(),
                    format!("node id {node_id} exceeds max_nodes"),
                ));
            }
            self.nodes
                .entry(node_id)
                .or_insert_with(|| NodeState::new(self.config.lookback));
        }

        for (&node_id, state) in self.nodes.iter_mut() {
            if let (Some(nr_free), Some(wm)) =
                (nr_free_by_node.get(&node_id), watermarks_by_node.get(&node_id))
            {
                let snap = Sampler::build_node_snapshot(wm, nr_free, now_ms);
                state.last_snapshot = Some(snap);
            }
            // else: retain the previous snapshot, per the parse-transient policy.
        }

        let vmstat_path = self.paths.vmstat();
        let vmstat_content = fs::read_to_string(&vmstat_path)
            .map_err(|e| Error::io(vmstat_path.to_string_lossy().into_owned(), e))?;
        let vmstat = self.sampler.parse_vmstat(&vmstat_content)?;

        let meminfo_path = self.paths.meminfo();
        let meminfo_content = fs::read_to_string(&meminfo_path)
            .map_err(|e| Error::io(meminfo_path.to_string_lossy().into_owned(), e))?;
        let meminfo = self.sampler.parse_meminfo(&meminfo_content)?;

        let total_managed: i64 = self
            .nodes
            .values()
            .filter_map(|s| s.last_snapshot.as_ref())
            .map(|s| s.managed_pages as i64)
            .sum();
        let total_reclaimable = (total_managed - total_huge_pages as i64).max(0);

        let mut neg_dentry_written = None;
        let hugepage_delta_crossed = huge_delta_pct.map(|d| d.abs() >= 5.0).unwrap_or(false);
        if self.config.enable_neg_dentry_mgmt && (!self.neg_dentry_initialized || hugepage_delta_crossed)
        {
            neg_dentry_written = negdentry::apply(
                &self.paths,
                self.config.neg_dentry_pct,
                total_reclaimable,
                total_managed,
                self.config.dry_run,
            )?;
            self.neg_dentry_initialized = true;
        }

        let effective_max_wsf = match self.config.max_gap_gb {
            Some(gap_gb) => {
                Config::max_gap_to_wsf(gap_gb, total_managed.max(0) as u64, self.page_size_bytes)
            }
            None => actuator::effective_max_wsf(self.config.max_wsf, total_reclaimable, total_managed),
        };

        let mut node_reports = Vec::with_capacity(self.nodes.len());
        let mut union_signal = Signal::empty();
        let mut total_free_pages: i64 = 0;
        let mut total_min: i64 = 0;
        let mut total_low: i64 = 0;
        let mut total_high: i64 = 0;

        let mut node_ids: Vec<u32> = self.nodes.keys().copied().collect();
        node_ids.sort_unstable();

        for node_id in node_ids {
            let state = self.nodes.get_mut(&node_id).expect("present");
            let Some(snap) = state.last_snapshot.clone() else {
                continue;
            };

            let mut fits = vec![None; MAX_ORDER];
            for order in 0..MAX_ORDER {
                let y = snap.frag[order].free_pages as i64;
                fits[order] = state.windows[order].insert(now_ms, y);
            }
            let current_time = (now_ms - state.windows[0].origin()).max(0);
            let frag_free: Vec<u64> = snap.frag.iter().map(|f| f.free_pages).collect();

            let ctx = PredictContext {
                fits: &fits,
                frag_free: &frag_free,
                free: snap.frag[0].free_pages,
                high_wmark: snap.high_wmark,
                reclaim_rate: state.rate_tracker.reclaim_rate(),
                compaction_rate: state.rate_tracker.compaction_rate(),
                max_compaction_order: self.config.max_compaction_order,
                lookback: self.config.lookback,
                periodicity_ms: self.config.periodicity_ms,
                current_time,
            };
            let signal = predict::predict(&ctx);
            union_signal |= signal;

            state
                .rate_tracker
                .update(snap.frag[MAX_ORDER - 1].free_pages, vmstat.reclaimed, now_ms);

            let mut compaction_written = false;
            if self.config.enable_free_page_mgmt
                && actuator::should_request_compaction(signal, state.compaction_requested)
            {
                if !self.config.dry_run {
                    let compact_path = self.paths.compact_path(node_id);
                    fs::write(&compact_path, "1")
                        .map_err(|e| Error::io(compact_path.to_string_lossy().into_owned(), e))?;
                }
                compaction_written = true;
                state.compaction_requested = true;
            } else {
                state.compaction_requested = false;
            }

            total_free_pages += snap.frag[0].free_pages as i64;
            total_min += snap.min_wmark as i64;
            total_low += snap.low_wmark as i64;
            total_high += snap.high_wmark as i64;

            node_reports.push(NodeTickReport {
                node: node_id,
                signal,
                compaction_written,
            });
        }

        let watermark_outcome = if self.config.enable_free_page_mgmt {
            let wsf = self.read_current_wsf()?;
            let inputs = WatermarkInputs {
                wsf,
                min_wmark: total_min,
                low_wmark: total_low,
                high_wmark: total_high,
                total_free: total_free_pages,
                total_cache: vmstat.cache_pages as i64,
                total_reclaimable,
                max_wsf: effective_max_wsf,
                signal: union_signal,
            };
            let outcome = actuator::compute_watermark_candidate(&inputs);
            if let ActuationOutcome::Written(candidate) = outcome {
                if !self.config.dry_run {
                    let wsf_path = self.paths.watermark_scale_factor();
                    fs::write(&wsf_path, candidate.to_string())
                        .map_err(|e| Error::io(wsf_path.to_string_lossy().into_owned(), e))?;
                }
            }
            outcome
        } else {
            ActuationOutcome::Skipped
        };

        let mut leak = if self.config.enable_memleak_check {
            self.leak_detector.update(
                total_managed,
                &meminfo,
                total_huge_pages,
                self.sampler.page_size_kb(),
            )
        } else {
            LeakReport {
                alert: LeakAlert::None,
                unacct: 0,
                diff: Vec::new(),
                unmapped_pages: None,
            }
        };

        if leak.alert != LeakAlert::None {
            match crate::leak::unmapped_pages(&self.paths) {
                Ok(n) => leak.unmapped_pages = Some(n),
                Err(e) => log::warn!("failed to sample unmapped pages: {e}"),
            }
        }

        Ok(TickReport {
            nodes: node_reports,
            watermark_outcome,
            neg_dentry: neg_dentry_written,
            leak,
        })
    }
}
