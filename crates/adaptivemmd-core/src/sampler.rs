//! Parses kernel pseudo-files into structured per-tick snapshots.

use std::collections::HashMap;
use std::fs;

use crate::error::{Error, Result};
use crate::paths::PagePaths;
use crate::snapshot::{FragEntry, NodeSnapshot, MAX_ORDER};

/// Raw per-node buddy-allocator order counts, summed across zones.
pub type NodeFreeByOrder = HashMap<u32, [u64; MAX_ORDER]>;

#[derive(Debug, Clone, Copy, Default)]
pub struct ZoneWatermarks {
    pub managed_pages: u64,
    pub min_wmark: u64,
    pub low_wmark: u64,
    pub high_wmark: u64,
}

pub type NodeWatermarks = HashMap<u32, ZoneWatermarks>;

#[derive(Debug, Clone, Copy, Default)]
pub struct VmstatCounters {
    pub reclaimed: u64,
    pub cache_pages: u64,
}

/// Reads the six input pseudo-files and assembles per-node snapshots plus
/// global aggregates. Generic over [`PagePaths`] so tests can point it at a
/// fixture directory tree instead of `/proc` and `/sys`.
pub struct Sampler {
    page_size_kb: u64,
    prev_total_huge_pages: Option<u64>,
}

impl Sampler {
    pub fn new(page_size_kb: u64) -> Self {
        Self {
            page_size_kb,
            prev_total_huge_pages: None,
        }
    }

    pub fn page_size_kb(&self) -> u64 {
        self.page_size_kb
    }

    /// A parse failure on one node's line drops only that node from the
    /// returned map (logged, not propagated) so the caller can retain that
    /// node's previous snapshot for this tick, per the parse-transient
    /// policy in §7.
    pub fn parse_buddyinfo(&self, content: &str, skip_dma_zone: bool) -> Result<NodeFreeByOrder> {
        let mut nodes: NodeFreeByOrder = HashMap::new();
        let mut poisoned: Vec<u32> = Vec::new();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() < 4 + MAX_ORDER || tokens[0] != "Node" || tokens[2] != "zone" {
                log::warn!("malformed buddyinfo line, skipping: {line}");
                continue;
            }
            let Ok(node_id) = tokens[1].trim_end_matches(',').parse::<u32>() else {
                log::warn!("malformed buddyinfo node id, skipping: {line}");
                continue;
            };
            let zone_name = tokens[3];
            if skip_dma_zone && zone_name == "DMA" {
                continue;
            }

            let mut order_values = [0u64; MAX_ORDER];
            let mut ok = true;
            for (order, tok) in tokens[4..4 + MAX_ORDER].iter().enumerate() {
                match tok.parse::<u64>() {
                    Ok(v) => order_values[order] = v,
                    Err(_) => {
                        log::warn!("malformed buddyinfo count for node {node_id}, skipping: {line}");
                        ok = false;
                        break;
                    }
                }
            }
            if !ok {
                poisoned.push(node_id);
                continue;
            }

            let entry = nodes.entry(node_id).or_insert([0u64; MAX_ORDER]);
            for (order, v) in order_values.iter().enumerate() {
                entry[order] += v;
            }
        }

        for node_id in poisoned {
            nodes.remove(&node_id);
        }

        Ok(nodes)
    }

    pub fn parse_zoneinfo(&self, content: &str, skip_dma_zone: bool) -> Result<NodeWatermarks> {
        let mut nodes: NodeWatermarks = HashMap::new();
        let mut current_node: Option<u32> = None;
        let mut skip_zone = false;

        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.starts_with("Node") {
                let tokens: Vec<&str> = trimmed.split_whitespace().collect();
                if tokens.len() < 4 || tokens[2] != "zone" {
                    return Err(Error::parse("zoneinfo", format!("malformed header: {trimmed}")));
                }
                let node_id: u32 = tokens[1]
                    .trim_end_matches(',')
                    .parse()
                    .map_err(|_| Error::parse("zoneinfo", format!("bad node id: {trimmed}")))?;
                current_node = Some(node_id);
                skip_zone = skip_dma_zone && tokens[3] == "DMA";
                nodes.entry(node_id).or_default();
                continue;
            }

            let (Some(node_id), false) = (current_node, skip_zone) else {
                continue;
            };

            let mut parts = trimmed.split_whitespace();
            let Some(key) = parts.next() else { continue };
            let Some(value_tok) = parts.next() else { continue };
            let Ok(value) = value_tok.parse::<u64>() else {
                continue;
            };
            let entry = nodes.entry(node_id).or_default();
            match key {
                "min" => entry.min_wmark += value,
                "low" => entry.low_wmark += value,
                "high" => entry.high_wmark += value,
                "managed" => entry.managed_pages += value,
                _ => {}
            }
        }

        Ok(nodes)
    }

    pub fn parse_vmstat(&self, content: &str) -> Result<VmstatCounters> {
        let mut counters = VmstatCounters::default();
        for line in content.lines() {
            let mut parts = line.split_whitespace();
            let Some(key) = parts.next() else { continue };
            let Some(value_tok) = parts.next() else { continue };
            let Ok(value) = value_tok.parse::<u64>() else {
                continue;
            };
            if key.starts_with("pgsteal_kswapd") {
                counters.reclaimed += value;
            } else if key == "nr_inactive_file" || key == "nr_inactive_anon" {
                counters.cache_pages += value;
            }
        }
        Ok(counters)
    }

    pub fn parse_meminfo(&self, content: &str) -> Result<HashMap<String, u64>> {
        let mut fields = HashMap::new();
        for line in content.lines() {
            let Some((key, rest)) = line.split_once(':') else {
                continue;
            };
            let value_tok = rest.split_whitespace().next().unwrap_or("0");
            let Ok(value) = value_tok.parse::<u64>() else {
                continue;
            };
            fields.insert(key.trim().to_string(), value);
        }
        Ok(fields)
    }

    /// Reads every `hugepages-<sizekB>kB` subdirectory and returns the
    /// total huge-page count in base-page units, plus the percentage delta
    /// versus the previous call (`None` on the first call).
    pub fn read_hugepages(&mut self, paths: &dyn PagePaths) -> Result<(u64, Option<f64>)> {
        let dir = paths.hugepages_dir();
        let mut total_base_pages = 0u64;

        if dir.is_dir() {
            for entry in
                fs::read_dir(&dir).map_err(|e| Error::io(dir.to_string_lossy().into_owned(), e))?
            {
                let entry = entry.map_err(|e| Error::io(dir.to_string_lossy().into_owned(), e))?;
                let name = entry.file_name();
                let name = name.to_string_lossy();
                let Some(size_kb) = parse_hugepage_size_kb(&name) else {
                    continue;
                };
                let nr_path = entry.path().join("nr_hugepages");
                let Ok(raw) = fs::read_to_string(&nr_path) else {
                    continue;
                };
                let Ok(nr_hugepages) = raw.trim().parse::<u64>() else {
                    continue;
                };
                total_base_pages += nr_hugepages * (size_kb / self.page_size_kb);
            }
        }

        let delta = self.prev_total_huge_pages.map(|prev| {
            if prev == 0 {
                if total_base_pages == 0 {
                    0.0
                } else {
                    100.0
                }
            } else {
                ((total_base_pages as f64 - prev as f64) / prev as f64) * 100.0
            }
        });
        self.prev_total_huge_pages = Some(total_base_pages);

        Ok((total_base_pages, delta))
    }

    /// Builds each node's fragmentation vector from its raw per-order free
    /// counts: `frag[0]` is total free pages in the node; `frag[k]` for
    /// `k > 0` is the cumulative pages locked below order `k`.
    pub fn build_frag_vector(nr_free: &[u64; MAX_ORDER], msecs: i64) -> Vec<FragEntry> {
        let total: u64 = nr_free
            .iter()
            .enumerate()
            .map(|(order, &n)| n * (1u64 << order))
            .sum();

        let mut frag = Vec::with_capacity(MAX_ORDER);
        frag.push(FragEntry {
            free_pages: total,
            msecs,
        });

        let mut cumulative = 0u64;
        for order in 1..MAX_ORDER {
            cumulative += nr_free[order - 1] * (1u64 << (order - 1));
            frag.push(FragEntry {
                free_pages: cumulative,
                msecs,
            });
        }

        frag
    }

    pub fn build_node_snapshot(
        watermarks: &ZoneWatermarks,
        nr_free: &[u64; MAX_ORDER],
        msecs: i64,
    ) -> NodeSnapshot {
        let mut snap = NodeSnapshot::new(
            watermarks.managed_pages,
            watermarks.min_wmark,
            watermarks.low_wmark,
            watermarks.high_wmark,
        );
        snap.frag = Self::build_frag_vector(nr_free, msecs);
        snap
    }
}

fn parse_hugepage_size_kb(dir_name: &str) -> Option<u64> {
    let rest = dir_name.strip_prefix("hugepages-")?;
    let rest = rest.strip_suffix("kB")?;
    rest.parse().ok()
}
