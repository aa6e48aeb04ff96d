//! Unaccounted-memory residual tracking and the leak heuristics built on it.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};

use crate::error::{Error, Result};
use crate::paths::PagePaths;

/// Meminfo fields the leak detector consumes, in kB as read from
/// `/proc/meminfo`.
const ACCOUNTED_FIELDS: &[&str] = &[
    "AnonPages",
    "Buffers",
    "Cached",
    "CmaTotal",
    "KReclaimable",
    "KernelStack",
    "PageTables",
    "SwapCached",
    "SUnreclaim",
    "SecPageTables",
    "Unevictable",
    "MemFree",
];

fn accounted_pages(meminfo: &HashMap<String, u64>, huge_pages: u64, page_size_kb: u64) -> i64 {
    let kb_sum: u64 = ACCOUNTED_FIELDS
        .iter()
        .map(|f| meminfo.get(*f).copied().unwrap_or(0))
        .sum();
    (kb_sum / page_size_kb) as i64 + huge_pages as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeakAlert {
    None,
    SuddenLeak,
    SlowLeak,
}

#[derive(Debug, Clone)]
pub struct LeakReport {
    pub alert: LeakAlert,
    pub unacct: i64,
    /// Fields whose value changed by more than 10% since the previous
    /// alert sample, `(field, previous_kb, current_kb)`. Empty unless
    /// `alert != LeakAlert::None`.
    pub diff: Vec<(String, u64, u64)>,
    pub unmapped_pages: Option<u64>,
}

#[derive(Debug)]
pub struct LeakDetector {
    base_mem: Option<i64>,
    prev_unacct: Option<i64>,
    prev_meminfo: Option<HashMap<String, u64>>,
    growth_count: u32,
}

impl LeakDetector {
    pub fn new() -> Self {
        Self {
            base_mem: None,
            prev_unacct: None,
            prev_meminfo: None,
            growth_count: 0,
        }
    }

    pub fn base_mem(&self) -> Option<i64> {
        self.base_mem
    }

    /// Feed one tick's meminfo sample and classify the outcome. `huge_pages`
    /// is the base-page-unit huge-page total for this tick.
    pub fn update(
        &mut self,
        total_managed: i64,
        meminfo: &HashMap<String, u64>,
        huge_pages: u64,
        page_size_kb: u64,
    ) -> LeakReport {
        let acct = accounted_pages(meminfo, huge_pages, page_size_kb);
        let raw_residual = total_managed - acct;

        let Some(base) = self.base_mem else {
            self.base_mem = Some(raw_residual);
            self.prev_meminfo = Some(meminfo.clone());
            return LeakReport {
                alert: LeakAlert::None,
                unacct: 0,
                diff: Vec::new(),
                unmapped_pages: None,
            };
        };

        if raw_residual < base {
            // The residual shrank below the established baseline: ratchet
            // the baseline down and skip detection for this tick.
            self.base_mem = Some(raw_residual);
            self.prev_unacct = Some(0);
            return LeakReport {
                alert: LeakAlert::None,
                unacct: 0,
                diff: Vec::new(),
                unmapped_pages: None,
            };
        }

        let unacct = raw_residual - base;
        let prev = self.prev_unacct.unwrap_or(unacct);

        let mut alert = LeakAlert::None;
        if prev > 0 && unacct > 2 * prev && self.growth_count > 3 {
            alert = LeakAlert::SuddenLeak;
        } else if prev > 0 && unacct * 10 > prev * 11 {
            self.growth_count += 1;
        } else if prev > 0 && unacct * 10 < prev * 9 {
            self.growth_count = 0;
        }

        if self.growth_count >= 10 {
            alert = LeakAlert::SlowLeak;
            self.growth_count = 0;
        }

        self.prev_unacct = Some(unacct);

        let diff = if alert != LeakAlert::None {
            let d = diff_meminfo(self.prev_meminfo.as_ref(), meminfo);
            self.prev_meminfo = Some(meminfo.clone());
            d
        } else {
            Vec::new()
        };

        LeakReport {
            alert,
            unacct,
            diff,
            unmapped_pages: None,
        }
    }
}

impl Default for LeakDetector {
    fn default() -> Self {
        Self::new()
    }
}

fn diff_meminfo(
    prev: Option<&HashMap<String, u64>>,
    now: &HashMap<String, u64>,
) -> Vec<(String, u64, u64)> {
    let Some(prev) = prev else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for (key, &new_val) in now {
        let old_val = prev.get(key).copied().unwrap_or(0);
        if old_val == 0 {
            continue;
        }
        let delta = new_val.abs_diff(old_val);
        if delta * 10 > old_val {
            out.push((key.clone(), old_val, new_val));
        }
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}

// Kernel /proc/kpageflags bit numbers (Documentation/admin-guide/mm/pagemap.rst).
const KPF_SLAB: u64 = 1 << 7;
const KPF_BUDDY: u64 = 1 << 10;
const KPF_HUGE: u64 = 1 << 17;
const KPF_HWPOISON: u64 = 1 << 19;
const KPF_NOPAGE: u64 = 1 << 20;
const KPF_OFFLINE: u64 = 1 << 23;
const KPF_PGTABLE: u64 = 1 << 26;

const KPF_EXCLUDE: u64 = KPF_SLAB | KPF_BUDDY | KPF_HWPOISON | KPF_NOPAGE | KPF_OFFLINE | KPF_PGTABLE;

/// Diagnostic-only count of pages with zero mapcount that are not huge,
/// reserved, or otherwise excluded. Never feeds the trigger rules above.
pub fn unmapped_pages(paths: &dyn PagePaths) -> Result<u64> {
    let count_path = paths.kpagecount();
    let flags_path = paths.kpageflags();

    let mut count_reader =
        BufReader::new(File::open(&count_path).map_err(|e| Error::io(path_str(&count_path), e))?);
    let mut flags_reader =
        BufReader::new(File::open(&flags_path).map_err(|e| Error::io(path_str(&flags_path), e))?);

    let mut unmapped = 0u64;
    let mut count_buf = [0u8; 8];
    let mut flags_buf = [0u8; 8];

    loop {
        let count_read = read_exact_or_eof(&mut count_reader, &mut count_buf)
            .map_err(|e| Error::io(path_str(&count_path), e))?;
        let flags_read = read_exact_or_eof(&mut flags_reader, &mut flags_buf)
            .map_err(|e| Error::io(path_str(&flags_path), e))?;
        if !count_read || !flags_read {
            break;
        }

        let mapcount = u64::from_le_bytes(count_buf);
        let flags = u64::from_le_bytes(flags_buf);

        if flags & KPF_EXCLUDE != 0 {
            continue;
        }
        if flags & KPF_HUGE != 0 {
            continue;
        }
        if mapcount == 0 {
            unmapped += 1;
        }
    }

    Ok(unmapped)
}

fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8; 8]) -> std::io::Result<bool> {
    let mut filled = 0;
    while filled < 8 {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return if filled == 0 {
                    Ok(false)
                } else {
                    Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof))
                };
            }
            Ok(n) => filled += n,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

fn path_str(p: &std::path::Path) -> String {
    p.to_string_lossy().into_owned()
}
