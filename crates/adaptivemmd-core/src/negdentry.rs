//! Negative-dentry cap sizing.

use std::fs;

use crate::error::{Error, Result};
use crate::paths::PagePaths;

/// Computes the target cap, in thousandths of reclaimable memory, clamped
/// to `[1, 100]`.
pub fn compute_cap(neg_dentry_pct: i64, total_reclaimable: i64, total_managed: i64) -> i64 {
    if total_managed == 0 {
        return 1;
    }
    let val = neg_dentry_pct * total_reclaimable / total_managed;
    val.clamp(1, 100)
}

/// Writes the cap if the tunable file exists; returns `Ok(None)` if it
/// does not (the feature is unsupported on this kernel, not an error).
/// Under `dry_run` the cap is still computed and returned, but never
/// written.
pub fn apply(
    paths: &dyn PagePaths,
    neg_dentry_pct: i64,
    total_reclaimable: i64,
    total_managed: i64,
    dry_run: bool,
) -> Result<Option<i64>> {
    let path = paths.neg_dentry_limit();
    if !path.exists() {
        return Ok(None);
    }
    let cap = compute_cap(neg_dentry_pct, total_reclaimable, total_managed);
    if !dry_run {
        fs::write(&path, cap.to_string())
            .map_err(|e| Error::io(path.to_string_lossy().into_owned(), e))?;
    }
    Ok(Some(cap))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_is_clamped_low() {
        assert_eq!(compute_cap(15, 1, 1_000_000), 1);
    }

    #[test]
    fn cap_is_clamped_high() {
        assert_eq!(compute_cap(15, 1_000_000, 1_000_000), 15.min(100));
        assert_eq!(compute_cap(900, 1_000_000, 1_000_000), 100);
    }

    #[test]
    fn zero_managed_does_not_divide_by_zero() {
        assert_eq!(compute_cap(15, 0, 0), 1);
    }
}
