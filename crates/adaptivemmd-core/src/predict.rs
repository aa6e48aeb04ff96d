//! Per-node exhaustion and fragmentation model built on top of the
//! per-order regression fits produced by [`crate::regression`].

use bitflags::bitflags;

use crate::regression::Fit;
use crate::snapshot::MAX_ORDER;

bitflags! {
    /// Recommendation bits a single node's prediction pass can raise.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Signal: u8 {
        const RECLAIM       = 0b001;
        const COMPACT       = 0b010;
        const LOWER_WMARKS  = 0b100;
    }
}

/// Everything [`predict`] needs for one node's prediction pass. All fields
/// are read-only snapshots; nothing here is mutated.
pub struct PredictContext<'a> {
    /// Per-order regression fits, indexed `0..MAX_ORDER`. `None` means that
    /// order's window has not filled yet.
    pub fits: &'a [Option<Fit>],
    /// Current cumulative free-page count per order (`frag[k].free`).
    pub frag_free: &'a [u64],
    pub free: u64,
    pub high_wmark: u64,
    /// Pages/ms, 0 meaning "not yet established".
    pub reclaim_rate: f64,
    /// Pages/ms, 0 meaning "the kernel isn't making progress".
    pub compaction_rate: f64,
    pub max_compaction_order: usize,
    pub lookback: usize,
    pub periodicity_ms: i64,
    /// Pinned per §4.2's open-question resolution: elapsed time since order
    /// 0's window origin (`now - origin`, clamped to non-negative),
    /// computed once per node per tick and reused for every order.
    pub current_time: i64,
}

/// Real-valued (unscaled) slope, i.e. `fit.m / 100.0`.
fn real_slope(fit: &Fit) -> f64 {
    fit.m as f64 / 100.0
}

pub fn predict(ctx: &PredictContext<'_>) -> Signal {
    let mut signal = Signal::empty();

    let Some(fit0) = ctx.fits[0] else {
        return signal;
    };

    if fit0.m >= 0 {
        signal |= Signal::LOWER_WMARKS;
    } else if ctx.reclaim_rate != 0.0 {
        if ctx.free <= ctx.high_wmark {
            signal |= Signal::RECLAIM;
        } else {
            let gap = (ctx.free - ctx.high_wmark) as f64;
            let time_to_high = gap / real_slope(&fit0).abs();
            let time_to_catch_up = gap / ctx.reclaim_rate;
            if time_to_high <= 3.0 * time_to_catch_up {
                signal |= Signal::RECLAIM;
            }
        }
    }

    let top = ctx.max_compaction_order.min(MAX_ORDER - 1);
    for order in (1..=top).rev() {
        let Some(fit_order) = ctx.fits[order] else {
            continue;
        };
        if fit_order.m >= 0 {
            continue;
        }
        if ctx.compaction_rate == 0.0 {
            continue;
        }
        if fit_order.m == fit0.m {
            continue;
        }

        let x_cross = (fit0.c - fit_order.c) * 100 / (fit_order.m - fit0.m);

        let reservoir = ctx
            .frag_free
            .get(MAX_ORDER - 1)
            .copied()
            .unwrap_or(0)
            .saturating_sub(ctx.frag_free.get(order).copied().unwrap_or(0));

        if x_cross <= ctx.current_time {
            let demand = fit_order.m.unsigned_abs().saturating_mul(x_cross.unsigned_abs());
            if reservoir < demand {
                signal |= Signal::COMPACT;
                break;
            }
        } else {
            let horizon = 5 * ctx.lookback as i64 * ctx.periodicity_ms;
            if x_cross - ctx.current_time <= horizon {
                let time_remaining = (x_cross - ctx.current_time) as f64;
                let compaction_time = reservoir as f64 / ctx.compaction_rate;
                if compaction_time >= time_remaining {
                    signal |= Signal::COMPACT;
                    break;
                }
            }
        }
    }

    signal
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fits(values: &[(i64, i64)]) -> Vec<Option<Fit>> {
        let mut v = vec![None; MAX_ORDER];
        for (i, &(m, c)) in values.iter().enumerate() {
            v[i] = Some(Fit { m, c });
        }
        v
    }

    #[test]
    fn flat_order0_lowers_watermarks() {
        let f = fits(&[(0, 1000)]);
        let ctx = PredictContext {
            fits: &f,
            frag_free: &[1000; MAX_ORDER],
            free: 8000,
            high_wmark: 500,
            reclaim_rate: 0.0,
            compaction_rate: 0.0,
            max_compaction_order: 4,
            lookback: 8,
            periodicity_ms: 1000,
            current_time: 0,
        };
        assert_eq!(predict(&ctx), Signal::LOWER_WMARKS);
    }

    #[test]
    fn shrinking_below_high_watermark_reclaims() {
        let f = fits(&[(-100, 1000)]);
        let ctx = PredictContext {
            fits: &f,
            frag_free: &[1000; MAX_ORDER],
            free: 400,
            high_wmark: 500,
            reclaim_rate: 1.0,
            compaction_rate: 0.0,
            max_compaction_order: 4,
            lookback: 8,
            periodicity_ms: 1000,
            current_time: 0,
        };
        assert_eq!(predict(&ctx), Signal::RECLAIM);
    }

    #[test]
    fn shrinking_with_no_established_reclaim_rate_emits_nothing() {
        let f = fits(&[(-100, 1000)]);
        let ctx = PredictContext {
            fits: &f,
            frag_free: &[1000; MAX_ORDER],
            free: 9000,
            high_wmark: 500,
            reclaim_rate: 0.0,
            compaction_rate: 0.0,
            max_compaction_order: 4,
            lookback: 8,
            periodicity_ms: 1000,
            current_time: 0,
        };
        assert_eq!(predict(&ctx), Signal::empty());
    }

    #[test]
    fn not_ready_order0_emits_nothing() {
        let f = vec![None; MAX_ORDER];
        let ctx = PredictContext {
            fits: &f,
            frag_free: &[0; MAX_ORDER],
            free: 0,
            high_wmark: 0,
            reclaim_rate: 0.0,
            compaction_rate: 0.0,
            max_compaction_order: 4,
            lookback: 8,
            periodicity_ms: 1000,
            current_time: 0,
        };
        assert_eq!(predict(&ctx), Signal::empty());
    }

    #[test]
    fn parallel_lines_are_skipped_for_compaction() {
        let mut f = fits(&[(-10, 1000)]);
        f[3] = Some(Fit { m: -10, c: 2000 });
        let ctx = PredictContext {
            fits: &f,
            frag_free: &[500; MAX_ORDER],
            free: 9000,
            high_wmark: 500,
            reclaim_rate: 0.0,
            compaction_rate: 5.0,
            max_compaction_order: 4,
            lookback: 8,
            periodicity_ms: 1000,
            current_time: 0,
        };
        // order0 slope negative but reclaim_rate 0 => no RECLAIM; parallel
        // slope at order 3 must not raise COMPACT.
        assert_eq!(predict(&ctx), Signal::empty());
    }
}
