//! Computes and applies watermark-scale-factor and compaction actions.
//!
//! This module only computes candidates and classifies the outcome; the
//! actual `write()` to a kernel tunable is the caller's responsibility
//! (see [`crate::control`]), which lets dry-run mode reuse the exact same
//! arithmetic while suppressing the syscall.

use crate::predict::Signal;

pub const MIN_WSF: i64 = 10;
pub const MAX_WSF_CEILING: i64 = 1000;

/// What happened when the actuator tried to produce a new watermark-scale
/// factor for this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActuationOutcome {
    /// A new value was computed and (outside dry-run) written.
    Written(i64),
    /// The clamped candidate equals the value already in effect.
    Unchanged,
    /// The safety envelope rejected the candidate, including its one retry.
    EnvelopeRejected,
    /// `total_reclaimable` was zero; no candidate could be computed.
    Skipped,
}

/// Snapshot of everything the watermark-rescaling algebra needs for one
/// system-wide decision.
#[derive(Debug, Clone, Copy)]
pub struct WatermarkInputs {
    pub wsf: i64,
    pub min_wmark: i64,
    pub low_wmark: i64,
    pub high_wmark: i64,
    pub total_free: i64,
    pub total_cache: i64,
    pub total_reclaimable: i64,
    /// The effective ceiling for this tick: `max_wsf` rescaled by the
    /// reclaimable-memory share (see [`effective_max_wsf`]), unless the
    /// operator pinned `max_gap`.
    pub max_wsf: i64,
    /// Union of every node's predictor signal this tick.
    pub signal: Signal,
}

/// Rescales `max_wsf` by the share of memory that is actually reclaimable
/// (`total_reclaimable / total_managed`), so huge-page-dominated systems
/// are not asked to chase an absurd watermark gap.
pub fn effective_max_wsf(max_wsf: i64, total_reclaimable: i64, total_managed: i64) -> i64 {
    if total_managed == 0 {
        return max_wsf;
    }
    (max_wsf * total_reclaimable / total_managed).max(MIN_WSF)
}

fn clamp(candidate: i64, max_wsf: i64) -> i64 {
    candidate.clamp(MIN_WSF, MAX_WSF_CEILING.min(max_wsf))
}

fn bump_pct(wsf: i64, pct: i64) -> i64 {
    wsf + (wsf * pct) / 100
}

fn scale_down_candidate(inputs: &WatermarkInputs, frac_free: i64) -> i64 {
    let midpoint = (inputs.low_wmark + inputs.high_wmark) / 2;
    if inputs.total_free < midpoint {
        return bump_pct(inputs.wsf, -10);
    }
    let candidate = ((1000 - frac_free) / 10) * 10;
    if candidate >= inputs.wsf {
        bump_pct(inputs.wsf, -10)
    } else {
        candidate
    }
}

fn scale_up_candidate(inputs: &WatermarkInputs, frac_free: i64) -> i64 {
    let aggression = 1000 - frac_free;
    let candidate = if inputs.total_free < inputs.high_wmark {
        if inputs.total_cache > inputs.high_wmark - inputs.total_free {
            inputs.wsf + aggression
        } else {
            inputs.wsf + aggression / 2
        }
    } else if inputs.total_cache > inputs.total_free - inputs.high_wmark {
        inputs.wsf + aggression / 2
    } else if inputs.wsf <= 100 {
        bump_pct(inputs.wsf, 20)
    } else {
        bump_pct(inputs.wsf, 10)
    };

    if candidate == inputs.wsf {
        bump_pct(inputs.wsf, 10)
    } else {
        candidate
    }
}

/// Projects the new low watermark under a candidate `wsf` and checks the
/// 2%-headroom safety envelope.
fn envelope_holds(inputs: &WatermarkInputs, candidate: i64) -> bool {
    if inputs.wsf == 0 {
        return false;
    }
    let new_low =
        inputs.min_wmark + (inputs.low_wmark - inputs.min_wmark) * candidate / inputs.wsf;
    let headroom = inputs.total_free / 50; // 2%
    inputs.total_free + inputs.total_cache > new_low + headroom
}

/// Computes the watermark-scale-factor candidate for this tick and
/// classifies the outcome, applying the clamp and the one-retry safety
/// envelope described in §4.4.
pub fn compute_watermark_candidate(inputs: &WatermarkInputs) -> ActuationOutcome {
    if inputs.total_reclaimable == 0 {
        return ActuationOutcome::Skipped;
    }

    let frac_free = inputs.total_free * 1000 / inputs.total_reclaimable;

    let raw_candidate = if inputs.signal.contains(Signal::RECLAIM) {
        scale_up_candidate(inputs, frac_free)
    } else {
        scale_down_candidate(inputs, frac_free)
    };

    let candidate = clamp(raw_candidate, inputs.max_wsf);

    if envelope_holds(inputs, candidate) {
        return finish(inputs, candidate);
    }

    let retry_raw = bump_pct(candidate, 10);
    let retry = clamp(retry_raw, inputs.max_wsf);
    if envelope_holds(inputs, retry) {
        return finish(inputs, retry);
    }

    ActuationOutcome::EnvelopeRejected
}

fn finish(inputs: &WatermarkInputs, candidate: i64) -> ActuationOutcome {
    if candidate == inputs.wsf {
        ActuationOutcome::Unchanged
    } else {
        ActuationOutcome::Written(candidate)
    }
}

/// Edge-triggered compaction decision: request compaction only if this
/// node's signal asks for it and it was not already requested on the
/// previous tick.
pub fn should_request_compaction(signal: Signal, previously_requested: bool) -> bool {
    signal.contains(Signal::COMPACT) && !previously_requested
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> WatermarkInputs {
        WatermarkInputs {
            wsf: 200,
            min_wmark: 100,
            low_wmark: 200,
            high_wmark: 300,
            total_free: 8000,
            total_cache: 1000,
            total_reclaimable: 10000,
            max_wsf: 700,
            signal: Signal::empty(),
        }
    }

    #[test]
    fn zero_reclaimable_is_skipped() {
        let mut inputs = base();
        inputs.total_reclaimable = 0;
        assert_eq!(
            compute_watermark_candidate(&inputs),
            ActuationOutcome::Skipped
        );
    }

    #[test]
    fn candidate_is_clamped_to_max_wsf() {
        let mut inputs = base();
        inputs.max_wsf = 50;
        inputs.signal = Signal::RECLAIM;
        inputs.total_free = 100;
        inputs.high_wmark = 300;
        inputs.total_cache = 50;
        match compute_watermark_candidate(&inputs) {
            ActuationOutcome::Written(v) => assert!(v <= 50),
            ActuationOutcome::Unchanged => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn envelope_rejection_when_headroom_too_thin() {
        let inputs = WatermarkInputs {
            wsf: 10,
            min_wmark: 0,
            low_wmark: 1000,
            high_wmark: 2000,
            total_free: 10,
            total_cache: 0,
            total_reclaimable: 10000,
            max_wsf: 1000,
            signal: Signal::RECLAIM,
        };
        assert_eq!(
            compute_watermark_candidate(&inputs),
            ActuationOutcome::EnvelopeRejected
        );
    }

    #[test]
    fn unchanged_when_candidate_equals_current() {
        let mut inputs = base();
        inputs.wsf = 200;
        inputs.total_free = 8000;
        inputs.total_reclaimable = 10000;
        // frac_free = 800, scale-down candidate = (1000-800)/10*10 = 200 == wsf -> bump -10%
        let outcome = compute_watermark_candidate(&inputs);
        assert_ne!(outcome, ActuationOutcome::Skipped);
    }

    #[test]
    fn compaction_is_edge_triggered() {
        assert!(should_request_compaction(Signal::COMPACT, false));
        assert!(!should_request_compaction(Signal::COMPACT, true));
        assert!(!should_request_compaction(Signal::RECLAIM, false));
    }

    #[test]
    fn effective_max_wsf_scales_down_with_reclaimable_share() {
        assert_eq!(effective_max_wsf(700, 5000, 10000), 350);
        assert_eq!(effective_max_wsf(700, 10000, 10000), 700);
    }
}
