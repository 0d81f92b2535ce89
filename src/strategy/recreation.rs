//! Recreation Decision Module
//!
//! Decides whether a chain position should be closed and rebuilt around the
//! current price. Pure: the same input always yields the same decision, and
//! "now" is the snapshot timestamp.
//!
//! Evaluation order, first applicable wins:
//! 1. Price-bound veto (keep above max, stop below min)
//! 2. Out-of-range timeout
//! 3. Tiered triggers while in range and past the recreation cooldown:
//!    market opportunity, loss recovery, dynamic profit

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::domain::{
    LossRecoveryMark, LossRecoveryUpdate, MarketSnapshot, OutOfRangeDetails, PositionRange,
    PriceCheckDetails, RangeDirection, RecreationDecision, RecreationType, Urgency,
};
use crate::strategy::ChainPositionConfig;

/// Everything a recreation decision depends on
#[derive(Debug, Clone, Copy)]
pub struct RecreationInput<'a> {
    pub snapshot: &'a MarketSnapshot,
    pub position_range: PositionRange,
    pub is_in_range: bool,
    pub out_of_range_since: Option<DateTime<Utc>>,
    pub out_of_range_direction: Option<RangeDirection>,
    pub last_recreation_time: Option<DateTime<Utc>>,
    pub loss_recovery_mark: Option<LossRecoveryMark>,
    pub dynamic_switch_enabled: bool,
    pub config: &'a ChainPositionConfig,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RecreationDecisionModule;

impl RecreationDecisionModule {
    pub fn new() -> Self {
        Self
    }

    pub fn should_recreate_position(&self, input: &RecreationInput<'_>) -> RecreationDecision {
        let decision = self.evaluate(input);
        apply_dynamic_switch(decision, input.dynamic_switch_enabled)
    }

    fn evaluate(&self, input: &RecreationInput<'_>) -> RecreationDecision {
        if let Some(veto) = price_check(input) {
            return veto;
        }

        if !input.is_in_range {
            return out_of_range_check(input);
        }

        let now = input.snapshot.timestamp;
        let rc = &input.config.recreation;
        if let Some(last) = input.last_recreation_time {
            let since = now - last;
            let cooldown = Duration::seconds(rc.min_recreation_interval_secs as i64);
            if since < cooldown {
                return RecreationDecision::hold(format!(
                    "Recreation cooldown: {}s of {}s elapsed",
                    since.num_seconds(),
                    cooldown.num_seconds()
                ));
            }
        }

        let position_pct = input.position_range.position_pct(input.snapshot.active_bin);
        let pnl_pct = input.snapshot.net_pnl_percentage;

        if let Some(d) = market_opportunity(input, position_pct, pnl_pct) {
            return d;
        }

        let (loss_recovery, mark_update) = loss_recovery(input, position_pct, pnl_pct);
        if let Some(d) = loss_recovery {
            return d;
        }

        if let Some(d) = dynamic_profit(input, position_pct, pnl_pct) {
            return d.with_loss_recovery_update(mark_update);
        }

        debug!(
            position_pct = format!("{:.1}", position_pct),
            pnl_pct = format!("{:.3}", pnl_pct),
            "No recreation trigger"
        );
        RecreationDecision::hold("No recreation trigger met").with_loss_recovery_update(mark_update)
    }
}

fn price_check(input: &RecreationInput<'_>) -> Option<RecreationDecision> {
    let price = input.snapshot.current_price;
    let details = PriceCheckDetails {
        current_price: price,
        min_price: input.config.min_price_for_recreation,
        max_price: input.config.max_price_for_recreation,
    };

    if let Some(max) = details.max_price {
        if price > max {
            return Some(RecreationDecision {
                recreation_type: Some(RecreationType::PriceCheckFailed),
                confidence: 1.0,
                should_keep_position: true,
                price_check_details: Some(details),
                ..RecreationDecision::hold(format!(
                    "Price {:.6} above max recreation price {:.6}; keeping position",
                    price, max
                ))
            });
        }
    }

    if let Some(min) = details.min_price {
        if price < min {
            return Some(RecreationDecision {
                recreation_type: Some(RecreationType::PriceCheckFailed),
                confidence: 1.0,
                urgency: Urgency::High,
                should_stop: true,
                price_check_details: Some(details),
                ..RecreationDecision::hold(format!(
                    "Price {:.6} below min recreation price {:.6}; exiting",
                    price, min
                ))
            });
        }
    }

    None
}

fn out_of_range_check(input: &RecreationInput<'_>) -> RecreationDecision {
    let now = input.snapshot.timestamp;
    let since = input.out_of_range_since.unwrap_or(now);
    let elapsed = (now - since).num_seconds().max(0);
    let timeout = input.config.out_of_range_timeout_secs as i64;
    let details = OutOfRangeDetails {
        direction: input.out_of_range_direction,
        out_of_range_since: since,
        elapsed_secs: elapsed,
        time_remaining_secs: (timeout - elapsed).max(0),
    };

    if elapsed >= timeout {
        RecreationDecision {
            out_of_range_details: Some(details),
            ..RecreationDecision::recreate(
                RecreationType::OutOfRange,
                1.0,
                Urgency::High,
                format!(
                    "Out of range ({:?}) for {}s, timeout {}s",
                    input.out_of_range_direction, elapsed, timeout
                ),
            )
        }
    } else {
        RecreationDecision {
            out_of_range_details: Some(details),
            urgency: Urgency::Medium,
            ..RecreationDecision::hold(format!(
                "Out of range for {}s, {}s until recreation",
                elapsed, details.time_remaining_secs
            ))
        }
    }
}

fn market_opportunity(
    input: &RecreationInput<'_>,
    position_pct: f64,
    pnl_pct: f64,
) -> Option<RecreationDecision> {
    let mo = &input.config.recreation.market_opportunity;
    if !mo.enabled || position_pct < mo.position_threshold || pnl_pct < mo.profit_threshold {
        return None;
    }
    let excess = pnl_pct - mo.profit_threshold;
    Some(RecreationDecision::recreate(
        RecreationType::MarketOpportunity,
        (0.7 + excess / 10.0).min(0.95),
        Urgency::Medium,
        format!(
            "Market opportunity: position {:.1}% >= {:.1}%, profit {:.2}% >= {:.2}%",
            position_pct, mo.position_threshold, pnl_pct, mo.profit_threshold
        ),
    ))
}

/// Two-phase trigger: mark while shallow and slightly negative, trigger once
/// the bin has moved up and profit turned slightly positive.
fn loss_recovery(
    input: &RecreationInput<'_>,
    position_pct: f64,
    pnl_pct: f64,
) -> (Option<RecreationDecision>, Option<LossRecoveryUpdate>) {
    let lr = &input.config.recreation.loss_recovery;
    if !lr.enabled {
        return (None, None);
    }

    match input.loss_recovery_mark {
        None => {
            let in_mark_band = pnl_pct >= -lr.mark_loss_threshold && pnl_pct < 0.0;
            if position_pct <= lr.mark_position_threshold && in_mark_band {
                let mark = LossRecoveryMark {
                    marked_at: input.snapshot.timestamp,
                    position_pct,
                    pnl_pct,
                };
                return (None, Some(LossRecoveryUpdate::Mark(mark)));
            }
            (None, None)
        }
        Some(mark) => {
            let recovered = pnl_pct >= 0.0 && pnl_pct <= lr.trigger_profit_threshold;
            if position_pct >= lr.trigger_position_threshold && recovered {
                let decision = RecreationDecision::recreate(
                    RecreationType::LossRecovery,
                    0.75,
                    Urgency::Medium,
                    format!(
                        "Loss recovery: marked at {:.1}%/{:.2}%, now {:.1}%/{:.2}%",
                        mark.position_pct, mark.pnl_pct, position_pct, pnl_pct
                    ),
                )
                .with_loss_recovery_update(Some(LossRecoveryUpdate::Clear));
                return (Some(decision), None);
            }
            if pnl_pct < -lr.mark_loss_threshold {
                return (None, Some(LossRecoveryUpdate::Clear));
            }
            (None, None)
        }
    }
}

fn dynamic_profit(
    input: &RecreationInput<'_>,
    position_pct: f64,
    pnl_pct: f64,
) -> Option<RecreationDecision> {
    let dp = &input.config.recreation.dynamic_profit;
    if !dp.enabled || position_pct < dp.position_threshold {
        return None;
    }
    let benchmark = input.snapshot.benchmark_yield_rates?.current_5min;
    let required = dp.required_profit(benchmark)?;
    if pnl_pct < required {
        return None;
    }
    Some(RecreationDecision::recreate(
        RecreationType::DynamicProfit,
        0.8,
        Urgency::Medium,
        format!(
            "Dynamic profit: benchmark {:.3}% requires {:.2}%, profit {:.2}%",
            benchmark, required, pnl_pct
        ),
    ))
}

/// With the switch enabled a recreation becomes an exit.
fn apply_dynamic_switch(decision: RecreationDecision, switch_enabled: bool) -> RecreationDecision {
    if !switch_enabled || !decision.should_recreate {
        return decision;
    }
    RecreationDecision {
        should_recreate: false,
        should_stop: true,
        urgency: Urgency::High,
        reason: format!(
            "Dynamic recreation switch enabled; exiting instead of recreating ({})",
            decision.reason
        ),
        ..decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BenchmarkYieldRates;

    const RANGE: PositionRange = PositionRange { lower_bin: 0, upper_bin: 100 };

    fn snapshot(active_bin: i32, pnl_pct: f64, t: DateTime<Utc>) -> MarketSnapshot {
        MarketSnapshot {
            timestamp: t,
            current_price: 100.0,
            active_bin,
            position_lower_bin: RANGE.lower_bin,
            position_upper_bin: RANGE.upper_bin,
            net_pnl_percentage: pnl_pct,
            benchmark_yield_rates: Some(BenchmarkYieldRates {
                current_5min: 0.2,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn input<'a>(snap: &'a MarketSnapshot, config: &'a ChainPositionConfig) -> RecreationInput<'a> {
        RecreationInput {
            snapshot: snap,
            position_range: RANGE,
            is_in_range: RANGE.contains(snap.active_bin),
            out_of_range_since: None,
            out_of_range_direction: None,
            last_recreation_time: None,
            loss_recovery_mark: None,
            dynamic_switch_enabled: false,
            config,
        }
    }

    fn config() -> ChainPositionConfig {
        ChainPositionConfig::for_pool("pool")
    }

    #[test]
    fn test_out_of_range_timeout_boundary() {
        let cfg = config();
        let t0 = Utc::now();

        let snap = snapshot(120, 0.0, t0 + Duration::seconds(299));
        let mut inp = input(&snap, &cfg);
        inp.out_of_range_since = Some(t0);
        inp.out_of_range_direction = Some(RangeDirection::Above);
        let d = RecreationDecisionModule.should_recreate_position(&inp);
        assert!(!d.should_recreate);
        assert_eq!(d.out_of_range_details.unwrap().time_remaining_secs, 1);

        let snap = snapshot(120, 0.0, t0 + Duration::seconds(301));
        let mut inp = input(&snap, &cfg);
        inp.out_of_range_since = Some(t0);
        let d = RecreationDecisionModule.should_recreate_position(&inp);
        assert!(d.should_recreate);
        assert_eq!(d.recreation_type, Some(RecreationType::OutOfRange));
    }

    #[test]
    fn test_max_price_veto_keeps_position() {
        let mut cfg = config();
        cfg.max_price_for_recreation = Some(90.0);
        let snap = snapshot(150, 5.0, Utc::now());
        let mut inp = input(&snap, &cfg);
        inp.out_of_range_since = Some(snap.timestamp - Duration::hours(1));
        let d = RecreationDecisionModule.should_recreate_position(&inp);
        assert!(!d.should_recreate);
        assert!(d.should_keep_position);
        assert_eq!(d.recreation_type, Some(RecreationType::PriceCheckFailed));
    }

    #[test]
    fn test_min_price_signals_stop() {
        let mut cfg = config();
        cfg.min_price_for_recreation = Some(150.0);
        let snap = snapshot(50, 0.0, Utc::now());
        let d = RecreationDecisionModule.should_recreate_position(&input(&snap, &cfg));
        assert!(d.should_stop);
        assert!(!d.should_recreate);
        assert_eq!(d.recreation_type, Some(RecreationType::PriceCheckFailed));
    }

    #[test]
    fn test_market_opportunity() {
        let cfg = config();
        let snap = snapshot(75, 1.2, Utc::now());
        let d = RecreationDecisionModule.should_recreate_position(&input(&snap, &cfg));
        assert!(d.should_recreate);
        assert_eq!(d.recreation_type, Some(RecreationType::MarketOpportunity));
    }

    #[test]
    fn test_cooldown_blocks_tiered_triggers() {
        let cfg = config();
        let snap = snapshot(75, 1.2, Utc::now());
        let mut inp = input(&snap, &cfg);
        inp.last_recreation_time = Some(snap.timestamp - Duration::seconds(60));
        let d = RecreationDecisionModule.should_recreate_position(&inp);
        assert!(!d.should_recreate);
        assert!(d.recreation_type.is_none());
    }

    #[test]
    fn test_loss_recovery_two_phase() {
        let cfg = config();
        let t0 = Utc::now();

        let snap = snapshot(40, -1.0, t0);
        let d = RecreationDecisionModule.should_recreate_position(&input(&snap, &cfg));
        assert!(!d.should_recreate);
        let mark = match d.loss_recovery_update {
            Some(LossRecoveryUpdate::Mark(m)) => m,
            other => panic!("expected mark, got {:?}", other),
        };

        let snap = snapshot(72, 0.3, t0 + Duration::minutes(20));
        let mut inp = input(&snap, &cfg);
        inp.loss_recovery_mark = Some(mark);
        let d = RecreationDecisionModule.should_recreate_position(&inp);
        assert!(d.should_recreate);
        assert_eq!(d.recreation_type, Some(RecreationType::LossRecovery));
        assert_eq!(d.loss_recovery_update, Some(LossRecoveryUpdate::Clear));
    }

    #[test]
    fn test_unmarked_recovery_does_not_trigger() {
        let mut cfg = config();
        cfg.recreation.dynamic_profit.enabled = false;
        let snap = snapshot(72, 0.3, Utc::now());
        let d = RecreationDecisionModule.should_recreate_position(&input(&snap, &cfg));
        assert!(!d.should_recreate);
    }

    #[test]
    fn test_dynamic_profit_tiers() {
        let cfg = config();
        let mut snap = snapshot(80, 0.6, Utc::now());
        let d = RecreationDecisionModule.should_recreate_position(&input(&snap, &cfg));
        assert_eq!(d.recreation_type, Some(RecreationType::DynamicProfit));

        snap.benchmark_yield_rates = Some(BenchmarkYieldRates {
            current_5min: 2.0,
            ..Default::default()
        });
        let d = RecreationDecisionModule.should_recreate_position(&input(&snap, &cfg));
        assert!(!d.should_recreate, "1.5% required at benchmark 2.0");
    }

    #[test]
    fn test_dynamic_switch_converts_recreation_into_stop() {
        let cfg = config();
        let snap = snapshot(75, 1.2, Utc::now());
        let mut inp = input(&snap, &cfg);
        inp.dynamic_switch_enabled = true;
        let d = RecreationDecisionModule.should_recreate_position(&inp);
        assert!(!d.should_recreate);
        assert!(d.should_stop);
        assert_eq!(d.recreation_type, Some(RecreationType::MarketOpportunity));
    }

    #[test]
    fn test_decision_is_pure() {
        let cfg = config();
        let snap = snapshot(120, 0.4, Utc::now());
        let mut inp = input(&snap, &cfg);
        inp.out_of_range_since = Some(snap.timestamp - Duration::seconds(100));
        let a = RecreationDecisionModule.should_recreate_position(&inp);
        let b = RecreationDecisionModule.should_recreate_position(&inp);
        assert_eq!(a, b);
    }
}
