use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use cerberus_common::{GlobalStats, RuleStats};

use crate::serializable_types::{SerializableGlobalStats, SerializableRuleStats};

/// 一次从内核读取的计数
#[derive(Debug, Clone, Default)]
pub struct StatsSample {
    pub global: GlobalStats,
    /// 槽位 -> 统计，只包含已配置规则的槽位
    pub rules: BTreeMap<u32, RuleStats>,
}

// 前端展示数据结构
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SteeringSnapshot {
    pub realtime_metrics: RealtimeMetrics,
    pub totals: SerializableGlobalStats,
    pub action_breakdown: ActionBreakdown,
    pub top_rules: Vec<RuleHitSummary>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RealtimeMetrics {
    pub total_bandwidth_bps: u64,    // 总带宽 (bytes/second)
    pub total_packet_rate_pps: u64,  // 包速率 (packets/second)
    pub drop_rate_pps: u64,          // 丢包速率
    pub last_updated: DateTime<Utc>, // 最后更新时间
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ActionBreakdown {
    pub pass_percentage: f64,
    pub drop_percentage: f64,
    pub ids_percentage: f64,
    pub capture_percentage: f64,
    pub inspect_all_percentage: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RuleHitSummary {
    pub slot: u32,
    pub stats: SerializableRuleStats,
    pub packet_rate_pps: u64,
}

// 统计分析器，用上一次的总量计算速率
pub struct SteeringAnalyzer {
    last_snapshot_time: DateTime<Utc>,
    previous: Option<StatsSample>,
}

impl Default for SteeringAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl SteeringAnalyzer {
    pub fn new() -> Self {
        Self {
            last_snapshot_time: Utc::now(),
            previous: None,
        }
    }

    /// 上一次的样本，用于推进 Prometheus 计数器
    pub fn previous(&self) -> Option<&StatsSample> {
        self.previous.as_ref()
    }

    pub fn analyze(&mut self, sample: StatsSample) -> SteeringSnapshot {
        let current_time = Utc::now();
        let elapsed_ms = (current_time - self.last_snapshot_time).num_milliseconds();
        self.analyze_at(sample, current_time, elapsed_ms)
    }

    fn analyze_at(
        &mut self,
        sample: StatsSample,
        current_time: DateTime<Utc>,
        elapsed_ms: i64,
    ) -> SteeringSnapshot {
        // 避免除零
        let elapsed_ms = elapsed_ms.max(1) as u64;
        let rate = |current: u64, previous: u64| {
            let per_sec = u128::from(current.saturating_sub(previous)) * 1000 / u128::from(elapsed_ms);
            u64::try_from(per_sec).unwrap_or(u64::MAX)
        };

        let previous = self.previous.take().unwrap_or_default();
        let global = sample.global;

        let realtime_metrics = RealtimeMetrics {
            total_bandwidth_bps: rate(global.total_bytes, previous.global.total_bytes),
            total_packet_rate_pps: rate(global.total_packets, previous.global.total_packets),
            drop_rate_pps: rate(global.dropped_packets, previous.global.dropped_packets),
            last_updated: current_time,
        };

        let mut top_rules: Vec<RuleHitSummary> = sample
            .rules
            .iter()
            .filter(|(_, stats)| stats.packets > 0)
            .map(|(slot, stats)| {
                let prev_packets = previous.rules.get(slot).map(|s| s.packets).unwrap_or(0);
                RuleHitSummary {
                    slot: *slot,
                    stats: (*stats).into(),
                    packet_rate_pps: rate(stats.packets, prev_packets),
                }
            })
            .collect();
        top_rules.sort_by(|a, b| b.stats.packets.cmp(&a.stats.packets));
        top_rules.truncate(10);

        let snapshot = SteeringSnapshot {
            realtime_metrics,
            totals: global.into(),
            action_breakdown: action_breakdown(&global),
            top_rules,
        };

        self.last_snapshot_time = current_time;
        self.previous = Some(sample);
        snapshot
    }
}

fn action_breakdown(global: &GlobalStats) -> ActionBreakdown {
    let total = global.total_packets;
    let pct = |n: u64| {
        if total > 0 {
            n as f64 / total as f64 * 100.0
        } else {
            0.0
        }
    };
    ActionBreakdown {
        pass_percentage: pct(global.passed_packets),
        drop_percentage: pct(global.dropped_packets),
        ids_percentage: pct(global.ids_packets),
        capture_percentage: pct(global.capture_packets),
        inspect_all_percentage: pct(global.inspect_all_packets),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cerberus_common::Action;

    #[test]
    fn test_rates_from_deltas() {
        let mut analyzer = SteeringAnalyzer::new();
        let t0 = Utc::now();

        let mut first = StatsSample::default();
        for _ in 0..10 {
            first.global.record(Action::Pass, 100);
        }
        first.rules.insert(2, RuleStats { packets: 4, bytes: 400, last_hit: 1 });
        analyzer.analyze_at(first.clone(), t0, 1000);

        let mut second = first;
        for _ in 0..20 {
            second.global.record(Action::Drop, 100);
        }
        second.rules.insert(2, RuleStats { packets: 24, bytes: 2400, last_hit: 2 });
        second.rules.insert(9, RuleStats::default());

        let snapshot = analyzer.analyze_at(second, t0 + chrono::Duration::seconds(2), 2000);
        assert_eq!(snapshot.realtime_metrics.total_packet_rate_pps, 10);
        assert_eq!(snapshot.realtime_metrics.total_bandwidth_bps, 1000);
        assert_eq!(snapshot.realtime_metrics.drop_rate_pps, 10);
        assert_eq!(snapshot.top_rules.len(), 1);
        assert_eq!(snapshot.top_rules[0].slot, 2);
        assert_eq!(snapshot.top_rules[0].packet_rate_pps, 10);
        assert!((snapshot.action_breakdown.drop_percentage - 66.666).abs() < 0.01);
    }

    #[test]
    fn test_counter_reset_does_not_underflow() {
        let mut analyzer = SteeringAnalyzer::new();
        let mut big = StatsSample::default();
        big.global.total_packets = 1000;
        analyzer.analyze_at(big, Utc::now(), 1000);

        let snapshot = analyzer.analyze_at(StatsSample::default(), Utc::now(), 0);
        assert_eq!(snapshot.realtime_metrics.total_packet_rate_pps, 0);
        assert_eq!(snapshot.action_breakdown.pass_percentage, 0.0);
    }

    #[test]
    fn test_large_counters_do_not_overflow() {
        let mut analyzer = SteeringAnalyzer::new();
        let t0 = Utc::now();
        analyzer.analyze_at(StatsSample::default(), t0, 1000);

        let mut huge = StatsSample::default();
        huge.global.total_bytes = u64::MAX;
        huge.global.total_packets = u64::MAX / 4;
        let snapshot = analyzer.analyze_at(huge.clone(), t0 + chrono::Duration::seconds(2), 2000);
        assert_eq!(snapshot.realtime_metrics.total_bandwidth_bps, u64::MAX / 2);
        assert_eq!(snapshot.realtime_metrics.total_packet_rate_pps, u64::MAX / 8);

        // 间隔小于一秒时结果超出 u64，取上限
        huge.global.total_bytes = 0;
        analyzer.analyze_at(huge.clone(), t0, 1000);
        huge.global.total_bytes = u64::MAX;
        let snapshot = analyzer.analyze_at(huge, t0, 10);
        assert_eq!(snapshot.realtime_metrics.total_bandwidth_bps, u64::MAX);
    }
}
