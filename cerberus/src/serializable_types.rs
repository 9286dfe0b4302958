use serde::{Deserialize, Serialize};
use cerberus_common::{GlobalStats, RuleStats};

// 可序列化的 RuleStats 包装
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SerializableRuleStats {
    pub packets: u64,
    pub bytes: u64,
    pub last_hit_ns: u64,
}

impl From<RuleStats> for SerializableRuleStats {
    fn from(stats: RuleStats) -> Self {
        Self {
            packets: stats.packets,
            bytes: stats.bytes,
            last_hit_ns: stats.last_hit,
        }
    }
}

// 可序列化的 GlobalStats 包装
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SerializableGlobalStats {
    pub total_packets: u64,
    pub total_bytes: u64,
    pub passed_packets: u64,
    pub dropped_packets: u64,
    pub ids_packets: u64,
    pub capture_packets: u64,
    pub inspect_all_packets: u64,
}

impl From<GlobalStats> for SerializableGlobalStats {
    fn from(stats: GlobalStats) -> Self {
        Self {
            total_packets: stats.total_packets,
            total_bytes: stats.total_bytes,
            passed_packets: stats.passed_packets,
            dropped_packets: stats.dropped_packets,
            ids_packets: stats.ids_packets,
            capture_packets: stats.capture_packets,
            inspect_all_packets: stats.inspect_all_packets,
        }
    }
}
