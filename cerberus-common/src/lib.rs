#![cfg_attr(not(test), no_std)]

//! 内核 XDP 程序与用户态控制面共享的 map 记录结构。
//!
//! 两个构建目标之间唯一的契约就是这里定义的 `#[repr(C)]` 布局，
//! 分类算法本身也放在这里，内核和宿主测试共用同一份实现。

pub mod classify;
pub mod frame;
pub mod utils;

/// 规则表声明容量
pub const MAX_RULES: u32 = 1024;
/// 每个包实际扫描的规则槽位数
pub const RULE_SCAN_WINDOW: u32 = 64;
/// 白名单/黑名单 LPM 表容量
pub const HOST_LIST_CAPACITY: u32 = 10000;

pub const ETH_P_IPV4: u16 = 0x0800;
pub const ETH_P_IPV6: u16 = 0x86DD;
pub const ETH_P_8021Q: u16 = 0x8100;
pub const ETH_P_8021AD: u16 = 0x88A8;

pub const PROTOCOL_ICMP: u8 = 1;
pub const PROTOCOL_TCP: u8 = 6;
pub const PROTOCOL_UDP: u8 = 17;

/// 规则命中后的动作
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "user",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "snake_case")
)]
pub enum Action {
    Pass = 0,
    Drop = 1,
    #[cfg_attr(feature = "user", serde(alias = "inspect_ips"))]
    InspectIds = 2,
    #[cfg_attr(feature = "user", serde(alias = "capture_arkime"))]
    Capture = 3,
    InspectAll = 4,
}

impl Action {
    pub const ALL: [Action; 5] = [
        Action::Pass,
        Action::Drop,
        Action::InspectIds,
        Action::Capture,
        Action::InspectAll,
    ];

    #[inline(always)]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Action::Pass),
            1 => Some(Action::Drop),
            2 => Some(Action::InspectIds),
            3 => Some(Action::Capture),
            4 => Some(Action::InspectAll),
            _ => None,
        }
    }

    /// 只有 Drop 会丢包，检测类动作都放行，由旁路负责引流
    #[inline(always)]
    pub fn drops(self) -> bool {
        matches!(self, Action::Drop)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Action::Pass => "pass",
            Action::Drop => "drop",
            Action::InspectIds => "inspect_ids",
            Action::Capture => "capture",
            Action::InspectAll => "inspect_all",
        }
    }
}

/// 规则匹配维度
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "user",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "snake_case")
)]
pub enum MatchType {
    SrcIp = 0,
    DstIp = 1,
    SrcNet = 2,
    DstNet = 3,
    SrcPort = 4,
    DstPort = 5,
    Protocol = 6,
    Vlan = 7,
}

impl MatchType {
    #[inline(always)]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(MatchType::SrcIp),
            1 => Some(MatchType::DstIp),
            2 => Some(MatchType::SrcNet),
            3 => Some(MatchType::DstNet),
            4 => Some(MatchType::SrcPort),
            5 => Some(MatchType::DstPort),
            6 => Some(MatchType::Protocol),
            7 => Some(MatchType::Vlan),
            _ => None,
        }
    }
}

/// 规则表中的一条记录，槽位下标即优先级。
///
/// 地址和掩码都以主机字节序保存。
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FilterRule {
    pub id: u32,
    pub priority: u32,
    pub match_type: u8,
    pub action: u8,
    pub enabled: u8,
    pub _pad: u8,
    pub match_ip: u32,
    pub match_mask: u32,
    pub match_port: u16,
    pub match_proto: u16,
    pub match_vlan: u32,
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for FilterRule {}

impl FilterRule {
    pub fn is_enabled(&self) -> bool {
        self.enabled != 0
    }
}

/// 单条规则的命中统计
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RuleStats {
    pub packets: u64,
    pub bytes: u64,
    /// 内核单调时钟，纳秒
    pub last_hit: u64,
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for RuleStats {}

/// 全局统计，按动作分类计数
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GlobalStats {
    pub total_packets: u64,
    pub total_bytes: u64,
    pub passed_packets: u64,
    pub dropped_packets: u64,
    pub ids_packets: u64,
    pub capture_packets: u64,
    pub inspect_all_packets: u64,
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for GlobalStats {}

impl GlobalStats {
    pub fn packets_for(&self, action: Action) -> u64 {
        match action {
            Action::Pass => self.passed_packets,
            Action::Drop => self.dropped_packets,
            Action::InspectIds => self.ids_packets,
            Action::Capture => self.capture_packets,
            Action::InspectAll => self.inspect_all_packets,
        }
    }

    /// 按动作记一个包，内核侧用原子操作完成同样的事
    pub fn record(&mut self, action: Action, bytes: u64) {
        self.total_packets += 1;
        self.total_bytes += bytes;
        match action {
            Action::Pass => self.passed_packets += 1,
            Action::Drop => self.dropped_packets += 1,
            Action::InspectIds => self.ids_packets += 1,
            Action::Capture => self.capture_packets += 1,
            Action::InspectAll => self.inspect_all_packets += 1,
        }
    }

    /// 同一动作分类对应的字段偏移（以 u64 计），供内核原子自增使用
    #[inline(always)]
    pub fn counter_index(action: Action) -> usize {
        match action {
            Action::Pass => 2,
            Action::Drop => 3,
            Action::InspectIds => 4,
            Action::Capture => 5,
            Action::InspectAll => 6,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem;

    #[test]
    fn test_filter_rule_layout() {
        assert_eq!(mem::size_of::<FilterRule>(), 28);
        assert_eq!(mem::offset_of!(FilterRule, match_type), 8);
        assert_eq!(mem::offset_of!(FilterRule, match_ip), 12);
        assert_eq!(mem::offset_of!(FilterRule, match_port), 20);
        assert_eq!(mem::offset_of!(FilterRule, match_proto), 22);
        assert_eq!(mem::offset_of!(FilterRule, match_vlan), 24);
    }

    #[test]
    fn test_stats_layout() {
        assert_eq!(mem::size_of::<RuleStats>(), 24);
        assert_eq!(mem::size_of::<GlobalStats>(), 56);
        assert_eq!(mem::offset_of!(GlobalStats, passed_packets), 2 * 8);
        assert_eq!(mem::offset_of!(GlobalStats, inspect_all_packets), 6 * 8);
    }

    #[test]
    fn test_counter_index_matches_record() {
        for action in Action::ALL {
            let mut stats = GlobalStats::default();
            stats.record(action, 100);
            let words: [u64; 7] = unsafe { mem::transmute(stats) };
            assert_eq!(words[GlobalStats::counter_index(action)], 1);
            assert_eq!(stats.packets_for(action), 1);
            assert_eq!(stats.total_bytes, 100);
        }
    }

    #[test]
    fn test_unknown_discriminants_rejected() {
        assert_eq!(Action::from_u8(5), None);
        assert_eq!(MatchType::from_u8(8), None);
        assert_eq!(Action::from_u8(2), Some(Action::InspectIds));
    }
}
