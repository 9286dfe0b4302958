//! 每个包的分类决策。
//!
//! 顺序：白名单 → 黑名单 → 规则表前 `RULE_SCAN_WINDOW` 个槽位 → 默认策略。
//! 任何解析失败都放行。

use crate::frame::{parse_frame, FrameBytes, PacketMeta, ParsedFrame};
use crate::{Action, FilterRule, MatchType, RULE_SCAN_WINDOW};

/// 分类所需的表查询，内核侧由 BPF map 实现
pub trait SteeringTables {
    /// 读取槽位上的规则，空槽返回 None
    fn rule(&self, slot: u32) -> Option<FilterRule>;
    /// 源地址是否在白名单（/32 查询）
    fn allow_listed(&self, addr: u32) -> bool;
    /// 源地址是否在黑名单（/32 查询）
    fn deny_listed(&self, addr: u32) -> bool;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Drop,
}

/// 本次决策需要更新哪些计数器
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Accounting {
    /// 不计数
    None,
    /// 只计全局统计
    Global(Action),
    /// 计规则统计和全局统计
    Rule { slot: u32, action: Action },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Decision {
    pub verdict: Verdict,
    pub accounting: Accounting,
    pub len: u64,
}

impl Decision {
    #[inline(always)]
    fn pass_unaccounted(len: u64) -> Self {
        Self {
            verdict: Verdict::Pass,
            accounting: Accounting::None,
            len,
        }
    }

    #[inline(always)]
    fn default_policy(len: u64) -> Self {
        Self {
            verdict: Verdict::Pass,
            accounting: Accounting::Global(Action::InspectAll),
            len,
        }
    }
}

impl FilterRule {
    /// 规则谓词是否命中，未知的匹配类型永远不命中
    #[inline(always)]
    pub fn matches(&self, meta: &PacketMeta) -> bool {
        let Some(match_type) = MatchType::from_u8(self.match_type) else {
            return false;
        };
        match match_type {
            MatchType::SrcIp => meta.src_ip == self.match_ip,
            MatchType::DstIp => meta.dst_ip == self.match_ip,
            MatchType::SrcNet => meta.src_ip & self.match_mask == self.match_ip & self.match_mask,
            MatchType::DstNet => meta.dst_ip & self.match_mask == self.match_ip & self.match_mask,
            MatchType::SrcPort => meta.src_port == self.match_port,
            MatchType::DstPort => meta.dst_port == self.match_port,
            MatchType::Protocol => meta.protocol as u16 == self.match_proto,
            MatchType::Vlan => match meta.vlan_id {
                Some(vid) => vid as u32 == self.match_vlan,
                None => false,
            },
        }
    }
}

/// 对一个已解析的 IPv4 包做决策
#[inline(always)]
pub fn classify_packet<T: SteeringTables>(tables: &T, meta: &PacketMeta) -> Decision {
    if tables.allow_listed(meta.src_ip) {
        return Decision {
            verdict: Verdict::Pass,
            accounting: Accounting::Global(Action::Pass),
            len: meta.len,
        };
    }
    if tables.deny_listed(meta.src_ip) {
        return Decision {
            verdict: Verdict::Drop,
            accounting: Accounting::Global(Action::Drop),
            len: meta.len,
        };
    }

    for slot in 0..RULE_SCAN_WINDOW {
        let Some(rule) = tables.rule(slot) else {
            continue;
        };
        if !rule.is_enabled() || !rule.matches(meta) {
            continue;
        }
        // 动作值非法的规则视为不命中
        let Some(action) = Action::from_u8(rule.action) else {
            continue;
        };
        return Decision {
            verdict: if action.drops() {
                Verdict::Drop
            } else {
                Verdict::Pass
            },
            accounting: Accounting::Rule { slot, action },
            len: meta.len,
        };
    }

    Decision::default_policy(meta.len)
}

/// 解析并分类一帧
#[inline(always)]
pub fn classify<F: FrameBytes, T: SteeringTables>(frame: &F, tables: &T) -> Decision {
    match parse_frame(frame) {
        ParsedFrame::Unclassified => Decision::pass_unaccounted(frame.len() as u64),
        ParsedFrame::Default { len } => Decision::default_policy(len),
        ParsedFrame::Ipv4(meta) => classify_packet(tables, &meta),
    }
}
