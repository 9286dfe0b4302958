use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use thiserror::Error;

use cerberus_common::utils::{ip_to_u32, prefix_to_mask};
use cerberus_common::{
    Action, FilterRule, MatchType, MAX_RULES, PROTOCOL_ICMP, PROTOCOL_TCP, PROTOCOL_UDP,
    RULE_SCAN_WINDOW,
};

use crate::serializable_types::SerializableRuleStats;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("{0}")]
    Invalid(String),
    #[error("槽位 {slot} 已被规则 {owner} 占用")]
    SlotTaken { slot: u32, owner: u32 },
    #[error("规则 {0} 不存在")]
    NotFound(u32),
    #[error("{addr} 不在{list}名单中")]
    HostNotFound { addr: Ipv4Addr, list: &'static str },
    #[error("规则表已满")]
    TableFull,
    #[error("写入内核 map 失败: {0:#}")]
    Map(anyhow::Error),
    #[error("持久化失败: {0:#}")]
    Storage(anyhow::Error),
}

fn invalid(msg: impl Into<String>) -> RuleError {
    RuleError::Invalid(msg.into())
}

/// 规则的匹配条件，操作数类型随匹配维度确定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleMatch {
    SrcIp(Ipv4Addr),
    DstIp(Ipv4Addr),
    SrcNet { addr: Ipv4Addr, prefix: u8 },
    DstNet { addr: Ipv4Addr, prefix: u8 },
    SrcPort(u16),
    DstPort(u16),
    Protocol(u8),
    Vlan(u16),
}

impl RuleMatch {
    /// 按匹配维度解析操作数字符串
    pub fn parse(match_type: MatchType, value: &str) -> Result<Self, RuleError> {
        let value = value.trim();
        match match_type {
            MatchType::SrcIp => Ok(RuleMatch::SrcIp(parse_ip(value)?)),
            MatchType::DstIp => Ok(RuleMatch::DstIp(parse_ip(value)?)),
            MatchType::SrcNet => {
                let (addr, prefix) = parse_cidr(value)?;
                Ok(RuleMatch::SrcNet { addr, prefix })
            }
            MatchType::DstNet => {
                let (addr, prefix) = parse_cidr(value)?;
                Ok(RuleMatch::DstNet { addr, prefix })
            }
            MatchType::SrcPort => Ok(RuleMatch::SrcPort(parse_port(value)?)),
            MatchType::DstPort => Ok(RuleMatch::DstPort(parse_port(value)?)),
            MatchType::Protocol => Ok(RuleMatch::Protocol(parse_protocol(value)?)),
            MatchType::Vlan => {
                let vid: u16 = value
                    .parse()
                    .map_err(|_| invalid(format!("无效的 VLAN ID: {}", value)))?;
                if vid > 4095 {
                    return Err(invalid(format!("VLAN ID 超出范围: {}", vid)));
                }
                Ok(RuleMatch::Vlan(vid))
            }
        }
    }

    pub fn match_type(&self) -> MatchType {
        match self {
            RuleMatch::SrcIp(_) => MatchType::SrcIp,
            RuleMatch::DstIp(_) => MatchType::DstIp,
            RuleMatch::SrcNet { .. } => MatchType::SrcNet,
            RuleMatch::DstNet { .. } => MatchType::DstNet,
            RuleMatch::SrcPort(_) => MatchType::SrcPort,
            RuleMatch::DstPort(_) => MatchType::DstPort,
            RuleMatch::Protocol(_) => MatchType::Protocol,
            RuleMatch::Vlan(_) => MatchType::Vlan,
        }
    }

    /// 操作数的文本形式，与 `parse` 互逆
    pub fn value_string(&self) -> String {
        match self {
            RuleMatch::SrcIp(ip) | RuleMatch::DstIp(ip) => ip.to_string(),
            RuleMatch::SrcNet { addr, prefix } | RuleMatch::DstNet { addr, prefix } => {
                format!("{}/{}", addr, prefix)
            }
            RuleMatch::SrcPort(p) | RuleMatch::DstPort(p) => p.to_string(),
            RuleMatch::Protocol(p) => p.to_string(),
            RuleMatch::Vlan(v) => v.to_string(),
        }
    }

    fn apply(&self, rule: &mut FilterRule) {
        rule.match_type = self.match_type() as u8;
        match *self {
            RuleMatch::SrcIp(ip) | RuleMatch::DstIp(ip) => {
                rule.match_ip = ip_to_u32(ip.octets());
                rule.match_mask = u32::MAX;
            }
            RuleMatch::SrcNet { addr, prefix } | RuleMatch::DstNet { addr, prefix } => {
                rule.match_ip = ip_to_u32(addr.octets());
                rule.match_mask = prefix_to_mask(prefix);
            }
            RuleMatch::SrcPort(p) | RuleMatch::DstPort(p) => rule.match_port = p,
            RuleMatch::Protocol(p) => rule.match_proto = p as u16,
            RuleMatch::Vlan(v) => rule.match_vlan = v as u32,
        }
    }
}

fn parse_ip(value: &str) -> Result<Ipv4Addr, RuleError> {
    value
        .parse()
        .map_err(|_| invalid(format!("无效的 IPv4 地址: {}", value)))
}

/// 解析 CIDR，地址按掩码归一化；不带前缀视为 /32
fn parse_cidr(value: &str) -> Result<(Ipv4Addr, u8), RuleError> {
    let (addr, prefix) = match value.split_once('/') {
        Some((addr, prefix)) => {
            let prefix: u8 = prefix
                .parse()
                .map_err(|_| invalid(format!("无效的前缀长度: {}", value)))?;
            (parse_ip(addr)?, prefix)
        }
        None => (parse_ip(value)?, 32),
    };
    if prefix > 32 {
        return Err(invalid(format!("前缀长度超出范围: {}", value)));
    }
    let network = ip_to_u32(addr.octets()) & prefix_to_mask(prefix);
    Ok((Ipv4Addr::from(network), prefix))
}

fn parse_port(value: &str) -> Result<u16, RuleError> {
    match value.parse::<u16>() {
        Ok(0) | Err(_) => Err(invalid(format!("端口必须在 1-65535 之间: {}", value))),
        Ok(port) => Ok(port),
    }
}

fn parse_protocol(value: &str) -> Result<u8, RuleError> {
    match value.to_ascii_lowercase().as_str() {
        "tcp" => Ok(PROTOCOL_TCP),
        "udp" => Ok(PROTOCOL_UDP),
        "icmp" => Ok(PROTOCOL_ICMP),
        other => other
            .parse()
            .map_err(|_| invalid(format!("无效的协议: {}", value))),
    }
}

/// 创建/更新规则的请求体
#[derive(Debug, Clone, Deserialize)]
pub struct RuleRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// 同时也是规则表槽位，缺省时分配最小空闲槽位
    #[serde(default)]
    pub priority: Option<u32>,
    pub match_type: MatchType,
    pub match_value: String,
    #[serde(default)]
    pub action: Option<Action>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

/// 持久化的规则记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRule {
    pub id: u32,
    pub name: String,
    pub description: String,
    pub priority: u32,
    pub rule_match: RuleMatch,
    pub action: Action,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredRule {
    /// 按请求构建规则，槽位由调用方决定
    pub fn from_request(id: u32, slot: u32, request: &RuleRequest) -> Result<Self, RuleError> {
        validate_slot(slot)?;
        let rule_match = RuleMatch::parse(request.match_type, &request.match_value)?;
        let now = Utc::now();
        Ok(Self {
            id,
            name: request
                .name
                .clone()
                .unwrap_or_else(|| format!("rule-{}", id)),
            description: request.description.clone().unwrap_or_default(),
            priority: slot,
            rule_match,
            action: request.action.unwrap_or(Action::InspectAll),
            enabled: request.enabled.unwrap_or(true),
            created_at: now,
            updated_at: now,
        })
    }

    /// 编译成内核记录
    pub fn compile(&self) -> FilterRule {
        let mut rule = FilterRule {
            id: self.id,
            priority: self.priority,
            action: self.action as u8,
            enabled: self.enabled as u8,
            ..Default::default()
        };
        self.rule_match.apply(&mut rule);
        rule
    }

    /// 是否落在内核实际扫描的窗口内
    pub fn evaluated(&self) -> bool {
        self.priority < RULE_SCAN_WINDOW
    }

    pub fn view(&self, stats: Option<SerializableRuleStats>) -> RuleView {
        RuleView {
            id: self.id,
            name: self.name.clone(),
            description: self.description.clone(),
            priority: self.priority,
            match_type: self.rule_match.match_type(),
            match_value: self.rule_match.value_string(),
            action: self.action,
            enabled: self.enabled,
            evaluated: self.evaluated(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            stats,
        }
    }
}

pub fn validate_slot(slot: u32) -> Result<(), RuleError> {
    if slot >= MAX_RULES {
        return Err(invalid(format!(
            "优先级必须在 0-{} 之间: {}",
            MAX_RULES - 1,
            slot
        )));
    }
    Ok(())
}

/// API 返回的规则视图
#[derive(Debug, Clone, Serialize)]
pub struct RuleView {
    pub id: u32,
    pub name: String,
    pub description: String,
    pub priority: u32,
    pub match_type: MatchType,
    pub match_value: String,
    pub action: Action,
    pub enabled: bool,
    pub evaluated: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub stats: Option<SerializableRuleStats>,
}
