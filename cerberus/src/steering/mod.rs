//! XDP 分类器控制面：加载/挂载程序，管理规则表和白/黑名单。
//!
//! 用户态保存一份权威副本（并持久化到 RocksDB），每次变更逐槽位写入内核 map；
//! 程序重新挂载后整份副本会被重放。

pub mod loader;
pub mod maps;
pub mod rules;

use log::{info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use tokio::sync::Mutex;

use cerberus_common::{HOST_LIST_CAPACITY, MAX_RULES, RULE_SCAN_WINDOW};

use crate::analytics::{StatsSample, SteeringAnalyzer, SteeringSnapshot};
use crate::metrics::Metrics;
use crate::storage::RuleStore;

use self::maps::SteeringMaps;
use self::rules::{validate_slot, RuleError, RuleRequest, RuleView, StoredRule};

/// XDP 挂载模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum XdpMode {
    Default,
    Skb,
    Driver,
    Hw,
}

impl FromStr for XdpMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "default" | "auto" => Ok(XdpMode::Default),
            "skb" | "generic" => Ok(XdpMode::Skb),
            "driver" | "drv" | "native" => Ok(XdpMode::Driver),
            "hw" | "offload" => Ok(XdpMode::Hw),
            other => Err(format!("unknown XDP mode: {}", other)),
        }
    }
}

/// 源地址名单
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostList {
    Allow,
    Deny,
}

impl HostList {
    pub fn as_str(self) -> &'static str {
        match self {
            HostList::Allow => "allow",
            HostList::Deny => "deny",
        }
    }
}

impl fmt::Display for HostList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 分类器运行状态
#[derive(Debug, Clone, Serialize)]
pub struct SteeringStatus {
    pub attached: bool,
    pub interface: Option<String>,
    pub mode: Option<XdpMode>,
    pub error: Option<String>,
    pub rule_count: usize,
    pub allow_count: usize,
    pub deny_count: usize,
    pub max_rules: u32,
    pub scan_window: u32,
}

#[derive(Default)]
struct AttachInfo {
    interface: Option<String>,
    mode: Option<XdpMode>,
    error: Option<String>,
}

struct SteeringState {
    rules: BTreeMap<u32, StoredRule>,
    allow: BTreeSet<Ipv4Addr>,
    deny: BTreeSet<Ipv4Addr>,
    next_id: u32,
    store: Option<RuleStore>,
    maps: Option<Box<dyn SteeringMaps>>,
    attach: AttachInfo,
}

impl SteeringState {
    fn slot_owner(&self, slot: u32) -> Option<u32> {
        self.rules
            .values()
            .find(|r| r.priority == slot)
            .map(|r| r.id)
    }

    /// 最小空闲槽位，优先在扫描窗口内分配
    fn free_slot(&self) -> Option<u32> {
        let used: BTreeSet<u32> = self.rules.values().map(|r| r.priority).collect();
        (0..MAX_RULES).find(|slot| !used.contains(slot))
    }

    fn hosts(&self, list: HostList) -> &BTreeSet<Ipv4Addr> {
        match list {
            HostList::Allow => &self.allow,
            HostList::Deny => &self.deny,
        }
    }

    fn hosts_mut(&mut self, list: HostList) -> &mut BTreeSet<Ipv4Addr> {
        match list {
            HostList::Allow => &mut self.allow,
            HostList::Deny => &mut self.deny,
        }
    }

    fn write_slot(&mut self, slot: u32, rule: Option<&StoredRule>) -> Result<(), RuleError> {
        if let Some(maps) = self.maps.as_mut() {
            let result = match rule {
                Some(rule) => maps.set_rule(slot, &rule.compile()),
                None => maps.clear_rule(slot),
            };
            result.map_err(RuleError::Map)?;
        }
        Ok(())
    }

    fn persist<F>(&self, f: F) -> Result<(), RuleError>
    where
        F: FnOnce(&RuleStore) -> anyhow::Result<()>,
    {
        match &self.store {
            Some(store) => f(store).map_err(RuleError::Storage),
            None => Ok(()),
        }
    }

    /// 内核写入失败后撤销已持久化的变更
    fn restore<F>(&self, f: F)
    where
        F: FnOnce(&RuleStore) -> anyhow::Result<()>,
    {
        if let Err(e) = self.persist(f) {
            warn!("回滚持久化记录失败: {}", e);
        }
    }

    /// 按 (旧, 新) 记录改写槽位：先写新槽位，再清空不再使用的旧槽位。
    /// 任一步失败时把涉及的槽位恢复为原内容。
    fn apply_layout(&mut self, changed: &[(StoredRule, StoredRule)]) -> Result<(), RuleError> {
        let vacated: Vec<u32> = changed
            .iter()
            .map(|(old, _)| old.priority)
            .filter(|slot| !changed.iter().any(|(_, new)| new.priority == *slot))
            .collect();

        let mut result = Ok(());
        for (_, new) in changed {
            result = self.write_slot(new.priority, Some(new));
            if result.is_err() {
                break;
            }
        }
        if result.is_ok() {
            for slot in &vacated {
                result = self.write_slot(*slot, None);
                if result.is_err() {
                    break;
                }
            }
        }

        if result.is_err() {
            for (old, new) in changed {
                for slot in [old.priority, new.priority] {
                    let prior = changed
                        .iter()
                        .find(|(o, _)| o.priority == slot)
                        .map(|(o, _)| o);
                    if let Err(e) = self.write_slot(slot, prior) {
                        warn!("恢复槽位 {} 失败: {}", slot, e);
                    }
                }
            }
        }
        result
    }
}

/// 分类器控制面，所有变更串行执行
pub struct SteeringService {
    state: Mutex<SteeringState>,
    analyzer: Mutex<SteeringAnalyzer>,
    latest: Mutex<Option<SteeringSnapshot>>,
    metrics: Metrics,
}

impl SteeringService {
    /// 创建控制面并载入持久化的规则和名单
    pub fn new(store: Option<RuleStore>, metrics: Metrics) -> anyhow::Result<Self> {
        let mut rules = BTreeMap::new();
        let mut allow = BTreeSet::new();
        let mut deny = BTreeSet::new();
        let mut next_id = 1;

        if let Some(store) = &store {
            for rule in store.load_rules()? {
                rules.insert(rule.id, rule);
            }
            allow.extend(store.load_hosts(HostList::Allow)?);
            deny.extend(store.load_hosts(HostList::Deny)?);
            next_id = store.next_rule_id()?;
            info!(
                "已载入 {} 条规则, 白名单 {} 条, 黑名单 {} 条",
                rules.len(),
                allow.len(),
                deny.len()
            );
        }
        if let Some(max_id) = rules.keys().next_back() {
            next_id = next_id.max(max_id + 1);
        }

        metrics.host_list_size.with_label_values(&["allow"]).set(allow.len() as i64);
        metrics.host_list_size.with_label_values(&["deny"]).set(deny.len() as i64);

        Ok(Self {
            state: Mutex::new(SteeringState {
                rules,
                allow,
                deny,
                next_id,
                store,
                maps: None,
                attach: AttachInfo::default(),
            }),
            analyzer: Mutex::new(SteeringAnalyzer::new()),
            latest: Mutex::new(None),
            metrics,
        })
    }

    /// 接入内核 map 并重放全部规则和名单，返回写入失败的条目数
    pub async fn attach_maps(
        &self,
        mut maps: Box<dyn SteeringMaps>,
        interface: &str,
        mode: XdpMode,
    ) -> usize {
        let mut state = self.state.lock().await;
        let mut failures = 0;

        for rule in state.rules.values() {
            if let Err(e) = maps.set_rule(rule.priority, &rule.compile()) {
                warn!("重放规则 {} 失败: {:#}", rule.id, e);
                failures += 1;
            }
        }
        for list in [HostList::Allow, HostList::Deny] {
            for addr in state.hosts(list) {
                if let Err(e) = maps.insert_host(list, *addr) {
                    warn!("重放{}名单 {} 失败: {:#}", list, addr, e);
                    failures += 1;
                }
            }
        }

        info!(
            "已向内核重放 {} 条规则, {} 条名单",
            state.rules.len(),
            state.allow.len() + state.deny.len()
        );

        state.maps = Some(maps);
        state.attach = AttachInfo {
            interface: Some(interface.to_string()),
            mode: Some(mode),
            error: None,
        };
        self.metrics.xdp_attached.set(1);
        failures
    }

    /// 记录挂载失败，分类器保持禁用，管理接口照常工作
    pub async fn mark_unavailable(&self, error: String) {
        let mut state = self.state.lock().await;
        state.maps = None;
        state.attach.error = Some(error);
        self.metrics.xdp_attached.set(0);
    }

    /// 断开内核 map
    pub async fn detach_maps(&self) {
        let mut state = self.state.lock().await;
        state.maps = None;
        state.attach = AttachInfo::default();
        self.metrics.xdp_attached.set(0);
    }

    pub async fn status(&self) -> SteeringStatus {
        let state = self.state.lock().await;
        SteeringStatus {
            attached: state.maps.is_some(),
            interface: state.attach.interface.clone(),
            mode: state.attach.mode,
            error: state.attach.error.clone(),
            rule_count: state.rules.len(),
            allow_count: state.allow.len(),
            deny_count: state.deny.len(),
            max_rules: MAX_RULES,
            scan_window: RULE_SCAN_WINDOW,
        }
    }

    // === 规则 ===

    fn view_with_stats(state: &SteeringState, rule: &StoredRule) -> RuleView {
        let stats = state
            .maps
            .as_ref()
            .and_then(|maps| maps.rule_stats(rule.priority).ok())
            .map(Into::into);
        rule.view(stats)
    }

    /// 按优先级列出规则
    pub async fn list_rules(&self) -> Vec<RuleView> {
        let state = self.state.lock().await;
        let mut rules: Vec<&StoredRule> = state.rules.values().collect();
        rules.sort_by_key(|r| r.priority);
        rules
            .into_iter()
            .map(|r| Self::view_with_stats(&state, r))
            .collect()
    }

    pub async fn get_rule(&self, id: u32) -> Result<RuleView, RuleError> {
        let state = self.state.lock().await;
        let rule = state.rules.get(&id).ok_or(RuleError::NotFound(id))?;
        Ok(Self::view_with_stats(&state, rule))
    }

    pub async fn create_rule(&self, request: RuleRequest) -> Result<RuleView, RuleError> {
        let mut state = self.state.lock().await;

        let slot = match request.priority {
            Some(slot) => {
                validate_slot(slot)?;
                if let Some(owner) = state.slot_owner(slot) {
                    return Err(RuleError::SlotTaken { slot, owner });
                }
                slot
            }
            None => state.free_slot().ok_or(RuleError::TableFull)?,
        };

        let id = state.next_id;
        let rule = StoredRule::from_request(id, slot, &request)?;

        state.persist(|store| store.put_rule(&rule))?;
        // 已写入存储的 id 不再复用
        state.next_id = id + 1;
        if let Err(e) = state.write_slot(slot, Some(&rule)) {
            state.restore(|store| store.delete_rule(id));
            return Err(e);
        }

        if !rule.evaluated() {
            warn!(
                "规则 {} 位于槽位 {}，超出内核扫描窗口 {}，不会生效",
                id, slot, RULE_SCAN_WINDOW
            );
        }
        info!(
            "新增规则 {} [{}] 槽位 {}: {:?} {} -> {}",
            id,
            rule.name,
            slot,
            rule.rule_match.match_type(),
            rule.rule_match.value_string(),
            rule.action.as_str()
        );

        let view = rule.view(None);
        state.rules.insert(id, rule);
        Ok(view)
    }

    /// 整体替换规则内容，优先级变化时迁移槽位
    pub async fn update_rule(&self, id: u32, request: RuleRequest) -> Result<RuleView, RuleError> {
        let mut state = self.state.lock().await;
        let existing = state.rules.get(&id).cloned().ok_or(RuleError::NotFound(id))?;

        let slot = request.priority.unwrap_or(existing.priority);
        validate_slot(slot)?;
        if let Some(owner) = state.slot_owner(slot).filter(|owner| *owner != id) {
            return Err(RuleError::SlotTaken { slot, owner });
        }

        let mut rule = StoredRule::from_request(id, slot, &request)?;
        rule.created_at = existing.created_at;
        if request.name.is_none() {
            rule.name = existing.name.clone();
        }

        state.persist(|store| store.put_rule(&rule))?;
        if let Err(e) = state.apply_layout(&[(existing.clone(), rule.clone())]) {
            state.restore(|store| store.put_rule(&existing));
            return Err(e);
        }

        info!("更新规则 {} 槽位 {} -> {}", id, existing.priority, slot);
        let view = Self::view_with_stats(&state, &rule);
        state.rules.insert(id, rule);
        Ok(view)
    }

    pub async fn delete_rule(&self, id: u32) -> Result<(), RuleError> {
        let mut state = self.state.lock().await;
        let existing = state.rules.get(&id).cloned().ok_or(RuleError::NotFound(id))?;
        let slot = existing.priority;

        state.persist(|store| store.delete_rule(id))?;
        if let Err(e) = state.write_slot(slot, None) {
            state.restore(|store| store.put_rule(&existing));
            return Err(e);
        }
        state.rules.remove(&id);

        info!("删除规则 {} (槽位 {})", id, slot);
        Ok(())
    }

    /// 切换启用状态
    pub async fn toggle_rule(&self, id: u32) -> Result<RuleView, RuleError> {
        let mut state = self.state.lock().await;
        let existing = state.rules.get(&id).cloned().ok_or(RuleError::NotFound(id))?;
        let mut rule = existing.clone();
        rule.enabled = !rule.enabled;
        rule.updated_at = chrono::Utc::now();

        state.persist(|store| store.put_rule(&rule))?;
        if let Err(e) = state.apply_layout(&[(existing.clone(), rule.clone())]) {
            state.restore(|store| store.put_rule(&existing));
            return Err(e);
        }

        info!("规则 {} 已{}", id, if rule.enabled { "启用" } else { "禁用" });
        let view = Self::view_with_stats(&state, &rule);
        state.rules.insert(id, rule);
        Ok(view)
    }

    /// 按给定顺序把规则放到槽位 0..n。未列出的规则保持原槽位，
    /// 原槽位被占用时顺延到最小空闲槽位。
    pub async fn reorder_rules(&self, order: &[u32]) -> Result<Vec<RuleView>, RuleError> {
        let mut state = self.state.lock().await;

        let mut layout: BTreeMap<u32, u32> = BTreeMap::new();
        for (index, id) in order.iter().enumerate() {
            if !state.rules.contains_key(id) {
                return Err(RuleError::NotFound(*id));
            }
            if layout.insert(*id, index as u32).is_some() {
                return Err(RuleError::Invalid(format!("规则 {} 在排序中重复出现", id)));
            }
        }

        let mut used: BTreeSet<u32> = layout.values().copied().collect();
        let mut rest: Vec<&StoredRule> = state
            .rules
            .values()
            .filter(|r| !layout.contains_key(&r.id))
            .collect();
        rest.sort_by_key(|r| r.priority);
        let mut displaced = Vec::new();
        for rule in rest {
            if used.insert(rule.priority) {
                layout.insert(rule.id, rule.priority);
            } else {
                displaced.push(rule.id);
            }
        }
        for id in displaced {
            let slot = (0..MAX_RULES)
                .find(|slot| !used.contains(slot))
                .ok_or(RuleError::TableFull)?;
            used.insert(slot);
            layout.insert(id, slot);
        }

        let now = chrono::Utc::now();
        let changed: Vec<(StoredRule, StoredRule)> = state
            .rules
            .values()
            .filter(|r| layout[&r.id] != r.priority)
            .map(|r| {
                let mut moved = r.clone();
                moved.priority = layout[&r.id];
                moved.updated_at = now;
                (r.clone(), moved)
            })
            .collect();

        if !changed.is_empty() {
            let moved: Vec<StoredRule> = changed.iter().map(|(_, new)| new.clone()).collect();
            state.persist(|store| store.put_rules(&moved))?;
            if let Err(e) = state.apply_layout(&changed) {
                let previous: Vec<StoredRule> = changed.iter().map(|(old, _)| old.clone()).collect();
                state.restore(|store| store.put_rules(&previous));
                return Err(e);
            }
            for rule in moved {
                state.rules.insert(rule.id, rule);
            }
            info!("规则重新排序: {} 条规则移动了槽位", changed.len());
        }

        let mut rules: Vec<&StoredRule> = state.rules.values().collect();
        rules.sort_by_key(|r| r.priority);
        Ok(rules
            .into_iter()
            .map(|r| Self::view_with_stats(&state, r))
            .collect())
    }

    // === 白/黑名单 ===

    pub async fn list_hosts(&self, list: HostList) -> Vec<Ipv4Addr> {
        let state = self.state.lock().await;
        state.hosts(list).iter().copied().collect()
    }

    /// 添加 /32 条目，已存在时返回 false
    pub async fn add_host(&self, list: HostList, addr: Ipv4Addr) -> Result<bool, RuleError> {
        let mut state = self.state.lock().await;
        if state.hosts(list).contains(&addr) {
            return Ok(false);
        }
        if state.hosts(list).len() >= HOST_LIST_CAPACITY as usize {
            return Err(RuleError::Invalid(format!(
                "{}名单已达上限 {}",
                list, HOST_LIST_CAPACITY
            )));
        }

        state.persist(|store| store.put_host(list, addr))?;
        if let Some(maps) = state.maps.as_mut() {
            if let Err(e) = maps.insert_host(list, addr) {
                state.restore(|store| store.delete_host(list, addr));
                return Err(RuleError::Map(e));
            }
        }
        state.hosts_mut(list).insert(addr);

        let size = state.hosts(list).len() as i64;
        self.metrics
            .host_list_size
            .with_label_values(&[list.as_str()])
            .set(size);
        info!("添加 {} 到{}名单", addr, list);
        Ok(true)
    }

    pub async fn remove_host(&self, list: HostList, addr: Ipv4Addr) -> Result<(), RuleError> {
        let mut state = self.state.lock().await;
        if !state.hosts(list).contains(&addr) {
            return Err(RuleError::HostNotFound {
                addr,
                list: list.as_str(),
            });
        }

        state.persist(|store| store.delete_host(list, addr))?;
        if let Some(maps) = state.maps.as_mut() {
            if let Err(e) = maps.remove_host(list, addr) {
                state.restore(|store| store.put_host(list, addr));
                return Err(RuleError::Map(e));
            }
        }
        state.hosts_mut(list).remove(&addr);

        let size = state.hosts(list).len() as i64;
        self.metrics
            .host_list_size
            .with_label_values(&[list.as_str()])
            .set(size);
        info!("从{}名单移除 {}", list, addr);
        Ok(())
    }

    // === 统计 ===

    /// 读取内核计数，未挂载时返回 None
    pub async fn sample_stats(&self) -> Option<StatsSample> {
        let state = self.state.lock().await;
        let maps = state.maps.as_ref()?;

        let global = match maps.global_stats() {
            Ok(g) => g,
            Err(e) => {
                warn!("读取全局统计失败: {:#}", e);
                return None;
            }
        };
        let mut rules = BTreeMap::new();
        for rule in state.rules.values() {
            if let Ok(stats) = maps.rule_stats(rule.priority) {
                rules.insert(rule.priority, stats);
            }
        }
        Some(StatsSample { global, rules })
    }

    /// 采样一次并更新快照和指标，由统计任务周期调用
    pub async fn collect_stats(&self) -> Option<SteeringSnapshot> {
        let sample = self.sample_stats().await?;

        let snapshot = {
            let mut analyzer = self.analyzer.lock().await;
            let previous = analyzer.previous().map(|p| p.global).unwrap_or_default();
            self.metrics.observe_global_delta(&previous, &sample.global);
            for (slot, stats) in &sample.rules {
                self.metrics
                    .xdp_rule_packets
                    .with_label_values(&[slot.to_string().as_str()])
                    .set(stats.packets as i64);
            }
            analyzer.analyze(sample)
        };

        *self.latest.lock().await = Some(snapshot.clone());
        Some(snapshot)
    }

    /// 最近一次统计快照
    pub async fn latest_snapshot(&self) -> Option<SteeringSnapshot> {
        self.latest.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::maps::memory::MemoryMaps;
    use super::*;
    use crate::storage::tests::{read_only_store, temp_store_path};
    use cerberus_common::classify::{classify, Verdict};
    use cerberus_common::frame::SliceFrame;
    use cerberus_common::{Action, MatchType};

    fn request(priority: Option<u32>, match_type: MatchType, value: &str, action: Action) -> RuleRequest {
        RuleRequest {
            name: None,
            description: None,
            priority,
            match_type,
            match_value: value.to_string(),
            action: Some(action),
            enabled: None,
        }
    }

    async fn attached_service() -> (SteeringService, MemoryMaps) {
        let service = SteeringService::new(None, Metrics::new().unwrap()).unwrap();
        let maps = MemoryMaps::default();
        service
            .attach_maps(Box::new(maps.clone()), "lo", XdpMode::Skb)
            .await;
        (service, maps)
    }

    /// 以太网 + IPv4 + TCP 帧
    fn tcp_frame(src: [u8; 4], dst: [u8; 4], dst_port: u16) -> Vec<u8> {
        let mut buf = vec![0u8; 12];
        buf.extend_from_slice(&0x0800u16.to_be_bytes());
        let mut ip = [0u8; 20];
        ip[0] = 0x45;
        ip[9] = 6;
        ip[12..16].copy_from_slice(&src);
        ip[16..20].copy_from_slice(&dst);
        buf.extend_from_slice(&ip);
        let mut tcp = [0u8; 20];
        tcp[0..2].copy_from_slice(&51000u16.to_be_bytes());
        tcp[2..4].copy_from_slice(&dst_port.to_be_bytes());
        buf.extend_from_slice(&tcp);
        buf
    }

    #[tokio::test]
    async fn test_rules_drive_classification() {
        let (service, maps) = attached_service().await;

        service
            .create_rule(request(Some(5), MatchType::DstPort, "22", Action::Drop))
            .await
            .unwrap();
        service
            .create_rule(request(Some(1), MatchType::SrcNet, "10.0.0.0/8", Action::Pass))
            .await
            .unwrap();

        let check = |src: [u8; 4], port: u16| {
            let mut state = maps.0.lock().unwrap();
            let frame = tcp_frame(src, [192, 0, 2, 1], port);
            let decision = classify(&SliceFrame(&frame), &*state);
            state.account(&decision);
            decision.verdict
        };

        // 槽位 1 先于槽位 5
        assert_eq!(check([10, 1, 1, 1], 22), Verdict::Pass);
        assert_eq!(check([172, 16, 0, 1], 22), Verdict::Drop);
        assert_eq!(check([172, 16, 0, 1], 80), Verdict::Pass);

        service
            .add_host(HostList::Deny, Ipv4Addr::new(10, 9, 9, 9))
            .await
            .unwrap();
        assert_eq!(check([10, 9, 9, 9], 80), Verdict::Drop);

        let sample = service.sample_stats().await.unwrap();
        assert_eq!(sample.global.total_packets, 4);
        assert_eq!(sample.global.dropped_packets, 2);
        assert_eq!(sample.rules[&1].packets, 1);
        assert_eq!(sample.rules[&5].packets, 1);

        let snapshot = service.collect_stats().await.unwrap();
        assert_eq!(snapshot.totals.total_packets, 4);
        assert_eq!(snapshot.top_rules.len(), 2);
        assert!(service.latest_snapshot().await.is_some());

        let listed = service.list_rules().await;
        assert_eq!(listed.iter().map(|r| r.priority).collect::<Vec<_>>(), vec![1, 5]);
        assert_eq!(listed[1].stats.map(|s| s.packets), Some(1));
    }

    #[tokio::test]
    async fn test_slot_conflicts_and_moves() {
        let (service, maps) = attached_service().await;
        let a = service
            .create_rule(request(Some(3), MatchType::DstPort, "80", Action::Drop))
            .await
            .unwrap();
        let err = service
            .create_rule(request(Some(3), MatchType::DstPort, "81", Action::Drop))
            .await
            .unwrap_err();
        assert!(matches!(err, RuleError::SlotTaken { slot: 3, owner } if owner == a.id));

        let b = service
            .create_rule(request(None, MatchType::DstPort, "443", Action::Capture))
            .await
            .unwrap();
        assert_eq!(b.priority, 0);

        // 迁移到新槽位后旧槽位被清空
        let moved = service
            .update_rule(a.id, request(Some(7), MatchType::DstPort, "8080", Action::Pass))
            .await
            .unwrap();
        assert_eq!(moved.priority, 7);
        {
            let state = maps.0.lock().unwrap();
            assert!(!state.rules[&3].is_enabled());
            assert_eq!(state.rules[&7].match_port, 8080);
        }

        let err = service
            .update_rule(b.id, request(Some(7), MatchType::DstPort, "1", Action::Pass))
            .await
            .unwrap_err();
        assert!(matches!(err, RuleError::SlotTaken { .. }));

        assert!(matches!(
            service
                .create_rule(request(Some(MAX_RULES), MatchType::DstPort, "1", Action::Pass))
                .await,
            Err(RuleError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_toggle_and_delete() {
        let (service, maps) = attached_service().await;
        let rule = service
            .create_rule(request(Some(2), MatchType::Protocol, "udp", Action::InspectIds))
            .await
            .unwrap();
        assert!(rule.enabled);

        let toggled = service.toggle_rule(rule.id).await.unwrap();
        assert!(!toggled.enabled);
        assert_eq!(maps.0.lock().unwrap().rules[&2].enabled, 0);

        service.delete_rule(rule.id).await.unwrap();
        assert!(matches!(
            service.get_rule(rule.id).await,
            Err(RuleError::NotFound(_))
        ));
        assert_eq!(maps.0.lock().unwrap().rules[&2], cerberus_common::FilterRule::default());
        assert!(matches!(
            service.delete_rule(rule.id).await,
            Err(RuleError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_map_failure_leaves_state_unchanged() {
        let (service, maps) = attached_service().await;
        maps.0.lock().unwrap().fail_writes = true;

        let err = service
            .create_rule(request(Some(0), MatchType::DstPort, "22", Action::Drop))
            .await
            .unwrap_err();
        assert!(matches!(err, RuleError::Map(_)));
        assert!(service.list_rules().await.is_empty());

        let err = service
            .add_host(HostList::Allow, Ipv4Addr::new(1, 1, 1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, RuleError::Map(_)));
        assert!(service.list_hosts(HostList::Allow).await.is_empty());
    }

    #[tokio::test]
    async fn test_detached_service_still_manages_rules() {
        let service = SteeringService::new(None, Metrics::new().unwrap()).unwrap();
        service.mark_unavailable("no such interface".into()).await;

        let rule = service
            .create_rule(request(None, MatchType::SrcIp, "1.2.3.4", Action::Drop))
            .await
            .unwrap();
        assert_eq!(rule.stats, None);
        assert!(service.sample_stats().await.is_none());

        let status = service.status().await;
        assert!(!status.attached);
        assert_eq!(status.error.as_deref(), Some("no such interface"));
        assert_eq!(status.rule_count, 1);
    }

    #[tokio::test]
    async fn test_persisted_state_is_replayed_on_attach() {
        let path = temp_store_path("replay");
        {
            let store = RuleStore::new(&path).unwrap();
            let service = SteeringService::new(Some(store), Metrics::new().unwrap()).unwrap();
            service
                .create_rule(request(Some(4), MatchType::DstNet, "198.51.100.0/24", Action::Drop))
                .await
                .unwrap();
            service
                .add_host(HostList::Allow, Ipv4Addr::new(198, 51, 100, 7))
                .await
                .unwrap();
        }

        let store = RuleStore::new(&path).unwrap();
        let service = SteeringService::new(Some(store), Metrics::new().unwrap()).unwrap();
        let maps = MemoryMaps::default();
        let failures = service
            .attach_maps(Box::new(maps.clone()), "eth0", XdpMode::Default)
            .await;
        assert_eq!(failures, 0);

        {
            let state = maps.0.lock().unwrap();
            assert_eq!(state.rules[&4].match_mask, 0xFFFF_FF00);
            assert!(state.allow.contains(&Ipv4Addr::new(198, 51, 100, 7)));
        }

        // 新规则的 id 不会与已持久化的冲突
        let next = service
            .create_rule(request(None, MatchType::DstPort, "25", Action::Drop))
            .await
            .unwrap();
        assert_eq!(next.id, 2);
        assert_eq!(next.priority, 0);

        drop(service);
        std::fs::remove_dir_all(&path).unwrap();
    }

    #[tokio::test]
    async fn test_host_list_semantics() {
        let (service, _maps) = attached_service().await;
        let ip = Ipv4Addr::new(203, 0, 113, 5);
        assert!(service.add_host(HostList::Deny, ip).await.unwrap());
        assert!(!service.add_host(HostList::Deny, ip).await.unwrap());
        assert_eq!(service.list_hosts(HostList::Deny).await, vec![ip]);
        assert!(matches!(
            service.remove_host(HostList::Allow, ip).await,
            Err(RuleError::HostNotFound { .. })
        ));
        service.remove_host(HostList::Deny, ip).await.unwrap();
        assert!(service.list_hosts(HostList::Deny).await.is_empty());
    }

    #[tokio::test]
    async fn test_storage_failure_leaves_kernel_untouched() {
        let path = temp_store_path("readonly");
        let existing_id = {
            let store = RuleStore::new(&path).unwrap();
            let service = SteeringService::new(Some(store), Metrics::new().unwrap()).unwrap();
            service
                .create_rule(request(Some(3), MatchType::DstPort, "22", Action::Drop))
                .await
                .unwrap()
                .id
        };

        // 只读打开后所有持久化都会失败
        let store = read_only_store(&path);
        let service = SteeringService::new(Some(store), Metrics::new().unwrap()).unwrap();
        let maps = MemoryMaps::default();
        service
            .attach_maps(Box::new(maps.clone()), "lo", XdpMode::Skb)
            .await;

        let err = service
            .create_rule(request(Some(0), MatchType::DstPort, "23", Action::Drop))
            .await
            .unwrap_err();
        assert!(matches!(err, RuleError::Storage(_)));
        assert!(!maps.0.lock().unwrap().rules.contains_key(&0));

        let err = service
            .update_rule(existing_id, request(Some(9), MatchType::DstPort, "2222", Action::Drop))
            .await
            .unwrap_err();
        assert!(matches!(err, RuleError::Storage(_)));
        assert!(matches!(service.toggle_rule(existing_id).await, Err(RuleError::Storage(_))));
        assert!(matches!(service.delete_rule(existing_id).await, Err(RuleError::Storage(_))));
        assert!(matches!(
            service.add_host(HostList::Deny, Ipv4Addr::new(192, 0, 2, 9)).await,
            Err(RuleError::Storage(_))
        ));

        // 内核与用户态副本保持一致
        {
            let state = maps.0.lock().unwrap();
            assert!(!state.rules.contains_key(&9));
            assert!(state.rules[&3].is_enabled());
            assert_eq!(state.rules[&3].match_port, 22);
            assert!(state.deny.is_empty());
        }
        let listed = service.list_rules().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].priority, 3);
        assert!(listed[0].enabled);
        assert!(service.list_hosts(HostList::Deny).await.is_empty());

        drop(service);
        std::fs::remove_dir_all(&path).unwrap();
    }

    #[tokio::test]
    async fn test_failed_move_restores_both_slots() {
        let (service, maps) = attached_service().await;
        let rule = service
            .create_rule(request(Some(3), MatchType::DstPort, "80", Action::Drop))
            .await
            .unwrap();

        // 新槽位写入成功，清空旧槽位失败
        maps.0.lock().unwrap().fail_nth_write = Some(1);
        let err = service
            .update_rule(rule.id, request(Some(7), MatchType::DstPort, "8080", Action::Pass))
            .await
            .unwrap_err();
        assert!(matches!(err, RuleError::Map(_)));

        {
            let state = maps.0.lock().unwrap();
            assert_eq!(state.rules[&3].match_port, 80);
            assert!(state.rules[&3].is_enabled());
            assert!(!state.rules[&7].is_enabled());
        }
        let current = service.get_rule(rule.id).await.unwrap();
        assert_eq!(current.priority, 3);
        assert_eq!(current.match_value, "80");
    }

    #[tokio::test]
    async fn test_reorder_rules() {
        let (service, maps) = attached_service().await;
        let a = service
            .create_rule(request(Some(0), MatchType::DstPort, "22", Action::Drop))
            .await
            .unwrap();
        let b = service
            .create_rule(request(Some(1), MatchType::DstPort, "23", Action::Drop))
            .await
            .unwrap();
        let c = service
            .create_rule(request(Some(2), MatchType::SrcNet, "10.0.0.0/8", Action::Pass))
            .await
            .unwrap();
        let d = service
            .create_rule(request(Some(10), MatchType::Protocol, "udp", Action::Capture))
            .await
            .unwrap();

        // c 提到最前，b 第二；a 的原槽位被占，顺延到最小空闲槽位
        let ordered = service.reorder_rules(&[c.id, b.id]).await.unwrap();
        let layout: Vec<(u32, u32)> = ordered.iter().map(|r| (r.id, r.priority)).collect();
        assert_eq!(layout, vec![(c.id, 0), (b.id, 1), (a.id, 2), (d.id, 10)]);

        {
            let state = maps.0.lock().unwrap();
            assert_eq!(state.rules[&0].match_mask, 0xFF00_0000);
            assert_eq!(state.rules[&1].match_port, 23);
            assert_eq!(state.rules[&2].match_port, 22);
            assert!(state.rules[&10].is_enabled());
        }

        assert!(matches!(
            service.reorder_rules(&[a.id, a.id]).await,
            Err(RuleError::Invalid(_))
        ));
        assert!(matches!(
            service.reorder_rules(&[a.id, 999]).await,
            Err(RuleError::NotFound(999))
        ));
        assert_eq!(service.get_rule(a.id).await.unwrap().priority, 2);
    }
}
