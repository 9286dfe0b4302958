use anyhow::{anyhow, Context, Result};
use aya::maps::lpm_trie::{Key, LpmTrie};
use aya::maps::{Array, MapData, MapError};
use aya::Ebpf;
use log::info;
use std::net::Ipv4Addr;

use cerberus_common::{FilterRule, GlobalStats, RuleStats, MAX_RULES};

use super::HostList;

/// 控制面对内核 map 的全部访问
pub trait SteeringMaps: Send {
    /// 写入一个规则槽位
    fn set_rule(&mut self, slot: u32, rule: &FilterRule) -> Result<()>;

    /// 清空槽位：写入一条禁用的全零记录
    fn clear_rule(&mut self, slot: u32) -> Result<()> {
        self.set_rule(slot, &FilterRule::default())
    }

    /// 插入 /32 主机条目
    fn insert_host(&mut self, list: HostList, addr: Ipv4Addr) -> Result<()>;

    /// 删除主机条目，不存在时不报错
    fn remove_host(&mut self, list: HostList, addr: Ipv4Addr) -> Result<()>;

    fn rule_stats(&self, slot: u32) -> Result<RuleStats>;

    fn global_stats(&self) -> Result<GlobalStats>;
}

/// 从已加载的 eBPF 对象中取出的 map
pub struct KernelMaps {
    filter_rules: Array<MapData, FilterRule>,
    rule_stats: Array<MapData, RuleStats>,
    global_stats: Array<MapData, GlobalStats>,
    allow_list: LpmTrie<MapData, [u8; 4], u8>,
    deny_list: LpmTrie<MapData, [u8; 4], u8>,
}

fn take(ebpf: &mut Ebpf, name: &str) -> Result<aya::maps::Map> {
    ebpf.take_map(name)
        .ok_or_else(|| anyhow!("map '{}' not found", name))
}

impl KernelMaps {
    /// 接管 XDP 程序的五个 map
    pub fn new(ebpf: &mut Ebpf) -> Result<Self> {
        let filter_rules = Array::try_from(take(ebpf, "FILTER_RULES")?)?;
        let rule_stats = Array::try_from(take(ebpf, "RULE_STATS")?)?;
        let global_stats = Array::try_from(take(ebpf, "GLOBAL_STATS")?)?;
        let allow_list = LpmTrie::try_from(take(ebpf, "ALLOW_LIST")?)?;
        let deny_list = LpmTrie::try_from(take(ebpf, "DENY_LIST")?)?;

        info!("已接管分类器 map (规则表 + 统计 + 白/黑名单)");
        Ok(Self {
            filter_rules,
            rule_stats,
            global_stats,
            allow_list,
            deny_list,
        })
    }

    fn list_mut(&mut self, list: HostList) -> &mut LpmTrie<MapData, [u8; 4], u8> {
        match list {
            HostList::Allow => &mut self.allow_list,
            HostList::Deny => &mut self.deny_list,
        }
    }
}

impl SteeringMaps for KernelMaps {
    fn set_rule(&mut self, slot: u32, rule: &FilterRule) -> Result<()> {
        self.filter_rules
            .set(slot, *rule, 0)
            .with_context(|| format!("写入规则槽位 {} 失败", slot))
    }

    fn insert_host(&mut self, list: HostList, addr: Ipv4Addr) -> Result<()> {
        let key = Key::new(32, addr.octets());
        self.list_mut(list)
            .insert(&key, 1, 0)
            .with_context(|| format!("写入 {} 名单 {} 失败", list.as_str(), addr))
    }

    fn remove_host(&mut self, list: HostList, addr: Ipv4Addr) -> Result<()> {
        let key = Key::new(32, addr.octets());
        match self.list_mut(list).remove(&key) {
            Ok(()) => Ok(()),
            Err(e) if is_missing_key(&e) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("删除 {} 名单 {} 失败", list.as_str(), addr)),
        }
    }

    fn rule_stats(&self, slot: u32) -> Result<RuleStats> {
        if slot >= MAX_RULES {
            return Err(anyhow!("槽位 {} 超出范围", slot));
        }
        Ok(self.rule_stats.get(&slot, 0)?)
    }

    fn global_stats(&self) -> Result<GlobalStats> {
        Ok(self.global_stats.get(&0, 0)?)
    }
}

/// LPM trie 删除不存在的键时内核返回 ENOENT，aya 原样包装成系统调用错误
fn is_missing_key(err: &MapError) -> bool {
    match err {
        MapError::KeyNotFound => true,
        MapError::SyscallError(e) => e.io_error.raw_os_error() == Some(libc::ENOENT),
        _ => false,
    }
}

#[cfg(test)]
pub(crate) mod memory {
    //! 内存版 map，同时实现分类器的表查询，便于端到端验证控制面

    use super::*;
    use cerberus_common::classify::{Accounting, Decision, SteeringTables};
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    pub struct MemoryState {
        pub rules: BTreeMap<u32, FilterRule>,
        pub rule_stats: BTreeMap<u32, RuleStats>,
        pub global: GlobalStats,
        pub allow: BTreeSet<Ipv4Addr>,
        pub deny: BTreeSet<Ipv4Addr>,
        pub fail_writes: bool,
        /// 只让第 n 次写入（从 0 计）失败
        pub fail_nth_write: Option<usize>,
    }

    impl MemoryState {
        pub fn account(&mut self, decision: &Decision) {
            match decision.accounting {
                Accounting::None => {}
                Accounting::Global(action) => self.global.record(action, decision.len),
                Accounting::Rule { slot, action } => {
                    let stats = self.rule_stats.entry(slot).or_default();
                    stats.packets += 1;
                    stats.bytes += decision.len;
                    stats.last_hit += 1;
                    self.global.record(action, decision.len);
                }
            }
        }
    }

    impl SteeringTables for MemoryState {
        fn rule(&self, slot: u32) -> Option<FilterRule> {
            self.rules.get(&slot).copied()
        }

        fn allow_listed(&self, addr: u32) -> bool {
            self.allow.contains(&Ipv4Addr::from(addr))
        }

        fn deny_listed(&self, addr: u32) -> bool {
            self.deny.contains(&Ipv4Addr::from(addr))
        }
    }

    /// 共享内部状态，测试可以在交给控制面之后继续观察
    #[derive(Clone, Default)]
    pub struct MemoryMaps(pub Arc<Mutex<MemoryState>>);

    impl MemoryMaps {
        fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
            self.0.lock().unwrap()
        }

        fn check(&self) -> Result<()> {
            let mut state = self.state();
            if state.fail_writes {
                return Err(anyhow!("injected map failure"));
            }
            match state.fail_nth_write {
                Some(0) => {
                    state.fail_nth_write = None;
                    Err(anyhow!("injected map failure"))
                }
                Some(n) => {
                    state.fail_nth_write = Some(n - 1);
                    Ok(())
                }
                None => Ok(()),
            }
        }
    }

    impl SteeringMaps for MemoryMaps {
        fn set_rule(&mut self, slot: u32, rule: &FilterRule) -> Result<()> {
            self.check()?;
            self.state().rules.insert(slot, *rule);
            Ok(())
        }

        fn insert_host(&mut self, list: HostList, addr: Ipv4Addr) -> Result<()> {
            self.check()?;
            let mut state = self.state();
            match list {
                HostList::Allow => state.allow.insert(addr),
                HostList::Deny => state.deny.insert(addr),
            };
            Ok(())
        }

        fn remove_host(&mut self, list: HostList, addr: Ipv4Addr) -> Result<()> {
            self.check()?;
            let mut state = self.state();
            match list {
                HostList::Allow => state.allow.remove(&addr),
                HostList::Deny => state.deny.remove(&addr),
            };
            Ok(())
        }

        fn rule_stats(&self, slot: u32) -> Result<RuleStats> {
            Ok(self.state().rule_stats.get(&slot).copied().unwrap_or_default())
        }

        fn global_stats(&self) -> Result<GlobalStats> {
            Ok(self.state().global)
        }
    }
}
