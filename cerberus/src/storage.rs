use anyhow::{Context, Result};
use log::warn;
use rocksdb::{IteratorMode, Options, WriteBatch, DB};
use std::net::Ipv4Addr;
use std::path::Path;

use crate::steering::rules::StoredRule;
use crate::steering::HostList;

const NEXT_RULE_ID_KEY: &str = "meta:next_rule_id";

// 规则与白/黑名单的持久化存储
pub struct RuleStore {
    db: DB,
}

impl RuleStore {
    pub fn new(path: &Path) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);

        // 数据量很小，写入频率低
        opts.set_write_buffer_size(4 * 1024 * 1024); // 4MB
        opts.set_max_write_buffer_number(2);
        opts.set_max_open_files(64);
        opts.set_use_fsync(true);

        let db = DB::open(&opts, path)
            .with_context(|| format!("Failed to open RocksDB at path: {}", path.display()))?;

        Ok(RuleStore { db })
    }

    // 规则键格式: "rule:{id}"，id 补零保证按序遍历
    fn rule_key(id: u32) -> String {
        format!("rule:{:010}", id)
    }

    // 名单键格式: "host:{allow|deny}:{ip}"
    fn host_key(list: HostList, addr: Ipv4Addr) -> String {
        format!("host:{}:{}", list.as_str(), addr)
    }

    /// 保存规则，同时推进下一个可用 id
    pub fn put_rule(&self, rule: &StoredRule) -> Result<()> {
        let mut batch = WriteBatch::default();
        batch.put(Self::rule_key(rule.id), bincode::serialize(rule)?);
        if rule.id >= self.next_rule_id()? {
            batch.put(NEXT_RULE_ID_KEY, (rule.id + 1).to_be_bytes());
        }
        self.db.write(batch)?;
        Ok(())
    }

    /// 一次写入多条已有规则，用于批量调整槽位
    pub fn put_rules(&self, rules: &[StoredRule]) -> Result<()> {
        let mut batch = WriteBatch::default();
        for rule in rules {
            batch.put(Self::rule_key(rule.id), bincode::serialize(rule)?);
        }
        self.db.write(batch)?;
        Ok(())
    }

    pub fn delete_rule(&self, id: u32) -> Result<()> {
        self.db.delete(Self::rule_key(id))?;
        Ok(())
    }

    /// 读取全部规则，无法反序列化的记录跳过
    pub fn load_rules(&self) -> Result<Vec<StoredRule>> {
        let prefix = "rule:";
        let mut results = Vec::new();
        let iter = self.db.iterator(IteratorMode::From(
            prefix.as_bytes(),
            rocksdb::Direction::Forward,
        ));

        for item in iter {
            let (key, value) = item?;
            let key_str = String::from_utf8_lossy(&key);
            if !key_str.starts_with(prefix) {
                break;
            }

            match bincode::deserialize::<StoredRule>(&value) {
                Ok(rule) => results.push(rule),
                Err(e) => warn!("跳过无法解析的规则记录 {}: {}", key_str, e),
            }
        }

        Ok(results)
    }

    /// 下一个规则 id，从 1 开始
    pub fn next_rule_id(&self) -> Result<u32> {
        match self.db.get(NEXT_RULE_ID_KEY)? {
            Some(bytes) if bytes.len() == 4 => {
                let mut raw = [0u8; 4];
                raw.copy_from_slice(&bytes);
                Ok(u32::from_be_bytes(raw))
            }
            _ => Ok(1),
        }
    }

    pub fn put_host(&self, list: HostList, addr: Ipv4Addr) -> Result<()> {
        self.db.put(Self::host_key(list, addr), b"")?;
        Ok(())
    }

    pub fn delete_host(&self, list: HostList, addr: Ipv4Addr) -> Result<()> {
        self.db.delete(Self::host_key(list, addr))?;
        Ok(())
    }

    pub fn load_hosts(&self, list: HostList) -> Result<Vec<Ipv4Addr>> {
        let prefix = format!("host:{}:", list.as_str());
        let mut results = Vec::new();
        let iter = self.db.iterator(IteratorMode::From(
            prefix.as_bytes(),
            rocksdb::Direction::Forward,
        ));

        for item in iter {
            let (key, _) = item?;
            let key_str = String::from_utf8_lossy(&key);
            let Some(addr) = key_str.strip_prefix(prefix.as_str()) else {
                break;
            };
            match addr.parse() {
                Ok(ip) => results.push(ip),
                Err(_) => warn!("跳过无法解析的名单记录 {}", key_str),
            }
        }

        Ok(results)
    }
}
