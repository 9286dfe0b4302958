use log::warn;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::steering::XdpMode;

/// 运行配置，从环境变量读取（`.env` 由 dotenv 预先加载）
#[derive(Debug, Clone)]
pub struct Config {
    pub api_listen_addr: SocketAddr,
    pub proxy_listen_addr: SocketAddr,

    // CA
    pub ca_dir: PathBuf,
    pub ca_cert_file: String,
    pub ca_key_file: String,
    pub ca_common_name: String,
    pub ca_org: String,
    pub ca_validity_days: u32,

    // 代理
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_connections: usize,
    pub buffer_size: usize,
    pub inspect_https: bool,
    pub log_connections: bool,
    pub bypass_domains: Vec<String>,
    pub upstream_tls_verify: bool,
    pub upstream_ca_bundle: PathBuf,

    // XDP
    pub xdp_enabled: bool,
    pub xdp_interface: String,
    pub xdp_mode: XdpMode,
    pub xdp_program_path: PathBuf,
    pub allow_ips: Vec<Ipv4Addr>,
    pub deny_ips: Vec<Ipv4Addr>,
    pub rule_store_path: PathBuf,
    pub stats_interval: Duration,

    // NUMA 与缓冲池
    pub numa_enabled: bool,
    pub numa_node: u32,
    pub buffer_pool_slots: usize,
    pub buffer_pool_slot_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl Config {
    /// 从进程环境变量加载
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 通过任意键值查询函数加载，非法值回落到默认值并告警
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);
        let buffer_size = env.at_least("BUFFER_SIZE", 32 * 1024usize, 1);
        let max_connections = env.at_least("MAX_CONNECTIONS", 10000usize, 1);
        // 每条隧道占两个槽位，默认按并发上限配满
        let tunnel_slots = max_connections.saturating_mul(2);
        let buffer_pool_slots = env.at_least("BUFFER_POOL_SLOTS", tunnel_slots, 2);
        if buffer_pool_slots < tunnel_slots {
            warn!(
                "BUFFER_POOL_SLOTS={} 只够 {} 条并发隧道，低于 MAX_CONNECTIONS={}，超出部分将返回 503",
                buffer_pool_slots,
                buffer_pool_slots / 2,
                max_connections
            );
        }

        Self {
            api_listen_addr: env.addr("API_LISTEN_ADDR", 8081),
            proxy_listen_addr: env.addr("PROXY_LISTEN_ADDR", 8443),

            ca_dir: env.string("CA_DIR", "/data/ca").into(),
            ca_cert_file: env.string("CA_CERT_FILE", "ca.crt"),
            ca_key_file: env.string("CA_KEY_FILE", "ca.key"),
            ca_common_name: env.string("CA_COMMON_NAME", "Cerberus SSL Inspector CA"),
            ca_org: env.string("CA_ORG", "Cerberus NGFW"),
            ca_validity_days: env.parse("CA_VALIDITY", 3650),

            connect_timeout: Duration::from_secs(env.parse("CONNECT_TIMEOUT", 10)),
            read_timeout: Duration::from_secs(env.parse("READ_TIMEOUT", 30)),
            write_timeout: Duration::from_secs(env.parse("WRITE_TIMEOUT", 30)),
            max_connections,
            buffer_size,
            inspect_https: env.flag("INSPECT_HTTPS", true),
            log_connections: env.flag("LOG_CONNECTIONS", true),
            bypass_domains: env.list("BYPASS_DOMAINS"),
            upstream_tls_verify: env.flag("UPSTREAM_TLS_VERIFY", false),
            upstream_ca_bundle: env
                .string("UPSTREAM_CA_BUNDLE", "/etc/ssl/certs/ca-certificates.crt")
                .into(),

            xdp_enabled: env.flag("XDP_ENABLED", true),
            xdp_interface: env.string("XDP_INTERFACE", "eth0"),
            xdp_mode: env.parse("XDP_MODE", XdpMode::Default),
            xdp_program_path: env
                .string("XDP_PROGRAM_PATH", "target/bpfel-unknown-none/release/cerberus")
                .into(),
            allow_ips: env.ip_list("ALLOW_IPS"),
            deny_ips: env.ip_list("DENY_IPS"),
            rule_store_path: env.string("RULE_STORE_PATH", "./cerberus_data").into(),
            stats_interval: Duration::from_secs(env.parse::<u64>("STATS_INTERVAL", 5).max(1)),

            numa_enabled: env.flag("NUMA_ENABLED", false),
            numa_node: env.parse("NUMA_NODE", 0),
            buffer_pool_slots,
            buffer_pool_slot_size: env.at_least("BUFFER_POOL_SLOT_SIZE", buffer_size, 1),
        }
    }

    pub fn ca_cert_path(&self) -> PathBuf {
        self.ca_dir.join(&self.ca_cert_file)
    }

    pub fn ca_key_path(&self) -> PathBuf {
        self.ca_dir.join(&self.ca_key_file)
    }
}

struct Env<'a, F>(&'a F);

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.raw(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> T {
        match self.raw(key) {
            Some(value) => self.parse_value(key, &value, default),
            None => default,
        }
    }

    /// 低于下限的数值同样回落到默认值
    fn at_least<T>(&self, key: &str, default: T, min: T) -> T
    where
        T: FromStr + PartialOrd + std::fmt::Display + Copy,
    {
        let value = self.parse(key, default);
        if value < min {
            warn!("环境变量 {} 的值 {} 小于 {}，使用默认值", key, value, min);
            return default;
        }
        value
    }

    /// 监听地址，兼容 ":8081" 这种省略主机的写法
    fn addr(&self, key: &str, default_port: u16) -> SocketAddr {
        let default = SocketAddr::from(([0, 0, 0, 0], default_port));
        match self.raw(key) {
            Some(value) if value.starts_with(':') => {
                let port = self.parse_value(key, &value[1..], default_port);
                SocketAddr::from(([0, 0, 0, 0], port))
            }
            Some(value) => self.parse_value(key, &value, default),
            None => default,
        }
    }

    fn parse_value<T: FromStr>(&self, key: &str, value: &str, default: T) -> T {
        value.parse().unwrap_or_else(|_| {
            warn!("环境变量 {} 的值 {:?} 无效，使用默认值", key, value);
            default
        })
    }

    /// 只有 "true" 和 "1" 视为开启
    fn flag(&self, key: &str, default: bool) -> bool {
        match self.raw(key) {
            Some(value) => value.eq_ignore_ascii_case("true") || value == "1",
            None => default,
        }
    }

    fn list(&self, key: &str) -> Vec<String> {
        self.raw(key)
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn ip_list(&self, key: &str) -> Vec<Ipv4Addr> {
        self.list(key)
            .into_iter()
            .filter_map(|s| match s.parse() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    warn!("{} 中的地址 {} 无效，已忽略", key, s);
                    None
                }
            })
            .collect()
    }
}
