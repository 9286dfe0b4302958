//! TLS 中间人代理：CONNECT 隧道、旁路域名、按主机签发证书。

pub mod bypass;
pub mod ca;
pub mod connections;
pub mod proxy;
pub mod tunnel;
pub mod upstream;

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::config::Config;

/// 运行时可调整的开关
#[derive(Debug)]
pub struct InspectionSettings {
    inspect_https: AtomicBool,
    log_connections: AtomicBool,
}

/// 开关的快照，也用作 PUT 请求体
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SettingsView {
    pub inspect_https: bool,
    pub log_connections: bool,
}

/// 部分更新，缺省字段保持不变
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct SettingsUpdate {
    pub inspect_https: Option<bool>,
    pub log_connections: Option<bool>,
}

impl InspectionSettings {
    pub fn new(inspect_https: bool, log_connections: bool) -> Self {
        Self {
            inspect_https: AtomicBool::new(inspect_https),
            log_connections: AtomicBool::new(log_connections),
        }
    }

    pub fn inspect_https(&self) -> bool {
        self.inspect_https.load(Ordering::Relaxed)
    }

    pub fn log_connections(&self) -> bool {
        self.log_connections.load(Ordering::Relaxed)
    }

    pub fn view(&self) -> SettingsView {
        SettingsView {
            inspect_https: self.inspect_https(),
            log_connections: self.log_connections(),
        }
    }

    pub fn apply(&self, update: SettingsUpdate) -> SettingsView {
        if let Some(v) = update.inspect_https {
            self.inspect_https.store(v, Ordering::Relaxed);
        }
        if let Some(v) = update.log_connections {
            self.log_connections.store(v, Ordering::Relaxed);
        }
        self.view()
    }
}

/// 隧道各阶段的超时
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub connect: Duration,
    pub read: Duration,
    pub write: Duration,
}

impl From<&Config> for Timeouts {
    fn from(config: &Config) -> Self {
        Self {
            connect: config.connect_timeout,
            read: config.read_timeout,
            write: config.write_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_settings_update() {
        let settings = InspectionSettings::new(true, true);
        let view = settings.apply(SettingsUpdate {
            inspect_https: Some(false),
            log_connections: None,
        });
        assert_eq!(
            view,
            SettingsView {
                inspect_https: false,
                log_connections: true
            }
        );
        assert!(!settings.inspect_https());
    }
}
