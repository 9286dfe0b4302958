#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cerberus::buffer_pool::BufferPool;
use cerberus::inspector::bypass::BypassMatcher;
use cerberus::inspector::ca::{CaManager, CaSettings};
use cerberus::inspector::connections::{ConnectionTable, ProxyStats};
use cerberus::inspector::proxy::ProxyContext;
use cerberus::inspector::upstream::UpstreamConnector;
use cerberus::inspector::{InspectionSettings, Timeouts};
use cerberus::metrics::Metrics;

static NEXT_DIR: AtomicU32 = AtomicU32::new(0);

/// 每个测试独立的 CA 目录
pub fn ca_settings(name: &str) -> CaSettings {
    let dir: PathBuf = std::env::temp_dir().join(format!(
        "cerberus-it-{}-{}-{}",
        name,
        std::process::id(),
        NEXT_DIR.fetch_add(1, Ordering::Relaxed)
    ));
    let _ = std::fs::remove_dir_all(&dir);
    CaSettings {
        cert_path: dir.join("ca.crt"),
        key_path: dir.join("ca.key"),
        common_name: "Cerberus Integration CA".into(),
        organization: "Cerberus Tests".into(),
        validity_days: 30,
    }
}

pub fn cleanup(settings: &CaSettings) {
    if let Some(dir) = settings.cert_path.parent() {
        let _ = std::fs::remove_dir_all(dir);
    }
}

pub struct TestContext {
    pub ctx: Arc<ProxyContext>,
    pub metrics: Metrics,
    pub settings: CaSettings,
}

impl Drop for TestContext {
    fn drop(&mut self) {
        cleanup(&self.settings);
    }
}

/// 组装代理上下文；上游证书不校验，便于对接自签名的测试上游
pub fn proxy_context(name: &str, pool_slots: usize, bypass: &[&str]) -> TestContext {
    let settings = ca_settings(name);
    let metrics = Metrics::new().unwrap();
    let ca = CaManager::load_or_create(settings.clone(), metrics.clone()).unwrap();
    let ctx = ProxyContext {
        ca: Arc::new(ca),
        bypass: Arc::new(BypassMatcher::new(bypass.iter().copied())),
        settings: Arc::new(InspectionSettings::new(true, false)),
        connections: Arc::new(ConnectionTable::default()),
        stats: Arc::new(ProxyStats::new(metrics.clone())),
        pool: BufferPool::new(pool_slots, 4096),
        upstream: UpstreamConnector::insecure().unwrap(),
        timeouts: Timeouts {
            connect: Duration::from_secs(5),
            read: Duration::from_secs(5),
            write: Duration::from_secs(5),
        },
        max_connections: 16,
    };
    TestContext {
        ctx: Arc::new(ctx),
        metrics,
        settings,
    }
}
