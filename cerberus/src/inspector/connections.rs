use chrono::{DateTime, Utc};
use log::info;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::metrics::Metrics;

/// 锁中毒时继续使用内部数据，计数不需要回滚
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// 隧道处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelMode {
    Bypass,
    Mitm,
}

impl TunnelMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TunnelMode::Bypass => "bypass",
            TunnelMode::Mitm => "mitm",
        }
    }
}

/// 一条活动隧道
#[derive(Debug)]
pub struct ConnectionRecord {
    pub id: u64,
    pub host: String,
    pub port: u16,
    pub mode: TunnelMode,
    pub start_time: DateTime<Utc>,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl ConnectionRecord {
    /// 上游 -> 客户端
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    /// 客户端 -> 上游
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    pub fn view(&self) -> ConnectionView {
        ConnectionView {
            id: self.id,
            host: self.host.clone(),
            port: self.port,
            mode: self.mode,
            start_time: self.start_time,
            duration_ms: (Utc::now() - self.start_time).num_milliseconds().max(0) as u64,
            bytes_in: self.bytes_in(),
            bytes_out: self.bytes_out(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionView {
    pub id: u64,
    pub host: String,
    pub port: u16,
    pub mode: TunnelMode,
    pub start_time: DateTime<Utc>,
    pub duration_ms: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// 代理汇总计数
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct ProxyTotals {
    pub total_connections: u64,
    pub active_connections: u64,
    pub bypassed_connections: u64,
    pub mitm_connections: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub rejected_connections: u64,
    pub failed_handshakes: u64,
    pub upstream_failures: u64,
}

/// 失败发生的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    Upstream,
    Handshake,
}

/// 拒绝连接的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    ConnectionLimit,
    BufferPool,
}

impl RejectReason {
    fn as_str(self) -> &'static str {
        match self {
            RejectReason::ConnectionLimit => "connection_limit",
            RejectReason::BufferPool => "buffer_pool",
        }
    }
}

/// 汇总统计，同步更新 Prometheus 指标
pub struct ProxyStats {
    totals: Mutex<ProxyTotals>,
    metrics: Metrics,
}

impl ProxyStats {
    pub fn new(metrics: Metrics) -> Self {
        Self {
            totals: Mutex::new(ProxyTotals::default()),
            metrics,
        }
    }

    pub fn snapshot(&self) -> ProxyTotals {
        *lock(&self.totals)
    }

    fn opened(&self, mode: TunnelMode) {
        let mut totals = lock(&self.totals);
        totals.total_connections += 1;
        totals.active_connections += 1;
        match mode {
            TunnelMode::Bypass => totals.bypassed_connections += 1,
            TunnelMode::Mitm => totals.mitm_connections += 1,
        }
        self.metrics
            .proxy_connections
            .with_label_values(&[mode.as_str()])
            .inc();
        self.metrics.proxy_active_connections.inc();
    }

    fn closed(&self) {
        let mut totals = lock(&self.totals);
        totals.active_connections = totals.active_connections.saturating_sub(1);
        self.metrics.proxy_active_connections.dec();
    }

    fn add_bytes_in(&self, n: u64) {
        lock(&self.totals).bytes_in += n;
        self.metrics.proxy_bytes.with_label_values(&["in"]).inc_by(n);
    }

    fn add_bytes_out(&self, n: u64) {
        lock(&self.totals).bytes_out += n;
        self.metrics.proxy_bytes.with_label_values(&["out"]).inc_by(n);
    }

    pub fn rejected(&self, reason: RejectReason) {
        lock(&self.totals).rejected_connections += 1;
        self.metrics
            .proxy_rejected
            .with_label_values(&[reason.as_str()])
            .inc();
    }

    pub fn failed(&self, stage: FailureStage) {
        let mut totals = lock(&self.totals);
        let label = match stage {
            FailureStage::Upstream => {
                totals.upstream_failures += 1;
                "upstream"
            }
            FailureStage::Handshake => {
                totals.failed_handshakes += 1;
                "handshake"
            }
        };
        self.metrics.proxy_failures.with_label_values(&[label]).inc();
    }
}

/// 活动隧道表
#[derive(Default)]
pub struct ConnectionTable {
    entries: Mutex<HashMap<u64, Arc<ConnectionRecord>>>,
    next_id: AtomicU64,
}

impl ConnectionTable {
    /// 登记新隧道，返回的守卫析构时自动注销
    pub fn open(
        self: &Arc<Self>,
        stats: &Arc<ProxyStats>,
        host: &str,
        port: u16,
        mode: TunnelMode,
        log_connections: bool,
    ) -> ConnectionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let record = Arc::new(ConnectionRecord {
            id,
            host: host.to_string(),
            port,
            mode,
            start_time: Utc::now(),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
        });
        lock(&self.entries).insert(id, record.clone());
        stats.opened(mode);

        if log_connections {
            info!("隧道 #{} 建立: {}:{} ({})", id, host, port, mode.as_str());
        }

        ConnectionGuard {
            record,
            table: self.clone(),
            stats: stats.clone(),
            log_connections,
        }
    }

    /// 按 id 排序的活动连接
    pub fn list(&self) -> Vec<ConnectionView> {
        let mut views: Vec<ConnectionView> =
            lock(&self.entries).values().map(|r| r.view()).collect();
        views.sort_by_key(|v| v.id);
        views
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, id: u64) {
        lock(&self.entries).remove(&id);
    }
}

/// 隧道生命周期内持有，负责字节计数和注销
pub struct ConnectionGuard {
    record: Arc<ConnectionRecord>,
    table: Arc<ConnectionTable>,
    stats: Arc<ProxyStats>,
    log_connections: bool,
}

impl ConnectionGuard {
    pub fn record(&self) -> &ConnectionRecord {
        &self.record
    }

    /// 累加上游 -> 客户端字节
    pub fn add_in(&self, n: u64) {
        self.record.bytes_in.fetch_add(n, Ordering::Relaxed);
        self.stats.add_bytes_in(n);
    }

    /// 累加客户端 -> 上游字节
    pub fn add_out(&self, n: u64) {
        self.record.bytes_out.fetch_add(n, Ordering::Relaxed);
        self.stats.add_bytes_out(n);
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.table.remove(self.record.id);
        self.stats.closed();
        if self.log_connections {
            let r = &self.record;
            info!(
                "隧道 #{} 关闭: {}:{} ({}) in={} out={} 耗时 {}ms",
                r.id,
                r.host,
                r.port,
                r.mode.as_str(),
                r.bytes_in(),
                r.bytes_out(),
                (Utc::now() - r.start_time).num_milliseconds()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixtures() -> (Arc<ConnectionTable>, Arc<ProxyStats>) {
        (
            Arc::new(ConnectionTable::default()),
            Arc::new(ProxyStats::new(Metrics::new().unwrap())),
        )
    }

    #[test]
    fn test_independent_records() {
        let (table, stats) = fixtures();
        let a = table.open(&stats, "a.test", 443, TunnelMode::Mitm, false);
        let b = table.open(&stats, "b.test", 8443, TunnelMode::Bypass, false);
        assert_ne!(a.record().id, b.record().id);

        a.add_out(100);
        a.add_in(7);
        b.add_in(50);

        let list = table.list();
        assert_eq!(list.len(), 2);
        assert_eq!((list[0].bytes_out, list[0].bytes_in), (100, 7));
        assert_eq!((list[1].bytes_out, list[1].bytes_in), (0, 50));

        let totals = stats.snapshot();
        assert_eq!(totals.active_connections, 2);
        assert_eq!(totals.mitm_connections, 1);
        assert_eq!(totals.bypassed_connections, 1);
        assert_eq!(totals.bytes_in, 57);
        assert_eq!(totals.bytes_out, 100);
    }

    #[test]
    fn test_guard_drop_unregisters() {
        let (table, stats) = fixtures();
        {
            let _guard = table.open(&stats, "c.test", 443, TunnelMode::Mitm, true);
            assert_eq!(table.len(), 1);
        }
        assert!(table.is_empty());

        let totals = stats.snapshot();
        assert_eq!(totals.total_connections, 1);
        assert_eq!(totals.active_connections, 0);
    }

    #[test]
    fn test_failure_counters() {
        let (_, stats) = fixtures();
        stats.rejected(RejectReason::BufferPool);
        stats.failed(FailureStage::Handshake);
        stats.failed(FailureStage::Upstream);
        stats.failed(FailureStage::Upstream);

        let totals = stats.snapshot();
        assert_eq!(totals.rejected_connections, 1);
        assert_eq!(totals.failed_handshakes, 1);
        assert_eq!(totals.upstream_failures, 2);
    }
}
