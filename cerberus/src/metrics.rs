//! Prometheus 指标

use anyhow::Result;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use cerberus_common::{Action, GlobalStats};

/// 全部指标句柄，克隆开销很小，可以分发给各组件
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    // XDP 分类器
    pub xdp_packets: IntCounterVec,
    pub xdp_bytes: IntCounter,
    pub xdp_rule_packets: IntGaugeVec,
    pub xdp_attached: IntGauge,
    pub host_list_size: IntGaugeVec,

    // TLS 代理
    pub proxy_connections: IntCounterVec,
    pub proxy_active_connections: IntGauge,
    pub proxy_bytes: IntCounterVec,
    pub proxy_rejected: IntCounterVec,
    pub proxy_failures: IntCounterVec,

    // CA
    pub ca_certificates_issued: IntCounter,
    pub ca_regenerations: IntCounter,

    // 缓冲池
    pub buffer_pool_available: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("cerberus".to_string()), None)?;

        let xdp_packets = IntCounterVec::new(
            Opts::new("xdp_packets_total", "Packets classified by the XDP program, by action"),
            &["action"],
        )?;
        let xdp_bytes = IntCounter::new("xdp_bytes_total", "Bytes seen by the XDP program")?;
        let xdp_rule_packets = IntGaugeVec::new(
            Opts::new("xdp_rule_packets", "Packets matched per rule slot"),
            &["slot"],
        )?;
        let xdp_attached = IntGauge::new("xdp_attached", "Whether the XDP program is attached")?;
        let host_list_size = IntGaugeVec::new(
            Opts::new("xdp_host_list_size", "Entries in the allow/deny lists"),
            &["list"],
        )?;

        let proxy_connections = IntCounterVec::new(
            Opts::new("proxy_connections_total", "Accepted CONNECT tunnels, by mode"),
            &["mode"],
        )?;
        let proxy_active_connections =
            IntGauge::new("proxy_active_connections", "Tunnels currently relaying")?;
        let proxy_bytes = IntCounterVec::new(
            Opts::new("proxy_bytes_total", "Bytes relayed, by direction"),
            &["direction"],
        )?;
        let proxy_rejected = IntCounterVec::new(
            Opts::new("proxy_rejected_total", "Connections refused before relaying, by reason"),
            &["reason"],
        )?;
        let proxy_failures = IntCounterVec::new(
            Opts::new("proxy_failures_total", "Tunnel setup failures, by stage"),
            &["stage"],
        )?;

        let ca_certificates_issued =
            IntCounter::new("ca_certificates_issued_total", "Leaf certificates signed")?;
        let ca_regenerations = IntCounter::new("ca_regenerations_total", "CA regenerations")?;

        let buffer_pool_available =
            IntGauge::new("buffer_pool_available", "Free slots in the buffer pool")?;

        registry.register(Box::new(xdp_packets.clone()))?;
        registry.register(Box::new(xdp_bytes.clone()))?;
        registry.register(Box::new(xdp_rule_packets.clone()))?;
        registry.register(Box::new(xdp_attached.clone()))?;
        registry.register(Box::new(host_list_size.clone()))?;
        registry.register(Box::new(proxy_connections.clone()))?;
        registry.register(Box::new(proxy_active_connections.clone()))?;
        registry.register(Box::new(proxy_bytes.clone()))?;
        registry.register(Box::new(proxy_rejected.clone()))?;
        registry.register(Box::new(proxy_failures.clone()))?;
        registry.register(Box::new(ca_certificates_issued.clone()))?;
        registry.register(Box::new(ca_regenerations.clone()))?;
        registry.register(Box::new(buffer_pool_available.clone()))?;

        Ok(Self {
            registry,
            xdp_packets,
            xdp_bytes,
            xdp_rule_packets,
            xdp_attached,
            host_list_size,
            proxy_connections,
            proxy_active_connections,
            proxy_bytes,
            proxy_rejected,
            proxy_failures,
            ca_certificates_issued,
            ca_regenerations,
            buffer_pool_available,
        })
    }

    /// 用内核全局计数的增量推进计数器
    pub fn observe_global_delta(&self, previous: &GlobalStats, current: &GlobalStats) {
        for action in Action::ALL {
            let delta = current
                .packets_for(action)
                .saturating_sub(previous.packets_for(action));
            if delta > 0 {
                self.xdp_packets
                    .with_label_values(&[action.as_str()])
                    .inc_by(delta);
            }
        }
        self.xdp_bytes
            .inc_by(current.total_bytes.saturating_sub(previous.total_bytes));
    }

    /// 导出 Prometheus 文本格式
    pub fn export(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_contains_prefixed_metrics() {
        let metrics = Metrics::new().unwrap();
        metrics.proxy_connections.with_label_values(&["mitm"]).inc();
        metrics.ca_certificates_issued.inc();

        let text = metrics.export().unwrap();
        assert!(text.contains("cerberus_proxy_connections_total{mode=\"mitm\"} 1"));
        assert!(text.contains("cerberus_ca_certificates_issued_total 1"));
    }

    #[test]
    fn test_global_delta() {
        let metrics = Metrics::new().unwrap();
        let mut prev = GlobalStats::default();
        prev.record(Action::Drop, 60);
        let mut cur = prev;
        cur.record(Action::Drop, 60);
        cur.record(Action::InspectAll, 1500);

        metrics.observe_global_delta(&prev, &cur);
        assert_eq!(metrics.xdp_packets.with_label_values(&["drop"]).get(), 1);
        assert_eq!(metrics.xdp_packets.with_label_values(&["inspect_all"]).get(), 1);
        assert_eq!(metrics.xdp_bytes.get(), 1560);
    }
}
