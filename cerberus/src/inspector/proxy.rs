use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};

use crate::buffer_pool::BufferPool;

use super::bypass::BypassMatcher;
use super::ca::CaManager;
use super::connections::{ConnectionTable, ProxyStats, RejectReason};
use super::tunnel;
use super::upstream::UpstreamConnector;
use super::{InspectionSettings, Timeouts};

/// 所有隧道共享的组件
pub struct ProxyContext {
    pub ca: Arc<CaManager>,
    pub bypass: Arc<BypassMatcher>,
    pub settings: Arc<InspectionSettings>,
    pub connections: Arc<ConnectionTable>,
    pub stats: Arc<ProxyStats>,
    pub pool: BufferPool,
    pub upstream: UpstreamConnector,
    pub timeouts: Timeouts,
    pub max_connections: usize,
}

/// CONNECT 代理监听器
pub struct ProxyServer {
    listener: TcpListener,
    ctx: Arc<ProxyContext>,
}

impl ProxyServer {
    pub async fn bind(addr: SocketAddr, ctx: Arc<ProxyContext>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind proxy listener on {}", addr))?;
        Ok(Self { listener, ctx })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// 接收连接直到收到停止信号；已建立的隧道继续运行到自然结束
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let limit = Arc::new(Semaphore::new(self.ctx.max_connections.max(1)));
        if let Ok(addr) = self.listener.local_addr() {
            info!(
                "TLS 代理监听 {} (最大连接数 {}, 解密 {})",
                addr,
                self.ctx.max_connections,
                if self.ctx.settings.inspect_https() { "开启" } else { "关闭" }
            );
        }

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!("接受连接失败: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    };

                    let Ok(permit) = limit.clone().try_acquire_owned() else {
                        self.ctx.stats.rejected(RejectReason::ConnectionLimit);
                        warn!("连接数已达上限，拒绝 {}", peer);
                        drop(stream);
                        continue;
                    };

                    let ctx = self.ctx.clone();
                    tokio::spawn(async move {
                        tunnel::serve(ctx, stream, peer).await;
                        drop(permit);
                    });
                }
                _ = shutdown.changed() => {
                    info!("TLS 代理停止接收新连接");
                    break;
                }
            }
        }
        debug!("代理监听循环退出，活动隧道 {}", self.ctx.connections.len());
    }
}
