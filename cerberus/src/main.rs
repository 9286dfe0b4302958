use anyhow::Context;
use clap::Parser;
use log::{info, warn, LevelFilter};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;

use cerberus::buffer_pool::BufferPool;
use cerberus::config::Config;
use cerberus::inspector::bypass::BypassMatcher;
use cerberus::inspector::ca::{CaManager, CaSettings};
use cerberus::inspector::connections::{ConnectionTable, ProxyStats};
use cerberus::inspector::proxy::{ProxyContext, ProxyServer};
use cerberus::inspector::upstream::UpstreamConnector;
use cerberus::inspector::{InspectionSettings, Timeouts};
use cerberus::metrics::Metrics;
use cerberus::numa;
use cerberus::steering::loader::{raise_memlock_limit, SteeringProgram};
use cerberus::steering::maps::KernelMaps;
use cerberus::steering::{HostList, SteeringService};
use cerberus::storage::RuleStore;
use cerberus::web_api::{start_web_server, AppState};

#[derive(Debug, Parser)]
struct Opt {
    /// 挂载 XDP 程序的网卡，覆盖 XDP_INTERFACE
    #[clap(short, long)]
    iface: Option<String>,

    /// 管理接口端口，覆盖 API_LISTEN_ADDR 中的端口
    #[clap(short, long)]
    port: Option<u16>,

    #[clap(long, default_value = "false")]
    disable_web: bool,

    #[clap(long, default_value = "false")]
    disable_xdp: bool,
}

fn main() -> Result<(), anyhow::Error> {
    dotenv::dotenv().ok();

    let opt = Opt::parse();

    env_logger::Builder::new()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let mut config = Config::from_env();
    if let Some(iface) = opt.iface.clone() {
        config.xdp_interface = iface;
    }
    if let Some(port) = opt.port {
        config.api_listen_addr.set_port(port);
    }
    if opt.disable_xdp {
        config.xdp_enabled = false;
    }

    // NUMA 绑定必须在创建运行时线程之前完成
    if config.numa_enabled {
        let topology = numa::discover();
        topology.log_summary();
        if let Err(e) = numa::bind_to_node(&topology, config.numa_node) {
            warn!("NUMA 绑定失败，继续以非绑定方式运行: {:#}", e);
        }
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("创建 tokio 运行时失败")?;
    runtime.block_on(run(config, opt.disable_web))
}

/// 加载并挂载分类器，失败时由调用方降级为离线控制面
fn start_steering(config: &Config) -> anyhow::Result<(SteeringProgram, KernelMaps)> {
    raise_memlock_limit();
    let mut program = SteeringProgram::load(&config.xdp_program_path)?;
    let maps = program.take_maps()?;
    program.attach(&config.xdp_interface, config.xdp_mode)?;
    Ok((program, maps))
}

async fn run(config: Config, disable_web: bool) -> Result<(), anyhow::Error> {
    let metrics = Metrics::new().context("初始化指标失败")?;

    // 缓冲池在 NUMA 绑定之后分配
    let pool = BufferPool::new(config.buffer_pool_slots, config.buffer_pool_slot_size);
    metrics.buffer_pool_available.set(pool.available() as i64);

    // XDP 控制面
    let store = RuleStore::new(&config.rule_store_path).context("初始化RocksDB存储失败")?;
    let steering = Arc::new(SteeringService::new(Some(store), metrics.clone())?);
    for (list, ips) in [
        (HostList::Allow, &config.allow_ips),
        (HostList::Deny, &config.deny_ips),
    ] {
        for ip in ips {
            if let Err(e) = steering.add_host(list, *ip).await {
                warn!("预置{}名单 {} 失败: {}", list, ip, e);
            }
        }
    }

    let mut program = None;
    if config.xdp_enabled {
        match start_steering(&config) {
            Ok((loaded, maps)) => {
                let failures = steering
                    .attach_maps(Box::new(maps), &config.xdp_interface, config.xdp_mode)
                    .await;
                if failures > 0 {
                    warn!("{} 条规则或名单未能写入内核", failures);
                }
                program = Some(loaded);
            }
            Err(e) => {
                warn!("XDP 分类器不可用: {:#}", e);
                steering.mark_unavailable(format!("{:#}", e)).await;
            }
        }
    } else {
        info!("XDP 分类器已禁用");
        steering.mark_unavailable("disabled by configuration".to_string()).await;
    }

    // TLS 代理
    let ca = Arc::new(
        CaManager::load_or_create(CaSettings::from(&config), metrics.clone())
            .context("初始化 CA 失败")?,
    );
    let upstream = UpstreamConnector::from_config(config.upstream_tls_verify, &config.upstream_ca_bundle)?;
    let ctx = Arc::new(ProxyContext {
        ca,
        bypass: Arc::new(BypassMatcher::new(&config.bypass_domains)),
        settings: Arc::new(InspectionSettings::new(
            config.inspect_https,
            config.log_connections,
        )),
        connections: Arc::new(ConnectionTable::default()),
        stats: Arc::new(ProxyStats::new(metrics.clone())),
        pool,
        upstream,
        timeouts: Timeouts::from(&config),
        max_connections: config.max_connections,
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let proxy = ProxyServer::bind(config.proxy_listen_addr, ctx.clone()).await?;
    let proxy_task = tokio::spawn(proxy.run(shutdown_rx.clone()));

    let api_state = AppState::new(&ctx, steering.clone(), metrics.clone());
    let web_task = if !disable_web {
        let addr: SocketAddr = config.api_listen_addr;
        let shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = start_web_server(api_state, addr, shutdown).await {
                warn!("管理接口启动失败: {:#}", e);
            }
        }))
    } else {
        None
    };

    info!("按 Ctrl-C 退出");

    // 定期采集分类器统计
    let mut interval = tokio::time::interval(config.stats_interval);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                metrics.buffer_pool_available.set(ctx.pool.available() as i64);
                if let Some(snapshot) = steering.collect_stats().await {
                    let rt = &snapshot.realtime_metrics;
                    info!(
                        "XDP: {:.2} KB/s, {} pps, 丢弃 {} pps, 累计 {} 包",
                        rt.total_bandwidth_bps as f64 / 1024.0,
                        rt.total_packet_rate_pps,
                        rt.drop_rate_pps,
                        snapshot.totals.total_packets
                    );
                }
            }
            _ = signal::ctrl_c() => {
                info!("收到 Ctrl-C 信号，正在退出...");
                break;
            }
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = proxy_task.await;
    if let Some(task) = web_task {
        let _ = task.await;
    }

    steering.detach_maps().await;
    if let Some(mut program) = program {
        if let Err(e) = program.detach() {
            warn!("卸载 XDP 程序失败: {:#}", e);
        }
    }

    info!("程序退出");
    Ok(())
}
