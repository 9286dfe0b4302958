use anyhow::{anyhow, bail, Context, Result};
use log::{info, warn};
use serde::Serialize;
use std::fs;
use std::path::Path;

const SYSFS_NODE_ROOT: &str = "/sys/devices/system/node";

/// 单个 NUMA 节点
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct NumaNode {
    pub id: u32,
    pub cpus: Vec<usize>,
    pub memory_mb: u64,
}

/// 本机 NUMA 拓扑
#[derive(Debug, Clone, Default, Serialize)]
pub struct NumaTopology {
    pub nodes: Vec<NumaNode>,
}

impl NumaTopology {
    /// 多于一个节点才算 NUMA 可用
    pub fn available(&self) -> bool {
        self.nodes.len() > 1
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, id: u32) -> Option<&NumaNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// 当前线程所在 CPU 属于哪个节点
    pub fn current_node(&self) -> Option<u32> {
        let cpu = current_cpu()?;
        self.nodes
            .iter()
            .find(|n| n.cpus.contains(&cpu))
            .map(|n| n.id)
    }

    pub fn log_summary(&self) {
        info!(
            "NUMA 拓扑: 可用={}, 节点数={}, 当前节点={:?}",
            self.available(),
            self.node_count(),
            self.current_node()
        );
        for node in &self.nodes {
            info!(
                "  节点 {}: 内存 {} MB, CPU {:?}",
                node.id, node.memory_mb, node.cpus
            );
        }
    }
}

/// 从 sysfs 读取拓扑，读取失败时返回空拓扑
pub fn discover() -> NumaTopology {
    discover_from(Path::new(SYSFS_NODE_ROOT)).unwrap_or_default()
}

/// 从指定的 sysfs 根目录读取拓扑
pub fn discover_from(root: &Path) -> Result<NumaTopology> {
    let mut nodes = Vec::new();
    for entry in fs::read_dir(root).with_context(|| format!("读取 {} 失败", root.display()))? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(id) = name
            .to_str()
            .and_then(|n| n.strip_prefix("node"))
            .and_then(|n| n.parse::<u32>().ok())
        else {
            continue;
        };

        let dir = entry.path();
        let cpus = fs::read_to_string(dir.join("cpulist"))
            .ok()
            .and_then(|s| parse_cpulist(&s).ok())
            .unwrap_or_default();
        let memory_mb = fs::read_to_string(dir.join("meminfo"))
            .ok()
            .and_then(|s| parse_mem_total_kb(&s))
            .map(|kb| kb / 1024)
            .unwrap_or(0);

        nodes.push(NumaNode {
            id,
            cpus,
            memory_mb,
        });
    }
    nodes.sort_by_key(|n| n.id);
    Ok(NumaTopology { nodes })
}

/// 解析 "0-3,8,10-11" 格式的 CPU 列表
pub fn parse_cpulist(list: &str) -> Result<Vec<usize>> {
    let mut cpus = Vec::new();
    for part in list.trim().split(',').filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((start, end)) => {
                let start: usize = start.trim().parse()?;
                let end: usize = end.trim().parse()?;
                if end < start {
                    bail!("非法 CPU 区间: {}", part);
                }
                cpus.extend(start..=end);
            }
            None => cpus.push(part.trim().parse()?),
        }
    }
    Ok(cpus)
}

/// 解析节点 meminfo 中的 MemTotal（kB）
fn parse_mem_total_kb(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find(|line| line.contains("MemTotal:"))
        .and_then(|line| line.split_whitespace().rev().nth(1))
        .and_then(|v| v.parse().ok())
}

#[cfg(target_os = "linux")]
fn current_cpu() -> Option<usize> {
    let cpu = unsafe { libc::sched_getcpu() };
    usize::try_from(cpu).ok()
}

#[cfg(not(target_os = "linux"))]
fn current_cpu() -> Option<usize> {
    None
}

/// 按 cpu_set_t 的容量拆分 CPU 列表：(可写入的, 超出范围的)
#[cfg(target_os = "linux")]
fn split_settable(cpus: &[usize]) -> (Vec<usize>, Vec<usize>) {
    let limit = libc::CPU_SETSIZE as usize;
    cpus.iter().copied().partition(|&cpu| cpu < limit)
}

/// 把当前线程的 CPU 亲和性和内存策略绑定到指定节点。
///
/// 在构建异步运行时之前调用，之后创建的线程都会继承亲和性。
#[cfg(target_os = "linux")]
pub fn bind_to_node(topology: &NumaTopology, node: u32) -> Result<()> {
    use std::mem::size_of;

    const MPOL_BIND: libc::c_int = 2;
    const MASK_WORDS: usize = 16;
    const WORD_BITS: usize = libc::c_ulong::BITS as usize;

    let target = topology
        .node(node)
        .ok_or_else(|| anyhow!("NUMA 节点 {} 不存在", node))?;
    let (cpus, skipped) = split_settable(&target.cpus);
    if !skipped.is_empty() {
        warn!("CPU {:?} 超出 cpu_set_t 容量，不参与绑定", skipped);
    }
    if cpus.is_empty() {
        bail!("NUMA 节点 {} 没有可绑定的 CPU", node);
    }

    unsafe {
        let mut cpuset: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut cpuset);
        for &cpu in &cpus {
            libc::CPU_SET(cpu, &mut cpuset);
        }
        if libc::sched_setaffinity(0, size_of::<libc::cpu_set_t>(), &cpuset) != 0 {
            return Err(std::io::Error::last_os_error()).context("sched_setaffinity 失败");
        }
    }

    let index = node as usize;
    if index >= MASK_WORDS * WORD_BITS {
        bail!("NUMA 节点编号 {} 超出范围", node);
    }
    let mut nodemask = [0 as libc::c_ulong; MASK_WORDS];
    nodemask[index / WORD_BITS] |= 1 << (index % WORD_BITS);

    let ret = unsafe {
        libc::syscall(
            libc::SYS_set_mempolicy,
            MPOL_BIND,
            nodemask.as_ptr(),
            (MASK_WORDS * WORD_BITS) as libc::c_ulong,
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error()).context("set_mempolicy 失败");
    }

    info!("已绑定到 NUMA 节点 {} (CPU {:?})", node, cpus);
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn bind_to_node(_topology: &NumaTopology, _node: u32) -> Result<()> {
    bail!("当前平台不支持 NUMA 绑定")
}
