use anyhow::{Context, Result};
use aya::programs::{Xdp, XdpFlags};
use aya::programs::xdp::XdpLinkId;
use aya::Ebpf;
use log::{debug, info, warn};
use std::path::Path;

use super::maps::KernelMaps;
use super::XdpMode;

const PROGRAM_NAME: &str = "xdp_packet_steering";

/// 放开 locked memory 限制。
///
/// 老内核没有基于 memcg 的计费，创建 map 需要它，见 https://lwn.net/Articles/837122/
/// 失败只记日志。
pub fn raise_memlock_limit() {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        warn!("remove limit on locked memory failed, ret is: {ret}");
    } else {
        debug!("已解除 RLIMIT_MEMLOCK 限制");
    }
}

/// 已加载的分类器程序
pub struct SteeringProgram {
    ebpf: Ebpf,
    interface: Option<String>,
    link: Option<XdpLinkId>,
}

impl SteeringProgram {
    /// 从文件加载编译好的 eBPF 对象并完成校验
    pub fn load(path: &Path) -> Result<Self> {
        let mut ebpf = Ebpf::load_file(path)
            .with_context(|| format!("加载 eBPF 对象 {} 失败", path.display()))?;

        let program: &mut Xdp = ebpf
            .program_mut(PROGRAM_NAME)
            .context("XDP program not found")?
            .try_into()?;
        program.load().context("Failed to load XDP program")?;

        info!("已加载 XDP 程序 {} ({})", PROGRAM_NAME, path.display());
        Ok(Self {
            ebpf,
            interface: None,
            link: None,
        })
    }

    /// 取出 map 交给控制面
    pub fn take_maps(&mut self) -> Result<KernelMaps> {
        KernelMaps::new(&mut self.ebpf)
    }

    /// 挂载到网卡，已经挂载时直接返回
    pub fn attach(&mut self, iface: &str, mode: XdpMode) -> Result<()> {
        if let Some(current) = &self.interface {
            debug!("XDP 程序已挂载在 {}，忽略重复挂载", current);
            return Ok(());
        }

        let program: &mut Xdp = self
            .ebpf
            .program_mut(PROGRAM_NAME)
            .context("XDP program not found")?
            .try_into()?;
        let link = program.attach(iface, mode.flags()).with_context(|| {
            format!(
                "failed to attach the XDP program to {} in {:?} mode - try XDP_MODE=skb",
                iface, mode
            )
        })?;

        self.link = Some(link);
        self.interface = Some(iface.to_string());
        info!("XDP 程序已挂载到 {} ({:?})", iface, mode);
        Ok(())
    }

    /// 从网卡卸载，未挂载时直接返回
    pub fn detach(&mut self) -> Result<()> {
        let Some(link) = self.link.take() else {
            return Ok(());
        };
        let program: &mut Xdp = self
            .ebpf
            .program_mut(PROGRAM_NAME)
            .context("XDP program not found")?
            .try_into()?;
        program.detach(link).context("卸载 XDP 程序失败")?;

        if let Some(iface) = self.interface.take() {
            info!("XDP 程序已从 {} 卸载", iface);
        }
        Ok(())
    }
}

impl XdpMode {
    pub fn flags(self) -> XdpFlags {
        match self {
            XdpMode::Default => XdpFlags::default(),
            XdpMode::Skb => XdpFlags::SKB_MODE,
            XdpMode::Driver => XdpFlags::DRV_MODE,
            XdpMode::Hw => XdpFlags::HW_MODE,
        }
    }
}
