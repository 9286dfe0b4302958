//! 以太网帧解析，所有读取都先做边界检查。
//!
//! 内核侧通过 `XdpContext` 实现 [`FrameBytes`]，测试里直接用字节切片。

use crate::{ETH_P_8021AD, ETH_P_8021Q, ETH_P_IPV4, ETH_P_IPV6, PROTOCOL_TCP, PROTOCOL_UDP};

pub const ETH_HDR_LEN: usize = 14;
pub const VLAN_HDR_LEN: usize = 4;
pub const IPV4_HDR_LEN: usize = 20;
pub const TCP_HDR_LEN: usize = 20;
pub const UDP_HDR_LEN: usize = 8;

/// 可按偏移读取的帧数据
pub trait FrameBytes {
    /// 帧总长度（字节）
    fn len(&self) -> usize;

    /// 读取 `offset` 开始的 N 个字节，越界返回 None
    fn load<const N: usize>(&self, offset: usize) -> Option<[u8; N]>;

    #[inline(always)]
    fn read_u8(&self, offset: usize) -> Option<u8> {
        self.load::<1>(offset).map(|b| b[0])
    }

    #[inline(always)]
    fn read_be16(&self, offset: usize) -> Option<u16> {
        self.load::<2>(offset).map(u16::from_be_bytes)
    }

    #[inline(always)]
    fn read_be32(&self, offset: usize) -> Option<u32> {
        self.load::<4>(offset).map(u32::from_be_bytes)
    }
}

/// 基于切片的帧，测试和用户态工具使用
pub struct SliceFrame<'a>(pub &'a [u8]);

impl FrameBytes for SliceFrame<'_> {
    fn len(&self) -> usize {
        self.0.len()
    }

    fn load<const N: usize>(&self, offset: usize) -> Option<[u8; N]> {
        let end = offset.checked_add(N)?;
        let bytes = self.0.get(offset..end)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Some(out)
    }
}

/// 分类需要的包头字段，地址为主机字节序
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PacketMeta {
    pub src_ip: u32,
    pub dst_ip: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    /// 外层 VLAN 标签的 VID，无标签为 None
    pub vlan_id: Option<u16>,
    pub len: u64,
}

/// 解析结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParsedFrame {
    /// 无法解析或非 IP 流量：直接放行，不计数
    Unclassified,
    /// 只能走默认策略（IPv6、四层头截断）
    Default { len: u64 },
    /// 完整解析的 IPv4 包
    Ipv4(PacketMeta),
}

/// 解析以太网帧，最多剥离一层 VLAN 标签
#[inline(always)]
pub fn parse_frame<F: FrameBytes>(frame: &F) -> ParsedFrame {
    let len = frame.len() as u64;

    let mut ether_type = match frame.read_be16(12) {
        Some(t) => t,
        None => return ParsedFrame::Unclassified,
    };
    let mut l3 = ETH_HDR_LEN;
    let mut vlan_id = None;

    if ether_type == ETH_P_8021Q || ether_type == ETH_P_8021AD {
        let tci = match frame.read_be16(ETH_HDR_LEN) {
            Some(t) => t,
            None => return ParsedFrame::Unclassified,
        };
        ether_type = match frame.read_be16(ETH_HDR_LEN + 2) {
            Some(t) => t,
            None => return ParsedFrame::Unclassified,
        };
        vlan_id = Some(tci & 0x0FFF);
        l3 += VLAN_HDR_LEN;
    }

    if ether_type == ETH_P_IPV6 {
        return ParsedFrame::Default { len };
    }
    if ether_type != ETH_P_IPV4 {
        return ParsedFrame::Unclassified;
    }

    let ip_hdr: [u8; IPV4_HDR_LEN] = match frame.load(l3) {
        Some(h) => h,
        None => return ParsedFrame::Unclassified,
    };
    let version = ip_hdr[0] >> 4;
    let ihl = (ip_hdr[0] & 0x0F) as usize;
    if version != 4 || ihl < 5 {
        return ParsedFrame::Unclassified;
    }

    let protocol = ip_hdr[9];
    let mut meta = PacketMeta {
        src_ip: u32::from_be_bytes([ip_hdr[12], ip_hdr[13], ip_hdr[14], ip_hdr[15]]),
        dst_ip: u32::from_be_bytes([ip_hdr[16], ip_hdr[17], ip_hdr[18], ip_hdr[19]]),
        src_port: 0,
        dst_port: 0,
        protocol,
        vlan_id,
        len,
    };

    let l4 = l3 + ihl * 4;
    let l4_len = match protocol {
        PROTOCOL_TCP => TCP_HDR_LEN,
        PROTOCOL_UDP => UDP_HDR_LEN,
        _ => return ParsedFrame::Ipv4(meta),
    };

    // 端口在 TCP/UDP 头的前四个字节，但仍要求整个头部完整
    if frame.read_u8(l4 + l4_len - 1).is_none() {
        return ParsedFrame::Default { len };
    }
    match frame.load::<4>(l4) {
        Some(ports) => {
            meta.src_port = u16::from_be_bytes([ports[0], ports[1]]);
            meta.dst_port = u16::from_be_bytes([ports[2], ports[3]]);
            ParsedFrame::Ipv4(meta)
        }
        None => ParsedFrame::Default { len },
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::vec::Vec;

    /// 构造一个测试帧
    pub(crate) struct FrameBuilder {
        pub vlan: Option<(u16, u16)>,
        pub ether_type: u16,
        pub src: [u8; 4],
        pub dst: [u8; 4],
        pub protocol: u8,
        pub ihl: u8,
        pub src_port: u16,
        pub dst_port: u16,
        pub payload: usize,
    }

    impl FrameBuilder {
        pub(crate) fn tcp(src: [u8; 4], dst: [u8; 4], dst_port: u16) -> Self {
            Self {
                vlan: None,
                ether_type: ETH_P_IPV4,
                src,
                dst,
                protocol: PROTOCOL_TCP,
                ihl: 5,
                src_port: 40000,
                dst_port,
                payload: 0,
            }
        }

        pub(crate) fn build(&self) -> Vec<u8> {
            let mut buf = Vec::new();
            buf.extend_from_slice(&[0xAA; 6]);
            buf.extend_from_slice(&[0xBB; 6]);
            if let Some((tpid, tci)) = self.vlan {
                buf.extend_from_slice(&tpid.to_be_bytes());
                buf.extend_from_slice(&tci.to_be_bytes());
            }
            buf.extend_from_slice(&self.ether_type.to_be_bytes());
            if self.ether_type != ETH_P_IPV4 {
                buf.extend(core::iter::repeat(0).take(40));
                return buf;
            }

            let mut ip = [0u8; IPV4_HDR_LEN];
            ip[0] = 0x40 | self.ihl;
            ip[8] = 64;
            ip[9] = self.protocol;
            ip[12..16].copy_from_slice(&self.src);
            ip[16..20].copy_from_slice(&self.dst);
            buf.extend_from_slice(&ip);
            if self.ihl > 5 {
                buf.extend(core::iter::repeat(0).take((self.ihl as usize - 5) * 4));
            }

            match self.protocol {
                PROTOCOL_TCP => {
                    let mut tcp = [0u8; TCP_HDR_LEN];
                    tcp[0..2].copy_from_slice(&self.src_port.to_be_bytes());
                    tcp[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
                    buf.extend_from_slice(&tcp);
                }
                PROTOCOL_UDP => {
                    let mut udp = [0u8; UDP_HDR_LEN];
                    udp[0..2].copy_from_slice(&self.src_port.to_be_bytes());
                    udp[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
                    buf.extend_from_slice(&udp);
                }
                _ => buf.extend_from_slice(&[0u8; 8]),
            }
            buf.extend(core::iter::repeat(0x5A).take(self.payload));
            buf
        }
    }

    #[test]
    fn test_parse_tcp_frame() {
        let bytes = FrameBuilder::tcp([10, 0, 0, 1], [10, 0, 0, 2], 443).build();
        let parsed = parse_frame(&SliceFrame(&bytes));
        let ParsedFrame::Ipv4(meta) = parsed else {
            panic!("expected ipv4, got {parsed:?}");
        };
        assert_eq!(meta.src_ip, 0x0A00_0001);
        assert_eq!(meta.dst_ip, 0x0A00_0002);
        assert_eq!(meta.src_port, 40000);
        assert_eq!(meta.dst_port, 443);
        assert_eq!(meta.protocol, PROTOCOL_TCP);
        assert_eq!(meta.vlan_id, None);
        assert_eq!(meta.len, bytes.len() as u64);
    }

    #[test]
    fn test_parse_honours_ihl_options() {
        let mut builder = FrameBuilder::tcp([1, 1, 1, 1], [2, 2, 2, 2], 8080);
        builder.ihl = 7;
        let bytes = builder.build();
        match parse_frame(&SliceFrame(&bytes)) {
            ParsedFrame::Ipv4(meta) => assert_eq!(meta.dst_port, 8080),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_vlan_tags() {
        for tpid in [ETH_P_8021Q, ETH_P_8021AD] {
            let mut builder = FrameBuilder::tcp([1, 1, 1, 1], [2, 2, 2, 2], 53);
            builder.protocol = PROTOCOL_UDP;
            builder.vlan = Some((tpid, 0x2000 | 100));
            let bytes = builder.build();
            match parse_frame(&SliceFrame(&bytes)) {
                ParsedFrame::Ipv4(meta) => {
                    assert_eq!(meta.vlan_id, Some(100));
                    assert_eq!(meta.dst_port, 53);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn test_truncated_frames_fail_open() {
        let bytes = FrameBuilder::tcp([1, 1, 1, 1], [2, 2, 2, 2], 80).build();

        // 以太网头不完整
        assert_eq!(parse_frame(&SliceFrame(&bytes[..10])), ParsedFrame::Unclassified);
        // IPv4 头不完整
        assert_eq!(parse_frame(&SliceFrame(&bytes[..20])), ParsedFrame::Unclassified);
        // TCP 头不完整，走默认策略
        let cut = ETH_HDR_LEN + IPV4_HDR_LEN + 10;
        assert_eq!(
            parse_frame(&SliceFrame(&bytes[..cut])),
            ParsedFrame::Default { len: cut as u64 }
        );
        // 空帧
        assert_eq!(parse_frame(&SliceFrame(&[])), ParsedFrame::Unclassified);
    }

    #[test]
    fn test_truncated_vlan_tag() {
        let mut bytes = std::vec![0u8; 12];
        bytes.extend_from_slice(&ETH_P_8021Q.to_be_bytes());
        bytes.extend_from_slice(&[0x00, 0x64]);
        assert_eq!(parse_frame(&SliceFrame(&bytes)), ParsedFrame::Unclassified);
    }

    #[test]
    fn test_non_ip_and_ipv6() {
        let mut arp = FrameBuilder::tcp([0; 4], [0; 4], 0);
        arp.ether_type = 0x0806;
        assert_eq!(parse_frame(&SliceFrame(&arp.build())), ParsedFrame::Unclassified);

        let mut v6 = FrameBuilder::tcp([0; 4], [0; 4], 0);
        v6.ether_type = ETH_P_IPV6;
        let bytes = v6.build();
        assert_eq!(
            parse_frame(&SliceFrame(&bytes)),
            ParsedFrame::Default { len: bytes.len() as u64 }
        );
    }

    #[test]
    fn test_bad_ihl_is_unclassified() {
        let mut builder = FrameBuilder::tcp([1, 1, 1, 1], [2, 2, 2, 2], 80);
        builder.ihl = 3;
        let bytes = builder.build();
        assert_eq!(parse_frame(&SliceFrame(&bytes)), ParsedFrame::Unclassified);
    }
}
