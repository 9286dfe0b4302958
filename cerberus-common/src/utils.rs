/// 点分十进制地址的四个字节转成主机字节序 u32
#[inline(always)]
pub fn ip_to_u32(octets: [u8; 4]) -> u32 {
    u32::from_be_bytes(octets)
}

/// 主机字节序 u32 转回四个字节（网络序），LPM 表的键就是这个格式
#[inline(always)]
pub fn u32_to_octets(addr: u32) -> [u8; 4] {
    addr.to_be_bytes()
}

/// 前缀长度转掩码，大于 32 按 32 处理
#[inline(always)]
pub fn prefix_to_mask(prefix_len: u8) -> u32 {
    match prefix_len {
        0 => 0,
        p if p >= 32 => u32::MAX,
        p => u32::MAX << (32 - p as u32),
    }
}

/// 掩码转前缀长度，非连续掩码返回 None
pub fn mask_to_prefix(mask: u32) -> Option<u8> {
    let ones = mask.leading_ones();
    if mask.checked_shl(ones).unwrap_or(0) == 0 {
        Some(ones as u8)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_mask_conversion() {
        assert_eq!(prefix_to_mask(0), 0);
        assert_eq!(prefix_to_mask(8), 0xFF00_0000);
        assert_eq!(prefix_to_mask(24), 0xFFFF_FF00);
        assert_eq!(prefix_to_mask(32), u32::MAX);
        assert_eq!(prefix_to_mask(40), u32::MAX);

        assert_eq!(mask_to_prefix(0xFFFF_0000), Some(16));
        assert_eq!(mask_to_prefix(u32::MAX), Some(32));
        assert_eq!(mask_to_prefix(0), Some(0));
        assert_eq!(mask_to_prefix(0xFF00_FF00), None);
    }

    #[test]
    fn test_ip_byte_order() {
        let addr = ip_to_u32([192, 168, 1, 10]);
        assert_eq!(addr, 0xC0A8_010A);
        assert_eq!(u32_to_octets(addr), [192, 168, 1, 10]);
    }
}
