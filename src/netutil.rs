use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::IpNet;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// 匹配任意合法子域名的正则
    pub static ref SUBDOMAIN_RE: Regex = Regex::new(
        r"(?i)(([a-z0-9]|[_a-z0-9][_a-z0-9-]{0,61}[a-z0-9])\.)+[a-z][a-z0-9-]{0,61}[a-z0-9]"
    )
    .unwrap();
}

/// 保留地址网段，扫描时跳过
const RESERVED_CIDRS: &[&str] = &[
    "0.0.0.0/8",
    "10.0.0.0/8",
    "100.64.0.0/10",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.0.0.0/24",
    "192.0.2.0/24",
    "192.88.99.0/24",
    "192.168.0.0/16",
    "198.18.0.0/15",
    "198.51.100.0/24",
    "203.0.113.0/24",
    "224.0.0.0/4",
    "240.0.0.0/4",
    "::1/128",
    "fc00::/7",
    "fe80::/10",
    "2001:db8::/32",
];

/// 判断地址是否落在保留网段内
pub fn is_reserved_address(addr: IpAddr) -> bool {
    RESERVED_CIDRS.iter().any(|c| {
        c.parse::<IpNet>()
            .map(|net| net.contains(&addr))
            .unwrap_or(false)
    })
}

/// 生成IPv4反向解析名
pub fn reverse_ipv4_name(ip: Ipv4Addr) -> String {
    let o = ip.octets();
    format!("{}.{}.{}.{}.in-addr.arpa", o[3], o[2], o[1], o[0])
}

/// 生成IPv6 nibble形式的反向解析名
pub fn reverse_ipv6_name(ip: Ipv6Addr) -> String {
    let mut nibbles = Vec::with_capacity(32);
    for byte in ip.octets().iter().rev() {
        nibbles.push(format!("{:x}", byte & 0x0f));
        nibbles.push(format!("{:x}", byte >> 4));
    }
    format!("{}.ip6.arpa", nibbles.join("."))
}

/// 生成任意IP的PTR查询名
pub fn reverse_name(addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(v4) => reverse_ipv4_name(v4),
        IpAddr::V6(v6) => reverse_ipv6_name(v6),
    }
}

/// 取CIDR内以addr为中心的一段邻居地址，最多size个
///
/// IPv6网段过大，只返回地址本身。
pub fn cidr_subset(cidr: &IpNet, addr: IpAddr, size: usize) -> Vec<IpAddr> {
    let (net, ip) = match (cidr, addr) {
        (IpNet::V4(net), IpAddr::V4(ip)) => (net, ip),
        _ => return vec![addr],
    };
    if !net.contains(&ip) {
        return vec![addr];
    }

    let first = u32::from(net.network());
    let last = u32::from(net.broadcast());
    let center = u32::from(ip);
    let half = (size / 2) as u32;

    let start = center.saturating_sub(half).max(first);
    let mut out = Vec::with_capacity(size);
    let mut cur = start;
    while out.len() < size && cur <= last {
        out.push(IpAddr::V4(Ipv4Addr::from(cur)));
        if cur == u32::MAX {
            break;
        }
        cur += 1;
    }
    out
}

/// 从CIDR字符串解析出网段
pub fn parse_cidr(s: &str) -> Option<IpNet> {
    s.trim().parse::<IpNet>().ok()
}

/// 从一段文本里提取所有子域名
pub fn extract_names(text: &str) -> Vec<String> {
    SUBDOMAIN_RE
        .find_iter(text)
        .map(|m| m.as_str().trim_matches('.').to_lowercase())
        .collect()
}

/// 去掉证书/抓取结果里的通配符标签
pub fn remove_asterisk_label(name: &str) -> String {
    name.trim_start_matches("*.").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverse_v4() {
        assert_eq!(
            reverse_ipv4_name("192.0.2.10".parse().unwrap()),
            "10.2.0.192.in-addr.arpa"
        );
    }

    #[test]
    fn reverse_v6_nibbles() {
        let name = reverse_ipv6_name("2001:db8::1".parse().unwrap());
        assert!(name.ends_with(".ip6.arpa"));
        assert!(name.starts_with("1.0.0.0."));
        // 32个nibble加上后缀
        assert_eq!(name.split('.').count(), 34);
    }

    #[test]
    fn reserved_ranges() {
        assert!(is_reserved_address("10.1.2.3".parse().unwrap()));
        assert!(is_reserved_address("192.168.0.1".parse().unwrap()));
        assert!(is_reserved_address("127.0.0.1".parse().unwrap()));
        assert!(!is_reserved_address("93.184.216.34".parse().unwrap()));
    }

    #[test]
    fn subset_centered_and_clamped() {
        let cidr: IpNet = "10.0.0.0/24".parse().unwrap();
        let ips = cidr_subset(&cidr, "10.0.0.5".parse().unwrap(), 250);
        assert!(!ips.is_empty());
        assert!(ips.len() <= 250);
        assert!(ips.contains(&"10.0.0.5".parse().unwrap()));
        // /24里最多256个地址
        assert!(ips.len() <= 256);
        for ip in &ips {
            assert!(cidr.contains(ip));
        }
    }

    #[test]
    fn subset_small_size() {
        let cidr: IpNet = "10.0.0.0/24".parse().unwrap();
        let ips = cidr_subset(&cidr, "10.0.0.128".parse().unwrap(), 10);
        assert_eq!(ips.len(), 10);
        assert!(ips.contains(&"10.0.0.128".parse().unwrap()));
    }

    #[test]
    fn name_extraction() {
        let text = "<a href=\"https://www.example.com/\">\n dev.example.com ";
        let names = extract_names(text);
        assert!(names.contains(&"www.example.com".to_string()));
        assert!(names.contains(&"dev.example.com".to_string()));
    }
}
