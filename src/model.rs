use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;

/// DNS记录类型编号
pub const TYPE_A: u16 = 1;
pub const TYPE_NS: u16 = 2;
pub const TYPE_CNAME: u16 = 5;
pub const TYPE_SOA: u16 = 6;
pub const TYPE_PTR: u16 = 12;
pub const TYPE_MX: u16 = 15;
pub const TYPE_TXT: u16 = 16;
pub const TYPE_AAAA: u16 = 28;
pub const TYPE_SRV: u16 = 33;
pub const TYPE_SPF: u16 = 99;

/// 数据来源类型标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    Dns,
    Cert,
    Api,
    Scrape,
    Brute,
    Alt,
    Archive,
    Axfr,
    External,
}

impl Tag {
    /// 可信来源的名称声明不经过泛解析过滤
    pub fn trusted(&self) -> bool {
        matches!(self, Tag::Dns | Tag::Cert | Tag::Archive | Tag::Axfr)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tag::Dns => "dns",
            Tag::Cert => "cert",
            Tag::Api => "api",
            Tag::Scrape => "scrape",
            Tag::Brute => "brute",
            Tag::Alt => "alt",
            Tag::Archive => "archive",
            Tag::Axfr => "axfr",
            Tag::External => "external",
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 队列与总线的优先级档位
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Priority {
    pub const COUNT: usize = 4;
}

/// 单条DNS应答记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsAnswer {
    pub name: String,
    /// 记录类型编号 (1=A, 5=CNAME, 12=PTR, ...)
    pub rtype: u16,
    pub ttl: u32,
    /// 规范化的记录数据文本
    pub data: String,
}

/// 管线中流转的域名请求
#[derive(Debug, Clone)]
pub struct DnsRequest {
    pub name: String,
    pub domain: String,
    /// 解析完成后才会填充
    pub records: Vec<DnsAnswer>,
    pub tag: Tag,
    pub source: String,
}

impl DnsRequest {
    pub fn new(name: &str, domain: &str, tag: Tag, source: &str) -> Self {
        DnsRequest {
            name: name.to_string(),
            domain: domain.to_string(),
            records: Vec::new(),
            tag,
            source: source.to_string(),
        }
    }

    /// 清洗名称与域名: 小写、去掉前后的点和通配符标签
    pub fn sanitize(&mut self) {
        self.name = sanitize_name(&self.name);
        self.domain = sanitize_name(&self.domain);
    }

    pub fn has_cname_record(&self) -> bool {
        self.records.iter().any(|r| r.rtype == TYPE_CNAME)
    }

    pub fn has_addr_records(&self) -> bool {
        self.records
            .iter()
            .any(|r| r.rtype == TYPE_A || r.rtype == TYPE_AAAA)
    }
}

/// 规范化一个DNS名称
pub fn sanitize_name(name: &str) -> String {
    let mut s = name.trim().trim_matches('.').to_lowercase();
    if let Some(rest) = s.strip_prefix("*.") {
        s = rest.to_string();
    }
    s
}

/// 某个IP地址的处理请求
#[derive(Debug, Clone)]
pub struct AddrRequest {
    pub address: IpAddr,
    pub domain: String,
}

/// ASN与网段信息的查询请求/应答
#[derive(Debug, Clone)]
pub struct AsnRequest {
    pub address: Option<IpAddr>,
    pub asn: u32,
    /// 公告的CIDR前缀
    pub prefix: String,
    pub description: String,
    pub netblocks: HashSet<String>,
    pub tag: Tag,
    pub source: String,
}

impl AsnRequest {
    pub fn for_address(addr: IpAddr) -> Self {
        AsnRequest {
            address: Some(addr),
            asn: 0,
            prefix: String::new(),
            description: String::new(),
            netblocks: HashSet::new(),
            tag: Tag::Api,
            source: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_wildcard_and_dots() {
        assert_eq!(sanitize_name("*.Foo.Example.COM."), "foo.example.com");
        assert_eq!(sanitize_name(" bar.example.com"), "bar.example.com");
    }

    #[test]
    fn trusted_tags() {
        assert!(Tag::Dns.trusted());
        assert!(Tag::Cert.trusted());
        assert!(Tag::Axfr.trusted());
        assert!(Tag::Archive.trusted());
        assert!(!Tag::Api.trusted());
        assert!(!Tag::Scrape.trusted());
    }

    #[test]
    fn record_helpers() {
        let mut req = DnsRequest::new("a.example.com", "example.com", Tag::Dns, "DNS");
        assert!(!req.has_addr_records());
        req.records.push(DnsAnswer {
            name: "a.example.com".to_string(),
            rtype: TYPE_A,
            ttl: 0,
            data: "1.2.3.4".to_string(),
        });
        assert!(req.has_addr_records());
        assert!(!req.has_cname_record());
    }
}
