use std::net::IpAddr;

use ipnet::IpNet;

use crate::model::sanitize_name;

/// 默认使用的公共递归解析器
pub const DEFAULT_RESOLVERS: &[&str] = &[
    "8.8.8.8",
    "8.8.4.4",
    "1.1.1.1",
    "1.0.0.1",
    "9.9.9.10",
    "64.6.64.6",
    "208.67.222.222",
    "77.88.8.1",
];

/// 数据源筛选
#[derive(Debug, Clone, Default)]
pub struct SourceFilter {
    /// true表示sources是白名单，否则是黑名单
    pub include: bool,
    pub sources: Vec<String>,
}

/// 一次枚举的全部配置
#[derive(Debug, Clone)]
pub struct Config {
    /// 根域名列表
    pub domains: Vec<String>,
    /// 额外纳入范围的CIDR
    pub cidrs: Vec<IpNet>,
    /// 需要预先广播的ASN
    pub asns: Vec<u32>,
    /// 不再处理的名称后缀
    pub blacklist: Vec<String>,
    /// 使用者额外提供的已知名称
    pub provided_names: Vec<String>,
    /// 上游解析器地址
    pub resolvers: Vec<String>,
    /// 全局并发DNS查询上限，0表示只跑管线不做解析
    pub max_dns_queries: usize,
    /// 主动模式: 区域传送、证书挖掘、更大的反向扫描
    pub active: bool,
    /// 被动模式: 只收集不解析
    pub passive: bool,
    /// 整体超时(分钟)，0表示不限制
    pub timeout_mins: u64,
    pub source_filter: SourceFilter,
    pub verbose: bool,
    /// 本次枚举的标识
    pub uuid: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            domains: Vec::new(),
            cidrs: Vec::new(),
            asns: Vec::new(),
            blacklist: Vec::new(),
            provided_names: Vec::new(),
            resolvers: DEFAULT_RESOLVERS.iter().map(|s| s.to_string()).collect(),
            max_dns_queries: 4000,
            active: false,
            passive: false,
            timeout_mins: 0,
            source_filter: SourceFilter::default(),
            verbose: false,
            uuid: format!("enum-{:08x}", rand::random::<u32>()),
        }
    }
}

impl Config {
    /// 登记一个根域名
    pub fn add_domain(&mut self, domain: &str) {
        let d = sanitize_name(domain);
        if !d.is_empty() && !self.domains.contains(&d) {
            self.domains.push(d);
        }
    }

    /// 启动前的配置检查
    pub fn check_settings(&self) -> Result<(), String> {
        if self.domains.is_empty() {
            return Err("no root domain names were provided".to_string());
        }
        if self.resolvers.is_empty() {
            return Err("no upstream resolvers were provided".to_string());
        }
        if self.active && self.passive {
            return Err("active and passive modes are mutually exclusive".to_string());
        }
        Ok(())
    }

    /// 返回名称所属的根域名
    pub fn which_domain(&self, name: &str) -> Option<String> {
        let n = sanitize_name(name);
        // 选最长的匹配，子域归属最具体的根
        self.domains
            .iter()
            .filter(|d| n == **d || n.ends_with(&format!(".{}", d)))
            .max_by_key(|d| d.len())
            .cloned()
    }

    pub fn is_domain_in_scope(&self, name: &str) -> bool {
        self.which_domain(name).is_some()
    }

    /// 地址是否落在声明的网段范围内
    pub fn is_addr_in_scope(&self, addr: IpAddr) -> bool {
        if self.cidrs.is_empty() {
            return true;
        }
        self.cidrs.iter().any(|c| c.contains(&addr))
    }

    pub fn blacklisted(&self, name: &str) -> bool {
        let n = sanitize_name(name);
        self.blacklist
            .iter()
            .any(|b| n == *b || n.ends_with(&format!(".{}", b)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> Config {
        let mut c = Config::default();
        c.add_domain("example.com");
        c.add_domain("sub.example.com");
        c
    }

    #[test]
    fn which_domain_prefers_longest() {
        let c = cfg();
        assert_eq!(
            c.which_domain("www.sub.example.com"),
            Some("sub.example.com".to_string())
        );
        assert_eq!(
            c.which_domain("www.example.com"),
            Some("example.com".to_string())
        );
        assert_eq!(c.which_domain("example.org"), None);
    }

    #[test]
    fn scope_and_blacklist() {
        let mut c = cfg();
        c.blacklist.push("dev.example.com".to_string());
        assert!(c.is_domain_in_scope("a.example.com"));
        assert!(!c.is_domain_in_scope("example.net"));
        assert!(c.blacklisted("x.dev.example.com"));
        assert!(!c.blacklisted("x.example.com"));
    }

    #[test]
    fn duplicate_domains_ignored() {
        let mut c = Config::default();
        c.add_domain("Example.COM.");
        c.add_domain("example.com");
        assert_eq!(c.domains.len(), 1);
    }

    #[test]
    fn settings_check() {
        let mut c = Config::default();
        assert!(c.check_settings().is_err());
        c.add_domain("example.com");
        assert!(c.check_settings().is_ok());
        c.active = true;
        c.passive = true;
        assert!(c.check_settings().is_err());
    }
}
