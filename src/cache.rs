use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

use ipnet::IpNet;

use crate::model::AsnRequest;
use crate::netutil::parse_cidr;

/// ASN/网段信息缓存
///
/// 数据源的NewAsn应答写进来，地址管理器按IP查询。
pub struct NetCache {
    entries: Mutex<HashMap<u32, AsnRequest>>,
}

impl NetCache {
    pub fn new() -> Self {
        NetCache {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// 合并一条ASN应答
    pub fn update(&self, req: &AsnRequest) {
        if req.asn == 0 {
            return;
        }
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(&req.asn) {
            Some(existing) => {
                existing.netblocks.extend(req.netblocks.iter().cloned());
                if existing.description.is_empty() {
                    existing.description = req.description.clone();
                }
                if existing.prefix.is_empty() {
                    existing.prefix = req.prefix.clone();
                }
            }
            None => {
                entries.insert(req.asn, req.clone());
            }
        }
    }

    /// 找出覆盖该地址的ASN信息，取前缀最长的网段
    pub fn addr_search(&self, addr: IpAddr) -> Option<AsnRequest> {
        let entries = self.entries.lock().unwrap();

        let mut best: Option<(u8, u32, IpNet)> = None;
        for (asn, entry) in entries.iter() {
            for block in &entry.netblocks {
                if let Some(net) = parse_cidr(block) {
                    if net.contains(&addr) {
                        let better = match &best {
                            Some((plen, _, _)) => net.prefix_len() > *plen,
                            None => true,
                        };
                        if better {
                            best = Some((net.prefix_len(), *asn, net));
                        }
                    }
                }
            }
        }

        best.and_then(|(_, asn, net)| {
            entries.get(&asn).map(|entry| {
                let mut found = entry.clone();
                found.address = Some(addr);
                found.prefix = net.to_string();
                found
            })
        })
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for NetCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Tag;

    fn asn(asn: u32, blocks: &[&str]) -> AsnRequest {
        AsnRequest {
            address: None,
            asn,
            prefix: blocks.first().unwrap_or(&"").to_string(),
            description: format!("AS{}", asn),
            netblocks: blocks.iter().map(|b| b.to_string()).collect(),
            tag: Tag::Api,
            source: "test".to_string(),
        }
    }

    #[test]
    fn longest_prefix_wins() {
        let cache = NetCache::new();
        cache.update(&asn(100, &["10.0.0.0/8"]));
        cache.update(&asn(200, &["10.1.0.0/16"]));

        let found = cache.addr_search("10.1.2.3".parse().unwrap()).unwrap();
        assert_eq!(found.asn, 200);
        assert_eq!(found.prefix, "10.1.0.0/16");

        let found = cache.addr_search("10.2.2.3".parse().unwrap()).unwrap();
        assert_eq!(found.asn, 100);
    }

    #[test]
    fn miss_returns_none() {
        let cache = NetCache::new();
        cache.update(&asn(100, &["10.0.0.0/8"]));
        assert!(cache.addr_search("192.0.2.1".parse().unwrap()).is_none());
    }

    #[test]
    fn update_merges_netblocks() {
        let cache = NetCache::new();
        cache.update(&asn(100, &["10.0.0.0/8"]));
        cache.update(&asn(100, &["172.16.0.0/12"]));
        assert_eq!(cache.len(), 1);
        assert!(cache
            .addr_search("172.16.5.5".parse().unwrap())
            .is_some());
    }
}
