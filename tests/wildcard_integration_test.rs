//! 用合成解析器验证泛解析分类

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use trust_dns_proto::rr::RecordType;

use rsurface::model::{DnsAnswer, DnsRequest, Priority, Tag, TYPE_A};
use rsurface::resolver::{ResolveError, ResolveResult, Resolver, ResolverStats};
use rsurface::{ResolverPool, WildcardType};

/// 合成解析器: 按规则应答任意名称
struct SyntheticResolver {
    /// 后缀 -> 应答模式
    zones: HashMap<String, ZoneBehavior>,
    counter: AtomicU32,
}

#[derive(Clone)]
enum ZoneBehavior {
    /// 任何名称都返回同一个地址
    FixedAnswer(String),
    /// 每次查询返回不同地址
    RandomAnswer,
}

impl SyntheticResolver {
    fn new(zones: HashMap<String, ZoneBehavior>) -> Self {
        SyntheticResolver {
            zones,
            counter: AtomicU32::new(1),
        }
    }

    fn behavior_for(&self, name: &str) -> Option<ZoneBehavior> {
        self.zones
            .iter()
            .find(|(suffix, _)| name.ends_with(suffix.as_str()))
            .map(|(_, b)| b.clone())
    }
}

#[async_trait]
impl Resolver for SyntheticResolver {
    fn address(&self) -> String {
        "synthetic:53".to_string()
    }

    async fn resolve(&self, name: &str, qtype: RecordType, _priority: Priority) -> ResolveResult {
        if qtype != RecordType::A {
            return Err(ResolveError::new("no records", 3, false));
        }
        match self.behavior_for(name) {
            Some(ZoneBehavior::FixedAnswer(ip)) => Ok(vec![DnsAnswer {
                name: name.to_string(),
                rtype: TYPE_A,
                ttl: 60,
                data: ip,
            }]),
            Some(ZoneBehavior::RandomAnswer) => {
                let n = self.counter.fetch_add(1, Ordering::SeqCst);
                Ok(vec![DnsAnswer {
                    name: name.to_string(),
                    rtype: TYPE_A,
                    ttl: 60,
                    data: format!("10.0.{}.{}", (n >> 8) & 0xff, n & 0xff),
                }])
            }
            None => Err(ResolveError::new("no records", 3, false)),
        }
    }

    fn stop(&self) {}
    fn is_stopped(&self) -> bool {
        false
    }
    fn stats(&self) -> ResolverStats {
        ResolverStats::default()
    }
    fn wipe_stats(&self) {}
}

fn pool_with(zones: HashMap<String, ZoneBehavior>) -> Arc<ResolverPool> {
    ResolverPool::new(
        vec![Arc::new(SyntheticResolver::new(zones)) as Arc<dyn Resolver>],
        None,
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fixed_answers_classify_as_static() {
    let mut zones = HashMap::new();
    zones.insert(
        "wc.example.test".to_string(),
        ZoneBehavior::FixedAnswer("6.6.6.6".to_string()),
    );
    let pool = pool_with(zones);

    let mut req = DnsRequest::new("anything.wc.example.test", "example.test", Tag::Api, "test");
    req.records.push(DnsAnswer {
        name: "anything.wc.example.test".to_string(),
        rtype: TYPE_A,
        ttl: 60,
        data: "6.6.6.6".to_string(),
    });

    let wtype = pool.get_wildcard_type(&req).await;
    assert_eq!(wtype, WildcardType::Static);
    assert!(pool.matches_wildcard(&req).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn random_answers_classify_as_dynamic() {
    let mut zones = HashMap::new();
    zones.insert("wc.example.test".to_string(), ZoneBehavior::RandomAnswer);
    let pool = pool_with(zones);

    let mut req = DnsRequest::new("label.wc.example.test", "example.test", Tag::Scrape, "test");
    req.records.push(DnsAnswer {
        name: "label.wc.example.test".to_string(),
        rtype: TYPE_A,
        ttl: 60,
        data: "10.0.0.1".to_string(),
    });

    let wtype = pool.get_wildcard_type(&req).await;
    assert_eq!(wtype, WildcardType::Dynamic);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unanswered_zone_classifies_as_none() {
    let pool = pool_with(HashMap::new());

    let req = DnsRequest::new("real.example.test", "example.test", Tag::Api, "test");
    let wtype = pool.get_wildcard_type(&req).await;
    assert_eq!(wtype, WildcardType::None);
    assert!(!pool.matches_wildcard(&req).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn static_mismatch_does_not_flag_other_records() {
    // 泛解析指向6.6.6.6，真实记录指向别处时不应拦截
    let mut zones = HashMap::new();
    zones.insert(
        "wc.example.test".to_string(),
        ZoneBehavior::FixedAnswer("6.6.6.6".to_string()),
    );
    let pool = pool_with(zones);

    let mut req = DnsRequest::new("real.wc.example.test", "example.test", Tag::Api, "test");
    req.records.push(DnsAnswer {
        name: "real.wc.example.test".to_string(),
        rtype: TYPE_A,
        ttl: 60,
        data: "9.9.9.9".to_string(),
    });

    let wtype = pool.get_wildcard_type(&req).await;
    assert_eq!(wtype, WildcardType::None);
}
