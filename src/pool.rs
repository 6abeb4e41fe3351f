use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use trust_dns_proto::rr::RecordType;

use crate::bus::{BusEvent, EventBus};
use crate::model::{sanitize_name, DnsAnswer, DnsRequest, Priority, TYPE_PTR};
use crate::netutil::reverse_name;
use crate::resolver::{
    BaseResolver, ResolveError, ResolveResult, Resolver, ResolverStats, RCODE_RESOLVER_ERR,
};
use crate::wildcard::{manage_wildcards, WildcardMsg, WildcardType};

/// 各优先级允许的查询尝试次数
fn attempts_for(priority: Priority) -> usize {
    match priority {
        Priority::Low => 25,
        Priority::Normal => 50,
        Priority::High => 100,
        Priority::Critical => 1000,
    }
}

/// 多上游解析器池
///
/// 随机挑选可用解析器并按优先级预算重试；
/// 同时持有泛解析缓存和NS探测出的域名缓存。
pub struct ResolverPool {
    resolvers: Vec<Arc<dyn Resolver>>,
    bus: Option<Arc<EventBus>>,
    domain_cache: Mutex<HashSet<String>>,
    wildcard_tx: mpsc::UnboundedSender<WildcardMsg>,
    stopped: AtomicBool,
}

impl ResolverPool {
    pub fn new(resolvers: Vec<Arc<dyn Resolver>>, bus: Option<Arc<EventBus>>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let pool = Arc::new(ResolverPool {
            resolvers,
            bus,
            domain_cache: Mutex::new(HashSet::new()),
            wildcard_tx: tx.clone(),
            stopped: AtomicBool::new(false),
        });
        tokio::spawn(manage_wildcards(Arc::downgrade(&pool), rx, tx));
        pool
    }

    /// 按地址列表建立BaseResolver池
    pub fn setup(addrs: &[String], bus: Option<Arc<EventBus>>) -> Arc<Self> {
        let resolvers: Vec<Arc<dyn Resolver>> = addrs
            .iter()
            .map(|a| BaseResolver::new(a) as Arc<dyn Resolver>)
            .collect();
        Self::new(resolvers, bus)
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
        for r in &self.resolvers {
            r.stop();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    /// 汇总全部解析器的计数
    pub fn stats(&self) -> ResolverStats {
        let mut total = ResolverStats::default();
        let mut rtt_sum = Duration::ZERO;
        let mut rtt_n = 0u32;
        for r in &self.resolvers {
            let st = r.stats();
            total.attempts += st.attempts;
            total.timeouts += st.timeouts;
            total.completions += st.completions;
            if st.avg_rtt > Duration::ZERO {
                rtt_sum += st.avg_rtt;
                rtt_n += 1;
            }
            for (code, n) in st.rcodes {
                *total.rcodes.entry(code).or_insert(0) += n;
            }
        }
        if rtt_n > 0 {
            total.avg_rtt = rtt_sum / rtt_n;
        }
        total
    }

    pub fn wipe_stats(&self) {
        for r in &self.resolvers {
            r.wipe_stats();
        }
    }

    /// 随机选出一个未停止的解析器
    fn next_resolver(&self) -> Option<Arc<dyn Resolver>> {
        let max = self.resolvers.len();
        if max == 0 {
            return None;
        }

        let mut rng = rand::thread_rng();
        for _ in 0..=max {
            let r = &self.resolvers[rng.gen_range(0..max)];
            if !r.is_stopped() {
                return Some(r.clone());
            }
        }
        // 随机挑选失败后顺序扫描
        self.resolvers.iter().find(|r| !r.is_stopped()).cloned()
    }

    fn report_completion(&self, rcode: i32) {
        if let Some(bus) = &self.bus {
            bus.publish(Priority::Critical, BusEvent::ResolveCompleted(rcode));
        }
    }

    /// 在池内执行一次DNS查询
    pub async fn resolve(
        &self,
        name: &str,
        qtype: RecordType,
        priority: Priority,
    ) -> ResolveResult {
        let budget = attempts_for(priority);

        for _ in 0..budget {
            if self.is_stopped() {
                return Err(ResolveError::new(
                    "the resolver pool has been stopped",
                    RCODE_RESOLVER_ERR,
                    false,
                ));
            }

            let r = match self.next_resolver() {
                Some(r) => r,
                None => {
                    let ms = rand::thread_rng().gen_range(1000..=1500);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    continue;
                }
            };

            match r.resolve(name, qtype, priority).await {
                Ok(ans) => {
                    self.report_completion(0);
                    return Ok(ans);
                }
                Err(e) => {
                    self.report_completion(e.rcode);
                    if e.retryable() {
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        Err(ResolveError::new(
            format!(
                "{} attempts for {} type {} returned 0 results",
                budget, name, qtype
            ),
            RCODE_RESOLVER_ERR,
            false,
        ))
    }

    /// 反向解析，返回(PTR查询名, 目标名称)
    pub async fn reverse(
        &self,
        addr: IpAddr,
        priority: Priority,
    ) -> Result<(String, String), ResolveError> {
        let ptr = reverse_name(addr);
        let answers = self.resolve(&ptr, RecordType::PTR, priority).await?;

        let name = answers
            .iter()
            .find(|a| a.rtype == TYPE_PTR)
            .map(|a| a.data.trim_end_matches('.').to_string())
            .unwrap_or_default();

        if name.is_empty() {
            return Err(ResolveError::new(
                format!("PTR record not found for IP address: {}", addr),
                RCODE_RESOLVER_ERR,
                false,
            ));
        }
        if name.ends_with(".in-addr.arpa") || name.ends_with(".ip6.arpa") {
            return Err(ResolveError::new(
                format!("invalid target in PTR record answer: {}", name),
                RCODE_RESOLVER_ERR,
                false,
            ));
        }
        Ok((ptr, name))
    }

    /// 从名称逐级向上找第一个响应NS查询的后缀
    pub async fn subdomain_to_domain(&self, name: &str) -> Option<String> {
        let name = sanitize_name(name);
        let labels: Vec<&str> = name.split('.').collect();

        {
            let cache = self.domain_cache.lock().unwrap();
            for i in 0..labels.len() {
                let sub = labels[i..].join(".");
                if cache.contains(&sub) {
                    return Some(sub);
                }
            }
        }

        for i in 0..labels.len().saturating_sub(1) {
            let sub = labels[i..].join(".");
            if self
                .resolve(&sub, RecordType::NS, Priority::High)
                .await
                .is_ok()
            {
                self.domain_cache.lock().unwrap().insert(sub.clone());
                return Some(sub);
            }
        }
        None
    }

    async fn fetch_wildcard(&self, sub: String) -> (WildcardType, Vec<DnsAnswer>) {
        let (tx, rx) = oneshot::channel();
        if self
            .wildcard_tx
            .send(WildcardMsg::Fetch { sub, tx })
            .is_err()
        {
            return (WildcardType::None, Vec::new());
        }
        rx.await.unwrap_or((WildcardType::None, Vec::new()))
    }

    async fn check_ips_across_levels(&self, req: &DnsRequest) -> WildcardType {
        let (tx, rx) = oneshot::channel();
        if self
            .wildcard_tx
            .send(WildcardMsg::IpsAcrossLevels {
                req: req.clone(),
                tx,
            })
            .is_err()
        {
            return WildcardType::None;
        }
        rx.await.unwrap_or(WildcardType::None)
    }

    /// 请求是否命中了泛解析
    pub async fn matches_wildcard(&self, req: &DnsRequest) -> bool {
        self.get_wildcard_type(req).await != WildcardType::None
    }

    /// 返回请求命中的泛解析类型
    pub async fn get_wildcard_type(&self, req: &DnsRequest) -> WildcardType {
        let mut req = req.clone();
        req.sanitize();
        let name = req.name.clone();
        let domain = req.domain.clone();
        if name.is_empty() || domain.is_empty() {
            return WildcardType::None;
        }

        let base = domain.split('.').count();
        let mut labels: Vec<&str> = name.split('.').collect();
        if labels.len() > base {
            labels.remove(0);
        }
        if labels.len() < base {
            return WildcardType::None;
        }

        let req_data: HashSet<String> = req
            .records
            .iter()
            .map(|a| a.data.trim_matches('.').to_string())
            .collect();

        // 从根域开始逐级向下检查
        for i in (0..=labels.len() - base).rev() {
            let sub = labels[i..].join(".");
            let (wtype, answers) = self.fetch_wildcard(sub).await;

            match wtype {
                WildcardType::Dynamic => return WildcardType::Dynamic,
                WildcardType::Static => {
                    if req.records.is_empty() {
                        return WildcardType::Static;
                    }
                    let wc_data: HashSet<String> = answers
                        .iter()
                        .map(|a| a.data.trim_matches('.').to_string())
                        .collect();
                    if req_data.intersection(&wc_data).next().is_some() {
                        return WildcardType::Static;
                    }
                }
                WildcardType::None => {}
            }
        }

        self.check_ips_across_levels(&req).await
    }
}
