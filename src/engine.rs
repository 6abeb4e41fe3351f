use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;

use crate::address::AddressManager;
use crate::bus::{BusEvent, EventBus, Topic};
use crate::cache::NetCache;
use crate::config::Config;
use crate::dnssrv::DnsService;
use crate::filter::{BloomFilter, Filter};
use crate::graph::{DataManager, EnumOutput, Graph, NodeKind};
use crate::managers::{DomainManager, FqdnManager, NameManager, SubdomainManager};
use crate::model::{AsnRequest, DnsRequest, Priority, Tag};
use crate::pool::ResolverPool;
use crate::queue::PriorityQueue;
use crate::service::{select_sources, spawn_source, EnumContext, SourceHandle};
use crate::sources::all_sources;

/// 残余过滤器的容量
pub const FILTER_MAX_SIZE: u64 = 1 << 23;

/// 被动模式每轮处理的名称数
const PASSIVE_BATCH: usize = 100_000;

/// 判定枚举结束的静默时长
const INACTIVITY_WINDOW: Duration = Duration::from_secs(10);

struct ResFilterState {
    filter: BloomFilter,
    count: u64,
}

struct ActivityState {
    last_active: Instant,
    window_start: Instant,
    queries: u64,
    retries: u64,
}

/// 引擎各组件共享的能力句柄
///
/// 管理器持有这里的非拥有引用，订阅关系统一归总线管。
pub struct EnumShared {
    pub config: Arc<Config>,
    pub bus: Arc<EventBus>,
    pub graph: Arc<Graph>,
    pub cache: Arc<NetCache>,
    pub srcs: Vec<SourceHandle>,
    pub data_mgr: Option<DataManager>,
    pub pool: Option<Arc<ResolverPool>>,
    /// 全局DNS查询信号量
    pub sem: Arc<Semaphore>,
    running: Arc<AtomicBool>,
    /// 已发布尚未完成的解析请求数
    pending_resolutions: AtomicUsize,
    res_filter: Mutex<ResFilterState>,
    /// 被残余过滤器拒绝的请求，稍后在图上补记来源
    pub alt_sources_queue: PriorityQueue<DnsRequest>,
    activity: Mutex<ActivityState>,
}

impl EnumShared {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn stop_running(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// 组件心跳走总线，引擎订阅后更新活动时间
    pub fn set_active(&self, src: &str) {
        self.bus
            .publish(Priority::Critical, BusEvent::SetActive(src.to_string()));
    }

    pub fn update_last_active(&self) {
        self.activity.lock().unwrap().last_active = Instant::now();
    }

    pub fn last_active(&self) -> Instant {
        self.activity.lock().unwrap().last_active
    }

    fn inc_queries(&self, rcode: i32) {
        use crate::resolver::{RCODE_NOT_AVAILABLE, RCODE_TIMEOUT, RETRY_CODES};

        let mut st = self.activity.lock().unwrap();
        st.queries += 1;
        if rcode == RCODE_TIMEOUT || rcode == RCODE_NOT_AVAILABLE || RETRY_CODES.contains(&rcode) {
            st.retries += 1;
        }
    }

    /// 统计窗口内的平均查询速率与重试占比
    pub fn queries_per_sec(&self) -> (u64, f64) {
        let st = self.activity.lock().unwrap();
        let secs = st.window_start.elapsed().as_secs().max(1);
        let per_sec = st.queries / secs;
        let pct = if st.queries > 0 {
            (st.retries as f64 / st.queries as f64) * 100.0
        } else {
            0.0
        };
        (per_sec, pct)
    }

    pub fn clear_per_sec(&self) {
        let mut st = self.activity.lock().unwrap();
        st.queries = 0;
        st.retries = 0;
        st.window_start = Instant::now();
    }

    pub fn inc_pending(&self) {
        self.pending_resolutions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_pending(&self) {
        let _ = self
            .pending_resolutions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    pub fn pending(&self) -> usize {
        self.pending_resolutions.load(Ordering::Relaxed)
    }

    /// 两级去重: 名称最多被接纳两次，一次不可信来源、一次可信来源。
    /// 可信记录存在后不再接受不可信的重复提交。
    pub fn check_res_filter(&self, req: &DnsRequest) -> Option<DnsRequest> {
        let mut st = self.res_filter.lock().unwrap();

        // 插入量超过容量后重建过滤器
        if st.count >= FILTER_MAX_SIZE {
            st.count = 0;
            st.filter = BloomFilter::new(FILTER_MAX_SIZE);
        }

        let trusted = req.tag.trusted();
        if !trusted && st.filter.has(&format!("{}{}", req.name, true)) {
            self.alt_sources_queue.append(req.clone());
            return None;
        }
        if st.filter.duplicate(&format!("{}{}", req.name, trusted)) {
            self.alt_sources_queue.append(req.clone());
            return None;
        }

        st.count += 1;
        Some(req.clone())
    }
}

/// DNS枚举引擎
pub struct Enumeration {
    pub shared: Arc<EnumShared>,
    managers: Vec<Arc<dyn FqdnManager>>,
    resolved_mgrs: Vec<Arc<dyn FqdnManager>>,
    addr_mgr: Option<Arc<AddressManager>>,
    name_mgr: Arc<NameManager>,
    domain_mgr: Arc<DomainManager>,
    resolved_filter: Arc<BloomFilter>,
    log_queue: PriorityQueue<String>,
}

impl Enumeration {
    /// 构造引擎但不启动主循环
    pub fn new(config: Config) -> Result<Self, String> {
        config.check_settings()?;
        let config = Arc::new(config);

        let bus = EventBus::new(config.max_dns_queries.max(100));
        let graph = Graph::new();
        let cache = Arc::new(NetCache::new());
        let running = Arc::new(AtomicBool::new(true));

        let ctx = EnumContext::new(config.clone(), bus.clone());
        let srcs: Vec<SourceHandle> = select_sources(&config, all_sources())
            .into_iter()
            .map(|s| spawn_source(s, ctx.clone()))
            .collect();

        let (pool, data_mgr) = if config.passive {
            (None, None)
        } else {
            let pool = ResolverPool::setup(&config.resolvers, Some(bus.clone()));
            let dm = DataManager::start(graph.clone(), bus.clone(), running.clone());
            (Some(pool), Some(dm))
        };

        let shared = Arc::new(EnumShared {
            config: config.clone(),
            bus,
            graph,
            cache,
            srcs,
            data_mgr,
            pool,
            sem: Arc::new(Semaphore::new(config.max_dns_queries.max(1))),
            running,
            pending_resolutions: AtomicUsize::new(0),
            res_filter: Mutex::new(ResFilterState {
                filter: BloomFilter::new(FILTER_MAX_SIZE),
                count: 0,
            }),
            alt_sources_queue: PriorityQueue::new(),
            activity: Mutex::new(ActivityState {
                last_active: Instant::now(),
                window_start: Instant::now(),
                queries: 0,
                retries: 0,
            }),
        });

        let addr_mgr = if config.passive {
            None
        } else {
            Some(AddressManager::new(shared.clone()))
        };
        let name_mgr = Arc::new(NameManager::new(shared.clone()));
        let sub_mgr = if config.passive {
            None
        } else {
            Some(Arc::new(SubdomainManager::new(shared.clone())))
        };
        let domain_mgr = Arc::new(DomainManager::new(shared.clone()));

        // 管理器的轮询顺序决定信息的消费顺序
        let mut managers: Vec<Arc<dyn FqdnManager>> = Vec::new();
        let mut resolved_mgrs: Vec<Arc<dyn FqdnManager>> = Vec::new();
        if let Some(am) = &addr_mgr {
            managers.push(Arc::new(am.clone()));
            resolved_mgrs.push(Arc::new(am.clone()));
        }
        managers.push(name_mgr.clone());
        if let Some(sm) = &sub_mgr {
            managers.push(sm.clone());
            resolved_mgrs.push(sm.clone());
        }
        managers.push(domain_mgr.clone());

        Ok(Enumeration {
            shared,
            managers,
            resolved_mgrs,
            addr_mgr,
            name_mgr,
            domain_mgr,
            resolved_filter: Arc::new(BloomFilter::new(FILTER_MAX_SIZE)),
            log_queue: PriorityQueue::new(),
        })
    }

    fn install_subscriptions(&self) {
        let shared = &self.shared;

        let nm = self.name_mgr.clone();
        shared.bus.subscribe_fn(Topic::NewName, move |ev| {
            if let BusEvent::NewName(req) = ev {
                nm.input_name(req);
            }
        });

        if let Some(am) = &self.addr_mgr {
            let am = am.clone();
            shared.bus.subscribe_fn(Topic::NewAddr, move |ev| {
                if let BusEvent::NewAddr(req) = ev {
                    am.input_address(&req);
                }
            });
        }

        let cache = shared.cache.clone();
        shared.bus.subscribe_fn(Topic::NewAsn, move |ev| {
            if let BusEvent::NewAsn(req) = ev {
                cache.update(&req);
            }
        });

        let resolved_mgrs = self.resolved_mgrs.clone();
        let filter = self.resolved_filter.clone();
        shared.bus.subscribe_fn(Topic::NameResolved, move |ev| {
            if let BusEvent::NameResolved(req) = ev {
                if filter.duplicate(&req.name) {
                    return;
                }
                for mgr in &resolved_mgrs {
                    mgr.input_name(req.clone());
                }
            }
        });

        let logs = self.log_queue.clone();
        shared.bus.subscribe_fn(Topic::Log, move |ev| {
            if let BusEvent::Log(msg) = ev {
                logs.append(msg);
            }
        });

        let s = shared.clone();
        shared.bus.subscribe_fn(Topic::SetActive, move |ev| {
            if let BusEvent::SetActive(_) = ev {
                s.update_last_active();
            }
        });

        let s = shared.clone();
        shared.bus.subscribe_fn(Topic::ResolveCompleted, move |ev| {
            if let BusEvent::ResolveCompleted(rcode) = ev {
                s.inc_queries(rcode);
            }
        });

        if !shared.config.passive {
            DnsService::start(shared.clone());
        }
    }

    fn submit_known_names(&self) {
        for output in self
            .shared
            .graph
            .get_output(&self.shared.config.domains, None)
        {
            self.shared.bus.publish(
                Priority::High,
                BusEvent::NewName(DnsRequest::new(
                    &output.name,
                    &output.domain,
                    Tag::External,
                    "Previous Enum",
                )),
            );
        }
    }

    fn submit_provided_names(&self) {
        for name in &self.shared.config.provided_names {
            if let Some(domain) = self.shared.config.which_domain(name) {
                self.shared.bus.publish(
                    Priority::High,
                    BusEvent::NewName(DnsRequest::new(name, &domain, Tag::External, "Config")),
                );
            }
        }
    }

    /// 运行枚举直到结束条件满足
    pub async fn start(&self) -> Result<(), String> {
        self.install_subscriptions();

        // 配置里指定的ASN先行广播
        for asn in &self.shared.config.asns {
            let req = AsnRequest {
                address: None,
                asn: *asn,
                prefix: String::new(),
                description: String::new(),
                netblocks: Default::default(),
                tag: Tag::Api,
                source: String::new(),
            };
            for src in &self.shared.srcs {
                src.asn_request(req.clone());
            }
        }

        self.submit_known_names();
        self.submit_provided_names();

        for domain in &self.shared.config.domains {
            self.domain_mgr
                .input_name(DnsRequest::new(domain, domain, Tag::Dns, "DNS"));
        }

        tokio::spawn(process_dup_names(self.shared.clone()));
        tokio::spawn(periodic_logging(
            self.shared.running.clone(),
            self.log_queue.clone(),
        ));

        let deadline = if self.shared.config.timeout_mins > 0 {
            Some(Instant::now() + Duration::from_secs(self.shared.config.timeout_mins * 60))
        } else {
            None
        };

        let mut completed = self.use_managers();
        let mut more_at = Instant::now() + Duration::from_secs(5);
        let mut t_at = Instant::now() + Duration::from_secs(20);
        let mut per_min_at = Instant::now() + Duration::from_secs(60);

        loop {
            if !self.shared.is_running() {
                break;
            }
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    log::info!("Enumeration exceeded provided timeout");
                    break;
                }
            }

            let next = more_at.min(t_at).min(per_min_at);
            let wait = next.saturating_duration_since(Instant::now());
            tokio::time::sleep(wait).await;
            let now = Instant::now();

            if now >= more_at {
                completed += self.use_managers();
                more_at = now + Duration::from_millis(500);
            }

            if now >= t_at {
                let inactive = self.data_manager_queue_empty()
                    && self.shared.last_active().elapsed() > INACTIVITY_WINDOW;
                if completed == 0 && inactive {
                    break;
                }
                completed = 0;
                t_at = now + Duration::from_secs(5);
            }

            if now >= per_min_at {
                if !self.shared.config.passive {
                    let (sec, pct) = self.shared.queries_per_sec();
                    if sec > 0 && self.data_manager_queue_empty() && (sec < 10 || pct > 90.0) {
                        break;
                    }
                    log::info!(
                        "Average DNS queries performed: {}/sec, Average retries required: {:.2}%",
                        sec,
                        pct
                    );
                    self.shared.clear_per_sec();
                }
                per_min_at = now + Duration::from_secs(60);
            }
        }

        self.shutdown();
        Ok(())
    }

    fn shutdown(&self) {
        self.shared.stop_running();

        if let Some(pool) = &self.shared.pool {
            pool.stop();
        }
        for mgr in &self.managers {
            mgr.stop();
        }

        // 刷掉剩余日志
        self.log_queue.process(|msg| log::info!("{}", msg));

        if !self.shared.config.passive {
            self.shared.graph.heal_address_nodes(&self.shared.cache);
        }
        self.shared.bus.stop();
    }

    fn data_manager_queue_empty(&self) -> bool {
        self.shared
            .data_mgr
            .as_ref()
            .map(|dm| dm.request_len() == 0)
            .unwrap_or(true)
    }

    fn required_number_of_names(&self) -> usize {
        if self.shared.config.passive {
            return PASSIVE_BATCH;
        }
        self.shared
            .config
            .max_dns_queries
            .saturating_sub(self.shared.pending())
    }

    /// 从各管理器抽取名称送去解析，并在缺口时向数据源要更多
    fn use_managers(&self) -> usize {
        let required = self.required_number_of_names();
        if required == 0 {
            return 1;
        }

        let mut count = 0usize;
        let mut pending = 0usize;
        // 地址请求优先消费一半额度
        if let Some(am) = &self.addr_mgr {
            count = FqdnManager::output_requests(am, required / 2);
            pending = FqdnManager::request_queue_len(am);
        }

        for mgr in &self.managers {
            if count >= required {
                break;
            }
            let remaining = required - count;
            for req in mgr.output_names(remaining) {
                count += 1;

                if self.shared.config.passive {
                    self.shared.update_last_active();
                    if self.shared.config.is_domain_in_scope(&req.name) {
                        self.shared
                            .graph
                            .insert_fqdn(&req.name, &req.source, req.tag);
                    }
                    continue;
                }

                self.shared.inc_pending();
                self.shared
                    .bus
                    .publish(Priority::Low, BusEvent::ResolveName(req));
            }
        }

        for mgr in &self.managers {
            pending += mgr.name_queue_len();
        }

        // 排队不足时向数据源追加请求
        if pending < required {
            let needed = required - pending;
            let mut sent = 0usize;
            for mgr in &self.managers {
                sent += mgr.output_requests(needed - sent);
                if sent >= needed {
                    break;
                }
            }
            count += sent;
        }

        count
    }

    /// 当前图里的全部发现
    pub fn output(&self) -> Vec<EnumOutput> {
        self.shared
            .graph
            .get_output(&self.shared.config.domains, Some(&self.shared.cache))
    }

    /// 主动停止枚举
    pub fn done(&self) {
        self.shared.stop_running();
    }
}

struct AltSourceEntry {
    name: String,
    source: String,
    tag: Tag,
    at: Instant,
}

/// 给被去重掉的名称在图上补记其他来源
async fn process_dup_names(shared: Arc<EnumShared>) {
    let mut pending: Vec<AltSourceEntry> = Vec::new();

    loop {
        if !shared.is_running() {
            break;
        }
        tokio::time::sleep(Duration::from_secs(5)).await;

        shared.alt_sources_queue.process(|req| {
            pending.push(AltSourceEntry {
                name: req.name,
                source: req.source,
                tag: req.tag,
                at: Instant::now(),
            });
        });

        let now = Instant::now();
        pending.retain(|entry| {
            if entry.at + Duration::from_secs(60) > now {
                return true;
            }
            if shared.graph.read_node(&entry.name, NodeKind::Fqdn) {
                shared
                    .graph
                    .insert_fqdn(&entry.name, &entry.source, entry.tag);
            }
            false
        });
    }
}

/// 周期性把总线日志写到日志后端
async fn periodic_logging(running: Arc<AtomicBool>, queue: PriorityQueue<String>) {
    while running.load(Ordering::Relaxed) {
        queue.process(|msg| log::info!("{}", msg));
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    queue.process(|msg| log::info!("{}", msg));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        let mut cfg = Config::default();
        cfg.add_domain("example.com");
        cfg
    }

    #[tokio::test]
    async fn two_tier_admission() {
        let enm = Enumeration::new(test_config()).unwrap();
        let shared = &enm.shared;

        let untrusted = DnsRequest::new("x.example.com", "example.com", Tag::Api, "SrcA");
        let trusted = DnsRequest::new("x.example.com", "example.com", Tag::Dns, "DNS");

        // 不可信来源先提交，随后可信来源各接纳一次
        assert!(shared.check_res_filter(&untrusted).is_some());
        assert!(shared.check_res_filter(&untrusted).is_none());
        assert!(shared.check_res_filter(&trusted).is_some());
        assert!(shared.check_res_filter(&trusted).is_none());
        assert!(shared.check_res_filter(&untrusted).is_none());
        enm.done();
        shared.bus.stop();
    }

    #[tokio::test]
    async fn trusted_blocks_later_untrusted() {
        let enm = Enumeration::new(test_config()).unwrap();
        let shared = &enm.shared;

        let trusted = DnsRequest::new("y.example.com", "example.com", Tag::Dns, "DNS");
        let untrusted = DnsRequest::new("y.example.com", "example.com", Tag::Scrape, "SrcB");

        assert!(shared.check_res_filter(&trusted).is_some());
        assert!(shared.check_res_filter(&untrusted).is_none());
        enm.done();
        shared.bus.stop();
    }

    #[tokio::test]
    async fn rejected_names_queue_for_alt_sources() {
        let enm = Enumeration::new(test_config()).unwrap();
        let shared = &enm.shared;

        let req = DnsRequest::new("z.example.com", "example.com", Tag::Api, "SrcA");
        assert!(shared.check_res_filter(&req).is_some());
        assert!(shared.check_res_filter(&req).is_none());
        assert_eq!(shared.alt_sources_queue.len(), 1);
        enm.done();
        shared.bus.stop();
    }

    #[tokio::test]
    async fn zero_max_queries_means_pipeline_only() {
        let mut cfg = test_config();
        cfg.max_dns_queries = 0;
        let enm = Enumeration::new(cfg).unwrap();
        // 无解析额度时use_managers直接返回
        assert_eq!(enm.use_managers(), 1);
        enm.done();
        enm.shared.bus.stop();
    }
}
