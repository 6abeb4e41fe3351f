use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::bus::BusEvent;
use crate::engine::EnumShared;
use crate::filter::{Filter, StringFilter};
use crate::model::{DnsRequest, Priority, Tag};
use crate::queue::PriorityQueue;

/// 不再向下追查的服务型标签
const SERVICE_LABELS: [&str; 3] = ["_tcp", "_udp", "_tls"];

/// 根域名释放给数据源的最小间隔
const DOMAIN_RELEASE_INTERVAL: Duration = Duration::from_secs(5);

/// 名称管理器的统一接口
///
/// 引擎按固定顺序轮询各管理器，吸收新名称并控制释放节奏。
pub trait FqdnManager: Send + Sync {
    /// 送入一个新发现的名称
    fn input_name(&self, req: DnsRequest);

    /// 取出最多num个待处理名称
    fn output_names(&self, num: usize) -> Vec<DnsRequest>;

    fn name_queue_len(&self) -> usize;

    /// 向数据源发出请求，返回实际发出的数量
    fn output_requests(&self, num: usize) -> usize;

    fn request_queue_len(&self) -> usize;

    fn stop(&self);
}

struct DomainState {
    cur_domain: String,
    src_index: isize,
    last: Instant,
}

/// 根域名管理器: 轮流把每个根域交给每个数据源
pub struct DomainManager {
    shared: Arc<EnumShared>,
    queue: PriorityQueue<DnsRequest>,
    filter: StringFilter,
    state: Mutex<DomainState>,
}

impl DomainManager {
    pub fn new(shared: Arc<EnumShared>) -> Self {
        DomainManager {
            shared,
            queue: PriorityQueue::new(),
            filter: StringFilter::new(),
            state: Mutex::new(DomainState {
                cur_domain: String::new(),
                src_index: 0,
                last: Instant::now(),
            }),
        }
    }

    fn next_domain_and_src(&self) -> Option<(String, usize)> {
        let mut st = self.state.lock().unwrap();
        st.src_index -= 1;

        if st.cur_domain.is_empty() || st.src_index < 0 {
            let req = self.queue.next()?;
            st.src_index = self.shared.srcs.len() as isize - 1;
            st.cur_domain = req.domain;
        }
        if st.src_index < 0 {
            return None;
        }
        Some((st.cur_domain.clone(), st.src_index as usize))
    }
}

impl FqdnManager for DomainManager {
    fn input_name(&self, req: DnsRequest) {
        if req.name.is_empty() || req.domain.is_empty() {
            return;
        }
        if self.filter.duplicate(&req.domain) {
            return;
        }
        self.queue.append(req);
    }

    fn output_names(&self, _num: usize) -> Vec<DnsRequest> {
        Vec::new()
    }

    fn name_queue_len(&self) -> usize {
        0
    }

    fn output_requests(&self, _num: usize) -> usize {
        // 有DNS解析在跑时控制释放节奏
        if !self.shared.config.passive {
            let st = self.state.lock().unwrap();
            if st.last + DOMAIN_RELEASE_INTERVAL > Instant::now() {
                return 0;
            }
        }

        let (domain, index) = match self.next_domain_and_src() {
            Some(v) => v,
            None => return 0,
        };

        self.state.lock().unwrap().last = Instant::now();
        self.shared.srcs[index].dns_request(DnsRequest::new(&domain, &domain, Tag::Dns, "DNS"));
        1
    }

    fn request_queue_len(&self) -> usize {
        self.queue.len()
    }

    fn stop(&self) {}
}

/// 新名称管理器: 去重后排队等待解析
pub struct NameManager {
    shared: Arc<EnumShared>,
    queue: PriorityQueue<DnsRequest>,
}

impl NameManager {
    pub fn new(shared: Arc<EnumShared>) -> Self {
        NameManager {
            shared,
            queue: PriorityQueue::new(),
        }
    }
}

impl FqdnManager for NameManager {
    fn input_name(&self, mut req: DnsRequest) {
        if req.name.is_empty() || req.domain.is_empty() {
            return;
        }
        req.sanitize();

        if let Some(accepted) = self.shared.check_res_filter(&req) {
            self.queue.append(accepted);
        }
    }

    fn output_names(&self, num: usize) -> Vec<DnsRequest> {
        let mut out = Vec::new();
        for _ in 0..num {
            match self.queue.next() {
                Some(req) => out.push(req),
                None => break,
            }
        }
        out
    }

    fn name_queue_len(&self) -> usize {
        self.queue.len()
    }

    fn output_requests(&self, _num: usize) -> usize {
        0
    }

    fn request_queue_len(&self) -> usize {
        0
    }

    fn stop(&self) {}
}

struct SubQueueElement {
    req: DnsRequest,
    times: usize,
}

/// 子域管理器: 跟踪每个子域后缀的出现次数并通知数据源
pub struct SubdomainManager {
    shared: Arc<EnumShared>,
    queue: PriorityQueue<DnsRequest>,
    rqueue: PriorityQueue<DnsRequest>,
    subqueue: PriorityQueue<SubQueueElement>,
    times: Mutex<HashMap<String, usize>>,
}

impl SubdomainManager {
    pub fn new(shared: Arc<EnumShared>) -> Self {
        SubdomainManager {
            shared,
            queue: PriorityQueue::new(),
            rqueue: PriorityQueue::new(),
            subqueue: PriorityQueue::new(),
            times: Mutex::new(HashMap::new()),
        }
    }

    fn times_for_subdomain(&self, sub: &str) -> usize {
        let mut times = self.times.lock().unwrap();
        let n = times.entry(sub.to_string()).or_insert(0);
        *n += 1;
        *n
    }

    fn check_subdomain(&self, req: &DnsRequest) {
        let labels: Vec<&str> = req.name.split('.').collect();
        if labels.len() < 2 {
            return;
        }
        // 子域的层级不能低于根域本身
        if labels.len() - 1 < req.domain.split('.').count() {
            return;
        }

        let sub = labels[1..].join(".");
        // CNAME目标不算真正的子域
        if self.shared.graph.is_cname_node(&sub) {
            return;
        }

        let subreq = DnsRequest::new(&sub, &req.domain, req.tag, &req.source);
        let times = self.times_for_subdomain(&sub);

        if sub != req.domain {
            self.shared.bus.publish(
                Priority::High,
                BusEvent::SubDiscovered(subreq.clone(), times),
            );
        }

        self.subqueue.append(SubQueueElement {
            req: subreq.clone(),
            times,
        });

        if let Some(accepted) = self.shared.check_res_filter(&subreq) {
            self.queue.append(accepted);
        }
    }
}

impl FqdnManager for SubdomainManager {
    fn input_name(&self, mut req: DnsRequest) {
        if req.name.is_empty() || req.domain.is_empty() {
            return;
        }
        req.sanitize();

        // 每个解析完成的名称连同记录交给数据管理器入图
        if let Some(dm) = &self.shared.data_mgr {
            dm.dns_request(req.clone());
        }

        if !self.shared.config.is_domain_in_scope(&req.name) {
            return;
        }

        let labels: Vec<&str> = req.name.split('.').collect();
        if let Some(second) = labels.get(1) {
            if SERVICE_LABELS.contains(second) {
                return;
            }
        }

        self.rqueue.append(req.clone());
        self.check_subdomain(&req);
    }

    fn output_names(&self, num: usize) -> Vec<DnsRequest> {
        let mut out = Vec::new();
        for _ in 0..num {
            match self.queue.next() {
                Some(req) => out.push(req),
                None => break,
            }
        }
        out
    }

    fn name_queue_len(&self) -> usize {
        self.queue.len()
    }

    fn output_requests(&self, num: usize) -> usize {
        let srcs = &self.shared.srcs;
        if srcs.is_empty() {
            return 0;
        }
        // 配额按数据源平分
        let to_be_sent = num / srcs.len();
        if to_be_sent == 0 {
            return 0;
        }

        let qlen = self.subqueue.len();
        let sublen = to_be_sent.min(qlen);
        let rlen = to_be_sent - sublen;

        let mut count = 0;
        for _ in 0..sublen {
            let element = match self.subqueue.next() {
                Some(e) => e,
                None => break,
            };
            count += 1;
            for src in srcs {
                src.subdomain_discovered(element.req.clone(), element.times);
            }
        }

        for _ in 0..rlen {
            let req = match self.rqueue.next() {
                Some(r) => r,
                None => break,
            };
            count += 1;
            for src in srcs {
                src.resolved(req.clone());
            }
        }

        count
    }

    fn request_queue_len(&self) -> usize {
        self.rqueue.len() + self.subqueue.len()
    }

    fn stop(&self) {}
}
