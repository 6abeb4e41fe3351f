use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::bus::{BusEvent, EventBus};
use crate::cache::NetCache;
use crate::model::{
    AddrRequest, AsnRequest, DnsRequest, Priority, Tag, TYPE_A, TYPE_AAAA, TYPE_CNAME, TYPE_MX,
    TYPE_NS, TYPE_PTR, TYPE_SRV,
};
use crate::queue::PriorityQueue;

/// 图中节点的种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Fqdn,
    Ip,
    Netblock,
    Asn,
}

#[derive(Debug, Clone)]
struct NodeData {
    /// (来源名, 标签)
    sources: Vec<(String, Tag)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Edge {
    from: (NodeKind, String),
    to: (NodeKind, String),
    label: &'static str,
}

/// 发现结果里的地址信息
#[derive(Debug, Clone)]
pub struct OutputAddress {
    pub ip: String,
    pub cidr: String,
    pub asn: u32,
    pub description: String,
}

/// 枚举结束后的单条输出
#[derive(Debug, Clone)]
pub struct EnumOutput {
    pub name: String,
    pub domain: String,
    pub addresses: Vec<OutputAddress>,
    pub tag: Tag,
    pub sources: Vec<String>,
}

/// 存放发现结果的内存图
///
/// FQDN/IP/网段/ASN四类节点，带关系标签的有向边。
pub struct Graph {
    nodes: Mutex<HashMap<(NodeKind, String), NodeData>>,
    edges: Mutex<HashSet<Edge>>,
    read_marks: Mutex<HashSet<String>>,
}

impl Graph {
    pub fn new() -> Arc<Self> {
        Arc::new(Graph {
            nodes: Mutex::new(HashMap::new()),
            edges: Mutex::new(HashSet::new()),
            read_marks: Mutex::new(HashSet::new()),
        })
    }

    fn upsert_node(&self, kind: NodeKind, name: &str) {
        self.nodes
            .lock()
            .unwrap()
            .entry((kind, name.to_string()))
            .or_insert_with(|| NodeData {
                sources: Vec::new(),
            });
    }

    fn add_edge(&self, from: (NodeKind, &str), to: (NodeKind, &str), label: &'static str) {
        self.upsert_node(from.0, from.1);
        self.upsert_node(to.0, to.1);
        self.edges.lock().unwrap().insert(Edge {
            from: (from.0, from.1.to_string()),
            to: (to.0, to.1.to_string()),
            label,
        });
    }

    /// 登记一个FQDN及其发现来源
    pub fn insert_fqdn(&self, name: &str, source: &str, tag: Tag) {
        let mut nodes = self.nodes.lock().unwrap();
        let data = nodes
            .entry((NodeKind::Fqdn, name.to_string()))
            .or_insert_with(|| NodeData {
                sources: Vec::new(),
            });
        let entry = (source.to_string(), tag);
        if !data.sources.contains(&entry) {
            data.sources.push(entry);
        }
    }

    pub fn insert_a(&self, fqdn: &str, addr: &str) {
        self.add_edge((NodeKind::Fqdn, fqdn), (NodeKind::Ip, addr), "a_to");
    }

    pub fn insert_aaaa(&self, fqdn: &str, addr: &str) {
        self.add_edge((NodeKind::Fqdn, fqdn), (NodeKind::Ip, addr), "aaaa_to");
    }

    pub fn insert_cname(&self, fqdn: &str, target: &str) {
        self.add_edge((NodeKind::Fqdn, fqdn), (NodeKind::Fqdn, target), "cname_to");
    }

    pub fn insert_ns(&self, fqdn: &str, target: &str) {
        self.add_edge((NodeKind::Fqdn, fqdn), (NodeKind::Fqdn, target), "ns_record");
    }

    pub fn insert_mx(&self, fqdn: &str, target: &str) {
        self.add_edge((NodeKind::Fqdn, fqdn), (NodeKind::Fqdn, target), "mx_record");
    }

    pub fn insert_srv(&self, fqdn: &str, target: &str) {
        self.add_edge((NodeKind::Fqdn, fqdn), (NodeKind::Fqdn, target), "srv_record");
    }

    pub fn insert_ptr(&self, ptr: &str, target: &str) {
        self.add_edge((NodeKind::Fqdn, ptr), (NodeKind::Fqdn, target), "ptr_record");
    }

    /// 登记ASN与其公告的网段，并把地址挂进网段
    pub fn insert_asn(&self, req: &AsnRequest) {
        if req.asn == 0 {
            return;
        }
        let asn = req.asn.to_string();
        self.upsert_node(NodeKind::Asn, &asn);
        self.attach_asn_desc(&asn, &req.description);

        for block in &req.netblocks {
            self.add_edge(
                (NodeKind::Asn, &asn),
                (NodeKind::Netblock, block),
                "announces",
            );
            if let Some(addr) = req.address {
                if let Some(net) = crate::netutil::parse_cidr(block) {
                    if net.contains(&addr) {
                        self.add_edge(
                            (NodeKind::Netblock, block),
                            (NodeKind::Ip, &addr.to_string()),
                            "contains",
                        );
                    }
                }
            }
        }
    }

    fn attach_asn_desc(&self, asn: &str, description: &str) {
        if description.is_empty() {
            return;
        }
        let mut nodes = self.nodes.lock().unwrap();
        if let Some(data) = nodes.get_mut(&(NodeKind::Asn, asn.to_string())) {
            let entry = (description.to_string(), Tag::Api);
            if !data.sources.contains(&entry) {
                data.sources.push(entry);
            }
        }
    }

    pub fn read_node(&self, name: &str, kind: NodeKind) -> bool {
        self.nodes
            .lock()
            .unwrap()
            .contains_key(&(kind, name.to_string()))
    }

    /// 名称是否是某条CNAME的起点
    pub fn is_cname_node(&self, name: &str) -> bool {
        let key = (NodeKind::Fqdn, name.to_string());
        self.edges
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.label == "cname_to" && e.from == key)
    }

    /// 为没有归属网段的IP节点补上缓存里的ASN信息
    pub fn heal_address_nodes(&self, cache: &NetCache) {
        let ips: Vec<String> = {
            let nodes = self.nodes.lock().unwrap();
            nodes
                .keys()
                .filter(|(kind, _)| *kind == NodeKind::Ip)
                .map(|(_, name)| name.clone())
                .collect()
        };

        for ip in ips {
            let covered = {
                let key = (NodeKind::Ip, ip.clone());
                self.edges
                    .lock()
                    .unwrap()
                    .iter()
                    .any(|e| e.label == "contains" && e.to == key)
            };
            if covered {
                continue;
            }
            let addr: IpAddr = match ip.parse() {
                Ok(a) => a,
                Err(_) => continue,
            };
            if let Some(asn) = cache.addr_search(addr) {
                self.insert_asn(&asn);
            }
        }
    }

    fn addresses_for(&self, fqdn: &str, cache: Option<&NetCache>) -> Vec<OutputAddress> {
        let key = (NodeKind::Fqdn, fqdn.to_string());
        let edges = self.edges.lock().unwrap();
        let mut out = Vec::new();

        for e in edges.iter() {
            if e.from != key || (e.label != "a_to" && e.label != "aaaa_to") {
                continue;
            }
            let ip = e.to.1.clone();

            // 先从图里找归属网段，找不到再问缓存
            let mut cidr = String::new();
            let mut asn = 0u32;
            let mut description = String::new();
            for contains in edges.iter() {
                if contains.label == "contains" && contains.to == e.to {
                    cidr = contains.from.1.clone();
                    for ann in edges.iter() {
                        if ann.label == "announces" && ann.to == contains.from {
                            asn = ann.from.1.parse().unwrap_or(0);
                        }
                    }
                }
            }
            if cidr.is_empty() {
                if let (Some(cache), Ok(addr)) = (cache, ip.parse::<IpAddr>()) {
                    if let Some(info) = cache.addr_search(addr) {
                        cidr = info.prefix.clone();
                        asn = info.asn;
                        description = info.description.clone();
                    }
                }
            }

            out.push(OutputAddress {
                ip,
                cidr,
                asn,
                description,
            });
        }
        out
    }

    /// 汇出属于给定根域的全部发现
    pub fn get_output(&self, domains: &[String], cache: Option<&NetCache>) -> Vec<EnumOutput> {
        let fqdns: Vec<(String, NodeData)> = {
            let nodes = self.nodes.lock().unwrap();
            nodes
                .iter()
                .filter(|((kind, _), _)| *kind == NodeKind::Fqdn)
                .map(|((_, name), data)| (name.clone(), data.clone()))
                .collect()
        };

        let mut out: Vec<EnumOutput> = Vec::new();
        for (name, data) in fqdns {
            let domain = domains
                .iter()
                .find(|d| name == **d || name.ends_with(&format!(".{}", d)))
                .cloned();
            let domain = match domain {
                Some(d) => d,
                None => continue,
            };
            if data.sources.is_empty() {
                continue;
            }

            out.push(EnumOutput {
                name: name.clone(),
                domain,
                addresses: self.addresses_for(&name, cache),
                tag: data.sources[0].1,
                sources: data.sources.iter().map(|(s, _)| s.clone()).collect(),
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// 只取尚未读取过的发现，mark_read为true时顺手标记
    pub fn get_new_output(
        &self,
        domains: &[String],
        cache: Option<&NetCache>,
        mark_read: bool,
    ) -> Vec<EnumOutput> {
        let out: Vec<EnumOutput> = {
            let marks = self.read_marks.lock().unwrap();
            self.get_output(domains, cache)
                .into_iter()
                .filter(|o| !marks.contains(&o.name))
                .collect()
        };
        if mark_read {
            let mut marks = self.read_marks.lock().unwrap();
            for o in &out {
                marks.insert(o.name.clone());
            }
        }
        out
    }

    pub fn mark_as_read(&self, name: &str) {
        self.read_marks.lock().unwrap().insert(name.to_string());
    }

    pub fn node_count(&self) -> usize {
        self.nodes.lock().unwrap().len()
    }
}

/// 数据管理器接收的消息
pub enum DataMsg {
    Dns(DnsRequest),
    Asn(AsnRequest),
}

/// 把解析结果写进图的后台任务句柄
#[derive(Clone)]
pub struct DataManager {
    queue: PriorityQueue<DataMsg>,
    graph: Arc<Graph>,
}

impl DataManager {
    /// 启动数据管理任务
    pub fn start(graph: Arc<Graph>, bus: Arc<EventBus>, running: Arc<AtomicBool>) -> Self {
        let dm = DataManager {
            queue: PriorityQueue::new(),
            graph,
        };

        let worker = dm.clone();
        tokio::spawn(async move {
            while running.load(Ordering::Relaxed) {
                let _ =
                    tokio::time::timeout(Duration::from_millis(500), worker.queue.signal()).await;
                worker.drain(&bus);
            }
            worker.drain(&bus);
        });
        dm
    }

    pub fn dns_request(&self, req: DnsRequest) {
        self.queue.append(DataMsg::Dns(req));
    }

    pub fn asn_request(&self, req: AsnRequest) {
        self.queue.append(DataMsg::Asn(req));
    }

    pub fn request_len(&self) -> usize {
        self.queue.len()
    }

    fn drain(&self, bus: &Arc<EventBus>) {
        self.queue.process(|msg| match msg {
            DataMsg::Dns(req) => self.insert_dns(bus, req),
            DataMsg::Asn(req) => self.graph.insert_asn(&req),
        });
    }

    fn insert_dns(&self, bus: &Arc<EventBus>, req: DnsRequest) {
        self.graph.insert_fqdn(&req.name, &req.source, req.tag);

        for rec in &req.records {
            match rec.rtype {
                TYPE_A => {
                    self.graph.insert_a(&req.name, &rec.data);
                    self.publish_addr(bus, &rec.data, &req.domain);
                }
                TYPE_AAAA => {
                    self.graph.insert_aaaa(&req.name, &rec.data);
                    self.publish_addr(bus, &rec.data, &req.domain);
                }
                TYPE_CNAME => self.graph.insert_cname(&req.name, &rec.data),
                TYPE_NS => self.graph.insert_ns(&req.name, &rec.data),
                TYPE_MX => {
                    let target = rec.data.split_whitespace().last().unwrap_or(&rec.data);
                    self.graph.insert_mx(&req.name, target);
                }
                TYPE_SRV => {
                    let target = rec.data.split_whitespace().last().unwrap_or(&rec.data);
                    self.graph.insert_srv(&req.name, target);
                }
                TYPE_PTR => self.graph.insert_ptr(&req.name, &rec.data),
                _ => {}
            }
        }
    }

    fn publish_addr(&self, bus: &Arc<EventBus>, addr: &str, domain: &str) {
        if let Ok(address) = addr.parse::<IpAddr>() {
            bus.publish(
                Priority::Low,
                BusEvent::NewAddr(AddrRequest {
                    address,
                    domain: domain.to_string(),
                }),
            );
        }
    }
}
