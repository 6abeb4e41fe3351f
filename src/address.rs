use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::bus::BusEvent;
use crate::engine::EnumShared;
use crate::filter::{BloomFilter, Filter, StringFilter};
use crate::managers::FqdnManager;
use crate::model::{
    AddrRequest, AsnRequest, DnsAnswer, DnsRequest, Priority, Tag, TYPE_A, TYPE_AAAA, TYPE_PTR,
};
use crate::netutil::{cidr_subset, is_reserved_address, parse_cidr};
use crate::queue::PriorityQueue;

/// 主动/被动模式下反向扫描的邻居数量
const ACTIVE_SWEEP_SIZE: usize = 500;
const PASSIVE_SWEEP_SIZE: usize = 250;

/// 等待ASN缓存填充的上限(约13秒)
const ASN_WAIT_ROUNDS: usize = 10;

/// 地址管理器: 考察解析出的IP，补全ASN信息并做反向扫描
pub struct AddressManager {
    shared: Arc<EnumShared>,
    rev_queue: PriorityQueue<AddrRequest>,
    res_queue: PriorityQueue<AddrRequest>,
    rev_filter: StringFilter,
    res_filter: StringFilter,
    sweep_filter: BloomFilter,
    asn_tx: mpsc::UnboundedSender<(AddrRequest, bool)>,
}

impl AddressManager {
    pub fn new(shared: Arc<EnumShared>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mgr = Arc::new(AddressManager {
            shared,
            rev_queue: PriorityQueue::new(),
            res_queue: PriorityQueue::new(),
            rev_filter: StringFilter::new(),
            res_filter: StringFilter::new(),
            sweep_filter: BloomFilter::new(1 << 16),
            asn_tx: tx,
        });
        tokio::spawn(Self::asn_lookup_loop(mgr.clone(), rx));
        mgr
    }

    /// 来自总线NewAddr主题的地址，用于反向扫描
    pub fn input_address(&self, req: &AddrRequest) {
        if self.rev_filter.duplicate(&req.address.to_string()) {
            return;
        }
        let _ = self.asn_tx.send((req.clone(), false));
    }

    async fn asn_lookup_loop(
        mgr: Arc<AddressManager>,
        mut rx: mpsc::UnboundedReceiver<(AddrRequest, bool)>,
    ) {
        while let Some((req, resolved)) = rx.recv().await {
            if !mgr.shared.is_running() {
                return;
            }
            mgr.add_to_cache_plus_database(&req).await;
            if resolved {
                mgr.res_queue.append(req);
            } else {
                mgr.rev_queue.append(req);
            }
        }
    }

    /// 查询缓存，缺失时广播ASN请求给全部数据源并等待填充
    async fn add_to_cache_plus_database(&self, req: &AddrRequest) {
        let mut asn = self.shared.cache.addr_search(req.address);

        if asn.is_none() {
            let ask = AsnRequest::for_address(req.address);
            for src in &self.shared.srcs {
                src.asn_request(ask.clone());
            }

            tokio::time::sleep(Duration::from_secs(3)).await;
            asn = self.shared.cache.addr_search(req.address);

            for _ in 0..ASN_WAIT_ROUNDS {
                if asn.is_some() {
                    break;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
                asn = self.shared.cache.addr_search(req.address);
            }
        }

        if let (Some(asn), Some(dm)) = (asn, &self.shared.data_mgr) {
            dm.asn_request(asn);
        }
    }

    async fn process_address(self: Arc<Self>, req: AddrRequest, resolved: bool) {
        // 只扫描范围内的地址
        if !self.shared.config.is_domain_in_scope(&req.domain) {
            return;
        }

        let mut asn = self.shared.cache.addr_search(req.address);
        for _ in 0..ASN_WAIT_ROUNDS {
            if asn.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
            asn = self.shared.cache.addr_search(req.address);
        }
        let asn = match asn {
            Some(a) => a,
            None => return,
        };

        if let Some(cidr) = parse_cidr(&asn.prefix) {
            let mgr = self.clone();
            let addr = req.address;
            tokio::spawn(async move { mgr.reverse_dns_sweep(addr, &cidr).await });
        }

        if self.shared.config.active && resolved {
            let mgr = self.clone();
            let addr = req.address;
            tokio::spawn(async move { mgr.certificate_names(addr).await });
        }
    }

    /// 对地址附近的网段做PTR扫描
    async fn reverse_dns_sweep(&self, addr: IpAddr, cidr: &ipnet::IpNet) {
        if is_reserved_address(addr) {
            return;
        }

        let size = if self.shared.config.active {
            ACTIVE_SWEEP_SIZE
        } else {
            PASSIVE_SWEEP_SIZE
        };

        for ip in cidr_subset(cidr, addr, size) {
            if self.sweep_filter.duplicate(&ip.to_string()) {
                continue;
            }
            let permit = match self.shared.sem.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => return,
            };
            let shared = self.shared.clone();
            tokio::spawn(async move {
                shared.clone().reverse_dns_query(ip).await;
                drop(permit);
            });
        }
    }

    /// 主动模式下从证书中挖掘名称
    async fn certificate_names(&self, addr: IpAddr) {
        let names = crate::cert::pull_certificate_names(addr, crate::cert::DEFAULT_TLS_PORTS).await;
        for name in names {
            if let Some(domain) = self.shared.config.which_domain(&name) {
                self.shared.bus.publish(
                    Priority::High,
                    BusEvent::NewName(DnsRequest::new(&name, &domain, Tag::Cert, "Active Cert")),
                );
            }
        }
    }
}

impl EnumShared {
    /// 单个地址的PTR查询，范围内的结果作为解析完成的名称发布
    pub async fn reverse_dns_query(self: Arc<Self>, ip: IpAddr) {
        let pool = match &self.pool {
            Some(p) => p.clone(),
            None => return,
        };

        let (ptr, answer) = match pool.reverse(ip, Priority::Low).await {
            Ok(v) => v,
            Err(_) => return,
        };

        let domain = match self.config.which_domain(&answer) {
            Some(d) => d,
            None => return,
        };

        let mut req = DnsRequest::new(&ptr, &domain, Tag::Dns, "Reverse DNS");
        req.records.push(DnsAnswer {
            name: ptr.clone(),
            rtype: TYPE_PTR,
            ttl: 0,
            data: answer,
        });
        self.bus
            .publish(Priority::Low, BusEvent::NameResolved(req));
    }
}

impl FqdnManager for Arc<AddressManager> {
    fn input_name(&self, mut req: DnsRequest) {
        if req.name.is_empty() || req.domain.is_empty() {
            return;
        }
        req.sanitize();

        // CNAME别名的地址归于目标名称，不在这里处理
        if req.has_cname_record() || !req.has_addr_records() {
            return;
        }

        for rec in &req.records {
            if rec.rtype != TYPE_A && rec.rtype != TYPE_AAAA {
                continue;
            }
            let data = rec.data.trim();
            if self.res_filter.duplicate(data) {
                continue;
            }
            if let Ok(address) = data.parse::<IpAddr>() {
                let _ = self.asn_tx.send((
                    AddrRequest {
                        address,
                        domain: req.domain.clone(),
                    },
                    true,
                ));
            }
        }
    }

    fn output_names(&self, _num: usize) -> Vec<DnsRequest> {
        Vec::new()
    }

    fn name_queue_len(&self) -> usize {
        0
    }

    fn output_requests(&self, num: usize) -> usize {
        for _ in 0..num {
            let (req, resolved) = match self.res_queue.next() {
                Some(r) => (r, true),
                None => match self.rev_queue.next() {
                    Some(r) => (r, false),
                    None => break,
                },
            };
            let mgr = self.clone();
            tokio::spawn(mgr.process_address(req, resolved));
        }
        0
    }

    fn request_queue_len(&self) -> usize {
        self.res_queue.len() + self.rev_queue.len()
    }

    fn stop(&self) {}
}
