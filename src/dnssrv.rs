use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use trust_dns_proto::op::{Message, MessageType, OpCode, Query};
use trust_dns_proto::rr::{DNSClass, Name, RecordType};

use crate::bus::BusEvent;
use crate::engine::EnumShared;
use crate::model::{DnsAnswer, DnsRequest, Priority, Tag, TYPE_SOA};
use crate::resolver::{record_data_string, ResolveError, RCODE_NOT_AVAILABLE, RCODE_RESOLVER_ERR,
    RCODE_TIMEOUT, RETRY_CODES};
use crate::wildcard::WildcardType;

const SERVICE_NAME: &str = "DNS Service";

/// 新名称首先查询的记录类型
const INITIAL_QUERY_TYPES: [RecordType; 4] = [
    RecordType::CNAME,
    RecordType::TXT,
    RecordType::A,
    RecordType::AAAA,
];

/// 常见SRV服务名
const POPULAR_SRV_NAMES: &[&str] = &[
    "_caldav._tcp",
    "_caldavs._tcp",
    "_carddav._tcp",
    "_carddavs._tcp",
    "_ftp._tcp",
    "_imap._tcp",
    "_imaps._tcp",
    "_jabber._tcp",
    "_kerberos._tcp",
    "_kerberos._udp",
    "_kpasswd._tcp",
    "_ldap._tcp",
    "_ldaps._tcp",
    "_pop3._tcp",
    "_pop3s._tcp",
    "_sip._tcp",
    "_sip._udp",
    "_sips._tcp",
    "_smtp._tcp",
    "_stun._udp",
    "_submission._tcp",
    "_xmpp-client._tcp",
    "_xmpp-server._tcp",
    "_autodiscover._tcp",
];

/// 管线里的DNS解析服务
///
/// 订阅ResolveName与SubDiscovered主题，每个请求占用一个
/// 全局查询信号量的名额。
pub struct DnsService;

impl DnsService {
    pub fn start(shared: Arc<EnumShared>) {
        let s = shared.clone();
        shared.bus.subscribe(
            crate::bus::Topic::ResolveName,
            Arc::new(move |ev| {
                let shared = s.clone();
                Box::pin(async move {
                    if let BusEvent::ResolveName(req) = ev {
                        let permit = match shared.sem.clone().acquire_owned().await {
                            Ok(p) => p,
                            Err(_) => return,
                        };
                        let inner = shared.clone();
                        tokio::spawn(async move {
                            process_dns_request(&inner, req).await;
                            inner.dec_pending();
                            drop(permit);
                        });
                    }
                })
            }),
        );

        let s = shared.clone();
        shared.bus.subscribe(
            crate::bus::Topic::SubDiscovered,
            Arc::new(move |ev| {
                let shared = s.clone();
                Box::pin(async move {
                    if let BusEvent::SubDiscovered(req, times) = ev {
                        if times == 1 {
                            tokio::spawn(async move {
                                process_subdomain(&shared, req).await;
                            });
                        }
                    }
                })
            }),
        );
    }
}

async fn process_dns_request(shared: &Arc<EnumShared>, req: DnsRequest) {
    if req.name.is_empty() || req.domain.is_empty() {
        return;
    }

    shared.set_active(SERVICE_NAME);

    if shared.config.blacklisted(&req.name) {
        return;
    }
    if !req.tag.trusted() && wildcard_type(shared, &req).await == WildcardType::Dynamic {
        return;
    }

    // 根域名额外做一轮基础记录与服务名探测
    if req.name == req.domain {
        subdomain_queries(shared, &req.name, &req.domain).await;
        query_service_names(shared, &req.name, &req.domain).await;
    }

    let records = query_initial_types(shared, &req.name).await;
    if !records.is_empty() {
        let mut resolved = req.clone();
        resolved.records = records;
        resolved_name(shared, resolved).await;
    }
}

async fn process_subdomain(shared: &Arc<EnumShared>, req: DnsRequest) {
    if shared.config.blacklisted(&req.name) {
        return;
    }
    if !req.tag.trusted() && wildcard_type(shared, &req).await == WildcardType::Dynamic {
        return;
    }

    subdomain_queries(shared, &req.name, &req.domain).await;
    query_service_names(shared, &req.name, &req.domain).await;
}

async fn wildcard_type(shared: &Arc<EnumShared>, req: &DnsRequest) -> WildcardType {
    match &shared.pool {
        Some(pool) => pool.get_wildcard_type(req).await,
        None => WildcardType::None,
    }
}

/// 通过泛解析过滤的结果才会发布NameResolved
async fn resolved_name(shared: &Arc<EnumShared>, req: DnsRequest) {
    if let Some(pool) = &shared.pool {
        if !req.tag.trusted() && pool.matches_wildcard(&req).await {
            return;
        }
    }
    shared
        .bus
        .publish(Priority::High, BusEvent::NameResolved(req));
}

async fn query_initial_types(shared: &Arc<EnumShared>, name: &str) -> Vec<DnsAnswer> {
    let pool = match &shared.pool {
        Some(p) => p.clone(),
        None => return Vec::new(),
    };

    let mut answers = Vec::new();
    for qtype in INITIAL_QUERY_TYPES {
        shared.set_active(SERVICE_NAME);
        match pool.resolve(name, qtype, Priority::Low).await {
            Ok(ans) => answers.extend(ans),
            Err(e) => handle_resolver_error(shared, &e),
        }
    }
    answers
}

fn handle_resolver_error(shared: &Arc<EnumShared>, err: &ResolveError) {
    if shared.config.verbose
        || err.rcode == RCODE_NOT_AVAILABLE
        || err.rcode == RCODE_TIMEOUT
        || err.rcode == RCODE_RESOLVER_ERR
        || RETRY_CODES.contains(&err.rcode)
    {
        shared.bus.log(format!("DNS: {}", err));
    }
}

/// 对根域/新子域做NS、MX、SOA、SPF查询
async fn subdomain_queries(shared: &Arc<EnumShared>, name: &str, domain: &str) {
    let pool = match &shared.pool {
        Some(p) => p.clone(),
        None => return,
    };

    let mut answers = query_initial_types(shared, name).await;

    shared.set_active(SERVICE_NAME);
    match pool.resolve(name, RecordType::NS, Priority::High).await {
        Ok(ans) => {
            for a in ans {
                if shared.config.active {
                    let shared = shared.clone();
                    let name = name.to_string();
                    let domain = domain.to_string();
                    let server = a.data.clone();
                    tokio::spawn(async move {
                        attempt_zone_xfr(&shared, &name, &domain, &server).await;
                    });
                }
                answers.push(a);
            }
        }
        Err(e) => handle_resolver_error(shared, &e),
    }

    shared.set_active(SERVICE_NAME);
    match pool.resolve(name, RecordType::MX, Priority::High).await {
        Ok(ans) => answers.extend(ans),
        Err(e) => handle_resolver_error(shared, &e),
    }

    shared.set_active(SERVICE_NAME);
    match pool.resolve(name, RecordType::SOA, Priority::High).await {
        Ok(ans) => answers.extend(ans),
        Err(e) => handle_resolver_error(shared, &e),
    }

    shared.set_active(SERVICE_NAME);
    match pool
        .resolve(name, RecordType::Unknown(99), Priority::High)
        .await
    {
        Ok(ans) => answers.extend(ans),
        Err(e) => handle_resolver_error(shared, &e),
    }

    if !answers.is_empty() {
        shared.set_active(SERVICE_NAME);
        let mut req = DnsRequest::new(name, domain, Tag::Dns, "DNS");
        req.records = answers;
        resolved_name(shared, req).await;
    }
}

/// 探测常见服务的SRV记录
async fn query_service_names(shared: &Arc<EnumShared>, name: &str, domain: &str) {
    let pool = match &shared.pool {
        Some(p) => p.clone(),
        None => return,
    };

    for prefix in POPULAR_SRV_NAMES {
        let srv_name = format!("{}.{}", prefix, name);
        shared.set_active(SERVICE_NAME);

        match pool.resolve(&srv_name, RecordType::SRV, Priority::High).await {
            Ok(ans) => {
                let mut req = DnsRequest::new(&srv_name, domain, Tag::Dns, "DNS");
                req.records = ans;
                resolved_name(shared, req).await;
            }
            Err(e) => handle_resolver_error(shared, &e),
        }
    }
}

/// 先解析NS的地址再尝试区域传送
async fn attempt_zone_xfr(shared: &Arc<EnumShared>, sub: &str, domain: &str, server: &str) {
    let pool = match &shared.pool {
        Some(p) => p.clone(),
        None => return,
    };

    let addr = match pool.resolve(server, RecordType::A, Priority::High).await {
        Ok(ans) if !ans.is_empty() => ans[0].data.clone(),
        _ => match pool.resolve(server, RecordType::AAAA, Priority::High).await {
            Ok(ans) if !ans.is_empty() => ans[0].data.clone(),
            _ => {
                shared.bus.log(format!(
                    "DNS: Zone XFR failed: {} has no A or AAAA record",
                    server
                ));
                return;
            }
        },
    };

    match zone_transfer(sub, domain, &addr).await {
        Ok(reqs) => {
            for req in reqs {
                resolved_name(shared, req).await;
            }
        }
        Err(e) => {
            shared
                .bus
                .log(format!("DNS: Zone XFR failed: {}: {}", server, e));
        }
    }
}

/// 对一台权威服务器执行AXFR
pub async fn zone_transfer(
    sub: &str,
    domain: &str,
    server_addr: &str,
) -> Result<Vec<DnsRequest>, ResolveError> {
    let target = if server_addr.contains(':') {
        format!("[{}]:53", server_addr)
    } else {
        format!("{}:53", server_addr)
    };

    let qname = Name::from_ascii(sub).map_err(|e| {
        ResolveError::new(
            format!("invalid zone name {}: {}", sub, e),
            RCODE_RESOLVER_ERR,
            false,
        )
    })?;

    let mut query = Query::query(qname, RecordType::AXFR);
    query.set_query_class(DNSClass::IN);
    let mut msg = Message::new();
    msg.set_id(rand::thread_rng().gen_range(1..=u16::MAX))
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .add_query(query);
    let bytes = msg.to_vec().map_err(|e| {
        ResolveError::new(
            format!("failed to encode query: {}", e),
            RCODE_RESOLVER_ERR,
            false,
        )
    })?;

    let mut stream = tokio::time::timeout(Duration::from_secs(10), TcpStream::connect(&target))
        .await
        .map_err(|_| {
            ResolveError::new(
                format!("timed out connecting to {}", target),
                RCODE_TIMEOUT,
                true,
            )
        })?
        .map_err(|e| {
            ResolveError::new(
                format!("failed to connect to {}: {}", target, e),
                RCODE_NOT_AVAILABLE,
                true,
            )
        })?;

    let mut framed = Vec::with_capacity(bytes.len() + 2);
    framed.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    framed.extend_from_slice(&bytes);
    stream.write_all(&framed).await.map_err(|e| {
        ResolveError::new(format!("failed to send AXFR: {}", e), RCODE_TIMEOUT, true)
    })?;

    // 收集应答直到第二次出现SOA
    let mut by_name: HashMap<String, Vec<DnsAnswer>> = HashMap::new();
    let mut soa_seen = 0usize;

    'outer: loop {
        let mut len_buf = [0u8; 2];
        match tokio::time::timeout(Duration::from_secs(30), stream.read_exact(&mut len_buf)).await {
            Ok(Ok(_)) => {}
            _ => break,
        }
        let len = u16::from_be_bytes(len_buf) as usize;
        if len == 0 {
            break;
        }
        let mut body = vec![0u8; len];
        match tokio::time::timeout(Duration::from_secs(30), stream.read_exact(&mut body)).await {
            Ok(Ok(_)) => {}
            _ => break,
        }

        let reply = match Message::from_vec(&body) {
            Ok(m) => m,
            Err(_) => break,
        };

        for rec in reply.answers() {
            let rtype = u16::from(rec.record_type());
            let data = match rec.data() {
                Some(rdata) => record_data_string(rdata),
                None => continue,
            };
            let owner = rec.name().to_ascii().trim_end_matches('.').to_lowercase();

            if rtype == TYPE_SOA {
                soa_seen += 1;
                if soa_seen >= 2 {
                    break 'outer;
                }
                continue;
            }

            by_name.entry(owner.clone()).or_default().push(DnsAnswer {
                name: owner,
                rtype,
                ttl: rec.ttl(),
                data,
            });
        }
    }

    Ok(by_name
        .into_iter()
        .map(|(name, records)| {
            let mut req = DnsRequest::new(&name, domain, Tag::Axfr, "DNS Zone XFR");
            req.records = records;
            req
        })
        .collect())
}
