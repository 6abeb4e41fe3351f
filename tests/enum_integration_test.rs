//! 枚举引擎的端到端测试，完全运行在回环stub上

use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::net::UdpSocket;
use trust_dns_proto::op::{Header, Message, MessageType, OpCode, ResponseCode};
use trust_dns_proto::rr::rdata;
use trust_dns_proto::rr::{RData, Record, RecordType};

use rsurface::{Config, Enumeration};

/// 只认识example.test的A记录的stub服务器
async fn spawn_fixed_stub() -> String {
    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = sock.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        loop {
            let (n, from) = match sock.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(_) => return,
            };
            let query = match Message::from_vec(&buf[..n]) {
                Ok(m) => m,
                Err(_) => continue,
            };
            let q = match query.queries().first() {
                Some(q) => q.clone(),
                None => continue,
            };
            let qname = q.name().to_ascii().trim_end_matches('.').to_lowercase();

            let mut reply = Message::new();
            reply.set_header(
                *Header::new()
                    .set_id(query.id())
                    .set_message_type(MessageType::Response)
                    .set_op_code(OpCode::Query)
                    .set_recursion_available(true),
            );
            reply.add_query(q.clone());

            if qname == "example.test" && q.query_type() == RecordType::A {
                reply.add_answer(Record::from_rdata(
                    q.name().clone(),
                    60,
                    RData::A(rdata::A(Ipv4Addr::new(1, 2, 3, 4))),
                ));
            } else {
                reply.set_response_code(ResponseCode::NXDomain);
            }

            if let Ok(bytes) = reply.to_vec() {
                let _ = sock.send_to(&bytes, from).await;
            }
        }
    });

    addr.to_string()
}

fn stub_config(resolver_addr: String) -> Config {
    let mut cfg = Config::default();
    cfg.add_domain("example.test");
    cfg.resolvers = vec![resolver_addr];
    cfg.max_dns_queries = 100;
    // 排除全部外部数据源，测试不碰真实网络
    cfg.source_filter.include = true;
    cfg.source_filter.sources = vec!["NoSuchSource".to_string()];
    cfg.provided_names = vec!["example.test".to_string()];
    cfg
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_domain_enumeration_finds_root_with_address() {
    let resolver_addr = spawn_fixed_stub().await;
    let enumeration = Enumeration::new(stub_config(resolver_addr)).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(180), enumeration.start()).await;
    assert!(result.is_ok(), "enumeration did not terminate");
    result.unwrap().unwrap();

    let findings = enumeration.output();
    let names: Vec<&str> = findings.iter().map(|f| f.name.as_str()).collect();
    assert!(
        names.contains(&"example.test"),
        "missing root domain, got {:?}",
        names
    );

    let root = findings.iter().find(|f| f.name == "example.test").unwrap();
    let ips: Vec<&str> = root.addresses.iter().map(|a| a.ip.as_str()).collect();
    assert!(ips.contains(&"1.2.3.4"), "missing address, got {:?}", ips);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn enumeration_terminates_without_any_findings() {
    // stub什么都不认识，枚举必须靠静默计时器自行收尾
    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = sock.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        loop {
            let (n, from) = match sock.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(_) => return,
            };
            if let Ok(query) = Message::from_vec(&buf[..n]) {
                let mut reply = Message::new();
                reply.set_header(
                    *Header::new()
                        .set_id(query.id())
                        .set_message_type(MessageType::Response)
                        .set_op_code(OpCode::Query),
                );
                if let Some(q) = query.queries().first() {
                    reply.add_query(q.clone());
                }
                reply.set_response_code(ResponseCode::NXDomain);
                if let Ok(bytes) = reply.to_vec() {
                    let _ = sock.send_to(&bytes, from).await;
                }
            }
        }
    });

    let mut cfg = stub_config(addr);
    cfg.provided_names.clear();
    let enumeration = Enumeration::new(cfg).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(180), enumeration.start()).await;
    assert!(result.is_ok(), "enumeration did not terminate");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn passive_mode_collects_without_resolution() {
    let mut cfg = Config::default();
    cfg.add_domain("example.test");
    cfg.passive = true;
    cfg.source_filter.include = true;
    cfg.source_filter.sources = vec!["NoSuchSource".to_string()];
    cfg.provided_names = vec!["www.example.test".to_string()];
    cfg.timeout_mins = 1;

    let enumeration = Enumeration::new(cfg).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(120), enumeration.start()).await;
    assert!(result.is_ok(), "passive enumeration did not terminate");

    let findings = enumeration.output();
    let names: Vec<&str> = findings.iter().map(|f| f.name.as_str()).collect();
    assert!(names.contains(&"www.example.test"), "got {:?}", names);
    // 被动模式没有解析，不应有地址
    let www = findings
        .iter()
        .find(|f| f.name == "www.example.test")
        .unwrap();
    assert!(www.addresses.is_empty());
}
