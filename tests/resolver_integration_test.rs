//! 针对本地回环stub DNS服务器的解析器测试

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use trust_dns_proto::op::{Header, Message, MessageType, OpCode, ResponseCode};
use trust_dns_proto::rr::rdata;
use trust_dns_proto::rr::{Name, RData, Record, RecordType};

use rsurface::model::Priority;
use rsurface::resolver::{BaseResolver, Resolver, RCODE_TIMEOUT};
use rsurface::ResolverPool;

/// 简单的stub应答逻辑
type Responder = Arc<dyn Fn(&str, RecordType) -> StubAnswer + Send + Sync>;

enum StubAnswer {
    A(Vec<Ipv4Addr>),
    Ptr(String),
    Rcode(ResponseCode),
    Silence,
}

/// 起一个回环UDP stub服务器，返回其地址
async fn spawn_stub_server(responder: Responder) -> String {
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

            match responder(&qname, q.query_type()) {
                StubAnswer::A(ips) => {
                    for ip in ips {
                        reply.add_answer(Record::from_rdata(
                            q.name().clone(),
                            60,
                            RData::A(rdata::A(ip)),
                        ));
                    }
                }
                StubAnswer::Ptr(target) => {
                    let target = Name::from_ascii(&target).unwrap();
                    reply.add_answer(Record::from_rdata(
                        q.name().clone(),
                        60,
                        RData::PTR(rdata::PTR(target)),
                    ));
                }
                StubAnswer::Rcode(rc) => {
                    reply.set_response_code(rc);
                }
                StubAnswer::Silence => continue,
            }

            if let Ok(bytes) = reply.to_vec() {
                let _ = sock.send_to(&bytes, from).await;
            }
        }
    });

    addr.to_string()
}

#[tokio::test]
async fn base_resolver_gets_a_records() {
    let addr = spawn_stub_server(Arc::new(|name, qtype| {
        if name == "www.example.test" && qtype == RecordType::A {
            StubAnswer::A(vec![Ipv4Addr::new(1, 2, 3, 4)])
        } else {
            StubAnswer::Rcode(ResponseCode::NXDomain)
        }
    }))
    .await;

    let resolver = BaseResolver::new(&addr);
    let answers = resolver
        .resolve("www.example.test", RecordType::A, Priority::High)
        .await
        .unwrap();

    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].data, "1.2.3.4");
    assert_eq!(answers[0].rtype, 1);

    let stats = resolver.stats();
    assert!(stats.attempts >= 1);
    assert_eq!(stats.completions, 1);
    resolver.stop();
}

#[tokio::test]
async fn servfail_is_retryable() {
    let addr = spawn_stub_server(Arc::new(|_, _| StubAnswer::Rcode(ResponseCode::ServFail))).await;

    let resolver = BaseResolver::new(&addr);
    let err = resolver
        .resolve("any.example.test", RecordType::A, Priority::High)
        .await
        .unwrap_err();

    assert_eq!(err.rcode, 2);
    assert!(err.retryable());
    resolver.stop();
}

#[tokio::test]
async fn silent_upstream_times_out() {
    let addr = spawn_stub_server(Arc::new(|_, _| StubAnswer::Silence)).await;

    let resolver = BaseResolver::new(&addr);
    let err = resolver
        .resolve("slow.example.test", RecordType::A, Priority::High)
        .await
        .unwrap_err();

    assert_eq!(err.rcode, RCODE_TIMEOUT);
    assert!(err.retryable());
    resolver.stop();
}

#[tokio::test]
async fn stopped_resolver_rejects_queries() {
    let addr = spawn_stub_server(Arc::new(|_, _| StubAnswer::Silence)).await;

    let resolver = BaseResolver::new(&addr);
    resolver.stop();
    let err = resolver
        .resolve("x.example.test", RecordType::A, Priority::Low)
        .await
        .unwrap_err();
    assert_eq!(err.rcode, 100);
    assert!(!err.retryable());
}

#[tokio::test]
async fn pool_resolves_and_reverses() {
    let addr = spawn_stub_server(Arc::new(|name, qtype| {
        if qtype == RecordType::A && name == "www.example.test" {
            StubAnswer::A(vec![Ipv4Addr::new(10, 9, 8, 7)])
        } else if qtype == RecordType::PTR && name == "5.0.0.10.in-addr.arpa" {
            StubAnswer::Ptr("host5.example.test.".to_string())
        } else {
            StubAnswer::Rcode(ResponseCode::NXDomain)
        }
    }))
    .await;

    let pool = ResolverPool::new(
        vec![BaseResolver::new(&addr) as Arc<dyn Resolver>],
        None,
    );

    let answers = pool
        .resolve("www.example.test", RecordType::A, Priority::High)
        .await
        .unwrap();
    assert_eq!(answers[0].data, "10.9.8.7");

    let (ptr, name) = pool
        .reverse("10.0.0.5".parse().unwrap(), Priority::High)
        .await
        .unwrap();
    assert_eq!(ptr, "5.0.0.10.in-addr.arpa");
    assert_eq!(name, "host5.example.test");

    pool.stop();
}

#[tokio::test]
async fn pool_budget_exhaustion_returns_resolver_err() {
    // 池里只有已停止的解析器
    let addr = spawn_stub_server(Arc::new(|_, _| StubAnswer::Silence)).await;
    let r = BaseResolver::new(&addr);
    r.stop();
    let pool = ResolverPool::new(vec![r as Arc<dyn Resolver>], None);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let err = tokio::time::timeout(
        Duration::from_secs(120),
        pool.resolve("x.example.test", RecordType::A, Priority::Low),
    )
    .await
    .expect("budget loop should finish")
    .unwrap_err();
    assert_eq!(err.rcode, 100);
    pool.stop();
}
