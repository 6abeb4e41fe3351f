use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::oneshot;
use trust_dns_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use trust_dns_proto::rr::{DNSClass, Name, RData, RecordType};

use crate::model::{DnsAnswer, Priority};
use crate::queue::PriorityQueue;

/// 自定义rcode: 解析器接口错误
pub const RCODE_RESOLVER_ERR: i32 = 100;
/// 自定义rcode: 查询超时
pub const RCODE_TIMEOUT: i32 = 101;
/// 自定义rcode: 解析器暂时不可用
pub const RCODE_NOT_AVAILABLE: i32 = 256;

/// 可以重试的真实DNS rcode: SERVFAIL, NOTIMPL, REFUSED
pub const RETRY_CODES: [i32; 3] = [2, 4, 5];

/// 单次查询的超时窗口
const QUERY_TIMEOUT: Duration = Duration::from_millis(500);
/// 超时清扫的周期
const SWEEP_INTERVAL: Duration = Duration::from_millis(500);
/// UDP套接字的轮换周期
const CONN_ROTATION: Duration = Duration::from_secs(30);
/// 发送循环每轮最多取出的查询数
const SEND_BATCH: usize = 100;
/// 发送循环空转时的退避梯度(毫秒)
const SEND_BACKOFF_MS: [u64; 7] = [5, 10, 15, 25, 50, 75, 100];

/// 携带rcode的解析错误
#[derive(Debug, Clone)]
pub struct ResolveError {
    pub msg: String,
    pub rcode: i32,
    /// 上层可以按优先级预算重试
    pub again: bool,
}

impl ResolveError {
    pub fn new(msg: impl Into<String>, rcode: i32, again: bool) -> Self {
        ResolveError {
            msg: msg.into(),
            rcode,
            again,
        }
    }

    /// rcode是否属于可重试的一类
    pub fn retryable(&self) -> bool {
        self.again
            || self.rcode == RCODE_TIMEOUT
            || self.rcode == RCODE_NOT_AVAILABLE
            || RETRY_CODES.contains(&self.rcode)
    }
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (rcode {})", self.msg, self.rcode)
    }
}

impl std::error::Error for ResolveError {}

pub type ResolveResult = Result<Vec<DnsAnswer>, ResolveError>;

/// 解析器性能计数
#[derive(Debug, Clone, Default)]
pub struct ResolverStats {
    pub attempts: u64,
    pub timeouts: u64,
    pub completions: u64,
    /// 滚动平均往返时延
    pub avg_rtt: Duration,
    pub rcodes: HashMap<i32, u64>,
}

/// DNS解析器的统一接口
#[async_trait]
pub trait Resolver: Send + Sync {
    /// 上游地址 "ip:port"
    fn address(&self) -> String;

    /// 执行一次DNS查询
    async fn resolve(&self, name: &str, qtype: RecordType, priority: Priority) -> ResolveResult;

    fn stop(&self);
    fn is_stopped(&self) -> bool;

    fn stats(&self) -> ResolverStats;
    fn wipe_stats(&self);
}

struct Xchg {
    name: String,
    qtype: RecordType,
    sent_at: Option<Instant>,
    tx: oneshot::Sender<ResolveResult>,
}

struct PendingQuery {
    id: u16,
    msg: Message,
}

#[derive(Default)]
struct SocketPair {
    current: Option<Arc<UdpSocket>>,
    last: Option<Arc<UdpSocket>>,
}

#[derive(Default)]
struct StatsInner {
    attempts: u64,
    timeouts: u64,
    completions: u64,
    rcodes: HashMap<i32, u64>,
    rtt_avg_nanos: i64,
    rtt_count: i64,
}

/// 面向单个上游的高吞吐解析器
///
/// 出站查询进入优先级队列，由发送循环批量写出；
/// 在途查询按16位ID登记，应答、超时或停止时移除。
pub struct BaseResolver {
    addr: String,
    stopped: Arc<AtomicBool>,
    out_queue: PriorityQueue<PendingQuery>,
    xchgs: Arc<Mutex<HashMap<u16, Xchg>>>,
    sockets: Arc<Mutex<SocketPair>>,
    stats: Arc<Mutex<StatsInner>>,
}

impl BaseResolver {
    /// addr接受 "ip" 或 "ip:port"
    pub fn new(addr: &str) -> Arc<Self> {
        let colons = addr.matches(':').count();
        let addr = if colons == 1 || addr.contains("]:") {
            // 已带端口
            addr.to_string()
        } else if colons > 1 {
            format!("[{}]:53", addr.trim_matches(|c| c == '[' || c == ']'))
        } else {
            format!("{}:53", addr)
        };

        let r = Arc::new(BaseResolver {
            addr,
            stopped: Arc::new(AtomicBool::new(false)),
            out_queue: PriorityQueue::new(),
            xchgs: Arc::new(Mutex::new(HashMap::new())),
            sockets: Arc::new(Mutex::new(SocketPair::default())),
            stats: Arc::new(Mutex::new(StatsInner::default())),
        });

        tokio::spawn(Self::rotation_loop(r.clone()));
        tokio::spawn(Self::send_loop(r.clone()));
        tokio::spawn(Self::read_loop(r.clone(), false));
        tokio::spawn(Self::read_loop(r.clone(), true));
        tokio::spawn(Self::timeout_sweeper(r.clone()));
        r
    }

    fn bump_rcode(&self, rcode: i32) {
        let mut st = self.stats.lock().unwrap();
        *st.rcodes.entry(rcode).or_insert(0) += 1;
    }

    fn update_rtt(&self, rtt: Duration) {
        let mut st = self.stats.lock().unwrap();
        st.rtt_count += 1;
        let sample = rtt.as_nanos() as i64;
        st.rtt_avg_nanos += (sample - st.rtt_avg_nanos) / st.rtt_count;
    }

    /// 分配一个未占用的16位ID，0保留不用
    fn allocate_id(xchgs: &HashMap<u16, Xchg>) -> Option<u16> {
        if xchgs.len() >= u16::MAX as usize {
            return None;
        }
        let start: u16 = rand::thread_rng().gen();
        for off in 0..=u16::MAX {
            let id = start.wrapping_add(off);
            if id == 0 {
                continue;
            }
            if !xchgs.contains_key(&id) {
                return Some(id);
            }
        }
        None
    }

    fn pull_request(&self, id: u16) -> Option<Xchg> {
        self.xchgs.lock().unwrap().remove(&id)
    }

    async fn rotation_loop(r: Arc<BaseResolver>) {
        loop {
            if r.stopped.load(Ordering::Relaxed) {
                let mut pair = r.sockets.lock().unwrap();
                pair.current = None;
                pair.last = None;
                return;
            }

            match Self::dial(&r.addr).await {
                Ok(sock) => {
                    let mut pair = r.sockets.lock().unwrap();
                    pair.last = pair.current.take();
                    pair.current = Some(Arc::new(sock));
                }
                Err(e) => {
                    log::warn!("resolver {}: failed to dial udp socket: {}", r.addr, e);
                    let backoff_ms = rand::thread_rng().gen_range(1..=10);
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    continue;
                }
            }

            tokio::time::sleep(CONN_ROTATION).await;
        }
    }

    async fn dial(addr: &str) -> std::io::Result<UdpSocket> {
        let local = if addr.contains('[') {
            "[::]:0"
        } else {
            "0.0.0.0:0"
        };
        let sock = UdpSocket::bind(local).await?;
        sock.connect(addr).await?;
        Ok(sock)
    }

    fn current_socket(&self) -> Option<Arc<UdpSocket>> {
        self.sockets.lock().unwrap().current.clone()
    }

    fn slot_socket(&self, last: bool) -> Option<Arc<UdpSocket>> {
        let pair = self.sockets.lock().unwrap();
        if last {
            pair.last.clone()
        } else {
            pair.current.clone()
        }
    }

    async fn send_loop(r: Arc<BaseResolver>) {
        let mut backoff = 0usize;
        loop {
            if r.stopped.load(Ordering::Relaxed) {
                return;
            }

            let mut sent = 0usize;
            while sent < SEND_BATCH {
                let pending = match r.out_queue.next() {
                    Some(p) => p,
                    None => break,
                };
                r.write_message(pending).await;
                sent += 1;
            }

            if sent == 0 {
                if backoff < SEND_BACKOFF_MS.len() - 1 {
                    backoff += 1;
                }
                tokio::time::sleep(Duration::from_millis(SEND_BACKOFF_MS[backoff])).await;
            } else {
                backoff = 0;
            }
        }
    }

    async fn write_message(&self, pending: PendingQuery) {
        let sock = loop {
            if self.stopped.load(Ordering::Relaxed) {
                if let Some(req) = self.pull_request(pending.id) {
                    let _ = req.tx.send(Err(ResolveError::new(
                        format!("resolver {} has stopped", self.addr),
                        RCODE_RESOLVER_ERR,
                        false,
                    )));
                }
                return;
            }
            match self.current_socket() {
                Some(s) => break s,
                None => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        };

        let bytes = match pending.msg.to_vec() {
            Ok(b) => b,
            Err(e) => {
                if let Some(req) = self.pull_request(pending.id) {
                    let _ = req.tx.send(Err(ResolveError::new(
                        format!("failed to encode query: {}", e),
                        RCODE_RESOLVER_ERR,
                        false,
                    )));
                }
                return;
            }
        };

        match sock.send(&bytes).await {
            Ok(_) => {
                if let Some(req) = self.xchgs.lock().unwrap().get_mut(&pending.id) {
                    req.sent_at = Some(Instant::now());
                }
                self.stats.lock().unwrap().attempts += 1;
            }
            Err(e) => {
                if let Some(req) = self.pull_request(pending.id) {
                    let _ = req.tx.send(Err(ResolveError::new(
                        format!("failed to write query msg: {}", e),
                        RCODE_TIMEOUT,
                        true,
                    )));
                }
            }
        }
    }

    async fn read_loop(r: Arc<BaseResolver>, last: bool) {
        let mut buf = vec![0u8; 4096];
        loop {
            if r.stopped.load(Ordering::Relaxed) {
                return;
            }

            let sock = match r.slot_socket(last) {
                Some(s) => s,
                None => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            match tokio::time::timeout(Duration::from_millis(500), sock.recv(&mut buf)).await {
                Ok(Ok(n)) => {
                    if let Ok(msg) = Message::from_vec(&buf[..n]) {
                        r.process_message(msg).await;
                    }
                }
                Ok(Err(_)) | Err(_) => continue,
            }
        }
    }

    async fn process_message(&self, msg: Message) {
        let id = msg.id();
        let req = match self.pull_request(id) {
            Some(r) => r,
            None => return,
        };

        if let Some(sent) = req.sent_at {
            self.update_rtt(sent.elapsed());
        }

        let rcode = msg.response_code().low() as i32;
        self.bump_rcode(rcode);

        if msg.response_code() != ResponseCode::NoError {
            let again = RETRY_CODES.contains(&rcode);
            let _ = req.tx.send(Err(ResolveError::new(
                format!(
                    "query on resolver {} for {} type {} returned rcode {}",
                    self.addr, req.name, req.qtype, rcode
                ),
                rcode,
                again,
            )));
            return;
        }

        if msg.truncated() {
            let addr = self.addr.clone();
            tokio::spawn(tcp_exchange(addr, req.name, req.qtype, req.tx));
            return;
        }

        finish_processing(&self.addr, &msg, req.name, req.qtype, req.tx);
    }

    async fn timeout_sweeper(r: Arc<BaseResolver>) {
        loop {
            tokio::time::sleep(SWEEP_INTERVAL).await;

            if r.stopped.load(Ordering::Relaxed) {
                // 停止后清空全部在途查询
                let drained: Vec<Xchg> = {
                    let mut xchgs = r.xchgs.lock().unwrap();
                    xchgs.drain().map(|(_, v)| v).collect()
                };
                for req in drained {
                    let _ = req.tx.send(Err(ResolveError::new(
                        format!("resolver {} has stopped", r.addr),
                        RCODE_RESOLVER_ERR,
                        false,
                    )));
                }
                return;
            }

            let expired: Vec<u16> = {
                let xchgs = r.xchgs.lock().unwrap();
                xchgs
                    .iter()
                    .filter(|(_, x)| {
                        x.sent_at
                            .map(|t| t.elapsed() >= QUERY_TIMEOUT)
                            .unwrap_or(false)
                    })
                    .map(|(id, _)| *id)
                    .collect()
            };

            let mut count = 0u64;
            for id in expired {
                if let Some(req) = r.pull_request(id) {
                    count += 1;
                    let _ = req.tx.send(Err(ResolveError::new(
                        format!(
                            "query on resolver {} for {} type {} timed out",
                            r.addr, req.name, req.qtype
                        ),
                        RCODE_TIMEOUT,
                        true,
                    )));
                }
            }
            if count > 0 {
                r.stats.lock().unwrap().timeouts += count;
            }
        }
    }
}

#[async_trait]
impl Resolver for BaseResolver {
    fn address(&self) -> String {
        self.addr.clone()
    }

    async fn resolve(&self, name: &str, qtype: RecordType, priority: Priority) -> ResolveResult {
        if self.is_stopped() {
            return Err(ResolveError::new(
                format!("resolver {} has been stopped", self.addr),
                RCODE_RESOLVER_ERR,
                false,
            ));
        }

        let (tx, rx) = oneshot::channel();
        let pending = {
            let mut xchgs = self.xchgs.lock().unwrap();
            let id = match Self::allocate_id(&xchgs) {
                Some(id) => id,
                None => {
                    return Err(ResolveError::new(
                        "no query ids available",
                        RCODE_RESOLVER_ERR,
                        false,
                    ))
                }
            };
            let msg = match query_message(id, name, qtype) {
                Ok(m) => m,
                Err(e) => return Err(e),
            };
            xchgs.insert(
                id,
                Xchg {
                    name: name.to_string(),
                    qtype,
                    sent_at: None,
                    tx,
                },
            );
            PendingQuery { id, msg }
        };

        self.out_queue.append_priority(pending, priority);

        let result = match rx.await {
            Ok(res) => res,
            Err(_) => Err(ResolveError::new(
                format!("resolver {} dropped the query", self.addr),
                RCODE_RESOLVER_ERR,
                false,
            )),
        };
        self.stats.lock().unwrap().completions += 1;
        result
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    fn stats(&self) -> ResolverStats {
        let st = self.stats.lock().unwrap();
        ResolverStats {
            attempts: st.attempts,
            timeouts: st.timeouts,
            completions: st.completions,
            avg_rtt: Duration::from_nanos(st.rtt_avg_nanos.max(0) as u64),
            rcodes: st.rcodes.clone(),
        }
    }

    fn wipe_stats(&self) {
        let mut st = self.stats.lock().unwrap();
        *st = StatsInner::default();
    }
}

/// 构造一条标准查询消息
pub fn query_message(id: u16, name: &str, qtype: RecordType) -> Result<Message, ResolveError> {
    let qname = Name::from_ascii(name).map_err(|e| {
        ResolveError::new(
            format!("invalid query name {}: {}", name, e),
            RCODE_RESOLVER_ERR,
            false,
        )
    })?;

    let mut query = Query::query(qname, qtype);
    query.set_query_class(DNSClass::IN);

    let mut msg = Message::new();
    msg.set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(query);
    Ok(msg)
}

/// 把应答记录转成规范化文本
pub fn record_data_string(rdata: &RData) -> String {
    fn no_dot(name: &Name) -> String {
        name.to_ascii().trim_end_matches('.').to_lowercase()
    }

    match rdata {
        RData::A(a) => a.0.to_string(),
        RData::AAAA(a) => a.0.to_string(),
        RData::CNAME(n) => no_dot(&n.0),
        RData::NS(n) => no_dot(&n.0),
        RData::PTR(n) => no_dot(&n.0),
        RData::MX(mx) => format!("{} {}", mx.preference(), no_dot(mx.exchange())),
        RData::SOA(soa) => no_dot(soa.mname()),
        RData::SRV(srv) => format!(
            "{} {} {} {}",
            srv.priority(),
            srv.weight(),
            srv.port(),
            no_dot(srv.target())
        ),
        RData::TXT(txt) => txt.to_string(),
        other => other.to_string(),
    }
}

/// 从应答消息中抽取与问题类型一致的记录
pub fn extract_answers(msg: &Message, qtype: RecordType) -> Vec<DnsAnswer> {
    msg.answers()
        .iter()
        .filter(|rec| rec.record_type() == qtype)
        .filter_map(|rec| {
            rec.data().map(|rdata| DnsAnswer {
                name: rec.name().to_ascii().trim_end_matches('.').to_lowercase(),
                rtype: u16::from(qtype),
                ttl: rec.ttl(),
                data: record_data_string(rdata).trim().to_string(),
            })
        })
        .collect()
}

fn finish_processing(
    addr: &str,
    msg: &Message,
    name: String,
    qtype: RecordType,
    tx: oneshot::Sender<ResolveResult>,
) {
    let answers = extract_answers(msg, qtype);
    if answers.is_empty() {
        let _ = tx.send(Err(ResolveError::new(
            format!(
                "query on resolver {} for {} type {} returned 0 records",
                addr, name, qtype
            ),
            msg.response_code().low() as i32,
            false,
        )));
        return;
    }
    let _ = tx.send(Ok(answers));
}

/// 截断应答的TCP回退，带一分钟的总时限
async fn tcp_exchange(
    addr: String,
    name: String,
    qtype: RecordType,
    tx: oneshot::Sender<ResolveResult>,
) {
    let result = tokio::time::timeout(Duration::from_secs(60), async {
        let id: u16 = rand::thread_rng().gen_range(1..=u16::MAX);
        let msg = query_message(id, &name, qtype)?;
        let bytes = msg.to_vec().map_err(|e| {
            ResolveError::new(
                format!("failed to encode query: {}", e),
                RCODE_RESOLVER_ERR,
                false,
            )
        })?;

        let mut stream = TcpStream::connect(&addr).await.map_err(|e| {
            ResolveError::new(
                format!("failed to obtain tcp connection to {}: {}", addr, e),
                RCODE_NOT_AVAILABLE,
                true,
            )
        })?;

        // TCP上的DNS消息带2字节长度前缀
        let mut framed = Vec::with_capacity(bytes.len() + 2);
        framed.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
        framed.extend_from_slice(&bytes);
        stream.write_all(&framed).await.map_err(|e| {
            ResolveError::new(
                format!("failed to write query msg: {}", e),
                RCODE_TIMEOUT,
                true,
            )
        })?;

        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await.map_err(|e| {
            ResolveError::new(
                format!("failed to read the reply msg: {}", e),
                RCODE_TIMEOUT,
                true,
            )
        })?;
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await.map_err(|e| {
            ResolveError::new(
                format!("failed to read the reply msg: {}", e),
                RCODE_TIMEOUT,
                true,
            )
        })?;

        Message::from_vec(&body).map_err(|e| {
            ResolveError::new(
                format!("failed to decode the reply msg: {}", e),
                RCODE_RESOLVER_ERR,
                false,
            )
        })
    })
    .await;

    match result {
        Ok(Ok(msg)) => finish_processing(&addr, &msg, name, qtype, tx),
        Ok(Err(e)) => {
            let _ = tx.send(Err(e));
        }
        Err(_) => {
            let _ = tx.send(Err(ResolveError::new(
                format!("tcp exchange with {} timed out", addr),
                RCODE_TIMEOUT,
                true,
            )));
        }
    }
}
