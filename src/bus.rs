use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, Semaphore};

use crate::model::{AddrRequest, AsnRequest, DnsRequest, Priority};
use crate::queue::PriorityQueue;

/// 空转时的退避梯度(毫秒)，出队成功后归零
pub const IDLE_BACKOFF_MS: [u64; 7] = [10, 25, 50, 75, 100, 150, 250];

/// 总线主题
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// 数据源发现了新名称
    NewName,
    /// 名称解析成功
    NameResolved,
    /// 请求对名称做DNS解析
    ResolveName,
    /// 发现了新的IP地址
    NewAddr,
    /// ASN信息应答
    NewAsn,
    /// 发现了新的子域
    SubDiscovered,
    /// 组件活动心跳
    SetActive,
    /// 一次DNS查询完成(携带rcode)
    ResolveCompleted,
    /// 日志消息
    Log,
}

/// 总线消息，每个主题固定一种载荷
#[derive(Debug, Clone)]
pub enum BusEvent {
    NewName(DnsRequest),
    NameResolved(DnsRequest),
    ResolveName(DnsRequest),
    NewAddr(AddrRequest),
    NewAsn(AsnRequest),
    SubDiscovered(DnsRequest, usize),
    SetActive(String),
    ResolveCompleted(i32),
    Log(String),
}

impl BusEvent {
    pub fn topic(&self) -> Topic {
        match self {
            BusEvent::NewName(_) => Topic::NewName,
            BusEvent::NameResolved(_) => Topic::NameResolved,
            BusEvent::ResolveName(_) => Topic::ResolveName,
            BusEvent::NewAddr(_) => Topic::NewAddr,
            BusEvent::NewAsn(_) => Topic::NewAsn,
            BusEvent::SubDiscovered(_, _) => Topic::SubDiscovered,
            BusEvent::SetActive(_) => Topic::SetActive,
            BusEvent::ResolveCompleted(_) => Topic::ResolveCompleted,
            BusEvent::Log(_) => Topic::Log,
        }
    }
}

/// 订阅回调，异步执行
pub type Subscriber = Arc<dyn Fn(BusEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// 订阅凭据，用于退订
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

enum SubMsg {
    Subscribe(Topic, SubscriptionId, Subscriber),
    Unsubscribe(Topic, SubscriptionId),
}

/// 事件总线
///
/// 三个优先级档位的待发布队列由单个调度任务消费，
/// 回调执行的并发量受信号量约束。
pub struct EventBus {
    pending: PriorityQueue<BusEvent>,
    sub_tx: mpsc::UnboundedSender<SubMsg>,
    stopped: Arc<AtomicBool>,
    next_id: AtomicU64,
}

impl EventBus {
    /// max_concurrent限制同时运行的回调数
    pub fn new(max_concurrent: usize) -> Arc<Self> {
        let (sub_tx, sub_rx) = mpsc::unbounded_channel();
        let bus = Arc::new(EventBus {
            pending: PriorityQueue::new(),
            sub_tx,
            stopped: Arc::new(AtomicBool::new(false)),
            next_id: AtomicU64::new(1),
        });

        tokio::spawn(dispatch_loop(
            bus.pending.clone(),
            sub_rx,
            bus.stopped.clone(),
            max_concurrent.max(1),
        ));
        bus
    }

    /// 发布事件，停止后的发布被丢弃
    pub fn publish(&self, priority: Priority, event: BusEvent) {
        if self.stopped.load(Ordering::Relaxed) {
            return;
        }
        self.pending.append_priority(event, priority);
    }

    /// 注册异步回调
    pub fn subscribe(&self, topic: Topic, sub: Subscriber) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let _ = self.sub_tx.send(SubMsg::Subscribe(topic, id, sub));
        id
    }

    /// 注册同步回调
    pub fn subscribe_fn<F>(&self, topic: Topic, f: F) -> SubscriptionId
    where
        F: Fn(BusEvent) + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.subscribe(
            topic,
            Arc::new(move |ev| {
                let f = f.clone();
                Box::pin(async move { f(ev) })
            }),
        )
    }

    pub fn unsubscribe(&self, topic: Topic, id: SubscriptionId) {
        let _ = self.sub_tx.send(SubMsg::Unsubscribe(topic, id));
    }

    /// 停止调度，幂等
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    pub fn log(&self, msg: String) {
        self.publish(Priority::Low, BusEvent::Log(msg));
    }
}

async fn dispatch_loop(
    pending: PriorityQueue<BusEvent>,
    mut sub_rx: mpsc::UnboundedReceiver<SubMsg>,
    stopped: Arc<AtomicBool>,
    max_concurrent: usize,
) {
    let mut topics: HashMap<Topic, Vec<(SubscriptionId, Subscriber)>> = HashMap::new();
    let gate = Arc::new(Semaphore::new(max_concurrent));
    let mut backoff = 0usize;

    loop {
        if stopped.load(Ordering::Relaxed) {
            return;
        }

        // 先消化订阅/退订请求
        while let Ok(msg) = sub_rx.try_recv() {
            match msg {
                SubMsg::Subscribe(topic, id, sub) => {
                    topics.entry(topic).or_default().push((id, sub));
                }
                SubMsg::Unsubscribe(topic, id) => {
                    if let Some(subs) = topics.get_mut(&topic) {
                        subs.retain(|(sid, _)| *sid != id);
                    }
                }
            }
        }

        let event = match pending.next() {
            Some(ev) => ev,
            None => {
                if backoff < IDLE_BACKOFF_MS.len() - 1 {
                    backoff += 1;
                }
                tokio::time::sleep(Duration::from_millis(IDLE_BACKOFF_MS[backoff])).await;
                continue;
            }
        };
        backoff = 0;

        let subs: Vec<Subscriber> = topics
            .get(&event.topic())
            .map(|v| v.iter().map(|(_, s)| s.clone()).collect())
            .unwrap_or_default();

        for sub in subs {
            let permit = match gate.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => return,
            };
            let ev = event.clone();
            tokio::spawn(async move {
                sub(ev).await;
                drop(permit);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = EventBus::new(4);
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.subscribe_fn(Topic::Log, move |ev| {
            if let BusEvent::Log(_) = ev {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        for _ in 0..5 {
            bus.publish(Priority::High, BusEvent::Log("hello".to_string()));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 5);
        bus.stop();
    }

    #[tokio::test]
    async fn no_delivery_after_stop() {
        let bus = EventBus::new(4);
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.subscribe_fn(Topic::Log, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        bus.stop();
        bus.publish(Priority::Critical, BusEvent::Log("late".to_string()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unsubscribe_removes_callback() {
        let bus = EventBus::new(4);
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = bus.subscribe_fn(Topic::SetActive, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        bus.publish(Priority::Critical, BusEvent::SetActive("one".to_string()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        bus.unsubscribe(Topic::SetActive, id);
        tokio::time::sleep(Duration::from_millis(50)).await;
        bus.publish(Priority::Critical, BusEvent::SetActive("two".to_string()));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        bus.stop();
    }
}
