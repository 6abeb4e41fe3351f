use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::bus::{BusEvent, EventBus};
use crate::config::Config;
use crate::model::{AsnRequest, DnsRequest, Priority, Tag};

/// 传给所有处理器的能力句柄
#[derive(Clone)]
pub struct EnumContext {
    pub config: Arc<Config>,
    pub bus: Arc<EventBus>,
}

impl EnumContext {
    pub fn new(config: Arc<Config>, bus: Arc<EventBus>) -> Self {
        EnumContext { config, bus }
    }
}

/// 数据源收到的输入
#[derive(Debug, Clone)]
pub enum SourceRequest {
    Dns(DnsRequest),
    Asn(AsnRequest),
    SubDiscovered(DnsRequest, usize),
    Resolved(DnsRequest),
}

/// 被动数据源的统一接口
///
/// 处理器吞掉自身错误并通过Log主题上报，单个数据源的失败
/// 不影响整个枚举。
#[async_trait]
pub trait DataSource: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn source_type(&self) -> Tag;

    /// 相邻两次请求的最小间隔
    fn rate_limit(&self) -> Duration {
        Duration::from_secs(1)
    }

    /// 启动前的凭据/配置检查，Err则该源不参与
    fn check_config(&self, _cfg: &Config) -> Result<(), String> {
        Ok(())
    }

    async fn on_start(&self, _ctx: &EnumContext) {}

    async fn dns_request(&self, _ctx: &EnumContext, _req: &DnsRequest) {}

    async fn asn_request(&self, _ctx: &EnumContext, _req: &AsnRequest) {}

    async fn subdomain_discovered(&self, _ctx: &EnumContext, _req: &DnsRequest, _times: usize) {}

    async fn resolved(&self, _ctx: &EnumContext, _req: &DnsRequest) {}
}

/// 数据源任务的外部句柄，投递永不阻塞
#[derive(Clone)]
pub struct SourceHandle {
    name: &'static str,
    source_type: Tag,
    tx: mpsc::UnboundedSender<SourceRequest>,
}

impl SourceHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn source_type(&self) -> Tag {
        self.source_type
    }

    pub fn dns_request(&self, req: DnsRequest) {
        let _ = self.tx.send(SourceRequest::Dns(req));
    }

    pub fn asn_request(&self, req: AsnRequest) {
        let _ = self.tx.send(SourceRequest::Asn(req));
    }

    pub fn subdomain_discovered(&self, req: DnsRequest, times: usize) {
        let _ = self.tx.send(SourceRequest::SubDiscovered(req, times));
    }

    pub fn resolved(&self, req: DnsRequest) {
        let _ = self.tx.send(SourceRequest::Resolved(req));
    }
}

/// 把数据源作为独立任务跑起来
///
/// 任务循环逐条消费输入，之间执行最小间隔限速。
pub fn spawn_source(src: Arc<dyn DataSource>, ctx: EnumContext) -> SourceHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<SourceRequest>();
    let handle = SourceHandle {
        name: src.name(),
        source_type: src.source_type(),
        tx,
    };

    tokio::spawn(async move {
        src.on_start(&ctx).await;

        let limit = src.rate_limit();
        let mut last: Option<Instant> = None;
        while let Some(req) = rx.recv().await {
            if let Some(prev) = last {
                let elapsed = prev.elapsed();
                if elapsed < limit {
                    tokio::time::sleep(limit - elapsed).await;
                }
            }
            last = Some(Instant::now());

            match req {
                SourceRequest::Dns(r) => src.dns_request(&ctx, &r).await,
                SourceRequest::Asn(r) => src.asn_request(&ctx, &r).await,
                SourceRequest::SubDiscovered(r, times) => {
                    src.subdomain_discovered(&ctx, &r, times).await
                }
                SourceRequest::Resolved(r) => src.resolved(&ctx, &r).await,
            }
        }
    });

    handle
}

/// 按配置的黑白名单筛选数据源并打乱顺序
pub fn select_sources(cfg: &Config, all: Vec<Arc<dyn DataSource>>) -> Vec<Arc<dyn DataSource>> {
    let filter = &cfg.source_filter;
    let mut selected: Vec<Arc<dyn DataSource>> = all
        .into_iter()
        .filter(|s| {
            let named = filter
                .sources
                .iter()
                .any(|n| n.eq_ignore_ascii_case(s.name()));
            if filter.include && !filter.sources.is_empty() {
                named
            } else {
                !named
            }
        })
        .filter(|s| match s.check_config(cfg) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("data source {} excluded: {}", s.name(), e);
                false
            }
        })
        .collect();

    selected.shuffle(&mut rand::thread_rng());
    selected
}

/// 名称在范围内时发布NewName事件
pub fn new_name_event(ctx: &EnumContext, tag: Tag, source: &str, name: &str) {
    let cleaned = crate::model::sanitize_name(name);
    if cleaned.is_empty() || !crate::netutil::SUBDOMAIN_RE.is_match(&cleaned) {
        return;
    }
    if let Some(domain) = ctx.config.which_domain(&cleaned) {
        ctx.bus.publish(
            Priority::High,
            BusEvent::NewName(DnsRequest::new(&cleaned, &domain, tag, source)),
        );
    }
}

/// 工作心跳
pub fn set_active(ctx: &EnumContext, source: &str) {
    ctx.bus.publish(
        Priority::Critical,
        BusEvent::SetActive(source.to_string()),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        hits: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DataSource for CountingSource {
        fn name(&self) -> &'static str {
            "Counting"
        }
        fn source_type(&self) -> Tag {
            Tag::Api
        }
        fn rate_limit(&self) -> Duration {
            Duration::from_millis(10)
        }
        async fn dns_request(&self, _ctx: &EnumContext, _req: &DnsRequest) {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn source_task_consumes_requests() {
        let cfg = Arc::new(Config::default());
        let bus = EventBus::new(4);
        let ctx = EnumContext::new(cfg, bus.clone());
        let hits = Arc::new(AtomicUsize::new(0));
        let handle = spawn_source(Arc::new(CountingSource { hits: hits.clone() }), ctx);

        for _ in 0..3 {
            handle.dns_request(DnsRequest::new(
                "example.com",
                "example.com",
                Tag::Dns,
                "DNS",
            ));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        bus.stop();
    }

    struct NamedSource(&'static str);

    #[async_trait]
    impl DataSource for NamedSource {
        fn name(&self) -> &'static str {
            self.0
        }
        fn source_type(&self) -> Tag {
            Tag::Api
        }
    }

    #[tokio::test]
    async fn source_filter_include_and_exclude() {
        let mut cfg = Config::default();
        cfg.source_filter.sources = vec!["alpha".to_string()];
        cfg.source_filter.include = true;
        let all: Vec<Arc<dyn DataSource>> =
            vec![Arc::new(NamedSource("Alpha")), Arc::new(NamedSource("Beta"))];
        let picked = select_sources(&cfg, all);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].name(), "Alpha");

        cfg.source_filter.include = false;
        let all: Vec<Arc<dyn DataSource>> =
            vec![Arc::new(NamedSource("Alpha")), Arc::new(NamedSource("Beta"))];
        let picked = select_sources(&cfg, all);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].name(), "Beta");
    }
}
