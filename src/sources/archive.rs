use std::time::Duration;

use async_trait::async_trait;
use itertools::Itertools;

use crate::model::{DnsRequest, Tag};
use crate::netutil::extract_names;
use crate::service::{new_name_event, set_active, DataSource, EnumContext};
use crate::sources::http_client;

/// Wayback Machine的CDX索引
pub struct Wayback {
    client: reqwest::Client,
}

impl Wayback {
    pub fn new() -> Self {
        Wayback {
            client: http_client(),
        }
    }

    fn url(domain: &str) -> String {
        format!(
            "http://web.archive.org/cdx/search/cdx?url={}&matchType=domain&fl=original&collapse=urlkey&limit=5000",
            domain
        )
    }

    async fn crawl(&self, ctx: &EnumContext, domain: &str) {
        ctx.bus.log(format!(
            "Querying {} for {} subdomains",
            self.name(),
            domain
        ));

        let body = match self.client.get(Self::url(domain)).send().await {
            Ok(resp) => match resp.text().await {
                Ok(b) => b,
                Err(e) => {
                    ctx.bus.log(format!("{}: {}: {}", self.name(), domain, e));
                    return;
                }
            },
            Err(e) => {
                ctx.bus.log(format!("{}: {}: {}", self.name(), domain, e));
                return;
            }
        };

        set_active(ctx, self.name());

        for name in extract_names(&body).into_iter().unique() {
            new_name_event(ctx, self.source_type(), self.name(), &name);
        }
    }
}

impl Default for Wayback {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataSource for Wayback {
    fn name(&self) -> &'static str {
        "Wayback"
    }

    fn source_type(&self) -> Tag {
        Tag::Archive
    }

    fn rate_limit(&self) -> Duration {
        Duration::from_secs(2)
    }

    async fn dns_request(&self, ctx: &EnumContext, req: &DnsRequest) {
        self.crawl(ctx, &req.domain).await;
    }

    async fn subdomain_discovered(&self, ctx: &EnumContext, req: &DnsRequest, times: usize) {
        if times == 1 && req.name != req.domain {
            self.crawl(ctx, &req.name).await;
        }
    }
}
