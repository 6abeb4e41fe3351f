use async_trait::async_trait;
use serde::Deserialize;

use crate::model::{DnsRequest, Tag};
use crate::netutil::remove_asterisk_label;
use crate::service::{new_name_event, set_active, DataSource, EnumContext};
use crate::sources::http_client;

#[derive(Debug, Deserialize)]
struct CrtshEntry {
    name_value: String,
}

/// crt.sh证书透明度日志
pub struct Crtsh {
    client: reqwest::Client,
}

impl Crtsh {
    pub fn new() -> Self {
        Crtsh {
            client: http_client(),
        }
    }

    fn url(domain: &str) -> String {
        format!("https://crt.sh/?q=%25.{}&output=json", domain)
    }
}

impl Default for Crtsh {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataSource for Crtsh {
    fn name(&self) -> &'static str {
        "Crtsh"
    }

    fn source_type(&self) -> Tag {
        Tag::Cert
    }

    async fn dns_request(&self, ctx: &EnumContext, req: &DnsRequest) {
        ctx.bus.log(format!(
            "Querying {} for {} subdomains",
            self.name(),
            req.domain
        ));

        let entries: Vec<CrtshEntry> = match self.client.get(Self::url(&req.domain)).send().await {
            Ok(resp) => match resp.json().await {
                Ok(v) => v,
                Err(e) => {
                    ctx.bus.log(format!("{}: {}: {}", self.name(), req.domain, e));
                    return;
                }
            },
            Err(e) => {
                ctx.bus.log(format!("{}: {}: {}", self.name(), req.domain, e));
                return;
            }
        };

        set_active(ctx, self.name());

        for entry in entries {
            // 一个条目可能带多行SAN
            for name in entry.name_value.lines() {
                new_name_event(
                    ctx,
                    self.source_type(),
                    self.name(),
                    &remove_asterisk_label(name),
                );
            }
        }
    }

    async fn subdomain_discovered(&self, ctx: &EnumContext, req: &DnsRequest, times: usize) {
        // 只在首次发现时追查更深的子域
        if times == 1 && req.name != req.domain {
            let mut sub = req.clone();
            sub.domain = req.name.clone();
            self.dns_request(ctx, &sub).await;
        }
    }
}
