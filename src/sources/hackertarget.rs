use async_trait::async_trait;

use crate::bus::BusEvent;
use crate::model::{AsnRequest, DnsRequest, Priority, Tag};
use crate::service::{new_name_event, set_active, DataSource, EnumContext};
use crate::sources::http_client;

/// HackerTarget主机搜索与ASN查询API
pub struct HackerTarget {
    client: reqwest::Client,
}

impl HackerTarget {
    pub fn new() -> Self {
        HackerTarget {
            client: http_client(),
        }
    }

    async fn get(&self, url: &str) -> Result<String, reqwest::Error> {
        self.client.get(url).send().await?.text().await
    }
}

impl Default for HackerTarget {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataSource for HackerTarget {
    fn name(&self) -> &'static str {
        "HackerTarget"
    }

    fn source_type(&self) -> Tag {
        Tag::Api
    }

    async fn dns_request(&self, ctx: &EnumContext, req: &DnsRequest) {
        ctx.bus.log(format!(
            "Querying {} for {} subdomains",
            self.name(),
            req.domain
        ));

        let url = format!("https://api.hackertarget.com/hostsearch/?q={}", req.domain);
        let body = match self.get(&url).await {
            Ok(b) => b,
            Err(e) => {
                ctx.bus.log(format!("{}: {}: {}", self.name(), url, e));
                return;
            }
        };

        set_active(ctx, self.name());

        // 每行形如 host,ip
        for line in body.lines() {
            if let Some(host) = line.split(',').next() {
                new_name_event(ctx, self.source_type(), self.name(), host);
            }
        }
    }

    async fn asn_request(&self, ctx: &EnumContext, req: &AsnRequest) {
        let addr = match req.address {
            Some(a) => a,
            None => return,
        };

        let url = format!("https://api.hackertarget.com/aslookup/?q={}", addr);
        let body = match self.get(&url).await {
            Ok(b) => b,
            Err(e) => {
                ctx.bus.log(format!("{}: {}: {}", self.name(), url, e));
                return;
            }
        };

        set_active(ctx, self.name());

        // 应答形如 "1.2.3.4","AS15169","1.2.3.0/24","GOOGLE"
        let fields: Vec<String> = body
            .trim()
            .split(',')
            .map(|f| f.trim_matches('"').to_string())
            .collect();
        if fields.len() < 4 {
            return;
        }

        let asn: u32 = match fields[1].trim_start_matches("AS").parse() {
            Ok(n) => n,
            Err(_) => return,
        };
        let prefix = fields[2].clone();

        let mut answer = AsnRequest {
            address: Some(addr),
            asn,
            prefix: prefix.clone(),
            description: fields[3].clone(),
            netblocks: [prefix].into_iter().collect(),
            tag: self.source_type(),
            source: self.name().to_string(),
        };
        answer.netblocks.retain(|n| !n.is_empty());

        ctx.bus.publish(Priority::High, BusEvent::NewAsn(answer));
    }

    async fn subdomain_discovered(&self, ctx: &EnumContext, req: &DnsRequest, times: usize) {
        if times == 1 && req.name != req.domain {
            let mut sub = req.clone();
            sub.domain = req.name.clone();
            self.dns_request(ctx, &sub).await;
        }
    }
}
