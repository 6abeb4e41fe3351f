use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::bus::BusEvent;
use crate::model::{AsnRequest, DnsRequest, Priority, Tag};
use crate::service::{new_name_event, set_active, DataSource, EnumContext};
use crate::sources::http_client;

#[derive(Debug, Deserialize)]
struct PdnsLine {
    rrname: String,
    rrdata: String,
    rrtype: String,
}

#[derive(Debug, Default, Deserialize)]
struct IpQuery {
    #[serde(default)]
    status: String,
    #[serde(default)]
    asname: String,
    #[serde(rename = "as", default)]
    asn: u32,
    #[serde(default)]
    bgproute: String,
}

#[derive(Debug, Default, Deserialize)]
struct AsQuery {
    #[serde(default)]
    nets: Vec<AsNet>,
}

#[derive(Debug, Deserialize)]
struct AsNet {
    #[serde(rename = "n")]
    prefix: String,
}

/// Robtex免费API: 被动DNS与ASN信息
pub struct Robtex {
    client: reqwest::Client,
}

impl Robtex {
    pub fn new() -> Self {
        Robtex {
            client: http_client(),
        }
    }

    async fn get(&self, url: &str) -> Result<String, reqwest::Error> {
        self.client.get(url).send().await?.text().await
    }
}

impl Default for Robtex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataSource for Robtex {
    fn name(&self) -> &'static str {
        "Robtex"
    }

    fn source_type(&self) -> Tag {
        Tag::Api
    }

    fn rate_limit(&self) -> Duration {
        // 免费接口限速较严
        Duration::from_secs(3)
    }

    async fn dns_request(&self, ctx: &EnumContext, req: &DnsRequest) {
        ctx.bus.log(format!(
            "Querying {} for {} subdomains",
            self.name(),
            req.domain
        ));

        let url = format!("https://freeapi.robtex.com/pdns/forward/{}", req.domain);
        let body = match self.get(&url).await {
            Ok(b) => b,
            Err(e) => {
                ctx.bus.log(format!("{}: {}: {}", self.name(), url, e));
                return;
            }
        };

        set_active(ctx, self.name());

        // 应答是逐行的JSON对象
        for line in body.lines() {
            let entry: PdnsLine = match serde_json::from_str(line) {
                Ok(v) => v,
                Err(_) => continue,
            };
            new_name_event(ctx, self.source_type(), self.name(), &entry.rrname);
            if matches!(entry.rrtype.as_str(), "NS" | "MX" | "CNAME") {
                new_name_event(ctx, self.source_type(), self.name(), &entry.rrdata);
            }
        }
    }

    async fn asn_request(&self, ctx: &EnumContext, req: &AsnRequest) {
        let addr = match req.address {
            Some(a) => a,
            None => return,
        };

        let url = format!("https://freeapi.robtex.com/ipquery/{}", addr);
        let ipinfo: IpQuery = match self.get(&url).await {
            Ok(b) => serde_json::from_str(&b).unwrap_or_default(),
            Err(e) => {
                ctx.bus.log(format!("{}: {}: {}", self.name(), url, e));
                return;
            }
        };
        if ipinfo.status != "ok" || ipinfo.asn == 0 {
            return;
        }

        set_active(ctx, self.name());

        let mut netblocks: HashSet<String> = HashSet::new();
        let url = format!("https://freeapi.robtex.com/asquery/{}", ipinfo.asn);
        if let Ok(b) = self.get(&url).await {
            let asinfo: AsQuery = serde_json::from_str(&b).unwrap_or_default();
            netblocks.extend(asinfo.nets.into_iter().map(|n| n.prefix));
        }
        if !ipinfo.bgproute.is_empty() {
            netblocks.insert(ipinfo.bgproute.clone());
        }

        ctx.bus.publish(
            Priority::High,
            BusEvent::NewAsn(AsnRequest {
                address: Some(addr),
                asn: ipinfo.asn,
                prefix: ipinfo.bgproute,
                description: ipinfo.asname,
                netblocks,
                tag: self.source_type(),
                source: self.name().to_string(),
            }),
        );
    }
}
