use std::net::IpAddr;
use std::time::Duration;

use itertools::Itertools;
use tokio::net::TcpStream;
use x509_parser::prelude::*;

use crate::model::sanitize_name;

/// 主动模式下尝试握手的端口
pub const DEFAULT_TLS_PORTS: &[u16] = &[443, 8443];

/// 握手超时
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// 对地址的常见TLS端口握手，抽取证书里的主机名
pub async fn pull_certificate_names(addr: IpAddr, ports: &[u16]) -> Vec<String> {
    let mut names = Vec::new();

    for port in ports {
        if let Some(found) = handshake_names(addr, *port).await {
            names.extend(found);
        }
    }

    names
        .into_iter()
        .map(|n| sanitize_name(&n))
        .filter(|n| !n.is_empty())
        .unique()
        .collect()
}

async fn handshake_names(addr: IpAddr, port: u16) -> Option<Vec<String>> {
    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
        .ok()?;
    let connector = tokio_native_tls::TlsConnector::from(connector);

    let target = match addr {
        IpAddr::V4(v4) => format!("{}:{}", v4, port),
        IpAddr::V6(v6) => format!("[{}]:{}", v6, port),
    };

    let result = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        let stream = TcpStream::connect(&target).await.ok()?;
        connector.connect(&addr.to_string(), stream).await.ok()
    })
    .await
    .ok()??;

    let cert = result.get_ref().peer_certificate().ok()??;
    let der = cert.to_der().ok()?;
    Some(names_from_cert(&der))
}

/// 从DER编码的证书里取出CN和SAN条目
pub fn names_from_cert(der: &[u8]) -> Vec<String> {
    let (_, cert) = match X509Certificate::from_der(der) {
        Ok(v) => v,
        Err(_) => return Vec::new(),
    };

    let mut names = Vec::new();

    for cn in cert.subject().iter_common_name() {
        if let Ok(value) = cn.as_str() {
            names.push(value.to_string());
        }
    }

    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for entry in &san.value.general_names {
            if let GeneralName::DNSName(dns) = entry {
                names.push(dns.to_string());
            }
        }
    }

    names
}
