use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::Write;

use serde::{Deserialize, Serialize};

use crate::graph::EnumOutput;
use crate::input::OutputFormat;

/// 可序列化的地址信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializableAddress {
    pub ip: String,
    pub cidr: String,
    pub asn: u32,
    pub description: String,
}

/// 可序列化的单条发现
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializableFinding {
    pub name: String,
    pub domain: String,
    pub tag: String,
    pub sources: Vec<String>,
    pub addresses: Vec<SerializableAddress>,
}

/// 完整的导出数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportData {
    pub findings: Vec<SerializableFinding>,
    pub export_time: String,
}

impl From<&EnumOutput> for SerializableFinding {
    fn from(out: &EnumOutput) -> Self {
        SerializableFinding {
            name: out.name.clone(),
            domain: out.domain.clone(),
            tag: out.tag.to_string(),
            sources: out.sources.clone(),
            addresses: out
                .addresses
                .iter()
                .map(|a| SerializableAddress {
                    ip: a.ip.clone(),
                    cidr: a.cidr.clone(),
                    asn: a.asn,
                    description: a.description.clone(),
                })
                .collect(),
        }
    }
}

/// 把结果写到文件
pub fn export_results(
    outputs: &[EnumOutput],
    format: &OutputFormat,
    path: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let findings: Vec<SerializableFinding> = outputs.iter().map(SerializableFinding::from).collect();

    let content = match format {
        OutputFormat::Json => {
            let data = ExportData {
                findings,
                export_time: chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            };
            serde_json::to_string_pretty(&data)?
        }
        OutputFormat::Csv => {
            let mut out = String::from("name,domain,tag,ip,cidr,asn,sources\n");
            for f in &findings {
                if f.addresses.is_empty() {
                    out.push_str(&format!(
                        "{},{},{},,,,{}\n",
                        f.name,
                        f.domain,
                        f.tag,
                        f.sources.join(";")
                    ));
                }
                for a in &f.addresses {
                    out.push_str(&format!(
                        "{},{},{},{},{},{},{}\n",
                        f.name,
                        f.domain,
                        f.tag,
                        a.ip,
                        a.cidr,
                        a.asn,
                        f.sources.join(";")
                    ));
                }
            }
            out
        }
        OutputFormat::Txt => {
            let mut out = String::new();
            for f in &findings {
                let ips: Vec<&str> = f.addresses.iter().map(|a| a.ip.as_str()).collect();
                out.push_str(&format!("{} {}\n", f.name, ips.join(",")));
            }
            out
        }
    };

    let mut file = File::create(path)?;
    file.write_all(content.as_bytes())?;
    Ok(())
}

/// 打印单条发现
pub fn print_finding(out: &EnumOutput) {
    let ips: Vec<String> = out.addresses.iter().map(|a| a.ip.clone()).collect();
    if ips.is_empty() {
        println!("{}", out.name);
    } else {
        println!("{:<40} {}", out.name, ips.join(","));
    }
}

/// 打印汇总统计
pub fn print_summary(outputs: &[EnumOutput]) {
    let mut unique_ips: HashSet<String> = HashSet::new();
    let mut asn_counts: HashMap<u32, (String, usize)> = HashMap::new();

    for out in outputs {
        for addr in &out.addresses {
            unique_ips.insert(addr.ip.clone());
            let entry = asn_counts
                .entry(addr.asn)
                .or_insert_with(|| (addr.description.clone(), 0));
            entry.1 += 1;
        }
    }

    println!("\n{}", "=".repeat(60));
    println!("Discovered names: {}", outputs.len());
    println!("Unique addresses: {}", unique_ips.len());

    if !asn_counts.is_empty() {
        println!("\nASN distribution:");
        let mut sorted: Vec<_> = asn_counts.iter().collect();
        sorted.sort_by(|a, b| b.1 .1.cmp(&a.1 .1));
        for (asn, (desc, count)) in sorted {
            if *asn == 0 {
                continue;
            }
            println!("  AS{:<8} {:<30} {} addrs", asn, desc, count);
        }
    }
    println!("{}", "=".repeat(60));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::OutputAddress;
    use crate::model::Tag;

    fn sample() -> Vec<EnumOutput> {
        vec![EnumOutput {
            name: "www.example.com".to_string(),
            domain: "example.com".to_string(),
            addresses: vec![OutputAddress {
                ip: "1.2.3.4".to_string(),
                cidr: "1.2.3.0/24".to_string(),
                asn: 64512,
                description: "TEST-AS".to_string(),
            }],
            tag: Tag::Dns,
            sources: vec!["DNS".to_string()],
        }]
    }

    #[test]
    fn json_roundtrip() {
        let dir = std::env::temp_dir().join("rsurface_json_test.json");
        let path = dir.to_str().unwrap();
        export_results(&sample(), &OutputFormat::Json, path).unwrap();

        let content = std::fs::read_to_string(path).unwrap();
        let parsed: ExportData = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed.findings.len(), 1);
        assert_eq!(parsed.findings[0].name, "www.example.com");
        assert_eq!(parsed.findings[0].addresses[0].asn, 64512);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn csv_has_header_and_rows() {
        let dir = std::env::temp_dir().join("rsurface_csv_test.csv");
        let path = dir.to_str().unwrap();
        export_results(&sample(), &OutputFormat::Csv, path).unwrap();

        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert!(lines[0].starts_with("name,domain,tag"));
        assert!(lines[1].contains("www.example.com"));
        assert!(lines[1].contains("64512"));
        let _ = std::fs::remove_file(path);
    }
}
