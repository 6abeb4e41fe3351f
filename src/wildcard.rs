use std::collections::{HashMap, HashSet};
use std::sync::Weak;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use trust_dns_proto::rr::RecordType;

use crate::model::{DnsAnswer, DnsRequest, Priority};
use crate::pool::ResolverPool;

/// DNS名称长度上限
pub const MAX_DNS_NAME_LEN: usize = 253;
/// 探测标签的长度范围
pub const MIN_LABEL_LEN: usize = 6;
pub const MAX_LABEL_LEN: usize = 24;
/// LDH字符集
pub const LDH_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789-";

/// 每个后缀的探测次数
pub const NUM_WILDCARD_TESTS: usize = 5;

/// 探测使用的记录类型
const WILDCARD_QUERY_TYPES: [RecordType; 3] =
    [RecordType::CNAME, RecordType::A, RecordType::AAAA];

/// 泛解析的分类结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WildcardType {
    /// 该后缀没有泛解析
    None,
    /// 泛解析返回固定记录集
    Static,
    /// 泛解析每次返回不同记录，一律不可信
    Dynamic,
}

#[derive(Debug, Clone)]
struct WildcardEntry {
    wtype: WildcardType,
    answers: Vec<DnsAnswer>,
    being_tested: bool,
}

/// 泛解析管理任务接收的消息
pub enum WildcardMsg {
    Fetch {
        sub: String,
        tx: oneshot::Sender<(WildcardType, Vec<DnsAnswer>)>,
    },
    TestResult {
        sub: String,
        wtype: WildcardType,
        answers: Vec<DnsAnswer>,
    },
    IpsAcrossLevels {
        req: DnsRequest,
        tx: oneshot::Sender<WildcardType>,
    },
}

/// 泛解析缓存的唯一持有者
///
/// 正在探测的后缀会把查询延后重投，避免并行发起相同的探测。
pub async fn manage_wildcards(
    pool: Weak<ResolverPool>,
    mut rx: mpsc::UnboundedReceiver<WildcardMsg>,
    self_tx: mpsc::UnboundedSender<WildcardMsg>,
) {
    let mut wildcards: HashMap<String, WildcardEntry> = HashMap::new();

    while let Some(msg) = rx.recv().await {
        match msg {
            WildcardMsg::Fetch { sub, tx } => match wildcards.get(&sub) {
                Some(entry) if !entry.being_tested => {
                    let _ = tx.send((entry.wtype, entry.answers.clone()));
                }
                Some(_) => {
                    resend_fetch(self_tx.clone(), sub, tx);
                }
                None => {
                    wildcards.insert(
                        sub.clone(),
                        WildcardEntry {
                            wtype: WildcardType::None,
                            answers: Vec::new(),
                            being_tested: true,
                        },
                    );
                    if let Some(pool) = pool.upgrade() {
                        tokio::spawn(wildcard_test(pool, sub.clone(), self_tx.clone()));
                    }
                    resend_fetch(self_tx.clone(), sub, tx);
                }
            },
            WildcardMsg::TestResult {
                sub,
                wtype,
                answers,
            } => {
                wildcards.insert(
                    sub,
                    WildcardEntry {
                        wtype,
                        answers,
                        being_tested: false,
                    },
                );
            }
            WildcardMsg::IpsAcrossLevels { req, tx } => {
                let _ = tx.send(ips_across_levels(&wildcards, &req));
            }
        }
    }
}

fn resend_fetch(
    self_tx: mpsc::UnboundedSender<WildcardMsg>,
    sub: String,
    tx: oneshot::Sender<(WildcardType, Vec<DnsAnswer>)>,
) {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs((NUM_WILDCARD_TESTS / 2) as u64)).await;
        let _ = self_tx.send(WildcardMsg::Fetch { sub, tx });
    });
}

fn record_data_set(answers: &[DnsAnswer]) -> HashSet<String> {
    answers
        .iter()
        .map(|a| a.data.trim_matches('.').to_string())
        .collect()
}

/// 跨层级检查: 三个及以上后缀都有相交的泛解析记录时按Static处理
fn ips_across_levels(wildcards: &HashMap<String, WildcardEntry>, req: &DnsRequest) -> WildcardType {
    if req.records.is_empty() {
        return WildcardType::None;
    }

    let base = req.domain.split('.').count();
    let labels: Vec<&str> = req.name.split('.').collect();
    if labels.len() <= base || labels.len() - base < 3 {
        return WildcardType::None;
    }

    let levels = labels.len() - base;
    let mut sets: Vec<HashSet<String>> = Vec::new();
    for i in 1..=levels {
        let sub = labels[i..].join(".");
        match wildcards.get(&sub) {
            Some(entry) if !entry.answers.is_empty() => {
                sets.push(record_data_set(&entry.answers));
            }
            _ => break,
        }
    }

    if sets.len() >= 3 {
        let mut common = sets[0].clone();
        for set in &sets[1..] {
            common = common.intersection(set).cloned().collect();
        }
        if !common.is_empty() {
            return WildcardType::Static;
        }
    }
    WildcardType::None
}

/// 用多个不可能存在的名称探测一个后缀
async fn wildcard_test(
    pool: std::sync::Arc<ResolverPool>,
    sub: String,
    self_tx: mpsc::UnboundedSender<WildcardMsg>,
) {
    let mut returned_records = false;
    let mut common: HashSet<String> = HashSet::new();
    let mut all_answers: Vec<DnsAnswer> = Vec::new();

    for i in 0..NUM_WILDCARD_TESTS {
        // 后缀过长时无法生成探测名，按无泛解析处理
        let name = match unlikely_name(&sub) {
            Some(n) => n,
            None => {
                let _ = self_tx.send(WildcardMsg::TestResult {
                    sub,
                    wtype: WildcardType::None,
                    answers: Vec::new(),
                });
                return;
            }
        };

        let mut probe_answers: Vec<DnsAnswer> = Vec::new();
        for qtype in WILDCARD_QUERY_TYPES {
            if let Ok(ans) = pool.resolve(&name, qtype, Priority::Critical).await {
                if !ans.is_empty() {
                    returned_records = true;
                    probe_answers.extend(ans);
                }
            }
        }

        let data = record_data_set(&probe_answers);
        if i == 0 {
            common = data;
        } else {
            common = common.intersection(&data).cloned().collect();
        }
        all_answers.extend(probe_answers);
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    // 所有探测共同出现的记录构成泛解析应答集
    let mut already: HashSet<String> = HashSet::new();
    let mut final_answers: Vec<DnsAnswer> = Vec::new();
    for mut a in all_answers {
        a.data = a.data.trim_matches('.').to_string();
        if common.contains(&a.data) && already.insert(a.data.clone()) {
            final_answers.push(a);
        }
    }

    let wtype = if !returned_records {
        WildcardType::None
    } else if final_answers.is_empty() {
        WildcardType::Dynamic
    } else {
        WildcardType::Static
    };

    if wtype != WildcardType::None {
        log::info!("DNS wildcard detected: *.{}: type {:?}", sub, wtype);
    }

    let _ = self_tx.send(WildcardMsg::TestResult {
        sub,
        wtype,
        answers: final_answers,
    });
}

/// 生成一个极不可能真实存在的名称
pub fn unlikely_name(sub: &str) -> Option<String> {
    let mut max_len = MAX_DNS_NAME_LEN.checked_sub(sub.len() + 1)?;
    if max_len > MAX_LABEL_LEN {
        max_len = MAX_LABEL_LEN;
    } else if max_len < MIN_LABEL_LEN {
        return None;
    }

    let mut rng = rand::thread_rng();
    let mut ldh: Vec<u8> = LDH_CHARS.to_vec();
    ldh.shuffle(&mut rng);

    let len = rng.gen_range(MIN_LABEL_LEN..=max_len);
    let label: String = (0..len)
        .map(|_| ldh[rng.gen_range(0..ldh.len())] as char)
        .collect();
    let label = label.trim_matches('-').to_string();
    if label.is_empty() {
        return None;
    }
    Some(format!("{}.{}", label, sub))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DnsRequest, Tag, TYPE_A};

    #[test]
    fn unlikely_name_shape() {
        for _ in 0..50 {
            let name = unlikely_name("example.com").unwrap();
            assert!(name.ends_with(".example.com"));
            let label = name.split('.').next().unwrap();
            assert!(label.len() <= MAX_LABEL_LEN);
            assert!(name.len() <= MAX_DNS_NAME_LEN);
            assert!(label
                .bytes()
                .all(|b| LDH_CHARS.contains(&b)));
            assert!(!label.starts_with('-') && !label.ends_with('-'));
        }
    }

    #[test]
    fn unlikely_name_rejects_overlong_suffix() {
        let long = format!("{}.example.com", "a".repeat(247));
        assert!(unlikely_name(&long).is_none());
    }

    fn entry(data: &[&str]) -> WildcardEntry {
        WildcardEntry {
            wtype: WildcardType::Static,
            answers: data
                .iter()
                .map(|d| DnsAnswer {
                    name: String::new(),
                    rtype: TYPE_A,
                    ttl: 0,
                    data: d.to_string(),
                })
                .collect(),
            being_tested: false,
        }
    }

    #[test]
    fn across_levels_requires_three_suffixes() {
        let mut map = HashMap::new();
        map.insert("a.b.c.example.com".to_string(), entry(&["1.2.3.4"]));
        map.insert("b.c.example.com".to_string(), entry(&["1.2.3.4"]));
        map.insert("c.example.com".to_string(), entry(&["1.2.3.4"]));

        let mut req = DnsRequest::new("x.a.b.c.example.com", "example.com", Tag::Api, "test");
        req.records.push(DnsAnswer {
            name: "x.a.b.c.example.com".to_string(),
            rtype: TYPE_A,
            ttl: 0,
            data: "1.2.3.4".to_string(),
        });

        assert_eq!(ips_across_levels(&map, &req), WildcardType::Static);

        // 不相交时不判定
        let mut map2 = HashMap::new();
        map2.insert("a.b.c.example.com".to_string(), entry(&["1.1.1.1"]));
        map2.insert("b.c.example.com".to_string(), entry(&["2.2.2.2"]));
        map2.insert("c.example.com".to_string(), entry(&["3.3.3.3"]));
        assert_eq!(ips_across_levels(&map2, &req), WildcardType::None);
    }

    #[test]
    fn across_levels_too_shallow() {
        let map = HashMap::new();
        let mut req = DnsRequest::new("x.example.com", "example.com", Tag::Api, "test");
        req.records.push(DnsAnswer {
            name: "x.example.com".to_string(),
            rtype: TYPE_A,
            ttl: 0,
            data: "1.2.3.4".to_string(),
        });
        assert_eq!(ips_across_levels(&map, &req), WildcardType::None);
    }
}
