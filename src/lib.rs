//! # rsurface
//!
//! 一个基于Rust实现的DNS攻击面深度枚举库。
//!
//! ## 特性
//!
//! - 🚀 **高吞吐解析**: 多上游解析器池，按优先级调度与重试
//! - 🔍 **被动情报**: 证书透明度、被动DNS、历史存档等多个数据源
//! - 🕸️ **主动探测**: 区域传送、反向DNS扫描、SRV服务名与证书挖掘
//! - 🎯 **泛解析识别**: 区分静态与动态泛解析，过滤合成应答
//! - 📊 **结果关联**: 名称/地址/ASN在内存图中互相关联，多格式导出
//!
//! ## 快速开始
//!
//! ```rust,no_run
//! use rsurface::{Config, Enumeration};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), String> {
//!     let mut config = Config::default();
//!     config.add_domain("example.com");
//!
//!     let enumeration = Enumeration::new(config)?;
//!     enumeration.start().await?;
//!
//!     for finding in enumeration.output() {
//!         println!("{}", finding.name);
//!     }
//!     Ok(())
//! }
//! ```

// 内部模块
pub mod logger;
pub mod queue;
pub mod filter;
pub mod bus;
pub mod model;
pub mod config;
pub mod netutil;
pub mod resolver;
pub mod pool;
pub mod wildcard;
pub mod service;
pub mod sources;
pub mod cache;
pub mod graph;
pub mod managers;
pub mod address;
pub mod cert;
pub mod dnssrv;
pub mod engine;
pub mod input;
pub mod output;

// 重新导出主要的公共API
pub use config::Config;
pub use engine::Enumeration;
pub use graph::{EnumOutput, Graph, OutputAddress};
pub use model::{AddrRequest, AsnRequest, DnsAnswer, DnsRequest, Priority, Tag};
pub use pool::ResolverPool;
pub use resolver::{BaseResolver, ResolveError, Resolver, ResolverStats};
pub use wildcard::WildcardType;

// 其他有用的类型
pub use bus::{BusEvent, EventBus, Topic};
pub use filter::{BloomFilter, Filter, StringFilter};
pub use input::{Opts, OutputFormat};
pub use output::export_results;
pub use queue::PriorityQueue;
pub use service::{DataSource, EnumContext, SourceHandle};
