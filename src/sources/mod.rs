//! 内置的被动数据源

use std::sync::Arc;
use std::time::Duration;

use crate::service::DataSource;

pub mod archive;
pub mod crtsh;
pub mod hackertarget;
pub mod robtex;

pub use archive::Wayback;
pub use crtsh::Crtsh;
pub use hackertarget::HackerTarget;
pub use robtex::Robtex;

/// 数据源访问外部接口的统一超时
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(20);

/// 构造一个数据源通用的HTTP客户端
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .user_agent("Mozilla/5.0 (compatible; rsurface)")
        .build()
        .unwrap_or_default()
}

/// 返回全部内置数据源
pub fn all_sources() -> Vec<Arc<dyn DataSource>> {
    vec![
        Arc::new(Crtsh::new()),
        Arc::new(HackerTarget::new()),
        Arc::new(Robtex::new()),
        Arc::new(Wayback::new()),
    ]
}
