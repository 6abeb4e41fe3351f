use log::LevelFilter;
use simplelog::{Config, SimpleLogger};

/// 初始化日志后端
pub fn init_logger(verbose: bool) {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let _ = SimpleLogger::init(level, Config::default());
}
