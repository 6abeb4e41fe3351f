pub mod rlogger;

pub use rlogger::init_logger;
