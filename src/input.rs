use clap::Parser;

/// 输出格式枚举
#[derive(Debug, Clone)]
pub enum OutputFormat {
    Json,
    Csv,
    Txt,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "csv" => Ok(OutputFormat::Csv),
            "txt" => Ok(OutputFormat::Txt),
            _ => Err(format!(
                "unsupported output format: {}. supported: json, csv, txt",
                s
            )),
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "rsurface")]
#[command(author = "gelenlen")]
#[command(version = "0.3.1")]
#[command(about = "In-depth DNS attack surface enumeration", long_about = None, arg_required_else_help = true)]
pub struct Opts {
    /// root domain names to enumerate
    #[arg(short, long)]
    pub domain: Vec<String>,

    /// upstream resolver addresses, built-in defaults when empty
    #[arg(short, long)]
    pub resolvers: Vec<String>,

    /// enable active techniques (zone transfers, cert grabbing)
    #[arg(short, long)]
    pub active: bool,

    /// passive mode, collect without resolving
    #[arg(short, long)]
    pub passive: bool,

    /// maximum number of concurrent DNS queries
    #[arg(long, default_value = "4000")]
    pub max_dns_queries: usize,

    /// subdomain names to exclude from the enumeration
    #[arg(short = 'b', long)]
    pub blacklist: Vec<String>,

    /// data source names to include (whitelist)
    #[arg(long)]
    pub include_sources: Vec<String>,

    /// data source names to exclude
    #[arg(long)]
    pub exclude_sources: Vec<String>,

    /// known subdomain names to seed the enumeration
    #[arg(short = 'n', long)]
    pub names: Vec<String>,

    /// ASNs to pre-load infrastructure data for
    #[arg(long)]
    pub asn: Vec<u32>,

    /// CIDR ranges considered in scope
    #[arg(long)]
    pub cidr: Vec<String>,

    /// number of minutes before the enumeration quits
    #[arg(short, long, default_value = "0")]
    pub timeout: u64,

    /// verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// output file path
    #[arg(short, long)]
    pub output: Option<String>,

    /// output format (json, csv, txt)
    #[arg(long, default_value = "json")]
    pub format: String,

    /// show summary statistics after the run
    #[arg(long)]
    pub summary: bool,

    /// silent mode, names only
    #[arg(short, long)]
    pub silent: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_parsing() {
        assert!(matches!("json".parse::<OutputFormat>(), Ok(OutputFormat::Json)));
        assert!(matches!("CSV".parse::<OutputFormat>(), Ok(OutputFormat::Csv)));
        assert!("xml".parse::<OutputFormat>().is_err());
    }
}
