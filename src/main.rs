use clap::Parser;

use rsurface::input::{Opts, OutputFormat};
use rsurface::logger::init_logger;
use rsurface::output::{export_results, print_finding, print_summary};
use rsurface::{Config, Enumeration};

#[tokio::main]
async fn main() {
    let opts = Opts::parse();

    if !opts.silent {
        init_logger(opts.verbose);
    }

    if let Err(e) = run_enumeration(opts).await {
        eprintln!("enumeration failed: {}", e);
        std::process::exit(1);
    }
}

async fn run_enumeration(opts: Opts) -> Result<(), String> {
    let format: OutputFormat = opts.format.parse()?;

    let mut config = Config::default();
    for domain in &opts.domain {
        config.add_domain(domain);
    }
    if !opts.resolvers.is_empty() {
        config.resolvers = opts.resolvers.clone();
    }
    config.active = opts.active;
    config.passive = opts.passive;
    config.max_dns_queries = opts.max_dns_queries;
    config.blacklist = opts.blacklist.clone();
    config.provided_names = opts.names.clone();
    config.asns = opts.asn.clone();
    config.timeout_mins = opts.timeout;
    config.verbose = opts.verbose;
    for cidr in &opts.cidr {
        match rsurface::netutil::parse_cidr(cidr) {
            Some(net) => config.cidrs.push(net),
            None => return Err(format!("invalid CIDR: {}", cidr)),
        }
    }
    if !opts.include_sources.is_empty() {
        config.source_filter.include = true;
        config.source_filter.sources = opts.include_sources.clone();
    } else if !opts.exclude_sources.is_empty() {
        config.source_filter.include = false;
        config.source_filter.sources = opts.exclude_sources.clone();
    }

    let enumeration = Enumeration::new(config)?;
    enumeration.start().await?;

    let findings = enumeration.output();
    for finding in &findings {
        if opts.silent {
            println!("{}", finding.name);
        } else {
            print_finding(finding);
        }
    }

    if opts.summary && !opts.silent {
        print_summary(&findings);
    }

    if let Some(path) = &opts.output {
        export_results(&findings, &format, path).map_err(|e| e.to_string())?;
        if !opts.silent {
            println!("results written to {}", path);
        }
    }

    Ok(())
}
