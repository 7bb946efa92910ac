use cidr_allocator::config::Config;
use cidr_allocator::output::{cidrs_json, print_cidrs, print_records};
use cidr_allocator::registry::FileRegistry;
use cidr_allocator::request::{FlagRequest, ListRequest, ReserveRequest, UsedRequest};
use cidr_allocator::store::JsonFileStore;
use cidr_allocator::{AllocationError, AllocationService};
use clap::{Parser, Subcommand};
use colored::Colorize;
use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::config::{Appender, Root};
use log4rs::encode::pattern::PatternEncoder;
use std::error::Error;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(
    name = "cidr-allocator",
    version,
    about = "Allocate non-overlapping CIDR blocks per region"
)]
struct Cli {
    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reserve the next free block
    Reserve {
        region: String,
        cloud: String,
        /// Prefix length, "/24" or "24"
        #[arg(long)]
        size: Option<String>,
        #[arg(long)]
        account_alias: Option<String>,
    },
    /// List available blocks, or used blocks with --locked true
    List {
        region: String,
        cloud: String,
        #[arg(long)]
        size: Option<String>,
        #[arg(long)]
        locked: Option<String>,
        #[arg(long)]
        assigned: Option<String>,
    },
    /// Show the records in use
    Used {
        region: String,
        cloud: String,
        #[arg(long)]
        locked: Option<String>,
        #[arg(long)]
        assigned: Option<String>,
    },
    /// Set or clear the assigned flag of a reserved block
    Flag {
        region: String,
        cloud: String,
        /// CIDR block, may be percent-encoded
        cidr: String,
        #[arg(long)]
        assigned: Option<String>,
    },
}

fn init_logging() {
    if let Err(e) = log4rs::init_file("log4rs.yml", Default::default()) {
        // No config file: warnings and errors to stderr
        let stderr = ConsoleAppender::builder()
            .target(Target::Stderr)
            .encoder(Box::new(PatternEncoder::new("{d(%H:%M:%S)} {h({l:5})} {t} - {m}{n}")))
            .build();
        let config = log4rs::config::Config::builder()
            .appender(Appender::builder().build("stderr", Box::new(stderr)))
            .build(Root::builder().appender("stderr").build(LevelFilter::Warn));
        match config {
            Ok(config) => {
                if log4rs::init_config(config).is_ok() {
                    log::debug!("log4rs.yml not loaded ({e}), logging to stderr");
                }
            }
            Err(errs) => eprintln!("Error initializing logging: {errs}"),
        }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> cidr_allocator::Result<String> {
    serde_json::to_string(value).map_err(|e| AllocationError::Unexpected(e.to_string()))
}

async fn run(cli: &Cli, config: &Config, service: &AllocationService) -> cidr_allocator::Result<()> {
    let range = &config.prefix_range;
    match &cli.command {
        Command::Reserve {
            region,
            cloud,
            size,
            account_alias,
        } => {
            let req = ReserveRequest::parse(
                range,
                region,
                cloud,
                size.as_deref(),
                account_alias.as_deref(),
            )?;
            let record = service.reserve_request(&req).await?;
            if cli.json {
                println!("{}", to_json(&record)?);
            } else {
                print_records(&[record]);
            }
        }
        Command::List {
            region,
            cloud,
            size,
            locked,
            assigned,
        } => {
            let req = ListRequest::parse(
                range,
                region,
                cloud,
                size.as_deref(),
                locked.as_deref(),
                assigned.as_deref(),
            )?;
            let cidrs = service.list(&req).await?;
            if cli.json {
                let body =
                    cidrs_json(&cidrs).map_err(|e| AllocationError::Unexpected(e.to_string()))?;
                println!("{body}");
            } else {
                print_cidrs(&cidrs);
            }
        }
        Command::Used {
            region,
            cloud,
            locked,
            assigned,
        } => {
            let req = UsedRequest::parse(region, cloud, locked.as_deref(), assigned.as_deref())?;
            let records = service.used(&req).await?;
            if cli.json {
                println!("{}", to_json(&records)?);
            } else {
                print_records(&records);
            }
        }
        Command::Flag {
            region,
            cloud,
            cidr,
            assigned,
        } => {
            let req = FlagRequest::parse(region, cloud, cidr, assigned.as_deref())?;
            let record = service.flag(&req).await?;
            if cli.json {
                println!("{}", to_json(&record)?);
            } else {
                print_records(&[record]);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Do as little as possible in main.rs as it can't contain any tests
    init_logging();
    dotenv::dotenv().ok();
    log::info!("#Start main()");

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let store = Arc::new(JsonFileStore::open(&config.cidr_table).with_page_size(config.page_size));
    let registry = Arc::new(FileRegistry::open(&config.region_registry));
    let service = AllocationService::new(store, registry, config.lock.clone());

    if let Err(e) = run(&cli, &config, &service).await {
        log::error!("Error: {e}");
        if cli.json {
            println!(
                "{}",
                serde_json::json!({ "statusCode": e.status_code(), "body": e.to_string() })
            );
        } else {
            eprintln!("{} {e}", "ERROR".on_red());
        }
        std::process::exit(e.exit_code());
    }

    Ok(())
}
