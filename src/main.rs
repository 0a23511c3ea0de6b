//! Strait - a multi-protocol traffic-forwarding tunnel

use std::path::PathBuf;

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use strait::app::Runtime;
use strait::config::Config;
use strait::error::Result;

fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        print_version();
        return Ok(());
    }

    if args.gen_config {
        let config = Config::default_client();
        println!("{}", serde_json::to_string_pretty(&config).unwrap());
        return Ok(());
    }

    // Load configuration first so the log level can come from it
    let config = if let Some(path) = &args.config {
        Config::load(path)?
    } else {
        Config::default_client()
    };

    let log_level = std::env::var("RUST_LOG")
        .ok()
        .or_else(|| Some(config.log.level.clone()))
        .and_then(|s| s.parse::<Level>().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("failed to set tracing subscriber");

    if args.config.is_none() {
        info!("no config file specified, using the default client config");
    }
    info!("Strait v{} starting", env!("CARGO_PKG_VERSION"));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let runtime = Runtime::from_config(config)?;
        runtime.run().await
    })?;

    info!("goodbye");
    Ok(())
}

/// Command line arguments
struct Args {
    config: Option<PathBuf>,
    gen_config: bool,
    version: bool,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut config = None;
        let mut gen_config = false;
        let mut version = false;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "-c" | "--config" => {
                    if i + 1 < args.len() {
                        config = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--gen-config" => gen_config = true,
                "-v" | "--version" => version = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                arg if !arg.starts_with('-') && config.is_none() => {
                    config = Some(PathBuf::from(arg));
                }
                _ => {}
            }
            i += 1;
        }

        Self {
            config,
            gen_config,
            version,
        }
    }
}

fn print_help() {
    println!(
        r#"Strait - a multi-protocol traffic-forwarding tunnel

USAGE:
    strait [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to configuration file
    --gen-config            Print an example client config
    -v, --version           Print version information
    -h, --help              Print help information

EXAMPLES:
    strait -c config.json
    strait --gen-config > config.json

MANAGEMENT API ENDPOINTS:
    GET  /proxies                  Registered proxies
    GET  /group/<name>/delay       URL-test a proxy group
    POST /cache/fakeip/flush       Flush the fake-IP table
    GET  /metrics                  Prometheus metrics
"#
    );
}

fn print_version() {
    println!("Strait v{}", env!("CARGO_PKG_VERSION"));
}
