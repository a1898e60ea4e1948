use gemino::config::Config;
use gemino::Proxy;
use tracing::{error, info};
use tracing_subscriber::{self, filter::LevelFilter, EnvFilter};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const LOGO: &str = r#"
   ____ ____ _  _ _ _  _ ____
   | __ |___ |\/| | |\ | |  |
   |__] |___ |  | | | \| |__|
"#;

/// Command line arguments structure
struct CliArgs {
    config_path: Option<String>,
    listen: Option<String>,
    show_help: bool,
    show_version: bool,
}

fn print_help() {
    println!("{}", LOGO);
    println!(
        "Gemino v{} - dual-write proxy for the Cassandra native protocol",
        VERSION
    );
    println!();
    println!("USAGE:");
    println!("    gemino [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -c, --config <FILE>      Path to configuration file (TOML format)");
    println!("    -l, --listen <ADDRESS>   Bind address (default: 127.0.0.1:9042)");
    println!("    -h, --help               Print help information");
    println!("    -v, --version            Print version information");
    println!();
    println!("EXAMPLES:");
    println!("    # Start with a configuration file");
    println!("    gemino --config gemino.toml");
    println!();
    println!("    # Start with defaults, overriding the listen address");
    println!("    gemino -l 0.0.0.0:9042");
    println!();
    println!("CONFIGURATION FILE:");
    println!("    [proxy]");
    println!("    listen_address = \"127.0.0.1:9042\"");
    println!("    forward_reads_to_target = false");
    println!("    prepared_cache_max = 10000");
    println!("    request_timeout_ms = 10000");
    println!();
    println!("    [origin]");
    println!("    address = \"127.0.0.1:9043\"");
    println!();
    println!("    [target]");
    println!("    address = \"127.0.0.1:9044\"");
    println!();
    println!("    [heartbeat]");
    println!("    retry_interval_min_ms = 250");
    println!("    retry_interval_max_ms = 30000");
    println!("    retry_backoff_factor = 2.0");
    println!("    failure_threshold = 8");
    println!();
    println!("    [logging]");
    println!("    level = \"info\"       # trace, debug, info, warn, error");
}

fn print_version() {
    println!("gemino {}", VERSION);
}

/// Parse command line arguments
fn parse_args() -> CliArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut cli = CliArgs {
        config_path: None,
        listen: None,
        show_help: false,
        show_version: false,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                cli.show_help = true;
                return cli;
            }
            "-v" | "--version" => {
                cli.show_version = true;
                return cli;
            }
            "-c" | "--config" => {
                if i + 1 < args.len() {
                    cli.config_path = Some(args[i + 1].clone());
                    i += 1;
                } else {
                    eprintln!("Error: {} requires a file path argument", args[i]);
                    std::process::exit(1);
                }
            }
            "-l" | "--listen" => {
                if i + 1 < args.len() {
                    cli.listen = Some(args[i + 1].clone());
                    i += 1;
                } else {
                    eprintln!("Error: {} requires an address argument", args[i]);
                    std::process::exit(1);
                }
            }
            arg => {
                eprintln!("Error: Unknown option '{}'. Use --help for usage.", arg);
                std::process::exit(1);
            }
        }
        i += 1;
    }

    cli
}

/// Load configuration from file and merge with CLI arguments
fn load_config(cli: &CliArgs) -> Config {
    let mut config = match cli.config_path {
        Some(ref path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{}", e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    // CLI arguments override the config file
    if let Some(ref listen) = cli.listen {
        config.proxy.listen_address = listen.clone();
    }

    config
}

#[tokio::main]
async fn main() {
    let cli = parse_args();

    if cli.show_help {
        print_help();
        return;
    }
    if cli.show_version {
        print_version();
        return;
    }

    let config = load_config(&cli);

    // Initialize logging with the configured level
    let level_filter = config
        .logging
        .level
        .to_lowercase()
        .parse::<LevelFilter>()
        .unwrap_or_else(|_| {
            eprintln!(
                "Warning: Invalid log level '{}', using 'info'",
                config.logging.level
            );
            LevelFilter::INFO
        });
    let filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(filter)
        .init();

    println!("{}", LOGO);
    println!(
        "Gemino v{} - dual-write proxy for the Cassandra native protocol",
        VERSION
    );
    println!();

    let proxy = Proxy::new(config);

    // Ctrl-C cascades shutdown through every session.
    let shutdown = proxy.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    if let Err(e) = proxy.run().await {
        error!("proxy error: {}", e);
        std::process::exit(1);
    }
}
