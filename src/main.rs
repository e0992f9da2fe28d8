use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "gemini-relay")]
#[command(about = "Discord bot that relays conversations to Gemini", long_about = None)]
struct Args {
    /// Verbose output (-v, -vv, -vvv)
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// Health listener port (overrides PORT)
    #[arg(long = "port")]
    port: Option<u16>,
}

fn main() {
    let args = Args::parse();

    let verbosity = if args.verbose > 3 { 3 } else { args.verbose };

    use gemini_relay::config::{BotConfig, Config};
    Config::ensure_log_directory().ok();
    gemini_relay::init_tracing(verbosity, Some(Config::log_file_path()));

    // Missing credentials are fatal before anything connects.
    let mut config = match BotConfig::load() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Configuration error: {}", e);
            eprintln!("gemini-relay: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(port) = args.port {
        config.port = port;
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("Failed to create tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(gemini_relay::run(config)) {
        tracing::error!("gemini-relay stopped: {:#}", e);
        std::process::exit(1);
    }
}
