//! stegomux binary.
//!
//! Usage: stegomux <mode> <up_address> (<down_address> <steg>)...
//!
//! Modes:
//!   client   listen for the application upstream, dial cover endpoints
//!   socks    like client behind a SOCKS front-end (not built here)
//!   server   listen on cover endpoints, dial the real upstream

use std::env;

use stegomux::{net, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing; respects RUST_LOG (e.g. RUST_LOG=debug)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().skip(1).collect();

    if args.is_empty() || matches!(args[0].as_str(), "-h" | "--help") {
        print_usage();
        return Ok(());
    }

    let config = match Config::parse(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("stegomux: {e}");
            eprintln!("{}", Config::usage());
            std::process::exit(1);
        }
    };

    tracing::info!(
        mode = %config.mode,
        up = %config.up_address,
        downstreams = config.downstreams.len(),
        "starting"
    );

    net::run(config).await?;
    Ok(())
}

fn print_usage() {
    println!(
        r#"stegomux - steganographic multiplexing transport

USAGE:
    {}

The shared passphrase is read from the STEGOMUX_PASSPHRASE environment
variable; it is never accepted on the command line. Press Ctrl-C once for
a graceful shutdown, twice to tear circuits down immediately.
"#,
        Config::usage()
    );
}
