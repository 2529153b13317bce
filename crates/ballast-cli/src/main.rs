//! # Ballast CLI Entry Point
//!
//! Main binary for the ballast Layer-7 TCP load balancer.
//!
//! ## Usage
//!
//! ```bash
//! # Round-robin across two backends, weights 1 and 3
//! ballast serve -b 9000 -a wrr -n 10.0.0.1:9001 -n 10.0.0.2:9001=3
//!
//! # Maglev hashing with a custom table size
//! ballast serve -a maglev --maglev-table-size 257 -n 10.0.0.1:9001
//!
//! # Everything from a config file, overriding the port
//! ballast serve -c lb.json -b 9100
//!
//! # Validate a config file without starting
//! ballast check-config lb.json
//! ```
//!
//! ## Backend Format
//!
//! Backends are `ADDR` or `ADDR=WEIGHT` (e.g. `10.0.0.1:9001=3`). The
//! default weight is 1; weight 0 is legal but weighted algorithms will not
//! select such a backend.

use std::net::SocketAddr;

use anyhow::{bail, Context, Result};
use argh::FromArgs;
use ballast_common::{Algorithm, BackendSpec, ProxyConfig};
use ballast_proxy::engine::ProxyEngine;
use ballast_proxy::net::ProxyDriver;
use tracing::info;

/// ballast - a Layer-7 TCP load balancer
#[derive(FromArgs)]
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    CheckConfig(CheckConfigArgs),
}

/// run the load balancer
#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
struct ServeArgs {
    /// port to listen on (default 9000)
    #[argh(option, short = 'b', long = "bind")]
    bind: Option<u16>,

    /// selection algorithm: wrr, lr, random, ringhash, maglev, peakewma
    #[argh(option, short = 'a', long = "algorithm")]
    algorithm: Option<String>,

    /// backend as ADDR or ADDR=WEIGHT (repeatable)
    #[argh(option, short = 'n', long = "backend")]
    backends: Vec<String>,

    /// JSON config file; command-line flags win over its values
    #[argh(option, short = 'c', long = "config")]
    config: Option<String>,

    /// seed for the listener's PRNG
    #[argh(option, long = "seed")]
    seed: Option<u64>,

    /// least-request active request bias (>= 0)
    #[argh(option, long = "lr-bias")]
    lr_bias: Option<f64>,

    /// ring-hash minimum ring size
    #[argh(option, long = "ringhash-min")]
    ringhash_min: Option<u64>,

    /// ring-hash maximum ring size
    #[argh(option, long = "ringhash-max")]
    ringhash_max: Option<u64>,

    /// maglev lookup table size (ideally prime)
    #[argh(option, long = "maglev-table-size")]
    maglev_table_size: Option<u64>,

    /// peak-EWMA decay time in milliseconds (>= 1)
    #[argh(option, long = "peakewma-decay-ms")]
    peakewma_decay_ms: Option<u64>,
}

/// validate a configuration file and exit
#[derive(FromArgs)]
#[argh(subcommand, name = "check-config")]
struct CheckConfigArgs {
    /// path to the JSON config file
    #[argh(positional)]
    path: String,
}

/// Parses `ADDR` or `ADDR=WEIGHT` into a backend spec.
fn parse_backend_spec(spec: &str) -> Result<BackendSpec> {
    let (addr_part, weight) = match spec.rsplit_once('=') {
        Some((addr, weight)) => {
            let weight: u32 = weight
                .parse()
                .with_context(|| format!("Invalid backend weight in '{}'", spec))?;
            (addr, weight)
        }
        None => (spec, 1),
    };
    let address: SocketAddr = addr_part
        .parse()
        .with_context(|| format!("Invalid backend address '{}'", addr_part))?;
    Ok(BackendSpec { address, weight })
}

/// Builds the effective configuration: file first, flags on top.
fn build_config(args: &ServeArgs) -> Result<ProxyConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file '{}'", path))?;
            ProxyConfig::from_json(&text)?
        }
        None => ProxyConfig::default(),
    };

    if let Some(port) = args.bind {
        config.listen_port = port;
    }
    if let Some(name) = &args.algorithm {
        config.algorithm = name.parse::<Algorithm>()?;
    }
    if !args.backends.is_empty() {
        config.backends = args
            .backends
            .iter()
            .map(|s| parse_backend_spec(s))
            .collect::<Result<Vec<_>>>()?;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(bias) = args.lr_bias {
        config.lr.active_request_bias = bias;
    }
    if let Some(min) = args.ringhash_min {
        config.ringhash.min_ring_size = min;
    }
    if let Some(max) = args.ringhash_max {
        config.ringhash.max_ring_size = max;
    }
    if let Some(size) = args.maglev_table_size {
        config.maglev.table_size = size;
    }
    if let Some(ms) = args.peakewma_decay_ms {
        config.peakewma.decay_time_ms = ms;
    }

    if config.backends.is_empty() {
        bail!("No backends configured (use -n ADDR[=WEIGHT] or a config file)");
    }
    config.validate()?;
    Ok(config)
}

fn serve(args: ServeArgs) -> Result<()> {
    let config = build_config(&args)?;
    info!(
        port = config.listen_port,
        algorithm = config.algorithm.name(),
        backends = config.backends.len(),
        "Starting ballast"
    );

    let engine = ProxyEngine::new(config)?;
    let driver = ProxyDriver::new(engine);

    // One listener, one scheduler: the driver requires a current-thread
    // runtime with a LocalSet.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build runtime")?;
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, async move {
        let shutdown = async {
            let _ = tokio::signal::ctrl_c().await;
        };
        driver.run(shutdown).await
    })?;
    info!("Stopped");
    Ok(())
}

fn check_config(args: CheckConfigArgs) -> Result<()> {
    let text = std::fs::read_to_string(&args.path)
        .with_context(|| format!("Failed to read config file '{}'", args.path))?;
    let config = ProxyConfig::from_json(&text)?;
    config.validate()?;
    println!(
        "OK: port {}, algorithm {}, {} backend(s)",
        config.listen_port,
        config.algorithm.name(),
        config.backends.len()
    );
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli: Cli = argh::from_env();
    match cli.command {
        Commands::Serve(args) => serve(args),
        Commands::CheckConfig(args) => check_config(args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serve_args() -> ServeArgs {
        ServeArgs {
            bind: None,
            algorithm: None,
            backends: vec![],
            config: None,
            seed: None,
            lr_bias: None,
            ringhash_min: None,
            ringhash_max: None,
            maglev_table_size: None,
            peakewma_decay_ms: None,
        }
    }

    #[test]
    fn test_parse_backend_spec_default_weight() {
        let spec = parse_backend_spec("10.0.0.1:9001").unwrap();
        assert_eq!(spec.address, "10.0.0.1:9001".parse().unwrap());
        assert_eq!(spec.weight, 1);
    }

    #[test]
    fn test_parse_backend_spec_with_weight() {
        let spec = parse_backend_spec("10.0.0.1:9001=3").unwrap();
        assert_eq!(spec.weight, 3);
    }

    #[test]
    fn test_parse_backend_spec_zero_weight() {
        let spec = parse_backend_spec("10.0.0.1:9001=0").unwrap();
        assert_eq!(spec.weight, 0);
    }

    #[test]
    fn test_parse_backend_spec_rejects_garbage() {
        assert!(parse_backend_spec("not-an-address").is_err());
        assert!(parse_backend_spec("10.0.0.1:9001=heavy").is_err());
    }

    #[test]
    fn test_build_config_requires_backends() {
        let args = serve_args();
        assert!(build_config(&args).is_err());
    }

    #[test]
    fn test_build_config_flags() {
        let mut args = serve_args();
        args.bind = Some(8080);
        args.algorithm = Some("maglev".to_string());
        args.backends = vec!["10.0.0.1:9001".to_string(), "10.0.0.2:9001=2".to_string()];
        args.maglev_table_size = Some(257);
        args.seed = Some(42);

        let config = build_config(&args).unwrap();
        assert_eq!(config.listen_port, 8080);
        assert_eq!(config.algorithm, Algorithm::Maglev);
        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.backends[1].weight, 2);
        assert_eq!(config.maglev.table_size, 257);
        assert_eq!(config.seed, 42);
    }

    #[test]
    fn test_build_config_rejects_invalid_algorithm() {
        let mut args = serve_args();
        args.algorithm = Some("fastest".to_string());
        args.backends = vec!["10.0.0.1:9001".to_string()];
        assert!(build_config(&args).is_err());
    }

    #[test]
    fn test_build_config_rejects_invalid_tuning() {
        let mut args = serve_args();
        args.backends = vec!["10.0.0.1:9001".to_string()];
        args.lr_bias = Some(-1.0);
        assert!(build_config(&args).is_err());
    }
}
