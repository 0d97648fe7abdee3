//! # imrpc CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Serve the demo Echo service
//! imrpc serve -b 127.0.0.1:7000
//!
//! # Two-way call (prints the JSON result)
//! imrpc call Echo Echo -a 127.0.0.1:7000 --args '{"hello": "world"}'
//!
//! # One-way call with a deadline
//! imrpc call Echo Count -a 127.0.0.1:7000 --oneway --timeout-ms 500
//!
//! # Route by group across several servers
//! imrpc call Echo Echo -a 127.0.0.1:7000@A -a 127.0.0.1:7001@B --group A --args '1'
//! ```
//!
//! Arguments and results are JSON.

use std::time::Duration;

use anyhow::{anyhow, Result};
use argh::FromArgs;

use imrpc_cli::call::{parse_endpoint, CallPlan};
use imrpc_cli::demo;
use imrpc_common::rate_limit::RateLimitConfig;
use imrpc_server::{Server, ServerConfig};

#[derive(FromArgs)]
/// imrpc - lightweight binary RPC
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Call(CallArgs),
}

/// Arguments for `imrpc serve`.
#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// serve the demo Echo service
struct ServeArgs {
    /// address to bind to
    #[argh(option, short = 'b', default = "\"127.0.0.1:7000\".into()")]
    bind: String,

    /// optional per-peer rate limit in requests per second
    ///
    /// Burst size is twice the rate.
    #[argh(option, long = "rate-limit-rps")]
    rate_limit_rps: Option<f64>,

    /// count requests in fixed windows of this many milliseconds instead of
    /// refilling a token bucket
    #[argh(option, long = "rate-limit-window-ms")]
    rate_limit_window_ms: Option<u64>,

    /// maximum accepted frame size in bytes
    #[argh(option, long = "max-frame-size")]
    max_frame_size: Option<usize>,
}

/// Arguments for `imrpc call`.
#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// call a method and print the JSON result
struct CallArgs {
    /// service name
    #[argh(positional)]
    service: String,

    /// method name
    #[argh(positional)]
    method: String,

    /// server address as host:port[@group][*weight]; repeat for several servers
    #[argh(option, short = 'a', long = "addr")]
    addrs: Vec<String>,

    /// JSON argument
    #[argh(option, long = "args", default = "\"null\".into()")]
    args: String,

    /// call deadline in milliseconds
    #[argh(option, long = "timeout-ms")]
    timeout_ms: Option<u64>,

    /// fire and forget
    #[argh(switch, long = "oneway")]
    oneway: bool,

    /// payload compressor: none or gzip
    #[argh(option, long = "compress", default = "\"none\".into()")]
    compress: String,

    /// only route to servers of this group
    #[argh(option, long = "group")]
    group: Option<String>,

    /// use weighted round robin instead of round robin
    #[argh(switch, long = "weighted")]
    weighted: bool,

    /// call every server and print one line per answer
    #[argh(switch, long = "broadcast")]
    broadcast: bool,
}

impl CallArgs {
    fn into_plan(self) -> Result<CallPlan> {
        if self.timeout_ms == Some(0) {
            return Err(anyhow!("--timeout-ms must be positive"));
        }
        let endpoints = self
            .addrs
            .iter()
            .map(|raw| parse_endpoint(raw))
            .collect::<Result<Vec<_>>>()?;
        Ok(CallPlan {
            service: self.service,
            method: self.method,
            endpoints,
            args: self.args,
            timeout: self.timeout_ms.map(Duration::from_millis),
            oneway: self.oneway,
            compressor: self.compress,
            group: self.group,
            weighted: self.weighted,
            broadcast: self.broadcast,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Keep `call` output clean for piping
    if matches!(cli.command, Commands::Serve(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Call(args) => {
            for line in args.into_plan()?.run().await? {
                println!("{}", line);
            }
            Ok(())
        }
    }
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let mut config = ServerConfig::default();
    if let Some(rps) = args.rate_limit_rps {
        let limit = match args.rate_limit_window_ms {
            Some(millis) => {
                let window = Duration::from_millis(millis);
                let per_window = (rps * window.as_secs_f64()).ceil().max(1.0) as u32;
                tracing::info!("Rate limiting enabled: {} requests per {}ms window", per_window, millis);
                RateLimitConfig::fixed_window(per_window, window)
            }
            None => {
                tracing::info!("Rate limiting enabled: {} requests per second", rps);
                RateLimitConfig::per_second(rps)
            }
        };
        config = config.with_rate_limit(limit);
    } else if args.rate_limit_window_ms.is_some() {
        return Err(anyhow!("--rate-limit-window-ms needs --rate-limit-rps"));
    }
    if let Some(max) = args.max_frame_size {
        config = config.with_max_frame_size(max);
    }

    let server = Server::new(config).with_service(demo::echo_service());
    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received interrupt, shutting down");
            shutdown.cancel();
        }
    });

    server.run(&args.bind).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_serve_defaults() {
        let args: Cli = Cli::from_args(&["imrpc"], &["serve"]).unwrap();
        match args.command {
            Commands::Serve(ServeArgs {
                bind,
                rate_limit_rps,
                rate_limit_window_ms,
                max_frame_size,
            }) => {
                assert_eq!(bind, "127.0.0.1:7000");
                assert!(rate_limit_rps.is_none());
                assert!(rate_limit_window_ms.is_none());
                assert!(max_frame_size.is_none());
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_cli_parse_serve_with_rate_limit() {
        let args: Cli = Cli::from_args(
            &["imrpc"],
            &[
                "serve", "-b", "0.0.0.0:9001",
                "--rate-limit-rps", "50",
                "--rate-limit-window-ms", "200",
            ],
        )
        .unwrap();
        match args.command {
            Commands::Serve(ServeArgs {
                bind,
                rate_limit_rps,
                rate_limit_window_ms,
                ..
            }) => {
                assert_eq!(bind, "0.0.0.0:9001");
                assert_eq!(rate_limit_rps, Some(50.0));
                assert_eq!(rate_limit_window_ms, Some(200));
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_cli_parse_call() {
        let args: Cli = Cli::from_args(
            &["imrpc"],
            &["call", "Echo", "Echo", "-a", "127.0.0.1:7000"],
        )
        .unwrap();
        match args.command {
            Commands::Call(call) => {
                assert_eq!(call.service, "Echo");
                assert_eq!(call.method, "Echo");
                assert_eq!(call.addrs, vec!["127.0.0.1:7000".to_string()]);
                assert_eq!(call.args, "null");
                assert_eq!(call.compress, "none");
                assert!(!call.oneway);
                assert!(!call.broadcast);
            }
            _ => panic!("Expected Call command"),
        }
    }

    #[test]
    fn test_cli_parse_call_routing_flags() {
        let args: Cli = Cli::from_args(
            &["imrpc"],
            &[
                "call", "Echo", "Count",
                "--addr", "127.0.0.1:7000@A*2",
                "--addr", "127.0.0.1:7001@B",
                "--group", "A",
                "--weighted",
                "--oneway",
                "--timeout-ms", "250",
                "--compress", "gzip",
            ],
        )
        .unwrap();
        let Commands::Call(call) = args.command else {
            panic!("Expected Call command");
        };
        let plan = call.into_plan().unwrap();
        assert_eq!(plan.endpoints.len(), 2);
        assert_eq!(plan.endpoints[0].weight, 2);
        assert_eq!(plan.group.as_deref(), Some("A"));
        assert_eq!(plan.timeout, Some(Duration::from_millis(250)));
        assert!(plan.weighted && plan.oneway);
        assert_eq!(plan.compressor, "gzip");
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let args: Cli = Cli::from_args(
            &["imrpc"],
            &["call", "Echo", "Echo", "-a", "127.0.0.1:7000", "--timeout-ms", "0"],
        )
        .unwrap();
        let Commands::Call(call) = args.command else {
            panic!("Expected Call command");
        };
        assert!(call.into_plan().is_err());
    }
}
