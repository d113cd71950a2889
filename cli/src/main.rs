//! keyindex CLI — drive an in-memory index and watch the ordered event stream.
//!
//! # Commands
//! ```text
//! keyindex demo   --keys 12 --delivery reverse [--strategy poll]
//! keyindex window --keys 10 --limit 3 --append 2
//! keyindex info
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use keyindex_core::config::DEFAULT_POLL_INTERVAL_MS;
use keyindex_core::WaitStrategy;

mod cmd_demo;
mod cmd_window;
mod logging;
mod output;

use cmd_demo::{DemoArgs, Delivery};
use cmd_window::WindowArgs;
use logging::{init_tracing, LogConfig};

#[derive(Parser)]
#[command(
    name = "keyindex",
    about = "Order-preserving index reconciliation — keyindex CLI",
    long_about = "
keyindex CLI: run the index engine against in-memory stores and print the
notifications it delivers.

ENVIRONMENT VARIABLES:
  RUST_LOG    Overrides the log filter built from -v / --log-json
",
    version
)]
struct Cli {
    /// More engine logging on stderr (-v lifecycle, -vv per key)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Strategy {
    Signal,
    Poll,
}

impl From<Strategy> for WaitStrategy {
    fn from(s: Strategy) -> Self {
        match s {
            Strategy::Signal => WaitStrategy::Signal,
            Strategy::Poll => WaitStrategy::Poll,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Index keys, write their records out of order, print the ordered stream
    Demo {
        /// Number of keys to index
        #[arg(long, default_value_t = 8)]
        keys: usize,
        /// Order in which records are written
        #[arg(long, value_enum, default_value = "reverse")]
        delivery: Delivery,
        /// How a deferred `added` waits for its predecessor
        #[arg(long, value_enum, default_value = "signal")]
        strategy: Strategy,
        /// Re-check interval for the poll strategy
        #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL_MS)]
        poll_interval_ms: u64,
        /// Pause between record writes
        #[arg(long, default_value_t = 0)]
        write_delay_ms: u64,
        /// Print notifications as JSON
        #[arg(long)]
        json: bool,
    },

    /// Watch a start/end/limit view of a seeded index
    Window {
        /// Keys seeded before the view subscribes (orders 0..keys)
        #[arg(long, default_value_t = 10)]
        keys: usize,
        /// Lower order bound
        #[arg(long)]
        start: Option<f64>,
        /// Upper order bound
        #[arg(long)]
        end: Option<f64>,
        /// Maximum entries in view
        #[arg(long)]
        limit: Option<usize>,
        /// Keys appended after the initial stream
        #[arg(long, default_value_t = 2)]
        append: usize,
        /// Print notifications as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show engine defaults and capabilities
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&LogConfig::from_verbosity(cli.verbose, cli.log_json));

    match cli.command {
        Commands::Demo {
            keys,
            delivery,
            strategy,
            poll_interval_ms,
            write_delay_ms,
            json,
        } => {
            cmd_demo::run(DemoArgs {
                keys,
                delivery,
                strategy: strategy.into(),
                poll_interval_ms,
                write_delay_ms,
                json,
            })
            .await
        }

        Commands::Window {
            keys,
            start,
            end,
            limit,
            append,
            json,
        } => {
            cmd_window::run(WindowArgs {
                keys,
                start,
                end,
                limit,
                append,
                json,
            })
            .await
        }

        Commands::Info => cmd_info(),
    }
}

fn cmd_info() -> Result<()> {
    let defaults = keyindex_core::EngineConfig::default();
    println!("keyindex v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Events:              added, changed, removed, moved");
    println!("                     (child_added, child_changed, ... also accepted)");
    println!("Default wait:        {:?}", defaults.wait_strategy);
    println!("Poll interval:       {} ms", defaults.poll_interval_ms);
    println!("Views:               start_at, end_at, limit (read-only, chainable)");
    println!("Bundled stores:      MemoryIndexStore, MemoryRecordStore");
    Ok(())
}
