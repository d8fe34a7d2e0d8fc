// Perp Grid Bot - CLI entry point

use std::sync::Arc;

use clap::{Parser, Subcommand};
use rand::{thread_rng, Rng};
use tokio::time::{sleep, Duration};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use perp_grid_bot::{Config, GridCoordinator, PaperExchange, TradingResult};

#[derive(Parser)]
#[command(name = "perp-grid")]
#[command(version = "0.3.0")]
#[command(about = "Grid reconciliation loop for derivatives exchanges", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a default configuration file
    Init,

    /// Validate the configuration and print the derived ladder parameters
    CheckConfig,

    /// Run the grid against the in-process paper exchange
    Run {
        /// Starting collateral for the simulated account
        #[arg(long, default_value_t = 10_000.0)]
        collateral: f64,

        /// Seconds between simulated price ticks
        #[arg(long, default_value_t = 1)]
        tick_secs: u64,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(err) = dispatch(cli).await {
        error!("{}", err);
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> TradingResult<()> {
    match cli.command {
        Commands::Init => {
            let config = Config::load_or_create(&cli.config)?;
            info!("Configuration ready for {}", config.grid.symbol);
            Ok(())
        }
        Commands::CheckConfig => {
            let config = Config::from_file(&cli.config)?;
            let planner = perp_grid_bot::GridPlanner::new(config.grid.clone());
            info!(
                "✅ {} valid: {} grids, interval {}, martingale multiplier x{:.2}",
                cli.config,
                config.grid.grid_count(),
                config.grid.grid_interval,
                planner.martingale_multiplier()
            );
            Ok(())
        }
        Commands::Run {
            collateral,
            tick_secs,
        } => run_paper(&cli.config, collateral, tick_secs).await,
    }
}

async fn run_paper(config_path: &str, collateral: f64, tick_secs: u64) -> TradingResult<()> {
    let config = Config::load_or_create(config_path)?;
    info!(
        "🚀 Starting paper grid for {} ({} grids)",
        config.grid.symbol,
        config.grid.grid_count()
    );

    let min_order = 10f64.powi(-(config.grid.quantity_precision as i32));
    let exchange = Arc::new(PaperExchange::new(collateral, min_order));

    // Random-walk price feed centred on the configured range
    let feed = Arc::clone(&exchange);
    let mid = (config.grid.lower_price + config.grid.upper_price) / 2.0;
    let step = config.grid.grid_interval;
    tokio::spawn(async move {
        let mut price = mid;
        loop {
            feed.tick(price);
            let drift: f64 = thread_rng().gen_range(-1.0..1.0);
            price = (price + drift * step).max(step);
            sleep(Duration::from_secs(tick_secs)).await;
        }
    });

    let mut coordinator = GridCoordinator::new(config, exchange).await?;
    coordinator.run().await
}
