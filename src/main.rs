//! Fundboard CLI
//!
//! Headless operator interface for a fund wallet session:
//! - Show account, balances and investor stats
//! - Make locked deposits and withdrawals
//! - Follow fund notifications
//! - Print historical performance

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use fundboard::chain::SimulatedChain;
use fundboard::*;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Account used by the simulated chain
const DEMO_ACCOUNT: &str = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed";

/// Fund manager assumed by `--simulate` when none is configured
const DEMO_FUND_MANAGER: &str = "0xf0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0";

/// Deposit token assumed by `--simulate` when none is configured
const DEMO_TOKEN: &str = "0x7070707070707070707070707070707070707070";

#[derive(Parser)]
#[command(name = "fundboard")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Wallet and contract session for an on-chain investment fund")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: search standard locations)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Run against an in-memory simulated chain instead of a node
    #[arg(long, global = true)]
    pub simulate: bool,

    /// Output format (table, json)
    #[arg(short, long, default_value = "table", global = true)]
    pub format: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Connect and show account, balances and investor stats
    Status,

    /// Make a locked deposit
    Deposit {
        /// Amount in whole tokens (e.g. 250 or 12.5)
        amount: String,
        /// Lock period in days: 30, 60, 90, 180 or 365
        #[arg(short, long, default_value = "30")]
        days: u64,
        /// Category: crypto, stocks, commodities, bonds
        #[arg(short = 'C', long, default_value = "crypto")]
        category: String,
    },

    /// Withdraw unlocked funds
    Withdraw {
        /// Amount in whole tokens
        amount: String,
    },

    /// Follow fund notifications until interrupted
    Watch,

    /// Show historical fund performance
    History {
        /// Window in days (default: from config)
        #[arg(short, long)]
        days: Option<u32>,
    },

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_with_env(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::load_default(),
    };
    init_logging(&config.logging);

    if let Commands::Config { output } = &cli.command {
        let template = generate_default_config();
        match output {
            Some(path) => {
                std::fs::write(path, template)
                    .with_context(|| format!("writing {}", path.display()))?;
                println!("Wrote default config to {}", path.display());
            }
            None => print!("{}", template),
        }
        return Ok(());
    }

    tracing::info!("Fundboard v{}", env!("CARGO_PKG_VERSION"));

    let session = open_session(&cli, &config)?;
    session.connect().await?;

    let result = run(&cli, &session).await;
    session.disconnect().await;
    result
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("fundboard={}", logging.level)));
    let registry = tracing_subscriber::registry().with(filter);

    if logging.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn open_session(cli: &Cli, config: &Config) -> anyhow::Result<WalletSession> {
    if !cli.simulate {
        config.validate()?;
        let wallet = JsonRpcWallet::new(config.rpc_config())?;
        tracing::info!(rpc_url = %config.network.rpc_url, "Using JSON-RPC wallet");
        return Ok(WalletSession::new(Arc::new(wallet), config.session_config()?));
    }

    let mut config = config.clone();
    config
        .contracts
        .fund_manager
        .get_or_insert_with(|| DEMO_FUND_MANAGER.to_string());
    config
        .contracts
        .token
        .get_or_insert_with(|| DEMO_TOKEN.to_string());

    let account = Address::parse(DEMO_ACCOUNT)?;
    tracing::info!(account = %account, "Using simulated chain");
    let chain = SimulatedChain::demo(&account);
    Ok(WalletSession::new(Arc::new(chain), config.session_config()?))
}

async fn run(cli: &Cli, session: &WalletSession) -> anyhow::Result<()> {
    let json = cli.format == "json";

    match &cli.command {
        Commands::Status => {
            let state = session.snapshot().await;
            let breakdown = session.category_breakdown().await?;

            if json {
                let body = serde_json::json!({
                    "session": state,
                    "categories": breakdown,
                });
                println!("{}", serde_json::to_string_pretty(&body)?);
            } else {
                print_status(&state, &breakdown);
            }
        }

        Commands::Deposit {
            amount,
            days,
            category,
        } => {
            let amount = parse_amount(amount)?;
            let category: InvestmentCategory = category.parse()?;
            let lock = parse_lock_days(*days)?;

            match session.create_locked_investment(amount, lock, category).await {
                Ok(receipt) => println!(
                    "Deposited {} into {} for {} ({})",
                    amount,
                    category.label(),
                    lock,
                    receipt.hash
                ),
                Err(e) if e.is_user_rejection() => bail!("Deposit cancelled in wallet"),
                Err(e) => return Err(e.into()),
            }
            print_ledger(session, json).await?;
        }

        Commands::Withdraw { amount } => {
            let amount = parse_amount(amount)?;

            match session.withdraw(amount).await {
                Ok(receipt) => println!("Withdrew {} ({})", amount, receipt.hash),
                Err(e) if e.is_user_rejection() => bail!("Withdrawal cancelled in wallet"),
                Err(e) => return Err(e.into()),
            }
            print_ledger(session, json).await?;
        }

        Commands::Watch => {
            if !session.is_following_events() {
                bail!("Contract events are not being delivered for this session");
            }
            let mut notifications = session.notifications();
            session.start_background_refresh();
            let account = session
                .account()
                .await
                .map(|a| a.short())
                .unwrap_or_else(|| "-".to_string());
            println!("Watching fund events for {}; press Ctrl-C to stop", account);

            loop {
                tokio::select! {
                    received = notifications.recv() => match received {
                        Ok(notification) if json => {
                            println!("{}", serde_json::to_string(&notification)?);
                        }
                        Ok(notification) => {
                            println!("[{}] {}", notification.title(), notification.message());
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::warn!(missed, "Notifications dropped");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }

                if !session.is_connected().await {
                    println!("Wallet disconnected");
                    break;
                }
            }
        }

        Commands::History { days } => {
            let points = session.historical_performance(*days).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&points)?);
            } else {
                for point in &points {
                    let date = chrono::DateTime::from_timestamp(point.timestamp as i64, 0)
                        .map(|dt| dt.format("%Y-%m-%d").to_string())
                        .unwrap_or_else(|| point.timestamp.to_string());
                    println!("{:<12} {:>24}", date, point.value);
                }
                println!("{} points", points.len());
            }
        }

        Commands::Config { .. } => {}
    }

    Ok(())
}

fn print_status(state: &SessionState, breakdown: &[CategorySummary]) {
    let account = state
        .account
        .as_ref()
        .map(|a| a.to_string())
        .unwrap_or_else(|| "-".to_string());
    let chain = state
        .chain_id
        .map(|c| c.to_string())
        .unwrap_or_else(|| "-".to_string());

    println!("Account:        {}", account);
    println!("Chain:          {}", chain);
    println!(
        "Balance:        {}{}",
        state.balance,
        if state.balance_stale { " (stale)" } else { "" }
    );
    if let Some(token_balance) = state.token_balance {
        println!("USDT balance:   {}", token_balance);
    }
    println!("Badge:          {}", state.badge_level.title());

    if let Some(stats) = &state.stats {
        println!("Invested:       {}", stats.total_invested);
        println!(
            "Current value:  {} ({:+.2}%)",
            stats.current_total,
            stats.total_change_percent()
        );
        println!("Realized:       {}", stats.realized_profit);
        println!("Fees paid:      {}", stats.total_fee_paid);
        println!("Investments:    {}", stats.investment_count);
    }

    if !breakdown.is_empty() {
        println!();
        for summary in breakdown {
            println!(
                "{:<18} {:>14.2} {:>+8.2}%  {}",
                summary.category.label(),
                summary.current_value,
                summary.change_percent,
                summary.category.description()
            );
        }
    }
}

async fn print_ledger(session: &WalletSession, json: bool) -> anyhow::Result<()> {
    let entries = session.ledger().list().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    for entry in entries {
        println!(
            "{} {:<8} {:>20} {:<9} {}",
            entry.created_at.format("%Y-%m-%d %H:%M:%S"),
            entry.kind,
            entry.amount,
            entry.status,
            entry
                .hash
                .as_ref()
                .map(|h| h.to_string())
                .or(entry.error.clone())
                .unwrap_or_default()
        );
    }
    Ok(())
}
