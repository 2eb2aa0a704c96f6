//! riskgate CLI.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use riskgate::api::HttpExchangeConnector;
use riskgate::db::{Database, Store};
use riskgate::models::{RiskSettings, StopOrigin, TradeStatus, UserAccount};
use riskgate::service::{Inbound, Service};
use riskgate::trading::{EngineConfig, ExecutionEngine, RawPayload};

/// Risk-gated signal execution CLI.
#[derive(Parser)]
#[command(name = "riskgate")]
#[command(about = "Risk-gated execution of trading signals", long_about = None)]
struct Cli {
    /// Database URL (overrides RISKGATE_DATABASE_URL)
    #[arg(short, long)]
    database: Option<String>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or update a user account
    Account {
        user: String,

        /// JSON file with risk settings
        #[arg(short, long)]
        settings: Option<PathBuf>,

        /// Trade live through the exchange
        #[arg(long, conflicts_with = "paper")]
        live: bool,

        /// Simulate fills
        #[arg(long)]
        paper: bool,

        /// Capital used for sizing while paper trading
        #[arg(long)]
        paper_capital: Option<Decimal>,
    },

    /// Submit a signal (JSON object or KEY: value text; "-" reads stdin)
    Submit { user: String, payload: String },

    /// Confirm a fill, cancel or rejection for a pending trade
    Fill {
        trade_id: String,

        /// Executed price
        price: Decimal,

        #[arg(long, default_value = "0")]
        fees: Decimal,

        /// FILLED, CANCELLED or REJECTED
        #[arg(long, default_value = "FILLED")]
        status: String,
    },

    /// Show risk state, strategies and recent trades
    Status {
        user: String,

        /// Number of recent trades to show
        #[arg(short, long, default_value = "10")]
        trades: usize,
    },

    /// Engage the emergency stop for a user
    Stop {
        user: String,

        #[arg(short, long, default_value = "Stopped by user")]
        reason: String,

        /// Record the stop as admin-initiated
        #[arg(long)]
        admin: bool,
    },

    /// Clear the emergency stop for a user
    Resume { user: String },

    /// Apply the daily reset to all users
    ResetDay,

    /// Cancel live orders past the fill timeout
    Sweep,

    /// Process newline-delimited JSON envelopes from stdin with periodic maintenance
    Run,

    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = EngineConfig::from_env()?;
    if let Some(url) = cli.database {
        config.database_url = url;
    }

    if let Commands::Config = cli.command {
        print_config(&config);
        return Ok(());
    }

    let db = Arc::new(Database::new(&config.database_url).await?);
    let connector = Arc::new(HttpExchangeConnector::new(
        config.exchange_url.clone(),
        config.exchange_api_key.clone(),
        config.primary_quote(),
    )?);
    let engine = Arc::new(ExecutionEngine::new(config, db.clone(), connector));

    match cli.command {
        Commands::Account {
            user,
            settings,
            live,
            paper,
            paper_capital,
        } => {
            let mut account = db
                .load_account(&user)
                .await?
                .unwrap_or_else(|| UserAccount::new(user.clone()));

            if let Some(path) = settings {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                account.risk_settings = serde_json::from_str::<RiskSettings>(&raw)
                    .with_context(|| format!("Invalid risk settings in {}", path.display()))?;
            }
            if live {
                account.paper_trading_mode = false;
            }
            if paper {
                account.paper_trading_mode = true;
            }
            if let Some(capital) = paper_capital {
                account.paper_capital = capital;
            }

            let account = engine.save_account(account).await?;
            println!("{}", serde_json::to_string_pretty(&account)?);
        }

        Commands::Submit { user, payload } => {
            let body = if payload == "-" {
                let mut buf = String::new();
                std::io::stdin()
                    .read_to_string(&mut buf)
                    .context("Failed to read payload from stdin")?;
                buf
            } else {
                payload
            };

            let outcome = engine.submit_signal(&user, &RawPayload::from_body(&body)).await?;
            let output = serde_json::json!({
                "accepted": outcome.accepted,
                "reason": outcome.reason,
                "code": outcome.violation.as_ref().map(|v| v.code()),
                "tradeId": outcome.trade_id,
                "status": outcome.status,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }

        Commands::Fill {
            trade_id,
            price,
            fees,
            status,
        } => {
            let status = TradeStatus::parse(&status)
                .with_context(|| format!("Unknown trade status: {}", status))?;
            let trade = engine.on_fill_confirmed(&trade_id, price, fees, status).await?;
            println!("{}", serde_json::to_string_pretty(&trade)?);
        }

        Commands::Status { user, trades } => {
            let snapshot = engine.risk_snapshot(&user).await?;
            let risk = &snapshot.risk;

            println!("\n=== Risk State: {} ===", user);
            println!("Daily P&L:          {}", risk.daily_pnl);
            println!("Trades Today:       {}", risk.trade_count);
            println!("Consecutive Losses: {}", risk.consecutive_losses);
            println!(
                "Emergency Stop:     {}",
                if risk.emergency_stop {
                    format!(
                        "ACTIVE ({}{})",
                        risk.emergency_stop_reason.as_deref().unwrap_or("no reason"),
                        risk.emergency_stop_origin
                            .map(|o| format!(", {}", o.as_str()))
                            .unwrap_or_default()
                    )
                } else {
                    "off".to_string()
                }
            );
            println!("Conservation Mode:  {}", if risk.capital_conservation_mode { "on" } else { "off" });
            println!("Pending Orders:     {}", snapshot.pending_trades);
            println!("Last Reset:         {}", risk.last_reset_at.to_rfc3339());

            println!(
                "\n{:<24} {:>10} {:>8} {:>8} {:>12}",
                "STRATEGY", "CONFIDENCE", "TRADES", "WIN%", "P&L"
            );
            println!("{}", "-".repeat(66));
            for s in &snapshot.strategies {
                println!(
                    "{:<24} {:>10.2} {:>8} {:>7.1}% {:>12.2}",
                    truncate(&s.strategy_name, 22),
                    s.confidence_score,
                    s.total_trades,
                    s.win_rate() * Decimal::ONE_HUNDRED,
                    s.total_pnl
                );
            }

            let recent = db.list_trades(&user, trades).await?;
            if !recent.is_empty() {
                println!(
                    "\n{:<36} {:<6} {:<4} {:>10} {:>12} {:<9} {:>10}",
                    "TRADE", "SYMBOL", "SIDE", "QTY", "PRICE", "STATUS", "P&L"
                );
                println!("{}", "-".repeat(94));
                for t in recent {
                    println!(
                        "{:<36} {:<6} {:<4} {:>10} {:>12} {:<9} {:>10}",
                        t.id,
                        truncate(&t.symbol, 6),
                        t.side.as_str(),
                        t.quantity,
                        t.executed_price.unwrap_or(t.requested_price),
                        t.status.as_str(),
                        t.pnl
                    );
                }
            }
        }

        Commands::Stop {
            user,
            reason,
            admin,
        } => {
            let origin = if admin { StopOrigin::Admin } else { StopOrigin::User };
            engine.trigger_emergency_stop(&user, origin, &reason).await?;
            println!("Emergency stop engaged for {}", user);
        }

        Commands::Resume { user } => {
            engine.clear_emergency_stop(&user).await?;
            println!("Trading resumed for {}", user);
        }

        Commands::ResetDay => {
            let count = engine.run_daily_reset().await?;
            println!("Daily reset applied to {} user(s)", count);
        }

        Commands::Sweep => {
            let cancelled = engine.sweep_expired_orders().await?;
            println!("Cancelled {} expired order(s)", cancelled.len());
            for id in cancelled {
                println!("  {}", id);
            }
        }

        Commands::Run => {
            let (tx, rx) = mpsc::channel::<Inbound>(1024);

            tokio::spawn(async move {
                let mut lines = BufReader::new(tokio::io::stdin()).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) if line.trim().is_empty() => continue,
                        Ok(Some(line)) => match serde_json::from_str::<Inbound>(&line) {
                            Ok(message) => {
                                if tx.send(message).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!(error = %e, "Skipping malformed envelope"),
                        },
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "Failed to read stdin");
                            break;
                        }
                    }
                }
            });

            let service = Service::new(engine.clone());
            if let Err(e) = service.run(rx).await {
                tracing::error!(error = %e, "Service error");
            }

            println!("\n{}", service.stats());
        }

        Commands::Config => unreachable!("handled before the database is opened"),
    }

    Ok(())
}

fn print_config(config: &EngineConfig) {
    println!("\n=== Engine Configuration ===\n");
    println!("Signals:");
    println!("  Quote Currencies:     {}", config.quote_currencies.join(", "));
    println!("  Default Strategy:     {}", config.default_strategy);

    println!("\nSizing & Learning:");
    println!("  Confidence Sizing:    {}", config.confidence_sizing);
    println!("  Learning Rate:        {}", config.learning_rate);
    println!("  Paper Fee Rate:       {}", config.paper_fee_rate);

    println!("\nExecution:");
    println!("  Exchange URL:         {}", config.exchange_url);
    println!("  API Key:              {}", if config.exchange_api_key.is_some() { "set" } else { "not set" });
    println!("  Fill Timeout:         {}s", config.fill_timeout_secs);
    println!("  Capital Cache:        {}s", config.capital_cache_secs);

    println!("\nService:");
    println!("  Database:             {}", config.database_url);
    println!("  Maintenance Interval: {}s", config.maintenance_interval_secs);

    let defaults = RiskSettings::default();
    println!("\n=== Default Risk Settings ===\n");
    println!("  Daily Loss Cap:       {}", defaults.daily_loss_cap);
    println!("  Max Trades / Day:     {}", defaults.max_trade_count_per_day);
    println!("  Max Trade Size:       {}%", defaults.max_trade_size_percent);
    println!("  Max Leverage:         {}x", defaults.max_leverage_cap);
    println!("  Min AI Confidence:    {}", defaults.min_confidence_threshold);
    let mut coins: Vec<_> = defaults.enabled_coins.iter().cloned().collect();
    coins.sort();
    println!("  Enabled Coins:        {}", coins.join(", "));
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        format!("{}…", s.chars().take(max.saturating_sub(1)).collect::<String>())
    }
}
