use anyhow::{anyhow, bail, Context};

mod app;
mod config;
mod db;
mod delivery;
mod error;
mod models;
mod scheduler;
mod services;

use app::App;
use config::Config;
use error::Result;

const HISTORY_LIMIT: usize = 20;

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Daemon,
    Send { subscription_id: i64, force: bool },
    Retry { delivery_id: i64 },
    History { subscription_id: i64 },
    Recipes { refresh: bool },
    Check,
    VerifySmtp { user_id: i64 },
    Cleanup,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    // RUST_LOG wins over the configured level
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Parse command line arguments
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_args(&args)?;

    let app = App::new(&config).await?;

    match command {
        Command::Daemon => app.run_daemon().await?,

        Command::Send {
            subscription_id,
            force,
        } => {
            let result = app.send_now(subscription_id, force).await?;
            print_result(&result);
        }

        Command::Retry { delivery_id } => {
            let result = app.retry(delivery_id).await?;
            print_result(&result);
        }

        Command::History { subscription_id } => {
            let deliveries = app.history(subscription_id, HISTORY_LIMIT).await?;
            if deliveries.is_empty() {
                println!("No deliveries for subscription {}", subscription_id);
            }
            for d in deliveries {
                println!(
                    "#{:<6} {:<10} {}  {}",
                    d.id,
                    d.status,
                    d.created_at.format("%Y-%m-%d %H:%M"),
                    d.error_message.unwrap_or_default()
                );
            }
        }

        Command::Recipes { refresh } => {
            let recipes = app.list_recipes(refresh).await?;
            for recipe in &recipes {
                println!(
                    "{:<40} {:<5} {}",
                    recipe.name,
                    recipe.language.as_deref().unwrap_or("-"),
                    recipe.title
                );
            }
            println!("{} recipes", recipes.len());
        }

        Command::Check => {
            let version = app.check_calibre().await?;
            println!("Calibre OK: {}", version);
        }

        Command::VerifySmtp { user_id } => {
            app.verify_smtp(user_id).await?;
            println!("SMTP connection OK for user {}", user_id);
        }

        Command::Cleanup => {
            let report = app.cleanup().await?;
            println!(
                "Deleted {} EPUB files and {} delivery records",
                report.files_deleted, report.records_deleted
            );
        }
    }

    Ok(())
}

fn print_result(result: &delivery::DeliveryResult) {
    println!("Delivery #{}: {}", result.delivery_id, result.status);
    if let Some(size) = result.file_size_bytes {
        println!("  size: {:.1} KB", size as f64 / 1024.0);
    }
    if let Some(stage) = result.error_stage {
        println!("  failed while {}", stage);
    }
    if let Some(message) = &result.error_message {
        println!("  {}", message);
    }
}

fn parse_args(args: &[String]) -> anyhow::Result<Command> {
    let Some(flag) = args.first() else {
        return Ok(Command::Daemon);
    };

    let id = |name: &str| -> anyhow::Result<i64> {
        let raw = args
            .get(1)
            .ok_or_else(|| anyhow!("{} requires {}", flag, name))?;
        raw.parse()
            .with_context(|| format!("{} expects a numeric {}, got '{}'", flag, name, raw))
    };
    let has = |option: &str| args.iter().skip(1).any(|a| a == option);

    let command = match flag.as_str() {
        "--send" => Command::Send {
            subscription_id: id("<subscription_id>")?,
            force: has("--force"),
        },
        "--retry" => Command::Retry {
            delivery_id: id("<delivery_id>")?,
        },
        "--history" => Command::History {
            subscription_id: id("<subscription_id>")?,
        },
        "--recipes" => Command::Recipes {
            refresh: has("--refresh"),
        },
        "--check" => Command::Check,
        "--verify-smtp" => Command::VerifySmtp {
            user_id: id("<user_id>")?,
        },
        "--cleanup" => Command::Cleanup,
        other => bail!(
            "unknown argument '{}'; expected --send, --retry, --history, --recipes, --check, --verify-smtp or --cleanup",
            other
        ),
    };
    Ok(command)
}
