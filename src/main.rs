use anyhow::Result;
use clap::{Parser, Subcommand};
use sassmaster::app::{build_ledger, App, ResponseBody};
use sassmaster::models::{ChatRequest, Config, GenerateRequest};
use sassmaster::quota::{ClientId, Decision};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "sassmaster")]
#[command(about = "Sarcastic chat and metered art generation")]
struct CliArgs {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show how many free generations a client has left.
    Remaining {
        #[arg(value_parser = parse_client)]
        client: ClientId,
    },
    /// Spend one free generation without calling any provider.
    Consume {
        #[arg(value_parser = parse_client)]
        client: ClientId,
    },
    /// Ask the sarcastic assistant something.
    Chat { client: String, message: String },
    /// Generate a themed image, spending one free use.
    Generate {
        client: String,
        /// Photo theme; defaults to "nature".
        theme: Option<String>,
        /// Where to write the PNG.
        #[arg(long, default_value = "art.png")]
        out: PathBuf,
    },
}

fn parse_client(input: &str) -> std::result::Result<ClientId, String> {
    ClientId::parse(input).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sassmaster=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = CliArgs::parse();
    let config = Config::from_env()?;

    if let Err(e) = run(args.command, &config).await {
        error!("Command failed: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

async fn run(command: Command, config: &Config) -> Result<()> {
    match command {
        Command::Remaining { client } => {
            let ledger = build_ledger(config).await?;
            let remaining = ledger.remaining(&client).await?;
            println!("{}", serde_json::json!({ "client": client.as_str(), "remaining": remaining }));
        }
        Command::Consume { client } => {
            let ledger = build_ledger(config).await?;
            match ledger.try_consume(&client).await? {
                Decision::Allowed { used } => {
                    println!("{}", serde_json::json!({ "allowed": true, "used": used }));
                }
                Decision::Denied => {
                    println!("{}", serde_json::json!({ "allowed": false }));
                }
            }
        }
        Command::Chat { client, message } => {
            let app = App::from_config(config).await?;
            let response = app.chat(&client, ChatRequest { message }).await;
            if let ResponseBody::Json(body) = response.body {
                println!("{}", body);
            }
        }
        Command::Generate { client, theme, out } => {
            let app = App::from_config(config).await?;
            let response = app.generate(&client, GenerateRequest { theme }).await;
            match response.body {
                ResponseBody::Png(bytes) => {
                    tokio::fs::write(&out, &bytes).await?;
                    info!("Wrote {} bytes to {}", bytes.len(), out.display());
                }
                ResponseBody::Json(body) => {
                    anyhow::bail!("generate refused ({}): {}", response.status, body);
                }
            }
        }
    }
    Ok(())
}
