use std::path::PathBuf;

use anyhow::Context;
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod daily;
mod dates;
mod db;
mod models;
mod pipeline;
mod provider;
mod report;
mod reports;
mod store;
mod weekly;

use crate::db::PgStore;
use crate::models::{ConnectionStatus, Credentials};
use crate::pipeline::{IngestOutcome, IngestRequest};
use crate::provider::{AnalyticsClient, ProviderConfig};
use crate::store::MetricStore;

#[derive(Parser)]
#[command(name = "traffic-insights")]
#[command(about = "Website traffic ingestion and insight detection", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Store analytics credentials and the property to sync for a user
    Connect {
        #[arg(long)]
        user: Uuid,
        #[arg(long)]
        property: String,
        #[arg(long)]
        access_token: String,
        #[arg(long)]
        refresh_token: String,
        /// Seconds until the access token expires
        #[arg(long, default_value_t = 3600)]
        expires_in: i64,
    },
    /// Fetch, store and analyze the last N days of traffic
    Ingest {
        #[arg(long)]
        user: Uuid,
        #[arg(long)]
        property: String,
        #[arg(long, default_value_t = 30)]
        days: u32,
        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },
    /// Re-run daily and weekly detection over stored metrics
    Detect {
        #[arg(long)]
        user: Uuid,
    },
    /// Show the latest ingestion status
    Status {
        #[arg(long)]
        user: Uuid,
    },
    /// Generate a markdown insight report
    Report {
        #[arg(long)]
        user: Uuid,
        #[arg(long, default_value_t = 30)]
        since_days: i64,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Export stored daily metrics as CSV
    Export {
        #[arg(long)]
        user: Uuid,
        #[arg(long, default_value_t = 90)]
        since_days: i64,
        #[arg(long, default_value = "metrics.csv")]
        out: PathBuf,
    },
}

fn provider_config() -> anyhow::Result<ProviderConfig> {
    let client_id = std::env::var("ANALYTICS_CLIENT_ID")
        .context("ANALYTICS_CLIENT_ID must be set to the OAuth client id")?;
    let client_secret = std::env::var("ANALYTICS_CLIENT_SECRET")
        .context("ANALYTICS_CLIENT_SECRET must be set to the OAuth client secret")?;

    let mut config = ProviderConfig::new(client_id, client_secret);
    if let Ok(base) = std::env::var("ANALYTICS_API_BASE") {
        config.api_base = base;
    }
    if let Ok(url) = std::env::var("ANALYTICS_TOKEN_URL") {
        config.token_url = url;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,traffic_insights=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;
    let store = PgStore::new(pool.clone());

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Connect {
            user,
            property,
            access_token,
            refresh_token,
            expires_in,
        } => {
            let property_id = provider::normalize_property_id(&property)
                .with_context(|| format!("invalid property id {property:?}"))?
                .to_string();
            store
                .save_credentials(&Credentials {
                    user_id: user,
                    property_id: property_id.clone(),
                    access_token,
                    refresh_token,
                    token_expiry: Utc::now() + Duration::seconds(expires_in),
                    status: ConnectionStatus::Active,
                })
                .await?;
            println!("Connected property {property_id} for user {user}.");
        }
        Commands::Ingest {
            user,
            property,
            days,
            json,
        } => {
            let client = AnalyticsClient::new(provider_config()?)?;
            let request = IngestRequest {
                user_id: user,
                property_id: property,
                days,
            };
            let outcome = pipeline::run_ingestion(&store, &client, &request).await;

            if json {
                println!("{}", outcome.to_json());
            } else {
                match &outcome {
                    IngestOutcome::Success { days_processed } => {
                        println!("Synced {days_processed} days for user {user}.")
                    }
                    IngestOutcome::Failure { error } => println!("Sync failed: {error}"),
                }
            }
            if matches!(outcome, IngestOutcome::Failure { .. }) {
                std::process::exit(1);
            }
        }
        Commands::Detect { user } => {
            let today = Utc::now().date_naive();
            let daily_events = daily::run_daily_detection(&store, user, today).await?;
            let weekly_events = weekly::run_weekly_detection(&store, user, today).await?;
            println!("Detected {daily_events} daily events and {weekly_events} weekly insights.");
        }
        Commands::Status { user } => match store.fetch_status(user).await? {
            Some(status) => println!(
                "{} ({} days) at {}: {}",
                status.status, status.days_processed, status.updated_at, status.message
            ),
            None => println!("No sync has run for this user."),
        },
        Commands::Report {
            user,
            since_days,
            out,
        } => {
            let today = Utc::now().date_naive();
            let since = today - Duration::days(since_days.max(1));
            let metrics = store.metrics_between(user, since, today).await?;
            let events = store.fetch_events(user, since).await?;
            let report = report::build_report(&user.to_string(), since, &metrics, &events);
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
        Commands::Export {
            user,
            since_days,
            out,
        } => {
            let today = Utc::now().date_naive();
            let since = today - Duration::days(since_days.max(1));
            let metrics = store.metrics_between(user, since, today).await?;

            let mut writer = csv::Writer::from_path(&out)?;
            for metric in &metrics {
                writer.serialize(metric)?;
            }
            writer.flush()?;
            println!("Exported {} days to {}.", metrics.len(), out.display());
        }
    }

    Ok(())
}
