use std::path::PathBuf;

use clap::Parser;
use nowauth_reqwest::SessionBroker;
use nowauth_tokens::{config::ENV_INSTANCE_URL, BrokerOptions, CredentialConfig};

/// Lists records from a table, authenticating with whatever credentials the
/// `SERVICENOW_*` environment variables provide
#[derive(Debug, Parser)]
struct Opts {
    /// The backend's base URL
    #[arg(short, long, env = ENV_INSTANCE_URL)]
    instance_url: String,

    /// The table to query
    #[arg(short, long, default_value = "incident")]
    table: String,

    /// The maximum number of records to return
    #[arg(short, long, default_value_t = 5)]
    limit: u32,

    /// An encoded query to filter records by
    #[arg(short, long)]
    query: Option<String>,

    /// The file used to cache tokens between runs
    #[arg(short = 'f', long, env = "NOWAUTH_CACHE_FILE")]
    cache_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let options = BrokerOptions {
        cache_file: opts.cache_file,
        ..BrokerOptions::default()
    };
    let broker = SessionBroker::from_options(options).await?;

    let config = CredentialConfig {
        backend_url: opts.instance_url,
        ..CredentialConfig::from_env()
    };
    let client = broker.client(config).await?;

    let limit = opts.limit.to_string();
    let mut params = vec![("sysparm_limit", limit.as_str())];
    if let Some(query) = &opts.query {
        params.push(("sysparm_query", query.as_str()));
    }

    let path = format!("/api/now/table/{}", opts.table);
    let records = client.get(&path, &params).await?;

    println!("{}", serde_json::to_string_pretty(&records)?);

    if let Err(error) = broker.cache().flush().await {
        tracing::warn!(error = &*error as &dyn std::error::Error, "unable to save token cache");
    }

    Ok(())
}
