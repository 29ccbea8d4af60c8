use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;
use query_fanout::{
    QueryRequest, ServiceConfig, create_app_state, load_service_config, parse_query_request,
};

#[derive(Parser)]
#[command(name = "query-fanout")]
#[command(about = "Concurrent multi-datasource query service")]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(long, global = true, env = "QUERY_CONFIG")]
    config: Option<PathBuf>,

    /// Maximum number of datasource batches executed at once
    #[arg(long, global = true, env = "QUERY_CONCURRENT_LIMIT")]
    concurrent_query_limit: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP query API
    Server {
        #[arg(short, long, default_value = "127.0.0.1:8080")]
        bind: String,
    },
    /// Execute a query request file and print the JSON response
    Query {
        /// File holding a query request body
        file: PathBuf,
    },
    /// List the datasources queries can be routed to
    Datasources,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("query_fanout=info".parse()?)
                .add_directive("tower_http=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Server { bind } => {
            let state = create_app_state(&config)?;
            let shutdown = state.shutdown.clone();
            let app = query_fanout::api::create_router(state);

            let listener = tokio::net::TcpListener::bind(&bind).await?;
            info!("Query API listening on http://{}", bind);

            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!("failed to listen for shutdown signal: {}", e);
                    }
                    info!("Shutdown requested, cancelling in-flight queries");
                    shutdown.cancel();
                })
                .await?;
        }
        Commands::Query { file } => {
            let state = create_app_state(&config)?;
            let raw = tokio::fs::read_to_string(&file).await?;

            let request = QueryRequest::from_json(&raw)?;
            let parsed = parse_query_request(request, state.clock.as_ref())?;
            info!(
                "Running {} datasource batch(es) and {} expression(s) from {}",
                parsed.requests.len(),
                parsed.expressions.len(),
                file.display()
            );

            let ctx = state.service.new_context(&state.shutdown);
            let response = state.service.process_request(&ctx, parsed).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Datasources => {
            let state = create_app_state(&config)?;
            let datasources = state.registry.list();

            if datasources.is_empty() {
                println!("No datasources configured.");
                return Ok(());
            }

            println!("{:<30} {:<30}", "UID", "TYPE");
            println!("{}", "-".repeat(60));
            for ds in datasources {
                let uid = ds
                    .uid
                    .map(|u| u.into_inner())
                    .unwrap_or_else(|| "(any)".to_string());
                println!("{:<30} {:<30}", uid, ds.kind.as_str());
            }
        }
    }

    Ok(())
}

/// Load the configuration file and apply command line overrides.
fn load_config(cli: &Cli) -> Result<ServiceConfig> {
    let mut config = load_service_config(cli.config.as_deref())?;
    if let Some(limit) = cli.concurrent_query_limit {
        info!("Overriding concurrent query limit: {}", limit);
        config.concurrent_query_limit = limit;
    }
    Ok(config)
}
