use clap::{Parser, ValueEnum};
use mbank_core::LedgerStorageConfig;
use mbank_service::{build_router, ServiceConfig, ServiceState};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LedgerStorageMode {
    Auto,
    Memory,
    Postgres,
}

#[derive(Debug, Parser)]
#[command(name = "mbankd", version, about = "Metal Bank conversational REST service")]
struct Cli {
    /// Socket address to bind, e.g. 127.0.0.1:8090
    #[arg(long, default_value = "127.0.0.1:8090")]
    listen: SocketAddr,
    /// Ledger persistence backend. `auto` picks postgres when a database url
    /// is configured.
    #[arg(long, value_enum, default_value_t = LedgerStorageMode::Auto, env = "MBANK_LEDGER_STORAGE")]
    ledger_storage: LedgerStorageMode,
    /// PostgreSQL url for loan ledger persistence.
    #[arg(long, env = "MBANK_LEDGER_DATABASE_URL")]
    ledger_database_url: Option<String>,
    /// Max PostgreSQL pool connections for ledger persistence.
    #[arg(long, default_value_t = 5, env = "MBANK_LEDGER_PG_MAX_CONNECTIONS")]
    ledger_pg_max_connections: u32,
    /// Seconds a gated cancellation waits for its confirmation before
    /// resolving to "denied".
    #[arg(long, default_value_t = 120, env = "MBANK_CONFIRMATION_TIMEOUT_SECS")]
    confirmation_timeout_secs: u64,
    /// Base url of the remote risk service; omit to use the built-in fixture.
    #[arg(long, env = "MBANK_RISK_SERVICE_URL")]
    risk_service_url: Option<String>,
    /// Base url of the hidden delegate; omit to use the scripted fixture.
    #[arg(long, env = "MBANK_HIDDEN_SERVICE_URL")]
    hidden_service_url: Option<String>,
}

impl Cli {
    fn resolve_ledger_storage(&self) -> anyhow::Result<LedgerStorageConfig> {
        let url = self
            .ledger_database_url
            .clone()
            .or_else(|| std::env::var("DATABASE_URL").ok());

        match (self.ledger_storage, url) {
            (LedgerStorageMode::Memory, _) | (LedgerStorageMode::Auto, None) => {
                Ok(LedgerStorageConfig::Memory)
            }
            (LedgerStorageMode::Postgres, None) => Err(anyhow::anyhow!(
                "ledger_storage=postgres requires --ledger-database-url or DATABASE_URL"
            )),
            (_, Some(url)) => Ok(LedgerStorageConfig::postgres(
                url,
                self.ledger_pg_max_connections,
            )),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "mbank_service=info,info".to_string()),
        )
        .init();

    let cli = Cli::parse();
    let config = ServiceConfig {
        ledger_storage: cli.resolve_ledger_storage()?,
        confirmation_timeout: Duration::from_secs(cli.confirmation_timeout_secs),
        risk_service_url: cli.risk_service_url.clone(),
        hidden_service_url: cli.hidden_service_url.clone(),
    };

    let state = ServiceState::bootstrap(config).await?;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!("mbank-service listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;

    Ok(())
}
