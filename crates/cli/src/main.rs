use std::{path::PathBuf, sync::Arc};

use {
    clap::{Parser, Subcommand},
    pylon_channel::noop::NoopDriver,
    pylon_gateway::resolve_auth,
    pylon_store::InstanceStore,
    pylon_supervisor::{InstanceSupervisor, SupervisorConfig},
    pylon_webhook::HttpWebhookQueue,
    tracing::{info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "pylon", about = "Pylon — multi-tenant messaging gateway")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// SQLite database URL.
    #[arg(
        long,
        global = true,
        env = "PYLON_DATABASE_URL",
        default_value = "sqlite://pylon.db?mode=rwc"
    )]
    database: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server and bring up all stored instances.
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        #[arg(long, default_value_t = 8080)]
        port: u16,
        /// Root directory for per-instance credential bundles.
        #[arg(long, default_value = "sessions")]
        creds_root: PathBuf,
    },
    /// List stored instances and their durable status.
    Status,
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_thread_ids(false))
        .init();
}

async fn open_store(database: &str) -> anyhow::Result<InstanceStore> {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .connect(database)
        .await?;
    InstanceStore::init(&pool).await?;
    Ok(InstanceStore::new(pool))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    match cli.command {
        Commands::Serve {
            bind,
            port,
            creds_root,
        } => {
            info!(version = env!("CARGO_PKG_VERSION"), "pylon starting");
            let store = open_store(&cli.database).await?;

            // The real session driver is linked in by deployments; without
            // one, instances surface as failed instead of wedging the core.
            warn!("no session driver configured, using noop driver");
            let supervisor = InstanceSupervisor::new(
                store,
                Arc::new(NoopDriver),
                HttpWebhookQueue::spawn(),
                SupervisorConfig {
                    creds_root,
                    ..SupervisorConfig::default()
                },
            );

            // Cold start: bring up every non-destroyed instance in the
            // background while the request layer comes online.
            let loader = Arc::clone(&supervisor);
            tokio::spawn(async move {
                if let Some(results) = loader.load_all().await {
                    let ok = results.iter().filter(|r| r.ok).count();
                    info!(total = results.len(), ok, "initial bulk load finished");
                }
            });

            let auth = resolve_auth(std::env::var("PYLON_TOKEN").ok());
            let server = {
                let supervisor = Arc::clone(&supervisor);
                tokio::spawn(
                    async move { pylon_gateway::serve(&bind, port, supervisor, auth).await },
                )
            };

            tokio::select! {
                res = server => res??,
                _ = tokio::signal::ctrl_c() => {
                    info!("shutting down");
                    supervisor.shutdown().await;
                },
            }
            Ok(())
        },
        Commands::Status => {
            let store = open_store(&cli.database).await?;
            for rec in store.list().await {
                println!(
                    "{:<24} {:<13} messages={} identity={}",
                    rec.instance_id,
                    rec.status,
                    rec.message_count,
                    rec.linked_identity.as_deref().unwrap_or("-"),
                );
            }
            Ok(())
        },
    }
}
