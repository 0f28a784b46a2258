use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use missionctl::app::{self, ServerConfig};

#[derive(Parser)]
#[command(
    name = "missionctl",
    about = "Mission Control backend for gateway-hosted agent fleets"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Mission Control server
    Serve {
        #[arg(long, default_value = "8080")]
        port: u16,
        #[arg(long, default_value = "missionctl.db")]
        db: String,
        #[arg(long, env = "MISSIONCTL_ADMIN_TOKEN", default_value = "")]
        admin_token: String,
        /// Public base URL embedded in coordination messages
        #[arg(long, env = "MISSIONCTL_BASE_URL", default_value = "http://localhost:8080")]
        base_url: String,
        #[arg(long, env = "MISSIONCTL_GATEWAY_URL")]
        gateway_url: Option<String>,
        #[arg(long, env = "MISSIONCTL_GATEWAY_TOKEN")]
        gateway_token: Option<String>,
        /// Root directory for agent workspaces on the gateway host
        #[arg(long, env = "MISSIONCTL_WORKSPACE_ROOT")]
        workspace_root: Option<String>,
    },
    /// Initialize the database
    Init {
        #[arg(long, default_value = "missionctl.db")]
        db: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            port,
            db,
            admin_token,
            base_url,
            gateway_url,
            gateway_token,
            workspace_root,
        } => {
            app::run_server(ServerConfig {
                port,
                db_path: db,
                admin_token,
                base_url,
                gateway_url,
                gateway_token,
                workspace_root,
            })
            .await;
        }
        Commands::Init { db } => {
            let conn = missionctl::db::init_db(&db);
            tracing::info!("database initialized at {}", db);
            drop(conn);
        }
    }
}
