use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use reelvault_api::ServeError;
use reelvault_core::{Config, Db};

#[derive(Parser)]
#[command(name = "reelvault")]
#[command(about = "Self-hosted media library server")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true, env = "REELVAULT_CONFIG", help = "Configuration file path")]
    config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Log filter, e.g. info or reelvault_core=debug")]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server
    Server {
        #[arg(short = 'H', long, help = "Override the bind address")]
        host: Option<String>,

        #[arg(short = 'P', long, help = "Override the port")]
        port: Option<u16>,
    },

    /// Create or upgrade the database schema and exit
    Migrate,

    /// Print the effective configuration and exit
    ShowConfig,
}

fn load_config(cli: &Cli) -> Result<Config, reelvault_core::Error> {
    match &cli.config {
        Some(path) => Config::load(&path.to_string_lossy()),
        None => Config::from_env(),
    }
}

fn init_tracing(cli: &Cli, config: &Config) {
    let filter = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            return ExitCode::from(1);
        }
    };

    init_tracing(&cli, &config);

    match cli.command {
        Commands::Server { host, port } => {
            let mut config = config;
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }

            match reelvault_api::run(config).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!("{}", e);
                    exit_code(&e)
                }
            }
        }
        Commands::Migrate => match migrate(&config).await {
            Ok(()) => {
                info!("Database ready: path={}", config.database.path);
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("storage init failed: {}", e);
                ExitCode::from(3)
            }
        },
        Commands::ShowConfig => match serde_json::to_string_pretty(&config) {
            Ok(rendered) => {
                println!("{}", rendered);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("configuration error: {}", e);
                ExitCode::from(1)
            }
        },
    }
}

fn exit_code(err: &ServeError) -> ExitCode {
    ExitCode::from(err.exit_code() as u8)
}

async fn migrate(config: &Config) -> reelvault_core::Result<()> {
    let db = Db::open(&config.database.path, config.database.max_connections).await?;
    db.migrate().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse() {
        let cli = Cli::parse_from(["reelvault", "server"]);
        assert!(matches!(cli.command, Commands::Server { .. }));

        let cli = Cli::parse_from(["reelvault", "-c", "/etc/rv.toml", "migrate"]);
        assert!(matches!(cli.command, Commands::Migrate));
        assert_eq!(cli.config, Some(PathBuf::from("/etc/rv.toml")));
    }
}
