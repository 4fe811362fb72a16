use anyhow::Context;
use clap::{Parser, Subcommand};
use mcp_fleet::{
    default_credential_dir, load_config, ConfigWatcher, ConnectionManager, FleetSettings,
    RegistryEvent,
};
use mcp_oauth::CredentialStore;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "mcp-fleet",
    about = "MCP Fleet - Keep a fleet of configured MCP servers connected",
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    /// Enable debug logging
    #[arg(long, short, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect every configured server and keep the connections healthy
    Run(RunArgs),

    /// Check a configuration file and report every invalid entry
    Validate {
        /// Server configuration file
        #[arg(long, short, value_name = "FILE")]
        config: PathBuf,
    },

    /// Delete the stored OAuth credentials of a server
    Revoke {
        /// Server name as it appears in the configuration
        server: String,

        /// Credential directory
        #[arg(long, value_name = "DIR")]
        auth_dir: Option<PathBuf>,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// Server configuration file
    #[arg(long, short, value_name = "FILE")]
    config: PathBuf,

    /// Credential directory
    #[arg(long, value_name = "DIR")]
    auth_dir: Option<PathBuf>,

    /// Store credentials without encryption
    #[arg(long)]
    no_encrypt: bool,

    /// Host the OAuth callback listener binds to
    #[arg(long, default_value = "localhost")]
    callback_host: String,

    /// Preferred OAuth callback port (0 picks a free one)
    #[arg(long, default_value = "0")]
    callback_port: u16,

    /// Authentication timeout in seconds
    #[arg(long, default_value = "300")]
    auth_timeout: u64,

    /// Seconds between health checks
    #[arg(long, default_value = "5")]
    health_interval: u64,

    /// Seconds to wait before reconnecting a failed server
    #[arg(long, default_value = "3")]
    reconnect_delay: u64,

    /// Never probe remote servers for OAuth support
    #[arg(long)]
    no_oauth_detect: bool,

    /// Do not follow edits to the configuration file
    #[arg(long)]
    no_watch: bool,

    /// Print state changes as JSON lines on stdout
    #[arg(long)]
    json: bool,
}

impl RunArgs {
    fn settings(&self) -> FleetSettings {
        FleetSettings::default()
            .with_credential_dir(
                self.auth_dir
                    .clone()
                    .unwrap_or_else(default_credential_dir),
            )
            .with_encryption(!self.no_encrypt)
            .with_callback(self.callback_host.clone(), self.callback_port)
            .with_auth_timeout(Duration::from_secs(self.auth_timeout))
            .with_health_interval(Duration::from_secs(self.health_interval.max(1)))
            .with_reconnect_delay(Duration::from_secs(self.reconnect_delay))
            .with_oauth_autodetect(!self.no_oauth_detect)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Validate { config } => validate(&config).await,
        Command::Revoke { server, auth_dir } => {
            let dir = auth_dir.unwrap_or_else(default_credential_dir);
            CredentialStore::new(&dir)
                .remove_server(&server)
                .await
                .with_context(|| format!("Failed to revoke credentials for '{}'", server))?;
            info!("Removed stored credentials for '{}'", server);
            Ok(())
        }
    }
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let config = load_config(&args.config)
        .await
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    info!("MCP Fleet starting");
    info!("Configuration: {}", args.config.display());

    let manager = ConnectionManager::new(args.settings());

    let _watcher = if args.no_watch {
        None
    } else {
        Some(
            ConfigWatcher::spawn(&args.config, manager.clone())
                .context("Failed to watch configuration file")?,
        )
    };

    let mut events = manager.subscribe();
    let json = args.json;
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if json {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => error!("Failed to encode event: {}", e),
                }
            } else {
                info!("{}", describe_event(&event));
            }
        }
    });

    let connecting = tokio::spawn({
        let manager = manager.clone();
        async move {
            let diff = manager.apply_config(config).await;
            info!("{} servers configured", diff.added.len());
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for interrupt signal")?;
    info!("Received interrupt signal, shutting down gracefully");

    connecting.abort();
    manager.shutdown().await;
    printer.abort();

    info!("MCP Fleet stopped");
    Ok(())
}

fn describe_event(event: &RegistryEvent) -> String {
    match event {
        RegistryEvent::Updated { state } => match &state.error {
            Some(error) => format!("{}: {} ({})", state.name, state.status, error),
            None => format!("{}: {}", state.name, state.status),
        },
        RegistryEvent::Removed { name } => format!("{}: removed", name),
    }
}

async fn validate(path: &Path) -> anyhow::Result<()> {
    let config = load_config(path)
        .await
        .with_context(|| format!("Failed to load {}", path.display()))?;

    let mut problems = 0;
    for (name, server) in &config.servers {
        match mcp_client::describe(server) {
            Ok(transport) => println!("ok       {} ({})", name, transport.kind()),
            Err(e) => {
                problems += 1;
                println!("invalid  {}: {}", name, e);
            }
        }
    }
    for violation in &config.violations {
        problems += 1;
        println!("invalid  {}", violation);
    }

    if problems > 0 {
        warn!("{} invalid server entries", problems);
        anyhow::bail!(
            "{} of {} server entries are invalid",
            problems,
            config.servers.len() + config.violations.len()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcp_fleet::ConnectionState;

    #[test]
    fn test_run_args_map_onto_settings() {
        let cli = Cli::try_parse_from([
            "mcp-fleet",
            "run",
            "--config",
            "servers.json",
            "--no-encrypt",
            "--callback-port",
            "8765",
            "--auth-timeout",
            "60",
            "--auth-dir",
            "/tmp/auth",
        ])
        .unwrap();

        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        let settings = args.settings();
        assert!(!settings.encrypt_credentials);
        assert_eq!(settings.callback_port, 8765);
        assert_eq!(settings.callback_host, "localhost");
        assert_eq!(settings.auth_timeout, Duration::from_secs(60));
        assert_eq!(settings.credential_dir, PathBuf::from("/tmp/auth"));
        assert!(settings.oauth_autodetect);
    }

    #[test]
    fn test_debug_flag_is_global() {
        let cli = Cli::try_parse_from(["mcp-fleet", "revoke", "svc", "--debug"]).unwrap();
        assert!(cli.debug);
        assert!(matches!(cli.command, Command::Revoke { server, .. } if server == "svc"));
    }

    #[test]
    fn test_describe_event() {
        let failed = ConnectionState::starting("svc", None).into_error("refused");
        assert_eq!(
            describe_event(&RegistryEvent::Updated { state: failed }),
            "svc: error (refused)"
        );
        assert_eq!(
            describe_event(&RegistryEvent::Removed {
                name: "svc".to_string()
            }),
            "svc: removed"
        );
    }

    #[tokio::test]
    async fn test_validate_reports_invalid_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.json");

        tokio::fs::write(
            &path,
            r#"{"mcpServers": {"local": {"command": "echo"}, "remote": {"url": "https://host/sse"}}}"#,
        )
        .await
        .unwrap();
        assert!(validate(&path).await.is_ok());

        tokio::fs::write(
            &path,
            r#"{"mcpServers": {"local": {"command": "echo"}, "empty": {}, "odd": {"url": "https://host/api"}}}"#,
        )
        .await
        .unwrap();
        let err = validate(&path).await.unwrap_err();
        assert!(err.to_string().contains("2 of 3"));
    }
}
