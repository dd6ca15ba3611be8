//! Cloudshelf Server
//!
//! Namespace-safe file manager over HTTP.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::distributions::Alphanumeric;
use rand::Rng;
use server::config::{default_config_path, Config};
use server::files::{NamespaceBrowser, PathResolver, VirtualPath};
use server::protocol::{Role, TreeNode};
use server::{hash_password, Account, ServerOrchestrator};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Cloudshelf - namespace-safe file manager over HTTP.
#[derive(Parser, Debug)]
#[command(name = "cloudshelf")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the HTTP server
    Serve {
        /// Address to listen on (overrides the config file)
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,

        /// Storage root (overrides the config file)
        #[arg(long, value_name = "DIR")]
        root: Option<PathBuf>,
    },

    /// Print the folder tree of the storage root
    Tree {
        /// Virtual folder to start from
        #[arg(default_value = "")]
        path: String,
    },

    /// Print the password hash for an account entry
    HashPassword {
        /// Password to hash
        password: String,
    },

    /// Write a default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    match cli.command {
        Commands::Serve { bind, root } => {
            let mut config = Config::load(&config_path)?;
            config.apply_env_overrides();
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(root) = root {
                config.storage.root = Some(root);
            }
            config.validate()?;

            let _guard = init_tracing(&config, cli.verbose)?;
            tracing::info!(config = ?config_path, "Cloudshelf starting...");
            run_server(config).await?;
        }
        Commands::Tree { path } => {
            let mut config = Config::load(&config_path)?;
            config.apply_env_overrides();
            let _guard = init_tracing(&config, cli.verbose)?;

            let root = config.storage_root();
            let resolver = PathResolver::new(&root)
                .with_context(|| format!("Invalid storage root: {}", root.display()))?;
            let browser = NamespaceBrowser::new(Arc::new(resolver));
            let folder = VirtualPath::parse(&path)?;
            let tree = browser.tree(&folder).await?;

            println!("{}", if folder.is_root() { root.display().to_string() } else { folder.to_string() });
            print!("{}", render_tree(&tree));
            println!(
                "\n{} folders, {} files",
                tree.folder_count(),
                tree.file_count()
            );
        }
        Commands::HashPassword { password } => {
            println!("{}", hash_password(&password));
        }
        Commands::InitConfig { force } => {
            init_config(&config_path, force)?;
        }
    }

    Ok(())
}

/// Initialize logging: stderr always, plus a daily rolling file when
/// `log_dir` is configured. `RUST_LOG` overrides the configured level.
fn init_tracing(config: &Config, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose { "debug" } else { config.server.log_level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr));

    match &config.server.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "cloudshelf.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .try_init()
                .context("Failed to initialize logging")?;
            Ok(Some(guard))
        }
        None => {
            registry.try_init().context("Failed to initialize logging")?;
            Ok(None)
        }
    }
}

/// Run the server until SIGINT or SIGTERM.
async fn run_server(config: Config) -> anyhow::Result<()> {
    let orchestrator = Arc::new(ServerOrchestrator::new(config).await?);

    let stopper = Arc::clone(&orchestrator);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("Received shutdown signal");
        stopper.stop().await;
    });

    orchestrator.run().await
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Write a default configuration with one generated admin account.
fn init_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists: {} (use --force to overwrite)",
            path.display()
        );
    }

    let password: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(20)
        .map(char::from)
        .collect();

    let mut config = Config::default();
    config.auth.accounts.push(Account {
        username: "admin".to_string(),
        password_sha256: hash_password(&password),
        role: Role::Admin,
    });
    config.save(path)?;

    println!("Wrote {}", path.display());
    println!("Storage root: {}", config.storage_root().display());
    println!("Admin login:  admin / {password}");
    Ok(())
}

/// Indented rendering of a tree, folders first.
fn render_tree(tree: &TreeNode) -> String {
    let mut out = String::new();
    render_level(tree, 1, &mut out);
    out
}

fn render_level(node: &TreeNode, depth: usize, out: &mut String) {
    let indent = "  ".repeat(depth);
    for (name, child) in &node.folders {
        out.push_str(&format!("{indent}{name}/\n"));
        render_level(child, depth + 1, out);
    }
    for name in &node.files {
        out.push_str(&format!("{indent}{name}\n"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tempfile::TempDir;

    #[test]
    fn test_cli_debug_assert() {
        // Verify the CLI structure is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_serve_command() {
        let cli = Cli::try_parse_from(["cloudshelf", "serve"]).unwrap();
        match cli.command {
            Commands::Serve { bind, root } => {
                assert!(bind.is_none());
                assert!(root.is_none());
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_serve_with_overrides() {
        let cli = Cli::try_parse_from([
            "cloudshelf",
            "--verbose",
            "serve",
            "--bind",
            "0.0.0.0:8080",
            "--root",
            "/srv/files",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Serve { bind, root } => {
                assert_eq!(bind.as_deref(), Some("0.0.0.0:8080"));
                assert_eq!(root, Some(PathBuf::from("/srv/files")));
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_tree_default_path() {
        let cli = Cli::try_parse_from(["cloudshelf", "tree"]).unwrap();
        match cli.command {
            Commands::Tree { path } => assert_eq!(path, ""),
            _ => panic!("Expected Tree command"),
        }
    }

    #[test]
    fn test_global_config_flag() {
        let cli = Cli::try_parse_from(["cloudshelf", "hash-password", "pw", "--config", "/tmp/c.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.toml")));
        assert!(matches!(cli.command, Commands::HashPassword { .. }));
    }

    #[test]
    fn test_render_tree() {
        let mut b = TreeNode::default();
        b.files.push("c.txt".to_string());
        let mut a = TreeNode::default();
        a.folders.insert("b".to_string(), b);
        a.files.push("d.txt".to_string());
        let mut tree = TreeNode::default();
        tree.folders.insert("a".to_string(), a);
        tree.files.push("e.txt".to_string());

        assert_eq!(render_tree(&tree), "  a/\n    b/\n      c.txt\n    d.txt\n  e.txt\n");
    }

    #[test]
    fn test_init_config_writes_admin() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cloudshelf/config.toml");

        init_config(&path, false).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.auth.accounts.len(), 1);
        assert_eq!(config.auth.accounts[0].role, Role::Admin);
        config.validate().unwrap();

        assert!(init_config(&path, false).is_err());
        assert!(init_config(&path, true).is_ok());
    }
}
