//! extkit - Extension lifecycle manager and extension host
//!
//! Command line front end over the extension manager.

use anyhow::Context;
use clap::{Parser, Subcommand};
use extkit::activation::PatternActivationMatcher;
use extkit::config::{self, ExtkitConfig};
use extkit::health::ThresholdHealthMonitor;
use extkit::host::ExtensionHost;
use extkit::installed::split_id;
use extkit::manager::{ExtensionManager, InstallOptions};
use extkit::registry::OpenVsxRegistry;
use extkit::sandbox::InertSandboxFactory;
use extkit::store::{FsPackageStore, PackageStore};
use extkit::surface::RecordingSurface;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "extkit")]
#[command(author, version, about = "Extension lifecycle manager and extension host")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Extra configuration file layered above the project and home files
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default configuration to .extkit/config.yaml
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// List installed extensions
    List,

    /// Install an extension from the registry
    Install {
        /// Extension id, `publisher.name`
        id: String,

        /// Exact version to install (latest when omitted)
        #[arg(long)]
        version: Option<String>,

        /// Reinstall even if already installed
        #[arg(short, long)]
        force: bool,

        /// Enable after installing
        #[arg(short, long)]
        enable: bool,
    },

    /// Uninstall an extension
    Uninstall {
        id: String,

        /// Remove even when the extension is stuck mid-transition
        #[arg(short, long)]
        force: bool,
    },

    /// Enable an installed extension
    Enable { id: String },

    /// Disable an enabled extension
    Disable { id: String },

    /// Load every enabled extension and print what it contributes
    Contributions {
        /// Activation events to fire after loading, e.g. `onLanguage:rust`
        #[arg(short, long)]
        event: Vec<String>,

        /// Print the registrations as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show current configuration
    Config {
        /// Print the effective configuration as YAML
        #[arg(long)]
        yaml: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "extkit=debug"
    } else {
        "extkit=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Commands::Init { force } = cli.command {
        return cmd_init(force);
    }
    let config = config::load_config_with(cli.config.as_deref())
        .context("Failed to load configuration")?;

    match cli.command {
        Commands::Init { .. } => Ok(()),
        Commands::List => cmd_list(config).await,
        Commands::Install {
            id,
            version,
            force,
            enable,
        } => cmd_install(config, &id, version, force, enable).await,
        Commands::Uninstall { id, force } => cmd_uninstall(config, &id, force).await,
        Commands::Enable { id } => cmd_enable(config, &id).await,
        Commands::Disable { id } => cmd_disable(config, &id).await,
        Commands::Contributions { event, json } => {
            cmd_contributions(config, &event, json).await
        }
        Commands::Config { yaml } => cmd_config(&config, yaml),
    }
}

/// Wire the manager against the configured registry and extension root
fn build_manager(
    config: ExtkitConfig,
    surface: RecordingSurface,
) -> anyhow::Result<ExtensionManager> {
    let registry = Arc::new(OpenVsxRegistry::new(&config.extensions.registry_url)?);
    let store: Arc<dyn PackageStore> = Arc::new(FsPackageStore::new());
    let health = Arc::new(ThresholdHealthMonitor::new(config.health.clone()));
    let host = ExtensionHost::new(
        Arc::new(surface),
        store.clone(),
        Arc::new(InertSandboxFactory),
        Arc::new(PatternActivationMatcher::new()),
        config.extensions.root.clone(),
    );
    Ok(ExtensionManager::new(
        config.extensions,
        registry,
        store,
        health,
        host,
    )?)
}

async fn cmd_list(config: ExtkitConfig) -> anyhow::Result<()> {
    let manager = build_manager(config, RecordingSurface::new())?;
    let extensions = manager.list().await;
    if extensions.is_empty() {
        println!("No extensions installed.");
        return Ok(());
    }

    for ext in extensions {
        println!("{} {} [{}]", ext.id, ext.version, ext.state);
        if ext.display_name != ext.name {
            println!("  {}", ext.display_name);
        }
        if !ext.dependencies.is_empty() {
            println!("  Depends on: {}", ext.dependencies.join(", "));
        }
        if let Some(error) = &ext.error {
            println!("  Error: {}", error);
        }
    }
    Ok(())
}

async fn cmd_install(
    config: ExtkitConfig,
    id: &str,
    version: Option<String>,
    force: bool,
    enable: bool,
) -> anyhow::Result<()> {
    let (publisher, name) =
        split_id(id).with_context(|| format!("Expected publisher.name, got '{}'", id))?;
    let manager = build_manager(config, RecordingSurface::new())?;

    let ext = manager
        .install(publisher, name, InstallOptions { version, force })
        .await?;
    println!("Installed {} {}", ext.id, ext.version);

    if enable {
        let ext = manager.enable(&ext.id).await?;
        println!("Enabled {}", ext.id);
    }
    report_cleanup(manager.shutdown().await);
    Ok(())
}

async fn cmd_uninstall(config: ExtkitConfig, id: &str, force: bool) -> anyhow::Result<()> {
    let manager = build_manager(config, RecordingSurface::new())?;
    let cleanup = manager.uninstall(id, force).await?;
    println!("Uninstalled {}", id);
    report_cleanup(cleanup);
    Ok(())
}

async fn cmd_enable(config: ExtkitConfig, id: &str) -> anyhow::Result<()> {
    let manager = build_manager(config, RecordingSurface::new())?;
    let ext = manager.enable(id).await?;
    println!("Enabled {}", ext.id);
    report_cleanup(manager.shutdown().await);
    Ok(())
}

async fn cmd_disable(config: ExtkitConfig, id: &str) -> anyhow::Result<()> {
    let manager = build_manager(config, RecordingSurface::new())?;
    // The host starts empty in a fresh process; load first so disable unloads a real instance
    manager.restore_enabled().await;
    let ext = manager.disable(id).await?;
    println!("Disabled {}", ext.id);
    report_cleanup(manager.shutdown().await);
    Ok(())
}

async fn cmd_contributions(
    config: ExtkitConfig,
    events: &[String],
    json: bool,
) -> anyhow::Result<()> {
    let surface = RecordingSurface::new();
    let manager = build_manager(config, surface.clone())?;
    let restored = manager.restore_enabled().await;
    info!(restored = restored, "Loaded enabled extensions");

    {
        let mut host = manager.host().lock().await;
        let mut outcomes = vec![host.startup_finished().await];
        for event in events {
            outcomes.push(host.trigger_activation_event(event).await);
        }
        for outcome in outcomes {
            for (id, reason) in outcome.failed {
                error!(id = %id, error = %reason, "Activation failed");
            }
        }

        if !json {
            for id in host.loaded_ids() {
                let Some(loaded) = host.loaded(&id) else {
                    continue;
                };
                let status = match &loaded.activated_by {
                    Some(event) => format!("activated by {}", event),
                    None => "not activated".to_string(),
                };
                println!("{} ({})", id, status);
                for warning in &loaded.load_warnings {
                    println!("  warning: {}", warning);
                }
            }
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&surface.snapshot())?);
        report_cleanup(manager.shutdown().await);
        return Ok(());
    }

    println!();
    println!("Languages:");
    for lang in surface.languages() {
        println!("  {} [{}] {}", lang.id, lang.extension_id, lang.extensions.join(" "));
    }
    println!("Grammars:");
    for grammar in surface.grammars() {
        println!("  {} [{}]", grammar.scope_name, grammar.extension_id);
    }
    println!("Themes:");
    for theme in surface.themes() {
        println!("  {} ({}) [{}]", theme.label, theme.ui_theme, theme.extension_id);
    }
    println!("Snippets:");
    for snippets in surface.snippets() {
        println!(
            "  {} snippet(s) for {} [{}]",
            snippets.snippets.len(),
            snippets.language.as_deref().unwrap_or("all languages"),
            snippets.extension_id
        );
    }
    println!("Icon themes:");
    for theme in surface.icon_themes() {
        println!("  {} [{}]", theme.label, theme.extension_id);
    }
    println!("Webview views:");
    for view in surface.webview_views() {
        println!("  {}/{} [{}]", view.container_id, view.view_id, view.extension_id);
    }

    report_cleanup(manager.shutdown().await);
    Ok(())
}

/// Write a default configuration file for the current directory
fn cmd_init(force: bool) -> anyhow::Result<()> {
    let config_file = PathBuf::from(config::PROJECT_CONFIG);
    if config_file.exists() && !force {
        error!("Configuration already exists. Use --force to overwrite.");
        return Ok(());
    }
    if let Some(parent) = config_file.parent() {
        fs::create_dir_all(parent)?;
    }

    let yaml = config::to_yaml(&ExtkitConfig::default())?;
    fs::write(&config_file, format!("# extkit configuration\n{}", yaml))?;
    info!(path = ?config_file, "Wrote configuration");
    Ok(())
}

fn cmd_config(config: &ExtkitConfig, yaml: bool) -> anyhow::Result<()> {
    if yaml {
        print!("{}", config::to_yaml(config)?);
        return Ok(());
    }
    println!("extkit Configuration\n");
    println!("Extensions:");
    println!("  Root: {:?}", config.extensions.root);
    println!("  Registry: {}", config.extensions.registry_url);
    println!("  API version: {}", config.extensions.api_version);
    println!(
        "  Install timeout: {}s",
        config.extensions.install_timeout_secs
    );
    println!(
        "  Auto-uninstall delay: {}s",
        config.extensions.auto_uninstall_delay_secs
    );
    println!(
        "  Health sweep interval: {}s",
        config.extensions.health_sweep_interval_secs
    );
    println!();
    println!("Health:");
    println!(
        "  Disable after: {} consecutive failures",
        config.health.disable_after_failures
    );
    println!(
        "  Uninstall after: {} failures",
        config.health.uninstall_after_failures
    );
    Ok(())
}

fn report_cleanup(cleanup: extkit::dispose::Cleanup) {
    for warning in cleanup.warnings {
        warn!(warning = %warning, "Cleanup warning");
    }
}
