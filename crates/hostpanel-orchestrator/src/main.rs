//! `hostpanel` operator CLI.
//!
//! Registers domains, databases and users, and drives projects through
//! provisioning and their lifecycle on this host.

#![allow(clippy::print_stdout)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dialoguer::Confirm;
use rand::RngExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use hostpanel_core::tracing_init::init_tracing;
use hostpanel_orchestrator::{
    Database, Engine, Framework, Orchestrator, ProjectStatus, Providers,
};

const GENERATED_PASSWORD_LEN: usize = 24;

/// Site provisioning and lifecycle for a single host.
#[derive(Debug, Parser)]
#[command(name = "hostpanel", version, about)]
struct Cli {
    /// Configuration file, replacing the per-user one
    #[arg(long, global = true, env = "HOSTPANEL_CONFIG")]
    config: Option<PathBuf>,

    /// Registry database path
    #[arg(long, global = true, env = "HOSTPANEL_REGISTRY")]
    registry: Option<PathBuf>,

    /// Output logs as JSON
    #[arg(long, global = true, env = "HOSTPANEL_LOG_JSON")]
    log_json: bool,

    /// Do not ask before destructive operations
    #[arg(long, short = 'y', global = true)]
    yes: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Manage domains
    #[command(subcommand)]
    Domain(DomainCommand),
    /// Manage database users
    #[command(subcommand)]
    DbUser(DbUserCommand),
    /// Manage databases
    #[command(subcommand)]
    Db(DbCommand),
    /// Manage projects
    #[command(subcommand)]
    Project(ProjectCommand),
}

#[derive(Debug, Subcommand)]
enum DomainCommand {
    /// Register a domain
    Add {
        domain: String,
        /// Registrar or DNS provider, for the operator's records
        #[arg(long)]
        provider: Option<String>,
    },
    List,
    /// Remove a domain that no project uses
    Remove { domain: String },
}

#[derive(Debug, Args)]
struct EngineArg {
    /// mysql or postgresql
    #[arg(long, default_value = "mysql", value_parser = parse_engine)]
    engine: Engine,
}

#[derive(Debug, Subcommand)]
enum DbUserCommand {
    /// Create a user on the engine
    Add {
        username: String,
        /// Generated when omitted
        #[arg(long, env = "HOSTPANEL_DB_PASSWORD", hide_env_values = true)]
        password: Option<String>,
        #[command(flatten)]
        engine: EngineArg,
    },
    List {
        #[arg(long, value_parser = parse_engine)]
        engine: Option<Engine>,
    },
    Remove {
        username: String,
        #[command(flatten)]
        engine: EngineArg,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    /// Create a database owned by an existing user
    Add {
        name: String,
        #[arg(long)]
        owner: String,
        #[command(flatten)]
        engine: EngineArg,
    },
    List {
        #[arg(long, value_parser = parse_engine)]
        engine: Option<Engine>,
    },
    Remove {
        name: String,
        #[command(flatten)]
        engine: EngineArg,
    },
    /// Show live size and table count
    Stats {
        name: String,
        #[command(flatten)]
        engine: EngineArg,
    },
}

#[derive(Debug, Subcommand)]
enum ProjectCommand {
    /// Register a project on a domain
    Create {
        domain: String,
        /// php, laravel or wordpress
        #[arg(long, value_parser = parse_framework)]
        framework: Framework,
        /// Database to bind, as created with `db add`
        #[arg(long)]
        database: Option<String>,
        #[arg(long, default_value = "mysql", value_parser = parse_engine)]
        database_engine: Engine,
    },
    /// Extract an application archive into the project root
    Upload { domain: String, archive: PathBuf },
    /// Deploy the project
    Provision { domain: String },
    Suspend { domain: String },
    Restart { domain: String },
    /// Tear down the project's host artifacts and remove it
    Delete { domain: String },
    Status { domain: String },
    List {
        #[arg(long, value_parser = parse_status)]
        status: Option<ProjectStatus>,
    },
}

fn parse_engine(s: &str) -> Result<Engine, String> {
    s.parse()
}

fn parse_framework(s: &str) -> Result<Framework, String> {
    s.parse()
}

fn parse_status(s: &str) -> Result<ProjectStatus, String> {
    s.parse()
}

/// Random alphanumeric password.
fn generate_password(len: usize) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect()
}

fn confirm(prompt: &str, assume_yes: bool) -> Result<bool> {
    if assume_yes {
        return Ok(true);
    }
    Ok(Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = hostpanel_core::config::load_config(cli.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(registry) = cli.registry.clone() {
        config.paths.registry = registry;
    }
    init_tracing(&config.log.filter, cli.log_json || config.log.json);

    if let Some(parent) = config.paths.registry.parent() {
        std::fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create registry directory {}", parent.display())
        })?;
    }
    let registry = Database::open(&config.paths.registry)
        .await
        .with_context(|| format!("Failed to open registry {}", config.paths.registry.display()))?;
    let providers = Providers::host(&config);
    let orch = Orchestrator::new(registry, providers, config)?;

    match cli.command {
        Commands::Domain(cmd) => domain(&orch, cmd, cli.yes).await,
        Commands::DbUser(cmd) => db_user(&orch, cmd, cli.yes).await,
        Commands::Db(cmd) => db(&orch, cmd, cli.yes).await,
        Commands::Project(cmd) => project(&orch, cmd, cli.yes).await,
    }
}

async fn domain(orch: &Orchestrator, cmd: DomainCommand, yes: bool) -> Result<()> {
    match cmd {
        DomainCommand::Add { domain, provider } => {
            let d = orch.create_domain(&domain, provider.as_deref()).await?;
            println!("Domain {} registered", d.domain);
        }
        DomainCommand::List => {
            let domains = orch.list_domains().await?;
            println!("{:<40} {:<16} {:>12}", "DOMAIN", "PROVIDER", "SSL RENEWED");
            for d in domains {
                println!(
                    "{:<40} {:<16} {:>12}",
                    d.domain,
                    d.domain_provider.as_deref().unwrap_or("-"),
                    d.ssl_renewed_at.map_or_else(|| "-".to_string(), |t| t.to_string())
                );
            }
        }
        DomainCommand::Remove { domain } => {
            if confirm(&format!("Remove domain {domain}?"), yes)? {
                orch.delete_domain(&domain).await?;
                println!("Domain {domain} removed");
            }
        }
    }
    Ok(())
}

async fn db_user(orch: &Orchestrator, cmd: DbUserCommand, yes: bool) -> Result<()> {
    match cmd {
        DbUserCommand::Add {
            username,
            password,
            engine: EngineArg { engine },
        } => {
            let generated = password.is_none();
            let password = password.unwrap_or_else(|| generate_password(GENERATED_PASSWORD_LEN));
            let user = orch.create_db_user(&username, &password, engine).await?;
            println!("User {} created on {}", user.username, user.engine);
            if generated {
                println!("Password: {password}");
            }
        }
        DbUserCommand::List { engine } => {
            println!("{:<34} {:<12}", "USERNAME", "ENGINE");
            for user in orch.list_db_users(engine).await? {
                println!("{:<34} {:<12}", user.username, user.engine.as_str());
            }
        }
        DbUserCommand::Remove {
            username,
            engine: EngineArg { engine },
        } => {
            if confirm(&format!("Drop {engine} user {username}?"), yes)? {
                orch.delete_db_user(&username, engine).await?;
                println!("User {username} removed");
            }
        }
    }
    Ok(())
}

async fn db(orch: &Orchestrator, cmd: DbCommand, yes: bool) -> Result<()> {
    match cmd {
        DbCommand::Add {
            name,
            owner,
            engine: EngineArg { engine },
        } => {
            let record = orch.create_database(&name, engine, &owner).await?;
            println!("Database {} created on {}", record.name, record.engine);
        }
        DbCommand::List { engine } => {
            println!("{:<64} {:<12}", "NAME", "ENGINE");
            for record in orch.list_databases(engine).await? {
                println!("{:<64} {:<12}", record.name, record.engine.as_str());
            }
        }
        DbCommand::Remove {
            name,
            engine: EngineArg { engine },
        } => {
            if confirm(
                &format!("Drop {engine} database {name} and all its data?"),
                yes,
            )? {
                orch.delete_database(&name, engine).await?;
                println!("Database {name} removed");
            }
        }
        DbCommand::Stats {
            name,
            engine: EngineArg { engine },
        } => {
            let stats = orch.database_stats(&name, engine).await?;
            println!("{name}: {:.2} MB, {} tables", stats.size_mb, stats.table_count);
        }
    }
    Ok(())
}

async fn project(orch: &Orchestrator, cmd: ProjectCommand, yes: bool) -> Result<()> {
    match cmd {
        ProjectCommand::Create {
            domain,
            framework,
            database,
            database_engine,
        } => {
            let database = database.as_deref().map(|name| (name, database_engine));
            let p = orch.create_project(&domain, framework, database).await?;
            println!("Project {} created at {}", p.project_name, p.root_directory);
        }
        ProjectCommand::Upload { domain, archive } => {
            let p = orch.find_project(&domain).await?;
            let p = orch
                .receive_archive(p.id, &archive)
                .await
                .with_context(|| format!("Failed to deliver {}", archive.display()))?;
            println!("{}: {}", p.project_name, p.status.label());
        }
        ProjectCommand::Provision { domain } => {
            let p = orch.find_project(&domain).await?;
            let cancel = CancellationToken::new();
            let watcher = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, stopping after the current step");
                    watcher.cancel();
                }
            });
            let p = orch.provision_with_cancel(p.id, &cancel).await?;
            println!("{}: {}", p.project_name, p.status.label());
        }
        ProjectCommand::Suspend { domain } => {
            let p = orch.find_project(&domain).await?;
            orch.suspend(p.id).await?;
            println!("{}: {}", p.project_name, orch.status(p.id).await?.label());
        }
        ProjectCommand::Restart { domain } => {
            let p = orch.find_project(&domain).await?;
            orch.restart(p.id).await?;
            println!("{}: {}", p.project_name, orch.status(p.id).await?.label());
        }
        ProjectCommand::Delete { domain } => {
            let p = orch.find_project(&domain).await?;
            if !confirm(
                &format!("Delete {} and remove its files from this host?", p.domain),
                yes,
            )? {
                return Ok(());
            }
            let report = orch.delete(p.id).await?;
            for w in &report.warnings {
                warn!(warning = %w, "teardown");
            }
            info!(project = %p.project_name, "deleted");
            println!("Project {} deleted", p.project_name);
        }
        ProjectCommand::Status { domain } => {
            let p = orch.find_project(&domain).await?;
            println!("{}: {}", p.project_name, p.status.label());
            if let Some(err) = p.last_error {
                println!("Last error: {err}");
            }
        }
        ProjectCommand::List { status } => {
            println!(
                "{:<6} {:<40} {:<10} {:<16}",
                "ID", "DOMAIN", "FRAMEWORK", "STATUS"
            );
            for p in orch.list_projects(status).await? {
                println!(
                    "{:<6} {:<40} {:<10} {:<16}",
                    p.id,
                    p.domain,
                    p.framework.as_str(),
                    p.status.label()
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_db_add() {
        let cli = Cli::try_parse_from([
            "hostpanel",
            "db",
            "add",
            "app_db",
            "--owner",
            "app_user",
            "--engine",
            "postgresql",
        ])
        .unwrap();
        match cli.command {
            Commands::Db(DbCommand::Add {
                name,
                owner,
                engine: EngineArg { engine },
            }) => {
                assert_eq!(name, "app_db");
                assert_eq!(owner, "app_user");
                assert_eq!(engine, Engine::Postgresql);
            }
            other => panic!("expected db add, got {other:?}"),
        }
    }

    #[test]
    fn parse_db_user_remove_with_global_yes() {
        let cli = Cli::try_parse_from(["hostpanel", "db-user", "remove", "app_user", "-y"]).unwrap();
        assert!(cli.yes);
        assert!(matches!(
            cli.command,
            Commands::DbUser(DbUserCommand::Remove { ref username, .. }) if username == "app_user"
        ));
    }

    #[test]
    fn parse_project_create_with_database() {
        let cli = Cli::try_parse_from([
            "hostpanel",
            "project",
            "create",
            "shop.example.com",
            "--framework",
            "wordpress",
            "--database",
            "shop_db",
        ])
        .unwrap();
        match cli.command {
            Commands::Project(ProjectCommand::Create {
                framework,
                database,
                database_engine,
                ..
            }) => {
                assert_eq!(framework, Framework::Wordpress);
                assert_eq!(database.as_deref(), Some("shop_db"));
                assert_eq!(database_engine, Engine::Mysql);
            }
            other => panic!("expected project create, got {other:?}"),
        }
    }

    #[test]
    fn generated_passwords_are_alphanumeric() {
        let password = generate_password(GENERATED_PASSWORD_LEN);
        assert_eq!(password.len(), GENERATED_PASSWORD_LEN);
        assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
