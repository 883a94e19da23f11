use anvil_server::db::Db;
use anvil_server::{run, ServerConfig, ServerError};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::error;
use tracing_subscriber::{fmt, layer::SubscriberExt, registry, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about = "Anvil bare-metal provisioning engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Verbose output - shows debug-level logs
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the Anvil server
    Serve(ServeArgs),
    /// Apply pending schema migrations and exit
    Migrate(DbArgs),
    /// Show database status
    Status(DbArgs),
}

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:42113")]
    bind: SocketAddr,

    /// Path to the SQLite database file
    #[arg(long, default_value = "anvil.db")]
    database: String,

    /// Refuse to start when migrations are pending instead of applying
    /// them automatically
    #[arg(long, default_value_t = false)]
    no_auto_migrate: bool,

    /// Timeout sweep interval in seconds
    #[arg(long, default_value_t = 1)]
    sweep_interval: u64,
}

#[derive(Parser, Debug)]
struct DbArgs {
    /// Path to the SQLite database file
    #[arg(long, default_value = "anvil.db")]
    database: String,
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "anvil={level},anvil_server={level},tower_http=warn,sqlx=warn,hyper=warn",
            level = default_level
        ))
    });
    registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    let code = runtime.block_on(async_main(cli));
    std::process::exit(code);
}

async fn async_main(cli: Cli) -> i32 {
    match cli.command {
        None => {
            println!("Anvil bare-metal provisioning engine");
            println!();
            println!("Run 'anvil serve' to start the server, or 'anvil --help' for usage.");
            0
        }

        Some(Commands::Serve(args)) => {
            let config = ServerConfig {
                bind: args.bind,
                database_path: args.database,
                auto_migrate: !args.no_auto_migrate,
                sweep_interval: Duration::from_secs(args.sweep_interval.max(1)),
                ..ServerConfig::default()
            };
            match run(config).await {
                Ok(()) => 0,
                Err(e @ ServerError::Startup(_)) => {
                    error!("{}", e);
                    1
                }
                Err(e @ ServerError::Runtime(_)) => {
                    error!("{}", e);
                    2
                }
            }
        }

        Some(Commands::Migrate(args)) => match migrate(&args.database).await {
            Ok(applied) => {
                println!("applied {} migration(s)", applied);
                0
            }
            Err(e) => {
                error!("migration failed: {:#}", e);
                1
            }
        },

        Some(Commands::Status(args)) => match status(&args.database).await {
            Ok(()) => 0,
            Err(e) => {
                error!("status check failed: {:#}", e);
                1
            }
        },
    }
}

async fn migrate(database: &str) -> anyhow::Result<usize> {
    let db = Db::open(database).await?;
    Ok(db.migrate().await?)
}

async fn status(database: &str) -> anyhow::Result<()> {
    let db = Db::open(database).await?;
    let required = db.required_migrations().await?;

    println!("Anvil Status");
    println!();
    println!("  Database:           {}", database);
    if required.is_empty() {
        println!("  Schema:             up to date");
    } else {
        println!("  Schema:             {} migration(s) pending", required.len());
        for id in &required {
            println!("    - {}", id);
        }
        return Ok(());
    }

    let workflows = db.list_workflows().await?;
    let active = workflows.iter().filter(|w| !w.state.is_terminal()).count();
    println!("  Templates:          {}", db.list_templates(None).await?.len());
    println!("  Hardware records:   {}", db.list_hardware().await?.len());
    println!("  Workflows:          {} ({} active)", workflows.len(), active);
    Ok(())
}
