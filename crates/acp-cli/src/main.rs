//! Operator CLI for the access-control core.

use anyhow::Result;
use clap::{Parser, Subcommand};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "acp")]
#[command(about = "Access-control platform operator CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Outbox maintenance
    Outbox {
        #[command(subcommand)]
        cmd: OutboxCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    /// Connectivity + schema presence check
    Status,
    /// Apply embedded migrations
    Migrate,
}

#[derive(Subcommand)]
enum OutboxCmd {
    /// Queue depth and age snapshot
    Stats,
    /// Put FAILED events back into rotation (optionally one tenant)
    Rehydrate {
        #[arg(long)]
        org: Option<Uuid>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => match cmd {
            DbCmd::Status => {
                let pool = acp_db::connect_from_env().await?;
                let st = acp_db::status(&pool).await?;
                println!("connectivity: {}", if st.ok { "ok" } else { "FAILED" });
                println!(
                    "schema:       {}",
                    if st.has_outbox_table {
                        "present"
                    } else {
                        "missing (run `acp db migrate`)"
                    }
                );
            }
            DbCmd::Migrate => {
                let pool = acp_db::connect_from_env().await?;
                acp_db::migrate(&pool).await?;
                println!("migrations applied");
            }
        },

        Commands::Outbox { cmd } => {
            let cfg = acp_config::CoreConfig::from_env()?;
            let pool = acp_db::connect(&cfg.database_url).await?;
            match cmd {
                OutboxCmd::Stats => {
                    let s = acp_db::outbox_stats(&pool, cfg.lock_ttl).await?;
                    println!("pending:  {}", s.pending);
                    println!("ready:    {}", s.ready);
                    println!("inflight: {}", s.inflight);
                    println!("failed:   {}", s.failed);
                    if let Some(age) = s.oldest_pending_age_secs {
                        println!("oldest pending age: {age}s");
                    }
                }
                OutboxCmd::Rehydrate { org } => {
                    let n = acp_db::outbox_rehydrate_failed(&pool, org).await?;
                    println!("rehydrated {n} event(s)");
                }
            }
        }
    }

    Ok(())
}
