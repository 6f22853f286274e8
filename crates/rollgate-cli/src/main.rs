use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

// `#[zbus::proxy]` generates `StationProxy` for the daemon's interface.
#[zbus::proxy(
    interface = "org.rollgate.Station1",
    default_service = "org.rollgate.Station1",
    default_path = "/org/rollgate/Station1"
)]
trait Station {
    async fn scan(&self, card_id: &str) -> zbus::Result<String>;
    async fn cancel(&self) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
    async fn last_verdicts(&self, count: u32) -> zbus::Result<String>;
    async fn pending_ledger_count(&self) -> zbus::Result<u32>;
    async fn pending_evidence_count(&self) -> zbus::Result<u32>;
    async fn invalidate_card(&self, card_id: &str) -> zbus::Result<bool>;
    async fn resume(&self) -> zbus::Result<bool>;
}

#[derive(Parser)]
#[command(name = "rollgate", about = "Rollgate attendance station CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show station state, health and local queue depths
    Status,
    /// Show the most recent verdicts, newest first
    Verdicts {
        #[arg(short = 'n', long, default_value_t = 10)]
        count: u32,
    },
    /// Show records and evidence waiting for the shared store
    Pending,
    /// Submit a card scan by hand and wait for the verdict
    Scan {
        /// Card identifier as the reader would send it
        card_id: String,
    },
    /// Abandon the open verification session
    Cancel,
    /// Drop a cached directory entry after re-enrollment
    Invalidate { card_id: String },
    /// Clear a station fault after fixing the hardware
    Resume,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus")?;
    let station = StationProxy::new(&conn)
        .await
        .context("rollgated is not reachable")?;

    match cli.command {
        Commands::Status => {
            print_json(&station.status().await?)?;
        }
        Commands::Verdicts { count } => {
            print_json(&station.last_verdicts(count).await?)?;
        }
        Commands::Pending => {
            println!("ledger:   {}", station.pending_ledger_count().await?);
            println!("evidence: {}", station.pending_evidence_count().await?);
        }
        Commands::Scan { card_id } => {
            tracing::debug!(card = %card_id, "submitting scan");
            print_json(&station.scan(&card_id).await?)?;
        }
        Commands::Cancel => {
            if station.cancel().await? {
                println!("session cancelled");
            } else {
                println!("no session open");
            }
        }
        Commands::Invalidate { card_id } => {
            if station.invalidate_card(&card_id).await? {
                println!("{card_id}: cache entry dropped");
            } else {
                println!("{card_id}: not cached");
            }
        }
        Commands::Resume => {
            if station.resume().await? {
                println!("station resumed");
            } else {
                println!("station was not faulted");
            }
        }
    }

    Ok(())
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("daemon sent invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_verdicts_count() {
        let cli = Cli::try_parse_from(["rollgate", "verdicts", "-n", "3"]).unwrap();
        assert!(matches!(cli.command, Commands::Verdicts { count: 3 }));

        let cli = Cli::try_parse_from(["rollgate", "--session", "verdicts"]).unwrap();
        assert!(cli.session);
        assert!(matches!(cli.command, Commands::Verdicts { count: 10 }));
    }

    #[test]
    fn test_scan_requires_card() {
        assert!(Cli::try_parse_from(["rollgate", "scan"]).is_err());
        let cli = Cli::try_parse_from(["rollgate", "scan", "A1"]).unwrap();
        assert!(matches!(cli.command, Commands::Scan { card_id } if card_id == "A1"));
    }
}
