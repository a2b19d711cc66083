use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

#[zbus::proxy(
    interface = "org.rollcall.Kiosk1",
    default_service = "org.rollcall.Kiosk1",
    default_path = "/org/rollcall/Kiosk1"
)]
trait Kiosk {
    async fn mark_attendance(&self, session_id: &str, frames: Vec<Vec<u8>>) -> zbus::Result<String>;
    async fn enroll_face(&self, identity_id: &str, frame: Vec<u8>) -> zbus::Result<String>;
    async fn list_records(&self, session_id: &str) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance kiosk CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session_bus: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mark attendance from one or more captured images
    Mark {
        /// Session to mark attendance for
        #[arg(short, long)]
        session: Uuid,
        /// Image files (JPEG or PNG), one per camera
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Add a training image for an identity
    Enroll {
        /// Identity the face belongs to
        #[arg(short, long)]
        identity: Uuid,
        /// Image file containing the face
        image: PathBuf,
    },
    /// List attendance records for a session
    Records {
        #[arg(short, long)]
        session: Uuid,
    },
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let builder = if cli.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let conn = builder
        .method_timeout(Duration::from_secs(30))
        .build()
        .await
        .context("connecting to D-Bus")?;
    let proxy = KioskProxy::new(&conn).await?;

    let reply = match cli.command {
        Commands::Mark { session, images } => {
            let frames = images
                .iter()
                .map(|p| read_image(p))
                .collect::<Result<Vec<_>>>()?;
            tracing::debug!(%session, frames = frames.len(), "calling MarkAttendance");
            proxy.mark_attendance(&session.to_string(), frames).await
        }
        Commands::Enroll { identity, image } => {
            let frame = read_image(&image)?;
            proxy.enroll_face(&identity.to_string(), frame).await
        }
        Commands::Records { session } => proxy.list_records(&session.to_string()).await,
        Commands::Status => proxy.status().await,
    }
    .context("rollcalld call failed (is the daemon running?)")?;

    println!("{}", pretty(&reply));
    Ok(())
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

/// Re-indent a JSON reply; anything else is printed as-is.
fn pretty(reply: &str) -> String {
    serde_json::from_str::<serde_json::Value>(reply)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|_| reply.to_string())
}
