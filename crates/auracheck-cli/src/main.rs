//! `auracheck` — command-line client for the AuraCheck attendance daemon.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use zbus::Connection;

mod setup;

const BUS_NAME: &str = "org.auracheck.Attendance1";
const OBJECT_PATH: &str = "/org/auracheck/Attendance1";
const INTERFACE: &str = "org.auracheck.Attendance1";

#[derive(Parser)]
#[command(name = "auracheck", about = "AuraCheck attendance verification CLI")]
struct Cli {
    /// Talk to the daemon on the session bus instead of the system bus.
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download the analysis model weights and pin the integrity lockfile.
    Setup {
        /// Target directory (defaults to the platform model directory).
        #[arg(long)]
        model_dir: Option<String>,
    },
    /// Verify the downloaded models against the integrity lockfile.
    VerifyModels {
        #[arg(long)]
        model_dir: Option<String>,
    },
    /// Show daemon status.
    Status,
    /// Register a subject's reference face from an image file.
    Register {
        subject_id: String,
        image: PathBuf,
    },
    /// Set a subject's attendance PIN.
    SetPin { subject_id: String, pin: String },
    /// Run a full attendance verification from an image file.
    Verify {
        subject_id: String,
        session_id: String,
        image: PathBuf,
        /// Current latitude in decimal degrees.
        #[arg(long)]
        latitude: Option<f64>,
        /// Current longitude in decimal degrees.
        #[arg(long)]
        longitude: Option<f64>,
        /// Authorized locations as a JSON array
        /// (e.g. '[{"latitude":41.4,"longitude":2.2,"radius":100,"name":"Lab"}]').
        #[arg(long)]
        locations: Option<String>,
        /// Optional PIN code.
        #[arg(long)]
        pin: Option<String>,
        /// Identifier of the capturing device.
        #[arg(long)]
        device_id: Option<String>,
    },
    /// Show a subject's attendance history.
    History { subject_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Setup { model_dir } => setup::run(model_dir),
        Command::VerifyModels { model_dir } => setup::verify(model_dir),
        Command::Status => {
            let proxy = proxy(cli.session).await?;
            let status: String = proxy.call("Status", &()).await?;
            print_json(&status);
            Ok(())
        }
        Command::Register { subject_id, image } => {
            let bytes = read_image(&image)?;
            let proxy = proxy(cli.session).await?;
            let response: String = proxy
                .call("RegisterFace", &(subject_id.as_str(), bytes))
                .await
                .context("registration failed")?;
            print_json(&response);
            Ok(())
        }
        Command::SetPin { subject_id, pin } => {
            let proxy = proxy(cli.session).await?;
            proxy
                .call::<_, _, ()>("SetPin", &(subject_id.as_str(), pin.as_str()))
                .await
                .context("failed to set PIN")?;
            println!("PIN updated for {subject_id}");
            Ok(())
        }
        Command::Verify {
            subject_id,
            session_id,
            image,
            latitude,
            longitude,
            locations,
            pin,
            device_id,
        } => {
            let bytes = read_image(&image)?;

            let authorized_locations: serde_json::Value = match locations {
                Some(json) => serde_json::from_str(&json)
                    .context("--locations is not a valid JSON array")?,
                None => serde_json::Value::Array(vec![]),
            };

            let request = serde_json::json!({
                "subject_id": subject_id,
                "session_id": session_id,
                "latitude": latitude,
                "longitude": longitude,
                "authorized_locations": authorized_locations,
                "pin_code": pin,
                "device_id": device_id,
            });

            let proxy = proxy(cli.session).await?;
            let response: String = proxy
                .call("VerifyAttendance", &(request.to_string().as_str(), bytes))
                .await
                .context("verification failed")?;
            print_json(&response);
            Ok(())
        }
        Command::History { subject_id } => {
            let proxy = proxy(cli.session).await?;
            let history: String = proxy
                .call("AttendanceHistory", &(subject_id.as_str(),))
                .await?;
            print_json(&history);
            Ok(())
        }
    }
}

async fn proxy(session: bool) -> Result<zbus::Proxy<'static>> {
    let connection = if session {
        Connection::session().await
    } else {
        Connection::system().await
    }
    .context("failed to connect to D-Bus — is auracheckd running?")?;

    zbus::Proxy::new(&connection, BUS_NAME, OBJECT_PATH, INTERFACE)
        .await
        .context("failed to create daemon proxy")
}

fn read_image(path: &PathBuf) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read image {}", path.display()))
}

/// Pretty-print a JSON response, falling back to raw output.
fn print_json(raw: &str) {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(pretty) => println!("{pretty}"),
            Err(_) => println!("{raw}"),
        },
        Err(_) => println!("{raw}"),
    }
}
