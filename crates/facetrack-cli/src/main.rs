use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facetrack_hw::{Camera, CameraConfig};
use std::path::PathBuf;

#[zbus::proxy(
    interface = "org.facetrack.Recognition1",
    default_service = "org.facetrack.Recognition1",
    default_path = "/org/facetrack/Recognition1"
)]
trait Recognition {
    async fn start(&self, start_time: &str, end_time: &str) -> zbus::Result<String>;
    async fn stop(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
    async fn cached_identities(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "facetrack", about = "facetrack visitor recognition CLI")]
struct Cli {
    /// Talk to the daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start recognition, optionally limited to a daily window (needs both
    /// --from and --until; with only one the daemon runs continuously)
    Start {
        /// Window start (HH:MM, 24-hour)
        #[arg(long)]
        from: Option<String>,
        /// Window end (HH:MM, 24-hour); may be earlier than --from for overnight windows
        #[arg(long)]
        until: Option<String>,
    },
    /// Stop recognition
    Stop,
    /// Show worker status
    Status,
    /// List identities whose repeat visits are currently suppressed
    Cached,
    /// Run camera diagnostics (bypasses the daemon)
    Test {
        /// Camera device
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        /// Save the captured frame as PNG
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Test { device, snapshot } => camera_test(&device, snapshot.as_deref()),
        command => {
            let conn = if cli.system {
                zbus::Connection::system().await
            } else {
                zbus::Connection::session().await
            }
            .context("cannot connect to D-Bus")?;
            let proxy = RecognitionProxy::new(&conn)
                .await
                .context("facetrackd is not reachable")?;
            run_remote(&proxy, command).await
        }
    }
}

async fn run_remote(proxy: &RecognitionProxy<'_>, command: Commands) -> Result<()> {
    let reply = match command {
        Commands::Start { from, until } => {
            proxy
                .start(from.as_deref().unwrap_or(""), until.as_deref().unwrap_or(""))
                .await?
        }
        Commands::Stop => proxy.stop().await?,
        Commands::Status => {
            let status: serde_json::Value = serde_json::from_str(&proxy.status().await?)?;
            let flag = |key: &str| status.get(key).and_then(|v| v.as_bool()).unwrap_or(false);
            println!("running:   {}", flag("running"));
            println!("scheduled: {}", flag("scheduled"));
            return Ok(());
        }
        Commands::Cached => {
            let entries: Vec<serde_json::Value> =
                serde_json::from_str(&proxy.cached_identities().await?)?;
            if entries.is_empty() {
                println!("No identities cached");
            }
            for entry in entries {
                println!(
                    "{}  expires in {}s",
                    entry["identity_id"].as_str().unwrap_or("?"),
                    entry["expires_in_secs"].as_u64().unwrap_or(0)
                );
            }
            return Ok(());
        }
        Commands::Test { .. } => bail!("camera diagnostics run locally"),
    };
    report(&reply)
}

/// Print a `{status, message}` reply; an error status fails the command.
fn report(reply: &str) -> Result<()> {
    let value: serde_json::Value =
        serde_json::from_str(reply).with_context(|| format!("unexpected reply: {reply}"))?;
    let message = value["message"].as_str().unwrap_or(reply);
    if value["status"] == "error" {
        bail!("{message}");
    }
    println!("{message}");
    Ok(())
}

fn camera_test(device: &str, snapshot: Option<&std::path::Path>) -> Result<()> {
    println!("Running camera diagnostics...");

    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for info in &devices {
        println!("  {}  {} ({}, {})", info.path, info.name, info.driver, info.bus);
    }

    tracing::debug!(device, "opening camera");
    let config = CameraConfig {
        device: device.to_string(),
        ..CameraConfig::default()
    };
    let mut camera = Camera::open(&config).with_context(|| format!("cannot open {device}"))?;
    let frame = camera.capture_frame().context("frame capture failed")?;

    println!(
        "Captured {}x{} frame #{}: avg brightness {:.1}{}",
        frame.width,
        frame.height,
        frame.sequence,
        frame.avg_brightness(),
        if frame.is_dark() { " (dark, would be skipped)" } else { "" }
    );

    if let Some(path) = snapshot {
        let image = image::GrayImage::from_raw(frame.width, frame.height, frame.data)
            .context("frame buffer does not match its dimensions")?;
        image
            .save(path)
            .with_context(|| format!("cannot write {}", path.display()))?;
        println!("Snapshot saved to {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report() {
        assert!(report(r#"{"status":"success","message":"Recognition stopped."}"#).is_ok());
        let err = report(r#"{"status":"error","message":"Recognition not running."}"#).unwrap_err();
        assert_eq!(err.to_string(), "Recognition not running.");
        assert!(report("garbage").is_err());
    }

    #[test]
    fn test_start_time_arguments() {
        // A lone --from is forwarded; the daemon decides it means continuous.
        assert!(Cli::try_parse_from(["facetrack", "start", "--from", "08:00"]).is_ok());
        assert!(Cli::try_parse_from(["facetrack", "start", "--from", "22:00", "--until", "06:00"]).is_ok());
        assert!(Cli::try_parse_from(["facetrack", "start"]).is_ok());
    }
}
