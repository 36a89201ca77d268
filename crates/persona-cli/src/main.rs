use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

// D-Bus proxy: `#[zbus::proxy]` generates `AnalyzerProxy` (async) and a
// blocking twin. Only the async variant is used here.
#[zbus::proxy(
    interface = "org.persona.Analyzer1",
    default_service = "org.persona.Analyzer1",
    default_path = "/org/persona/Analyzer1"
)]
trait Analyzer {
    async fn analyze_frames(&self, frames: Vec<Vec<u8>>) -> zbus::fdo::Result<String>;
    async fn analyze_single(&self, frame: Vec<u8>) -> zbus::fdo::Result<String>;
    async fn status(&self) -> zbus::fdo::Result<String>;
}

#[derive(Parser)]
#[command(name = "persona", about = "Persona face-attribute analysis CLI")]
struct Cli {
    /// Seconds to wait for the daemon to answer
    #[arg(long, global = true, default_value_t = 90)]
    timeout: u64,
    /// Pretty-print the JSON reply
    #[arg(long, global = true)]
    pretty: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fuse a decision across several images of the same person
    Analyze {
        /// Image files (PNG, JPEG, ...)
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Analyze one image and report which detector decided
    Single {
        file: PathBuf,
    },
    /// Show daemon status
    Status,
}

/// Exit status when the daemon rejected the request's input.
const EXIT_REJECTED: u8 = 2;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let conn = zbus::connection::Builder::session()?
        .method_timeout(Duration::from_secs(cli.timeout))
        .build()
        .await
        .context("failed to connect to the session bus")?;
    let proxy = AnalyzerProxy::new(&conn).await?;

    let reply = match cli.command {
        Commands::Analyze { files } => {
            let mut frames = Vec::with_capacity(files.len());
            for path in &files {
                frames.push(read_image(path).await?);
            }
            tracing::debug!(count = frames.len(), "sending frames");
            proxy.analyze_frames(frames).await
        }
        Commands::Single { file } => {
            let frame = read_image(&file).await?;
            proxy.analyze_single(frame).await
        }
        Commands::Status => proxy.status().await,
    };

    match reply {
        Ok(json) => {
            println!("{}", render(&json, cli.pretty));
            Ok(ExitCode::SUCCESS)
        }
        Err(zbus::fdo::Error::InvalidArgs(report)) => {
            eprintln!("{}", render(&report, cli.pretty));
            Ok(ExitCode::from(EXIT_REJECTED))
        }
        Err(zbus::fdo::Error::Failed(report)) => {
            eprintln!("{}", render(&report, cli.pretty));
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e).context("call to personad failed"),
    }
}

async fn read_image(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))
}

/// Reformat `raw` when it is JSON and pretty output was asked for.
fn render(raw: &str, pretty: bool) -> String {
    if !pretty {
        return raw.to_string();
    }
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|v| serde_json::to_string_pretty(&v).ok())
        .unwrap_or_else(|| raw.to_string())
}
