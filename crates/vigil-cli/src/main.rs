use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use vigil_core::session::load_image;
use vigil_core::{
    Config, JsonEventLog, RecorderHandle, RegistryStore, Session, SessionError, SoundNotifier,
    VerificationReport,
};
use vigil_vision::OnnxProvider;

mod render;

use render::Annotator;

type AppSession = Session<OnnxProvider, RecorderHandle, SoundNotifier>;

#[derive(Parser)]
#[command(name = "vigil", version, about = "Face enrollment and verification")]
struct Cli {
    /// TOML config file (defaults apply when absent)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll an identity from an image
    Enroll {
        /// Identity name
        #[arg(short, long)]
        name: String,
        /// Image containing the face to enroll
        #[arg(short, long)]
        image: PathBuf,
    },
    /// Verify every face in one or more images
    Verify {
        #[arg(required = true)]
        images: Vec<PathBuf>,
        /// Skip writing annotated output images
        #[arg(long)]
        no_render: bool,
    },
    /// List enrolled identities
    List,
    /// Remove an enrolled identity
    Remove {
        #[arg(short, long)]
        name: String,
    },
    /// Print recorded events
    Events {
        /// Only the last N events
        #[arg(short, long)]
        tail: Option<usize>,
    },
    /// Menu-driven enroll/verify loop
    Interactive,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    tracing::debug!(?config, "configuration loaded");

    match cli.command {
        Commands::Enroll { name, image } => {
            let mut session = open_session(&config)?;
            enroll(&mut session, &name, &image)
        }
        Commands::Verify { images, no_render } => {
            let mut session = open_session(&config)?;
            verify_all(&mut session, &config, &images, !no_render)
        }
        Commands::List => {
            let names = RegistryStore::new(&config.registry_dir)
                .list()
                .context("failed to list identities")?;
            if names.is_empty() {
                println!("No identities enrolled");
            }
            for name in names {
                println!("{name}");
            }
            Ok(())
        }
        Commands::Remove { name } => {
            let removed = RegistryStore::new(&config.registry_dir)
                .remove(&name)
                .context("failed to remove identity")?;
            if !removed {
                bail!("no identity named {name:?}");
            }
            println!("Removed {name}");
            Ok(())
        }
        Commands::Events { tail } => {
            let mut records = JsonEventLog::new(&config.event_log)
                .load()
                .context("failed to read event log")?;
            if let Some(n) = tail {
                records.drain(..records.len().saturating_sub(n));
            }
            println!("{}", serde_json::to_string_pretty(&records)?);
            Ok(())
        }
        Commands::Interactive => {
            let mut session = open_session(&config)?;
            interactive(&mut session, &config)
        }
    }
}

fn open_session(config: &Config) -> Result<AppSession> {
    tracing::info!(dir = %config.model_dir.display(), "loading face models");
    let provider = OnnxProvider::load(&config.model_dir, config.detection_threshold)
        .context("failed to load face models")?;

    let recorder = RecorderHandle::spawn(JsonEventLog::new(&config.event_log))
        .context("failed to start event recorder")?;

    let notifier = SoundNotifier::new(
        &config.alert_sound,
        config.alert_player.clone(),
        Duration::from_secs(config.alert_timeout_secs),
    );

    Ok(Session::new(
        provider,
        RegistryStore::new(&config.registry_dir),
        recorder,
        notifier,
        config.similarity_threshold,
    ))
}

fn enroll(session: &mut AppSession, name: &str, image: &Path) -> Result<()> {
    let template = session
        .enroll(name, image)
        .with_context(|| format!("enrollment of {name:?} failed"))?;
    println!(
        "Registered {} ({} dimensions) in {}",
        template.name,
        template.embedding.len(),
        session.store().dir().display()
    );
    Ok(())
}

/// Each image is its own flow; only event log failures stop the batch.
fn verify_all(
    session: &mut AppSession,
    config: &Config,
    images: &[PathBuf],
    render_output: bool,
) -> Result<()> {
    let annotator = render_output.then(|| Annotator::new(&config.caption_font));
    let mut failed = 0usize;
    for path in images {
        match verify_one(session, config, path, annotator.as_ref()) {
            Ok(()) => {}
            Err(e) if is_log_failure(&e) => return Err(e),
            Err(e) => {
                let reason = format!("{e:#}");
                tracing::error!(image = %path.display(), %reason, "verification failed");
                failed += 1;
            }
        }
    }
    if failed > 0 {
        bail!("{failed} of {} image(s) could not be verified", images.len());
    }
    Ok(())
}

fn is_log_failure(e: &anyhow::Error) -> bool {
    matches!(
        e.downcast_ref::<SessionError>(),
        Some(SessionError::EventLog(_))
    )
}

/// Verify one image; with an annotator, also write the annotated copy.
fn verify_one(
    session: &mut AppSession,
    config: &Config,
    path: &Path,
    annotator: Option<&Annotator>,
) -> Result<()> {
    let image = load_image(path)?;
    let report = session.verify_frame(&path.display().to_string(), &image)?;
    print_report(&report);

    if let Some(annotator) = annotator {
        let out = render::write_annotated(image, &report, annotator, &config.output_dir)?;
        println!("Annotated image saved to {}", out.display());
    }
    Ok(())
}

fn print_report(report: &VerificationReport) {
    println!("{}: {} face(s)", report.source, report.faces.len());
    for face in &report.faces {
        let bbox = face.face.bbox;
        println!(
            "  #{} [{}, {}, {}, {}] det {:.2}  {}",
            face.face_index,
            bbox.x1,
            bbox.y1,
            bbox.x2,
            bbox.y2,
            face.face.det_score,
            face.caption()
        );
    }
    if report.any_unauthorised {
        println!("  ALERT: unauthorised face present");
    }
}

fn interactive(session: &mut AppSession, config: &Config) -> Result<()> {
    let annotator = Annotator::new(&config.caption_font);
    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    let mut prompt = |text: &str| -> Result<Option<String>> {
        print!("{text}");
        std::io::stdout().flush()?;
        Ok(lines.next().transpose()?.map(|l| l.trim().to_string()))
    };

    loop {
        println!();
        println!("=== vigil ===");
        println!("1 = Register new face");
        println!("2 = Run recognition on image");
        println!("q = Quit");
        let Some(choice) = prompt("Choose: ")? else {
            return Ok(());
        };

        let outcome = match choice.as_str() {
            "1" => {
                let (Some(name), Some(image)) =
                    (prompt("User name: ")?, prompt("Path to registration image: ")?)
                else {
                    return Ok(());
                };
                enroll(session, &name, Path::new(&image))
            }
            "2" => {
                let Some(image) = prompt("Path to image: ")? else {
                    return Ok(());
                };
                verify_one(session, config, Path::new(&image), Some(&annotator))
            }
            "q" | "Q" => return Ok(()),
            other => {
                println!("Invalid choice: {other:?}");
                Ok(())
            }
        };

        if let Err(e) = outcome {
            if is_log_failure(&e) {
                return Err(e);
            }
            eprintln!("error: {e:#}");
        }
    }
}
