use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, theme::ColorfulTheme};
use imgr_core::iso::IsoImage;
use imgr_core::{ContainerKind, Containers, ImageError, container};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{IsTerminal, stdout};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

#[derive(Parser)]
#[command(name = "imgr")]
#[command(about = "Browse, extract, and author disk images without mounting them", version)]
struct Cli {
    /// Overwrite existing outputs without asking
    #[arg(short = 'y', long = "yes", global = true)]
    yes: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report the container format of an image
    Detect {
        #[arg(required = true)]
        image: PathBuf,
    },
    /// List the files and directories inside an image
    List {
        #[arg(required = true)]
        image: PathBuf,

        /// Only show the direct children of this directory
        #[arg(short, long)]
        dir: Option<String>,
    },
    /// Extract an image, or a single entry of it, to a directory
    Extract {
        #[arg(required = true)]
        image: PathBuf,

        /// Destination directory
        #[arg(required = true)]
        out: PathBuf,

        /// Slash-separated path of the file or directory to extract
        #[arg(short, long)]
        entry: Option<String>,
    },
    /// Author a new image
    #[command(subcommand)]
    Create(CreateCommand),
}

#[derive(Subcommand)]
enum CreateCommand {
    /// Build an ISO 9660 image from a directory
    Iso {
        #[arg(required = true)]
        source: PathBuf,

        #[arg(required = true)]
        out: PathBuf,

        /// Volume label
        #[arg(short, long, default_value = "CDROM")]
        label: String,
    },
    /// Build a raw FAT image
    Img {
        #[arg(required = true)]
        out: PathBuf,

        #[command(flatten)]
        volume: VolumeArgs,
    },
    /// Build a qcow2 disk holding a FAT volume
    Qcow2 {
        #[arg(required = true)]
        out: PathBuf,

        #[command(flatten)]
        volume: VolumeArgs,
    },
}

#[derive(clap::Args)]
struct VolumeArgs {
    /// Disk size in MiB
    #[arg(short, long = "size-mb", required = true)]
    size_mb: u64,

    /// Volume label
    #[arg(short, long, default_value = "NO NAME")]
    label: String,

    /// Directory whose contents are copied onto the new volume
    #[arg(long)]
    source: Option<PathBuf>,
}

/// A helper struct that, on Unix, disables `ECHOCTL` for the terminal.
///
/// `ECHOCTL` is the terminal flag that causes Ctrl+C to be printed as `^C`.
/// With it disabled the cancellation message printed after Ctrl+C is not
/// garbled. The original terminal state is restored when this struct is
/// dropped.
struct TermRestorer {
    #[cfg(unix)]
    original_termios: Option<Termios>,
}

impl TermRestorer {
    fn new() -> Self {
        #[cfg(unix)]
        {
            if !stdout().is_terminal() {
                return Self {
                    original_termios: None,
                };
            }
            let fd = stdout().as_raw_fd();
            let original_termios = Termios::from_fd(fd).ok().filter(|original| {
                let mut quiet = *original;
                quiet.c_lflag &= !ECHOCTL;
                tcsetattr(fd, TCSANOW, &quiet).is_ok()
            });
            Self { original_termios }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }
}

impl Drop for TermRestorer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(ref original_termios) = self.original_termios {
            let fd = stdout().as_raw_fd();
            tcsetattr(fd, TCSANOW, original_termios).ok();
        }
    }
}

/// Presents a final "Yes/No" confirmation to the user.
fn confirm_operation(prompt: &str) -> Result<bool> {
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

/// Asks before replacing an existing file. Returns `false` if the user
/// declined.
fn confirm_overwrite(path: &Path, yes: bool) -> Result<bool> {
    if yes || !path.exists() {
        return Ok(true);
    }
    println!(
        "{} '{}' already exists and will be replaced.",
        style("WARNING:").red().bold(),
        style(path.display()).cyan()
    );
    if !stdout().is_terminal() {
        warn!(path = %path.display(), "not a terminal; refusing to overwrite without --yes");
        return Err(anyhow!("refusing to overwrite {} without --yes", path.display()));
    }
    confirm_operation("Are you sure you want to proceed?")
}

fn spinner(prefix: &'static str) -> Result<ProgressBar> {
    let frames: Vec<String> = ["■     ", " ■    ", "  ■   ", "   ■  ", "    ■ ", "     ■"]
        .iter()
        .map(|f| style(f).blue().to_string())
        .collect();
    let frames: Vec<&str> = frames.iter().map(String::as_str).collect();

    let pb = ProgressBar::new_spinner();
    pb.set_prefix(prefix);
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{prefix:12} [{elapsed_precise}] [{spinner}] {bytes} ({bytes_per_sec}) {msg}")?
            .tick_strings(&frames),
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

/// Runs `op` under a progress spinner, finishing it according to the result.
fn with_progress<T>(
    prefix: &'static str,
    done: &str,
    op: impl FnOnce(&mut dyn FnMut(u64)) -> Result<T>,
) -> Result<T> {
    let pb = spinner(prefix)?;
    let result = op(&mut |bytes: u64| pb.set_position(bytes));
    match result {
        Ok(value) => {
            pb.finish_with_message(done.to_string());
            Ok(value)
        }
        Err(e) if matches!(e.downcast_ref::<ImageError>(), Some(ImageError::Cancelled)) => {
            info!("operation cancelled by user");
            pb.finish_with_message("Operation cancelled.");
            Err(e)
        }
        Err(e) => {
            pb.finish_with_message("❌ Operation failed.");
            Err(e)
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    init_logging();

    // This guard will be dropped when main() exits, restoring the terminal.
    let _term_restorer = TermRestorer::new();

    // Cleared by Ctrl+C; the core checks it between chunks and cleans up.
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let cli = Cli::parse();
    let mut containers = Containers::new();

    match cli.command {
        Commands::Detect { image } => match container::detect(&image)? {
            Some(ContainerKind::Iso) => {
                print!("{}: {}", image.display(), style(ContainerKind::Iso.name()).green());
                // Compressed images are only sniffed, not opened.
                match IsoImage::open(&image) {
                    Ok(iso) => println!(
                        " (label '{}', {} sectors)",
                        iso.volume_id(),
                        iso.volume_sectors()
                    ),
                    Err(_) => println!(),
                }
            }
            Some(kind) => println!("{}: {}", image.display(), style(kind.name()).green()),
            None => println!("{}: {}", image.display(), style("not a disk image").yellow()),
        },
        Commands::List { image, dir } => {
            if !container::is_disk_image(&image) {
                return Err(anyhow!("{} is not a supported disk image", image.display()));
            }
            let entries = match dir.as_deref() {
                Some(sub) => containers.list_directory(&image, sub, running),
                None => containers.list(&image, running),
            };
            for entry in &entries {
                println!("{entry}");
            }
            println!("\n{} entries", entries.len());
        }
        Commands::Extract { image, out, entry } => {
            println!("  Image:  {}", style(image.display()).cyan());
            println!("  Output: {}", style(out.display()).cyan());
            if let Some(entry) = entry.as_deref() {
                println!("  Entry:  {}", style(entry).cyan());
            }
            println!();

            with_progress("Extracting", "Extraction complete.", |on_progress| {
                containers.extract(&image, &out, entry.as_deref(), running, on_progress)
            })?;
            println!(
                "\n✨ Successfully extracted {} to {}.",
                style(image.display()).cyan(),
                style(out.display()).cyan()
            );
        }
        Commands::Create(create) => {
            let (out, kind) = match &create {
                CreateCommand::Iso { out, .. } => (out.clone(), ContainerKind::Iso),
                CreateCommand::Img { out, .. } => (out.clone(), ContainerKind::FatImage),
                CreateCommand::Qcow2 { out, .. } => (out.clone(), ContainerKind::Qcow2),
            };
            if !confirm_overwrite(&out, cli.yes)? {
                println!("Create operation cancelled.");
                return Ok(());
            }

            with_progress("Authoring", "Image complete.", |on_progress| match &create {
                CreateCommand::Iso { source, out, label } => {
                    containers.create_iso(source, out, label, running, on_progress)
                }
                CreateCommand::Img { out, volume } => containers.create_img(
                    volume.source.as_deref(),
                    out,
                    volume.size_mb,
                    &volume.label,
                    running,
                    on_progress,
                ),
                CreateCommand::Qcow2 { out, volume } => containers.create_qcow2(
                    volume.source.as_deref(),
                    out,
                    volume.size_mb,
                    &volume.label,
                    running,
                    on_progress,
                ),
            })?;
            println!(
                "\n✨ Successfully created {} image {}.",
                kind.name(),
                style(out.display()).cyan()
            );
        }
    }

    Ok(())
}
