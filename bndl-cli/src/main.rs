//! CLI for the bndl bundler.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod progress;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use bndl::{Bundle, Bundler, RegistryAuth};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use colored::Colorize;
use tokio_util::sync::CancellationToken;

use progress::CliProgress;

#[derive(Parser)]
#[command(name = "bndl", version, about = "Bundler for OCI-packaged deployment units")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Assemble a bundle from a bundle definition.
    Create(Box<CreateArgs>),
    /// Show the contents of a produced bundle tarball.
    Inspect {
        /// Path to a `uds-bundle-*.tar.zst` archive.
        archive: PathBuf,
    },
    /// Generate shell completion scripts.
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

#[derive(clap::Args)]
struct CreateArgs {
    /// Directory containing `uds-bundle.yaml`, or the definition file itself.
    #[arg(default_value = ".")]
    path: PathBuf,

    /// Publish to a registry reference (e.g. `oci://registry.example/bundles/demo:0.1.0`)
    /// instead of writing a tarball.
    #[arg(long, short)]
    output: Option<String>,

    /// Directory to write the tarball into.
    #[arg(long, default_value = ".")]
    dir: PathBuf,

    /// Path to a detached signature to embed.
    #[arg(long)]
    signature: Option<PathBuf>,

    /// Registry username (password via --password-stdin or BNDL_PASSWORD).
    #[arg(long)]
    username: Option<String>,

    /// Read the registry password from stdin.
    #[arg(long, requires = "username")]
    password_stdin: bool,

    /// Allow plain-HTTP registries.
    #[arg(long)]
    insecure: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    init_tracing();
    if let Err(e) = Cli::parse().dispatch().await {
        eprintln!("bndl: {e:#}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
}

impl Cli {
    async fn dispatch(self) -> Result<()> {
        match self.command {
            Command::Create(args) => create(*args).await,
            Command::Inspect { archive } => inspect(&archive),
            Command::Completion { shell } => {
                clap_complete::generate(
                    shell,
                    &mut Cli::command(),
                    "bndl",
                    &mut std::io::stdout(),
                );
                Ok(())
            }
        }
    }
}

async fn create(args: CreateArgs) -> Result<()> {
    let definition = definition_path(&args.path)?;
    let yaml = std::fs::read_to_string(&definition)
        .with_context(|| format!("reading {}", definition.display()))?;
    let mut bundle = Bundle::from_yaml(&yaml)?;

    let signature = args
        .signature
        .as_deref()
        .map(std::fs::read)
        .transpose()
        .context("reading signature")?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let bundler = Bundler::new()
        .with_progress(Arc::new(CliProgress::new()))
        .with_cancellation(cancel)
        .with_auth(auth(args.username, args.password_stdin)?)
        .insecure(args.insecure);

    let log = match args.output {
        Some(destination) => {
            let reference = destination
                .strip_prefix("oci://")
                .unwrap_or(&destination);
            let out = bundler
                .publish(&mut bundle, reference, signature.as_deref())
                .await?;
            println!(
                "{} {} {}",
                "Published".green().bold(),
                out.reference,
                out.digest.dimmed()
            );
            out.log
        }
        None => {
            let out = bundler
                .create(&mut bundle, &args.dir, signature.as_deref())
                .await?;
            println!(
                "{} {} {}",
                "Created".green().bold(),
                out.path.display(),
                out.digest.dimmed()
            );
            out.log
        }
    };
    for line in log {
        println!("  {line}");
    }
    Ok(())
}

fn inspect(archive: &Path) -> Result<()> {
    let summary = bndl::inspect_archive(archive)
        .with_context(|| format!("reading {}", archive.display()))?;
    let metadata = &summary.bundle.metadata;
    println!("{}", metadata.name.bold());
    if !metadata.description.is_empty() {
        println!("  {}", metadata.description);
    }
    println!("  version:      {}", metadata.version);
    println!("  architecture: {}", metadata.architecture);
    println!("  digest:       {}", summary.digest);
    println!("  blobs:        {}", summary.blobs);
    println!("  packages:");
    for pkg in &summary.bundle.packages {
        println!("    {} {}", pkg.name.cyan(), pkg.reference.dimmed());
    }
    Ok(())
}

/// Resolves the bundle definition file from a directory or explicit path.
fn definition_path(path: &Path) -> Result<PathBuf> {
    if path.is_dir() {
        let candidate = path.join(bndl::BUNDLE_FILE);
        if !candidate.is_file() {
            bail!("no {} in {}", bndl::BUNDLE_FILE, path.display());
        }
        Ok(candidate)
    } else {
        Ok(path.to_path_buf())
    }
}

/// Builds registry credentials from the CLI flags and environment.
///
/// With `--password-stdin` the secret is read from stdin (trailing
/// newline stripped); otherwise it comes from `BNDL_PASSWORD`.
fn auth(username: Option<String>, password_stdin: bool) -> Result<RegistryAuth> {
    let Some(user) = username else {
        return Ok(RegistryAuth::Anonymous);
    };
    let password = if password_stdin {
        use std::io::Read;
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("reading password from stdin")?;
        let password = buf.trim_end_matches(['\r', '\n']).to_string();
        if password.is_empty() {
            bail!("no password on stdin");
        }
        password
    } else {
        std::env::var("BNDL_PASSWORD").context(
            "BNDL_PASSWORD must be set when --username is given without --password-stdin",
        )?
    };
    Ok(RegistryAuth::Basic(user, password))
}
