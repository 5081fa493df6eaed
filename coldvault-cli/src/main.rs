use clap::Parser;
use tracing::{error, warn};

mod progress;

/// Back up every container of a Swift object store into cold-storage S3 buckets.
///
/// Each container is copied into its own bucket, which is created with the configured storage
/// class, versioning, and retention period if it doesn't exist yet.  Objects are gzip-compressed
/// on the way.  Objects that can't be copied are reported at the end, but don't fail the run.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about)]
struct Args {
    #[clap(flatten)]
    globals: Globals,

    #[clap(flatten)]
    config: coldvault::Config,
}

/// Arguments that control the CLI itself rather than the backup
#[derive(Parser, Debug)]
struct Globals {
    /// Enable verbose log output
    #[clap(short = 'v', long, conflicts_with = "quiet", global = true)]
    verbose: bool,

    /// Be quiet, suppress almost all output (except errors)
    #[clap(short = 'q', long, conflicts_with = "verbose", global = true)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    init_logging(&args.globals);

    let globals = args.globals;

    let job = progress::with_spinner(&globals, "Listing containers...", async {
        coldvault::BackupJobBuilder::new(args.config)
            .await?
            .build()
            .await
    })
    .await?;

    if job.containers().is_empty() {
        warn!("The source account has no containers; nothing to back up");
    }

    let summary = progress::run_backup_job(&globals, job, ctrl_c()).await?;

    if !globals.quiet {
        println!("{}", summary.format_message());
    }

    Ok(())
}

/// Completes when ctrl-c is pressed, which aborts the backup
async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            warn!("ctrl-c received; aborting the backup");
        }
        Err(e) => {
            error!("Failed to listen for ctrl-c; the backup can't be aborted: {e}");
            std::future::pending::<()>().await;
        }
    }
}

/// Log to stderr, filtered by `RUST_LOG` if it's set, otherwise by the verbosity flags.
///
/// Log events from the library are the only output in verbose mode.  Otherwise only warnings and
/// errors are logged, so they don't drown the progress bars.
fn init_logging(globals: &Globals) {
    use tracing_subscriber::EnvFilter;

    let default_filter = if globals.verbose {
        "coldvault=debug,coldvault_cli=debug,info"
    } else if globals.quiet {
        "error"
    } else {
        "warn"
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .expect("BUG: default log filter is valid");

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(globals.verbose)
        .init();
}
