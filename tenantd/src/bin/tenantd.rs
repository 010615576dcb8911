//! The `tenantd` binary: `serve` runs the supervisor daemon, `worker` is
//! the entry point the supervisor execs for each tenant.

use std::sync::Arc;

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;
use utils::logging::{self, LogFormat};

use tenantd::config::TenantdConf;
use tenantd::manager::Manager;
use tenantd::worker::{self, scan::ScanEngine, WorkerArgs};
use utils::id::TenantId;

#[derive(Parser)]
#[command(version, about = "tenant execution supervisor")]
struct Cli {
    /// Log output format: plain or json
    #[arg(long, default_value = "plain", global = true)]
    log_format: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Run the supervisor daemon.
    Serve(ServeArgs),
    /// Worker-mode entry point; normally invoked by the supervisor, not by
    /// hand.
    Worker(WorkerCliArgs),
}

#[derive(clap::Args)]
struct ServeArgs {
    /// Path to the TOML config file.
    #[arg(short = 'f', long)]
    conf: Option<Utf8PathBuf>,
    /// Cache root override.
    #[arg(long)]
    cache_root: Option<Utf8PathBuf>,
    /// Remote listener override, like `127.0.0.1:9000`.
    #[arg(short, long)]
    listen: Option<std::net::SocketAddr>,
}

#[derive(clap::Args)]
struct WorkerCliArgs {
    /// Tenant id (URL-safe base64).
    #[arg(short = 't')]
    tenant: TenantId,
    /// Control socket file descriptor.
    #[arg(short = 'c')]
    ctl_fd: i32,
    /// Event counter file descriptor.
    #[arg(short = 'e')]
    event_fd: i32,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(LogFormat::from_config(&cli.log_format)?)?;

    match cli.command {
        Command::Worker(args) => worker::run(
            WorkerArgs {
                tenant: args.tenant,
                ctl_fd: args.ctl_fd,
                event_fd: args.event_fd,
                cancel_watch: worker::DEFAULT_CANCEL_WATCH,
            },
            Arc::new(ScanEngine),
        ),
        Command::Serve(args) => {
            let mut conf = match &args.conf {
                Some(path) => TenantdConf::load(path)?,
                None => TenantdConf::default(),
            };
            if let Some(root) = args.cache_root {
                conf.cache_root = root;
            }
            if let Some(listen) = args.listen {
                conf.listen = Some(listen);
            }

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("build runtime")?;
            runtime.block_on(serve(conf))
        }
    }
}

async fn serve(conf: TenantdConf) -> anyhow::Result<()> {
    let manager = Manager::launch(conf).await?;

    // park until asked to die
    let signal = tokio::task::spawn_blocking(|| -> anyhow::Result<i32> {
        use signal_hook::consts::signal::{SIGINT, SIGQUIT, SIGTERM};
        let mut signals = signal_hook::iterator::Signals::new([SIGINT, SIGQUIT, SIGTERM])
            .context("install signal handlers")?;
        Ok(signals.forever().next().unwrap_or(SIGTERM))
    })
    .await
    .context("signal task failed")??;

    tracing::info!(signal, "shutdown signal received");
    manager.stop().await;
    Ok(())
}
