//! fleetbuild - distributed build-dispatch control plane

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fleetbuild::config::{self, Args};
use fleetbuild::job::Priority;
use fleetbuild::transport::{Auth, Kind, WorkerConfig};
use fleetbuild::Dispatcher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("fleetbuild={log_level},info").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = args.validate() {
        error!("configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  fleetbuild - build dispatch control plane");
    info!("======================================");
    info!("Build: {} ({})", env!("GIT_COMMIT_SHORT"), env!("BUILD_TIMESTAMP"));
    info!("Node ID: {}", args.node_id);
    info!(
        "Mode: {}",
        if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" }
    );
    info!("Max concurrent jobs: {}", args.max_concurrent);
    info!("Pool size per kind: {}", args.pool_size);
    info!("Remote tmp dir: {}", args.remote_tmp_dir);
    info!("======================================");

    let workers_file = args.workers_file.clone();
    let dispatcher = Dispatcher::new(args.clone());

    let mut registered = 0usize;
    if let Some(path) = &workers_file {
        match config::load_workers_file(path) {
            Ok(entries) => {
                for entry in entries {
                    match register_worker(&dispatcher, entry).await {
                        Ok(name) => {
                            registered += 1;
                            info!(worker = %name, "worker registered from file");
                        }
                        Err(e) => warn!("failed to register worker from {}: {e}", path.display()),
                    }
                }
            }
            Err(e) => {
                error!("failed to load workers file {}: {e}", path.display());
                if !args.dev_mode {
                    std::process::exit(1);
                }
            }
        }
    }

    if registered == 0 {
        if args.dev_mode {
            warn!("no workers configured (dev mode, continuing)");
        } else {
            error!("no workers configured at startup; refusing to run in production mode");
            std::process::exit(1);
        }
    }

    for name in dispatcher.registry.names_by_kind(Kind::Unix) {
        let _ = dispatcher.registry.connect(&name).await;
    }
    for name in dispatcher.registry.names_by_kind(Kind::Windows) {
        let _ = dispatcher.registry.connect(&name).await;
    }
    for name in dispatcher.registry.names_by_kind(Kind::Macos) {
        let _ = dispatcher.registry.connect(&name).await;
    }

    if let (Some(entry_script), Some(workspace)) = (&args.job_entry_script, &args.job_workspace) {
        match dispatcher
            .create(
                &args.job_platform,
                entry_script.clone(),
                workspace.clone(),
                Priority::Medium,
                Default::default(),
            )
            .await
        {
            Ok(job_id) => {
                info!(job = %job_id, "one-shot job submitted, awaiting completion");
                await_job(&dispatcher, &job_id).await;
            }
            Err(e) => {
                error!("failed to submit one-shot job: {e}");
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    info!("fleetbuild running; awaiting jobs (ctrl-c to stop)");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    Ok(())
}

async fn register_worker(
    dispatcher: &Dispatcher,
    entry: config::WorkerFileEntry,
) -> anyhow::Result<String> {
    let kind = Kind::from_platform(match entry.kind.as_str() {
        "unix" | "linux" => "linux",
        "windows" => "windows",
        "macos" => "macos",
        other => other,
    })
    .ok_or_else(|| anyhow::anyhow!("unknown worker kind '{}'", entry.kind))?;

    let auth = match (&entry.password, &entry.key_path) {
        (Some(password), _) => Auth::Password(password.clone()),
        (None, Some(key_path)) => Auth::KeyPath(key_path.into()),
        (None, None) => anyhow::bail!("worker '{}' has neither password nor key_path", entry.name),
    };

    let config = WorkerConfig {
        host: entry.host,
        port: entry.port,
        user: entry.user,
        auth,
    };
    dispatcher
        .register_worker(&entry.name, kind, config)
        .await?;
    Ok(entry.name)
}

async fn await_job(dispatcher: &Dispatcher, job_id: &str) {
    loop {
        match dispatcher.status(job_id).await {
            Ok(job) => {
                if job.state.is_terminal() {
                    info!(job = %job_id, state = ?job.state, progress = job.progress, "job finished");
                    if let Some(err) = &job.error {
                        warn!(job = %job_id, "job error: {err}");
                    }
                    return;
                }
            }
            Err(e) => {
                error!("lost track of job {job_id}: {e}");
                return;
            }
        }
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    }
}
