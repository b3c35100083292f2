use clap::{Parser, Subcommand};
use genq_server::config::LoggingConfig;
use genq_server::service::{Components, Service};
use genq_server::ServiceConfig;
use genq_worker::{ExecSpawner, Supervisor};
use std::ffi::OsString;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "gq-server")]
#[command(about = "Generation job queue service", long_about = None)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true, env = "GENQ_CONFIG")]
    config: Option<PathBuf>,

    /// Broker URL (`memory://` for an in-process broker)
    #[arg(long, global = true, env = "RABBITMQ_URL")]
    broker_url: Option<String>,

    /// Prediction provider API token
    #[arg(long, global = true, env = "REPLICATE_API_TOKEN", hide_env_values = true)]
    replicate_token: Option<String>,

    /// Ledger admin token
    #[arg(long, global = true, env = "LICENSE_ADMIN_TOKEN", hide_env_values = true)]
    license_token: Option<String>,

    /// HTTP port
    #[arg(long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the master process and its workers
    Serve {
        /// Number of worker processes (default: one per CPU)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Serve everything from this process
        #[arg(long)]
        single_process: bool,
    },
    /// Run one worker process (started by the master)
    Worker {
        #[arg(long, default_value_t = 0)]
        slot: usize,
    },
    /// Print the effective configuration
    Config,
}

impl Args {
    fn load_config(&self) -> anyhow::Result<ServiceConfig> {
        let mut config = ServiceConfig::load(self.config.as_deref())?;
        if let Some(url) = &self.broker_url {
            config.broker.url = url.clone();
        }
        if let Some(token) = &self.replicate_token {
            config.prediction.api_token = token.clone();
        }
        if let Some(token) = &self.license_token {
            config.billing.admin_token = token.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Command::Serve { workers: Some(n), .. } = self.command {
            config.supervisor.workers = n;
        }
        Ok(config)
    }

    /// Global flags forwarded to worker processes
    fn forwarded(&self) -> Vec<OsString> {
        let mut args = Vec::new();
        if let Some(path) = &self.config {
            args.push(OsString::from("--config"));
            args.push(path.clone().into_os_string());
        }
        if let Some(port) = self.port {
            args.push(OsString::from("--port"));
            args.push(OsString::from(port.to_string()));
        }
        args
    }

    /// Settings forwarded to worker processes through their environment,
    /// which keeps credentials out of the process table.
    fn forwarded_env(&self) -> Vec<(&'static str, String)> {
        [
            ("RABBITMQ_URL", &self.broker_url),
            ("REPLICATE_API_TOKEN", &self.replicate_token),
            ("LICENSE_ADMIN_TOKEN", &self.license_token),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.clone().map(|v| (key, v)))
        .collect()
    }

    fn spawner(&self) -> std::io::Result<ExecSpawner> {
        let spawner = ExecSpawner::current(self.forwarded())?;
        Ok(self
            .forwarded_env()
            .into_iter()
            .fold(spawner, |spawner, (key, value)| spawner.with_env(key, value)))
    }
}

fn init_tracing(logging: &LoggingConfig, file_prefix: &str) -> Option<WorkerGuard> {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level))
    };

    let stdout = if logging.json {
        tracing_subscriber::fmt::layer().json().with_filter(filter()).boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_filter(filter())
            .boxed()
    };

    let (file, guard) = match &logging.directory {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_filter(filter())
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry().with(stdout).with(file).init();
    guard
}

/// Listener shared by every worker process through `SO_REUSEPORT`.
fn bind_shared(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(true)?;
    socket.bind(addr)?;
    socket.listen(1024)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// One service process. Returns an error when the broker is gone for good
/// so the master restarts it.
async fn run_worker(config: ServiceConfig, slot: usize) -> anyhow::Result<()> {
    let components = Components::from_config(&config, slot)?;
    let service = Service::new(config, components)?;
    let shutdown = CancellationToken::new();
    service.spawn_background(shutdown.clone());

    let addr: SocketAddr = service.config().server.bind_address().parse()?;
    let listener = bind_shared(addr)?;
    info!(slot, pid = std::process::id(), %addr, "Worker listening");

    service.start_consumer().await;

    let mut fatal = service.state.broker.fatal();
    let serve_shutdown = shutdown.clone();
    let server = axum::serve(
        listener,
        service
            .router()
            .into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { serve_shutdown.cancelled().await });
    let server = tokio::spawn(async move { server.await });

    let outcome = tokio::select! {
        _ = shutdown_signal() => {
            info!(slot, "Shutdown signal received");
            Ok(())
        }
        changed = fatal.wait_for(|reason| reason.is_some()) => {
            let reason = changed
                .ok()
                .and_then(|r| r.clone())
                .unwrap_or_else(|| "broker client dropped".to_string());
            error!(slot, reason = %reason, "Broker connection lost for good");
            Err(anyhow::anyhow!(reason))
        }
    };

    shutdown.cancel();
    service.shutdown().await;
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "HTTP server error"),
        Err(e) => warn!(error = %e, "HTTP server task failed"),
    }
    info!(slot, "Worker stopped");
    outcome
}

async fn run_master(args: &Args, config: ServiceConfig) -> anyhow::Result<()> {
    let spawner = Arc::new(args.spawner()?);
    let supervisor = Supervisor::new(spawner, &config.supervisor);
    info!(
        pid = std::process::id(),
        workers = supervisor.workers(),
        broker = %config.broker.masked_url(),
        "Master started"
    );

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, stopping workers");
        trigger.cancel();
    });

    supervisor.run(shutdown).await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = args.load_config()?;

    match &args.command {
        Command::Config => {
            let mut shown = config;
            shown.broker.url = shown.broker.masked_url();
            for secret in [&mut shown.prediction.api_token, &mut shown.billing.admin_token] {
                if !secret.is_empty() {
                    *secret = "***".to_string();
                }
            }
            print!("{}", serde_yaml::to_string(&shown)?);
            Ok(())
        }
        Command::Worker { slot } => {
            let _guard = init_tracing(&config.logging, &format!("gq-worker-{}.log", slot));
            run_worker(config, *slot).await
        }
        Command::Serve { single_process, .. } => {
            let _guard = init_tracing(&config.logging, "gq-server.log");
            if *single_process || config.supervisor.worker_count() == 1 {
                info!("Running in single-process mode");
                run_worker(config, 0).await
            } else {
                run_master(&args, config).await
            }
        }
    }
}
