use std::sync::Arc;

use clap::Parser;
use fusis_agent::config::{Cli, Commands};
use fusis_agent::discovery::DockerDiscovery;
use fusis_agent::supervisor::Supervisor;
use fusis_agent::{Result, http};
use fusis_nat::{Reconciler, SudoRunner};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Agent(args) => {
            setup_subscriber();

            let settings = args.settings()?;
            let runner = if args.no_sudo {
                SudoRunner::direct(args.command_timeout)
            } else {
                SudoRunner::new(args.command_timeout)
            };
            let engine = Reconciler::new(Arc::new(runner), args.rt_tables.clone());
            let discovery = DockerDiscovery::connect(&args.docker)?;
            let supervisor = Supervisor::new(discovery, engine, settings);

            let cancel = CancellationToken::new();
            let mut metrics_handle = tokio::spawn(http::serve_metrics(
                args.metrics_address,
                supervisor.readiness(),
                cancel.child_token(),
            ));
            supervisor.start()?;

            // watch for shutdown and metrics server errors
            let metrics_done = tokio::select! {
                h = &mut metrics_handle => {
                    exit("metrics", h);
                    true
                },
                _ = shutdown_signal() => false,
            };

            supervisor.stop();
            if let Err(e) = supervisor.wait().await {
                error!("supervisor exited with error: {e}");
            }
            cancel.cancel();
            if !metrics_done {
                exit("metrics", metrics_handle.await);
            }
            info!("Exiting...");
        }
    }
    Ok(())
}

fn setup_subscriber() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fusis_agent=info,fusis_nat=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };
    tokio::select! {
        _ = ctrl_c => {
          info!("captured ctrl_c signal");
        },
        _ = terminate => {
          info!("captured terminate signal");
        },
    }
}

fn exit(task: &str, out: Result<Result<()>, JoinError>) {
    match out {
        Ok(Ok(_)) => {
            info!("{task} exited")
        }
        Ok(Err(e)) => {
            error!("{task} failed with error: {e}")
        }
        Err(e) => {
            error!("{task} task failed to complete: {e}")
        }
    }
}
