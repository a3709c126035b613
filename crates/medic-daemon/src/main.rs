use anyhow::Context;
use medic_core::{shutdown_channel, Monitor};
use medic_daemon::app::{self, Secrets};
use medic_daemon::{cli, logging, Invocation, MedicConfig};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let matches = cli::command().get_matches();

    match run(&matches).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("medic: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(matches: &clap::ArgMatches) -> anyhow::Result<()> {
    let config_path = cli::config_path(matches);
    let config = MedicConfig::load(config_path.as_deref())
        .await
        .context("loading configuration")?;
    logging::init_tracing(&config.log)?;

    match cli::invocation(matches) {
        Invocation::Run => run_monitor(&config).await,
        Invocation::Once { json } => {
            let reconciler = app::build_reconciler(&config, &Secrets::from_env())?;
            let report = reconciler.tick().await.context("reconciliation tick")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", app::render_report(&report));
            }
            Ok(())
        }
        Invocation::List { json } => {
            let store = app::open_store(&config)?;
            println!("{}", app::list_records(&store, json)?);
            Ok(())
        }
        Invocation::Clear { pipeline, run_id } => {
            let store = app::open_store(&config)?;
            if app::clear_record(&store, &pipeline, &run_id)? {
                println!("cleared {pipeline}/{run_id}");
            } else {
                println!("{pipeline}/{run_id} was not tracked");
            }
            Ok(())
        }
    }
}

async fn run_monitor(config: &MedicConfig) -> anyhow::Result<()> {
    let reconciler = app::build_reconciler(config, &Secrets::from_env())?;
    let monitor = Monitor::new(reconciler, config.poll_interval());
    let (shutdown_tx, shutdown_rx) = shutdown_channel();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "cannot listen for Ctrl-C, stop the process to exit");
            // the sender must outlive the monitor or the loop stops
            std::future::pending::<()>().await;
        }
        tracing::info!("shutdown requested, finishing current tick");
        let _ = shutdown_tx.send(true);
    });

    let ticks = monitor
        .run(shutdown_rx)
        .await
        .context("retry store failure")?;
    tracing::info!(ticks, "medic exiting");
    Ok(())
}
