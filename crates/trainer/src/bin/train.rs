//! `train` binary entry point
//!
//! Exit codes: 0 on completion or interrupt, 2 for invalid arguments, 1 for
//! restore and training failures.

use clap::Parser;
use std::process::ExitCode;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use train_core::{RawArgs, RunConfiguration};
use trainer::{install_handler, session, InterruptFlag, TrainArgs};

fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "trainer=info,checkpoint=info,audio_pipeline=info,train_core=info,storage=info"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = TrainArgs::parse();
    let config = match RunConfiguration::resolve(RawArgs::from(args), chrono::Local::now()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Some arguments are wrong:");
            eprintln!("{}", e);
            return ExitCode::from(2);
        }
    };

    let interrupt = InterruptFlag::new();
    if let Err(e) = install_handler(interrupt.clone()) {
        tracing::error!(error = %e, "Cannot watch for interrupts");
        return ExitCode::from(1);
    }

    match session::run(&config, interrupt) {
        Ok(report) => {
            tracing::info!(
                last_step = ?report.last_step,
                saved = report.saved_steps.len(),
                interrupted = report.interrupted,
                "Done"
            );
            ExitCode::SUCCESS
        }
        Err(e) if e.is_configuration() => {
            eprintln!("Some arguments are wrong:");
            eprintln!("{}", e);
            ExitCode::from(2)
        }
        Err(e) => {
            tracing::error!(error = %e, "Training stopped");
            ExitCode::from(1)
        }
    }
}
