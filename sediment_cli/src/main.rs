use std::process::ExitCode;

use clap::Parser;
use sediment_cli::{Cli, EXIT_CANCELLED, exit_code, run, watch_interrupts};
use sediment_core::CancellationToken;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(cli.log_level()))
        .init();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        let abort = watch_interrupts(&on_signal, || async {
            tokio::signal::ctrl_c().await.is_ok()
        })
        .await;
        if abort {
            log::error!("Aborted");
            std::process::exit(i32::from(EXIT_CANCELLED));
        }
    });

    match run(&cli, &cancel, &mut std::io::stdout()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}
