use restcoder::commands::{run_proxy, run_start, Cli, Commands};
use restcoder::error::StartError;
use restcoder::utils::logger::init_logger;
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli = Cli::parse_command();

    if let Err(err) = init_logger(cli.log_level.as_deref()) {
        eprintln!("Failed to initialize logging: {err}");
        return ExitCode::from(1);
    }

    match cli.command {
        Commands::Start(args) => {
            // The orchestrator is single-threaded: spawns and exit notifications
            // are all driven from one event loop.
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    eprintln!("Failed to start runtime: {err}");
                    return ExitCode::from(1);
                }
            };
            match runtime.block_on(run_start(args)) {
                Ok(()) => ExitCode::SUCCESS,
                Err(err) => {
                    eprintln!("{}", err.user_message());
                    ExitCode::from(err.exit_code())
                }
            }
        }
        Commands::Proxy(args) => {
            let runtime = match tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    eprintln!("Failed to start runtime: {err}");
                    return ExitCode::from(1);
                }
            };
            match runtime.block_on(run_proxy(args)) {
                Ok(()) => ExitCode::SUCCESS,
                Err(err) => {
                    let err = StartError::from(err);
                    eprintln!("{}", err.user_message());
                    ExitCode::from(err.exit_code())
                }
            }
        }
    }
}
