use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(error) = terminal_market_data::logging::init_logging(None) {
        eprintln!("{error}");
        return ExitCode::FAILURE;
    }

    match terminal_market_data::run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!("{error}");
            ExitCode::FAILURE
        }
    }
}
