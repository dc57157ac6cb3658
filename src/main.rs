use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match live_poll::start_server().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Failed to run server: {e}");
            ExitCode::FAILURE
        }
    }
}
