use clap::Parser;

use mirrorclaw::agent_engine::RunState;

#[derive(Parser)]
#[command(name = "mirrorclaw")]
#[command(about = "Drive a mirrored phone screen with a vision model")]
struct Args {
    /// Natural-language instruction for the run
    instruction: String,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    mirrorclaw::init_tracing();
    let args = Args::parse();
    let config = mirrorclaw::bootstrap_config();

    match mirrorclaw::run(config, args.instruction).await {
        Ok(status) if status.state == RunState::Stopped => std::process::ExitCode::SUCCESS,
        Ok(_) => std::process::ExitCode::from(2),
        Err(e) => {
            tracing::error!(error = %e, "mirrorclaw failed");
            std::process::ExitCode::FAILURE
        }
    }
}
