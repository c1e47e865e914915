//! Entry point. Command-line parsing, the child-process-launch/attach-to-PID
//! glue, and the viewer UI are external collaborators; this binary just
//! loads configuration and runs the orchestrator until a stop signal
//! arrives or initialization fails fatally.

use log::error;
use taskscoped::config::Config;
use taskscoped::orchestrator;

#[tokio::main]
async fn main() {
    env_logger::init();
    let config = Config::load();

    if let Err(err) = orchestrator::run(config).await {
        error!("fatal init failure: {err}");
        std::process::exit(1);
    }
    std::process::exit(0);
}
