#[macro_use]
extern crate tracing;

use clap::Parser;
use floodgate::{
    app,
    cli::{Command, Opts},
    config::{ControllerConfig, GateConfig},
};

fn main() {
    let opts = Opts::parse();

    let levels = std::env::var("FLOODGATE_LOG")
        .unwrap_or_else(|_| format!("floodgate={}", opts.root.log_level()));
    tracing_subscriber::fmt()
        .with_env_filter(levels)
        .init();

    let threads = opts.root.threads.unwrap_or_else(num_cpus::get);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(threads.max(1))
        .thread_name("floodgate-worker")
        .enable_all()
        .build()
        .expect("Unable to create async runtime");

    let code = runtime.block_on(async move {
        let result = match opts.command {
            Command::Controller => match ControllerConfig::from_env() {
                Ok(config) => app::run_controller(config).await,
                Err(error) => {
                    error!(message = "Configuration error.", %error);
                    return exitcode::CONFIG;
                }
            },
            Command::Gate => match GateConfig::from_env() {
                Ok(config) => app::run_gate(config).await,
                Err(error) => {
                    error!(message = "Configuration error.", %error);
                    return exitcode::CONFIG;
                }
            },
        };

        match result {
            Ok(()) => exitcode::OK,
            Err(error) => {
                error!(message = "Fatal error.", %error);
                exitcode::SOFTWARE
            }
        }
    });

    std::process::exit(code);
}
