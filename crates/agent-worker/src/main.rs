// Entry point for the CI agent.
//
// Loads settings (file, then `CI_AGENT_*` variables, then flags), runs one
// task and exits with a return code describing how the run ended.

use agent_common::constants::return_code;
use agent_common::{AgentSettings, HostContext, HttpControlPlane, ShutdownReason};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use agent_worker::worker::{RunOutcome, Worker};

/// Command-line arguments for the agent process.
#[derive(Parser, Debug)]
#[command(name = "ci-agent", about = "Runs the commands of one CI task")]
struct Args {
    /// JSON settings file.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long = "api-endpoint")]
    api_endpoint: Option<String>,

    #[arg(long = "task-id")]
    task_id: Option<String>,

    #[arg(long = "client-token")]
    client_token: Option<String>,

    #[arg(long = "server-token")]
    server_token: Option<String>,

    /// Run commands starting at this one.
    #[arg(long = "command-from")]
    command_from: Option<String>,

    /// Stop before this command.
    #[arg(long = "command-to")]
    command_to: Option<String>,

    #[arg(long = "pre-created-working-dir")]
    pre_created_working_dir: Option<PathBuf>,

    #[arg(long = "temp-dir")]
    temp_dir: Option<PathBuf>,

    /// Emit diagnostics as JSON lines.
    #[arg(long = "log-json")]
    log_json: bool,
}

impl Args {
    fn apply(self, settings: &mut AgentSettings) {
        if let Some(v) = self.api_endpoint {
            settings.api_endpoint = v;
        }
        if let Some(v) = self.task_id {
            settings.task_id = v;
        }
        if let Some(v) = self.client_token {
            settings.client_token = v;
        }
        if let Some(v) = self.server_token {
            settings.server_token = v;
        }
        if self.command_from.is_some() {
            settings.command_from = self.command_from;
        }
        if self.command_to.is_some() {
            settings.command_to = self.command_to;
        }
        if self.pre_created_working_dir.is_some() {
            settings.pre_created_working_dir = self.pre_created_working_dir;
        }
        if self.temp_dir.is_some() {
            settings.temp_directory = self.temp_dir;
        }
    }
}

fn main() {
    let args = Args::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to build Tokio runtime: {e}");
            std::process::exit(return_code::TERMINATED_ERROR);
        }
    };

    let exit_code = runtime.block_on(async move { run(args).await });

    std::process::exit(exit_code);
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(args: Args) -> i32 {
    init_tracing(args.log_json);

    let mut settings = match AgentSettings::load(args.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::error!("{}", e);
            return return_code::CONFIGURATION_ERROR;
        }
    };
    args.apply(&mut settings);
    if let Err(e) = settings.validate() {
        tracing::error!("{}", e);
        return return_code::CONFIGURATION_ERROR;
    }

    let control_plane = match HttpControlPlane::new(&settings) {
        Ok(control_plane) => Arc::new(control_plane),
        Err(e) => {
            tracing::error!("{}", e);
            return return_code::CONFIGURATION_ERROR;
        }
    };

    tracing::info!("Agent starting for task {}.", settings.task_id);
    let host_context = HostContext::new(settings);

    let signal_context = Arc::clone(&host_context);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_context.shutdown(ShutdownReason::UserCancelled);
        }
    });

    let worker = Worker::new(Arc::clone(&host_context), control_plane);
    match worker.run().await {
        RunOutcome::Reported { failed } => {
            tracing::info!(
                "Task finished{}.",
                if failed { " with failures" } else { "" }
            );
            return_code::SUCCESS
        }
        RunOutcome::ExitRequested => return_code::SUCCESS,
        RunOutcome::Aborted(reason) => {
            tracing::error!("Task aborted: {}", reason);
            return_code::TERMINATED_ERROR
        }
    }
}
