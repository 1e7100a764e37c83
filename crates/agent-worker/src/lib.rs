// agent-worker: command orchestration for the CI agent.
// Depends on `agent-sdk` and `agent-common`.
//
// Architecture:
//   Worker::run_async → environment_stager → StepsRunner::run
//     → per-command Handler::execute, streaming output through LogStreamer

pub mod background;
pub mod collaborators;
pub mod environment_stager;
pub mod file_command_manager;
pub mod handlers;
pub mod log_streamer;
pub mod resource_monitor;
pub mod run_context;
pub mod steps_runner;
pub mod update_batcher;
pub mod worker;

#[cfg(test)]
mod test_support;
