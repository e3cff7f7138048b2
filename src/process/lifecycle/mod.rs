/*!
 * Thread and Process Lifecycle
 * Startup, termination requests, the exit path, reaping and orchestration
 */

mod exit;
mod orchestration;
mod reaper;
mod startup;
mod termination;

pub use orchestration::ShutdownReport;
pub use reaper::Reaper;
pub use startup::ThreadBody;

pub(crate) use exit::exit_thread;
pub(crate) use orchestration::{
    shutdown_system, terminate_job, terminate_process_by_pointer, terminate_threads,
    wait_for_all_processes,
};
pub(crate) use startup::spawn_host;
pub(crate) use termination::{critical_break, terminate_by_pointer};
