pub mod daemon;
pub mod exec;

pub use daemon::{check_daemon_status, run_daemon, start_daemon, stop_daemon};
pub use exec::execute_command;
