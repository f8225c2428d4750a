use crate::config::Config;
use crate::daemon::client::{DaemonClient, StartOutcome};
use crate::daemon::server::{DaemonServer, RunOutcome};
use crate::error::{KosError, Result};
use crate::ui::create_spinner;
use colored::*;

/// 데몬을 포그라운드에서 실행 (`--daemon-run`)
pub async fn run_daemon(config: Config) -> Result<()> {
    let server = DaemonServer::new(config);
    match server.run().await? {
        RunOutcome::Stopped => Ok(()),
        RunOutcome::AlreadyRunning(pid) => {
            eprintln!(
                "{} Daemon already running (pid {}).",
                "[!]".yellow(),
                pid
            );
            Ok(())
        }
    }
}

/// 데몬 서버 시작
pub async fn start_daemon(client: &DaemonClient) -> Result<()> {
    let spinner = create_spinner("Starting daemon...");
    let outcome = client.start().await;
    spinner.finish_and_clear();

    match outcome? {
        StartOutcome::Started(pid) => {
            eprintln!("{} Daemon started (pid {}).", "[OK]".green(), pid);
        }
        StartOutcome::AlreadyRunning(pid) => {
            eprintln!("{} Daemon already running (pid {}).", "[OK]".green(), pid);
        }
    }
    eprintln!("  [>] Socket: {}", client.paths().socket.display());
    Ok(())
}

/// 데몬 서버 종료
pub async fn stop_daemon(client: &DaemonClient) -> Result<()> {
    eprintln!("{} Stopping daemon...", "[STOP]".yellow());

    if client.stop().await? {
        eprintln!("{} Daemon stopped.", "[OK]".green());
    } else {
        eprintln!("{} Daemon is not running.", "[OK]".green());
    }
    Ok(())
}

/// 데몬 서버 상태 확인
pub async fn check_daemon_status(client: &DaemonClient) -> Result<()> {
    let report = match client.status().await {
        Ok(report) => report,
        Err(e @ KosError::DaemonUnavailable(_)) => {
            eprintln!("{} Daemon is not running.", "[X]".red());
            eprintln!("\n{} To start the daemon:", "[TIP]".cyan());
            eprintln!("  {}", "kos-bridge --daemon-start".yellow());
            return Err(e);
        }
        Err(e) => return Err(e),
    };

    eprintln!("{} Daemon is running.", "[OK]".green().bold());
    eprintln!("  [>] PID: {}", report.pid);
    eprintln!("  [>] Uptime: {} seconds", report.uptime_seconds);
    eprintln!("  [>] Requests served: {}", report.requests_served);
    eprintln!("  [>] Connection: {:?}", report.connection.state);
    if let Some(cpu) = &report.connection.cpu {
        eprintln!("  [>] CPU: [{}] {}", cpu.id, cpu.label());
    }
    if let Some(error) = &report.connection.last_error {
        eprintln!("  [!] Last error: {}", error.dimmed());
    }
    Ok(())
}
