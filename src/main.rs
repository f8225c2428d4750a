use clap::Parser;
use colored::*;
use kos_bridge::cli::Cli;
use kos_bridge::commands;
use kos_bridge::config::Config;
use kos_bridge::daemon::DaemonClient;
use kos_bridge::error::Result;
use kos_bridge::logging;
use std::process::ExitCode;
use std::time::Duration;

/// 원격 명령 시간 제한을 넘겨서 데몬 응답을 기다리는 여유
const CLIENT_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.daemon_run {
        logging::DAEMON_LEVEL
    } else {
        logging::CLI_LEVEL
    };
    logging::init(level);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", "[X]".red(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    if cli.init_config {
        let path = Config::init()?;
        eprintln!("{} Wrote default configuration to {}", "[OK]".green(), path.display());
        return Ok(());
    }

    let mut config = Config::load()?;
    if let Some(cpu) = &cli.cpu {
        config.cpu = Some(cpu.clone());
    }

    if cli.daemon_run {
        return commands::run_daemon(config).await;
    }

    let mut client = DaemonClient::from_config(&config);
    if let Some(cpu) = &cli.cpu {
        client = client.with_env("KOS_CPU", cpu.clone());
    }

    if cli.daemon_start {
        return commands::start_daemon(&client).await;
    }
    if cli.daemon_stop {
        return commands::stop_daemon(&client).await;
    }
    if cli.daemon_status {
        return commands::check_daemon_status(&client).await;
    }

    // 원격 시간 제한보다 먼저 포기하지 않도록
    if let Some(timeout_ms) = cli.timeout_ms {
        let needed = Duration::from_millis(timeout_ms) + CLIENT_GRACE;
        let configured = Duration::from_millis(config.timeouts.client_ms);
        client = client.with_timeout(configured.max(needed));
    }

    commands::execute_command(&client, &cli.command_text(), cli.timeout_ms, cli.raw).await?;
    Ok(())
}
