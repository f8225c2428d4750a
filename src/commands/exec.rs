use crate::daemon::client::DaemonClient;
use crate::error::{KosError, Result};
use crate::protocol::CommandResult;
use crate::ui::create_spinner;
use colored::*;

/// 데몬을 통해 원격 명령 하나 실행
///
/// 원격 측이 실패를 보고하면 출력은 그대로 보여주고 `RemoteFailure`를 돌려줍니다.
pub async fn execute_command(
    client: &DaemonClient,
    command: &str,
    timeout_ms: Option<u64>,
    raw: bool,
) -> Result<CommandResult> {
    let result = if raw {
        client.execute(command, timeout_ms).await?
    } else {
        let spinner = create_spinner(&format!("Running: {}", command));
        let result = client.execute(command, timeout_ms).await;
        spinner.finish_and_clear();
        result?
    };

    if !result.output.is_empty() {
        println!("{}", result.output);
    }

    if !raw {
        eprintln!("{}", format!("({}ms)", result.elapsed_ms).dimmed());
    }

    if !result.success {
        let message = result
            .error
            .clone()
            .unwrap_or_else(|| "remote command failed".to_string());
        return Err(KosError::RemoteFailure(message));
    }

    Ok(result)
}
