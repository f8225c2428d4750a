use crate::config::Config;
use crate::daemon::lifecycle::{marker_is_fresh, DaemonPaths, Liveness};
use crate::daemon::protocol::{methods, DaemonRequest, DaemonResponse, ExecuteParams, StatusReport};
use crate::error::{KosError, Result};
use crate::protocol::CommandResult;
use serde_json::Value;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::{debug, info, warn};

/// 데몬 기동 후 소켓 확인 간격
const SPAWN_POLL: Duration = Duration::from_millis(50);

/// 데몬 실행 인자 (포그라운드 실행)
pub const DAEMON_RUN_FLAG: &str = "--daemon-run";

/// `start()` 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    AlreadyRunning(u32),
    Started(u32),
}

/// 데몬 클라이언트 (서버에 요청 보내기)
///
/// 요청마다 소켓 연결 하나를 열고, 요청 한 줄을 쓰고, 응답 한 줄을 읽습니다.
pub struct DaemonClient {
    paths: DaemonPaths,
    /// 응답 대기 시간 제한 (원격 명령 시간 제한과 별개)
    timeout: Duration,
    autostart: bool,
    program: Option<PathBuf>,
    /// 새로 띄우는 데몬에만 전달할 환경 변수
    envs: Vec<(String, String)>,
    spawn_wait: Duration,
}

impl DaemonClient {
    pub fn new(paths: DaemonPaths, timeout: Duration) -> Self {
        Self {
            paths,
            timeout,
            autostart: true,
            program: None,
            envs: Vec::new(),
            spawn_wait: Duration::from_secs(5),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            DaemonPaths::from_config(config),
            Duration::from_millis(config.timeouts.client_ms),
        )
    }

    /// 소켓이 없을 때 데몬을 띄울지 여부
    pub fn with_autostart(mut self, autostart: bool) -> Self {
        self.autostart = autostart;
        self
    }

    /// 데몬으로 실행할 프로그램 (기본: 현재 실행 파일)
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = Some(program.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_spawn_wait(mut self, spawn_wait: Duration) -> Self {
        self.spawn_wait = spawn_wait;
        self
    }

    pub fn paths(&self) -> &DaemonPaths {
        &self.paths
    }

    /// 데몬이 소켓에서 응답 대기 중인지 확인
    pub async fn is_running(&self) -> bool {
        UnixStream::connect(&self.paths.socket).await.is_ok()
    }

    /// 요청 하나 보내고 결과 받기 (필요하면 데몬 기동)
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.call_with(method, params, self.autostart).await
    }

    /// 원격 명령 실행
    pub async fn execute(&self, command: &str, timeout_ms: Option<u64>) -> Result<CommandResult> {
        let params = ExecuteParams {
            command: command.to_string(),
            timeout_ms,
        };
        let value = self
            .call(methods::EXECUTE, serde_json::to_value(params)?)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// 데몬 상태 (데몬을 띄우지 않음)
    pub async fn status(&self) -> Result<StatusReport> {
        let value = self.call_with(methods::STATUS, Value::Null, false).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// 데몬 기동 (이미 실행 중이면 아무것도 하지 않음)
    pub async fn start(&self) -> Result<StartOutcome> {
        if let Ok(value) = self.call_with(methods::PING, Value::Null, false).await {
            let pid = value["pid"].as_u64().unwrap_or_default() as u32;
            return Ok(StartOutcome::AlreadyRunning(pid));
        }

        self.spawn()?;
        self.wait_until_ready().await?;

        let pid = self.paths.read_pid().unwrap_or_default();
        info!("Daemon started (pid {})", pid);
        Ok(StartOutcome::Started(pid))
    }

    /// 데몬 종료 요청
    ///
    /// 데몬이 없으면 남은 파일만 정리하고 `Ok(false)`.
    pub async fn stop(&self) -> Result<bool> {
        if !self.is_running().await {
            match self.paths.liveness() {
                Liveness::Stale(None) if marker_is_fresh(&self.paths.pid) => {
                    debug!("Daemon marker is being claimed; leaving it alone");
                }
                Liveness::Stale(pid) => {
                    warn!("Removing stale daemon files (pid {:?})", pid);
                    self.paths.clear_stale()?;
                }
                Liveness::Running(pid) => {
                    warn!("Daemon pid {} is alive but not answering on its socket", pid);
                }
                Liveness::NotRunning => {}
            }
            return Ok(false);
        }

        self.call_with(methods::SHUTDOWN, Value::Null, false).await?;

        // 소켓과 마커가 사라질 때까지 대기
        let deadline = tokio::time::Instant::now() + self.spawn_wait;
        while self.paths.socket.exists() || self.paths.pid.exists() {
            if tokio::time::Instant::now() >= deadline {
                return Err(KosError::timeout(
                    "daemon shutdown",
                    self.spawn_wait.as_millis() as u64,
                ));
            }
            tokio::time::sleep(SPAWN_POLL).await;
        }

        Ok(true)
    }

    async fn call_with(&self, method: &str, params: Value, autostart: bool) -> Result<Value> {
        let stream = match UnixStream::connect(&self.paths.socket).await {
            Ok(stream) => stream,
            Err(e) if autostart => {
                debug!("Daemon not reachable ({}), starting it", e);
                self.spawn()?;
                self.wait_until_ready().await?
            }
            Err(e) => {
                return Err(KosError::DaemonUnavailable(format!(
                    "daemon is not running ({}: {})",
                    self.paths.socket.display(),
                    e
                )))
            }
        };

        let request = DaemonRequest::new(method, params);
        let response = tokio::time::timeout(self.timeout, roundtrip(stream, &request))
            .await
            .map_err(|_| {
                KosError::timeout(
                    format!("daemon response to '{}'", method),
                    self.timeout.as_millis() as u64,
                )
            })??;

        response.into_result()
    }

    /// 데몬 프로세스를 백그라운드로 실행
    fn spawn(&self) -> Result<()> {
        let program = match &self.program {
            Some(program) => program.clone(),
            None => std::env::current_exe().map_err(|e| {
                KosError::DaemonUnavailable(format!("cannot locate daemon executable: {}", e))
            })?,
        };

        std::fs::create_dir_all(&self.paths.dir)?;
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.paths.log)?;

        let mut command = Command::new(&program);
        command
            .arg(DAEMON_RUN_FLAG)
            .env("KOS_BRIDGE_RUNTIME_DIR", &self.paths.dir)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log));

        {
            // 터미널의 Ctrl-C가 데몬까지 전달되지 않도록 별도 프로세스 그룹
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let child = command.spawn().map_err(|e| {
            KosError::DaemonUnavailable(format!("failed to start {}: {}", program.display(), e))
        })?;

        debug!("Spawned daemon process {}", child.id());
        Ok(())
    }

    async fn wait_until_ready(&self) -> Result<UnixStream> {
        let deadline = tokio::time::Instant::now() + self.spawn_wait;
        loop {
            if let Ok(stream) = UnixStream::connect(&self.paths.socket).await {
                return Ok(stream);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(KosError::DaemonUnavailable(format!(
                    "daemon did not start within {}ms (see {})",
                    self.spawn_wait.as_millis(),
                    self.paths.log.display()
                )));
            }
            tokio::time::sleep(SPAWN_POLL).await;
        }
    }
}

async fn roundtrip(stream: UnixStream, request: &DaemonRequest) -> Result<DaemonResponse> {
    let (reader, mut writer) = stream.into_split();

    let mut request_json = request.to_json()?;
    request_json.push('\n');
    writer.write_all(request_json.as_bytes()).await?;

    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Err(KosError::DaemonUnavailable(
            "daemon closed the connection without responding".to_string(),
        ));
    }

    Ok(DaemonResponse::from_json(line.trim_end())?)
}
