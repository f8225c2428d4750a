//! 원격 터미널 세션 프로토콜
//!
//! [`Connection`]은 전송 하나를 소유하고 CPU 선택 핸드셰이크와
//! 명령/응답 프레이밍을 감춥니다.

pub mod framing;
pub mod menu;

use crate::config::Config;
use crate::error::{KosError, Result};
use crate::transport::{self, Transport};
use framing::{CommandRequest, LINE_ENDING};
use menu::{CpuEntry, CpuSelector};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// CPU 선택 메뉴의 마지막 안내문
static MENU_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\[Q\]\s+to\s+quit").unwrap());

/// 재부팅 후 출력되는 배너
static REBOOT_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)kOS\s+Operating\s+System").unwrap());

/// 명령을 받을 준비가 되었다는 표시
static PROCEED_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)proceed\.?").unwrap());

/// 첫 글자로 보내면 CPU에서 분리되는 Control-D
const DETACH: &str = "\x04";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    AwaitingMenu,
    Selecting,
    Ready,
    Executing,
    Error,
}

/// 외부에 공개되는 연결 상태 스냅샷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub cpu: Option<CpuEntry>,
    pub last_error: Option<String>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            cpu: None,
            last_error: None,
        }
    }
}

/// 명령 실행 결과
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub output: String,
    pub elapsed_ms: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResult {
    fn failure(error: String, output: String, started: Instant) -> Self {
        Self {
            output,
            elapsed_ms: started.elapsed().as_millis() as u64,
            success: false,
            error: Some(error),
        }
    }
}

/// 원격 터미널과의 세션 하나
///
/// 상태 전이: Disconnected → Connecting → AwaitingMenu → Selecting → Ready ⇄ Executing.
/// 어느 단계에서든 실패하면 Error가 되고, `disconnect()` 후 `connect()`로만 복구됩니다.
pub struct Connection {
    config: Config,
    transport: Option<Box<dyn Transport>>,
    status: watch::Sender<ConnectionStatus>,
    /// 시간 초과로 아직 끝나지 않은 명령의 종료 토큰
    pending: Option<CommandRequest>,
}

impl Connection {
    pub fn new(config: Config) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::default());
        Self {
            config,
            transport: None,
            status,
            pending: None,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub fn cpu(&self) -> Option<CpuEntry> {
        self.status.borrow().cpu.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// 새 핸드셰이크가 필요한지 (미접속, 오류, 스트림 끊김)
    pub fn needs_connect(&self) -> bool {
        match self.state() {
            ConnectionState::Disconnected | ConnectionState::Error => true,
            ConnectionState::Ready | ConnectionState::Executing => !self.transport_open(),
            _ => false,
        }
    }

    fn transport_open(&self) -> bool {
        self.transport.as_ref().map_or(false, |t| t.is_open())
    }

    fn set_state(&self, state: ConnectionState) {
        self.status.send_modify(|s| s.state = state);
    }

    fn fail(&self, error: &KosError) {
        mark_failed(&self.status, error);
    }

    /// 연결 및 CPU 선택
    pub async fn connect(&mut self) -> Result<CpuEntry> {
        if self.state() != ConnectionState::Disconnected {
            return Err(KosError::Protocol(format!(
                "connect() requires a disconnected session (current state: {:?})",
                self.state()
            )));
        }

        self.status.send_modify(|s| {
            s.state = ConnectionState::Connecting;
            s.cpu = None;
            s.last_error = None;
        });

        match self.handshake().await {
            Ok(cpu) => {
                info!("Attached to CPU [{}] {}", cpu.id, cpu.label());
                self.status.send_modify(|s| {
                    s.state = ConnectionState::Ready;
                    s.cpu = Some(cpu.clone());
                });
                Ok(cpu)
            }
            Err(e) => {
                warn!("Connect failed: {}", e);
                if let Some(mut transport) = self.transport.take() {
                    let _ = transport.close().await;
                }
                self.fail(&e);
                Err(e)
            }
        }
    }

    async fn handshake(&mut self) -> Result<CpuEntry> {
        let timeouts = self.config.timeouts.clone();
        let selector = CpuSelector::from_setting(self.config.cpu.as_deref());
        let reboot = self.config.reboot_on_connect;

        let mut transport = transport::create(&self.config);
        debug!("Opening {} transport to {}", transport.name(), self.config.address());
        transport.init().await?;
        let transport = self.transport.insert(transport);

        self.status
            .send_modify(|s| s.state = ConnectionState::AwaitingMenu);
        let menu_text = wait_stage(
            transport.as_mut(),
            &MENU_REGEX,
            timeouts.menu_ms,
            "CPU selection menu",
        )
        .await?;
        let entries = menu::parse_menu(&menu_text)?;

        self.status.send_modify(|s| s.state = ConnectionState::Selecting);
        let cpu = selector.select(&entries)?.clone();
        debug!("Selecting CPU [{}] {}", cpu.id, cpu.label());
        transport
            .send(&format!("{}{}", cpu.id, LINE_ENDING))
            .await?;

        let mut ready = false;
        if reboot {
            transport.send(&format!("REBOOT.{}", LINE_ENDING)).await?;
            let boot_text = wait_stage(
                transport.as_mut(),
                &REBOOT_REGEX,
                timeouts.reboot_ms,
                "reboot banner",
            )
            .await?;
            // 배너와 준비 표시가 한 번에 도착했을 수 있음
            ready = REBOOT_REGEX
                .find(&boot_text)
                .map_or(false, |m| PROCEED_REGEX.is_match(&boot_text[m.end()..]));
        }

        if !ready {
            wait_stage(
                transport.as_mut(),
                &PROCEED_REGEX,
                timeouts.proceed_ms,
                "ready prompt",
            )
            .await?;
        }

        tokio::time::sleep(Duration::from_millis(timeouts.settle_connect_ms)).await;
        // 준비 표시 뒤에 남은 화면 출력은 버림
        transport.read();

        Ok(cpu)
    }

    /// 명령 실행
    ///
    /// 시간 초과는 에러가 아니라 실패 결과로 돌려줍니다. 원격 명령은 계속 실행 중일
    /// 수 있으므로, 다음 `execute()`는 먼저 그 명령의 종료 토큰을 기다립니다.
    pub async fn execute(&mut self, command: &str, timeout: Duration) -> Result<CommandResult> {
        let started = Instant::now();

        match self.state() {
            ConnectionState::Ready | ConnectionState::Executing => {}
            state => {
                return Err(KosError::Connection(format!(
                    "not connected to a CPU (state: {:?})",
                    state
                )))
            }
        }

        if !self.transport_open() {
            let err = KosError::Connection("connection to remote terminal lost".to_string());
            self.fail(&err);
            return Err(err);
        }

        if let Some(previous) = self.pending.take() {
            match self.wait_previous(&previous, timeout).await {
                Ok(()) => {}
                Err(KosError::Timeout { .. }) => {
                    self.pending = Some(previous);
                    return Ok(CommandResult::failure(
                        "previous command is still running on the remote CPU".to_string(),
                        String::new(),
                        started,
                    ));
                }
                Err(e) => {
                    self.fail(&e);
                    return Err(e);
                }
            }
        }

        let request = CommandRequest::new(command, timeout);
        self.set_state(ConnectionState::Executing);

        let Some(transport) = self.transport.as_mut() else {
            return Err(KosError::Connection("transport is not open".to_string()));
        };

        let stale = transport.read();
        if !stale.trim().is_empty() {
            debug!("Discarding {} bytes of unsolicited output", stale.len());
        }

        if let Err(e) = transport.send(&request.wire_text()).await {
            mark_failed(&self.status, &e);
            return Err(e);
        }

        match transport
            .wait_for(&request.completion_pattern(), request.timeout)
            .await
        {
            Ok(captured) => {
                self.set_state(ConnectionState::Ready);
                let output = framing::extract_output(&captured, &request);
                let elapsed_ms = started.elapsed().as_millis() as u64;

                match framing::detect_remote_error(&output) {
                    Some(message) => Ok(CommandResult {
                        output,
                        elapsed_ms,
                        success: false,
                        error: Some(message),
                    }),
                    None => Ok(CommandResult {
                        output,
                        elapsed_ms,
                        success: true,
                        error: None,
                    }),
                }
            }
            Err(KosError::Timeout { .. }) => {
                warn!(
                    "Command did not finish within {}ms: {}",
                    timeout.as_millis(),
                    command
                );
                let partial = transport.read();
                self.pending = Some(request);
                Ok(CommandResult::failure(
                    format!(
                        "command did not complete within {}ms (it may still be running)",
                        timeout.as_millis()
                    ),
                    partial,
                    started,
                ))
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    async fn wait_previous(&mut self, previous: &CommandRequest, timeout: Duration) -> Result<()> {
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| KosError::Connection("transport is not open".to_string()))?;

        debug!("Waiting for previous command to finish");
        transport
            .wait_for(&previous.completion_pattern(), timeout)
            .await?;
        self.set_state(ConnectionState::Ready);
        Ok(())
    }

    /// 연결 해제 (이미 끊긴 상태면 아무 일도 하지 않음)
    pub async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut transport) = self.transport.take() {
            if transport.is_open() {
                // 분리 요청 실패는 무시하고 닫기 진행
                let _ = transport.send(DETACH).await;
                tokio::time::sleep(Duration::from_millis(
                    self.config.timeouts.settle_disconnect_ms,
                ))
                .await;
            }
            transport.close().await?;
            info!("Disconnected from remote terminal");
        }

        self.pending = None;
        self.status.send_modify(|s| {
            s.state = ConnectionState::Disconnected;
            s.cpu = None;
        });
        Ok(())
    }
}

fn mark_failed(status: &watch::Sender<ConnectionStatus>, error: &KosError) {
    status.send_modify(|s| {
        s.state = ConnectionState::Error;
        s.last_error = Some(error.to_string());
    });
}

async fn wait_stage(
    transport: &mut dyn Transport,
    pattern: &Regex,
    timeout_ms: u64,
    stage: &str,
) -> Result<String> {
    transport
        .wait_for(pattern, Duration::from_millis(timeout_ms))
        .await
        .map_err(|e| match e {
            KosError::Timeout { timeout_ms, .. } => KosError::timeout(stage, timeout_ms),
            other => other,
        })
}
