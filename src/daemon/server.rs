use crate::config::Config;
use crate::daemon::handlers::{HandlerContext, HandlerTable};
use crate::daemon::lifecycle::{DaemonPaths, PidGuard};
use crate::daemon::protocol::{DaemonRequest, DaemonResponse};
use crate::daemon::session::SharedConnection;
use crate::error::{KosError, Result};
use crate::protocol::Connection;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// 종료 시 처리 중인 클라이언트 응답을 기다리는 최대 시간
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// 요청 한 줄의 최대 크기
const MAX_REQUEST: u64 = 64 * 1024;

/// 연결 후 요청 줄을 다 받을 때까지의 시간 제한
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// `run()`의 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// 정상적으로 서비스하다가 종료됨
    Stopped,
    /// 다른 데몬이 이미 실행 중이라 아무것도 하지 않음
    AlreadyRunning(u32),
}

/// 데몬 서버
///
/// 원격 연결 하나를 소유하고, 로컬 Unix 소켓으로 들어오는 요청을
/// 한 줄 JSON 단위로 받아 핸들러 테이블로 전달합니다.
pub struct DaemonServer {
    config: Config,
    paths: DaemonPaths,
    handlers: HandlerTable,
}

impl DaemonServer {
    pub fn new(config: Config) -> Self {
        let paths = DaemonPaths::from_config(&config);
        Self::with_paths(config, paths)
    }

    pub fn with_paths(config: Config, paths: DaemonPaths) -> Self {
        Self {
            config,
            paths,
            handlers: HandlerTable::with_builtins(),
        }
    }

    pub fn paths(&self) -> &DaemonPaths {
        &self.paths
    }

    /// 외부 메서드 등록용
    pub fn handlers_mut(&mut self) -> &mut HandlerTable {
        &mut self.handlers
    }

    /// 데몬 실행 (종료 요청이나 시그널이 올 때까지 블록)
    pub async fn run(self) -> Result<RunOutcome> {
        let Some(mut guard) = PidGuard::claim(&self.paths)? else {
            let owner = self.paths.read_pid().unwrap_or_default();
            return Ok(RunOutcome::AlreadyRunning(owner));
        };

        // 마커를 얻었으므로 남아 있는 소켓은 이전 데몬의 잔재
        if self.paths.socket.exists() {
            std::fs::remove_file(&self.paths.socket)?;
        }

        let listener = UnixListener::bind(&self.paths.socket).map_err(|e| {
            KosError::DaemonUnavailable(format!(
                "failed to bind {}: {}",
                self.paths.socket.display(),
                e
            ))
        })?;

        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.paths.socket, perms)?;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let session = SharedConnection::new(Connection::new(self.config.clone()));
        let ctx = HandlerContext::new(
            session.clone(),
            Duration::from_millis(self.config.timeouts.command_ms),
            Arc::new(shutdown_tx),
        );
        let handlers = Arc::new(self.handlers);

        info!(
            "Daemon started (pid {}), listening on {}",
            guard.pid(),
            self.paths.socket.display()
        );

        let signal = shutdown_signal();
        tokio::pin!(signal);
        let mut clients = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let handlers = Arc::clone(&handlers);
                        let ctx = ctx.clone();
                        clients.spawn(async move {
                            if let Err(e) = handle_client(stream, &handlers, &ctx).await {
                                warn!("Error handling client: {}", e);
                            }
                        });
                    }
                    Err(e) => error!("Error accepting connection: {}", e),
                },
                Some(_) = clients.join_next(), if !clients.is_empty() => {}
                _ = shutdown_rx.changed() => {
                    info!("Shutdown requested");
                    break;
                }
                _ = &mut signal => {
                    info!("Signal received, shutting down");
                    break;
                }
            }
        }

        // 새 연결은 더 받지 않음
        drop(listener);

        // 종료 응답 등 이미 처리된 요청의 응답 전송을 잠시 기다림
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while clients.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Abandoning {} in-flight request(s)", clients.len());
            clients.abort_all();
        }

        // 실행 중인 원격 명령이 끝나지 않으면 연결은 프로세스 종료와 함께 정리됨
        let disconnect_budget = Duration::from_millis(
            self.config.timeouts.settle_disconnect_ms + self.config.timeouts.connect_ms,
        );
        match tokio::time::timeout(disconnect_budget, session.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Disconnect failed during shutdown: {}", e),
            Err(_) => warn!("Connection busy; skipping courtesy disconnect"),
        }

        guard.release()?;
        info!(
            "Daemon stopped after {} request(s)",
            ctx.requests_served()
        );

        Ok(RunOutcome::Stopped)
    }
}

/// 클라이언트 연결 처리: 요청 한 줄 → 응답 한 줄
async fn handle_client(
    stream: UnixStream,
    handlers: &HandlerTable,
    ctx: &HandlerContext,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader.take(MAX_REQUEST));
    let mut line = String::new();

    let read = match tokio::time::timeout(REQUEST_READ_TIMEOUT, reader.read_line(&mut line)).await {
        Ok(read) => read?,
        Err(_) => {
            warn!("Client sent no complete request within {:?}", REQUEST_READ_TIMEOUT);
            return Ok(());
        }
    };
    if read == 0 {
        // 연결만 확인하고 끊은 클라이언트
        return Ok(());
    }
    ctx.record_request();

    let response = if !line.ends_with('\n') && read as u64 >= MAX_REQUEST {
        DaemonResponse::error(&KosError::Protocol(format!(
            "request exceeds {} bytes",
            MAX_REQUEST
        )))
    } else {
        parse_and_dispatch(&line, handlers, ctx).await
    };

    let mut response_json = response.to_json()?;
    response_json.push('\n');

    writer.write_all(response_json.as_bytes()).await?;
    writer.shutdown().await?;

    Ok(())
}

async fn parse_and_dispatch(line: &str, handlers: &HandlerTable, ctx: &HandlerContext) -> DaemonResponse {
    match DaemonRequest::from_json(line.trim_end()) {
        Ok(request) => {
            debug!("Request: {}", request.method);
            match handlers.dispatch(ctx, &request.method, request.params).await {
                Ok(value) => DaemonResponse::Result(value),
                Err(e) => {
                    warn!("Method '{}' failed: {}", request.method, e);
                    DaemonResponse::error(&e)
                }
            }
        }
        Err(e) => DaemonResponse::error(&KosError::Protocol(format!("invalid request: {}", e))),
    }
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        }
        _ = terminate => {}
    }
}
