use crate::error::Result;
use crate::protocol::menu::CpuEntry;
use crate::protocol::{CommandResult, Connection, ConnectionStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::info;

/// 데몬이 소유하는 단일 연결과 명령 직렬화
///
/// 모든 명령은 공정한(FIFO) 뮤텍스를 거쳐 도착 순서대로 하나씩 실행됩니다.
/// 상태 조회는 watch 채널을 읽으므로 실행 중인 명령을 기다리지 않습니다.
#[derive(Clone)]
pub struct SharedConnection {
    connection: Arc<Mutex<Connection>>,
    status: watch::Receiver<ConnectionStatus>,
}

impl SharedConnection {
    pub fn new(connection: Connection) -> Self {
        let status = connection.subscribe();
        Self {
            connection: Arc::new(Mutex::new(connection)),
            status,
        }
    }

    /// 현재 연결 상태 (잠금 없이)
    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    /// 명령 실행 (필요하면 먼저 연결)
    pub async fn execute(&self, command: &str, timeout: Duration) -> Result<CommandResult> {
        let mut connection = self.connection.lock().await;
        ensure_connected(&mut connection).await?;
        connection.execute(command, timeout).await
    }

    /// 새 핸드셰이크 강제 (기존 연결은 끊음)
    pub async fn reconnect(&self) -> Result<CpuEntry> {
        let mut connection = self.connection.lock().await;
        connection.disconnect().await?;
        connection.connect().await
    }

    /// 연결되어 있지 않을 때만 연결
    pub async fn connect(&self) -> Result<ConnectionStatus> {
        let mut connection = self.connection.lock().await;
        ensure_connected(&mut connection).await?;
        Ok(self.status())
    }

    pub async fn disconnect(&self) -> Result<()> {
        let mut connection = self.connection.lock().await;
        connection.disconnect().await
    }
}

async fn ensure_connected(connection: &mut Connection) -> Result<()> {
    if connection.needs_connect() {
        info!("Connecting to {}", connection.config().address());
        // Error 상태나 끊긴 스트림은 Disconnected를 거쳐야 재연결 가능
        connection.disconnect().await?;
        connection.connect().await?;
    }
    Ok(())
}
