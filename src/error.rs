use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KosError {
    /// 원격 터미널에 연결할 수 없거나 스트림이 끊어짐
    #[error("Connection error: {0}")]
    Connection(String),

    /// 핸드셰이크 내용이 예상과 다름 (CPU 메뉴 형식 변경, 요청한 CPU 없음 등)
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timed out after {timeout_ms}ms waiting for {stage}")]
    Timeout { stage: String, timeout_ms: u64 },

    /// 로컬 데몬 소켓에 접근 불가하고 데몬 기동도 실패
    #[error("Daemon unavailable: {0}")]
    DaemonUnavailable(String),

    /// 원격 명령은 실행되었지만 원격 측에서 실패를 보고함
    #[error("Remote failure: {0}")]
    RemoteFailure(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// 데몬 내부에서 난 그 밖의 에러 (응답에서 복원된 경우)
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, KosError>;

/// 데몬 에러 응답에 실리는 에러 분류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Protocol,
    Timeout,
    DaemonUnavailable,
    RemoteFailure,
    Internal,
}

impl KosError {
    pub fn timeout(stage: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            stage: stage.into(),
            timeout_ms,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection(_) => ErrorKind::Connection,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::DaemonUnavailable(_) => ErrorKind::DaemonUnavailable,
            Self::RemoteFailure(_) => ErrorKind::RemoteFailure,
            Self::Config(_) | Self::Internal(_) | Self::Io(_) | Self::Json(_) => ErrorKind::Internal,
        }
    }

    /// 에러 응답에 담을 상세 메시지 (variant 접두어 제외)
    pub fn detail(&self) -> String {
        match self {
            Self::Connection(m)
            | Self::Protocol(m)
            | Self::DaemonUnavailable(m)
            | Self::RemoteFailure(m)
            | Self::Config(m)
            | Self::Internal(m) => m.clone(),
            Self::Timeout { stage, .. } => stage.clone(),
            Self::Io(e) => e.to_string(),
            Self::Json(e) => e.to_string(),
        }
    }

    pub fn timeout_ms(&self) -> Option<u64> {
        match self {
            Self::Timeout { timeout_ms, .. } => Some(*timeout_ms),
            _ => None,
        }
    }

    /// 에러 응답(kind + detail)으로부터 에러 복원
    pub fn from_kind(kind: ErrorKind, detail: String, timeout_ms: Option<u64>) -> Self {
        match kind {
            ErrorKind::Connection => Self::Connection(detail),
            ErrorKind::Protocol => Self::Protocol(detail),
            ErrorKind::Timeout => Self::Timeout {
                stage: detail,
                timeout_ms: timeout_ms.unwrap_or_default(),
            },
            ErrorKind::DaemonUnavailable => Self::DaemonUnavailable(detail),
            ErrorKind::RemoteFailure => Self::RemoteFailure(detail),
            ErrorKind::Internal => Self::Internal(detail),
        }
    }
}
