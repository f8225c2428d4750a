use crate::error::{ErrorKind, KosError, Result};
use crate::protocol::ConnectionStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 내장 메서드 이름
pub mod methods {
    pub const PING: &str = "ping";
    pub const STATUS: &str = "status";
    pub const EXECUTE: &str = "execute";
    pub const CONNECT: &str = "connect";
    pub const DISCONNECT: &str = "disconnect";
    pub const SHUTDOWN: &str = "shutdown";
}

/// 데몬 서버로 전송하는 요청 (한 줄 JSON)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonRequest {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// 데몬 서버의 응답: `{"result": ...}` 또는 `{"error": {...}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonResponse {
    Result(Value),
    Error(ErrorRecord),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// `execute` 파라미터
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteParams {
    pub command: String,
    /// 원격 명령 시간 제한 (없으면 데몬 설정값)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// `status` 결과
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub running: bool,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub requests_served: u64,
    pub connection: ConnectionStatus,
}

impl DaemonRequest {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    /// JSON으로 직렬화
    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// JSON에서 역직렬화
    pub fn from_json(json: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl DaemonResponse {
    pub fn error(err: &KosError) -> Self {
        Self::Error(ErrorRecord {
            kind: err.kind(),
            message: err.detail(),
            timeout_ms: err.timeout_ms(),
        })
    }

    /// 결과 값 또는 담겨 온 에러
    pub fn into_result(self) -> Result<Value> {
        match self {
            Self::Result(value) => Ok(value),
            Self::Error(record) => Err(KosError::from_kind(
                record.kind,
                record.message,
                record.timeout_ms,
            )),
        }
    }

    /// JSON으로 직렬화
    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// JSON에서 역직렬화
    pub fn from_json(json: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
