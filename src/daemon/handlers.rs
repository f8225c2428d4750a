use crate::daemon::protocol::{methods, ExecuteParams, StatusReport};
use crate::daemon::session::SharedConnection;
use crate::error::{KosError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// 핸들러가 접근할 수 있는 데몬 상태
#[derive(Clone)]
pub struct HandlerContext {
    pub session: SharedConnection,
    /// `timeout_ms`가 없는 명령에 적용할 시간 제한
    pub default_timeout: Duration,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    started: Instant,
    requests: Arc<AtomicU64>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl HandlerContext {
    pub fn new(
        session: SharedConnection,
        default_timeout: Duration,
        shutdown: Arc<watch::Sender<bool>>,
    ) -> Self {
        Self {
            session,
            default_timeout,
            pid: std::process::id(),
            started_at: Utc::now(),
            started: Instant::now(),
            requests: Arc::new(AtomicU64::new(0)),
            shutdown,
        }
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests_served(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn status_report(&self) -> StatusReport {
        StatusReport {
            running: true,
            pid: self.pid,
            started_at: self.started_at,
            uptime_seconds: self.uptime().as_secs(),
            requests_served: self.requests_served(),
            connection: self.session.status(),
        }
    }
}

/// 메서드 하나를 처리하는 핸들러
///
/// 기동 관련 라이브러리 등 외부 로직은 이 trait을 구현해서 등록합니다.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, ctx: &HandlerContext, params: Value) -> Result<Value>;
}

/// 메서드 이름 → 핸들러
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 내장 메서드가 등록된 테이블
    pub fn with_builtins() -> Self {
        let mut table = Self::new();
        table.register(methods::PING, PingHandler);
        table.register(methods::STATUS, StatusHandler);
        table.register(methods::EXECUTE, ExecuteHandler);
        table.register(methods::CONNECT, ConnectHandler);
        table.register(methods::DISCONNECT, DisconnectHandler);
        table.register(methods::SHUTDOWN, ShutdownHandler);
        table
    }

    /// 같은 이름이 있으면 교체
    pub fn register<H: Handler + 'static>(&mut self, method: &str, handler: H) {
        self.handlers.insert(method.to_string(), Arc::new(handler));
    }

    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    pub fn methods(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub async fn dispatch(&self, ctx: &HandlerContext, method: &str, params: Value) -> Result<Value> {
        let handler = self.handlers.get(method).ok_or_else(|| {
            KosError::Protocol(format!(
                "unknown method '{}' (available: {})",
                method,
                self.methods().join(", ")
            ))
        })?;
        handler.call(ctx, params).await
    }
}

fn parse_params<T: DeserializeOwned>(method: &str, params: Value) -> Result<T> {
    serde_json::from_value(params)
        .map_err(|e| KosError::Protocol(format!("invalid parameters for '{}': {}", method, e)))
}

struct PingHandler;

#[async_trait]
impl Handler for PingHandler {
    async fn call(&self, ctx: &HandlerContext, _params: Value) -> Result<Value> {
        Ok(json!({ "pong": true, "pid": ctx.pid }))
    }
}

struct StatusHandler;

#[async_trait]
impl Handler for StatusHandler {
    async fn call(&self, ctx: &HandlerContext, _params: Value) -> Result<Value> {
        Ok(serde_json::to_value(ctx.status_report())?)
    }
}

struct ExecuteHandler;

#[async_trait]
impl Handler for ExecuteHandler {
    async fn call(&self, ctx: &HandlerContext, params: Value) -> Result<Value> {
        let params: ExecuteParams = parse_params(methods::EXECUTE, params)?;
        let timeout = params
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(ctx.default_timeout);

        let result = ctx.session.execute(&params.command, timeout).await?;
        Ok(serde_json::to_value(result)?)
    }
}

struct ConnectHandler;

#[async_trait]
impl Handler for ConnectHandler {
    /// `{"force": true}`이면 기존 연결을 끊고 핸드셰이크를 다시 함
    async fn call(&self, ctx: &HandlerContext, params: Value) -> Result<Value> {
        let force = params.get("force").and_then(Value::as_bool).unwrap_or(false);
        if force {
            ctx.session.reconnect().await?;
        } else {
            ctx.session.connect().await?;
        }
        Ok(serde_json::to_value(ctx.session.status())?)
    }
}

struct DisconnectHandler;

#[async_trait]
impl Handler for DisconnectHandler {
    async fn call(&self, ctx: &HandlerContext, _params: Value) -> Result<Value> {
        ctx.session.disconnect().await?;
        Ok(serde_json::to_value(ctx.session.status())?)
    }
}

struct ShutdownHandler;

#[async_trait]
impl Handler for ShutdownHandler {
    async fn call(&self, ctx: &HandlerContext, _params: Value) -> Result<Value> {
        ctx.request_shutdown();
        Ok(json!({ "shutting_down": true }))
    }
}
