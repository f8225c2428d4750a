use crate::error::{KosError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// 원격 터미널까지의 전송 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// 직접 TCP 소켓 (기본)
    Tcp,
    /// 로컬 프로그램(telnet, nc 등)의 stdin/stdout을 경유하는 디버그용 전송
    Process,
}

impl FromStr for TransportKind {
    type Err = KosError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "tcp" | "socket" => Ok(Self::Tcp),
            "process" | "debug" => Ok(Self::Process),
            other => Err(KosError::Config(format!(
                "Unknown transport '{}' (expected tcp or process)",
                other
            ))),
        }
    }
}

/// 각 단계별 시간 제한 (밀리초)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeouts {
    #[serde(default = "default_connect_ms")]
    pub connect_ms: u64,
    #[serde(default = "default_menu_ms")]
    pub menu_ms: u64,
    #[serde(default = "default_reboot_ms")]
    pub reboot_ms: u64,
    #[serde(default = "default_proceed_ms")]
    pub proceed_ms: u64,
    #[serde(default = "default_command_ms")]
    pub command_ms: u64,
    /// 데몬 클라이언트가 응답을 기다리는 최대 시간 (원격 명령 시간 제한과 별개)
    #[serde(default = "default_client_ms")]
    pub client_ms: u64,
    #[serde(default = "default_settle_connect_ms")]
    pub settle_connect_ms: u64,
    #[serde(default = "default_settle_disconnect_ms")]
    pub settle_disconnect_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_connect_ms() -> u64 {
    5_000
}

fn default_menu_ms() -> u64 {
    10_000
}

fn default_reboot_ms() -> u64 {
    15_000
}

fn default_proceed_ms() -> u64 {
    15_000
}

fn default_command_ms() -> u64 {
    30_000
}

fn default_client_ms() -> u64 {
    120_000
}

fn default_settle_connect_ms() -> u64 {
    500
}

fn default_settle_disconnect_ms() -> u64 {
    200
}

fn default_poll_interval_ms() -> u64 {
    100
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect_ms: default_connect_ms(),
            menu_ms: default_menu_ms(),
            reboot_ms: default_reboot_ms(),
            proceed_ms: default_proceed_ms(),
            command_ms: default_command_ms(),
            client_ms: default_client_ms(),
            settle_connect_ms: default_settle_connect_ms(),
            settle_disconnect_ms: default_settle_disconnect_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Timeouts {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// kos-bridge 설정
///
/// 설정 파일(~/.config/kos-bridge/config.toml)을 먼저 읽고,
/// `KOS_*` 환경 변수가 있으면 그 값으로 덮어씁니다.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// 접속할 CPU (숫자면 메뉴 번호, 아니면 태그/기체 이름)
    #[serde(default)]
    pub cpu: Option<String>,

    #[serde(default = "default_transport")]
    pub transport: TransportKind,

    /// Process 전송에서 실행할 프로그램과 인자
    #[serde(default = "default_process_command")]
    pub process_command: Vec<String>,

    /// CPU 선택 직후 REBOOT를 보내 깨끗한 상태에서 시작할지 여부
    #[serde(default)]
    pub reboot_on_connect: bool,

    #[serde(default)]
    pub timeouts: Timeouts,

    /// 소켓, PID 파일, 데몬 로그가 위치할 디렉토리
    #[serde(default)]
    pub runtime_dir: Option<PathBuf>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5410
}

fn default_transport() -> TransportKind {
    TransportKind::Tcp
}

fn default_process_command() -> Vec<String> {
    vec!["telnet".to_string()]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cpu: None,
            transport: default_transport(),
            process_command: default_process_command(),
            reboot_on_connect: false,
            timeouts: Timeouts::default(),
            runtime_dir: None,
        }
    }
}

impl Config {
    /// 설정 파일 경로 가져오기
    fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// 설정 디렉토리 경로
    fn config_dir() -> PathBuf {
        dirs::config_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("kos-bridge")
    }

    /// 설정 파일과 환경 변수에서 로드 (둘 다 없으면 기본값)
    pub fn load() -> Result<Self> {
        let mut config = Self::load_file()?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn load_file() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| KosError::Config(format!("Invalid config file: {}", e)))
    }

    /// 환경 변수 값으로 덮어쓰기
    ///
    /// 조회 함수를 인자로 받아 테스트에서 실제 환경을 건드리지 않도록 합니다.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("KOS_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("KOS_PORT") {
            self.port = parse_env("KOS_PORT", &port)?;
        }
        if let Some(cpu) = lookup("KOS_CPU") {
            let cpu = cpu.trim().to_string();
            self.cpu = if cpu.is_empty() { None } else { Some(cpu) };
        }
        if let Some(transport) = lookup("KOS_TRANSPORT") {
            self.transport = transport.parse()?;
        }
        if let Some(command) = lookup("KOS_PROCESS_COMMAND") {
            self.process_command = command.split_whitespace().map(str::to_string).collect();
        }
        if let Some(reboot) = lookup("KOS_REBOOT") {
            self.reboot_on_connect = parse_bool("KOS_REBOOT", &reboot)?;
        }
        if let Some(dir) = lookup("KOS_BRIDGE_RUNTIME_DIR") {
            self.runtime_dir = Some(PathBuf::from(dir));
        }

        let t = &mut self.timeouts;
        for (key, slot) in [
            ("KOS_TIMEOUT_CONNECT_MS", &mut t.connect_ms),
            ("KOS_TIMEOUT_MENU_MS", &mut t.menu_ms),
            ("KOS_TIMEOUT_REBOOT_MS", &mut t.reboot_ms),
            ("KOS_TIMEOUT_PROCEED_MS", &mut t.proceed_ms),
            ("KOS_TIMEOUT_COMMAND_MS", &mut t.command_ms),
            ("KOS_TIMEOUT_CLIENT_MS", &mut t.client_ms),
            ("KOS_SETTLE_CONNECT_MS", &mut t.settle_connect_ms),
            ("KOS_SETTLE_DISCONNECT_MS", &mut t.settle_disconnect_ms),
            ("KOS_POLL_INTERVAL_MS", &mut t.poll_interval_ms),
        ] {
            if let Some(value) = lookup(key) {
                *slot = parse_env(key, &value)?;
            }
        }

        Ok(())
    }

    /// 기본값으로 설정 파일 생성
    pub fn init() -> Result<PathBuf> {
        let config_dir = Self::config_dir();
        let config_path = Self::config_path();

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)?;
        }

        let toml_string = toml::to_string_pretty(&Self::default())
            .map_err(|e| KosError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(&config_path, toml_string)?;

        Ok(config_path)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| KosError::Config(format!("{} has an invalid value: '{}'", key, value)))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(KosError::Config(format!("{} has an invalid value: '{}'", key, value))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 5410);
        assert_eq!(config.transport, TransportKind::Tcp);
        assert_eq!(config.cpu, None);
        assert_eq!(config.timeouts.poll_interval_ms, 100);
        assert!(!config.reboot_on_connect);
    }

    #[test]
    fn test_config_deserialization() {
        let toml_str = r#"
            host = "10.0.0.5"
            port = 5411
            cpu = "lander"
            transport = "process"

            [timeouts]
            command_ms = 60000
        "#;

        let config = Config::from_toml(toml_str).unwrap();
        assert_eq!(config.host, "10.0.0.5");
        assert_eq!(config.port, 5411);
        assert_eq!(config.cpu.as_deref(), Some("lander"));
        assert_eq!(config.transport, TransportKind::Process);
        assert_eq!(config.timeouts.command_ms, 60000);
        assert_eq!(config.timeouts.menu_ms, 10_000);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env(env(&[
                ("KOS_HOST", "192.168.1.20"),
                ("KOS_PORT", "6000"),
                ("KOS_CPU", "2"),
                ("KOS_TRANSPORT", "debug"),
                ("KOS_PROCESS_COMMAND", "nc -v"),
                ("KOS_REBOOT", "yes"),
                ("KOS_TIMEOUT_COMMAND_MS", "1500"),
                ("KOS_POLL_INTERVAL_MS", "20"),
            ]))
            .unwrap();

        assert_eq!(config.address(), "192.168.1.20:6000");
        assert_eq!(config.cpu.as_deref(), Some("2"));
        assert_eq!(config.transport, TransportKind::Process);
        assert_eq!(config.process_command, vec!["nc", "-v"]);
        assert!(config.reboot_on_connect);
        assert_eq!(config.timeouts.command_ms, 1500);
        assert_eq!(config.timeouts.poll_interval(), Duration::from_millis(20));
    }

    #[test]
    fn test_invalid_env_value() {
        let mut config = Config::default();
        let result = config.apply_env(env(&[("KOS_PORT", "not-a-port")]));
        assert!(matches!(result, Err(KosError::Config(_))));

        let result = config.apply_env(env(&[("KOS_TRANSPORT", "carrier-pigeon")]));
        assert!(matches!(result, Err(KosError::Config(_))));
    }

    #[test]
    fn test_empty_cpu_clears_selection() {
        let mut config = Config::default();
        config.cpu = Some("1".to_string());
        config.apply_env(env(&[("KOS_CPU", "  ")])).unwrap();
        assert_eq!(config.cpu, None);
    }
}
