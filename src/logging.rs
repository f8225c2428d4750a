//! tracing 구독자 설정
//!
//! 필터는 `KOS_BRIDGE_LOG` 환경 변수에서 읽고 (예: `kos_bridge=debug`),
//! 없으면 호출한 쪽이 넘긴 기본 레벨을 씁니다. 출력은 항상 stderr.

use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "KOS_BRIDGE_LOG";

/// CLI 기본 레벨
pub const CLI_LEVEL: &str = "warn";

/// 데몬 기본 레벨
pub const DAEMON_LEVEL: &str = "info";

pub fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// 전역 구독자 설치 (이미 설치되어 있으면 무시)
pub fn init(default_level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(default_level))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
