//! kOS 스크립팅 터미널 브리지
//!
//! 원격 터미널과의 연결 하나를 로컬 데몬이 유지하고, 여러 클라이언트의
//! 명령을 순서대로 실행합니다.

pub mod cli;
pub mod commands;
pub mod config;
pub mod daemon;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod transport;
pub mod ui;

pub use config::Config;
pub use error::{KosError, Result};
