pub mod client;
pub mod handlers;
pub mod lifecycle;
pub mod protocol;
pub mod server;
pub mod session;

// 요청/응답 타입은 daemon::protocol::DaemonRequest 처럼 전체 경로로 사용
pub use client::DaemonClient;
pub use server::{DaemonServer, RunOutcome};
