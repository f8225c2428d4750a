use crate::error::{KosError, Result};
use crate::transport::{spawn_reader, StreamBuffer, Transport};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tracing::debug;

/// 로컬 프로그램을 거치는 디버그용 전송
///
/// `telnet host port` 같은 명령을 띄우고 stdin/stdout을 원격 터미널처럼 씁니다.
/// 협상이나 줄바꿈 변환은 그 프로그램에 맡깁니다.
pub struct ProcessTransport {
    argv: Vec<String>,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    reader_task: Option<JoinHandle<()>>,
    buffer: StreamBuffer,
}

impl ProcessTransport {
    pub fn new(argv: Vec<String>, poll_interval: Duration) -> Self {
        Self {
            argv,
            child: None,
            stdin: None,
            reader_task: None,
            buffer: StreamBuffer::new(poll_interval),
        }
    }
}

#[async_trait]
impl Transport for ProcessTransport {
    fn name(&self) -> &str {
        "process"
    }

    async fn init(&mut self) -> Result<()> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| KosError::Config("process transport command is empty".to_string()))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| KosError::Connection(format!("failed to start '{}': {}", program, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| KosError::Connection("child stdout unavailable".to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| KosError::Connection("child stdin unavailable".to_string()))?;

        let inbox = self.buffer.reset();
        self.reader_task = Some(spawn_reader(stdout, inbox));
        self.stdin = Some(stdin);
        self.child = Some(child);

        debug!("Started transport process: {}", self.argv.join(" "));
        Ok(())
    }

    async fn send(&mut self, text: &str) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| KosError::Connection("transport is not open".to_string()))?;

        stdin
            .write_all(text.as_bytes())
            .await
            .map_err(|e| KosError::Connection(format!("write failed: {}", e)))?;
        stdin
            .flush()
            .await
            .map_err(|e| KosError::Connection(format!("flush failed: {}", e)))?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.stdin.take();
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        if let Some(mut child) = self.child.take() {
            let _ = child.kill().await;
            debug!("Transport process stopped");
        }
        self.buffer.mark_closed();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stdin.is_some()
            && !self.buffer.is_eof()
            && self.reader_task.as_ref().map_or(false, |t| !t.is_finished())
    }

    fn buffer(&mut self) -> &mut StreamBuffer {
        &mut self.buffer
    }
}
