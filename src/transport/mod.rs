//! 원격 터미널과의 원시 바이트 스트림
//!
//! 모든 전송 방식은 백그라운드 reader 태스크가 수신 바이트를 공유 inbox에
//! 쌓고, [`StreamBuffer`]가 그것을 폴링 주기마다 병합해서 패턴을 검사합니다.
//! 전송 종류와 상관없이 대기 방식이 같도록 이벤트 콜백 대신 폴링을 씁니다.

pub mod process;
pub mod tcp;

use crate::config::{Config, TransportKind};
use crate::error::{KosError, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::warn;

pub use process::ProcessTransport;
pub use tcp::TcpTransport;

/// 터미널 제어 시퀀스 (CSI, OSC, 문자셋 지정, 단일 문자 명령)
static ESCAPE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[()][0-9A-Za-z]|\x1b[=>78DEHMc]")
        .unwrap()
});

/// 청크 끝에서 아직 끝나지 않은 제어 시퀀스
static UNFINISHED_ESCAPE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b(?:\[[0-9;?]*[ -/]*|\][^\x07\x1b]*\x1b?|[()])?$").unwrap()
});

/// inbox와 텍스트 버퍼가 각각 보관하는 최대 바이트 수 (넘치면 오래된 쪽부터 버림)
pub const BUFFER_LIMIT: usize = 1024 * 1024;

/// 끝나지 않은 제어 시퀀스를 이 길이 이상 붙잡아 두지 않음
const MAX_PENDING_ESCAPE: usize = 4096;

/// Raw duplex stream to the remote terminal
#[async_trait]
pub trait Transport: Send {
    /// Transport name for logs ("tcp", "process")
    fn name(&self) -> &str;

    /// Establish the stream
    async fn init(&mut self) -> Result<()>;

    /// Write text verbatim
    async fn send(&mut self, text: &str) -> Result<()>;

    /// Release the stream; calling it twice is a no-op
    async fn close(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Buffer shared with the background reader
    fn buffer(&mut self) -> &mut StreamBuffer;

    /// Return and clear everything received since the last read or match
    fn read(&mut self) -> String {
        let buffer = self.buffer();
        buffer.merge();
        buffer.take()
    }

    /// Poll until `pattern` matches the accumulated text, then return and clear it
    async fn wait_for(&mut self, pattern: &Regex, timeout: Duration) -> Result<String> {
        self.buffer().wait_for(pattern, timeout).await
    }
}

/// 설정에 따라 전송 구현 선택
pub fn create(config: &Config) -> Box<dyn Transport> {
    let poll_interval = config.timeouts.poll_interval();
    let connect_timeout = Duration::from_millis(config.timeouts.connect_ms);

    match config.transport {
        TransportKind::Tcp => Box::new(TcpTransport::new(
            config.address(),
            connect_timeout,
            poll_interval,
        )),
        TransportKind::Process => {
            let mut argv = config.process_command.clone();
            argv.push(config.host.clone());
            argv.push(config.port.to_string());
            Box::new(ProcessTransport::new(argv, poll_interval))
        }
    }
}

/// reader 태스크가 채우는 수신함
#[derive(Debug, Default)]
pub struct Inbox {
    bytes: Vec<u8>,
    eof: bool,
    /// 아무도 읽지 않아 버린 바이트 수
    dropped: usize,
}

impl Inbox {
    pub fn push(&mut self, data: &[u8]) {
        self.bytes.extend_from_slice(data);
        if self.bytes.len() > BUFFER_LIMIT {
            let excess = self.bytes.len() - BUFFER_LIMIT;
            self.bytes.drain(..excess);
            self.dropped += excess;
        }
    }

    pub fn close(&mut self) {
        self.eof = true;
    }
}

pub type SharedInbox = Arc<Mutex<Inbox>>;

/// 수신 바이트 누적 버퍼
///
/// "inbox를 버퍼에 덧붙이고, 읽으면 비운다"는 동작을 모든 전송이 공유합니다.
#[derive(Debug)]
pub struct StreamBuffer {
    inbox: SharedInbox,
    /// 아직 UTF-8로 완성되지 않은 바이트
    partial: Vec<u8>,
    /// 다음 청크에서 끝날 제어 시퀀스의 앞부분
    pending_escape: String,
    text: String,
    eof: bool,
    poll_interval: Duration,
}

impl StreamBuffer {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            inbox: Arc::new(Mutex::new(Inbox::default())),
            partial: Vec::new(),
            pending_escape: String::new(),
            text: String::new(),
            eof: false,
            poll_interval,
        }
    }

    /// 새 스트림용으로 비우고 reader 태스크에 넘길 inbox 반환
    pub fn reset(&mut self) -> SharedInbox {
        self.inbox = Arc::new(Mutex::new(Inbox::default()));
        self.partial.clear();
        self.pending_escape.clear();
        self.text.clear();
        self.eof = false;
        Arc::clone(&self.inbox)
    }

    /// inbox에 도착한 바이트를 텍스트 버퍼로 병합
    pub fn merge(&mut self) {
        let (bytes, eof, dropped) = match self.inbox.lock() {
            Ok(mut inbox) => (
                std::mem::take(&mut inbox.bytes),
                inbox.eof,
                std::mem::take(&mut inbox.dropped),
            ),
            // reader 태스크가 패닉하면 스트림은 더 이상 쓸 수 없음
            Err(_) => (Vec::new(), true, 0),
        };
        self.eof = eof;

        if dropped > 0 {
            warn!("Discarded {} unread byte(s) from the remote terminal", dropped);
            self.partial.clear();
            self.pending_escape.clear();
        }

        if bytes.is_empty() {
            return;
        }

        self.partial.extend_from_slice(&bytes);
        let decoded = match std::str::from_utf8(&self.partial) {
            Ok(s) => {
                let s = s.to_string();
                self.partial.clear();
                s
            }
            Err(e) if e.error_len().is_none() => {
                // 멀티바이트 문자가 잘린 경우 나머지는 다음 병합까지 보관
                let valid = e.valid_up_to();
                let s = String::from_utf8_lossy(&self.partial[..valid]).into_owned();
                self.partial.drain(..valid);
                s
            }
            Err(_) => {
                let s = String::from_utf8_lossy(&self.partial).into_owned();
                self.partial.clear();
                s
            }
        };

        let mut chunk = std::mem::take(&mut self.pending_escape);
        chunk.push_str(&decoded);
        if let Some(unfinished) = UNFINISHED_ESCAPE_REGEX.find(&chunk) {
            if chunk.len() - unfinished.start() < MAX_PENDING_ESCAPE {
                self.pending_escape = chunk.split_off(unfinished.start());
            }
        }

        self.text.push_str(&clean_terminal_text(&chunk));
        if self.text.len() > BUFFER_LIMIT {
            let mut cut = self.text.len() - BUFFER_LIMIT;
            while !self.text.is_char_boundary(cut) {
                cut += 1;
            }
            self.text.drain(..cut);
        }
    }

    pub fn take(&mut self) -> String {
        std::mem::take(&mut self.text)
    }

    pub fn peek(&self) -> &str {
        &self.text
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    pub fn mark_closed(&mut self) {
        if let Ok(mut inbox) = self.inbox.lock() {
            inbox.close();
        }
        self.eof = true;
    }

    /// 패턴이 나타날 때까지 폴링
    ///
    /// 일치하면 누적된 텍스트 전체를 반환하고 비웁니다. 마감 시각이 지나면
    /// Timeout, 일치 없이 스트림이 끝나면 Connection 에러입니다.
    pub async fn wait_for(&mut self, pattern: &Regex, timeout: Duration) -> Result<String> {
        let deadline = Instant::now() + timeout;

        loop {
            self.merge();

            if pattern.is_match(&self.text) {
                return Ok(self.take());
            }

            if self.eof {
                return Err(KosError::Connection(format!(
                    "stream closed while waiting for `{}`",
                    pattern.as_str()
                )));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(KosError::timeout(
                    format!("pattern `{}`", pattern.as_str()),
                    timeout.as_millis() as u64,
                ));
            }

            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}

/// 제어 시퀀스와 CR 제거
pub fn clean_terminal_text(text: &str) -> String {
    let stripped = ESCAPE_REGEX.replace_all(text, "");
    stripped.replace('\r', "")
}

/// reader 절반을 inbox로 계속 복사하는 백그라운드 태스크
pub fn spawn_reader<R>(mut reader: R, inbox: SharedInbox) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 4096];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => match inbox.lock() {
                    Ok(mut inbox) => inbox.push(&chunk[..n]),
                    Err(_) => break,
                },
            }
        }
        if let Ok(mut inbox) = inbox.lock() {
            inbox.close();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(buffer: &StreamBuffer, data: &[u8]) {
        buffer.inbox.lock().unwrap().push(data);
    }

    #[test]
    fn test_read_clears_buffer() {
        let mut buffer = StreamBuffer::new(Duration::from_millis(10));
        push(&buffer, b"hello ");
        push(&buffer, b"world");
        buffer.merge();
        assert_eq!(buffer.take(), "hello world");
        buffer.merge();
        assert_eq!(buffer.take(), "");
    }

    #[test]
    fn test_split_utf8_is_preserved() {
        let mut buffer = StreamBuffer::new(Duration::from_millis(10));
        let bytes = "궤도".as_bytes();
        push(&buffer, &bytes[..2]);
        buffer.merge();
        assert_eq!(buffer.peek(), "");
        push(&buffer, &bytes[2..]);
        buffer.merge();
        assert_eq!(buffer.peek(), "궤도");
    }

    #[test]
    fn test_clean_terminal_text() {
        let raw = "\x1b[2J\x1b[1;1HPROCEED.\r\n\x1b]0;title\x07> ";
        assert_eq!(clean_terminal_text(raw), "PROCEED.\n> ");
    }

    #[test]
    fn test_escape_split_across_merges_is_removed() {
        let mut buffer = StreamBuffer::new(Duration::from_millis(10));
        push(&buffer, b"abc\x1b[3");
        buffer.merge();
        assert_eq!(buffer.peek(), "abc");

        push(&buffer, b"1mred\x1b]0;ti");
        buffer.merge();
        assert_eq!(buffer.peek(), "abcred");

        push(&buffer, b"tle\x1b");
        buffer.merge();
        assert_eq!(buffer.peek(), "abcred");

        push(&buffer, b"\\ done\r\n");
        buffer.merge();
        assert_eq!(buffer.take(), "abcred done\n");
    }

    #[test]
    fn test_cleaned_text_is_not_cleaned_again() {
        let mut buffer = StreamBuffer::new(Duration::from_millis(10));
        push(&buffer, b"\x1b[2Jone\r\n");
        buffer.merge();
        push(&buffer, b"two\r\n");
        buffer.merge();
        assert_eq!(buffer.take(), "one\ntwo\n");
    }

    #[test]
    fn test_unread_inbox_keeps_newest_bytes() {
        let mut buffer = StreamBuffer::new(Duration::from_millis(10));
        push(&buffer, &vec![b'a'; BUFFER_LIMIT]);
        push(&buffer, b"tail\n");
        {
            let inbox = buffer.inbox.lock().unwrap();
            assert_eq!(inbox.bytes.len(), BUFFER_LIMIT);
            assert_eq!(inbox.dropped, 5);
        }

        buffer.merge();
        assert_eq!(buffer.peek().len(), BUFFER_LIMIT);
        assert!(buffer.peek().ends_with("tail\n"));
        assert_eq!(buffer.inbox.lock().unwrap().dropped, 0);
    }

    #[test]
    fn test_text_buffer_is_bounded() {
        let mut buffer = StreamBuffer::new(Duration::from_millis(10));
        for _ in 0..3 {
            push(&buffer, &vec![b'x'; BUFFER_LIMIT / 2]);
            buffer.merge();
        }
        push(&buffer, "끝".as_bytes());
        buffer.merge();
        assert!(buffer.peek().len() <= BUFFER_LIMIT);
        assert!(buffer.peek().ends_with('끝'));
    }

    #[tokio::test]
    async fn test_wait_for_match_returns_accumulated() {
        let mut buffer = StreamBuffer::new(Duration::from_millis(5));
        push(&buffer, b"line one\nready> ");
        let pattern = Regex::new("ready> ").unwrap();
        let text = buffer
            .wait_for(&pattern, Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(text, "line one\nready> ");
        assert_eq!(buffer.peek(), "");
    }

    #[tokio::test]
    async fn test_wait_for_sees_late_data() {
        let mut buffer = StreamBuffer::new(Duration::from_millis(5));
        let inbox = Arc::clone(&buffer.inbox);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            inbox.lock().unwrap().push(b"DONE\n");
        });
        let pattern = Regex::new("DONE").unwrap();
        assert!(buffer.wait_for(&pattern, Duration::from_secs(2)).await.is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_timeout_precision() {
        let poll = Duration::from_millis(20);
        let mut buffer = StreamBuffer::new(poll);
        let pattern = Regex::new("never").unwrap();
        let timeout = Duration::from_millis(150);

        let started = std::time::Instant::now();
        let result = buffer.wait_for(&pattern, timeout).await;
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(KosError::Timeout { timeout_ms: 150, .. })));
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + poll * 5);
    }

    #[tokio::test]
    async fn test_wait_for_fails_fast_on_eof() {
        let mut buffer = StreamBuffer::new(Duration::from_millis(5));
        push(&buffer, b"partial");
        buffer.inbox.lock().unwrap().close();
        let pattern = Regex::new("never").unwrap();
        let result = buffer.wait_for(&pattern, Duration::from_secs(10)).await;
        assert!(matches!(result, Err(KosError::Connection(_))));
    }

    #[tokio::test]
    async fn test_spawn_reader_marks_eof() {
        let (client, mut server) = tokio::io::duplex(64);
        let inbox: SharedInbox = Arc::new(Mutex::new(Inbox::default()));
        let handle = spawn_reader(client, Arc::clone(&inbox));

        use tokio::io::AsyncWriteExt;
        server.write_all(b"abc").await.unwrap();
        drop(server);
        handle.await.unwrap();

        let inbox = inbox.lock().unwrap();
        assert_eq!(inbox.bytes, b"abc");
        assert!(inbox.eof);
    }
}
