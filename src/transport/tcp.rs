use crate::error::{KosError, Result};
use crate::transport::{SharedInbox, StreamBuffer, Transport};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

/// 원격 터미널 서버에 직접 붙는 TCP 전송
///
/// 서버가 보내는 telnet 옵션 협상은 모두 거절하고 데이터에서 걸러냅니다.
pub struct TcpTransport {
    address: String,
    connect_timeout: Duration,
    writer: Option<SharedWriter>,
    reader_task: Option<JoinHandle<()>>,
    buffer: StreamBuffer,
}

impl TcpTransport {
    pub fn new(address: String, connect_timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            address,
            connect_timeout,
            writer: None,
            reader_task: None,
            buffer: StreamBuffer::new(poll_interval),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &str {
        "tcp"
    }

    async fn init(&mut self) -> Result<()> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| {
                KosError::timeout(
                    format!("TCP connect to {}", self.address),
                    self.connect_timeout.as_millis() as u64,
                )
            })?
            .map_err(|e| KosError::Connection(format!("{}: {}", self.address, e)))?;

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }

        let (reader, writer) = stream.into_split();
        let writer = Arc::new(Mutex::new(writer));
        let inbox = self.buffer.reset();

        self.reader_task = Some(spawn_telnet_reader(reader, inbox, Arc::clone(&writer)));
        self.writer = Some(writer);

        debug!("TCP stream open to {}", self.address);
        Ok(())
    }

    async fn send(&mut self, text: &str) -> Result<()> {
        let writer = self
            .writer
            .as_ref()
            .ok_or_else(|| KosError::Connection("transport is not open".to_string()))?;

        let mut writer = writer.lock().await;
        writer
            .write_all(text.as_bytes())
            .await
            .map_err(|e| KosError::Connection(format!("write failed: {}", e)))?;
        writer
            .flush()
            .await
            .map_err(|e| KosError::Connection(format!("flush failed: {}", e)))?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        if let Some(writer) = self.writer.take() {
            // 상대가 이미 끊었으면 shutdown 실패는 무시
            let _ = writer.lock().await.shutdown().await;
            debug!("TCP stream to {} closed", self.address);
        }
        self.buffer.mark_closed();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.writer.is_some() && !self.buffer.is_eof() && !inbox_closed(&self.reader_task)
    }

    fn buffer(&mut self) -> &mut StreamBuffer {
        &mut self.buffer
    }
}

fn inbox_closed(task: &Option<JoinHandle<()>>) -> bool {
    task.as_ref().map_or(true, |t| t.is_finished())
}

fn spawn_telnet_reader(
    mut reader: tokio::net::tcp::OwnedReadHalf,
    inbox: SharedInbox,
    writer: SharedWriter,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut filter = TelnetFilter::default();
        let mut chunk = [0u8; 4096];
        loop {
            let n = match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };

            let (data, replies) = filter.feed(&chunk[..n]);
            if !replies.is_empty() {
                let mut writer = writer.lock().await;
                if writer.write_all(&replies).await.is_err() {
                    break;
                }
            }

            match inbox.lock() {
                Ok(mut inbox) => inbox.push(&data),
                Err(_) => break,
            }
        }
        if let Ok(mut inbox) = inbox.lock() {
            inbox.close();
        }
    })
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum FilterState {
    #[default]
    Data,
    Iac,
    Option(u8),
    Sub,
    SubIac,
}

/// telnet IAC 시퀀스 분리기
///
/// 데이터 바이트와, 협상에 대한 거절 응답(WONT/DONT)을 돌려줍니다.
/// 청크 경계에서 잘린 시퀀스는 상태로 이어서 처리합니다.
#[derive(Debug, Default)]
pub struct TelnetFilter {
    state: FilterState,
}

impl TelnetFilter {
    pub fn feed(&mut self, input: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut data = Vec::with_capacity(input.len());
        let mut replies = Vec::new();

        for &byte in input {
            self.state = match (self.state, byte) {
                (FilterState::Data, IAC) => FilterState::Iac,
                (FilterState::Data, b) => {
                    data.push(b);
                    FilterState::Data
                }
                (FilterState::Iac, IAC) => {
                    data.push(IAC);
                    FilterState::Data
                }
                (FilterState::Iac, SB) => FilterState::Sub,
                (FilterState::Iac, cmd @ (DO | DONT | WILL | WONT)) => FilterState::Option(cmd),
                (FilterState::Iac, _) => FilterState::Data,
                (FilterState::Option(cmd), opt) => {
                    match cmd {
                        DO => replies.extend_from_slice(&[IAC, WONT, opt]),
                        WILL => replies.extend_from_slice(&[IAC, DONT, opt]),
                        _ => {}
                    }
                    FilterState::Data
                }
                (FilterState::Sub, IAC) => FilterState::SubIac,
                (FilterState::Sub, _) => FilterState::Sub,
                (FilterState::SubIac, SE) => FilterState::Data,
                (FilterState::SubIac, _) => FilterState::Sub,
            };
        }

        (data, replies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_filter_passes_plain_data() {
        let mut filter = TelnetFilter::default();
        let (data, replies) = filter.feed(b"PRINT 1.\r\n");
        assert_eq!(data, b"PRINT 1.\r\n");
        assert!(replies.is_empty());
    }

    #[test]
    fn test_filter_refuses_negotiation() {
        let mut filter = TelnetFilter::default();
        let input = [b'a', IAC, DO, 24, IAC, WILL, 1, b'b'];
        let (data, replies) = filter.feed(&input);
        assert_eq!(data, b"ab");
        assert_eq!(replies, vec![IAC, WONT, 24, IAC, DONT, 1]);
    }

    #[test]
    fn test_filter_skips_subnegotiation_across_chunks() {
        let mut filter = TelnetFilter::default();
        let (data, _) = filter.feed(&[b'x', IAC, SB, 24, 1]);
        assert_eq!(data, b"x");
        let (data, _) = filter.feed(&[IAC, SE, b'y', IAC, IAC]);
        assert_eq!(data, vec![b'y', IAC]);
    }

    #[tokio::test]
    async fn test_init_refused() {
        // 바인드 후 바로 닫아서 확실히 비어 있는 포트를 얻음
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut transport = TcpTransport::new(
            addr.to_string(),
            Duration::from_secs(2),
            Duration::from_millis(10),
        );
        let result = transport.init().await;
        assert!(matches!(result, Err(KosError::Connection(_))));
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_send_read_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            writer.write_all(&[IAC, DO, 24]).await.unwrap();
            writer.write_all(b"hello\r\n").await.unwrap();
            let mut reader = tokio::io::BufReader::new(reader);
            let mut line = Vec::new();
            reader.read_until(b'\n', &mut line).await.unwrap();
            line
        });

        let mut transport = TcpTransport::new(
            addr.to_string(),
            Duration::from_secs(2),
            Duration::from_millis(10),
        );
        transport.init().await.unwrap();
        assert!(transport.is_open());

        let pattern = regex::Regex::new("hello").unwrap();
        let text = transport
            .wait_for(&pattern, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(text, "hello\n");

        transport.send("ping\r\n").await.unwrap();
        let received = server.await.unwrap();
        // 거절 응답(IAC WONT 24)이 먼저 도착한 뒤 보낸 줄이 이어짐
        assert!(received.ends_with(b"ping\r\n"));
        assert_eq!(&received[..3], &[IAC, WONT, 24]);

        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert!(!transport.is_open());
    }
}
