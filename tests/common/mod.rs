//! 테스트용 가짜 kOS 텔넷 서버
//!
//! CPU 메뉴를 보여주고, 번호를 받으면 "Proceed."를 출력한 뒤 한 줄씩 명령을
//! 에코하고 평가합니다. 지원하는 명령:
//! - `PRINT "text".` → text
//! - `PRINT a+b.` → 합
//! - `WAIT n.` → n초 동안 다음 줄 처리를 미룸
//! - `REBOOT.` → 부팅 배너와 "Proceed." 재출력
//! - 그 밖의 명령 → 인터프리터 오류 보고

#![allow(dead_code)]

use kos_bridge::config::Config;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

pub const MENU: &str = "\x1b[H\x1b[2J\
Terminal: type = INITIAL_UNSET, size = 80x24\r\n\
__________________________________________________________________________\r\n\
                        Menu GUI   Other\r\n\
                        Pick Open Telnets  Vessel Name (CPU tagname)\r\n\
                        ---- ---- -------  --------------------------------\r\n\
                         [1]   no    0     Untitled Space Craft (CX-4181(kos1))\r\n\
                         [2]   yes   1     Relay Sat (KR-2042 b(relay))\r\n\
                         [3]   no    0     Mun Lander (CX-4181())\r\n\
--------------------------------------------------------------------------\r\n\
Choose a CPU to attach to by typing a selection number and pressing\r\n\
return/enter. Or enter [Q] to quit terminal server.\r\n";

const IAC: u8 = 255;
const DO: u8 = 253;
const TERMINAL_TYPE: u8 = 24;

pub struct FakeKos {
    pub port: u16,
    commands: Arc<Mutex<Vec<String>>>,
    connections: Arc<AtomicUsize>,
}

impl FakeKos {
    pub fn start() -> Self {
        Self::spawn(true)
    }

    /// 연결은 받지만 메뉴를 보내지 않음
    pub fn start_silent() -> Self {
        Self::spawn(false)
    }

    fn spawn(send_menu: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let commands = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));

        let log = Arc::clone(&commands);
        let count = Arc::clone(&connections);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                count.fetch_add(1, Ordering::SeqCst);
                let log = Arc::clone(&log);
                thread::spawn(move || {
                    let _ = serve(stream, send_menu, log);
                });
            }
        });

        Self {
            port,
            commands,
            connections,
        }
    }

    /// 받은 명령 (CPU 선택 번호와 종료 토큰 출력문 제외)
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// 이 서버와 주어진 런타임 디렉토리를 쓰는 빠른 설정
    pub fn config(&self, runtime_dir: &Path) -> Config {
        let mut config = Config::default();
        config.port = self.port;
        config.runtime_dir = Some(runtime_dir.to_path_buf());
        config.timeouts.connect_ms = 2_000;
        config.timeouts.menu_ms = 2_000;
        config.timeouts.reboot_ms = 2_000;
        config.timeouts.proceed_ms = 2_000;
        config.timeouts.command_ms = 3_000;
        config.timeouts.client_ms = 10_000;
        config.timeouts.settle_connect_ms = 20;
        config.timeouts.settle_disconnect_ms = 10;
        config.timeouts.poll_interval_ms = 20;
        config
    }

    /// 바이너리를 띄울 때 쓰는 같은 설정의 환경 변수
    pub fn env(&self, runtime_dir: &Path) -> Vec<(String, String)> {
        vec![
            ("KOS_PORT".to_string(), self.port.to_string()),
            (
                "KOS_BRIDGE_RUNTIME_DIR".to_string(),
                runtime_dir.display().to_string(),
            ),
            // 사용자 설정 파일의 영향을 받지 않도록
            (
                "XDG_CONFIG_HOME".to_string(),
                runtime_dir.join("config").display().to_string(),
            ),
            ("KOS_TIMEOUT_MENU_MS".to_string(), "2000".to_string()),
            ("KOS_TIMEOUT_PROCEED_MS".to_string(), "2000".to_string()),
            ("KOS_SETTLE_CONNECT_MS".to_string(), "20".to_string()),
            ("KOS_SETTLE_DISCONNECT_MS".to_string(), "10".to_string()),
            ("KOS_POLL_INTERVAL_MS".to_string(), "20".to_string()),
        ]
    }
}

fn serve(
    mut stream: TcpStream,
    send_menu: bool,
    log: Arc<Mutex<Vec<String>>>,
) -> std::io::Result<()> {
    stream.write_all(&[IAC, DO, TERMINAL_TYPE])?;
    if !send_menu {
        // 클라이언트가 끊을 때까지 대기
        let mut sink = Vec::new();
        let _ = BufReader::new(stream).read_until(0, &mut sink);
        return Ok(());
    }
    stream.write_all(MENU.as_bytes())?;

    let mut reader = BufReader::new(stream.try_clone()?);
    let mut attached = false;

    loop {
        let mut raw = Vec::new();
        if reader.read_until(b'\n', &mut raw)? == 0 {
            return Ok(());
        }
        let line = decode_line(&raw);
        if line.is_empty() {
            continue;
        }

        if !attached {
            match line.parse::<u32>() {
                Ok(id) if (1..=3).contains(&id) => {
                    attached = true;
                    write!(stream, "{}\r\nProceed.\r\n", line)?;
                }
                _ => write!(stream, "Invalid selection\r\n{}", MENU)?,
            }
            continue;
        }

        if line.starts_with('\u{4}') {
            write!(stream, "Detached.\r\n")?;
            return Ok(());
        }

        // 원격 터미널은 입력을 그대로 에코
        write!(stream, "{}\r\n", line)?;
        if !line.contains("__KOSB_END_") {
            log.lock().unwrap().push(line.clone());
        }

        for output in evaluate(&line) {
            write!(stream, "{}\r\n", output)?;
        }
        stream.flush()?;
    }
}

/// 클라이언트의 텔넷 응답 바이트를 걷어내고 한 줄로 복원
fn decode_line(raw: &[u8]) -> String {
    let mut bytes = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == IAC && i + 2 < raw.len() {
            i += 3;
            continue;
        }
        bytes.push(raw[i]);
        i += 1;
    }
    String::from_utf8_lossy(&bytes).trim_end().to_string()
}

fn evaluate(line: &str) -> Vec<String> {
    let statement = line.trim().trim_end_matches('.');

    if statement.eq_ignore_ascii_case("REBOOT") {
        return vec![
            String::new(),
            "kOS Operating System".to_string(),
            "KerboScript v1.4.0.0".to_string(),
            String::new(),
            "Proceed.".to_string(),
        ];
    }

    if let Some(seconds) = statement.strip_prefix("WAIT ") {
        let seconds: f64 = seconds.trim().parse().unwrap_or(0.0);
        thread::sleep(Duration::from_secs_f64(seconds));
        return Vec::new();
    }

    if let Some(expr) = statement.strip_prefix("PRINT ") {
        let expr = expr.trim();
        if let Some(text) = expr.strip_prefix('"').and_then(|e| e.strip_suffix('"')) {
            return vec![text.to_string()];
        }
        if let Some((a, b)) = expr.split_once('+') {
            if let (Ok(a), Ok(b)) = (a.trim().parse::<i64>(), b.trim().parse::<i64>()) {
                return vec![(a + b).to_string()];
            }
        }
    }

    vec![
        format!("Undefined Variable Name '{}'.", statement),
        "At interpreter, line 1".to_string(),
        line.to_string(),
        "^".to_string(),
    ]
}
