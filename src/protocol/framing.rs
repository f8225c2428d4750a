//! 명령/응답 경계 판별
//!
//! 원격 터미널 출력에는 길이나 구분자가 없습니다. 명령 뒤에 고유한 종료 토큰을
//! 출력하는 문장을 덧붙이고, 그 토큰이 줄 맨 앞에 나타나면 명령이 끝난 것으로 봅니다.
//! 에코된 `PRINT "<token>".` 줄은 토큰 앞에 따옴표가 있으므로 일치하지 않습니다.

use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;
use uuid::Uuid;

pub const LINE_ENDING: &str = "\r\n";

/// 원격 인터프리터가 오류를 보고할 때 붙이는 위치 줄
static REMOTE_ERROR_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*At interpreter, line \d+").unwrap());

/// 보낼 명령 하나
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub command: String,
    pub timeout: Duration,
    pub terminator: String,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
            terminator: new_terminator(),
        }
    }

    /// 명령 줄과 종료 토큰 출력 문장
    pub fn wire_text(&self) -> String {
        let command = self.command.trim_end();
        format!(
            "{command}{eol}PRINT \"{token}\".{eol}",
            command = command,
            token = self.terminator,
            eol = LINE_ENDING
        )
    }

    pub fn completion_pattern(&self) -> Regex {
        terminator_pattern(&self.terminator)
    }
}

pub fn new_terminator() -> String {
    format!("__KOSB_END_{}__", Uuid::new_v4().simple())
}

/// 토큰이 줄 맨 앞에서 시작하는 경우만 일치
pub fn terminator_pattern(token: &str) -> Regex {
    // 토큰은 영숫자와 밑줄뿐이라 항상 유효한 정규식
    Regex::new(&format!(r"(?m)^{}[ \t]*$", regex::escape(token))).unwrap()
}

/// 캡처한 텍스트에서 명령 에코와 종료 토큰을 걷어낸 사용자 출력
pub fn extract_output(captured: &str, request: &CommandRequest) -> String {
    let mut echoes: Vec<&str> = request
        .command
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    let lines: Vec<&str> = captured
        .lines()
        .filter(|line| !line.contains(&request.terminator))
        .filter(|line| {
            // 에코는 명령 줄마다 한 번만 제거 (같은 내용의 실제 출력은 남김)
            let trimmed = line.trim();
            match echoes.iter().position(|e| trimmed.ends_with(*e)) {
                Some(idx) => {
                    echoes.remove(idx);
                    false
                }
                None => true,
            }
        })
        .collect();

    let start = lines.iter().position(|l| !l.trim().is_empty());
    let end = lines.iter().rposition(|l| !l.trim().is_empty());

    match (start, end) {
        (Some(s), Some(e)) => lines[s..=e].join("\n"),
        _ => String::new(),
    }
}

/// 출력에 원격 오류 보고가 있으면 오류 메시지 줄 반환
///
/// 메시지는 위치 줄 바로 앞의 비어 있지 않은 줄입니다. 그보다 앞의 출력은
/// 오류 전에 명령이 정상적으로 찍은 내용입니다.
pub fn detect_remote_error(output: &str) -> Option<String> {
    let trailer = REMOTE_ERROR_REGEX.find(output)?;

    let message = output[..trailer.start()]
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .unwrap_or("remote interpreter reported an error");
    Some(message.to_string())
}
