use crate::error::{KosError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// 메뉴 한 줄: `[1]   no    0     Vessel Name (part(tag))`
static ENTRY_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*\[\s*(\d+)\s*\]\s+(?:yes|no)\s+\d+\s+(.*?)\s*\((.*)\)\s*$").unwrap()
});

/// 괄호 안쪽 `part(tag)` 분리
static PART_TAG_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(.*?)\((.*)\)$").unwrap());

/// 원격 터미널이 제시하는 CPU 하나
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuEntry {
    pub id: u32,
    pub vessel: String,
    pub part: String,
    pub tag: String,
}

impl CpuEntry {
    pub fn label(&self) -> String {
        if self.tag.is_empty() {
            format!("{} ({})", self.vessel, self.part)
        } else {
            format!("{} ({})", self.vessel, self.tag)
        }
    }
}

/// 접속할 CPU를 고르는 방법
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CpuSelector {
    First,
    Id(u32),
    Label(String),
}

impl CpuSelector {
    /// 설정 값 해석: 숫자면 메뉴 번호, 그 외는 라벨
    pub fn from_setting(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            None | Some("") => Self::First,
            Some(v) => match v.parse::<u32>() {
                Ok(id) => Self::Id(id),
                Err(_) => Self::Label(v.to_string()),
            },
        }
    }

    /// 메뉴 항목 중에서 선택
    ///
    /// 라벨은 태그 일치, 기체 이름 일치, 부분 일치 순으로 찾습니다 (대소문자 무시).
    pub fn select<'a>(&self, entries: &'a [CpuEntry]) -> Result<&'a CpuEntry> {
        let found = match self {
            Self::First => entries.first(),
            Self::Id(id) => entries.iter().find(|e| e.id == *id),
            Self::Label(label) => {
                let wanted = label.to_lowercase();
                entries
                    .iter()
                    .find(|e| e.tag.to_lowercase() == wanted)
                    .or_else(|| entries.iter().find(|e| e.vessel.to_lowercase() == wanted))
                    .or_else(|| {
                        entries.iter().find(|e| {
                            e.tag.to_lowercase().contains(&wanted)
                                || e.vessel.to_lowercase().contains(&wanted)
                        })
                    })
            }
        };

        found.ok_or_else(|| {
            let available: Vec<String> = entries
                .iter()
                .map(|e| format!("[{}] {}", e.id, e.label()))
                .collect();
            KosError::Protocol(format!(
                "requested CPU {:?} is not in the menu (available: {})",
                self,
                available.join(", ")
            ))
        })
    }
}

/// CPU 선택 메뉴 텍스트에서 항목 추출
pub fn parse_menu(text: &str) -> Result<Vec<CpuEntry>> {
    let entries: Vec<CpuEntry> = ENTRY_REGEX
        .captures_iter(text)
        .filter_map(|caps| {
            let id = caps.get(1)?.as_str().parse().ok()?;
            let vessel = caps.get(2)?.as_str().trim().to_string();
            let inner = caps.get(3)?.as_str().trim();

            let (part, tag) = match PART_TAG_REGEX.captures(inner) {
                Some(pt) => (
                    pt.get(1).map_or("", |m| m.as_str()).trim().to_string(),
                    pt.get(2).map_or("", |m| m.as_str()).trim().to_string(),
                ),
                None => (inner.to_string(), String::new()),
            };

            Some(CpuEntry {
                id,
                vessel,
                part,
                tag,
            })
        })
        .collect();

    if entries.is_empty() {
        return Err(KosError::Protocol(
            "CPU menu format not recognized (no selectable entries)".to_string(),
        ));
    }

    Ok(entries)
}
