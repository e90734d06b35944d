//! Event Log - 도메인 이벤트 append-only 기록
//!
//! 설정에 `event_log` 경로가 있을 때만 구독자로 등록됩니다. 기록 실패는
//! 코어 동작에 영향을 주지 않습니다 (best-effort).

use async_trait::async_trait;
use hangar_foundation::{EventListener, HangarEvent, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use tracing::warn;

/// JSONL 이벤트 로그 작성자
pub struct EventLogWriter {
    path: String,
    file: Mutex<File>,
}

impl EventLogWriter {
    /// 파일 열기 (없으면 생성, 있으면 append)
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.display().to_string(),
            file: Mutex::new(file),
        })
    }
}

#[async_trait]
impl EventListener for EventLogWriter {
    fn name(&self) -> &str {
        "event-log"
    }

    async fn on_event(&self, event: &HangarEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                warn!("event_log_serialize_failed: {}", e);
                return;
            }
        };

        let mut file = self.file.lock().expect("event log poisoned");
        if let Err(e) = writeln!(file, "{}", line) {
            warn!("event_log_write_failed: path={}, error={}", self.path, e);
        }
    }
}
