use crate::{
    constants::ICON_PLACEHOLDER,
    events::model::{LogEvent, LogLevel},
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

#[async_trait]
pub trait LogSink: Send + Sync {
    async fn handle(&self, event: &LogEvent);
    async fn flush(&self) {}
}

pub struct ConsoleSink {
    level_filter: Option<LogLevel>,
}

impl ConsoleSink {
    pub fn new(level_filter: Option<LogLevel>) -> Self {
        Self { level_filter }
    }

    fn accepts(&self, event: &LogEvent) -> bool {
        let meta = event.meta();
        if meta.suppress_console {
            return false;
        }
        match self.level_filter {
            Some(min) => meta.level >= min,
            None => true,
        }
    }
}

#[async_trait]
impl LogSink for ConsoleSink {
    async fn handle(&self, event: &LogEvent) {
        if !self.accepts(event) {
            return;
        }
        match event {
            LogEvent::Network(n) => {
                println!(
                    "{}NET [{}] action={} addr={:?} detail={:?}",
                    ICON_PLACEHOLDER, n.meta.component, n.action, n.addr, n.detail
                );
            }
            LogEvent::Protocol(p) => {
                println!(
                    "{}RPC conn={} method={} outcome={} detail={:?}",
                    ICON_PLACEHOLDER, p.connection, p.method, p.outcome, p.detail
                );
            }
            LogEvent::System(s) => {
                println!(
                    "{}SYS [{}] action={} detail={:?} corr={:?}",
                    ICON_PLACEHOLDER, s.meta.component, s.action, s.detail, s.meta.corr_id
                );
            }
        }
    }
}

/// Open log file plus the bytes it holds, so rotation never stats the file.
struct JsonWriter {
    file: tokio::fs::File,
    written: u64,
}

/// JSON lines sink. `events.jsonl` rotates to `events.jsonl.1` .. `.N` once
/// it reaches `max_size_bytes`; `max_backups == 0` disables rotation.
pub struct JsonFileSink {
    path: PathBuf,
    max_size_bytes: u64,
    max_backups: u32,
    writer: tokio::sync::Mutex<Option<JsonWriter>>,
}

impl JsonFileSink {
    pub async fn new<P: Into<PathBuf>>(
        path: P,
        max_size_bytes: u64,
        max_backups: u32,
    ) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        let writer = open_append(&path).await?;
        Ok(Self {
            path,
            max_size_bytes,
            max_backups,
            writer: tokio::sync::Mutex::new(Some(writer)),
        })
    }

    fn backup(&self, idx: u32) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{}", idx));
        PathBuf::from(name)
    }

    async fn rotate(&self, slot: &mut Option<JsonWriter>) -> std::io::Result<()> {
        *slot = None;
        for idx in (1..self.max_backups).rev() {
            let from = self.backup(idx);
            if tokio::fs::metadata(&from).await.is_ok() {
                let _ = tokio::fs::rename(&from, self.backup(idx + 1)).await;
            }
        }
        tokio::fs::rename(&self.path, self.backup(1)).await?;
        *slot = Some(open_append(&self.path).await?);
        Ok(())
    }
}

async fn open_append(path: &Path) -> std::io::Result<JsonWriter> {
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    let written = file.metadata().await.map(|m| m.len()).unwrap_or(0);
    Ok(JsonWriter { file, written })
}

#[async_trait]
impl LogSink for JsonFileSink {
    async fn handle(&self, event: &LogEvent) {
        let Ok(mut line) = serde_json::to_string(event) else {
            return;
        };
        line.push('\n');
        let mut guard = self.writer.lock().await;
        let full = guard
            .as_ref()
            .map(|w| w.written >= self.max_size_bytes)
            .unwrap_or(false);
        if full && self.max_backups > 0 {
            if let Err(e) = self.rotate(&mut guard).await {
                eprintln!("⚠️ rotating {} failed: {}", self.path.display(), e);
            }
        }
        if let Some(w) = guard.as_mut() {
            if w.file.write_all(line.as_bytes()).await.is_ok() {
                w.written += line.len() as u64;
            }
        }
    }

    async fn flush(&self) {
        let guard = self.writer.lock().await;
        if let Some(w) = guard.as_ref() {
            let _ = w.file.sync_all().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::dispatcher::meta;
    use crate::events::model::SystemEvent;

    fn event(action: &str) -> LogEvent {
        LogEvent::System(SystemEvent {
            meta: meta("test", LogLevel::Info),
            action: action.to_string(),
            detail: None,
        })
    }

    #[tokio::test]
    async fn json_sink_rotates_past_the_size_limit() {
        let dir = std::env::temp_dir().join(format!("opflex-sink-{}", uuid::Uuid::new_v4()));
        let path = dir.join("events.jsonl");
        let sink = JsonFileSink::new(&path, 64, 2).await.unwrap();
        for i in 0..6 {
            sink.handle(&event(&format!("tick-{}", i))).await;
        }
        sink.flush().await;

        assert!(tokio::fs::metadata(dir.join("events.jsonl.1")).await.is_ok());
        assert!(tokio::fs::metadata(dir.join("events.jsonl.3")).await.is_err());
        let current = tokio::fs::read_to_string(&path).await.unwrap();
        let last: serde_json::Value =
            serde_json::from_str(current.lines().last().unwrap()).unwrap();
        assert_eq!(last["action"], "tick-5");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn console_filter_respects_level_and_suppression() {
        let sink = ConsoleSink::new(Some(LogLevel::Warn));
        assert!(!sink.accepts(&event("quiet")));
        let mut loud = event("loud");
        if let LogEvent::System(s) = &mut loud {
            s.meta.level = LogLevel::Error;
        }
        assert!(sink.accepts(&loud));
        if let LogEvent::System(s) = &mut loud {
            s.meta.suppress_console = true;
        }
        assert!(!sink.accepts(&loud));
    }
}
