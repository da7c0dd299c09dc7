//! 監査証跡とエクスポート。

use std::io::Write;
use std::path::Path;

use astra_types::{AuditRecord, AuditStage, DecisionExport, Severity};

use super::GateError;
use crate::now_millis;

/// 1回の認可試行の監査イベント列。記録と同時に `tracing` にも出力する。
#[derive(Debug, Clone, Default)]
pub struct AuditTrail {
    events: Vec<AuditRecord>,
}

impl AuditTrail {
    pub fn new() -> Self {
        Self::default()
    }

    /// イベントを追記する。
    pub fn record(&mut self, stage: AuditStage, severity: Severity, message: impl Into<String>) {
        let message = message.into();
        match severity {
            Severity::Info => tracing::info!(?stage, "{message}"),
            Severity::Warning => tracing::warn!(?stage, "{message}"),
            Severity::Error | Severity::Critical => {
                tracing::error!(?stage, ?severity, "{message}")
            }
        }
        self.events.push(AuditRecord {
            timestamp: now_millis(),
            stage,
            message,
            severity,
        });
    }

    pub fn events(&self) -> &[AuditRecord] {
        &self.events
    }

    pub fn into_events(self) -> Vec<AuditRecord> {
        self.events
    }
}

/// 監査イベントをJSON Lines形式（1行1イベント）で書き出す。
pub fn write_json_lines<W: Write>(mut writer: W, events: &[AuditRecord]) -> Result<(), GateError> {
    for event in events {
        serde_json::to_writer(&mut writer, event)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

/// 判定をJSONファイルとして書き出す。
pub fn write_decision_json(path: &Path, export: &DecisionExport) -> Result<(), GateError> {
    let json = serde_json::to_vec_pretty(export)?;
    std::fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_lines_one_event_per_line() {
        let mut trail = AuditTrail::new();
        trail.record(AuditStage::System, Severity::Info, "start");
        trail.record(AuditStage::Integrity, Severity::Critical, "firmware corrupted");

        let mut buf = Vec::new();
        write_json_lines(&mut buf, trail.events()).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let parsed: AuditRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed.stage, AuditStage::Integrity);
        assert_eq!(parsed.severity, Severity::Critical);
        assert_eq!(parsed.message, "firmware corrupted");
        assert!(lines[0].contains("\"stage\":\"SYSTEM\""));
    }

    #[test]
    fn test_timestamps_are_monotonic() {
        let mut trail = AuditTrail::new();
        for i in 0..5 {
            trail.record(AuditStage::System, Severity::Info, format!("event {i}"));
        }
        let events = trail.into_events();
        assert!(events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }
}
