use std::sync::Arc;

use chrono::Utc;
use concierge_contracts::{ProactiveEvent, ToolRun};
use concierge_kernel::autonomy::snapshot_digest;
use concierge_kernel::sha256_hex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

pub struct AuditJsonl {
    file: Arc<Mutex<tokio::fs::File>>,
    last_hash: Arc<Mutex<Option<String>>>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuditRecord {
    pub audit_id: String,
    pub kind: String,
    pub subject: String,
    pub result: String,
    pub reason_code: String,
    pub ts: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub detail: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,
    pub record_hash: String,
}

impl AuditRecord {
    pub fn new(kind: &str, subject: &str, result: &str, reason_code: &str) -> Self {
        Self {
            audit_id: format!("audit_{}", uuid::Uuid::new_v4().as_simple()),
            kind: kind.to_string(),
            subject: subject.to_string(),
            result: result.to_string(),
            reason_code: reason_code.to_string(),
            ts: Utc::now().to_rfc3339(),
            snapshot_digest: None,
            detail: Value::Null,
            prev_hash: None,
            record_hash: String::new(),
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }

    pub fn tool_run(run: &ToolRun) -> Result<Self, String> {
        let result = serde_json::to_value(run.status).map_err(|e| e.to_string())?;
        let source = serde_json::to_value(run.decision_source).map_err(|e| e.to_string())?;
        let mut rec = Self::new(
            "tool_run",
            &run.tool_name,
            result.as_str().unwrap_or("unknown"),
            source.as_str().unwrap_or("unknown"),
        )
        .with_detail(json!({
            "input": run.input,
            "output": run.output,
            "requested_by": run.requested_by,
            "risk_level": run.risk_level,
        }));
        rec.snapshot_digest = Some(snapshot_digest(&run.autonomy_snapshot)?);
        Ok(rec)
    }

    pub fn proactive(event: &ProactiveEvent) -> Self {
        Self::new(
            "proactive_decision",
            &event.dedupe_key,
            event.decision.as_str(),
            &event.reason,
        )
        .with_detail(json!({
            "trigger_type": event.trigger_type,
            "entity_id": event.entity_id,
            "score": event.score,
        }))
    }
}

impl AuditJsonl {
    pub async fn new(path: &str) -> Result<Self, String> {
        let last_hash = std::fs::read_to_string(path).ok().and_then(|text| {
            text.lines().rev().find_map(|line| {
                serde_json::from_str::<Value>(line).ok().and_then(|v| {
                    v.get("record_hash")
                        .and_then(|hash| hash.as_str())
                        .map(|s| s.to_string())
                })
            })
        });

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| e.to_string())?;

        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            last_hash: Arc::new(Mutex::new(last_hash)),
        })
    }

    /// Appends and flushes one chained record. The chain head only moves after the write lands.
    pub async fn append(&self, mut rec: AuditRecord) -> Result<(), String> {
        let mut file = self.file.lock().await;
        let mut last_hash = self.last_hash.lock().await;
        rec.prev_hash = last_hash.clone();
        rec.record_hash.clear();
        let seed = serde_json::to_string(&rec).map_err(|e| e.to_string())?;
        rec.record_hash = sha256_hex(seed.as_bytes());

        let line = serde_json::to_string(&rec).map_err(|e| e.to_string())?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| e.to_string())?;
        file.write_all(b"\n").await.map_err(|e| e.to_string())?;
        file.flush().await.map_err(|e| e.to_string())?;
        *last_hash = Some(rec.record_hash);
        Ok(())
    }
}

pub fn verify_audit_chain(path: &str) -> Result<String, String> {
    let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let mut prev: Option<String> = None;
    let mut count = 0usize;

    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let rec: AuditRecord = serde_json::from_str(line)
            .map_err(|e| format!("line {} parse failed: {e}", idx + 1))?;
        if count > 0 && rec.prev_hash != prev {
            return Err(format!(
                "line {} prev_hash mismatch: expected {:?}, got {:?}",
                idx + 1,
                prev,
                rec.prev_hash
            ));
        }
        let mut seeded = rec.clone();
        seeded.record_hash.clear();
        let seed = serde_json::to_string(&seeded)
            .map_err(|e| format!("line {} hash seed serialize failed: {e}", idx + 1))?;
        let expected_hash = sha256_hex(seed.as_bytes());
        if rec.record_hash != expected_hash {
            return Err(format!(
                "line {} record_hash mismatch: expected {}, got {}",
                idx + 1,
                expected_hash,
                rec.record_hash
            ));
        }
        prev = Some(rec.record_hash);
        count += 1;
    }

    Ok(format!("audit chain verified: {count} records"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_path() -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time")
            .as_nanos();
        std::env::temp_dir()
            .join(format!("concierge-audit-{nanos}.jsonl"))
            .to_string_lossy()
            .to_string()
    }

    #[tokio::test]
    async fn chain_verifies_and_survives_reopen() {
        let path = temp_path();
        let audit = AuditJsonl::new(&path).await.unwrap();
        audit
            .append(AuditRecord::new("proactive_decision", "task:1:due_today", "digested", "quiet_hours"))
            .await
            .unwrap();
        drop(audit);

        let reopened = AuditJsonl::new(&path).await.unwrap();
        reopened
            .append(AuditRecord::new("tool_run", "message.send", "success", "user"))
            .await
            .unwrap();
        assert_eq!(verify_audit_chain(&path).unwrap(), "audit chain verified: 2 records");
    }

    #[tokio::test]
    async fn tampering_is_detected() {
        let path = temp_path();
        let audit = AuditJsonl::new(&path).await.unwrap();
        audit
            .append(AuditRecord::new("tool_run", "calendar.create_event", "success", "user"))
            .await
            .unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, text.replace("calendar.create_event", "message.send")).unwrap();
        let err = verify_audit_chain(&path).unwrap_err();
        assert!(err.contains("record_hash mismatch"));
    }
}
