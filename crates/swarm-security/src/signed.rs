//! Tamper-evident audit log.
//!
//! Every entry carries the hash of its predecessor and an HMAC-SHA256
//! signature over its own digest, so deleting, reordering or editing a line
//! breaks [`verify_chain`] at that index.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;
use std::io::Write;
use std::path::{Path, PathBuf};
use swarm_core::canonical::{canonical_json, sha256_hex};
use swarm_core::{AuditEvent, AuditSink, SwarmError, SwarmResult};
use tracing::warn;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// One signed, chained audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedAuditEntry {
    /// Entry id.
    pub id: String,
    /// Append time in epoch milliseconds.
    pub at: i64,
    /// Audit event type.
    pub event_type: String,
    /// Who caused the event.
    pub actor: String,
    /// Event payload.
    pub payload: Value,
    /// Digest of the previous entry; `None` at the head of the chain.
    pub previous_hash: Option<String>,
    /// Id of the key that signed this entry.
    pub key_id: String,
    /// Hex SHA-256 of the canonical signed fields.
    pub digest: String,
    /// Hex HMAC-SHA256 over `digest` and `previous_hash`.
    pub signature: String,
}

impl SignedAuditEntry {
    fn digest_base(&self) -> Value {
        json!({
            "id": self.id,
            "at": self.at,
            "eventType": self.event_type,
            "actor": self.actor,
            "payload": self.payload,
            "previousHash": self.previous_hash,
            "keyId": self.key_id,
        })
    }

    /// Recompute the entry digest from the signed fields.
    pub fn compute_digest(&self) -> String {
        sha256_hex(canonical_json(&self.digest_base()).as_bytes())
    }
}

/// Result of walking a chain of signed entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainVerification {
    /// True when every entry verified.
    pub ok: bool,
    /// Entries examined before stopping.
    pub checked: usize,
    /// Index of the first bad entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<usize>,
    /// Why verification stopped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ChainVerification {
    fn failure(index: usize, reason: &str) -> Self {
        Self {
            ok: false,
            checked: index,
            failed_at: Some(index),
            reason: Some(reason.to_string()),
        }
    }
}

fn sign(secret: &[u8], digest: &str, previous_hash: Option<&str>) -> SwarmResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| SwarmError::Config(format!("invalid audit signing key: {e}")))?;
    mac.update(format!("{digest}|{}", previous_hash.unwrap_or("")).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn signature_matches(secret: &[u8], entry: &SignedAuditEntry) -> bool {
    let Ok(expected) = hex::decode(&entry.signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(format!("{}|{}", entry.digest, entry.previous_hash.as_deref().unwrap_or("")).as_bytes());
    mac.verify_slice(&expected).is_ok()
}

/// Build and sign the entry that follows `previous_hash`.
pub fn sign_event(
    event: &AuditEvent,
    secret: &[u8],
    key_id: &str,
    previous_hash: Option<String>,
) -> SwarmResult<SignedAuditEntry> {
    let mut entry = SignedAuditEntry {
        id: Uuid::new_v4().to_string(),
        at: event.at,
        event_type: event.event_type.clone(),
        actor: event.actor.clone(),
        payload: event.payload.clone(),
        previous_hash,
        key_id: key_id.to_string(),
        digest: String::new(),
        signature: String::new(),
    };
    entry.digest = entry.compute_digest();
    entry.signature = sign(secret, &entry.digest, entry.previous_hash.as_deref())?;
    Ok(entry)
}

/// Verify linkage, digests and signatures of `entries` in order.
pub fn verify_chain(entries: &[SignedAuditEntry], secret: &[u8]) -> ChainVerification {
    let mut previous: Option<&str> = None;
    for (index, entry) in entries.iter().enumerate() {
        if entry.previous_hash.as_deref() != previous {
            return ChainVerification::failure(index, "previous_hash_mismatch");
        }
        if entry.compute_digest() != entry.digest {
            return ChainVerification::failure(index, "digest_mismatch");
        }
        if !signature_matches(secret, entry) {
            return ChainVerification::failure(index, "signature_mismatch");
        }
        previous = Some(entry.digest.as_str());
    }
    ChainVerification {
        ok: true,
        checked: entries.len(),
        failed_at: None,
        reason: None,
    }
}

/// Read a JSONL file of signed entries, skipping blank and malformed lines.
pub fn load_entries(path: &Path) -> SwarmResult<Vec<SignedAuditEntry>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut entries = Vec::new();
    for (line_no, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<SignedAuditEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(line = line_no + 1, error = %e, "Skipping malformed audit line"),
        }
    }
    Ok(entries)
}

struct ChainState {
    entries: Vec<SignedAuditEntry>,
    last_hash: Option<String>,
}

/// HMAC-signed, hash-chained [`AuditSink`], optionally mirrored to a JSONL file.
pub struct SignedAuditLog {
    secret: Vec<u8>,
    key_id: String,
    path: Option<PathBuf>,
    state: Mutex<ChainState>,
}

impl SignedAuditLog {
    /// In-memory chain signed with `secret`.
    pub fn new(secret: impl Into<Vec<u8>>, key_id: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            key_id: key_id.into(),
            path: None,
            state: Mutex::new(ChainState {
                entries: Vec::new(),
                last_hash: None,
            }),
        }
    }

    /// Append entries to `path`, continuing any chain already stored there.
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> SwarmResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let existing = load_entries(&path)?;
        {
            let mut state = self.state.lock();
            state.last_hash = existing.last().map(|e| e.digest.clone());
            state.entries = existing;
        }
        self.path = Some(path);
        Ok(self)
    }

    /// Snapshot of all entries in chain order.
    pub fn entries(&self) -> Vec<SignedAuditEntry> {
        self.state.lock().entries.clone()
    }

    /// Verify the chain held by this log.
    pub fn verify(&self) -> ChainVerification {
        verify_chain(&self.state.lock().entries, &self.secret)
    }

    fn append_sync(&self, event: &AuditEvent) -> SwarmResult<SignedAuditEntry> {
        let mut state = self.state.lock();
        let entry = sign_event(event, &self.secret, &self.key_id, state.last_hash.clone())?;
        if let Some(path) = &self.path {
            let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
            writeln!(file, "{}", serde_json::to_string(&entry)?)?;
        }
        state.last_hash = Some(entry.digest.clone());
        state.entries.push(entry.clone());
        Ok(entry)
    }
}

#[async_trait]
impl AuditSink for SignedAuditLog {
    async fn append(&self, event: AuditEvent) -> SwarmResult<()> {
        self.append_sync(&event).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(n: i64) -> AuditEvent {
        AuditEvent::new("task_created", n, "orchestrator", json!({"taskId": format!("t-{n}")}))
    }

    #[tokio::test]
    async fn test_chain_links_entries() {
        let log = SignedAuditLog::new(b"secret".to_vec(), "k1");
        for n in 0..3 {
            log.append(event(n)).await.unwrap();
        }
        let entries = log.entries();
        assert!(entries[0].previous_hash.is_none());
        assert_eq!(entries[1].previous_hash.as_deref(), Some(entries[0].digest.as_str()));
        assert_eq!(entries[2].previous_hash.as_deref(), Some(entries[1].digest.as_str()));
        assert!(log.verify().ok);
        assert_eq!(log.verify().checked, 3);
    }

    #[tokio::test]
    async fn test_tampered_payload_detected() {
        let log = SignedAuditLog::new(b"secret".to_vec(), "k1");
        for n in 0..3 {
            log.append(event(n)).await.unwrap();
        }
        let mut entries = log.entries();
        entries[1].payload = json!({"taskId": "forged"});
        let result = verify_chain(&entries, b"secret");
        assert!(!result.ok);
        assert_eq!(result.failed_at, Some(1));
        assert_eq!(result.reason.as_deref(), Some("digest_mismatch"));
    }

    #[tokio::test]
    async fn test_wrong_secret_fails_signature() {
        let log = SignedAuditLog::new(b"secret".to_vec(), "k1");
        log.append(event(1)).await.unwrap();
        let result = verify_chain(&log.entries(), b"other");
        assert_eq!(result.reason.as_deref(), Some("signature_mismatch"));
        assert_eq!(result.failed_at, Some(0));
    }

    #[tokio::test]
    async fn test_removed_entry_breaks_linkage() {
        let log = SignedAuditLog::new(b"secret".to_vec(), "k1");
        for n in 0..3 {
            log.append(event(n)).await.unwrap();
        }
        let mut entries = log.entries();
        entries.remove(1);
        let result = verify_chain(&entries, b"secret");
        assert_eq!(result.failed_at, Some(1));
        assert_eq!(result.reason.as_deref(), Some("previous_hash_mismatch"));
    }

    #[tokio::test]
    async fn test_file_chain_resumes_after_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("audit").join("signed.jsonl");

        let log = SignedAuditLog::new(b"secret".to_vec(), "k1").with_file(&path).unwrap();
        log.append(event(1)).await.unwrap();
        drop(log);

        let reopened = SignedAuditLog::new(b"secret".to_vec(), "k1").with_file(&path).unwrap();
        reopened.append(event(2)).await.unwrap();

        let entries = load_entries(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(verify_chain(&entries, b"secret").ok);
    }

    #[test]
    fn test_empty_chain_is_valid() {
        let result = verify_chain(&[], b"secret");
        assert!(result.ok);
        assert_eq!(result.checked, 0);
    }
}
