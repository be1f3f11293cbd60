use std::sync::Arc;

use chrono::Utc;
use refsync_core::IdempotencyRecord;
use refsync_storage::{IdempotencyStore, StoreResult};
use sha2::{Digest, Sha256};
use tracing::debug;

/// Lowercase hex SHA-256 of the raw request body.
pub fn payload_fingerprint(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IdempotencyCheck {
    pub exists: bool,
    /// Only meaningful when `exists`.
    pub same_payload: bool,
    pub prior_response: Option<String>,
}

pub struct IdempotencyService {
    store: Arc<dyn IdempotencyStore>,
}

impl IdempotencyService {
    pub fn new(store: Arc<dyn IdempotencyStore>) -> Self {
        Self { store }
    }

    pub async fn check(&self, key: &str, payload: &[u8]) -> StoreResult<IdempotencyCheck> {
        let Some(record) = self.store.find_idempotency_record(key).await? else {
            return Ok(IdempotencyCheck::default());
        };
        let same_payload = record.payload_fingerprint == payload_fingerprint(payload);
        debug!(key, same_payload, "idempotency key already recorded");
        Ok(IdempotencyCheck {
            exists: true,
            same_payload,
            prior_response: record.response_body,
        })
    }

    /// Records the first successful outcome for `key`. A concurrent writer
    /// that got there first surfaces as [`refsync_storage::StoreError::DuplicateKey`].
    pub async fn save(
        &self,
        key: &str,
        payload: &[u8],
        response_body: Option<String>,
    ) -> StoreResult<()> {
        let record = IdempotencyRecord {
            external_key: key.to_string(),
            payload_fingerprint: payload_fingerprint(payload),
            created_at: Utc::now(),
            response_body,
        };
        self.store.insert_idempotency_record(&record).await
    }

    pub async fn status(&self, key: &str) -> StoreResult<Option<IdempotencyRecord>> {
        self.store.find_idempotency_record(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use refsync_storage::{MemoryStore, StoreError};

    fn service() -> IdempotencyService {
        IdempotencyService::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn fingerprint_is_stable_lowercase_hex() {
        assert_eq!(
            payload_fingerprint(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn check_distinguishes_missing_same_and_drifted_payloads() {
        let svc = service();
        let payload = br#"[{"externalId":1}]"#;

        let first = svc.check("k1", payload).await.expect("check");
        assert!(!first.exists);

        svc.save("k1", payload, Some("{}".into())).await.expect("save");

        let same = svc.check("k1", payload).await.expect("check");
        assert!(same.exists && same.same_payload);
        assert_eq!(same.prior_response.as_deref(), Some("{}"));

        let other = svc.check("k1", br#"[{"externalId":2}]"#).await.expect("check");
        assert!(other.exists && !other.same_payload);
    }

    #[tokio::test]
    async fn second_save_for_key_is_a_duplicate() {
        let svc = service();
        svc.save("k1", b"a", None).await.expect("save");
        let err = svc.save("k1", b"a", None).await.expect_err("duplicate");
        assert!(matches!(err, StoreError::DuplicateKey(_)));

        let record = svc.status("k1").await.expect("status").expect("record");
        assert_eq!(record.payload_fingerprint, payload_fingerprint(b"a"));
        assert_eq!(record.response_body, None);
    }
}
