//! Conversation-scoped state between turns.
//!
//! The pipeline treats the store as an external collaborator: it loads a
//! record at the start of a turn, and either saves the updated record or
//! discards it before answering.

use crate::application::use_cases::clarification_session::ClarificationSession;
use crate::domain::error::Result;
use crate::domain::resolved_query::{ConfirmationCard, ResolvedQuery};
use crate::infrastructure::config::SessionConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// A dynamic query waiting for the user's "run it?" answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingConfirmation {
    pub question: String,
    pub card: ConfirmationCard,
    pub query: ResolvedQuery,
    pub notes: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionRecord {
    Clarification(ClarificationSession),
    Confirmation(PendingConfirmation),
}

#[async_trait]
pub trait SessionStore {
    async fn load(&self, id: Uuid) -> Result<Option<SessionRecord>>;
    async fn save(&self, id: Uuid, record: SessionRecord) -> Result<()>;
    async fn discard(&self, id: Uuid) -> Result<()>;
}

struct StoredRecord {
    record: SessionRecord,
    saved_at: DateTime<Utc>,
}

/// Process-local store. Records untouched for longer than `ttl` are dropped,
/// so sessions the user walks away from do not pile up.
pub struct InMemorySessionStore {
    records: RwLock<HashMap<Uuid, StoredRecord>>,
    ttl: Duration,
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::with_ttl(Duration::from_secs(SessionConfig::default().ttl_secs))
    }
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    fn is_expired(&self, stored: &StoredRecord, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(stored.saved_at)
            .to_std()
            .map_or(false, |age| age >= self.ttl)
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, id: Uuid) -> Result<Option<SessionRecord>> {
        let mut records = self.records.write().await;
        let expired = match records.get(&id) {
            Some(stored) => self.is_expired(stored, Utc::now()),
            None => return Ok(None),
        };
        if expired {
            records.remove(&id);
            info!("Session {} expired", id);
            return Ok(None);
        }
        Ok(records.get(&id).map(|stored| stored.record.clone()))
    }

    async fn save(&self, id: Uuid, record: SessionRecord) -> Result<()> {
        let now = Utc::now();
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, stored| !self.is_expired(stored, now));
        if records.len() < before {
            debug!("Evicted {} expired sessions", before - records.len());
        }
        debug!("Saving session {}", id);
        records.insert(
            id,
            StoredRecord {
                record,
                saved_at: now,
            },
        );
        Ok(())
    }

    async fn discard(&self, id: Uuid) -> Result<()> {
        if self.records.write().await.remove(&id).is_some() {
            debug!("Discarded session {}", id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::resolved_query::QuerySource;

    fn confirmation() -> SessionRecord {
        SessionRecord::Confirmation(PendingConfirmation {
            question: "q".into(),
            card: ConfirmationCard {
                prompt: "Run this query?".into(),
                sql: "SELECT 1".into(),
                confidence: 0.4,
                tables_used: vec![],
                reasoning: String::new(),
            },
            query: ResolvedQuery {
                sql: "SELECT 1".into(),
                source: QuerySource::Dynamic,
                confidence: 0.4,
                tables: vec![],
                template_id: None,
            },
            notes: vec![],
            created_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_save_load_discard() {
        let store = InMemorySessionStore::new();
        let id = Uuid::new_v4();
        assert!(store.load(id).await.unwrap().is_none());

        store.save(id, confirmation()).await.unwrap();
        assert!(matches!(
            store.load(id).await.unwrap(),
            Some(SessionRecord::Confirmation(_))
        ));

        store.discard(id).await.unwrap();
        assert!(store.load(id).await.unwrap().is_none());
        assert_eq!(store.len().await, 0);
    }

    #[test]
    fn test_record_is_tagged_json() {
        let raw = serde_json::to_value(confirmation()).unwrap();
        assert_eq!(raw["kind"], "confirmation");
    }

    #[tokio::test]
    async fn test_expired_records_are_dropped() {
        let store = InMemorySessionStore::with_ttl(Duration::ZERO);
        let stale = Uuid::new_v4();
        store.save(stale, confirmation()).await.unwrap();
        assert!(store.load(stale).await.unwrap().is_none());
        assert_eq!(store.len().await, 0);

        store.save(Uuid::new_v4(), confirmation()).await.unwrap();
        store.save(Uuid::new_v4(), confirmation()).await.unwrap();
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_fresh_records_survive() {
        let store = InMemorySessionStore::with_ttl(Duration::from_secs(600));
        let id = Uuid::new_v4();
        store.save(id, confirmation()).await.unwrap();
        store.save(Uuid::new_v4(), confirmation()).await.unwrap();
        assert!(store.load(id).await.unwrap().is_some());
        assert_eq!(store.len().await, 2);
    }
}
