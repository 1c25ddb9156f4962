//! Continuation tokens handed to clients after each successful turn.
//!
//! Only a SHA-256 digest of a token is stored, base64url-encoded. A token maps to the session
//! and the runtime handle it was issued for, until it expires.

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use folio_core::ids::{ContinuationHandle, ContinuationToken, SessionId};
use folio_store::{ContinuationRepo, ContinuationRow, Database};

use crate::error::EngineError;

const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Clone, Debug)]
pub struct ContinuationConfig {
    pub ttl: Duration,
}

impl Default for ContinuationConfig {
    fn default() -> Self {
        Self { ttl: DEFAULT_TTL }
    }
}

/// What a token resolves to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedContinuation {
    pub session_id: SessionId,
    pub handle: ContinuationHandle,
    /// Document revision when the token was issued.
    pub revision: u64,
}

#[derive(Clone)]
pub struct ContinuationResolver {
    repo: ContinuationRepo,
    config: ContinuationConfig,
}

impl ContinuationResolver {
    pub fn new(db: Database, config: ContinuationConfig) -> Self {
        Self {
            repo: ContinuationRepo::new(db),
            config,
        }
    }

    /// Mint a fresh token for a session's current handle.
    #[instrument(skip(self, handle), fields(session_id = %session_id))]
    pub fn issue(
        &self,
        session_id: &SessionId,
        handle: &ContinuationHandle,
        revision: u64,
    ) -> Result<ContinuationToken, EngineError> {
        let token = ContinuationToken::new();
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.config.ttl)
            .map_err(|e| EngineError::Internal(format!("continuation ttl out of range: {e}")))?;
        self.repo.insert(&ContinuationRow {
            token_hash: hash_token(&token),
            session_id: session_id.clone(),
            handle: handle.clone(),
            revision,
            created_at: now,
            expires_at: now + ttl,
        })?;

        let purged = self.repo.purge_expired(now)?;
        if purged > 0 {
            debug!(purged, "expired continuation tokens removed");
        }
        Ok(token)
    }

    /// Look up a token. Unknown, expired, or issued for a different session
    /// than `expected_session` all resolve to `UnknownContinuation`.
    pub fn resolve(
        &self,
        token: &ContinuationToken,
        expected_session: Option<&SessionId>,
    ) -> Result<ResolvedContinuation, EngineError> {
        let row = self
            .repo
            .get(&hash_token(token))?
            .ok_or(EngineError::UnknownContinuation)?;

        if row.expires_at <= Utc::now() {
            debug!(session_id = %row.session_id, "continuation token expired");
            return Err(EngineError::UnknownContinuation);
        }
        if let Some(expected) = expected_session {
            if *expected != row.session_id {
                debug!(
                    expected = %expected,
                    actual = %row.session_id,
                    "continuation token belongs to another session"
                );
                return Err(EngineError::UnknownContinuation);
            }
        }
        Ok(ResolvedContinuation {
            session_id: row.session_id,
            handle: row.handle,
            revision: row.revision,
        })
    }
}

fn hash_token(token: &ContinuationToken) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(token.as_str().as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_store::SessionRecord;
    use folio_store::SessionRepo;

    fn resolver_with(ttl: Duration) -> (ContinuationResolver, SessionId) {
        let db = Database::in_memory().unwrap();
        let session_id = SessionId::new();
        SessionRepo::new(db.clone())
            .save(&SessionRecord::new(session_id.clone()))
            .unwrap();
        (ContinuationResolver::new(db, ContinuationConfig { ttl }), session_id)
    }

    #[test]
    fn issued_token_resolves() {
        let (resolver, sid) = resolver_with(DEFAULT_TTL);
        let handle = ContinuationHandle::new("conv-7");
        let token = resolver.issue(&sid, &handle, 3).unwrap();

        let resolved = resolver.resolve(&token, None).unwrap();
        assert_eq!(resolved.session_id, sid);
        assert_eq!(resolved.handle, handle);
        assert_eq!(resolved.revision, 3);
        assert!(resolver.resolve(&token, Some(&sid)).is_ok());
    }

    #[test]
    fn unknown_and_foreign_tokens_rejected() {
        let (resolver, sid) = resolver_with(DEFAULT_TTL);
        let token = resolver
            .issue(&sid, &ContinuationHandle::new("conv-1"), 0)
            .unwrap();

        assert!(matches!(
            resolver.resolve(&ContinuationToken::new(), None),
            Err(EngineError::UnknownContinuation)
        ));
        assert!(matches!(
            resolver.resolve(&token, Some(&SessionId::new())),
            Err(EngineError::UnknownContinuation)
        ));
    }

    #[test]
    fn expired_token_rejected() {
        let (resolver, sid) = resolver_with(Duration::ZERO);
        let token = resolver
            .issue(&sid, &ContinuationHandle::new("conv-1"), 0)
            .unwrap();
        assert!(matches!(
            resolver.resolve(&token, None),
            Err(EngineError::UnknownContinuation)
        ));
    }

    #[test]
    fn only_digest_is_stored() {
        let token = ContinuationToken::from_raw("cont_abc");
        let hash = hash_token(&token);
        assert_eq!(hash.len(), 43);
        assert!(!hash.contains('='));
        assert!(!hash.contains("abc"));
        assert_ne!(hash, hash_token(&ContinuationToken::from_raw("cont_abd")));
        assert_eq!(hash, hash_token(&ContinuationToken::from_raw("cont_abc")));
    }
}
