use crate::passport::{AuthGrant, TokenSource};
use crate::transport::ConnectError;
use std::time::{Duration, Instant};

/// Credential artifacts of the single logical session the supervisor drives.
#[derive(Debug, Default)]
pub struct Session {
    auth_token: Option<String>,
    token_acquired_at: Option<Instant>,
    token_source: Option<TokenSource>,
    connection_id: Option<String>,
}

/// What the supervisor should do after a rejected socket connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectRecovery {
    Retry,
    /// Ask the server to drop the stale connection id, then retry.
    DeleteStale(String),
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_token(&mut self, grant: AuthGrant) {
        self.auth_token = Some(grant.token);
        self.token_source = Some(grant.source);
        self.token_acquired_at = Some(Instant::now());
    }

    pub fn clear_token(&mut self) {
        self.auth_token = None;
        self.token_source = None;
        self.token_acquired_at = None;
    }

    pub fn token(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }

    pub fn token_source(&self) -> Option<TokenSource> {
        self.token_source
    }

    pub fn is_token_valid(&self, now: Instant, validity: Duration) -> bool {
        match (&self.auth_token, self.token_acquired_at) {
            (Some(_), Some(acquired)) => now.saturating_duration_since(acquired) < validity,
            _ => false,
        }
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    pub fn set_connection_id(&mut self, connection_id: String) {
        self.connection_id = Some(connection_id);
    }

    pub fn clear_connection_id(&mut self) -> Option<String> {
        self.connection_id.take()
    }

    pub fn apply_connect_failure(&mut self, err: &ConnectError) -> ConnectRecovery {
        match err {
            ConnectError::NotFound => {
                self.clear_connection_id();
                self.clear_token();
                ConnectRecovery::Retry
            }
            ConnectError::Unauthorized => {
                self.clear_token();
                ConnectRecovery::Retry
            }
            ConnectError::Conflict => match self.clear_connection_id() {
                Some(stale) => ConnectRecovery::DeleteStale(stale),
                None => ConnectRecovery::Retry,
            },
            ConnectError::Rejected(_) | ConnectError::Other(_) => ConnectRecovery::Retry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWELVE_HOURS: Duration = Duration::from_secs(12 * 3600);

    fn session_with_everything() -> Session {
        let mut session = Session::new();
        session.set_token(AuthGrant {
            token: "atoken".to_string(),
            source: TokenSource::Header,
        });
        session.set_connection_id("conn-1".to_string());
        session
    }

    #[test]
    fn token_expires_after_validity_window() {
        let session = session_with_everything();
        let now = Instant::now();
        assert!(session.is_token_valid(now, TWELVE_HOURS));
        assert!(!session.is_token_valid(now + TWELVE_HOURS + Duration::from_secs(1), TWELVE_HOURS));
        assert!(!Session::new().is_token_valid(now, TWELVE_HOURS));
    }

    #[test]
    fn not_found_clears_connection_and_token() {
        let mut session = session_with_everything();
        assert_eq!(
            session.apply_connect_failure(&ConnectError::NotFound),
            ConnectRecovery::Retry
        );
        assert!(session.connection_id().is_none());
        assert!(session.token().is_none());
    }

    #[test]
    fn unauthorized_clears_token_only() {
        let mut session = session_with_everything();
        session.apply_connect_failure(&ConnectError::Unauthorized);
        assert_eq!(session.connection_id(), Some("conn-1"));
        assert!(session.token().is_none());
    }

    #[test]
    fn conflict_hands_back_stale_id_for_deletion() {
        let mut session = session_with_everything();
        assert_eq!(
            session.apply_connect_failure(&ConnectError::Conflict),
            ConnectRecovery::DeleteStale("conn-1".to_string())
        );
        assert!(session.connection_id().is_none());
        assert_eq!(session.token(), Some("atoken"));
    }

    #[test]
    fn other_failures_keep_session() {
        let mut session = session_with_everything();
        session.apply_connect_failure(&ConnectError::Other("reset".into()));
        session.apply_connect_failure(&ConnectError::Rejected(502));
        assert_eq!(session.connection_id(), Some("conn-1"));
        assert_eq!(session.token_source(), Some(TokenSource::Header));
    }
}
