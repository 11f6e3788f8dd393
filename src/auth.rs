use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{PgWireError, PgWireResult};

use crate::observability::AUTH_FAILURES_TOTAL;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("unknown user {0:?}")]
    Unauthenticated(String),
}

/// Who may log in, and with what password.
#[derive(Debug, Default)]
pub struct CredentialStore {
    passwords: HashMap<String, Vec<u8>>,
}

impl CredentialStore {
    pub fn new(users: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            passwords: users.into_iter().map(|(u, p)| (u, p.into_bytes())).collect(),
        }
    }

    pub fn password_for(&self, user: &str) -> Result<&[u8], AuthError> {
        self.passwords
            .get(user)
            .map(Vec::as_slice)
            .ok_or_else(|| AuthError::Unauthenticated(user.to_string()))
    }

    pub fn len(&self) -> usize {
        self.passwords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passwords.is_empty()
    }
}

/// Feeds the cleartext-password startup handler. pgwire compares the
/// password the client sent against what this returns.
#[derive(Debug)]
pub struct ReservdAuthSource {
    credentials: Arc<CredentialStore>,
}

impl ReservdAuthSource {
    pub fn new(credentials: Arc<CredentialStore>) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl AuthSource for ReservdAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().unwrap_or_default();
        match self.credentials.password_for(user) {
            Ok(password) => Ok(Password::new(None, password.to_vec())),
            Err(e) => {
                metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
                tracing::warn!(user, "login refused: {e}");
                Err(PgWireError::InvalidPassword(user.to_string()))
            }
        }
    }
}
