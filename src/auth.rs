use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;
use tracing::debug;

/// Shared-password authentication: every user name logs in with the one
/// configured password.
#[derive(Debug)]
pub struct SlotbookAuthSource {
    password: Vec<u8>,
}

impl SlotbookAuthSource {
    pub fn new(password: String) -> Self {
        Self {
            password: password.into_bytes(),
        }
    }
}

#[async_trait]
impl AuthSource for SlotbookAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        debug!(
            "login attempt by {} from {}",
            login.user().as_deref().unwrap_or("<none>"),
            login.host()
        );
        Ok(Password::new(None, self.password.clone()))
    }
}
