//! Credentials held by the client.
//!
//! Two scopes exist: a remembered login persisted as JSON on disk, and one
//! that lives only for this process. They never hold data at the same time.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

use super::api::{ApiError, DashboardApi};
use super::types::{AppEvent, SignOutReason};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub token: String,
    pub username: String,
    pub role: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageScope {
    Persistent,
    Session,
}

impl StorageScope {
    pub fn from_remember(remember: bool) -> Self {
        if remember {
            StorageScope::Persistent
        } else {
            StorageScope::Session
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            StorageScope::Persistent => "remembered",
            StorageScope::Session => "this session",
        }
    }
}

pub struct SessionStore {
    persistent_path: PathBuf,
    session: Mutex<Option<Session>>,
}

impl SessionStore {
    pub fn new(persistent_path: impl Into<PathBuf>) -> Self {
        Self {
            persistent_path: persistent_path.into(),
            session: Mutex::new(None),
        }
    }

    /// `$HOME/.samdash/session.json`, or the working directory without a home.
    pub fn default_path() -> PathBuf {
        std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".samdash")
            .join("session.json")
    }

    pub fn persistent_path(&self) -> &Path {
        &self.persistent_path
    }

    /// Persistent scope first, then the in-memory one.
    pub fn current(&self) -> Option<(Session, StorageScope)> {
        if let Some(session) = self.read_persistent() {
            return Some((session, StorageScope::Persistent));
        }
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .map(|session| (session, StorageScope::Session))
    }

    pub fn token(&self) -> Option<String> {
        self.current()
            .map(|(session, _)| session.token)
            .filter(|token| !token.is_empty())
    }

    pub fn set_session(&self, session: Session, scope: StorageScope) -> io::Result<()> {
        match scope {
            StorageScope::Persistent => {
                self.write_persistent(&session)?;
                *self.session.lock().unwrap_or_else(PoisonError::into_inner) = None;
            }
            StorageScope::Session => {
                self.remove_persistent()?;
                *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(session);
            }
        }
        Ok(())
    }

    /// Drops both scopes. The in-memory scope is cleared even if the file
    /// cannot be removed.
    pub fn clear(&self) -> io::Result<()> {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.remove_persistent()
    }

    fn read_persistent(&self) -> Option<Session> {
        let content = match fs::read_to_string(&self.persistent_path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(
                    path = %self.persistent_path.display(),
                    error = %err,
                    "cannot read session file"
                );
                return None;
            }
        };
        match serde_json::from_str::<Session>(&content) {
            Ok(session) => Some(session),
            Err(err) => {
                warn!(
                    path = %self.persistent_path.display(),
                    error = %err,
                    "ignoring malformed session file"
                );
                None
            }
        }
    }

    fn write_persistent(&self, session: &Session) -> io::Result<()> {
        if let Some(parent) = self.persistent_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.persistent_path.with_extension("json.tmp");
        let payload = serde_json::to_vec_pretty(session).map_err(io::Error::other)?;
        {
            let mut file = private_file(&tmp)?;
            file.write_all(&payload)?;
            file.flush()?;
        }
        fs::rename(&tmp, &self.persistent_path)
    }

    fn remove_persistent(&self) -> io::Result<()> {
        match fs::remove_file(&self.persistent_path) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }
}

#[cfg(unix)]
fn private_file(path: &Path) -> io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn private_file(path: &Path) -> io::Result<fs::File> {
    fs::File::create(path)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginOutcome {
    Dashboard,
    PasswordChangeRequired,
}

#[derive(Debug, thiserror::Error)]
pub enum LoginError {
    #[error("please enter a username and password")]
    MissingCredentials,
    #[error("account is locked, please try again later")]
    Locked,
    #[error("{0}")]
    InvalidCredentials(String),
    #[error("login failed: {0}")]
    Api(ApiError),
    #[error("could not store session: {0}")]
    Storage(#[from] io::Error),
}

const INVALID_CREDENTIALS: &str = "login failed, please check your username and password";

pub async fn login(
    api: &dyn DashboardApi,
    store: &SessionStore,
    username: &str,
    password: &str,
    remember: bool,
) -> Result<LoginOutcome, LoginError> {
    let username = username.trim();
    if username.is_empty() || password.is_empty() {
        return Err(LoginError::MissingCredentials);
    }

    let response = match api.login(username, password).await {
        Ok(response) => response,
        Err(ApiError::Unauthorized { locked: true, .. }) => return Err(LoginError::Locked),
        Err(ApiError::Unauthorized { message, .. }) => {
            return Err(LoginError::InvalidCredentials(message));
        }
        Err(err) => return Err(LoginError::Api(err)),
    };
    if response.locked {
        return Err(LoginError::Locked);
    }
    let token = match response.token.filter(|token| !token.is_empty()) {
        Some(token) if response.success => token,
        _ => {
            return Err(LoginError::InvalidCredentials(
                response
                    .message
                    .unwrap_or_else(|| INVALID_CREDENTIALS.to_string()),
            ));
        }
    };

    let scope = StorageScope::from_remember(remember);
    store.set_session(
        Session {
            token,
            username: response.username.unwrap_or_else(|| username.to_string()),
            role: response.role.unwrap_or_default(),
        },
        scope,
    )?;
    info!(user = username, scope = scope.label(), "signed in");

    Ok(if response.password_expired {
        LoginOutcome::PasswordChangeRequired
    } else {
        LoginOutcome::Dashboard
    })
}

pub fn logout(store: &SessionStore, events: Option<&UnboundedSender<AppEvent>>) {
    if let Err(err) = store.clear() {
        warn!(error = %err, "failed to remove persisted session");
    }
    info!("signed out");
    if let Some(events) = events {
        let _ = events.send(AppEvent::SignedOut(SignOutReason::UserRequested));
    }
}

/// Local checks before a password change reaches the server.
pub fn validate_password_change(
    old_password: &str,
    new_password: &str,
    confirmation: &str,
) -> Result<(), ApiError> {
    if old_password.is_empty() || new_password.is_empty() {
        return Err(ApiError::Validation(
            "please enter the current and the new password".to_string(),
        ));
    }
    if new_password != confirmation {
        return Err(ApiError::Validation(
            "new password and confirmation do not match".to_string(),
        ));
    }
    if new_password == old_password {
        return Err(ApiError::Validation(
            "new password must differ from the current one".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
pub mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::app::api::LoginResponse;
    use crate::app::api::testing::FakeApi;

    pub fn scratch_store(name: &str) -> SessionStore {
        let dir = std::env::temp_dir().join(format!("samdash-{}-{name}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        SessionStore::new(dir.join("session.json"))
    }

    fn sample() -> Session {
        Session {
            token: "abc".to_string(),
            username: "ada".to_string(),
            role: "admin".to_string(),
        }
    }

    fn api_with_login(response: Result<LoginResponse, ApiError>) -> FakeApi {
        let api = FakeApi::default();
        api.login.lock().expect("lock").push_back(response);
        api
    }

    #[test]
    fn scopes_are_mutually_exclusive() {
        let store = scratch_store("exclusive");
        store
            .set_session(sample(), StorageScope::Persistent)
            .expect("persist");
        assert!(store.persistent_path().exists());
        assert_eq!(store.current().map(|(_, scope)| scope), Some(StorageScope::Persistent));

        store
            .set_session(sample(), StorageScope::Session)
            .expect("session");
        assert!(!store.persistent_path().exists());
        assert_eq!(store.current().map(|(_, scope)| scope), Some(StorageScope::Session));
        assert_eq!(store.token().as_deref(), Some("abc"));
    }

    #[test]
    fn persistent_scope_wins_when_both_hold_a_token() {
        let store = scratch_store("precedence");
        store
            .set_session(sample(), StorageScope::Session)
            .expect("session");
        fs::create_dir_all(store.persistent_path().parent().expect("parent")).expect("dir");
        fs::write(
            store.persistent_path(),
            r#"{"token":"disk","username":"ada","role":"user"}"#,
        )
        .expect("write");
        assert_eq!(store.token().as_deref(), Some("disk"));
    }

    #[test]
    fn clear_wipes_both_scopes() {
        let store = scratch_store("clear");
        store
            .set_session(sample(), StorageScope::Persistent)
            .expect("persist");
        store.clear().expect("clear");
        assert!(store.current().is_none());
        store.clear().expect("clearing twice is fine");
    }

    #[test]
    fn malformed_session_file_is_ignored() {
        let store = scratch_store("malformed");
        fs::create_dir_all(store.persistent_path().parent().expect("parent")).expect("dir");
        fs::write(store.persistent_path(), "not json").expect("write");
        assert!(store.token().is_none());
    }

    #[tokio::test]
    async fn login_stores_into_the_selected_scope() {
        let api = api_with_login(Ok(LoginResponse {
            success: true,
            token: Some("t1".to_string()),
            username: Some("ada".to_string()),
            role: Some("admin".to_string()),
            ..LoginResponse::default()
        }));
        let store = scratch_store("login-remember");
        let outcome = login(&api, &store, "ada", "pw", true).await.expect("login");
        assert_eq!(outcome, LoginOutcome::Dashboard);
        let (session, scope) = store.current().expect("session");
        assert_eq!(scope, StorageScope::Persistent);
        assert_eq!(session.role, "admin");
    }

    #[tokio::test]
    async fn expired_password_routes_to_change_flow() {
        let api = api_with_login(Ok(LoginResponse {
            success: true,
            token: Some("t1".to_string()),
            password_expired: true,
            ..LoginResponse::default()
        }));
        let store = scratch_store("login-expired");
        let outcome = login(&api, &store, "ada", "pw", false).await.expect("login");
        assert_eq!(outcome, LoginOutcome::PasswordChangeRequired);
        assert_eq!(store.current().map(|(_, scope)| scope), Some(StorageScope::Session));
    }

    #[tokio::test]
    async fn lockout_is_reported_apart_from_bad_credentials() {
        let store = scratch_store("login-locked");
        let locked = api_with_login(Err(ApiError::Unauthorized {
            message: "bad password".to_string(),
            locked: true,
        }));
        let err = login(&locked, &store, "ada", "pw", false).await.expect_err("locked");
        assert!(matches!(err, LoginError::Locked));

        let wrong = api_with_login(Err(ApiError::Unauthorized {
            message: "bad password".to_string(),
            locked: false,
        }));
        let err = login(&wrong, &store, "ada", "pw", false).await.expect_err("invalid");
        assert_eq!(err.to_string(), "bad password");
        assert!(store.current().is_none());
    }

    #[tokio::test]
    async fn blank_credentials_never_reach_the_server() {
        let api = FakeApi::default();
        let store = scratch_store("login-blank");
        let err = login(&api, &store, "  ", "pw", false).await.expect_err("blank");
        assert!(matches!(err, LoginError::MissingCredentials));
        assert!(api.login.lock().expect("lock").is_empty());
    }

    #[test]
    fn logout_clears_and_navigates_to_login() {
        let store = scratch_store("logout");
        store
            .set_session(sample(), StorageScope::Persistent)
            .expect("persist");
        let (tx, mut rx) = mpsc::unbounded_channel();
        logout(&store, Some(&tx));
        assert!(store.current().is_none());
        assert!(matches!(
            rx.try_recv(),
            Ok(AppEvent::SignedOut(SignOutReason::UserRequested))
        ));
    }

    #[test]
    fn password_change_is_checked_locally() {
        assert!(validate_password_change("", "new", "new").is_err());
        assert!(validate_password_change("old", "new", "other").is_err());
        assert!(validate_password_change("same", "same", "same").is_err());
        assert!(validate_password_change("old", "new", "new").is_ok());
    }
}
