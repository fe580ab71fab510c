//! Logged-in accounts and their lifecycle.
//!
//! [`SessionManager`] is the only owner of the session map. Every mutation
//! writes the complete set back to the secret store as one JSON blob.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::accounts::{AccountBackend, LoginAttempt, LoginGrant, SessionCheck};
use crate::error::{AuthFailure, Result, WikidotError};
use crate::host::{InputRequest, Prompter, SecretStore};
use crate::names::unix_name_plain;

pub const SESSION_STORE_KEY: &str = "wikidot.auth";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Stable account id (the numeric user id when known).
    pub id: String,
    pub label: String,
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionScope {
    #[default]
    All,
    Account(String),
}

impl SessionScope {
    fn includes(&self, session: &Session) -> bool {
        match self {
            Self::All => true,
            Self::Account(id) => session.id == *id || session.label == *id,
        }
    }
}

/// Steps of the interactive login.
enum LoginState {
    AwaitingUsername { prefill: Option<String> },
    AwaitingPassword { username: String },
    Authenticating { username: String, password: String },
    RetryableFailure { username: String },
    Success(Session),
    Cancelled,
}

pub struct SessionManager<'h> {
    sessions: BTreeMap<String, Session>,
    backend: &'h dyn AccountBackend,
    prompter: &'h dyn Prompter,
    store: &'h dyn SecretStore,
    clock: Box<dyn Fn() -> DateTime<Utc> + 'h>,
}

impl<'h> SessionManager<'h> {
    pub fn new(
        backend: &'h dyn AccountBackend,
        prompter: &'h dyn Prompter,
        store: &'h dyn SecretStore,
    ) -> Self {
        Self {
            sessions: BTreeMap::new(),
            backend,
            prompter,
            store,
            clock: Box::new(Utc::now),
        }
    }

    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + 'h) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Load the persisted set without validating it.
    pub fn load(&mut self) -> Result<()> {
        self.sessions.clear();
        let Some(blob) = self.store.get_secret(SESSION_STORE_KEY)? else {
            return Ok(());
        };
        let restored: Vec<Session> = serde_json::from_str(&blob).map_err(|error| {
            WikidotError::Storage(format!("stored sessions are unreadable: {error}"))
        })?;
        for session in restored {
            self.sessions.insert(session.id.clone(), session);
        }
        Ok(())
    }

    /// Load the persisted set and validate every restored session.
    pub fn restore(&mut self) -> Result<Vec<Session>> {
        self.load()?;
        info!(count = self.sessions.len(), "restored sessions");
        self.get_sessions(&SessionScope::All)
    }

    /// Held sessions, unvalidated.
    pub fn sessions(&self) -> Vec<&Session> {
        self.sessions.values().collect()
    }

    pub fn find(&self, account: &str) -> Option<&Session> {
        self.sessions
            .values()
            .find(|session| SessionScope::Account(account.to_string()).includes(session))
    }

    /// Live sessions in `scope`. Invalid ones are offered for
    /// re-authentication and removed when the user declines.
    pub fn get_sessions(&mut self, scope: &SessionScope) -> Result<Vec<Session>> {
        let candidates: Vec<Session> = self
            .sessions
            .values()
            .filter(|session| scope.includes(session))
            .cloned()
            .collect();

        let mut live = Vec::new();
        for session in candidates {
            if self.is_valid(&session)? {
                live.push(session);
                continue;
            }
            warn!(account = %session.label, "session is no longer valid");
            let message = format!(
                "The session for {} has expired. Log in again?",
                session.label
            );
            let renewed = match self.prompter.choose(&message, &["Log in again", "Remove account"]) {
                Some(0) => match self.create_session(Some(&session.label)) {
                    Ok(renewed) => Some(renewed),
                    Err(error) if error.is_cancellation() => None,
                    Err(error) => return Err(error),
                },
                _ => None,
            };
            match renewed {
                Some(renewed) => {
                    if renewed.id != session.id {
                        self.remove_session(&session.id)?;
                    }
                    live.push(renewed);
                }
                None => {
                    self.remove_session(&session.id)?;
                }
            }
        }
        Ok(live)
    }

    /// Expired sessions are invalid without a network call; others are
    /// checked remotely. A check that cannot reach the site keeps the session.
    pub fn is_valid(&self, session: &Session) -> Result<bool> {
        if session.is_expired((self.clock)()) {
            return Ok(false);
        }
        match self.backend.check_session(&session.token) {
            Ok(SessionCheck::Valid) => Ok(true),
            Ok(SessionCheck::Unauthorized) => Ok(false),
            Err(WikidotError::Transport { url, message, .. }) => {
                warn!(%url, %message, account = %session.label, "session check failed, keeping session");
                Ok(true)
            }
            Err(error) => Err(error),
        }
    }

    /// Run the interactive login and store the resulting session.
    pub fn create_session(&mut self, label: Option<&str>) -> Result<Session> {
        let mut state = LoginState::AwaitingUsername {
            prefill: label.map(ToString::to_string),
        };
        let session = loop {
            state = match state {
                LoginState::AwaitingUsername { prefill } => {
                    match self.prompter.input(&InputRequest {
                        title: "Wikidot login",
                        prompt: "Username or email",
                        placeholder: Some("username"),
                        value: prefill.as_deref(),
                        secret: false,
                    }) {
                        Some(username) if !username.trim().is_empty() => {
                            LoginState::AwaitingPassword {
                                username: username.trim().to_string(),
                            }
                        }
                        _ => LoginState::Cancelled,
                    }
                }
                LoginState::AwaitingPassword { username } => {
                    match self.prompter.input(&InputRequest {
                        title: "Wikidot login",
                        prompt: "Password",
                        placeholder: None,
                        value: None,
                        secret: true,
                    }) {
                        Some(password) if !password.is_empty() => {
                            LoginState::Authenticating { username, password }
                        }
                        _ => LoginState::Cancelled,
                    }
                }
                LoginState::Authenticating { username, password } => {
                    match self.backend.login(&username, &password)? {
                        LoginAttempt::Granted(grant) => {
                            LoginState::Success(self.session_for(&username, grant)?)
                        }
                        LoginAttempt::Mismatch => LoginState::RetryableFailure { username },
                    }
                }
                LoginState::RetryableFailure { username } => {
                    self.prompter
                        .warn("The login and password do not match. Try again.");
                    LoginState::AwaitingUsername {
                        prefill: Some(username),
                    }
                }
                LoginState::Success(session) => break session,
                LoginState::Cancelled => return Err(WikidotError::Auth(AuthFailure::Cancelled)),
            };
        };

        self.sessions.insert(session.id.clone(), session.clone());
        self.persist()?;
        info!(account = %session.label, "session stored");
        Ok(session)
    }

    fn session_for(&self, username: &str, grant: LoginGrant) -> Result<Session> {
        let profile = self.backend.user_profile(username)?;
        Ok(Session {
            id: profile
                .id
                .map(|id| id.to_string())
                .unwrap_or_else(|| unix_name_plain(username)),
            label: profile.name.unwrap_or_else(|| username.to_string()),
            token: grant.token,
            expires_at: grant.expires_at,
        })
    }

    pub fn remove_session(&mut self, id: &str) -> Result<Option<Session>> {
        let removed = self.sessions.remove(id);
        if removed.is_some() {
            self.persist()?;
        }
        Ok(removed)
    }

    fn persist(&self) -> Result<()> {
        let all: Vec<&Session> = self.sessions.values().collect();
        let blob = serde_json::to_string(&all)
            .map_err(|error| WikidotError::Storage(format!("failed to encode sessions: {error}")))?;
        self.store.set_secret(SESSION_STORE_KEY, &blob)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;

    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::scrape::UserProfile;
    use crate::testing::{MemoryStore, ScriptedPrompter};

    /// Scripted account backend.
    #[derive(Default)]
    pub(crate) struct MockBackend {
        pub logins: RefCell<VecDeque<LoginAttempt>>,
        pub checks: RefCell<VecDeque<Result<SessionCheck>>>,
        pub check_calls: Cell<usize>,
        pub user_id: Option<u64>,
    }

    impl MockBackend {
        pub(crate) fn with_user(id: u64) -> Self {
            Self {
                user_id: Some(id),
                ..Self::default()
            }
        }

        pub(crate) fn grant(&self, token: &str) {
            self.logins
                .borrow_mut()
                .push_back(LoginAttempt::Granted(LoginGrant {
                    token: token.to_string(),
                    expires_at: None,
                }));
        }
    }

    impl AccountBackend for MockBackend {
        fn login(&self, _username: &str, _password: &str) -> Result<LoginAttempt> {
            Ok(self
                .logins
                .borrow_mut()
                .pop_front()
                .unwrap_or(LoginAttempt::Mismatch))
        }

        fn user_profile(&self, username: &str) -> Result<UserProfile> {
            Ok(UserProfile {
                name: Some(username.to_string()),
                id: self.user_id,
            })
        }

        fn check_session(&self, _token: &str) -> Result<SessionCheck> {
            self.check_calls.set(self.check_calls.get() + 1);
            self.checks
                .borrow_mut()
                .pop_front()
                .unwrap_or(Ok(SessionCheck::Valid))
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0)
            .single()
            .expect("valid date")
    }

    fn stored(store: &MemoryStore, sessions: &[Session]) {
        store
            .set_secret(
                SESSION_STORE_KEY,
                &serde_json::to_string(sessions).expect("encode"),
            )
            .expect("store");
    }

    fn session(id: &str, expires_at: DateTime<Utc>) -> Session {
        Session {
            id: id.to_string(),
            label: format!("user-{id}"),
            token: format!("WIKIDOT_SESSION_ID={id}; wikidot_udsession=1"),
            expires_at: Some(expires_at),
        }
    }

    #[test]
    fn future_expiry_never_prompts() {
        let backend = MockBackend::default();
        let prompter = ScriptedPrompter::default();
        let store = MemoryStore::default();
        stored(&store, &[session("1", now() + Duration::days(3))]);

        let mut manager = SessionManager::new(&backend, &prompter, &store).with_clock(now);
        let live = manager.restore().expect("restore");
        assert_eq!(live.len(), 1);
        assert!(prompter.choice_prompts().is_empty());
        assert_eq!(backend.check_calls.get(), 1);
    }

    #[test]
    fn past_expiry_prompts_once_and_decline_removes() {
        let backend = MockBackend::default();
        let prompter = ScriptedPrompter::default();
        let store = MemoryStore::default();
        stored(
            &store,
            &[
                session("1", now() - Duration::minutes(1)),
                session("2", now() + Duration::days(1)),
            ],
        );
        prompter.push_choice(Some(1));

        let mut manager = SessionManager::new(&backend, &prompter, &store).with_clock(now);
        manager.load().expect("load");
        let live = manager.get_sessions(&SessionScope::All).expect("sessions");

        assert_eq!(prompter.choice_prompts().len(), 1);
        assert_eq!(live.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(), vec!["2"]);
        assert_eq!(manager.sessions().len(), 1);
        // expired session is rejected without a check
        assert_eq!(backend.check_calls.get(), 1);
        let persisted: Vec<Session> =
            serde_json::from_str(&store.raw(SESSION_STORE_KEY).expect("blob")).expect("decode");
        assert_eq!(persisted.len(), 1);
    }

    #[test]
    fn dismissing_the_prompt_counts_as_decline() {
        let backend = MockBackend::default();
        let prompter = ScriptedPrompter::default();
        let store = MemoryStore::default();
        stored(&store, &[session("1", now() - Duration::minutes(1))]);

        let mut manager = SessionManager::new(&backend, &prompter, &store).with_clock(now);
        let live = manager.restore().expect("restore");
        assert!(live.is_empty());
        assert!(manager.sessions().is_empty());
    }

    #[test]
    fn unauthorized_check_triggers_relogin_under_same_label() {
        let backend = MockBackend::with_user(1);
        backend
            .checks
            .borrow_mut()
            .push_back(Ok(SessionCheck::Unauthorized));
        backend.grant("WIKIDOT_SESSION_ID=fresh; wikidot_udsession=1");
        let prompter = ScriptedPrompter::default();
        prompter.push_choice(Some(0));
        prompter.push_input(Some("user-1"));
        prompter.push_input(Some("password"));
        let store = MemoryStore::default();
        stored(&store, &[session("1", now() + Duration::days(1))]);

        let mut manager = SessionManager::new(&backend, &prompter, &store).with_clock(now);
        let live = manager.restore().expect("restore");
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, "1");
        assert!(live[0].token.contains("fresh"));
        assert_eq!(manager.sessions().len(), 1);
    }

    #[test]
    fn unreachable_check_keeps_session() {
        let backend = MockBackend::default();
        backend
            .checks
            .borrow_mut()
            .push_back(Err(WikidotError::Transport {
                url: "https://www.wikidot.com".to_string(),
                status: None,
                message: "offline".to_string(),
            }));
        let prompter = ScriptedPrompter::default();
        let store = MemoryStore::default();
        stored(&store, &[session("1", now() + Duration::days(1))]);

        let mut manager = SessionManager::new(&backend, &prompter, &store).with_clock(now);
        assert_eq!(manager.restore().expect("restore").len(), 1);
        assert!(prompter.choice_prompts().is_empty());
    }

    #[test]
    fn login_retries_on_mismatch_until_granted() {
        let backend = MockBackend::with_user(77);
        backend.logins.borrow_mut().push_back(LoginAttempt::Mismatch);
        backend.grant("WIKIDOT_SESSION_ID=ok; wikidot_udsession=1");
        let prompter = ScriptedPrompter::default();
        for value in ["alice", "wrong", "alice", "right"] {
            prompter.push_input(Some(value));
        }
        let store = MemoryStore::default();

        let mut manager = SessionManager::new(&backend, &prompter, &store).with_clock(now);
        let created = manager.create_session(None).expect("login");
        assert_eq!(created.id, "77");
        assert_eq!(created.label, "alice");
        assert_eq!(prompter.input_prompts().len(), 4);
        assert_eq!(store.writes(), 1);
        assert!(
            prompter
                .messages()
                .iter()
                .any(|message| message.contains("do not match"))
        );
    }

    #[test]
    fn cancelled_login_is_auth_error_and_stores_nothing() {
        let backend = MockBackend::default();
        let prompter = ScriptedPrompter::default();
        prompter.push_input(Some("alice"));
        prompter.push_input(None);
        let store = MemoryStore::default();

        let mut manager = SessionManager::new(&backend, &prompter, &store).with_clock(now);
        let error = manager.create_session(None).expect_err("cancelled");
        assert!(matches!(error, WikidotError::Auth(AuthFailure::Cancelled)));
        assert_eq!(store.writes(), 0);
    }

    #[test]
    fn remove_persists_whole_set() {
        let backend = MockBackend::default();
        let prompter = ScriptedPrompter::default();
        let store = MemoryStore::default();
        stored(
            &store,
            &[
                session("1", now() + Duration::days(1)),
                session("2", now() + Duration::days(1)),
            ],
        );

        let mut manager = SessionManager::new(&backend, &prompter, &store).with_clock(now);
        manager.load().expect("load");
        let writes_before = store.writes();
        let removed = manager.remove_session("1").expect("remove");
        assert_eq!(removed.map(|s| s.id), Some("1".to_string()));
        assert_eq!(store.writes(), writes_before + 1);
        assert!(manager.remove_session("missing").expect("remove").is_none());
        assert_eq!(store.writes(), writes_before + 1);
        assert!(manager.find("user-2").is_some());
    }

    #[test]
    fn scope_limits_validation() {
        let backend = MockBackend::default();
        let prompter = ScriptedPrompter::default();
        let store = MemoryStore::default();
        stored(
            &store,
            &[
                session("1", now() - Duration::days(1)),
                session("2", now() + Duration::days(1)),
            ],
        );

        let mut manager = SessionManager::new(&backend, &prompter, &store).with_clock(now);
        manager.load().expect("load");
        let live = manager
            .get_sessions(&SessionScope::Account("2".to_string()))
            .expect("sessions");
        assert_eq!(live.len(), 1);
        assert!(prompter.choice_prompts().is_empty());
        assert_eq!(manager.sessions().len(), 2);
    }
}
