//! Fetch, push and merge commands over a local buffer.
//!
//! These functions drive the remote components on behalf of one command
//! invocation. A dismissed prompt aborts the command before the buffer or
//! the remote page is touched.

use tracing::{info, warn};

use crate::config::{EditSettings, WdsyncConfig};
use crate::edit::{EditOutcome, EditWorkflow};
use crate::error::{Result, WikidotError};
use crate::frontmatter::{PageData, parse, render};
use crate::host::{KeyValueStore, Prompter, TextBuffer};
use crate::merge::{MergeSelection, merge_all_edits, merge_edits};
use crate::names::unix_name;
use crate::page::{ExistenceCheck, PageMetadata, PageQuery, PageRef, PageResolver};
use crate::revuri::{RevUri, RevisionSelector, provide_rev_document};
use crate::session::{Session, SessionManager, SessionScope};
use crate::state::StateStore;
use crate::transport::{Connector, Transport};

pub const LAST_ACCOUNT_KEY: &str = "wdsync.lastAccount";

#[derive(Debug, Clone, Default)]
pub struct SyncSettings {
    pub default_site: Option<String>,
    pub account_select: bool,
    pub edit: EditSettings,
}

impl SyncSettings {
    pub fn from_config(config: &WdsyncConfig) -> Self {
        Self {
            default_site: config.site(),
            account_select: config.account_select(),
            edit: config.edit_settings(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Missing,
    UpToDate { revision: Option<u64> },
    Overwritten { revision: Option<u64> },
    /// The user asked to review the remote revision before merging.
    Diff { uri: RevUri, remote_text: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed {
        revision: Option<u64>,
        compensated: bool,
    },
    Fetched(FetchOutcome),
}

pub struct Synchronizer<'a, C: Connector> {
    transport: &'a Transport<C>,
    prompter: &'a dyn Prompter,
    state: &'a StateStore,
    settings: SyncSettings,
}

impl<'a, C: Connector> Synchronizer<'a, C> {
    pub fn new(
        transport: &'a Transport<C>,
        prompter: &'a dyn Prompter,
        state: &'a StateStore,
        settings: SyncSettings,
    ) -> Self {
        Self {
            transport,
            prompter,
            state,
            settings,
        }
    }

    fn target(&self, data: &PageData) -> Result<(String, String)> {
        let site = if data.meta.site.trim().is_empty() {
            self.settings.default_site.clone().ok_or_else(|| {
                WikidotError::Document(
                    "front matter has no `site:` and no default site is configured".to_string(),
                )
            })?
        } else {
            data.meta.site.trim().to_string()
        };
        let page = unix_name(&data.meta.page);
        if page.is_empty() {
            return Err(WikidotError::Document(
                "front matter has no `page:`".to_string(),
            ));
        }
        Ok((site, page))
    }

    fn remote_metadata(
        &self,
        site: &str,
        page: &str,
        session: Option<&Session>,
    ) -> Result<PageMetadata> {
        PageResolver::new(self.transport).get_metadata(&PageQuery {
            site,
            page,
            session: token(session),
            existence: ExistenceCheck::NotFoundStatus,
        })
    }

    /// Bring the remote page into `buffer`, asking first when the local copy
    /// is not known to be current.
    pub fn fetch(
        &self,
        buffer: &mut dyn TextBuffer,
        session: Option<&Session>,
    ) -> Result<FetchOutcome> {
        let mut local = parse(&buffer.text()?)?;
        let (site, page) = self.target(&local)?;
        let remote = self.remote_metadata(&site, &page, session)?;

        if remote.exists == Some(false) {
            self.prompter
                .info(&format!("{page} does not exist on {site}."));
            return Ok(FetchOutcome::Missing);
        }
        if let (Some(local_revision), Some(remote_revision)) = (local.meta.revision, remote.revision)
            && local_revision >= remote_revision
        {
            self.prompter
                .info(&format!("{page} is already at the latest version."));
            return Ok(FetchOutcome::UpToDate {
                revision: remote.revision,
            });
        }

        let message = format!(
            "Remote {page} is at revision {}, local copy is at {}.",
            describe_revision(remote.revision),
            describe_revision(local.meta.revision)
        );
        match self
            .prompter
            .choose(&message, &["Open diff editor", "Overwrite content", "Cancel"])
        {
            Some(0) => {
                let selector = remote
                    .revision
                    .map_or(RevisionSelector::Current, RevisionSelector::Number);
                let uri = RevUri::new(&site, &page, selector);
                let remote_text =
                    provide_rev_document(&PageResolver::new(self.transport), &uri, token(session))?;
                Ok(FetchOutcome::Diff { uri, remote_text })
            }
            Some(1) => {
                let source = PageResolver::new(self.transport).get_source(
                    &site,
                    &PageRef::Name(page.clone()),
                    token(session),
                )?;
                let revision = remote.revision;
                local.refresh_meta(remote);
                local.source = source;
                buffer.replace_all(&render(&local)?)?;
                self.state
                    .record_revision(&site, &page, revision, &local.source)?;
                info!(site = %site, page = %page, ?revision, "fetched");
                Ok(FetchOutcome::Overwritten { revision })
            }
            _ => Err(WikidotError::Cancelled("fetch".to_string())),
        }
    }

    /// Save `buffer` to its page and rewrite its front matter from the
    /// refreshed remote metadata.
    pub fn push(&self, buffer: &mut dyn TextBuffer, session: &Session) -> Result<PushOutcome> {
        let mut local = parse(&buffer.text()?)?;
        let (site, page) = self.target(&local)?;
        let remote = self.remote_metadata(&site, &page, Some(session))?;

        let conflict = remote.exists == Some(true)
            && match (local.meta.revision, remote.revision) {
                (Some(local_revision), Some(remote_revision)) => remote_revision > local_revision,
                (None, _) => true,
                (Some(_), None) => false,
            };
        if conflict {
            let message = format!(
                "Remote {page} has changed (revision {}, local {}).",
                describe_revision(remote.revision),
                describe_revision(local.meta.revision)
            );
            match self.prompter.choose(
                &message,
                &["Fetch remote page", "Overwrite remote page", "Cancel"],
            ) {
                Some(0) => return Ok(PushOutcome::Fetched(self.fetch(buffer, Some(session))?)),
                Some(1) => warn!(site = %site, page = %page, "overwriting newer remote revision"),
                _ => return Err(WikidotError::Cancelled("push".to_string())),
            }
        }

        let workflow = EditWorkflow::new(self.transport, self.settings.edit.clone());
        let outcome = workflow.edit(&site, &page, Some(&session.token), &local.edit_payload())?;
        workflow.settle();

        let refreshed = self.remote_metadata(&site, &page, Some(session))?;
        let revision = refreshed.revision;
        local.refresh_meta(refreshed);
        buffer.replace_all(&render(&local)?)?;
        self.state
            .record_revision(&site, &page, revision, &local.source)?;
        info!(site = %site, page = %page, ?revision, "pushed");
        Ok(PushOutcome::Pushed {
            revision,
            compensated: outcome == EditOutcome::SavedWithCompensation,
        })
    }

    pub fn provide_document(&self, uri: &RevUri, session: Option<&Session>) -> Result<String> {
        provide_rev_document(&PageResolver::new(self.transport), uri, token(session))
    }

    /// Apply the chosen remote lines to `buffer`. Returns the number of edits.
    pub fn merge_selected(
        &self,
        buffer: &mut dyn TextBuffer,
        remote_text: &str,
        selections: &[MergeSelection],
    ) -> Result<usize> {
        let edits = merge_edits(&buffer.text()?, remote_text, selections)?;
        if edits.is_empty() {
            self.prompter.info("The selection contains no changes.");
            return Ok(0);
        }
        buffer.apply_edits(&edits)?;
        self.record_buffer(buffer)?;
        Ok(edits.len())
    }

    pub fn merge_all(&self, buffer: &mut dyn TextBuffer, remote_text: &str) -> Result<usize> {
        let edits = merge_all_edits(&buffer.text()?, remote_text);
        if edits.is_empty() {
            self.prompter.info("The buffer already matches the remote text.");
            return Ok(0);
        }
        buffer.apply_edits(&edits)?;
        self.record_buffer(buffer)?;
        Ok(edits.len())
    }

    fn record_buffer(&self, buffer: &dyn TextBuffer) -> Result<()> {
        let data = parse(&buffer.text()?)?;
        if let Ok((site, page)) = self.target(&data) {
            self.state
                .record_revision(&site, &page, data.meta.revision, &data.source)?;
        }
        Ok(())
    }
}

fn token(session: Option<&Session>) -> Option<&str> {
    session.map(|session| session.token.as_str())
}

fn describe_revision(revision: Option<u64>) -> String {
    revision.map_or_else(|| "unknown".to_string(), |revision| revision.to_string())
}

/// Choose the session a command runs under.
///
/// With `required`, an empty session set starts a login. Several sessions
/// (or `always_ask`) prompt for a choice; the last choice is remembered.
pub fn select_session(
    manager: &mut SessionManager<'_>,
    preferences: &dyn KeyValueStore,
    prompter: &dyn Prompter,
    required: bool,
    always_ask: bool,
) -> Result<Option<Session>> {
    let sessions = manager.get_sessions(&SessionScope::All)?;
    if sessions.is_empty() {
        return if required {
            manager.create_session(None).map(Some)
        } else {
            Ok(None)
        };
    }
    if !always_ask {
        if sessions.len() == 1 {
            return Ok(sessions.into_iter().next());
        }
        if let Some(last) = preferences.get_value(LAST_ACCOUNT_KEY)?
            && let Some(session) = sessions.iter().find(|session| session.id == last)
        {
            return Ok(Some(session.clone()));
        }
    }

    let labels: Vec<&str> = sessions.iter().map(|session| session.label.as_str()).collect();
    let index = prompter
        .choose("Select an account", &labels)
        .ok_or_else(|| WikidotError::Cancelled("account selection".to_string()))?;
    let session = sessions
        .get(index)
        .cloned()
        .ok_or_else(|| WikidotError::Cancelled("account selection".to_string()))?;
    preferences.set_value(LAST_ACCOUNT_KEY, Some(&session.id))?;
    Ok(Some(session))
}

/// Make another (possibly new) account the remembered default.
pub fn switch_account(
    manager: &mut SessionManager<'_>,
    preferences: &dyn KeyValueStore,
    prompter: &dyn Prompter,
) -> Result<Session> {
    let sessions = manager.get_sessions(&SessionScope::All)?;
    let mut options: Vec<&str> = sessions.iter().map(|session| session.label.as_str()).collect();
    options.push("Log in with another account");
    let index = prompter
        .choose("Switch to account", &options)
        .ok_or_else(|| WikidotError::Cancelled("account switch".to_string()))?;
    let session = match sessions.get(index) {
        Some(session) => session.clone(),
        None => manager.create_session(None)?,
    };
    preferences.set_value(LAST_ACCOUNT_KEY, Some(&session.id))?;
    Ok(session)
}

/// Remove an account by id or label, or by choice when none is given.
pub fn logout(
    manager: &mut SessionManager<'_>,
    preferences: &dyn KeyValueStore,
    prompter: &dyn Prompter,
    account: Option<&str>,
) -> Result<Option<Session>> {
    let id = match account {
        Some(account) => match manager.find(account) {
            Some(session) => session.id.clone(),
            None => {
                prompter.warn(&format!("No stored account matches `{account}`."));
                return Ok(None);
            }
        },
        None => {
            let sessions: Vec<Session> = manager.sessions().into_iter().cloned().collect();
            if sessions.is_empty() {
                prompter.info("No accounts are logged in.");
                return Ok(None);
            }
            let labels: Vec<&str> = sessions.iter().map(|session| session.label.as_str()).collect();
            let index = prompter
                .choose("Log out of account", &labels)
                .ok_or_else(|| WikidotError::Cancelled("logout".to_string()))?;
            match sessions.get(index) {
                Some(session) => session.id.clone(),
                None => return Err(WikidotError::Cancelled("logout".to_string())),
            }
        }
    };
    if preferences.get_value(LAST_ACCOUNT_KEY)?.as_deref() == Some(id.as_str()) {
        preferences.set_value(LAST_ACCOUNT_KEY, None)?;
    }
    manager.remove_session(&id)
}
