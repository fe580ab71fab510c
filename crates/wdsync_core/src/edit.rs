//! Lock-then-save page edits.
//!
//! Every save is preceded by a forced edit lock whose id, secret and base
//! revision are echoed back in the save action. Saving a page with tags
//! occasionally fails with a generic envelope status while the page is being
//! created; that one failure is compensated by saving without tags, letting
//! the site settle, and saving again with the tags.

use std::cell::RefCell;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::EditSettings;
use crate::error::{Result, WikidotError};
use crate::names::unix_name;
use crate::transport::{Connector, Transport};

pub const PAGE_EDIT_MODULE: &str = "edit/PageEditModule";
pub const PAGE_ACTION: &str = "WikiPageAction";
pub const SAVE_EVENT: &str = "savePage";

/// Fields written by a save.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EditPayload {
    pub title: Option<String>,
    pub parent: Option<String>,
    pub tags: Vec<String>,
    pub source: String,
    pub comments: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditLock {
    pub lock_id: String,
    pub lock_secret: String,
    /// Absent when the page does not exist yet.
    pub revision_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditState {
    Idle,
    Locking,
    Locked(EditLock),
    Saving(EditLock),
    Done,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOutcome {
    Saved,
    /// Saved in two steps after the tag defect was hit.
    SavedWithCompensation,
}

pub struct EditWorkflow<'t, C: Connector> {
    transport: &'t Transport<C>,
    settings: EditSettings,
    sleeper: Box<dyn Fn(Duration) + 't>,
    state: RefCell<EditState>,
}

impl<'t, C: Connector> EditWorkflow<'t, C> {
    pub fn new(transport: &'t Transport<C>, settings: EditSettings) -> Self {
        Self {
            transport,
            settings,
            sleeper: Box::new(std::thread::sleep),
            state: RefCell::new(EditState::Idle),
        }
    }

    pub fn with_sleeper(mut self, sleeper: impl Fn(Duration) + 't) -> Self {
        self.sleeper = Box::new(sleeper);
        self
    }

    pub fn state(&self) -> EditState {
        self.state.borrow().clone()
    }

    pub fn settings(&self) -> &EditSettings {
        &self.settings
    }

    fn enter(&self, next: EditState) {
        debug!(state = state_name(&next), "edit");
        *self.state.borrow_mut() = next;
    }

    /// Wait for the remote side to settle between dependent saves.
    pub fn settle(&self) {
        if !self.settings.settle_delay.is_zero() {
            debug!(delay_ms = self.settings.settle_delay.as_millis() as u64, "settling");
        }
        (self.sleeper)(self.settings.settle_delay);
    }

    /// Lock and save `payload`, compensating once for the tag defect.
    pub fn edit(
        &self,
        site: &str,
        page: &str,
        session: Option<&str>,
        payload: &EditPayload,
    ) -> Result<EditOutcome> {
        let page = unix_name(page);
        match self.lock_and_save(site, &page, session, payload) {
            Ok(()) => Ok(EditOutcome::Saved),
            Err(error) if self.is_tag_defect(&error, payload) => {
                warn!(site, page = %page, %error, "save with tags failed, saving tags separately");
                let untagged = EditPayload {
                    tags: Vec::new(),
                    ..payload.clone()
                };
                self.settle();
                self.lock_and_save(site, &page, session, &untagged)?;
                self.settle();
                self.lock_and_save(site, &page, session, payload)?;
                info!(site, page = %page, "tags saved after compensation");
                Ok(EditOutcome::SavedWithCompensation)
            }
            Err(error) => Err(error),
        }
    }

    /// Whether `error` is the known failure of saving tags during creation.
    pub fn is_tag_defect(&self, error: &WikidotError, payload: &EditPayload) -> bool {
        if payload.tags.is_empty() {
            return false;
        }
        let Some(failure) = error.protocol() else {
            return false;
        };
        if failure.status != self.settings.tag_defect_status {
            return false;
        }
        match &self.settings.tag_defect_message {
            Some(marker) => failure
                .message
                .as_deref()
                .is_some_and(|message| message.contains(marker.as_str())),
            None => true,
        }
    }

    fn lock_and_save(
        &self,
        site: &str,
        page: &str,
        session: Option<&str>,
        payload: &EditPayload,
    ) -> Result<()> {
        self.enter(EditState::Idle);
        let result = self
            .lock(site, page, session)
            .and_then(|lock| self.save(site, page, session, &lock, payload));
        match &result {
            Ok(()) => self.enter(EditState::Done),
            Err(error) => self.enter(EditState::Failed(error.to_string())),
        }
        result
    }

    pub fn lock(&self, site: &str, page: &str, session: Option<&str>) -> Result<EditLock> {
        self.enter(EditState::Locking);
        let lock_error = |status: String, message: Option<String>| WikidotError::Lock {
            site: site.to_string(),
            page: page.to_string(),
            status,
            message,
        };
        let response = self
            .transport
            .send_module(
                site,
                session,
                PAGE_EDIT_MODULE,
                &[
                    ("mode", "page".to_string()),
                    ("wiki_page", page.to_string()),
                    ("force_lock", "true".to_string()),
                ],
            )
            .map_err(|error| match error {
                WikidotError::Protocol(failure) => lock_error(failure.status, failure.message),
                other => other,
            })?;

        let (Some(lock_id), Some(lock_secret)) = (
            response.field_string("lock_id"),
            response.field_string("lock_secret"),
        ) else {
            return Err(lock_error(
                "ok".to_string(),
                Some("lock response carried no lock".to_string()),
            ));
        };
        let lock = EditLock {
            lock_id,
            lock_secret,
            revision_id: response.field_string("page_revision_id"),
        };
        self.enter(EditState::Locked(lock.clone()));
        Ok(lock)
    }

    pub fn save(
        &self,
        site: &str,
        page: &str,
        session: Option<&str>,
        lock: &EditLock,
        payload: &EditPayload,
    ) -> Result<()> {
        self.enter(EditState::Saving(lock.clone()));
        let mut params = vec![
            ("event", SAVE_EVENT.to_string()),
            ("wiki_page", page.to_string()),
            ("lock_id", lock.lock_id.clone()),
            ("lock_secret", lock.lock_secret.clone()),
        ];
        if let Some(revision_id) = &lock.revision_id {
            params.push(("revision_id", revision_id.clone()));
        }
        params.extend([
            ("title", payload.title.clone().unwrap_or_default()),
            ("parentPage", payload.parent.clone().unwrap_or_default()),
            ("tags", payload.tags.join(" ")),
            ("source", payload.source.clone()),
            ("comments", payload.comments.clone().unwrap_or_default()),
        ]);
        self.transport
            .send_action(site, session, PAGE_ACTION, &params)?;
        Ok(())
    }
}

/// State label without the lock secret.
fn state_name(state: &EditState) -> &'static str {
    match state {
        EditState::Idle => "idle",
        EditState::Locking => "locking",
        EditState::Locked(_) => "locked",
        EditState::Saving(_) => "saving",
        EditState::Done => "done",
        EditState::Failed(_) => "failed",
    }
}
