use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use tracing::{debug, info};

use crate::config::AuthSettings;
use crate::error::{AuthFailure, Result, WikidotError};
use crate::names::{site_authority, unix_name_plain};
use crate::scrape::{HtmlScraper, MarkupScraper, UserProfile};
use crate::transport::{Connector, FormRequest, TOKEN_FIELD, Transport, anti_forgery_token};

pub const SESSION_COOKIE: &str = "WIKIDOT_SESSION_ID";
pub const CREDENTIAL_MISMATCH: &str = "The login and password do not match.";
const LOGIN_ACTION: &str = "Login2Action";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginGrant {
    /// Cookie string sent with authenticated requests.
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginAttempt {
    Granted(LoginGrant),
    Mismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCheck {
    Valid,
    Unauthorized,
}

/// Account-level remote operations used by the session manager.
pub trait AccountBackend {
    fn login(&self, username: &str, password: &str) -> Result<LoginAttempt>;
    fn user_profile(&self, username: &str) -> Result<UserProfile>;
    /// Cheap authenticated call telling whether `token` is still accepted.
    fn check_session(&self, token: &str) -> Result<SessionCheck>;
}

pub fn session_token(session_id: &str) -> String {
    format!("{SESSION_COOKIE}={session_id}; wikidot_udsession=1")
}

/// Find the session cookie among `Set-Cookie` headers.
pub fn parse_session_cookie(
    set_cookies: &[String],
    now: DateTime<Utc>,
) -> Option<(String, Option<DateTime<Utc>>)> {
    for header in set_cookies {
        let mut parts = header.split(';').map(str::trim);
        let Some((name, value)) = parts.next().and_then(|pair| pair.split_once('=')) else {
            continue;
        };
        if name != SESSION_COOKIE || value.is_empty() {
            continue;
        }
        let mut expires_at = None;
        for attribute in parts {
            let Some((key, attr_value)) = attribute.split_once('=') else {
                continue;
            };
            if key.eq_ignore_ascii_case("max-age") {
                if let Ok(seconds) = attr_value.trim().parse::<i64>() {
                    expires_at = Some(now + ChronoDuration::seconds(seconds));
                    break;
                }
            } else if key.eq_ignore_ascii_case("expires") {
                expires_at = parse_cookie_date(attr_value.trim()).or(expires_at);
            }
        }
        return Some((value.to_string(), expires_at));
    }
    None
}

pub fn parse_cookie_date(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc2822(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%a, %d-%b-%Y %H:%M:%S GMT")
        .ok()
        .map(|naive| naive.and_utc())
}

pub struct WikidotAccounts<'t, C: Connector> {
    transport: &'t Transport<C>,
    settings: AuthSettings,
    scraper: HtmlScraper,
}

impl<'t, C: Connector> WikidotAccounts<'t, C> {
    pub fn new(transport: &'t Transport<C>, settings: AuthSettings) -> Self {
        Self {
            transport,
            settings,
            scraper: HtmlScraper,
        }
    }
}

impl<C: Connector> AccountBackend for WikidotAccounts<'_, C> {
    fn login(&self, username: &str, password: &str) -> Result<LoginAttempt> {
        let token = anti_forgery_token();
        let request = FormRequest {
            url: self.settings.login_url.clone(),
            cookie: format!("{TOKEN_FIELD}={token}"),
            form: vec![
                ("login".to_string(), username.to_string()),
                ("password".to_string(), password.to_string()),
                ("action".to_string(), LOGIN_ACTION.to_string()),
                ("event".to_string(), "login".to_string()),
                (TOKEN_FIELD.to_string(), token),
                ("callbackIndex".to_string(), "0".to_string()),
            ],
        };
        debug!(url = %request.url, "login request");
        let reply = self.transport.connector().post_form(&request)?;
        if !reply.is_success() {
            return Err(WikidotError::Transport {
                url: request.url,
                status: Some(reply.status),
                message: format!("HTTP {}", reply.status),
            });
        }
        if reply.body.contains(CREDENTIAL_MISMATCH) {
            return Ok(LoginAttempt::Mismatch);
        }
        let (session_id, expires_at) = parse_session_cookie(&reply.set_cookies, Utc::now())
            .ok_or(WikidotError::Auth(AuthFailure::MissingSessionCookie))?;
        info!(username, "logged in");
        Ok(LoginAttempt::Granted(LoginGrant {
            token: session_token(&session_id),
            expires_at,
        }))
    }

    fn user_profile(&self, username: &str) -> Result<UserProfile> {
        let url = format!(
            "{}{}",
            self.settings.profile_url,
            unix_name_plain(username)
        );
        let reply = self.transport.get_page(&url, None)?;
        let profile = self.scraper.user_profile(&reply.body);
        if reply.status == 404 || (profile.id.is_none() && profile.name.is_none()) {
            return Err(WikidotError::NotFound {
                site: site_authority(&self.settings.profile_url),
                page: format!("user:info/{}", unix_name_plain(username)),
            });
        }
        Ok(profile)
    }

    fn check_session(&self, token: &str) -> Result<SessionCheck> {
        match self.transport.send_module(
            &self.settings.check_site,
            Some(token),
            &self.settings.check_module,
            &[],
        ) {
            Ok(_) => Ok(SessionCheck::Valid),
            Err(WikidotError::Protocol(failure))
                if self
                    .settings
                    .unauthorized_statuses
                    .iter()
                    .any(|status| *status == failure.status) =>
            {
                debug!(status = %failure.status, "session check rejected");
                Ok(SessionCheck::Unauthorized)
            }
            Err(WikidotError::Protocol(failure)) => {
                debug!(status = %failure.status, "session check returned a non-auth failure");
                Ok(SessionCheck::Valid)
            }
            Err(error) => Err(error),
        }
    }
}
