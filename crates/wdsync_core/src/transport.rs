use std::time::Duration;

use rand::Rng;
use rand::distributions::Alphanumeric;
use reqwest::blocking::Client;
use reqwest::header::{COOKIE, REFERER, SET_COOKIE, USER_AGENT};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::WdsyncConfig;
use crate::error::{ProtocolFailure, Result, WikidotError};
use crate::names::{https_variant, site_base_url, url_join};

pub const AJAX_ENDPOINT: &str = "ajax-module-connector.php";
pub const TOKEN_FIELD: &str = "wikidot_token7";
pub const INSECURE_ACCESS_MARKER: &str = "Nonsecure access is not enabled";
const TOKEN_LENGTH: usize = 10;

/// A form-encoded POST to send through a [`Connector`].
#[derive(Debug, Clone)]
pub struct FormRequest {
    pub url: String,
    pub cookie: String,
    pub form: Vec<(String, String)>,
}

impl FormRequest {
    pub fn field(&self, key: &str) -> Option<&str> {
        self.form
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
    pub set_cookies: Vec<String>,
}

impl HttpReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The raw HTTP seam. Everything above it speaks envelopes, never sockets.
pub trait Connector {
    fn post_form(&self, request: &FormRequest) -> Result<HttpReply>;
    fn get(&self, url: &str, cookie: Option<&str>) -> Result<HttpReply>;
}

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub user_agent: String,
    pub referer: String,
    pub timeout_ms: u64,
}

impl ConnectorConfig {
    pub fn from_config(config: &WdsyncConfig) -> Self {
        Self {
            user_agent: config.user_agent(),
            referer: crate::config::DEFAULT_REFERER.to_string(),
            timeout_ms: config.timeout_ms(),
        }
    }
}

pub struct HttpConnector {
    client: Client,
    config: ConnectorConfig,
}

impl HttpConnector {
    pub fn new(config: ConnectorConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|error| WikidotError::Transport {
                url: String::new(),
                status: None,
                message: format!("failed to build HTTP client: {error}"),
            })?;
        Ok(Self { client, config })
    }

    fn finish(url: &str, response: reqwest::Result<reqwest::blocking::Response>) -> Result<HttpReply> {
        let response = response.map_err(|error| WikidotError::Transport {
            url: url.to_string(),
            status: None,
            message: error.to_string(),
        })?;
        let status = response.status().as_u16();
        let set_cookies = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .map(ToString::to_string)
            .collect();
        let body = response.text().map_err(|error| WikidotError::Transport {
            url: url.to_string(),
            status: Some(status),
            message: format!("failed to read response body: {error}"),
        })?;
        Ok(HttpReply {
            status,
            body,
            set_cookies,
        })
    }
}

impl Connector for HttpConnector {
    fn post_form(&self, request: &FormRequest) -> Result<HttpReply> {
        let response = self
            .client
            .post(&request.url)
            .header(USER_AGENT, self.config.user_agent.clone())
            .header(REFERER, self.config.referer.clone())
            .header(COOKIE, request.cookie.clone())
            .form(&request.form)
            .send();
        Self::finish(&request.url, response)
    }

    fn get(&self, url: &str, cookie: Option<&str>) -> Result<HttpReply> {
        let mut builder = self
            .client
            .get(url)
            .header(USER_AGENT, self.config.user_agent.clone())
            .header(REFERER, self.config.referer.clone());
        if let Some(cookie) = cookie
            && !cookie.is_empty()
        {
            builder = builder.header(COOKIE, cookie.to_string());
        }
        Self::finish(url, builder.send())
    }
}

/// A successful (`status == "ok"`) envelope.
#[derive(Debug, Clone)]
pub struct AjaxResponse {
    pub site: String,
    pub body: Option<Value>,
    pub fields: Map<String, Value>,
}

impl AjaxResponse {
    pub fn body_text(&self) -> Option<&str> {
        self.body.as_ref().and_then(Value::as_str)
    }

    /// Read an auxiliary field that wikidot may encode as a string or a number.
    pub fn field_string(&self, key: &str) -> Option<String> {
        match self.fields.get(key)? {
            Value::String(value) => Some(value.clone()),
            Value::Number(value) => Some(value.to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Envelope {
    Ok(AjaxResponse),
    Failure(ProtocolFailure),
}

impl Envelope {
    /// Validate a decoded JSON document as an AJAX envelope.
    pub fn decode(value: Value, site: &str, url: &str) -> Result<Self> {
        let Value::Object(mut fields) = value.clone() else {
            return Err(malformed(url, "envelope is not a JSON object"));
        };
        let status = match fields.remove("status") {
            Some(Value::String(status)) => status,
            _ => return Err(malformed(url, "envelope has no status")),
        };
        let body = fields.remove("body");
        if status == "ok" {
            return Ok(Self::Ok(AjaxResponse {
                site: site.to_string(),
                body,
                fields,
            }));
        }
        let message = fields
            .get("message")
            .and_then(Value::as_str)
            .map(ToString::to_string);
        Ok(Self::Failure(ProtocolFailure {
            site: site.to_string(),
            status,
            message,
            body,
            raw: value,
        }))
    }
}

fn malformed(url: &str, message: &str) -> WikidotError {
    WikidotError::Transport {
        url: url.to_string(),
        status: None,
        message: message.to_string(),
    }
}

pub fn anti_forgery_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(|byte| char::from(byte).to_ascii_lowercase())
        .collect()
}

pub struct Transport<C: Connector = HttpConnector> {
    connector: C,
}

impl Transport<HttpConnector> {
    pub fn from_config(config: &WdsyncConfig) -> Result<Self> {
        Ok(Self::new(HttpConnector::new(ConnectorConfig::from_config(
            config,
        ))?))
    }
}

impl<C: Connector> Transport<C> {
    pub fn new(connector: C) -> Self {
        Self { connector }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Post `params` to the site's AJAX connector and decode the envelope.
    ///
    /// A site that refuses plain HTTP is retried exactly once over HTTPS.
    pub fn send(
        &self,
        site: &str,
        session: Option<&str>,
        params: &[(&str, String)],
    ) -> Result<AjaxResponse> {
        let base_url = site_base_url(site);
        match self.send_once(&base_url, session, params)? {
            Envelope::Ok(response) => Ok(response),
            Envelope::Failure(failure) => {
                let insecure = failure
                    .message
                    .as_deref()
                    .is_some_and(|message| message.contains(INSECURE_ACCESS_MARKER));
                if insecure && let Some(secure_url) = https_variant(&base_url) {
                    warn!(site = %base_url, "site requires https, retrying once");
                    return match self.send_once(&secure_url, session, params)? {
                        Envelope::Ok(response) => Ok(response),
                        Envelope::Failure(failure) => {
                            Err(WikidotError::Protocol(Box::new(failure)))
                        }
                    };
                }
                Err(WikidotError::Protocol(Box::new(failure)))
            }
        }
    }

    pub fn send_module(
        &self,
        site: &str,
        session: Option<&str>,
        module: &str,
        params: &[(&str, String)],
    ) -> Result<AjaxResponse> {
        let mut full = Vec::with_capacity(params.len() + 1);
        full.push(("moduleName", module.to_string()));
        full.extend(params.iter().cloned());
        self.send(site, session, &full)
    }

    pub fn send_action(
        &self,
        site: &str,
        session: Option<&str>,
        action: &str,
        params: &[(&str, String)],
    ) -> Result<AjaxResponse> {
        let mut full = Vec::with_capacity(params.len() + 2);
        full.push(("moduleName", "empty".to_string()));
        full.push(("action", action.to_string()));
        full.extend(params.iter().cloned());
        self.send(site, session, &full)
    }

    /// Plain GET with the session cookie, for HTML pages.
    pub fn get_page(&self, url: &str, session: Option<&str>) -> Result<HttpReply> {
        debug!(%url, "fetching page");
        self.connector.get(url, session)
    }

    fn send_once(
        &self,
        base_url: &str,
        session: Option<&str>,
        params: &[(&str, String)],
    ) -> Result<Envelope> {
        let url = url_join(base_url, &[AJAX_ENDPOINT]);
        let token = anti_forgery_token();
        let mut form = Vec::with_capacity(params.len() + 2);
        form.push((TOKEN_FIELD.to_string(), token.clone()));
        form.push(("callbackIndex".to_string(), "0".to_string()));
        for (key, value) in params {
            form.push(((*key).to_string(), value.clone()));
        }
        let cookie = match session {
            Some(session) if !session.is_empty() => format!("{TOKEN_FIELD}={token}; {session}"),
            _ => format!("{TOKEN_FIELD}={token}"),
        };

        let target = params
            .iter()
            .find(|(key, _)| *key == "action" || *key == "moduleName")
            .map(|(_, value)| value.as_str())
            .unwrap_or("?");
        debug!(%url, target, authenticated = session.is_some(), "ajax request");

        let reply = self.connector.post_form(&FormRequest {
            url: url.clone(),
            cookie,
            form,
        })?;
        if !reply.is_success() {
            return Err(WikidotError::Transport {
                url,
                status: Some(reply.status),
                message: format!("HTTP {}", reply.status),
            });
        }
        let value: Value = serde_json::from_str(&reply.body).map_err(|error| {
            WikidotError::Transport {
                url: url.clone(),
                status: Some(reply.status),
                message: format!("response is not JSON: {error}"),
            }
        })?;
        Envelope::decode(value, base_url, &url)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::testing::MockConnector;

    fn ok_reply(value: Value) -> HttpReply {
        HttpReply {
            status: 200,
            body: value.to_string(),
            set_cookies: Vec::new(),
        }
    }

    #[test]
    fn send_posts_token_as_field_and_cookie() {
        let connector = MockConnector::default();
        connector.push_post(ok_reply(json!({"status": "ok", "body": "hi", "extra": 3})));
        let transport = Transport::new(connector);

        let response = transport
            .send_module(
                "sandbox",
                Some("WIKIDOT_SESSION_ID=abc; wikidot_udsession=1"),
                "edit/PagePreviewModule",
                &[("source", "x".to_string())],
            )
            .expect("send");
        assert_eq!(response.body_text(), Some("hi"));
        assert_eq!(response.field_string("extra").as_deref(), Some("3"));

        let requests = transport.connector().posts();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(
            request.url,
            "http://sandbox.wikidot.com/ajax-module-connector.php"
        );
        let token = request.field(TOKEN_FIELD).expect("token field");
        assert_eq!(token.len(), TOKEN_LENGTH);
        assert!(request.cookie.starts_with(&format!("{TOKEN_FIELD}={token}; ")));
        assert!(request.cookie.ends_with("wikidot_udsession=1"));
        assert_eq!(request.field("callbackIndex"), Some("0"));
        assert_eq!(request.field("moduleName"), Some("edit/PagePreviewModule"));
    }

    #[test]
    fn action_wrapper_fixes_module_and_action() {
        let connector = MockConnector::default();
        connector.push_post(ok_reply(json!({"status": "ok"})));
        let transport = Transport::new(connector);
        transport
            .send_action("sandbox", None, "WikiPageAction", &[])
            .expect("send");
        let request = &transport.connector().posts()[0];
        assert_eq!(request.field("moduleName"), Some("empty"));
        assert_eq!(request.field("action"), Some("WikiPageAction"));
        assert_eq!(request.cookie.matches(';').count(), 0);
    }

    #[test]
    fn failed_envelope_surfaces_protocol_error() {
        let connector = MockConnector::default();
        connector.push_post(ok_reply(
            json!({"status": "no_permission", "message": "denied", "body": ""}),
        ));
        let transport = Transport::new(connector);
        let error = transport
            .send("sandbox", None, &[])
            .expect_err("must fail");
        let failure = error.protocol().expect("protocol failure");
        assert_eq!(failure.status, "no_permission");
        assert_eq!(failure.message.as_deref(), Some("denied"));
        assert_eq!(failure.raw["status"], "no_permission");
    }

    #[test]
    fn insecure_site_is_retried_over_https_once() {
        let connector = MockConnector::default();
        connector.push_post(ok_reply(json!({
            "status": "not_ok",
            "message": "Nonsecure access is not enabled for this site"
        })));
        connector.push_post(ok_reply(json!({"status": "ok", "body": "secure"})));
        let transport = Transport::new(connector);

        let response = transport.send("sandbox", None, &[]).expect("send");
        assert_eq!(response.body_text(), Some("secure"));
        assert_eq!(response.site, "https://sandbox.wikidot.com");

        let requests = transport.connector().posts();
        assert_eq!(requests.len(), 2);
        assert!(requests[1].url.starts_with("https://"));
        assert_ne!(
            requests[0].field(TOKEN_FIELD),
            requests[1].field(TOKEN_FIELD)
        );
    }

    #[test]
    fn https_fallback_never_loops() {
        let connector = MockConnector::default();
        for _ in 0..3 {
            connector.push_post(ok_reply(json!({
                "status": "not_ok",
                "message": "Nonsecure access is not enabled for this site"
            })));
        }
        let transport = Transport::new(connector);
        let error = transport.send("sandbox", None, &[]).expect_err("must fail");
        assert!(error.is_protocol_status("not_ok"));
        assert_eq!(transport.connector().posts().len(), 2);
    }

    #[test]
    fn already_secure_site_is_not_retried() {
        let connector = MockConnector::default();
        connector.push_post(ok_reply(json!({
            "status": "not_ok",
            "message": "Nonsecure access is not enabled for this site"
        })));
        let transport = Transport::new(connector);
        transport
            .send("https://sandbox.wikidot.com", None, &[])
            .expect_err("must fail");
        assert_eq!(transport.connector().posts().len(), 1);
    }

    #[test]
    fn http_and_json_failures_are_transport_errors() {
        let connector = MockConnector::default();
        connector.push_post(HttpReply {
            status: 502,
            body: String::new(),
            set_cookies: Vec::new(),
        });
        connector.push_post(HttpReply {
            status: 200,
            body: "<html>".to_string(),
            set_cookies: Vec::new(),
        });
        connector.push_post(ok_reply(json!({"body": "no status"})));
        let transport = Transport::new(connector);

        for expected_status in [Some(502), Some(200), None] {
            match transport.send("sandbox", None, &[]) {
                Err(WikidotError::Transport { status, .. }) => {
                    assert_eq!(status, expected_status)
                }
                other => panic!("expected transport error, got {other:?}"),
            }
        }
    }
}
