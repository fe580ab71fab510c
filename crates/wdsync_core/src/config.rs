use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use toml::Value;

pub const DEFAULT_USER_AGENT: &str = "wdsync/0.2";
pub const DEFAULT_REFERER: &str = "wdsync";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 3_000;
pub const DEFAULT_TAG_DEFECT_STATUS: &str = "not_ok";
pub const DEFAULT_LOGIN_URL: &str =
    "https://www.wikidot.com/default--flow/login__LoginPopupScreen";
pub const DEFAULT_PROFILE_URL: &str = "https://www.wikidot.com/user:info/";
pub const DEFAULT_CHECK_SITE: &str = "https://www.wikidot.com";
pub const DEFAULT_CHECK_MODULE: &str = "dashboard/settings/DSAccountModule";
pub const DEFAULT_UNAUTHORIZED_STATUSES: &[&str] = &["no_permission", "not_logged_in", "wrong_token7"];

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct WdsyncConfig {
    #[serde(default)]
    pub wikidot: WikidotSection,
    #[serde(default)]
    pub edit: EditSection,
    #[serde(default)]
    pub auth: AuthSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct WikidotSection {
    pub site: Option<String>,
    pub user_agent: Option<String>,
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub account_select: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct EditSection {
    pub settle_delay_ms: Option<u64>,
    pub tag_defect_status: Option<String>,
    pub tag_defect_message: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct AuthSection {
    pub login_url: Option<String>,
    pub profile_url: Option<String>,
    pub check_site: Option<String>,
    pub check_module: Option<String>,
    pub unauthorized_statuses: Option<Vec<String>>,
}

/// Settings of the lock-then-save workflow and its tag compensation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditSettings {
    pub settle_delay: Duration,
    pub tag_defect_status: String,
    pub tag_defect_message: Option<String>,
}

impl Default for EditSettings {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(DEFAULT_SETTLE_DELAY_MS),
            tag_defect_status: DEFAULT_TAG_DEFECT_STATUS.to_string(),
            tag_defect_message: None,
        }
    }
}

/// Endpoints used for login, profile lookup and session probing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSettings {
    pub login_url: String,
    pub profile_url: String,
    pub check_site: String,
    pub check_module: String,
    pub unauthorized_statuses: Vec<String>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            login_url: DEFAULT_LOGIN_URL.to_string(),
            profile_url: DEFAULT_PROFILE_URL.to_string(),
            check_site: DEFAULT_CHECK_SITE.to_string(),
            check_module: DEFAULT_CHECK_MODULE.to_string(),
            unauthorized_statuses: DEFAULT_UNAUTHORIZED_STATUSES
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }
}

impl WdsyncConfig {
    /// Resolve the default site: env WIKIDOT_SITE > config > None.
    pub fn site(&self) -> Option<String> {
        env_override("WIKIDOT_SITE").or_else(|| self.wikidot.site.clone())
    }

    /// Resolve user agent: env WIKIDOT_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        env_override("WIKIDOT_USER_AGENT")
            .or_else(|| self.wikidot.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn timeout_ms(&self) -> u64 {
        self.wikidot.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS)
    }

    pub fn account_select(&self) -> bool {
        self.wikidot.account_select
    }

    /// Settle delay: env WDSYNC_SETTLE_DELAY_MS > config > default.
    pub fn edit_settings(&self) -> EditSettings {
        let settle_ms = env_override("WDSYNC_SETTLE_DELAY_MS")
            .and_then(|value| value.parse::<u64>().ok())
            .or(self.edit.settle_delay_ms)
            .unwrap_or(DEFAULT_SETTLE_DELAY_MS);
        EditSettings {
            settle_delay: Duration::from_millis(settle_ms),
            tag_defect_status: self
                .edit
                .tag_defect_status
                .clone()
                .unwrap_or_else(|| DEFAULT_TAG_DEFECT_STATUS.to_string()),
            tag_defect_message: self
                .edit
                .tag_defect_message
                .clone()
                .filter(|value| !value.trim().is_empty()),
        }
    }

    pub fn auth_settings(&self) -> AuthSettings {
        let defaults = AuthSettings::default();
        AuthSettings {
            login_url: self.auth.login_url.clone().unwrap_or(defaults.login_url),
            profile_url: self
                .auth
                .profile_url
                .clone()
                .unwrap_or(defaults.profile_url),
            check_site: self.auth.check_site.clone().unwrap_or(defaults.check_site),
            check_module: self
                .auth
                .check_module
                .clone()
                .unwrap_or(defaults.check_module),
            unauthorized_statuses: self
                .auth
                .unauthorized_statuses
                .clone()
                .unwrap_or(defaults.unauthorized_statuses),
        }
    }
}

fn env_override(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Load and parse a WdsyncConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<WdsyncConfig> {
    if !config_path.exists() {
        return Ok(WdsyncConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: WdsyncConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

pub fn default_config_toml(site: Option<&str>) -> String {
    let site_line = match site {
        Some(site) => format!("site = {}\n", Value::String(site.to_string())),
        None => "# site = \"scp-sandbox-3\"\n".to_string(),
    };
    format!(
        "[wikidot]\n{site_line}user_agent = \"{DEFAULT_USER_AGENT}\"\naccount_select = false\n\n[edit]\nsettle_delay_ms = {DEFAULT_SETTLE_DELAY_MS}\ntag_defect_status = \"{DEFAULT_TAG_DEFECT_STATUS}\"\n"
    )
}

#[derive(Debug, Clone, Default)]
pub struct ConfigPatch {
    pub set_site: Option<String>,
    pub set_account_select: Option<bool>,
}

/// Update selected keys under `[wikidot]` while preserving all other config sections.
/// Returns `true` when a write occurred.
pub fn patch_config(config_path: &Path, patch: &ConfigPatch) -> Result<bool> {
    if patch.set_site.is_none() && patch.set_account_select.is_none() {
        return Ok(false);
    }

    let mut root = if config_path.exists() {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        toml::from_str::<Value>(&content)
            .with_context(|| format!("failed to parse {}", config_path.display()))?
    } else {
        Value::Table(Default::default())
    };
    let original = root.clone();

    let root_table = root.as_table_mut().ok_or_else(|| {
        anyhow::anyhow!(
            "top-level TOML must be a table in {}",
            config_path.display()
        )
    })?;
    let wikidot_entry = root_table
        .entry("wikidot".to_string())
        .or_insert_with(|| Value::Table(Default::default()));
    let wikidot_table = wikidot_entry.as_table_mut().ok_or_else(|| {
        anyhow::anyhow!("[wikidot] must be a table in {}", config_path.display())
    })?;

    if let Some(site) = &patch.set_site {
        wikidot_table.insert("site".to_string(), Value::String(site.clone()));
    }
    if let Some(account_select) = patch.set_account_select {
        wikidot_table.insert(
            "account_select".to_string(),
            Value::Boolean(account_select),
        );
    }

    if root == original {
        return Ok(false);
    }

    let parent = config_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("config path has no parent: {}", config_path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    let rendered = toml::to_string_pretty(&root).context("failed to serialize config TOML")?;
    fs::write(config_path, rendered)
        .with_context(|| format!("failed to write {}", config_path.display()))?;
    Ok(true)
}
