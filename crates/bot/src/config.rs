use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context as _, Result, anyhow};
use serde::{Deserialize, Deserializer};
use tracing::info;

const TEMPLATE: &str = r#"# Matrix user IDs allowed to add and remove responses.
admins:
  - "@admin:example.org"
# Join rooms the bot is invited to. Only true (or "true") enables it.
autoaccept: true
# Login. Empty values can be supplied through RESPONDER_HOMESERVER,
# RESPONDER_USERNAME and RESPONDER_PASSWORD instead.
homeserver: ""
username: ""
password: ""
device_name: "matrix-responder-bot"
responses_file: "data/responses.json"
actions_file: "data/actions.json"
persist_timeout_ms: 5000
"#;

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct BotConfig {
    #[serde(default)]
    pub(crate) admins: Vec<String>,
    #[serde(default, deserialize_with = "enabled_flag")]
    pub(crate) autoaccept: bool,
    #[serde(default)]
    pub(crate) homeserver: Option<String>,
    #[serde(default)]
    pub(crate) username: Option<String>,
    #[serde(default)]
    pub(crate) password: Option<String>,
    #[serde(default = "default_device_name")]
    pub(crate) device_name: String,
    #[serde(default = "default_responses_file")]
    pub(crate) responses_file: PathBuf,
    #[serde(default = "default_actions_file")]
    pub(crate) actions_file: PathBuf,
    #[serde(default = "default_persist_timeout_ms")]
    pub(crate) persist_timeout_ms: u64,
}

fn default_device_name() -> String {
    "matrix-responder-bot".to_owned()
}

fn default_responses_file() -> PathBuf {
    PathBuf::from("data/responses.json")
}

fn default_actions_file() -> PathBuf {
    PathBuf::from("data/actions.json")
}

const fn default_persist_timeout_ms() -> u64 {
    5000
}

/// `true` or the string `"true"` enable the flag; anything else disables it.
fn enabled_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_yaml::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_yaml::Value::Bool(b) => b,
        serde_yaml::Value::String(s) => s == "true",
        _ => false,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Credentials {
    pub(crate) homeserver: String,
    pub(crate) username: String,
    pub(crate) password: Option<String>,
}

impl BotConfig {
    /// Merge CLI/env overrides over the file values. Empty strings count as
    /// missing. Returns `None` when the homeserver or username is absent.
    pub(crate) fn credentials(
        &self,
        homeserver: Option<&str>,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Option<Credentials> {
        let pick = |flag: Option<&str>, file: Option<&String>| {
            non_empty(flag).or_else(|| non_empty(file.map(String::as_str)))
        };
        Some(Credentials {
            homeserver: pick(homeserver, self.homeserver.as_ref())?,
            username: pick(username, self.username.as_ref())?,
            password: pick(password, self.password.as_ref()),
        })
    }
}

fn non_empty(s: Option<&str>) -> Option<String> {
    s.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
}

/// Load the YAML config at `path`. A missing file is replaced by a template
/// and reported as an error so startup halts.
pub(crate) fn load_config(path: &Path) -> Result<BotConfig> {
    if !path.exists() {
        let written = write_template(path)?;
        return Err(anyhow!(
            "config file not found at {}; wrote a template to {}, fill it in and restart",
            path.display(),
            written.display()
        ));
    }
    let yaml = fs::read_to_string(path)
        .with_context(|| format!("reading config file at {}", path.display()))?;
    let cfg: BotConfig = match serde_yaml::from_str(&yaml) {
        Ok(cfg) => cfg,
        Err(e) => {
            let written = write_template(path)?;
            return Err(anyhow!(
                "parsing YAML config at {}: {e}; a reference template was written to {}",
                path.display(),
                written.display()
            ));
        }
    };
    Ok(cfg)
}

/// Write the template config. An existing config is never overwritten; the
/// template goes next to it instead.
pub(crate) fn write_template(path: &Path) -> Result<PathBuf> {
    let target = if path.exists() {
        path.with_extension("template.yaml")
    } else {
        path.to_owned()
    };
    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(&target, TEMPLATE)
        .with_context(|| format!("writing template config at {}", target.display()))?;
    info!(file = %target.display(), "Default config generated, please correct the values and restart the bot");
    Ok(target)
}
