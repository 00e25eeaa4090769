use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::info;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use hublink::{ClientConfig, Identity};

/// What `hublink login` remembers between runs.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SavedSession {
    pub api_base_url: String,
    pub hub_base_url: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl SavedSession {
    pub fn new(api_base_url: &str, hub_base_url: &str, user_id: &str, token: Option<&str>) -> Self {
        SavedSession {
            api_base_url: api_base_url.to_string(),
            hub_base_url: hub_base_url.to_string(),
            user_id: user_id.to_string(),
            token: token.filter(|t| !t.is_empty()).map(|t| BASE64.encode(t)),
        }
    }

    pub fn get_token(&self) -> Option<String> {
        self.token.as_ref().and_then(|encoded| {
            BASE64
                .decode(encoded)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        })
    }

    pub fn to_config(&self) -> ClientConfig {
        let mut identity = Identity::new(self.user_id.clone());
        if let Some(token) = self.get_token() {
            identity = identity.with_token(token);
        }
        ClientConfig::new(self.api_base_url.clone(), self.hub_base_url.clone()).with_identity(identity)
    }
}

static DATA_DIR_OVERRIDE: OnceCell<PathBuf> = OnceCell::new();

/// Use `dir` instead of the platform config directory. Only the first call counts.
pub fn set_data_dir_override(dir: PathBuf) {
    if DATA_DIR_OVERRIDE.set(dir).is_err() {
        log::warn!("Data directory override already set");
    }
}

pub fn get_data_dir() -> Result<PathBuf> {
    let data_dir = match DATA_DIR_OVERRIDE.get() {
        Some(dir) => dir.clone(),
        None => dirs::config_dir()
            .ok_or_else(|| anyhow!("Could not determine config directory"))?
            .join("hublink"),
    };

    if !data_dir.exists() {
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create {}", data_dir.display()))?;
    }

    Ok(data_dir)
}

fn get_session_path() -> Result<PathBuf> {
    Ok(get_data_dir()?.join("session.json"))
}

pub fn save_session(session: &SavedSession) -> Result<()> {
    save_session_to(&get_session_path()?, session)
}

pub fn load_session() -> Result<Option<SavedSession>> {
    load_session_from(&get_session_path()?)
}

pub fn save_session_to(path: &Path, session: &SavedSession) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to write {}", path.display()))?;
    serde_json::to_writer_pretty(file, session)?;

    info!("Session saved for user {}", session.user_id);
    Ok(())
}

pub fn load_session_from(path: &Path) -> Result<Option<SavedSession>> {
    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(path)?;
    let session: SavedSession = serde_json::from_str(&contents)
        .with_context(|| format!("Malformed session file {}", path.display()))?;
    info!("Loaded session for user {} from {}", session.user_id, path.display());

    Ok(Some(session))
}
