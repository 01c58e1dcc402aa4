use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

use crate::error::{CoreResult, KasaError};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SupabaseCfg {
    /// Project base URL, e.g. https://xyz.supabase.co
    pub url: String,
    /// Name of the environment variable holding the publishable (anon) key.
    #[serde(default = "default_publishable_key_env")]
    pub publishable_key_env: String,
    /// Optional env var with a privileged key for admin operations.
    #[serde(default)]
    pub service_key_env: Option<String>,
}

impl SupabaseCfg {
    pub fn publishable_key(&self) -> CoreResult<SecretString> {
        read_key_env(&self.publishable_key_env)
    }

    /// Falls back to the publishable key when no service key is configured.
    pub fn service_key(&self) -> CoreResult<SecretString> {
        match &self.service_key_env {
            Some(var) => read_key_env(var),
            None => self.publishable_key(),
        }
    }
}

fn read_key_env(var: &str) -> CoreResult<SecretString> {
    let val = std::env::var(var)
        .map_err(|_| KasaError::Validation(format!("environment variable {var} is not set")))?;
    Ok(SecretString::new(val.into()))
}

fn default_publishable_key_env() -> String {
    "KASA_PUBLISHABLE_KEY".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AssistantCfg {
    /// Path of the chat edge function, joined onto the project URL.
    #[serde(default = "default_chat_path")]
    pub chat_path: String,
    /// Fixed user-visible notice shown when an exchange fails.
    #[serde(default = "default_fallback_message")]
    pub fallback_message: String,
    /// Canned assistant message a fresh conversation opens with.
    #[serde(default = "default_greeting")]
    pub greeting: String,
}

impl Default for AssistantCfg {
    fn default() -> Self {
        Self {
            chat_path: default_chat_path(),
            fallback_message: default_fallback_message(),
            greeting: default_greeting(),
        }
    }
}

fn default_chat_path() -> String {
    "/functions/v1/kasa-assistant".to_string()
}
fn default_fallback_message() -> String {
    "Sorry, I encountered an error. Please try again.".to_string()
}
fn default_greeting() -> String {
    "Hello! I'm the KASA AI Assistant. How can I help you today? You can ask me about \
     signage permits, the application process, fees, or compliance requirements."
        .to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HttpCfg {
    /// TCP connect timeout in milliseconds (default 5000ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Total request timeout in milliseconds (default 60000ms). Governs the
    /// worst-case hang of a stalled stream; no separate stream timeout exists.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_request_timeout_ms() -> u64 {
    60_000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
    pub supabase: SupabaseCfg,
    /// Public site origin, used to render shareable verification links.
    #[serde(default = "default_site_url")]
    pub site_url: String,
    #[serde(default)]
    pub assistant: AssistantCfg,
    #[serde(default)]
    pub http: HttpCfg,
}

fn default_site_url() -> String {
    "https://kasa.example".to_string()
}

impl Config {
    /// Load a Config from a file path (JSON or TOML by extension). If the
    /// extension is missing or unrecognized, try JSON first, then TOML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(KasaError::from)?;
        let s = std::str::from_utf8(&bytes).map_err(|e| KasaError::Other(e.into()))?;
        let cfg: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str::<Self>(s).map_err(|e| KasaError::Other(e.into()))?,
            Some("toml") => toml::from_str::<Self>(s).map_err(|e| KasaError::Other(e.into()))?,
            _ => serde_json::from_str::<Self>(s)
                .map_err(|e| KasaError::Other(e.into()))
                .or_else(|_| toml::from_str::<Self>(s).map_err(|e| KasaError::Other(e.into())))?,
        };
        Ok(cfg)
    }

    pub fn chat_url(&self) -> String {
        format!(
            "{}{}",
            self.supabase.url.trim_end_matches('/'),
            self.assistant.chat_path
        )
    }

    pub fn rest_url(&self, table: &str) -> String {
        format!(
            "{}/rest/v1/{}",
            self.supabase.url.trim_end_matches('/'),
            table
        )
    }
}
