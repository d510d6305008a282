//! Scan service configuration.
//!
//! Loaded from `SCAN_CONFIG` or `configs/scan.json` when present, otherwise
//! built-in defaults. Environment variables override individual settings.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

const DEFAULT_CONFIG_PATH: &str = "configs/scan.json";

/// Which recognition backend handles scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Vision model through OpenRouter.
    Vision,
    /// Remote scanning endpoint taking a multipart upload.
    Remote,
}

impl BackendKind {
    /// Parse an env/config string into a backend kind.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "vision" => Some(Self::Vision),
            "remote" => Some(Self::Remote),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_backend")]
    pub backend: BackendKind,
    /// Scanning endpoint for the `remote` backend.
    #[serde(default)]
    pub remote_url: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_prompt")]
    pub prompt: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    /// Form sessions untouched for this long are evicted.
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Regex fallbacks run over free OCR text.
    #[serde(default = "default_text_patterns")]
    pub text_patterns: Vec<TextPattern>,
}

/// A regex used to pull a field out of free OCR text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextPattern {
    /// Field this pattern feeds: "plate" or "vin".
    pub id: String,
    /// First match wins. Uses capture group 1 when present.
    pub pattern: String,
    /// Optional normalization: "uppercase" | "strip_punctuation" | "uppercase_strip_punctuation"
    #[serde(default)]
    pub normalize: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_backend() -> BackendKind {
    BackendKind::Vision
}

fn default_model() -> String {
    "google/gemini-2.0-flash-001".to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_max_upload_bytes() -> usize {
    20 * 1024 * 1024
}

fn default_session_ttl_secs() -> u64 {
    30 * 60
}

fn default_max_sessions() -> usize {
    10_000
}

fn default_prompt() -> String {
    r#"Extrais les informations suivantes de cette carte grise française (Certificat d'Immatriculation) au format JSON :
  - immatriculation (A)
  - marque (D.1)
  - modele (D.2 / D.3)
  - annee (B - date de 1ère immatriculation)
  - vin (E)
  - typeCarburant (P.3)
  - couleur
  - puissanceFiscale (P.6)

Réponds uniquement avec le JSON."#
        .to_string()
}

fn default_text_patterns() -> Vec<TextPattern> {
    vec![
        TextPattern {
            id: "plate".to_string(),
            pattern: r"[A-Z]{2}[-\s]?[0-9]{3}[-\s]?[A-Z]{2}".to_string(),
            normalize: None,
        },
        TextPattern {
            id: "vin".to_string(),
            pattern: r"[A-HJ-NPR-Z0-9]{17}".to_string(),
            normalize: None,
        },
    ]
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            backend: default_backend(),
            remote_url: None,
            model: default_model(),
            prompt: default_prompt(),
            timeout_secs: default_timeout_secs(),
            max_upload_bytes: default_max_upload_bytes(),
            session_ttl_secs: default_session_ttl_secs(),
            max_sessions: default_max_sessions(),
            text_patterns: default_text_patterns(),
        }
    }
}

impl ScanConfig {
    /// Load the config file (if any), then apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var("SCAN_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = Self::load_file(Path::new(&path))?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Read a JSON config file. A missing file yields the defaults.
    pub fn load_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {:?}", path))?;
        let config: ScanConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config: {:?}", path))?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Apply overrides from a variable lookup (the process env in production).
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(addr) = var("SCAN_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Some(backend) = var("SCAN_BACKEND") {
            self.backend = BackendKind::from_str(&backend)
                .with_context(|| format!("Unknown SCAN_BACKEND: {}", backend))?;
        }
        if let Some(url) = var("SCAN_REMOTE_URL") {
            self.remote_url = Some(url);
        }
        if let Some(model) = var("SCAN_MODEL") {
            self.model = model;
        }
        if let Some(secs) = var("SCAN_TIMEOUT_SECS") {
            self.timeout_secs = secs
                .parse()
                .with_context(|| format!("Invalid SCAN_TIMEOUT_SECS: {}", secs))?;
        }
        if let Some(secs) = var("SCAN_SESSION_TTL_SECS") {
            self.session_ttl_secs = secs
                .parse()
                .with_context(|| format!("Invalid SCAN_SESSION_TTL_SECS: {}", secs))?;
        }
        Ok(())
    }
}
