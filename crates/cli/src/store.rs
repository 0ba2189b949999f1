use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Context;
use nimbus_core::auth::envelope;
use nimbus_core::Token;
use tracing::warn;

/// Flat-file persistence: one `<provider>.tok` token envelope and one
/// `<provider>.hints` JSON per configured provider.
pub struct TokenStore {
    directory: PathBuf,
}

impl TokenStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    fn token_path(&self, provider: &str) -> PathBuf {
        self.directory.join(format!("{provider}.tok"))
    }

    fn hints_path(&self, provider: &str) -> PathBuf {
        self.directory.join(format!("{provider}.hints"))
    }

    pub fn load_token(&self, provider: &str) -> Option<Token> {
        let raw = std::fs::read_to_string(self.token_path(provider)).ok()?;
        match envelope::decode(&raw) {
            Ok((label, token)) if label == provider => Some(token),
            Ok((label, _)) => {
                warn!(label, provider, "token envelope for a different provider");
                None
            }
            Err(e) => {
                warn!(provider, %e, "discarding unreadable token envelope");
                None
            }
        }
    }

    pub fn save_token(&self, provider: &str, token: &Token) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.directory)?;
        let path = self.token_path(provider);
        std::fs::write(&path, envelope::encode(provider, token))
            .with_context(|| format!("writing {}", path.display()))
    }

    pub fn load_hints(&self, provider: &str) -> HashMap<String, String> {
        std::fs::read_to_string(self.hints_path(provider))
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    pub fn save_hints(
        &self,
        provider: &str,
        hints: &HashMap<String, String>,
    ) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.directory)?;
        let path = self.hints_path(provider);
        std::fs::write(&path, serde_json::to_string_pretty(hints)?)
            .with_context(|| format!("writing {}", path.display()))
    }
}
