use std::collections::HashMap;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub daemon: DaemonSettings,
    pub storage: StorageSettings,
    pub providers: ProviderSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DaemonSettings {
    pub host: String,
    pub port: u16,
    /// Overrides the derived `http://<host>:<port>` redirect URI.
    pub redirect_uri: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageSettings {
    /// Upload cache files (`<inode>.tmp`) live here.
    pub temporary_dir: String,
    /// Token envelopes and hints (`<provider>.tok`, `<provider>.hints`).
    pub state_dir: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderSettings {
    pub google_drive: OAuthClientSettings,
    pub dropbox: OAuthClientSettings,
    pub s3: S3ProviderSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OAuthClientSettings {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct S3ProviderSettings {
    pub region: String,
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::default()
                    .separator("__")
                    .prefix("CLOUDSTORAGE"),
            )
            .set_default("daemon.host", "127.0.0.1")?
            .set_default("daemon.port", 8942)?
            .set_default(
                "storage.temporary_dir",
                std::env::temp_dir()
                    .join("nimbus")
                    .to_string_lossy()
                    .to_string(),
            )?
            .set_default("storage.state_dir", default_state_dir())?
            .set_default("providers.google_drive.client_id", "")?
            .set_default("providers.google_drive.client_secret", "")?
            .set_default("providers.dropbox.client_id", "")?
            .set_default("providers.dropbox.client_secret", "")?
            .set_default("providers.s3.region", "us-east-1")?
            .build()?;

        let mut settings: Settings = config.try_deserialize()?;
        settings.apply_env_overrides();
        Ok(settings)
    }

    /// The documented single-value overrides, applied after file and
    /// prefixed-environment layering.
    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("CLOUDSTORAGE_TEMPORARY_DIR") {
            self.storage.temporary_dir = dir;
        }
        if let Ok(port) = std::env::var("CLOUDSTORAGE_HTTP_PORT") {
            if let Ok(port) = port.parse() {
                self.daemon.port = port;
            }
        }
        if let Ok(uri) = std::env::var("CLOUDSTORAGE_REDIRECT_URI") {
            self.daemon.redirect_uri = Some(uri);
        }
    }

    pub fn redirect_uri(&self) -> String {
        self.daemon
            .redirect_uri
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.daemon.host, self.daemon.port))
    }

    /// The hint map handed to a provider at construction.
    pub fn hints_for(&self, provider: &str) -> HashMap<String, String> {
        let mut hints = HashMap::new();
        hints.insert("redirect_uri".to_string(), self.redirect_uri());
        hints.insert(
            "temporary_directory".to_string(),
            self.storage.temporary_dir.clone(),
        );
        match provider {
            "google_drive" => {
                hints.insert(
                    "client_id".to_string(),
                    self.providers.google_drive.client_id.clone(),
                );
                hints.insert(
                    "client_secret".to_string(),
                    self.providers.google_drive.client_secret.clone(),
                );
            }
            "dropbox" => {
                hints.insert(
                    "client_id".to_string(),
                    self.providers.dropbox.client_id.clone(),
                );
                hints.insert(
                    "client_secret".to_string(),
                    self.providers.dropbox.client_secret.clone(),
                );
            }
            "s3" => {
                hints.insert("aws_region".to_string(), self.providers.s3.region.clone());
            }
            _ => {}
        }
        hints
    }
}

fn default_state_dir() -> String {
    std::env::var("HOME")
        .map(|home| format!("{home}/.nimbus"))
        .unwrap_or_else(|_| ".nimbus".to_string())
}

impl Default for Settings {
    fn default() -> Self {
        Self::load().expect("Failed to load default settings")
    }
}
