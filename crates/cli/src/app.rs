use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use nimbus_config::Settings;
use nimbus_core::client::discard;
use nimbus_core::http::ReqwestTransport;
use nimbus_core::provider::{dropbox::Dropbox, google_drive::GoogleDrive, s3::S3};
use nimbus_core::{CloudClient, CloudProvider, Hints, LibraryContext};
use nimbus_daemon::{DaemonState, PendingConsents};
use nimbus_vfs::FileSystem;
use tracing::{debug, info};

use crate::consent::ConsoleConsent;
use crate::store::TokenStore;

/// Everything a command needs: settings, constructed clients, the token
/// store, and the background daemon serving consent callbacks and streams.
pub struct App {
    pub settings: Settings,
    pub clients: HashMap<String, CloudClient>,
    pub store: TokenStore,
    pub daemon_url: String,
}

impl App {
    pub async fn new() -> anyhow::Result<Self> {
        let settings = Settings::load().context("loading settings")?;
        let store = TokenStore::new(&settings.storage.state_dir);
        let consents = Arc::new(PendingConsents::new());
        let daemon_url = settings.redirect_uri();

        let context = LibraryContext {
            transport: Arc::new(ReqwestTransport::new()),
            consent: Some(Arc::new(ConsoleConsent {
                consents: consents.clone(),
                daemon_url: daemon_url.clone(),
            })),
            daemon_url: daemon_url.clone(),
            temporary_directory: PathBuf::from(&settings.storage.temporary_dir),
        };

        let mut clients = HashMap::new();
        for label in configured_providers(&settings) {
            let mut hints: Hints = settings.hints_for(&label);
            for (key, value) in store.load_hints(&label) {
                hints.insert(key, value);
            }
            let token = store.load_token(&label);
            let provider: Arc<dyn CloudProvider> = match label.as_str() {
                "google_drive" => Arc::new(GoogleDrive::new(context.clone(), &hints, token)),
                "dropbox" => Arc::new(Dropbox::new(context.clone(), &hints, token)),
                "s3" => Arc::new(S3::new(context.clone(), &hints, token)),
                other => anyhow::bail!("unknown provider {other}"),
            };
            debug!(provider = label, "configured");
            clients.insert(label, CloudClient::new(provider, context.clone()));
        }

        // Serve consent callbacks and media streams in the background for
        // the lifetime of the process.
        let daemon_state = DaemonState {
            providers: Arc::new(clients.clone()),
            consents,
        };
        let host = settings.daemon.host.clone();
        let port = settings.daemon.port;
        tokio::spawn(async move {
            if let Err(e) = nimbus_daemon::serve(daemon_state, &host, port).await {
                tracing::error!(%e, "daemon exited");
            }
        });

        Ok(Self {
            settings,
            clients,
            store,
            daemon_url,
        })
    }

    pub fn client(&self, provider: &str) -> anyhow::Result<&CloudClient> {
        self.clients
            .get(provider)
            .with_context(|| format!("provider {provider} is not configured"))
    }

    /// Interactive authorization when no usable token is stored.
    pub async fn ensure_authorized(&self, provider: &str) -> anyhow::Result<()> {
        let client = self.client(provider)?;
        if client.provider().auth().token().await.is_some() {
            return Ok(());
        }
        info!(provider, "no stored token, starting authorization");
        let token = client.authorize(discard).result().await?;
        self.store.save_token(provider, &token)?;
        self.store
            .save_hints(provider, &client.provider().hints())?;
        Ok(())
    }

    /// Authorizes every configured provider a path may touch, then builds
    /// the VFS over all of them.
    pub async fn filesystem(&self) -> anyhow::Result<FileSystem> {
        Ok(FileSystem::new(
            self.clients.values().cloned().collect(),
            PathBuf::from(&self.settings.storage.temporary_dir),
        ))
    }

    /// `provider/rest/of/path` decomposition of a CLI path argument.
    pub fn split_path(path: &str) -> (String, String) {
        let trimmed = path.trim_start_matches('/');
        match trimmed.split_once('/') {
            Some((provider, rest)) => (provider.to_string(), rest.to_string()),
            None => (trimmed.to_string(), String::new()),
        }
    }
}

fn configured_providers(settings: &Settings) -> Vec<String> {
    let mut providers = Vec::new();
    if !settings.providers.google_drive.client_id.is_empty() {
        providers.push("google_drive".to_string());
    }
    if !settings.providers.dropbox.client_id.is_empty() {
        providers.push("dropbox".to_string());
    }
    // S3 needs no app registration, only credentials.
    providers.push("s3".to_string());
    providers
}
