mod settings;

pub use settings::{
    DaemonSettings, OAuthClientSettings, ProviderSettings, S3ProviderSettings, Settings,
    StorageSettings,
};
