use std::sync::Arc;

use async_trait::async_trait;
use nimbus_core::{ConsentUi, Error, Result};
use nimbus_daemon::PendingConsents;

/// Console consent front-end: registers the attempt with the daemon's
/// callback registry, prints the URL for the user to open, and waits for
/// the code to arrive on the callback endpoint.
pub struct ConsoleConsent {
    pub consents: Arc<PendingConsents>,
    pub daemon_url: String,
}

#[async_trait]
impl ConsentUi for ConsoleConsent {
    async fn request_authorization_code(
        &self,
        authorize_url: &str,
        state: &str,
    ) -> Result<String> {
        // Credential providers point straight at the daemon's own /login;
        // OAuth providers get redirected there from it.
        let own_login = format!("{}/login", self.daemon_url);
        let external = !authorize_url.starts_with(&own_login);
        let rx = self
            .consents
            .register(state, external.then(|| authorize_url.to_string()));

        eprintln!(
            "Open the following URL in a browser to authorize:\n  {}/login?state={}",
            self.daemon_url, state
        );
        match rx.await {
            Ok(code) => Ok(code),
            Err(_) => {
                self.consents.abandon(state);
                Err(Error::aborted())
            }
        }
    }
}
