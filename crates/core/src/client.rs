//! The user-facing handle over a provider: every operation returns a
//! [`Request`] driven by the engine, so consumers get cancellation,
//! pause/resume, progress, and exactly-once completion for free.

use std::sync::Arc;

use tracing::info;

use crate::auth::Token;
use crate::error::{Error, Result};
use crate::http::{DownloadSink, UploadSource, VecSink};
use crate::provider::{CloudProvider, GeneralData, Item, LibraryContext, Page, Range};
use crate::request::{ProgressListener, Request, RequestContext};

/// Convenience no-op completion callback.
pub fn discard<T>(_result: &Result<T>) {}

#[derive(Clone)]
pub struct CloudClient {
    provider: Arc<dyn CloudProvider>,
    context: LibraryContext,
}

impl CloudClient {
    pub fn new(provider: Arc<dyn CloudProvider>, context: LibraryContext) -> Self {
        Self { provider, context }
    }

    pub fn name(&self) -> &'static str {
        self.provider.name()
    }

    pub fn provider(&self) -> &Arc<dyn CloudProvider> {
        &self.provider
    }

    pub fn root_directory(&self) -> Item {
        self.provider.root_directory()
    }

    /// Runs the full consent dance: generates a state nonce, sends the
    /// consent UI to the provider's authorize URL, exchanges the returned
    /// code, and stores the token.
    pub fn authorize(
        &self,
        callback: impl FnOnce(&Result<Token>) + Send + 'static,
    ) -> Request<Token> {
        let provider = self.provider.clone();
        let consent = self.context.consent.clone();
        Request::spawn(
            move |ctx| async move {
                let consent = consent.ok_or_else(|| {
                    Error::failure("no consent ui configured for interactive authorization")
                })?;
                let state = uuid::Uuid::new_v4().simple().to_string();
                let url = provider.authorize_library_url(&state);
                let code = consent.request_authorization_code(&url, &state).await?;
                ctx.check_aborted()?;
                let token = provider.exchange_code(&ctx, &code).await?;
                provider.auth().set_token(token.clone()).await;
                info!(provider = provider.name(), "authorized");
                Ok(token)
            },
            callback,
        )
    }

    pub fn exchange_code(
        &self,
        code: &str,
        callback: impl FnOnce(&Result<Token>) + Send + 'static,
    ) -> Request<Token> {
        let provider = self.provider.clone();
        let code = code.to_string();
        Request::spawn(
            move |ctx| async move {
                let token = provider.exchange_code(&ctx, &code).await?;
                provider.auth().set_token(token.clone()).await;
                Ok(token)
            },
            callback,
        )
    }

    /// Cheap authorized probe against the persisted token.
    pub fn validate_token(
        &self,
        callback: impl FnOnce(&Result<bool>) + Send + 'static,
    ) -> Request<bool> {
        let provider = self.provider.clone();
        Request::spawn(
            move |ctx| async move { provider.validate_token(&ctx).await },
            callback,
        )
    }

    pub fn get_item_data(
        &self,
        id: &str,
        callback: impl FnOnce(&Result<Item>) + Send + 'static,
    ) -> Request<Item> {
        let provider = self.provider.clone();
        let id = id.to_string();
        Request::spawn(
            move |ctx| async move { provider.get_item_data(&ctx, &id).await },
            callback,
        )
    }

    pub fn list_directory_page(
        &self,
        item: &Item,
        page_token: Option<String>,
        callback: impl FnOnce(&Result<Page>) + Send + 'static,
    ) -> Request<Page> {
        let provider = self.provider.clone();
        let item = item.clone();
        Request::spawn(
            move |ctx| async move {
                provider
                    .list_directory_page(&ctx, &item, page_token.as_deref())
                    .await
            },
            callback,
        )
    }

    /// Accumulates every page, in page order, until the provider reports no
    /// further token. A provider echoing the same token twice terminates
    /// the loop instead of spinning.
    pub fn list_directory(
        &self,
        item: &Item,
        callback: impl FnOnce(&Result<Vec<Item>>) + Send + 'static,
    ) -> Request<Vec<Item>> {
        let provider = self.provider.clone();
        let item = item.clone();
        Request::spawn(
            move |ctx| async move {
                let mut items = Vec::new();
                let mut page_token: Option<String> = None;
                loop {
                    ctx.check_aborted()?;
                    let page = provider
                        .list_directory_page(&ctx, &item, page_token.as_deref())
                        .await?;
                    items.extend(page.items);
                    match page.next_page_token {
                        Some(next) if Some(&next) != page_token.as_ref() => {
                            page_token = Some(next)
                        }
                        _ => return Ok(items),
                    }
                }
            },
            callback,
        )
    }

    pub fn get_item_url(
        &self,
        item: &Item,
        callback: impl FnOnce(&Result<String>) + Send + 'static,
    ) -> Request<String> {
        let provider = self.provider.clone();
        let item = item.clone();
        Request::spawn(
            move |ctx| async move { provider.get_item_url(&ctx, &item).await },
            callback,
        )
    }

    pub fn get_thumbnail(
        &self,
        item: &Item,
        callback: impl FnOnce(&Result<Vec<u8>>) + Send + 'static,
    ) -> Request<Vec<u8>> {
        let provider = self.provider.clone();
        let item = item.clone();
        Request::spawn(
            move |ctx| async move {
                let mut sink = VecSink::default();
                provider.get_thumbnail(&ctx, &item, &mut sink).await?;
                Ok(sink.0)
            },
            callback,
        )
    }

    pub fn create_directory(
        &self,
        parent: &Item,
        name: &str,
        callback: impl FnOnce(&Result<Item>) + Send + 'static,
    ) -> Request<Item> {
        let provider = self.provider.clone();
        let parent = parent.clone();
        let name = name.to_string();
        Request::spawn(
            move |ctx| async move { provider.create_directory(&ctx, &parent, &name).await },
            callback,
        )
    }

    pub fn move_item(
        &self,
        source: &Item,
        destination: &Item,
        callback: impl FnOnce(&Result<Item>) + Send + 'static,
    ) -> Request<Item> {
        let provider = self.provider.clone();
        let source = source.clone();
        let destination = destination.clone();
        Request::spawn(
            move |ctx| async move { provider.move_item(&ctx, &source, &destination).await },
            callback,
        )
    }

    pub fn rename_item(
        &self,
        item: &Item,
        name: &str,
        callback: impl FnOnce(&Result<Item>) + Send + 'static,
    ) -> Request<Item> {
        let provider = self.provider.clone();
        let item = item.clone();
        let name = name.to_string();
        Request::spawn(
            move |ctx| async move { provider.rename_item(&ctx, &item, &name).await },
            callback,
        )
    }

    pub fn delete_item(
        &self,
        item: &Item,
        callback: impl FnOnce(&Result<()>) + Send + 'static,
    ) -> Request<()> {
        let provider = self.provider.clone();
        let item = item.clone();
        Request::spawn(
            move |ctx| async move { provider.delete_item(&ctx, &item).await },
            callback,
        )
    }

    pub fn upload_file(
        &self,
        parent: &Item,
        filename: &str,
        content: Arc<dyn UploadSource>,
        progress: Option<Arc<dyn ProgressListener>>,
        callback: impl FnOnce(&Result<Item>) + Send + 'static,
    ) -> Request<Item> {
        let provider = self.provider.clone();
        let parent = parent.clone();
        let filename = filename.to_string();
        let work = move |ctx: RequestContext| async move {
            provider
                .upload_file(&ctx, &parent, &filename, content)
                .await
        };
        match progress {
            Some(listener) => Request::spawn_with_progress(listener, work, callback),
            None => Request::spawn(work, callback),
        }
    }

    /// Ranged download into a caller-provided sink. The sink crosses into
    /// the spawned worker, so it is taken by value and returned through the
    /// result of the inner future via side effects on shared sinks.
    pub fn download_file<S>(
        &self,
        item: &Item,
        range: Range,
        mut sink: S,
        progress: Option<Arc<dyn ProgressListener>>,
        callback: impl FnOnce(&Result<()>) + Send + 'static,
    ) -> Request<()>
    where
        S: DownloadSink + 'static,
    {
        let provider = self.provider.clone();
        let item = item.clone();
        let work = move |ctx: RequestContext| async move {
            provider.download_file(&ctx, &item, range, &mut sink).await
        };
        match progress {
            Some(listener) => Request::spawn_with_progress(listener, work, callback),
            None => Request::spawn(work, callback),
        }
    }

    /// Buffered download, for small reads.
    pub fn download_bytes(
        &self,
        item: &Item,
        range: Range,
        callback: impl FnOnce(&Result<Vec<u8>>) + Send + 'static,
    ) -> Request<Vec<u8>> {
        let provider = self.provider.clone();
        let item = item.clone();
        Request::spawn(
            move |ctx| async move {
                let mut sink = VecSink::default();
                provider.download_file(&ctx, &item, range, &mut sink).await?;
                Ok(sink.0)
            },
            callback,
        )
    }

    pub fn general_data(
        &self,
        callback: impl FnOnce(&Result<GeneralData>) + Send + 'static,
    ) -> Request<GeneralData> {
        let provider = self.provider.clone();
        Request::spawn(
            move |ctx| async move { provider.general_data(&ctx).await },
            callback,
        )
    }
}
