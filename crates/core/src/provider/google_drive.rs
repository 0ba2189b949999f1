//! Google Drive adapter (OAuth family).

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::DateTime;

use crate::auth::{hint, AuthContext, Hints, OAuth2Config, Token};
use crate::error::{Error, Result};
use crate::http::{Body, CompositeSource, DownloadSink, HttpRequest, Method, UploadSource};
use crate::request::RequestContext;

use super::{
    BearerAuth, CloudProvider, FileType, GeneralData, HttpCore, Item, LibraryContext, Page, Range,
};

const METADATA_URL: &str = "https://www.googleapis.com/drive/v3";
const UPLOAD_URL: &str = "https://www.googleapis.com/upload/drive/v3";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const ITEM_FIELDS: &str = "id,name,mimeType,size,modifiedTime,thumbnailLink";

pub struct GoogleDrive {
    core: HttpCore,
    bearer: BearerAuth,
    context: LibraryContext,
    metadata_url: String,
    upload_url: String,
}

impl GoogleDrive {
    pub fn new(context: LibraryContext, hints: &Hints, token: Option<Token>) -> Self {
        let oauth = OAuth2Config {
            client_id: hints.get(hint::CLIENT_ID).cloned().unwrap_or_default(),
            client_secret: hints.get(hint::CLIENT_SECRET).cloned().unwrap_or_default(),
            redirect_uri: hints.get(hint::REDIRECT_URI).cloned().unwrap_or_default(),
            auth_url: "https://accounts.google.com/o/oauth2/auth".into(),
            token_url: "https://oauth2.googleapis.com/token".into(),
            scope: Some("https://www.googleapis.com/auth/drive".into()),
        };
        let metadata_url = hints
            .get(hint::METADATA_URL)
            .cloned()
            .unwrap_or_else(|| METADATA_URL.into());
        let upload_url = hints
            .get(hint::FILE_URL)
            .cloned()
            .unwrap_or_else(|| UPLOAD_URL.into());
        Self {
            core: HttpCore::new(context.transport.clone(), AuthContext::new(token)),
            bearer: BearerAuth {
                transport: context.transport.clone(),
                oauth,
            },
            context,
            metadata_url,
            upload_url,
        }
    }

    fn to_item(&self, value: &serde_json::Value) -> Item {
        let id = value["id"].as_str().unwrap_or_default().to_string();
        let name = value["name"].as_str().unwrap_or_default().to_string();
        let file_type = if value["mimeType"].as_str() == Some(FOLDER_MIME) {
            FileType::Directory
        } else {
            FileType::from_filename(&name)
        };
        let mut item = Item::new(id, name, file_type);
        // Drive reports sizes as decimal strings.
        item.size = value["size"].as_str().and_then(|s| s.parse().ok());
        item.timestamp = value["modifiedTime"]
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.to_utc());
        if !item.is_directory() {
            let size = item.size.unwrap_or(0);
            item.url = Some(self.context.file_daemon_url(self.name(), &item, size));
        }
        item
    }

    fn files_url(&self, id: &str) -> String {
        format!("{}/files/{}", self.metadata_url, urlencoding::encode(id))
    }
}

#[async_trait]
impl CloudProvider for GoogleDrive {
    fn name(&self) -> &'static str {
        "google_drive"
    }

    fn hints(&self) -> Hints {
        let mut hints = Hints::new();
        hints.insert(hint::CLIENT_ID.into(), self.bearer.oauth.client_id.clone());
        hints.insert(
            hint::CLIENT_SECRET.into(),
            self.bearer.oauth.client_secret.clone(),
        );
        hints.insert(
            hint::REDIRECT_URI.into(),
            self.bearer.oauth.redirect_uri.clone(),
        );
        hints.insert(hint::METADATA_URL.into(), self.metadata_url.clone());
        hints.insert(hint::FILE_URL.into(), self.upload_url.clone());
        hints
    }

    fn auth(&self) -> &AuthContext {
        &self.core.auth
    }

    fn root_directory(&self) -> Item {
        Item::directory("root", "/")
    }

    fn authorize_library_url(&self, state: &str) -> String {
        self.bearer.oauth.authorize_url(state)
    }

    async fn exchange_code(&self, ctx: &RequestContext, code: &str) -> Result<Token> {
        self.bearer.exchange_code(ctx, code).await
    }

    async fn validate_token(&self, ctx: &RequestContext) -> Result<bool> {
        let url = format!("{}/about", self.metadata_url);
        let result = self
            .core
            .fetch_json(ctx, &self.bearer, &move |_token| {
                (HttpRequest::get(&url).query("fields", "user"), Body::Empty)
            })
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(e) if e.code == 401 => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn get_item_data(&self, ctx: &RequestContext, id: &str) -> Result<Item> {
        let url = self.files_url(id);
        let value = self
            .core
            .fetch_json(ctx, &self.bearer, &move |_token| {
                (
                    HttpRequest::get(&url).query("fields", ITEM_FIELDS),
                    Body::Empty,
                )
            })
            .await?;
        Ok(self.to_item(&value))
    }

    async fn list_directory_page(
        &self,
        ctx: &RequestContext,
        item: &Item,
        page_token: Option<&str>,
    ) -> Result<Page> {
        let url = format!("{}/files", self.metadata_url);
        let query = format!("'{}' in parents and trashed = false", item.id);
        let page_token = page_token.map(str::to_string);
        let value = self
            .core
            .fetch_json(ctx, &self.bearer, &move |_token| {
                let mut request = HttpRequest::get(&url)
                    .query("q", &query)
                    .query("fields", format!("files({ITEM_FIELDS}),nextPageToken"))
                    .query("pageSize", "100");
                if let Some(token) = &page_token {
                    request = request.query("pageToken", token);
                }
                (request, Body::Empty)
            })
            .await?;
        let items = value["files"]
            .as_array()
            .map(|files| files.iter().map(|f| self.to_item(f)).collect())
            .unwrap_or_default();
        Ok(Page {
            items,
            next_page_token: value["nextPageToken"].as_str().map(str::to_string),
        })
    }

    async fn get_item_url(&self, _ctx: &RequestContext, item: &Item) -> Result<String> {
        Ok(self
            .context
            .file_daemon_url(self.name(), item, item.size.unwrap_or(0)))
    }

    async fn get_thumbnail(
        &self,
        ctx: &RequestContext,
        item: &Item,
        sink: &mut dyn DownloadSink,
    ) -> Result<()> {
        let url = self.files_url(&item.id);
        let value = self
            .core
            .fetch_json(ctx, &self.bearer, &move |_token| {
                (
                    HttpRequest::get(&url).query("fields", "thumbnailLink"),
                    Body::Empty,
                )
            })
            .await?;
        let link = value["thumbnailLink"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::not_supported("thumbnail"))?;
        self.core
            .execute(ctx, &self.bearer, &move |_token| {
                (HttpRequest::get(&link), Body::Empty)
            }, sink)
            .await?;
        Ok(())
    }

    async fn create_directory(
        &self,
        ctx: &RequestContext,
        parent: &Item,
        name: &str,
    ) -> Result<Item> {
        let url = format!("{}/files", self.metadata_url);
        let payload = serde_json::json!({
            "name": name,
            "mimeType": FOLDER_MIME,
            "parents": [parent.id],
        });
        let value = self
            .core
            .fetch_json(ctx, &self.bearer, &move |_token| {
                (
                    HttpRequest::post(&url)
                        .query("fields", ITEM_FIELDS)
                        .header("Content-Type", "application/json"),
                    Body::json(&payload),
                )
            })
            .await?;
        Ok(self.to_item(&value))
    }

    async fn move_item(
        &self,
        ctx: &RequestContext,
        source: &Item,
        destination: &Item,
    ) -> Result<Item> {
        // Drive reparents via addParents/removeParents, which needs the
        // current parent list first.
        let url = self.files_url(&source.id);
        let parents = self
            .core
            .fetch_json(ctx, &self.bearer, &{
                let url = url.clone();
                move |_token| (HttpRequest::get(&url).query("fields", "parents"), Body::Empty)
            })
            .await?;
        let remove = parents["parents"]
            .as_array()
            .map(|p| {
                p.iter()
                    .filter_map(|v| v.as_str())
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .unwrap_or_default();
        let destination_id = destination.id.clone();
        let value = self
            .core
            .fetch_json(ctx, &self.bearer, &move |_token| {
                (
                    HttpRequest::new(Method::Patch, url.clone())
                        .query("addParents", &destination_id)
                        .query("removeParents", &remove)
                        .query("fields", ITEM_FIELDS),
                    Body::Empty,
                )
            })
            .await?;
        Ok(self.to_item(&value))
    }

    async fn rename_item(&self, ctx: &RequestContext, item: &Item, name: &str) -> Result<Item> {
        let url = self.files_url(&item.id);
        let payload = serde_json::json!({ "name": name });
        let value = self
            .core
            .fetch_json(ctx, &self.bearer, &move |_token| {
                (
                    HttpRequest::new(Method::Patch, url.clone())
                        .query("fields", ITEM_FIELDS)
                        .header("Content-Type", "application/json"),
                    Body::json(&payload),
                )
            })
            .await?;
        Ok(self.to_item(&value))
    }

    async fn delete_item(&self, ctx: &RequestContext, item: &Item) -> Result<()> {
        let url = self.files_url(&item.id);
        self.core
            .fetch_bytes(ctx, &self.bearer, &move |_token| {
                (HttpRequest::new(Method::Delete, url.clone()), Body::Empty)
            })
            .await?;
        Ok(())
    }

    async fn upload_file(
        &self,
        ctx: &RequestContext,
        parent: &Item,
        filename: &str,
        content: Arc<dyn UploadSource>,
    ) -> Result<Item> {
        const BOUNDARY: &str = "nimbus-upload-boundary";
        let url = format!("{}/files", self.upload_url);
        let metadata = serde_json::json!({
            "name": filename,
            "parents": [parent.id],
        });
        let prefix = format!(
            "--{BOUNDARY}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata}\r\n--{BOUNDARY}\r\nContent-Type: application/octet-stream\r\n\r\n"
        );
        let suffix = format!("\r\n--{BOUNDARY}--\r\n");
        let body_source: Arc<dyn UploadSource> = Arc::new(CompositeSource::new(
            Bytes::from(prefix),
            content,
            Bytes::from(suffix),
        ));
        let value = self
            .core
            .fetch_json(ctx, &self.bearer, &move |_token| {
                (
                    HttpRequest::post(&url)
                        .query("uploadType", "multipart")
                        .query("fields", ITEM_FIELDS)
                        .header(
                            "Content-Type",
                            format!("multipart/related; boundary={BOUNDARY}"),
                        ),
                    Body::Source(body_source.clone()),
                )
            })
            .await?;
        Ok(self.to_item(&value))
    }

    async fn download_file(
        &self,
        ctx: &RequestContext,
        item: &Item,
        range: Range,
        sink: &mut dyn DownloadSink,
    ) -> Result<()> {
        let url = self.files_url(&item.id);
        self.core
            .stream_download(
                ctx,
                &self.bearer,
                range,
                &move |_token, current| {
                    let mut request = HttpRequest::get(&url).query("alt", "media");
                    if !current.is_full() {
                        request = request.header("Range", current.header_value());
                    }
                    (request, Body::Empty)
                },
                sink,
            )
            .await
    }

    async fn general_data(&self, ctx: &RequestContext) -> Result<GeneralData> {
        let url = format!("{}/about", self.metadata_url);
        let value = self
            .core
            .fetch_json(ctx, &self.bearer, &move |_token| {
                (
                    HttpRequest::get(&url).query("fields", "user,storageQuota"),
                    Body::Empty,
                )
            })
            .await?;
        Ok(GeneralData {
            username: value["user"]["emailAddress"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
            space_used: value["storageQuota"]["usage"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            space_total: value["storageQuota"]["limit"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
        })
    }
}
