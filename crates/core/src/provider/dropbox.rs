//! Dropbox adapter (OAuth family). Item ids are vault-absolute paths, the
//! way the Dropbox API itself addresses content; the root id is the empty
//! string.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;

use crate::auth::{hint, AuthContext, Hints, OAuth2Config, Token};
use crate::error::{Error, Result};
use crate::http::{Body, DownloadSink, HttpRequest, UploadSource};
use crate::request::RequestContext;

use super::{
    BearerAuth, CloudProvider, FileType, GeneralData, HttpCore, Item, LibraryContext, Page, Range,
};

const API_URL: &str = "https://api.dropboxapi.com/2";
const CONTENT_URL: &str = "https://content.dropboxapi.com/2";

pub struct Dropbox {
    core: HttpCore,
    bearer: BearerAuth,
    context: LibraryContext,
    api_url: String,
    content_url: String,
}

impl Dropbox {
    pub fn new(context: LibraryContext, hints: &Hints, token: Option<Token>) -> Self {
        let oauth = OAuth2Config {
            client_id: hints.get(hint::CLIENT_ID).cloned().unwrap_or_default(),
            client_secret: hints.get(hint::CLIENT_SECRET).cloned().unwrap_or_default(),
            redirect_uri: hints.get(hint::REDIRECT_URI).cloned().unwrap_or_default(),
            auth_url: "https://www.dropbox.com/oauth2/authorize".into(),
            token_url: "https://api.dropboxapi.com/oauth2/token".into(),
            scope: None,
        };
        Self {
            core: HttpCore::new(context.transport.clone(), AuthContext::new(token)),
            bearer: BearerAuth {
                transport: context.transport.clone(),
                oauth,
            },
            context,
            api_url: hints
                .get(hint::METADATA_URL)
                .cloned()
                .unwrap_or_else(|| API_URL.into()),
            content_url: hints
                .get(hint::FILE_URL)
                .cloned()
                .unwrap_or_else(|| CONTENT_URL.into()),
        }
    }

    fn to_item(&self, value: &serde_json::Value) -> Item {
        let name = value["name"].as_str().unwrap_or_default().to_string();
        let id = value["path_display"]
            .as_str()
            .or(value["path_lower"].as_str())
            .unwrap_or_default()
            .to_string();
        let file_type = if value[".tag"].as_str() == Some("folder") {
            FileType::Directory
        } else {
            FileType::from_filename(&name)
        };
        let mut item = Item::new(id, name, file_type);
        item.size = value["size"].as_u64();
        item.timestamp = value["server_modified"]
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.to_utc());
        if !item.is_directory() {
            let size = item.size.unwrap_or(0);
            item.url = Some(self.context.file_daemon_url(self.name(), &item, size));
        }
        item
    }

    fn api(&self, endpoint: &str) -> String {
        format!("{}/{}", self.api_url, endpoint)
    }

    fn content(&self, endpoint: &str) -> String {
        format!("{}/{}", self.content_url, endpoint)
    }

    async fn rpc(
        &self,
        ctx: &RequestContext,
        endpoint: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let url = self.api(endpoint);
        self.core
            .fetch_json(ctx, &self.bearer, &move |_token| {
                (
                    HttpRequest::post(&url).header("Content-Type", "application/json"),
                    Body::json(&payload),
                )
            })
            .await
    }
}

#[async_trait]
impl CloudProvider for Dropbox {
    fn name(&self) -> &'static str {
        "dropbox"
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
        hints.insert(hint::METADATA_URL.into(), self.api_url.clone());
        hints.insert(hint::FILE_URL.into(), self.content_url.clone());
        hints
    }

    fn auth(&self) -> &AuthContext {
        &self.core.auth
    }

    fn root_directory(&self) -> Item {
        Item::directory("", "/")
    }

    fn authorize_library_url(&self, state: &str) -> String {
        self.bearer.oauth.authorize_url(state)
    }

    async fn exchange_code(&self, ctx: &RequestContext, code: &str) -> Result<Token> {
        self.bearer.exchange_code(ctx, code).await
    }

    async fn validate_token(&self, ctx: &RequestContext) -> Result<bool> {
        match self
            .rpc(ctx, "users/get_current_account", serde_json::Value::Null)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.code == 401 => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn get_item_data(&self, ctx: &RequestContext, id: &str) -> Result<Item> {
        if id.is_empty() {
            return Ok(self.root_directory());
        }
        let value = self
            .rpc(ctx, "files/get_metadata", serde_json::json!({ "path": id }))
            .await?;
        Ok(self.to_item(&value))
    }

    async fn list_directory_page(
        &self,
        ctx: &RequestContext,
        item: &Item,
        page_token: Option<&str>,
    ) -> Result<Page> {
        let value = match page_token {
            Some(cursor) => {
                self.rpc(
                    ctx,
                    "files/list_folder/continue",
                    serde_json::json!({ "cursor": cursor }),
                )
                .await?
            }
            None => {
                self.rpc(
                    ctx,
                    "files/list_folder",
                    serde_json::json!({
                        "path": item.id,
                        "recursive": false,
                        "limit": 100,
                    }),
                )
                .await?
            }
        };
        let items = value["entries"]
            .as_array()
            .map(|entries| entries.iter().map(|e| self.to_item(e)).collect())
            .unwrap_or_default();
        let next_page_token = if value["has_more"].as_bool() == Some(true) {
            value["cursor"].as_str().map(str::to_string)
        } else {
            None
        };
        Ok(Page {
            items,
            next_page_token,
        })
    }

    async fn get_item_url(&self, ctx: &RequestContext, item: &Item) -> Result<String> {
        let value = self
            .rpc(
                ctx,
                "files/get_temporary_link",
                serde_json::json!({ "path": item.id }),
            )
            .await?;
        value["link"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::failure("temporary link missing from response"))
    }

    async fn get_thumbnail(
        &self,
        ctx: &RequestContext,
        item: &Item,
        sink: &mut dyn DownloadSink,
    ) -> Result<()> {
        let url = self.content("files/get_thumbnail");
        let arg = serde_json::json!({ "path": item.id }).to_string();
        self.core
            .execute(
                ctx,
                &self.bearer,
                &move |_token| {
                    (
                        HttpRequest::post(&url).header("Dropbox-API-Arg", &arg),
                        Body::Empty,
                    )
                },
                sink,
            )
            .await?;
        Ok(())
    }

    async fn create_directory(
        &self,
        ctx: &RequestContext,
        parent: &Item,
        name: &str,
    ) -> Result<Item> {
        let value = self
            .rpc(
                ctx,
                "files/create_folder_v2",
                serde_json::json!({ "path": format!("{}/{}", parent.id, name) }),
            )
            .await?;
        let mut metadata = value["metadata"].clone();
        metadata[".tag"] = serde_json::json!("folder");
        Ok(self.to_item(&metadata))
    }

    async fn move_item(
        &self,
        ctx: &RequestContext,
        source: &Item,
        destination: &Item,
    ) -> Result<Item> {
        let value = self
            .rpc(
                ctx,
                "files/move_v2",
                serde_json::json!({
                    "from_path": source.id,
                    "to_path": format!("{}/{}", destination.id, source.filename),
                }),
            )
            .await?;
        Ok(self.to_item(&value["metadata"]))
    }

    async fn rename_item(&self, ctx: &RequestContext, item: &Item, name: &str) -> Result<Item> {
        let parent = item.id.rsplit_once('/').map(|(p, _)| p).unwrap_or_default();
        let value = self
            .rpc(
                ctx,
                "files/move_v2",
                serde_json::json!({
                    "from_path": item.id,
                    "to_path": format!("{parent}/{name}"),
                }),
            )
            .await?;
        Ok(self.to_item(&value["metadata"]))
    }

    async fn delete_item(&self, ctx: &RequestContext, item: &Item) -> Result<()> {
        self.rpc(ctx, "files/delete_v2", serde_json::json!({ "path": item.id }))
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
        let url = self.content("files/upload");
        let arg = serde_json::json!({
            "path": format!("{}/{}", parent.id, filename),
            "mode": "overwrite",
        })
        .to_string();
        let value = self
            .core
            .fetch_json(ctx, &self.bearer, &move |_token| {
                (
                    HttpRequest::post(&url)
                        .header("Dropbox-API-Arg", &arg)
                        .header("Content-Type", "application/octet-stream"),
                    Body::Source(content.clone()),
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
        let url = self.content("files/download");
        let arg = serde_json::json!({ "path": item.id }).to_string();
        self.core
            .stream_download(
                ctx,
                &self.bearer,
                range,
                &move |_token, current| {
                    let mut request = HttpRequest::post(&url).header("Dropbox-API-Arg", &arg);
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
        let account = self
            .rpc(ctx, "users/get_current_account", serde_json::Value::Null)
            .await?;
        let usage = self
            .rpc(ctx, "users/get_space_usage", serde_json::Value::Null)
            .await?;
        Ok(GeneralData {
            username: account["email"].as_str().unwrap_or_default().to_string(),
            space_used: usage["used"].as_u64().unwrap_or(0),
            space_total: usage["allocation"]["allocated"].as_u64().unwrap_or(0),
        })
    }
}
