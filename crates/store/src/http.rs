use crate::error::{Result, StoreError};
use crate::traits::EntityStore;
use async_trait::async_trait;
use ingest_protocol::{
    AppendVersion, ContentUploaded, CreateEntity, EntityVersion, RelationsUpdated,
    UpdateRelations,
};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct UploadRequest<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    filename: Option<&'a str>,
}

#[derive(Deserialize)]
struct TipResponse {
    tip: String,
}

/// Entity store reached over its JSON HTTP API.
///
/// Routes (relative to `base_url`):
///
/// ```text
/// POST /content                 {text, filename?}            -> {cid, size}
/// POST /entities                {type, components, ...}      -> {id, tip, version}
/// POST /entities/{id}/versions  {expect_tip, components?...} -> {id, tip, version}
/// GET  /entities/{id}/tip                                    -> {tip}
/// POST /relations               {parent_id, expect_tip, ...} -> {parent, children}
/// ```
///
/// `409` maps to [`StoreError::Conflict`], `404` to [`StoreError::NotFound`].
#[derive(Debug, Clone)]
pub struct HttpEntityStore {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpEntityStore {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder().timeout(DEFAULT_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        })
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn post<B, T>(&self, path: &str, body: &B, subject: &str, expect_tip: &str) -> Result<T>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let request = self.authorize(self.client.post(self.url(path)).json(body));
        let response = request.send().await?;
        decode(response, subject, expect_tip).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response, subject: &str, expect_tip: &str) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<T>().await?);
    }

    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::CONFLICT => StoreError::Conflict {
            id: subject.to_string(),
            expected_tip: expect_tip.to_string(),
        },
        StatusCode::NOT_FOUND => StoreError::NotFound(subject.to_string()),
        _ => StoreError::Http {
            status: status.as_u16(),
            body,
        },
    })
}

#[async_trait]
impl EntityStore for HttpEntityStore {
    async fn upload_content(&self, text: &str, filename: Option<&str>) -> Result<String> {
        let body = UploadRequest { text, filename };
        let uploaded: ContentUploaded = self
            .post("/content", &body, filename.unwrap_or("content"), "")
            .await?;
        Ok(uploaded.cid)
    }

    async fn create_entity(&self, request: CreateEntity) -> Result<EntityVersion> {
        self.post("/entities", &request, "entity", "").await
    }

    async fn append_version(&self, request: AppendVersion) -> Result<EntityVersion> {
        let path = format!("/entities/{}/versions", request.id);
        self.post(&path, &request, &request.id, &request.expect_tip)
            .await
    }

    async fn get_tip(&self, id: &str) -> Result<String> {
        let request = self.authorize(self.client.get(self.url(&format!("/entities/{id}/tip"))));
        let response = request.send().await?;
        let tip: TipResponse = decode(response, id, "").await?;
        Ok(tip.tip)
    }

    async fn update_relations(&self, request: UpdateRelations) -> Result<RelationsUpdated> {
        self.post("/relations", &request, &request.parent_id, &request.expect_tip)
            .await
    }
}
