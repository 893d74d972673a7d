//! HTTP client for the external API

use crate::api::{endpoints, PipelineApi};
use crate::config::ApiConfig;
use crate::error::{PipelineError, PipelineResult};
use async_trait::async_trait;
use reqwest::{multipart, Client, RequestBuilder, Response};
use runstage_common::types::{Batch, Dataset, DatasetState, NewBatch};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, instrument};

/// reqwest-backed [`PipelineApi`]
#[derive(Clone)]
pub struct HttpPipelineApi {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpPipelineApi {
    pub fn new(config: &ApiConfig) -> PipelineResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> PipelineResult<Response> {
        let response = self.authorized(request).send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(response);
        }

        let message = response.text().await.unwrap_or_default();
        Err(PipelineError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> PipelineResult<T> {
        Ok(self.send(request).await?.json().await?)
    }
}

#[async_trait]
impl PipelineApi for HttpPipelineApi {
    #[instrument(skip(self))]
    async fn get_batch(&self, id: &str) -> PipelineResult<Batch> {
        self.send_json(self.client.get(endpoints::batch_url(&self.base_url, id)))
            .await
    }

    #[instrument(skip(self))]
    async fn get_dataset(&self, id: &str) -> PipelineResult<Dataset> {
        self.send_json(self.client.get(endpoints::dataset_url(&self.base_url, id)))
            .await
    }

    #[instrument(skip(self, fields))]
    async fn update_batch(&self, id: &str, fields: Value) -> PipelineResult<()> {
        debug!(fields = %fields, "Updating batch");
        self.send(
            self.client
                .patch(endpoints::batch_url(&self.base_url, id))
                .json(&fields),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn add_state_to_dataset(&self, id: &str, state: DatasetState) -> PipelineResult<()> {
        self.send(
            self.client
                .post(endpoints::dataset_states_url(&self.base_url, id))
                .json(&json!({ "state": state })),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn upload_report(&self, id: &str, report: &Path) -> PipelineResult<()> {
        let bytes = tokio::fs::read(report).await?;
        let file_name = report
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "report.html".to_string());

        let part = multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("text/html")?;
        let form = multipart::Form::new().part("report", part);

        self.send(
            self.client
                .put(endpoints::batch_report_url(&self.base_url, id))
                .multipart(form),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self, batch), fields(name = %batch.name))]
    async fn create_batch(&self, batch: &NewBatch) -> PipelineResult<Batch> {
        self.send_json(
            self.client
                .post(endpoints::batches_url(&self.base_url))
                .json(batch),
        )
        .await
    }

    #[instrument(skip(self))]
    async fn get_all_batches(&self) -> PipelineResult<Vec<Batch>> {
        self.send_json(self.client.get(endpoints::batches_url(&self.base_url)))
            .await
    }
}
