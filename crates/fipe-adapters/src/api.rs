use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use fipe_core::{
    Brand, CatalogItem, Model, NewReferencePeriod, ReferencePeriod, VehicleType, YearFuel,
};
use reqwest::header::{HeaderMap, HeaderValue, REFERER};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};

use crate::{CatalogSource, RetryPolicy, SourceError};

#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for ApiClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://veiculos.fipe.org.br/".to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {endpoint}")]
    HttpStatus { status: u16, endpoint: String },
    #[error("unexpected payload from {endpoint}: {detail}")]
    Shape { endpoint: String, detail: String },
}

impl ApiError {
    pub fn is_data_shape(&self) -> bool {
        matches!(self, ApiError::Shape { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Deserialize)]
struct LabelValue {
    #[serde(rename = "Label")]
    label: String,
    #[serde(rename = "Value")]
    value: JsonValue,
}

#[derive(Debug, Deserialize)]
struct PeriodEntry {
    #[serde(rename = "Codigo")]
    code: i32,
    #[serde(rename = "Mes")]
    label: String,
}

/// `ConsultarModelos` wraps the list in `{ "Modelos": [...], "Anos": [...] }`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ModelsPayload {
    Wrapped {
        #[serde(rename = "Modelos")]
        models: Vec<LabelValue>,
    },
    Flat(Vec<LabelValue>),
}

impl ModelsPayload {
    fn into_entries(self) -> Vec<LabelValue> {
        match self {
            ModelsPayload::Wrapped { models } => models,
            ModelsPayload::Flat(models) => models,
        }
    }
}

/// Values arrive as numbers or numeric strings depending on the endpoint.
fn numeric_value(value: &JsonValue) -> Option<i32> {
    match value {
        JsonValue::Number(n) => n.as_i64().and_then(|n| i32::try_from(n).ok()),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn into_items(endpoint: &str, entries: Vec<LabelValue>) -> Result<Vec<CatalogItem>, ApiError> {
    entries
        .into_iter()
        .filter(|e| !e.label.trim().is_empty())
        .map(|e| -> Result<CatalogItem, ApiError> {
            let external_id = numeric_value(&e.value).ok_or_else(|| ApiError::Shape {
                endpoint: endpoint.to_string(),
                detail: format!("non-numeric value {} for `{}`", e.value, e.label),
            })?;
            Ok(CatalogItem::new(e.label.trim(), external_id))
        })
        .collect()
}

/// [`CatalogSource`] backed by the site's JSON endpoints.
#[derive(Debug)]
pub struct ApiCatalog {
    client: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
    period_codes: Mutex<HashMap<String, i32>>,
}

impl ApiCatalog {
    pub fn new(config: ApiClientConfig) -> anyhow::Result<Self> {
        let base_url = if config.base_url.ends_with('/') {
            config.base_url.clone()
        } else {
            format!("{}/", config.base_url)
        };

        let mut headers = HeaderMap::new();
        headers.insert(
            REFERER,
            HeaderValue::from_str(&base_url).context("base url is not a valid header value")?,
        );

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            base_url,
            retry: config.retry,
            period_codes: Mutex::new(HashMap::new()),
        })
    }

    fn endpoint_url(&self, endpoint: &str) -> String {
        format!("{}api/veiculos/{}", self.base_url, endpoint)
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        payload: &JsonValue,
    ) -> Result<T, ApiError> {
        let url = self.endpoint_url(endpoint);
        let attempts = self.retry.attempts();
        let span = info_span!("fipe_api", endpoint);

        async move {
            let mut attempt = 0;
            loop {
                attempt += 1;
                let may_retry = attempt < attempts;
                match self.client.post(&url).json(payload).send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        if status.is_success() {
                            let body = match resp.bytes().await {
                                Ok(body) => body,
                                Err(err) => return Err(ApiError::Request(err)),
                            };
                            return serde_json::from_slice(&body).map_err(|err| ApiError::Shape {
                                endpoint: endpoint.to_string(),
                                detail: err.to_string(),
                            });
                        }
                        if classify_status(status) == RetryDisposition::Retryable && may_retry {
                            warn!(attempt, status = status.as_u16(), "retryable status");
                            tokio::time::sleep(self.retry.delay).await;
                            continue;
                        }
                        return Err(ApiError::HttpStatus {
                            status: status.as_u16(),
                            endpoint: endpoint.to_string(),
                        });
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable && may_retry {
                            warn!(attempt, error = %err, "request failed, retrying");
                            tokio::time::sleep(self.retry.delay).await;
                            continue;
                        }
                        return Err(ApiError::Request(err));
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn fetch_periods(&self) -> Result<Vec<NewReferencePeriod>, SourceError> {
        let entries: Vec<PeriodEntry> = self
            .post_json("ConsultarTabelaDeReferencia", &json!({}))
            .await?;
        let periods = entries
            .into_iter()
            .map(|e| -> Result<NewReferencePeriod, SourceError> {
                Ok(NewReferencePeriod::parse_label(&e.label)?.with_catalog_code(e.code))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut codes = self.period_codes.lock().await;
        for period in &periods {
            if let Some(code) = period.catalog_code {
                codes.insert(period.label.clone(), code);
            }
        }
        Ok(periods)
    }

    /// Periods seeded statically carry no code; resolve them by label.
    async fn period_code(&self, period: &ReferencePeriod) -> Result<i32, SourceError> {
        if let Some(code) = period.catalog_code {
            return Ok(code);
        }
        if let Some(code) = self.period_codes.lock().await.get(&period.label) {
            return Ok(*code);
        }
        debug!(label = %period.label, "resolving period code");
        self.fetch_periods().await?;
        self.period_codes
            .lock()
            .await
            .get(&period.label)
            .copied()
            .ok_or_else(|| SourceError::UnknownPeriod(period.label.clone()))
    }
}

#[async_trait]
impl CatalogSource for ApiCatalog {
    fn name(&self) -> &'static str {
        "api"
    }

    async fn reference_periods(&self) -> Result<Vec<NewReferencePeriod>, SourceError> {
        self.fetch_periods().await
    }

    async fn brands(
        &self,
        vehicle_type: VehicleType,
        period: &ReferencePeriod,
    ) -> Result<Vec<CatalogItem>, SourceError> {
        let payload = json!({
            "codigoTabelaReferencia": self.period_code(period).await?,
            "codigoTipoVeiculo": vehicle_type.catalog_code(),
        });
        let entries: Vec<LabelValue> = self.post_json("ConsultarMarcas", &payload).await?;
        Ok(into_items("ConsultarMarcas", entries)?)
    }

    async fn models(
        &self,
        vehicle_type: VehicleType,
        period: &ReferencePeriod,
        brand: &Brand,
    ) -> Result<Vec<CatalogItem>, SourceError> {
        let payload = json!({
            "codigoTabelaReferencia": self.period_code(period).await?,
            "codigoTipoVeiculo": vehicle_type.catalog_code(),
            "codigoMarca": brand.external_id,
        });
        let models: ModelsPayload = self.post_json("ConsultarModelos", &payload).await?;
        Ok(into_items("ConsultarModelos", models.into_entries())?)
    }

    async fn year_variants(
        &self,
        vehicle_type: VehicleType,
        period: &ReferencePeriod,
        brand: &Brand,
        model: &Model,
    ) -> Result<Vec<YearFuel>, SourceError> {
        let model_code = model
            .external_id
            .ok_or_else(|| SourceError::MissingModelId(model.name.clone()))?;
        let payload = json!({
            "codigoTabelaReferencia": self.period_code(period).await?,
            "codigoTipoVeiculo": vehicle_type.catalog_code(),
            "codigoMarca": brand.external_id,
            "codigoModelo": model_code,
        });
        let entries: Vec<LabelValue> = self.post_json("ConsultarAnoModelo", &payload).await?;
        Ok(entries
            .iter()
            .filter_map(|e| YearFuel::parse_label(&e.label))
            .collect())
    }
}
