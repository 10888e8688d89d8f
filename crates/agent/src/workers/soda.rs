//! Socrata Open Data (SODA) client behind the [`DatasetSource`] seam.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::debug;

use dbi_core::config::SodaConfig;
use dbi_core::datasets::DatasetSpec;
use dbi_core::query::SoqlQuery;

use crate::errors::DatasetError;

/// One page of rows for a dataset query. Implementations never retry.
#[async_trait]
pub trait DatasetSource: Send + Sync {
    async fn fetch_page(&self, dataset: &DatasetSpec, query: &SoqlQuery) -> Result<Vec<Value>, DatasetError>;
}

pub struct SodaClient {
    client: Client,
    base_url: String,
    app_token: Option<SecretString>,
}

impl SodaClient {
    pub fn new(
        base_url: impl Into<String>,
        app_token: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, DatasetError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| DatasetError::Http(error.to_string()))?;
        Ok(Self { client, base_url: base_url.into(), app_token })
    }

    pub fn from_config(config: &SodaConfig) -> Result<Self, DatasetError> {
        Self::new(config.base_url.clone(), config.app_token.clone(), Duration::from_secs(config.timeout_secs))
    }

    pub(crate) fn resource_url(&self, dataset: &DatasetSpec) -> String {
        format!("{}/{}.json", self.base_url.trim_end_matches('/'), dataset.soda_id)
    }
}

#[async_trait]
impl DatasetSource for SodaClient {
    async fn fetch_page(&self, dataset: &DatasetSpec, query: &SoqlQuery) -> Result<Vec<Value>, DatasetError> {
        debug!(
            event_name = "soda.page.requested",
            dataset = dataset.key,
            offset = query.offset,
            limit = query.limit,
            "requesting dataset page"
        );

        let mut request = self.client.get(self.resource_url(dataset)).query(&query.params());
        if let Some(token) = &self.app_token {
            request = request.header("X-App-Token", token.expose_secret());
        }

        let response = request.send().await.map_err(|error| DatasetError::Http(error.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DatasetError::Status { dataset: dataset.key.to_string(), status: status.as_u16(), body });
        }

        let body: Value = response.json().await.map_err(|error| DatasetError::Decode {
            dataset: dataset.key.to_string(),
            message: error.to_string(),
        })?;
        match body {
            Value::Array(rows) => Ok(rows),
            other => Err(DatasetError::Decode {
                dataset: dataset.key.to_string(),
                message: format!("expected a json array, got {}", kind_of(&other)),
            }),
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use dbi_core::datasets::DatasetSpec;

    use super::{kind_of, SodaClient};

    #[test]
    fn resource_url_uses_the_socrata_id() {
        let client = SodaClient::new("https://data.sfgov.org/resource/", None, Duration::from_secs(5))
            .expect("client");
        let building = DatasetSpec::lookup("building").expect("building dataset");
        assert_eq!(client.resource_url(building), "https://data.sfgov.org/resource/i98e-djp9.json");
    }

    #[test]
    fn unexpected_bodies_are_described() {
        assert_eq!(kind_of(&json!({"error": true})), "an object");
        assert_eq!(kind_of(&json!(null)), "null");
    }
}
