use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::datasets::DatasetSpec;
use crate::errors::DomainError;

const MAX_PAGE_SIZE: u32 = 50_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    DataPull,
    Analyst,
    Insights,
    Anomalies,
    BulkAnalysis,
}

impl JobMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DataPull => "data_pull",
            Self::Analyst => "analyst",
            Self::Insights => "insights",
            Self::Anomalies => "anomalies",
            Self::BulkAnalysis => "bulk_analysis",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "data_pull" | "pull" => Some(Self::DataPull),
            "analyst" | "nl_analyst" => Some(Self::Analyst),
            "insights" => Some(Self::Insights),
            "anomalies" => Some(Self::Anomalies),
            "bulk_analysis" | "bulk" => Some(Self::BulkAnalysis),
            _ => None,
        }
    }
}

/// Worker categories the orchestrator can route to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    DataFetch,
    Insights,
    Analyst,
}

impl WorkerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DataFetch => "data_fetch",
            Self::Insights => "insights",
            Self::Analyst => "analyst",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoCircle {
    pub lat: f64,
    pub lon: f64,
    pub radius_meters: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LocationFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lot: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub street_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub street_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geo_circle: Option<GeoCircle>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DateRange {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<NaiveDate>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContractorFilter {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobPayload {
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permit_types: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<LocationFilter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_range: Option<DateRange>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub contractors: Vec<ContractorFilter>,
    pub include_insights: bool,
    pub include_anomalies: bool,
    pub include_contractor_contacts: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_size: Option<u32>,
}

impl Default for JobPayload {
    fn default() -> Self {
        Self {
            mode: JobMode::DataPull.as_str().to_string(),
            query: None,
            permit_types: None,
            location: None,
            date_range: None,
            keywords: Vec::new(),
            contractors: Vec::new(),
            include_insights: false,
            include_anomalies: false,
            include_contractor_contacts: false,
            page_size: None,
        }
    }
}

impl JobPayload {
    pub fn job_mode(&self) -> Result<JobMode, DomainError> {
        JobMode::parse(&self.mode)
            .ok_or_else(|| DomainError::InvalidPayload(format!("unknown mode `{}`", self.mode)))
    }

    pub fn with_mode(mut self, mode: JobMode) -> Self {
        self.mode = mode.as_str().to_string();
        self
    }

    /// Checks every field the workers rely on and returns the parsed mode.
    pub fn validate(&self) -> Result<JobMode, DomainError> {
        let mode = self.job_mode()?;

        if let Some(permit_types) = &self.permit_types {
            for permit_type in permit_types {
                if DatasetSpec::lookup(permit_type).is_none() {
                    return Err(DomainError::InvalidPayload(format!(
                        "unknown permit type `{permit_type}`"
                    )));
                }
            }
        }

        if let Some(DateRange { from: Some(from), to: Some(to) }) = &self.date_range {
            if from > to {
                return Err(DomainError::InvalidPayload(format!(
                    "date range starts after it ends ({from} > {to})"
                )));
            }
        }

        if let Some(circle) = self.location.as_ref().and_then(|location| location.geo_circle.as_ref()) {
            validate_geo_circle(circle)?;
        }

        match self.page_size {
            Some(0) => {
                return Err(DomainError::InvalidPayload("pageSize must be at least 1".to_string()))
            }
            Some(size) if size > MAX_PAGE_SIZE => {
                return Err(DomainError::InvalidPayload(format!(
                    "pageSize must be at most {MAX_PAGE_SIZE}"
                )))
            }
            _ => {}
        }

        if mode == JobMode::Analyst && self.query_text().is_none() {
            return Err(DomainError::InvalidPayload("analyst mode requires a query".to_string()));
        }

        for contractor in &self.contractors {
            if contractor.name.trim().is_empty()
                && contractor.license.as_deref().map_or(true, |license| license.trim().is_empty())
            {
                return Err(DomainError::InvalidPayload(
                    "contractor filter needs a name or a license".to_string(),
                ));
            }
        }

        Ok(mode)
    }

    /// Worker chain for this payload, in execution order.
    pub fn route(&self) -> Result<Vec<WorkerKind>, DomainError> {
        let mode = self.validate()?;
        let chain = match mode {
            JobMode::Analyst => vec![WorkerKind::Analyst],
            JobMode::Insights | JobMode::Anomalies | JobMode::BulkAnalysis => {
                vec![WorkerKind::DataFetch, WorkerKind::Insights]
            }
            JobMode::DataPull if self.include_insights || self.include_anomalies => {
                vec![WorkerKind::DataFetch, WorkerKind::Insights]
            }
            JobMode::DataPull => vec![WorkerKind::DataFetch],
        };
        Ok(chain)
    }

    pub fn wants_anomalies(&self) -> bool {
        self.include_anomalies || matches!(self.job_mode(), Ok(JobMode::Anomalies))
    }

    pub fn query_text(&self) -> Option<&str> {
        self.query.as_deref().map(str::trim).filter(|query| !query.is_empty())
    }
}

fn validate_geo_circle(circle: &GeoCircle) -> Result<(), DomainError> {
    if !(-90.0..=90.0).contains(&circle.lat) {
        return Err(DomainError::InvalidPayload(format!("latitude {} out of range", circle.lat)));
    }
    if !(-180.0..=180.0).contains(&circle.lon) {
        return Err(DomainError::InvalidPayload(format!("longitude {} out of range", circle.lon)));
    }
    if !circle.radius_meters.is_finite() || circle.radius_meters <= 0.0 {
        return Err(DomainError::InvalidPayload(format!(
            "radiusMeters must be positive, got {}",
            circle.radius_meters
        )));
    }
    Ok(())
}
