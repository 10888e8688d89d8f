//! SoQL predicate construction for dataset sweeps.
//!
//! Every literal that reaches a predicate goes through [`escape_literal`].

use chrono::NaiveDate;

use crate::datasets::DatasetSpec;
use crate::domain::payload::JobPayload;

const COMPANY_SUFFIXES: [&str; 9] =
    ["INC", "LLC", "L L C", "CORP", "CORPORATION", "CO", "COMPANY", "LTD", "LIMITED"];
const MAX_CONTRACTOR_PATTERNS: usize = 3;

pub fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Upper-cased company name with punctuation and corporate suffixes removed.
pub fn normalize_company_name(name: &str) -> String {
    let replaced = collapse_whitespace(name).replace('&', " AND ");
    let cleaned: String = replaced
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '\'') { ch } else { ' ' })
        .collect();
    let mut upper = format!(" {} ", collapse_whitespace(&cleaned).to_ascii_uppercase());
    for suffix in COMPANY_SUFFIXES {
        let needle = format!(" {suffix} ");
        while upper.contains(&needle) {
            upper = upper.replace(&needle, " ");
        }
    }
    collapse_whitespace(&upper)
}

pub fn normalize_license(license: &str) -> Option<String> {
    let normalized: String = license.chars().filter(char::is_ascii_alphanumeric).collect();
    (!normalized.is_empty()).then_some(normalized)
}

/// Up to three `LIKE` wildcards for a free-text contractor name.
pub fn contractor_patterns(name: &str) -> Vec<String> {
    let normalized = normalize_company_name(name);
    if normalized.is_empty() {
        return Vec::new();
    }

    let tokens: Vec<&str> = normalized.split(' ').collect();
    let mut patterns = vec![format!("%{normalized}%")];
    if tokens.len() > 1 {
        patterns.push(format!("%{}%", tokens.join("%")));
        patterns.push(format!("{}%", tokens[0]));
    }
    patterns.dedup();
    patterns.truncate(MAX_CONTRACTOR_PATTERNS);
    patterns
}

#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    Eq { field: String, value: String },
    Prefix { field: String, value: String },
    Like { field: String, pattern: String },
    DateRange { field: String, from: Option<NaiveDate>, to: Option<NaiveDate> },
    WithinCircle { field: String, lat: f64, lon: f64, radius_meters: f64 },
    AnyOf(Vec<Predicate>),
}

impl Predicate {
    pub fn eq(field: &str, value: &str) -> Self {
        Self::Eq { field: field.to_string(), value: value.to_string() }
    }

    pub fn like(field: &str, pattern: &str) -> Self {
        Self::Like { field: field.to_string(), pattern: pattern.to_string() }
    }

    pub fn render(&self) -> Option<String> {
        match self {
            Self::Eq { field, value } => Some(format!("{field} = '{}'", escape_literal(value))),
            Self::Prefix { field, value } => {
                Some(format!("{field} like '{}%'", escape_literal(value)))
            }
            Self::Like { field, pattern } => {
                Some(format!("upper({field}) like '{}'", escape_literal(pattern)))
            }
            Self::DateRange { field, from, to } => {
                let mut bounds = Vec::new();
                if let Some(from) = from {
                    bounds.push(format!("{field} >= '{}T00:00:00'", from.format("%Y-%m-%d")));
                }
                if let Some(to) = to {
                    bounds.push(format!("{field} <= '{}T23:59:59'", to.format("%Y-%m-%d")));
                }
                (!bounds.is_empty()).then(|| bounds.join(" AND "))
            }
            Self::WithinCircle { field, lat, lon, radius_meters } => {
                Some(format!("within_circle({field}, {lat}, {lon}, {radius_meters})"))
            }
            Self::AnyOf(group) => {
                let rendered: Vec<String> = group.iter().filter_map(Predicate::render).collect();
                match rendered.len() {
                    0 => None,
                    1 => rendered.into_iter().next(),
                    _ => Some(format!("({})", rendered.join(" OR "))),
                }
            }
        }
    }
}

pub fn where_clause(predicates: &[Predicate]) -> Option<String> {
    let rendered: Vec<String> = predicates.iter().filter_map(Predicate::render).collect();
    (!rendered.is_empty()).then(|| rendered.join(" AND "))
}

/// Predicates for one dataset, or `None` when the dataset cannot honor a contractor filter.
pub fn dataset_predicates(spec: &DatasetSpec, payload: &JobPayload) -> Option<Vec<Predicate>> {
    let mut predicates = Vec::new();

    if let Some(location) = &payload.location {
        let equalities = [
            (spec.block_field, location.block.as_deref()),
            (spec.lot_field, location.lot.as_deref()),
            (spec.street_number_field, location.street_number.as_deref()),
            (spec.zip_field, location.zip.as_deref()),
        ];
        for (field, value) in equalities {
            if let (Some(field), Some(value)) = (field, value.map(str::trim)) {
                if !value.is_empty() {
                    predicates.push(Predicate::eq(field, value));
                }
            }
        }
        if let (Some(field), Some(street)) = (spec.street_name_field, location.street_name.as_deref()) {
            let street = collapse_whitespace(street).to_ascii_uppercase();
            if !street.is_empty() {
                predicates.push(Predicate::Prefix { field: format!("upper({field})"), value: street });
            }
        }
        if let (Some(field), Some(circle)) = (spec.geo_field, location.geo_circle.as_ref()) {
            predicates.push(Predicate::WithinCircle {
                field: field.to_string(),
                lat: circle.lat,
                lon: circle.lon,
                radius_meters: circle.radius_meters,
            });
        }
    }

    if let (Some(field), Some(range)) = (spec.date_field, payload.date_range.as_ref()) {
        predicates.push(Predicate::DateRange { field: field.to_string(), from: range.from, to: range.to });
    }

    let keywords: Vec<String> = payload
        .keywords
        .iter()
        .map(|keyword| collapse_whitespace(keyword).to_ascii_uppercase())
        .filter(|keyword| !keyword.is_empty())
        .collect();
    if !keywords.is_empty() && !spec.keyword_fields.is_empty() {
        let group = spec
            .keyword_fields
            .iter()
            .flat_map(|field| keywords.iter().map(move |keyword| Predicate::like(field, &format!("%{keyword}%"))))
            .collect();
        predicates.push(Predicate::AnyOf(group));
    }

    if !payload.contractors.is_empty() {
        if spec.contractor_name_fields.is_empty() && spec.contractor_license_fields.is_empty() {
            return None;
        }
        let mut group = Vec::new();
        for contractor in &payload.contractors {
            for pattern in contractor_patterns(&contractor.name) {
                for field in spec.contractor_name_fields {
                    group.push(Predicate::like(field, &pattern));
                }
            }
            if let Some(license) = contractor.license.as_deref().and_then(normalize_license) {
                for field in spec.contractor_license_fields {
                    group.push(Predicate::like(field, &format!("%{}%", license.to_ascii_uppercase())));
                }
            }
        }
        if group.is_empty() {
            return None;
        }
        predicates.push(Predicate::AnyOf(group));
    }

    Some(predicates)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SoqlQuery {
    pub where_clause: Option<String>,
    pub order: Option<String>,
    pub limit: u32,
    pub offset: u64,
}

impl SoqlQuery {
    pub fn for_dataset(spec: &DatasetSpec, predicates: &[Predicate], page_size: u32) -> Self {
        Self {
            where_clause: where_clause(predicates),
            order: spec.sort_key().map(str::to_string),
            limit: page_size.max(1),
            offset: 0,
        }
    }

    pub fn next_page(&self, fetched: u64) -> Self {
        Self { offset: self.offset + fetched, ..self.clone() }
    }

    pub fn with_limit(&self, limit: u32) -> Self {
        Self { limit: limit.max(1), ..self.clone() }
    }

    pub fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::with_capacity(4);
        if let Some(clause) = &self.where_clause {
            params.push(("$where", clause.clone()));
        }
        if let Some(order) = &self.order {
            params.push(("$order", order.clone()));
        }
        params.push(("$limit", self.limit.to_string()));
        params.push(("$offset", self.offset.to_string()));
        params
    }
}
