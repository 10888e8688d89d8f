//! Catalog of the open-data datasets the fetch worker knows how to query.

use serde_json::Value;

use crate::domain::payload::JobPayload;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DatasetSpec {
    pub key: &'static str,
    pub soda_id: &'static str,
    pub entity: &'static str,
    pub id_field: Option<&'static str>,
    pub date_field: Option<&'static str>,
    pub block_field: Option<&'static str>,
    pub lot_field: Option<&'static str>,
    pub street_number_field: Option<&'static str>,
    pub street_name_field: Option<&'static str>,
    pub zip_field: Option<&'static str>,
    pub geo_field: Option<&'static str>,
    pub contractor_name_fields: &'static [&'static str],
    pub contractor_license_fields: &'static [&'static str],
    pub keyword_fields: &'static [&'static str],
}

/// Fields probed, in order, for a row's canonical key.
const CANONICAL_KEY_FIELDS: [&str; 5] =
    ["permit_number", "parent_permit_number", "complaint_number", "addenda_number", "application_number"];

pub const CATALOG: [DatasetSpec; 6] = [
    DatasetSpec {
        key: "building",
        soda_id: "i98e-djp9",
        entity: "permit_building",
        id_field: Some("permit_number"),
        date_field: Some("filed_date"),
        block_field: Some("block"),
        lot_field: Some("lot"),
        street_number_field: Some("street_number"),
        street_name_field: Some("street_name"),
        zip_field: Some("zipcode"),
        geo_field: Some("location"),
        contractor_name_fields: &[],
        contractor_license_fields: &[],
        keyword_fields: &["description"],
    },
    DatasetSpec {
        key: "plumbing",
        soda_id: "k2ra-p3nq",
        entity: "permit_plumbing",
        id_field: Some("permit_number"),
        date_field: Some("filed_date"),
        block_field: Some("block"),
        lot_field: Some("lot"),
        street_number_field: Some("street_number"),
        street_name_field: Some("street_name"),
        zip_field: Some("zipcode"),
        geo_field: Some("location"),
        contractor_name_fields: &["plumbing_contractor_name"],
        contractor_license_fields: &["plumbing_contractor_license"],
        keyword_fields: &["description"],
    },
    DatasetSpec {
        key: "electrical",
        soda_id: "ftty-kx6y",
        entity: "permit_electrical",
        id_field: Some("permit_number"),
        date_field: Some("filed_date"),
        block_field: Some("block"),
        lot_field: Some("lot"),
        street_number_field: Some("street_number"),
        street_name_field: Some("street_name"),
        zip_field: Some("zipcode"),
        geo_field: Some("location"),
        contractor_name_fields: &["contractor_company_name"],
        contractor_license_fields: &["contractor_license"],
        keyword_fields: &["description"],
    },
    DatasetSpec {
        key: "addenda",
        soda_id: "87xy-gk8d",
        entity: "permit_addenda",
        id_field: Some("addenda_number"),
        date_field: Some("arrive"),
        block_field: Some("block"),
        lot_field: Some("lot"),
        street_number_field: Some("street_number"),
        street_name_field: Some("street_name"),
        zip_field: None,
        geo_field: None,
        contractor_name_fields: &[],
        contractor_license_fields: &[],
        keyword_fields: &["description", "title"],
    },
    DatasetSpec {
        key: "complaint",
        soda_id: "gm2e-bten",
        entity: "complaint",
        id_field: Some("complaint_number"),
        date_field: Some("date_filed"),
        block_field: Some("block"),
        lot_field: Some("lot"),
        street_number_field: Some("street_number"),
        street_name_field: Some("street_name"),
        zip_field: Some("zip_code"),
        geo_field: Some("location"),
        contractor_name_fields: &[],
        contractor_license_fields: &[],
        keyword_fields: &["complaint_description"],
    },
    DatasetSpec {
        key: "contractor_contacts",
        soda_id: "3pee-9qhc",
        entity: "contractor_contact",
        id_field: Some("application_number"),
        date_field: None,
        block_field: None,
        lot_field: None,
        street_number_field: None,
        street_name_field: None,
        zip_field: None,
        geo_field: None,
        contractor_name_fields: &["company_name"],
        contractor_license_fields: &["license_number"],
        keyword_fields: &[],
    },
];

pub const DEFAULT_SELECTION: [&str; 5] = ["building", "plumbing", "electrical", "addenda", "complaint"];

impl DatasetSpec {
    pub fn lookup(key: &str) -> Option<&'static DatasetSpec> {
        let key = key.trim().to_ascii_lowercase();
        CATALOG.iter().find(|spec| spec.key == key)
    }

    /// Deterministic paging order: identifier field, else date field, else none.
    pub fn sort_key(&self) -> Option<&'static str> {
        self.id_field.or(self.date_field)
    }

    pub fn canonical_key(&self, row: &Value) -> Option<String> {
        self.id_field
            .into_iter()
            .chain(CANONICAL_KEY_FIELDS)
            .find_map(|field| match row.get(field) {
                Some(Value::String(value)) if !value.trim().is_empty() => Some(value.trim().to_string()),
                Some(Value::Number(value)) => Some(value.to_string()),
                _ => None,
            })
    }
}

/// Datasets a payload sweeps, in catalog order, without duplicates.
pub fn select(payload: &JobPayload) -> Vec<&'static DatasetSpec> {
    let requested: Vec<String> = match &payload.permit_types {
        Some(types) if !types.is_empty() => {
            types.iter().map(|value| value.trim().to_ascii_lowercase()).collect()
        }
        _ => DEFAULT_SELECTION.iter().map(|key| key.to_string()).collect(),
    };

    CATALOG
        .iter()
        .filter(|spec| {
            requested.iter().any(|key| key == spec.key)
                || (spec.key == "contractor_contacts" && payload.include_contractor_contacts)
        })
        .collect()
}
