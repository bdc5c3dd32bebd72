//! Source-owned field sets. These are the only columns the pipeline may write.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::SyncType;

/// Natural keys of an entity. For organizations `primary` is the UEI and
/// `secondary` the CAGE code; other types only use `primary`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct EntityKeys {
    pub primary: Option<String>,
    pub secondary: Option<String>,
}

impl EntityKeys {
    pub fn new(primary: Option<&str>, secondary: Option<&str>) -> Self {
        Self {
            primary: normalize_key(primary),
            secondary: normalize_key(secondary),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.primary.is_none() && self.secondary.is_none()
    }

    pub fn label(&self) -> Option<String> {
        match (&self.primary, &self.secondary) {
            (Some(p), _) => Some(p.clone()),
            (None, Some(s)) => Some(s.clone()),
            (None, None) => None,
        }
    }
}

// Keys are matched exactly; only surrounding whitespace is dropped.
fn normalize_key(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PlaceOfPerformance {
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
    pub country: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OpportunityFields {
    pub notice_id: Option<String>,
    pub solicitation_number: Option<String>,
    pub title: String,
    pub notice_type: String,
    pub description: Option<String>,
    pub department: Option<String>,
    pub sub_tier: Option<String>,
    pub office: Option<String>,
    pub posted_date: Option<NaiveDate>,
    pub response_deadline: Option<NaiveDate>,
    pub naics_code: Option<String>,
    pub set_aside: Option<String>,
    pub classification_code: Option<String>,
    pub place_of_performance: Option<PlaceOfPerformance>,
    pub ui_link: Option<String>,
    pub additional_info_link: Option<String>,
    pub archived: bool,
    pub source_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AwardFields {
    pub contract_number: Option<String>,
    pub notice_id: Option<String>,
    pub title: Option<String>,
    pub awardee_name: Option<String>,
    pub awardee_uei: Option<String>,
    pub awardee_duns: Option<String>,
    pub award_date: Option<NaiveDate>,
    pub award_amount: Option<f64>,
    pub currency: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub department: Option<String>,
    pub awarding_office: Option<String>,
    pub award_type: Option<String>,
    pub naics_code: Option<String>,
    pub set_aside: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OrganizationFields {
    pub name: String,
    pub uei: Option<String>,
    pub cage_code: Option<String>,
    pub duns: Option<String>,
    pub sam_url: Option<String>,
    pub primary_naics: Option<String>,
    pub business_type: Option<String>,
    pub is_small_business: bool,
    pub is_woman_owned: bool,
    pub is_veteran_owned: bool,
    pub is_8a_certified: bool,
    pub street_address: Option<String>,
    pub city: Option<String>,
    pub state_code: Option<String>,
    pub zip_code: Option<String>,
    pub country_code: Option<String>,
    pub website_url: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceFields {
    Opportunity(OpportunityFields),
    Award(AwardFields),
    Organization(OrganizationFields),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` exceeds {max} characters")]
    TooLong { field: &'static str, max: usize },
    #[error("field `{field}` is invalid: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum DiffError {
    #[error("cannot diff {existing} fields against {incoming} fields")]
    TypeMismatch {
        existing: SyncType,
        incoming: SyncType,
    },
    #[error("serializing fields: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One changed source-owned field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    pub field: String,
    pub before: Value,
    pub after: Value,
}

impl SourceFields {
    pub fn sync_type(&self) -> SyncType {
        match self {
            SourceFields::Opportunity(_) => SyncType::Opportunities,
            SourceFields::Award(_) => SyncType::Awards,
            SourceFields::Organization(_) => SyncType::Organizations,
        }
    }

    pub fn keys(&self) -> EntityKeys {
        match self {
            SourceFields::Opportunity(f) => EntityKeys::new(f.notice_id.as_deref(), None),
            SourceFields::Award(f) => EntityKeys::new(f.contract_number.as_deref(), None),
            SourceFields::Organization(f) => {
                EntityKeys::new(f.uei.as_deref(), f.cage_code.as_deref())
            }
        }
    }

    /// Flat JSON object of the inner field set, as stored in the entity tables.
    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        match self {
            SourceFields::Opportunity(f) => serde_json::to_value(f),
            SourceFields::Award(f) => serde_json::to_value(f),
            SourceFields::Organization(f) => serde_json::to_value(f),
        }
    }

    pub fn from_json(sync_type: SyncType, value: Value) -> Result<Self, serde_json::Error> {
        Ok(match sync_type {
            SyncType::Opportunities => SourceFields::Opportunity(serde_json::from_value(value)?),
            SyncType::Awards => SourceFields::Award(serde_json::from_value(value)?),
            SyncType::Organizations => SourceFields::Organization(serde_json::from_value(value)?),
        })
    }

    /// Column-level constraints, mirroring the widths the entity schema enforces.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            SourceFields::Opportunity(f) => {
                if f.title.trim().is_empty() {
                    return Err(ValidationError::MissingField("title"));
                }
                max_len("notice_id", f.notice_id.as_deref(), 255)?;
                max_len("solicitation_number", f.solicitation_number.as_deref(), 255)?;
                max_len("notice_type", Some(&f.notice_type), 50)?;
                naics("naics_code", f.naics_code.as_deref())?;
                max_len("classification_code", f.classification_code.as_deref(), 10)?;
                max_len("set_aside", f.set_aside.as_deref(), 100)?;
                if let Some(pop) = &f.place_of_performance {
                    max_len("place_of_performance.state", pop.state.as_deref(), 2)?;
                    max_len("place_of_performance.zip", pop.zip.as_deref(), 10)?;
                    max_len("place_of_performance.country", pop.country.as_deref(), 2)?;
                }
                Ok(())
            }
            SourceFields::Award(f) => {
                max_len("contract_number", f.contract_number.as_deref(), 255)?;
                max_len("awardee_uei", f.awardee_uei.as_deref(), 12)?;
                max_len("awardee_duns", f.awardee_duns.as_deref(), 9)?;
                max_len("currency", f.currency.as_deref(), 3)?;
                naics("naics_code", f.naics_code.as_deref())?;
                if let Some(amount) = f.award_amount {
                    if !amount.is_finite() || amount < 0.0 {
                        return Err(ValidationError::Invalid {
                            field: "award_amount",
                            reason: format!("{amount} is not a non-negative amount"),
                        });
                    }
                }
                if let (Some(start), Some(end)) = (f.start_date, f.end_date) {
                    if end < start {
                        return Err(ValidationError::Invalid {
                            field: "end_date",
                            reason: format!("{end} precedes start_date {start}"),
                        });
                    }
                }
                Ok(())
            }
            SourceFields::Organization(f) => {
                if f.name.trim().is_empty() {
                    return Err(ValidationError::MissingField("name"));
                }
                max_len("name", Some(&f.name), 500)?;
                max_len("uei", f.uei.as_deref(), 12)?;
                max_len("cage_code", f.cage_code.as_deref(), 5)?;
                max_len("duns", f.duns.as_deref(), 9)?;
                naics("primary_naics", f.primary_naics.as_deref())?;
                max_len("state_code", f.state_code.as_deref(), 2)?;
                max_len("country_code", f.country_code.as_deref(), 2)?;
                max_len("phone", f.phone.as_deref(), 20)?;
                Ok(())
            }
        }
    }
}

fn max_len(field: &'static str, value: Option<&str>, max: usize) -> Result<(), ValidationError> {
    match value {
        Some(v) if v.chars().count() > max => Err(ValidationError::TooLong { field, max }),
        _ => Ok(()),
    }
}

fn naics(field: &'static str, value: Option<&str>) -> Result<(), ValidationError> {
    max_len(field, value, 6)?;
    match value {
        Some(v) if !v.chars().all(|c| c.is_ascii_digit()) => Err(ValidationError::Invalid {
            field,
            reason: format!("`{v}` is not a numeric NAICS code"),
        }),
        _ => Ok(()),
    }
}

/// Field-level diff between the stored and incoming source-owned fields.
///
/// Returns the changed top-level fields in name order; an empty result means
/// the incoming record carries nothing new.
pub fn diff_fields(
    existing: &SourceFields,
    incoming: &SourceFields,
) -> Result<Vec<FieldChange>, DiffError> {
    if existing.sync_type() != incoming.sync_type() {
        return Err(DiffError::TypeMismatch {
            existing: existing.sync_type(),
            incoming: incoming.sync_type(),
        });
    }
    let before = as_object(existing.to_json()?);
    let after = as_object(incoming.to_json()?);

    let names: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
    let mut changes = Vec::new();
    for name in names {
        let old = before.get(name).unwrap_or(&Value::Null);
        let new = after.get(name).unwrap_or(&Value::Null);
        if old != new {
            changes.push(FieldChange {
                field: name.clone(),
                before: old.clone(),
                after: new.clone(),
            });
        }
    }
    Ok(changes)
}

fn as_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opportunity(notice_id: &str, title: &str) -> OpportunityFields {
        OpportunityFields {
            notice_id: Some(notice_id.to_string()),
            title: title.to_string(),
            notice_type: "Solicitation".to_string(),
            source_active: true,
            ..Default::default()
        }
    }

    #[test]
    fn identical_fields_have_empty_diff() {
        let a = SourceFields::Opportunity(opportunity("N-1", "Cloud hosting"));
        let b = a.clone();
        assert!(diff_fields(&a, &b).unwrap().is_empty());
    }

    #[test]
    fn diff_reports_only_changed_fields() {
        let a = SourceFields::Opportunity(opportunity("N-1", "Cloud hosting"));
        let mut changed = opportunity("N-1", "Cloud hosting services");
        changed.naics_code = Some("541512".into());
        let b = SourceFields::Opportunity(changed);

        let diff = diff_fields(&a, &b).unwrap();
        let names: Vec<_> = diff.iter().map(|c| c.field.as_str()).collect();
        assert_eq!(names, vec!["naics_code", "title"]);
        assert_eq!(diff[1].after, Value::String("Cloud hosting services".into()));
    }

    #[test]
    fn diff_rejects_mismatched_types() {
        let a = SourceFields::Opportunity(opportunity("N-1", "x"));
        let b = SourceFields::Award(AwardFields::default());
        assert!(matches!(
            diff_fields(&a, &b),
            Err(DiffError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn keys_are_trimmed_but_case_sensitive() {
        let keys = EntityKeys::new(Some("  abc123 "), Some(""));
        assert_eq!(keys.primary.as_deref(), Some("abc123"));
        assert!(keys.secondary.is_none());
        assert_ne!(EntityKeys::new(Some("ABC"), None), EntityKeys::new(Some("abc"), None));
    }

    #[test]
    fn organization_keys_use_uei_then_cage() {
        let org = SourceFields::Organization(OrganizationFields {
            name: "Acme".into(),
            cage_code: Some("1ABC2".into()),
            ..Default::default()
        });
        let keys = org.keys();
        assert!(keys.primary.is_none());
        assert_eq!(keys.label().as_deref(), Some("1ABC2"));
    }

    #[test]
    fn validation_catches_constraint_violations() {
        let missing_title = SourceFields::Opportunity(opportunity("N-1", "  "));
        assert_eq!(
            missing_title.validate(),
            Err(ValidationError::MissingField("title"))
        );

        let mut bad_naics = opportunity("N-2", "ok");
        bad_naics.naics_code = Some("54A512".into());
        assert!(matches!(
            SourceFields::Opportunity(bad_naics).validate(),
            Err(ValidationError::Invalid { field: "naics_code", .. })
        ));

        let negative = SourceFields::Award(AwardFields {
            contract_number: Some("C-1".into()),
            award_amount: Some(-5.0),
            ..Default::default()
        });
        assert!(negative.validate().is_err());
    }

    #[test]
    fn json_round_trip_preserves_fields() {
        let fields = SourceFields::Opportunity(opportunity("N-9", "Roundtrip"));
        let json = fields.to_json().unwrap();
        assert_eq!(json["notice_id"], "N-9");
        let back = SourceFields::from_json(SyncType::Opportunities, json).unwrap();
        assert_eq!(back, fields);
    }
}
