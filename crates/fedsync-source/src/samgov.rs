//! SAM.gov payload shapes and their mapping onto source-owned field sets.
//!
//! Each record is mapped on its own so that one bad record never sinks its page:
//! anything that fails to deserialize or validate becomes
//! [`ExternalRecord::Unparseable`] and is handled as a record-level error.

use chrono::NaiveDate;
use fedsync_core::{
    AwardFields, ExternalRecord, OpportunityFields, OrganizationFields, PlaceOfPerformance,
    SourceFields, SyncType,
};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OpportunityDto {
    pub notice_id: Option<String>,
    pub solicitation_number: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub department: Option<String>,
    pub sub_tier: Option<String>,
    pub office: Option<String>,
    pub posted_date: Option<String>,
    #[serde(rename = "responseDeadLine")]
    pub response_deadline: Option<String>,
    pub naics_code: Option<String>,
    pub set_aside: Option<String>,
    #[serde(rename = "type")]
    pub notice_type: Option<String>,
    pub place_of_performance: Option<PlaceDto>,
    pub classification_code: Option<String>,
    pub active: Option<String>,
    pub archive: Option<String>,
    pub additional_info_link: Option<String>,
    pub ui_link: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PlaceDto {
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
    pub country: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AwardDto {
    #[serde(alias = "piid")]
    pub contract_number: Option<String>,
    pub notice_id: Option<String>,
    pub title: Option<String>,
    pub awardee_name: Option<String>,
    pub awardee_uei: Option<String>,
    pub awardee_duns: Option<String>,
    pub award_date: Option<String>,
    #[serde(deserialize_with = "amount")]
    pub award_amount: Option<f64>,
    pub currency: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub department: Option<String>,
    pub awarding_office: Option<String>,
    pub award_type: Option<String>,
    pub naics_code: Option<String>,
    pub set_aside: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrganizationDto {
    #[serde(alias = "legalBusinessName")]
    pub name: Option<String>,
    #[serde(alias = "ueiSAM")]
    pub uei: Option<String>,
    pub cage_code: Option<String>,
    pub duns: Option<String>,
    pub sam_url: Option<String>,
    pub primary_naics: Option<String>,
    pub business_type: Option<String>,
    #[serde(deserialize_with = "flag")]
    pub is_small_business: bool,
    #[serde(deserialize_with = "flag")]
    pub is_woman_owned: bool,
    #[serde(deserialize_with = "flag")]
    pub is_veteran_owned: bool,
    #[serde(deserialize_with = "flag", rename = "is8aCertified")]
    pub is_8a_certified: bool,
    pub street_address: Option<String>,
    pub city: Option<String>,
    pub state_code: Option<String>,
    pub zip_code: Option<String>,
    pub country_code: Option<String>,
    pub website_url: Option<String>,
    pub phone: Option<String>,
}

// SAM.gov mixes JSON booleans with "Yes"/"No" strings.
fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bool(bool),
        Text(String),
    }
    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Bool(b)) => b,
        Some(Raw::Text(s)) => yes(Some(&s)),
        None => false,
    })
}

fn amount<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }
    match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Number(n)) => Ok(Some(n)),
        Some(Raw::Text(s)) if s.trim().is_empty() => Ok(None),
        Some(Raw::Text(s)) => s
            .trim()
            .replace(',', "")
            .parse()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid amount {s:?}"))),
        None => Ok(None),
    }
}

fn yes(value: Option<&str>) -> bool {
    value.is_some_and(|v| {
        let v = v.trim();
        v.eq_ignore_ascii_case("yes") || v.eq_ignore_ascii_case("true")
    })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Accepts `2024-01-15`, RFC 3339 timestamps (date part kept), and `01/15/2024`.
pub fn parse_date(field: &str, raw: Option<&str>) -> Result<Option<NaiveDate>, String> {
    let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
        return Ok(None);
    };
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(Some(date));
    }
    if let Some(prefix) = raw.get(..10) {
        if let Ok(date) = NaiveDate::parse_from_str(prefix, "%Y-%m-%d") {
            return Ok(Some(date));
        }
    }
    NaiveDate::parse_from_str(raw, "%m/%d/%Y")
        .map(Some)
        .map_err(|_| format!("{field}: unrecognized date {raw:?}"))
}

impl OpportunityDto {
    pub fn into_fields(self) -> Result<OpportunityFields, String> {
        let posted_date = parse_date("postedDate", self.posted_date.as_deref())?;
        let response_deadline = parse_date("responseDeadLine", self.response_deadline.as_deref())?;
        let solicitation_number = non_blank(self.solicitation_number);
        let notice_id = non_blank(self.notice_id).or_else(|| solicitation_number.clone());
        let place_of_performance = self.place_of_performance.map(|p| PlaceOfPerformance {
            city: non_blank(p.city),
            state: non_blank(p.state),
            zip: non_blank(p.zip),
            country: non_blank(p.country).or_else(|| Some("US".to_string())),
        });
        Ok(OpportunityFields {
            notice_id,
            solicitation_number,
            title: self.title.unwrap_or_default().trim().to_string(),
            notice_type: non_blank(self.notice_type).unwrap_or_else(|| "Unknown".to_string()),
            description: non_blank(self.description),
            department: non_blank(self.department),
            sub_tier: non_blank(self.sub_tier),
            office: non_blank(self.office),
            posted_date,
            response_deadline,
            naics_code: non_blank(self.naics_code),
            set_aside: non_blank(self.set_aside),
            classification_code: non_blank(self.classification_code),
            place_of_performance,
            ui_link: non_blank(self.ui_link),
            additional_info_link: non_blank(self.additional_info_link),
            archived: yes(self.archive.as_deref()),
            source_active: yes(self.active.as_deref()),
        })
    }
}

impl AwardDto {
    pub fn into_fields(self) -> Result<AwardFields, String> {
        Ok(AwardFields {
            award_date: parse_date("awardDate", self.award_date.as_deref())?,
            start_date: parse_date("startDate", self.start_date.as_deref())?,
            end_date: parse_date("endDate", self.end_date.as_deref())?,
            contract_number: non_blank(self.contract_number),
            notice_id: non_blank(self.notice_id),
            title: non_blank(self.title),
            awardee_name: non_blank(self.awardee_name),
            awardee_uei: non_blank(self.awardee_uei),
            awardee_duns: non_blank(self.awardee_duns),
            award_amount: self.award_amount,
            currency: non_blank(self.currency).or_else(|| Some("USD".to_string())),
            department: non_blank(self.department),
            awarding_office: non_blank(self.awarding_office),
            award_type: non_blank(self.award_type),
            naics_code: non_blank(self.naics_code),
            set_aside: non_blank(self.set_aside),
            description: non_blank(self.description),
        })
    }
}

impl OrganizationDto {
    pub fn into_fields(self) -> Result<OrganizationFields, String> {
        Ok(OrganizationFields {
            name: self.name.unwrap_or_default().trim().to_string(),
            uei: non_blank(self.uei),
            cage_code: non_blank(self.cage_code),
            duns: non_blank(self.duns),
            sam_url: non_blank(self.sam_url),
            primary_naics: non_blank(self.primary_naics),
            business_type: non_blank(self.business_type),
            is_small_business: self.is_small_business,
            is_woman_owned: self.is_woman_owned,
            is_veteran_owned: self.is_veteran_owned,
            is_8a_certified: self.is_8a_certified,
            street_address: non_blank(self.street_address),
            city: non_blank(self.city),
            state_code: non_blank(self.state_code),
            zip_code: non_blank(self.zip_code),
            country_code: non_blank(self.country_code),
            website_url: non_blank(self.website_url),
            phone: non_blank(self.phone),
        })
    }
}

fn key_hint(sync_type: SyncType, raw: &Value) -> Option<String> {
    let candidates: &[&str] = match sync_type {
        SyncType::Opportunities => &["noticeId", "solicitationNumber"],
        SyncType::Awards => &["contractNumber", "piid"],
        SyncType::Organizations => &["uei", "ueiSAM", "cageCode"],
    };
    candidates
        .iter()
        .filter_map(|k| raw.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .find(|v| !v.is_empty())
        .map(ToString::to_string)
}

fn map_fields(sync_type: SyncType, raw: Value) -> Result<SourceFields, String> {
    let decode_err = |err: serde_json::Error| format!("{sync_type} payload: {err}");
    let fields = match sync_type {
        SyncType::Opportunities => SourceFields::Opportunity(
            serde_json::from_value::<OpportunityDto>(raw)
                .map_err(decode_err)?
                .into_fields()?,
        ),
        SyncType::Awards => SourceFields::Award(
            serde_json::from_value::<AwardDto>(raw)
                .map_err(decode_err)?
                .into_fields()?,
        ),
        SyncType::Organizations => SourceFields::Organization(
            serde_json::from_value::<OrganizationDto>(raw)
                .map_err(decode_err)?
                .into_fields()?,
        ),
    };
    fields.validate().map_err(|err| err.to_string())?;
    Ok(fields)
}

/// Maps one raw JSON record. Never fails: bad input becomes `Unparseable`.
pub fn map_record(sync_type: SyncType, raw: Value) -> ExternalRecord {
    if !raw.is_object() {
        return ExternalRecord::Unparseable {
            key_hint: None,
            reason: format!("{sync_type} record is not a JSON object"),
        };
    }
    let hint = key_hint(sync_type, &raw);
    match map_fields(sync_type, raw) {
        Ok(fields) => ExternalRecord::Parsed(fields),
        Err(reason) => ExternalRecord::Unparseable {
            key_hint: hint,
            reason,
        },
    }
}

pub fn map_records(sync_type: SyncType, raw: Vec<Value>) -> Vec<ExternalRecord> {
    raw.into_iter().map(|r| map_record(sync_type, r)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parsed(record: ExternalRecord) -> SourceFields {
        match record {
            ExternalRecord::Parsed(fields) => fields,
            ExternalRecord::Unparseable { reason, .. } => panic!("unparseable: {reason}"),
        }
    }

    #[test]
    fn opportunity_mapping_applies_source_defaults() {
        let record = map_record(
            SyncType::Opportunities,
            json!({
                "solicitationNumber": "W912DY-24-R-0001",
                "title": "Facility maintenance",
                "postedDate": "2024-03-01",
                "responseDeadLine": "2024-04-01T17:00:00-04:00",
                "naicsCode": "561210",
                "placeOfPerformance": {"city": "Huntsville", "state": "AL"},
                "active": "Yes",
                "archive": "No",
                "pointOfContact": [{"fullName": "ignored"}]
            }),
        );
        let SourceFields::Opportunity(f) = parsed(record) else {
            panic!("expected opportunity");
        };
        assert_eq!(f.notice_id.as_deref(), Some("W912DY-24-R-0001"));
        assert_eq!(f.notice_type, "Unknown");
        assert_eq!(f.response_deadline, NaiveDate::from_ymd_opt(2024, 4, 1));
        assert_eq!(
            f.place_of_performance.unwrap().country.as_deref(),
            Some("US")
        );
        assert!(f.source_active);
        assert!(!f.archived);
    }

    #[test]
    fn bad_records_become_unparseable_with_a_key_hint() {
        let record = map_record(
            SyncType::Opportunities,
            json!({"noticeId": "abc123", "title": "x", "postedDate": "yesterday"}),
        );
        match record {
            ExternalRecord::Unparseable { key_hint, reason } => {
                assert_eq!(key_hint.as_deref(), Some("abc123"));
                assert!(reason.contains("postedDate"));
            }
            other => panic!("expected unparseable, got {other:?}"),
        }

        let missing_title = map_record(SyncType::Opportunities, json!({"noticeId": "abc124"}));
        assert!(matches!(missing_title, ExternalRecord::Unparseable { .. }));

        let not_object = map_record(SyncType::Awards, json!([1, 2, 3]));
        assert!(matches!(not_object, ExternalRecord::Unparseable { key_hint: None, .. }));
    }

    #[test]
    fn award_amounts_accept_numbers_and_strings() {
        let SourceFields::Award(a) = parsed(map_record(
            SyncType::Awards,
            json!({"piid": "GS-35F-0001", "awardAmount": "1,250,000.50", "awardDate": "03/15/2024"}),
        )) else {
            panic!("expected award");
        };
        assert_eq!(a.contract_number.as_deref(), Some("GS-35F-0001"));
        assert_eq!(a.award_amount, Some(1_250_000.5));
        assert_eq!(a.award_date, NaiveDate::from_ymd_opt(2024, 3, 15));
        assert_eq!(a.currency.as_deref(), Some("USD"));
    }

    #[test]
    fn organization_flags_accept_yes_no_strings() {
        let SourceFields::Organization(o) = parsed(map_record(
            SyncType::Organizations,
            json!({
                "legalBusinessName": "Acme Federal LLC",
                "ueiSAM": "ABCDEF123456",
                "cageCode": "1ABC2",
                "isSmallBusiness": "Yes",
                "isWomanOwned": false,
                "is8aCertified": true
            }),
        )) else {
            panic!("expected organization");
        };
        assert_eq!(o.uei.as_deref(), Some("ABCDEF123456"));
        assert!(o.is_small_business);
        assert!(!o.is_woman_owned);
        assert!(o.is_8a_certified);
    }
}
