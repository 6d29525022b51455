use std::collections::{BTreeSet, HashSet};

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};

// ---------------------------------------------------------------------------
// Identifiers and limits
// ---------------------------------------------------------------------------

pub type BatchId = u64;
pub type CitizenId = u64;

/// Wire format of `birth_date`, e.g. `26.12.1986`.
pub const BIRTH_DATE_FORMAT: &str = "%d.%m.%Y";
pub const MAX_TEXT_LEN: usize = 256;

// ---------------------------------------------------------------------------
// Core domain types
// ---------------------------------------------------------------------------

/// One person record inside a batch. `relatives` holds ids of other citizens
/// in the same batch; the relation is kept symmetric by the graph guard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citizen {
    pub citizen_id: CitizenId,
    pub name: String,
    #[serde(with = "birth_date")]
    pub birth_date: NaiveDate,
    pub town: String,
    pub relatives: BTreeSet<CitizenId>,
}

impl Citizen {
    pub fn new(
        citizen_id: CitizenId,
        name: &str,
        birth_date: NaiveDate,
        town: &str,
        relatives: impl IntoIterator<Item = CitizenId>,
    ) -> Self {
        Self {
            citizen_id,
            name: name.to_string(),
            birth_date,
            town: town.to_string(),
            relatives: relatives.into_iter().collect(),
        }
    }
}

/// Field-level change to a single citizen. `None` leaves the field as is.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CitizenPatch {
    pub name: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub town: Option<String>,
    pub relatives: Option<BTreeSet<CitizenId>>,
}

impl CitizenPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.birth_date.is_none()
            && self.town.is_none()
            && self.relatives.is_none()
    }

    /// Applies every scalar field. Relatives are left to the graph guard,
    /// which also has to touch the other side of each edge.
    pub fn apply_scalar_fields(&self, citizen: &mut Citizen) {
        if let Some(name) = &self.name {
            citizen.name = name.clone();
        }
        if let Some(birth_date) = self.birth_date {
            citizen.birth_date = birth_date;
        }
        if let Some(town) = &self.town {
            citizen.town = town.clone();
        }
    }
}

// ---------------------------------------------------------------------------
// Wire payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CitizenPayload {
    pub citizen_id: CitizenId,
    pub name: String,
    pub birth_date: String,
    pub town: String,
    pub relatives: Vec<CitizenId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImportPayload {
    pub citizens: Vec<CitizenPayload>,
}

/// Every field may be omitted, but none may be `null`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CitizenPatchPayload {
    #[serde(default, deserialize_with = "non_null")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "non_null")]
    pub birth_date: Option<String>,
    #[serde(default, deserialize_with = "non_null")]
    pub town: Option<String>,
    #[serde(default, deserialize_with = "non_null")]
    pub relatives: Option<Vec<CitizenId>>,
}

fn non_null<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("import must contain at least one citizen")]
    EmptyImport,
    #[error("patch must set at least one field")]
    EmptyPatch,
    #[error("field `{0}` must not be empty")]
    MissingField(&'static str),
    #[error("field `{field}` exceeds {max} characters")]
    TooLong { field: &'static str, max: usize },
    #[error("birth_date `{0}` is not a valid DD.MM.YYYY date")]
    InvalidDate(String),
    #[error("birth_date `{0}` is in the future")]
    FutureDate(String),
    #[error("citizen_id {0} appears more than once")]
    DuplicateCitizen(CitizenId),
    #[error("relative {relative_id} is listed more than once by citizen {citizen_id}")]
    DuplicateRelative {
        citizen_id: CitizenId,
        relative_id: CitizenId,
    },
}

pub fn parse_birth_date(raw: &str, today: NaiveDate) -> Result<NaiveDate, ValidationError> {
    let raw = raw.trim();
    // chrono accepts single-digit day/month for %d/%m; the wire format is fixed-width.
    if raw.len() != 10 {
        return Err(ValidationError::InvalidDate(raw.to_string()));
    }
    let date = NaiveDate::parse_from_str(raw, BIRTH_DATE_FORMAT)
        .map_err(|_| ValidationError::InvalidDate(raw.to_string()))?;
    if date > today {
        return Err(ValidationError::FutureDate(raw.to_string()));
    }
    Ok(date)
}

pub fn validate_text(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::MissingField(field));
    }
    if value.chars().count() > MAX_TEXT_LEN {
        return Err(ValidationError::TooLong {
            field,
            max: MAX_TEXT_LEN,
        });
    }
    Ok(())
}

fn collect_relatives(
    citizen_id: CitizenId,
    relatives: &[CitizenId],
) -> Result<BTreeSet<CitizenId>, ValidationError> {
    let mut out = BTreeSet::new();
    for relative_id in relatives {
        if !out.insert(*relative_id) {
            return Err(ValidationError::DuplicateRelative {
                citizen_id,
                relative_id: *relative_id,
            });
        }
    }
    Ok(out)
}

pub fn validate_citizen(
    payload: CitizenPayload,
    today: NaiveDate,
) -> Result<Citizen, ValidationError> {
    validate_text("name", &payload.name)?;
    validate_text("town", &payload.town)?;
    let birth_date = parse_birth_date(&payload.birth_date, today)?;
    let relatives = collect_relatives(payload.citizen_id, &payload.relatives)?;
    Ok(Citizen {
        citizen_id: payload.citizen_id,
        name: payload.name,
        birth_date,
        town: payload.town,
        relatives,
    })
}

/// Validates field-level rules for a whole import. Referential integrity and
/// symmetry of the relatives graph are checked later by the graph guard.
pub fn validate_import(
    payloads: Vec<CitizenPayload>,
    today: NaiveDate,
) -> Result<Vec<Citizen>, ValidationError> {
    if payloads.is_empty() {
        return Err(ValidationError::EmptyImport);
    }
    let mut seen = HashSet::with_capacity(payloads.len());
    let mut citizens = Vec::with_capacity(payloads.len());
    for payload in payloads {
        if !seen.insert(payload.citizen_id) {
            return Err(ValidationError::DuplicateCitizen(payload.citizen_id));
        }
        citizens.push(validate_citizen(payload, today)?);
    }
    Ok(citizens)
}

pub fn validate_patch(
    citizen_id: CitizenId,
    payload: CitizenPatchPayload,
    today: NaiveDate,
) -> Result<CitizenPatch, ValidationError> {
    if let Some(name) = &payload.name {
        validate_text("name", name)?;
    }
    if let Some(town) = &payload.town {
        validate_text("town", town)?;
    }
    let birth_date = payload
        .birth_date
        .as_deref()
        .map(|raw| parse_birth_date(raw, today))
        .transpose()?;
    let relatives = payload
        .relatives
        .as_deref()
        .map(|relatives| collect_relatives(citizen_id, relatives))
        .transpose()?;
    let patch = CitizenPatch {
        name: payload.name,
        birth_date,
        town: payload.town,
        relatives,
    };
    if patch.is_empty() {
        return Err(ValidationError::EmptyPatch);
    }
    Ok(patch)
}

/// serde adapter for `DD.MM.YYYY` dates.
pub mod birth_date {
    use chrono::NaiveDate;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    use super::BIRTH_DATE_FORMAT;

    pub fn serialize<S: Serializer>(date: &NaiveDate, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&date.format(BIRTH_DATE_FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDate, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveDate::parse_from_str(&raw, BIRTH_DATE_FORMAT).map_err(D::Error::custom)
    }
}
