//! Reconciles a recognition response into a [`VehicleRecord`].
//!
//! The response shape is not trusted. Each known shape has its own lookup:
//!
//! 1. flat keys (synonyms and official certificate codes) on the payload,
//! 2. a `fields` array of `{key, value}` entries,
//! 3. regexes over a free `text` string.
//!
//! Lookups run in that order per field and the first non-empty value wins, so a
//! weaker source never overwrites a stronger one.

use serde_json::{Map, Value};
use tracing::debug;

use crate::text_patterns::CompiledPatterns;
use crate::vehicle::{VehicleField, VehicleRecord};

/// How one field is found in each response shape.
struct FieldSource {
    field: VehicleField,
    /// Flat-key synonyms, checked in order.
    keys: &'static [&'static str],
    /// Official certificate codes, dotted spelling.
    codes: &'static [&'static str],
    /// Substrings of an uppercased field-list key that identify the field.
    labels: &'static [&'static str],
    /// Substrings that disqualify a label match.
    excludes: &'static [&'static str],
    /// Id of the free-text pattern feeding this field, if any.
    pattern: Option<&'static str>,
}

const FIELD_SOURCES: [FieldSource; 8] = [
    FieldSource {
        field: VehicleField::RegistrationPlate,
        keys: &["immatriculation", "registration", "plateNumber"],
        codes: &["A"],
        labels: &["IMMATRICULATION"],
        // "DATE DE PREMIERE IMMATRICULATION" is field B
        excludes: &["DATE"],
        pattern: Some("plate"),
    },
    FieldSource {
        field: VehicleField::Make,
        keys: &["marque", "brand", "make"],
        codes: &["D.1"],
        labels: &["MARQUE"],
        excludes: &[],
        pattern: None,
    },
    FieldSource {
        field: VehicleField::Model,
        keys: &["modele", "model"],
        codes: &["D.2", "D.3"],
        labels: &["MODELE", "TYPE"],
        excludes: &["CARBURANT"],
        pattern: None,
    },
    FieldSource {
        field: VehicleField::FirstRegistrationDate,
        keys: &["annee", "year", "firstRegistrationDate"],
        codes: &["B"],
        labels: &["DATE"],
        excludes: &[],
        pattern: None,
    },
    FieldSource {
        field: VehicleField::Vin,
        keys: &["vin", "VIN", "chassisNumber"],
        codes: &["E"],
        labels: &["VIN"],
        excludes: &[],
        pattern: Some("vin"),
    },
    FieldSource {
        field: VehicleField::FuelType,
        keys: &["typeCarburant", "fuel", "fuelType"],
        codes: &["P.3"],
        labels: &["CARBURANT"],
        excludes: &[],
        pattern: None,
    },
    FieldSource {
        field: VehicleField::Color,
        keys: &["couleur", "color", "colour"],
        codes: &[],
        labels: &["COULEUR"],
        excludes: &[],
        pattern: None,
    },
    FieldSource {
        field: VehicleField::FiscalHorsepower,
        keys: &["puissanceFiscale", "fiscalPower", "taxHorsepower"],
        codes: &["P.6"],
        labels: &["PUISSANCE"],
        excludes: &[],
        pattern: None,
    },
];

/// Characters allowed to follow an official code in a field-list key ("D.1 - Marque").
const CODE_SEPARATORS: [char; 6] = [' ', ':', '-', '(', ')', '/'];

/// Turns raw recognition responses into vehicle records.
#[derive(Debug, Clone)]
pub struct Normalizer {
    patterns: CompiledPatterns,
}

impl Normalizer {
    pub fn new(patterns: CompiledPatterns) -> Self {
        Self { patterns }
    }

    /// Normalize any JSON value. Never fails: unknown shapes yield empty fields.
    pub fn normalize(&self, raw: &Value) -> VehicleRecord {
        let mut record = VehicleRecord::default();
        let Some(scopes) = Scopes::of(raw) else {
            debug!("Recognition response is not an object, nothing to reconcile");
            return record;
        };

        for source in &FIELD_SOURCES {
            let value = lookup_flat_keys(scopes.primary, source)
                .or_else(|| scopes.iter().find_map(|s| lookup_field_list(s, source)))
                .or_else(|| {
                    let id = source.pattern?;
                    scopes
                        .iter()
                        .find_map(|s| s.get("text")?.as_str())
                        .and_then(|text| self.patterns.find(id, text))
                });

            if let Some(value) = value {
                record.set(source.field, value);
            }
        }

        debug!("Reconciled {}/8 vehicle fields", record.filled_count());
        record
    }
}

/// The payload objects searched, strongest first.
struct Scopes<'a> {
    /// Object under `data` or `result`, or the response itself.
    primary: &'a Map<String, Value>,
    /// The top-level response when `primary` was unwrapped from it.
    outer: Option<&'a Map<String, Value>>,
}

impl<'a> Scopes<'a> {
    fn of(raw: &'a Value) -> Option<Self> {
        let top = raw.as_object()?;
        let inner = ["data", "result"]
            .iter()
            .find_map(|k| top.get(*k).and_then(Value::as_object));

        Some(match inner {
            Some(primary) => Self {
                primary,
                outer: Some(top),
            },
            None => Self {
                primary: top,
                outer: None,
            },
        })
    }

    fn iter(&self) -> impl Iterator<Item = &'a Map<String, Value>> {
        std::iter::once(self.primary).chain(self.outer)
    }
}

/// Step 1: synonyms, then official codes dotted ("D.1") and undotted ("D1").
fn lookup_flat_keys(obj: &Map<String, Value>, source: &FieldSource) -> Option<String> {
    source
        .keys
        .iter()
        .find_map(|k| obj.get(*k).and_then(text_value))
        .or_else(|| {
            source.codes.iter().find_map(|code| {
                obj.get(*code)
                    .and_then(text_value)
                    .or_else(|| obj.get(&code.replace('.', "")).and_then(text_value))
            })
        })
}

/// Step 2: first `fields` entry whose key names this field.
fn lookup_field_list(obj: &Map<String, Value>, source: &FieldSource) -> Option<String> {
    obj.get("fields")?.as_array()?.iter().find_map(|entry| {
        let entry = entry.as_object()?;
        let key = entry
            .get("key")
            .and_then(Value::as_str)
            .filter(|k| !k.is_empty())
            .or_else(|| entry.get("label").and_then(Value::as_str))?
            .trim()
            .to_uppercase();

        if !key_matches(&key, source) {
            return None;
        }
        entry.get("value").and_then(text_value)
    })
}

fn key_matches(key: &str, source: &FieldSource) -> bool {
    let by_code = source.codes.iter().any(|code| match key.strip_prefix(code) {
        Some(rest) => rest.is_empty() || rest.starts_with(CODE_SEPARATORS),
        None => false,
    });
    if by_code {
        return true;
    }

    source.labels.iter().any(|label| key.contains(label))
        && !source.excludes.iter().any(|ex| key.contains(ex))
}

/// A usable field value: trimmed non-empty string, or a number rendered as text.
fn text_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
