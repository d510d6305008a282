//! Canonical vehicle data read off a registration certificate.

use serde::{Deserialize, Serialize};

/// The eight vehicle fields of a quote request.
///
/// Every field is always present; an unset field is the empty string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VehicleRecord {
    pub registration_plate: String,
    pub make: String,
    pub model: String,
    /// Opaque: sources disagree on year vs. full date.
    pub first_registration_date: String,
    pub vin: String,
    pub fuel_type: String,
    pub color: String,
    /// Kept as text, sources send "7", 7 or "7 CV".
    pub fiscal_horsepower: String,
}

/// Addresses one field of a [`VehicleRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VehicleField {
    RegistrationPlate,
    Make,
    Model,
    FirstRegistrationDate,
    Vin,
    FuelType,
    Color,
    FiscalHorsepower,
}

impl VehicleField {
    pub const ALL: [VehicleField; 8] = [
        VehicleField::RegistrationPlate,
        VehicleField::Make,
        VehicleField::Model,
        VehicleField::FirstRegistrationDate,
        VehicleField::Vin,
        VehicleField::FuelType,
        VehicleField::Color,
        VehicleField::FiscalHorsepower,
    ];

    /// JSON name, as serialized on [`VehicleRecord`].
    pub fn key(self) -> &'static str {
        match self {
            Self::RegistrationPlate => "registrationPlate",
            Self::Make => "make",
            Self::Model => "model",
            Self::FirstRegistrationDate => "firstRegistrationDate",
            Self::Vin => "vin",
            Self::FuelType => "fuelType",
            Self::Color => "color",
            Self::FiscalHorsepower => "fiscalHorsepower",
        }
    }

    /// Parse a field name. Accepts the camelCase JSON name or snake_case.
    pub fn from_key(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|f| f.key() == s || f.key().to_lowercase() == s.replace('_', "").to_lowercase())
    }
}

impl VehicleRecord {
    pub fn get(&self, field: VehicleField) -> &str {
        match field {
            VehicleField::RegistrationPlate => &self.registration_plate,
            VehicleField::Make => &self.make,
            VehicleField::Model => &self.model,
            VehicleField::FirstRegistrationDate => &self.first_registration_date,
            VehicleField::Vin => &self.vin,
            VehicleField::FuelType => &self.fuel_type,
            VehicleField::Color => &self.color,
            VehicleField::FiscalHorsepower => &self.fiscal_horsepower,
        }
    }

    pub fn get_mut(&mut self, field: VehicleField) -> &mut String {
        match field {
            VehicleField::RegistrationPlate => &mut self.registration_plate,
            VehicleField::Make => &mut self.make,
            VehicleField::Model => &mut self.model,
            VehicleField::FirstRegistrationDate => &mut self.first_registration_date,
            VehicleField::Vin => &mut self.vin,
            VehicleField::FuelType => &mut self.fuel_type,
            VehicleField::Color => &mut self.color,
            VehicleField::FiscalHorsepower => &mut self.fiscal_horsepower,
        }
    }

    pub fn set(&mut self, field: VehicleField, value: impl Into<String>) {
        *self.get_mut(field) = value.into();
    }

    /// True when the field holds something other than whitespace.
    pub fn is_filled(&self, field: VehicleField) -> bool {
        !self.get(field).trim().is_empty()
    }

    pub fn filled_count(&self) -> usize {
        VehicleField::ALL
            .into_iter()
            .filter(|f| self.is_filled(*f))
            .count()
    }

    /// No field carries data, i.e. nothing was extracted.
    pub fn is_blank(&self) -> bool {
        self.filled_count() == 0
    }

    /// Merge an accepted preview into this record.
    ///
    /// Only fields that are non-blank in `preview` overwrite; a blank preview
    /// field means "no opinion" and never clears a value. Idempotent.
    pub fn merge_from(&mut self, preview: &VehicleRecord) {
        for field in VehicleField::ALL {
            if preview.is_filled(field) {
                self.set(field, preview.get(field));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_only_overwrites_filled_fields() {
        let mut form = VehicleRecord {
            make: "BMW".to_string(),
            model: "A4".to_string(),
            ..Default::default()
        };
        let preview = VehicleRecord {
            make: "Audi".to_string(),
            model: "   ".to_string(),
            ..Default::default()
        };

        form.merge_from(&preview);
        assert_eq!(form.make, "Audi");
        assert_eq!(form.model, "A4");

        let once = form.clone();
        form.merge_from(&preview);
        assert_eq!(form, once);
    }

    #[test]
    fn test_filled_count_ignores_whitespace() {
        let record = VehicleRecord {
            vin: "VF1AB12C3D4567890".to_string(),
            color: " ".to_string(),
            ..Default::default()
        };
        assert_eq!(record.filled_count(), 1);
        assert!(!record.is_blank());
        assert!(VehicleRecord::default().is_blank());
    }

    #[test]
    fn test_serializes_all_fields_in_camel_case() {
        let json = serde_json::to_value(VehicleRecord::default()).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj.len(), 8);
        for field in VehicleField::ALL {
            assert_eq!(obj[field.key()], "");
        }
    }

    #[test]
    fn test_field_from_key() {
        assert_eq!(
            VehicleField::from_key("fiscalHorsepower"),
            Some(VehicleField::FiscalHorsepower)
        );
        assert_eq!(
            VehicleField::from_key("registration_plate"),
            Some(VehicleField::RegistrationPlate)
        );
        assert_eq!(VehicleField::from_key("wheels"), None);
    }
}
