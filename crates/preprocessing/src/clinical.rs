//! Clinical covariate encoding
use cogniscan_common::{ClinicalRecord, ClinicalVector};
use tracing::debug;

/// Value substituted for any missing or non-finite numeric covariate
pub const MISSING_VALUE: f32 = 0.0;

/// Encodes a [`ClinicalRecord`] into `[age, gender_code, mmse, cdr]`
///
/// This is the single place where missing inputs are replaced:
/// absent age, MMSE or CDR become `0.0` and an absent gender encodes as male (`0`).
/// Values are not range-clamped. Every substitution is logged at debug level so
/// incomplete records can be audited.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClinicalFeatureEncoder;

impl ClinicalFeatureEncoder {
    #[must_use]
    pub fn encode(&self, record: &ClinicalRecord) -> ClinicalVector {
        let mut substituted: Vec<&'static str> = Vec::new();

        let age = match record.age {
            Some(age) => age as f32,
            None => {
                substituted.push("age");
                MISSING_VALUE
            }
        };
        let gender = match record.gender {
            Some(gender) => gender.code(),
            None => {
                substituted.push("gender");
                MISSING_VALUE
            }
        };
        let mmse = finite_or_default(record.mmse, "mmse", &mut substituted);
        let cdr = finite_or_default(record.cdr, "cdr", &mut substituted);

        if !substituted.is_empty() {
            debug!("Clinical defaults substituted for: {}", substituted.join(", "));
        }

        ClinicalVector::new([age, gender, mmse, cdr])
    }
}

fn finite_or_default(
    value: Option<f32>,
    name: &'static str,
    substituted: &mut Vec<&'static str>,
) -> f32 {
    match value {
        Some(v) if v.is_finite() => v,
        _ => {
            substituted.push(name);
            MISSING_VALUE
        }
    }
}
