use crate::{
    config::SchemaDriftPolicy,
    error::AppError,
    schema::{
        encode_categorical, FeatureKind, FeatureSpec, BACHELOR_TIER, FEATURE_COUNT, FEATURE_SPECS,
        IDX_ATTENDANCE, IDX_HOURS_STUDIED, IDX_PARENTAL_EDUCATION, IDX_TUTORING_SESSIONS,
        NEUTRAL_VALUE,
    },
    types::StudentRecord,
};
use serde_json::Value;
use tracing::{error, warn};

// Turns loosely-structured student records into fixed-order numeric vectors
// matching the trained model's input schema. Per-field conversion problems
// degrade that field to the neutral value; only a feature-count mismatch (a
// schema drift bug, not a data problem) can reject a record, and then only
// under the `reject` policy.
pub struct FeatureVectorBuilder {
    drift_policy: SchemaDriftPolicy,
}

impl FeatureVectorBuilder {
    pub fn new(drift_policy: SchemaDriftPolicy) -> Self {
        Self { drift_policy }
    }

    pub fn build(&self, record: &StudentRecord) -> Result<Vec<f64>, AppError> {
        let mut vector = Vec::with_capacity(FEATURE_COUNT);

        // Primary features resolve from the record; derived ones are computed
        // afterwards from the already-resolved values
        for spec in FEATURE_SPECS.iter() {
            if matches!(spec.kind, FeatureKind::Derived) {
                continue;
            }
            vector.push(self.resolve(record, spec));
        }

        let hours = vector[IDX_HOURS_STUDIED];
        let attendance = vector[IDX_ATTENDANCE];
        let tutoring = vector[IDX_TUTORING_SESSIONS];
        let education = vector[IDX_PARENTAL_EDUCATION];

        // Attendance is a percentage; the max() guards division by zero
        let study_efficiency = hours / attendance.max(1.0);
        let high_support = if tutoring > 2.0 { 1.0 } else { 0.0 };
        let family_education_support = if education >= BACHELOR_TIER { 1.0 } else { 0.0 };

        vector.push(study_efficiency);
        vector.push(high_support);
        vector.push(family_education_support);

        self.check_length(vector)
    }

    // Applies the single-record procedure independently to each record,
    // preserving input order. Never drops or duplicates rows.
    pub fn build_matrix(&self, records: &[StudentRecord]) -> Result<Vec<Vec<f64>>, AppError> {
        records.iter().map(|record| self.build(record)).collect()
    }

    fn resolve(&self, record: &StudentRecord, spec: &FeatureSpec) -> f64 {
        let raw = record.get(spec.alias).or_else(|| record.get(spec.name));
        match raw {
            Some(value) => self.convert(value, spec),
            None => spec.default,
        }
    }

    fn convert(&self, value: &Value, spec: &FeatureSpec) -> f64 {
        match value {
            Value::Number(n) => n.as_f64().unwrap_or_else(|| {
                warn!(feature = spec.name, "non-finite numeric value, using neutral default");
                NEUTRAL_VALUE
            }),
            Value::String(s) => self.convert_str(s.trim(), spec),
            Value::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Value::Null => spec.default,
            other => {
                warn!(
                    feature = spec.name,
                    value = %other,
                    "unsupported value type, using neutral default"
                );
                NEUTRAL_VALUE
            }
        }
    }

    fn convert_str(&self, raw: &str, spec: &FeatureSpec) -> f64 {
        if raw.is_empty() {
            return spec.default;
        }

        if let FeatureKind::Categorical(table) = spec.kind {
            if let Some(encoded) = encode_categorical(table, raw) {
                return encoded;
            }
        }

        // CSV cells and pre-encoded ordinals arrive as numeric strings
        if let Ok(parsed) = raw.parse::<f64>() {
            return parsed;
        }

        // An unrecognized value degrades this field only, never the whole
        // record. Logged as a data-quality signal.
        warn!(
            feature = spec.name,
            value = raw,
            "unrecognized value, using neutral default"
        );
        NEUTRAL_VALUE
    }

    fn check_length(&self, mut vector: Vec<f64>) -> Result<Vec<f64>, AppError> {
        if vector.len() == FEATURE_COUNT {
            return Ok(vector);
        }
        match self.drift_policy {
            SchemaDriftPolicy::Pad => {
                warn!(
                    got = vector.len(),
                    expected = FEATURE_COUNT,
                    "feature count mismatch, padding with neutral value"
                );
                vector.resize(FEATURE_COUNT, NEUTRAL_VALUE);
                Ok(vector)
            }
            SchemaDriftPolicy::Reject => {
                error!(
                    got = vector.len(),
                    expected = FEATURE_COUNT,
                    "feature count mismatch, rejecting record"
                );
                Err(AppError::SchemaDrift(format!(
                    "feature vector has {} entries, model expects {}",
                    vector.len(),
                    FEATURE_COUNT
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(entries: &[(&str, Value)]) -> StudentRecord {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn builder() -> FeatureVectorBuilder {
        FeatureVectorBuilder::new(SchemaDriftPolicy::Reject)
    }

    #[test]
    fn test_vector_length_and_order() {
        let rec = record(&[
            ("study_hours", json!(20.0)),
            ("attendance", json!(90.0)),
            ("previous_scores", json!(80.0)),
        ]);
        let vector = builder().build(&rec).unwrap();
        assert_eq!(vector.len(), FEATURE_COUNT);
        assert_eq!(vector[IDX_HOURS_STUDIED], 20.0);
        assert_eq!(vector[IDX_ATTENDANCE], 90.0);
        assert_eq!(vector[5], 80.0);
    }

    #[test]
    fn test_alias_and_canonical_keys_equivalent() {
        let via_alias = record(&[("study_hours", json!(12.0)), ("attendance", json!(80.0))]);
        let via_canonical = record(&[("Hours_Studied", json!(12.0)), ("Attendance", json!(80.0))]);
        let b = builder();
        assert_eq!(b.build(&via_alias).unwrap(), b.build(&via_canonical).unwrap());
    }

    #[test]
    fn test_defaults_for_missing_fields() {
        let vector = builder().build(&StudentRecord::new()).unwrap();
        assert_eq!(vector[IDX_HOURS_STUDIED], 10.0);
        assert_eq!(vector[IDX_ATTENDANCE], 85.0);
        assert_eq!(vector[5], 75.0);
        assert_eq!(vector[IDX_TUTORING_SESSIONS], 1.0);
    }

    #[test]
    fn test_missing_tutoring_sessions_uses_default() {
        let rec = record(&[
            ("study_hours", json!(15.0)),
            ("attendance", json!(92.0)),
            ("previous_scores", json!(70.0)),
        ]);
        let vector = builder().build(&rec).unwrap();
        assert_eq!(vector[IDX_TUTORING_SESSIONS], 1.0);
        // Default of one session is not "high support"
        assert_eq!(vector[15], 0.0);
    }

    #[test]
    fn test_categorical_encoding() {
        let rec = record(&[
            ("parental_involvement", json!("High")),
            ("extracurricular_activities", json!("Yes")),
            ("peer_influence", json!("Negative")),
            ("distance_from_home", json!("Far")),
            ("teacher_quality", json!("Good")),
        ]);
        let vector = builder().build(&rec).unwrap();
        assert_eq!(vector[2], 2.0);
        assert_eq!(vector[4], 1.0);
        assert_eq!(vector[10], 0.0);
        assert_eq!(vector[13], 2.0);
        assert_eq!(vector[9], 2.0);
    }

    #[test]
    fn test_unrecognized_categorical_maps_to_neutral() {
        let rec = record(&[("motivation_level", json!("Stratospheric"))]);
        let vector = builder().build(&rec).unwrap();
        assert_eq!(vector[6], NEUTRAL_VALUE);
    }

    #[test]
    fn test_numeric_strings_parse() {
        let rec = record(&[
            ("study_hours", json!("25")),
            ("attendance", json!("96.5")),
            ("parental_involvement", json!("2")),
        ]);
        let vector = builder().build(&rec).unwrap();
        assert_eq!(vector[IDX_HOURS_STUDIED], 25.0);
        assert_eq!(vector[IDX_ATTENDANCE], 96.5);
        assert_eq!(vector[2], 2.0);
    }

    #[test]
    fn test_unparseable_numeric_degrades_field_only() {
        let rec = record(&[
            ("study_hours", json!("lots")),
            ("attendance", json!(88.0)),
        ]);
        let vector = builder().build(&rec).unwrap();
        assert_eq!(vector[IDX_HOURS_STUDIED], NEUTRAL_VALUE);
        assert_eq!(vector[IDX_ATTENDANCE], 88.0);
    }

    #[test]
    fn test_study_efficiency() {
        let rec = record(&[("study_hours", json!(30.0)), ("attendance", json!(60.0))]);
        let vector = builder().build(&rec).unwrap();
        assert!((vector[14] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_study_efficiency_zero_attendance_guard() {
        let rec = record(&[("study_hours", json!(10.0)), ("attendance", json!(0.0))]);
        let vector = builder().build(&rec).unwrap();
        assert!((vector[14] - 10.0).abs() < 1e-12);
    }

    #[test]
    fn test_high_support_threshold() {
        let low = record(&[("tutoring_sessions", json!(2.0))]);
        let high = record(&[("tutoring_sessions", json!(3.0))]);
        let b = builder();
        assert_eq!(b.build(&low).unwrap()[15], 0.0);
        assert_eq!(b.build(&high).unwrap()[15], 1.0);
    }

    #[test]
    fn test_family_education_support_string_and_ordinal() {
        let b = builder();
        for value in [json!("Bachelor"), json!("Master"), json!("PhD"), json!(2.0), json!(4)] {
            let rec = record(&[("parental_education_level", value)]);
            assert_eq!(b.build(&rec).unwrap()[16], 1.0);
        }
        for value in [json!("High School"), json!("College"), json!(0.0), json!(1)] {
            let rec = record(&[("parental_education_level", value)]);
            assert_eq!(b.build(&rec).unwrap()[16], 0.0);
        }
    }

    #[test]
    fn test_extra_keys_ignored() {
        let rec = record(&[
            ("study_hours", json!(10.0)),
            ("favorite_color", json!("teal")),
            ("Exam_Score", json!(88.0)),
        ]);
        let vector = builder().build(&rec).unwrap();
        assert_eq!(vector.len(), FEATURE_COUNT);
    }

    #[test]
    fn test_batch_preserves_row_order() {
        let records: Vec<StudentRecord> = (0..5)
            .map(|i| record(&[("previous_scores", json!(40.0 + i as f64))]))
            .collect();
        let matrix = builder().build_matrix(&records).unwrap();
        assert_eq!(matrix.len(), 5);
        for (i, row) in matrix.iter().enumerate() {
            assert_eq!(row[5], 40.0 + i as f64);
        }
    }
}
