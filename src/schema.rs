// Canonical input schema for the trained exam-score regressors. The order of
// FEATURE_SPECS is load-bearing: it must match the column order the model and
// scaler were fitted with, and permuting it silently corrupts predictions.

pub const FEATURE_COUNT: usize = 17;

// Neutral value used when a field cannot be converted. Chosen once, applied
// uniformly: a single bad field degrades that field, never the whole record.
pub const NEUTRAL_VALUE: f64 = 1.0;

// Target column of the training dataset; never a model input. Stripped from
// uploaded tables before feature extraction.
pub const TARGET_COLUMN: &str = "Exam_Score";

// Ordinal encoding tables for categorical features
pub const LEVEL_SCALE: &[(&str, f64)] = &[("Low", 0.0), ("Medium", 1.0), ("High", 2.0)];

pub const YES_NO_SCALE: &[(&str, f64)] = &[("No", 0.0), ("Yes", 1.0)];

pub const QUALITY_SCALE: &[(&str, f64)] = &[
    ("Poor", 0.0),
    ("Low", 0.0),
    ("Average", 1.0),
    ("Medium", 1.0),
    ("Good", 2.0),
    ("High", 2.0),
    ("Excellent", 3.0),
];

pub const INFLUENCE_SCALE: &[(&str, f64)] =
    &[("Negative", 0.0), ("Neutral", 1.0), ("Positive", 2.0)];

pub const DISTANCE_SCALE: &[(&str, f64)] = &[("Near", 0.0), ("Moderate", 1.0), ("Far", 2.0)];

pub const EDUCATION_SCALE: &[(&str, f64)] = &[
    ("High School", 0.0),
    ("College", 1.0),
    ("Bachelor", 2.0),
    ("Postgraduate", 3.0),
    ("Master", 3.0),
    ("PhD", 4.0),
];

// Ordinal tier at which parental education counts as family education support
pub const BACHELOR_TIER: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FeatureKind {
    Numeric,
    Categorical(&'static [(&'static str, f64)]),
    // Computed from already-resolved primary features, never read from input
    Derived,
}

#[derive(Debug, Clone, Copy)]
pub struct FeatureSpec {
    pub name: &'static str,
    pub alias: &'static str,
    pub kind: FeatureKind,
    pub default: f64,
}

// Indices of the primary features the derived ones are computed from
pub const IDX_HOURS_STUDIED: usize = 0;
pub const IDX_ATTENDANCE: usize = 1;
pub const IDX_TUTORING_SESSIONS: usize = 7;
pub const IDX_PARENTAL_EDUCATION: usize = 12;

pub static FEATURE_SPECS: [FeatureSpec; FEATURE_COUNT] = [
    FeatureSpec {
        name: "Hours_Studied",
        alias: "study_hours",
        kind: FeatureKind::Numeric,
        default: 10.0,
    },
    FeatureSpec {
        name: "Attendance",
        alias: "attendance",
        kind: FeatureKind::Numeric,
        default: 85.0,
    },
    FeatureSpec {
        name: "Parental_Involvement",
        alias: "parental_involvement",
        kind: FeatureKind::Categorical(LEVEL_SCALE),
        default: 1.0,
    },
    FeatureSpec {
        name: "Access_to_Resources",
        alias: "access_to_resources",
        kind: FeatureKind::Categorical(LEVEL_SCALE),
        default: 1.0,
    },
    FeatureSpec {
        name: "Extracurricular_Activities",
        alias: "extracurricular_activities",
        kind: FeatureKind::Categorical(YES_NO_SCALE),
        default: 1.0,
    },
    FeatureSpec {
        name: "Previous_Scores",
        alias: "previous_scores",
        kind: FeatureKind::Numeric,
        default: 75.0,
    },
    FeatureSpec {
        name: "Motivation_Level",
        alias: "motivation_level",
        kind: FeatureKind::Categorical(LEVEL_SCALE),
        default: 1.0,
    },
    FeatureSpec {
        name: "Tutoring_Sessions",
        alias: "tutoring_sessions",
        kind: FeatureKind::Numeric,
        default: 1.0,
    },
    FeatureSpec {
        name: "Family_Income",
        alias: "family_income",
        kind: FeatureKind::Categorical(LEVEL_SCALE),
        default: 1.0,
    },
    FeatureSpec {
        name: "Teacher_Quality",
        alias: "teacher_quality",
        kind: FeatureKind::Categorical(QUALITY_SCALE),
        default: 1.0,
    },
    FeatureSpec {
        name: "Peer_Influence",
        alias: "peer_influence",
        kind: FeatureKind::Categorical(INFLUENCE_SCALE),
        default: 1.0,
    },
    FeatureSpec {
        name: "Learning_Disabilities",
        alias: "learning_disabilities",
        kind: FeatureKind::Categorical(YES_NO_SCALE),
        default: 1.0,
    },
    FeatureSpec {
        name: "Parental_Education_Level",
        alias: "parental_education_level",
        kind: FeatureKind::Categorical(EDUCATION_SCALE),
        default: 1.0,
    },
    FeatureSpec {
        name: "Distance_from_Home",
        alias: "distance_from_home",
        kind: FeatureKind::Categorical(DISTANCE_SCALE),
        default: 1.0,
    },
    FeatureSpec {
        name: "Study_Efficiency",
        alias: "study_efficiency",
        kind: FeatureKind::Derived,
        default: 0.25,
    },
    FeatureSpec {
        name: "High_Support",
        alias: "high_support",
        kind: FeatureKind::Derived,
        default: 0.0,
    },
    FeatureSpec {
        name: "Family_Education_Support",
        alias: "family_education_support",
        kind: FeatureKind::Derived,
        default: 0.0,
    },
];

// Columns a batch upload must carry (canonical name or alias) before any
// prediction work starts; everything else falls back to schema defaults.
pub const REQUIRED_COLUMNS: [&str; 3] = ["Hours_Studied", "Attendance", "Previous_Scores"];

pub fn feature_names() -> Vec<&'static str> {
    FEATURE_SPECS.iter().map(|spec| spec.name).collect()
}

pub fn spec_by_alias(alias: &str) -> Option<&'static FeatureSpec> {
    FEATURE_SPECS.iter().find(|spec| spec.alias == alias)
}

pub fn encode_categorical(table: &[(&str, f64)], raw: &str) -> Option<f64> {
    table
        .iter()
        .find(|(label, _)| label.eq_ignore_ascii_case(raw))
        .map(|(_, encoded)| *encoded)
}
