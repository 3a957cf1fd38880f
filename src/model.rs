use crate::{
    error::AppError,
    schema::{feature_names, FEATURE_COUNT},
    types::ModelKind,
};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::fs;
use tracing::info;

// Paired feature scaler for a trained regressor: z = (x - mean) / scale per
// column, fitted offline alongside the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl Scaler {
    pub fn load(path: &str) -> Result<Self, AppError> {
        let data = fs::read_to_string(path)?;
        let mut scaler: Scaler = serde_json::from_str(&data)?;
        scaler.validate()?;
        // Zero-variance columns scale by 1.0 so the transform stays finite
        for s in scaler.scale.iter_mut() {
            if s.abs() < f64::EPSILON {
                *s = 1.0;
            }
        }
        Ok(scaler)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.mean.len() != FEATURE_COUNT || self.scale.len() != FEATURE_COUNT {
            return Err(AppError::ModelArtifact(format!(
                "scaler expects {} features, artifact has mean={} scale={}",
                FEATURE_COUNT,
                self.mean.len(),
                self.scale.len()
            )));
        }
        Ok(())
    }

    pub fn transform(&self, rows: &[Vec<f64>]) -> DMatrix<f64> {
        DMatrix::from_fn(rows.len(), FEATURE_COUNT, |i, j| {
            (rows[i][j] - self.mean[j]) / self.scale[j]
        })
    }
}

// On-disk form of the support-vector regressor: RBF kernel over the scaled
// feature space.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SvrArtifact {
    pub kernel: String,
    pub gamma: f64,
    pub intercept: f64,
    pub dual_coef: Vec<f64>,
    pub support_vectors: Vec<Vec<f64>>,
}

#[derive(Debug, Clone)]
pub struct SvrModel {
    gamma: f64,
    intercept: f64,
    dual_coef: DVector<f64>,
    support_vectors: DMatrix<f64>,
}

impl SvrModel {
    pub fn from_artifact(artifact: SvrArtifact) -> Result<Self, AppError> {
        if artifact.kernel != "rbf" {
            return Err(AppError::ModelArtifact(format!(
                "unsupported SVR kernel '{}'",
                artifact.kernel
            )));
        }
        let n_sv = artifact.support_vectors.len();
        if n_sv == 0 || artifact.dual_coef.len() != n_sv {
            return Err(AppError::ModelArtifact(format!(
                "SVR artifact has {} support vectors but {} dual coefficients",
                n_sv,
                artifact.dual_coef.len()
            )));
        }
        if artifact.support_vectors.iter().any(|sv| sv.len() != FEATURE_COUNT) {
            return Err(AppError::ModelArtifact(format!(
                "SVR support vectors must have {} features",
                FEATURE_COUNT
            )));
        }
        let support_vectors = DMatrix::from_fn(n_sv, FEATURE_COUNT, |i, j| {
            artifact.support_vectors[i][j]
        });
        Ok(Self {
            gamma: artifact.gamma,
            intercept: artifact.intercept,
            dual_coef: DVector::from_vec(artifact.dual_coef),
            support_vectors,
        })
    }

    pub fn load(path: &str) -> Result<Self, AppError> {
        let data = fs::read_to_string(path)?;
        let artifact: SvrArtifact = serde_json::from_str(&data)?;
        Self::from_artifact(artifact)
    }

    // decision(x) = sum_i dual_i * exp(-gamma * ||sv_i - x||^2) + intercept
    fn predict_row(&self, x: &DMatrix<f64>, row: usize) -> f64 {
        let mut score = self.intercept;
        for i in 0..self.support_vectors.nrows() {
            let mut dist_sq = 0.0;
            for j in 0..FEATURE_COUNT {
                let d = self.support_vectors[(i, j)] - x[(row, j)];
                dist_sq += d * d;
            }
            score += self.dual_coef[i] * (-self.gamma * dist_sq).exp();
        }
        score
    }
}

// On-disk form of the linear-ridge regressor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RidgeArtifact {
    pub weights: Vec<f64>,
    pub intercept: f64,
}

#[derive(Debug, Clone)]
pub struct RidgeModel {
    weights: DVector<f64>,
    intercept: f64,
}

impl RidgeModel {
    pub fn from_artifact(artifact: RidgeArtifact) -> Result<Self, AppError> {
        if artifact.weights.len() != FEATURE_COUNT {
            return Err(AppError::ModelArtifact(format!(
                "ridge artifact has {} weights, model expects {}",
                artifact.weights.len(),
                FEATURE_COUNT
            )));
        }
        Ok(Self {
            weights: DVector::from_vec(artifact.weights),
            intercept: artifact.intercept,
        })
    }

    pub fn load(path: &str) -> Result<Self, AppError> {
        let data = fs::read_to_string(path)?;
        let artifact: RidgeArtifact = serde_json::from_str(&data)?;
        Self::from_artifact(artifact)
    }

    fn predict_row(&self, x: &DMatrix<f64>, row: usize) -> f64 {
        let mut score = self.intercept;
        for j in 0..FEATURE_COUNT {
            score += self.weights[j] * x[(row, j)];
        }
        score
    }
}

#[derive(Debug, Clone)]
pub enum Regressor {
    Svr(SvrModel),
    Ridge(RidgeModel),
}

// A trained regressor with its paired scaler. Loaded once at startup from
// persisted artifacts and read-only afterwards; shared across requests and
// worker threads without locking.
#[derive(Debug, Clone)]
pub struct ModelBundle {
    pub kind: ModelKind,
    regressor: Regressor,
    scaler: Scaler,
}

impl ModelBundle {
    pub fn load_svr(model_path: &str, scaler_path: &str) -> Result<Self, AppError> {
        let regressor = Regressor::Svr(SvrModel::load(model_path)?);
        let scaler = Scaler::load(scaler_path)?;
        info!("Loaded SVR model from {}", model_path);
        Ok(Self {
            kind: ModelKind::Svr,
            regressor,
            scaler,
        })
    }

    pub fn load_ridge(model_path: &str, scaler_path: &str) -> Result<Self, AppError> {
        let regressor = Regressor::Ridge(RidgeModel::load(model_path)?);
        let scaler = Scaler::load(scaler_path)?;
        info!("Loaded ridge model from {}", model_path);
        Ok(Self {
            kind: ModelKind::Ridge,
            regressor,
            scaler,
        })
    }

    pub fn from_parts(kind: ModelKind, regressor: Regressor, scaler: Scaler) -> Self {
        Self {
            kind,
            regressor,
            scaler,
        }
    }

    // Scales the whole batch, then runs the regressor's batch predict.
    // Output is raw model space; range clamping happens downstream so the
    // grading path is uniform across model and heuristic predictions.
    pub fn predict(&self, rows: &[Vec<f64>]) -> Result<Vec<f64>, AppError> {
        if let Some(bad) = rows.iter().find(|r| r.len() != FEATURE_COUNT) {
            return Err(AppError::ModelInference(format!(
                "input row has {} features, model expects {}",
                bad.len(),
                FEATURE_COUNT
            )));
        }
        let scaled = self.scaler.transform(rows);
        let scores = (0..rows.len())
            .map(|row| match &self.regressor {
                Regressor::Svr(svr) => svr.predict_row(&scaled, row),
                Regressor::Ridge(ridge) => ridge.predict_row(&scaled, row),
            })
            .collect();
        Ok(scores)
    }
}

// Descriptor produced by the offline training step: the feature list it was
// trained against plus performance metrics. Used to fail closed on drift
// between the deployed schema and the persisted artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub model: String,
    pub feature_names: Vec<String>,
    #[serde(default)]
    pub r2_test: f64,
    #[serde(default)]
    pub cv_r2_mean: f64,
    #[serde(default)]
    pub cv_r2_std: f64,
    #[serde(default)]
    pub trained_at: String,
}

impl ModelMetadata {
    pub fn load(path: &str) -> Result<Self, AppError> {
        let data = fs::read_to_string(path)?;
        let metadata: ModelMetadata = serde_json::from_str(&data)?;
        Ok(metadata)
    }

    // The ordering is load-bearing: a permuted or truncated feature list means
    // the artifacts do not match this schema generation.
    pub fn validate_features(&self) -> Result<(), AppError> {
        let expected = feature_names();
        if self.feature_names.len() != expected.len() {
            return Err(AppError::ModelArtifact(format!(
                "metadata lists {} features, schema has {}",
                self.feature_names.len(),
                expected.len()
            )));
        }
        for (i, (got, want)) in self.feature_names.iter().zip(expected.iter()).enumerate() {
            if got != want {
                return Err(AppError::ModelArtifact(format!(
                    "metadata feature {} is '{}', schema expects '{}'",
                    i, got, want
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_scaler() -> Scaler {
        Scaler {
            mean: vec![0.0; FEATURE_COUNT],
            scale: vec![1.0; FEATURE_COUNT],
        }
    }

    fn unit_row(value: f64) -> Vec<f64> {
        vec![value; FEATURE_COUNT]
    }

    #[test]
    fn test_scaler_transform() {
        let scaler = Scaler {
            mean: vec![1.0; FEATURE_COUNT],
            scale: vec![2.0; FEATURE_COUNT],
        };
        let scaled = scaler.transform(&[unit_row(5.0)]);
        for j in 0..FEATURE_COUNT {
            assert!((scaled[(0, j)] - 2.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_scaler_rejects_wrong_length() {
        let scaler = Scaler {
            mean: vec![0.0; 3],
            scale: vec![1.0; 3],
        };
        assert!(scaler.validate().is_err());
    }

    #[test]
    fn test_ridge_predict() {
        let mut weights = vec![0.0; FEATURE_COUNT];
        weights[0] = 2.0;
        weights[5] = 0.5;
        let ridge = RidgeModel::from_artifact(RidgeArtifact {
            weights,
            intercept: 10.0,
        })
        .unwrap();
        let bundle = ModelBundle::from_parts(ModelKind::Ridge, Regressor::Ridge(ridge), identity_scaler());

        let mut row = vec![0.0; FEATURE_COUNT];
        row[0] = 3.0;
        row[5] = 4.0;
        let scores = bundle.predict(&[row]).unwrap();
        assert!((scores[0] - 18.0).abs() < 1e-12);
    }

    #[test]
    fn test_ridge_rejects_wrong_weight_count() {
        let artifact = RidgeArtifact {
            weights: vec![1.0; 5],
            intercept: 0.0,
        };
        assert!(RidgeModel::from_artifact(artifact).is_err());
    }

    #[test]
    fn test_svr_predict_single_support_vector() {
        // With the support vector equal to the input, the kernel is exactly 1
        let artifact = SvrArtifact {
            kernel: "rbf".to_string(),
            gamma: 0.1,
            intercept: 50.0,
            dual_coef: vec![25.0],
            support_vectors: vec![unit_row(1.0)],
        };
        let svr = SvrModel::from_artifact(artifact).unwrap();
        let bundle = ModelBundle::from_parts(ModelKind::Svr, Regressor::Svr(svr), identity_scaler());
        let scores = bundle.predict(&[unit_row(1.0)]).unwrap();
        assert!((scores[0] - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_svr_kernel_decays_with_distance() {
        let artifact = SvrArtifact {
            kernel: "rbf".to_string(),
            gamma: 0.5,
            intercept: 0.0,
            dual_coef: vec![10.0],
            support_vectors: vec![unit_row(0.0)],
        };
        let svr = SvrModel::from_artifact(artifact).unwrap();
        let bundle = ModelBundle::from_parts(ModelKind::Svr, Regressor::Svr(svr), identity_scaler());
        let near = bundle.predict(&[unit_row(0.1)]).unwrap()[0];
        let far = bundle.predict(&[unit_row(2.0)]).unwrap()[0];
        assert!(near > far);
        assert!(far >= 0.0);
    }

    #[test]
    fn test_svr_rejects_mismatched_artifact() {
        let bad_kernel = SvrArtifact {
            kernel: "poly".to_string(),
            gamma: 0.1,
            intercept: 0.0,
            dual_coef: vec![1.0],
            support_vectors: vec![unit_row(0.0)],
        };
        assert!(SvrModel::from_artifact(bad_kernel).is_err());

        let bad_width = SvrArtifact {
            kernel: "rbf".to_string(),
            gamma: 0.1,
            intercept: 0.0,
            dual_coef: vec![1.0],
            support_vectors: vec![vec![0.0; 4]],
        };
        assert!(SvrModel::from_artifact(bad_width).is_err());
    }

    #[test]
    fn test_bundle_rejects_short_row() {
        let ridge = RidgeModel::from_artifact(RidgeArtifact {
            weights: vec![0.0; FEATURE_COUNT],
            intercept: 0.0,
        })
        .unwrap();
        let bundle = ModelBundle::from_parts(ModelKind::Ridge, Regressor::Ridge(ridge), identity_scaler());
        assert!(bundle.predict(&[vec![1.0; 4]]).is_err());
    }

    #[test]
    fn test_metadata_feature_validation() {
        let good = ModelMetadata {
            model: "svr".to_string(),
            feature_names: feature_names().iter().map(|s| s.to_string()).collect(),
            r2_test: 0.7561,
            cv_r2_mean: 0.69,
            cv_r2_std: 0.05,
            trained_at: String::new(),
        };
        assert!(good.validate_features().is_ok());

        let mut permuted = good.clone();
        permuted.feature_names.swap(0, 1);
        assert!(permuted.validate_features().is_err());

        let mut truncated = good;
        truncated.feature_names.pop();
        assert!(truncated.validate_features().is_err());
    }

    #[test]
    fn test_missing_artifact_fails_closed() {
        assert!(SvrModel::load("does/not/exist.json").is_err());
        assert!(RidgeModel::load("does/not/exist.json").is_err());
        assert!(Scaler::load("does/not/exist.json").is_err());
    }
}
