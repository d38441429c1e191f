use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::registry::job::Hyperparameters;

/// Semantic failure reported by the training computation itself
/// (divergence, invalid hyperparameter combination). Terminal, never
/// retried.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct TrainError(pub String);

/// Outcome of one dispatch attempt.
#[derive(Debug)]
pub enum TrainOutcome {
    /// The training function produced a model payload.
    Completed { payload: Vec<u8> },
    /// The training function failed semantically.
    Failed { reason: String },
    /// The worker died or vanished before reporting.
    WorkerLost,
    /// The attempt exceeded the per-job timeout.
    TimedOut,
    /// The attempt was cancelled before or during execution.
    Aborted,
}

/// The opaque training computation: hyperparameters in, model payload out.
#[async_trait]
pub trait Trainer: Send + Sync {
    async fn train(
        &self,
        job_id: Uuid,
        hyperparameters: &Hyperparameters,
    ) -> std::result::Result<Vec<u8>, TrainError>;
}

/// Serialized model representation produced by [`LocalTrainer`].
#[derive(Debug, Serialize)]
struct ModelDocument {
    weights: Vec<f64>,
    loss: f64,
    epochs: usize,
    hyperparameters: Hyperparameters,
}

const MAX_EPOCHS: usize = 100_000;
const TARGETS: [f64; 4] = [0.5, -0.25, 0.75, -0.5];

/// In-process reference trainer: gradient descent on a fixed quadratic
/// objective, driven by the `lr` and `epochs` hyperparameters.
///
/// Deterministic for a given hyperparameter mapping, which makes it usable
/// both as the default single-binary backend and in end-to-end tests. A
/// learning rate above 1.0 makes the descent diverge, which is reported as
/// a training failure rather than a crash.
#[derive(Debug, Clone)]
pub struct LocalTrainer {
    /// Pause between epochs, to model real per-epoch work.
    pub epoch_delay: Duration,
}

impl Default for LocalTrainer {
    fn default() -> Self {
        Self {
            epoch_delay: Duration::ZERO,
        }
    }
}

impl LocalTrainer {
    pub fn new(epoch_delay: Duration) -> Self {
        Self { epoch_delay }
    }
}

#[async_trait]
impl Trainer for LocalTrainer {
    async fn train(
        &self,
        job_id: Uuid,
        hyperparameters: &Hyperparameters,
    ) -> std::result::Result<Vec<u8>, TrainError> {
        let lr = hyperparameters.get("lr").copied().unwrap_or(0.01);
        let epochs_raw = hyperparameters.get("epochs").copied().unwrap_or(10.0);

        if lr <= 0.0 {
            return Err(TrainError(format!("lr must be positive, got {lr}")));
        }
        if epochs_raw < 1.0 || epochs_raw > MAX_EPOCHS as f64 {
            return Err(TrainError(format!(
                "epochs must be between 1 and {MAX_EPOCHS}, got {epochs_raw}"
            )));
        }
        let epochs = epochs_raw as usize;

        let mut weights = vec![1.0_f64; TARGETS.len()];
        let mut loss = f64::INFINITY;

        for epoch in 0..epochs {
            for (w, target) in weights.iter_mut().zip(TARGETS.iter()) {
                *w -= lr * 2.0 * (*w - target);
            }
            loss = weights
                .iter()
                .zip(TARGETS.iter())
                .map(|(w, t)| (w - t).powi(2))
                .sum::<f64>()
                / TARGETS.len() as f64;

            if !loss.is_finite() {
                tracing::warn!(job_id = %job_id, epoch, lr, "Training diverged");
                return Err(TrainError(format!("diverged at epoch {epoch}: loss is not finite")));
            }

            tokio::time::sleep(self.epoch_delay).await;
        }

        tracing::debug!(job_id = %job_id, epochs, loss, "Training converged");

        let doc = ModelDocument {
            weights,
            loss,
            epochs,
            hyperparameters: hyperparameters.clone(),
        };
        serde_json::to_vec(&doc).map_err(|e| TrainError(format!("failed to encode model: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn hp(pairs: &[(&str, f64)]) -> Hyperparameters {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[tokio::test]
    async fn converges_with_sane_hyperparameters() {
        let trainer = LocalTrainer::default();
        let payload = trainer
            .train(Uuid::new_v4(), &hp(&[("lr", 0.1), ("epochs", 200.0)]))
            .await
            .unwrap();

        let doc: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        let loss = doc["loss"].as_f64().unwrap();
        assert!(loss < 1e-6, "expected near-zero loss, got {loss}");
    }

    #[tokio::test]
    async fn is_deterministic() {
        let trainer = LocalTrainer::default();
        let params = hp(&[("lr", 0.05), ("epochs", 50.0)]);
        let a = trainer.train(Uuid::new_v4(), &params).await.unwrap();
        let b = trainer.train(Uuid::new_v4(), &params).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn diverges_with_large_learning_rate() {
        let trainer = LocalTrainer::default();
        let err = trainer
            .train(Uuid::new_v4(), &hp(&[("lr", 50.0), ("epochs", 500.0)]))
            .await
            .unwrap_err();
        assert!(err.0.contains("diverged"), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn rejects_non_positive_lr() {
        let trainer = LocalTrainer::default();
        let err = trainer
            .train(Uuid::new_v4(), &hp(&[("lr", -0.5)]))
            .await
            .unwrap_err();
        assert!(err.0.contains("lr must be positive"));
    }

    #[tokio::test]
    async fn rejects_bad_epochs() {
        let trainer = LocalTrainer::default();
        let err = trainer
            .train(Uuid::new_v4(), &hp(&[("epochs", 0.0)]))
            .await
            .unwrap_err();
        assert!(err.0.contains("epochs"));
    }

    #[tokio::test]
    async fn defaults_apply_when_keys_missing() {
        let trainer = LocalTrainer::default();
        let payload = trainer.train(Uuid::new_v4(), &HashMap::new()).await.unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(doc["epochs"].as_u64(), Some(10));
    }
}
