//! Batch matching pipeline.
//!
//! One logical worker walks a snapshot of the unprocessed photos in FIFO
//! order. For each photo it loads the bytes, asks the oracle for every face,
//! keeps the face closest to the reference and writes the outcome. A failing
//! photo is recorded and skipped; it never aborts the run.

use crate::oracle::{EmbeddingOracle, OracleError};
use crate::progress::{NullSink, ProgressSink};
use crate::schedule::{CancelFlag, CooperativeYield, Yielder};
use crate::state::{RunState, RunStatus};
use crate::store::{PhotoFilter, PhotoUpdate, StoreError, Stores};
use facesift_core::{ComparisonResult, DetectedFace, FaceEmbedding, ScoreError, Scorer};
use std::sync::Arc;
use thiserror::Error;

/// Errors that end a run before any photo is touched.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("no reference face calibrated; capture a selfie before scanning")]
    NoReference,
    #[error(
        "reference embedding has {reference} dimensions but the recognition model produces {model}; recalibrate the reference face"
    )]
    ReferenceDimension { reference: usize, model: usize },
    #[error("model initialization failed: {0}")]
    ModelInit(#[source] OracleError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// Errors confined to one photo.
#[derive(Error, Debug)]
enum ItemError {
    #[error("load: {0}")]
    Load(#[from] StoreError),
    #[error("oracle: {0}")]
    Oracle(#[from] OracleError),
    #[error("compare: {0}")]
    Compare(#[from] ScoreError),
}

/// What the oracle and scorer concluded about one photo.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PhotoOutcome {
    NoFace,
    /// At least one face; `best` is `None` when no face had an embedding.
    Faces { best: Option<ComparisonResult> },
}

impl PhotoOutcome {
    pub fn is_match(&self) -> bool {
        matches!(self, PhotoOutcome::Faces { best: Some(r) } if r.matched)
    }

    pub fn to_update(&self) -> PhotoUpdate {
        match self {
            PhotoOutcome::NoFace => PhotoUpdate::no_face(),
            PhotoOutcome::Faces { best: Some(r) } => PhotoUpdate::outcome(true, r.matched, Some(r.confidence)),
            PhotoOutcome::Faces { best: None } => PhotoUpdate::outcome(true, false, None),
        }
    }
}

/// Compare every face that has an embedding and keep the closest one.
///
/// Ties keep the face seen first.
pub fn select_best(
    scorer: &Scorer,
    reference: &FaceEmbedding,
    faces: &[DetectedFace],
) -> Result<Option<ComparisonResult>, ScoreError> {
    let mut best: Option<ComparisonResult> = None;
    for embedding in faces.iter().filter_map(|f| f.embedding.as_ref()) {
        let result = scorer.compare(embedding, reference)?;
        match &best {
            Some(incumbent) if !scorer.is_better(&result, incumbent) => {}
            _ => best = Some(result),
        }
    }
    Ok(best)
}

pub struct BatchPipeline {
    oracle: Arc<dyn EmbeddingOracle>,
    scorer: Scorer,
    stores: Stores,
    sink: Arc<dyn ProgressSink>,
    yielder: Arc<dyn Yielder>,
    cancel: CancelFlag,
}

impl BatchPipeline {
    pub fn new(oracle: Arc<dyn EmbeddingOracle>, scorer: Scorer, stores: Stores) -> Self {
        Self {
            oracle,
            scorer,
            stores,
            sink: Arc::new(NullSink),
            yielder: Arc::new(CooperativeYield),
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_yielder(mut self, yielder: Arc<dyn Yielder>) -> Self {
        self.yielder = yielder;
        self
    }

    /// Handle for cancelling from another task or thread.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Run one pass over the unprocessed photos and return the final state.
    ///
    /// Starting a run clears any earlier cancellation request. Fatal errors
    /// are reported through `status == Error` rather than `Err`.
    pub async fn run(&mut self) -> RunState {
        self.cancel.reset();
        let mut state = RunState::default();
        self.sink.publish(&state);

        let reference = match self.preflight().await {
            Ok(reference) => reference,
            Err(e) => {
                tracing::error!(error = %e, "run rejected");
                self.fail(&mut state, &e);
                return state;
            }
        };

        self.enter(&mut state, RunStatus::InitializingModel);
        if let Err(e) = self.oracle.initialize().await {
            let e = PipelineError::ModelInit(e);
            tracing::error!(error = %e, "oracle initialization failed");
            self.fail(&mut state, &e);
            return state;
        }

        // Snapshot: photos ingested after this point wait for the next run.
        let queue: Vec<String> = match self.stores.records.query(PhotoFilter::unprocessed()).await {
            Ok(records) => records.into_iter().map(|r| r.id).collect(),
            Err(e) => {
                let e = PipelineError::Store(e);
                tracing::error!(error = %e, "failed to snapshot candidate queue");
                self.fail(&mut state, &e);
                return state;
            }
        };
        state.total = queue.len();

        if queue.is_empty() {
            tracing::info!("no unprocessed photos");
            self.enter(&mut state, RunStatus::Complete);
            return state;
        }

        self.enter(&mut state, RunStatus::Running);
        tracing::info!(total = state.total, metric = %self.scorer.metric(), "run started");

        let last = queue.len() - 1;
        for (i, id) in queue.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                tracing::info!(processed = state.processed, remaining = state.remaining(), "run cancelled");
                state.current_id = None;
                self.enter(&mut state, RunStatus::Idle);
                return state;
            }

            state.current_id = Some(id.clone());
            self.sink.publish(&state);

            let matched = self.process_and_record(&id, &reference, &mut state).await;
            state.record_item(matched);
            self.sink.publish(&state);

            if i < last {
                self.yielder.yield_now().await;
            }
        }

        state.current_id = None;
        self.enter(&mut state, RunStatus::Complete);
        tracing::info!(
            processed = state.processed,
            matched = state.matched,
            failed = state.failed_ids.len(),
            "run complete"
        );
        state
    }

    /// Read the reference once and check it against the active model.
    async fn preflight(&self) -> Result<FaceEmbedding, PipelineError> {
        let reference = self.stores.reference.get().await?.ok_or(PipelineError::NoReference)?;
        let model = self.oracle.embedding_dim();
        if reference.dim() != model {
            return Err(PipelineError::ReferenceDimension {
                reference: reference.dim(),
                model,
            });
        }
        Ok(reference)
    }

    /// Process one photo and persist its outcome. Returns whether it matched.
    async fn process_and_record(&self, id: &str, reference: &FaceEmbedding, state: &mut RunState) -> bool {
        match self.process_one(id, reference).await {
            Ok(outcome) => match self.stores.records.upsert(id, outcome.to_update()).await {
                Ok(()) => {
                    tracing::debug!(id, ?outcome, "photo processed");
                    outcome.is_match()
                }
                Err(e) => {
                    tracing::warn!(id, error = %e, "failed to record outcome");
                    state.record_failure(id);
                    false
                }
            },
            Err(e) => {
                tracing::warn!(id, error = %e, "photo failed; continuing");
                state.record_failure(id);
                if let Err(e) = self.stores.records.upsert(id, PhotoUpdate::processed_only()).await {
                    tracing::error!(id, error = %e, "failed to mark failed photo processed");
                }
                false
            }
        }
    }

    async fn process_one(&self, id: &str, reference: &FaceEmbedding) -> Result<PhotoOutcome, ItemError> {
        let bytes = self.stores.blobs.read(id).await?;
        let faces = self.oracle.detect_all(bytes).await?;
        if faces.is_empty() {
            return Ok(PhotoOutcome::NoFace);
        }
        let best = select_best(&self.scorer, reference, &faces)?;
        Ok(PhotoOutcome::Faces { best })
    }

    fn enter(&self, state: &mut RunState, next: RunStatus) {
        if let Err(e) = state.transition(next) {
            tracing::error!(error = %e, "run state machine violated");
        }
        self.sink.publish(state);
    }

    fn fail(&self, state: &mut RunState, error: &PipelineError) {
        if let Err(e) = state.fail(error.to_string()) {
            tracing::error!(error = %e, "run state machine violated");
        }
        self.sink.publish(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facesift_core::{BoundingBox, Metric, ScorerConfig};

    fn face(values: Vec<f32>) -> DetectedFace {
        DetectedFace {
            bbox: BoundingBox {
                x: 0.0, y: 0.0, width: 10.0, height: 10.0,
                confidence: 0.9, landmarks: None,
            },
            embedding: Some(FaceEmbedding::new(values)),
        }
    }

    fn faceless_embedding() -> DetectedFace {
        DetectedFace { embedding: None, ..face(vec![]) }
    }

    #[test]
    fn test_select_best_minimum_distance_any_order() {
        let scorer = Scorer::new(ScorerConfig::new(Metric::Euclidean).with_threshold(0.5));
        let reference = FaceEmbedding::new(vec![0.0, 0.0]);
        let orders = [
            vec![face(vec![0.3, 0.0]), face(vec![0.1, 0.0]), face(vec![0.7, 0.0])],
            vec![face(vec![0.7, 0.0]), face(vec![0.3, 0.0]), face(vec![0.1, 0.0])],
            vec![face(vec![0.1, 0.0]), face(vec![0.7, 0.0]), face(vec![0.3, 0.0])],
        ];
        for faces in orders {
            let best = select_best(&scorer, &reference, &faces).unwrap().unwrap();
            assert!((best.distance - 0.1).abs() < 1e-6);
            assert!(best.matched);
            assert!((best.confidence - 0.9).abs() < 1e-6);
        }
    }

    #[test]
    fn test_select_best_tie_keeps_first() {
        let scorer = Scorer::new(ScorerConfig::new(Metric::Cosine));
        let reference = FaceEmbedding::new(vec![1.0, 0.0]);
        let mut first = face(vec![0.6, 0.8]);
        first.bbox.confidence = 0.99;
        let mut second = face(vec![0.6, -0.8]);
        second.bbox.confidence = 0.5;
        let faces = [first, second];
        let best = select_best(&scorer, &reference, &faces).unwrap().unwrap();
        let expected = scorer.compare(faces[0].embedding.as_ref().unwrap(), &reference).unwrap();
        assert_eq!(best, expected);
    }

    #[test]
    fn test_select_best_skips_faces_without_embedding() {
        let scorer = Scorer::default();
        let reference = FaceEmbedding::new(vec![1.0, 0.0]);
        assert_eq!(select_best(&scorer, &reference, &[faceless_embedding()]).unwrap(), None);

        let best = select_best(&scorer, &reference, &[faceless_embedding(), face(vec![1.0, 0.0])]).unwrap();
        assert!(best.unwrap().matched);
    }

    #[test]
    fn test_select_best_dimension_mismatch_fails_loudly() {
        let scorer = Scorer::default();
        let reference = FaceEmbedding::new(vec![1.0, 0.0, 0.0]);
        let err = select_best(&scorer, &reference, &[face(vec![1.0, 0.0])]).unwrap_err();
        assert_eq!(err, ScoreError::DimensionMismatch { left: 2, right: 3 });
    }

    #[test]
    fn test_outcome_updates() {
        assert_eq!(PhotoOutcome::NoFace.to_update(), PhotoUpdate::no_face());
        assert!(!PhotoOutcome::NoFace.is_match());

        let none = PhotoOutcome::Faces { best: None };
        assert_eq!(none.to_update(), PhotoUpdate::outcome(true, false, None));

        let hit = ComparisonResult { matched: true, distance: 0.2, similarity: 0.9, confidence: 0.9 };
        let outcome = PhotoOutcome::Faces { best: Some(hit) };
        assert!(outcome.is_match());
        assert_eq!(outcome.to_update(), PhotoUpdate::outcome(true, true, Some(0.9)));
    }
}
