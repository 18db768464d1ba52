//! Per-query stage tracking.

use crate::error::RagError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;
use thiserror::Error;

/// Stages a query moves through.
///
/// ```text
/// Embedding -> Retrieving -> [Reranking] -> PromptBuilding -> Generating -> Completed
///                   \              \
///                    `-> Completed  `-> Completed      (retrieval only / no context)
/// any non-terminal stage -> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStage {
    /// Turning the query text into a vector.
    Embedding,
    /// Searching the vector index.
    Retrieving,
    /// Refining candidates with the relevance model.
    Reranking,
    /// Assembling the grounded prompt.
    PromptBuilding,
    /// Waiting for the generator.
    Generating,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
}

impl QueryStage {
    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether moving from `self` to `next` is allowed.
    pub fn can_advance_to(self, next: QueryStage) -> bool {
        use QueryStage::*;
        match (self, next) {
            (Completed | Failed, _) => false,
            (_, Failed) => true,
            (Embedding, Retrieving) => true,
            (Retrieving, Reranking | PromptBuilding | Completed) => true,
            (Reranking, PromptBuilding | Completed) => true,
            (PromptBuilding, Generating) => true,
            (Generating, Completed) => true,
            _ => false,
        }
    }

    /// Lower-case label used in logs and persisted query logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Embedding => "embedding",
            Self::Retrieving => "retrieving",
            Self::Reranking => "reranking",
            Self::PromptBuilding => "prompt_building",
            Self::Generating => "generating",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for QueryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected stage change.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal query transition from {from} to {to}")]
pub struct IllegalTransition {
    /// Stage the run was in.
    pub from: QueryStage,
    /// Stage that was requested.
    pub to: QueryStage,
}

impl From<IllegalTransition> for RagError {
    fn from(error: IllegalTransition) -> Self {
        RagError::Validation(error.to_string())
    }
}

/// State of a single in-flight query.
#[derive(Debug)]
pub struct QueryRun {
    stage: QueryStage,
    last_active: QueryStage,
    started: Instant,
}

impl QueryRun {
    /// Start a run in the `Embedding` stage.
    pub fn start() -> Self {
        Self {
            stage: QueryStage::Embedding,
            last_active: QueryStage::Embedding,
            started: Instant::now(),
        }
    }

    /// Current stage.
    pub fn stage(&self) -> QueryStage {
        self.stage
    }

    /// Last non-terminal stage; for a failed run this is where the failure happened.
    pub fn last_active(&self) -> QueryStage {
        self.last_active
    }

    /// Move to `next`, rejecting transitions outside the stage graph.
    pub fn advance(&mut self, next: QueryStage) -> Result<(), IllegalTransition> {
        if !self.stage.can_advance_to(next) {
            return Err(IllegalTransition {
                from: self.stage,
                to: next,
            });
        }
        tracing::trace!(from = %self.stage, to = %next, "Query stage transition");
        if !next.is_terminal() {
            self.last_active = next;
        }
        self.stage = next;
        Ok(())
    }

    /// Mark the run failed, returning the stage that was active. Terminal runs are left as is.
    pub fn fail(&mut self) -> QueryStage {
        if !self.stage.is_terminal() {
            self.stage = QueryStage::Failed;
        }
        self.last_active
    }

    /// Milliseconds since the run started.
    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_query_path_is_legal() {
        let mut run = QueryRun::start();
        for stage in [
            QueryStage::Retrieving,
            QueryStage::Reranking,
            QueryStage::PromptBuilding,
            QueryStage::Generating,
            QueryStage::Completed,
        ] {
            run.advance(stage).expect("legal transition");
        }
        assert_eq!(run.stage(), QueryStage::Completed);
        assert_eq!(run.last_active(), QueryStage::Generating);
    }

    #[test]
    fn retrieval_only_completes_after_retrieving() {
        let mut run = QueryRun::start();
        run.advance(QueryStage::Retrieving).expect("retrieving");
        run.advance(QueryStage::Completed).expect("completed");
    }

    #[test]
    fn skipping_stages_is_rejected() {
        let mut run = QueryRun::start();
        assert_eq!(
            run.advance(QueryStage::Generating),
            Err(IllegalTransition {
                from: QueryStage::Embedding,
                to: QueryStage::Generating,
            })
        );
        assert_eq!(run.stage(), QueryStage::Embedding);
    }

    #[test]
    fn terminal_stages_are_final() {
        let mut run = QueryRun::start();
        run.advance(QueryStage::Retrieving).expect("retrieving");
        assert_eq!(run.fail(), QueryStage::Retrieving);
        assert_eq!(run.stage(), QueryStage::Failed);
        assert!(run.advance(QueryStage::PromptBuilding).is_err());
        assert!(run.advance(QueryStage::Failed).is_err());
    }

    #[test]
    fn stage_labels_match_serialized_form() {
        let json = serde_json::to_string(&QueryStage::PromptBuilding).expect("json");
        assert_eq!(json, "\"prompt_building\"");
        assert_eq!(QueryStage::PromptBuilding.to_string(), "prompt_building");
    }
}
