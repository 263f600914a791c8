//! Phase-gated authoring pipeline.
//!
//! Each variant carries the approved payloads of every earlier phase plus the
//! (possibly not yet generated) payload of the current one, so a later phase
//! cannot be represented without its predecessors having been approved.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::model::{Approved, Phase};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("cannot approve {requested}: session is in phase {current}")]
    OutOfOrder { requested: &'static str, current: &'static str },
    #[error("phase {0} has no generated data to approve")]
    MissingPayload(&'static str),
    #[error("session is already complete")]
    Finished,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum Pipeline {
    Analysis {
        analysis: Option<Value>,
    },
    DataExtraction {
        analysis: Approved,
        extraction: Option<Value>,
    },
    DataValidation {
        analysis: Approved,
        extraction: Approved,
        validation: Option<Value>,
    },
    Assembly {
        analysis: Approved,
        extraction: Approved,
        validation: Approved,
        assembly: Option<Value>,
    },
    Done {
        analysis: Approved,
        extraction: Approved,
        validation: Approved,
        assembly: Value,
    },
}

impl Default for Pipeline {
    fn default() -> Self {
        Pipeline::Analysis { analysis: None }
    }
}

impl Pipeline {
    pub fn phase(&self) -> Phase {
        match self {
            Pipeline::Analysis { .. } => Phase::Analysis,
            Pipeline::DataExtraction { .. } => Phase::DataExtraction,
            Pipeline::DataValidation { .. } => Phase::DataValidation,
            Pipeline::Assembly { .. } => Phase::Assembly,
            Pipeline::Done { .. } => Phase::Done,
        }
    }

    /// Generated payload of the current phase, if any.
    pub fn current_payload(&self) -> Option<&Value> {
        match self {
            Pipeline::Analysis { analysis } => analysis.as_ref(),
            Pipeline::DataExtraction { extraction, .. } => extraction.as_ref(),
            Pipeline::DataValidation { validation, .. } => validation.as_ref(),
            Pipeline::Assembly { assembly, .. } => assembly.as_ref(),
            Pipeline::Done { assembly, .. } => Some(assembly),
        }
    }

    /// Store the generated payload for the current phase.
    pub fn set_payload(&mut self, payload: Value) -> Result<(), TransitionError> {
        let slot = match self {
            Pipeline::Analysis { analysis } => analysis,
            Pipeline::DataExtraction { extraction, .. } => extraction,
            Pipeline::DataValidation { validation, .. } => validation,
            Pipeline::Assembly { assembly, .. } => assembly,
            Pipeline::Done { .. } => return Err(TransitionError::Finished),
        };
        *slot = Some(payload);
        Ok(())
    }

    /// Approved phases in pipeline order.
    pub fn approved(&self) -> Vec<(Phase, &Approved)> {
        match self {
            Pipeline::Analysis { .. } => Vec::new(),
            Pipeline::DataExtraction { analysis, .. } => vec![(Phase::Analysis, analysis)],
            Pipeline::DataValidation {
                analysis,
                extraction,
                ..
            } => vec![(Phase::Analysis, analysis), (Phase::DataExtraction, extraction)],
            Pipeline::Assembly {
                analysis,
                extraction,
                validation,
                ..
            }
            | Pipeline::Done {
                analysis,
                extraction,
                validation,
                ..
            } => vec![
                (Phase::Analysis, analysis),
                (Phase::DataExtraction, extraction),
                (Phase::DataValidation, validation),
            ],
        }
    }

    /// Approve `phase` and return the pipeline positioned at the next phase.
    ///
    /// Only the current phase can be approved, and only once its payload
    /// exists. Blank feedback is recorded as absent.
    pub fn approve(&self, phase: Phase, feedback: Option<&str>) -> Result<Pipeline, TransitionError> {
        let current = self.phase();
        if current == Phase::Done {
            return Err(TransitionError::Finished);
        }
        if phase != current {
            return Err(TransitionError::OutOfOrder {
                requested: phase.as_str(),
                current: current.as_str(),
            });
        }
        let Some(data) = self.current_payload().cloned() else {
            return Err(TransitionError::MissingPayload(current.as_str()));
        };
        let approved = Approved {
            data,
            feedback: normalize_feedback(feedback),
        };

        let next = match self.clone() {
            Pipeline::Analysis { .. } => Pipeline::DataExtraction {
                analysis: approved,
                extraction: None,
            },
            Pipeline::DataExtraction { analysis, .. } => Pipeline::DataValidation {
                analysis,
                extraction: approved,
                validation: None,
            },
            Pipeline::DataValidation {
                analysis,
                extraction,
                ..
            } => Pipeline::Assembly {
                analysis,
                extraction,
                validation: approved,
                assembly: None,
            },
            Pipeline::Assembly {
                analysis,
                extraction,
                validation,
                ..
            } => Pipeline::Done {
                analysis,
                extraction,
                validation,
                assembly: approved.data,
            },
            Pipeline::Done { .. } => return Err(TransitionError::Finished),
        };
        Ok(next)
    }
}

fn normalize_feedback(feedback: Option<&str>) -> Option<String> {
    feedback
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(str::to_string)
}
