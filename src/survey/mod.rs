//! Surveys: the authored questionnaire, its validated graph, and flow navigation.

pub mod flow;
pub mod graph;
pub mod model;
pub mod registry;

pub use flow::{FlowEvaluator, FlowStep};
pub use graph::{ConditionKey, SurveyGraph, validate};
pub use model::{
    Question, QuestionType, SchedulingConstraints, Survey, SurveyDraft, SurveyStatus, VoiceStyle,
};
pub use registry::SurveyRegistry;
