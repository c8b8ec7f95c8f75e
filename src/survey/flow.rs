//! Flow evaluation: classify raw answers and move a session through its graph.

use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::error::FlowError;
use crate::session::model::CallSession;
use crate::survey::graph::{ConditionKey, SurveyGraph};
use crate::survey::model::{Question, QuestionType};

/// First integer in a transcript, with an optional fractional tail.
static NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(-?\d+)([.,]\d+)?").expect("number pattern compiles"));

const YES_WORDS: &[&str] = &["yes", "y", "yeah", "si", "oui", "true", "1"];
const NO_WORDS: &[&str] = &["no", "n", "non", "false", "0", "2"];

/// Where the flow goes next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowStep {
    /// Ask this question next.
    Next(String),
    /// Nothing left to ask.
    Complete,
}

/// Navigates one survey revision.
#[derive(Debug, Clone)]
pub struct FlowEvaluator {
    graph: Arc<SurveyGraph>,
}

impl FlowEvaluator {
    pub fn new(graph: Arc<SurveyGraph>) -> Self {
        Self { graph }
    }

    pub fn graph(&self) -> &SurveyGraph {
        &self.graph
    }

    /// Turn a raw answer into a condition key.
    ///
    /// Open ended questions never produce a key. An empty open answer is only
    /// accepted when the question is optional.
    pub fn classify(question: &Question, raw: &str) -> Result<Option<ConditionKey>, FlowError> {
        let raw = raw.trim();
        let invalid = |reason: &str| FlowError::InvalidAnswer {
            question_id: question.id.clone(),
            reason: reason.to_string(),
        };

        match question.question_type {
            QuestionType::OpenEnded => {
                if raw.is_empty() && question.required {
                    Err(invalid("an answer is required"))
                } else {
                    Ok(None)
                }
            }
            QuestionType::Numeric => {
                let caps = NUMBER
                    .captures(raw)
                    .ok_or_else(|| invalid("no number found"))?;
                if caps.get(2).is_some() {
                    return Err(invalid("expected a whole number"));
                }
                let value: i64 = caps[1]
                    .parse()
                    .map_err(|_| invalid("number out of range"))?;
                match value {
                    1 | 2 => Ok(Some(ConditionKey::Low)),
                    3 => Ok(Some(ConditionKey::Mid)),
                    4 | 5 => Ok(Some(ConditionKey::High)),
                    _ => Err(invalid("expected a number from 1 to 5")),
                }
            }
            QuestionType::YesNo => {
                let normalized = raw.to_lowercase();
                if YES_WORDS.contains(&normalized.as_str()) {
                    Ok(Some(ConditionKey::Yes))
                } else if NO_WORDS.contains(&normalized.as_str()) {
                    Ok(Some(ConditionKey::No))
                } else {
                    Err(invalid("expected yes or no"))
                }
            }
            QuestionType::MultipleChoice => {
                if let Some(option) = question.options.iter().find(|o| o.eq_ignore_ascii_case(raw)) {
                    return Ok(Some(ConditionKey::Choice(option.clone())));
                }
                raw.parse::<usize>()
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .and_then(|i| question.options.get(i))
                    .map(|option| Some(ConditionKey::Choice(option.clone())))
                    .ok_or_else(|| invalid("not one of the listed options"))
            }
        }
    }

    /// Put a session on its first unanswered question.
    ///
    /// A session that already has a position keeps it, so a retried attempt
    /// resumes where the previous one stopped.
    pub fn start(&self, session: &mut CallSession) -> Result<FlowStep, FlowError> {
        if session.flow_complete {
            return Ok(FlowStep::Complete);
        }
        if let Some(current) = &session.current_question_id {
            return Ok(FlowStep::Next(current.clone()));
        }
        let first = self.graph.first_question()?;
        session.current_question_id = Some(first.id.clone());
        Ok(FlowStep::Next(first.id.clone()))
    }

    /// Advance past the current question using the last entry in the answer
    /// log, if that entry belongs to the current question.
    ///
    /// Marks `flow_complete` when the graph runs out. Never touches `status`.
    pub fn advance(&self, session: &mut CallSession) -> Result<FlowStep, FlowError> {
        if session.flow_complete {
            return Ok(FlowStep::Complete);
        }
        let Some(current_id) = session.current_question_id.clone() else {
            return self.start(session);
        };
        let question = self.current_question(&current_id)?;

        let last = session
            .answers
            .last()
            .filter(|a| a.question_id == current_id)
            .map(|a| a.value.clone());

        let condition = match last {
            Some(raw) => Self::classify(question, &raw)?,
            None => self.unanswered(question)?,
        };
        self.step(session, &current_id, condition.as_ref())
    }

    /// Accept an answer (or its absence) for the current question and advance.
    ///
    /// Answers that fail classification are not recorded. Blank input counts
    /// as no answer.
    pub fn submit(
        &self,
        session: &mut CallSession,
        raw: Option<&str>,
    ) -> Result<FlowStep, FlowError> {
        let current_id = match self.start(session)? {
            FlowStep::Next(id) => id,
            FlowStep::Complete => return Ok(FlowStep::Complete),
        };
        let question = self.current_question(&current_id)?;

        let condition = match raw.map(str::trim).filter(|r| !r.is_empty()) {
            Some(raw) => {
                let condition = Self::classify(question, raw)?;
                session.record_answer(&current_id, raw);
                condition
            }
            None => self.unanswered(question)?,
        };
        self.step(session, &current_id, condition.as_ref())
    }

    fn current_question(&self, id: &str) -> Result<&Question, FlowError> {
        self.graph
            .question(id)
            .ok_or_else(|| FlowError::UnknownQuestion(id.to_string()))
    }

    fn unanswered(&self, question: &Question) -> Result<Option<ConditionKey>, FlowError> {
        if question.required {
            Err(FlowError::MissingRequiredAnswer {
                question_id: question.id.clone(),
            })
        } else {
            Ok(None)
        }
    }

    fn step(
        &self,
        session: &mut CallSession,
        current_id: &str,
        condition: Option<&ConditionKey>,
    ) -> Result<FlowStep, FlowError> {
        match self.graph.next_after(current_id, condition)? {
            Some(next) => {
                session.current_question_id = Some(next.id.clone());
                Ok(FlowStep::Next(next.id.clone()))
            }
            None => {
                session.flow_complete = true;
                Ok(FlowStep::Complete)
            }
        }
    }
}
