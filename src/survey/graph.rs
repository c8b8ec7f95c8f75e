//! Survey graph — a validated, immutable view of a questionnaire.
//!
//! Questions live in an arena (the survey's question list) and edges are
//! index references, so authored cycles are harmless. Two kinds of edge exist:
//! - explicit `follow_up_logic` routes, keyed by a closed `ConditionKey`
//! - the implicit sequential edge to the next question, taken whenever no
//!   route matches

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::{FlowError, GraphValidationError};
use crate::survey::model::{Question, QuestionType, Survey};

/// Classified answer condition. The set is closed per question type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConditionKey {
    /// Numeric 1–2.
    Low,
    /// Numeric 3.
    Mid,
    /// Numeric 4–5.
    High,
    Yes,
    No,
    /// A multiple choice option, verbatim.
    Choice(String),
}

impl ConditionKey {
    /// The string used in `follow_up_logic`.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Low => "1-2",
            Self::Mid => "3",
            Self::High => "4-5",
            Self::Yes => "yes",
            Self::No => "no",
            Self::Choice(option) => option,
        }
    }

    /// Parse an authored condition key for the given question, or `None` if
    /// the key is outside that question type's closed set.
    pub fn parse_for(question: &Question, raw: &str) -> Option<Self> {
        match question.question_type {
            QuestionType::Numeric => match raw {
                "1-2" => Some(Self::Low),
                "3" => Some(Self::Mid),
                "4-5" => Some(Self::High),
                _ => None,
            },
            QuestionType::YesNo => match raw {
                "yes" => Some(Self::Yes),
                "no" => Some(Self::No),
                _ => None,
            },
            QuestionType::MultipleChoice => question
                .options
                .iter()
                .any(|o| o == raw)
                .then(|| Self::Choice(raw.to_string())),
            QuestionType::OpenEnded => None,
        }
    }

    /// Number of distinct conditions a question can produce.
    fn domain_size(question: &Question) -> usize {
        match question.question_type {
            QuestionType::Numeric => 3,
            QuestionType::YesNo => 2,
            QuestionType::MultipleChoice => {
                question.options.iter().collect::<HashSet<_>>().len()
            }
            QuestionType::OpenEnded => 0,
        }
    }
}

impl std::fmt::Display for ConditionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated survey with a navigable routing table.
#[derive(Debug, Clone)]
pub struct SurveyGraph {
    survey: Survey,
    index: HashMap<String, usize>,
    /// Per question, parallel to `survey.questions`.
    routes: Vec<HashMap<ConditionKey, usize>>,
}

impl SurveyGraph {
    /// Validate a survey and build its graph.
    pub fn new(survey: Survey) -> Result<Self, GraphValidationError> {
        let (index, routes) = build_routes(&survey)?;
        let graph = Self {
            survey,
            index,
            routes,
        };
        graph.check_reachability()?;
        Ok(graph)
    }

    pub fn survey(&self) -> &Survey {
        &self.survey
    }

    pub fn len(&self) -> usize {
        self.survey.questions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.survey.questions.is_empty()
    }

    pub fn question(&self, id: &str) -> Option<&Question> {
        self.index.get(id).map(|&i| &self.survey.questions[i])
    }

    /// The entry question.
    pub fn first_question(&self) -> Result<&Question, FlowError> {
        self.survey.questions.first().ok_or(FlowError::EmptySurvey)
    }

    /// Explicit route for `condition` if one exists, else the next question in
    /// sequence, else `None` (survey complete).
    pub fn next_after(
        &self,
        question_id: &str,
        condition: Option<&ConditionKey>,
    ) -> Result<Option<&Question>, FlowError> {
        let &i = self
            .index
            .get(question_id)
            .ok_or_else(|| FlowError::UnknownQuestion(question_id.to_string()))?;

        if let Some(&target) = condition.and_then(|c| self.routes[i].get(c)) {
            return Ok(Some(&self.survey.questions[target]));
        }
        Ok(self.survey.questions.get(i + 1))
    }

    /// Whether answering question `i` can fall through to the next in sequence.
    fn falls_through(&self, i: usize) -> bool {
        let question = &self.survey.questions[i];
        question.question_type == QuestionType::OpenEnded
            || !question.required
            || self.routes[i].len() < ConditionKey::domain_size(question)
    }

    fn successors(&self, i: usize, takeable_only: bool) -> impl Iterator<Item = usize> + '_ {
        let sequential = (i + 1 < self.len() && (!takeable_only || self.falls_through(i)))
            .then_some(i + 1);
        self.routes[i].values().copied().chain(sequential)
    }

    /// Ids of questions no traversal from the entry visits.
    fn unvisited(&self, takeable_only: bool) -> Vec<String> {
        if self.is_empty() {
            return Vec::new();
        }

        let mut visited = vec![false; self.len()];
        let mut queue = VecDeque::from([0usize]);
        visited[0] = true;

        while let Some(i) = queue.pop_front() {
            for next in self.successors(i, takeable_only) {
                if !visited[next] {
                    visited[next] = true;
                    queue.push_back(next);
                }
            }
        }

        visited
            .iter()
            .enumerate()
            .filter(|&(_, seen)| !seen)
            .map(|(i, _)| self.survey.questions[i].id.clone())
            .collect()
    }

    /// Every question must be reachable over explicit routes plus the
    /// sequential edge after each question.
    fn check_reachability(&self) -> Result<(), GraphValidationError> {
        let unreachable = self.unvisited(false);
        if unreachable.is_empty() {
            Ok(())
        } else {
            Err(GraphValidationError::Unreachable {
                question_ids: unreachable,
            })
        }
    }

    /// Questions that pass validation but that no answer sequence can reach,
    /// e.g. the one after a required yes/no whose routes both skip it.
    pub fn dead_questions(&self) -> Vec<String> {
        self.unvisited(true)
    }
}

/// Validate a survey without keeping the graph.
pub fn validate(survey: &Survey) -> Result<(), GraphValidationError> {
    SurveyGraph::new(survey.clone()).map(|_| ())
}

type RouteTable = (HashMap<String, usize>, Vec<HashMap<ConditionKey, usize>>);

fn build_routes(survey: &Survey) -> Result<RouteTable, GraphValidationError> {
    let mut index = HashMap::with_capacity(survey.questions.len());
    for (i, question) in survey.questions.iter().enumerate() {
        if index.insert(question.id.clone(), i).is_some() {
            return Err(GraphValidationError::DuplicateQuestionId {
                id: question.id.clone(),
            });
        }
    }

    let mut routes = Vec::with_capacity(survey.questions.len());
    for question in &survey.questions {
        if question.question_type == QuestionType::MultipleChoice && question.options.is_empty() {
            return Err(GraphValidationError::MissingOptions {
                question_id: question.id.clone(),
            });
        }

        let mut table = HashMap::with_capacity(question.follow_up_logic.len());
        for (condition, target) in &question.follow_up_logic {
            let key = ConditionKey::parse_for(question, condition).ok_or_else(|| {
                GraphValidationError::InvalidConditionKey {
                    question_id: question.id.clone(),
                    question_type: question.question_type.to_string(),
                    condition: condition.clone(),
                }
            })?;
            let &target_index =
                index
                    .get(target)
                    .ok_or_else(|| GraphValidationError::UnknownTarget {
                        question_id: question.id.clone(),
                        condition: condition.clone(),
                        target: target.clone(),
                    })?;
            table.insert(key, target_index);
        }
        routes.push(table);
    }

    Ok((index, routes))
}
