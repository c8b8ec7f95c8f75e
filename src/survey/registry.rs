//! Survey registry: validated authoring and immutable revision snapshots.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::error::{Result, SessionError};
use crate::store::Database;
use crate::survey::graph::SurveyGraph;
use crate::survey::model::{Survey, SurveyDraft};

const DEFAULT_SNAPSHOT_CAPACITY: usize = 256;

/// Least-recently-used graphs keyed by `(survey_id, revision)`. Revisions are
/// immutable, so an evicted graph is simply reloaded from the store.
struct SnapshotCache {
    entries: HashMap<(Uuid, u32), (Arc<SurveyGraph>, u64)>,
    clock: u64,
    capacity: usize,
}

impl SnapshotCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            clock: 0,
            capacity: capacity.max(1),
        }
    }

    fn get(&mut self, key: (Uuid, u32)) -> Option<Arc<SurveyGraph>> {
        self.clock += 1;
        let clock = self.clock;
        self.entries.get_mut(&key).map(|(graph, used)| {
            *used = clock;
            graph.clone()
        })
    }

    fn insert(&mut self, graph: SurveyGraph) -> Arc<SurveyGraph> {
        let key = (graph.survey().id, graph.survey().revision);
        if let Some(existing) = self.get(key) {
            return existing;
        }
        if self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, (_, used))| *used)
                .map(|(key, _)| *key);
            if let Some(oldest) = oldest {
                self.entries.remove(&oldest);
            }
        }
        self.clock += 1;
        let graph = Arc::new(graph);
        self.entries.insert(key, (graph.clone(), self.clock));
        graph
    }
}

/// Front door for survey edits. Nothing is persisted unless it validates.
pub struct SurveyRegistry {
    store: Arc<dyn Database>,
    snapshots: Mutex<SnapshotCache>,
    /// Serializes edits to the same survey.
    edit_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl SurveyRegistry {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self::with_snapshot_capacity(store, DEFAULT_SNAPSHOT_CAPACITY)
    }

    /// Keep at most `capacity` validated graphs in memory.
    pub fn with_snapshot_capacity(store: Arc<dyn Database>, capacity: usize) -> Self {
        Self {
            store,
            snapshots: Mutex::new(SnapshotCache::new(capacity)),
            edit_locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn create(&self, draft: SurveyDraft) -> Result<Survey> {
        let survey = Survey::from_draft(draft);
        let graph = SurveyGraph::new(survey.clone())?;
        warn_dead_questions(&graph);
        self.store.insert_survey(&survey).await?;
        self.cache(graph).await;

        tracing::info!(survey_id = %survey.id, title = %survey.title, "Survey created");
        Ok(survey)
    }

    /// Replace a survey's authored content as a new revision.
    ///
    /// Sessions already pinned to earlier revisions keep running against them.
    pub async fn update(&self, id: Uuid, draft: SurveyDraft) -> Result<Survey> {
        let _guard = self.lock_edits(id).await;
        let mut survey = self
            .store
            .get_survey(id)
            .await?
            .ok_or(SessionError::SurveyNotFound { id })?;

        survey.apply_draft(draft);
        survey.revision += 1;
        survey.updated_at = Utc::now();

        let graph = SurveyGraph::new(survey.clone())?;
        warn_dead_questions(&graph);
        self.store.update_survey(&survey).await?;
        self.cache(graph).await;

        tracing::info!(survey_id = %id, revision = survey.revision, "Survey updated");
        Ok(survey)
    }

    pub async fn delete(&self, id: Uuid) -> Result<bool> {
        let deleted = {
            let _guard = self.lock_edits(id).await;
            self.store.delete_survey(id).await?
        };
        self.edit_locks.lock().await.remove(&id);
        if deleted {
            tracing::info!(survey_id = %id, "Survey deleted");
        }
        Ok(deleted)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Survey>> {
        Ok(self.store.get_survey(id).await?)
    }

    pub async fn list(&self) -> Result<Vec<Survey>> {
        Ok(self.store.list_surveys().await?)
    }

    /// The graph for one accepted revision, loaded once and shared.
    pub async fn snapshot(&self, id: Uuid, revision: u32) -> Result<Arc<SurveyGraph>> {
        if let Some(graph) = self.snapshots.lock().await.get((id, revision)) {
            return Ok(graph);
        }

        let survey = self
            .store
            .get_survey_revision(id, revision)
            .await?
            .ok_or(SessionError::SurveyNotFound { id })?;
        let graph = SurveyGraph::new(survey)?;
        Ok(self.cache(graph).await)
    }

    async fn cache(&self, graph: SurveyGraph) -> Arc<SurveyGraph> {
        self.snapshots.lock().await.insert(graph)
    }

    async fn lock_edits(&self, id: Uuid) -> OwnedMutexGuard<()> {
        let lock = self.edit_locks.lock().await.entry(id).or_default().clone();
        lock.lock_owned().await
    }
}

fn warn_dead_questions(graph: &SurveyGraph) {
    let dead = graph.dead_questions();
    if !dead.is_empty() {
        tracing::warn!(
            survey_id = %graph.survey().id,
            question_ids = ?dead,
            "Survey has questions no answer sequence reaches"
        );
    }
}
