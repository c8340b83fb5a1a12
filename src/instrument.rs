use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinSet;

use crate::{
    canonical::QueryValue,
    config::Mode,
    digest::Operation,
    model::{Model, Schema},
    query::{Aggregate, Distinct, Documents, Find, QueryError},
    storage::{RecordingStore, StoreError},
};

/// Persists results in the background and keeps track of the writes still in flight.
///
/// Callers get their results back before the write lands. Anything not yet written when the
/// runtime shuts down is lost unless [`Recorder::flush`] was awaited first.
#[derive(Debug, Clone)]
pub struct Recorder {
    store: RecordingStore,
    pending: Arc<Mutex<PendingWrites>>,
}

#[derive(Debug, Default)]
struct PendingWrites {
    tasks: JoinSet<Result<String, StoreError>>,
    failures: Vec<StoreError>,
}

impl Recorder {
    pub fn new(store: RecordingStore) -> Self {
        Self {
            store,
            pending: Arc::new(Mutex::new(PendingWrites::default())),
        }
    }

    pub fn store(&self) -> &RecordingStore {
        &self.store
    }

    /// Schedules a write. Must be called from within a tokio runtime.
    pub fn record(&self, op: Operation, name: &str, query: QueryValue, res: Documents) {
        let store = self.store.clone();
        let name = name.to_owned();
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);

        while let Some(joined) = pending.tasks.try_join_next() {
            if let Some(err) = joined_failure(joined) {
                pending.failures.push(err);
            }
        }

        pending.tasks.spawn(async move {
            let result = store.record(op, name.clone(), query, res).await;
            if let Err(err) = &result {
                tracing::error!(%op, collection = %name, "failed to persist recording: {err}");
            }
            result
        });
    }

    /// Waits for every scheduled write and returns the first failure, if any.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let (mut tasks, mut failures) = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            (
                std::mem::take(&mut pending.tasks),
                std::mem::take(&mut pending.failures),
            )
        };

        while let Some(joined) = tasks.join_next().await {
            if let Some(err) = joined_failure(joined) {
                failures.push(err);
            }
        }

        match failures.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn joined_failure(
    joined: Result<Result<String, StoreError>, tokio::task::JoinError>,
) -> Option<StoreError> {
    match joined {
        Ok(Ok(_digest)) => None,
        Ok(Err(err)) => Some(err),
        Err(err) => Some(StoreError::Internal(format!(
            "join recording task failed: {err}"
        ))),
    }
}

/// A model wrapped for one mode. Holds the underlying model (if any) and exposes the same
/// three operations; nothing about the underlying model is modified.
#[derive(Debug)]
pub struct Instrumented {
    name: String,
    schema: Option<Schema>,
    strategy: Strategy,
}

#[derive(Debug)]
enum Strategy {
    Live(Arc<dyn Model>),
    Record {
        inner: Arc<dyn Model>,
        recorder: Recorder,
    },
    Replay {
        store: RecordingStore,
    },
}

impl Instrumented {
    /// Wraps `inner` for `mode`. In replay mode `inner` only lends its name and schema.
    pub fn new(inner: Arc<dyn Model>, mode: Mode, recorder: &Recorder) -> Self {
        match mode {
            Mode::Live => Self::live(inner),
            Mode::Record => Self::record(inner, recorder.clone()),
            Mode::Replay => Self::replay(
                inner.model_name(),
                inner.schema().cloned(),
                recorder.store().clone(),
            ),
        }
    }

    pub fn live(inner: Arc<dyn Model>) -> Self {
        Self {
            name: inner.model_name().to_owned(),
            schema: inner.schema().cloned(),
            strategy: Strategy::Live(inner),
        }
    }

    pub fn record(inner: Arc<dyn Model>, recorder: Recorder) -> Self {
        tracing::info!(
            model = inner.model_name(),
            "instrumenting model for recording"
        );
        Self {
            name: inner.model_name().to_owned(),
            schema: inner.schema().cloned(),
            strategy: Strategy::Record { inner, recorder },
        }
    }

    /// A model with no backing implementation at all; every call is served from `store`.
    pub fn replay(name: &str, schema: Option<Schema>, store: RecordingStore) -> Self {
        tracing::debug!(model = name, "instrumenting model for replay");
        Self {
            name: name.to_owned(),
            schema,
            strategy: Strategy::Replay { store },
        }
    }

    pub fn mode(&self) -> Mode {
        match self.strategy {
            Strategy::Live(_) => Mode::Live,
            Strategy::Record { .. } => Mode::Record,
            Strategy::Replay { .. } => Mode::Replay,
        }
    }

    /// Reads the recording for a call once the returned future is polled. The file read runs
    /// on the blocking pool.
    fn replayed(
        &self,
        op: Operation,
        query: QueryValue,
    ) -> impl Future<Output = Result<Documents, QueryError>> + Send + 'static {
        let store = match &self.strategy {
            Strategy::Replay { store } => Some(store.clone()),
            _ => None,
        };
        let name = self.name.clone();
        async move {
            let Some(store) = store else {
                return Err(QueryError::Unsupported(format!(
                    "model `{name}` is not replaying"
                )));
            };
            Ok(store.retrieve(op, name, query).await?)
        }
    }
}

impl Model for Instrumented {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> Option<&Schema> {
        self.schema.as_ref()
    }

    fn find(&self, filter: QueryValue) -> Find {
        match &self.strategy {
            Strategy::Live(inner) => inner.find(filter),
            Strategy::Record { inner, recorder } => {
                tracing::debug!(model = %self.name, "recording find");
                let pending = inner.find(filter.clone()).lean();
                let recorder = recorder.clone();
                let name = self.name.clone();
                Find::new(async move {
                    let docs = pending.exec().await?;
                    recorder.record(Operation::Find, &name, filter, docs.clone());
                    Ok(docs)
                })
            }
            Strategy::Replay { .. } => {
                tracing::debug!(model = %self.name, "replaying find");
                Find::new(self.replayed(Operation::Find, filter))
            }
        }
    }

    fn distinct(&self, field: QueryValue) -> Distinct {
        match &self.strategy {
            Strategy::Live(inner) => inner.distinct(field),
            Strategy::Record { inner, recorder } => {
                tracing::debug!(model = %self.name, "recording distinct");
                let pending = inner.distinct(field.clone());
                let recorder = recorder.clone();
                let name = self.name.clone();
                Distinct::new(async move {
                    let values = pending.await?;
                    recorder.record(Operation::Distinct, &name, field, values.clone());
                    Ok(values)
                })
            }
            Strategy::Replay { .. } => {
                tracing::debug!(model = %self.name, "replaying distinct");
                Distinct::new(self.replayed(Operation::Distinct, field))
            }
        }
    }

    fn aggregate(&self, pipeline: Vec<QueryValue>) -> Aggregate {
        match &self.strategy {
            Strategy::Live(inner) => inner.aggregate(pipeline),
            Strategy::Record { inner, recorder } => {
                tracing::debug!(model = %self.name, stages = pipeline.len(), "recording aggregate");
                let query = QueryValue::Array(pipeline.clone());
                let pending = inner.aggregate(pipeline);
                let recorder = recorder.clone();
                let name = self.name.clone();
                Aggregate::new(async move {
                    let docs = pending.await?;
                    recorder.record(Operation::Aggregate, &name, query, docs.clone());
                    Ok(docs)
                })
            }
            Strategy::Replay { .. } => {
                tracing::debug!(model = %self.name, stages = pipeline.len(), "replaying aggregate");
                Aggregate::new(self.replayed(Operation::Aggregate, QueryValue::Array(pipeline)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::{Instrumented, Recorder};
    use crate::{
        canonical::QueryValue,
        config::Mode,
        digest::{Operation, compute_digest},
        memory::MemoryModel,
        model::{Model, Schema},
        query::QueryError,
        storage::{RecordingStore, StoreError},
    };

    fn seeded_users() -> Arc<MemoryModel> {
        let model = Arc::new(MemoryModel::new(
            "users",
            Some(Schema::new(json!({ "name": "String" }))),
        ));
        model.insert_many(vec![
            json!({ "name": "ada", "team": "core" }),
            json!({ "name": "grace", "team": "core" }),
            json!({ "name": "linus", "team": "kernel" }),
        ]);
        model
    }

    #[tokio::test]
    async fn record_mode_returns_live_results_and_persists_them() {
        let temp_dir = tempfile::tempdir().unwrap();
        let recorder = Recorder::new(RecordingStore::open(temp_dir.path()).unwrap());
        let model = Instrumented::new(seeded_users(), Mode::Record, &recorder);
        assert_eq!(model.mode(), Mode::Record);

        let filter = QueryValue::from(json!({ "team": "core" }));
        let docs = model.find(filter.clone()).lean().exec().await.unwrap();
        assert_eq!(docs.len(), 2);

        recorder.flush().await.unwrap();
        let digest = compute_digest(Operation::Find, "users", &filter);
        let index = recorder.store().load_index().await.unwrap();
        assert_eq!(index.get(&digest).map(|entry| &entry.res), Some(&docs));
    }

    #[tokio::test]
    async fn replay_mode_never_touches_the_inner_model() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = RecordingStore::open(temp_dir.path()).unwrap();
        let recorded = vec![json!("recorded")];
        store
            .record_blocking(
                Operation::Distinct,
                "users",
                QueryValue::from("team"),
                recorded.clone(),
            )
            .unwrap();

        let recorder = Recorder::new(store);
        let model = Instrumented::new(seeded_users(), Mode::Replay, &recorder);
        assert_eq!(model.schema(), Some(&Schema::new(json!({ "name": "String" }))));

        let values = model.distinct(QueryValue::from("team")).await.unwrap();
        assert_eq!(values, recorded);
    }

    #[tokio::test]
    async fn replay_reads_the_recording_when_awaited() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = RecordingStore::open(temp_dir.path()).unwrap();
        let model = Instrumented::replay("users", None, store.clone());
        let filter = QueryValue::from(json!({ "name": "ada" }));

        let pending = model.find(filter.clone());
        store
            .record_blocking(Operation::Find, "users", filter, vec![json!({ "name": "ada" })])
            .unwrap();

        let docs = pending.lean().exec().await.unwrap();
        assert_eq!(docs, vec![json!({ "name": "ada" })]);
    }

    #[tokio::test]
    async fn replay_without_recording_fails_with_path() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = RecordingStore::new(temp_dir.path());
        let pipeline = vec![QueryValue::from(json!({ "$match": {} }))];
        let expected = store.entry_path(&compute_digest(
            Operation::Aggregate,
            "users",
            &QueryValue::Array(pipeline.clone()),
        ));
        let model = Instrumented::replay("users", None, store);

        let err = model.aggregate(pipeline).exec().await.unwrap_err();
        match err {
            QueryError::Store(StoreError::MissingRecording { path, .. }) => {
                assert_eq!(path, expected)
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn live_mode_passes_through_without_recording() {
        let temp_dir = tempfile::tempdir().unwrap();
        let recorder = Recorder::new(RecordingStore::new(temp_dir.path().join("unused")));
        let model = Instrumented::new(seeded_users(), Mode::Live, &recorder);

        let docs = model
            .aggregate(vec![QueryValue::from(json!({ "$count": "n" }))])
            .await
            .unwrap();
        assert_eq!(docs, vec![json!({ "n": 3 })]);

        recorder.flush().await.unwrap();
        assert!(!temp_dir.path().join("unused").exists());
    }

    #[tokio::test]
    async fn failed_live_query_is_not_recorded() {
        let temp_dir = tempfile::tempdir().unwrap();
        let recorder = Recorder::new(RecordingStore::open(temp_dir.path()).unwrap());
        let model = Instrumented::record(seeded_users(), recorder.clone());

        let err = model
            .aggregate(vec![QueryValue::from(json!({ "$lookup": {} }))])
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Unsupported(_)), "{err:?}");

        recorder.flush().await.unwrap();
        assert!(recorder.store().load_index().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn flush_reports_write_failures() {
        let temp_dir = tempfile::tempdir().unwrap();
        // No layout: the data directory is missing, so the result file cannot be written.
        let recorder = Recorder::new(RecordingStore::new(temp_dir.path().join("missing")));
        let model = Instrumented::record(seeded_users(), recorder.clone());

        model
            .find(QueryValue::from(json!({})))
            .lean()
            .exec()
            .await
            .expect("caller still gets the live result");

        let err = recorder.flush().await.unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }), "{err:?}");
    }
}
