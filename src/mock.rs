use std::{
    collections::BTreeMap,
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use serde_json::Value;

use crate::{
    client::{Client, ClientError, Connection, ConnectionEvent},
    instrument::Instrumented,
    model::{Model, Schema},
    query::BoxFuture,
    storage::RecordingStore,
};

/// Stand-in for a real client during replay.
///
/// Models live only in memory and answer every read from recordings. Nothing connects
/// anywhere: `connect` just announces [`ConnectionEvent::Open`] once, shortly after it is
/// awaited, for code that waits on that event before running queries.
#[derive(Debug)]
pub struct MockClient {
    store: RecordingStore,
    models: RwLock<BTreeMap<String, Arc<Instrumented>>>,
    connection: Connection,
    opened: Arc<AtomicBool>,
}

impl MockClient {
    pub fn new(store: RecordingStore) -> Self {
        Self {
            store,
            models: RwLock::new(BTreeMap::new()),
            connection: Connection::new(),
            opened: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn store(&self) -> &RecordingStore {
        &self.store
    }

    pub fn schema(&self, definition: Value) -> Schema {
        Schema::new(definition)
    }
}

impl Client for MockClient {
    fn model(&self, name: &str, schema: Option<Schema>) -> Result<Arc<dyn Model>, ClientError> {
        let Some(schema) = schema else {
            return self
                .models
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(name)
                .map(|model| Arc::clone(model) as Arc<dyn Model>)
                .ok_or_else(|| ClientError::UnknownModel(name.to_owned()));
        };

        let mut models = self.models.write().unwrap_or_else(PoisonError::into_inner);
        let model = models.entry(name.to_owned()).or_insert_with(|| {
            tracing::debug!(model = name, "creating model at mock");
            Arc::new(Instrumented::replay(name, Some(schema), self.store.clone()))
        });
        Ok(Arc::clone(model) as Arc<dyn Model>)
    }

    fn model_names(&self) -> Vec<String> {
        self.models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn connect(&self, uri: &str) -> BoxFuture<Result<(), ClientError>> {
        tracing::debug!(uri, "simulating connect");
        let connection = self.connection.clone();
        let opened = Arc::clone(&self.opened);
        Box::pin(async move {
            if !opened.swap(true, Ordering::SeqCst) {
                tokio::spawn(async move {
                    tokio::task::yield_now().await;
                    connection.emit(ConnectionEvent::Open);
                    tracing::debug!("fired open event");
                });
            }
            Ok(())
        })
    }

    fn disconnect(&self) -> BoxFuture<Result<(), ClientError>> {
        tracing::debug!("simulating disconnect");
        Box::pin(async { Ok(()) })
    }

    fn connection(&self) -> &Connection {
        &self.connection
    }
}
