use std::{
    collections::BTreeMap,
    sync::{Arc, PoisonError, RwLock},
};

use tokio::sync::broadcast;

use crate::{
    config::{Mode, RecordingConfig},
    instrument::{Instrumented, Recorder},
    mock::MockClient,
    model::{Model, Schema},
    query::BoxFuture,
    storage::{RecordingStore, StoreError},
};

const CONNECTION_EVENT_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Open,
    Close,
}

/// Event source for a client's connection lifecycle. Events sent while nobody is subscribed
/// are dropped, so subscribe before connecting.
#[derive(Debug, Clone)]
pub struct Connection {
    events: broadcast::Sender<ConnectionEvent>,
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(CONNECTION_EVENT_CAPACITY);
        Self { events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Returns how many subscribers saw the event.
    pub fn emit(&self, event: ConnectionEvent) -> usize {
        self.events.send(event).unwrap_or(0)
    }
}

/// Waits until `wanted` arrives on `events`, skipping anything else.
pub async fn wait_for_event(
    events: &mut broadcast::Receiver<ConnectionEvent>,
    wanted: ConnectionEvent,
) -> Result<(), ClientError> {
    loop {
        match events.recv().await {
            Ok(event) if event == wanted => return Ok(()),
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => {
                return Err(ClientError::Connection(
                    "connection event source closed".to_owned(),
                ));
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    UnknownModel(String),
    Connection(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownModel(name) => write!(f, "schema hasn't been registered for model `{name}`"),
            Self::Connection(message) => f.write_str(message),
        }
    }
}

impl std::error::Error for ClientError {}

/// The client surface test code is written against.
pub trait Client: Send + Sync + std::fmt::Debug {
    /// With a schema: defines `name`, or returns the existing model of that name. Without one:
    /// looks `name` up.
    fn model(&self, name: &str, schema: Option<Schema>) -> Result<Arc<dyn Model>, ClientError>;

    fn model_names(&self) -> Vec<String>;

    fn connect(&self, uri: &str) -> BoxFuture<Result<(), ClientError>>;

    fn disconnect(&self) -> BoxFuture<Result<(), ClientError>>;

    fn connection(&self) -> &Connection;
}

/// Wraps every model of a real client for recording. Models are wrapped once per name, so
/// repeated lookups return the same instance.
#[derive(Debug)]
pub struct RecordingClient {
    inner: Arc<dyn Client>,
    recorder: Recorder,
    models: RwLock<BTreeMap<String, Arc<dyn Model>>>,
}

impl RecordingClient {
    pub fn new(inner: Arc<dyn Client>, recorder: Recorder) -> Self {
        Self {
            inner,
            recorder,
            models: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }
}

impl Client for RecordingClient {
    fn model(&self, name: &str, schema: Option<Schema>) -> Result<Arc<dyn Model>, ClientError> {
        if let Some(model) = self
            .models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return Ok(Arc::clone(model));
        }

        let inner = self.inner.model(name, schema)?;
        let mut models = self.models.write().unwrap_or_else(PoisonError::into_inner);
        let model = models.entry(name.to_owned()).or_insert_with(|| {
            Arc::new(Instrumented::record(inner, self.recorder.clone())) as Arc<dyn Model>
        });
        Ok(Arc::clone(model))
    }

    fn model_names(&self) -> Vec<String> {
        self.inner.model_names()
    }

    fn connect(&self, uri: &str) -> BoxFuture<Result<(), ClientError>> {
        self.inner.connect(uri)
    }

    fn disconnect(&self) -> BoxFuture<Result<(), ClientError>> {
        self.inner.disconnect()
    }

    fn connection(&self) -> &Connection {
        self.inner.connection()
    }
}

/// What [`instrument`] hands back: the client to use, plus access to pending recordings.
#[derive(Debug, Clone)]
pub enum InstrumentedClient {
    Live(Arc<dyn Client>),
    Record(Arc<RecordingClient>),
    Replay(Arc<MockClient>),
}

impl InstrumentedClient {
    pub fn mode(&self) -> Mode {
        match self {
            Self::Live(_) => Mode::Live,
            Self::Record(_) => Mode::Record,
            Self::Replay(_) => Mode::Replay,
        }
    }

    pub fn client(&self) -> Arc<dyn Client> {
        match self {
            Self::Live(client) => Arc::clone(client),
            Self::Record(client) => Arc::clone(client) as Arc<dyn Client>,
            Self::Replay(client) => Arc::clone(client) as Arc<dyn Client>,
        }
    }

    /// Waits for recordings still being written. A no-op outside record mode.
    pub async fn flush(&self) -> Result<(), StoreError> {
        match self {
            Self::Record(client) => client.recorder().flush().await,
            Self::Live(_) | Self::Replay(_) => Ok(()),
        }
    }

    fn as_client(&self) -> &dyn Client {
        match self {
            Self::Live(client) => client.as_ref(),
            Self::Record(client) => client.as_ref(),
            Self::Replay(client) => client.as_ref(),
        }
    }
}

impl Client for InstrumentedClient {
    fn model(&self, name: &str, schema: Option<Schema>) -> Result<Arc<dyn Model>, ClientError> {
        self.as_client().model(name, schema)
    }

    fn model_names(&self) -> Vec<String> {
        self.as_client().model_names()
    }

    fn connect(&self, uri: &str) -> BoxFuture<Result<(), ClientError>> {
        self.as_client().connect(uri)
    }

    fn disconnect(&self) -> BoxFuture<Result<(), ClientError>> {
        self.as_client().disconnect()
    }

    fn connection(&self) -> &Connection {
        self.as_client().connection()
    }
}

/// Sets up record/replay around `client`.
///
/// - live: `client` as is.
/// - record: creates the recording directory, then wraps every model `client` hands out.
/// - replay: `client` is dropped unused and a [`MockClient`] reading from the recording
///   directory takes its place.
pub fn instrument(
    client: Arc<dyn Client>,
    config: &RecordingConfig,
) -> anyhow::Result<InstrumentedClient> {
    match config.mode {
        Mode::Live => Ok(InstrumentedClient::Live(client)),
        Mode::Record => {
            let store = RecordingStore::open(&config.path)?;
            tracing::info!(path = %config.path.display(), "recording queries");
            Ok(InstrumentedClient::Record(Arc::new(RecordingClient::new(
                client,
                Recorder::new(store),
            ))))
        }
        Mode::Replay => {
            tracing::info!(path = %config.path.display(), "replaying queries");
            Ok(InstrumentedClient::Replay(Arc::new(MockClient::new(
                RecordingStore::new(&config.path),
            ))))
        }
    }
}
