use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use anyhow::Context as _;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{
    canonical::{self, QueryValue},
    digest::{Operation, compute_digest},
    layout,
};

/// Index contents: digest to entry, ordered by digest so rewrites are stable.
pub type Index = BTreeMap<String, RecordedEntry>;

/// Recorded queries under one root directory.
///
/// Cloning is cheap and clones share the write lock, so every recorder in a process that writes
/// to the same root should hold a clone of one store.
#[derive(Debug, Clone)]
pub struct RecordingStore {
    root: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEntry {
    pub op: Operation,
    pub name: String,
    pub digest: String,
    pub query: QueryValue,
    pub res: Vec<Value>,
}

#[derive(Debug)]
pub enum StoreError {
    MissingRecording {
        path: PathBuf,
        source: io::Error,
    },
    CorruptFixture {
        path: PathBuf,
        source: serde_json::Error,
    },
    Io {
        action: &'static str,
        path: PathBuf,
        source: io::Error,
    },
    Serialize {
        path: PathBuf,
        source: serde_json::Error,
    },
    Internal(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingRecording { path, .. } => {
                write!(f, "did not find query result recording ({})", path.display())
            }
            Self::CorruptFixture { path, .. } => {
                write!(f, "content of file {} is not JSON", path.display())
            }
            Self::Io { action, path, .. } => write!(f, "{action} {}", path.display()),
            Self::Serialize { path, .. } => write!(f, "serialize {}", path.display()),
            Self::Internal(message) => f.write_str(message),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::MissingRecording { source, .. } | Self::Io { source, .. } => Some(source),
            Self::CorruptFixture { source, .. } | Self::Serialize { source, .. } => Some(source),
            Self::Internal(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyProblem {
    /// The key in the index is not the digest of the entry's own operation, name and query.
    DigestMismatch { computed: String },
    MissingEntryFile,
    CorruptEntryFile,
    /// `data/<digest>.json` holds a different result than the index.
    ResultMismatch,
}

impl std::fmt::Display for VerifyProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DigestMismatch { computed } => {
                write!(f, "index key does not match computed digest {computed}")
            }
            Self::MissingEntryFile => f.write_str("result file is missing"),
            Self::CorruptEntryFile => f.write_str("result file is not JSON"),
            Self::ResultMismatch => f.write_str("result file differs from index"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyIssue {
    pub digest: String,
    pub problem: VerifyProblem,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub entries_checked: usize,
    pub issues: Vec<VerifyIssue>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

impl RecordingStore {
    /// A store over `root` without touching the filesystem. Replay only reads, so this is all it
    /// needs.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// A store over `root` with the directory layout created, ready for recording.
    pub fn open(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let store = Self::new(root);
        layout::ensure_layout(&store.root)
            .with_context(|| format!("prepare recording root {}", store.root.display()))?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index_path(&self) -> PathBuf {
        layout::index_path(&self.root)
    }

    pub fn entry_path(&self, digest: &str) -> PathBuf {
        layout::entry_path(&self.root, digest)
    }

    pub async fn record(
        &self,
        op: Operation,
        name: String,
        query: QueryValue,
        res: Vec<Value>,
    ) -> Result<String, StoreError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.record_blocking(op, &name, query, res))
            .await
            .map_err(|err| StoreError::Internal(format!("join record task failed: {err}")))?
    }

    /// Writes the result file, then rewrites the index with the entry inserted. Both writes
    /// happen under the store's write lock, so the result file and the index always agree.
    /// Returns the digest.
    pub fn record_blocking(
        &self,
        op: Operation,
        name: &str,
        query: QueryValue,
        res: Vec<Value>,
    ) -> Result<String, StoreError> {
        let digest = compute_digest(op, name, &query);
        tracing::debug!(%op, collection = name, %digest, "recording query result");

        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let entry_path = self.entry_path(&digest);
        write_json(&entry_path, &res, "write result file")?;

        let index_path = self.index_path();
        let mut index = load_index_at(&index_path)?;
        index.insert(
            digest.clone(),
            RecordedEntry {
                op,
                name: name.to_owned(),
                digest: digest.clone(),
                query,
                res,
            },
        );
        write_json(&index_path, &index, "write index")?;

        Ok(digest)
    }

    pub async fn retrieve(
        &self,
        op: Operation,
        name: String,
        query: QueryValue,
    ) -> Result<Vec<Value>, StoreError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.retrieve_blocking(op, &name, &query))
            .await
            .map_err(|err| StoreError::Internal(format!("join retrieve task failed: {err}")))?
    }

    /// Reads the recorded result for a call.
    ///
    /// A failed read is logged with the expected path and the query before being returned.
    pub fn retrieve_blocking(
        &self,
        op: Operation,
        name: &str,
        query: &QueryValue,
    ) -> Result<Vec<Value>, StoreError> {
        let digest = compute_digest(op, name, query);
        let path = self.entry_path(&digest);
        tracing::debug!(%op, collection = name, path = %path.display(), "replaying query");

        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(source) => {
                tracing::error!(
                    path = %path.display(),
                    collection = name,
                    operation = %op,
                    query = %canonical::to_string(query),
                    "did not find query result recording: {source}"
                );
                return Err(StoreError::MissingRecording { path, source });
            }
        };
        let res: Vec<Value> = parse_json(&path, &text)?;
        if res.is_empty() {
            tracing::debug!(%op, collection = name, path = %path.display(), "empty result for query");
        }
        Ok(res)
    }

    pub async fn load_index(&self) -> Result<Index, StoreError> {
        let index_path = self.index_path();
        tokio::task::spawn_blocking(move || load_index_at(&index_path))
            .await
            .map_err(|err| StoreError::Internal(format!("join load index task failed: {err}")))?
    }

    pub fn load_index_blocking(&self) -> Result<Index, StoreError> {
        load_index_at(&self.index_path())
    }

    /// Cross-checks every index entry against its digest and its result file.
    pub fn verify_blocking(&self) -> Result<VerifyReport, StoreError> {
        let index = self.load_index_blocking()?;
        let mut report = VerifyReport {
            entries_checked: index.len(),
            issues: Vec::new(),
        };

        for (digest, entry) in &index {
            let computed = compute_digest(entry.op, &entry.name, &entry.query);
            if &computed != digest {
                report.issues.push(VerifyIssue {
                    digest: digest.clone(),
                    problem: VerifyProblem::DigestMismatch { computed },
                });
            }

            let problem = match fs::read_to_string(self.entry_path(digest)) {
                Err(_) => Some(VerifyProblem::MissingEntryFile),
                Ok(text) => match serde_json::from_str::<Vec<Value>>(&text) {
                    Err(_) => Some(VerifyProblem::CorruptEntryFile),
                    Ok(res) if res != entry.res => Some(VerifyProblem::ResultMismatch),
                    Ok(_) => None,
                },
            };
            if let Some(problem) = problem {
                report.issues.push(VerifyIssue {
                    digest: digest.clone(),
                    problem,
                });
            }
        }

        Ok(report)
    }
}

fn load_index_at(path: &Path) -> Result<Index, StoreError> {
    match fs::read_to_string(path) {
        Ok(text) => parse_json(path, &text),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Index::new()),
        Err(source) => Err(StoreError::Io {
            action: "read index",
            path: path.to_owned(),
            source,
        }),
    }
}

fn parse_json<T: DeserializeOwned>(path: &Path, text: &str) -> Result<T, StoreError> {
    serde_json::from_str(text).map_err(|source| {
        tracing::error!(path = %path.display(), "content of file is not JSON: {source}");
        StoreError::CorruptFixture {
            path: path.to_owned(),
            source,
        }
    })
}

fn write_json<T: Serialize>(path: &Path, value: &T, action: &'static str) -> Result<(), StoreError> {
    let text = serde_json::to_string_pretty(value).map_err(|source| StoreError::Serialize {
        path: path.to_owned(),
        source,
    })?;
    fs::write(path, text).map_err(|source| StoreError::Io {
        action,
        path: path.to_owned(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::json;

    use super::{RecordingStore, StoreError, VerifyProblem};
    use crate::{
        canonical::QueryValue,
        digest::{Operation, compute_digest},
    };

    fn users_query() -> QueryValue {
        QueryValue::from(json!({ "name": "ada" }))
    }

    #[tokio::test]
    async fn record_then_retrieve_round_trips() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = RecordingStore::open(temp_dir.path().join("rec")).unwrap();
        let res = vec![json!({ "name": "ada", "age": 36 })];

        let digest = store
            .record(Operation::Find, "users".to_owned(), users_query(), res.clone())
            .await
            .unwrap();

        assert_eq!(digest, compute_digest(Operation::Find, "users", &users_query()));
        assert!(store.entry_path(&digest).is_file());
        assert_eq!(
            store
                .retrieve(Operation::Find, "users".to_owned(), users_query())
                .await
                .unwrap(),
            res
        );

        let index = store.load_index().await.unwrap();
        let entry = index.get(&digest).expect("entry should be indexed");
        assert_eq!(entry.name, "users");
        assert_eq!(entry.op, Operation::Find);
        assert_eq!(entry.query, users_query());
        assert_eq!(entry.res, res);
    }

    #[tokio::test]
    async fn rerecording_overwrites_the_entry() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = RecordingStore::open(temp_dir.path()).unwrap();

        store
            .record(Operation::Find, "users".to_owned(), users_query(), vec![json!(1)])
            .await
            .unwrap();
        store
            .record(Operation::Find, "users".to_owned(), users_query(), vec![json!(2)])
            .await
            .unwrap();

        let index = store.load_index().await.unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(
            store
                .retrieve_blocking(Operation::Find, "users", &users_query())
                .unwrap(),
            vec![json!(2)]
        );
    }

    #[test]
    fn index_keeps_regex_queries_encoded() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = RecordingStore::open(temp_dir.path()).unwrap();
        let query = QueryValue::Object(
            [("name".to_owned(), QueryValue::regex("^ad", "i"))]
                .into_iter()
                .collect(),
        );

        store
            .record_blocking(Operation::Find, "users", query.clone(), vec![])
            .unwrap();

        let raw = fs::read_to_string(store.index_path()).unwrap();
        assert!(raw.contains("__REGEXP /^ad/i"), "index: {raw}");
        let index = store.load_index_blocking().unwrap();
        assert_eq!(index.values().next().unwrap().query, query);
    }

    #[test]
    fn retrieve_missing_recording_reports_expected_path() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = RecordingStore::new(temp_dir.path());
        let expected_path = store.entry_path(&compute_digest(
            Operation::Distinct,
            "users",
            &QueryValue::from("name"),
        ));

        let err = store
            .retrieve_blocking(Operation::Distinct, "users", &QueryValue::from("name"))
            .unwrap_err();

        match &err {
            StoreError::MissingRecording { path, .. } => assert_eq!(path, &expected_path),
            other => panic!("expected missing recording, got {other:?}"),
        }
        assert!(
            err.to_string()
                .contains(&expected_path.display().to_string()),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn corrupt_index_is_reported_not_replaced() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = RecordingStore::open(temp_dir.path()).unwrap();
        fs::write(store.index_path(), "{ not json").unwrap();

        let err = store
            .record_blocking(Operation::Find, "users", users_query(), vec![])
            .unwrap_err();
        assert!(matches!(err, StoreError::CorruptFixture { .. }), "{err:?}");
        assert_eq!(fs::read_to_string(store.index_path()).unwrap(), "{ not json");
    }

    #[test]
    fn missing_index_loads_as_empty() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = RecordingStore::new(temp_dir.path().join("absent"));
        assert!(store.load_index_blocking().unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_records_all_land_in_the_index() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = RecordingStore::open(temp_dir.path()).unwrap();

        let mut tasks = tokio::task::JoinSet::new();
        for idx in 0..16 {
            let store = store.clone();
            tasks.spawn(async move {
                store
                    .record(
                        Operation::Find,
                        "users".to_owned(),
                        QueryValue::from(json!({ "idx": idx })),
                        vec![json!({ "idx": idx })],
                    )
                    .await
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap().unwrap();
        }

        assert_eq!(store.load_index().await.unwrap().len(), 16);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_records_of_one_query_leave_file_and_index_in_agreement() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = RecordingStore::open(temp_dir.path()).unwrap();

        for round in 0..25 {
            let mut tasks = tokio::task::JoinSet::new();
            for writer in 0..8 {
                let store = store.clone();
                tasks.spawn(async move {
                    store
                        .record(
                            Operation::Find,
                            "users".to_owned(),
                            users_query(),
                            vec![json!({ "round": round, "writer": writer })],
                        )
                        .await
                });
            }
            while let Some(joined) = tasks.join_next().await {
                joined.unwrap().unwrap();
            }

            let report = store.verify_blocking().unwrap();
            assert!(report.is_clean(), "round {round}: {report:?}");
            assert_eq!(report.entries_checked, 1);
        }
    }

    #[test]
    fn verify_flags_missing_and_mismatched_result_files() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = RecordingStore::open(temp_dir.path()).unwrap();
        let kept = store
            .record_blocking(Operation::Find, "users", users_query(), vec![json!(1)])
            .unwrap();
        let removed = store
            .record_blocking(
                Operation::Distinct,
                "users",
                QueryValue::from("name"),
                vec![json!("ada")],
            )
            .unwrap();
        let changed = store
            .record_blocking(
                Operation::Aggregate,
                "users",
                QueryValue::Array(vec![]),
                vec![json!({ "n": 1 })],
            )
            .unwrap();

        fs::remove_file(store.entry_path(&removed)).unwrap();
        fs::write(store.entry_path(&changed), "[]").unwrap();

        let report = store.verify_blocking().unwrap();
        assert_eq!(report.entries_checked, 3);
        assert!(!report.is_clean());
        assert!(report.issues.iter().all(|issue| issue.digest != kept));
        assert!(report.issues.iter().any(|issue| issue.digest == removed
            && issue.problem == VerifyProblem::MissingEntryFile));
        assert!(report.issues.iter().any(|issue| issue.digest == changed
            && issue.problem == VerifyProblem::ResultMismatch));
    }
}
