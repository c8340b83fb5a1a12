//! Deferred query handles.
//!
//! Every model hands back one of these instead of a result so that callers see the same shape
//! whether the answer comes from a database, a recording wrapper or a replay file: a find is
//! consumed through `lean().exec()`, a distinct is awaited directly, and an aggregate is awaited
//! directly or through `exec()`.

use std::{
    future::{Future, IntoFuture},
    pin::Pin,
};

use serde_json::Value;

use crate::{digest::Operation, storage::StoreError};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

pub type Documents = Vec<Value>;

pub type QueryResult = Result<Documents, QueryError>;

#[derive(Debug)]
pub enum QueryError {
    Store(StoreError),
    ArgumentCount {
        op: Operation,
        expected: usize,
        actual: usize,
    },
    InvalidArgument {
        op: Operation,
        reason: String,
    },
    Unsupported(String),
    Backend(String),
}

impl std::fmt::Display for QueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(err) => write!(f, "{err}"),
            Self::ArgumentCount {
                op,
                expected,
                actual,
            } => write!(f, "expected {expected} argument(s) in {op}, was {actual}"),
            Self::InvalidArgument { op, reason } => write!(f, "invalid {op} argument: {reason}"),
            Self::Unsupported(message) | Self::Backend(message) => f.write_str(message),
        }
    }
}

impl std::error::Error for QueryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for QueryError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

pub struct Find {
    exec: BoxFuture<QueryResult>,
}

impl Find {
    pub fn new(exec: impl Future<Output = QueryResult> + Send + 'static) -> Self {
        Self {
            exec: Box::pin(exec),
        }
    }

    /// Restricts the result to plain documents.
    pub fn lean(self) -> LeanFind {
        LeanFind { exec: self.exec }
    }
}

impl std::fmt::Debug for Find {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Find").finish_non_exhaustive()
    }
}

pub struct LeanFind {
    exec: BoxFuture<QueryResult>,
}

impl LeanFind {
    pub async fn exec(self) -> QueryResult {
        self.exec.await
    }
}

pub struct Distinct {
    exec: BoxFuture<QueryResult>,
}

impl Distinct {
    pub fn new(exec: impl Future<Output = QueryResult> + Send + 'static) -> Self {
        Self {
            exec: Box::pin(exec),
        }
    }
}

impl IntoFuture for Distinct {
    type Output = QueryResult;
    type IntoFuture = BoxFuture<QueryResult>;

    fn into_future(self) -> Self::IntoFuture {
        self.exec
    }
}

pub struct Aggregate {
    exec: BoxFuture<QueryResult>,
}

impl Aggregate {
    pub fn new(exec: impl Future<Output = QueryResult> + Send + 'static) -> Self {
        Self {
            exec: Box::pin(exec),
        }
    }

    /// Same as awaiting the handle; kept for callers written against `exec()`.
    pub async fn exec(self) -> QueryResult {
        self.exec.await
    }
}

impl IntoFuture for Aggregate {
    type Output = QueryResult;
    type IntoFuture = BoxFuture<QueryResult>;

    fn into_future(self) -> Self::IntoFuture {
        self.exec
    }
}
