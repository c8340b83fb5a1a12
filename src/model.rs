use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    canonical::QueryValue,
    digest::Operation,
    query::{Aggregate, Distinct, Find, QueryError, QueryResult},
};

/// A collection schema as handed to model definition. Every client shares this type, so a
/// schema built for the real client is valid for the mock and the other way round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    definition: Value,
}

impl Schema {
    pub fn new(definition: Value) -> Self {
        Self { definition }
    }

    pub fn definition(&self) -> &Value {
        &self.definition
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.definition
            .as_object()
            .map(|fields| fields.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }
}

/// The read surface of a model. Instrumentation wraps exactly these three operations.
pub trait Model: Send + Sync + std::fmt::Debug {
    fn model_name(&self) -> &str;

    fn schema(&self) -> Option<&Schema>;

    fn find(&self, filter: QueryValue) -> Find;

    /// `field` names the field whose distinct values are returned.
    fn distinct(&self, field: QueryValue) -> Distinct;

    fn aggregate(&self, pipeline: Vec<QueryValue>) -> Aggregate;
}

/// Runs `op` with arguments given as a list, the way a caller outside the type system (the CLI,
/// a fixture file) expresses a call.
///
/// find and distinct take exactly one argument and anything else is rejected before the model
/// is touched. aggregate treats every argument as a pipeline stage.
pub async fn invoke(model: &dyn Model, op: Operation, args: Vec<QueryValue>) -> QueryResult {
    match op {
        Operation::Find => model.find(single_argument(op, args)?).lean().exec().await,
        Operation::Distinct => model.distinct(single_argument(op, args)?).await,
        Operation::Aggregate => model.aggregate(args).await,
    }
}

fn single_argument(op: Operation, args: Vec<QueryValue>) -> Result<QueryValue, QueryError> {
    let actual = args.len();
    let mut args = args.into_iter();
    match (args.next(), args.next()) {
        (Some(arg), None) => Ok(arg),
        _ => Err(QueryError::ArgumentCount {
            op,
            expected: 1,
            actual,
        }),
    }
}
