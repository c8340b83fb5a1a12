//! An in-memory document client.
//!
//! Enough of a query language to stand in for a real database when recording: equality and
//! regex filters with a handful of comparison operators, `distinct` over one field, and a small
//! aggregation pipeline. Fields may be addressed with dotted paths.

use std::{
    cmp::Ordering,
    collections::BTreeMap,
    sync::{Arc, PoisonError, RwLock},
};

use serde_json::{Map, Value};

use crate::{
    canonical::{QueryObject, QueryValue, RegexValue},
    client::{Client, ClientError, Connection, ConnectionEvent},
    digest::Operation,
    model::{Model, Schema},
    query::{Aggregate, BoxFuture, Distinct, Documents, Find, QueryError},
};

#[derive(Debug, Default)]
pub struct MemoryClient {
    models: RwLock<BTreeMap<String, Arc<MemoryModel>>>,
    connection: Connection,
}

impl MemoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts documents into `name`, creating the model without a schema if needed.
    pub fn seed(&self, name: &str, documents: Vec<Value>) -> Arc<MemoryModel> {
        let model = {
            let mut models = self.models.write().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(
                models
                    .entry(name.to_owned())
                    .or_insert_with(|| Arc::new(MemoryModel::new(name, None))),
            )
        };
        model.insert_many(documents);
        model
    }
}

impl Client for MemoryClient {
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
        let model = models
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(MemoryModel::new(name, Some(schema))));
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
        let connection = self.connection.clone();
        let uri = uri.to_owned();
        Box::pin(async move {
            if uri.trim().is_empty() {
                return Err(ClientError::Connection(
                    "connection string cannot be empty".to_owned(),
                ));
            }
            tokio::task::yield_now().await;
            connection.emit(ConnectionEvent::Open);
            Ok(())
        })
    }

    fn disconnect(&self) -> BoxFuture<Result<(), ClientError>> {
        let connection = self.connection.clone();
        Box::pin(async move {
            connection.emit(ConnectionEvent::Close);
            Ok(())
        })
    }

    fn connection(&self) -> &Connection {
        &self.connection
    }
}

#[derive(Debug)]
pub struct MemoryModel {
    name: String,
    schema: Option<Schema>,
    documents: RwLock<Vec<Value>>,
}

impl MemoryModel {
    pub fn new(name: &str, schema: Option<Schema>) -> Self {
        Self {
            name: name.to_owned(),
            schema,
            documents: RwLock::new(Vec::new()),
        }
    }

    pub fn insert_many(&self, documents: Vec<Value>) {
        self.documents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(documents);
    }

    fn snapshot(&self) -> Vec<Value> {
        self.documents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Model for MemoryModel {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> Option<&Schema> {
        self.schema.as_ref()
    }

    fn find(&self, filter: QueryValue) -> Find {
        let documents = self.snapshot();
        Find::new(async move {
            tokio::task::yield_now().await;
            filter_documents(Operation::Find, documents, &filter)
        })
    }

    fn distinct(&self, field: QueryValue) -> Distinct {
        let documents = self.snapshot();
        Distinct::new(async move {
            tokio::task::yield_now().await;
            let Some(path) = field.as_str() else {
                return Err(QueryError::InvalidArgument {
                    op: Operation::Distinct,
                    reason: "field name must be a string".to_owned(),
                });
            };
            Ok(distinct_values(&documents, path))
        })
    }

    fn aggregate(&self, pipeline: Vec<QueryValue>) -> Aggregate {
        let documents = self.snapshot();
        Aggregate::new(async move {
            tokio::task::yield_now().await;
            run_pipeline(documents, &pipeline)
        })
    }
}

fn invalid(op: Operation, reason: impl Into<String>) -> QueryError {
    QueryError::InvalidArgument {
        op,
        reason: reason.into(),
    }
}

fn filter_documents(
    op: Operation,
    documents: Vec<Value>,
    filter: &QueryValue,
) -> Result<Documents, QueryError> {
    let conditions = match filter {
        QueryValue::Null => return Ok(documents),
        QueryValue::Object(conditions) => conditions,
        _ => return Err(invalid(op, "filter must be an object")),
    };

    let mut kept = Vec::new();
    for document in documents {
        if document_matches(op, &document, conditions)? {
            kept.push(document);
        }
    }
    Ok(kept)
}

fn document_matches(
    op: Operation,
    document: &Value,
    conditions: &QueryObject,
) -> Result<bool, QueryError> {
    for (path, condition) in conditions {
        if !field_matches(op, lookup(document, path), condition)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn lookup<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(document, |current, segment| current.get(segment))
}

fn is_operator_object(condition: &QueryValue) -> bool {
    condition
        .as_object()
        .is_some_and(|map| !map.is_empty() && map.keys().all(|key| key.starts_with('$')))
}

fn field_matches(
    op: Operation,
    field: Option<&Value>,
    condition: &QueryValue,
) -> Result<bool, QueryError> {
    let Some(operators) = condition.as_object().filter(|_| is_operator_object(condition)) else {
        return value_matches(op, field, condition);
    };

    for (operator, operand) in operators {
        let matched = match operator.as_str() {
            "$eq" => value_matches(op, field, operand)?,
            "$ne" => !value_matches(op, field, operand)?,
            "$in" => any_matches(op, field, operand)?,
            "$nin" => !any_matches(op, field, operand)?,
            "$exists" => match operand {
                QueryValue::Bool(wanted) => field.is_some() == *wanted,
                _ => return Err(invalid(op, "$exists takes a boolean")),
            },
            "$gt" | "$gte" | "$lt" | "$lte" => {
                let ordering = field.and_then(|field| compare(field, &operand.to_json()));
                match (operator.as_str(), ordering) {
                    (_, None) => false,
                    ("$gt", Some(ordering)) => ordering == Ordering::Greater,
                    ("$gte", Some(ordering)) => ordering != Ordering::Less,
                    ("$lt", Some(ordering)) => ordering == Ordering::Less,
                    (_, Some(ordering)) => ordering != Ordering::Greater,
                }
            }
            "$regex" => {
                let source = operand
                    .as_str()
                    .ok_or_else(|| invalid(op, "$regex takes a string"))?;
                let flags = operators
                    .get("$options")
                    .and_then(QueryValue::as_str)
                    .unwrap_or_default();
                regex_matches(op, field, &RegexValue::new(source, flags))?
            }
            "$options" if operators.contains_key("$regex") => true,
            other => {
                return Err(QueryError::Unsupported(format!(
                    "unsupported query operator `{other}`"
                )));
            }
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn any_matches(
    op: Operation,
    field: Option<&Value>,
    operand: &QueryValue,
) -> Result<bool, QueryError> {
    let QueryValue::Array(candidates) = operand else {
        return Err(invalid(op, "$in and $nin take an array"));
    };
    for candidate in candidates {
        if value_matches(op, field, candidate)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Equality, or a regex test when `condition` is a regex. An array field matches when any of
/// its elements does.
fn value_matches(
    op: Operation,
    field: Option<&Value>,
    condition: &QueryValue,
) -> Result<bool, QueryError> {
    if let QueryValue::Regex(regex) = condition {
        return regex_matches(op, field, regex);
    }

    let expected = condition.to_json();
    Ok(match field {
        None => expected.is_null(),
        Some(Value::Array(items)) if !expected.is_array() => items.contains(&expected),
        Some(value) => *value == expected,
    })
}

fn regex_matches(
    op: Operation,
    field: Option<&Value>,
    regex: &RegexValue,
) -> Result<bool, QueryError> {
    let matcher = regex
        .compile()
        .map_err(|err| invalid(op, format!("regex {regex} does not compile: {err}")))?;
    Ok(match field {
        Some(Value::String(text)) => matcher.is_match(text),
        Some(Value::Array(items)) => items
            .iter()
            .any(|item| item.as_str().is_some_and(|text| matcher.is_match(text))),
        _ => false,
    })
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(left), Value::Number(right)) => {
            left.as_f64()?.partial_cmp(&right.as_f64()?)
        }
        (Value::String(left), Value::String(right)) => Some(left.cmp(right)),
        (Value::Bool(left), Value::Bool(right)) => Some(left.cmp(right)),
        _ => None,
    }
}

fn distinct_values(documents: &[Value], path: &str) -> Documents {
    let mut values: Documents = Vec::new();
    let mut push_unique = |value: &Value| {
        if !values.contains(value) {
            values.push(value.clone());
        }
    };
    for document in documents {
        match lookup(document, path) {
            Some(Value::Array(items)) => items.iter().for_each(&mut push_unique),
            Some(value) => push_unique(value),
            None => {}
        }
    }
    values
}

fn run_pipeline(
    mut documents: Vec<Value>,
    pipeline: &[QueryValue],
) -> Result<Documents, QueryError> {
    const OP: Operation = Operation::Aggregate;

    for stage in pipeline {
        let Some((name, operand)) = stage
            .as_object()
            .filter(|stage| stage.len() == 1)
            .and_then(|stage| stage.iter().next())
        else {
            return Err(invalid(OP, "each stage must be an object with exactly one key"));
        };

        documents = match name.as_str() {
            "$match" => filter_documents(OP, documents, operand)?,
            "$project" => project(documents, operand)?,
            "$sort" => sort(documents, operand)?,
            "$skip" => documents.into_iter().skip(count_operand(name, operand)?).collect(),
            "$limit" => documents.into_iter().take(count_operand(name, operand)?).collect(),
            "$count" => {
                let field = operand
                    .as_str()
                    .filter(|field| !field.is_empty())
                    .ok_or_else(|| invalid(OP, "$count takes a non-empty field name"))?;
                if documents.is_empty() {
                    Vec::new()
                } else {
                    let mut counted = Map::new();
                    counted.insert(field.to_owned(), Value::from(documents.len()));
                    vec![Value::Object(counted)]
                }
            }
            other => {
                return Err(QueryError::Unsupported(format!(
                    "unsupported aggregation stage `{other}`"
                )));
            }
        };
    }
    Ok(documents)
}

fn count_operand(stage: &str, operand: &QueryValue) -> Result<usize, QueryError> {
    let QueryValue::Number(number) = operand else {
        return Err(invalid(Operation::Aggregate, format!("{stage} takes a number")));
    };
    number
        .as_u64()
        .and_then(|count| usize::try_from(count).ok())
        .ok_or_else(|| {
            invalid(
                Operation::Aggregate,
                format!("{stage} takes a non-negative integer"),
            )
        })
}

fn truthy(value: &QueryValue) -> bool {
    match value {
        QueryValue::Bool(flag) => *flag,
        QueryValue::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        QueryValue::Null => false,
        _ => true,
    }
}

fn project(documents: Vec<Value>, operand: &QueryValue) -> Result<Documents, QueryError> {
    let Some(fields) = operand.as_object() else {
        return Err(invalid(Operation::Aggregate, "$project takes an object"));
    };
    let included: Vec<&str> = fields
        .iter()
        .filter(|(_, value)| truthy(value))
        .map(|(key, _)| key.as_str())
        .collect();
    let excluded: Vec<&str> = fields
        .iter()
        .filter(|(_, value)| !truthy(value))
        .map(|(key, _)| key.as_str())
        .collect();

    Ok(documents
        .into_iter()
        .map(|document| {
            let Value::Object(map) = document else {
                return document;
            };
            let projected = if included.is_empty() {
                map.into_iter()
                    .filter(|(key, _)| !excluded.contains(&key.as_str()))
                    .collect()
            } else {
                map.into_iter()
                    .filter(|(key, _)| {
                        included.contains(&key.as_str())
                            || (key == "_id" && !excluded.contains(&"_id"))
                    })
                    .collect()
            };
            Value::Object(projected)
        })
        .collect())
}

fn sort(mut documents: Vec<Value>, operand: &QueryValue) -> Result<Documents, QueryError> {
    let Some(keys) = operand.as_object().filter(|keys| !keys.is_empty()) else {
        return Err(invalid(Operation::Aggregate, "$sort takes a non-empty object"));
    };
    let mut order = Vec::with_capacity(keys.len());
    for (path, direction) in keys {
        let descending = match direction.to_json().as_i64() {
            Some(1) => false,
            Some(-1) => true,
            _ => {
                return Err(invalid(
                    Operation::Aggregate,
                    format!("$sort direction for `{path}` must be 1 or -1"),
                ));
            }
        };
        order.push((path.as_str(), descending));
    }

    documents.sort_by(|left, right| {
        for (path, descending) in &order {
            let ordering = match (lookup(left, path), lookup(right, path)) {
                (Some(left), Some(right)) => compare(left, right).unwrap_or(Ordering::Equal),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            let ordering = if *descending {
                ordering.reverse()
            } else {
                ordering
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
    Ok(documents)
}
