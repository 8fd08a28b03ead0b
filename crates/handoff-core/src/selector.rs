//! JSON-Logic evaluation of task selectors against a job's serialized field tree.

use serde_json::Value;
use thiserror::Error;

use crate::{Job, Task};

static NULL: Value = Value::Null;

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("selector is not valid json: {0}")]
    InvalidSelector(String),
    #[error("unrecognized operation {0:?}")]
    UnknownOperator(String),
    #[error("could not parse bool from selector result, got {0}")]
    NotBoolean(Value),
    #[error("could not serialize job: {0}")]
    Serialize(String),
    #[error("task {task_id}: {source}")]
    Task {
        task_id: String,
        #[source]
        source: Box<MatchError>,
    },
}

/// Evaluates `selector` against `job`. The result must be a JSON boolean.
pub fn match_selector(job: &Job, selector: &str) -> Result<bool, MatchError> {
    let rule: Value =
        serde_json::from_str(selector).map_err(|e| MatchError::InvalidSelector(e.to_string()))?;
    let data = serde_json::to_value(job).map_err(|e| MatchError::Serialize(e.to_string()))?;
    match apply(&rule, &data)? {
        Value::Bool(b) => Ok(b),
        other => Err(MatchError::NotBoolean(other)),
    }
}

/// First task, in the given order, whose selector matches the job.
pub fn find_task<'a>(job: &Job, tasks: &'a [Task]) -> Result<Option<&'a Task>, MatchError> {
    for task in tasks {
        let matched = match_selector(job, &task.job_selector).map_err(|source| MatchError::Task {
            task_id: task.id.clone(),
            source: Box::new(source),
        })?;
        if matched {
            return Ok(Some(task));
        }
    }
    Ok(None)
}

pub fn apply(rule: &Value, data: &Value) -> Result<Value, MatchError> {
    match rule {
        Value::Object(map) if map.len() == 1 => match map.iter().next() {
            Some((op, args)) => apply_operator(op, args, data),
            None => Ok(rule.clone()),
        },
        Value::Array(items) => items
            .iter()
            .map(|item| apply(item, data))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        other => Ok(other.clone()),
    }
}

fn apply_operator(op: &str, args: &Value, data: &Value) -> Result<Value, MatchError> {
    let raw: Vec<&Value> = match args {
        Value::Array(items) => items.iter().collect(),
        single => vec![single],
    };

    match op {
        "var" => {
            let path = match raw.first() {
                Some(v) => apply(v, data)?,
                None => Value::String(String::new()),
            };
            let found = lookup(data, &path);
            match (found, raw.get(1)) {
                (Some(v), _) => Ok(v),
                (None, Some(default)) => apply(default, data),
                (None, None) => Ok(Value::Null),
            }
        }
        "missing" => {
            let mut keys = eval_all(&raw, data)?;
            if let Some(Value::Array(inner)) = keys.first().cloned() {
                keys = inner;
            }
            let missing = keys
                .into_iter()
                .filter(|k| lookup(data, k).map_or(true, |v| v.is_null() || v == ""))
                .collect();
            Ok(Value::Array(missing))
        }
        "if" | "?:" => {
            let mut i = 0;
            while i + 1 < raw.len() {
                if truthy(&apply(raw[i], data)?) {
                    return apply(raw[i + 1], data);
                }
                i += 2;
            }
            match raw.get(i) {
                Some(otherwise) => apply(otherwise, data),
                None => Ok(Value::Null),
            }
        }
        "and" => {
            let mut last = Value::Bool(true);
            for arg in &raw {
                last = apply(arg, data)?;
                if !truthy(&last) {
                    return Ok(last);
                }
            }
            Ok(last)
        }
        "or" => {
            let mut last = Value::Bool(false);
            for arg in &raw {
                last = apply(arg, data)?;
                if truthy(&last) {
                    return Ok(last);
                }
            }
            Ok(last)
        }
        "!" => Ok(Value::Bool(!truthy(&first_arg(&raw, data)?))),
        "!!" => Ok(Value::Bool(truthy(&first_arg(&raw, data)?))),
        "==" | "!=" | "===" | "!==" => {
            let vals = eval_all(&raw, data)?;
            let a = vals.first().unwrap_or(&NULL);
            let b = vals.get(1).unwrap_or(&NULL);
            let eq = if op.len() == 3 {
                strict_equals(a, b)
            } else {
                loose_equals(a, b)
            };
            Ok(Value::Bool(if op.starts_with('!') { !eq } else { eq }))
        }
        "<" | "<=" | ">" | ">=" => {
            let vals = eval_all(&raw, data)?;
            let nums: Vec<Option<f64>> = vals.iter().map(to_number).collect();
            let cmp = |a: Option<f64>, b: Option<f64>| match (a, b) {
                (Some(a), Some(b)) => match op {
                    "<" => a < b,
                    "<=" => a <= b,
                    ">" => a > b,
                    _ => a >= b,
                },
                _ => false,
            };
            let result = match nums.as_slice() {
                [a, b, c] if op == "<" || op == "<=" => cmp(*a, *b) && cmp(*b, *c),
                [a, b, ..] => cmp(*a, *b),
                _ => false,
            };
            Ok(Value::Bool(result))
        }
        "in" => {
            let vals = eval_all(&raw, data)?;
            let needle = vals.first().unwrap_or(&NULL);
            let found = match vals.get(1) {
                Some(Value::String(haystack)) => haystack.contains(&to_text(needle)),
                Some(Value::Array(items)) => items.iter().any(|item| loose_equals(item, needle)),
                _ => false,
            };
            Ok(Value::Bool(found))
        }
        "cat" => {
            let vals = eval_all(&raw, data)?;
            Ok(Value::String(vals.iter().map(to_text).collect()))
        }
        other => Err(MatchError::UnknownOperator(other.to_string())),
    }
}

fn eval_all(args: &[&Value], data: &Value) -> Result<Vec<Value>, MatchError> {
    args.iter().map(|a| apply(a, data)).collect()
}

fn first_arg(args: &[&Value], data: &Value) -> Result<Value, MatchError> {
    match args.first() {
        Some(v) => apply(v, data),
        None => Ok(Value::Null),
    }
}

/// Resolves a dotted path (`InputFile.Name`, `PipelineDetails.OutputFiles.0.Name`).
fn lookup(data: &Value, path: &Value) -> Option<Value> {
    let path = match path {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        _ => return None,
    };
    if path.is_empty() {
        return Some(data.clone());
    }
    let mut current = data;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(_) => true,
    }
}

fn to_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::Null => Some(0.0),
        _ => None,
    }
}

fn to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn strict_equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn loose_equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Array(_) | Value::Object(_), _) | (_, Value::Array(_) | Value::Object(_)) => {
            strict_equals(a, b)
        }
        _ => match (to_number(a), to_number(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
    }
}
