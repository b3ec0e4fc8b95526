//! Built-in JSON interpreter.
//!
//! An operation is a pipeline of steps separated by `|`, for example
//! `filter gt 2 | increment by 10 | sort desc`. Only the steps listed in
//! [`parse_step`] exist; anything else is rejected before the input is read.
//!
//! Integer arithmetic stays integral and is overflow-checked. Division always
//! produces floats.

use super::{Transform, TransformError};
use serde_json::{Map, Number as JsonNumber, Value};
use std::cmp::Ordering;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    fn parse(token: &str) -> Option<Self> {
        if let Ok(i) = token.parse::<i64>() {
            return Some(Self::Int(i));
        }
        token
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map(Self::Float)
    }

    fn from_value(value: &Value) -> Option<Self> {
        value
            .as_i64()
            .map(Self::Int)
            .or_else(|| value.as_f64().map(Self::Float))
    }

    fn as_f64(self) -> f64 {
        match self {
            Self::Int(i) => i as f64,
            Self::Float(f) => f,
        }
    }

    fn into_value(self) -> Result<Value, TransformError> {
        match self {
            Self::Int(i) => Ok(Value::from(i)),
            Self::Float(f) => JsonNumber::from_f64(f)
                .map(Value::Number)
                .ok_or_else(|| TransformError::Data(format!("result {f} is not a finite number"))),
        }
    }

    fn total_cmp(self, other: Self) -> Ordering {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a.cmp(&b),
            _ => self.as_f64().total_cmp(&other.as_f64()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl ArithOp {
    fn verb(self) -> &'static str {
        match self {
            Self::Add => "increment",
            Self::Sub => "decrement",
            Self::Mul => "multiply",
            Self::Div => "divide",
        }
    }

    fn apply(self, a: Number, b: Number) -> Result<Number, TransformError> {
        if self == Self::Div {
            let divisor = b.as_f64();
            if divisor == 0.0 {
                return Err(TransformError::Data("division by zero".to_string()));
            }
            return Ok(Number::Float(a.as_f64() / divisor));
        }
        match (a, b) {
            (Number::Int(x), Number::Int(y)) => {
                let r = match self {
                    Self::Add => x.checked_add(y),
                    Self::Sub => x.checked_sub(y),
                    _ => x.checked_mul(y),
                };
                r.map(Number::Int).ok_or_else(|| {
                    TransformError::Data(format!("integer overflow: {} {} by {}", self.verb(), x, y))
                })
            }
            _ => {
                let (x, y) = (a.as_f64(), b.as_f64());
                Ok(Number::Float(match self {
                    Self::Add => x + y,
                    Self::Sub => x - y,
                    _ => x * y,
                }))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
}

impl CmpOp {
    fn parse(token: &str) -> Option<Self> {
        Some(match token.to_ascii_lowercase().as_str() {
            "gt" | ">" => Self::Gt,
            "ge" | ">=" => Self::Ge,
            "lt" | "<" => Self::Lt,
            "le" | "<=" => Self::Le,
            "eq" | "=" | "==" => Self::Eq,
            "ne" | "!=" => Self::Ne,
            _ => return None,
        })
    }

    fn holds(self, ord: Ordering) -> bool {
        match self {
            Self::Gt => ord == Ordering::Greater,
            Self::Ge => ord != Ordering::Less,
            Self::Lt => ord == Ordering::Less,
            Self::Le => ord != Ordering::Greater,
            Self::Eq => ord == Ordering::Equal,
            Self::Ne => ord != Ordering::Equal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Aggregate {
    Sum,
    Min,
    Max,
    Mean,
}

#[derive(Debug, Clone, PartialEq)]
enum Step {
    Identity,
    Arith {
        op: ArithOp,
        operand: Number,
        column: Option<String>,
    },
    Filter {
        column: Option<String>,
        op: CmpOp,
        operand: Number,
    },
    Sort {
        column: Option<String>,
        descending: bool,
    },
    Reverse,
    Head(usize),
    Tail(usize),
    Aggregate {
        agg: Aggregate,
        column: Option<String>,
    },
    Count,
    Select(Vec<String>),
    Distinct,
}

fn invalid(step: &str, reason: &str) -> TransformError {
    TransformError::InvalidStep {
        step: step.to_string(),
        reason: reason.to_string(),
    }
}

/// Parse one pipeline step.
///
/// Allowed steps: `identity`, `increment|decrement|multiply|divide [by] N
/// [on COL]`, `filter [COL] OP N`, `sort [by COL] [asc|desc]`, `reverse`,
/// `head N`, `tail N`, `sum|min|max|mean [[on] COL]`, `count`,
/// `select a,b`, `distinct`.
fn parse_step(raw: &str) -> Result<Step, TransformError> {
    let step = raw.trim();
    let tokens: Vec<&str> = step.split_whitespace().collect();
    let Some((keyword, rest)) = tokens.split_first() else {
        return Err(invalid(step, "empty step"));
    };

    let keyword = keyword.to_ascii_lowercase();
    let parsed = match (keyword.as_str(), rest) {
        ("identity", []) => Step::Identity,
        ("increment" | "add", _) => parse_arith(step, ArithOp::Add, rest)?,
        ("decrement" | "subtract", _) => parse_arith(step, ArithOp::Sub, rest)?,
        ("multiply", _) => parse_arith(step, ArithOp::Mul, rest)?,
        ("divide", _) => parse_arith(step, ArithOp::Div, rest)?,
        ("filter", _) => parse_filter(step, rest)?,
        ("sort", _) => parse_sort(step, rest)?,
        ("reverse", []) => Step::Reverse,
        ("head" | "tail", [n]) => {
            let n = n
                .parse::<usize>()
                .map_err(|_| invalid(step, "expected a row count"))?;
            if keyword == "head" {
                Step::Head(n)
            } else {
                Step::Tail(n)
            }
        }
        ("sum" | "min" | "max" | "mean", _) => {
            let agg = match keyword.as_str() {
                "sum" => Aggregate::Sum,
                "min" => Aggregate::Min,
                "max" => Aggregate::Max,
                _ => Aggregate::Mean,
            };
            let column = match rest {
                [] => None,
                [col] => Some(col.to_string()),
                [on, col] if on.eq_ignore_ascii_case("on") => Some(col.to_string()),
                _ => return Err(invalid(step, "expected at most one column")),
            };
            Step::Aggregate { agg, column }
        }
        ("count", []) => Step::Count,
        ("select", _) if !rest.is_empty() => {
            let columns: Vec<String> = rest
                .join(" ")
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(String::from)
                .collect();
            if columns.is_empty() {
                return Err(invalid(step, "expected column names"));
            }
            Step::Select(columns)
        }
        ("distinct", []) => Step::Distinct,
        _ => return Err(TransformError::Unsupported(step.to_string())),
    };
    Ok(parsed)
}

fn parse_arith(step: &str, op: ArithOp, rest: &[&str]) -> Result<Step, TransformError> {
    let rest = match rest {
        [by, tail @ ..] if by.eq_ignore_ascii_case("by") => tail,
        other => other,
    };
    let (operand, column) = match rest {
        [n] => (n, None),
        [n, on, col] if on.eq_ignore_ascii_case("on") => (n, Some(col.to_string())),
        _ => return Err(invalid(step, "expected 'by N [on COLUMN]'")),
    };
    let operand = Number::parse(operand).ok_or_else(|| invalid(step, "expected a number"))?;
    Ok(Step::Arith {
        op,
        operand,
        column,
    })
}

fn parse_filter(step: &str, rest: &[&str]) -> Result<Step, TransformError> {
    let (column, op, operand) = match rest {
        [op, n] => (None, op, n),
        [col, op, n] => (Some(col.to_string()), op, n),
        _ => return Err(invalid(step, "expected '[COLUMN] OP N'")),
    };
    let op = CmpOp::parse(op).ok_or_else(|| invalid(step, "unknown comparison"))?;
    let operand = Number::parse(operand).ok_or_else(|| invalid(step, "expected a number"))?;
    Ok(Step::Filter {
        column,
        op,
        operand,
    })
}

fn parse_sort(step: &str, rest: &[&str]) -> Result<Step, TransformError> {
    let (column, rest) = match rest {
        [by, col, tail @ ..] if by.eq_ignore_ascii_case("by") => (Some(col.to_string()), tail),
        other => (None, other),
    };
    let descending = match rest {
        [] => false,
        [dir] if dir.eq_ignore_ascii_case("asc") => false,
        [dir] if dir.eq_ignore_ascii_case("desc") => true,
        _ => return Err(invalid(step, "expected 'sort [by COLUMN] [asc|desc]'")),
    };
    Ok(Step::Sort { column, descending })
}

/// A parsed, validated operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    steps: Vec<Step>,
}

impl Pipeline {
    pub fn parse(operation: &str) -> Result<Self, TransformError> {
        if operation.trim().is_empty() {
            return Err(TransformError::Data("operation is empty".to_string()));
        }
        let steps = operation
            .split('|')
            .map(parse_step)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { steps })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn run(&self, mut value: Value) -> Result<Value, TransformError> {
        for step in &self.steps {
            value = run_step(step, value)?;
        }
        Ok(value)
    }
}

fn expect_array(value: Value, what: &str) -> Result<Vec<Value>, TransformError> {
    match value {
        Value::Array(items) => Ok(items),
        other => Err(TransformError::Data(format!(
            "{what} needs an array, got {}",
            type_name(&other)
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn run_step(step: &Step, value: Value) -> Result<Value, TransformError> {
    match step {
        Step::Identity => Ok(value),
        Step::Arith {
            op,
            operand,
            column,
        } => arith_value(value, *op, *operand, column.as_deref()),
        Step::Filter {
            column,
            op,
            operand,
        } => {
            let items = expect_array(value, "filter")?;
            let mut kept = Vec::with_capacity(items.len());
            for item in items {
                let Some(n) = numeric_key(&item, column.as_deref(), "filter")? else {
                    continue;
                };
                if op.holds(n.total_cmp(*operand)) {
                    kept.push(item);
                }
            }
            Ok(Value::Array(kept))
        }
        Step::Sort { column, descending } => {
            let mut items = expect_array(value, "sort")?;
            if column.is_none() && items.iter().any(Value::is_object) {
                return Err(TransformError::Data(
                    "sorting rows needs 'sort by COLUMN'".to_string(),
                ));
            }
            let key = |v: &Value| -> Value {
                match column {
                    Some(c) => v.get(c).cloned().unwrap_or(Value::Null),
                    None => v.clone(),
                }
            };
            items.sort_by(|a, b| {
                let ord = compare_values(&key(a), &key(b));
                if *descending { ord.reverse() } else { ord }
            });
            Ok(Value::Array(items))
        }
        Step::Reverse => {
            let mut items = expect_array(value, "reverse")?;
            items.reverse();
            Ok(Value::Array(items))
        }
        Step::Head(n) => {
            let mut items = expect_array(value, "head")?;
            items.truncate(*n);
            Ok(Value::Array(items))
        }
        Step::Tail(n) => {
            let mut items = expect_array(value, "tail")?;
            let skip = items.len().saturating_sub(*n);
            Ok(Value::Array(items.split_off(skip)))
        }
        Step::Aggregate { agg, column } => aggregate_value(value, *agg, column.as_deref()),
        Step::Count => Ok(Value::from(match &value {
            Value::Array(items) => items.len(),
            Value::Null => 0,
            _ => 1,
        })),
        Step::Select(columns) => match value {
            Value::Object(row) => Ok(Value::Object(select_row(&row, columns))),
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::Object(row) => Ok(Value::Object(select_row(&row, columns))),
                    other => Err(TransformError::Data(format!(
                        "select needs rows, got {}",
                        type_name(&other)
                    ))),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            other => Err(TransformError::Data(format!(
                "select needs rows, got {}",
                type_name(&other)
            ))),
        },
        Step::Distinct => {
            let items = expect_array(value, "distinct")?;
            let mut seen = HashSet::new();
            Ok(Value::Array(
                items
                    .into_iter()
                    .filter(|item| seen.insert(item.to_string()))
                    .collect(),
            ))
        }
    }
}

fn arith_value(
    value: Value,
    op: ArithOp,
    operand: Number,
    column: Option<&str>,
) -> Result<Value, TransformError> {
    match value {
        Value::Number(_) if column.is_none() => {
            let n = Number::from_value(&value).ok_or_else(|| not_numeric(op, &value))?;
            op.apply(n, operand)?.into_value()
        }
        Value::Object(row) => arith_row(row, op, operand, column).map(Value::Object),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Array(_) => Err(not_numeric(op, &item)),
                other => arith_value(other, op, operand, column),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        other => Err(not_numeric(op, &other)),
    }
}

fn not_numeric(op: ArithOp, value: &Value) -> TransformError {
    TransformError::Data(format!("cannot {} non-numeric value {}", op.verb(), value))
}

/// Apply arithmetic to one column, or to every numeric field when no column is named.
fn arith_row(
    mut row: Map<String, Value>,
    op: ArithOp,
    operand: Number,
    column: Option<&str>,
) -> Result<Map<String, Value>, TransformError> {
    match column {
        Some(col) => {
            let field = row.get_mut(col).ok_or_else(|| {
                TransformError::Data(format!("column '{col}' not found"))
            })?;
            let n = Number::from_value(field).ok_or_else(|| {
                TransformError::Data(format!("column '{col}' is not numeric"))
            })?;
            *field = op.apply(n, operand)?.into_value()?;
        }
        None => {
            for field in row.values_mut() {
                if let Some(n) = Number::from_value(field) {
                    *field = op.apply(n, operand)?.into_value()?;
                }
            }
        }
    }
    Ok(row)
}

/// Numeric value of an element for filtering. `None` drops the element.
fn numeric_key(
    item: &Value,
    column: Option<&str>,
    what: &str,
) -> Result<Option<Number>, TransformError> {
    match (item, column) {
        (Value::Object(row), Some(col)) => Ok(row.get(col).and_then(Number::from_value)),
        (Value::Object(_), None) => Err(TransformError::Data(format!(
            "{what} on rows needs a column"
        ))),
        (other, None) => Ok(Number::from_value(other)),
        (_, Some(col)) => Err(TransformError::Data(format!(
            "{what} by column '{col}' needs rows"
        ))),
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values: by type first, then by value.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(_), Value::Number(_)) => match (Number::from_value(a), Number::from_value(b)) {
            (Some(x), Some(y)) => x.total_cmp(y),
            _ => Ordering::Equal,
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => type_rank(a)
            .cmp(&type_rank(b))
            .then_with(|| a.to_string().cmp(&b.to_string())),
    }
}

fn select_row(row: &Map<String, Value>, columns: &[String]) -> Map<String, Value> {
    columns
        .iter()
        .filter_map(|c| row.get(c).map(|v| (c.clone(), v.clone())))
        .collect()
}

fn aggregate_value(
    value: Value,
    agg: Aggregate,
    column: Option<&str>,
) -> Result<Value, TransformError> {
    let items = match value {
        Value::Array(items) => items,
        Value::Number(_) => vec![value],
        other => {
            return Err(TransformError::Data(format!(
                "aggregation needs numbers, got {}",
                type_name(&other)
            )));
        }
    };

    let rows = items.iter().any(Value::is_object);
    if rows && column.is_none() {
        // One aggregate per numeric column, in order of first appearance.
        let mut columns: Vec<String> = Vec::new();
        for item in &items {
            if let Value::Object(row) = item {
                for (k, v) in row {
                    if v.is_number() && !columns.contains(k) {
                        columns.push(k.clone());
                    }
                }
            }
        }
        let mut out = Map::new();
        for col in columns {
            let numbers: Vec<Number> = items
                .iter()
                .filter_map(|item| item.get(&col).and_then(Number::from_value))
                .collect();
            out.insert(col, fold_numbers(agg, &numbers)?);
        }
        return Ok(Value::Object(out));
    }

    let mut numbers = Vec::with_capacity(items.len());
    for item in &items {
        let n = match column {
            Some(col) => item.get(col).and_then(Number::from_value),
            None => Number::from_value(item),
        };
        match n {
            Some(n) => numbers.push(n),
            None if column.is_some() => {}
            None => {
                return Err(TransformError::Data(format!(
                    "aggregation needs numbers, got {item}"
                )));
            }
        }
    }
    fold_numbers(agg, &numbers)
}

fn fold_numbers(agg: Aggregate, numbers: &[Number]) -> Result<Value, TransformError> {
    match agg {
        Aggregate::Sum => numbers
            .iter()
            .try_fold(Number::Int(0), |acc, n| ArithOp::Add.apply(acc, *n))?
            .into_value(),
        Aggregate::Min => numbers
            .iter()
            .copied()
            .min_by(|a, b| a.total_cmp(*b))
            .map_or(Ok(Value::Null), Number::into_value),
        Aggregate::Max => numbers
            .iter()
            .copied()
            .max_by(|a, b| a.total_cmp(*b))
            .map_or(Ok(Value::Null), Number::into_value),
        Aggregate::Mean => {
            if numbers.is_empty() {
                return Ok(Value::Null);
            }
            let total: f64 = numbers.iter().map(|n| n.as_f64()).sum();
            Number::Float(total / numbers.len() as f64).into_value()
        }
    }
}

/// The built-in transform: parses the operation as a [`Pipeline`] and runs
/// it over the JSON input.
#[derive(Debug, Default)]
pub struct Sandbox {
    executed: u64,
}

impl Sandbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Operations run so far.
    pub fn executed(&self) -> u64 {
        self.executed
    }
}

impl Transform for Sandbox {
    fn name(&self) -> &str {
        "sandbox"
    }

    fn apply(&mut self, input: &[u8], operation: &[u8]) -> Result<Vec<u8>, TransformError> {
        let operation =
            std::str::from_utf8(operation).map_err(|_| TransformError::OperationNotUtf8)?;
        let pipeline = Pipeline::parse(operation)?;
        let value: Value = serde_json::from_slice(input)
            .map_err(|e| TransformError::Data(format!("input is not valid JSON: {e}")))?;
        let result = pipeline.run(value)?;
        self.executed += 1;
        Ok(serde_json::to_vec(&result)?)
    }

    fn teardown(&mut self) {
        tracing::debug!(executed = self.executed, "Sandbox torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(input: &str, op: &str) -> Result<String, TransformError> {
        Sandbox::new()
            .apply(input.as_bytes(), op.as_bytes())
            .map(|b| String::from_utf8(b).unwrap())
    }

    #[test]
    fn test_increment_by_ten() {
        assert_eq!(run("[1,2,3,4,5]", "increment by 10").unwrap(), "[11,12,13,14,15]");
    }

    #[test]
    fn test_arithmetic_variants() {
        assert_eq!(run("[10,20]", "decrement by 5").unwrap(), "[5,15]");
        assert_eq!(run("[1.5,2]", "multiply by 2").unwrap(), "[3.0,4]");
        assert_eq!(run("[3]", "divide by 2").unwrap(), "[1.5]");
        assert_eq!(run("7", "add 1").unwrap(), "8");
    }

    #[test]
    fn test_arithmetic_on_rows() {
        let out = run(
            r#"[{"name":"a","qty":1},{"name":"b","qty":2}]"#,
            "multiply by 3 on qty",
        )
        .unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v, json!([{"name":"a","qty":3},{"name":"b","qty":6}]));

        // Without a column, only numeric fields change.
        let out = run(r#"[{"name":"a","qty":1,"w":2}]"#, "increment 1").unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v, json!([{"name":"a","qty":2,"w":3}]));
    }

    #[test]
    fn test_arithmetic_errors() {
        let err = run("[1]", "divide by 0").unwrap_err();
        assert_eq!(err.to_string(), "division by zero");

        let err = run(&format!("[{}]", i64::MAX), "increment by 1").unwrap_err();
        assert!(err.to_string().contains("overflow"));

        let err = run(r#"["a"]"#, "increment by 1").unwrap_err();
        assert!(err.to_string().contains("non-numeric"));

        let err = run(r#"[{"q":1}]"#, "increment by 1 on missing").unwrap_err();
        assert!(err.to_string().contains("column 'missing' not found"));
    }

    #[test]
    fn test_filter() {
        assert_eq!(run("[1,2,3,4,5]", "filter gt 2").unwrap(), "[3,4,5]");
        assert_eq!(run("[1,2,3]", "filter <= 2").unwrap(), "[1,2]");
        assert_eq!(run("[1,\"x\",3]", "filter ne 1").unwrap(), "[3]");

        let out = run(r#"[{"a":1},{"a":5},{"b":9}]"#, "filter a ge 5").unwrap();
        assert_eq!(out, r#"[{"a":5}]"#);

        let err = run(r#"[{"a":1}]"#, "filter gt 0").unwrap_err();
        assert!(err.to_string().contains("needs a column"));
    }

    #[test]
    fn test_sort_and_reverse() {
        assert_eq!(run("[3,1,2]", "sort").unwrap(), "[1,2,3]");
        assert_eq!(run("[3,1,2]", "sort desc").unwrap(), "[3,2,1]");
        assert_eq!(run(r#"["b","a"]"#, "sort asc").unwrap(), r#"["a","b"]"#);
        assert_eq!(run("[1,2,3]", "reverse").unwrap(), "[3,2,1]");

        let out = run(r#"[{"k":2},{"k":1}]"#, "sort by k").unwrap();
        assert_eq!(out, r#"[{"k":1},{"k":2}]"#);
        assert!(run(r#"[{"k":2}]"#, "sort").is_err());
    }

    #[test]
    fn test_head_tail() {
        assert_eq!(run("[1,2,3,4]", "head 2").unwrap(), "[1,2]");
        assert_eq!(run("[1,2,3,4]", "tail 3").unwrap(), "[2,3,4]");
        assert_eq!(run("[1]", "tail 5").unwrap(), "[1]");
    }

    #[test]
    fn test_aggregates() {
        assert_eq!(run("[1,2,3]", "sum").unwrap(), "6");
        assert_eq!(run("[1,2.5]", "sum").unwrap(), "3.5");
        assert_eq!(run("[4,2,9]", "min").unwrap(), "2");
        assert_eq!(run("[4,2,9]", "max").unwrap(), "9");
        assert_eq!(run("[1,2]", "mean").unwrap(), "1.5");
        assert_eq!(run("[1,2,3]", "count").unwrap(), "3");
        assert_eq!(run("[]", "sum").unwrap(), "0");
        assert_eq!(run("[]", "max").unwrap(), "null");

        let out = run(r#"[{"a":1,"b":"x"},{"a":3}]"#, "sum").unwrap();
        assert_eq!(out, r#"{"a":4}"#);
        assert_eq!(run(r#"[{"a":1},{"a":3}]"#, "max on a").unwrap(), "3");
    }

    #[test]
    fn test_select_and_distinct() {
        let out = run(r#"[{"a":1,"b":2,"c":3}]"#, "select c, a").unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v, json!([{"a":1,"c":3}]));
        assert_eq!(run("[1,2,1,3,2]", "distinct").unwrap(), "[1,2,3]");
        assert!(run("[1]", "select a").is_err());
    }

    #[test]
    fn test_pipeline() {
        let out = run("[5,1,4,2,3]", "filter gt 1 | increment by 10 | sort desc | head 2").unwrap();
        assert_eq!(out, "[15,14]");
        assert_eq!(Pipeline::parse("sum | count").unwrap().len(), 2);
    }

    #[test]
    fn test_unsupported_step_is_rejected() {
        let err = run("[1]", "import os").unwrap_err();
        assert_eq!(err.to_string(), "unsupported operation step 'import os'");

        let err = run("[1]", "sum | explode").unwrap_err();
        assert_eq!(err.to_string(), "unsupported operation step 'explode'");
    }

    #[test]
    fn test_malformed_steps() {
        let err = run("[1]", "increment by ten").unwrap_err();
        assert!(matches!(err, TransformError::InvalidStep { .. }));
        assert!(err.to_string().contains("increment by ten"));

        assert!(run("[1]", "head").is_err());
        assert!(run("[1]", "filter about 3").is_err());
        assert!(run("[1]", "sum |").is_err());
        assert_eq!(run("[1]", "  ").unwrap_err().to_string(), "operation is empty");
    }

    #[test]
    fn test_bad_input() {
        let err = run("not json", "identity").unwrap_err();
        assert!(err.to_string().starts_with("input is not valid JSON"));

        let err = Sandbox::new().apply(b"[1]", &[0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, TransformError::OperationNotUtf8));
    }

    #[test]
    fn test_executed_counter() {
        let mut sandbox = Sandbox::new();
        sandbox.apply(b"[1]", b"identity").unwrap();
        let _ = sandbox.apply(b"[1]", b"nope");
        assert_eq!(sandbox.executed(), 1);
    }
}
