//! A small filter expression language evaluated over one change record at a
//! time. Expressions are compiled once at startup and the compiled form is
//! shared across all shard processors.
//!
//! Grammar, loosest binding first: `||`, `&&`, `== !=`, `< <= > >=`, unary
//! `! -`, then literals (`'str'`, `"str"`, numbers, `true`, `false`,
//! `null`), dotted field paths, and parentheses.

mod parse;

use serde_json::Value;
use streams::ChangeRecord;

pub use parse::ParseError;
use parse::{BinOp, Expr, UnaryOp};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum EvalError {
    #[error("operand of '{op}' is not numeric: {value}")]
    NotNumeric { op: &'static str, value: Value },
}

/// A compiled filter expression. Safe for concurrent use.
#[derive(Debug, Clone)]
pub struct Filter {
    source: String,
    ast: Expr,
}

impl Filter {
    pub fn compile(source: &str) -> Result<Self, ParseError> {
        Ok(Self {
            source: source.to_string(),
            ast: parse::parse(source)?,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether the record passes the filter. Evaluation errors and
    /// non-truthy results exclude the record; errors never fail the batch.
    pub fn matches(&self, record: &ChangeRecord) -> bool {
        let context = record_context(record);
        match eval(&self.ast, &context) {
            Ok(value) => truthy(&value, &self.source),
            Err(err) => {
                tracing::warn!(
                    filter = %self.source,
                    sequence_number = %record.sequence_number,
                    %err,
                    "filter evaluation failed; excluding record"
                );
                false
            }
        }
    }

    /// Evaluate against an arbitrary context document.
    pub fn evaluate(&self, context: &Value) -> Result<Value, EvalError> {
        eval(&self.ast, context)
    }
}

/// The evaluation context of one record: `metadata.*` plus the decoded
/// images under `newImage` / `oldImage`. Missing fields resolve to null.
pub fn record_context(record: &ChangeRecord) -> Value {
    let image = |image: &Option<_>| match image {
        Some(cells) => ChangeRecord::image_to_json(cells),
        None => Value::Null,
    };

    serde_json::json!({
        "metadata": {
            "operation": record.operation.as_str(),
            "sequenceNumber": record.sequence_number.as_str(),
            "approximateArrivalTimestamp": record.arrival_time,
        },
        "newImage": image(&record.new_image),
        "oldImage": image(&record.old_image),
    })
}

/// Expression truthiness: booleans as themselves, numbers by non-zero,
/// strings parsed as booleans, anything else non-null is false with a
/// warning.
fn truthy(value: &Value, source: &str) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => s.eq_ignore_ascii_case("true"),
        Value::Null => false,
        other => {
            tracing::warn!(filter = %source, result = %other, "filter result is not coercible to boolean");
            false
        }
    }
}

fn eval(expr: &Expr, context: &Value) -> Result<Value, EvalError> {
    Ok(match expr {
        Expr::Literal(value) => value.clone(),
        Expr::Path(segments) => {
            let mut cursor = context;
            for segment in segments {
                cursor = cursor.get(segment).unwrap_or(&Value::Null);
            }
            cursor.clone()
        }
        Expr::Unary(UnaryOp::Not, inner) => {
            let inner = eval(inner, context)?;
            Value::Bool(!truthy(&inner, "!"))
        }
        Expr::Unary(UnaryOp::Neg, inner) => {
            let inner = eval(inner, context)?;
            let n = as_number("-", &inner)?;
            serde_json::json!(-n)
        }
        Expr::Binary(BinOp::Or, lhs, rhs) => {
            if truthy(&eval(lhs, context)?, "||") {
                Value::Bool(true)
            } else {
                Value::Bool(truthy(&eval(rhs, context)?, "||"))
            }
        }
        Expr::Binary(BinOp::And, lhs, rhs) => {
            if !truthy(&eval(lhs, context)?, "&&") {
                Value::Bool(false)
            } else {
                Value::Bool(truthy(&eval(rhs, context)?, "&&"))
            }
        }
        Expr::Binary(BinOp::Eq, lhs, rhs) => {
            Value::Bool(loose_eq(&eval(lhs, context)?, &eval(rhs, context)?))
        }
        Expr::Binary(BinOp::Ne, lhs, rhs) => {
            Value::Bool(!loose_eq(&eval(lhs, context)?, &eval(rhs, context)?))
        }
        Expr::Binary(op, lhs, rhs) => {
            let lhs = as_number(op.symbol(), &eval(lhs, context)?)?;
            let rhs = as_number(op.symbol(), &eval(rhs, context)?)?;
            Value::Bool(match op {
                BinOp::Lt => lhs < rhs,
                BinOp::Le => lhs <= rhs,
                BinOp::Gt => lhs > rhs,
                BinOp::Ge => lhs >= rhs,
                _ => unreachable!("handled above"),
            })
        }
    })
}

/// Equality with numeric coercion: numbers (and numeric strings) compare
/// numerically, otherwise values compare structurally.
fn loose_eq(lhs: &Value, rhs: &Value) -> bool {
    if let (Some(l), Some(r)) = (numeric(lhs), numeric(rhs)) {
        return l == r;
    }
    lhs == rhs
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_number(op: &'static str, value: &Value) -> Result<f64, EvalError> {
    numeric(value).ok_or_else(|| EvalError::NotNumeric {
        op,
        value: value.clone(),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::BTreeMap;
    use streams::{CellValue, OperationType};

    fn record(operation: OperationType, n: i32) -> ChangeRecord {
        let image: BTreeMap<String, CellValue> = [
            ("id".to_string(), CellValue::Text("x".to_string())),
            ("n".to_string(), CellValue::Int(n)),
        ]
        .into_iter()
        .collect();

        let (new_image, old_image) = if operation.is_delete() {
            (None, Some(image))
        } else {
            (Some(image), None)
        };
        ChangeRecord {
            sequence_number: "100".into(),
            arrival_time: 1234,
            operation,
            new_image,
            old_image,
        }
    }

    #[test]
    fn operation_and_field_filter() {
        let filter =
            Filter::compile("metadata.operation == 'INSERT' && newImage.n > 5").unwrap();

        assert!(filter.matches(&record(OperationType::Insert, 10)));
        assert!(!filter.matches(&record(OperationType::Insert, 3)));
        assert!(!filter.matches(&record(OperationType::Delete, 10)));
    }

    #[test]
    fn missing_fields_resolve_to_null() {
        let filter = Filter::compile("newImage.absent == null").unwrap();
        assert!(filter.matches(&record(OperationType::Insert, 1)));

        let filter = Filter::compile("oldImage.n > 5").unwrap();
        // oldImage is null for inserts; the relational op errors and the
        // record is excluded, never the batch.
        assert!(!filter.matches(&record(OperationType::Insert, 10)));
    }

    #[test]
    fn precedence_and_grouping() {
        let context = json!({});
        let filter = Filter::compile("1 + 0 == 1 || false").unwrap_err();
        // No arithmetic in the grammar.
        let _ = filter;

        let filter = Filter::compile("(1 == 2 || 2 == 2) && !false").unwrap();
        assert_eq!(filter.evaluate(&context).unwrap(), json!(true));

        let filter = Filter::compile("1 == 2 || 2 == 2 && false").unwrap();
        assert_eq!(filter.evaluate(&context).unwrap(), json!(false));
    }

    #[test]
    fn numeric_coercion() {
        let context = json!({"a": "7", "b": 7.0});
        for expr in ["a == 7", "b == 7", "a >= b", "-a == -7"] {
            let filter = Filter::compile(expr).unwrap();
            assert_eq!(filter.evaluate(&context).unwrap(), json!(true), "{expr}");
        }
    }

    #[test]
    fn truthiness_rules() {
        let cases = vec![
            (json!(true), true),
            (json!(false), false),
            (json!(1), true),
            (json!(0), false),
            (json!("true"), true),
            (json!("TRUE"), true),
            (json!("yes"), false),
            (json!(null), false),
            (json!({"a": 1}), false),
            (json!([1]), false),
        ];
        for (value, want) in cases {
            assert_eq!(truthy(&value, "test"), want, "{value}");
        }
    }

    #[test]
    fn metadata_paths() {
        let filter = Filter::compile(
            "metadata.sequenceNumber == '100' && metadata.approximateArrivalTimestamp == 1234",
        )
        .unwrap();
        assert!(filter.matches(&record(OperationType::Insert, 1)));
    }
}
