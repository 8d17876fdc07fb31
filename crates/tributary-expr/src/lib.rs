//! Boolean condition language for Tributary batch triggers.
//!
//! A condition is parsed once, type-checked against the variables it may
//! reference, and then evaluated any number of times against a resolver.
//!
//! # Example
//! ```
//! use tributary_expr::{Condition, Value, ValueType};
//!
//! let cond = Condition::compile(
//!     "batch_count >= 10 or batch_age_seconds > 2.5",
//!     &[("batch_count", ValueType::Number), ("batch_age_seconds", ValueType::Number)],
//! )
//! .unwrap();
//! let fired = cond.evaluate(&|name: &str| match name {
//!     "batch_count" => Some(Value::Number(3.0)),
//!     "batch_age_seconds" => Some(Value::Number(4.0)),
//!     _ => None,
//! });
//! assert!(fired);
//! ```

pub mod ast;
mod parser;

use std::collections::HashMap;

pub use ast::*;
pub use parser::parse;

use tributary_types::TributaryError;

/// A parsed, type-checked boolean condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    /// Parse `source` and check that it is a boolean expression over `variables`.
    ///
    /// Unknown identifiers and operand type mismatches are rejected here so
    /// evaluation never has to fail.
    pub fn compile(
        source: &str,
        variables: &[(&str, ValueType)],
    ) -> Result<Self, TributaryError> {
        let expr = parse(source)?;
        let scope: HashMap<&str, ValueType> = variables.iter().copied().collect();
        let ty = infer_type(&expr, &scope).map_err(|message| TributaryError::ExpressionError {
            expression: source.to_string(),
            offset: 0,
            message,
        })?;
        if ty != ValueType::Bool {
            return Err(TributaryError::ExpressionError {
                expression: source.to_string(),
                offset: 0,
                message: format!("condition must be boolean, found {ty}"),
            });
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Evaluate against the values supplied by `resolve`.
    ///
    /// A variable the resolver cannot supply, or supplies with the wrong
    /// type, makes the enclosing comparison false.
    pub fn evaluate(&self, resolve: &dyn Fn(&str) -> Option<Value>) -> bool {
        matches!(eval(&self.expr, resolve), Some(Value::Bool(true)))
    }
}

fn infer_type(expr: &Expr, scope: &HashMap<&str, ValueType>) -> Result<ValueType, String> {
    match expr {
        Expr::Number(_) => Ok(ValueType::Number),
        Expr::Bool(_) => Ok(ValueType::Bool),
        Expr::Ident(name) => scope.get(name.as_str()).copied().ok_or_else(|| {
            let mut known: Vec<_> = scope.keys().copied().collect();
            known.sort_unstable();
            format!("unknown variable '{name}' (known: {})", known.join(", "))
        }),
        Expr::Not(inner) => expect_bool(inner, scope, "not"),
        Expr::And(left, right) => {
            expect_bool(left, scope, "and")?;
            expect_bool(right, scope, "and")
        }
        Expr::Or(left, right) => {
            expect_bool(left, scope, "or")?;
            expect_bool(right, scope, "or")
        }
        Expr::Compare { op, left, right } => {
            let lt = infer_type(left, scope)?;
            let rt = infer_type(right, scope)?;
            if lt != rt {
                return Err(format!(
                    "cannot compare {lt} with {rt} using '{}'",
                    op.symbol()
                ));
            }
            if op.is_ordering() && lt != ValueType::Number {
                return Err(format!("operator '{}' requires numbers", op.symbol()));
            }
            Ok(ValueType::Bool)
        }
    }
}

fn expect_bool(
    expr: &Expr,
    scope: &HashMap<&str, ValueType>,
    operator: &str,
) -> Result<ValueType, String> {
    match infer_type(expr, scope)? {
        ValueType::Bool => Ok(ValueType::Bool),
        other => Err(format!("operand of '{operator}' must be boolean, found {other}")),
    }
}

fn eval(expr: &Expr, resolve: &dyn Fn(&str) -> Option<Value>) -> Option<Value> {
    match expr {
        Expr::Number(n) => Some(Value::Number(*n)),
        Expr::Bool(b) => Some(Value::Bool(*b)),
        Expr::Ident(name) => resolve(name),
        Expr::Not(inner) => match eval(inner, resolve)? {
            Value::Bool(b) => Some(Value::Bool(!b)),
            Value::Number(_) => None,
        },
        // Short-circuit so later clauses are not evaluated once the result is known.
        Expr::And(left, right) => match eval(left, resolve) {
            Some(Value::Bool(true)) => Some(Value::Bool(truthy(eval(right, resolve)))),
            _ => Some(Value::Bool(false)),
        },
        Expr::Or(left, right) => match eval(left, resolve) {
            Some(Value::Bool(true)) => Some(Value::Bool(true)),
            _ => Some(Value::Bool(truthy(eval(right, resolve)))),
        },
        Expr::Compare { op, left, right } => {
            let result = match (eval(left, resolve), eval(right, resolve)) {
                (Some(Value::Number(a)), Some(Value::Number(b))) => match op {
                    CompareOp::Lt => a < b,
                    CompareOp::Le => a <= b,
                    CompareOp::Gt => a > b,
                    CompareOp::Ge => a >= b,
                    CompareOp::Eq => a == b,
                    CompareOp::Ne => a != b,
                },
                (Some(Value::Bool(a)), Some(Value::Bool(b))) => match op {
                    CompareOp::Eq => a == b,
                    CompareOp::Ne => a != b,
                    _ => false,
                },
                _ => false,
            };
            Some(Value::Bool(result))
        }
    }
}

fn truthy(value: Option<Value>) -> bool {
    matches!(value, Some(Value::Bool(true)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BATCH_VARS: &[(&str, ValueType)] = &[
        ("batch_count", ValueType::Number),
        ("batch_age_seconds", ValueType::Number),
    ];

    fn batch(count: f64, age: f64) -> impl Fn(&str) -> Option<Value> {
        move |name: &str| match name {
            "batch_count" => Some(Value::Number(count)),
            "batch_age_seconds" => Some(Value::Number(age)),
            _ => None,
        }
    }

    #[test]
    fn parse_simple_comparison() {
        let expr = parse("batch_count >= 10").unwrap();
        assert_eq!(
            expr,
            Expr::Compare {
                op: CompareOp::Ge,
                left: Box::new(Expr::Ident("batch_count".into())),
                right: Box::new(Expr::Number(10.0)),
            }
        );
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let expr = parse("a > 1 or b > 2 and c > 3").unwrap();
        match expr {
            Expr::Or(_, right) => assert!(matches!(*right, Expr::And(_, _))),
            other => panic!("expected Or at the root, got {other:?}"),
        }
    }

    #[test]
    fn symbolic_and_word_operators_are_equivalent() {
        assert_eq!(
            parse("a > 1 && !(b < 2)").unwrap(),
            parse("a > 1 and not (b < 2)").unwrap()
        );
    }

    #[test]
    fn keyword_prefix_is_an_identifier() {
        let expr = parse("order_count > 1").unwrap();
        assert!(matches!(
            expr,
            Expr::Compare { ref left, .. } if **left == Expr::Ident("order_count".into())
        ));
        assert_eq!(parse("notes == true").unwrap(), Expr::Compare {
            op: CompareOp::Eq,
            left: Box::new(Expr::Ident("notes".into())),
            right: Box::new(Expr::Bool(true)),
        });
    }

    #[test]
    fn fractional_and_negative_numbers() {
        let expr = parse("batch_age_seconds > -0.5").unwrap();
        assert!(matches!(
            expr,
            Expr::Compare { ref right, .. } if **right == Expr::Number(-0.5)
        ));
    }

    #[test]
    fn parse_errors_report_offset() {
        let err = parse("batch_count >").unwrap_err();
        match err {
            TributaryError::ExpressionError { offset, .. } => assert!(offset >= 12),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(parse("").is_err());
        assert!(parse("(batch_count > 1").is_err());
        assert!(parse("batch_count > 1 )").is_err());
        assert!(parse("and > 1").is_err());
    }

    #[test]
    fn compile_rejects_unknown_variables() {
        let err = Condition::compile("row_count > 1", BATCH_VARS).unwrap_err();
        assert!(err.to_string().contains("unknown variable 'row_count'"));
    }

    #[test]
    fn compile_rejects_non_boolean_conditions() {
        let err = Condition::compile("batch_count", BATCH_VARS).unwrap_err();
        assert!(err.to_string().contains("must be boolean"));
        assert!(Condition::compile("batch_count > true", BATCH_VARS).is_err());
        assert!(Condition::compile("true < false", BATCH_VARS).is_err());
        assert!(Condition::compile("not batch_count", BATCH_VARS).is_err());
    }

    #[test]
    fn evaluate_against_batch_state() {
        let cond = Condition::compile(
            "batch_count >= 5 and batch_age_seconds < 10",
            BATCH_VARS,
        )
        .unwrap();
        assert!(cond.evaluate(&batch(5.0, 1.0)));
        assert!(!cond.evaluate(&batch(4.0, 1.0)));
        assert!(!cond.evaluate(&batch(6.0, 12.0)));
        assert_eq!(cond.source(), "batch_count >= 5 and batch_age_seconds < 10");
    }

    #[test]
    fn missing_variable_makes_comparison_false() {
        let cond = Condition::compile("batch_count > 0", BATCH_VARS).unwrap();
        assert!(!cond.evaluate(&|_: &str| None));
    }

    #[test]
    fn boolean_literals_and_equality() {
        let cond = Condition::compile("true == (batch_count != 0)", BATCH_VARS).unwrap();
        assert!(cond.evaluate(&batch(1.0, 0.0)));
        assert!(!cond.evaluate(&batch(0.0, 0.0)));
    }
}
