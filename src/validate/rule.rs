//! Declarative record rules.
//!
//! A rule is a boolean SQL expression over one record. It is parsed with
//! `sqlparser` and compiled into a small predicate tree. Accepted nodes:
//! `AND`, `OR`, `NOT`, `IS [NOT] NULL`, comparisons, `[NOT] IN (...)`,
//! `[NOT] BETWEEN`, parentheses, columns and literals. Anything else is
//! rejected when the configuration is loaded.
//!
//! Evaluation is three-valued: comparisons involving `NULL` are unknown,
//! and a rule passes only when it evaluates to true.

use indexmap::IndexMap;
use sqlparser::ast::{self, BinaryOperator, UnaryOperator};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::{Parser, ParserError};
use sqlparser::tokenizer::Token;
use std::cmp::Ordering;
use std::fmt;

use crate::error::RuleError;
use crate::value::{Record, Value};

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn holds(self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::Ne => ordering != Ordering::Equal,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::Le => ordering != Ordering::Greater,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Ge => ordering != Ordering::Less,
        }
    }

    fn from_sql(op: &BinaryOperator) -> Option<Self> {
        Some(match op {
            BinaryOperator::Eq => CompareOp::Eq,
            BinaryOperator::NotEq => CompareOp::Ne,
            BinaryOperator::Lt => CompareOp::Lt,
            BinaryOperator::LtEq => CompareOp::Le,
            BinaryOperator::Gt => CompareOp::Gt,
            BinaryOperator::GtEq => CompareOp::Ge,
            _ => return None,
        })
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        };
        f.write_str(s)
    }
}

/// Leaf of an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Column(String),
    Literal(Value),
}

impl Operand {
    fn resolve<'a>(&'a self, record: &'a Record) -> &'a Value {
        match self {
            Operand::Column(name) => record.value(name),
            Operand::Literal(value) => value,
        }
    }
}

/// Compiled rule expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    IsNull { operand: Operand, negated: bool },
    Compare {
        left: Operand,
        op: CompareOp,
        right: Operand,
    },
    InList {
        operand: Operand,
        list: Vec<Operand>,
        negated: bool,
    },
    /// A bare operand, true when it is boolean `TRUE`.
    Truthy(Operand),
}

impl Expr {
    /// Parse and compile an expression.
    pub fn parse(input: &str) -> Result<Self, RuleError> {
        let dialect = GenericDialect {};
        let mut parser = Parser::new(&dialect)
            .try_with_sql(input)
            .map_err(syntax_error)?;
        let expr = parser.parse_expr().map_err(syntax_error)?;
        let next = parser.peek_token();
        if next.token != Token::EOF {
            return Err(RuleError::TrailingInput {
                found: next.token.to_string(),
            });
        }
        compile(&expr)
    }

    /// Evaluate with SQL three-valued logic. `None` means unknown.
    pub fn evaluate(&self, record: &Record) -> Option<bool> {
        match self {
            Expr::And(a, b) => match (a.evaluate(record), b.evaluate(record)) {
                (Some(false), _) | (_, Some(false)) => Some(false),
                (Some(true), Some(true)) => Some(true),
                _ => None,
            },
            Expr::Or(a, b) => match (a.evaluate(record), b.evaluate(record)) {
                (Some(true), _) | (_, Some(true)) => Some(true),
                (Some(false), Some(false)) => Some(false),
                _ => None,
            },
            Expr::Not(inner) => inner.evaluate(record).map(|b| !b),
            Expr::IsNull { operand, negated } => {
                Some(operand.resolve(record).is_null() != *negated)
            }
            Expr::Compare { left, op, right } => left
                .resolve(record)
                .compare_loose(right.resolve(record))
                .map(|ordering| op.holds(ordering)),
            Expr::InList {
                operand,
                list,
                negated,
            } => {
                let value = operand.resolve(record);
                let mut unknown = false;
                for item in list {
                    match value.compare_loose(item.resolve(record)) {
                        Some(Ordering::Equal) => return Some(!*negated),
                        Some(_) => {}
                        None => unknown = true,
                    }
                }
                if unknown { None } else { Some(*negated) }
            }
            Expr::Truthy(operand) => match operand.resolve(record) {
                Value::Boolean(b) => Some(*b),
                _ => None,
            },
        }
    }
}

fn syntax_error(err: ParserError) -> RuleError {
    RuleError::Syntax {
        message: err.to_string(),
    }
}

fn unsupported(expr: &impl fmt::Display) -> RuleError {
    RuleError::Unsupported {
        expr: expr.to_string(),
    }
}

/// Compile a boolean expression.
fn compile(expr: &ast::Expr) -> Result<Expr, RuleError> {
    match expr {
        ast::Expr::Nested(inner) => compile(inner),
        ast::Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => Ok(Expr::And(Box::new(compile(left)?), Box::new(compile(right)?))),
        ast::Expr::BinaryOp {
            left,
            op: BinaryOperator::Or,
            right,
        } => Ok(Expr::Or(Box::new(compile(left)?), Box::new(compile(right)?))),
        ast::Expr::BinaryOp { left, op, right } => {
            let op = CompareOp::from_sql(op).ok_or_else(|| unsupported(expr))?;
            Ok(Expr::Compare {
                left: operand(left)?,
                op,
                right: operand(right)?,
            })
        }
        ast::Expr::UnaryOp {
            op: UnaryOperator::Not,
            expr: inner,
        } => Ok(Expr::Not(Box::new(compile(inner)?))),
        ast::Expr::IsNull(inner) => Ok(Expr::IsNull {
            operand: operand(inner)?,
            negated: false,
        }),
        ast::Expr::IsNotNull(inner) => Ok(Expr::IsNull {
            operand: operand(inner)?,
            negated: true,
        }),
        ast::Expr::InList {
            expr: inner,
            list,
            negated,
        } => Ok(Expr::InList {
            operand: operand(inner)?,
            list: list.iter().map(operand).collect::<Result<_, _>>()?,
            negated: *negated,
        }),
        ast::Expr::Between {
            expr: inner,
            negated,
            low,
            high,
        } => {
            let value = operand(inner)?;
            let within = Expr::And(
                Box::new(Expr::Compare {
                    left: value.clone(),
                    op: CompareOp::Ge,
                    right: operand(low)?,
                }),
                Box::new(Expr::Compare {
                    left: value,
                    op: CompareOp::Le,
                    right: operand(high)?,
                }),
            );
            Ok(if *negated {
                Expr::Not(Box::new(within))
            } else {
                within
            })
        }
        other => Ok(Expr::Truthy(operand(other)?)),
    }
}

/// Compile a column reference or literal.
fn operand(expr: &ast::Expr) -> Result<Operand, RuleError> {
    match expr {
        ast::Expr::Identifier(ident) => Ok(Operand::Column(ident.value.clone())),
        ast::Expr::Nested(inner) => operand(inner),
        ast::Expr::Value(value) => literal(value).map(Operand::Literal),
        ast::Expr::UnaryOp {
            op: UnaryOperator::Minus,
            expr: inner,
        } => match operand(inner)? {
            Operand::Literal(Value::Int64(i)) => Ok(Operand::Literal(Value::Int64(-i))),
            Operand::Literal(Value::Float64(f)) => Ok(Operand::Literal(Value::Float64(-f))),
            _ => Err(unsupported(expr)),
        },
        other => Err(unsupported(other)),
    }
}

fn literal(value: &ast::Value) -> Result<Value, RuleError> {
    match value {
        ast::Value::Number(text, _) => parse_number(text),
        ast::Value::SingleQuotedString(s) => Ok(Value::from(s.as_str())),
        ast::Value::Boolean(b) => Ok(Value::Boolean(*b)),
        ast::Value::Null => Ok(Value::Null),
        other => Err(unsupported(other)),
    }
}

fn parse_number(text: &str) -> Result<Value, RuleError> {
    if let Ok(i) = text.parse::<i64>() {
        return Ok(Value::Int64(i));
    }
    text.parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .map(Value::Float64)
        .ok_or_else(|| RuleError::InvalidNumber {
            text: text.to_string(),
        })
}

/// A named rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub source: String,
    pub expr: Expr,
}

/// An ordered set of named rules.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    /// Parse every rule, failing on the first invalid one.
    ///
    /// The error carries the name of the offending rule.
    pub fn parse(rules: &IndexMap<String, String>) -> Result<Self, (String, RuleError)> {
        let rules = rules
            .iter()
            .map(|(name, source)| {
                Expr::parse(source)
                    .map(|expr| Rule {
                        name: name.clone(),
                        source: source.clone(),
                        expr,
                    })
                    .map_err(|e| (name.clone(), e))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Indices of every rule the record violates.
    ///
    /// All rules are evaluated; unknown (`NULL`) results count as violations.
    pub fn violations(&self, record: &Record) -> Vec<usize> {
        self.rules
            .iter()
            .enumerate()
            .filter(|(_, rule)| rule.expr.evaluate(record) != Some(true))
            .map(|(i, _)| i)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, Value)]) -> Record {
        pairs.iter().map(|(k, v)| (*k, v.clone())).collect()
    }

    #[test]
    fn test_is_not_null() {
        let expr = Expr::parse("booking_id IS NOT NULL").unwrap();
        assert_eq!(
            expr.evaluate(&record(&[("booking_id", Value::Int64(1))])),
            Some(true)
        );
        assert_eq!(
            expr.evaluate(&record(&[("booking_id", Value::Null)])),
            Some(false)
        );
        assert_eq!(expr.evaluate(&Record::new()), Some(false));
    }

    #[test]
    fn test_keywords_are_case_insensitive() {
        let expr = Expr::parse("passenger_id is not null and amount >= 0").unwrap();
        let ok = record(&[("passenger_id", Value::Int64(7)), ("amount", Value::Float64(12.5))]);
        assert_eq!(expr.evaluate(&ok), Some(true));
    }

    #[test]
    fn test_comparisons() {
        let r = record(&[
            ("amount", Value::Float64(10.0)),
            ("status", Value::from("OK")),
        ]);
        let cases = [
            ("amount > 5", true),
            ("amount < 5", false),
            ("amount = 10", true),
            ("amount <> 10", false),
            ("amount != 11", true),
            ("status = 'OK'", true),
            ("status >= 'A' AND status <= 'Z'", true),
            ("NOT status = 'OK'", false),
            ("(amount > 50 OR status = 'OK') AND amount >= -1.5", true),
            ("amount BETWEEN 5 AND 10", true),
            ("amount NOT BETWEEN 5 AND 10", false),
            ("status IN ('OK', 'DONE')", true),
            ("status NOT IN ('OK', 'DONE')", false),
        ];
        for (rule, expected) in cases {
            assert_eq!(
                Expr::parse(rule).unwrap().evaluate(&r),
                Some(expected),
                "{rule}"
            );
        }
    }

    #[test]
    fn test_null_comparison_is_unknown() {
        let expr = Expr::parse("amount > 0").unwrap();
        assert_eq!(expr.evaluate(&record(&[("amount", Value::Null)])), None);

        let or = Expr::parse("amount > 0 OR TRUE").unwrap();
        assert_eq!(or.evaluate(&Record::new()), Some(true));

        let list = Expr::parse("status IN ('OK', NULL)").unwrap();
        assert_eq!(list.evaluate(&record(&[("status", Value::from("OK"))])), Some(true));
        assert_eq!(list.evaluate(&record(&[("status", Value::from("NO"))])), None);
    }

    #[test]
    fn test_escaped_quote() {
        let expr = Expr::parse("city = 'Xi''an'").unwrap();
        assert_eq!(
            expr.evaluate(&record(&[("city", Value::from("Xi'an"))])),
            Some(true)
        );
    }

    #[test]
    fn test_quoted_identifier() {
        let expr = Expr::parse("\"modified date\" IS NULL").unwrap();
        assert_eq!(expr.evaluate(&Record::new()), Some(true));
        assert_eq!(
            expr,
            Expr::IsNull {
                operand: Operand::Column("modified date".to_string()),
                negated: false,
            }
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            Expr::parse("booking_id IS"),
            Err(RuleError::Syntax { .. })
        ));
        assert!(matches!(Expr::parse("'open"), Err(RuleError::Syntax { .. })));
        assert_eq!(
            Expr::parse("a = 1 )"),
            Err(RuleError::TrailingInput {
                found: ")".to_string()
            })
        );
        assert!(matches!(Expr::parse("a IS 1"), Err(RuleError::Syntax { .. })));
    }

    #[test]
    fn test_unsupported_expressions_are_rejected() {
        for rule in [
            "length(name) > 3",
            "amount + 1 > 2",
            "name LIKE 'A%'",
            "booking_id IN (SELECT id FROM bookings)",
        ] {
            assert!(
                matches!(Expr::parse(rule), Err(RuleError::Unsupported { .. })),
                "{rule}"
            );
        }
    }

    #[test]
    fn test_rule_set_reports_every_violation() {
        let rules: IndexMap<String, String> = [
            ("valid_booking_id", "booking_id IS NOT NULL"),
            ("valid_passenger_id", "passenger_id IS NOT NULL"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let set = RuleSet::parse(&rules).unwrap();

        assert_eq!(set.violations(&Record::new()), vec![0, 1]);
        assert_eq!(
            set.violations(&record(&[("booking_id", Value::Int64(100))])),
            vec![1]
        );
        assert!(set
            .violations(&record(&[
                ("booking_id", Value::Int64(101)),
                ("passenger_id", Value::Int64(7))
            ]))
            .is_empty());
    }

    #[test]
    fn test_rule_set_names_bad_rule() {
        let rules: IndexMap<String, String> = [("broken".to_string(), "a >".to_string())]
            .into_iter()
            .collect();
        let (name, err) = RuleSet::parse(&rules).unwrap_err();
        assert_eq!(name, "broken");
        assert!(matches!(err, RuleError::Syntax { .. }));
    }
}
