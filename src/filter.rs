//! Translation of filter expressions into the API filter grammar.
//!
//! ```text
//! 'Flight Record' >= 17000
//! ```
//! becomes
//! ```json
//! {"type": "filter", "value": {"operator": "greaterThanOrEqual",
//!   "args": [{"type": "field", "value": "[-hub-][field]..."},
//!            {"type": "constant", "value": 17000}]}}
//! ```
//!
//! The operator tables are keyed by the field type. An operator that is
//! legal for one type is rejected for another.

use crate::expr::{BinaryOp, Comparator, Expression, Literal, NullCheck};
use crate::schema::MetadataStore;
use crate::types::{EmsError, FieldDescriptor, FieldType, Result};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Filter operator names understood by the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOperator {
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    BetweenExclusive,
    BetweenInclusive,
    NotBetweenExclusive,
    NotBetweenInclusive,
    In,
    NotIn,
    IsNull,
    IsNotNull,
    IsTrue,
    IsFalse,
    DateTimeBefore,
    DateTimeOnAfter,
}

impl FilterOperator {
    fn basic(op: Comparator) -> Self {
        match op {
            Comparator::Eq => FilterOperator::Equal,
            Comparator::Ne => FilterOperator::NotEqual,
            Comparator::Lt => FilterOperator::LessThan,
            Comparator::Le => FilterOperator::LessThanOrEqual,
            Comparator::Gt => FilterOperator::GreaterThan,
            Comparator::Ge => FilterOperator::GreaterThanOrEqual,
        }
    }

    fn between(outer: Comparator, inner: Comparator) -> Option<Self> {
        match (outer, inner) {
            (Comparator::Lt, Comparator::Lt) => Some(FilterOperator::BetweenExclusive),
            (Comparator::Le, Comparator::Le) => Some(FilterOperator::BetweenInclusive),
            (Comparator::Gt, Comparator::Gt) => Some(FilterOperator::NotBetweenExclusive),
            (Comparator::Ge, Comparator::Ge) => Some(FilterOperator::NotBetweenInclusive),
            _ => None,
        }
    }

    fn null_check(op: NullCheck) -> Self {
        match op {
            NullCheck::IsNull => FilterOperator::IsNull,
            NullCheck::IsNotNull => FilterOperator::IsNotNull,
        }
    }

    fn membership(negated: bool) -> Self {
        if negated {
            FilterOperator::NotIn
        } else {
            FilterOperator::In
        }
    }
}

/// A tagged filter argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Arg {
    Field(String),
    Constant(Value),
}

/// One comparison in the API filter grammar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterNode {
    pub operator: FilterOperator,
    pub args: Vec<Arg>,
}

impl FilterNode {
    fn new(operator: FilterOperator, field: &FieldDescriptor) -> Self {
        Self {
            operator,
            args: vec![Arg::Field(field.id.clone())],
        }
    }

    fn constant(mut self, value: Value) -> Self {
        self.args.push(Arg::Constant(value));
        self
    }

    fn constants(mut self, values: impl IntoIterator<Item = Value>) -> Self {
        self.args.extend(values.into_iter().map(Arg::Constant));
        self
    }

    /// Wrap the node in its `{"type": "filter", "value": ...}` envelope.
    pub fn into_predicate(self) -> Predicate {
        Predicate::Filter(self)
    }
}

/// Entry of a filter group as sent on the wire:
/// `{"type": "filter", "value": {"operator": ..., "args": [...]}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Predicate {
    #[serde(rename = "filter")]
    Filter(FilterNode),
}

/// An expression with its field resolved and its constants parsed.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Null(NullCheck),
    Compare(Comparator, Literal),
    Membership { negated: bool, values: Vec<Literal> },
    Range {
        outer: Comparator,
        inner: Comparator,
        low: Literal,
        high: Literal,
    },
}

impl Condition {
    fn describe(&self) -> String {
        match self {
            Condition::Null(op) => op.to_string(),
            Condition::Compare(op, _) => op.to_string(),
            Condition::Membership { negated: false, .. } => "in".to_string(),
            Condition::Membership { negated: true, .. } => "not in".to_string(),
            Condition::Range { outer, inner, .. } => format!("{} ... {}", outer, inner),
        }
    }
}

fn parse_field_name(token: &str) -> Result<String> {
    match Literal::parse(token)? {
        Literal::Str(name) => Ok(name),
        other => Err(EmsError::MalformedExpression(format!(
            "expected a quoted field name, found {}",
            other
        ))),
    }
}

fn parse_scalar(token: &str) -> Result<Literal> {
    match Literal::parse(token)? {
        Literal::List(_) => Err(EmsError::MalformedExpression(format!(
            "a list cannot be used with this operator: {}",
            token
        ))),
        lit => Ok(lit),
    }
}

/// Resolve the field operand of an expression and parse its constants.
///
/// In a binary comparison the field is normally on the left. When the left
/// operand names no field and the right one does (`17000 < 'Flight Record'`),
/// the operands are swapped and the comparator mirrored. In a range
/// expression the field is always the middle operand and the bounds keep
/// their written order.
pub fn resolve(expr: &Expression, store: &dyn MetadataStore) -> Result<(FieldDescriptor, Condition)> {
    match expr {
        Expression::Unary { operand, op } => {
            let field = store.search_field(&parse_field_name(operand)?)?;
            Ok((field, Condition::Null(*op)))
        }
        Expression::Binary { left, op, right } => match op {
            BinaryOp::In | BinaryOp::NotIn => {
                let field = store.search_field(&parse_field_name(left)?)?;
                let values = match Literal::parse(right)? {
                    Literal::List(items) if items.is_empty() => {
                        return Err(EmsError::MalformedExpression(format!(
                            "'{}' needs at least one value",
                            op
                        )))
                    }
                    Literal::List(items) => items,
                    single => vec![single],
                };
                let negated = *op == BinaryOp::NotIn;
                Ok((field, Condition::Membership { negated, values }))
            }
            BinaryOp::Compare(cmp) => {
                let left_name = parse_field_name(left);
                let left_field = match &left_name {
                    Ok(name) => store.search_field(name),
                    Err(_) => Err(EmsError::UnknownField(left.clone())),
                };
                match left_field {
                    Ok(field) => Ok((field, Condition::Compare(*cmp, parse_scalar(right)?))),
                    Err(EmsError::UnknownField(keyword)) => {
                        let mirrored = parse_field_name(right)
                            .ok()
                            .and_then(|name| store.search_field(&name).ok());
                        match mirrored {
                            Some(field) => {
                                Ok((field, Condition::Compare(cmp.flip(), parse_scalar(left)?)))
                            }
                            None => {
                                // A malformed left operand is reported as such.
                                left_name?;
                                Err(EmsError::UnknownField(keyword))
                            }
                        }
                    }
                    Err(e) => Err(e),
                }
            }
        },
        Expression::Range {
            low,
            outer,
            field,
            inner,
            high,
        } => {
            let field = store.search_field(&parse_field_name(field)?)?;
            Ok((
                field,
                Condition::Range {
                    outer: *outer,
                    inner: *inner,
                    low: parse_scalar(low)?,
                    high: parse_scalar(high)?,
                },
            ))
        }
    }
}

/// Translate an expression string into a filter node.
pub fn build_filter(expr: &str, store: &dyn MetadataStore) -> Result<FilterNode> {
    let parsed = Expression::parse(expr)?;
    let (field, condition) = resolve(&parsed, store)?;
    build_node(&field, condition, store)
}

/// Build the filter node for a resolved condition, dispatching on field type.
///
/// | type     | comparisons          | `in` / `not in` | range | null checks |
/// |----------|----------------------|-----------------|-------|-------------|
/// | boolean  | `==`, `!=`           | no              | no    | yes         |
/// | discrete | all six              | yes             | no    | yes         |
/// | number   | all six              | yes             | yes   | yes         |
/// | string   | `==`, `!=`           | yes             | no    | yes         |
/// | dateTime | `<`, `>=`            | no              | no    | yes         |
///
/// Discrete values are written as display labels and sent as their keys.
pub fn build_node(field: &FieldDescriptor, condition: Condition, store: &dyn MetadataStore) -> Result<FilterNode> {
    match field.field_type {
        FieldType::Boolean => boolean_filter(field, condition),
        FieldType::Discrete => discrete_filter(field, condition, store),
        FieldType::Number => number_filter(field, condition),
        FieldType::String => string_filter(field, condition),
        FieldType::DateTime => datetime_filter(field, condition),
    }
}

fn unsupported(field: &FieldDescriptor, condition: &Condition) -> EmsError {
    EmsError::UnsupportedOperator {
        operator: condition.describe(),
        field_type: field.field_type,
    }
}

fn boolean_filter(field: &FieldDescriptor, condition: Condition) -> Result<FilterNode> {
    let operator = match &condition {
        Condition::Null(op) => FilterOperator::null_check(*op),
        Condition::Compare(op @ (Comparator::Eq | Comparator::Ne), value) => {
            let Literal::Bool(b) = value else {
                return Err(EmsError::InvalidLiteral(format!(
                    "{}: use a boolean value for {}",
                    value, field.name
                )));
            };
            if *b == (*op == Comparator::Eq) {
                FilterOperator::IsTrue
            } else {
                FilterOperator::IsFalse
            }
        }
        _ => return Err(unsupported(field, &condition)),
    };
    Ok(FilterNode::new(operator, field))
}

fn discrete_filter(field: &FieldDescriptor, condition: Condition, store: &dyn MetadataStore) -> Result<FilterNode> {
    let value_id = |lit: &Literal| -> Result<Value> {
        store
            .get_value_id(&lit.display_value(), &field.id)
            .map(Value::from)
    };
    match &condition {
        Condition::Null(op) => Ok(FilterNode::new(FilterOperator::null_check(*op), field)),
        Condition::Compare(op, value) => {
            Ok(FilterNode::new(FilterOperator::basic(*op), field).constant(value_id(value)?))
        }
        Condition::Membership { negated, values } => {
            let ids = values.iter().map(value_id).collect::<Result<Vec<_>>>()?;
            Ok(FilterNode::new(FilterOperator::membership(*negated), field).constants(ids))
        }
        Condition::Range { .. } => Err(unsupported(field, &condition)),
    }
}

fn number_filter(field: &FieldDescriptor, condition: Condition) -> Result<FilterNode> {
    match &condition {
        Condition::Null(op) => Ok(FilterNode::new(FilterOperator::null_check(*op), field)),
        Condition::Compare(op, value) => {
            Ok(FilterNode::new(FilterOperator::basic(*op), field).constant(value.to_json()))
        }
        Condition::Membership { negated, values } => Ok(
            FilterNode::new(FilterOperator::membership(*negated), field)
                .constants(values.iter().map(Literal::to_json)),
        ),
        Condition::Range {
            outer,
            inner,
            low,
            high,
        } => {
            let operator =
                FilterOperator::between(*outer, *inner).ok_or_else(|| unsupported(field, &condition))?;
            Ok(FilterNode::new(operator, field)
                .constant(low.to_json())
                .constant(high.to_json()))
        }
    }
}

fn string_filter(field: &FieldDescriptor, condition: Condition) -> Result<FilterNode> {
    match &condition {
        Condition::Null(op) => Ok(FilterNode::new(FilterOperator::null_check(*op), field)),
        Condition::Compare(op @ (Comparator::Eq | Comparator::Ne), value) => {
            Ok(FilterNode::new(FilterOperator::basic(*op), field).constant(value.to_json()))
        }
        Condition::Membership { negated, values } => Ok(
            FilterNode::new(FilterOperator::membership(*negated), field)
                .constants(values.iter().map(Literal::to_json)),
        ),
        _ => Err(unsupported(field, &condition)),
    }
}

fn datetime_filter(field: &FieldDescriptor, condition: Condition) -> Result<FilterNode> {
    let (operator, value) = match condition {
        Condition::Null(op) => return Ok(FilterNode::new(FilterOperator::null_check(op), field)),
        Condition::Compare(Comparator::Lt, value) => (FilterOperator::DateTimeBefore, value),
        Condition::Compare(Comparator::Ge, value) => (FilterOperator::DateTimeOnAfter, value),
        other => return Err(unsupported(field, &other)),
    };
    // Comparisons are made in UTC.
    Ok(FilterNode::new(operator, field)
        .constant(value.to_json())
        .constant(Value::String("Utc".into())))
}
