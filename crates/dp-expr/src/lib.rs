#![forbid(unsafe_code)]

//! Recursive expression trees for depict contexts.
//!
//! The wire form is the operator-keyed JSON the rest of the system stores
//! and ships: `{"and": [...]}` for groups, `{"==": [{"var": ...}, value]}`
//! for comparisons, `{"!": [expr]}` for a negation wrapper. An object whose
//! single key is not a recognized operator is a data-integrity fault and
//! surfaces as [`ExprError::UnknownOperator`].

use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExprError {
    #[error("unknown operator: {0}")]
    UnknownOperator(String),
    #[error("invalid slice id: {0}")]
    InvalidSliceId(String),
    #[error("invalid comparison operand: {0}")]
    InvalidOperand(String),
    #[error("invalid path segment: {0}")]
    InvalidPath(String),
    #[error("no node at path {0}")]
    PathNotFound(String),
    #[error("expected {expected} at path {path}")]
    NodeShape {
        expected: &'static str,
        path: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Eq,
    Ne,
    In,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CompareOp {
    #[must_use]
    pub const fn token(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::In => "in",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
        }
    }

    #[must_use]
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "==" => Some(Self::Eq),
            "!=" => Some(Self::Ne),
            "in" => Some(Self::In),
            ">" => Some(Self::Gt),
            ">=" => Some(Self::Ge),
            "<" => Some(Self::Lt),
            "<=" => Some(Self::Le),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoolOp {
    And,
    Or,
}

impl BoolOp {
    #[must_use]
    pub const fn token(self) -> &'static str {
        match self {
            Self::And => "and",
            Self::Or => "or",
        }
    }

    #[must_use]
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "and" => Some(Self::And),
            "or" => Some(Self::Or),
            _ => None,
        }
    }
}

/// A constant on the right-hand side of a comparison. The editable
/// "no value yet" hole is modeled as `Option<Value>` on [`Comparison`],
/// so `Value` itself is null-free.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Number(f64),
    Str(String),
    List(Vec<Value>),
}

impl Value {
    #[must_use]
    pub fn to_wire(&self) -> JsonValue {
        match self {
            Self::Bool(v) => JsonValue::Bool(*v),
            Self::Number(v) => serde_json::Number::from_f64(*v)
                .map_or(JsonValue::Null, JsonValue::Number),
            Self::Str(v) => JsonValue::String(v.clone()),
            Self::List(items) => JsonValue::Array(items.iter().map(Value::to_wire).collect()),
        }
    }

    pub fn from_wire(value: &JsonValue) -> Result<Self, ExprError> {
        match value {
            JsonValue::Bool(v) => Ok(Self::Bool(*v)),
            JsonValue::Number(n) => n
                .as_f64()
                .map(Self::Number)
                .ok_or_else(|| ExprError::InvalidOperand(n.to_string())),
            JsonValue::String(s) => Ok(Self::Str(s.clone())),
            JsonValue::Array(items) => items
                .iter()
                .map(Value::from_wire)
                .collect::<Result<Vec<_>, _>>()
                .map(Self::List),
            other => Err(ExprError::InvalidOperand(other.to_string())),
        }
    }
}

/// A variable reference on the left-hand side of a comparison: either the
/// `entity_label` pseudo-slice or a dataset slice address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VariableRef {
    EntityLabel,
    /// `slice/{dataset_id}/{entity_label}/{feature_type}`
    Slice {
        dataset_id: String,
        entity_label: String,
        feature_type: String,
    },
    /// `slice/{dataset_id}/` — a dataset chosen, entity pending.
    PartialSlice { dataset_id: String },
}

impl VariableRef {
    #[must_use]
    pub fn slice_id(&self) -> String {
        match self {
            Self::EntityLabel => "entity_label".to_owned(),
            Self::Slice {
                dataset_id,
                entity_label,
                feature_type,
            } => format!("slice/{dataset_id}/{entity_label}/{feature_type}"),
            Self::PartialSlice { dataset_id } => format!("slice/{dataset_id}/"),
        }
    }

    pub fn parse(input: &str) -> Result<Self, ExprError> {
        if input == "entity_label" {
            return Ok(Self::EntityLabel);
        }
        let Some(rest) = input.strip_prefix("slice/") else {
            return Err(ExprError::InvalidSliceId(input.to_owned()));
        };
        let segments: Vec<&str> = rest.split('/').collect();
        match segments.as_slice() {
            [dataset_id, ""] if !dataset_id.is_empty() => Ok(Self::PartialSlice {
                dataset_id: (*dataset_id).to_owned(),
            }),
            [dataset_id, entity_label, feature_type]
                if !dataset_id.is_empty() && !entity_label.is_empty() && !feature_type.is_empty() =>
            {
                Ok(Self::Slice {
                    dataset_id: (*dataset_id).to_owned(),
                    entity_label: (*entity_label).to_owned(),
                    feature_type: (*feature_type).to_owned(),
                })
            }
            _ => Err(ExprError::InvalidSliceId(input.to_owned())),
        }
    }
}

impl fmt::Display for VariableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.slice_id())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub op: CompareOp,
    pub left: Option<VariableRef>,
    pub right: Option<Value>,
}

impl Comparison {
    /// The fresh condition the builder appends: `{"==": [null, null]}`.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            op: CompareOp::Eq,
            left: None,
            right: None,
        }
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.left.is_some() && self.right.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub op: BoolOp,
    pub children: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Comparison(Comparison),
    Group(Group),
    Not(Box<Expr>),
}

impl Expr {
    #[must_use]
    pub fn empty_comparison() -> Self {
        Self::Comparison(Comparison::empty())
    }

    #[must_use]
    pub const fn is_comparison(&self) -> bool {
        matches!(self, Self::Comparison(_))
    }

    #[must_use]
    pub const fn is_group(&self) -> bool {
        matches!(self, Self::Group(_))
    }

    /// A **complete** expression has every comparison fully populated and
    /// every group non-empty with only complete children.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        match self {
            Self::Comparison(cmp) => cmp.is_complete(),
            Self::Group(group) => {
                !group.children.is_empty() && group.children.iter().all(Expr::is_complete)
            }
            Self::Not(inner) => inner.is_complete(),
        }
    }

    /// Wraps this expression in the `{"!": [...]}` negation form.
    #[must_use]
    pub fn negated(&self) -> Self {
        Self::Not(Box::new(self.clone()))
    }

    #[must_use]
    pub fn to_wire(&self) -> JsonValue {
        let (key, operands) = match self {
            Self::Comparison(cmp) => {
                let left = cmp.left.as_ref().map_or(JsonValue::Null, |var| {
                    serde_json::json!({ "var": var.slice_id() })
                });
                let right = cmp.right.as_ref().map_or(JsonValue::Null, Value::to_wire);
                (cmp.op.token(), vec![left, right])
            }
            Self::Group(group) => (
                group.op.token(),
                group.children.iter().map(Expr::to_wire).collect(),
            ),
            Self::Not(inner) => ("!", vec![inner.to_wire()]),
        };
        let mut object = serde_json::Map::new();
        object.insert(key.to_owned(), JsonValue::Array(operands));
        JsonValue::Object(object)
    }

    pub fn from_wire(value: &JsonValue) -> Result<Self, ExprError> {
        let JsonValue::Object(map) = value else {
            return Err(ExprError::UnknownOperator(value.to_string()));
        };
        let mut entries = map.iter();
        let (Some((key, operands)), None) = (entries.next(), entries.next()) else {
            return Err(ExprError::UnknownOperator(value.to_string()));
        };
        let JsonValue::Array(operands) = operands else {
            return Err(ExprError::UnknownOperator(value.to_string()));
        };

        if let Some(op) = BoolOp::from_token(key) {
            let children = operands
                .iter()
                .map(Expr::from_wire)
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Self::Group(Group { op, children }));
        }
        if key == "!" {
            let [inner] = operands.as_slice() else {
                return Err(ExprError::InvalidOperand(format!(
                    "negation takes exactly one operand, found {}",
                    operands.len()
                )));
            };
            return Ok(Self::Not(Box::new(Expr::from_wire(inner)?)));
        }
        if let Some(op) = CompareOp::from_token(key) {
            let [left, right] = operands.as_slice() else {
                return Err(ExprError::InvalidOperand(format!(
                    "comparison takes exactly two operands, found {}",
                    operands.len()
                )));
            };
            let left = parse_variable_operand(left)?;
            let right = match right {
                JsonValue::Null => None,
                other => Some(Value::from_wire(other)?),
            };
            return Ok(Self::Comparison(Comparison { op, left, right }));
        }
        Err(ExprError::UnknownOperator(key.clone()))
    }
}

fn parse_variable_operand(value: &JsonValue) -> Result<Option<VariableRef>, ExprError> {
    match value {
        JsonValue::Null => Ok(None),
        JsonValue::Object(map) => match map.get("var") {
            Some(JsonValue::String(slice_id)) if map.len() == 1 => {
                VariableRef::parse(slice_id).map(Some)
            }
            _ => Err(ExprError::InvalidOperand(value.to_string())),
        },
        other => Err(ExprError::InvalidOperand(other.to_string())),
    }
}

impl Serialize for Expr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_wire().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Expr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = JsonValue::deserialize(deserializer)?;
        Expr::from_wire(&value).map_err(D::Error::custom)
    }
}

/// Wraps a non-group expression in a single-child `and` group. The editor
/// always works on a group root so every edit site has a parent.
#[must_use]
pub fn denormalize(expr: Expr) -> Group {
    match expr {
        Expr::Group(group) => group,
        other => Group {
            op: BoolOp::And,
            children: vec![other],
        },
    }
}

/// Collapses a singleton group down to its sole child; anything else is
/// returned unchanged. For any expression in stored form,
/// `normalize(denormalize(e).into())` is structurally equal to `e`.
#[must_use]
pub fn normalize(expr: Expr) -> Expr {
    match expr {
        Expr::Group(mut group) if group.children.len() == 1 => group
            .children
            .pop()
            .unwrap_or_else(Expr::empty_comparison),
        other => other,
    }
}

impl From<Group> for Expr {
    fn from(group: Group) -> Self {
        Self::Group(group)
    }
}

/// One step of a path into an expression tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStep {
    /// Index into a group's children (or `Child(0)` through a negation).
    Child(usize),
    /// Index into a comparison's operand pair: 0 = left, 1 = right.
    Operand(usize),
}

/// A path addressing a node or operand, walked from the tree root.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExprPath {
    steps: Vec<PathStep>,
}

impl ExprPath {
    #[must_use]
    pub fn root() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn child(mut self, index: usize) -> Self {
        self.steps.push(PathStep::Child(index));
        self
    }

    #[must_use]
    pub fn operand(mut self, index: usize) -> Self {
        self.steps.push(PathStep::Operand(index));
        self
    }

    #[must_use]
    pub fn steps(&self) -> &[PathStep] {
        &self.steps
    }

    /// Splits off the final step; `None` for the root path.
    #[must_use]
    pub fn split_last(&self) -> Option<(Self, PathStep)> {
        let (last, rest) = self.steps.split_last()?;
        Some((
            Self {
                steps: rest.to_vec(),
            },
            *last,
        ))
    }

    /// Drops a trailing operand step, leaving a path to the owning node.
    #[must_use]
    pub fn to_node_path(&self) -> Self {
        match self.split_last() {
            Some((parent, PathStep::Operand(_))) => parent,
            _ => self.clone(),
        }
    }

    /// Parses the mixed wire form of alternating operator keys and indices,
    /// e.g. `["and", 0, "in", 1]`. Operator keys decide whether the index
    /// that follows steps into group children or comparison operands.
    pub fn from_wire(segments: &[JsonValue]) -> Result<Self, ExprError> {
        let mut steps = Vec::new();
        let mut iter = segments.iter();
        while let Some(segment) = iter.next() {
            let JsonValue::String(key) = segment else {
                return Err(ExprError::InvalidPath(segment.to_string()));
            };
            let into_operands = if BoolOp::from_token(key).is_some() || key == "!" {
                false
            } else if CompareOp::from_token(key).is_some() {
                true
            } else {
                return Err(ExprError::UnknownOperator(key.clone()));
            };
            let Some(index) = iter.next() else {
                // A trailing operator key addresses the node itself.
                break;
            };
            let index = index
                .as_u64()
                .ok_or_else(|| ExprError::InvalidPath(index.to_string()))?
                as usize;
            steps.push(if into_operands {
                PathStep::Operand(index)
            } else {
                PathStep::Child(index)
            });
        }
        Ok(Self { steps })
    }
}

impl fmt::Display for ExprPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, step) in self.steps.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            match step {
                PathStep::Child(index) => write!(f, "{index}")?,
                PathStep::Operand(index) => write!(f, "op:{index}")?,
            }
        }
        write!(f, "]")
    }
}

/// Returns the node addressed by `path`. Operand steps do not address
/// nodes and fail with [`ExprError::PathNotFound`].
pub fn node_at<'a>(expr: &'a Expr, path: &ExprPath) -> Result<&'a Expr, ExprError> {
    let mut current = expr;
    for step in path.steps() {
        current = match (current, step) {
            (Expr::Group(group), PathStep::Child(index)) => group
                .children
                .get(*index)
                .ok_or_else(|| ExprError::PathNotFound(path.to_string()))?,
            (Expr::Not(inner), PathStep::Child(0)) => inner,
            _ => return Err(ExprError::PathNotFound(path.to_string())),
        };
    }
    Ok(current)
}

/// Rebuilds the tree with the node at `path` replaced, copying only the
/// spine from the root down to the edit site.
pub fn replace_node(expr: &Expr, path: &ExprPath, replacement: Expr) -> Result<Expr, ExprError> {
    replace_node_steps(expr, path.steps(), replacement)
        .map_err(|()| ExprError::PathNotFound(path.to_string()))
}

fn replace_node_steps(expr: &Expr, steps: &[PathStep], replacement: Expr) -> Result<Expr, ()> {
    let Some((step, rest)) = steps.split_first() else {
        return Ok(replacement);
    };
    match (expr, step) {
        (Expr::Group(group), PathStep::Child(index)) => {
            let child = group.children.get(*index).ok_or(())?;
            let rebuilt = replace_node_steps(child, rest, replacement)?;
            let mut children = group.children.clone();
            children[*index] = rebuilt;
            Ok(Expr::Group(Group {
                op: group.op,
                children,
            }))
        }
        (Expr::Not(inner), PathStep::Child(0)) => Ok(Expr::Not(Box::new(replace_node_steps(
            inner,
            rest,
            replacement,
        )?))),
        _ => Err(()),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        BoolOp, CompareOp, Comparison, Expr, ExprError, ExprPath, Group, Value, VariableRef,
        denormalize, node_at, normalize, replace_node,
    };

    fn label_eq(label: &str) -> Expr {
        Expr::Comparison(Comparison {
            op: CompareOp::Eq,
            left: Some(VariableRef::EntityLabel),
            right: Some(Value::Str(label.to_owned())),
        })
    }

    #[test]
    fn wire_round_trip_preserves_group_structure() {
        let expr = Expr::Group(Group {
            op: BoolOp::Or,
            children: vec![
                label_eq("ACH-1"),
                Expr::Comparison(Comparison {
                    op: CompareOp::In,
                    left: Some(VariableRef::Slice {
                        dataset_id: "expression".to_owned(),
                        entity_label: "SOX10".to_owned(),
                        feature_type: "gene".to_owned(),
                    }),
                    right: Some(Value::List(vec![Value::Number(1.0), Value::Number(2.0)])),
                }),
            ],
        });

        let wire = expr.to_wire();
        let back = Expr::from_wire(&wire).expect("wire parses");
        assert_eq!(back, expr);
    }

    #[test]
    fn wire_round_trip_preserves_negation_wrapper() {
        let expr = label_eq("ACH-1").negated();
        let back = Expr::from_wire(&expr.to_wire()).expect("wire parses");
        assert_eq!(back, expr);
    }

    #[test]
    fn unrecognized_operator_is_a_hard_error() {
        let wire = serde_json::json!({ "xor": [null, null] });
        let err = Expr::from_wire(&wire).expect_err("must fail");
        assert_eq!(err, ExprError::UnknownOperator("xor".to_owned()));
    }

    #[test]
    fn bare_array_is_an_unknown_shape() {
        let wire = serde_json::json!([1, 2, 3]);
        assert!(matches!(
            Expr::from_wire(&wire),
            Err(ExprError::UnknownOperator(_))
        ));
    }

    #[test]
    fn normalize_inverts_denormalize() {
        let comparison = label_eq("ACH-1");
        let wrapped: Expr = denormalize(comparison.clone()).into();
        assert!(wrapped.is_group());
        assert_eq!(normalize(wrapped), comparison);

        let group = Expr::Group(Group {
            op: BoolOp::And,
            children: vec![label_eq("ACH-1"), label_eq("ACH-2")],
        });
        let round = normalize(denormalize(group.clone()).into());
        assert_eq!(round, group);
    }

    #[test]
    fn completeness_requires_both_operands() {
        assert!(!Expr::empty_comparison().is_complete());
        assert!(label_eq("ACH-1").is_complete());
    }

    #[test]
    fn completeness_rejects_empty_groups() {
        let empty = Expr::Group(Group {
            op: BoolOp::And,
            children: Vec::new(),
        });
        assert!(!empty.is_complete());

        let mixed = Expr::Group(Group {
            op: BoolOp::And,
            children: vec![label_eq("ACH-1"), Expr::empty_comparison()],
        });
        assert!(!mixed.is_complete());
    }

    #[test]
    fn slice_id_parse_and_format_round_trip() {
        for variable in [
            VariableRef::EntityLabel,
            VariableRef::Slice {
                dataset_id: "copy_number".to_owned(),
                entity_label: "BRAF".to_owned(),
                feature_type: "gene".to_owned(),
            },
            VariableRef::PartialSlice {
                dataset_id: "copy_number".to_owned(),
            },
        ] {
            let parsed = VariableRef::parse(&variable.slice_id()).expect("parses");
            assert_eq!(parsed, variable);
        }
    }

    #[test]
    fn malformed_slice_id_is_rejected() {
        for bad in ["slice/", "slice//x/y", "gene/BRAF", "slice/a/b/c/d"] {
            assert!(matches!(
                VariableRef::parse(bad),
                Err(ExprError::InvalidSliceId(_))
            ));
        }
    }

    #[test]
    fn wire_path_distinguishes_children_from_operands() {
        let segments = vec![
            serde_json::json!("and"),
            serde_json::json!(0),
            serde_json::json!("in"),
            serde_json::json!(1),
        ];
        let path = ExprPath::from_wire(&segments).expect("path parses");
        assert_eq!(path, ExprPath::root().child(0).operand(1));
    }

    #[test]
    fn wire_path_rejects_unknown_operator_keys() {
        let segments = vec![serde_json::json!("xor"), serde_json::json!(0)];
        assert!(matches!(
            ExprPath::from_wire(&segments),
            Err(ExprError::UnknownOperator(_))
        ));
    }

    #[test]
    fn replace_node_rebuilds_only_the_spine() {
        let root = Expr::Group(Group {
            op: BoolOp::And,
            children: vec![label_eq("ACH-1"), label_eq("ACH-2")],
        });
        let path = ExprPath::root().child(1);
        let next = replace_node(&root, &path, label_eq("ACH-3")).expect("replace");

        assert_eq!(node_at(&next, &path).expect("node"), &label_eq("ACH-3"));
        assert_eq!(
            node_at(&next, &ExprPath::root().child(0)).expect("node"),
            &label_eq("ACH-1")
        );
    }

    #[test]
    fn replace_node_through_negation_wrapper() {
        let root = label_eq("ACH-1").negated();
        let next = replace_node(&root, &ExprPath::root().child(0), label_eq("ACH-2"))
            .expect("replace");
        assert_eq!(next, label_eq("ACH-2").negated());
    }

    #[test]
    fn missing_path_is_a_typed_error_not_a_panic() {
        let root = label_eq("ACH-1");
        let err = node_at(&root, &ExprPath::root().child(3)).expect_err("must fail");
        assert!(matches!(err, ExprError::PathNotFound(_)));
    }

    #[test]
    fn serde_uses_the_operator_keyed_wire_form() {
        let expr = label_eq("ACH-1");
        let json = serde_json::to_string(&expr).expect("serializes");
        assert_eq!(json, r#"{"==":[{"var":"entity_label"},"ACH-1"]}"#);
        let back: Expr = serde_json::from_str(&json).expect("deserializes");
        assert_eq!(back, expr);
    }
}
