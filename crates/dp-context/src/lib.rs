#![forbid(unsafe_code)]

//! Contexts: named or anonymous logical expressions selecting a subset of
//! entities of one kind, plus the reducer that edits them and the keyed
//! store that persists them.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use dp_expr::{
    BoolOp, CompareOp, Comparison, Expr, ExprError, ExprPath, Group, Value, VariableRef,
    denormalize, node_at, normalize, replace_node,
};

/// Sibling cap inside a single boolean group.
pub const MAX_GROUP_CONDITIONS: usize = 10;
/// Cap on tokens pasted into a list editor.
pub const MAX_LIST_VALUES: usize = 500;
/// Cap on selected points for context creation or visualization.
pub const MAX_SELECTED_POINTS: usize = 100;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error(transparent)]
    Expr(#[from] ExprError),
    #[error("too many list values: {count} exceeds the {MAX_LIST_VALUES} cap")]
    TooManyListValues { count: usize },
    #[error("too many selected points: {count} exceeds the {MAX_SELECTED_POINTS} cap")]
    TooManySelectedPoints { count: usize },
    #[error("context is not persistable: {0:?}")]
    NotPersistable(ContextValidation),
    #[error("stored context is corrupted: {0}")]
    Corrupted(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A named or anonymous logical expression over entities of one kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub name: String,
    pub context_type: String,
    pub expr: Expr,
}

impl Context {
    /// An empty context for the builder: unnamed, with a single blank
    /// condition wrapped in the editing group.
    #[must_use]
    pub fn empty(context_type: impl Into<String>) -> Self {
        Self {
            name: String::new(),
            context_type: context_type.into(),
            expr: denormalize(Expr::empty_comparison()).into(),
        }
    }

    /// The stored form: singleton editing groups collapsed away.
    #[must_use]
    pub fn normalized(&self) -> Self {
        Self {
            name: self.name.clone(),
            context_type: self.context_type.clone(),
            expr: normalize(self.expr.clone()),
        }
    }

    /// The context selecting everything this one excludes.
    #[must_use]
    pub fn negated(&self) -> Self {
        Self {
            name: self.name.clone(),
            context_type: self.context_type.clone(),
            expr: normalize(self.expr.clone()).negated(),
        }
    }

    #[must_use]
    pub fn validation(&self) -> ContextValidation {
        ContextValidation {
            missing_name: self.name.trim().is_empty(),
            incomplete_expression: !self.expr.is_complete(),
        }
    }
}

/// Blocking validation state the builder surfaces inline; saving is only
/// allowed once both flags clear. This is data, never an exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextValidation {
    pub missing_name: bool,
    pub incomplete_expression: bool,
}

impl ContextValidation {
    #[must_use]
    pub const fn is_persistable(&self) -> bool {
        !self.missing_name && !self.incomplete_expression
    }
}

/// The payload of an `update-value` edit.
#[derive(Debug, Clone, PartialEq)]
pub enum Patch {
    /// Swap a comparison's operator, remapping the right operand shape
    /// when crossing the `in` boundary.
    Operator(CompareOp),
    /// Set or clear the left operand of a comparison.
    Variable(Option<VariableRef>),
    /// Set or clear the right operand of a comparison.
    Constant(Option<Value>),
    /// Replace the addressed subtree wholesale.
    Node(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum BuilderAction {
    UpdateValue { path: ExprPath, value: Patch },
    AddCondition { path: ExprPath },
    DeleteCondition { path: ExprPath },
    ConvertToGroup { path: ExprPath },
}

/// Pure state transition for the context builder. The state is the
/// denormalized expression tree; a new tree is returned, the input is
/// never mutated. Paths the editor cannot produce come back as
/// [`ExprError::PathNotFound`], never a panic.
pub fn reduce(state: &Expr, action: &BuilderAction) -> Result<Expr, ContextError> {
    match action {
        BuilderAction::UpdateValue { path, value } => update_value(state, path, value),
        BuilderAction::AddCondition { path } => add_condition(state, path),
        BuilderAction::DeleteCondition { path } => delete_condition(state, path),
        BuilderAction::ConvertToGroup { path } => convert_to_group(state, path),
    }
}

fn update_value(state: &Expr, path: &ExprPath, value: &Patch) -> Result<Expr, ContextError> {
    // Whole-subtree replacement may target a group, so it short-circuits
    // before the comparison lookup below.
    if let Patch::Node(replacement) = value {
        return Ok(replace_node(state, path, replacement.clone())?);
    }
    let node_path = path.to_node_path();
    let Expr::Comparison(current) = node_at(state, &node_path)? else {
        return Err(ExprError::NodeShape {
            expected: "comparison",
            path: node_path.to_string(),
        }
        .into());
    };
    let patched = match value {
        Patch::Operator(op) => swap_operator(current, *op),
        Patch::Variable(variable) => Comparison {
            op: current.op,
            left: variable.clone(),
            right: current.right.clone(),
        },
        Patch::Constant(constant) => Comparison {
            op: current.op,
            left: current.left.clone(),
            right: constant.clone(),
        },
        Patch::Node(replacement) => return Ok(replace_node(state, path, replacement.clone())?),
    };
    Ok(replace_node(state, &node_path, Expr::Comparison(patched))?)
}

/// Operator swaps remap the right operand: switching to `in` wraps an
/// existing constant in a one-element list; switching away unwraps to the
/// first element, or clears the operand if the list was empty.
fn swap_operator(current: &Comparison, op: CompareOp) -> Comparison {
    let right = match (current.op, op, current.right.clone()) {
        (CompareOp::In, CompareOp::In, right) => right,
        (_, CompareOp::In, Some(value)) => Some(Value::List(vec![value])),
        (CompareOp::In, _, Some(Value::List(items))) => items.into_iter().next(),
        (_, _, right) => right,
    };
    Comparison {
        op,
        left: current.left.clone(),
        right,
    }
}

fn add_condition(state: &Expr, path: &ExprPath) -> Result<Expr, ContextError> {
    let Expr::Group(group) = node_at(state, path)? else {
        return Err(ExprError::NodeShape {
            expected: "group",
            path: path.to_string(),
        }
        .into());
    };
    // Re-validate the sibling cap even though the UI disables the control.
    if group.children.len() >= MAX_GROUP_CONDITIONS {
        return Ok(state.clone());
    }
    let mut children = group.children.clone();
    children.push(Expr::empty_comparison());
    Ok(replace_node(
        state,
        path,
        Expr::Group(Group {
            op: group.op,
            children,
        }),
    )?)
}

fn delete_condition(state: &Expr, path: &ExprPath) -> Result<Expr, ContextError> {
    let Some((parent_path, dp_expr::PathStep::Child(index))) = path.split_last() else {
        return Err(ExprError::PathNotFound(path.to_string()).into());
    };
    let Expr::Group(group) = node_at(state, &parent_path)? else {
        return Err(ExprError::NodeShape {
            expected: "group",
            path: parent_path.to_string(),
        }
        .into());
    };
    if index >= group.children.len() {
        return Err(ExprError::PathNotFound(path.to_string()).into());
    }
    let mut children = group.children.clone();
    children.remove(index);
    // An emptied group is left in place; the caller prunes or collapses.
    Ok(replace_node(
        state,
        &parent_path,
        Expr::Group(Group {
            op: group.op,
            children,
        }),
    )?)
}

fn convert_to_group(state: &Expr, path: &ExprPath) -> Result<Expr, ContextError> {
    let node = node_at(state, path)?;
    let Expr::Comparison(_) = node else {
        return Err(ExprError::NodeShape {
            expected: "comparison",
            path: path.to_string(),
        }
        .into());
    };
    let group = Expr::Group(Group {
        op: BoolOp::And,
        children: vec![node.clone(), Expr::empty_comparison()],
    });
    Ok(replace_node(state, path, group)?)
}

/// Tokenizes pasted list input: comma/newline separated, trimmed,
/// de-duplicated preserving first occurrence. Over-cap input is refused
/// outright so existing selections stay untouched.
pub fn parse_value_list(input: &str) -> Result<Vec<String>, ContextError> {
    let tokens: Vec<&str> = input
        .split(|c: char| c == ',' || c == '\n' || c == '\r')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .collect();
    if tokens.len() > MAX_LIST_VALUES {
        return Err(ContextError::TooManyListValues {
            count: tokens.len(),
        });
    }
    let mut seen = BTreeSet::new();
    Ok(tokens
        .into_iter()
        .filter(|token| seen.insert(token.to_owned()))
        .map(str::to_owned)
        .collect())
}

/// Builds the anonymous context selecting exactly the given entities,
/// as produced by a point selection on a plot. Selections over the point
/// cap are refused outright, existing state untouched.
pub fn context_from_selection(
    context_type: impl Into<String>,
    labels: &[String],
) -> Result<Context, ContextError> {
    if labels.len() > MAX_SELECTED_POINTS {
        return Err(ContextError::TooManySelectedPoints {
            count: labels.len(),
        });
    }
    Ok(Context {
        name: String::new(),
        context_type: context_type.into(),
        expr: Expr::Comparison(Comparison {
            op: CompareOp::In,
            left: Some(VariableRef::EntityLabel),
            right: Some(Value::List(
                labels.iter().cloned().map(Value::Str).collect(),
            )),
        }),
    })
}

/// Content hash of the normalized expression: SHA-256 over the canonical
/// wire JSON, hex-formatted. Structurally equal expressions hash equal.
pub fn content_hash(expr: &Expr) -> String {
    let canonical = normalize(expr.clone()).to_wire().to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("storage backend lock poisoned")]
    LockPoisoned,
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// The seam to whatever keyed store the host environment provides
/// (browser local storage, a file, an in-memory map in tests).
pub trait StorageBackend {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
    fn keys(&self) -> Result<Vec<String>, StorageError>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    entries: Arc<Mutex<BTreeMap<String, String>>>,
}

impl InMemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for InMemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let guard = self.entries.lock().map_err(|_| StorageError::LockPoisoned)?;
        Ok(guard.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut guard = self.entries.lock().map_err(|_| StorageError::LockPoisoned)?;
        guard.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut guard = self.entries.lock().map_err(|_| StorageError::LockPoisoned)?;
        guard.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        let guard = self.entries.lock().map_err(|_| StorageError::LockPoisoned)?;
        Ok(guard.keys().cloned().collect())
    }
}

const NAMED_NAMESPACE: &str = "depict.contexts";
const ANONYMOUS_NAMESPACE: &str = "depict.contexts.anon";
const FEEDBACK_BANNER_KEY: &str = "depict.feedback_banner_dismissed";

/// Notification emitted when an existing context is re-saved with a
/// different expression, so every plot slot pointing at the old version
/// can be rewritten in place.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextEdit {
    pub previous: Context,
    pub current: Context,
}

/// Two storage lanes over one backend: durable named contexts keyed by
/// `(context_type, name)` and ephemeral anonymous contexts keyed by the
/// content hash of their normalized expression.
pub struct ContextStore {
    backend: Arc<dyn StorageBackend>,
}

impl ContextStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    fn named_key(context_type: &str, name: &str) -> String {
        format!("{NAMED_NAMESPACE}:{context_type}:{name}")
    }

    fn anonymous_key(hash: &str) -> String {
        format!("{ANONYMOUS_NAMESPACE}:{hash}")
    }

    /// Saves a named context, overwriting any prior context of the same
    /// name and type. The expression is stored normalized.
    pub fn save_named(&self, context: &Context) -> Result<(), ContextError> {
        let validation = context.validation();
        if !validation.is_persistable() {
            return Err(ContextError::NotPersistable(validation));
        }
        let stored = context.normalized();
        let json = serde_json::to_string(&stored)
            .map_err(|err| ContextError::Corrupted(err.to_string()))?;
        self.backend
            .set(&Self::named_key(&stored.context_type, &stored.name), &json)?;
        Ok(())
    }

    pub fn load_named(
        &self,
        context_type: &str,
        name: &str,
    ) -> Result<Option<Context>, ContextError> {
        self.load(&Self::named_key(context_type, name))
    }

    pub fn delete_named(&self, context_type: &str, name: &str) -> Result<(), ContextError> {
        self.backend.remove(&Self::named_key(context_type, name))?;
        Ok(())
    }

    /// Names of all stored contexts of one entity kind.
    pub fn list_named(&self, context_type: &str) -> Result<Vec<String>, ContextError> {
        let prefix = format!("{NAMED_NAMESPACE}:{context_type}:");
        Ok(self
            .backend
            .keys()?
            .into_iter()
            .filter_map(|key| key.strip_prefix(&prefix).map(str::to_owned))
            .collect())
    }

    /// Saves an unnamed context under its content hash and returns the
    /// hash, so a plot can reference it and a later edit of the same
    /// expression recomputes the identical address.
    pub fn save_anonymous(&self, context: &Context) -> Result<String, ContextError> {
        if !context.expr.is_complete() {
            return Err(ContextError::NotPersistable(ContextValidation {
                missing_name: false,
                incomplete_expression: true,
            }));
        }
        let stored = context.normalized();
        let hash = content_hash(&stored.expr);
        let json = serde_json::to_string(&stored)
            .map_err(|err| ContextError::Corrupted(err.to_string()))?;
        self.backend.set(&Self::anonymous_key(&hash), &json)?;
        Ok(hash)
    }

    pub fn load_anonymous(&self, hash: &str) -> Result<Option<Context>, ContextError> {
        self.load(&Self::anonymous_key(hash))
    }

    /// Persists an edited context in whichever lane it belongs to and
    /// returns the notification the plot layer consumes.
    pub fn save_edited(
        &self,
        previous: &Context,
        current: Context,
    ) -> Result<ContextEdit, ContextError> {
        if current.name.trim().is_empty() {
            self.save_anonymous(&current)?;
        } else {
            self.save_named(&current)?;
        }
        Ok(ContextEdit {
            previous: previous.normalized(),
            current: current.normalized(),
        })
    }

    fn load(&self, key: &str) -> Result<Option<Context>, ContextError> {
        let Some(json) = self.backend.get(key)? else {
            return Ok(None);
        };
        // A context that no longer parses — e.g. an unknown operator — is
        // a data-integrity fault, not a missing entry.
        let context: Context =
            serde_json::from_str(&json).map_err(|err| ContextError::Corrupted(err.to_string()))?;
        Ok(Some(context))
    }

    pub fn is_feedback_banner_dismissed(&self) -> Result<bool, ContextError> {
        Ok(self.backend.get(FEEDBACK_BANNER_KEY)?.as_deref() == Some("true"))
    }

    pub fn dismiss_feedback_banner(&self) -> Result<(), ContextError> {
        self.backend.set(FEEDBACK_BANNER_KEY, "true")?;
        Ok(())
    }
}
