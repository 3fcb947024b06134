//! AST types for condition, filter, key-condition, update and projection
//! expressions.
//!
//! The parser produces trees that may still contain `#alias` path elements;
//! the [`binder`](super::binder) replaces them with real attribute names.
//! `:token` operands stay as references and are looked up when evaluated.

use std::fmt;

/// A condition, filter or key-condition expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// `left op right`.
    Compare {
        /// Left operand.
        left: Box<Operand>,
        /// Comparison operator.
        op: CompareOp,
        /// Right operand.
        right: Box<Operand>,
    },
    /// `value BETWEEN low AND high` (inclusive on both ends).
    Between {
        /// Tested operand.
        value: Box<Operand>,
        /// Lower bound.
        low: Box<Operand>,
        /// Upper bound.
        high: Box<Operand>,
    },
    /// `value IN (a, b, ...)`.
    In {
        /// Tested operand.
        value: Box<Operand>,
        /// Candidate operands.
        list: Vec<Operand>,
    },
    /// `left AND right` / `left OR right`.
    Logical {
        /// Logical operator.
        op: LogicalOp,
        /// Left sub-expression.
        left: Box<Expr>,
        /// Right sub-expression.
        right: Box<Expr>,
    },
    /// `NOT expr`.
    Not(Box<Expr>),
    /// A boolean function call such as `attribute_exists(path)`.
    Function {
        /// Function name.
        name: FunctionName,
        /// Arguments, the first of which is always a path.
        args: Vec<Operand>,
    },
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// `=`
    Eq,
    /// `<>`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl CompareOp {
    /// The operator that gives the same result with the operands swapped,
    /// so `:v < sk` can be read as `sk > :v`.
    #[must_use]
    pub fn flipped(self) -> Self {
        match self {
            Self::Eq => Self::Eq,
            Self::Ne => Self::Ne,
            Self::Lt => Self::Gt,
            Self::Le => Self::Ge,
            Self::Gt => Self::Lt,
            Self::Ge => Self::Le,
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eq => write!(f, "="),
            Self::Ne => write!(f, "<>"),
            Self::Lt => write!(f, "<"),
            Self::Le => write!(f, "<="),
            Self::Gt => write!(f, ">"),
            Self::Ge => write!(f, ">="),
        }
    }
}

/// Logical connectives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    /// `AND`
    And,
    /// `OR`
    Or,
}

impl fmt::Display for LogicalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::And => write!(f, "AND"),
            Self::Or => write!(f, "OR"),
        }
    }
}

/// Boolean functions usable as a condition. `size` is an operand, see
/// [`Operand::Size`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionName {
    /// `attribute_exists(path)`
    AttributeExists,
    /// `attribute_not_exists(path)`
    AttributeNotExists,
    /// `attribute_type(path, :type)`
    AttributeType,
    /// `begins_with(path, operand)`
    BeginsWith,
    /// `contains(path, operand)`
    Contains,
}

impl FunctionName {
    /// Number of arguments the function takes.
    #[must_use]
    pub fn arity(self) -> usize {
        match self {
            Self::AttributeExists | Self::AttributeNotExists => 1,
            Self::AttributeType | Self::BeginsWith | Self::Contains => 2,
        }
    }
}

impl fmt::Display for FunctionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AttributeExists => write!(f, "attribute_exists"),
            Self::AttributeNotExists => write!(f, "attribute_not_exists"),
            Self::AttributeType => write!(f, "attribute_type"),
            Self::BeginsWith => write!(f, "begins_with"),
            Self::Contains => write!(f, "contains"),
        }
    }
}

/// An operand inside an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// A document path into the item.
    Path(AttributePath),
    /// A `:token` reference, including the leading colon.
    Value(String),
    /// `size(path)`.
    Size(AttributePath),
}

/// A document path such as `info.rating` or `tags[0].name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttributePath {
    /// Path elements in order; never empty.
    pub elements: Vec<PathElement>,
}

impl AttributePath {
    /// A single-element path naming a top-level attribute.
    #[must_use]
    pub fn attribute(name: impl Into<String>) -> Self {
        Self {
            elements: vec![PathElement::Attribute(name.into())],
        }
    }

    /// Name of the top-level attribute, when the head has been resolved.
    #[must_use]
    pub fn root_name(&self) -> Option<&str> {
        match self.elements.first() {
            Some(PathElement::Attribute(name)) => Some(name),
            _ => None,
        }
    }

    /// Returns `true` for a path with a single attribute element.
    #[must_use]
    pub fn is_top_level(&self) -> bool {
        self.elements.len() == 1
    }
}

impl fmt::Display for AttributePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, elem) in self.elements.iter().enumerate() {
            match elem {
                PathElement::Attribute(name) | PathElement::Alias(name) => {
                    if i > 0 {
                        write!(f, ".{name}")?;
                    } else {
                        write!(f, "{name}")?;
                    }
                }
                PathElement::Index(idx) => write!(f, "[{idx}]")?,
            }
        }
        Ok(())
    }
}

/// One step of a document path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PathElement {
    /// A resolved attribute or map-key name.
    Attribute(String),
    /// An unresolved `#alias`, including the leading `#`.
    Alias(String),
    /// A list index.
    Index(usize),
}

/// A parsed update expression.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateExpr {
    /// `SET` actions in textual order.
    pub set_actions: Vec<SetAction>,
    /// `REMOVE` targets in textual order.
    pub remove_paths: Vec<AttributePath>,
    /// `ADD` actions in textual order.
    pub add_actions: Vec<AddAction>,
    /// `DELETE` actions in textual order.
    pub delete_actions: Vec<DeleteAction>,
}

impl UpdateExpr {
    /// Returns `true` when no clause carries an action.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.set_actions.is_empty()
            && self.remove_paths.is_empty()
            && self.add_actions.is_empty()
            && self.delete_actions.is_empty()
    }

    /// Every path the update writes to, in clause order SET, REMOVE, ADD, DELETE.
    #[must_use]
    pub fn target_paths(&self) -> Vec<&AttributePath> {
        self.set_actions
            .iter()
            .map(|a| &a.path)
            .chain(self.remove_paths.iter())
            .chain(self.add_actions.iter().map(|a| &a.path))
            .chain(self.delete_actions.iter().map(|a| &a.path))
            .collect()
    }
}

/// `path = value`.
#[derive(Debug, Clone, PartialEq)]
pub struct SetAction {
    /// Target path.
    pub path: AttributePath,
    /// Right-hand side.
    pub value: SetValue,
}

/// Right-hand side of a `SET` action.
#[derive(Debug, Clone, PartialEq)]
pub enum SetValue {
    /// A plain operand.
    Operand(Operand),
    /// `a + b`.
    Plus(Box<SetValue>, Box<SetValue>),
    /// `a - b`.
    Minus(Box<SetValue>, Box<SetValue>),
    /// `if_not_exists(path, value)`.
    IfNotExists(AttributePath, Box<SetValue>),
    /// `list_append(a, b)`.
    ListAppend(Box<SetValue>, Box<SetValue>),
}

/// `ADD path :value`.
#[derive(Debug, Clone, PartialEq)]
pub struct AddAction {
    /// Target path.
    pub path: AttributePath,
    /// Number or set to add.
    pub value: Operand,
}

/// `DELETE path :value`.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteAction {
    /// Target path.
    pub path: AttributePath,
    /// Set of elements to remove.
    pub value: Operand,
}
