//! DynamoDB expression parsing and evaluation.
//!
//! This module implements the five expression kinds a request may carry:
//! condition, filter, key-condition, update and projection. The pipeline is:
//!
//! 1. **Lexing**: Tokenize the expression string into a token stream.
//! 2. **Parsing**: Build an AST from the token stream using recursive descent.
//! 3. **Binding**: Resolve `#name` aliases and check `:value` tokens, then
//!    reject placeholders the request never used.
//! 4. **Evaluation**: Walk the AST to evaluate conditions, apply updates,
//!    project attributes, or split a key condition for the planner.

pub mod ast;
pub mod binder;
pub mod evaluator;
pub mod key_condition;
pub mod parser;
pub mod projection;
pub mod update;

pub use ast::{AttributePath, Expr, Operand, PathElement, UpdateExpr};
pub use binder::{Binder, ExpressionContext, ExpressionInput};
pub use evaluator::EvalContext;
pub use key_condition::{KeyCondition, SortKeyCondition, SortKeyOp, plan_key_condition};
pub use parser::{ExpressionError, ExpressionKind, parse_condition, parse_projection, parse_update};
pub use projection::project_item;
pub use update::apply_update;
