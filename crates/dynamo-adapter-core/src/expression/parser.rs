//! Lexer and recursive-descent parser for item expressions.
//!
//! Supports condition/filter/key-condition expressions, update expressions, and
//! projection expressions. Keywords and function names are matched
//! case-insensitively.

use std::fmt;
use std::iter::Peekable;
use std::str::Chars;

use dynamo_adapter_model::NumberError;

use super::ast::{
    AddAction, AttributePath, CompareOp, DeleteAction, Expr, FunctionName, LogicalOp, Operand,
    PathElement, SetAction, SetValue, UpdateExpr,
};

/// Maximum number of operands on the right of `IN`.
pub const MAX_IN_OPERANDS: usize = 100;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// The request field an expression came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpressionKind {
    /// `ConditionExpression`
    Condition,
    /// `KeyConditionExpression`
    KeyCondition,
    /// `FilterExpression`
    Filter,
    /// `UpdateExpression`
    Update,
    /// `ProjectionExpression`
    Projection,
}

impl fmt::Display for ExpressionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Condition => write!(f, "ConditionExpression"),
            Self::KeyCondition => write!(f, "KeyConditionExpression"),
            Self::Filter => write!(f, "FilterExpression"),
            Self::Update => write!(f, "UpdateExpression"),
            Self::Projection => write!(f, "ProjectionExpression"),
        }
    }
}

/// Errors produced while parsing, binding, or evaluating expressions.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    /// An unexpected token was encountered.
    #[error("Syntax error; token: {found}, expected: {expected}")]
    UnexpectedToken {
        /// What was expected.
        expected: String,
        /// What was found.
        found: String,
    },
    /// The expression ended prematurely.
    #[error("Syntax error; token: <EOF>")]
    UnexpectedEof,
    /// A call to a function the grammar does not know.
    #[error("Invalid function name; function: {name}")]
    UnknownFunction {
        /// The function name as written.
        name: String,
    },
    /// The expression string is empty or blank.
    #[error("The expression can not be empty;")]
    EmptyExpression,
    /// An update clause keyword appears twice.
    #[error("The \"{clause}\" section can only be used once in an update expression;")]
    DuplicateClause {
        /// The repeated clause keyword.
        clause: &'static str,
    },
    /// The key condition does not have a shape the planner accepts.
    #[error("{message}")]
    InvalidKeyCondition {
        /// Explanation.
        message: String,
    },
    /// A `#name` placeholder missing from `ExpressionAttributeNames`.
    #[error(
        "An expression attribute name used in the document path is not defined; attribute name: {name}"
    )]
    UnresolvedAttributeName {
        /// The placeholder, including `#`.
        name: String,
    },
    /// A `:value` placeholder missing from `ExpressionAttributeValues`.
    #[error("An expression attribute value used in expression is not defined; attribute value: {name}")]
    UnresolvedAttributeValue {
        /// The placeholder, including `:`.
        name: String,
    },
    /// Placeholders supplied by the caller but never referenced.
    #[error("Value provided in {field} unused in expressions: keys: {{{keys}}}")]
    UnusedPlaceholders {
        /// `ExpressionAttributeNames` or `ExpressionAttributeValues`.
        field: &'static str,
        /// Comma-separated unused keys, sorted.
        keys: String,
    },
    /// An operand is invalid for the operation that uses it.
    #[error("{message}")]
    InvalidOperand {
        /// Explanation.
        message: String,
    },
    /// An operand has the wrong type for an operator or function.
    #[error("{message}")]
    TypeMismatch {
        /// Explanation.
        message: String,
    },
    /// Two target paths of one expression overlap or conflict.
    #[error("{message}")]
    DuplicatePath {
        /// Explanation.
        message: String,
    },
    /// Number arithmetic or parsing failed.
    #[error(transparent)]
    InvalidNumber(#[from] NumberError),
    /// An error located inside a specific request expression.
    #[error("Invalid {kind}: {source}")]
    Invalid {
        /// Which expression failed.
        kind: ExpressionKind,
        /// The underlying error.
        source: Box<ExpressionError>,
    },
}

impl ExpressionError {
    /// Attribute the error to the expression of `kind`.
    ///
    /// Request-level errors and errors that already name an expression are
    /// returned unchanged.
    #[must_use]
    pub fn within(self, kind: ExpressionKind) -> Self {
        match self {
            Self::Invalid { .. }
            | Self::UnusedPlaceholders { .. }
            | Self::InvalidKeyCondition { .. } => self,
            other => Self::Invalid {
                kind,
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, with any [`ExpressionError::Invalid`] wrapping removed.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Invalid { source, .. } => source.root(),
            other => other,
        }
    }

    pub(crate) fn type_mismatch(function: impl fmt::Display, operand: &str) -> Self {
        Self::TypeMismatch {
            message: format!(
                "Incorrect operand type for operator or function; operator or function: {function}, operand type: {operand}"
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Token type
// ---------------------------------------------------------------------------

/// Lexer token.
#[derive(Debug, Clone, PartialEq)]
enum Token {
    /// A plain identifier (attribute name).
    Identifier(String),
    /// `#name`, including the `#`.
    ExprAttrName(String),
    /// `:value`, including the `:`.
    ExprAttrValue(String),
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    And,
    Or,
    Not,
    Between,
    In,
    Set,
    Remove,
    Add,
    Delete,
    AttributeExists,
    AttributeNotExists,
    AttributeType,
    BeginsWith,
    Contains,
    Size,
    IfNotExists,
    ListAppend,
    /// A non-negative integer (list indexes only).
    Number(usize),
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Identifier(s) | Self::ExprAttrName(s) | Self::ExprAttrValue(s) => {
                write!(f, "{s}")
            }
            Self::Eq => write!(f, "="),
            Self::Ne => write!(f, "<>"),
            Self::Lt => write!(f, "<"),
            Self::Le => write!(f, "<="),
            Self::Gt => write!(f, ">"),
            Self::Ge => write!(f, ">="),
            Self::Plus => write!(f, "+"),
            Self::Minus => write!(f, "-"),
            Self::Dot => write!(f, "."),
            Self::Comma => write!(f, ","),
            Self::LParen => write!(f, "("),
            Self::RParen => write!(f, ")"),
            Self::LBracket => write!(f, "["),
            Self::RBracket => write!(f, "]"),
            Self::And => write!(f, "AND"),
            Self::Or => write!(f, "OR"),
            Self::Not => write!(f, "NOT"),
            Self::Between => write!(f, "BETWEEN"),
            Self::In => write!(f, "IN"),
            Self::Set => write!(f, "SET"),
            Self::Remove => write!(f, "REMOVE"),
            Self::Add => write!(f, "ADD"),
            Self::Delete => write!(f, "DELETE"),
            Self::AttributeExists => write!(f, "attribute_exists"),
            Self::AttributeNotExists => write!(f, "attribute_not_exists"),
            Self::AttributeType => write!(f, "attribute_type"),
            Self::BeginsWith => write!(f, "begins_with"),
            Self::Contains => write!(f, "contains"),
            Self::Size => write!(f, "size"),
            Self::IfNotExists => write!(f, "if_not_exists"),
            Self::ListAppend => write!(f, "list_append"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Eof => write!(f, "<EOF>"),
        }
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

struct Lexer<'a> {
    chars: Peekable<Chars<'a>>,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            chars: input.chars().peekable(),
        }
    }

    fn tokenize(&mut self) -> Result<Vec<Token>, ExpressionError> {
        let mut tokens = Vec::new();
        loop {
            let tok = self.next_token()?;
            if tok == Token::Eof {
                tokens.push(Token::Eof);
                break;
            }
            tokens.push(tok);
        }
        Ok(tokens)
    }

    fn skip_whitespace(&mut self) {
        while self.chars.peek().is_some_and(|c| c.is_whitespace()) {
            self.chars.next();
        }
    }

    fn single(&mut self, tok: Token) -> Token {
        self.chars.next();
        tok
    }

    fn next_token(&mut self) -> Result<Token, ExpressionError> {
        self.skip_whitespace();

        let Some(&ch) = self.chars.peek() else {
            return Ok(Token::Eof);
        };

        match ch {
            '#' => self.read_placeholder('#').map(Token::ExprAttrName),
            ':' => self.read_placeholder(':').map(Token::ExprAttrValue),
            '=' => Ok(self.single(Token::Eq)),
            '<' => Ok(self.read_lt_family()),
            '>' => Ok(self.read_gt_family()),
            '+' => Ok(self.single(Token::Plus)),
            '-' => Ok(self.single(Token::Minus)),
            '.' => Ok(self.single(Token::Dot)),
            ',' => Ok(self.single(Token::Comma)),
            '(' => Ok(self.single(Token::LParen)),
            ')' => Ok(self.single(Token::RParen)),
            '[' => Ok(self.single(Token::LBracket)),
            ']' => Ok(self.single(Token::RBracket)),
            c if c.is_ascii_digit() => self.read_number(),
            c if is_ident_start(c) => Ok(self.read_identifier_or_keyword()),
            _ => Err(ExpressionError::UnexpectedToken {
                expected: "a valid token".to_owned(),
                found: ch.to_string(),
            }),
        }
    }

    fn read_placeholder(&mut self, prefix: char) -> Result<String, ExpressionError> {
        self.chars.next();
        let name = self.read_ident_chars();
        if name.is_empty() {
            return Err(ExpressionError::UnexpectedToken {
                expected: format!("a placeholder name after '{prefix}'"),
                found: prefix.to_string(),
            });
        }
        Ok(format!("{prefix}{name}"))
    }

    fn read_lt_family(&mut self) -> Token {
        self.chars.next();
        if self.chars.peek() == Some(&'=') {
            self.chars.next();
            Token::Le
        } else if self.chars.peek() == Some(&'>') {
            self.chars.next();
            Token::Ne
        } else {
            Token::Lt
        }
    }

    fn read_gt_family(&mut self) -> Token {
        self.chars.next();
        if self.chars.peek() == Some(&'=') {
            self.chars.next();
            Token::Ge
        } else {
            Token::Gt
        }
    }

    fn read_number(&mut self) -> Result<Token, ExpressionError> {
        let mut s = String::new();
        while let Some(&c) = self.chars.peek() {
            if c.is_ascii_digit() {
                s.push(c);
                self.chars.next();
            } else {
                break;
            }
        }
        let n: usize = s.parse().map_err(|_| ExpressionError::InvalidOperand {
            message: format!("List index is out of range: {s}"),
        })?;
        Ok(Token::Number(n))
    }

    fn read_ident_chars(&mut self) -> String {
        let mut s = String::new();
        while let Some(&c) = self.chars.peek() {
            if is_ident_continue(c) {
                s.push(c);
                self.chars.next();
            } else {
                break;
            }
        }
        s
    }

    fn read_identifier_or_keyword(&mut self) -> Token {
        let ident = self.read_ident_chars();
        match ident.to_ascii_lowercase().as_str() {
            "and" => Token::And,
            "or" => Token::Or,
            "not" => Token::Not,
            "between" => Token::Between,
            "in" => Token::In,
            "set" => Token::Set,
            "remove" => Token::Remove,
            "add" => Token::Add,
            "delete" => Token::Delete,
            "attribute_exists" => Token::AttributeExists,
            "attribute_not_exists" => Token::AttributeNotExists,
            "attribute_type" => Token::AttributeType,
            "begins_with" => Token::BeginsWith,
            "contains" => Token::Contains,
            "size" => Token::Size,
            "if_not_exists" => Token::IfNotExists,
            "list_append" => Token::ListAppend,
            _ => Token::Identifier(ident),
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::Eof)
    }

    fn peek_next(&self) -> &Token {
        self.tokens.get(self.pos + 1).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let tok = self.tokens.get(self.pos).cloned().unwrap_or(Token::Eof);
        self.pos += 1;
        tok
    }

    fn expect(&mut self, expected: &Token) -> Result<Token, ExpressionError> {
        let tok = self.advance();
        if std::mem::discriminant(&tok) == std::mem::discriminant(expected) {
            Ok(tok)
        } else {
            Err(unexpected(expected.to_string(), &tok))
        }
    }

    fn at_end(&self) -> bool {
        matches!(self.peek(), Token::Eof)
    }

    fn expect_end(&self) -> Result<(), ExpressionError> {
        if self.at_end() {
            Ok(())
        } else {
            Err(unexpected("end of expression", self.peek()))
        }
    }

    /// Comma-separated list of at least one item.
    fn parse_list<T>(
        &mut self,
        mut item: impl FnMut(&mut Self) -> Result<T, ExpressionError>,
    ) -> Result<Vec<T>, ExpressionError> {
        let mut items = vec![item(self)?];
        while matches!(self.peek(), Token::Comma) {
            self.advance();
            items.push(item(self)?);
        }
        Ok(items)
    }
}

fn unexpected(expected: impl Into<String>, found: &Token) -> ExpressionError {
    if *found == Token::Eof {
        ExpressionError::UnexpectedEof
    } else {
        ExpressionError::UnexpectedToken {
            expected: expected.into(),
            found: found.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Condition expression parsing (precedence climbing)
// ---------------------------------------------------------------------------

impl Parser {
    fn parse_or_expr(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_and_expr()?;
        while matches!(self.peek(), Token::Or) {
            self.advance();
            let right = self.parse_and_expr()?;
            left = Expr::Logical {
                op: LogicalOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and_expr(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_not_expr()?;
        while matches!(self.peek(), Token::And) {
            self.advance();
            let right = self.parse_not_expr()?;
            left = Expr::Logical {
                op: LogicalOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_not_expr(&mut self) -> Result<Expr, ExpressionError> {
        if matches!(self.peek(), Token::Not) {
            self.advance();
            let expr = self.parse_not_expr()?;
            return Ok(Expr::Not(Box::new(expr)));
        }
        self.parse_primary_expr()
    }

    fn parse_primary_expr(&mut self) -> Result<Expr, ExpressionError> {
        if matches!(self.peek(), Token::LParen) {
            self.advance();
            let expr = self.parse_or_expr()?;
            self.expect(&Token::RParen)?;
            return Ok(expr);
        }

        if let Some(func_name) = self.peek_function_name() {
            return self.parse_function_expr(func_name);
        }

        let operand = self.parse_operand()?;
        self.parse_postfix_expr(operand)
    }

    fn peek_function_name(&self) -> Option<FunctionName> {
        match self.peek() {
            Token::AttributeExists => Some(FunctionName::AttributeExists),
            Token::AttributeNotExists => Some(FunctionName::AttributeNotExists),
            Token::AttributeType => Some(FunctionName::AttributeType),
            Token::BeginsWith => Some(FunctionName::BeginsWith),
            Token::Contains => Some(FunctionName::Contains),
            _ => None,
        }
    }

    fn parse_function_expr(&mut self, name: FunctionName) -> Result<Expr, ExpressionError> {
        self.advance();
        self.expect(&Token::LParen)?;
        let args = self.parse_list(Self::parse_operand)?;
        self.expect(&Token::RParen)?;

        if args.len() != name.arity() {
            return Err(ExpressionError::InvalidOperand {
                message: format!(
                    "Incorrect number of operands for operator or function; operator or function: {name}, number of operands: {}",
                    args.len()
                ),
            });
        }
        if !matches!(args[0], Operand::Path(_)) {
            return Err(ExpressionError::InvalidOperand {
                message: format!(
                    "Operator or function requires a document path; operator or function: {name}"
                ),
            });
        }
        if name == FunctionName::AttributeType && !matches!(args[1], Operand::Value(_)) {
            return Err(ExpressionError::InvalidOperand {
                message: format!(
                    "Operator or function requires an expression attribute value; operator or function: {name}"
                ),
            });
        }
        Ok(Expr::Function { name, args })
    }

    fn parse_postfix_expr(&mut self, left: Operand) -> Result<Expr, ExpressionError> {
        match self.peek() {
            Token::Eq | Token::Ne | Token::Lt | Token::Le | Token::Gt | Token::Ge => {
                let op = self.parse_compare_op()?;
                let right = self.parse_operand()?;
                Ok(Expr::Compare {
                    left: Box::new(left),
                    op,
                    right: Box::new(right),
                })
            }
            Token::Between => {
                self.advance();
                let low = self.parse_operand()?;
                self.expect(&Token::And)?;
                let high = self.parse_operand()?;
                Ok(Expr::Between {
                    value: Box::new(left),
                    low: Box::new(low),
                    high: Box::new(high),
                })
            }
            Token::In => {
                self.advance();
                self.expect(&Token::LParen)?;
                let list = self.parse_list(Self::parse_operand)?;
                self.expect(&Token::RParen)?;
                if list.len() > MAX_IN_OPERANDS {
                    return Err(ExpressionError::InvalidOperand {
                        message: format!(
                            "The IN operator is provided with too many operands; number of operands: {}",
                            list.len()
                        ),
                    });
                }
                Ok(Expr::In {
                    value: Box::new(left),
                    list,
                })
            }
            other => Err(unexpected("a comparison operator, BETWEEN, or IN", other)),
        }
    }

    fn parse_compare_op(&mut self) -> Result<CompareOp, ExpressionError> {
        let tok = self.advance();
        match tok {
            Token::Eq => Ok(CompareOp::Eq),
            Token::Ne => Ok(CompareOp::Ne),
            Token::Lt => Ok(CompareOp::Lt),
            Token::Le => Ok(CompareOp::Le),
            Token::Gt => Ok(CompareOp::Gt),
            Token::Ge => Ok(CompareOp::Ge),
            other => Err(unexpected("a comparison operator", &other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Operand & path parsing
// ---------------------------------------------------------------------------

impl Parser {
    fn parse_operand(&mut self) -> Result<Operand, ExpressionError> {
        match self.peek() {
            Token::ExprAttrValue(_) => {
                let Token::ExprAttrValue(name) = self.advance() else {
                    return Err(ExpressionError::UnexpectedEof);
                };
                Ok(Operand::Value(name))
            }
            Token::Size => {
                self.advance();
                self.expect(&Token::LParen)?;
                let path = self.parse_attribute_path()?;
                self.expect(&Token::RParen)?;
                Ok(Operand::Size(path))
            }
            Token::IfNotExists | Token::ListAppend => Err(ExpressionError::UnknownFunction {
                name: self.peek().to_string(),
            }),
            _ => Ok(Operand::Path(self.parse_attribute_path()?)),
        }
    }

    /// Parse an attribute path like `info.rating`, `#name`, `myList[0].value`.
    fn parse_attribute_path(&mut self) -> Result<AttributePath, ExpressionError> {
        if let (Token::Identifier(name), Token::LParen) = (self.peek(), self.peek_next()) {
            return Err(ExpressionError::UnknownFunction { name: name.clone() });
        }

        let mut elements = vec![self.parse_path_head()?];
        loop {
            match self.peek() {
                Token::Dot => {
                    self.advance();
                    elements.push(self.parse_path_head()?);
                }
                Token::LBracket => {
                    self.advance();
                    match self.advance() {
                        Token::Number(idx) => elements.push(PathElement::Index(idx)),
                        other => return Err(unexpected("a list index", &other)),
                    }
                    self.expect(&Token::RBracket)?;
                }
                _ => break,
            }
        }

        Ok(AttributePath { elements })
    }

    fn parse_path_head(&mut self) -> Result<PathElement, ExpressionError> {
        match self.advance() {
            Token::Identifier(name) => Ok(PathElement::Attribute(name)),
            Token::ExprAttrName(name) => Ok(PathElement::Alias(name)),
            other => Err(unexpected("an attribute name or #name", &other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Update expression parsing
// ---------------------------------------------------------------------------

impl Parser {
    fn parse_update_expr(&mut self) -> Result<UpdateExpr, ExpressionError> {
        let mut update = UpdateExpr::default();
        let mut seen: Vec<&'static str> = Vec::new();

        while !self.at_end() {
            let clause = match self.peek() {
                Token::Set => "SET",
                Token::Remove => "REMOVE",
                Token::Add => "ADD",
                Token::Delete => "DELETE",
                other => return Err(unexpected("SET, REMOVE, ADD, or DELETE", other)),
            };
            if seen.contains(&clause) {
                return Err(ExpressionError::DuplicateClause { clause });
            }
            seen.push(clause);
            self.advance();

            match clause {
                "SET" => update.set_actions = self.parse_list(Self::parse_set_action)?,
                "REMOVE" => update.remove_paths = self.parse_list(Self::parse_attribute_path)?,
                "ADD" => update.add_actions = self.parse_list(Self::parse_add_action)?,
                _ => update.delete_actions = self.parse_list(Self::parse_delete_action)?,
            }
        }

        Ok(update)
    }

    fn parse_set_action(&mut self) -> Result<SetAction, ExpressionError> {
        let path = self.parse_attribute_path()?;
        self.expect(&Token::Eq)?;
        let value = self.parse_set_value()?;
        Ok(SetAction { path, value })
    }

    /// Right-hand side of a SET action: a term, optionally followed by a
    /// single `+` or `-` and another term.
    fn parse_set_value(&mut self) -> Result<SetValue, ExpressionError> {
        let first = self.parse_set_term()?;
        match self.peek() {
            Token::Plus => {
                self.advance();
                let second = self.parse_set_term()?;
                Ok(SetValue::Plus(Box::new(first), Box::new(second)))
            }
            Token::Minus => {
                self.advance();
                let second = self.parse_set_term()?;
                Ok(SetValue::Minus(Box::new(first), Box::new(second)))
            }
            _ => Ok(first),
        }
    }

    fn parse_set_term(&mut self) -> Result<SetValue, ExpressionError> {
        match self.peek() {
            Token::IfNotExists => {
                self.advance();
                self.expect(&Token::LParen)?;
                let path = self.parse_attribute_path()?;
                self.expect(&Token::Comma)?;
                let default = self.parse_set_term()?;
                self.expect(&Token::RParen)?;
                Ok(SetValue::IfNotExists(path, Box::new(default)))
            }
            Token::ListAppend => {
                self.advance();
                self.expect(&Token::LParen)?;
                let first = self.parse_set_term()?;
                self.expect(&Token::Comma)?;
                let second = self.parse_set_term()?;
                self.expect(&Token::RParen)?;
                Ok(SetValue::ListAppend(Box::new(first), Box::new(second)))
            }
            Token::AttributeExists
            | Token::AttributeNotExists
            | Token::AttributeType
            | Token::BeginsWith
            | Token::Contains
            | Token::Size => Err(ExpressionError::UnknownFunction {
                name: self.peek().to_string(),
            }),
            _ => Ok(SetValue::Operand(self.parse_operand()?)),
        }
    }

    fn parse_add_action(&mut self) -> Result<AddAction, ExpressionError> {
        let path = self.parse_attribute_path()?;
        let value = self.parse_operand()?;
        Ok(AddAction { path, value })
    }

    fn parse_delete_action(&mut self) -> Result<DeleteAction, ExpressionError> {
        let path = self.parse_attribute_path()?;
        let value = self.parse_operand()?;
        Ok(DeleteAction { path, value })
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

fn tokenize(input: &str) -> Result<Parser, ExpressionError> {
    if input.trim().is_empty() {
        return Err(ExpressionError::EmptyExpression);
    }
    let tokens = Lexer::new(input).tokenize()?;
    Ok(Parser::new(tokens))
}

/// Parse a condition, filter, or key-condition expression.
///
/// # Errors
///
/// Returns `ExpressionError` if the expression is empty or syntactically invalid.
pub fn parse_condition(input: &str) -> Result<Expr, ExpressionError> {
    let mut parser = tokenize(input)?;
    let expr = parser.parse_or_expr()?;
    parser.expect_end()?;
    Ok(expr)
}

/// Parse an update expression (SET / REMOVE / ADD / DELETE).
///
/// # Errors
///
/// Returns `ExpressionError` if the expression is empty or syntactically invalid.
pub fn parse_update(input: &str) -> Result<UpdateExpr, ExpressionError> {
    let mut parser = tokenize(input)?;
    let update = parser.parse_update_expr()?;
    if update.is_empty() {
        return Err(ExpressionError::EmptyExpression);
    }
    Ok(update)
}

/// Parse a projection expression (comma-separated attribute paths).
///
/// # Errors
///
/// Returns `ExpressionError` if the expression is empty or syntactically invalid.
pub fn parse_projection(input: &str) -> Result<Vec<AttributePath>, ExpressionError> {
    let mut parser = tokenize(input)?;
    let paths = parser.parse_list(Parser::parse_attribute_path)?;
    parser.expect_end()?;
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_parse_simple_comparison() {
        let expr = parse_condition("#name = :val").expect("parse comparison");
        match &expr {
            Expr::Compare { left, op, right } => {
                assert!(
                    matches!(left.as_ref(), Operand::Path(p) if p.elements == vec![PathElement::Alias("#name".to_owned())])
                );
                assert_eq!(*op, CompareOp::Eq);
                assert!(matches!(right.as_ref(), Operand::Value(v) if v == ":val"));
            }
            other => panic!("expected Compare, got {other:?}"),
        }
    }

    #[test]
    fn test_should_bind_and_tighter_than_or() {
        let expr = parse_condition("a = :a OR b = :b AND c = :c").expect("parse");
        match &expr {
            Expr::Logical { op, left, right } => {
                assert_eq!(*op, LogicalOp::Or);
                assert!(matches!(left.as_ref(), Expr::Compare { .. }));
                assert!(matches!(
                    right.as_ref(),
                    Expr::Logical {
                        op: LogicalOp::And,
                        ..
                    }
                ));
            }
            other => panic!("expected Logical OR, got {other:?}"),
        }
    }

    #[test]
    fn test_should_parse_not_between_and_in() {
        let expr = parse_condition("NOT (#age BETWEEN :low AND :high) and x in (:a, :b)")
            .expect("parse");
        let Expr::Logical { left, right, .. } = expr else {
            panic!("expected AND");
        };
        assert!(matches!(*left, Expr::Not(ref inner) if matches!(**inner, Expr::Between { .. })));
        assert!(matches!(*right, Expr::In { ref list, .. } if list.len() == 2));
    }

    #[test]
    fn test_should_parse_functions_case_insensitively() {
        let expr = parse_condition("ATTRIBUTE_EXISTS(#name)").expect("parse");
        assert!(matches!(
            expr,
            Expr::Function {
                name: FunctionName::AttributeExists,
                ..
            }
        ));
        let expr = parse_condition("size(tags) > :n").expect("parse");
        assert!(matches!(expr, Expr::Compare { ref left, .. } if matches!(**left, Operand::Size(_))));
    }

    #[test]
    fn test_should_parse_nested_path() {
        let expr = parse_condition("info.ratings[2].#s = :val").expect("parse");
        let Expr::Compare { left, .. } = expr else {
            panic!("expected Compare");
        };
        let Operand::Path(path) = *left else {
            panic!("expected path");
        };
        assert_eq!(
            path.elements,
            vec![
                PathElement::Attribute("info".to_owned()),
                PathElement::Attribute("ratings".to_owned()),
                PathElement::Index(2),
                PathElement::Alias("#s".to_owned()),
            ]
        );
    }

    #[test]
    fn test_should_reject_unknown_function() {
        let err = parse_condition("starts_with(a, :v)").expect_err("unknown function");
        assert!(matches!(err, ExpressionError::UnknownFunction { ref name } if name == "starts_with"));
        let err = parse_condition("if_not_exists(a, :v) = :v").expect_err("update-only function");
        assert!(matches!(err, ExpressionError::UnknownFunction { .. }));
    }

    #[test]
    fn test_should_check_function_arity_and_path_argument() {
        assert!(matches!(
            parse_condition("begins_with(a)"),
            Err(ExpressionError::InvalidOperand { .. })
        ));
        assert!(matches!(
            parse_condition("contains(:v, a)"),
            Err(ExpressionError::InvalidOperand { .. })
        ));
        assert!(matches!(
            parse_condition("attribute_type(a, b)"),
            Err(ExpressionError::InvalidOperand { .. })
        ));
    }

    #[test]
    fn test_should_reject_trailing_tokens_and_truncation() {
        assert!(matches!(
            parse_condition("a = :v b"),
            Err(ExpressionError::UnexpectedToken { .. })
        ));
        assert!(matches!(
            parse_condition("a ="),
            Err(ExpressionError::UnexpectedEof)
        ));
        assert!(matches!(
            parse_condition("a = :v AND"),
            Err(ExpressionError::UnexpectedEof)
        ));
    }

    #[test]
    fn test_should_reject_empty_expressions() {
        assert!(matches!(parse_condition(""), Err(ExpressionError::EmptyExpression)));
        assert!(matches!(parse_update("   "), Err(ExpressionError::EmptyExpression)));
        assert!(matches!(parse_projection("\t"), Err(ExpressionError::EmptyExpression)));
    }

    #[test]
    fn test_should_limit_in_operands() {
        let hundred: Vec<String> = (0..100).map(|i| format!(":v{i}")).collect();
        let ok = format!("a IN ({})", hundred.join(", "));
        assert!(parse_condition(&ok).is_ok());

        let too_many: Vec<String> = (0..101).map(|i| format!(":v{i}")).collect();
        let err = parse_condition(&format!("a IN ({})", too_many.join(", ")))
            .expect_err("too many operands");
        assert!(err.to_string().contains("number of operands: 101"));
    }

    #[test]
    fn test_should_parse_all_update_clauses_in_any_order() {
        let update = parse_update("REMOVE old, list[1] ADD counter :one SET a = :a, b = b + :n DELETE tags :t")
            .expect("parse update");
        assert_eq!(update.set_actions.len(), 2);
        assert_eq!(update.remove_paths.len(), 2);
        assert_eq!(update.add_actions.len(), 1);
        assert_eq!(update.delete_actions.len(), 1);
        assert!(matches!(update.set_actions[1].value, SetValue::Plus(..)));
    }

    #[test]
    fn test_should_parse_set_functions() {
        let update = parse_update(
            "SET views = if_not_exists(views, :zero) + :one, tags = list_append(tags, :new)",
        )
        .expect("parse update");
        let SetValue::Plus(left, _) = &update.set_actions[0].value else {
            panic!("expected Plus");
        };
        assert!(matches!(left.as_ref(), SetValue::IfNotExists(..)));
        assert!(matches!(update.set_actions[1].value, SetValue::ListAppend(..)));
    }

    #[test]
    fn test_should_reject_repeated_update_clause() {
        let err = parse_update("SET a = :a SET b = :b").expect_err("repeated clause");
        assert!(matches!(err, ExpressionError::DuplicateClause { clause: "SET" }));
    }

    #[test]
    fn test_should_parse_projection() {
        let paths = parse_projection("id, name, info.rating, tags[0]").expect("parse projection");
        assert_eq!(paths.len(), 4);
        assert_eq!(paths[2].elements.len(), 2);
        assert_eq!(paths[3].to_string(), "tags[0]");
        assert!(parse_projection("a,").is_err());
    }

    #[test]
    fn test_should_wrap_errors_with_expression_kind() {
        let err = parse_condition("").expect_err("empty");
        let wrapped = err.within(ExpressionKind::KeyCondition);
        assert_eq!(
            wrapped.to_string(),
            "Invalid KeyConditionExpression: The expression can not be empty;"
        );
        assert!(matches!(wrapped.root(), ExpressionError::EmptyExpression));
        let twice = wrapped.within(ExpressionKind::Filter);
        assert!(twice.to_string().starts_with("Invalid KeyConditionExpression"));
    }
}
