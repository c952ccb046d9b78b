//! Update expressions.
//!
//! An update expression describes the new record in terms of the old one, e.g.
//!
//! ```rust
//! use sql_bulk_ops::batch::expr::Expr;
//!
//! // old => new Item { Description = old.Description + " suffix", Quantity = old.Quantity * 2 }
//! let expr = Expr::member_init([
//!     ("Description", Expr::concat(Expr::member("Description"), Expr::constant(" suffix"))),
//!     ("Quantity", Expr::multiply(Expr::member("Quantity"), Expr::constant(2i32))),
//! ]);
//! ```
//!
//! [`Expr::Eval`] is the escape hatch for values computed on the client
//! (captured locals, method calls that do not touch the old record). It is
//! invoked exactly once while the statement is synthesized and its result is
//! bound as a parameter, so the closure must be pure.

use std::fmt;
use std::sync::Arc;

use crate::core::value::SqlValue;

/// Binary operators accepted in update expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    /// Bitwise and.
    And,
    /// Bitwise or.
    Or,
    ExclusiveOr,
}

/// Method a binary node was built from, when it is not plain arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryMethod {
    /// String concatenation shaped as an addition.
    StringConcat,
}

/// `left <op> right`.
#[derive(Debug, Clone)]
pub struct BinaryExpr {
    pub op: BinaryOp,
    pub left: Box<Expr>,
    pub right: Box<Expr>,
    pub method: Option<BinaryMethod>,
}

impl BinaryExpr {
    /// Whether this is an addition node that actually concatenates strings.
    pub fn is_string_concat(&self) -> bool {
        self.op == BinaryOp::Add && self.method == Some(BinaryMethod::StringConcat)
    }
}

/// One `Member = value` assignment of a member-init node.
#[derive(Debug, Clone)]
pub struct Binding {
    pub member: String,
    pub value: Expr,
}

/// Client-side value producer, see the module docs.
#[derive(Clone)]
pub struct Evaluator(Arc<dyn Fn() -> SqlValue<'static> + Send + Sync>);

impl Evaluator {
    pub fn evaluate(&self) -> SqlValue<'static> {
        (self.0)()
    }
}

impl fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Evaluator(..)")
    }
}

/// Update expression tree.
#[derive(Debug, Clone)]
pub enum Expr {
    /// `new T { A = .., B = .. }`, the root of an update expression.
    MemberInit(Vec<Binding>),
    /// Property of the old record.
    Member(String),
    Constant(SqlValue<'static>),
    /// Type conversion, transparent in SQL.
    Convert(Box<Expr>),
    /// Logical not, rendered as bitwise complement.
    Not(Box<Expr>),
    Binary(BinaryExpr),
    Eval(Evaluator),
}

impl Expr {
    pub fn member_init<I, S>(bindings: I) -> Self
    where
        I: IntoIterator<Item = (S, Expr)>,
        S: Into<String>,
    {
        Expr::MemberInit(
            bindings
                .into_iter()
                .map(|(member, value)| Binding {
                    member: member.into(),
                    value,
                })
                .collect(),
        )
    }

    pub fn member(name: impl Into<String>) -> Self {
        Expr::Member(name.into())
    }

    pub fn constant(value: impl Into<SqlValue<'static>>) -> Self {
        Expr::Constant(value.into())
    }

    pub fn convert(operand: Expr) -> Self {
        Expr::Convert(Box::new(operand))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(operand: Expr) -> Self {
        Expr::Not(Box::new(operand))
    }

    pub fn eval<F>(f: F) -> Self
    where
        F: Fn() -> SqlValue<'static> + Send + Sync + 'static,
    {
        Expr::Eval(Evaluator(Arc::new(f)))
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::Binary(BinaryExpr {
            op,
            left: Box::new(left),
            right: Box::new(right),
            method: None,
        })
    }

    /// Numeric addition.
    #[allow(clippy::should_implement_trait)]
    pub fn add(left: Expr, right: Expr) -> Self {
        Self::binary(BinaryOp::Add, left, right)
    }

    /// String concatenation (an addition node carrying the concat method).
    pub fn concat(left: Expr, right: Expr) -> Self {
        Expr::Binary(BinaryExpr {
            op: BinaryOp::Add,
            left: Box::new(left),
            right: Box::new(right),
            method: Some(BinaryMethod::StringConcat),
        })
    }

    pub fn subtract(left: Expr, right: Expr) -> Self {
        Self::binary(BinaryOp::Subtract, left, right)
    }

    pub fn multiply(left: Expr, right: Expr) -> Self {
        Self::binary(BinaryOp::Multiply, left, right)
    }

    pub fn divide(left: Expr, right: Expr) -> Self {
        Self::binary(BinaryOp::Divide, left, right)
    }

    pub fn bit_and(left: Expr, right: Expr) -> Self {
        Self::binary(BinaryOp::And, left, right)
    }

    pub fn bit_or(left: Expr, right: Expr) -> Self {
        Self::binary(BinaryOp::Or, left, right)
    }

    pub fn bit_xor(left: Expr, right: Expr) -> Self {
        Self::binary(BinaryOp::ExclusiveOr, left, right)
    }
}
