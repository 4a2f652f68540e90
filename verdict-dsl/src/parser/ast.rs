//! Abstract Syntax Tree types

use serde::{Deserialize, Serialize};
use verdict_core::{CombiningAlgorithm, SourceLocation};

/// The root AST node for one policy document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaplDocument {
    pub imports: Vec<Import>,
    pub body: DocumentBody,
}

impl SaplDocument {
    /// The name declared in the document body.
    pub fn name(&self) -> &str {
        match &self.body {
            DocumentBody::Policy(p) => &p.name,
            DocumentBody::PolicySet(s) => &s.name,
        }
    }
}

/// An import mapping a short name to a fully qualified one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Import {
    pub target: String,
    pub alias: Option<String>,
    pub location: SourceLocation,
}

/// A document is either a single policy or a policy set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DocumentBody {
    Policy(PolicyAst),
    PolicySet(PolicySetAst),
}

/// A policy set: named, with a combining algorithm, an optional target,
/// document-level variables, and member policies in source order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySetAst {
    pub name: String,
    pub algorithm: CombiningAlgorithm,
    pub target: Option<Expr>,
    pub variables: Vec<VariableDeclaration>,
    pub policies: Vec<PolicyAst>,
}

/// A single policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyAst {
    pub name: String,
    pub entitlement: Entitlement,
    pub target: Option<Expr>,
    pub body: Vec<Statement>,
    pub obligations: Vec<Expr>,
    pub advice: Vec<Expr>,
    pub transform: Option<Expr>,
}

/// What a matching, satisfied policy grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Entitlement {
    Permit,
    Deny,
}

/// A document-level `var` declaration inside a `set`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDeclaration {
    pub name: String,
    pub value: Expr,
    pub location: SourceLocation,
}

/// One statement in a `where` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    /// Policy-local binding, cleared between policies.
    VarAssignment {
        name: String,
        value: Expr,
        location: SourceLocation,
    },
    /// A boolean condition; all conditions must hold.
    Condition(Expr),
}

/// An expression with its source location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expr {
    pub kind: ExprKind,
    pub location: SourceLocation,
}

/// The expression algebra.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExprKind {
    Null,
    Undefined,
    Bool(bool),
    /// Number literal, kept as source text for lossless decimal parsing.
    Number(String),
    Text(String),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    /// Variable or subscription component reference.
    Identifier(String),
    /// The current element (`@`) inside a subtemplate.
    RelativeNode,
    UnaryOp {
        op: UnaryOperator,
        operand: Box<Expr>,
    },
    BinaryOp {
        op: BinaryOperator,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// Member access: `base.key`.
    KeyStep {
        base: Box<Expr>,
        key: String,
    },
    /// Index access: `base[expr]`.
    IndexStep {
        base: Box<Expr>,
        index: Box<Expr>,
    },
    /// Call of a (possibly imported) side-effect-free function.
    FunctionCall {
        name: String,
        args: Vec<Expr>,
    },
    /// Attribute finder: `entity.<fqn(args)>` or `<fqn(args)>` for
    /// environment attributes.
    AttributeFinder {
        entity: Option<Box<Expr>>,
        name: String,
        args: Vec<Expr>,
    },
    /// Subtemplate application: `base :: template`, binding `@`.
    SubTemplate {
        base: Box<Expr>,
        template: Box<Expr>,
    },
}

/// Binary operators, eager unless noted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOperator {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    In,
    Regex,
    /// Lazy conjunction.
    And,
    /// Lazy disjunction.
    Or,
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOperator {
    Not,
    Neg,
    Plus,
}
