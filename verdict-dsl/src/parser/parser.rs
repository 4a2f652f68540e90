//! Parser implementation

use thiserror::Error;
use verdict_core::{CombiningAlgorithm, SourceLocation};

use super::ast::*;
use crate::lexer::{Lexer, Token, TokenKind};

/// A syntax error with the location of the offending token.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{message}")]
pub struct ParseError {
    pub message: String,
    pub location: SourceLocation,
}

/// Parse a policy document from source text.
pub fn parse(source: &str) -> Result<SaplDocument, ParseError> {
    parse_with_file(None, source)
}

/// Parse a policy document, recording the given file name in locations.
pub fn parse_with_file(file: Option<&str>, source: &str) -> Result<SaplDocument, ParseError> {
    let tokens = Lexer::new(source).tokenize();
    Parser::new(file, source, tokens).parse_document()
}

struct Parser<'a> {
    file: Option<&'a str>,
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(file: Option<&'a str>, source: &'a str, tokens: Vec<Token>) -> Self {
        Self {
            file,
            source,
            tokens,
            pos: 0,
        }
    }

    // ------------------------------------------------------------------
    // Document structure
    // ------------------------------------------------------------------

    fn parse_document(&mut self) -> Result<SaplDocument, ParseError> {
        let mut imports = Vec::new();
        while self.check(&TokenKind::Import) {
            imports.push(self.parse_import()?);
        }

        let body = match &self.current().kind {
            TokenKind::Policy => DocumentBody::Policy(self.parse_policy()?),
            TokenKind::Set => DocumentBody::PolicySet(self.parse_set()?),
            _ => return Err(self.error("Expected 'policy' or 'set'")),
        };

        if self.current().kind != TokenKind::Eof {
            return Err(self.error("Expected end of document"));
        }

        Ok(SaplDocument { imports, body })
    }

    fn parse_import(&mut self) -> Result<Import, ParseError> {
        let start = self.current().span.start;
        self.expect(TokenKind::Import)?;
        let target = self.parse_qualified_name()?;
        let alias = if self.check(&TokenKind::As) {
            self.advance();
            Some(self.expect_identifier()?)
        } else {
            None
        };
        Ok(Import {
            target,
            alias,
            location: self.make_location(start),
        })
    }

    fn parse_set(&mut self) -> Result<PolicySetAst, ParseError> {
        self.expect(TokenKind::Set)?;
        let name = self.expect_string()?;
        let algorithm = self.parse_algorithm()?;

        let target = if self.check(&TokenKind::For) {
            self.advance();
            Some(self.parse_expression()?)
        } else {
            None
        };

        let mut variables = Vec::new();
        while self.check(&TokenKind::Var) {
            let start = self.current().span.start;
            self.advance();
            let name = self.expect_identifier()?;
            self.expect(TokenKind::Assign)?;
            let value = self.parse_expression()?;
            self.expect(TokenKind::Semicolon)?;
            variables.push(VariableDeclaration {
                name,
                value,
                location: self.make_location(start),
            });
        }

        let mut policies = Vec::new();
        while self.check(&TokenKind::Policy) {
            policies.push(self.parse_policy()?);
        }
        if policies.is_empty() {
            return Err(self.error("Expected at least one policy in set"));
        }

        Ok(PolicySetAst {
            name,
            algorithm,
            target,
            variables,
            policies,
        })
    }

    /// Parse a hyphenated combining algorithm name. `deny` and `permit` are
    /// keywords, so the segments are reassembled token by token.
    fn parse_algorithm(&mut self) -> Result<CombiningAlgorithm, ParseError> {
        let mut name = self.algorithm_segment()?;
        while self.check(&TokenKind::Minus) {
            self.advance();
            name.push('-');
            name.push_str(&self.algorithm_segment()?);
        }
        name.parse()
            .map_err(|_| self.error(&format!("Unknown combining algorithm: {name}")))
    }

    fn algorithm_segment(&mut self) -> Result<String, ParseError> {
        match &self.current().kind {
            TokenKind::Deny => {
                self.advance();
                Ok("deny".to_string())
            }
            TokenKind::Permit => {
                self.advance();
                Ok("permit".to_string())
            }
            TokenKind::Identifier(s) => {
                let s = s.clone();
                self.advance();
                Ok(s)
            }
            _ => Err(self.error("Expected combining algorithm")),
        }
    }

    fn parse_policy(&mut self) -> Result<PolicyAst, ParseError> {
        self.expect(TokenKind::Policy)?;
        let name = self.expect_string()?;

        let entitlement = match &self.current().kind {
            TokenKind::Permit => {
                self.advance();
                Entitlement::Permit
            }
            TokenKind::Deny => {
                self.advance();
                Entitlement::Deny
            }
            _ => return Err(self.error("Expected 'permit' or 'deny'")),
        };

        let target = if self.starts_expression() {
            Some(self.parse_expression()?)
        } else {
            None
        };

        let mut body = Vec::new();
        if self.check(&TokenKind::Where) {
            self.advance();
            loop {
                body.push(self.parse_statement()?);
                self.expect(TokenKind::Semicolon)?;
                if !self.starts_statement() {
                    break;
                }
            }
        }

        let mut obligations = Vec::new();
        while self.check(&TokenKind::Obligation) {
            self.advance();
            obligations.push(self.parse_expression()?);
        }

        let mut advice = Vec::new();
        while self.check(&TokenKind::Advice) {
            self.advance();
            advice.push(self.parse_expression()?);
        }

        let transform = if self.check(&TokenKind::Transform) {
            self.advance();
            Some(self.parse_expression()?)
        } else {
            None
        };

        Ok(PolicyAst {
            name,
            entitlement,
            target,
            body,
            obligations,
            advice,
            transform,
        })
    }

    fn parse_statement(&mut self) -> Result<Statement, ParseError> {
        if self.check(&TokenKind::Var) {
            let start = self.current().span.start;
            self.advance();
            let name = self.expect_identifier()?;
            self.expect(TokenKind::Assign)?;
            let value = self.parse_expression()?;
            return Ok(Statement::VarAssignment {
                name,
                value,
                location: self.make_location(start),
            });
        }
        Ok(Statement::Condition(self.parse_expression()?))
    }

    fn starts_statement(&self) -> bool {
        self.check(&TokenKind::Var) || self.starts_expression()
    }

    fn starts_expression(&self) -> bool {
        matches!(
            self.current().kind,
            TokenKind::True
                | TokenKind::False
                | TokenKind::Null
                | TokenKind::Undefined
                | TokenKind::Number(_)
                | TokenKind::String(_)
                | TokenKind::Identifier(_)
                | TokenKind::At
                | TokenKind::LBracket
                | TokenKind::LBrace
                | TokenKind::LParen
                | TokenKind::Lt
                | TokenKind::Not
                | TokenKind::Minus
                | TokenKind::Plus
        )
    }

    // ------------------------------------------------------------------
    // Expressions, lowest precedence first
    // ------------------------------------------------------------------

    fn parse_expression(&mut self) -> Result<Expr, ParseError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let start = self.current().span.start;
        let mut lhs = self.parse_and()?;
        while self.check(&TokenKind::OrOr) {
            self.advance();
            let rhs = self.parse_and()?;
            lhs = self.binary(BinaryOperator::Or, lhs, rhs, start);
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let start = self.current().span.start;
        let mut lhs = self.parse_equality()?;
        while self.check(&TokenKind::AndAnd) {
            self.advance();
            let rhs = self.parse_equality()?;
            lhs = self.binary(BinaryOperator::And, lhs, rhs, start);
        }
        Ok(lhs)
    }

    fn parse_equality(&mut self) -> Result<Expr, ParseError> {
        let start = self.current().span.start;
        let mut lhs = self.parse_comparison()?;
        loop {
            let op = match &self.current().kind {
                TokenKind::EqEq => BinaryOperator::Eq,
                TokenKind::Ne => BinaryOperator::Ne,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_comparison()?;
            lhs = self.binary(op, lhs, rhs, start);
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let start = self.current().span.start;
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match &self.current().kind {
                TokenKind::Lt => BinaryOperator::Lt,
                TokenKind::Le => BinaryOperator::Le,
                TokenKind::Gt => BinaryOperator::Gt,
                TokenKind::Ge => BinaryOperator::Ge,
                TokenKind::In => BinaryOperator::In,
                TokenKind::RegexMatch => BinaryOperator::Regex,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_additive()?;
            lhs = self.binary(op, lhs, rhs, start);
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr, ParseError> {
        let start = self.current().span.start;
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match &self.current().kind {
                TokenKind::Plus => BinaryOperator::Add,
                TokenKind::Minus => BinaryOperator::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_multiplicative()?;
            lhs = self.binary(op, lhs, rhs, start);
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ParseError> {
        let start = self.current().span.start;
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match &self.current().kind {
                TokenKind::Star => BinaryOperator::Mul,
                TokenKind::Slash => BinaryOperator::Div,
                TokenKind::Percent => BinaryOperator::Mod,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = self.binary(op, lhs, rhs, start);
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        let start = self.current().span.start;
        let op = match &self.current().kind {
            TokenKind::Not => Some(UnaryOperator::Not),
            TokenKind::Minus => Some(UnaryOperator::Neg),
            TokenKind::Plus => Some(UnaryOperator::Plus),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let operand = self.parse_unary()?;
            return Ok(Expr {
                kind: ExprKind::UnaryOp {
                    op,
                    operand: Box::new(operand),
                },
                location: self.make_location(start),
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let start = self.current().span.start;
        let mut expr = self.parse_primary()?;
        loop {
            match &self.current().kind {
                TokenKind::Dot => match self.peek_kind(1) {
                    TokenKind::Lt => {
                        self.advance(); // .
                        self.advance(); // <
                        let name = self.parse_qualified_name()?;
                        let args = if self.check(&TokenKind::LParen) {
                            self.parse_call_args()?
                        } else {
                            Vec::new()
                        };
                        self.expect(TokenKind::Gt)?;
                        expr = Expr {
                            kind: ExprKind::AttributeFinder {
                                entity: Some(Box::new(expr)),
                                name,
                                args,
                            },
                            location: self.make_location(start),
                        };
                    }
                    TokenKind::Identifier(_) => {
                        self.advance(); // .
                        let key = self.expect_identifier()?;
                        expr = Expr {
                            kind: ExprKind::KeyStep {
                                base: Box::new(expr),
                                key,
                            },
                            location: self.make_location(start),
                        };
                    }
                    _ => return Err(self.error("Expected key or attribute after '.'")),
                },
                TokenKind::LBracket => {
                    self.advance();
                    let index = self.parse_expression()?;
                    self.expect(TokenKind::RBracket)?;
                    expr = Expr {
                        kind: ExprKind::IndexStep {
                            base: Box::new(expr),
                            index: Box::new(index),
                        },
                        location: self.make_location(start),
                    };
                }
                TokenKind::DoubleColon => {
                    self.advance();
                    let template = self.parse_unary()?;
                    expr = Expr {
                        kind: ExprKind::SubTemplate {
                            base: Box::new(expr),
                            template: Box::new(template),
                        },
                        location: self.make_location(start),
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let start = self.current().span.start;
        let kind = match self.current().kind.clone() {
            TokenKind::True => {
                self.advance();
                ExprKind::Bool(true)
            }
            TokenKind::False => {
                self.advance();
                ExprKind::Bool(false)
            }
            TokenKind::Null => {
                self.advance();
                ExprKind::Null
            }
            TokenKind::Undefined => {
                self.advance();
                ExprKind::Undefined
            }
            TokenKind::Number(text) => {
                self.advance();
                ExprKind::Number(text)
            }
            TokenKind::String(text) => {
                self.advance();
                ExprKind::Text(text)
            }
            TokenKind::At => {
                self.advance();
                ExprKind::RelativeNode
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_expression()?;
                self.expect(TokenKind::RParen)?;
                return Ok(inner);
            }
            TokenKind::LBracket => {
                self.advance();
                let mut items = Vec::new();
                while !self.check(&TokenKind::RBracket) {
                    items.push(self.parse_expression()?);
                    self.optional_comma();
                }
                self.expect(TokenKind::RBracket)?;
                ExprKind::Array(items)
            }
            TokenKind::LBrace => {
                self.advance();
                let mut members = Vec::new();
                while !self.check(&TokenKind::RBrace) {
                    let key = self.expect_member_name()?;
                    self.expect(TokenKind::Colon)?;
                    let value = self.parse_expression()?;
                    members.push((key, value));
                    self.optional_comma();
                }
                self.expect(TokenKind::RBrace)?;
                ExprKind::Object(members)
            }
            TokenKind::Lt => {
                // Environment attribute finder
                self.advance();
                let name = self.parse_qualified_name()?;
                let args = if self.check(&TokenKind::LParen) {
                    self.parse_call_args()?
                } else {
                    Vec::new()
                };
                self.expect(TokenKind::Gt)?;
                ExprKind::AttributeFinder {
                    entity: None,
                    name,
                    args,
                }
            }
            TokenKind::Identifier(_) => return self.parse_identifier_chain(start),
            TokenKind::Error(message) => return Err(self.error(&message)),
            _ => return Err(self.error("Expected expression")),
        };

        Ok(Expr {
            kind,
            location: self.make_location(start),
        })
    }

    /// Parse `ident (. ident)*`, then decide: a trailing `(` makes the whole
    /// dotted chain a qualified function name; otherwise the first segment is
    /// a variable reference and the rest are key steps.
    fn parse_identifier_chain(&mut self, start: usize) -> Result<Expr, ParseError> {
        let mut segments = vec![self.expect_identifier()?];
        while self.check(&TokenKind::Dot) && matches!(self.peek_kind(1), TokenKind::Identifier(_)) {
            self.advance(); // .
            segments.push(self.expect_identifier()?);
        }

        if self.check(&TokenKind::LParen) {
            let args = self.parse_call_args()?;
            return Ok(Expr {
                kind: ExprKind::FunctionCall {
                    name: segments.join("."),
                    args,
                },
                location: self.make_location(start),
            });
        }

        let mut segments = segments.into_iter();
        let mut expr = Expr {
            kind: ExprKind::Identifier(segments.next().expect("chain has one segment")),
            location: self.make_location(start),
        };
        for key in segments {
            expr = Expr {
                kind: ExprKind::KeyStep {
                    base: Box::new(expr),
                    key,
                },
                location: self.make_location(start),
            };
        }
        Ok(expr)
    }

    fn parse_call_args(&mut self) -> Result<Vec<Expr>, ParseError> {
        self.expect(TokenKind::LParen)?;
        let mut args = Vec::new();
        while !self.check(&TokenKind::RParen) {
            args.push(self.parse_expression()?);
            self.optional_comma();
        }
        self.expect(TokenKind::RParen)?;
        Ok(args)
    }

    fn parse_qualified_name(&mut self) -> Result<String, ParseError> {
        let mut name = self.expect_identifier()?;
        while self.check(&TokenKind::Dot) {
            self.advance();
            name.push('.');
            name.push_str(&self.expect_identifier()?);
        }
        Ok(name)
    }

    // ------------------------------------------------------------------
    // Token plumbing
    // ------------------------------------------------------------------

    fn binary(&self, op: BinaryOperator, lhs: Expr, rhs: Expr, start: usize) -> Expr {
        Expr {
            kind: ExprKind::BinaryOp {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            location: self.make_location(start),
        }
    }

    fn current(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn previous(&self) -> &Token {
        &self.tokens[self.pos.saturating_sub(1).min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self, ahead: usize) -> &TokenKind {
        &self.tokens[(self.pos + ahead).min(self.tokens.len() - 1)].kind
    }

    fn advance(&mut self) {
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
    }

    fn check(&self, kind: &TokenKind) -> bool {
        &self.current().kind == kind
    }

    fn optional_comma(&mut self) {
        if self.check(&TokenKind::Comma) {
            self.advance();
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<(), ParseError> {
        if self.current().kind == kind {
            self.advance();
            Ok(())
        } else {
            Err(self.error(&format!("Expected {kind:?}")))
        }
    }

    fn expect_identifier(&mut self) -> Result<String, ParseError> {
        match &self.current().kind {
            TokenKind::Identifier(s) => {
                let s = s.clone();
                self.advance();
                Ok(s)
            }
            _ => Err(self.error("Expected identifier")),
        }
    }

    fn expect_string(&mut self) -> Result<String, ParseError> {
        match &self.current().kind {
            TokenKind::String(s) => {
                let s = s.clone();
                self.advance();
                Ok(s)
            }
            _ => Err(self.error("Expected string literal")),
        }
    }

    fn expect_member_name(&mut self) -> Result<String, ParseError> {
        match &self.current().kind {
            TokenKind::String(s) | TokenKind::Identifier(s) => {
                let s = s.clone();
                self.advance();
                Ok(s)
            }
            _ => Err(self.error("Expected member name")),
        }
    }

    fn error(&self, message: &str) -> ParseError {
        let span = self.current().span;
        ParseError {
            message: message.to_string(),
            location: SourceLocation::from_offsets(self.file, self.source, span.start, span.end),
        }
    }

    fn make_location(&self, start: usize) -> SourceLocation {
        SourceLocation::from_offsets(self.file, self.source, start, self.previous().span.end)
    }
}
