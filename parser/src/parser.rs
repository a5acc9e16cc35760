use crate::ast::{
    Ast, BinaryOp, ClassDef, ExtendDef, FnDef, Node, NodeKind, Param,
    TypeExpr, TypeExprKind, UnaryOp,
};
use crate::lexer::Lexer;
use crate::span::Span;
use crate::token::{Token, TokenKind};

#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
    pub span: Span,
}

impl ParseError {
    pub fn new(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at {}", self.message, self.span)
    }
}

impl std::error::Error for ParseError {}

/// Parse one source file into an [`Ast`].
pub fn parse(source: &str) -> Result<Ast, ParseError> {
    let tokens: Vec<Token> = Lexer::new(source).collect();
    let mut parser = Parser { tokens, pos: 0 };
    parser.parse_program()
}

/// Recursive-descent parser over the full token buffer.
///
/// The buffer makes backtracking a cheap index save/restore, which the
/// `[len]T` / `[a, b]` ambiguity needs. Semicolons are optional
/// statement terminators: the parser accepts them but never requires
/// one.
struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

type Parse<T> = Result<T, ParseError>;

impl Parser {
    // ── cursor ─────────────────────────────────────────────────────

    fn peek(&self) -> &TokenKind {
        self.peek_at(0)
    }

    fn peek_at(&self, n: usize) -> &TokenKind {
        match self.tokens.get(self.pos + n) {
            Some(token) => &token.kind,
            None => &TokenKind::Eof,
        }
    }

    fn peek_span(&self) -> Span {
        match self.tokens.get(self.pos) {
            Some(token) => token.span,
            None => self
                .tokens
                .last()
                .map(|t| t.span)
                .unwrap_or(Span::point(crate::span::Pos::origin())),
        }
    }

    fn advance(&mut self) -> Token {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .unwrap_or(Token::new(TokenKind::Eof, self.peek_span()));
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn accept(&mut self, kind: &TokenKind) -> bool {
        if self.peek() == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind) -> Parse<Token> {
        if self.peek() == kind {
            Ok(self.advance())
        } else {
            Err(ParseError::new(
                format!(
                    "expected {} but got {}",
                    kind.name(),
                    self.peek().name()
                ),
                self.peek_span(),
            ))
        }
    }

    fn expect_identifier(&mut self) -> Parse<(String, Span)> {
        match self.peek() {
            TokenKind::Identifier(_) => {
                let token = self.advance();
                let TokenKind::Identifier(name) = token.kind else {
                    unreachable!();
                };
                Ok((name, token.span))
            }
            other => Err(ParseError::new(
                format!("expected identifier but got {}", other.name()),
                self.peek_span(),
            )),
        }
    }

    fn bail_on_error_token(&self) -> Parse<()> {
        if let TokenKind::Error(message) = self.peek() {
            return Err(ParseError::new(message.clone(), self.peek_span()));
        }
        Ok(())
    }

    // ── program / statements ───────────────────────────────────────

    fn parse_program(&mut self) -> Parse<Ast> {
        let mut roots = Vec::new();
        loop {
            self.bail_on_error_token()?;
            match self.peek() {
                TokenKind::Eof => break,
                TokenKind::KwClass => roots.push(self.parse_class()?),
                TokenKind::KwExtend => roots.push(self.parse_extend()?),
                _ => roots.push(self.parse_statement()?),
            }
        }
        Ok(Ast { roots })
    }

    fn parse_statement(&mut self) -> Parse<Node> {
        self.bail_on_error_token()?;
        let node = match self.peek() {
            TokenKind::KwFn => {
                let def = self.parse_fn(false)?;
                let span = def.span;
                Node::new(NodeKind::Fn(def), span)
            }
            TokenKind::KwIf => self.parse_if()?,
            TokenKind::KwWhile => self.parse_while()?,
            TokenKind::KwReturn => self.parse_return()?,
            TokenKind::Identifier(_)
                if *self.peek_at(1) == TokenKind::Colon =>
            {
                self.parse_decl()?
            }
            _ => {
                let expr = self.parse_expression()?;
                if self.accept(&TokenKind::Equals) {
                    if !expr.can_lvalue() {
                        return Err(ParseError::new(
                            "left-hand side of assignment is not an lvalue",
                            expr.span,
                        ));
                    }
                    let value = self.parse_expression()?;
                    let span = expr.span.merge(value.span);
                    Node::new(
                        NodeKind::Assign {
                            target: Box::new(expr),
                            value: Box::new(value),
                        },
                        span,
                    )
                } else {
                    expr
                }
            }
        };
        self.accept(&TokenKind::Semicolon);
        Ok(node)
    }

    /// `name : [T]`, then one of `= value`, `: value`, or nothing.
    fn parse_decl(&mut self) -> Parse<Node> {
        let (name, name_span) = self.expect_identifier()?;
        self.expect(&TokenKind::Colon)?;

        let ty = if self.at_type_start() {
            Some(self.parse_type()?)
        } else {
            None
        };

        if self.accept(&TokenKind::Equals) {
            let value = self.parse_expression()?;
            let span = name_span.merge(value.span);
            return Ok(Node::new(
                NodeKind::Decl {
                    name,
                    ty,
                    value: Some(Box::new(value)),
                    constant: false,
                },
                span,
            ));
        }
        if self.accept(&TokenKind::Colon) {
            let value = self.parse_expression()?;
            let span = name_span.merge(value.span);
            return Ok(Node::new(
                NodeKind::Decl {
                    name,
                    ty,
                    value: Some(Box::new(value)),
                    constant: true,
                },
                span,
            ));
        }
        match ty {
            Some(ty) => {
                let span = name_span.merge(ty.span);
                Ok(Node::new(
                    NodeKind::Decl {
                        name,
                        ty: Some(ty),
                        value: None,
                        constant: false,
                    },
                    span,
                ))
            }
            None => Err(ParseError::new(
                "declaration needs a type or an initializer",
                name_span,
            )),
        }
    }

    fn parse_if(&mut self) -> Parse<Node> {
        let if_span = self.expect(&TokenKind::KwIf)?.span;
        let condition = self.parse_expression()?;
        let consequence = self.parse_body_or_statement()?;
        let mut alternative = Vec::new();
        if self.accept(&TokenKind::KwElse) {
            if *self.peek() == TokenKind::KwIf {
                alternative.push(self.parse_if()?);
            } else {
                alternative = self.parse_body_or_statement()?;
            }
        }
        let end = alternative
            .last()
            .or(consequence.last())
            .map(|n| n.span)
            .unwrap_or(condition.span);
        let span = if_span.merge(end);
        Ok(Node::new(
            NodeKind::If {
                condition: Box::new(condition),
                consequence,
                alternative,
            },
            span,
        ))
    }

    fn parse_while(&mut self) -> Parse<Node> {
        let while_span = self.expect(&TokenKind::KwWhile)?.span;
        let condition = self.parse_expression()?;
        let body = self.parse_body_or_statement()?;
        let end = body.last().map(|n| n.span).unwrap_or(condition.span);
        let span = while_span.merge(end);
        Ok(Node::new(
            NodeKind::While {
                condition: Box::new(condition),
                body,
            },
            span,
        ))
    }

    fn parse_return(&mut self) -> Parse<Node> {
        let span = self.expect(&TokenKind::KwReturn)?.span;
        let value = match self.peek() {
            TokenKind::RBrace | TokenKind::Semicolon | TokenKind::Eof => None,
            _ => Some(Box::new(self.parse_expression()?)),
        };
        let span = value
            .as_ref()
            .map(|v| span.merge(v.span))
            .unwrap_or(span);
        Ok(Node::new(NodeKind::Return { value }, span))
    }

    fn parse_body_or_statement(&mut self) -> Parse<Vec<Node>> {
        if *self.peek() == TokenKind::LBrace {
            self.parse_body()
        } else {
            Ok(vec![self.parse_statement()?])
        }
    }

    fn parse_body(&mut self) -> Parse<Vec<Node>> {
        self.expect(&TokenKind::LBrace)?;
        let mut body = Vec::new();
        while !self.accept(&TokenKind::RBrace) {
            if *self.peek() == TokenKind::Eof {
                return Err(ParseError::new(
                    "unterminated block",
                    self.peek_span(),
                ));
            }
            body.push(self.parse_statement()?);
        }
        Ok(body)
    }

    // ── definitions ────────────────────────────────────────────────

    /// `fn name(params) [-> T] { body }`. In an `extend` block the name
    /// may be an operator token (`+`, `[]`, `[]=`, `+@`, …).
    fn parse_fn(&mut self, extending: bool) -> Parse<FnDef> {
        let fn_span = self.expect(&TokenKind::KwFn)?.span;
        let name = self.parse_fn_name(extending)?;
        self.expect(&TokenKind::LParen)?;
        let mut params = Vec::new();
        if !self.accept(&TokenKind::RParen) {
            loop {
                let (pname, pspan) = self.expect_identifier()?;
                self.expect(&TokenKind::Colon)?;
                let ty = self.parse_type()?;
                let span = pspan.merge(ty.span);
                params.push(Param {
                    name: pname,
                    ty,
                    span,
                });
                if !self.accept(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(&TokenKind::RParen)?;
        }
        let ret = if self.accept(&TokenKind::Arrow) {
            Some(self.parse_type()?)
        } else {
            None
        };
        let body = self.parse_body()?;
        let end = body.last().map(|n| n.span).unwrap_or(fn_span);
        Ok(FnDef {
            name,
            params,
            ret,
            body,
            span: fn_span.merge(end),
        })
    }

    fn parse_fn_name(&mut self, extending: bool) -> Parse<String> {
        if let TokenKind::Identifier(_) = self.peek() {
            return Ok(self.expect_identifier()?.0);
        }
        if !extending {
            return Err(ParseError::new(
                "expected function name",
                self.peek_span(),
            ));
        }
        // Operator method names.
        if self.accept(&TokenKind::LBracket) {
            self.expect(&TokenKind::RBracket)?;
            if self.accept(&TokenKind::Equals) {
                return Ok("[]=".to_string());
            }
            return Ok("[]".to_string());
        }
        if *self.peek() == TokenKind::Plus && *self.peek_at(1) == TokenKind::At
        {
            self.advance();
            self.advance();
            return Ok("+@".to_string());
        }
        if *self.peek() == TokenKind::Minus
            && *self.peek_at(1) == TokenKind::At
        {
            self.advance();
            self.advance();
            return Ok("-@".to_string());
        }
        if let Some(name) = self.peek().operator_method_name() {
            self.advance();
            return Ok(name.to_string());
        }
        Err(ParseError::new(
            format!("{} cannot name a method", self.peek().name()),
            self.peek_span(),
        ))
    }

    /// `class Name [: Super] { fields... methods... }`
    fn parse_class(&mut self) -> Parse<Node> {
        let class_span = self.expect(&TokenKind::KwClass)?.span;
        let (name, _) = self.expect_identifier()?;
        let parent = if self.accept(&TokenKind::Colon) {
            Some(self.expect_identifier()?.0)
        } else {
            None
        };
        self.expect(&TokenKind::LBrace)?;
        let mut fields = Vec::new();
        let mut methods = Vec::new();
        loop {
            match self.peek() {
                TokenKind::Identifier(_) => {
                    let (fname, fspan) = self.expect_identifier()?;
                    self.expect(&TokenKind::Colon)?;
                    let ty = self.parse_type()?;
                    let span = fspan.merge(ty.span);
                    fields.push(Param {
                        name: fname,
                        ty,
                        span,
                    });
                    self.accept(&TokenKind::Semicolon);
                }
                TokenKind::KwFn => methods.push(self.parse_fn(false)?),
                _ => break,
            }
        }
        let end = self.expect(&TokenKind::RBrace)?.span;
        Ok(Node::new(
            NodeKind::Class(ClassDef {
                name,
                parent,
                fields,
                methods,
                span: class_span.merge(end),
            }),
            class_span.merge(end),
        ))
    }

    /// `extend T { methods... }`
    fn parse_extend(&mut self) -> Parse<Node> {
        let extend_span = self.expect(&TokenKind::KwExtend)?.span;
        let target = self.parse_type()?;
        self.expect(&TokenKind::LBrace)?;
        let mut methods = Vec::new();
        while *self.peek() == TokenKind::KwFn {
            methods.push(self.parse_fn(true)?);
        }
        let end = self.expect(&TokenKind::RBrace)?.span;
        Ok(Node::new(
            NodeKind::Extend(ExtendDef {
                target,
                methods,
                span: extend_span.merge(end),
            }),
            extend_span.merge(end),
        ))
    }

    // ── types ──────────────────────────────────────────────────────

    fn at_type_start(&self) -> bool {
        match self.peek() {
            TokenKind::Identifier(_) => true,
            TokenKind::LBracket => *self.peek_at(1) == TokenKind::RBracket,
            _ => false,
        }
    }

    /// `ident` or `[]T`.
    fn parse_type(&mut self) -> Parse<TypeExpr> {
        if self.accept(&TokenKind::LBracket) {
            let open = self
                .tokens
                .get(self.pos - 1)
                .map(|t| t.span)
                .unwrap_or(self.peek_span());
            self.expect(&TokenKind::RBracket)?;
            let element = self.parse_type()?;
            let span = open.merge(element.span);
            return Ok(TypeExpr {
                kind: TypeExprKind::Array(Box::new(element)),
                span,
            });
        }
        let (name, span) = self.expect_identifier()?;
        Ok(TypeExpr {
            kind: TypeExprKind::Named(name),
            span,
        })
    }

    // ── expressions, by precedence tier ────────────────────────────

    fn parse_expression(&mut self) -> Parse<Node> {
        self.bail_on_error_token()?;
        self.parse_binary_tier(0)
    }

    /// Precedence tiers, loosest first. Each row is left-associative.
    const TIERS: &'static [&'static [(TokenKind, BinaryOp)]] = &[
        &[(TokenKind::OrOr, BinaryOp::LogOr)],
        &[(TokenKind::AndAnd, BinaryOp::LogAnd)],
        &[(TokenKind::Pipe, BinaryOp::BitOr)],
        &[(TokenKind::Caret, BinaryOp::BitXor)],
        &[(TokenKind::Amp, BinaryOp::BitAnd)],
        &[
            (TokenKind::EqEq, BinaryOp::Eq),
            (TokenKind::BangEq, BinaryOp::Ne),
        ],
        &[
            (TokenKind::Lt, BinaryOp::Lt),
            (TokenKind::Le, BinaryOp::Le),
            (TokenKind::Gt, BinaryOp::Gt),
            (TokenKind::Ge, BinaryOp::Ge),
        ],
        &[
            (TokenKind::Shl, BinaryOp::Shl),
            (TokenKind::Shr, BinaryOp::Shr),
        ],
        &[
            (TokenKind::Plus, BinaryOp::Add),
            (TokenKind::Minus, BinaryOp::Sub),
        ],
        &[
            (TokenKind::Star, BinaryOp::Mul),
            (TokenKind::Slash, BinaryOp::Div),
            (TokenKind::Percent, BinaryOp::Mod),
        ],
    ];

    fn parse_binary_tier(&mut self, tier: usize) -> Parse<Node> {
        if tier >= Self::TIERS.len() {
            return self.parse_unary();
        }
        let mut lhs = self.parse_binary_tier(tier + 1)?;
        'outer: loop {
            for (kind, op) in Self::TIERS[tier] {
                if self.accept(kind) {
                    let rhs = self.parse_binary_tier(tier + 1)?;
                    let span = lhs.span.merge(rhs.span);
                    lhs = Node::new(
                        NodeKind::Binary {
                            op: *op,
                            lhs: Box::new(lhs),
                            rhs: Box::new(rhs),
                        },
                        span,
                    );
                    continue 'outer;
                }
            }
            break;
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Parse<Node> {
        let op = match self.peek() {
            TokenKind::Minus => Some(UnaryOp::Neg),
            TokenKind::Plus => Some(UnaryOp::Pos),
            TokenKind::Bang => Some(UnaryOp::Not),
            TokenKind::Tilde => Some(UnaryOp::Invert),
            _ => None,
        };
        if let Some(op) = op {
            let span = self.advance().span;
            let operand = self.parse_unary()?;
            let span = span.merge(operand.span);
            return Ok(Node::new(
                NodeKind::Unary {
                    op,
                    operand: Box::new(operand),
                },
                span,
            ));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Parse<Node> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.accept(&TokenKind::LParen) {
                let mut args = Vec::new();
                if !self.accept(&TokenKind::RParen) {
                    loop {
                        args.push(self.parse_expression()?);
                        if !self.accept(&TokenKind::Comma) {
                            break;
                        }
                    }
                    self.expect(&TokenKind::RParen)?;
                }
                let span = expr.span.merge(self.prev_span());
                expr = Node::new(
                    NodeKind::Call {
                        callee: Box::new(expr),
                        args,
                    },
                    span,
                );
            } else if self.accept(&TokenKind::LBracket) {
                let index = self.parse_expression()?;
                self.expect(&TokenKind::RBracket)?;
                let span = expr.span.merge(self.prev_span());
                expr = Node::new(
                    NodeKind::Index {
                        base: Box::new(expr),
                        index: Box::new(index),
                    },
                    span,
                );
            } else if self.accept(&TokenKind::Dot) {
                let (name, name_span) = self.expect_identifier()?;
                let span = expr.span.merge(name_span);
                expr = Node::new(
                    NodeKind::Member {
                        base: Box::new(expr),
                        name,
                    },
                    span,
                );
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn prev_span(&self) -> Span {
        self.tokens
            .get(self.pos.saturating_sub(1))
            .map(|t| t.span)
            .unwrap_or(self.peek_span())
    }

    fn parse_primary(&mut self) -> Parse<Node> {
        self.bail_on_error_token()?;
        let span = self.peek_span();
        match self.peek().clone() {
            TokenKind::Integer(value) => {
                self.advance();
                Ok(Node::new(NodeKind::Integer(value), span))
            }
            TokenKind::Real(value) => {
                self.advance();
                Ok(Node::new(NodeKind::Real(value), span))
            }
            TokenKind::Str(value) => {
                self.advance();
                Ok(Node::new(NodeKind::Str(value), span))
            }
            TokenKind::CharLit(value) => {
                self.advance();
                Ok(Node::new(NodeKind::CharLit(value), span))
            }
            TokenKind::KwTrue => {
                self.advance();
                Ok(Node::new(NodeKind::Bool(true), span))
            }
            TokenKind::KwFalse => {
                self.advance();
                Ok(Node::new(NodeKind::Bool(false), span))
            }
            TokenKind::At => {
                self.advance();
                Ok(Node::new(NodeKind::Receiver, span))
            }
            TokenKind::Identifier(name) => {
                self.advance();
                Ok(Node::new(NodeKind::Ident(name), span))
            }
            TokenKind::LParen => {
                self.advance();
                let expr = self.parse_expression()?;
                self.expect(&TokenKind::RParen)?;
                Ok(expr)
            }
            TokenKind::LBracket => self.parse_bracket_expression(),
            other => Err(ParseError::new(
                format!("unexpected {} in expression", other.name()),
                span,
            )),
        }
    }

    /// `[len]T` (new array) or `[a, b, c]` (array literal). Tried in
    /// that order with backtracking, matching the original grammar.
    fn parse_bracket_expression(&mut self) -> Parse<Node> {
        let open = self.peek_span();
        let save = self.pos;

        // Attempt: [ expr ] type
        self.advance();
        if let Ok(length) = self.parse_expression() {
            if self.accept(&TokenKind::RBracket) && self.at_type_start() {
                if let Ok(element) = self.parse_type() {
                    let span = open.merge(element.span);
                    return Ok(Node::new(
                        NodeKind::NewArray {
                            length: Box::new(length),
                            element,
                        },
                        span,
                    ));
                }
            }
        }

        // Backtrack: [ expr, expr, ... ]
        self.pos = save;
        self.advance();
        let mut elements = Vec::new();
        if !self.accept(&TokenKind::RBracket) {
            loop {
                elements.push(self.parse_expression()?);
                if !self.accept(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(&TokenKind::RBracket)?;
        }
        if elements.is_empty() {
            return Err(ParseError::new("array literal cannot be empty", open));
        }
        let span = open.merge(self.prev_span());
        Ok(Node::new(NodeKind::ArrayLit(elements), span))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> Ast {
        match parse(source) {
            Ok(ast) => ast,
            Err(err) => panic!("parse failed: {err}"),
        }
    }

    fn first(source: &str) -> Node {
        parse_ok(source).roots.into_iter().next().expect("no roots")
    }

    #[test]
    fn decl_with_inferred_type() {
        let node = first("a := 10");
        match node.kind {
            NodeKind::Decl {
                name,
                ty,
                value,
                constant,
            } => {
                assert_eq!(name, "a");
                assert!(ty.is_none());
                assert!(!constant);
                assert_eq!(value.unwrap().kind, NodeKind::Integer(10));
            }
            other => panic!("expected decl, got {other:?}"),
        }
    }

    #[test]
    fn decl_with_type_and_value() {
        let node = first("a : int = 10");
        match node.kind {
            NodeKind::Decl { ty, constant, .. } => {
                assert!(!constant);
                assert_eq!(
                    ty.unwrap().kind,
                    TypeExprKind::Named("int".to_string())
                );
            }
            other => panic!("expected decl, got {other:?}"),
        }
    }

    #[test]
    fn constant_decl() {
        let node = first("limit :: 100");
        match node.kind {
            NodeKind::Decl { constant, .. } => assert!(constant),
            other => panic!("expected decl, got {other:?}"),
        }
    }

    #[test]
    fn plain_typed_decl() {
        let node = first("xs : []int");
        match node.kind {
            NodeKind::Decl { ty, value, .. } => {
                assert!(value.is_none());
                assert!(matches!(ty.unwrap().kind, TypeExprKind::Array(_)));
            }
            other => panic!("expected decl, got {other:?}"),
        }
    }

    #[test]
    fn precedence_mul_binds_tighter_than_add() {
        let node = first("1 + 2 * 3");
        match node.kind {
            NodeKind::Binary { op, rhs, .. } => {
                assert_eq!(op, BinaryOp::Add);
                assert!(matches!(
                    rhs.kind,
                    NodeKind::Binary {
                        op: BinaryOp::Mul,
                        ..
                    }
                ));
            }
            other => panic!("expected binary, got {other:?}"),
        }
    }

    #[test]
    fn comparison_is_looser_than_shift() {
        let node = first("1 << 2 < 3");
        match node.kind {
            NodeKind::Binary { op, lhs, .. } => {
                assert_eq!(op, BinaryOp::Lt);
                assert!(matches!(
                    lhs.kind,
                    NodeKind::Binary {
                        op: BinaryOp::Shl,
                        ..
                    }
                ));
            }
            other => panic!("expected binary, got {other:?}"),
        }
    }

    #[test]
    fn call_and_member_postfix() {
        let node = first("p.norm(1, 2)[0]");
        assert!(matches!(node.kind, NodeKind::Index { .. }));
    }

    #[test]
    fn method_call_on_integer_literal() {
        let node = first("21.double()");
        match node.kind {
            NodeKind::Call { callee, args } => {
                assert!(args.is_empty());
                assert!(matches!(callee.kind, NodeKind::Member { .. }));
            }
            other => panic!("expected call, got {other:?}"),
        }
    }

    #[test]
    fn assignment_statement() {
        let node = first("xs[0] = 5");
        assert!(matches!(node.kind, NodeKind::Assign { .. }));
    }

    #[test]
    fn assignment_to_rvalue_is_rejected() {
        assert!(parse("1 + 2 = 3").is_err());
    }

    #[test]
    fn if_else_chain() {
        let node = first("if a < b { x := 1 } else if b < c { } else { y := 2 }");
        match node.kind {
            NodeKind::If { alternative, .. } => {
                assert_eq!(alternative.len(), 1);
                assert!(matches!(alternative[0].kind, NodeKind::If { .. }));
            }
            other => panic!("expected if, got {other:?}"),
        }
    }

    #[test]
    fn while_with_body() {
        let node = first("while i < 10 { i = i + 1 }");
        match node.kind {
            NodeKind::While { body, .. } => assert_eq!(body.len(), 1),
            other => panic!("expected while, got {other:?}"),
        }
    }

    #[test]
    fn fn_definition() {
        let node = first("fn fib(n: int) -> int { return n }");
        match node.kind {
            NodeKind::Fn(def) => {
                assert_eq!(def.name, "fib");
                assert_eq!(def.params.len(), 1);
                assert!(def.ret.is_some());
                assert_eq!(def.body.len(), 1);
            }
            other => panic!("expected fn, got {other:?}"),
        }
    }

    #[test]
    fn void_fn_has_no_return_type() {
        let node = first("fn hello() { }");
        match node.kind {
            NodeKind::Fn(def) => assert!(def.ret.is_none()),
            other => panic!("expected fn, got {other:?}"),
        }
    }

    #[test]
    fn class_with_fields_and_methods() {
        let node = first(
            "class Point {\n  x : int\n  y : int\n  fn sum(p: Point) -> int { return 0 }\n}",
        );
        match node.kind {
            NodeKind::Class(def) => {
                assert_eq!(def.name, "Point");
                assert!(def.parent.is_none());
                assert_eq!(def.fields.len(), 2);
                assert_eq!(def.methods.len(), 1);
            }
            other => panic!("expected class, got {other:?}"),
        }
    }

    #[test]
    fn class_with_parent() {
        let node = first("class Circle : Shape { }");
        match node.kind {
            NodeKind::Class(def) => {
                assert_eq!(def.parent.as_deref(), Some("Shape"));
            }
            other => panic!("expected class, got {other:?}"),
        }
    }

    #[test]
    fn extend_with_operator_methods() {
        let node = first(
            "extend int {\n  fn double() -> int { return @ * 2 }\n  fn +@() -> int { return @ }\n  fn []=(i: int, v: int) { }\n}",
        );
        match node.kind {
            NodeKind::Extend(def) => {
                let names: Vec<&str> =
                    def.methods.iter().map(|m| m.name.as_str()).collect();
                assert_eq!(names, vec!["double", "+@", "[]="]);
            }
            other => panic!("expected extend, got {other:?}"),
        }
    }

    #[test]
    fn receiver_in_method_body() {
        let node = first("extend int { fn id() -> int { return @ } }");
        match node.kind {
            NodeKind::Extend(def) => {
                match &def.methods[0].body[0].kind {
                    NodeKind::Return { value } => {
                        let value = value.as_ref().unwrap();
                        assert_eq!(value.kind, NodeKind::Receiver);
                    }
                    other => panic!("expected return, got {other:?}"),
                }
            }
            other => panic!("expected extend, got {other:?}"),
        }
    }

    #[test]
    fn new_array_vs_array_literal() {
        let node = first("[10]int");
        assert!(matches!(node.kind, NodeKind::NewArray { .. }));
        let node = first("[1, 2, 3]");
        match node.kind {
            NodeKind::ArrayLit(elements) => assert_eq!(elements.len(), 3),
            other => panic!("expected array literal, got {other:?}"),
        }
    }

    #[test]
    fn semicolons_are_optional() {
        let ast = parse_ok("a := 1; b := 2\nc := 3");
        assert_eq!(ast.roots.len(), 3);
    }

    #[test]
    fn lexer_errors_surface_as_parse_errors() {
        assert!(parse("a := $").is_err());
        assert!(parse("\"unterminated").is_err());
    }

    #[test]
    fn unterminated_block_is_rejected() {
        assert!(parse("fn f() { a := 1").is_err());
    }
}
