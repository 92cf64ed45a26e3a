//! Recursive-descent parser building the [`Ast`] this crate's compiler
//! lowers. Another of spec.md §1's external collaborators: correctness of
//! the *language surface* lives here, but the interesting engineering
//! density (scope resolution, jump patching, closure capture) is all in
//! `compiler.rs`, which this module feeds.

use crate::ast::*;
use crate::error::CompileError;
use crate::scanner::Scanner;
use crate::token::{Token, TokenType as T};

pub struct Parser<'src> {
    tokens: Vec<Token<'src>>,
    pos: usize,
    errors: Vec<CompileError>,
}

type PResult<T> = Result<T, ()>;

pub fn parse(source: &str) -> Result<Ast, Vec<CompileError>> {
    let mut scanner = Scanner::new(source);
    let mut tokens = Vec::new();
    loop {
        let tok = scanner.scan_token();
        let done = tok.kind == T::Eof;
        tokens.push(tok);
        if done {
            break;
        }
    }

    let mut parser = Parser { tokens, pos: 0, errors: Vec::new() };
    let mut body = Vec::new();
    while !parser.check(T::Eof) {
        match parser.declaration() {
            Ok(decl) => body.push(decl),
            Err(()) => parser.synchronize(),
        }
    }

    if parser.errors.is_empty() {
        Ok(Ast { body })
    } else {
        Err(parser.errors)
    }
}

impl<'src> Parser<'src> {
    fn peek(&self) -> Token<'src> {
        self.tokens[self.pos]
    }

    fn previous(&self) -> Token<'src> {
        self.tokens[self.pos - 1]
    }

    fn check(&self, kind: T) -> bool {
        self.peek().kind == kind
    }

    fn advance(&mut self) -> Token<'src> {
        if self.peek().kind != T::Eof {
            self.pos += 1;
        }
        self.previous()
    }

    fn matches(&mut self, kind: T) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: T, message: &str) -> PResult<Token<'src>> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(self.error_at_current(message))
        }
    }

    fn error_at_current(&mut self, message: &str) {
        let tok = self.peek();
        self.errors.push(CompileError::new(message.to_string(), tok.line));
    }

    fn error_at(&mut self, line: u32, message: impl Into<String>) {
        self.errors.push(CompileError::new(message.into(), line));
    }

    fn synchronize(&mut self) {
        while !self.check(T::Eof) {
            if self.previous().kind == T::Semicolon {
                return;
            }
            match self.peek().kind {
                T::Class | T::Fun | T::Var | T::For | T::If | T::While | T::Print | T::Return | T::When | T::Import => {
                    return;
                }
                _ => {
                    self.advance();
                }
            }
        }
    }

    // ---- declarations ----

    fn declaration(&mut self) -> Result<Decl, ()> {
        if self.matches(T::Class) {
            return self.class_declaration();
        }
        if self.matches(T::Fun) {
            return self.function_declaration();
        }
        if self.matches(T::Var) {
            return self.var_declaration();
        }
        if self.matches(T::Import) {
            return self.import_declaration();
        }
        self.statement().map(Decl::Statement)
    }

    fn class_declaration(&mut self) -> PResult<Decl> {
        let line = self.previous().line;
        let name_tok = self.consume(T::Identifier, "Expected class name.")?;
        let name = name_tok.lexeme.to_string();

        let superclass = if self.matches(T::Less) {
            Some(self.consume(T::Identifier, "Expected superclass name.")?.lexeme.to_string())
        } else {
            None
        };

        self.consume(T::LeftBrace, "Expected '{' before class body.")?;
        let mut methods = Vec::new();
        while !self.check(T::RightBrace) && !self.check(T::Eof) {
            let is_static = self.matches(T::Static);
            let mline = self.peek().line;
            let mname = self.consume(T::Identifier, "Expected method name.")?.lexeme.to_string();
            let function = self.function_body(&mname)?;
            methods.push(NamedFunction { name: mname, function, is_static, line: mline });
        }
        self.consume(T::RightBrace, "Expected '}' after class body.")?;

        Ok(Decl::Class { name, superclass, methods, line })
    }

    fn function_declaration(&mut self) -> PResult<Decl> {
        let line = self.peek().line;
        let name = self.consume(T::Identifier, "Expected function name.")?.lexeme.to_string();
        let function = self.function_body(&name)?;
        Ok(Decl::Function(NamedFunction { name, function, is_static: false, line }))
    }

    /// Parses `(params) { block }` or `(params) => expr;` — a function's
    /// parameter list plus either notation its body may use.
    fn function_body(&mut self, _name: &str) -> PResult<FunctionNode> {
        let line = self.previous().line;
        self.consume(T::LeftParen, "Expected '(' after name.")?;
        let mut params = Vec::new();
        if !self.check(T::RightParen) {
            loop {
                if params.len() >= 255 {
                    self.error_at(self.peek().line, "Can't have more than 255 parameters.");
                }
                params.push(self.consume(T::Identifier, "Expected parameter name.")?.lexeme.to_string());
                if !self.matches(T::Comma) {
                    break;
                }
            }
        }
        self.consume(T::RightParen, "Expected ')' after parameters.")?;

        if self.matches(T::Equal) {
            // `fun name() = expr;` expression-bodied form.
            let expr = self.expression()?;
            self.consume(T::Semicolon, "Expected ';' after expression body.")?;
            return Ok(FunctionNode { params, body: FunctionBody::Expression(expr), line });
        }

        self.consume(T::LeftBrace, "Expected '{' before function body.")?;
        let block = self.block()?;
        Ok(FunctionNode { params, body: FunctionBody::Block(block), line })
    }

    fn var_declaration(&mut self) -> PResult<Decl> {
        let line = self.previous().line;
        let name = self.consume(T::Identifier, "Expected variable name.")?.lexeme.to_string();
        let value = if self.matches(T::Equal) { Some(self.expression()?) } else { None };
        self.consume(T::Semicolon, "Expected ';' after variable declaration.")?;
        Ok(Decl::Variable { name, value, line })
    }

    fn import_declaration(&mut self) -> PResult<Decl> {
        let line = self.previous().line;
        let path_tok = self.consume(T::String, "Expected module path string.")?;
        let path = unquote(path_tok.lexeme);
        self.consume(T::Identifier, "Expected 'as'.")?;
        let alias = self.consume(T::Identifier, "Expected module alias.")?.lexeme.to_string();
        self.consume(T::Semicolon, "Expected ';' after import.")?;
        Ok(Decl::Import { path, alias, line })
    }

    // ---- statements ----

    fn statement(&mut self) -> PResult<Stmt> {
        if self.matches(T::For) {
            return self.for_statement();
        }
        if self.matches(T::While) {
            return self.while_statement();
        }
        if self.matches(T::Break) {
            let line = self.previous().line;
            self.consume(T::Semicolon, "Expected ';' after 'break'.")?;
            return Ok(Stmt::Break { line });
        }
        if self.matches(T::Continue) {
            let line = self.previous().line;
            self.consume(T::Semicolon, "Expected ';' after 'continue'.")?;
            return Ok(Stmt::Continue { line });
        }
        if self.matches(T::When) {
            return self.when_statement();
        }
        if self.matches(T::If) {
            return self.if_statement();
        }
        if self.matches(T::Return) {
            return self.return_statement();
        }
        if self.matches(T::Print) {
            let value = self.expression()?;
            self.consume(T::Semicolon, "Expected ';' after value.")?;
            return Ok(Stmt::Print { value });
        }
        if self.matches(T::LeftBrace) {
            return Ok(Stmt::Block(self.block()?));
        }
        let expr = self.expression()?;
        self.consume(T::Semicolon, "Expected ';' after expression.")?;
        Ok(Stmt::Expression(expr))
    }

    fn block(&mut self) -> PResult<Vec<Decl>> {
        let mut decls = Vec::new();
        while !self.check(T::RightBrace) && !self.check(T::Eof) {
            match self.declaration() {
                Ok(d) => decls.push(d),
                Err(()) => self.synchronize(),
            }
        }
        self.consume(T::RightBrace, "Expected '}' after block.")?;
        Ok(decls)
    }

    fn for_statement(&mut self) -> PResult<Stmt> {
        self.consume(T::LeftParen, "Expected '(' after 'for'.")?;

        // `for (x : iterable)` sugar over `make_iterator`/`next` (spec.md §10).
        if self.check(T::Identifier) && self.peek_is_colon_binding() {
            let line = self.peek().line;
            let binding = self.advance().lexeme.to_string();
            self.consume(T::Colon, "Expected ':' in for-in loop.")?;
            let iterable = self.expression()?;
            self.consume(T::RightParen, "Expected ')' after iterable.")?;
            let body = Box::new(self.statement()?);
            return Ok(Stmt::ForIn { binding, iterable, body, line });
        }

        let initializer = if self.matches(T::Semicolon) {
            None
        } else if self.matches(T::Var) {
            Some(Box::new(self.var_declaration()?))
        } else {
            let expr = self.expression()?;
            self.consume(T::Semicolon, "Expected ';' after loop initializer.")?;
            Some(Box::new(Decl::Statement(Stmt::Expression(expr))))
        };

        let condition = if self.check(T::Semicolon) { None } else { Some(self.expression()?) };
        self.consume(T::Semicolon, "Expected ';' after loop condition.")?;

        let increment = if self.check(T::RightParen) { None } else { Some(self.expression()?) };
        self.consume(T::RightParen, "Expected ')' after for clauses.")?;

        let body = Box::new(self.statement()?);
        Ok(Stmt::For { initializer, condition, increment, body })
    }

    /// Lookahead to distinguish `for (x : it)` from `for (x = 0; ...)`:
    /// an identifier directly followed by `:` only appears in the for-in
    /// binding position.
    fn peek_is_colon_binding(&self) -> bool {
        self.tokens.get(self.pos + 1).map(|t| t.kind == T::Colon).unwrap_or(false)
    }

    fn while_statement(&mut self) -> PResult<Stmt> {
        self.consume(T::LeftParen, "Expected '(' after 'while'.")?;
        let condition = self.expression()?;
        self.consume(T::RightParen, "Expected ')' after condition.")?;
        let body = Box::new(self.statement()?);
        Ok(Stmt::While { condition, body })
    }

    /// `when (control) { is a, b: stmt  is c: stmt  else: stmt }`
    fn when_statement(&mut self) -> PResult<Stmt> {
        self.consume(T::LeftParen, "Expected '(' after 'when'.")?;
        let control = self.expression()?;
        self.consume(T::RightParen, "Expected ')' after when control expression.")?;
        self.consume(T::LeftBrace, "Expected '{' before when body.")?;

        let mut entries = Vec::new();
        let mut else_branch = None;
        while !self.check(T::RightBrace) && !self.check(T::Eof) {
            if self.matches(T::Is) {
                let mut cases = vec![self.expression()?];
                while self.matches(T::Comma) {
                    cases.push(self.expression()?);
                }
                self.consume(T::Colon, "Expected ':' after when case.")?;
                let body = Box::new(self.statement()?);
                entries.push(WhenEntry { cases, body });
            } else if self.matches(T::Else) {
                self.consume(T::Colon, "Expected ':' after 'else'.")?;
                else_branch = Some(Box::new(self.statement()?));
            } else {
                self.error_at_current("Expected 'is' or 'else' in when body.");
                return Err(());
            }
        }
        self.consume(T::RightBrace, "Expected '}' after when body.")?;
        Ok(Stmt::When { control, entries, else_branch })
    }

    fn if_statement(&mut self) -> PResult<Stmt> {
        self.consume(T::LeftParen, "Expected '(' after 'if'.")?;
        let condition = self.expression()?;
        self.consume(T::RightParen, "Expected ')' after condition.")?;
        let then_branch = Box::new(self.statement()?);
        let else_branch = if self.matches(T::Else) { Some(Box::new(self.statement()?)) } else { None };
        Ok(Stmt::If { condition, then_branch, else_branch })
    }

    fn return_statement(&mut self) -> PResult<Stmt> {
        let line = self.previous().line;
        let value = if self.check(T::Semicolon) { None } else { Some(self.expression()?) };
        self.consume(T::Semicolon, "Expected ';' after return value.")?;
        Ok(Stmt::Return { value, line })
    }

    // ---- expressions (precedence-climbing) ----

    fn expression(&mut self) -> PResult<Expr> {
        self.assignment()
    }

    fn assignment(&mut self) -> PResult<Expr> {
        let expr = self.conditional()?;

        if self.matches(T::Equal) {
            let line = self.previous().line;
            let value = self.assignment()?;
            return self.as_assignment_target(expr, value, line);
        }

        let compound = match self.peek().kind {
            T::PlusEqual => Some(BinaryOp::Add),
            T::MinusEqual => Some(BinaryOp::Subtract),
            T::StarEqual => Some(BinaryOp::Multiply),
            T::SlashEqual => Some(BinaryOp::Divide),
            T::PercentEqual => Some(BinaryOp::Modulo),
            T::AmpersandEqual => Some(BinaryOp::BitwiseAnd),
            T::PipeEqual => Some(BinaryOp::BitwiseOr),
            T::CaretEqual => Some(BinaryOp::BitwiseXor),
            T::LessLessEqual => Some(BinaryOp::ShiftLeft),
            T::GreaterGreaterEqual => Some(BinaryOp::ShiftRight),
            _ => None,
        };
        if let Some(op) = compound {
            let line = self.advance().line;
            let value = self.assignment()?;
            return self.as_compound_assignment_target(expr, op, value, line);
        }

        Ok(expr)
    }

    fn as_assignment_target(&mut self, target: Expr, value: Expr, line: u32) -> PResult<Expr> {
        match &target {
            Expr::Identifier { .. } | Expr::Property { .. } | Expr::Subscript { .. } => {
                Ok(Expr::Assignment { target: Box::new(mark_store(target)), value: Box::new(value), line })
            }
            _ => {
                self.error_at(line, "Invalid assignment target.");
                Err(())
            }
        }
    }

    fn as_compound_assignment_target(&mut self, target: Expr, op: BinaryOp, value: Expr, line: u32) -> PResult<Expr> {
        match &target {
            Expr::Identifier { .. } | Expr::Property { .. } | Expr::Subscript { .. } => {
                Ok(Expr::CompoundAssignment { target: Box::new(mark_store(target)), op, value: Box::new(value), line })
            }
            _ => {
                self.error_at(line, "Invalid assignment target.");
                Err(())
            }
        }
    }

    fn conditional(&mut self) -> PResult<Expr> {
        let condition = self.or_expr()?;
        if self.matches(T::Question) {
            let line = self.previous().line;
            let then_branch = self.assignment()?;
            self.consume(T::Colon, "Expected ':' in conditional expression.")?;
            let else_branch = self.assignment()?;
            return Ok(Expr::Conditional {
                condition: Box::new(condition),
                then_branch: Box::new(then_branch),
                else_branch: Box::new(else_branch),
                line,
            });
        }
        Ok(condition)
    }

    fn or_expr(&mut self) -> PResult<Expr> {
        let mut expr = self.and_expr()?;
        while self.matches(T::Or) {
            let line = self.previous().line;
            let right = self.and_expr()?;
            expr = Expr::Logical { left: Box::new(expr), op: LogicalOp::Or, right: Box::new(right), line };
        }
        Ok(expr)
    }

    fn and_expr(&mut self) -> PResult<Expr> {
        let mut expr = self.equality()?;
        while self.matches(T::And) {
            let line = self.previous().line;
            let right = self.equality()?;
            expr = Expr::Logical { left: Box::new(expr), op: LogicalOp::And, right: Box::new(right), line };
        }
        Ok(expr)
    }

    fn equality(&mut self) -> PResult<Expr> {
        let mut expr = self.comparison()?;
        loop {
            let op = match self.peek().kind {
                T::BangEqual => BinaryOp::NotEqual,
                T::EqualEqual => BinaryOp::Equal,
                _ => break,
            };
            let line = self.advance().line;
            let right = self.comparison()?;
            expr = Expr::Binary { left: Box::new(expr), op, right: Box::new(right), line };
        }
        Ok(expr)
    }

    fn comparison(&mut self) -> PResult<Expr> {
        let mut expr = self.bitwise_or()?;
        loop {
            let op = match self.peek().kind {
                T::Greater => BinaryOp::Greater,
                T::GreaterEqual => BinaryOp::GreaterEqual,
                T::Less => BinaryOp::Less,
                T::LessEqual => BinaryOp::LessEqual,
                _ => break,
            };
            let line = self.advance().line;
            let right = self.bitwise_or()?;
            expr = Expr::Binary { left: Box::new(expr), op, right: Box::new(right), line };
        }
        Ok(expr)
    }

    fn bitwise_or(&mut self) -> PResult<Expr> {
        let mut expr = self.bitwise_xor()?;
        while self.check(T::Pipe) {
            let line = self.advance().line;
            let right = self.bitwise_xor()?;
            expr = Expr::Binary { left: Box::new(expr), op: BinaryOp::BitwiseOr, right: Box::new(right), line };
        }
        Ok(expr)
    }

    fn bitwise_xor(&mut self) -> PResult<Expr> {
        let mut expr = self.bitwise_and()?;
        while self.check(T::Caret) {
            let line = self.advance().line;
            let right = self.bitwise_and()?;
            expr = Expr::Binary { left: Box::new(expr), op: BinaryOp::BitwiseXor, right: Box::new(right), line };
        }
        Ok(expr)
    }

    fn bitwise_and(&mut self) -> PResult<Expr> {
        let mut expr = self.shift()?;
        while self.check(T::Ampersand) {
            let line = self.advance().line;
            let right = self.shift()?;
            expr = Expr::Binary { left: Box::new(expr), op: BinaryOp::BitwiseAnd, right: Box::new(right), line };
        }
        Ok(expr)
    }

    fn shift(&mut self) -> PResult<Expr> {
        let mut expr = self.term()?;
        loop {
            let op = match self.peek().kind {
                T::LessLess => BinaryOp::ShiftLeft,
                T::GreaterGreater => BinaryOp::ShiftRight,
                _ => break,
            };
            let line = self.advance().line;
            let right = self.term()?;
            expr = Expr::Binary { left: Box::new(expr), op, right: Box::new(right), line };
        }
        Ok(expr)
    }

    fn term(&mut self) -> PResult<Expr> {
        let mut expr = self.factor()?;
        loop {
            let op = match self.peek().kind {
                T::Plus => BinaryOp::Add,
                T::Minus => BinaryOp::Subtract,
                _ => break,
            };
            let line = self.advance().line;
            let right = self.factor()?;
            expr = Expr::Binary { left: Box::new(expr), op, right: Box::new(right), line };
        }
        Ok(expr)
    }

    fn factor(&mut self) -> PResult<Expr> {
        let mut expr = self.power()?;
        loop {
            let op = match self.peek().kind {
                T::Star => BinaryOp::Multiply,
                T::Slash => BinaryOp::Divide,
                T::Percent => BinaryOp::Modulo,
                _ => break,
            };
            let line = self.advance().line;
            let right = self.power()?;
            expr = Expr::Binary { left: Box::new(expr), op, right: Box::new(right), line };
        }
        Ok(expr)
    }

    /// `**` binds tighter than the other arithmetic operators and is
    /// right-associative (`2 ** 3 ** 2 == 2 ** (3 ** 2)`), parsed by
    /// recursing back into `power` on the right rather than looping.
    fn power(&mut self) -> PResult<Expr> {
        let base = self.unary()?;
        if self.matches(T::StarStar) {
            let line = self.previous().line;
            let exponent = self.power()?;
            return Ok(Expr::Binary { left: Box::new(base), op: BinaryOp::Power, right: Box::new(exponent), line });
        }
        Ok(base)
    }

    fn unary(&mut self) -> PResult<Expr> {
        let op = match self.peek().kind {
            T::Bang => Some(UnaryOp::Not),
            T::Minus => Some(UnaryOp::Negate),
            T::Tilde => Some(UnaryOp::BitwiseNot),
            _ => None,
        };
        if let Some(op) = op {
            let line = self.advance().line;
            let operand = self.unary()?;
            return Ok(Expr::Unary { op, operand: Box::new(operand), line });
        }

        if self.check(T::PlusPlus) || self.check(T::MinusMinus) {
            let op = if self.peek().kind == T::PlusPlus { IncDecOp::Increment } else { IncDecOp::Decrement };
            let line = self.advance().line;
            let target = self.unary()?;
            return Ok(Expr::PrefixIncDec { op, target: Box::new(target), line });
        }

        self.postfix()
    }

    fn postfix(&mut self) -> PResult<Expr> {
        let mut expr = self.call()?;
        loop {
            if self.check(T::PlusPlus) || self.check(T::MinusMinus) {
                let op = if self.peek().kind == T::PlusPlus { IncDecOp::Increment } else { IncDecOp::Decrement };
                let line = self.advance().line;
                expr = Expr::PostfixIncDec { op, target: Box::new(expr), line };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn call(&mut self) -> PResult<Expr> {
        let mut expr = self.primary()?;
        loop {
            if self.matches(T::LeftParen) {
                expr = self.finish_call(expr)?;
            } else if self.matches(T::Dot) {
                let line = self.previous().line;
                let name_tok = self.consume(T::Identifier, "Expected property name after '.'.")?;
                expr = Expr::Property { object: Box::new(expr), name: name_tok.lexeme.to_string(), context: ExprContext::Load, safe: false, line };
            } else if self.check(T::Question) && self.peek_next_is(T::Dot) {
                self.advance();
                self.advance();
                let line = self.previous().line;
                let name_tok = self.consume(T::Identifier, "Expected property name after '?.'.")?;
                expr = Expr::Property { object: Box::new(expr), name: name_tok.lexeme.to_string(), context: ExprContext::Load, safe: true, line };
            } else if self.matches(T::LeftBracket) {
                let line = self.previous().line;
                let index = self.expression()?;
                self.consume(T::RightBracket, "Expected ']' after subscript.")?;
                expr = Expr::Subscript { object: Box::new(expr), index: Box::new(index), context: ExprContext::Load, safe: false, line };
            } else if self.check(T::Question) && self.peek_next_is(T::LeftBracket) {
                self.advance();
                self.advance();
                let line = self.previous().line;
                let index = self.expression()?;
                self.consume(T::RightBracket, "Expected ']' after safe subscript.")?;
                expr = Expr::Subscript { object: Box::new(expr), index: Box::new(index), context: ExprContext::Load, safe: true, line };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn peek_next_is(&self, kind: T) -> bool {
        self.tokens.get(self.pos + 1).map(|t| t.kind == kind).unwrap_or(false)
    }

    fn finish_call(&mut self, callee: Expr) -> PResult<Expr> {
        let line = self.previous().line;
        let mut args = Vec::new();
        if !self.check(T::RightParen) {
            loop {
                if args.len() >= 255 {
                    self.error_at(self.peek().line, "Can't have more than 255 arguments.");
                }
                args.push(self.expression()?);
                if !self.matches(T::Comma) {
                    break;
                }
            }
        }
        self.consume(T::RightParen, "Expected ')' after arguments.")?;
        Ok(Expr::Call { callee: Box::new(callee), args, line })
    }

    fn primary(&mut self) -> PResult<Expr> {
        let tok = self.peek();
        match tok.kind {
            T::False => {
                self.advance();
                Ok(Expr::Literal(Literal::False))
            }
            T::True => {
                self.advance();
                Ok(Expr::Literal(Literal::True))
            }
            T::Nil => {
                self.advance();
                Ok(Expr::Literal(Literal::Nil))
            }
            T::Number => {
                self.advance();
                let n: f64 = tok.lexeme.parse().unwrap_or(f64::NAN);
                Ok(Expr::Literal(Literal::Number(n)))
            }
            T::String => {
                self.advance();
                self.string_literal(tok)
            }
            T::Super => {
                self.advance();
                self.consume(T::Dot, "Expected '.' after 'super'.")?;
                let method = self.consume(T::Identifier, "Expected superclass method name.")?.lexeme.to_string();
                Ok(Expr::Super { method, line: tok.line })
            }
            T::This => {
                self.advance();
                Ok(Expr::Identifier { name: "this".to_string(), context: ExprContext::Load, line: tok.line })
            }
            T::Identifier => {
                self.advance();
                Ok(Expr::Identifier { name: tok.lexeme.to_string(), context: ExprContext::Load, line: tok.line })
            }
            T::LeftParen => {
                self.advance();
                let expr = self.expression()?;
                self.consume(T::RightParen, "Expected ')' after expression.")?;
                Ok(expr)
            }
            T::LeftBracket => {
                self.advance();
                let mut items = Vec::new();
                if !self.check(T::RightBracket) {
                    loop {
                        items.push(self.expression()?);
                        if !self.matches(T::Comma) {
                            break;
                        }
                    }
                }
                self.consume(T::RightBracket, "Expected ']' after list literal.")?;
                Ok(Expr::ListLiteral { items, line: tok.line })
            }
            T::LeftBrace => {
                self.advance();
                let mut entries = Vec::new();
                if !self.check(T::RightBrace) {
                    loop {
                        let key = self.expression()?;
                        self.consume(T::Colon, "Expected ':' after map key.")?;
                        let value = self.expression()?;
                        entries.push((key, value));
                        if !self.matches(T::Comma) {
                            break;
                        }
                    }
                }
                self.consume(T::RightBrace, "Expected '}' after map literal.")?;
                Ok(Expr::MapLiteral { entries, line: tok.line })
            }
            T::Fun => {
                self.advance();
                let function = self.lambda_body()?;
                Ok(Expr::Lambda { function: Box::new(function), line: tok.line })
            }
            _ => {
                self.error_at_current("Expected expression.");
                Err(())
            }
        }
    }

    /// Splits a string literal's raw contents on `${...}` runs, recursively
    /// parsing each embedded expression with a fresh scanner/parser pair
    /// over just that substring. A literal with no `${` stays a plain
    /// [`Literal::String`]; the compiler only has to lower `Interpolated`
    /// for the cases that actually need `BUILD_STRING`.
    fn string_literal(&mut self, tok: Token<'src>) -> PResult<Expr> {
        let raw = unquote(tok.lexeme);
        if !raw.contains("${") {
            return Ok(Expr::Literal(Literal::String(raw.into_bytes())));
        }

        let bytes = raw.as_bytes();
        let mut parts = Vec::new();
        let mut literal = Vec::new();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
                if !literal.is_empty() {
                    parts.push(InterpPart::Literal(std::mem::take(&mut literal)));
                }
                i += 2;
                let start = i;
                let mut depth = 1;
                while i < bytes.len() && depth > 0 {
                    match bytes[i] {
                        b'{' => depth += 1,
                        b'}' => depth -= 1,
                        _ => {}
                    }
                    if depth > 0 {
                        i += 1;
                    }
                }
                if depth != 0 {
                    self.error_at(tok.line, "Unterminated '${' interpolation in string literal.");
                    return Err(());
                }
                let expr = self.parse_interp_expr(&raw[start..i], tok.line)?;
                i += 1; // consume closing '}'
                parts.push(InterpPart::Expr(Box::new(expr)));
            } else {
                literal.push(bytes[i]);
                i += 1;
            }
        }
        if !literal.is_empty() {
            parts.push(InterpPart::Literal(literal));
        }
        Ok(Expr::Interpolated { parts, line: tok.line })
    }

    fn parse_interp_expr(&mut self, src: &str, line: u32) -> PResult<Expr> {
        let mut scanner = Scanner::new(src);
        let mut tokens = Vec::new();
        loop {
            let t = scanner.scan_token();
            let done = t.kind == T::Eof;
            tokens.push(t);
            if done {
                break;
            }
        }
        let mut sub = Parser { tokens, pos: 0, errors: Vec::new() };
        let result = sub.expression();
        let trailing = !sub.check(T::Eof);
        self.errors.extend(sub.errors);
        match result {
            Ok(expr) => {
                if trailing {
                    self.error_at(line, "Unexpected tokens after interpolation expression.");
                }
                Ok(expr)
            }
            Err(()) => Err(()),
        }
    }

    fn lambda_body(&mut self) -> PResult<FunctionNode> {
        let line = self.peek().line;
        self.consume(T::LeftParen, "Expected '(' after 'fun'.")?;
        let mut params = Vec::new();
        if !self.check(T::RightParen) {
            loop {
                params.push(self.consume(T::Identifier, "Expected parameter name.")?.lexeme.to_string());
                if !self.matches(T::Comma) {
                    break;
                }
            }
        }
        self.consume(T::RightParen, "Expected ')' after parameters.")?;

        if self.matches(T::LeftBrace) {
            let block = self.block()?;
            return Ok(FunctionNode { params, body: FunctionBody::Block(block), line });
        }

        // Expression-bodied lambda: `fun(x) x + 1`.
        let expr = self.assignment()?;
        Ok(FunctionNode { params, body: FunctionBody::Expression(expr), line })
    }
}

fn unquote(lexeme: &str) -> String {
    lexeme.trim_matches('"').to_string()
}

/// Re-tags an assignable expression's context to `Store` after the parser
/// has already built it as a `Load` (the shape just left of `=`).
fn mark_store(expr: Expr) -> Expr {
    match expr {
        Expr::Identifier { name, line, .. } => Expr::Identifier { name, context: ExprContext::Store, line },
        Expr::Property { object, name, safe, line, .. } => {
            Expr::Property { object, name, context: ExprContext::Store, safe, line }
        }
        Expr::Subscript { object, index, safe, line, .. } => {
            Expr::Subscript { object, index, context: ExprContext::Store, safe, line }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_binary_precedence() {
        let ast = parse("1 + 2 * 3;").unwrap();
        assert_eq!(ast.body.len(), 1);
    }

    #[test]
    fn parses_class_with_superclass_and_methods() {
        let ast = parse("class B < A { init() { this.x = 1; } hi() { return 1; } }").unwrap();
        match &ast.body[0] {
            Decl::Class { name, superclass, methods, .. } => {
                assert_eq!(name, "B");
                assert_eq!(superclass.as_deref(), Some("A"));
                assert_eq!(methods.len(), 2);
            }
            _ => panic!("expected class decl"),
        }
    }

    #[test]
    fn reports_error_on_invalid_assignment_target() {
        let result = parse("1 = 2;");
        assert!(result.is_err());
    }

    #[test]
    fn parses_when_statement() {
        let ast = parse("when (x) { is 1: print 1; else: print 2; }").unwrap();
        assert_eq!(ast.body.len(), 1);
    }

    #[test]
    fn parses_interpolated_string_into_parts() {
        let ast = parse("print \"total: ${1 + 2}!\";").unwrap();
        match &ast.body[0] {
            Decl::Statement(Stmt::Print { value: Expr::Interpolated { parts, .. } }) => {
                assert_eq!(parts.len(), 3);
                assert!(matches!(&parts[0], InterpPart::Literal(b) if b == b"total: "));
                assert!(matches!(&parts[1], InterpPart::Expr(_)));
                assert!(matches!(&parts[2], InterpPart::Literal(b) if b == b"!"));
            }
            other => panic!("expected interpolated string, got {other:?}"),
        }
    }

    #[test]
    fn plain_string_without_interpolation_stays_a_literal() {
        let ast = parse("print \"hello\";").unwrap();
        assert!(matches!(
            &ast.body[0],
            Decl::Statement(Stmt::Print { value: Expr::Literal(Literal::String(_)) })
        ));
    }
}
