//! The parser: token stream to AST.
//!
//! Statements are separated by newlines or semicolons and blocks close with
//! `end`. Parsing keeps going after an error (panic-mode recovery at
//! statement boundaries) so one run reports as many diagnostics as it can.

use crate::ast::{
    Ast, BinaryOp, ExceptClause, Expr, FunDecl, LogicalOp, Stmt, UnaryOp,
};
use crate::constants::ANON_PREFIX;
use crate::errors::SyntaxError;
use crate::scanner::{Scanner, Token, TokenType};

pub fn parse(source: &str, file: &str) -> Result<Ast, Vec<SyntaxError>> {
    let mut parser = Parser::new(source, file);
    parser.advance();
    let stmts = parser.block_until(&[]);
    if parser.errors.is_empty() {
        Ok(Ast { stmts })
    } else {
        Err(parser.errors)
    }
}

// Token types that legally terminate a statement without being consumed.
const BLOCK_ENDERS: [TokenType; 6] = [
    TokenType::End,
    TokenType::Else,
    TokenType::Elif,
    TokenType::Except,
    TokenType::Ensure,
    TokenType::Eof,
];

struct Parser<'a> {
    scanner: Scanner<'a>,
    current: Token<'a>,
    previous: Token<'a>,
    errors: Vec<SyntaxError>,
    panic_mode: bool,
    file: String,
    // Monotonic count of consumed tokens; lets recovery loops prove progress.
    tokens_consumed: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str, file: &str) -> Parser<'a> {
        Parser {
            scanner: Scanner::new(source),
            current: Token::synthetic(TokenType::Eof),
            previous: Token::synthetic(TokenType::Eof),
            errors: Vec::new(),
            panic_mode: false,
            file: file.to_string(),
            tokens_consumed: 0,
        }
    }

    fn advance(&mut self) {
        self.previous = self.current;
        self.tokens_consumed += 1;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.token_type != TokenType::Error {
                break;
            }
            let message = self.current.value.to_string();
            self.error_at_current(&message);
        }
    }

    fn check(&self, token_type: TokenType) -> bool {
        self.current.token_type == token_type
    }

    fn match_token(&mut self, token_type: TokenType) -> bool {
        if !self.check(token_type) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, token_type: TokenType, message: &str) {
        if self.check(token_type) {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    fn error_at(&mut self, token: Token, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        let location = match token.token_type {
            TokenType::Eof => " at end".to_string(),
            TokenType::Newline => " at newline".to_string(),
            // The scanner already put its message in the token.
            TokenType::Error => String::new(),
            _ => format!(" at '{}'", token.value),
        };
        self.errors.push(SyntaxError {
            file: self.file.clone(),
            line: token.line,
            message: format!("Error{}: {}", location, message),
        });
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.token_type != TokenType::Eof {
            match self.current.token_type {
                TokenType::Newline | TokenType::Semicolon => {
                    self.advance();
                    return;
                }
                TokenType::Class
                | TokenType::Fun
                | TokenType::Var
                | TokenType::For
                | TokenType::If
                | TokenType::While
                | TokenType::Print
                | TokenType::Return
                | TokenType::Try
                | TokenType::Raise
                | TokenType::Import
                | TokenType::End => return,
                _ => self.advance(),
            }
        }
    }

    fn skip_separators(&mut self) {
        while self.check(TokenType::Newline) || self.check(TokenType::Semicolon) {
            self.advance();
        }
    }

    /// A statement must be followed by a separator, a block closer, or EOF.
    fn statement_end(&mut self) {
        if self.check(TokenType::Newline) || self.check(TokenType::Semicolon) {
            self.advance();
            return;
        }
        if BLOCK_ENDERS.contains(&self.current.token_type) {
            return;
        }
        self.error_at_current("Expected newline or ';' after statement.");
    }

    /// Parse declarations until one of `terminators` (or EOF). Terminators
    /// are not consumed.
    fn block_until(&mut self, terminators: &[TokenType]) -> Vec<Stmt> {
        let mut stmts = Vec::new();
        loop {
            self.skip_separators();
            if self.check(TokenType::Eof) || terminators.contains(&self.current.token_type) {
                break;
            }
            let before = self.tokens_consumed;
            if let Some(stmt) = self.declaration() {
                stmts.push(stmt);
            }
            if self.panic_mode {
                self.synchronize();
            }
            if self.tokens_consumed == before && !self.check(TokenType::Eof) {
                // Recovery stalled on a token no rule consumes; skip it.
                self.advance();
            }
        }
        stmts
    }

    fn declaration(&mut self) -> Option<Stmt> {
        let stmt = if self.match_token(TokenType::Var) {
            let decl = self.var_declaration();
            self.statement_end();
            decl
        } else if self.match_token(TokenType::Fun) {
            self.fun_declaration()
        } else if self.match_token(TokenType::Class) {
            self.class_declaration()
        } else {
            return self.statement();
        };
        Some(stmt)
    }

    fn var_declaration(&mut self) -> Stmt {
        self.consume(TokenType::Identifier, "Expected variable name.");
        let name = self.previous.value.to_string();
        let line = self.previous.line;
        let init = if self.match_token(TokenType::Equal) {
            Some(self.expression())
        } else {
            None
        };
        Stmt::Var { name, init, line }
    }

    fn fun_declaration(&mut self) -> Stmt {
        self.consume(TokenType::Identifier, "Expected function name.");
        let name = self.previous.value.to_string();
        let line = self.previous.line;
        Stmt::Fun(self.finish_function(name, line))
    }

    /// Parameter list and body; the `fun` keyword and name are already
    /// consumed.
    fn finish_function(&mut self, name: String, line: u32) -> FunDecl {
        self.consume(TokenType::LeftParen, "Expected '(' after function name.");
        let mut params = Vec::new();
        let mut vararg = false;
        if !self.check(TokenType::RightParen) {
            loop {
                if self.match_token(TokenType::Ellipsis) {
                    vararg = true;
                    break;
                }
                self.consume(TokenType::Identifier, "Expected parameter name.");
                if params.len() >= 255 {
                    self.error("Can't have more than 255 parameters.");
                }
                params.push(self.previous.value.to_string());
                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expected ')' after parameters.");
        let body = self.block_until(&[TokenType::End]);
        self.consume(TokenType::End, "Expected 'end' after function body.");
        FunDecl {
            name,
            params,
            vararg,
            body,
            line,
        }
    }

    fn class_declaration(&mut self) -> Stmt {
        self.consume(TokenType::Identifier, "Expected class name.");
        let name = self.previous.value.to_string();
        let line = self.previous.line;
        let superclass = if self.match_token(TokenType::Is) {
            Some(self.or_expr())
        } else {
            None
        };
        let mut methods = Vec::new();
        loop {
            self.skip_separators();
            if self.check(TokenType::End) || self.check(TokenType::Eof) {
                break;
            }
            if !self.match_token(TokenType::Fun) {
                self.error_at_current("Expected method declaration.");
                self.advance();
                self.synchronize();
                continue;
            }
            self.consume(TokenType::Identifier, "Expected method name.");
            let method_name = self.previous.value.to_string();
            let method_line = self.previous.line;
            methods.push(self.finish_function(method_name, method_line));
        }
        self.consume(TokenType::End, "Expected 'end' after class body.");
        Stmt::Class {
            name,
            superclass,
            methods,
            line,
        }
    }

    fn statement(&mut self) -> Option<Stmt> {
        let stmt = if self.match_token(TokenType::If) {
            self.if_statement()
        } else if self.match_token(TokenType::While) {
            self.while_statement()
        } else if self.match_token(TokenType::For) {
            self.for_statement()
        } else if self.match_token(TokenType::Try) {
            self.try_statement()
        } else if self.match_token(TokenType::Begin) {
            let line = self.previous.line;
            let body = self.block_until(&[TokenType::End]);
            self.consume(TokenType::End, "Expected 'end' after block.");
            Stmt::Block { body, line }
        } else if self.match_token(TokenType::Raise) {
            let line = self.previous.line;
            let value = self.expression();
            self.statement_end();
            Stmt::Raise { value, line }
        } else if self.match_token(TokenType::Return) {
            let line = self.previous.line;
            let value = if self.check(TokenType::Newline)
                || self.check(TokenType::Semicolon)
                || BLOCK_ENDERS.contains(&self.current.token_type)
            {
                None
            } else {
                Some(self.expression())
            };
            self.statement_end();
            Stmt::Return { value, line }
        } else if self.match_token(TokenType::Print) {
            let line = self.previous.line;
            let value = self.expression();
            self.statement_end();
            Stmt::Print { value, line }
        } else if self.match_token(TokenType::Import) {
            self.import_statement()
        } else if self.match_token(TokenType::Break) {
            let line = self.previous.line;
            self.statement_end();
            Stmt::Break { line }
        } else if self.match_token(TokenType::Continue) {
            let line = self.previous.line;
            self.statement_end();
            Stmt::Continue { line }
        } else {
            let line = self.current.line;
            let expr = self.expression();
            self.statement_end();
            Stmt::Expr { expr, line }
        };
        Some(stmt)
    }

    fn if_statement(&mut self) -> Stmt {
        let line = self.previous.line;
        let mut branches = Vec::new();
        let cond = self.expression();
        self.consume(TokenType::Then, "Expected 'then' after condition.");
        let body = self.block_until(&[TokenType::Elif, TokenType::Else, TokenType::End]);
        branches.push((cond, body));
        while self.match_token(TokenType::Elif) {
            let cond = self.expression();
            self.consume(TokenType::Then, "Expected 'then' after condition.");
            let body = self.block_until(&[TokenType::Elif, TokenType::Else, TokenType::End]);
            branches.push((cond, body));
        }
        let else_body = if self.match_token(TokenType::Else) {
            Some(self.block_until(&[TokenType::End]))
        } else {
            None
        };
        self.consume(TokenType::End, "Expected 'end' after if statement.");
        Stmt::If {
            branches,
            else_body,
            line,
        }
    }

    fn while_statement(&mut self) -> Stmt {
        let line = self.previous.line;
        let cond = self.expression();
        self.consume(TokenType::Do, "Expected 'do' after condition.");
        let body = self.block_until(&[TokenType::End]);
        self.consume(TokenType::End, "Expected 'end' after while body.");
        Stmt::While { cond, body, line }
    }

    fn for_statement(&mut self) -> Stmt {
        let line = self.previous.line;
        if self.check(TokenType::LeftParen) {
            self.c_style_for(line)
        } else {
            self.for_in(line)
        }
    }

    /// `for (init; cond; incr) stmt` or `for (...) do ... end`.
    fn c_style_for(&mut self, line: u32) -> Stmt {
        self.consume(TokenType::LeftParen, "Expected '(' after 'for'.");
        let init = if self.match_token(TokenType::Semicolon) {
            None
        } else if self.match_token(TokenType::Var) {
            let decl = self.var_declaration();
            self.consume(TokenType::Semicolon, "Expected ';' after loop initializer.");
            Some(Box::new(decl))
        } else {
            let expr_line = self.current.line;
            let expr = self.expression();
            self.consume(TokenType::Semicolon, "Expected ';' after loop initializer.");
            Some(Box::new(Stmt::Expr {
                expr,
                line: expr_line,
            }))
        };
        let cond = if self.check(TokenType::Semicolon) {
            None
        } else {
            Some(self.expression())
        };
        self.consume(TokenType::Semicolon, "Expected ';' after loop condition.");
        let incr = if self.check(TokenType::RightParen) {
            None
        } else {
            Some(self.expression())
        };
        self.consume(TokenType::RightParen, "Expected ')' after for clauses.");
        let body = if self.match_token(TokenType::Do) {
            let body = self.block_until(&[TokenType::End]);
            self.consume(TokenType::End, "Expected 'end' after for body.");
            body
        } else {
            self.skip_separators();
            self.statement().into_iter().collect()
        };
        Stmt::For {
            init,
            cond,
            incr,
            body,
            line,
        }
    }

    /// `for [var] x in iterable do ... end`.
    fn for_in(&mut self, line: u32) -> Stmt {
        self.match_token(TokenType::Var);
        self.consume(TokenType::Identifier, "Expected loop variable name.");
        let var = self.previous.value.to_string();
        self.consume(TokenType::In, "Expected 'in' after loop variable.");
        let iterable = self.expression();
        self.consume(TokenType::Do, "Expected 'do' after iterable.");
        let body = self.block_until(&[TokenType::End]);
        self.consume(TokenType::End, "Expected 'end' after for body.");
        Stmt::ForIn {
            var,
            iterable,
            body,
            line,
        }
    }

    fn try_statement(&mut self) -> Stmt {
        let line = self.previous.line;
        let body = self.block_until(&[TokenType::Except, TokenType::Ensure, TokenType::End]);
        let mut excepts = Vec::new();
        while self.match_token(TokenType::Except) {
            let clause_line = self.previous.line;
            let class = self.or_expr();
            self.consume(TokenType::Identifier, "Expected exception variable name.");
            let var = self.previous.value.to_string();
            let clause_body =
                self.block_until(&[TokenType::Except, TokenType::Ensure, TokenType::End]);
            excepts.push(ExceptClause {
                class,
                var,
                body: clause_body,
                line: clause_line,
            });
        }
        let ensure = if self.match_token(TokenType::Ensure) {
            Some(self.block_until(&[TokenType::End]))
        } else {
            None
        };
        if excepts.is_empty() && ensure.is_none() {
            self.error("Expected 'except' or 'ensure' clause.");
        }
        self.consume(TokenType::End, "Expected 'end' after try statement.");
        Stmt::Try {
            body,
            excepts,
            ensure,
            line,
        }
    }

    fn import_statement(&mut self) -> Stmt {
        let line = self.previous.line;
        self.consume(TokenType::Identifier, "Expected module name.");
        let module = self.previous.value.to_string();
        let alias = if self.match_token(TokenType::As) {
            self.consume(TokenType::Identifier, "Expected alias name.");
            Some(self.previous.value.to_string())
        } else {
            None
        };
        self.statement_end();
        Stmt::Import {
            module,
            alias,
            line,
        }
    }

    // ---- expressions ----

    fn expression(&mut self) -> Expr {
        self.assignment()
    }

    fn assignment(&mut self) -> Expr {
        let expr = self.or_expr();
        let compound = match self.current.token_type {
            TokenType::PlusEqual => Some(BinaryOp::Add),
            TokenType::MinusEqual => Some(BinaryOp::Subtract),
            TokenType::StarEqual => Some(BinaryOp::Multiply),
            TokenType::SlashEqual => Some(BinaryOp::Divide),
            TokenType::PercentEqual => Some(BinaryOp::Modulo),
            _ => None,
        };
        if self.match_token(TokenType::Equal) {
            let line = self.previous.line;
            let value = self.assignment();
            if !Parser::is_assign_target(&expr) {
                self.error("Invalid assignment target.");
            }
            return Expr::Assign {
                target: Box::new(expr),
                value: Box::new(value),
                line,
            };
        }
        if let Some(op) = compound {
            self.advance();
            let line = self.previous.line;
            let value = self.assignment();
            if !Parser::is_assign_target(&expr) {
                self.error("Invalid assignment target.");
            }
            return Expr::CompoundAssign {
                target: Box::new(expr),
                op,
                value: Box::new(value),
                line,
            };
        }
        expr
    }

    fn is_assign_target(expr: &Expr) -> bool {
        matches!(
            expr,
            Expr::Name { .. } | Expr::Field { .. } | Expr::Index { .. }
        )
    }

    fn or_expr(&mut self) -> Expr {
        let mut expr = self.and_expr();
        while self.match_token(TokenType::Or) {
            let line = self.previous.line;
            let right = self.and_expr();
            expr = Expr::Logical {
                op: LogicalOp::Or,
                left: Box::new(expr),
                right: Box::new(right),
                line,
            };
        }
        expr
    }

    fn and_expr(&mut self) -> Expr {
        let mut expr = self.equality();
        while self.match_token(TokenType::And) {
            let line = self.previous.line;
            let right = self.equality();
            expr = Expr::Logical {
                op: LogicalOp::And,
                left: Box::new(expr),
                right: Box::new(right),
                line,
            };
        }
        expr
    }

    fn equality(&mut self) -> Expr {
        let mut expr = self.comparison();
        loop {
            let op = match self.current.token_type {
                TokenType::EqualEqual => BinaryOp::Equal,
                TokenType::BangEqual => BinaryOp::NotEqual,
                _ => break,
            };
            self.advance();
            let line = self.previous.line;
            let right = self.comparison();
            expr = Expr::Binary {
                op,
                left: Box::new(expr),
                right: Box::new(right),
                line,
            };
        }
        expr
    }

    fn comparison(&mut self) -> Expr {
        let mut expr = self.term();
        loop {
            if self.match_token(TokenType::Is) {
                let line = self.previous.line;
                let class = self.term();
                expr = Expr::Is {
                    value: Box::new(expr),
                    class: Box::new(class),
                    line,
                };
                continue;
            }
            let op = match self.current.token_type {
                TokenType::Less => BinaryOp::Less,
                TokenType::LessEqual => BinaryOp::LessEqual,
                TokenType::Greater => BinaryOp::Greater,
                TokenType::GreaterEqual => BinaryOp::GreaterEqual,
                _ => break,
            };
            self.advance();
            let line = self.previous.line;
            let right = self.term();
            expr = Expr::Binary {
                op,
                left: Box::new(expr),
                right: Box::new(right),
                line,
            };
        }
        expr
    }

    fn term(&mut self) -> Expr {
        let mut expr = self.factor();
        loop {
            let op = match self.current.token_type {
                TokenType::Plus => BinaryOp::Add,
                TokenType::Minus => BinaryOp::Subtract,
                _ => break,
            };
            self.advance();
            let line = self.previous.line;
            let right = self.factor();
            expr = Expr::Binary {
                op,
                left: Box::new(expr),
                right: Box::new(right),
                line,
            };
        }
        expr
    }

    fn factor(&mut self) -> Expr {
        let mut expr = self.power();
        loop {
            let op = match self.current.token_type {
                TokenType::Star => BinaryOp::Multiply,
                TokenType::Slash => BinaryOp::Divide,
                TokenType::Percent => BinaryOp::Modulo,
                _ => break,
            };
            self.advance();
            let line = self.previous.line;
            let right = self.power();
            expr = Expr::Binary {
                op,
                left: Box::new(expr),
                right: Box::new(right),
                line,
            };
        }
        expr
    }

    fn power(&mut self) -> Expr {
        let expr = self.unary();
        if self.match_token(TokenType::Caret) {
            let line = self.previous.line;
            // Right-associative.
            let right = self.power();
            return Expr::Binary {
                op: BinaryOp::Power,
                left: Box::new(expr),
                right: Box::new(right),
                line,
            };
        }
        expr
    }

    fn unary(&mut self) -> Expr {
        let op = match self.current.token_type {
            TokenType::Minus => Some(UnaryOp::Negate),
            TokenType::Bang => Some(UnaryOp::Not),
            TokenType::Hash => Some(UnaryOp::Length),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let line = self.previous.line;
            let operand = self.unary();
            return Expr::Unary {
                op,
                operand: Box::new(operand),
                line,
            };
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Expr {
        let mut expr = self.primary();
        loop {
            if self.match_token(TokenType::LeftParen) {
                let line = self.previous.line;
                let args = self.argument_list();
                expr = Expr::Call {
                    callee: Box::new(expr),
                    args,
                    line,
                };
            } else if self.match_token(TokenType::Dot) {
                self.consume(TokenType::Identifier, "Expected attribute name after '.'.");
                let name = self.previous.value.to_string();
                let line = self.previous.line;
                expr = Expr::Field {
                    object: Box::new(expr),
                    name,
                    line,
                };
            } else if self.match_token(TokenType::LeftBracket) {
                let line = self.previous.line;
                let index = self.expression();
                self.consume(TokenType::RightBracket, "Expected ']' after subscript.");
                expr = Expr::Index {
                    object: Box::new(expr),
                    index: Box::new(index),
                    line,
                };
            } else {
                break;
            }
        }
        expr
    }

    fn argument_list(&mut self) -> Vec<Expr> {
        let mut args = Vec::new();
        if !self.check(TokenType::RightParen) {
            loop {
                if args.len() >= 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                args.push(self.expression());
                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expected ')' after arguments.");
        args
    }

    fn primary(&mut self) -> Expr {
        if self.match_token(TokenType::Number) {
            let line = self.previous.line;
            let value = self.previous.value.parse::<f64>().unwrap_or(0.0);
            return Expr::Number { value, line };
        }
        if self.match_token(TokenType::String) {
            let line = self.previous.line;
            let raw = self.previous.value;
            let value = self.unescape(&raw[1..raw.len() - 1]);
            return Expr::Str { value, line };
        }
        if self.match_token(TokenType::True) {
            return Expr::True {
                line: self.previous.line,
            };
        }
        if self.match_token(TokenType::False) {
            return Expr::False {
                line: self.previous.line,
            };
        }
        if self.match_token(TokenType::Null) {
            return Expr::Null {
                line: self.previous.line,
            };
        }
        if self.match_token(TokenType::This) {
            return Expr::This {
                line: self.previous.line,
            };
        }
        if self.match_token(TokenType::Super) {
            return self.super_expr();
        }
        if self.match_token(TokenType::Identifier) {
            return Expr::Name {
                name: self.previous.value.to_string(),
                line: self.previous.line,
            };
        }
        if self.match_token(TokenType::Fun) {
            // Anonymous function expression.
            let line = self.previous.line;
            let name = format!("{}{}", ANON_PREFIX, line);
            return Expr::Lambda(self.finish_function(name, line));
        }
        if self.match_token(TokenType::LeftBracket) {
            let line = self.previous.line;
            let mut elements = Vec::new();
            if !self.check(TokenType::RightBracket) {
                loop {
                    elements.push(self.expression());
                    if !self.match_token(TokenType::Comma) {
                        break;
                    }
                    if self.check(TokenType::RightBracket) {
                        break;
                    }
                }
            }
            self.consume(TokenType::RightBracket, "Expected ']' after list literal.");
            return Expr::ListLit { elements, line };
        }
        if self.match_token(TokenType::LeftParen) {
            return self.grouping_or_tuple();
        }

        self.error_at_current("Expected expression.");
        // Placeholder so parsing can continue collecting errors.
        Expr::Null {
            line: self.current.line,
        }
    }

    fn super_expr(&mut self) -> Expr {
        let line = self.previous.line;
        if self.match_token(TokenType::Dot) {
            self.consume(TokenType::Identifier, "Expected method name after 'super.'.");
            let name = self.previous.value.to_string();
            self.consume(TokenType::LeftParen, "Expected '(' after super method.");
            let args = self.argument_list();
            return Expr::SuperCall {
                name: Some(name),
                args,
                line,
            };
        }
        self.consume(TokenType::LeftParen, "Expected '(' or '.' after 'super'.");
        let args = self.argument_list();
        Expr::SuperCall {
            name: None,
            args,
            line,
        }
    }

    fn grouping_or_tuple(&mut self) -> Expr {
        let line = self.previous.line;
        if self.match_token(TokenType::RightParen) {
            return Expr::TupleLit {
                elements: vec![],
                line,
            };
        }
        let first = self.expression();
        if self.match_token(TokenType::Comma) {
            let mut elements = vec![first];
            if !self.check(TokenType::RightParen) {
                loop {
                    elements.push(self.expression());
                    if !self.match_token(TokenType::Comma) {
                        break;
                    }
                    if self.check(TokenType::RightParen) {
                        break;
                    }
                }
            }
            self.consume(TokenType::RightParen, "Expected ')' after tuple literal.");
            return Expr::TupleLit { elements, line };
        }
        self.consume(TokenType::RightParen, "Expected ')' after expression.");
        first
    }

    fn unescape(&mut self, raw: &str) -> String {
        let mut result = String::with_capacity(raw.len());
        let mut chars = raw.chars();
        while let Some(c) = chars.next() {
            if c != '\\' {
                result.push(c);
                continue;
            }
            match chars.next() {
                Some('n') => result.push('\n'),
                Some('t') => result.push('\t'),
                Some('r') => result.push('\r'),
                Some('0') => result.push('\0'),
                Some('"') => result.push('"'),
                Some('\\') => result.push('\\'),
                Some(other) => {
                    self.error(&format!("Invalid escape sequence '\\{}'.", other));
                    result.push(other);
                }
                None => self.error("Invalid trailing escape in string."),
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> Ast {
        parse(source, "<test>").expect("expected source to parse")
    }

    #[test]
    fn parses_var_declaration() {
        let ast = parse_ok("var x = 1 + 2");
        assert_eq!(ast.stmts.len(), 1);
        match &ast.stmts[0] {
            Stmt::Var { name, init, .. } => {
                assert_eq!(name, "x");
                assert!(matches!(init, Some(Expr::Binary { op: BinaryOp::Add, .. })));
            }
            other => panic!("unexpected stmt: {:?}", other),
        }
    }

    #[test]
    fn parses_c_style_for_with_single_statement_body() {
        let ast = parse_ok("var x = 0; for (var i = 1; i <= 10; i = i + 1) x = x + i; print x");
        assert_eq!(ast.stmts.len(), 3);
        match &ast.stmts[1] {
            Stmt::For {
                init, cond, incr, body, ..
            } => {
                assert!(init.is_some());
                assert!(cond.is_some());
                assert!(incr.is_some());
                assert_eq!(body.len(), 1);
            }
            other => panic!("unexpected stmt: {:?}", other),
        }
    }

    #[test]
    fn parses_class_with_inheritance() {
        let ast = parse_ok("class A fun greet() return \"hi\" end end; class B is A end");
        assert_eq!(ast.stmts.len(), 2);
        match &ast.stmts[0] {
            Stmt::Class { name, superclass, methods, .. } => {
                assert_eq!(name, "A");
                assert!(superclass.is_none());
                assert_eq!(methods.len(), 1);
                assert_eq!(methods[0].name, "greet");
            }
            other => panic!("unexpected stmt: {:?}", other),
        }
        match &ast.stmts[1] {
            Stmt::Class { superclass, methods, .. } => {
                assert!(superclass.is_some());
                assert!(methods.is_empty());
            }
            other => panic!("unexpected stmt: {:?}", other),
        }
    }

    #[test]
    fn parses_try_except() {
        let ast = parse_ok("try raise Exception(\"boom\") except Exception e print e._err end");
        match &ast.stmts[0] {
            Stmt::Try { body, excepts, ensure, .. } => {
                assert_eq!(body.len(), 1);
                assert_eq!(excepts.len(), 1);
                assert_eq!(excepts[0].var, "e");
                assert!(ensure.is_none());
            }
            other => panic!("unexpected stmt: {:?}", other),
        }
    }

    #[test]
    fn parses_nested_functions() {
        let ast = parse_ok(
            "fun make() var c = 0; fun inc() c = c + 1; return c end; return inc end",
        );
        match &ast.stmts[0] {
            Stmt::Fun(decl) => {
                assert_eq!(decl.name, "make");
                assert_eq!(decl.body.len(), 3);
                assert!(matches!(&decl.body[1], Stmt::Fun(inner) if inner.name == "inc"));
            }
            other => panic!("unexpected stmt: {:?}", other),
        }
    }

    #[test]
    fn parses_for_in_loop() {
        let ast = parse_ok("for x in [1, 2, 3] do print x end");
        assert!(matches!(&ast.stmts[0], Stmt::ForIn { var, .. } if var == "x"));
    }

    #[test]
    fn parses_if_elif_else() {
        let ast = parse_ok("if a then print 1 elif b then print 2 else print 3 end");
        match &ast.stmts[0] {
            Stmt::If { branches, else_body, .. } => {
                assert_eq!(branches.len(), 2);
                assert!(else_body.is_some());
            }
            other => panic!("unexpected stmt: {:?}", other),
        }
    }

    #[test]
    fn rejects_invalid_assignment_target() {
        assert!(parse("1 + 2 = 3", "<test>").is_err());
    }

    #[test]
    fn collects_multiple_errors() {
        let errors = parse("var = 1\nvar = 2", "<test>").unwrap_err();
        assert!(errors.len() >= 2);
    }

    #[test]
    fn reports_line_numbers() {
        let errors = parse("var x = 1\nvar = 2", "<test>").unwrap_err();
        assert_eq!(errors[0].line, 2);
    }

    #[test]
    fn string_escapes_are_decoded() {
        let ast = parse_ok("var s = \"a\\nb\"");
        match &ast.stmts[0] {
            Stmt::Var { init: Some(Expr::Str { value, .. }), .. } => assert_eq!(value, "a\nb"),
            other => panic!("unexpected stmt: {:?}", other),
        }
    }

    #[test]
    fn tuple_versus_grouping() {
        let ast = parse_ok("var t = (1, 2); var g = (1)");
        assert!(matches!(
            &ast.stmts[0],
            Stmt::Var { init: Some(Expr::TupleLit { elements, .. }), .. } if elements.len() == 2
        ));
        assert!(matches!(
            &ast.stmts[1],
            Stmt::Var { init: Some(Expr::Number { .. }), .. }
        ));
    }

    #[test]
    fn compound_assignment_parses() {
        let ast = parse_ok("x += 2");
        assert!(matches!(
            &ast.stmts[0],
            Stmt::Expr { expr: Expr::CompoundAssign { op: BinaryOp::Add, .. }, .. }
        ));
    }

    #[test]
    fn vararg_parameter() {
        let ast = parse_ok("fun f(a, ...) end");
        match &ast.stmts[0] {
            Stmt::Fun(decl) => {
                assert_eq!(decl.params, vec!["a".to_string()]);
                assert!(decl.vararg);
            }
            other => panic!("unexpected stmt: {:?}", other),
        }
    }
}
