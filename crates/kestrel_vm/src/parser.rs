//! Recursive-descent parser
//!
//! Grammar sketch:
//!
//! ```text
//! program   := (fundef | stmt)*
//! fundef    := 'function' ident '(' params? ')' block
//! stmt      := 'if' '(' expr ')' block ('else' (block | ifstmt))?
//!            | 'while' '(' expr ')' block
//!            | 'for' '(' simple? ';' expr? ';' simple? ')' block
//!            | 'return' expr? term
//!            | 'break' term | 'continue' term
//!            | simple term
//! simple    := expr ('=' expr)?        -- lhs must be a name or name[idx]
//! term      := ';' | lookahead '}' | lookahead EOF
//! ```
//!
//! Statement terminators are semicolons, but a statement may omit the
//! semicolon when the next token closes its block, so one-liners like
//! `function f(a){ return a+1 }` parse.

use std::collections::HashMap;

use kestrel_api::ScriptError;

use crate::ast::{BinOp, Expr, ExprKind, FunDef, Loc, Program, Stmt, UnOp};
use crate::lexer::{Lexer, Tok, TokKind};

pub fn parse(source: &str, file: &str) -> Result<Program, ScriptError> {
    let toks = Lexer::new(source, file).tokenize()?;
    Parser {
        toks,
        pos: 0,
        file: file.to_string(),
    }
    .program()
}

struct Parser {
    toks: Vec<Tok>,
    pos: usize,
    file: String,
}

impl Parser {
    fn program(mut self) -> Result<Program, ScriptError> {
        let mut funs = HashMap::new();
        let mut body = Vec::new();
        while !self.at(&TokKind::Eof) {
            if self.at(&TokKind::Function) {
                let fun = self.fundef()?;
                if funs.contains_key(&fun.name) {
                    return Err(self.err_at(fun.loc, format!("duplicate function '{}'", fun.name)));
                }
                funs.insert(fun.name.clone(), fun);
            } else {
                body.push(self.stmt()?);
            }
        }
        Ok(Program {
            funs,
            body,
            file: self.file,
        })
    }

    // ------------------------------------------------------------------
    // token plumbing
    // ------------------------------------------------------------------

    fn peek(&self) -> &Tok {
        &self.toks[self.pos]
    }

    fn at(&self, kind: &TokKind) -> bool {
        &self.peek().kind == kind
    }

    fn bump(&mut self) -> Tok {
        let tok = self.toks[self.pos].clone();
        if self.pos + 1 < self.toks.len() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, kind: &TokKind) -> bool {
        if self.at(kind) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokKind, what: &str) -> Result<Tok, ScriptError> {
        if self.at(kind) {
            Ok(self.bump())
        } else {
            let tok = self.peek();
            Err(ScriptError::at(
                &self.file,
                tok.line,
                tok.col,
                format!("expected {what}"),
            ))
        }
    }

    fn loc(&self) -> Loc {
        let tok = self.peek();
        Loc {
            line: tok.line,
            col: tok.col,
        }
    }

    fn err_here(&self, msg: impl Into<String>) -> ScriptError {
        self.err_at(self.loc(), msg)
    }

    fn err_at(&self, loc: Loc, msg: impl Into<String>) -> ScriptError {
        ScriptError::at(&self.file, loc.line, loc.col, msg)
    }

    fn ident(&mut self, what: &str) -> Result<(String, Loc), ScriptError> {
        let loc = self.loc();
        match self.peek().kind.clone() {
            TokKind::Ident(name) => {
                self.bump();
                Ok((name, loc))
            }
            _ => Err(self.err_here(format!("expected {what}"))),
        }
    }

    // ------------------------------------------------------------------
    // declarations and statements
    // ------------------------------------------------------------------

    fn fundef(&mut self) -> Result<FunDef, ScriptError> {
        let loc = self.loc();
        self.expect(&TokKind::Function, "'function'")?;
        let (name, _) = self.ident("function name")?;
        self.expect(&TokKind::LParen, "'('")?;
        let mut params = Vec::new();
        if !self.at(&TokKind::RParen) {
            loop {
                let (p, ploc) = self.ident("parameter name")?;
                if params.contains(&p) {
                    return Err(self.err_at(ploc, format!("duplicate parameter '{p}'")));
                }
                params.push(p);
                if !self.eat(&TokKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokKind::RParen, "')'")?;
        let body = self.block()?;
        Ok(FunDef {
            name,
            params,
            body,
            loc,
        })
    }

    fn block(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        self.expect(&TokKind::LBrace, "'{'")?;
        let mut stmts = Vec::new();
        while !self.at(&TokKind::RBrace) {
            if self.at(&TokKind::Eof) {
                return Err(self.err_here("unclosed block"));
            }
            stmts.push(self.stmt()?);
        }
        self.bump();
        Ok(stmts)
    }

    fn stmt(&mut self) -> Result<Stmt, ScriptError> {
        match self.peek().kind {
            TokKind::If => self.if_stmt(),
            TokKind::While => {
                self.bump();
                self.expect(&TokKind::LParen, "'('")?;
                let cond = self.expr()?;
                self.expect(&TokKind::RParen, "')'")?;
                let body = self.block()?;
                Ok(Stmt::While { cond, body })
            }
            TokKind::For => self.for_stmt(),
            TokKind::Return => {
                let loc = self.loc();
                self.bump();
                let value = if self.stmt_ends() {
                    None
                } else {
                    Some(self.expr()?)
                };
                self.terminator()?;
                Ok(Stmt::Return { value, loc })
            }
            TokKind::Break => {
                let loc = self.loc();
                self.bump();
                self.terminator()?;
                Ok(Stmt::Break(loc))
            }
            TokKind::Continue => {
                let loc = self.loc();
                self.bump();
                self.terminator()?;
                Ok(Stmt::Continue(loc))
            }
            _ => {
                let stmt = self.simple_stmt()?;
                self.terminator()?;
                Ok(stmt)
            }
        }
    }

    fn if_stmt(&mut self) -> Result<Stmt, ScriptError> {
        self.expect(&TokKind::If, "'if'")?;
        self.expect(&TokKind::LParen, "'('")?;
        let cond = self.expr()?;
        self.expect(&TokKind::RParen, "')'")?;
        let then = self.block()?;
        let els = if self.eat(&TokKind::Else) {
            if self.at(&TokKind::If) {
                vec![self.if_stmt()?]
            } else {
                self.block()?
            }
        } else {
            Vec::new()
        };
        Ok(Stmt::If { cond, then, els })
    }

    fn for_stmt(&mut self) -> Result<Stmt, ScriptError> {
        self.expect(&TokKind::For, "'for'")?;
        self.expect(&TokKind::LParen, "'('")?;
        let init = if self.at(&TokKind::Semi) {
            None
        } else {
            Some(Box::new(self.simple_stmt()?))
        };
        self.expect(&TokKind::Semi, "';'")?;
        let cond = if self.at(&TokKind::Semi) {
            None
        } else {
            Some(self.expr()?)
        };
        self.expect(&TokKind::Semi, "';'")?;
        let step = if self.at(&TokKind::RParen) {
            None
        } else {
            Some(Box::new(self.simple_stmt()?))
        };
        self.expect(&TokKind::RParen, "')'")?;
        let body = self.block()?;
        Ok(Stmt::For {
            init,
            cond,
            step,
            body,
        })
    }

    /// Expression statement or assignment. Assignments are recognized by
    /// parsing a full expression and then reinterpreting it as an lvalue
    /// when '=' follows.
    fn simple_stmt(&mut self) -> Result<Stmt, ScriptError> {
        let loc = self.loc();
        let expr = self.expr()?;
        if !self.eat(&TokKind::Assign) {
            return Ok(Stmt::Expr(expr));
        }
        let value = self.expr()?;
        match expr.kind {
            ExprKind::Var(name) => Ok(Stmt::Assign { name, value, loc }),
            ExprKind::Index { name, index } => Ok(Stmt::IndexAssign {
                name,
                index: *index,
                value,
                loc,
            }),
            _ => Err(self.err_at(loc, "invalid assignment target")),
        }
    }

    fn stmt_ends(&self) -> bool {
        matches!(
            self.peek().kind,
            TokKind::Semi | TokKind::RBrace | TokKind::Eof
        )
    }

    /// Semicolon, or nothing when the statement is the last thing in its
    /// block.
    fn terminator(&mut self) -> Result<(), ScriptError> {
        if self.eat(&TokKind::Semi) {
            return Ok(());
        }
        if self.at(&TokKind::RBrace) || self.at(&TokKind::Eof) {
            return Ok(());
        }
        Err(self.err_here("expected ';'"))
    }

    // ------------------------------------------------------------------
    // expressions, lowest precedence first
    // ------------------------------------------------------------------

    fn expr(&mut self) -> Result<Expr, ScriptError> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<Expr, ScriptError> {
        let mut lhs = self.and_expr()?;
        while self.at(&TokKind::OrOr) {
            let loc = self.loc();
            self.bump();
            let rhs = self.and_expr()?;
            lhs = binary(BinOp::Or, lhs, rhs, loc);
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, ScriptError> {
        let mut lhs = self.cmp_expr()?;
        while self.at(&TokKind::AndAnd) {
            let loc = self.loc();
            self.bump();
            let rhs = self.cmp_expr()?;
            lhs = binary(BinOp::And, lhs, rhs, loc);
        }
        Ok(lhs)
    }

    fn cmp_expr(&mut self) -> Result<Expr, ScriptError> {
        let mut lhs = self.add_expr()?;
        loop {
            let op = match self.peek().kind {
                TokKind::Eq => BinOp::Eq,
                TokKind::Ne => BinOp::Ne,
                TokKind::Lt => BinOp::Lt,
                TokKind::Le => BinOp::Le,
                TokKind::Gt => BinOp::Gt,
                TokKind::Ge => BinOp::Ge,
                _ => return Ok(lhs),
            };
            let loc = self.loc();
            self.bump();
            let rhs = self.add_expr()?;
            lhs = binary(op, lhs, rhs, loc);
        }
    }

    fn add_expr(&mut self) -> Result<Expr, ScriptError> {
        let mut lhs = self.mul_expr()?;
        loop {
            let op = match self.peek().kind {
                TokKind::Plus => BinOp::Add,
                TokKind::Minus => BinOp::Sub,
                _ => return Ok(lhs),
            };
            let loc = self.loc();
            self.bump();
            let rhs = self.mul_expr()?;
            lhs = binary(op, lhs, rhs, loc);
        }
    }

    fn mul_expr(&mut self) -> Result<Expr, ScriptError> {
        let mut lhs = self.unary_expr()?;
        loop {
            let op = match self.peek().kind {
                TokKind::Star => BinOp::Mul,
                TokKind::Slash => BinOp::Div,
                TokKind::Percent => BinOp::Rem,
                _ => return Ok(lhs),
            };
            let loc = self.loc();
            self.bump();
            let rhs = self.unary_expr()?;
            lhs = binary(op, lhs, rhs, loc);
        }
    }

    fn unary_expr(&mut self) -> Result<Expr, ScriptError> {
        let op = match self.peek().kind {
            TokKind::Minus => UnOp::Neg,
            TokKind::Bang => UnOp::Not,
            _ => return self.primary(),
        };
        let loc = self.loc();
        self.bump();
        let operand = self.unary_expr()?;
        Ok(Expr {
            kind: ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            loc,
        })
    }

    fn primary(&mut self) -> Result<Expr, ScriptError> {
        let loc = self.loc();
        let kind = match self.peek().kind.clone() {
            TokKind::Int(v) => {
                self.bump();
                ExprKind::Int(v)
            }
            TokKind::Flt(v) => {
                self.bump();
                ExprKind::Flt(v)
            }
            TokKind::Str(v) => {
                self.bump();
                ExprKind::Str(v)
            }
            TokKind::Bytes(v) => {
                self.bump();
                ExprKind::Bytes(v)
            }
            TokKind::Nil => {
                self.bump();
                ExprKind::Nil
            }
            TokKind::Ident(name) => {
                self.bump();
                if self.eat(&TokKind::LParen) {
                    let mut args = Vec::new();
                    if !self.at(&TokKind::RParen) {
                        loop {
                            args.push(self.expr()?);
                            if !self.eat(&TokKind::Comma) {
                                break;
                            }
                        }
                    }
                    self.expect(&TokKind::RParen, "')'")?;
                    ExprKind::Call { name, args }
                } else if self.eat(&TokKind::LBracket) {
                    let index = self.expr()?;
                    self.expect(&TokKind::RBracket, "']'")?;
                    ExprKind::Index {
                        name,
                        index: Box::new(index),
                    }
                } else {
                    ExprKind::Var(name)
                }
            }
            TokKind::LParen => {
                self.bump();
                let inner = self.expr()?;
                self.expect(&TokKind::RParen, "')'")?;
                return Ok(inner);
            }
            _ => return Err(self.err_here("expected an expression")),
        };
        Ok(Expr { kind, loc })
    }
}

fn binary(op: BinOp, lhs: Expr, rhs: Expr, loc: Loc) -> Expr {
    Expr {
        kind: ExprKind::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        },
        loc,
    }
}
