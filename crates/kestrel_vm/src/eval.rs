//! Tree-walking evaluator
//!
//! Values flow through the interpreter as `RawValue` handles, each
//! carrying exactly one reference unit: evaluating an expression produces
//! a unit, consuming a value releases it. Control flow (return, break,
//! continue) and failures unwind through the `Unwind` error channel.
//!
//! Before every statement and at each loop head the pending-signal mark is
//! tested; a raised signal turns into an "interrupted by signal N" error
//! at the current location.

use std::collections::{BTreeMap, HashMap};

use kestrel_api::{DispatchSignal, DispatcherHooks, RawValue, ScriptError, TraitFlags};

use crate::ast::{BinOp, Expr, ExprKind, FunDef, Loc, Stmt, UnOp};
use crate::context::ContextInst;
use crate::engine::{GBL_ARGC, GBL_ARGV, GBL_SCRIPTNAME};
use crate::heap::{tag_of, Payload};

const MAX_CALL_DEPTH: usize = 256;

#[derive(Debug)]
enum Unwind {
    Return(RawValue),
    Break(Loc),
    Continue(Loc),
    Fail(ScriptError),
}

type Ev<T> = Result<T, Unwind>;

/// Run the program's main body. `args` populate ARGC/ARGV.
pub fn exec_main(
    ctx: &ContextInst,
    hooks: Option<DispatcherHooks>,
    args: &[String],
) -> Result<RawValue, ScriptError> {
    bind_exec_globals(ctx, args);
    let mut interp = Interp::new(ctx, hooks);
    let body = ctx.program.clone();
    match interp.run_block(&body.body) {
        Ok(()) => Ok(ctx.make(Payload::Nil)),
        Err(Unwind::Return(v)) => Ok(v),
        Err(Unwind::Break(loc)) => Err(interp.err(loc, "break outside loop")),
        Err(Unwind::Continue(loc)) => Err(interp.err(loc, "continue outside loop")),
        Err(Unwind::Fail(e)) => Err(e),
    }
}

/// Call a named script function with caller-owned argument handles; the
/// caller keeps its units.
pub fn call_function(
    ctx: &ContextInst,
    hooks: Option<DispatcherHooks>,
    name: &str,
    args: &[RawValue],
) -> Result<RawValue, ScriptError> {
    let program = ctx.program.clone();
    let Some(fun) = program.funs.get(name) else {
        return Err(ScriptError::at(
            &program.file,
            0,
            0,
            format!("undefined function '{name}'"),
        ));
    };
    for &a in args {
        ctx.retain(a);
    }
    let mut interp = Interp::new(ctx, hooks);
    match interp.call_script(fun, args.to_vec(), fun.loc) {
        Ok(v) => Ok(v),
        Err(Unwind::Fail(e)) => Err(e),
        // call_script folds the other unwind kinds into failures.
        Err(_) => Err(ScriptError::bare("internal control-flow escape")),
    }
}

fn bind_exec_globals(ctx: &ContextInst, args: &[String]) {
    let argc = ctx.make(Payload::Int(args.len() as i64));
    ctx.set_global_unit(GBL_ARGC, argc)
        .expect("builtin global slot");
    let items: Vec<Option<RawValue>> = args
        .iter()
        .map(|a| Some(ctx.make(Payload::Str(a.clone()))))
        .collect();
    let argv = ctx.make(Payload::Arr(items));
    ctx.set_global_unit(GBL_ARGV, argv)
        .expect("builtin global slot");
    let name = ctx.make(Payload::Str(ctx.program.file.clone()));
    ctx.set_global_unit(GBL_SCRIPTNAME, name)
        .expect("builtin global slot");
}

struct Interp<'a> {
    ctx: &'a ContextInst,
    hooks: Option<DispatcherHooks>,
    scopes: Vec<HashMap<String, RawValue>>,
    depth: usize,
    file: String,
    strict_vars: bool,
    float_div: bool,
}

impl<'a> Interp<'a> {
    fn new(ctx: &'a ContextInst, hooks: Option<DispatcherHooks>) -> Self {
        let traits = *ctx.engine.traits.lock().unwrap();
        Self {
            ctx,
            hooks,
            scopes: Vec::new(),
            depth: 0,
            file: ctx.program.file.clone(),
            strict_vars: traits.contains(TraitFlags::STRICT_VARS),
            float_div: traits.contains(TraitFlags::FLOAT_DIV),
        }
    }

    fn err(&self, loc: Loc, msg: impl Into<String>) -> ScriptError {
        ScriptError::at(&self.file, loc.line, loc.col, msg)
    }

    fn fail<T>(&self, loc: Loc, msg: impl Into<String>) -> Ev<T> {
        Err(Unwind::Fail(self.err(loc, msg)))
    }

    fn checkpoint(&self, loc: Loc) -> Ev<()> {
        if let Some(signo) = self.ctx.take_signal() {
            return self.fail(loc, format!("interrupted by signal {signo}"));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // statements
    // ------------------------------------------------------------------

    fn run_block(&mut self, stmts: &[Stmt]) -> Ev<()> {
        for stmt in stmts {
            self.exec_stmt(stmt)?;
        }
        Ok(())
    }

    fn exec_stmt(&mut self, stmt: &Stmt) -> Ev<()> {
        self.checkpoint(stmt_loc(stmt))?;
        match stmt {
            Stmt::Expr(e) => {
                let v = self.eval(e)?;
                self.ctx.release(v);
                Ok(())
            }
            Stmt::Assign { name, value, .. } => {
                let v = self.eval(value)?;
                self.assign(name, v);
                Ok(())
            }
            Stmt::IndexAssign {
                name,
                index,
                value,
                loc,
            } => {
                let idx = self.eval(index)?;
                let val = match self.eval(value) {
                    Ok(v) => v,
                    Err(u) => {
                        self.ctx.release(idx);
                        return Err(u);
                    }
                };
                self.index_store(name, idx, val, *loc)
            }
            Stmt::If { cond, then, els } => {
                if self.eval_truthy(cond)? {
                    self.run_block(then)
                } else {
                    self.run_block(els)
                }
            }
            Stmt::While { cond, body } => {
                loop {
                    self.checkpoint(cond.loc)?;
                    if !self.eval_truthy(cond)? {
                        break;
                    }
                    match self.run_block(body) {
                        Ok(()) | Err(Unwind::Continue(_)) => {}
                        Err(Unwind::Break(_)) => break,
                        Err(u) => return Err(u),
                    }
                }
                Ok(())
            }
            Stmt::For {
                init,
                cond,
                step,
                body,
            } => {
                let head = cond
                    .as_ref()
                    .map(|c| c.loc)
                    .unwrap_or_else(|| stmt_loc(stmt));
                if let Some(init) = init {
                    self.exec_stmt(init)?;
                }
                loop {
                    self.checkpoint(head)?;
                    if let Some(cond) = cond {
                        if !self.eval_truthy(cond)? {
                            break;
                        }
                    }
                    match self.run_block(body) {
                        Ok(()) | Err(Unwind::Continue(_)) => {}
                        Err(Unwind::Break(_)) => break,
                        Err(u) => return Err(u),
                    }
                    if let Some(step) = step {
                        self.exec_stmt(step)?;
                    }
                }
                Ok(())
            }
            Stmt::Return { value, .. } => {
                let v = match value {
                    Some(e) => self.eval(e)?,
                    None => self.ctx.make(Payload::Nil),
                };
                Err(Unwind::Return(v))
            }
            Stmt::Break(loc) => Err(Unwind::Break(*loc)),
            Stmt::Continue(loc) => Err(Unwind::Continue(*loc)),
        }
    }

    // ------------------------------------------------------------------
    // expressions
    // ------------------------------------------------------------------

    fn eval(&mut self, e: &Expr) -> Ev<RawValue> {
        match &e.kind {
            ExprKind::Nil => Ok(self.ctx.make(Payload::Nil)),
            ExprKind::Int(v) => Ok(self.ctx.make(Payload::Int(*v))),
            ExprKind::Flt(v) => Ok(self.ctx.make(Payload::Flt(*v))),
            ExprKind::Str(v) => Ok(self.ctx.make(Payload::Str(v.clone()))),
            ExprKind::Bytes(v) => Ok(self.ctx.make(Payload::Bytes(v.clone()))),
            ExprKind::Var(name) => self.lookup(name, e.loc),
            ExprKind::Index { name, index } => self.index_load(name, index, e.loc),
            ExprKind::Call { name, args } => {
                let mut argv = Vec::with_capacity(args.len());
                for a in args {
                    match self.eval(a) {
                        Ok(v) => argv.push(v),
                        Err(u) => {
                            for v in argv {
                                self.ctx.release(v);
                            }
                            return Err(u);
                        }
                    }
                }
                self.call(name, argv, e.loc)
            }
            ExprKind::Unary { op, operand } => {
                let v = self.eval(operand)?;
                self.apply_unary(*op, v, e.loc)
            }
            ExprKind::Binary { op, lhs, rhs } => match op {
                BinOp::And | BinOp::Or => {
                    let l = self.eval_truthy(lhs)?;
                    let decided = match op {
                        BinOp::And => !l,
                        _ => l,
                    };
                    let out = if decided { l } else { self.eval_truthy(rhs)? };
                    Ok(self.ctx.make(Payload::Int(out as i64)))
                }
                _ => {
                    let l = self.eval(lhs)?;
                    let r = match self.eval(rhs) {
                        Ok(r) => r,
                        Err(u) => {
                            self.ctx.release(l);
                            return Err(u);
                        }
                    };
                    self.apply_binary(*op, l, r, e.loc)
                }
            },
        }
    }

    fn eval_truthy(&mut self, e: &Expr) -> Ev<bool> {
        let v = self.eval(e)?;
        let t = self.truthy(v);
        self.ctx.release(v);
        Ok(t)
    }

    fn truthy(&self, h: RawValue) -> bool {
        let heap = self.ctx.heap.lock().unwrap();
        match heap.payload(h) {
            Payload::Nil => false,
            Payload::Int(v) => *v != 0,
            Payload::Flt(v) => *v != 0.0,
            Payload::Str(s) => !s.is_empty(),
            Payload::Bytes(b) => !b.is_empty(),
            Payload::Arr(_) | Payload::Map(_) | Payload::Fun(_) => true,
        }
    }

    fn apply_unary(&mut self, op: UnOp, v: RawValue, loc: Loc) -> Ev<RawValue> {
        match op {
            UnOp::Not => {
                let t = self.truthy(v);
                self.ctx.release(v);
                Ok(self.ctx.make(Payload::Int(!t as i64)))
            }
            UnOp::Neg => {
                let outcome = {
                    let heap = self.ctx.heap.lock().unwrap();
                    match heap.payload(v) {
                        Payload::Int(n) => Ok(Payload::Int(n.wrapping_neg())),
                        Payload::Flt(f) => Ok(Payload::Flt(-f)),
                        other => Err(format!("cannot negate {}", tag_of(other))),
                    }
                };
                self.ctx.release(v);
                match outcome {
                    Ok(p) => Ok(self.ctx.make(p)),
                    Err(msg) => self.fail(loc, msg),
                }
            }
        }
    }

    fn apply_binary(&mut self, op: BinOp, l: RawValue, r: RawValue, loc: Loc) -> Ev<RawValue> {
        let outcome = {
            let heap = self.ctx.heap.lock().unwrap();
            match op {
                BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                    compare_payloads(op, heap.payload(l), heap.payload(r), l == r)
                        .map(|b| Payload::Int(b as i64))
                }
                _ => arith_payloads(op, heap.payload(l), heap.payload(r), self.float_div),
            }
        };
        self.ctx.release(l);
        self.ctx.release(r);
        match outcome {
            Ok(p) => Ok(self.ctx.make(p)),
            Err(msg) => self.fail(loc, msg),
        }
    }

    // ------------------------------------------------------------------
    // variables
    // ------------------------------------------------------------------

    /// Read a variable (+1): innermost function scope, then declared
    /// globals, then named variables.
    fn lookup(&mut self, name: &str, loc: Loc) -> Ev<RawValue> {
        if let Some(scope) = self.scopes.last() {
            if let Some(&h) = scope.get(name) {
                self.ctx.retain(h);
                return Ok(h);
            }
        }
        if let Some(index) = self.ctx.engine.global_index(name) {
            return Ok(self
                .ctx
                .global_unit(index)
                .expect("engine global table and context bindings agree"));
        }
        if let Some(h) = self.ctx.named_unit(name) {
            return Ok(h);
        }
        if self.strict_vars {
            return self.fail(loc, format!("undefined variable '{name}'"));
        }
        Ok(self.ctx.make(Payload::Nil))
    }

    /// Like `lookup`, but silent: used by writes that may create the
    /// variable.
    fn lookup_opt(&mut self, name: &str) -> Option<RawValue> {
        if let Some(scope) = self.scopes.last() {
            if let Some(&h) = scope.get(name) {
                self.ctx.retain(h);
                return Some(h);
            }
        }
        if let Some(index) = self.ctx.engine.global_index(name) {
            return self.ctx.global_unit(index);
        }
        self.ctx.named_unit(name)
    }

    /// Bind a variable, taking over the caller's unit. Function
    /// parameters are the only locals; other names resolve to globals or
    /// named variables.
    fn assign(&mut self, name: &str, value: RawValue) {
        if let Some(scope) = self.scopes.last_mut() {
            if let Some(slot) = scope.get_mut(name) {
                let old = std::mem::replace(slot, value);
                self.ctx.release(old);
                return;
            }
        }
        if let Some(index) = self.ctx.engine.global_index(name) {
            self.ctx
                .set_global_unit(index, value)
                .expect("engine global table and context bindings agree");
            return;
        }
        self.ctx.set_named_unit(name, value);
    }

    // ------------------------------------------------------------------
    // container access
    // ------------------------------------------------------------------

    fn index_key(&self, idx: RawValue, loc: Loc) -> Ev<IndexKey> {
        let key = {
            let heap = self.ctx.heap.lock().unwrap();
            match heap.payload(idx) {
                Payload::Int(i) => Ok(IndexKey::Pos(*i)),
                Payload::Str(s) => Ok(IndexKey::Name(s.clone())),
                other => Err(format!("index must be int or str, not {}", tag_of(other))),
            }
        };
        self.ctx.release(idx);
        match key {
            Ok(k) => Ok(k),
            Err(msg) => self.fail(loc, msg),
        }
    }

    fn index_load(&mut self, name: &str, index: &Expr, loc: Loc) -> Ev<RawValue> {
        let idx = self.eval(index)?;
        let key = self.index_key(idx, loc)?;
        let Some(container) = self.lookup_opt(name) else {
            if self.strict_vars {
                return self.fail(loc, format!("undefined variable '{name}'"));
            }
            return Ok(self.ctx.make(Payload::Nil));
        };
        let outcome = {
            let heap = self.ctx.heap.lock().unwrap();
            match (heap.payload(container), &key) {
                (Payload::Nil, _) => Ok(None),
                (Payload::Arr(items), IndexKey::Pos(i)) => {
                    if *i < 0 {
                        Err(format!("array index {i} out of range"))
                    } else {
                        Ok(items.get(*i as usize).copied().flatten())
                    }
                }
                (Payload::Map(fields), IndexKey::Name(k)) => Ok(fields.get(k).copied()),
                (Payload::Arr(_), IndexKey::Name(_)) => {
                    Err("cannot index arr with str".to_string())
                }
                (Payload::Map(_), IndexKey::Pos(_)) => {
                    Err("cannot index map with int".to_string())
                }
                (other, _) => Err(format!("value of type {} is not indexable", tag_of(other))),
            }
        };
        self.ctx.release(container);
        match outcome {
            Ok(Some(h)) => {
                self.ctx.retain(h);
                Ok(h)
            }
            Ok(None) => Ok(self.ctx.make(Payload::Nil)),
            Err(msg) => self.fail(loc, msg),
        }
    }

    /// `name[idx] = val`. Consumes both units; creates the container on
    /// first write (array for int keys, map for string keys).
    fn index_store(&mut self, name: &str, idx: RawValue, val: RawValue, loc: Loc) -> Ev<()> {
        let key = match self.index_key(idx, loc) {
            Ok(k) => k,
            Err(u) => {
                self.ctx.release(val);
                return Err(u);
            }
        };

        let container = match self.lookup_opt(name) {
            Some(h) => {
                let is_nil = {
                    let heap = self.ctx.heap.lock().unwrap();
                    matches!(heap.payload(h), Payload::Nil)
                };
                if is_nil {
                    self.ctx.release(h);
                    None
                } else {
                    Some(h)
                }
            }
            None => None,
        };
        let container = match container {
            Some(h) => h,
            None => {
                let fresh = self.ctx.make(match key {
                    IndexKey::Pos(_) => Payload::Arr(Vec::new()),
                    IndexKey::Name(_) => Payload::Map(BTreeMap::new()),
                });
                // One unit binds the variable, one stays with us.
                self.ctx.retain(fresh);
                self.assign(name, fresh);
                fresh
            }
        };

        let outcome: Result<Option<RawValue>, String> = {
            let mut heap = self.ctx.heap.lock().unwrap();
            match (heap.payload_mut(container), &key) {
                (Payload::Arr(items), IndexKey::Pos(i)) => {
                    if *i < 0 {
                        Err(format!("array index {i} out of range"))
                    } else {
                        let at = *i as usize;
                        if at >= items.len() {
                            items.resize(at + 1, None);
                        }
                        Ok(items[at].replace(val))
                    }
                }
                (Payload::Map(fields), IndexKey::Name(k)) => Ok(fields.insert(k.clone(), val)),
                (Payload::Arr(_), IndexKey::Name(_)) => {
                    Err("cannot index arr with str".to_string())
                }
                (Payload::Map(_), IndexKey::Pos(_)) => {
                    Err("cannot index map with int".to_string())
                }
                (other, _) => Err(format!("value of type {} is not indexable", tag_of(other))),
            }
        };
        self.ctx.release(container);
        match outcome {
            Ok(displaced) => {
                if let Some(old) = displaced {
                    self.ctx.release(old);
                }
                Ok(())
            }
            Err(msg) => {
                self.ctx.release(val);
                self.fail(loc, msg)
            }
        }
    }

    // ------------------------------------------------------------------
    // calls
    // ------------------------------------------------------------------

    /// Resolution order: script functions, registered host functions,
    /// builtins.
    fn call(&mut self, name: &str, args: Vec<RawValue>, loc: Loc) -> Ev<RawValue> {
        let program = self.ctx.program.clone();
        if let Some(fun) = program.funs.get(name) {
            return self.call_script(fun, args, loc);
        }
        if let Some(def) = self.ctx.engine.host_fn(name) {
            let arity = args.len();
            if arity < def.min_args || arity > def.max_args {
                self.release_all(args);
                return self.fail(
                    loc,
                    format!(
                        "host function '{name}' takes {}..{} arguments, got {arity}",
                        def.min_args, def.max_args
                    ),
                );
            }
            return self.call_host(name, args, loc);
        }
        self.call_builtin(name, args, loc)
    }

    fn call_script(&mut self, fun: &FunDef, args: Vec<RawValue>, loc: Loc) -> Ev<RawValue> {
        if args.len() > fun.params.len() {
            self.release_all(args);
            return self.fail(loc, format!("too many arguments to '{}'", fun.name));
        }
        if self.depth >= MAX_CALL_DEPTH {
            self.release_all(args);
            return self.fail(loc, "call depth exceeded");
        }
        let mut scope = HashMap::with_capacity(fun.params.len());
        let mut supplied = args.into_iter();
        for param in &fun.params {
            let v = supplied
                .next()
                .unwrap_or_else(|| self.ctx.make(Payload::Nil));
            scope.insert(param.clone(), v);
        }
        self.scopes.push(scope);
        self.depth += 1;
        let out = self.run_block(&fun.body);
        self.depth -= 1;
        let scope = self.scopes.pop().expect("scope pushed above");
        for (_, v) in scope {
            self.ctx.release(v);
        }
        match out {
            Ok(()) => Ok(self.ctx.make(Payload::Nil)),
            Err(Unwind::Return(v)) => Ok(v),
            Err(Unwind::Break(l)) => self.fail(l, "break outside loop"),
            Err(Unwind::Continue(l)) => self.fail(l, "continue outside loop"),
            Err(u) => Err(u),
        }
    }

    fn call_host(&mut self, name: &str, args: Vec<RawValue>, loc: Loc) -> Ev<RawValue> {
        let Some(hooks) = self.hooks else {
            self.release_all(args);
            return self.fail(loc, format!("no dispatcher installed for '{name}'"));
        };
        let Some(ctx_ext) = *self.ctx.ext.lock().unwrap() else {
            self.release_all(args);
            return self.fail(loc, format!("context has no extension data for '{name}'"));
        };
        let Some(eng_ext) = *self.ctx.engine.ext.lock().unwrap() else {
            self.release_all(args);
            return self.fail(loc, format!("engine has no extension data for '{name}'"));
        };
        self.ctx.push_frame(args);
        let signal = (hooks.on_host_call)(eng_ext, ctx_ext, name);
        let ret = self.ctx.pop_frame();
        match signal {
            DispatchSignal::Handled => {
                Ok(ret.unwrap_or_else(|| self.ctx.make(Payload::Nil)))
            }
            DispatchSignal::Fail => {
                if let Some(r) = ret {
                    self.ctx.release(r);
                }
                let msg = self
                    .ctx
                    .take_host_error()
                    .unwrap_or_else(|| format!("host function '{name}' failed"));
                self.fail(loc, msg)
            }
        }
    }

    fn call_builtin(&mut self, name: &str, args: Vec<RawValue>, loc: Loc) -> Ev<RawValue> {
        match name {
            "print" => {
                let mut text = String::new();
                {
                    let heap = self.ctx.heap.lock().unwrap();
                    for (i, &a) in args.iter().enumerate() {
                        if i > 0 {
                            text.push(' ');
                        }
                        text.push_str(&heap.display(a));
                    }
                }
                text.push('\n');
                self.ctx.write_output(&text);
                self.release_all(args);
                Ok(self.ctx.make(Payload::Nil))
            }
            "len" => {
                let [v] = self.fixed_args::<1>(name, args, loc)?;
                let outcome = self.ctx.heap.lock().unwrap().length(v);
                self.ctx.release(v);
                match outcome {
                    Ok(n) => Ok(self.ctx.make(Payload::Int(n as i64))),
                    Err(msg) => self.fail(loc, msg),
                }
            }
            "typename" => {
                let [v] = self.fixed_args::<1>(name, args, loc)?;
                let tag = {
                    let heap = self.ctx.heap.lock().unwrap();
                    tag_of(heap.payload(v))
                };
                self.ctx.release(v);
                Ok(self.ctx.make(Payload::Str(tag.to_string())))
            }
            "int" => {
                let [v] = self.fixed_args::<1>(name, args, loc)?;
                let outcome = self.ctx.heap.lock().unwrap().coerce_int(v);
                self.ctx.release(v);
                match outcome {
                    Ok(n) => Ok(self.ctx.make(Payload::Int(n))),
                    Err(msg) => self.fail(loc, msg),
                }
            }
            "flt" => {
                let [v] = self.fixed_args::<1>(name, args, loc)?;
                let outcome = self.ctx.heap.lock().unwrap().coerce_flt(v);
                self.ctx.release(v);
                match outcome {
                    Ok(n) => Ok(self.ctx.make(Payload::Flt(n))),
                    Err(msg) => self.fail(loc, msg),
                }
            }
            "str" => {
                let [v] = self.fixed_args::<1>(name, args, loc)?;
                let outcome = self.ctx.heap.lock().unwrap().coerce_str(v);
                self.ctx.release(v);
                match outcome {
                    Ok(s) => Ok(self.ctx.make(Payload::Str(s))),
                    Err(msg) => self.fail(loc, msg),
                }
            }
            "signal_watch" | "signal_ignore" => {
                let [v] = self.fixed_args::<1>(name, args, loc)?;
                let outcome = self.ctx.heap.lock().unwrap().coerce_int(v);
                self.ctx.release(v);
                let signo = match outcome {
                    Ok(n) => n as i32,
                    Err(msg) => return self.fail(loc, msg),
                };
                if let (Some(hooks), Some(ext)) = (self.hooks, *self.ctx.ext.lock().unwrap()) {
                    (hooks.on_sigset)(ext, signo, name == "signal_ignore");
                }
                Ok(self.ctx.make(Payload::Nil))
            }
            _ => {
                self.release_all(args);
                self.fail(loc, format!("undefined function '{name}'"))
            }
        }
    }

    fn fixed_args<const N: usize>(
        &mut self,
        name: &str,
        args: Vec<RawValue>,
        loc: Loc,
    ) -> Ev<[RawValue; N]> {
        match <[RawValue; N]>::try_from(args) {
            Ok(arr) => Ok(arr),
            Err(args) => {
                let got = args.len();
                self.release_all(args);
                self.fail(loc, format!("{name} takes {N} argument(s), got {got}"))
            }
        }
    }

    fn release_all(&self, args: Vec<RawValue>) {
        for v in args {
            self.ctx.release(v);
        }
    }
}

enum IndexKey {
    Pos(i64),
    Name(String),
}

fn stmt_loc(stmt: &Stmt) -> Loc {
    match stmt {
        Stmt::Expr(e) => e.loc,
        Stmt::Assign { loc, .. }
        | Stmt::IndexAssign { loc, .. }
        | Stmt::Return { loc, .. } => *loc,
        Stmt::Break(loc) | Stmt::Continue(loc) => *loc,
        Stmt::If { cond, .. } | Stmt::While { cond, .. } => cond.loc,
        Stmt::For {
            init,
            cond,
            step,
            body,
        } => init
            .as_deref()
            .map(stmt_loc)
            .or_else(|| cond.as_ref().map(|c| c.loc))
            .or_else(|| step.as_deref().map(stmt_loc))
            .or_else(|| body.first().map(stmt_loc))
            .unwrap_or(Loc { line: 0, col: 0 }),
    }
}

// ----------------------------------------------------------------------
// payload-level operators
// ----------------------------------------------------------------------

fn arith_payloads(
    op: BinOp,
    l: &Payload,
    r: &Payload,
    float_div: bool,
) -> Result<Payload, String> {
    use Payload::*;

    // String concatenation: '+' with a string on either side stringifies
    // the other operand.
    if op == BinOp::Add {
        match (l, r) {
            (Str(a), Str(b)) => return Ok(Str(format!("{a}{b}"))),
            (Str(a), b @ (Nil | Int(_) | Flt(_) | Bytes(_))) => {
                return Ok(Str(format!("{a}{}", scalar_text(b))))
            }
            (a @ (Nil | Int(_) | Flt(_) | Bytes(_)), Str(b)) => {
                return Ok(Str(format!("{}{b}", scalar_text(a))))
            }
            (Bytes(a), Bytes(b)) => {
                let mut out = a.clone();
                out.extend_from_slice(b);
                return Ok(Bytes(out));
            }
            _ => {}
        }
    }

    match (l, r) {
        (Int(a), Int(b)) => match op {
            BinOp::Add => Ok(Int(a.wrapping_add(*b))),
            BinOp::Sub => Ok(Int(a.wrapping_sub(*b))),
            BinOp::Mul => Ok(Int(a.wrapping_mul(*b))),
            BinOp::Div => {
                if *b == 0 {
                    Err("division by zero".to_string())
                } else if float_div {
                    Ok(Flt(*a as f64 / *b as f64))
                } else {
                    Ok(Int(a.wrapping_div(*b)))
                }
            }
            BinOp::Rem => {
                if *b == 0 {
                    Err("division by zero".to_string())
                } else {
                    Ok(Int(a.wrapping_rem(*b)))
                }
            }
            _ => unreachable!("comparison handled separately"),
        },
        (Int(_) | Flt(_), Int(_) | Flt(_)) => {
            let a = as_f64(l);
            let b = as_f64(r);
            match op {
                BinOp::Add => Ok(Flt(a + b)),
                BinOp::Sub => Ok(Flt(a - b)),
                BinOp::Mul => Ok(Flt(a * b)),
                BinOp::Div => Ok(Flt(a / b)),
                BinOp::Rem => Ok(Flt(a % b)),
                _ => unreachable!("comparison handled separately"),
            }
        }
        _ => Err(format!(
            "cannot apply '{}' to {} and {}",
            op.symbol(),
            tag_of(l),
            tag_of(r)
        )),
    }
}

fn compare_payloads(
    op: BinOp,
    l: &Payload,
    r: &Payload,
    same_cell: bool,
) -> Result<bool, String> {
    use std::cmp::Ordering;
    use Payload::*;

    let ord: Option<Ordering> = match (l, r) {
        (Nil, Nil) => Some(Ordering::Equal),
        (Int(a), Int(b)) => Some(a.cmp(b)),
        (Int(_) | Flt(_), Int(_) | Flt(_)) => as_f64(l).partial_cmp(&as_f64(r)),
        (Str(a), Str(b)) => Some(a.cmp(b)),
        (Bytes(a), Bytes(b)) => Some(a.cmp(b)),
        (Arr(_), Arr(_)) | (Map(_), Map(_)) => {
            // Container comparison is identity.
            return match op {
                BinOp::Eq => Ok(same_cell),
                BinOp::Ne => Ok(!same_cell),
                _ => Err(format!(
                    "cannot order {} and {}",
                    tag_of(l),
                    tag_of(r)
                )),
            };
        }
        _ => None,
    };

    match (ord, op) {
        (None, BinOp::Eq) => Ok(false),
        (None, BinOp::Ne) => Ok(true),
        (None, _) => Err(format!("cannot compare {} with {}", tag_of(l), tag_of(r))),
        (Some(ord), BinOp::Eq) => Ok(ord == Ordering::Equal),
        (Some(ord), BinOp::Ne) => Ok(ord != Ordering::Equal),
        (Some(ord), BinOp::Lt) => Ok(ord == Ordering::Less),
        (Some(ord), BinOp::Le) => Ok(ord != Ordering::Greater),
        (Some(ord), BinOp::Gt) => Ok(ord == Ordering::Greater),
        (Some(ord), BinOp::Ge) => Ok(ord != Ordering::Less),
        _ => unreachable!("arithmetic handled separately"),
    }
}

fn as_f64(p: &Payload) -> f64 {
    match p {
        Payload::Int(v) => *v as f64,
        Payload::Flt(v) => *v,
        _ => 0.0,
    }
}

/// Scalar-to-text used by string concatenation; nil contributes nothing.
fn scalar_text(p: &Payload) -> String {
    match p {
        Payload::Nil => String::new(),
        Payload::Int(v) => v.to_string(),
        Payload::Flt(v) => v.to_string(),
        Payload::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        Payload::Str(s) => s.clone(),
        _ => String::new(),
    }
}
