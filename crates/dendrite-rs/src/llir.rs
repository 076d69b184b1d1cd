//! The low-level IR: loop nests over tensor cells.
//!
//! Programs at this level are what backends compile. Accesses use
//! [`AxisIndex`] arrays; loop binders are iteration symbols that inlining may
//! rename, so substitution here is capture-avoiding.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::indexing::{AxisIndex, Symbol};
use crate::precision::Precision;
use crate::tensor::Tensor;

/// Identifies a textually introduced local result. Inlining duplicates the
/// defining block, so a scope id may appear multiple times in a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(pub u32);

static SCOPE_IDS: AtomicU32 = AtomicU32::new(0);

impl ScopeId {
    pub fn fresh() -> ScopeId {
        ScopeId(SCOPE_IDS.fetch_add(1, Ordering::Relaxed))
    }
}

/// Binary scalar operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binop {
    /// Projection on the first argument (used as an overwrite accumulator).
    Arg1,
    /// Projection on the second argument.
    Arg2,
    Add,
    Mul,
    ToPowOf,
    /// `relu_gate(x, y)`: `y` where `x > 0`, else zero.
    ReluGate,
}

impl Binop {
    pub fn eval(self, a: f64, b: f64) -> f64 {
        match self {
            Binop::Arg1 => a,
            Binop::Arg2 => b,
            Binop::Add => a + b,
            Binop::Mul => a * b,
            Binop::ToPowOf => a.powf(b),
            Binop::ReluGate => {
                if a > 0.0 {
                    b
                } else {
                    0.0
                }
            }
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Binop::Arg1 => "arg1",
            Binop::Arg2 => "arg2",
            Binop::Add => "add",
            Binop::Mul => "mul",
            Binop::ToPowOf => "pow",
            Binop::ReluGate => "relu_gate",
        }
    }
}

/// Unary scalar operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unop {
    Identity,
    Relu,
}

impl Unop {
    pub fn eval(self, v: f64) -> f64 {
        match self {
            Unop::Identity => v,
            Unop::Relu => v.max(0.0),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Unop::Identity => "id",
            Unop::Relu => "relu",
        }
    }
}

/// A staged host callback filling cells from the session step and indices.
#[derive(Clone)]
pub struct SyntheticFn {
    pub name: String,
    pub f: Arc<dyn Fn(i64, &[usize]) -> f64 + Send + Sync>,
}

impl SyntheticFn {
    pub fn new(name: &str, f: impl Fn(i64, &[usize]) -> f64 + Send + Sync + 'static) -> Self {
        SyntheticFn { name: name.to_string(), f: Arc::new(f) }
    }

    pub fn call(&self, step: i64, idcs: &[usize]) -> f64 {
        (self.f)(step, idcs)
    }
}

impl fmt::Debug for SyntheticFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "synthetic({})", self.name)
    }
}

impl PartialEq for SyntheticFn {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.f, &other.f)
    }
}

/// Low-level statements.
#[derive(Debug, Clone, PartialEq)]
pub enum LlCode {
    Noop,
    Comment(String),
    Lines(Vec<LlCode>),
    For {
        index: Symbol,
        from: i64,
        to: i64,
        body: Box<LlCode>,
        /// Whether the visit analysis iterates this loop concretely.
        trace_it: bool,
    },
    /// Fast full fill of zero.
    ZeroOut(Tensor),
    Set {
        tensor: Tensor,
        idcs: Vec<AxisIndex>,
        value: LlExpr,
    },
    SetLocal(ScopeId, LlExpr),
    /// Reads `dynamic_idcs.len()` values from `tensor` at `tensor_idcs` (the
    /// last axis enumerating slots), binds them as indices clamped to
    /// `target_dims`, and runs `body`.
    DynamicIndices {
        tensor: Tensor,
        tensor_idcs: Vec<AxisIndex>,
        dynamic_idcs: Vec<Symbol>,
        target_dims: Vec<usize>,
        body: Box<LlCode>,
        slice: Option<Tensor>,
    },
    /// Load-balancing placeholder; executed as a sequential block.
    Rebalance {
        label: Option<String>,
        children: Vec<LlCode>,
    },
}

/// Low-level scalar expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum LlExpr {
    Constant(f64),
    Get(Tensor, Vec<AxisIndex>),
    GetLocal(ScopeId),
    GetGlobal(String),
    /// An inlined definition: `body` writes the scope local, whose final value
    /// is the expression's value. `orig_indices` records the access the scope
    /// replaced.
    LocalScope {
        id: ScopeId,
        precision: Precision,
        body: Box<LlCode>,
        orig_indices: Vec<AxisIndex>,
    },
    Binop(Binop, Box<LlExpr>, Box<LlExpr>),
    Unop(Unop, Box<LlExpr>),
    /// Staged host callback; only host backends may compile this.
    Synthetic { f: SyntheticFn, idcs: Vec<AxisIndex> },
}

impl LlCode {
    pub fn lines(items: Vec<LlCode>) -> LlCode {
        let mut flat = Vec::new();
        for item in items {
            match item {
                LlCode::Noop => {}
                LlCode::Lines(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => LlCode::Noop,
            1 => flat.into_iter().next().unwrap(),
            _ => LlCode::Lines(flat),
        }
    }
}

fn push_index_symbols(idcs: &[AxisIndex], out: &mut Vec<Symbol>) {
    for idx in idcs {
        idx.symbols(out);
    }
}

/// Symbols read anywhere in an expression (not counting binders).
pub fn expr_symbols(expr: &LlExpr, out: &mut Vec<Symbol>) {
    match expr {
        LlExpr::Constant(_) | LlExpr::GetLocal(_) | LlExpr::GetGlobal(_) => {}
        LlExpr::Get(_, idcs) => push_index_symbols(idcs, out),
        LlExpr::Synthetic { idcs, .. } => push_index_symbols(idcs, out),
        LlExpr::LocalScope { body, orig_indices, .. } => {
            push_index_symbols(orig_indices, out);
            code_symbols(body, out);
        }
        LlExpr::Binop(_, a, b) => {
            expr_symbols(a, out);
            expr_symbols(b, out);
        }
        LlExpr::Unop(_, a) => expr_symbols(a, out),
    }
}

/// Symbols read anywhere in a statement, including under binders.
pub fn code_symbols(code: &LlCode, out: &mut Vec<Symbol>) {
    match code {
        LlCode::Noop | LlCode::Comment(_) | LlCode::ZeroOut(_) => {}
        LlCode::Lines(items) => items.iter().for_each(|c| code_symbols(c, out)),
        LlCode::For { body, .. } => code_symbols(body, out),
        LlCode::Set { idcs, value, .. } => {
            push_index_symbols(idcs, out);
            expr_symbols(value, out);
        }
        LlCode::SetLocal(_, value) => expr_symbols(value, out),
        LlCode::DynamicIndices { tensor_idcs, body, .. } => {
            push_index_symbols(tensor_idcs, out);
            code_symbols(body, out);
        }
        LlCode::Rebalance { children, .. } => {
            children.iter().for_each(|c| code_symbols(c, out))
        }
    }
}

/// Symbols read but not bound within the statement.
pub fn free_symbols(code: &LlCode) -> HashSet<Symbol> {
    fn go_code(code: &LlCode, bound: &mut HashSet<Symbol>, free: &mut HashSet<Symbol>) {
        match code {
            LlCode::Noop | LlCode::Comment(_) | LlCode::ZeroOut(_) => {}
            LlCode::Lines(items) => items.iter().for_each(|c| go_code(c, bound, free)),
            LlCode::For { index, body, .. } => {
                let fresh = bound.insert(*index);
                go_code(body, bound, free);
                if fresh {
                    bound.remove(index);
                }
            }
            LlCode::Set { idcs, value, .. } => {
                note_idcs(idcs, bound, free);
                go_expr(value, bound, free);
            }
            LlCode::SetLocal(_, value) => go_expr(value, bound, free),
            LlCode::DynamicIndices { tensor_idcs, dynamic_idcs, body, .. } => {
                note_idcs(tensor_idcs, bound, free);
                let fresh: Vec<bool> = dynamic_idcs.iter().map(|s| bound.insert(*s)).collect();
                go_code(body, bound, free);
                for (s, was_fresh) in dynamic_idcs.iter().zip(fresh) {
                    if was_fresh {
                        bound.remove(s);
                    }
                }
            }
            LlCode::Rebalance { children, .. } => {
                children.iter().for_each(|c| go_code(c, bound, free))
            }
        }
    }
    fn go_expr(expr: &LlExpr, bound: &mut HashSet<Symbol>, free: &mut HashSet<Symbol>) {
        match expr {
            LlExpr::Constant(_) | LlExpr::GetLocal(_) | LlExpr::GetGlobal(_) => {}
            LlExpr::Get(_, idcs) | LlExpr::Synthetic { idcs, .. } => note_idcs(idcs, bound, free),
            LlExpr::LocalScope { body, orig_indices, .. } => {
                note_idcs(orig_indices, bound, free);
                go_code(body, bound, free);
            }
            LlExpr::Binop(_, a, b) => {
                go_expr(a, bound, free);
                go_expr(b, bound, free);
            }
            LlExpr::Unop(_, a) => go_expr(a, bound, free),
        }
    }
    fn note_idcs(idcs: &[AxisIndex], bound: &HashSet<Symbol>, free: &mut HashSet<Symbol>) {
        let mut symbols = Vec::new();
        push_index_symbols(idcs, &mut symbols);
        for s in symbols {
            if !bound.contains(&s) {
                free.insert(s);
            }
        }
    }
    let mut bound = HashSet::new();
    let mut free = HashSet::new();
    go_code(code, &mut bound, &mut free);
    free
}

/// Every tensor a program touches, in first-contact order.
pub fn referenced_tensors(code: &LlCode) -> Vec<Tensor> {
    fn note(t: Tensor, out: &mut Vec<Tensor>) {
        if !out.contains(&t) {
            out.push(t);
        }
    }
    fn go_expr(expr: &LlExpr, out: &mut Vec<Tensor>) {
        match expr {
            LlExpr::Constant(_) | LlExpr::GetLocal(_) | LlExpr::GetGlobal(_) => {}
            LlExpr::Get(t, _) => note(*t, out),
            LlExpr::Synthetic { .. } => {}
            LlExpr::LocalScope { body, .. } => go_code(body, out),
            LlExpr::Binop(_, a, b) => {
                go_expr(a, out);
                go_expr(b, out);
            }
            LlExpr::Unop(_, a) => go_expr(a, out),
        }
    }
    fn go_code(code: &LlCode, out: &mut Vec<Tensor>) {
        match code {
            LlCode::Noop | LlCode::Comment(_) => {}
            LlCode::Lines(items) => items.iter().for_each(|c| go_code(c, out)),
            LlCode::For { body, .. } => go_code(body, out),
            LlCode::ZeroOut(t) => note(*t, out),
            LlCode::Set { tensor, value, .. } => {
                note(*tensor, out);
                go_expr(value, out);
            }
            LlCode::SetLocal(_, value) => go_expr(value, out),
            LlCode::DynamicIndices { tensor, body, slice, .. } => {
                note(*tensor, out);
                if let Some(s) = slice {
                    note(*s, out);
                }
                go_code(body, out);
            }
            LlCode::Rebalance { children, .. } => children.iter().for_each(|c| go_code(c, out)),
        }
    }
    let mut out = Vec::new();
    go_code(code, &mut out);
    out
}

/// A substitution over symbols appearing in index positions.
pub type IndexSubst = HashMap<Symbol, AxisIndex>;

fn subst_index(idx: &AxisIndex, map: &IndexSubst) -> AxisIndex {
    match idx {
        AxisIndex::Fixed(_) => idx.clone(),
        AxisIndex::Iterator(s) => match map.get(s) {
            Some(replacement) => replacement.clone(),
            None => idx.clone(),
        },
        AxisIndex::DynamicRecipient(_) | AxisIndex::FrozenRecipient(_) => idx.clone(),
        AxisIndex::DynamicProvider { idcs, target_dims } => AxisIndex::DynamicProvider {
            idcs: idcs.iter().map(|i| subst_index(i, map)).collect(),
            target_dims: target_dims.clone(),
        },
    }
}

fn subst_idcs(idcs: &[AxisIndex], map: &IndexSubst) -> Vec<AxisIndex> {
    idcs.iter().map(|i| subst_index(i, map)).collect()
}

/// Applies `map` to free iterator occurrences; `For` binders are α-renamed to
/// fresh symbols first so repeated inlining at different call sites cannot
/// capture.
pub fn subst_code(code: &LlCode, map: &IndexSubst) -> LlCode {
    match code {
        LlCode::Noop => LlCode::Noop,
        LlCode::Comment(c) => LlCode::Comment(c.clone()),
        LlCode::Lines(items) => LlCode::Lines(items.iter().map(|c| subst_code(c, map)).collect()),
        LlCode::For { index, from, to, body, trace_it } => {
            if index.is_substitutable() {
                let fresh = Symbol::fresh();
                let mut inner = map.clone();
                inner.insert(*index, AxisIndex::Iterator(fresh));
                LlCode::For {
                    index: fresh,
                    from: *from,
                    to: *to,
                    body: Box::new(subst_code(body, &inner)),
                    trace_it: *trace_it,
                }
            } else {
                // Dedicated binders keep their identity; shadow any mapping.
                let mut inner = map.clone();
                inner.remove(index);
                LlCode::For {
                    index: *index,
                    from: *from,
                    to: *to,
                    body: Box::new(subst_code(body, &inner)),
                    trace_it: *trace_it,
                }
            }
        }
        LlCode::ZeroOut(t) => LlCode::ZeroOut(*t),
        LlCode::Set { tensor, idcs, value } => LlCode::Set {
            tensor: *tensor,
            idcs: subst_idcs(idcs, map),
            value: subst_expr(value, map),
        },
        LlCode::SetLocal(id, value) => LlCode::SetLocal(*id, subst_expr(value, map)),
        LlCode::DynamicIndices { tensor, tensor_idcs, dynamic_idcs, target_dims, body, slice } => {
            LlCode::DynamicIndices {
                tensor: *tensor,
                tensor_idcs: subst_idcs(tensor_idcs, map),
                dynamic_idcs: dynamic_idcs.clone(),
                target_dims: target_dims.clone(),
                body: Box::new(subst_code(body, map)),
                slice: *slice,
            }
        }
        LlCode::Rebalance { label, children } => LlCode::Rebalance {
            label: label.clone(),
            children: children.iter().map(|c| subst_code(c, map)).collect(),
        },
    }
}

pub fn subst_expr(expr: &LlExpr, map: &IndexSubst) -> LlExpr {
    match expr {
        LlExpr::Constant(_) | LlExpr::GetLocal(_) | LlExpr::GetGlobal(_) => expr.clone(),
        LlExpr::Get(t, idcs) => LlExpr::Get(*t, subst_idcs(idcs, map)),
        LlExpr::Synthetic { f, idcs } => {
            LlExpr::Synthetic { f: f.clone(), idcs: subst_idcs(idcs, map) }
        }
        LlExpr::LocalScope { id, precision, body, orig_indices } => LlExpr::LocalScope {
            id: *id,
            precision: *precision,
            body: Box::new(subst_code(body, map)),
            orig_indices: subst_idcs(orig_indices, map),
        },
        LlExpr::Binop(op, a, b) => {
            LlExpr::Binop(*op, Box::new(subst_expr(a, map)), Box::new(subst_expr(b, map)))
        }
        LlExpr::Unop(op, a) => LlExpr::Unop(*op, Box::new(subst_expr(a, map))),
    }
}

fn write_idcs(f: &mut fmt::Formatter<'_>, idcs: &[AxisIndex]) -> fmt::Result {
    write!(f, "[")?;
    for (n, idx) in idcs.iter().enumerate() {
        if n > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{idx}")?;
    }
    write!(f, "]")
}

impl fmt::Display for LlExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlExpr::Constant(c) => write!(f, "{c}"),
            LlExpr::Get(t, idcs) => {
                write!(f, "t{}", t.0)?;
                write_idcs(f, idcs)
            }
            LlExpr::GetLocal(id) => write!(f, "local{}", id.0),
            LlExpr::GetGlobal(name) => write!(f, "@{name}"),
            LlExpr::LocalScope { id, body, .. } => {
                write!(f, "(scope local{} {{ {} }})", id.0, BodyOneLine(body))
            }
            LlExpr::Binop(op, a, b) => write!(f, "({} {a} {b})", op.name()),
            LlExpr::Unop(op, a) => write!(f, "({} {a})", op.name()),
            LlExpr::Synthetic { f: func, idcs } => {
                write!(f, "(synthetic {}", func.name)?;
                write_idcs(f, idcs)?;
                write!(f, ")")
            }
        }
    }
}

struct BodyOneLine<'a>(&'a LlCode);

impl fmt::Display for BodyOneLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = format!("{}", self.0);
        let mut first = true;
        for line in rendered.lines() {
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "{}", line.trim())?;
            first = false;
        }
        Ok(())
    }
}

fn fmt_indented(code: &LlCode, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
    let pad = "  ".repeat(indent);
    match code {
        LlCode::Noop => writeln!(f, "{pad}noop"),
        LlCode::Comment(c) => writeln!(f, "{pad}# {c}"),
        LlCode::Lines(items) => {
            for item in items {
                fmt_indented(item, f, indent)?;
            }
            Ok(())
        }
        LlCode::For { index, from, to, body, trace_it } => {
            let marker = if *trace_it { "" } else { " (untraced)" };
            writeln!(f, "{pad}for {index} = {from} to {} {{{marker}", to - 1)?;
            fmt_indented(body, f, indent + 1)?;
            writeln!(f, "{pad}}}")
        }
        LlCode::ZeroOut(t) => writeln!(f, "{pad}zero_out t{}", t.0),
        LlCode::Set { tensor, idcs, value } => {
            write!(f, "{pad}t{}", tensor.0)?;
            write_idcs(f, idcs)?;
            writeln!(f, " := {value}")
        }
        LlCode::SetLocal(id, value) => writeln!(f, "{pad}local{} := {value}", id.0),
        LlCode::DynamicIndices { tensor, tensor_idcs, dynamic_idcs, target_dims, body, .. } => {
            write!(f, "{pad}dynamic t{}", tensor.0)?;
            write_idcs(f, tensor_idcs)?;
            write!(f, " -> (")?;
            for (n, s) in dynamic_idcs.iter().enumerate() {
                if n > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{s}")?;
            }
            writeln!(f, ") clamped to {target_dims:?} {{")?;
            fmt_indented(body, f, indent + 1)?;
            writeln!(f, "{pad}}}")
        }
        LlCode::Rebalance { label, children } => {
            writeln!(f, "{pad}rebalance {} {{", label.as_deref().unwrap_or(""))?;
            for child in children {
                fmt_indented(child, f, indent + 1)?;
            }
            writeln!(f, "{pad}}}")
        }
    }
}

impl fmt::Display for LlCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_indented(self, f, 0)
    }
}
