//! Virtualization: inlining tensor definitions at their read sites.
//!
//! A candidate's defining statements are replayed inside a local scope at
//! each read, with the written indices substituted by the reader's index
//! expressions and contraction loops α-renamed. A definition referencing an
//! iterator it does not bind itself (and that is not a dedicated axis) fails
//! escape analysis and stays materialized.

use std::collections::{HashMap, HashSet};

use crate::indexing::{AxisIndex, Symbol};
use crate::llir::{
    self, code_symbols, expr_symbols, IndexSubst, LlCode, LlExpr, ScopeId,
};
use crate::tensor::{MemoryMode, Tensor};

use super::{OptimizeSettings, TracedTensor};

#[derive(Debug, Clone, Copy, PartialEq)]
struct Frame {
    index: Symbol,
    from: i64,
    to: i64,
}

#[derive(Debug, Clone)]
enum Stmt {
    Zero,
    Set(Vec<AxisIndex>, LlExpr),
}

#[derive(Debug, Clone, Default)]
struct Computation {
    stmts: Vec<(Vec<Frame>, Stmt)>,
    /// Some write sits under dynamic-provider indices.
    under_dynamic: bool,
}

#[derive(Debug, Clone)]
struct UseSite {
    idcs: Vec<AxisIndex>,
}

/// Collects per-tensor definitions and read sites.
struct Collector {
    stack: Vec<Frame>,
    dynamic_depth: usize,
    computations: HashMap<Tensor, Computation>,
    uses: HashMap<Tensor, Vec<UseSite>>,
}

impl Collector {
    fn note_use(&mut self, t: Tensor, idcs: &[AxisIndex]) {
        self.uses.entry(t).or_default().push(UseSite { idcs: idcs.to_vec() });
    }

    fn walk_expr(&mut self, expr: &LlExpr) {
        match expr {
            LlExpr::Constant(_) | LlExpr::GetLocal(_) | LlExpr::GetGlobal(_) => {}
            LlExpr::Get(t, idcs) => self.note_use(*t, idcs),
            LlExpr::Synthetic { .. } => {}
            LlExpr::LocalScope { body, .. } => self.walk_code(body),
            LlExpr::Binop(_, a, b) => {
                self.walk_expr(a);
                self.walk_expr(b);
            }
            LlExpr::Unop(_, a) => self.walk_expr(a),
        }
    }

    fn walk_code(&mut self, code: &LlCode) {
        match code {
            LlCode::Noop | LlCode::Comment(_) => {}
            LlCode::Lines(items) => items.iter().for_each(|c| self.walk_code(c)),
            LlCode::For { index, from, to, body, .. } => {
                self.stack.push(Frame { index: *index, from: *from, to: *to });
                self.walk_code(body);
                self.stack.pop();
            }
            LlCode::ZeroOut(t) => {
                let comp = self.computations.entry(*t).or_default();
                comp.stmts.push((self.stack.clone(), Stmt::Zero));
            }
            LlCode::Set { tensor, idcs, value } => {
                self.walk_expr(value);
                let under_dynamic = self.dynamic_depth > 0
                    || idcs.iter().any(|i| !matches!(i, AxisIndex::Fixed(_) | AxisIndex::Iterator(_)));
                let comp = self.computations.entry(*tensor).or_default();
                comp.under_dynamic |= under_dynamic;
                comp.stmts.push((self.stack.clone(), Stmt::Set(idcs.clone(), value.clone())));
            }
            LlCode::SetLocal(_, value) => self.walk_expr(value),
            LlCode::DynamicIndices { tensor, tensor_idcs, body, .. } => {
                self.note_use(*tensor, tensor_idcs);
                self.dynamic_depth += 1;
                self.walk_code(body);
                self.dynamic_depth -= 1;
            }
            LlCode::Rebalance { children, .. } => {
                children.iter().for_each(|c| self.walk_code(c))
            }
        }
    }
}

/// Per-stmt substitution from the written index pattern to a reader's
/// indices. `None` when the site cannot be matched.
fn site_subst(pattern: &[AxisIndex], call: &[AxisIndex]) -> Option<IndexSubst> {
    if pattern.len() != call.len() {
        return None;
    }
    let mut map = IndexSubst::new();
    for (pat, at) in pattern.iter().zip(call.iter()) {
        match pat {
            AxisIndex::Iterator(s) if s.is_substitutable() => {
                if let Some(previous) = map.get(s) {
                    if previous != at {
                        return None;
                    }
                } else {
                    map.insert(*s, at.clone());
                }
            }
            // Non-substitutable positions must match the reader exactly.
            other => {
                if other != at {
                    return None;
                }
            }
        }
    }
    Some(map)
}

fn pattern_symbols(pattern: &[AxisIndex]) -> HashSet<Symbol> {
    let mut syms = Vec::new();
    for idx in pattern {
        idx.symbols(&mut syms);
    }
    syms.into_iter().collect()
}

fn stmt_symbols(stmt: &Stmt) -> Vec<Symbol> {
    let mut syms = Vec::new();
    match stmt {
        Stmt::Zero => {}
        Stmt::Set(idcs, value) => {
            for idx in idcs {
                idx.symbols(&mut syms);
            }
            expr_symbols(value, &mut syms);
        }
    }
    syms
}

/// Validates a candidate against its definition and every read site.
fn candidate_ok(comp: &Computation, uses: &[UseSite], settings: &OptimizeSettings) -> bool {
    if comp.stmts.is_empty() || uses.is_empty() {
        return false;
    }
    if comp.under_dynamic && !settings.always_inline_dynamic_indexing {
        return false;
    }
    for (frames, stmt) in &comp.stmts {
        let pattern = match stmt {
            Stmt::Zero => continue,
            Stmt::Set(idcs, _) => idcs,
        };
        let pattern_syms = pattern_symbols(pattern);
        let frame_syms: HashSet<Symbol> = frames.iter().map(|f| f.index).collect();
        for s in stmt_symbols(stmt) {
            if pattern_syms.contains(&s) || !s.is_substitutable() {
                continue;
            }
            if frame_syms.contains(&s) {
                continue;
            }
            // Escaping iterator. Even when every read site binds it, a read
            // site inlined into another definition gets α-renamed and would
            // leave this reference dangling, so the candidate is out.
            return false;
        }
        // Every read site must be matchable against the write pattern.
        if !uses.iter().all(|site| site_subst(pattern, &site.idcs).is_some()) {
            return false;
        }
    }
    true
}

struct Inliner<'a> {
    settings: &'a OptimizeSettings,
    traced: &'a HashMap<Tensor, TracedTensor>,
    computations: HashMap<Tensor, Computation>,
    virtualized: HashMap<Tensor, ScopeId>,
}

impl<'a> Inliner<'a> {
    /// Builds the inlined local scope replacing `Get(t, call_idcs)`.
    fn build_scope(&self, t: Tensor, call_idcs: &[AxisIndex]) -> LlExpr {
        let scope = self.virtualized[&t];
        let comp = &self.computations[&t];
        let mut parts = Vec::new();
        for (frames, stmt) in &comp.stmts {
            let (pattern, piece): (&[AxisIndex], LlCode) = match stmt {
                Stmt::Zero => (&[], LlCode::SetLocal(scope, LlExpr::Constant(0.0))),
                Stmt::Set(idcs, value) => {
                    let value = redirect_self_reads(value, t, scope);
                    (idcs.as_slice(), LlCode::SetLocal(scope, value))
                }
            };
            let map = match site_subst(pattern, call_idcs) {
                Some(map) => map,
                // Zero writes have no pattern: substitute nothing.
                None if pattern.is_empty() => IndexSubst::new(),
                None => continue,
            };
            // Contraction loops: frames binding symbols the statement still
            // reads after the pattern substitution.
            let piece_syms: HashSet<Symbol> = {
                let mut syms = Vec::new();
                code_symbols(&piece, &mut syms);
                syms.into_iter().collect()
            };
            let pattern_syms = pattern_symbols(pattern);
            let mut wrapped = piece;
            for frame in frames.iter().rev() {
                if pattern_syms.contains(&frame.index) || !piece_syms.contains(&frame.index) {
                    continue;
                }
                wrapped = LlCode::For {
                    index: frame.index,
                    from: frame.from,
                    to: frame.to,
                    body: Box::new(wrapped),
                    trace_it: false,
                };
            }
            // α-renames the kept binders and applies the pattern map.
            parts.push(llir::subst_code(&wrapped, &map));
        }
        let body = self.rewrite_code(&LlCode::lines(parts));
        LlExpr::LocalScope {
            id: scope,
            precision: t.precision(),
            body: Box::new(body),
            orig_indices: call_idcs.to_vec(),
        }
    }

    fn rewrite_expr(&self, expr: &LlExpr) -> LlExpr {
        match expr {
            LlExpr::Get(t, idcs) => {
                if self.virtualized.contains_key(t) {
                    self.build_scope(*t, idcs)
                } else if self.settings.inline_constants {
                    match self.traced.get(t).and_then(|tr| tr.scalar) {
                        Some(c) => LlExpr::Constant(c),
                        None => expr.clone(),
                    }
                } else {
                    expr.clone()
                }
            }
            LlExpr::Constant(_) | LlExpr::GetLocal(_) | LlExpr::GetGlobal(_) => expr.clone(),
            LlExpr::Synthetic { .. } => expr.clone(),
            LlExpr::LocalScope { id, precision, body, orig_indices } => LlExpr::LocalScope {
                id: *id,
                precision: *precision,
                body: Box::new(self.rewrite_code(body)),
                orig_indices: orig_indices.clone(),
            },
            LlExpr::Binop(op, a, b) => LlExpr::Binop(
                *op,
                Box::new(self.rewrite_expr(a)),
                Box::new(self.rewrite_expr(b)),
            ),
            LlExpr::Unop(op, a) => LlExpr::Unop(*op, Box::new(self.rewrite_expr(a))),
        }
    }

    /// Rewrites a statement tree: inlines virtual reads and drops the
    /// definitions of virtualized tensors.
    fn rewrite_code(&self, code: &LlCode) -> LlCode {
        match code {
            LlCode::Noop => LlCode::Noop,
            LlCode::Comment(c) => LlCode::Comment(c.clone()),
            LlCode::Lines(items) => {
                LlCode::lines(items.iter().map(|c| self.rewrite_code(c)).collect())
            }
            LlCode::For { index, from, to, body, trace_it } => {
                let body = self.rewrite_code(body);
                if body == LlCode::Noop {
                    LlCode::Noop
                } else {
                    LlCode::For {
                        index: *index,
                        from: *from,
                        to: *to,
                        body: Box::new(body),
                        trace_it: *trace_it,
                    }
                }
            }
            LlCode::ZeroOut(t) => {
                if self.virtualized.contains_key(t) {
                    LlCode::Noop
                } else {
                    LlCode::ZeroOut(*t)
                }
            }
            LlCode::Set { tensor, idcs, value } => {
                if self.virtualized.contains_key(tensor) {
                    LlCode::Noop
                } else {
                    LlCode::Set {
                        tensor: *tensor,
                        idcs: idcs.clone(),
                        value: self.rewrite_expr(value),
                    }
                }
            }
            LlCode::SetLocal(id, value) => LlCode::SetLocal(*id, self.rewrite_expr(value)),
            LlCode::DynamicIndices { tensor, tensor_idcs, dynamic_idcs, target_dims, body, slice } => {
                let body = self.rewrite_code(body);
                LlCode::DynamicIndices {
                    tensor: *tensor,
                    tensor_idcs: tensor_idcs.clone(),
                    dynamic_idcs: dynamic_idcs.clone(),
                    target_dims: target_dims.clone(),
                    body: Box::new(body),
                    slice: *slice,
                }
            }
            LlCode::Rebalance { label, children } => LlCode::Rebalance {
                label: label.clone(),
                children: children.iter().map(|c| self.rewrite_code(c)).collect(),
            },
        }
    }
}

/// Replaces reads of the tensor being inlined by reads of its scope local.
fn redirect_self_reads(value: &LlExpr, t: Tensor, scope: ScopeId) -> LlExpr {
    match value {
        LlExpr::Get(tt, _) if *tt == t => LlExpr::GetLocal(scope),
        LlExpr::Binop(op, a, b) => LlExpr::Binop(
            *op,
            Box::new(redirect_self_reads(a, t, scope)),
            Box::new(redirect_self_reads(b, t, scope)),
        ),
        LlExpr::Unop(op, a) => LlExpr::Unop(*op, Box::new(redirect_self_reads(a, t, scope))),
        other => other.clone(),
    }
}

/// Runs candidate collection, inlining and cleanup.
pub fn virtualize(
    settings: &OptimizeSettings,
    code: &LlCode,
    traced: &HashMap<Tensor, TracedTensor>,
) -> LlCode {
    let mut collector = Collector {
        stack: Vec::new(),
        dynamic_depth: 0,
        computations: HashMap::new(),
        uses: HashMap::new(),
    };
    collector.walk_code(code);

    let mut virtualized = HashMap::new();
    // Deterministic candidate order: tensor creation order.
    let mut candidates: Vec<Tensor> = collector.computations.keys().copied().collect();
    candidates.sort();
    for t in candidates {
        let Some(tr) = traced.get(&t) else { continue };
        if tr.non_virtual || tr.is_dynamic_slice {
            continue;
        }
        let Some(max) = tr.max_visits() else { continue };
        if max > settings.max_visits {
            continue;
        }
        let comp = &collector.computations[&t];
        let uses = collector.uses.get(&t).map(|u| u.as_slice()).unwrap_or(&[]);
        if candidate_ok(comp, uses, settings) {
            virtualized.insert(t, ScopeId::fresh());
        }
    }

    for t in virtualized.keys() {
        t.require_mode(MemoryMode::Virtual);
    }

    let inliner =
        Inliner { settings, traced, computations: collector.computations.clone(), virtualized };
    inliner.rewrite_code(code)
}

/// Test helper for the virtualization invariant: a program must not touch
/// tensors decided virtual.
pub fn references_tensor(code: &LlCode, t: Tensor) -> bool {
    fn in_expr(expr: &LlExpr, t: Tensor) -> bool {
        match expr {
            LlExpr::Get(tt, _) => *tt == t,
            LlExpr::LocalScope { body, .. } => in_code(body, t),
            LlExpr::Binop(_, a, b) => in_expr(a, t) || in_expr(b, t),
            LlExpr::Unop(_, a) => in_expr(a, t),
            _ => false,
        }
    }
    fn in_code(code: &LlCode, t: Tensor) -> bool {
        match code {
            LlCode::Noop | LlCode::Comment(_) => false,
            LlCode::Lines(items) => items.iter().any(|c| in_code(c, t)),
            LlCode::For { body, .. } => in_code(body, t),
            LlCode::ZeroOut(tt) => *tt == t,
            LlCode::Set { tensor, value, .. } => *tensor == t || in_expr(value, t),
            LlCode::SetLocal(_, value) => in_expr(value, t),
            LlCode::DynamicIndices { tensor, body, slice, .. } => {
                *tensor == t || *slice == Some(t) || in_code(body, t)
            }
            LlCode::Rebalance { children, .. } => children.iter().any(|c| in_code(c, t)),
        }
    }
    in_code(code, t)
}
