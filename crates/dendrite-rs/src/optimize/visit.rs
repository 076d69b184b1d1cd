//! The visit analysis: an abstract interpreter over the loop nests.
//!
//! Loops marked `trace_it` (and short enough) are iterated concretely; other
//! binders stay symbolic, so a read at `[sample_n]` still matches the write at
//! `[sample_n]`. Reads before any write at the same tuple are recurrent.

use std::collections::{HashMap, HashSet};

use crate::indexing::{AxisIndex, Symbol, SymbolKind};
use crate::llir::{expr_symbols, LlCode, LlExpr};
use crate::tensor::{MemoryMode, Tensor};

use super::{OptimizeSettings, TracedTensor, Visits};

/// Abstract value of one index slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum IdxVal {
    Known(i64),
    /// An untraced but stable binder: equal symbols match.
    Sym(Symbol),
    /// A runtime-dependent value that matches nothing, not even itself.
    Opaque(u64),
}

#[derive(Default)]
struct TensorFacts {
    assignments: HashSet<Vec<IdxVal>>,
    accesses: HashMap<Vec<IdxVal>, Visits>,
    assigned_all: bool,
    contacted: bool,
    zero_initialized: bool,
    zeroed_out: bool,
    read_only: bool,
    last_write_non_update: bool,
    is_dynamic_slice: bool,
    non_replicable: bool,
    rhs_set: Vec<LlExpr>,
    written: bool,
}

struct Visitor<'a> {
    settings: &'a OptimizeSettings,
    env: HashMap<Symbol, IdxVal>,
    facts: HashMap<Tensor, TensorFacts>,
    opaque_counter: u64,
}

impl<'a> Visitor<'a> {
    fn facts(&mut self, t: Tensor) -> &mut TensorFacts {
        self.facts.entry(t).or_insert_with(|| TensorFacts { read_only: true, ..Default::default() })
    }

    fn opaque(&mut self) -> IdxVal {
        self.opaque_counter += 1;
        IdxVal::Opaque(self.opaque_counter)
    }

    fn eval_index(&mut self, idx: &AxisIndex) -> IdxVal {
        match idx {
            AxisIndex::Fixed(i) => IdxVal::Known(*i),
            AxisIndex::Iterator(s) => self.env.get(s).copied().unwrap_or(IdxVal::Sym(*s)),
            AxisIndex::DynamicRecipient(s) | AxisIndex::FrozenRecipient(s) => {
                self.env.get(s).copied().unwrap_or(IdxVal::Sym(*s))
            }
            AxisIndex::DynamicProvider { .. } => self.opaque(),
        }
    }

    fn eval_tuple(&mut self, idcs: &[AxisIndex]) -> Vec<IdxVal> {
        idcs.iter().map(|i| self.eval_index(i)).collect()
    }

    fn record_access(&mut self, t: Tensor, idcs: &[AxisIndex]) {
        let tuple = self.eval_tuple(idcs);
        let opaque = tuple.iter().any(|v| matches!(v, IdxVal::Opaque(_)));
        let facts = self.facts(t);
        facts.contacted = true;
        let assigned = facts.assigned_all || (!opaque && facts.assignments.contains(&tuple));
        let entry = facts.accesses.entry(tuple).or_insert(Visits::Visits(0));
        match entry {
            Visits::Recurrent => {}
            Visits::Visits(n) => {
                if assigned {
                    *entry = Visits::Visits(*n + 1);
                } else {
                    *entry = Visits::Recurrent;
                }
            }
        }
    }

    fn record_assignment(&mut self, t: Tensor, idcs: &[AxisIndex], value: &LlExpr) {
        let tuple = self.eval_tuple(idcs);
        let is_update = value_reads_cell(value, t, idcs);
        let mut stmt_symbols = Vec::new();
        for idx in idcs {
            idx.symbols(&mut stmt_symbols);
        }
        expr_symbols(value, &mut stmt_symbols);
        let sequential_minibatch = self.settings.sequential_minibatch;
        let facts = self.facts(t);
        facts.contacted = true;
        facts.written = true;
        facts.read_only = false;
        facts.assignments.insert(tuple);
        facts.last_write_non_update = !is_update;
        if !facts.rhs_set.contains(value) {
            facts.rhs_set.push(value.clone());
        }
        for s in stmt_symbols {
            match s.kind() {
                SymbolKind::TaskId => facts.non_replicable = true,
                SymbolKind::SampleNum if !sequential_minibatch => facts.non_replicable = true,
                _ => {}
            }
        }
    }

    fn walk_expr(&mut self, expr: &LlExpr) {
        match expr {
            LlExpr::Constant(_) | LlExpr::GetLocal(_) | LlExpr::GetGlobal(_) => {}
            LlExpr::Get(t, idcs) => self.record_access(*t, idcs),
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
            LlCode::For { index, from, to, body, trace_it } => {
                let extent = (*to - *from).max(0) as usize;
                let traced =
                    *trace_it && index.is_substitutable() && extent <= self.settings.max_tracing_extent;
                if traced {
                    for v in *from..*to {
                        self.env.insert(*index, IdxVal::Known(v));
                        self.walk_code(body);
                    }
                    self.env.remove(index);
                } else {
                    self.env.insert(*index, IdxVal::Sym(*index));
                    self.walk_code(body);
                    self.env.remove(index);
                }
            }
            LlCode::ZeroOut(t) => {
                let facts = self.facts(*t);
                if !facts.contacted {
                    facts.zero_initialized = true;
                }
                facts.contacted = true;
                facts.zeroed_out = true;
                facts.assigned_all = true;
                facts.written = true;
                facts.read_only = false;
                facts.last_write_non_update = true;
            }
            LlCode::Set { tensor, idcs, value } => {
                // Reads happen before the write lands.
                self.walk_expr(value);
                self.record_assignment(*tensor, idcs, value);
            }
            LlCode::SetLocal(_, value) => self.walk_expr(value),
            LlCode::DynamicIndices { tensor, tensor_idcs, dynamic_idcs, body, slice, .. } => {
                self.record_access(*tensor, tensor_idcs);
                if let Some(sliced) = slice {
                    self.facts(*sliced).is_dynamic_slice = true;
                }
                let saved: Vec<Option<IdxVal>> =
                    dynamic_idcs.iter().map(|s| self.env.get(s).copied()).collect();
                for s in dynamic_idcs {
                    let v = self.opaque();
                    self.env.insert(*s, v);
                }
                self.walk_code(body);
                for (s, old) in dynamic_idcs.iter().zip(saved) {
                    match old {
                        Some(v) => {
                            self.env.insert(*s, v);
                        }
                        None => {
                            self.env.remove(s);
                        }
                    }
                }
            }
            LlCode::Rebalance { children, .. } => {
                children.iter().for_each(|c| self.walk_code(c))
            }
        }
    }
}

/// Whether `value` reads `tensor` at exactly the written indices.
fn value_reads_cell(value: &LlExpr, tensor: Tensor, idcs: &[AxisIndex]) -> bool {
    match value {
        LlExpr::Get(t, read) => *t == tensor && read.as_slice() == idcs,
        LlExpr::Binop(_, a, b) => {
            value_reads_cell(a, tensor, idcs) || value_reads_cell(b, tensor, idcs)
        }
        LlExpr::Unop(_, a) => value_reads_cell(a, tensor, idcs),
        _ => false,
    }
}

/// Runs the visit analysis over a program.
pub fn visit(settings: &OptimizeSettings, code: &LlCode) -> HashMap<Tensor, TracedTensor> {
    let mut visitor =
        Visitor { settings, env: HashMap::new(), facts: HashMap::new(), opaque_counter: 0 };
    visitor.walk_code(code);

    let mut out = HashMap::new();
    for (tensor, facts) in visitor.facts {
        let mut traced = TracedTensor::new(tensor);
        traced.assignments = facts.assignments.len();
        traced.accesses = facts.accesses.values().copied().collect();
        traced.zero_initialized = facts.zero_initialized;
        traced.zeroed_out = facts.zeroed_out;
        traced.read_only = facts.read_only;
        traced.last_write_non_update = facts.last_write_non_update;
        traced.is_dynamic_slice = facts.is_dynamic_slice;
        traced.is_replicable = !facts.non_replicable;
        traced.read_before_write =
            facts.accesses.values().any(|v| matches!(v, Visits::Recurrent));
        traced.rhs_set = facts.rhs_set;

        // A tensor already materialized in user memory never virtualizes, and
        // neither does one whose mode was decided above virtual.
        let hosted_bytes = tensor
            .with_host_buffer(|b| b.size_in_bytes())
            .unwrap_or(0);
        if hosted_bytes > 0 {
            traced.non_virtual = true;
        }
        match tensor.memory_mode() {
            Some(mode) if mode > MemoryMode::Virtual => traced.non_virtual = true,
            _ => {}
        }
        if tensor.memory_mode() == Some(MemoryMode::Hosted) {
            traced.non_device_only = true;
        }

        // Scalar proof: a single-cell tensor always assigned one constant.
        if !traced.read_before_write {
            let single_cell =
                tensor.dims().map(|d| d.iter().product::<usize>() == 1).unwrap_or(false);
            if single_cell {
                match traced.rhs_set.as_slice() {
                    [LlExpr::Constant(c)] if !traced.zeroed_out || *c == 0.0 => {
                        traced.scalar = Some(*c);
                    }
                    [] if traced.zeroed_out => traced.scalar = Some(0.0),
                    _ => {}
                }
            }
        }
        out.insert(tensor, traced);
    }
    out
}
