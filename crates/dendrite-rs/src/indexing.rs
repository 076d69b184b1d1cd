//! Iteration symbols, axis indices, static bindings, and projection records.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};

/// Role of an iteration symbol. Dedicated flavors are reserved for scheduling
/// and are never substituted during inlining.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolKind {
    Plain,
    TaskId,
    SampleNum,
    Frozen,
}

/// A unique iteration symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol {
    id: u32,
}

static SYMBOL_IDS: AtomicU32 = AtomicU32::new(4);

// Well-known ids for the singleton dedicated symbols; frozen symbols live in
// the upper id half.
const TASK_ID: u32 = 0;
const SAMPLE_NUM: u32 = 1;
const FROZEN_BASE: u32 = 1 << 31;

impl Symbol {
    pub fn fresh() -> Symbol {
        Symbol { id: SYMBOL_IDS.fetch_add(1, Ordering::Relaxed) }
    }

    /// A fresh frozen symbol: bound once per scheduled run, never renamed.
    pub fn fresh_frozen() -> Symbol {
        Symbol { id: FROZEN_BASE | SYMBOL_IDS.fetch_add(1, Ordering::Relaxed) }
    }

    /// The per-device task ordinal axis.
    pub fn task_id() -> Symbol {
        Symbol { id: TASK_ID }
    }

    /// The per-sample minibatch axis.
    pub fn sample_num() -> Symbol {
        Symbol { id: SAMPLE_NUM }
    }

    pub fn kind(self) -> SymbolKind {
        match self.id {
            TASK_ID => SymbolKind::TaskId,
            SAMPLE_NUM => SymbolKind::SampleNum,
            id if id >= FROZEN_BASE => SymbolKind::Frozen,
            _ => SymbolKind::Plain,
        }
    }

    /// Whether inlining may rename or substitute this symbol.
    pub fn is_substitutable(self) -> bool {
        matches!(self.kind(), SymbolKind::Plain)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            SymbolKind::TaskId => write!(f, "task_id"),
            SymbolKind::SampleNum => write!(f, "sample_n"),
            SymbolKind::Frozen => write!(f, "fz{}", self.id),
            SymbolKind::Plain => write!(f, "i{}", self.id),
        }
    }
}

/// One slot of a tensor access: how a single axis is indexed.
#[derive(Debug, Clone, PartialEq)]
pub enum AxisIndex {
    /// A constant index.
    Fixed(i64),
    /// The value of an iterator (from an enclosing loop or a static binding).
    Iterator(Symbol),
    /// A slot filled at runtime from a dynamic-indices block.
    DynamicRecipient(Symbol),
    /// A slot bound once per scheduled run and held constant inside it.
    FrozenRecipient(Symbol),
    /// Marks the providing tensor of a dynamic-indices block: the values read
    /// at `idcs` become indices into an array of extents `target_dims`.
    DynamicProvider { idcs: Vec<AxisIndex>, target_dims: Vec<usize> },
}

impl AxisIndex {
    /// Symbols this index reads, in order of appearance.
    pub fn symbols(&self, out: &mut Vec<Symbol>) {
        match self {
            AxisIndex::Fixed(_) => {}
            AxisIndex::Iterator(s)
            | AxisIndex::DynamicRecipient(s)
            | AxisIndex::FrozenRecipient(s) => out.push(*s),
            AxisIndex::DynamicProvider { idcs, .. } => {
                for idx in idcs {
                    idx.symbols(out);
                }
            }
        }
    }
}

impl fmt::Display for AxisIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AxisIndex::Fixed(i) => write!(f, "{i}"),
            AxisIndex::Iterator(s) => write!(f, "{s}"),
            AxisIndex::DynamicRecipient(s) => write!(f, "?{s}"),
            AxisIndex::FrozenRecipient(s) => write!(f, "!{s}"),
            AxisIndex::DynamicProvider { idcs, target_dims } => {
                write!(f, "provider[")?;
                for (n, idx) in idcs.iter().enumerate() {
                    if n > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{idx}")?;
                }
                write!(f, " -> {target_dims:?}]")
            }
        }
    }
}

/// A named mutable integer cell with an optional range, used to parameterize
/// kernel launches. The scheduler writes the cell between submissions; kernels
/// read it at launch.
#[derive(Debug, Clone)]
pub struct StaticBinding {
    pub symbol: Symbol,
    pub range: Option<usize>,
    cell: Arc<AtomicI64>,
}

impl StaticBinding {
    pub fn new(symbol: Symbol, range: Option<usize>) -> Self {
        StaticBinding { symbol, range, cell: Arc::new(AtomicI64::new(0)) }
    }

    pub fn get(&self) -> i64 {
        self.cell.load(Ordering::SeqCst)
    }

    pub fn set(&self, v: i64) {
        self.cell.store(v, Ordering::SeqCst);
    }
}

/// An ordered static-binding context.
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    entries: Vec<StaticBinding>,
}

/// The empty binding context.
pub fn empty_bindings() -> Bindings {
    Bindings::default()
}

impl Bindings {
    /// Extends the context with a new binding; rebinding a symbol is an error.
    pub fn extend(&self, binding: StaticBinding) -> Result<Bindings> {
        if self.lookup(binding.symbol).is_some() {
            bail!("symbol {} is already bound", binding.symbol);
        }
        let mut entries = self.entries.clone();
        entries.push(binding);
        Ok(Bindings { entries })
    }

    pub fn lookup(&self, symbol: Symbol) -> Option<&StaticBinding> {
        self.entries.iter().find(|b| b.symbol == symbol)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StaticBinding> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Identifies a projection equivalence class over dims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProjId(pub u32);

static PROJ_IDS: AtomicU32 = AtomicU32::new(0);

impl ProjId {
    pub fn fresh() -> ProjId {
        ProjId(PROJ_IDS.fetch_add(1, Ordering::Relaxed))
    }
}

/// Union-find over projection ids. Dims proven equal in size share a class,
/// and the loop planner emits a single iterator per class.
#[derive(Debug, Clone, Default)]
pub struct ProjectionUnion {
    parent: HashMap<ProjId, ProjId>,
}

impl ProjectionUnion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, id: ProjId) -> ProjId {
        let mut cur = id;
        while let Some(&next) = self.parent.get(&cur) {
            if next == cur {
                break;
            }
            cur = next;
        }
        cur
    }

    pub fn union(&mut self, a: ProjId, b: ProjId) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            // Deterministic representative: the smaller id wins.
            let (root, child) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent.insert(child, root);
        }
    }

    pub fn same(&self, a: ProjId, b: ProjId) -> bool {
        self.find(a) == self.find(b)
    }
}

/// The loop plan of one accumulating assignment: the iterated product space
/// and the per-operand index arrays into it.
#[derive(Debug, Clone)]
pub struct Projections {
    /// Extents of the iterated dims, one per emitted loop.
    pub product_space: Vec<usize>,
    /// One iterator symbol per product-space dim.
    pub product_iterators: Vec<Symbol>,
    /// Dims of the left-hand side.
    pub lhs_dims: Vec<usize>,
    /// Dims of each right-hand side.
    pub rhs_dims: Vec<Vec<usize>>,
    /// Index array of the left-hand side over the product space.
    pub project_lhs: Vec<AxisIndex>,
    /// Index array of each right-hand side over the product space.
    pub project_rhs: Vec<Vec<AxisIndex>>,
    /// Provenance, surfaced in shape errors and debug artifacts.
    pub debug_info: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedicated_symbols_are_not_substitutable() {
        assert!(!Symbol::task_id().is_substitutable());
        assert!(!Symbol::sample_num().is_substitutable());
        assert!(!Symbol::fresh_frozen().is_substitutable());
        assert_eq!(Symbol::fresh_frozen().kind(), SymbolKind::Frozen);
        assert!(Symbol::fresh().is_substitutable());
    }

    #[test]
    fn bindings_reject_rebinding() {
        let s = Symbol::fresh();
        let b = empty_bindings().extend(StaticBinding::new(s, Some(4))).unwrap();
        assert!(b.extend(StaticBinding::new(s, None)).is_err());
        assert_eq!(b.lookup(s).unwrap().range, Some(4));
    }

    #[test]
    fn union_find_is_transitive_and_deterministic() {
        let a = ProjId::fresh();
        let b = ProjId::fresh();
        let c = ProjId::fresh();
        let mut uf = ProjectionUnion::new();
        uf.union(a, b);
        uf.union(b, c);
        assert!(uf.same(a, c));
        assert_eq!(uf.find(c), uf.find(a));
        assert_eq!(uf.find(a), a.min(b).min(c));
    }
}
