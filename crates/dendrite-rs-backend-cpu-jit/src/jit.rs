//! Compiled execution of low-level programs over host memory.
//!
//! Compilation resolves every referenced tensor to its context buffer once;
//! running walks the loop nests with a per-run environment. A loop whose
//! binder is statically bound executes once at the bound value, which is how
//! static bindings parameterize kernel launches.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context as _, Result};
use dendrite_rs::buffer::NdBuffer;
use dendrite_rs::indexing::{AxisIndex, Bindings, Symbol};
use dendrite_rs::llir::{LlCode, LlExpr, ScopeId};
use dendrite_rs::tensor::{session_step, Tensor};

pub(crate) type BufRef = Arc<Mutex<NdBuffer>>;

/// A compiled program: the optimized code plus its resolved buffers and
/// bindings.
pub(crate) struct Executor {
    pub name: String,
    pub code: LlCode,
    pub buffers: HashMap<Tensor, BufRef>,
    pub bindings: Bindings,
}

/// Per-run mutable state.
struct Env {
    iterators: HashMap<Symbol, i64>,
    locals: Vec<(ScopeId, f64)>,
}

impl Executor {
    pub fn run(&self) -> Result<()> {
        let mut env = Env { iterators: HashMap::new(), locals: Vec::new() };
        self.exec(&self.code, &mut env)
            .with_context(|| format!("running \"{}\"", self.name))
    }

    fn buffer(&self, t: Tensor) -> Result<&BufRef> {
        self.buffers
            .get(&t)
            .ok_or_else(|| anyhow!("tensor {} has no buffer in this context", t.header()))
    }

    fn index_value(&self, idx: &AxisIndex, env: &Env) -> Result<i64> {
        match idx {
            AxisIndex::Fixed(i) => Ok(*i),
            AxisIndex::Iterator(s)
            | AxisIndex::DynamicRecipient(s)
            | AxisIndex::FrozenRecipient(s) => {
                if let Some(v) = env.iterators.get(s) {
                    return Ok(*v);
                }
                if let Some(binding) = self.bindings.lookup(*s) {
                    return Ok(binding.get());
                }
                bail!("iterator {s} is neither loop-bound nor statically bound")
            }
            AxisIndex::DynamicProvider { .. } => {
                bail!("dynamic provider survived lowering into a direct access")
            }
        }
    }

    fn resolve_idcs(&self, t: Tensor, idcs: &[AxisIndex], env: &Env) -> Result<Vec<usize>> {
        let mut out = Vec::with_capacity(idcs.len());
        for idx in idcs {
            let v = self.index_value(idx, env)?;
            if v < 0 {
                bail!("negative index {v} into {}", t.header());
            }
            out.push(v as usize);
        }
        Ok(out)
    }

    fn get(&self, t: Tensor, idcs: &[AxisIndex], env: &Env) -> Result<f64> {
        let resolved = self.resolve_idcs(t, idcs, env)?;
        let buf = self.buffer(t)?.lock().unwrap();
        buf.get_as_float(&resolved)
            .with_context(|| format!("reading {}", t.header()))
    }

    fn set(&self, t: Tensor, idcs: &[AxisIndex], v: f64, env: &Env) -> Result<()> {
        let resolved = self.resolve_idcs(t, idcs, env)?;
        let mut buf = self.buffer(t)?.lock().unwrap();
        buf.set_from_float(&resolved, v)
            .with_context(|| format!("writing {}", t.header()))
    }

    fn set_local(env: &mut Env, id: ScopeId, v: f64) -> Result<()> {
        for (scope, slot) in env.locals.iter_mut().rev() {
            if *scope == id {
                *slot = v;
                return Ok(());
            }
        }
        bail!("write to local{} outside its scope", id.0)
    }

    fn get_local(env: &Env, id: ScopeId) -> Result<f64> {
        for (scope, slot) in env.locals.iter().rev() {
            if *scope == id {
                return Ok(*slot);
            }
        }
        bail!("read of local{} outside its scope", id.0)
    }

    fn eval(&self, expr: &LlExpr, env: &mut Env) -> Result<f64> {
        match expr {
            LlExpr::Constant(c) => Ok(*c),
            LlExpr::Get(t, idcs) => self.get(*t, idcs, env),
            LlExpr::GetLocal(id) => Self::get_local(env, *id),
            LlExpr::GetGlobal(name) => bail!("global \"{name}\" is not available on cpu-jit"),
            LlExpr::LocalScope { id, body, .. } => {
                env.locals.push((*id, 0.0));
                let result = self.exec(body, env);
                let value = Self::get_local(env, *id);
                env.locals.pop();
                result?;
                value
            }
            LlExpr::Binop(op, a, b) => {
                let a = self.eval(a, env)?;
                let b = self.eval(b, env)?;
                Ok(op.eval(a, b))
            }
            LlExpr::Unop(op, a) => Ok(op.eval(self.eval(a, env)?)),
            LlExpr::Synthetic { f, idcs } => {
                let resolved: Vec<usize> = idcs
                    .iter()
                    .map(|i| self.index_value(i, env).map(|v| v.max(0) as usize))
                    .collect::<Result<_>>()?;
                Ok(f.call(session_step(), &resolved))
            }
        }
    }

    fn exec(&self, code: &LlCode, env: &mut Env) -> Result<()> {
        match code {
            LlCode::Noop | LlCode::Comment(_) => Ok(()),
            LlCode::Lines(items) => {
                for item in items {
                    self.exec(item, env)?;
                }
                Ok(())
            }
            LlCode::For { index, from, to, body, .. } => {
                // A statically bound axis runs once at its cell value.
                if env.iterators.get(index).is_none() {
                    if let Some(binding) = self.bindings.lookup(*index) {
                        let v = binding.get();
                        let saved = env.iterators.insert(*index, v);
                        self.exec(body, env)?;
                        restore(env, *index, saved);
                        return Ok(());
                    }
                }
                for v in *from..*to {
                    let saved = env.iterators.insert(*index, v);
                    let result = self.exec(body, env);
                    restore(env, *index, saved);
                    result?;
                }
                Ok(())
            }
            LlCode::ZeroOut(t) => {
                let mut buf = self.buffer(*t)?.lock().unwrap();
                buf.fill_from_float(0.0)
                    .with_context(|| format!("zeroing {}", t.header()))
            }
            LlCode::Set { tensor, idcs, value } => {
                let v = self.eval(value, env)?;
                self.set(*tensor, idcs, v, env)
            }
            LlCode::SetLocal(id, value) => {
                let v = self.eval(value, env)?;
                Self::set_local(env, *id, v)
            }
            LlCode::DynamicIndices { tensor, tensor_idcs, dynamic_idcs, target_dims, body, .. } => {
                let base = self.resolve_idcs(*tensor, tensor_idcs, env)?;
                let saved: Vec<Option<i64>> =
                    dynamic_idcs.iter().map(|s| env.iterators.get(s).copied()).collect();
                for (j, sym) in dynamic_idcs.iter().enumerate() {
                    let mut at = base.clone();
                    at.push(j);
                    let raw = {
                        let buf = self.buffer(*tensor)?.lock().unwrap();
                        buf.get_as_float(&at)
                            .with_context(|| format!("reading indices from {}", tensor.header()))?
                    };
                    let limit = target_dims.get(j).copied().unwrap_or(usize::MAX);
                    let clamped = (raw as i64).clamp(0, limit.saturating_sub(1) as i64);
                    env.iterators.insert(*sym, clamped);
                }
                let result = self.exec(body, env);
                for (sym, old) in dynamic_idcs.iter().zip(saved) {
                    restore(env, *sym, old);
                }
                result
            }
            LlCode::Rebalance { children, .. } => {
                for child in children {
                    self.exec(child, env)?;
                }
                Ok(())
            }
        }
    }
}

fn restore(env: &mut Env, sym: Symbol, saved: Option<i64>) {
    match saved {
        Some(v) => {
            env.iterators.insert(sym, v);
        }
        None => {
            env.iterators.remove(&sym);
        }
    }
}
