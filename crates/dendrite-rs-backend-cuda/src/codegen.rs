//! CUDA C emission from optimized low-level programs.
//!
//! One kernel per routine: the whole loop nest runs sequentially on a single
//! lane (parallel mapping of product loops onto the grid is the extension
//! point here). Buffers arrive as typed pointers, static bindings as integer
//! parameters read at launch. Host-callback fills cannot cross the device
//! boundary and are rejected at compile time.

use std::collections::HashMap;
use std::fmt::Write as _;

use anyhow::{anyhow, bail, Result};

use dendrite_rs::backend::BackendError;
use dendrite_rs::indexing::{AxisIndex, Bindings, Symbol};
use dendrite_rs::llir::{self, Binop, LlCode, LlExpr, ScopeId, Unop};
use dendrite_rs::precision::Precision;
use dendrite_rs::tensor::Tensor;

/// One kernel parameter, in signature order.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelParam {
    Buffer(Tensor),
    Binding(Symbol),
}

/// Generated CUDA C for one routine.
#[derive(Debug, Clone)]
pub struct KernelSource {
    pub name: String,
    pub source: String,
    pub params: Vec<KernelParam>,
}

fn c_pointer_type(p: Precision) -> &'static str {
    match p {
        Precision::Byte => "unsigned char*",
        Precision::Half => "__half*",
        Precision::Single => "float*",
        Precision::Double => "double*",
    }
}

fn sanitize(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(true) {
        out.insert(0, 'k');
    }
    out
}

struct Emitter {
    dims: HashMap<Tensor, Vec<usize>>,
    bindings: Bindings,
    scopes: Vec<(ScopeId, String)>,
    fresh: usize,
    body: String,
    indent: usize,
}

impl Emitter {
    fn line(&mut self, text: &str) {
        let pad = "  ".repeat(self.indent + 1);
        let _ = writeln!(self.body, "{pad}{text}");
    }

    fn fresh_name(&mut self, prefix: &str) -> String {
        self.fresh += 1;
        format!("{prefix}{}", self.fresh)
    }

    fn scope_name(&self, id: ScopeId) -> Result<&str> {
        self.scopes
            .iter()
            .rev()
            .find(|(scope, _)| *scope == id)
            .map(|(_, name)| name.as_str())
            .ok_or_else(|| anyhow!("local{} referenced outside its scope", id.0))
    }

    fn index_expr(&self, idx: &AxisIndex) -> Result<String> {
        match idx {
            AxisIndex::Fixed(i) => Ok(format!("{i}")),
            AxisIndex::Iterator(s)
            | AxisIndex::DynamicRecipient(s)
            | AxisIndex::FrozenRecipient(s) => Ok(format!("{s}")),
            AxisIndex::DynamicProvider { .. } => {
                bail!("dynamic provider reached code emission as a direct index")
            }
        }
    }

    /// Row-major flat offset of an access.
    fn offset_expr(&self, t: Tensor, idcs: &[AxisIndex]) -> Result<String> {
        let dims = self
            .dims
            .get(&t)
            .ok_or_else(|| anyhow!("tensor {} missing from the kernel signature", t.header()))?;
        if idcs.is_empty() {
            return Ok("0".to_string());
        }
        let mut expr = self.index_expr(&idcs[0])?;
        for (n, idx) in idcs.iter().enumerate().skip(1) {
            expr = format!("({expr}) * {} + ({})", dims[n], self.index_expr(idx)?);
        }
        Ok(expr)
    }

    fn load_expr(&self, t: Tensor, offset: &str) -> String {
        let name = format!("t{}", t.0);
        match t.precision() {
            Precision::Half => format!("(double)__half2float({name}[{offset}])"),
            _ => format!("(double){name}[{offset}]"),
        }
    }

    fn store_cast(&self, t: Tensor, value: &str) -> String {
        match t.precision() {
            Precision::Byte => format!("(unsigned char)llrint({value})"),
            Precision::Half => format!("__float2half((float)({value}))"),
            Precision::Single => format!("(float)({value})"),
            Precision::Double => format!("({value})"),
        }
    }

    /// Emits an expression; scope bodies land as statements first.
    fn expr(&mut self, expr: &LlExpr) -> Result<String> {
        match expr {
            LlExpr::Constant(c) => {
                if c.fract() == 0.0 && c.abs() < 1e15 {
                    Ok(format!("{:.1}", c))
                } else {
                    Ok(format!("{c:e}"))
                }
            }
            LlExpr::Get(t, idcs) => {
                let offset = self.offset_expr(*t, idcs)?;
                Ok(self.load_expr(*t, &offset))
            }
            LlExpr::GetLocal(id) => Ok(self.scope_name(*id)?.to_string()),
            LlExpr::GetGlobal(name) => bail!("global \"{name}\" is not available on cuda"),
            LlExpr::LocalScope { id, body, .. } => {
                let name = self.fresh_name("scope");
                self.line(&format!("double {name} = 0.0;"));
                self.scopes.push((*id, name.clone()));
                self.line("{");
                self.indent += 1;
                self.code(body)?;
                self.indent -= 1;
                self.line("}");
                self.scopes.pop();
                Ok(name)
            }
            LlExpr::Binop(op, a, b) => {
                let a = self.expr(a)?;
                let b = self.expr(b)?;
                Ok(match op {
                    Binop::Arg1 => format!("({a})"),
                    Binop::Arg2 => format!("({b})"),
                    Binop::Add => format!("(({a}) + ({b}))"),
                    Binop::Mul => format!("(({a}) * ({b}))"),
                    Binop::ToPowOf => format!("pow(({a}), ({b}))"),
                    Binop::ReluGate => format!("((({a}) > 0.0) ? ({b}) : 0.0)"),
                })
            }
            LlExpr::Unop(op, a) => {
                let a = self.expr(a)?;
                Ok(match op {
                    Unop::Identity => format!("({a})"),
                    Unop::Relu => format!("fmax(({a}), 0.0)"),
                })
            }
            LlExpr::Synthetic { f, .. } => Err(BackendError::Compile {
                routine: "cuda".to_string(),
                diagnostic: format!(
                    "host callback \"{}\" cannot run inside a device kernel",
                    f.name
                ),
            }
            .into()),
        }
    }

    fn code(&mut self, code: &LlCode) -> Result<()> {
        match code {
            LlCode::Noop => Ok(()),
            LlCode::Comment(c) => {
                self.line(&format!("// {c}"));
                Ok(())
            }
            LlCode::Lines(items) => {
                for item in items {
                    self.code(item)?;
                }
                Ok(())
            }
            LlCode::For { index, from, to, body, .. } => {
                if self.bindings.lookup(*index).is_some() {
                    // The axis is a launch parameter; the kernel sees the
                    // bound value directly.
                    self.line("{");
                    self.indent += 1;
                    self.code(body)?;
                    self.indent -= 1;
                    self.line("}");
                    return Ok(());
                }
                self.line(&format!(
                    "for (long long {index} = {from}; {index} < {to}; ++{index}) {{"
                ));
                self.indent += 1;
                self.code(body)?;
                self.indent -= 1;
                self.line("}");
                Ok(())
            }
            LlCode::ZeroOut(t) => {
                let dims = self
                    .dims
                    .get(t)
                    .ok_or_else(|| anyhow!("tensor {} missing from the kernel signature", t.header()))?;
                let size: usize = dims.iter().product();
                let z = self.fresh_name("z");
                let store = self.store_cast(*t, "0.0");
                self.line(&format!(
                    "for (long long {z} = 0; {z} < {size}; ++{z}) t{}[{z}] = {store};",
                    t.0
                ));
                Ok(())
            }
            LlCode::Set { tensor, idcs, value } => {
                let value = self.expr(value)?;
                let offset = self.offset_expr(*tensor, idcs)?;
                let store = self.store_cast(*tensor, &value);
                self.line(&format!("t{}[{offset}] = {store};", tensor.0));
                Ok(())
            }
            LlCode::SetLocal(id, value) => {
                let value = self.expr(value)?;
                let name = self.scope_name(*id)?.to_string();
                self.line(&format!("{name} = {value};"));
                Ok(())
            }
            LlCode::DynamicIndices { tensor, tensor_idcs, dynamic_idcs, target_dims, body, .. } => {
                self.line("{");
                self.indent += 1;
                for (j, sym) in dynamic_idcs.iter().enumerate() {
                    let mut at = tensor_idcs.to_vec();
                    at.push(AxisIndex::Fixed(j as i64));
                    let offset = self.offset_expr(*tensor, &at)?;
                    let raw = self.load_expr(*tensor, &offset);
                    let limit = target_dims.get(j).copied().unwrap_or(1).max(1) - 1;
                    self.line(&format!(
                        "long long {sym} = min(max((long long)({raw}), 0ll), {limit}ll);"
                    ));
                }
                self.code(body)?;
                self.indent -= 1;
                self.line("}");
                Ok(())
            }
            LlCode::Rebalance { children, .. } => {
                for child in children {
                    self.code(child)?;
                }
                Ok(())
            }
        }
    }
}

/// Loop binders whose loops collapse because the symbol is statically bound.
fn bound_loop_binders(code: &LlCode, bindings: &Bindings) -> Vec<Symbol> {
    fn go(code: &LlCode, bindings: &Bindings, out: &mut Vec<Symbol>) {
        match code {
            LlCode::Noop | LlCode::Comment(_) | LlCode::ZeroOut(_) => {}
            LlCode::Lines(items) => items.iter().for_each(|c| go(c, bindings, out)),
            LlCode::For { index, body, .. } => {
                if bindings.lookup(*index).is_some() && !out.contains(index) {
                    out.push(*index);
                }
                go(body, bindings, out);
            }
            LlCode::Set { value, .. } => go_expr(value, bindings, out),
            LlCode::SetLocal(_, value) => go_expr(value, bindings, out),
            LlCode::DynamicIndices { body, .. } => go(body, bindings, out),
            LlCode::Rebalance { children, .. } => {
                children.iter().for_each(|c| go(c, bindings, out))
            }
        }
    }
    fn go_expr(expr: &llir::LlExpr, bindings: &Bindings, out: &mut Vec<Symbol>) {
        if let llir::LlExpr::LocalScope { body, .. } = expr {
            go(body, bindings, out);
        } else if let llir::LlExpr::Binop(_, a, b) = expr {
            go_expr(a, bindings, out);
            go_expr(b, bindings, out);
        } else if let llir::LlExpr::Unop(_, a) = expr {
            go_expr(a, bindings, out);
        }
    }
    let mut out = Vec::new();
    go(code, bindings, &mut out);
    out
}

/// Generates the kernel source and its parameter order for a program.
pub fn emit_kernel(name: &str, code: &LlCode, bindings: &Bindings) -> Result<KernelSource> {
    let kernel_name = sanitize(name);
    let tensors = llir::referenced_tensors(code);
    let mut dims = HashMap::new();
    for &t in &tensors {
        dims.insert(t, t.dims()?);
    }

    // Free symbols must all arrive through static bindings. Loop binders
    // that are statically bound also arrive as parameters, since their loops
    // collapse to the bound value.
    let mut params: Vec<KernelParam> = tensors.iter().map(|&t| KernelParam::Buffer(t)).collect();
    let mut needed: Vec<Symbol> = llir::free_symbols(code).into_iter().collect();
    for sym in bound_loop_binders(code, bindings) {
        if !needed.contains(&sym) {
            needed.push(sym);
        }
    }
    needed.sort();
    for sym in needed {
        match bindings.lookup(sym) {
            Some(_) => params.push(KernelParam::Binding(sym)),
            None => bail!("iterator {sym} is neither loop-bound nor statically bound"),
        }
    }

    let mut signature = Vec::new();
    for param in &params {
        match param {
            KernelParam::Buffer(t) => {
                signature.push(format!("{} t{}", c_pointer_type(t.precision()), t.0));
            }
            KernelParam::Binding(sym) => signature.push(format!("long long {sym}")),
        }
    }

    let needs_half = tensors.iter().any(|t| t.precision() == Precision::Half);
    let mut emitter = Emitter {
        dims,
        bindings: bindings.clone(),
        scopes: Vec::new(),
        fresh: 0,
        body: String::new(),
        indent: 0,
    };
    emitter.code(code)?;

    let mut source = String::new();
    if needs_half {
        source.push_str("#include <cuda_fp16.h>\n");
    }
    let _ = writeln!(
        source,
        "extern \"C\" __global__ void {kernel_name}({}) {{",
        signature.join(", ")
    );
    source.push_str(&emitter.body);
    source.push_str("}\n");

    Ok(KernelSource { name: kernel_name, source, params })
}
