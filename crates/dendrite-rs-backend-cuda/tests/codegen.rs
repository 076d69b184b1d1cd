//! Kernel source generation checks; none of these need a CUDA device.

use dendrite_rs::buffer::InitOp;
use dendrite_rs::hlir::{FetchOp, HlCode};
use dendrite_rs::indexing::{empty_bindings, StaticBinding, Symbol};
use dendrite_rs::llir::SyntheticFn;
use dendrite_rs::lower;
use dendrite_rs::ops;
use dendrite_rs::optimize::{self, OptimizeSettings};
use dendrite_rs::shape::{self, RowSpec};
use dendrite_rs::tensor::MemoryMode;
use dendrite_rs_backend_cuda::codegen;

fn optimized(code: &HlCode) -> dendrite_rs::optimize::OptimizedProgram {
    shape::finish_inference().expect("inference");
    let lowered = lower::to_low_level(code).expect("lowering");
    optimize::optimize(&OptimizeSettings::default(), &lowered).expect("optimizing")
}

#[test]
fn emits_a_loop_nest_with_typed_buffers() {
    let x = ops::Term::new("cg_x")
        .precision(dendrite_rs::Precision::Single)
        .output(RowSpec::Fixed(vec![4]))
        .init(InitOp::RangeOverOffsets)
        .build()
        .expect("x");
    x.require_mode(MemoryMode::Hosted);
    x.ensure_host_buffer().expect("host x");
    let two = ops::scalar("cg_two", 2.0).expect("two");
    let doubled = ops::mul("cg_2x", two, x).expect("2x");
    let code = ops::forward(doubled);
    let program = optimized(&code);

    let kernel = codegen::emit_kernel("cg_double", &program.code, &empty_bindings())
        .expect("emit");
    assert_eq!(kernel.name, "cg_double");
    assert!(
        kernel.source.contains("extern \"C\" __global__ void cg_double("),
        "{}",
        kernel.source
    );
    assert!(kernel.source.contains(&format!("float* t{}", x.0)), "{}", kernel.source);
    assert!(kernel.source.contains("for (long long "), "{}", kernel.source);
    // The scalar factor was inlined to a literal.
    assert!(kernel.source.contains("2.0"), "{}", kernel.source);
}

#[test]
fn statically_bound_axes_become_kernel_parameters() {
    let t = ops::Term::new("cg_bound")
        .batch(RowSpec::LabeledFixed(vec![(4, "sample_n".to_string())]))
        .output(RowSpec::Fixed(vec![3]))
        .init(InitOp::RangeOverOffsets)
        .build()
        .expect("t");
    t.require_mode(MemoryMode::Hosted);
    t.ensure_host_buffer().expect("host t");
    let out = ops::relu("cg_bound_out", t).expect("out");
    let code = ops::forward(out);
    let program = optimized(&code);

    let bindings = empty_bindings()
        .extend(StaticBinding::new(Symbol::sample_num(), Some(4)))
        .expect("bindings");
    let kernel = codegen::emit_kernel("cg_bound", &program.code, &bindings).expect("emit");
    assert!(kernel.source.contains("long long sample_n"), "{}", kernel.source);
    assert!(
        kernel.params.iter().any(|p| matches!(
            p,
            codegen::KernelParam::Binding(s) if *s == Symbol::sample_num()
        )),
        "{:?}",
        kernel.params
    );
}

#[test]
fn host_callbacks_are_rejected() {
    let t = ops::callback_data(
        "cg_cb",
        &[],
        &[2],
        SyntheticFn::new("host_only", |_, _| 0.0),
    )
    .expect("t");
    let code = HlCode::Fetch {
        target: t,
        fetch: FetchOp::Callback(SyntheticFn::new("host_only", |_, _| 0.0)),
    };
    shape::finish_inference().expect("inference");
    let lowered = lower::to_low_level(&code).expect("lowering");
    let err = codegen::emit_kernel("cg_cb", &lowered, &empty_bindings()).unwrap_err();
    assert!(err.to_string().contains("host callback"), "{err}");
}

#[test]
fn relu_lowers_to_fmax() {
    let x = ops::data("cg_pipe", &[], &[3], InitOp::RangeOverOffsets).expect("x");
    x.require_mode(MemoryMode::Hosted);
    x.ensure_host_buffer().expect("host x");
    let out = ops::relu("cg_pipe_out", x).expect("out");
    let code = ops::forward(out);
    let program = optimized(&code);
    let kernel = codegen::emit_kernel("cg_pipe", &program.code, &empty_bindings()).expect("emit");
    assert!(kernel.source.contains("fmax"), "{}", kernel.source);
}
