use dendrite_rs::hlir::{FetchOp, HlCode};
use dendrite_rs::llir::{self, LlCode};
use dendrite_rs::lower;
use dendrite_rs::ops;
use dendrite_rs::optimize::{self, simplify, virtualize, OptimizeSettings};
use dendrite_rs::shape;
use dendrite_rs::tensor::MemoryMode;

fn settings() -> OptimizeSettings {
    OptimizeSettings::default()
}

#[test]
fn fetch_zero_lowers_to_a_fast_fill() {
    let t = ops::data(
        "opt_zero",
        &[],
        &[4],
        dendrite_rs::buffer::InitOp::RangeOverOffsets,
    )
    .expect("data tensor");
    shape::finish_inference().expect("inference");
    let lowered =
        lower::to_low_level(&HlCode::Fetch { target: t, fetch: FetchOp::Constant(0.0) })
            .expect("lowering");
    assert_eq!(lowered, LlCode::ZeroOut(t));

    let filled = lower::to_low_level(&HlCode::Fetch { target: t, fetch: FetchOp::Constant(2.5) })
        .expect("lowering");
    let rendered = format!("{filled}");
    assert!(rendered.contains(":= 2.5"), "{rendered}");
    assert!(rendered.contains("for "), "{rendered}");
}

#[test]
fn polynomial_simplifies_to_a_product_chain() {
    // f(x) = 3·x² − 4·x + 5 with x non-differentiable.
    let x = ops::data("opt_x", &[], &[5], dendrite_rs::buffer::InitOp::RangeOverOffsets)
        .expect("x");
    x.require_mode(MemoryMode::Hosted);
    x.ensure_host_buffer().expect("host x");
    let three = ops::scalar("opt_three", 3.0).expect("3");
    let five = ops::scalar("opt_five", 5.0).expect("5");
    let neg_four = ops::scalar("opt_neg4", -4.0).expect("-4");
    let x2 = ops::pow("opt_x2", x, 2.0).expect("x^2");
    let t1 = ops::mul("opt_3x2", three, x2).expect("3x^2");
    let t2 = ops::mul("opt_m4x", neg_four, x).expect("-4x");
    let sum = ops::add("opt_sum", t1, t2).expect("sum");
    let f = ops::add("opt_f", sum, five).expect("f");
    let code = ops::forward(f);
    shape::finish_inference().expect("inference");

    let lowered = lower::to_low_level(&code).expect("lowering");
    let program = optimize::optimize(&settings(), &lowered).expect("optimizing");
    let rendered = format!("{}", program.code);
    // The constant exponent unrolls the power into a multiplication.
    assert!(!rendered.contains("pow"), "power survived optimization:\n{rendered}");

    // The simplifier is idempotent.
    let once = simplify::simplify(&settings(), &lowered);
    let twice = simplify::simplify(&settings(), &once);
    assert_eq!(once, twice);
    let again = simplify::simplify(&settings(), &program.code);
    assert_eq!(again, program.code);
}

#[test]
fn virtual_tensors_disappear_from_the_program() {
    let x = ops::data("virt_x", &[], &[3], dendrite_rs::buffer::InitOp::RangeOverOffsets)
        .expect("x");
    x.require_mode(MemoryMode::Hosted);
    x.ensure_host_buffer().expect("host x");
    let two = ops::scalar("virt_two", 2.0).expect("2");
    let doubled = ops::mul("virt_2x", two, x).expect("2x");
    let shifted = ops::add("virt_2x1", doubled, two).expect("2x+2");
    let out = ops::relu("virt_out", shifted).expect("relu");
    let code = ops::forward(out);
    shape::finish_inference().expect("inference");

    let lowered = lower::to_low_level(&code).expect("lowering");
    let before = llir::referenced_tensors(&lowered);
    let program = optimize::optimize(&settings(), &lowered).expect("optimizing");

    let mut virtualized = 0;
    for t in before {
        if t.memory_mode() == Some(MemoryMode::Virtual) {
            virtualized += 1;
            assert!(
                !virtualize::references_tensor(&program.code, t),
                "virtual tensor {} still referenced:\n{}",
                t.header(),
                program.code
            );
        } else if virtualize::references_tensor(&program.code, t) {
            assert!(t.dims().is_ok(), "non-virtual {} has unknown dims", t.header());
        }
    }
    assert!(virtualized >= 2, "expected the intermediates to virtualize, got {virtualized}");
    // The output stays materialized and written.
    assert!(virtualize::references_tensor(&program.code, out));
}

#[test]
fn rebalance_survives_as_a_sequential_block() {
    let a = ops::data("reb_a", &[], &[2], dendrite_rs::buffer::InitOp::RangeOverOffsets)
        .expect("a");
    shape::finish_inference().expect("inference");
    let code = HlCode::Par(
        Box::new(HlCode::Fetch { target: a, fetch: FetchOp::Constant(1.0) }),
        Box::new(HlCode::Fetch { target: a, fetch: FetchOp::Constant(2.0) }),
    );
    let lowered = lower::to_low_level(&code).expect("lowering");
    match &lowered {
        LlCode::Rebalance { children, .. } => assert_eq!(children.len(), 2),
        other => panic!("expected a rebalance block, got:\n{other}"),
    }
}
