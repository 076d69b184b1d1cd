//! End-to-end scenarios over the cpu-jit backend.

use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use dendrite_rs::backend::{pipeline, Backend, Context};
use dendrite_rs::buffer::InitOp;
use dendrite_rs::hlir::HlCode;
use dendrite_rs::indexing::{empty_bindings, Bindings, StaticBinding, Symbol};
use dendrite_rs::llir::SyntheticFn;
use dendrite_rs::ops;
use dendrite_rs::scheduler::{parallel_update, take_devices, ParallelUpdate};
use dendrite_rs::shape::RowSpec;
use dendrite_rs::tensor::{self, MemoryMode, Tensor};
use dendrite_rs::train::{self, SgdConfig};
use dendrite_rs_backend_cpu_jit::CpuJitBackend;

/// Scenario tests share the session-step counter and the backend; they run
/// one at a time.
static TEST_GUARD: Mutex<()> = Mutex::new(());

static BACKEND: Lazy<Arc<CpuJitBackend>> = Lazy::new(|| {
    std::env::set_var("DENDRITE_CPU_JIT_NUM_DEVICES", "2");
    dendrite_rs::config::force_fixed_state_for_init(7);
    let backend = dendrite_rs_backend_cpu_jit::register();
    backend.initialize().expect("initializing cpu-jit");
    backend
});

fn backend() -> Arc<dyn Backend> {
    // Force registration, then resolve through the `backend` preference
    // (unset here, so the cpu-jit default applies).
    Lazy::force(&BACKEND);
    dendrite_rs::backend_from_config().expect("configured backend")
}

fn context_on(ordinal: usize) -> Arc<dyn Context> {
    let backend = backend();
    let device = backend.get_device(ordinal).expect("device");
    backend.init(device).expect("context")
}

fn read_host(t: Tensor, idcs: &[usize]) -> f64 {
    t.with_host_buffer(|b| b.get_as_float(idcs).expect("read"))
        .expect("hosted")
}

/// S1: strict constant fill travels host -> device -> host unchanged on every
/// run; a callback fetch produces a fresh window of 30 values per step.
#[test]
fn s1_strict_fill_and_offset_windows() {
    let _guard = TEST_GUARD.lock().unwrap();
    let backend = backend();
    let ctx = context_on(0);

    let values: Vec<f64> = (0..30).map(|v| v as f64).collect();
    let s = ops::data("s1_data", &[2], &[3, 5], InitOp::ConstantFill { values, strict: true })
        .expect("data");
    s.require_mode(MemoryMode::Hosted);
    s.ensure_host_buffer().expect("host s");
    // Relu of non-negative data: an identity pass through the device.
    let copy = ops::relu("s1_copy", s).expect("copy");
    let code = ops::forward(copy);
    let routine = pipeline::compile_routine(&backend, &ctx, "s1_fwd", &empty_bindings(), &code)
        .expect("compile");
    copy.ensure_host_buffer().expect("host copy");

    backend.from_host(&ctx, s).expect("upload");
    for _run in 0..3 {
        routine.schedule().run().expect("run");
        backend.await_device(&ctx.device()).expect("await");
        backend.to_host(&ctx, copy).expect("download");
        for bt in 0..2 {
            for o0 in 0..3 {
                for o1 in 0..5 {
                    let offset = (bt * 3 + o0) * 5 + o1;
                    assert_eq!(read_host(copy, &[bt, o0, o1]), offset as f64);
                }
            }
        }
    }

    // The windowed variant: each step shows the next 30 offsets.
    let windows = ops::callback_data(
        "s1_windows",
        &[2],
        &[3, 5],
        SyntheticFn::new("offset_window", |step, idcs| {
            let offset = (idcs[0] * 3 + idcs[1]) * 5 + idcs[2];
            (30 * step) as f64 + offset as f64
        }),
    )
    .expect("windows");
    let code = ops::forward(windows);
    let routine = pipeline::compile_routine(&backend, &ctx, "s1_windows", &empty_bindings(), &code)
        .expect("compile");
    windows.ensure_host_buffer().expect("host windows");
    for step in 0..3 {
        tensor::set_session_step(step);
        routine.schedule().run().expect("run");
        backend.await_device(&ctx.device()).expect("await");
        backend.to_host(&ctx, windows).expect("download");
        assert_eq!(read_host(windows, &[0, 0, 0]), (30 * step) as f64);
        assert_eq!(read_host(windows, &[1, 2, 4]), (30 * step + 29) as f64);
    }
}

/// S2: a callback fetch sees the advancing session step.
#[test]
fn s2_callback_fetch_with_session_step() {
    let _guard = TEST_GUARD.lock().unwrap();
    let backend = backend();
    let ctx = context_on(0);

    let t = ops::callback_data(
        "s2_data",
        &[1],
        &[2, 3],
        SyntheticFn::new("step_matrix", |step, idcs| {
            (step * 100) as f64 + (idcs[1] * 10) as f64 + idcs[2] as f64
        }),
    )
    .expect("callback data");
    let code = ops::forward(t);
    let routine = pipeline::compile_routine(&backend, &ctx, "s2_fwd", &empty_bindings(), &code)
        .expect("compile");
    t.ensure_host_buffer().expect("host t");

    tensor::set_session_step(3);
    for base in [300.0, 400.0, 500.0] {
        routine.schedule().run().expect("run");
        backend.await_device(&ctx.device()).expect("await");
        backend.to_host(&ctx, t).expect("download");
        for i in 0..2 {
            for j in 0..3 {
                assert_eq!(read_host(t, &[0, i, j]), base + (i * 10 + j) as f64);
            }
        }
        tensor::advance_session_step();
    }
}

/// S3: the simple polynomial evaluated across 100 inputs.
#[test]
fn s3_polynomial_forward() {
    let _guard = TEST_GUARD.lock().unwrap();
    let backend = backend();
    let ctx = context_on(0);

    let x = ops::data("s3_x", &[], &[5], InitOp::RangeOverOffsets).expect("x");
    x.require_mode(MemoryMode::Hosted);
    x.ensure_host_buffer().expect("host x");
    let three = ops::scalar("s3_three", 3.0).expect("3");
    let neg_four = ops::scalar("s3_neg4", -4.0).expect("-4");
    let five = ops::scalar("s3_five", 5.0).expect("5");
    let x2 = ops::pow("s3_x2", x, 2.0).expect("x^2");
    let t1 = ops::mul("s3_3x2", three, x2).expect("3x^2");
    let t2 = ops::mul("s3_m4x", neg_four, x).expect("-4x");
    let sum = ops::add("s3_sum", t1, t2).expect("sum");
    let f = ops::add("s3_f", sum, five).expect("f");
    let code = ops::forward(f);
    let routine = pipeline::compile_routine(&backend, &ctx, "s3_fwd", &empty_bindings(), &code)
        .expect("compile");
    f.ensure_host_buffer().expect("host f");

    for step in 0..100 {
        let v = (step - 50) as f64;
        x.with_host_buffer_mut(|b| b.fill_from_float(v)).expect("fill x");
        backend.from_host(&ctx, x).expect("upload x");
        routine.schedule().run().expect("run");
        backend.await_device(&ctx.device()).expect("await");
        backend.to_host(&ctx, f).expect("download f");
        let expected = 3.0 * v * v - 4.0 * v + 5.0;
        assert!(
            (read_host(f, &[0]) - expected).abs() < 1e-9,
            "f({v}) = {} expected {expected}",
            read_host(f, &[0])
        );
    }
}

/// S4: einsum broadcasting composition of `3 | 4 -> 2` with `3 | 5 -> 4`.
#[test]
fn s4_einsum_broadcast_contraction() {
    let _guard = TEST_GUARD.lock().unwrap();
    let backend = backend();
    let ctx = context_on(0);

    let a = ops::Term::new("s4_a")
        .batch(RowSpec::Fixed(vec![3]))
        .input(RowSpec::Fixed(vec![4]))
        .output(RowSpec::Fixed(vec![2]))
        .init(InitOp::RangeOverOffsets)
        .build()
        .expect("a");
    let b = ops::Term::new("s4_b")
        .batch(RowSpec::Fixed(vec![3]))
        .input(RowSpec::Fixed(vec![5]))
        .output(RowSpec::Fixed(vec![4]))
        .init(InitOp::RangeOverOffsets)
        .build()
        .expect("b");
    for t in [a, b] {
        t.require_mode(MemoryMode::Hosted);
        t.ensure_host_buffer().expect("host data");
    }
    let c = ops::einsum("s4_c", "...|i->o; ...|...->i => ...|o", a, b).expect("einsum");
    let code = ops::forward(c);
    let routine = pipeline::compile_routine(&backend, &ctx, "s4_fwd", &empty_bindings(), &code)
        .expect("compile");
    c.ensure_host_buffer().expect("host c");

    // Output shape 3 | 5 -> 2, in storage order batch, output, input.
    assert_eq!(c.dims().expect("dims"), vec![3, 2, 5]);

    backend.from_host(&ctx, a).expect("upload a");
    backend.from_host(&ctx, b).expect("upload b");
    routine.schedule().run().expect("run");
    backend.await_device(&ctx.device()).expect("await");
    backend.to_host(&ctx, c).expect("download c");

    for bt in 0..3 {
        for o in 0..2 {
            for j in 0..5 {
                let mut expected = 0.0;
                for k in 0..4 {
                    expected += read_host(a, &[bt, o, k]) * read_host(b, &[bt, k, j]);
                }
                let got = read_host(c, &[bt, o, j]);
                assert!(
                    (got - expected).abs() < 1e-9,
                    "c[{bt},{o},{j}] = {got}, expected {expected}"
                );
            }
        }
    }
}

struct Model {
    loss: Tensor,
    w: Tensor,
    b: Tensor,
    update: train::UpdateRoutine,
    sgd: HlCode,
    bindings: Bindings,
}

fn linear_regression(tag: &str) -> Model {
    let xs = [-1.0, -0.5, 0.0, 0.5, 1.0, 1.5, 2.0, 2.5];
    let ys: Vec<f64> = xs.iter().map(|x| 2.0 * x + 1.0).collect();
    let sample_batch =
        RowSpec::LabeledFixed(vec![(xs.len(), "sample_n".to_string())]);
    let x = ops::Term::new(&format!("x_{tag}"))
        .batch(sample_batch.clone())
        .init(InitOp::ConstantFill { values: xs.to_vec(), strict: true })
        .build()
        .expect("x");
    let y = ops::Term::new(&format!("y_{tag}"))
        .batch(sample_batch)
        .init(InitOp::ConstantFill { values: ys, strict: true })
        .build()
        .expect("y");
    let w = ops::param(&format!("w_{tag}"), &[]).expect("w");
    let b = ops::param(&format!("b_{tag}"), &[]).expect("b");
    let wx = ops::mul(&format!("wx_{tag}"), w, x).expect("wx");
    let pred = ops::add(&format!("pred_{tag}"), wx, b).expect("pred");
    let d = ops::sub(&format!("d_{tag}"), pred, y).expect("d");
    let loss = ops::einsum(&format!("loss_{tag}"), "...|->; ...|-> => |->", d, d).expect("loss");

    let update = train::grad_update(loss).expect("grad update");
    assert_eq!(update.params, vec![w, b]);
    let sgd = train::sgd_update(&update, &SgdConfig { lr: 0.02, ..SgdConfig::default() })
        .expect("sgd");
    let bindings = empty_bindings()
        .extend(StaticBinding::new(Symbol::sample_num(), Some(xs.len())))
        .expect("bindings");
    for t in [x, y, loss, w, b] {
        t.ensure_host_buffer().expect("host buffers");
    }
    Model { loss, w, b, update, sgd, bindings }
}

fn run_parallel(model: &Model, devices: usize, epochs: usize) -> (f64, Vec<Vec<u8>>, Vec<Vec<u8>>) {
    let backend = backend();
    let ctxs: Vec<Arc<dyn Context>> = take_devices(&backend, devices)
        .expect("devices")
        .into_iter()
        .map(|d| backend.init(d).expect("context"))
        .collect();
    assert_eq!(ctxs.len(), devices);
    let grad_updates = ctxs
        .iter()
        .enumerate()
        .map(|(d, ctx)| {
            pipeline::compile_routine(
                &backend,
                ctx,
                &format!("grad_{}_{d}", model.loss.label()),
                &model.bindings,
                &model.update.code,
            )
            .expect("grad compile")
        })
        .collect::<Vec<_>>();
    let sgd = pipeline::compile_routine(
        &backend,
        &ctxs[0],
        &format!("sgd_{}", model.loss.label()),
        &empty_bindings(),
        &model.sgd,
    )
    .expect("sgd compile");

    // Seed parameters and data on every device.
    for ctx in &ctxs {
        for t in model_data(model) {
            backend.from_host(ctx, t).expect("data upload");
        }
    }

    let setup = ParallelUpdate {
        backend: backend.clone(),
        ctxs: ctxs.clone(),
        grad_updates,
        sgd_update: sgd,
        loss_value: model.loss,
        param_values: model.update.params.clone(),
        param_grads: model
            .update
            .params
            .iter()
            .map(|p| p.grad().expect("param grad"))
            .collect(),
        bindings: model.bindings.clone(),
    };
    let mut syncs = 0usize;
    for _ in 0..epochs {
        parallel_update(&setup, |k| {
            assert!(k >= 1 && k <= devices);
            syncs += 1;
            Ok(())
        })
        .expect("parallel update");
    }
    assert_eq!(syncs, epochs * 8 / devices);

    backend.to_host(&ctxs[0], model.loss).expect("loss download");
    let final_loss = read_host(model.loss, &[]);

    // Parameter bytes per device, for the bit-identity check.
    let mut w_bytes = Vec::new();
    let mut b_bytes = Vec::new();
    for ctx in &ctxs {
        backend.to_host(ctx, model.w).expect("w download");
        w_bytes.push(model.w.with_host_buffer(|buf| buf.to_le_bytes()).expect("w bytes"));
        backend.to_host(ctx, model.b).expect("b download");
        b_bytes.push(model.b.with_host_buffer(|buf| buf.to_le_bytes()).expect("b bytes"));
    }
    (final_loss, w_bytes, b_bytes)
}

fn model_data(model: &Model) -> Vec<Tensor> {
    // The hosted leaves feeding the loss: everything with a host buffer.
    let mut out = Vec::new();
    fn go(t: Tensor, out: &mut Vec<Tensor>, seen: &mut std::collections::HashSet<Tensor>) {
        if !seen.insert(t) {
            return;
        }
        if t.children().is_empty() && t.is_hosted() && !out.contains(&t) {
            out.push(t);
        }
        for child in t.children() {
            go(child, out, seen);
        }
    }
    go(model.loss, &mut out, &mut std::collections::HashSet::new());
    out
}

/// S6: two-device round-robin training matches a single-device baseline and
/// leaves parameters bit-identical across devices.
#[test]
fn s6_parallel_update_convergence() {
    let _guard = TEST_GUARD.lock().unwrap();

    let baseline = linear_regression("base");
    let (loss_one, _, _) = run_parallel(&baseline, 1, 50);

    let model = linear_regression("par");
    let (loss_two, w_bytes, b_bytes) = run_parallel(&model, 2, 50);

    // Parameters are bit-identical across devices after the final sync.
    assert_eq!(w_bytes[0], w_bytes[1], "w diverged across devices");
    assert_eq!(b_bytes[0], b_bytes[1], "b diverged across devices");

    // Both runs converge to the target line.
    let w = model.w.with_host_buffer(|b| b.get_as_float(&[]).unwrap()).unwrap();
    let b = model.b.with_host_buffer(|b| b.get_as_float(&[]).unwrap()).unwrap();
    assert!((w - 2.0).abs() < 0.25, "w = {w}");
    assert!((b - 1.0).abs() < 0.25, "b = {b}");

    // The parallel loss lands near the single-device baseline.
    assert!(loss_two.abs() < 0.5, "two-device loss {loss_two}");
    assert!((loss_one - loss_two).abs() < 0.5, "baseline {loss_one} vs parallel {loss_two}");
}
