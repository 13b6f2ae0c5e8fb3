//! Benchmarks for the Python executor.
//!
//! Run with: cargo bench
//!
//! These benchmarks require rustpython.wasm to be present at assets/rustpython.wasm

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use wasm_python_executor::prelude::*;
use wasm_python_executor::global_cache;

/// Get the path to the interpreter, checking if it exists.
fn get_interpreter_path() -> Option<std::path::PathBuf> {
    let path = std::path::PathBuf::from("assets/rustpython.wasm");
    if path.exists() {
        Some(path)
    } else {
        None
    }
}

fn config_for(path: &std::path::Path) -> ExecutorConfig {
    ExecutorConfig::builder()
        .interpreter_path(path)
        .max_memory(128 * 1024 * 1024)
        .build()
}

/// Benchmark cold start (compilation without the artifact cache).
fn bench_cold_start(c: &mut Criterion) {
    let Some(interpreter_path) = get_interpreter_path() else {
        eprintln!("Skipping cold_start benchmark: rustpython.wasm not found");
        return;
    };

    let mut group = c.benchmark_group("cold_start");
    group.sample_size(10); // Reduced sample size due to compilation time

    group.bench_function("executor_creation_no_cache", |b| {
        let config = ExecutorConfig {
            cache_compiled_runtime: false,
            ..config_for(&interpreter_path)
        };
        b.iter(|| black_box(Executor::new(config.clone()).unwrap()));
    });

    group.finish();
}

/// Benchmark warm start (precompiled artifact reused).
fn bench_warm_start(c: &mut Criterion) {
    let Some(interpreter_path) = get_interpreter_path() else {
        eprintln!("Skipping warm_start benchmark: rustpython.wasm not found");
        return;
    };

    let config = config_for(&interpreter_path);
    drop(Executor::new(config.clone()).unwrap());
    assert!(global_cache().contains(&interpreter_path));

    let mut group = c.benchmark_group("warm_start");
    group.bench_function("executor_creation_with_cache", |b| {
        b.iter(|| black_box(Executor::new(config.clone()).unwrap()));
    });
    group.finish();
}

/// Benchmark Python code execution.
fn bench_execution(c: &mut Criterion) {
    let Some(interpreter_path) = get_interpreter_path() else {
        eprintln!("Skipping execution benchmark: rustpython.wasm not found");
        return;
    };

    let mut executor = Executor::new(config_for(&interpreter_path)).unwrap();
    let mut group = c.benchmark_group("execution");

    group.bench_function("simple_print", |b| {
        b.iter(|| black_box(executor.execute("print(1 + 1)").unwrap()));
    });

    group.bench_function("loop_100", |b| {
        b.iter(|| {
            black_box(
                executor
                    .execute("total = 0\nfor i in range(100): total += i\ntotal")
                    .unwrap(),
            )
        });
    });

    group.bench_function("tool_call", |b| {
        let mut tools = ToolRegistry::new();
        tools
            .insert_fn("echo", |call| Ok(call.arg(0).cloned().unwrap_or(Value::None)))
            .unwrap();
        executor.send_tools(tools).unwrap();
        b.iter(|| black_box(executor.execute("echo('ping')").unwrap()));
    });

    group.finish();
}

/// Benchmark rehydration cost as the persisted state grows.
fn bench_state_size(c: &mut Criterion) {
    let Some(interpreter_path) = get_interpreter_path() else {
        eprintln!("Skipping state_size benchmark: rustpython.wasm not found");
        return;
    };

    let mut group = c.benchmark_group("state_size");
    group.sample_size(10);

    for bindings in [10usize, 100, 1000] {
        group.bench_with_input(
            BenchmarkId::new("bindings", bindings),
            &bindings,
            |b, &bindings| {
                let mut executor = Executor::new(config_for(&interpreter_path)).unwrap();
                executor
                    .send_variables((0..bindings).map(|i| (format!("v{i}"), Value::Int(i as i64))))
                    .unwrap();
                b.iter(|| black_box(executor.execute("v0 + 1").unwrap()));
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_cold_start,
    bench_warm_start,
    bench_execution,
    bench_state_size,
);

criterion_main!(benches);
