//! Benchmarks the transaction commit path across the host strategies a
//! real backend might report support for: direct RWX writes, suspend-based
//! writes on a host without RWX, and the staged-segment path.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use interceptor_core::backend::testing::{TestBackend, TestCodeAllocator, TestOs};
use interceptor_core::backend::Backend;
use interceptor_core::context::{ContextKind, FunctionContext};
use interceptor_core::transaction::{self, Transaction, UpdateKind};
use std::sync::Arc;

fn build_transaction(backend: &TestBackend, os: &TestOs, count: usize) -> Transaction {
    let mut tx = Transaction::new();
    tx.begin();

    for i in 0..count {
        let target = 0x10000 + i * 64;
        let created = backend.create_trampoline(target).unwrap();
        let ctx = Arc::new(FunctionContext::new(
            target,
            ContextKind::Default,
            created.handle,
            created.on_invoke_trampoline,
            created.on_leave_trampoline,
            created.overwritten_prologue_len,
        ));
        tx.schedule_update(ctx, UpdateKind::Activate, os.page_size(), target);
    }

    tx
}

fn bench_commit_rwx(c: &mut Criterion) {
    c.bench_function("commit_100_functions_rwx_supported", |b| {
        b.iter(|| {
            let backend = TestBackend::new();
            let allocator = TestCodeAllocator::new();
            let os = TestOs::with_rwx(true, false);
            let mut tx = build_transaction(&backend, &os, black_box(100));
            let taken = tx.take_if_outermost().unwrap();
            transaction::commit(&taken, &backend, &allocator, &os);
        })
    });
}

fn bench_commit_suspend_required(c: &mut Criterion) {
    c.bench_function("commit_100_functions_no_rwx_suspends_threads", |b| {
        b.iter(|| {
            let backend = TestBackend::new();
            let allocator = TestCodeAllocator::new();
            let os = TestOs::with_rwx(false, false);
            for id in 1..=8u64 {
                os.suspend_thread(id);
            }
            let mut tx = build_transaction(&backend, &os, black_box(100));
            let taken = tx.take_if_outermost().unwrap();
            transaction::commit(&taken, &backend, &allocator, &os);
        })
    });
}

fn bench_commit_staged_segment(c: &mut Criterion) {
    c.bench_function("commit_100_functions_staged_segment", |b| {
        b.iter(|| {
            let backend = TestBackend::new();
            let allocator = TestCodeAllocator::new();
            let os = TestOs::with_rwx(false, true);
            let mut tx = build_transaction(&backend, &os, black_box(100));
            let taken = tx.take_if_outermost().unwrap();
            transaction::commit(&taken, &backend, &allocator, &os);
        })
    });
}

criterion_group!(
    benches,
    bench_commit_rwx,
    bench_commit_suspend_required,
    bench_commit_staged_segment
);
criterion_main!(benches);
