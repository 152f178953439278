//! CPU-bound worker pool.
//!
//! A small abstraction over "apply a pure function to a list in parallel":
//! explicit worker count, explicit batch size, no assumption about the
//! underlying concurrency primitive. The BM25 builder is the main consumer
//! (HTML flattening and tokenization dominate cold builds).

use std::sync::atomic::{AtomicUsize, Ordering};

/// Worker count: the `CQA_TOKENIZE_WORKERS` override when set, otherwise
/// half the available cores, at least one.
pub fn default_workers() -> usize {
    if let Ok(value) = std::env::var("CQA_TOKENIZE_WORKERS") {
        if let Ok(n) = value.parse::<usize>() {
            return n.max(1);
        }
    }
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cores / 2).max(1)
}

/// Batch size that amortises per-batch bookkeeping across workers.
pub fn batch_size(len: usize, workers: usize) -> usize {
    (len / (workers.max(1) * 10)).max(1)
}

/// Map `f` over `items` with `workers` threads. Output order matches input
/// order. Items are claimed in batches so small inputs do not pay a
/// per-item synchronisation cost.
pub fn parallel_map<T, R, F>(items: &[T], workers: usize, f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
{
    if items.is_empty() {
        return Vec::new();
    }

    let workers = workers.max(1).min(items.len());
    if workers == 1 {
        return items.iter().map(&f).collect();
    }

    let batch = batch_size(items.len(), workers);
    let batches = items.len().div_ceil(batch);
    let cursor = AtomicUsize::new(0);

    let collected: Vec<Vec<(usize, R)>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                scope.spawn(|| {
                    let mut local = Vec::new();
                    loop {
                        let i = cursor.fetch_add(1, Ordering::Relaxed);
                        if i >= batches {
                            break;
                        }
                        let start = i * batch;
                        let end = (start + batch).min(items.len());
                        for (offset, item) in items[start..end].iter().enumerate() {
                            local.push((start + offset, f(item)));
                        }
                    }
                    local
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("worker thread panicked"))
            .collect()
    });

    let mut results: Vec<Option<R>> = (0..items.len()).map(|_| None).collect();
    for chunk in collected {
        for (i, r) in chunk {
            results[i] = Some(r);
        }
    }
    results.into_iter().flatten().collect()
}
