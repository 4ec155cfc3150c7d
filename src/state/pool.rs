//! Optional bounded fan-out for per-device work.
//!
//! With one worker items run inline on the calling thread. With more, each
//! item runs in a blocking task and a semaphore caps how many are in flight.
//! Results always come back in input order.

use anyhow::{Context, Result, anyhow};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Run `task` over `items` with at most `workers` in flight
pub fn run_bounded<T, R, F>(workers: usize, items: Vec<T>, task: F) -> Vec<Result<R>>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Result<R> + Send + Sync + 'static,
{
    if workers <= 1 || items.len() <= 1 {
        return items.into_iter().map(task).collect();
    }

    match build_runtime() {
        Ok(runtime) => runtime.block_on(run_parallel(workers, items, task)),
        Err(e) => {
            tracing::warn!(error = %e, "falling back to sequential execution");
            items.into_iter().map(task).collect()
        }
    }
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")
}

async fn run_parallel<T, R, F>(workers: usize, items: Vec<T>, task: F) -> Vec<Result<R>>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Result<R> + Send + Sync + 'static,
{
    let semaphore = Arc::new(Semaphore::new(workers));
    let task = Arc::new(task);
    let mut handles = Vec::with_capacity(items.len());

    for item in items {
        let permit = semaphore.clone().acquire_owned().await;
        let task = task.clone();
        handles.push(tokio::spawn(async move {
            let permit = permit.map_err(|e| anyhow!("worker pool closed: {}", e))?;
            let result = tokio::task::spawn_blocking(move || task(item))
                .await
                .map_err(|e| anyhow!("worker task panicked: {}", e))?;
            drop(permit);
            result
        }));
    }

    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        results.push(
            handle
                .await
                .unwrap_or_else(|e| Err(anyhow!("worker task failed: {}", e))),
        );
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_sequential_keeps_order_and_errors() {
        let results = run_bounded(1, vec![1, 2, 3], |n| {
            if n == 2 {
                Err(anyhow!("two failed"))
            } else {
                Ok(n * 10)
            }
        });

        assert_eq!(results.len(), 3);
        assert_eq!(*results[0].as_ref().unwrap(), 10);
        assert_eq!(results[1].as_ref().unwrap_err().to_string(), "two failed");
        assert_eq!(*results[2].as_ref().unwrap(), 30);
    }

    #[test]
    fn test_parallel_results_in_input_order() {
        // Earlier items sleep longer so they finish last
        let results = run_bounded(4, (0..8u64).collect(), |n| {
            std::thread::sleep(Duration::from_millis((8 - n) * 5));
            Ok(n)
        });

        let values: Vec<u64> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_parallel_respects_bound() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, p) = (active.clone(), peak.clone());

        let results = run_bounded(2, (0..6).collect::<Vec<u32>>(), move |_| {
            let now = a.fetch_add(1, Ordering::SeqCst) + 1;
            p.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            a.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(results.iter().all(|r| r.is_ok()));
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
