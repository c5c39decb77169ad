//! Bounded, order-preserving parallel map.
//!
//! A fixed number of workers drain a shared work list. Each worker claims the
//! next index with an atomic increment, so every item is processed exactly
//! once and at most `concurrency` calls are in flight. Results land in a
//! pre-sized slot vector at the claimed index, which keeps input order.

use futures::future::join_all;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Map `f` over `items` with at most `concurrency` futures in flight,
/// returning results in input order.
pub async fn parallel_map<T, R, F, Fut>(items: &[T], concurrency: usize, f: F) -> Vec<R>
where
    F: Fn(&T) -> Fut,
    Fut: Future<Output = R>,
{
    if items.is_empty() {
        return Vec::new();
    }

    let workers = concurrency.clamp(1, items.len());
    let cursor = AtomicUsize::new(0);
    let cursor = &cursor;
    let f = &f;

    let finished = join_all((0..workers).map(move |_| async move {
        let mut done = Vec::new();
        loop {
            let index = cursor.fetch_add(1, Ordering::SeqCst);
            let Some(item) = items.get(index) else {
                break;
            };
            done.push((index, f(item).await));
        }
        done
    }))
    .await;

    let mut slots: Vec<Option<R>> = std::iter::repeat_with(|| None).take(items.len()).collect();
    for (index, result) in finished.into_iter().flatten() {
        if let Some(slot) = slots.get_mut(index) {
            *slot = Some(result);
        }
    }
    slots.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_preserves_input_order() {
        let items: Vec<u64> = (0..25).collect();
        // Later items finish first
        let results = parallel_map(&items, 4, |n| {
            let n = *n;
            async move {
                tokio::time::sleep(Duration::from_millis(30 - n)).await;
                n * 10
            }
        })
        .await;

        assert_eq!(results, items.iter().map(|n| n * 10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_bounds_concurrency() {
        let in_flight = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let (in_flight, peak) = (&in_flight, &peak);
        let items: Vec<usize> = (0..40).collect();

        let results = parallel_map(&items, 10, move |n| {
            let n = *n;
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                n
            }
        })
        .await;

        assert_eq!(results.len(), 40);
        assert!(peak.load(Ordering::SeqCst) <= 10);
        assert!(peak.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let items: Vec<u8> = Vec::new();
        let results = parallel_map(&items, 10, |n| {
            let n = *n;
            async move { n }
        })
        .await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_zero_concurrency_still_runs() {
        let items = vec!["a", "b"];
        let results = parallel_map(&items, 0, |s| {
            let s = s.to_uppercase();
            async move { s }
        })
        .await;
        assert_eq!(results, vec!["A", "B"]);
    }
}
