//! Batch chunk iterator tests.

use loreforge::chunk::{ChunkConfig, for_each_chunk};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Calls = Arc<Mutex<Vec<(usize, usize)>>>;

fn paged_fetch(
    data: Vec<u32>,
    calls: Calls,
) -> impl FnMut(usize, usize) -> std::future::Ready<Result<Vec<u32>, String>> {
    move |skip, take| {
        calls.lock().unwrap().push((skip, take));
        let page: Vec<u32> = data.iter().copied().skip(skip).take(take).collect();
        std::future::ready(Ok(page))
    }
}

// ---------------------------------------------------------------------------
// Pagination shape
// ---------------------------------------------------------------------------

#[tokio::test]
async fn twelve_items_in_chunks_of_five() {
    let calls: Calls = Arc::default();
    let seen: Arc<Mutex<Vec<u32>>> = Arc::default();

    let process = {
        let seen = seen.clone();
        move |item: u32| {
            seen.lock().unwrap().push(item);
            std::future::ready(Ok::<(), String>(()))
        }
    };

    let stats = for_each_chunk(
        &ChunkConfig::new(5),
        paged_fetch((0..12).collect(), calls.clone()),
        process,
    )
    .await
    .unwrap();

    // Three fetches; the short third page ends the sweep without a fourth.
    assert_eq!(*calls.lock().unwrap(), vec![(0, 5), (5, 5), (10, 5)]);
    assert_eq!(stats.pages, 3);
    assert_eq!(stats.processed, 12);
    assert_eq!(stats.failed, 0);
    // Items arrive sequentially in page order.
    assert_eq!(*seen.lock().unwrap(), (0..12).collect::<Vec<u32>>());
}

#[tokio::test]
async fn empty_dataset_fetches_once_and_processes_nothing() {
    let calls: Calls = Arc::default();

    let stats = for_each_chunk(
        &ChunkConfig::new(5),
        paged_fetch(vec![], calls.clone()),
        |_item: u32| std::future::ready(Ok::<(), String>(())),
    )
    .await
    .unwrap();

    assert_eq!(*calls.lock().unwrap(), vec![(0, 5)]);
    assert_eq!(stats.pages, 0);
    assert_eq!(stats.processed, 0);
}

#[tokio::test]
async fn exact_multiple_needs_a_trailing_empty_fetch() {
    let calls: Calls = Arc::default();

    let stats = for_each_chunk(
        &ChunkConfig::new(5),
        paged_fetch((0..10).collect(), calls.clone()),
        |_item: u32| std::future::ready(Ok::<(), String>(())),
    )
    .await
    .unwrap();

    // Full pages give no end-of-data signal; the empty third page does.
    assert_eq!(*calls.lock().unwrap(), vec![(0, 5), (5, 5), (10, 5)]);
    assert_eq!(stats.pages, 2);
    assert_eq!(stats.processed, 10);
}

// ---------------------------------------------------------------------------
// Failure policy: skip and log
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failing_item_is_skipped_and_the_sweep_continues() {
    let calls: Calls = Arc::default();

    let stats = for_each_chunk(
        &ChunkConfig::new(5),
        paged_fetch((0..12).collect(), calls.clone()),
        |item: u32| {
            std::future::ready(if item == 7 {
                Err("stale context reference".to_string())
            } else {
                Ok(())
            })
        },
    )
    .await
    .unwrap();

    assert_eq!(stats.processed, 11);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.pages, 3);
}

#[tokio::test]
async fn fetch_error_aborts_the_sweep() {
    let processed = Arc::new(Mutex::new(0usize));

    let fetch = |skip: usize, take: usize| {
        std::future::ready(if skip == 0 {
            Ok((0..take as u32).collect::<Vec<u32>>())
        } else {
            Err("downstream unavailable".to_string())
        })
    };
    let process = {
        let processed = processed.clone();
        move |_item: u32| {
            *processed.lock().unwrap() += 1;
            std::future::ready(Ok::<(), String>(()))
        }
    };

    let result = for_each_chunk(&ChunkConfig::new(5), fetch, process).await;

    assert!(result.is_err());
    assert_eq!(*processed.lock().unwrap(), 5);
}

// ---------------------------------------------------------------------------
// Inter-chunk delay
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn delay_is_applied_between_full_pages() {
    let start = tokio::time::Instant::now();

    for_each_chunk(
        &ChunkConfig::new(5).with_delay(Duration::from_secs(1)),
        paged_fetch((0..12).collect(), Arc::default()),
        |_item: u32| std::future::ready(Ok::<(), String>(())),
    )
    .await
    .unwrap();

    // Two full pages each wait out the delay; the short final page doesn't.
    assert_eq!(start.elapsed(), Duration::from_secs(2));
}
