use super::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[tokio::test]
async fn limits_concurrent_requests() {
    let throttle = Arc::new(Throttle::new(2, Duration::ZERO));
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..6)
        .map(|_| {
            let throttle = Arc::clone(&throttle);
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            tokio::spawn(async move {
                let _permit = throttle.acquire().await.expect("should acquire");
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            })
        })
        .collect();

    for task in tasks {
        task.await.expect("task should finish");
    }

    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(throttle.available(), 2);
}

#[tokio::test]
async fn spaces_out_request_starts() {
    let throttle = Throttle::new(4, Duration::from_millis(50));
    let started = Instant::now();

    for _ in 0..3 {
        let _permit = throttle.acquire().await.expect("should acquire");
    }

    // The first start is immediate, the next two wait one interval each
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[tokio::test]
async fn closed_throttle_refuses_requests() {
    let throttle = Throttle::new(1, Duration::ZERO);
    throttle.close();
    assert!(throttle.acquire().await.is_err());
}

#[tokio::test]
async fn permit_outlives_the_task_that_acquired_it() {
    let throttle = Throttle::new(1, Duration::ZERO);
    let permit = throttle.acquire().await.expect("should acquire");

    let holder = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(permit);
    });
    assert_eq!(throttle.available(), 0);

    holder.await.expect("holder should finish");
    assert_eq!(throttle.available(), 1);
}
