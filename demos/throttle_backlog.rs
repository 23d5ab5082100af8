//! Demonstrates the concurrency throttle: a burst larger than the serving pool waits in the
//! backlog, and whatever does not fit the backlog is turned away immediately.
use std::time::Duration;
use tollgate::{cancel_pair, CancelSignal, ConcurrencyThrottle};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::DEBUG).init();

    let throttle = ConcurrencyThrottle::with_backlog(2, 3, Duration::from_millis(500))?;
    println!("=== tollgate: throttle with 2 serving slots, 3 backlog slots ===\n");

    let mut handles = Vec::new();
    for i in 0..8 {
        let throttle = throttle.clone();
        handles.push(tokio::spawn(async move {
            let outcome = throttle
                .execute(&CancelSignal::never(), || async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok::<_, std::io::Error>(i)
                })
                .await;
            (i, outcome)
        }));
    }

    for handle in handles {
        let (i, outcome) = handle.await?;
        match outcome {
            Ok(_) => println!("request {i}: served"),
            Err(e) => println!("request {i}: rejected ({e})"),
        }
    }

    // A queued request whose caller gives up.
    let held = throttle.acquire(&CancelSignal::never()).await?;
    let _second = throttle.acquire(&CancelSignal::never()).await?;
    let (handle, signal) = cancel_pair();
    let waiter = tokio::spawn({
        let throttle = throttle.clone();
        async move { throttle.acquire(&signal).await.map(drop) }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.cancel();
    println!("\ncancelled waiter: {:?}", waiter.await?);
    drop(held);

    println!("stats: {:?}", throttle.stats());
    Ok(())
}
