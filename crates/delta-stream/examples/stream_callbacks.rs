use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use delta_stream::init_observability;
use delta_stream::prelude::*;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), StreamError> {
    let _ = dotenvy::dotenv();
    init_observability();

    let client = StreamClient::from_config(StreamClientConfig::from_env()?)?;
    let batches = Arc::new(AtomicUsize::new(0));
    let counter = batches.clone();

    let handle = client.start_stream(
        StreamRequest::new("Count to ten, one number per line."),
        FnCallbacks::new(
            move |text: &str| {
                counter.fetch_add(1, Ordering::Relaxed);
                print!("{text}");
            },
            || println!("\n[done]"),
            |error: StreamError| eprintln!("\n[error] {error}"),
        ),
    );
    println!("session {}", handle.session_id());

    let state = handle.wait().await;
    println!(
        "final state {state:?} after {} batches",
        batches.load(Ordering::Relaxed)
    );
    Ok(())
}
