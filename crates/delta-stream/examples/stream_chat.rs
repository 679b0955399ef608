use std::io::Write as _;

use delta_stream::init_observability;
use delta_stream::prelude::*;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), StreamError> {
    let _ = dotenvy::dotenv();
    init_observability();

    let prompt = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    let prompt = if prompt.trim().is_empty() {
        "Stream a short greeting.".to_string()
    } else {
        prompt
    };

    let client = StreamClient::from_config(StreamClientConfig::from_env()?)?;
    let mut stream = client.start_event_stream(StreamRequest::new(prompt));

    while let Some(event) = stream.next_event().await {
        match event {
            StreamEvent::Chunk { text } => {
                print!("{text}");
                let _ = std::io::stdout().flush();
            }
            StreamEvent::Completed => println!(),
            StreamEvent::Error { error } => eprintln!("\nstream error: {error}"),
        }
    }
    Ok(())
}
