use relaylink::{new_correlation_id, ClientEvent, ClientSettings, RelayClient};
use tokio::sync::broadcast::error::RecvError;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Reads RELAY_BASE_URL, RELAY_SERVICE_PATH and friends (from .env when present)
    #[cfg(feature = "env-file")]
    let settings = ClientSettings::from_env_file("RELAY")?;
    #[cfg(not(feature = "env-file"))]
    let settings = ClientSettings::from_env("RELAY")?;
    let client = RelayClient::connect_default(settings)?;

    let mut events = client.messages();
    let mut status = client.connection_status();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(ClientEvent::Frame(frame)) => println!("frame: {:?}", frame),
                    Ok(ClientEvent::Error(e)) => println!("error: {}", e),
                    Err(RecvError::Lagged(missed)) => println!("missed {} events", missed),
                    Err(RecvError::Closed) => break,
                },
                change = status.recv() => match change {
                    Ok(change) => println!("connection: {:?}", change),
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                },
            }
        }
    });

    let request = json!({ "id": new_correlation_id(), "type": "ping" });
    println!("Sending {}", request);
    match client.send_message::<_, Value>(&request).await {
        Ok(reply) => println!("Reply: {}", reply),
        Err(e) => {
            println!("Request failed: {}", e);
            if let Some(hint) = e.hint() {
                println!("Hint: {}", hint);
            }
        }
    }

    client.dispose();
    Ok(())
}
