use std::error::Error;
use std::sync::Arc;

use rtm_client::stream::client::SessionClient;
use rtm_client::stream::proto::{HELLO, MESSAGE};
use rtm_client::stream::router::EventRouter;
use secrecy::SecretString;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let token = std::env::var("RTM_TOKEN").unwrap_or_else(|_| "REPLACE_WITH_BOT_TOKEN".to_string());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let router = Arc::new(EventRouter::new());
        router.handle_fn(HELLO, |_event, client| async move {
            println!("connected as {}", client.session_id().unwrap_or_default());
        })?;
        router.handle_fn(MESSAGE, |event, client| async move {
            // Skip our own echoes and message subtypes without text.
            if event.text.is_empty() || Some(&event.sender) == client.session_id().as_ref() {
                return;
            }
            if let Err(err) = client
                .send_message(event.channel.clone(), format!("echo: {}", event.text))
                .await
            {
                eprintln!("reply failed: {err}");
            }
        })?;

        let client = SessionClient::new(SecretString::new(token), router)?;
        client.connect().await?;

        let receiver = tokio::spawn({
            let client = client.clone();
            async move { client.dispatch().await }
        });

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                client.shutdown().await?;
            }
            terminated = receiver => {
                println!("receive loop ended: {}", terminated?);
            }
        }
        client.close().await;

        Ok::<(), Box<dyn Error>>(())
    })
}
