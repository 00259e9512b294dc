use msgsync_engine::{
    init_tracing, CacheEvent, EngineConfig, LoopbackBackend, MessageSyncEngine, SendRequest,
};
use msgsync_messaging::{conversation_id, ConversationType, Message};
use std::sync::Arc;
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = EngineConfig::from_env()?;
    let account_id = std::env::var("MSGSYNC_ACCOUNT_ID").unwrap_or_else(|_| "demo".to_string());
    let peer_id = std::env::var("MSGSYNC_PEER_ID").unwrap_or_else(|_| "peer".to_string());

    let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
    let backend = Arc::new(LoopbackBackend::new(account_id.clone()).with_events(event_tx));
    let engine = MessageSyncEngine::new(config, backend, account_id.clone());
    engine.listen(event_rx);

    let mut changes = engine.subscribe();
    let observer = tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(CacheEvent::MessagesUpserted {
                    conversation_id,
                    client_ids,
                }) => info!(%conversation_id, count = client_ids.len(), "messages upserted"),
                Ok(event) => info!(?event, "cache changed"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "observer lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let conversation = conversation_id(&account_id, ConversationType::P2p, &peer_id);
    engine.select_conversation(Some(&conversation));
    info!(%account_id, %conversation, "starting loopback session");

    let sent = engine
        .send_message(SendRequest::new(
            &conversation,
            Message::text(&conversation, "hello from msgsync"),
        ))
        .await?;
    engine.pin_message(&conversation, &sent.client_id, None).await?;
    let pinned = engine.pinned_messages(&conversation).await?;
    info!(count = pinned.len(), "pinned messages loaded");

    engine.recall_message(&conversation, &sent.client_id).await?;
    for message in engine.messages(&conversation) {
        info!(
            client_id = message.client_id(),
            can_edit = message.can_edit(),
            "cached message"
        );
    }

    engine.dispose();
    drop(engine);
    observer.await?;
    Ok(())
}
