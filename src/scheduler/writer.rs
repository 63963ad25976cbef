use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::event::{Event, EventReceiver};

const FLUSH_INTERVAL: Duration = Duration::from_secs(2);
const BATCH_SIZE: usize = 500;

/// Serialize events as JSON lines, writing a batch every two seconds or
/// every 500 events, and the remainder once the channel closes.
pub async fn run_event_writer<W>(mut rx: EventReceiver, mut out: W)
where
    W: AsyncWrite + Unpin,
{
    let mut buffer: Vec<Box<dyn Event>> = Vec::with_capacity(BATCH_SIZE);
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(event) => {
                        buffer.push(event);
                        if buffer.len() >= BATCH_SIZE {
                            flush_buffer(&mut out, &mut buffer).await;
                        }
                    }
                    None => {
                        flush_buffer(&mut out, &mut buffer).await;
                        break;
                    }
                }
            }
            _ = interval.tick() => {
                flush_buffer(&mut out, &mut buffer).await;
            }
        }
    }
    tracing::debug!("event writer stopped");
}

fn encode(event: &dyn Event) -> String {
    let line = json!({
        "type": event.get_type(),
        "data": event.as_map_str(),
    });
    let mut text = line.to_string();
    text.push('\n');
    text
}

async fn flush_buffer<W: AsyncWrite + Unpin>(out: &mut W, buffer: &mut Vec<Box<dyn Event>>) {
    if buffer.is_empty() {
        return;
    }

    let text: String = buffer.iter().map(|e| encode(e.as_ref())).collect();
    let written = async {
        out.write_all(text.as_bytes()).await?;
        out.flush().await
    };
    if let Err(e) = written.await {
        tracing::error!("failed to write {} events: {}", buffer.len(), e);
    }

    buffer.clear();
}
