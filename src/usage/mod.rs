// Usage record publishing. The sink is non-blocking: records are dropped on
// backpressure rather than stalling a request path.

use once_cell::sync::OnceCell;
use tokio::sync::mpsc;

use crate::ir::Usage;

#[derive(Debug, Clone)]
pub struct Record {
    pub provider: String,
    pub model: String,
    /// Account identity: email, api key, or auth id.
    pub source: String,
    pub api_key: String,
    pub auth_id: String,
    pub requested_at: chrono::DateTime<chrono::Utc>,
    pub failed: bool,
    pub usage: Option<Usage>,
}

static SINK: OnceCell<mpsc::Sender<Record>> = OnceCell::new();

/// Installs the sink once; later calls are ignored. Returns the receiver the
/// persistence layer drains.
pub fn install_sink(capacity: usize) -> Option<mpsc::Receiver<Record>> {
    let (tx, rx) = mpsc::channel(capacity);
    match SINK.set(tx) {
        Ok(()) => Some(rx),
        Err(_) => None,
    }
}

/// Publishes a record; drops it when no sink is installed or the channel is
/// full.
pub fn publish(record: Record) {
    let Some(sink) = SINK.get() else {
        return;
    };
    if let Err(err) = sink.try_send(record) {
        tracing::debug!("usage record dropped: {err}");
    }
}

/// Builds and publishes a record for one completed (or failed) request.
pub fn publish_request(
    provider: &str,
    model: &str,
    source: &str,
    auth_id: &str,
    requested_at: chrono::DateTime<chrono::Utc>,
    failed: bool,
    usage: Option<Usage>,
) {
    // Empty successes carry no information.
    if !failed && usage.map(|u| u.is_empty()).unwrap_or(true) {
        return;
    }
    publish(Record {
        provider: provider.to_string(),
        model: model.to_string(),
        source: source.to_string(),
        api_key: String::new(),
        auth_id: auth_id.to_string(),
        requested_at,
        failed,
        usage,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_sink_is_a_noop() {
        // No sink installed in this process yet; must not panic.
        publish_request(
            "gemini",
            "gemini-2.5-flash",
            "u@example.com",
            "a1",
            chrono::Utc::now(),
            false,
            Some(Usage {
                prompt_tokens: 1,
                completion_tokens: 1,
                total_tokens: 2,
                ..Default::default()
            }),
        );
    }

    #[test]
    fn empty_successes_are_elided() {
        publish_request(
            "gemini",
            "m",
            "s",
            "a",
            chrono::Utc::now(),
            false,
            Some(Usage::default()),
        );
        publish_request("gemini", "m", "s", "a", chrono::Utc::now(), false, None);
    }
}
