//! The gateway engine: shard orchestration and event dispatch.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use ember_http::RestClient;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::error::GatewayError;
use crate::intents::Intents;
use crate::ratelimit::LeakyGate;
use crate::shard::Shard;
use crate::IDENTIFY_WINDOW;

/// Whether a frame was received from or sent to the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    /// The synthetic listener key matching this direction.
    fn key(self) -> &'static str {
        match self {
            Direction::Inbound => "GATEWAY_RECEIVE",
            Direction::Outbound => "GATEWAY_SEND",
        }
    }
}

/// Boxed event handler: `(shard, frame)` to a future.
type Handler = Arc<dyn Fn(Arc<Shard>, Value) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Routes frames to registered listeners and owns the panic channel.
pub(crate) struct Dispatcher {
    /// Listener lists keyed by upper-cased event name.
    listeners: DashMap<String, Vec<Handler>>,
}

impl Dispatcher {
    fn new() -> Self {
        Self {
            listeners: DashMap::new(),
        }
    }

    fn add(&self, event: &str, handler: Handler) {
        self.listeners
            .entry(event.to_uppercase())
            .or_default()
            .push(handler);
    }

    /// Spawn the listeners for one frame.
    ///
    /// Spawn order is name listeners, then the direction key, then `*`; the
    /// spawned tasks run concurrently with one another and with later
    /// frames.
    pub(crate) fn dispatch(&self, shard: &Arc<Shard>, direction: Direction, frame: &Value) {
        let name = frame
            .get("t")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| {
                format!("OP_{}", frame.get("op").and_then(Value::as_u64).unwrap_or_default())
            });

        for key in [name.as_str(), direction.key(), "*"] {
            if let Some(handlers) = self.listeners.get(key) {
                for handler in handlers.iter() {
                    let handler = Arc::clone(handler);
                    let shard = Arc::clone(shard);
                    let frame = frame.clone();
                    tokio::spawn(async move { handler(shard, frame).await });
                }
            }
        }
    }

    /// Terminate the process after an unrecoverable gateway close.
    pub(crate) fn panic(&self, code: u16) -> ! {
        error!(code, "fatal gateway close code");
        std::process::exit(1);
    }
}

/// A multi-shard gateway client.
///
/// Owns the REST client reference, the intents, the shard set, and the
/// listener table. [`start`](Self::start) discovers the recommended shard
/// count and identify concurrency from `/gateway/bot`, spawns one task per
/// shard, and runs until terminated.
pub struct GatewayEngine {
    rest: Arc<RestClient>,
    intents: Intents,
    shard_ids: Option<Vec<u16>>,
    shard_count: Option<u16>,
    shards: RwLock<Vec<Arc<Shard>>>,
    dispatcher: Arc<Dispatcher>,
}

impl GatewayEngine {
    pub fn new(rest: Arc<RestClient>, intents: Intents) -> Self {
        Self {
            rest,
            intents,
            shard_ids: None,
            shard_count: None,
            shards: RwLock::new(Vec::new()),
            dispatcher: Arc::new(Dispatcher::new()),
        }
    }

    /// Run only these shard ids. Without an explicit count the total is the
    /// number of ids given.
    pub fn with_shard_ids(mut self, ids: Vec<u16>) -> Self {
        self.shard_ids = Some(ids);
        self
    }

    /// Override the total shard count.
    pub fn with_shard_count(mut self, count: u16) -> Self {
        self.shard_count = Some(count);
        self
    }

    /// Register a listener for an event.
    ///
    /// Names are case-insensitive. Besides dispatch names (`MESSAGE_CREATE`,
    /// ...) and opcode names (`OP_11`), three synthetic keys exist:
    /// `GATEWAY_SEND` (any outbound frame), `GATEWAY_RECEIVE` (any inbound
    /// frame), and `*` (every frame, both directions).
    pub fn add_listener<F, Fut>(&self, event: &str, handler: F)
    where
        F: Fn(Arc<Shard>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: Handler = Arc::new(
            move |shard: Arc<Shard>, frame: Value| -> Pin<Box<dyn Future<Output = ()> + Send>> {
                Box::pin(handler(shard, frame))
            },
        );
        self.dispatcher.add(event, handler);
    }

    /// Shards currently managed by the engine. Empty before `start`.
    pub fn shards(&self) -> Vec<Arc<Shard>> {
        self.shards.read().clone()
    }

    /// Connect every shard and run until terminated.
    pub async fn start(&self) -> Result<(), GatewayError> {
        let bot = self.rest.get_gateway_bot().await?;
        let max_concurrency = bot.session_start_limit.max_concurrency.max(1) as usize;
        let identify_gate = Arc::new(LeakyGate::new(max_concurrency, IDENTIFY_WINDOW));

        let shard_count = self
            .shard_count
            .or_else(|| self.shard_ids.as_ref().map(|ids| ids.len() as u16))
            .unwrap_or(bot.shards)
            .max(1);
        let shard_ids = self
            .shard_ids
            .clone()
            .unwrap_or_else(|| (0..shard_count).collect());

        info!(?shard_ids, shard_count, max_concurrency, "starting gateway engine");

        {
            let mut shards = self.shards.write();
            shards.clear();
            for id in shard_ids {
                shards.push(Shard::new(
                    id,
                    shard_count,
                    Arc::clone(&self.rest),
                    self.intents,
                    Arc::clone(&identify_gate),
                    Arc::clone(&self.dispatcher),
                ));
            }
        }

        let mut handles: Vec<JoinHandle<Result<(), GatewayError>>> = Vec::new();
        for shard in self.shards() {
            handles.push(tokio::spawn(async move { shard.run().await }));
        }

        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => return Err(error),
                Err(join) => error!(error = %join, "shard task panicked"),
            }
        }

        Ok(())
    }

    /// Ask every shard to close and stop reconnecting.
    pub fn shutdown(&self) {
        info!("shutting down gateway engine");
        for shard in self.shards() {
            shard.shutdown();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn test_shard(dispatcher: &Arc<Dispatcher>) -> Arc<Shard> {
        let rest = Arc::new(RestClient::new("test_token").unwrap());
        let gate = Arc::new(LeakyGate::new(1, IDENTIFY_WINDOW));
        Shard::new(0, 1, rest, Intents::default(), gate, Arc::clone(dispatcher))
    }

    fn recording_handler(log: &Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> Handler {
        let log = Arc::clone(log);
        Arc::new(
            move |_shard: Arc<Shard>, _frame: Value| -> Pin<Box<dyn Future<Output = ()> + Send>> {
                log.lock().unwrap().push(tag);
                Box::pin(async {})
            },
        )
    }

    #[tokio::test]
    async fn test_dispatch_order_is_name_direction_star() {
        let dispatcher = Arc::new(Dispatcher::new());
        let shard = test_shard(&dispatcher);
        let log = Arc::new(Mutex::new(Vec::new()));

        dispatcher.add("*", recording_handler(&log, "star"));
        dispatcher.add("GATEWAY_RECEIVE", recording_handler(&log, "direction"));
        dispatcher.add("MESSAGE_CREATE", recording_handler(&log, "name"));

        let frame = json!({"op": 0, "t": "MESSAGE_CREATE", "s": 1, "d": {}});
        dispatcher.dispatch(&shard, Direction::Inbound, &frame);

        // Handlers record synchronously when their tasks first run.
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert_eq!(*log.lock().unwrap(), vec!["name", "direction", "star"]);
    }

    #[tokio::test]
    async fn test_dispatch_names_are_case_insensitive() {
        let dispatcher = Arc::new(Dispatcher::new());
        let shard = test_shard(&dispatcher);
        let log = Arc::new(Mutex::new(Vec::new()));

        dispatcher.add("message_create", recording_handler(&log, "lower"));

        let frame = json!({"op": 0, "t": "MESSAGE_CREATE", "d": {}});
        dispatcher.dispatch(&shard, Direction::Inbound, &frame);

        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert_eq!(*log.lock().unwrap(), vec!["lower"]);
    }

    #[tokio::test]
    async fn test_frames_without_names_use_opcode_key() {
        let dispatcher = Arc::new(Dispatcher::new());
        let shard = test_shard(&dispatcher);
        let log = Arc::new(Mutex::new(Vec::new()));

        dispatcher.add("OP_11", recording_handler(&log, "ack"));

        let frame = json!({"op": 11});
        dispatcher.dispatch(&shard, Direction::Inbound, &frame);

        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert_eq!(*log.lock().unwrap(), vec!["ack"]);
    }

    #[tokio::test]
    async fn test_outbound_frames_do_not_match_receive_key() {
        let dispatcher = Arc::new(Dispatcher::new());
        let shard = test_shard(&dispatcher);
        let log = Arc::new(Mutex::new(Vec::new()));

        dispatcher.add("GATEWAY_RECEIVE", recording_handler(&log, "receive"));
        dispatcher.add("GATEWAY_SEND", recording_handler(&log, "send"));

        let frame = json!({"op": 1, "d": null});
        dispatcher.dispatch(&shard, Direction::Outbound, &frame);

        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert_eq!(*log.lock().unwrap(), vec!["send"]);
    }
}
