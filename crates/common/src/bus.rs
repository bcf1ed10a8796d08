//! Thin abstraction over an in-memory key/value + pub/sub bus.
//!
//! Backed by Redis. Connection loss surfaces as [`crate::error::CoreError::Unavailable`]
//! so callers can treat it as transient and retry on their own tick.

use std::time::Duration;

use futures_util::StreamExt;
use redis::aio::{ConnectionManager, PubSub};
use redis::AsyncCommands;

use crate::error::{CoreError, CoreResult};

#[derive(Clone)]
pub struct BusClient {
    conn: ConnectionManager,
    client: redis::Client,
}

/// A cancellable handle to a pub/sub subscription.
pub struct Subscription {
    pubsub: PubSub,
}

impl Subscription {
    /// Block for the next message on this topic, or `None` if the
    /// subscription's connection drops.
    pub async fn next(&mut self) -> Option<Vec<u8>> {
        let mut stream = self.pubsub.on_message();
        stream.next().await.map(|m| m.get_payload_bytes().to_vec())
    }
}

impl BusClient {
    pub async fn connect(url: &str) -> CoreResult<Self> {
        let client = redis::Client::open(url).map_err(CoreError::from)?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(CoreError::from)?;
        Ok(Self { conn, client })
    }

    /// Publish raw bytes to a topic. Returns the number of subscribers
    /// that received the message.
    pub async fn publish(&self, topic: &str, payload: &[u8]) -> CoreResult<i64> {
        let mut conn = self.conn.clone();
        let n: i64 = conn.publish(topic, payload).await.map_err(CoreError::from)?;
        Ok(n)
    }

    /// Subscribe to a topic. The returned handle owns a dedicated
    /// connection; drop it (or let its task be cancelled) to unsubscribe.
    pub async fn subscribe(&self, topic: &str) -> CoreResult<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(CoreError::from)?;
        pubsub.subscribe(topic).await.map_err(CoreError::from)?;
        Ok(Subscription { pubsub })
    }

    /// Push a value onto the tail of a FIFO queue.
    pub async fn push(&self, queue: &str, payload: &[u8]) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.rpush(queue, payload).await.map_err(CoreError::from)?;
        Ok(())
    }

    /// Push a value onto the head of a FIFO queue (used for high-priority
    /// interrupt redirects that must be processed before anything queued).
    pub async fn push_front(&self, queue: &str, payload: &[u8]) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.lpush(queue, payload).await.map_err(CoreError::from)?;
        Ok(())
    }

    /// Pop from the head of a queue, blocking up to `timeout`. Returns
    /// `None` on timeout (not an error — this is the normal IDLE-loop path).
    pub async fn blocking_pop(&self, queue: &str, timeout: Duration) -> CoreResult<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let result: Option<(String, Vec<u8>)> = conn
            .blpop(queue, timeout.as_secs_f64())
            .await
            .map_err(CoreError::from)?;
        Ok(result.map(|(_, v)| v))
    }

    pub async fn hash_set(&self, key: &str, field: &str, value: &str) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset(key, field, value).await.map_err(CoreError::from)?;
        Ok(())
    }

    pub async fn hash_set_multiple(&self, key: &str, fields: &[(&str, &str)]) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset_multiple(key, fields).await.map_err(CoreError::from)?;
        Ok(())
    }

    pub async fn hash_get_all(&self, key: &str) -> CoreResult<std::collections::HashMap<String, String>> {
        let mut conn = self.conn.clone();
        let map: std::collections::HashMap<String, String> =
            conn.hgetall(key).await.map_err(CoreError::from)?;
        Ok(map)
    }

    pub async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(key, value, ttl.as_secs())
            .await
            .map_err(CoreError::from)?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> CoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        let v: Option<String> = conn.get(key).await.map_err(CoreError::from)?;
        Ok(v)
    }

    /// Push to the head of a bounded list, trimming it to `max_len`.
    pub async fn list_push_trim(&self, key: &str, value: &[u8], max_len: isize) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.rpush(key, value).await.map_err(CoreError::from)?;
        let _: () = conn
            .ltrim(key, -max_len, -1)
            .await
            .map_err(CoreError::from)?;
        Ok(())
    }

    pub async fn set_add(&self, key: &str, member: &str) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.sadd(key, member).await.map_err(CoreError::from)?;
        Ok(())
    }

    pub async fn set_remove(&self, key: &str, member: &str) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.srem(key, member).await.map_err(CoreError::from)?;
        Ok(())
    }

    pub async fn set_members(&self, key: &str) -> CoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(key).await.map_err(CoreError::from)?;
        Ok(members)
    }

    pub async fn expire(&self, key: &str, seconds: i64) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.expire(key, seconds).await.map_err(CoreError::from)?;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(key).await.map_err(CoreError::from)?;
        Ok(())
    }

    /// Lightweight connectivity check used by the health aggregator.
    pub async fn ping(&self) -> bool {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .is_ok()
    }
}

/// Session-scoped bus key helpers, centralizing the `session:{id}:…` namespace.
pub mod keys {
    pub fn state(session_id: &str) -> String {
        format!("session:{session_id}:state")
    }
    pub fn input(session_id: &str) -> String {
        format!("session:{session_id}:input")
    }
    pub fn output(session_id: &str) -> String {
        format!("session:{session_id}:output")
    }
    pub fn output_buffer(session_id: &str) -> String {
        format!("session:{session_id}:output_buffer")
    }
    pub fn result(session_id: &str) -> String {
        format!("session:{session_id}:result")
    }
    pub fn interrupt(session_id: &str) -> String {
        format!("session:{session_id}:interrupt")
    }
    pub fn interrupt_queue(session_id: &str) -> String {
        format!("session:{session_id}:interrupt_queue")
    }
    pub fn discord_response(session_id: &str, interaction_id: &str) -> String {
        format!("session:{session_id}:discord:response:{interaction_id}")
    }
    pub const ACTIVE_SESSIONS: &str = "active_sessions";
}

#[cfg(test)]
mod tests {
    use super::keys;

    #[test]
    fn key_namespace_matches_spec() {
        assert_eq!(keys::state("abc"), "session:abc:state");
        assert_eq!(keys::input("abc"), "session:abc:input");
        assert_eq!(keys::output("abc"), "session:abc:output");
        assert_eq!(keys::output_buffer("abc"), "session:abc:output_buffer");
        assert_eq!(keys::result("abc"), "session:abc:result");
        assert_eq!(keys::interrupt("abc"), "session:abc:interrupt");
        assert_eq!(keys::interrupt_queue("abc"), "session:abc:interrupt_queue");
        assert_eq!(
            keys::discord_response("abc", "i1"),
            "session:abc:discord:response:i1"
        );
        assert_eq!(keys::ACTIVE_SESSIONS, "active_sessions");
    }
}
