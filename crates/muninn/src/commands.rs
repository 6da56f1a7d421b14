//! The typed operation surface.
//!
//! Every operation here is a catalog entry made executable: name tokens,
//! key positions, read/write class, and post-decode transform declared
//! through the [`Cmd`] builder, then dispatched through the router. The
//! encoders are pure; none of them inspect argument bytes.

use std::time::Duration;

use bytes::Bytes;
use muninn_core::{Aggregate, Error, SubscriptionKind};

use crate::cmd::{Cmd, cmd, cmd2};
use crate::value::Value;
use crate::Client;

/// Existence condition for `SET` and `ZADD`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SetCondition {
    #[default]
    Always,
    /// `NX`: only when absent.
    IfAbsent,
    /// `XX`: only when present.
    IfExists,
}

/// Expiration clause for `SET`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Expiration {
    /// `EX seconds`
    Seconds(i64),
    /// `PX milliseconds`
    Millis(i64),
    /// `EXAT unix-seconds`
    AtSeconds(i64),
    /// `PXAT unix-milliseconds`
    AtMillis(i64),
    /// `KEEPTTL`
    KeepTtl,
}

/// Options for `SET`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SetOptions {
    pub condition: SetCondition,
    pub expiration: Option<Expiration>,
}

/// Options for `ZADD`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ZAddOptions {
    pub condition: SetCondition,
    /// `CH`: count changed members instead of added members.
    pub changed: bool,
}

fn apply_set_options(mut c: Cmd, options: SetOptions) -> Cmd {
    match options.condition {
        SetCondition::Always => {}
        SetCondition::IfAbsent => c = c.arg("NX"),
        SetCondition::IfExists => c = c.arg("XX"),
    }
    match options.expiration {
        None => {}
        Some(Expiration::Seconds(s)) => c = c.arg("EX").arg_int(s),
        Some(Expiration::Millis(ms)) => c = c.arg("PX").arg_int(ms),
        Some(Expiration::AtSeconds(at)) => c = c.arg("EXAT").arg_int(at),
        Some(Expiration::AtMillis(at)) => c = c.arg("PXAT").arg_int(at),
        Some(Expiration::KeepTtl) => c = c.arg("KEEPTTL"),
    }
    c
}

impl Client {
    // --- connection ---------------------------------------------------

    pub async fn ping(&self) -> Result<(), Error> {
        let value = self.run(cmd("PING")).await?;
        match value {
            Value::Simple(status) if status == "PONG" => Ok(()),
            other => Err(Error::new(
                muninn_core::ErrorKind::Protocol,
                format!("unexpected PING reply {other:?}"),
            )),
        }
    }

    pub async fn echo(&self, message: impl Into<Bytes>) -> Result<Value, Error> {
        self.run(cmd("ECHO").arg(message)).await
    }

    pub async fn client_id(&self) -> Result<i64, Error> {
        self.run(cmd2("CLIENT", "ID")).await?.into_integer()
    }

    pub async fn info(&self) -> Result<String, Error> {
        let value = self.run(cmd("INFO")).await?;
        value
            .as_text()
            .ok_or_else(|| Error::new(muninn_core::ErrorKind::Protocol, "non-text INFO reply"))
    }

    /// `WAIT numreplicas timeout`.
    pub async fn wait(&self, replicas: i64, timeout_ms: i64) -> Result<i64, Error> {
        self.run(cmd("WAIT").arg_int(replicas).arg_int(timeout_ms))
            .await?
            .into_integer()
    }

    // --- strings ------------------------------------------------------

    pub async fn get(&self, key: impl Into<Bytes>) -> Result<Value, Error> {
        self.run(cmd("GET").key(key).readonly()).await
    }

    pub async fn set(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<(), Error> {
        self.run(cmd("SET").key(key).arg(value)).await?.into_ok()
    }

    /// `SET` with options; returns `Null` when an `NX`/`XX` condition
    /// failed, `OK` otherwise.
    pub async fn set_with(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        options: SetOptions,
    ) -> Result<Value, Error> {
        self.run(apply_set_options(cmd("SET").key(key).arg(value), options))
            .await
    }

    pub async fn getdel(&self, key: impl Into<Bytes>) -> Result<Value, Error> {
        self.run(cmd("GETDEL").key(key)).await
    }

    pub async fn append(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Result<i64, Error> {
        self.run(cmd("APPEND").key(key).arg(value)).await?.into_integer()
    }

    pub async fn strlen(&self, key: impl Into<Bytes>) -> Result<i64, Error> {
        self.run(cmd("STRLEN").key(key).readonly()).await?.into_integer()
    }

    pub async fn incr(&self, key: impl Into<Bytes>) -> Result<i64, Error> {
        self.run(cmd("INCR").key(key)).await?.into_integer()
    }

    pub async fn decr(&self, key: impl Into<Bytes>) -> Result<i64, Error> {
        self.run(cmd("DECR").key(key)).await?.into_integer()
    }

    pub async fn incr_by(&self, key: impl Into<Bytes>, delta: i64) -> Result<i64, Error> {
        self.run(cmd("INCRBY").key(key).arg_int(delta)).await?.into_integer()
    }

    pub async fn mget(
        &self,
        keys: impl IntoIterator<Item = impl Into<Bytes>>,
    ) -> Result<Vec<Value>, Error> {
        self.run(cmd("MGET").keys(keys).readonly()).await?.into_array()
    }

    pub async fn mset<K, V>(&self, pairs: impl IntoIterator<Item = (K, V)>) -> Result<(), Error>
    where
        K: Into<Bytes>,
        V: Into<Bytes>,
    {
        let mut c = cmd("MSET");
        for (key, value) in pairs {
            c = c.key(key).arg(value);
        }
        self.run(c).await?.into_ok()
    }

    // --- keys ---------------------------------------------------------

    pub async fn del(
        &self,
        keys: impl IntoIterator<Item = impl Into<Bytes>>,
    ) -> Result<i64, Error> {
        self.run(cmd("DEL").keys(keys)).await?.into_integer()
    }

    pub async fn exists(
        &self,
        keys: impl IntoIterator<Item = impl Into<Bytes>>,
    ) -> Result<i64, Error> {
        self.run(cmd("EXISTS").keys(keys).readonly()).await?.into_integer()
    }

    pub async fn expire(&self, key: impl Into<Bytes>, seconds: i64) -> Result<bool, Error> {
        self.run(cmd("EXPIRE").key(key).arg_int(seconds)).await?.into_bool()
    }

    pub async fn ttl(&self, key: impl Into<Bytes>) -> Result<i64, Error> {
        self.run(cmd("TTL").key(key).readonly()).await?.into_integer()
    }

    pub async fn pttl(&self, key: impl Into<Bytes>) -> Result<i64, Error> {
        self.run(cmd("PTTL").key(key).readonly()).await?.into_integer()
    }

    pub async fn persist(&self, key: impl Into<Bytes>) -> Result<bool, Error> {
        self.run(cmd("PERSIST").key(key)).await?.into_bool()
    }

    pub async fn type_of(&self, key: impl Into<Bytes>) -> Result<String, Error> {
        let value = self.run(cmd("TYPE").key(key).readonly()).await?;
        value
            .as_text()
            .ok_or_else(|| Error::new(muninn_core::ErrorKind::Protocol, "non-text TYPE reply"))
    }

    pub async fn keys(&self, pattern: impl Into<Bytes>) -> Result<Vec<Value>, Error> {
        self.run(cmd("KEYS").arg(pattern).readonly()).await?.into_array()
    }

    pub async fn dbsize(&self) -> Result<i64, Error> {
        self.run(cmd("DBSIZE").readonly()).await?.into_integer()
    }

    pub async fn flushdb(&self) -> Result<(), Error> {
        self.run(cmd("FLUSHDB")).await?.into_ok()
    }

    /// `DUMP`: the server's opaque serialization of a key, or `None` when
    /// the key is absent.
    pub async fn dump(&self, key: impl Into<Bytes>) -> Result<Option<Bytes>, Error> {
        match self.run(cmd("DUMP").key(key).readonly()).await? {
            Value::Null => Ok(None),
            value => value.into_bytes().map(Some),
        }
    }

    /// `RESTORE`: recreate a key from a `DUMP` payload.
    pub async fn restore(
        &self,
        key: impl Into<Bytes>,
        ttl_ms: i64,
        payload: impl Into<Bytes>,
    ) -> Result<(), Error> {
        self.run(cmd("RESTORE").key(key).arg_int(ttl_ms).arg(payload))
            .await?
            .into_ok()
    }

    // --- hashes -------------------------------------------------------

    pub async fn hset<F, V>(
        &self,
        key: impl Into<Bytes>,
        pairs: impl IntoIterator<Item = (F, V)>,
    ) -> Result<i64, Error>
    where
        F: Into<Bytes>,
        V: Into<Bytes>,
    {
        let mut c = cmd("HSET").key(key);
        for (field, value) in pairs {
            c = c.arg(field).arg(value);
        }
        self.run(c).await?.into_integer()
    }

    pub async fn hget(
        &self,
        key: impl Into<Bytes>,
        field: impl Into<Bytes>,
    ) -> Result<Value, Error> {
        self.run(cmd("HGET").key(key).arg(field).readonly()).await
    }

    pub async fn hdel(
        &self,
        key: impl Into<Bytes>,
        fields: impl IntoIterator<Item = impl Into<Bytes>>,
    ) -> Result<i64, Error> {
        self.run(cmd("HDEL").key(key).args(fields)).await?.into_integer()
    }

    pub async fn hexists(
        &self,
        key: impl Into<Bytes>,
        field: impl Into<Bytes>,
    ) -> Result<bool, Error> {
        self.run(cmd("HEXISTS").key(key).arg(field).readonly())
            .await?
            .into_bool()
    }

    pub async fn hgetall(&self, key: impl Into<Bytes>) -> Result<Value, Error> {
        self.run(cmd("HGETALL").key(key).readonly()).await
    }

    pub async fn hkeys(&self, key: impl Into<Bytes>) -> Result<Vec<Value>, Error> {
        self.run(cmd("HKEYS").key(key).readonly()).await?.into_array()
    }

    pub async fn hvals(&self, key: impl Into<Bytes>) -> Result<Vec<Value>, Error> {
        self.run(cmd("HVALS").key(key).readonly()).await?.into_array()
    }

    pub async fn hlen(&self, key: impl Into<Bytes>) -> Result<i64, Error> {
        self.run(cmd("HLEN").key(key).readonly()).await?.into_integer()
    }

    pub async fn hincr_by(
        &self,
        key: impl Into<Bytes>,
        field: impl Into<Bytes>,
        delta: i64,
    ) -> Result<i64, Error> {
        self.run(cmd("HINCRBY").key(key).arg(field).arg_int(delta))
            .await?
            .into_integer()
    }

    // --- lists --------------------------------------------------------

    pub async fn lpush(
        &self,
        key: impl Into<Bytes>,
        values: impl IntoIterator<Item = impl Into<Bytes>>,
    ) -> Result<i64, Error> {
        self.run(cmd("LPUSH").key(key).args(values)).await?.into_integer()
    }

    pub async fn rpush(
        &self,
        key: impl Into<Bytes>,
        values: impl IntoIterator<Item = impl Into<Bytes>>,
    ) -> Result<i64, Error> {
        self.run(cmd("RPUSH").key(key).args(values)).await?.into_integer()
    }

    pub async fn lpop(&self, key: impl Into<Bytes>) -> Result<Value, Error> {
        self.run(cmd("LPOP").key(key)).await
    }

    pub async fn rpop(&self, key: impl Into<Bytes>) -> Result<Value, Error> {
        self.run(cmd("RPOP").key(key)).await
    }

    /// `LRANGE`: an empty list (never nil) when the range selects
    /// nothing.
    pub async fn lrange(
        &self,
        key: impl Into<Bytes>,
        start: i64,
        stop: i64,
    ) -> Result<Vec<Value>, Error> {
        self.run(cmd("LRANGE").key(key).arg_int(start).arg_int(stop).readonly())
            .await?
            .into_array()
    }

    pub async fn llen(&self, key: impl Into<Bytes>) -> Result<i64, Error> {
        self.run(cmd("LLEN").key(key).readonly()).await?.into_integer()
    }

    pub async fn lindex(&self, key: impl Into<Bytes>, index: i64) -> Result<Value, Error> {
        self.run(cmd("LINDEX").key(key).arg_int(index).readonly()).await
    }

    pub async fn lrem(
        &self,
        key: impl Into<Bytes>,
        count: i64,
        value: impl Into<Bytes>,
    ) -> Result<i64, Error> {
        self.run(cmd("LREM").key(key).arg_int(count).arg(value))
            .await?
            .into_integer()
    }

    /// `BLPOP` with a server-side timeout in seconds.
    ///
    /// The client-side deadline is set just past the server timeout so
    /// the server answers first. A server timeout of `0` blocks
    /// indefinitely server-side while the configured request timeout
    /// still applies client-side; use [`Client::blpop_indefinitely`] to
    /// opt out of the client deadline entirely.
    pub async fn blpop(
        &self,
        keys: impl IntoIterator<Item = impl Into<Bytes>>,
        timeout_secs: f64,
    ) -> Result<Value, Error> {
        let mut c = cmd("BLPOP")
            .keys(keys)
            .arg(format_block_timeout(timeout_secs))
            .blocking();
        if timeout_secs > 0.0 {
            c = c.timeout(Duration::from_secs_f64(timeout_secs) + Duration::from_secs(1));
        }
        self.run(c).await
    }

    /// `BLPOP 0`: block on the server forever, with no client deadline.
    pub async fn blpop_indefinitely(
        &self,
        keys: impl IntoIterator<Item = impl Into<Bytes>>,
    ) -> Result<Value, Error> {
        self.run(cmd("BLPOP").keys(keys).arg("0").blocking().no_deadline())
            .await
    }

    // --- sets ---------------------------------------------------------

    pub async fn sadd(
        &self,
        key: impl Into<Bytes>,
        members: impl IntoIterator<Item = impl Into<Bytes>>,
    ) -> Result<i64, Error> {
        self.run(cmd("SADD").key(key).args(members)).await?.into_integer()
    }

    pub async fn srem(
        &self,
        key: impl Into<Bytes>,
        members: impl IntoIterator<Item = impl Into<Bytes>>,
    ) -> Result<i64, Error> {
        self.run(cmd("SREM").key(key).args(members)).await?.into_integer()
    }

    /// `SMEMBERS`: always a [`Value::Set`], whichever protocol version is
    /// on the wire.
    pub async fn smembers(&self, key: impl Into<Bytes>) -> Result<Value, Error> {
        self.run(cmd("SMEMBERS").key(key).readonly().to_set()).await
    }

    pub async fn sismember(
        &self,
        key: impl Into<Bytes>,
        member: impl Into<Bytes>,
    ) -> Result<bool, Error> {
        self.run(cmd("SISMEMBER").key(key).arg(member).readonly())
            .await?
            .into_bool()
    }

    pub async fn scard(&self, key: impl Into<Bytes>) -> Result<i64, Error> {
        self.run(cmd("SCARD").key(key).readonly()).await?.into_integer()
    }

    pub async fn spop(&self, key: impl Into<Bytes>) -> Result<Value, Error> {
        self.run(cmd("SPOP").key(key)).await
    }

    // --- sorted sets --------------------------------------------------

    pub async fn zadd<M>(
        &self,
        key: impl Into<Bytes>,
        entries: impl IntoIterator<Item = (f64, M)>,
        options: ZAddOptions,
    ) -> Result<i64, Error>
    where
        M: Into<Bytes>,
    {
        let mut c = cmd("ZADD").key(key);
        match options.condition {
            SetCondition::Always => {}
            SetCondition::IfAbsent => c = c.arg("NX"),
            SetCondition::IfExists => c = c.arg("XX"),
        }
        if options.changed {
            c = c.arg("CH");
        }
        for (score, member) in entries {
            c = c.arg_float(score).arg(member);
        }
        self.run(c).await?.into_integer()
    }

    pub async fn zscore(
        &self,
        key: impl Into<Bytes>,
        member: impl Into<Bytes>,
    ) -> Result<Option<f64>, Error> {
        match self
            .run(cmd("ZSCORE").key(key).arg(member).readonly())
            .await?
        {
            Value::Null => Ok(None),
            value => value.into_double().map(Some),
        }
    }

    pub async fn zrange(
        &self,
        key: impl Into<Bytes>,
        start: i64,
        stop: i64,
    ) -> Result<Vec<Value>, Error> {
        self.run(cmd("ZRANGE").key(key).arg_int(start).arg_int(stop).readonly())
            .await?
            .into_array()
    }

    pub async fn zrange_by_score(
        &self,
        key: impl Into<Bytes>,
        min: f64,
        max: f64,
    ) -> Result<Vec<Value>, Error> {
        self.run(
            cmd("ZRANGE")
                .key(key)
                .arg_float(min)
                .arg_float(max)
                .arg("BYSCORE")
                .readonly(),
        )
        .await?
        .into_array()
    }

    pub async fn zrem(
        &self,
        key: impl Into<Bytes>,
        members: impl IntoIterator<Item = impl Into<Bytes>>,
    ) -> Result<i64, Error> {
        self.run(cmd("ZREM").key(key).args(members)).await?.into_integer()
    }

    pub async fn zcard(&self, key: impl Into<Bytes>) -> Result<i64, Error> {
        self.run(cmd("ZCARD").key(key).readonly()).await?.into_integer()
    }

    pub async fn zincr_by(
        &self,
        key: impl Into<Bytes>,
        delta: f64,
        member: impl Into<Bytes>,
    ) -> Result<f64, Error> {
        self.run(cmd("ZINCRBY").key(key).arg_float(delta).arg(member))
            .await?
            .into_double()
    }

    pub async fn zrank(
        &self,
        key: impl Into<Bytes>,
        member: impl Into<Bytes>,
    ) -> Result<Option<i64>, Error> {
        match self.run(cmd("ZRANK").key(key).arg(member).readonly()).await? {
            Value::Null => Ok(None),
            value => value.into_integer().map(Some),
        }
    }

    // --- optimistic locking -------------------------------------------

    /// `WATCH`: arm optimistic locking for a following transaction.
    pub async fn watch(
        &self,
        keys: impl IntoIterator<Item = impl Into<Bytes>>,
    ) -> Result<(), Error> {
        self.run(cmd("WATCH").keys(keys)).await?.into_ok()
    }

    pub async fn unwatch(&self) -> Result<(), Error> {
        self.run(cmd("UNWATCH")).await?.into_ok()
    }

    // --- pub/sub ------------------------------------------------------

    pub async fn publish(
        &self,
        channel: impl Into<Bytes>,
        message: impl Into<Bytes>,
    ) -> Result<i64, Error> {
        self.run(cmd("PUBLISH").arg(channel).arg(message)).await?.into_integer()
    }

    /// `SPUBLISH`: sharded publish, routed by the channel's hash slot.
    pub async fn spublish(
        &self,
        channel: impl Into<Bytes>,
        message: impl Into<Bytes>,
    ) -> Result<i64, Error> {
        self.run(cmd("SPUBLISH").key(channel).arg(message)).await?.into_integer()
    }

    pub async fn subscribe(
        &self,
        channels: impl IntoIterator<Item = impl Into<Bytes>>,
    ) -> Result<(), Error> {
        let channels: Vec<Bytes> = channels.into_iter().map(Into::into).collect();
        let conn = self.router.subscribe_connection().await?;
        self.router
            .send_subscribe(&conn, SubscriptionKind::Exact, &channels)
    }

    pub async fn unsubscribe(
        &self,
        channels: impl IntoIterator<Item = impl Into<Bytes>>,
    ) -> Result<(), Error> {
        let channels: Vec<Bytes> = channels.into_iter().map(Into::into).collect();
        let conn = self.router.subscribe_connection().await?;
        self.router
            .send_unsubscribe(&conn, SubscriptionKind::Exact, &channels)
    }

    pub async fn psubscribe(
        &self,
        patterns: impl IntoIterator<Item = impl Into<Bytes>>,
    ) -> Result<(), Error> {
        let patterns: Vec<Bytes> = patterns.into_iter().map(Into::into).collect();
        let conn = self.router.subscribe_connection().await?;
        self.router
            .send_subscribe(&conn, SubscriptionKind::Pattern, &patterns)
    }

    pub async fn punsubscribe(
        &self,
        patterns: impl IntoIterator<Item = impl Into<Bytes>>,
    ) -> Result<(), Error> {
        let patterns: Vec<Bytes> = patterns.into_iter().map(Into::into).collect();
        let conn = self.router.subscribe_connection().await?;
        self.router
            .send_unsubscribe(&conn, SubscriptionKind::Pattern, &patterns)
    }

    /// Shard-channel subscribe; each channel lands on the shard that owns
    /// its hash slot.
    pub async fn ssubscribe(
        &self,
        channels: impl IntoIterator<Item = impl Into<Bytes>>,
    ) -> Result<(), Error> {
        for channel in channels {
            let channel: Bytes = channel.into();
            let conn = self.router.shard_subscribe_connection(&channel).await?;
            self.router.send_subscribe(
                &conn,
                SubscriptionKind::Shard,
                std::slice::from_ref(&channel),
            )?;
        }
        Ok(())
    }

    pub async fn sunsubscribe(
        &self,
        channels: impl IntoIterator<Item = impl Into<Bytes>>,
    ) -> Result<(), Error> {
        for channel in channels {
            let channel: Bytes = channel.into();
            let conn = self.router.shard_subscribe_connection(&channel).await?;
            self.router.send_unsubscribe(
                &conn,
                SubscriptionKind::Shard,
                std::slice::from_ref(&channel),
            )?;
        }
        Ok(())
    }

    /// `PUBSUB CHANNELS`: currently-active channels.
    ///
    /// The reply is an ordinary request/response; it is not ordered with
    /// respect to messages sitting in the pull queue.
    pub async fn pubsub_channels(
        &self,
        pattern: Option<Bytes>,
    ) -> Result<Vec<Value>, Error> {
        let mut c = cmd2("PUBSUB", "CHANNELS").readonly();
        if let Some(pattern) = pattern {
            c = c.arg(pattern);
        }
        self.run(c).await?.into_array()
    }

    // --- broadcast ----------------------------------------------------

    /// `PING` every primary; succeeds if any node answers.
    pub async fn ping_all(&self) -> Result<(), Error> {
        let command = cmd("PING")
            .route(muninn_core::Route::AllPrimaries)
            .into_command();
        self.router
            .broadcast(&command, Aggregate::FirstNonError)
            .await
            .map(|_| ())
    }

    /// Total `DBSIZE` across all primaries.
    pub async fn dbsize_total(&self) -> Result<i64, Error> {
        let command = cmd("DBSIZE")
            .route(muninn_core::Route::AllPrimaries)
            .readonly()
            .into_command();
        let frame = self.router.broadcast(&command, Aggregate::Sum).await?;
        Value::from_frame(frame, self.decode_mode())?.into_integer()
    }

    /// `KEYS` on every primary, concatenated.
    pub async fn keys_all(&self, pattern: impl Into<Bytes>) -> Result<Vec<Value>, Error> {
        let command = cmd("KEYS")
            .arg(pattern)
            .route(muninn_core::Route::AllPrimaries)
            .readonly()
            .into_command();
        let frame = self.router.broadcast(&command, Aggregate::Concat).await?;
        Value::from_frame(frame, self.decode_mode())?.into_array()
    }

    /// `FLUSHDB` on every primary.
    pub async fn flushdb_all(&self) -> Result<(), Error> {
        let command = cmd("FLUSHDB")
            .route(muninn_core::Route::AllPrimaries)
            .into_command();
        self.router
            .broadcast(&command, Aggregate::Pairs)
            .await
            .map(|_| ())
    }
}

fn format_block_timeout(timeout_secs: f64) -> String {
    if timeout_secs == timeout_secs.trunc() {
        format!("{}", timeout_secs as i64)
    } else {
        format!("{timeout_secs}")
    }
}
