//! Per-connection command loop and dispatch.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use muninn_proto::{Decoder, Frame, ServerError, encode_frame, hash_slot};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::store::{Entry, dump_entry, glob_match, restore_entry};
use crate::{ConnSubs, ServerShared};

pub(crate) struct ConnCtx {
    pub id: u64,
    pub authed: bool,
    pub resp3: bool,
    pub asking: bool,
    pub name: Option<Bytes>,
    pub watched: Vec<(Bytes, u64)>,
    pub queued: Option<Vec<Vec<Bytes>>>,
    pub dirty: bool,
}

fn err(msg: impl Into<String>) -> Frame {
    Frame::Error(ServerError::parse(Bytes::from(msg.into())))
}

fn ok() -> Frame {
    Frame::simple("OK")
}

fn int(value: i64) -> Frame {
    Frame::Integer(value)
}

pub(crate) async fn run_conn(stream: TcpStream, shared: Arc<ServerShared>) {
    let id = shared.next_conn.fetch_add(1, Ordering::Relaxed);
    let (push_tx, mut push_rx) = mpsc::unbounded_channel::<Frame>();
    shared.subs.lock().conns.insert(
        id,
        ConnSubs {
            channels: Default::default(),
            patterns: Default::default(),
            shard_channels: Default::default(),
            push: push_tx,
        },
    );

    let mut ctx = ConnCtx {
        id,
        authed: shared.options.password.is_none(),
        resp3: false,
        asking: false,
        name: None,
        watched: Vec::new(),
        queued: None,
        dirty: false,
    };

    let (mut reader, mut writer) = stream.into_split();
    let mut decoder = Decoder::new();
    let mut out = BytesMut::with_capacity(4 * 1024);

    'conn: loop {
        tokio::select! {
            push = push_rx.recv() => {
                let Some(frame) = push else { break };
                out.clear();
                encode_frame(&mut out, &frame);
                if writer.write_all(&out).await.is_err() {
                    break;
                }
            }
            read = reader.read_buf(decoder.buffer_mut()) => {
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                loop {
                    let frame = match decoder.decode() {
                        Ok(Some(frame)) => frame,
                        Ok(None) => break,
                        Err(_) => break 'conn,
                    };
                    let Some(parts) = command_parts(frame) else {
                        break 'conn;
                    };
                    let quit = parts
                        .first()
                        .map(|name| name.eq_ignore_ascii_case(b"QUIT"))
                        .unwrap_or(false);

                    let replies = handle(&shared, &mut ctx, parts).await;
                    out.clear();
                    for reply in &replies {
                        encode_frame(&mut out, reply);
                    }
                    if !out.is_empty() && writer.write_all(&out).await.is_err() {
                        break 'conn;
                    }
                    if quit {
                        break 'conn;
                    }
                }
            }
        }
    }

    shared.subs.lock().conns.remove(&id);
}

fn command_parts(frame: Frame) -> Option<Vec<Bytes>> {
    let Frame::Array(items) = frame else {
        return None;
    };
    items
        .into_iter()
        .map(|item| match item {
            Frame::Bulk(data) | Frame::Simple(data) => Some(data),
            _ => None,
        })
        .collect()
}

async fn handle(shared: &Arc<ServerShared>, ctx: &mut ConnCtx, parts: Vec<Bytes>) -> Vec<Frame> {
    let Some(name) = parts.first() else {
        return vec![err("ERR empty command")];
    };
    let name = name.to_ascii_uppercase();

    if !ctx.authed && !matches!(name.as_slice(), b"AUTH" | b"HELLO" | b"QUIT") {
        return vec![err("NOAUTH Authentication required.")];
    }

    // Transaction queuing intercepts everything except control verbs.
    if ctx.queued.is_some()
        && !matches!(
            name.as_slice(),
            b"MULTI" | b"EXEC" | b"DISCARD" | b"WATCH" | b"QUIT"
        )
    {
        if !known_command(&name) {
            ctx.dirty = true;
            return vec![err(format!(
                "ERR unknown command '{}'",
                String::from_utf8_lossy(&name)
            ))];
        }
        if let Some(redirect) = cluster_redirect(shared, ctx, &name, &parts) {
            return vec![redirect];
        }
        ctx.queued.as_mut().expect("checked above").push(parts);
        return vec![Frame::simple("QUEUED")];
    }

    match name.as_slice() {
        b"MULTI" => {
            if ctx.queued.is_some() {
                return vec![err("ERR MULTI calls can not be nested")];
            }
            ctx.queued = Some(Vec::new());
            ctx.dirty = false;
            vec![ok()]
        }
        b"EXEC" => {
            let Some(queued) = ctx.queued.take() else {
                return vec![err("ERR EXEC without MULTI")];
            };
            if ctx.dirty {
                ctx.dirty = false;
                ctx.watched.clear();
                return vec![err(
                    "EXECABORT Transaction discarded because of previous errors.",
                )];
            }
            let aborted = {
                let store = &mut *shared.store.lock();
                ctx.watched
                    .iter()
                    .any(|(key, version)| store.version(key) != *version)
            };
            ctx.watched.clear();
            if aborted {
                return vec![Frame::Null];
            }
            let mut replies = Vec::with_capacity(queued.len());
            for parts in queued {
                let mut frames = execute(shared, ctx, parts).await;
                replies.append(&mut frames);
            }
            vec![Frame::Array(replies)]
        }
        b"DISCARD" => {
            if ctx.queued.take().is_none() {
                return vec![err("ERR DISCARD without MULTI")];
            }
            ctx.watched.clear();
            ctx.dirty = false;
            vec![ok()]
        }
        b"WATCH" => {
            if ctx.queued.is_some() {
                return vec![err("ERR WATCH inside MULTI is not allowed")];
            }
            let store = &mut *shared.store.lock();
            for key in &parts[1..] {
                let version = store.version(key);
                ctx.watched.push((key.clone(), version));
            }
            vec![ok()]
        }
        b"UNWATCH" => {
            ctx.watched.clear();
            vec![ok()]
        }
        _ => {
            if let Some(redirect) = cluster_redirect(shared, ctx, &name, &parts) {
                return vec![redirect];
            }
            execute(shared, ctx, parts).await
        }
    }
}

/// MOVED/ASK simulation for keyed commands when part of a cluster.
fn cluster_redirect(
    shared: &Arc<ServerShared>,
    ctx: &mut ConnCtx,
    name: &[u8],
    parts: &[Bytes],
) -> Option<Frame> {
    let membership = shared.cluster.as_ref()?;
    let key = first_key(name, parts)?;
    let slot = hash_slot(&key);

    let view = membership.view.lock();
    let owner = view.owner_of(slot);
    let me = membership.index;

    if owner == me {
        if let Some(&target) = view.asks.get(&slot) {
            if target != me {
                let addr = view.nodes[target];
                return Some(err(format!("ASK {slot} {}:{}", addr.ip(), addr.port())));
            }
        }
        return None;
    }
    // One keyed command is served after ASKING regardless of ownership.
    if std::mem::take(&mut ctx.asking) {
        return None;
    }
    let addr = view.nodes[owner];
    Some(err(format!("MOVED {slot} {}:{}", addr.ip(), addr.port())))
}

fn first_key(name: &[u8], parts: &[Bytes]) -> Option<Bytes> {
    let keyed = matches!(
        name,
        b"SET" | b"GET"
            | b"GETDEL"
            | b"APPEND"
            | b"STRLEN"
            | b"INCR"
            | b"DECR"
            | b"INCRBY"
            | b"MGET"
            | b"MSET"
            | b"DEL"
            | b"EXISTS"
            | b"EXPIRE"
            | b"PEXPIRE"
            | b"TTL"
            | b"PTTL"
            | b"PERSIST"
            | b"TYPE"
            | b"HSET"
            | b"HGET"
            | b"HDEL"
            | b"HEXISTS"
            | b"HGETALL"
            | b"HKEYS"
            | b"HVALS"
            | b"HLEN"
            | b"HINCRBY"
            | b"LPUSH"
            | b"RPUSH"
            | b"LPOP"
            | b"RPOP"
            | b"LRANGE"
            | b"LLEN"
            | b"LINDEX"
            | b"LSET"
            | b"LREM"
            | b"BLPOP"
            | b"BRPOP"
            | b"SADD"
            | b"SREM"
            | b"SMEMBERS"
            | b"SISMEMBER"
            | b"SCARD"
            | b"SPOP"
            | b"ZADD"
            | b"ZSCORE"
            | b"ZRANGE"
            | b"ZREM"
            | b"ZCARD"
            | b"ZINCRBY"
            | b"ZRANK"
            | b"DUMP"
            | b"RESTORE"
            | b"SPUBLISH"
            | b"SSUBSCRIBE"
            | b"SUNSUBSCRIBE"
    );
    if keyed { parts.get(1).cloned() } else { None }
}

fn known_command(name: &[u8]) -> bool {
    first_key(name, &[Bytes::new(), Bytes::from_static(b"k")]).is_some()
        || matches!(
            name,
            b"PING"
                | b"ECHO"
                | b"SELECT"
                | b"AUTH"
                | b"HELLO"
                | b"CLIENT"
                | b"INFO"
                | b"DBSIZE"
                | b"FLUSHDB"
                | b"KEYS"
                | b"WAIT"
                | b"PUBLISH"
                | b"SUBSCRIBE"
                | b"UNSUBSCRIBE"
                | b"PSUBSCRIBE"
                | b"PUNSUBSCRIBE"
                | b"PUBSUB"
                | b"CLUSTER"
                | b"READONLY"
                | b"ASKING"
                | b"QUIT"
        )
}

fn text(data: &Bytes) -> String {
    String::from_utf8_lossy(data).into_owned()
}

fn parse_i64(data: &Bytes) -> Option<i64> {
    std::str::from_utf8(data).ok()?.parse().ok()
}

fn parse_f64(data: &Bytes) -> Option<f64> {
    let s = std::str::from_utf8(data).ok()?;
    match s {
        "+inf" | "inf" => Some(f64::INFINITY),
        "-inf" => Some(f64::NEG_INFINITY),
        _ => s.parse().ok(),
    }
}

fn bool_reply(ctx: &ConnCtx, value: bool) -> Frame {
    if ctx.resp3 {
        Frame::Boolean(value)
    } else {
        int(value as i64)
    }
}

fn wrongtype() -> Frame {
    err("WRONGTYPE Operation against a key holding the wrong kind of value")
}

async fn execute(shared: &Arc<ServerShared>, ctx: &mut ConnCtx, parts: Vec<Bytes>) -> Vec<Frame> {
    let name = parts[0].to_ascii_uppercase();
    let args = &parts[1..];

    // Blocking list pops poll the store without holding its lock.
    if matches!(name.as_slice(), b"BLPOP" | b"BRPOP") {
        return vec![blocking_pop(shared, &name, args).await];
    }

    let reply = match name.as_slice() {
        b"PING" => match args.first() {
            Some(msg) => Frame::Bulk(msg.clone()),
            None => Frame::simple("PONG"),
        },
        b"ECHO" => match args.first() {
            Some(msg) => Frame::Bulk(msg.clone()),
            None => err("ERR wrong number of arguments for 'echo' command"),
        },
        b"SELECT" | b"READONLY" | b"RESET" => ok(),
        b"ASKING" => {
            ctx.asking = true;
            ok()
        }
        b"AUTH" => {
            let given = match args {
                [password] => Some((None, text(password))),
                [username, password] => Some((Some(text(username)), text(password))),
                _ => None,
            };
            match (&shared.options.password, given) {
                (None, _) => err("ERR Client sent AUTH, but no password is set"),
                (Some(_), None) => err("ERR wrong number of arguments for 'auth' command"),
                (Some(expected), Some((_, password))) => {
                    if *expected == password {
                        ctx.authed = true;
                        ok()
                    } else {
                        err("WRONGPASS invalid username-password pair or user is disabled.")
                    }
                }
            }
        }
        b"HELLO" => {
            if shared.options.reject_hello {
                err("ERR unknown command 'HELLO'")
            } else {
                hello(shared, ctx, args)
            }
        }
        b"CLIENT" => match args.first().map(|a| a.to_ascii_uppercase()) {
            Some(sub) if sub == b"SETNAME" => {
                ctx.name = args.get(1).cloned();
                ok()
            }
            Some(sub) if sub == b"GETNAME" => match &ctx.name {
                Some(name) => Frame::Bulk(name.clone()),
                None => Frame::bulk(""),
            },
            Some(sub) if sub == b"ID" => int(ctx.id as i64),
            _ => err("ERR unknown CLIENT subcommand"),
        },
        b"INFO" => Frame::Bulk(Bytes::from_static(
            b"# Server\r\nredis_version:7.4.0\r\nrole:master\r\n",
        )),
        b"WAIT" => int(0),
        b"QUIT" => ok(),
        b"DBSIZE" => int(shared.store.lock().len() as i64),
        b"FLUSHDB" => {
            shared.store.lock().clear();
            ok()
        }
        b"KEYS" => {
            let pattern = args.first().cloned().unwrap_or_else(|| Bytes::from_static(b"*"));
            let store = shared.store.lock();
            Frame::Array(
                store
                    .keys()
                    .filter(|key| glob_match(&pattern, key))
                    .map(|key| Frame::Bulk(key.clone()))
                    .collect(),
            )
        }
        b"CLUSTER" => cluster_command(shared, args),
        b"SUBSCRIBE" | b"UNSUBSCRIBE" | b"PSUBSCRIBE" | b"PUNSUBSCRIBE" | b"SSUBSCRIBE"
        | b"SUNSUBSCRIBE" => return subscription_command(shared, ctx, &name, args),
        b"PUBLISH" => match args {
            [channel, payload] => int(shared.subs.lock().publish(channel, payload, false)),
            _ => err("ERR wrong number of arguments for 'publish' command"),
        },
        b"SPUBLISH" => match args {
            [channel, payload] => int(shared.subs.lock().publish(channel, payload, true)),
            _ => err("ERR wrong number of arguments for 'spublish' command"),
        },
        b"PUBSUB" => match args.first().map(|a| a.to_ascii_uppercase()) {
            Some(sub) if sub == b"CHANNELS" => {
                let pattern = args.get(1).cloned();
                let subs = shared.subs.lock();
                let mut channels: Vec<Bytes> = subs
                    .conns
                    .values()
                    .flat_map(|conn| conn.channels.iter().cloned())
                    .collect();
                channels.sort();
                channels.dedup();
                Frame::Array(
                    channels
                        .into_iter()
                        .filter(|ch| pattern.as_ref().is_none_or(|p| glob_match(p, ch)))
                        .map(Frame::Bulk)
                        .collect(),
                )
            }
            _ => err("ERR unknown PUBSUB subcommand"),
        },
        _ => keyspace_command(shared, ctx, &name, args),
    };
    vec![reply]
}

fn hello(shared: &Arc<ServerShared>, ctx: &mut ConnCtx, args: &[Bytes]) -> Frame {
    let mut version = 2i64;
    let mut index = 0;
    if let Some(requested) = args.first().and_then(parse_i64) {
        if !(2..=3).contains(&requested) {
            return err("NOPROTO unsupported protocol version");
        }
        version = requested;
        index = 1;
    }
    // Optional AUTH <user> <pass> tokens.
    if args.get(index).map(|a| a.eq_ignore_ascii_case(b"AUTH")) == Some(true) {
        let password = args.get(index + 2).map(text);
        match (&shared.options.password, password) {
            (Some(expected), Some(given)) if *expected == given => ctx.authed = true,
            (None, _) => {}
            _ => return err("WRONGPASS invalid username-password pair or user is disabled."),
        }
    }
    ctx.resp3 = version == 3;
    Frame::Map(vec![
        (Frame::bulk("server"), Frame::bulk("valkey")),
        (Frame::bulk("version"), Frame::bulk("7.4.0")),
        (Frame::bulk("proto"), int(version)),
        (Frame::bulk("id"), int(ctx.id as i64)),
        (Frame::bulk("mode"), {
            if shared.cluster.is_some() {
                Frame::bulk("cluster")
            } else {
                Frame::bulk("standalone")
            }
        }),
    ])
}

fn cluster_command(shared: &Arc<ServerShared>, args: &[Bytes]) -> Frame {
    let sub = args
        .first()
        .map(|a| a.to_ascii_uppercase())
        .unwrap_or_default();
    let Some(membership) = shared.cluster.as_ref() else {
        return match sub.as_slice() {
            b"INFO" => Frame::Bulk(Bytes::from_static(b"cluster_enabled:0\r\ncluster_state:ok\r\n")),
            _ => err("ERR This instance has cluster support disabled"),
        };
    };
    let view = membership.view.lock();
    match sub.as_slice() {
        b"INFO" => Frame::Bulk(Bytes::from_static(b"cluster_enabled:1\r\ncluster_state:ok\r\n")),
        b"SLOTS" => view.slots_frame(),
        b"SHARDS" => view.shards_frame(),
        _ => err("ERR unknown CLUSTER subcommand"),
    }
}

fn subscription_command(
    shared: &Arc<ServerShared>,
    ctx: &mut ConnCtx,
    name: &[u8],
    args: &[Bytes],
) -> Vec<Frame> {
    let mut acks = Vec::new();
    {
        let mut subs = shared.subs.lock();
        let Some(conn) = subs.conns.get_mut(&ctx.id) else {
            return Vec::new();
        };
        for channel in args {
            let (ack_kind, count) = match name {
                b"SUBSCRIBE" => {
                    conn.channels.insert(channel.clone());
                    ("subscribe", conn.channels.len())
                }
                b"UNSUBSCRIBE" => {
                    conn.channels.remove(channel);
                    ("unsubscribe", conn.channels.len())
                }
                b"PSUBSCRIBE" => {
                    conn.patterns.insert(channel.clone());
                    ("psubscribe", conn.patterns.len())
                }
                b"PUNSUBSCRIBE" => {
                    conn.patterns.remove(channel);
                    ("punsubscribe", conn.patterns.len())
                }
                b"SSUBSCRIBE" => {
                    conn.shard_channels.insert(channel.clone());
                    ("ssubscribe", conn.shard_channels.len())
                }
                _ => {
                    conn.shard_channels.remove(channel);
                    ("sunsubscribe", conn.shard_channels.len())
                }
            };
            acks.push(Frame::Push(vec![
                Frame::bulk(ack_kind),
                Frame::Bulk(channel.clone()),
                int(count as i64),
            ]));
        }
    }
    if ctx.resp3 {
        // Acknowledgements are push frames on the same socket.
        acks
    } else {
        acks.into_iter()
            .map(|frame| match frame {
                Frame::Push(items) => Frame::Array(items),
                other => other,
            })
            .collect()
    }
}

async fn blocking_pop(shared: &Arc<ServerShared>, name: &[u8], args: &[Bytes]) -> Frame {
    let Some((timeout, keys)) = args.split_last() else {
        return err("ERR wrong number of arguments");
    };
    let Some(timeout) = parse_f64(timeout) else {
        return err("ERR timeout is not a float or out of range");
    };
    let deadline = if timeout > 0.0 {
        Some(Instant::now() + Duration::from_secs_f64(timeout))
    } else {
        None
    };

    loop {
        {
            let mut store = shared.store.lock();
            for key in keys {
                let popped = match store.get_mut(key) {
                    Some(Entry::List(items)) if !items.is_empty() => {
                        let value = if name == b"BLPOP" {
                            items.remove(0)
                        } else {
                            items.pop().expect("non-empty")
                        };
                        Some(value)
                    }
                    _ => None,
                };
                if let Some(value) = popped {
                    store.touch(key);
                    return Frame::Array(vec![Frame::Bulk(key.clone()), Frame::Bulk(value)]);
                }
            }
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Frame::Null;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn keyspace_command(
    shared: &Arc<ServerShared>,
    ctx: &mut ConnCtx,
    name: &[u8],
    args: &[Bytes],
) -> Frame {
    let store = &mut *shared.store.lock();
    match name {
        b"SET" => {
            let [key, value, options @ ..] = args else {
                return err("ERR wrong number of arguments for 'set' command");
            };
            let mut nx = false;
            let mut xx = false;
            let mut keepttl = false;
            let mut expire: Option<Duration> = None;
            let mut i = 0;
            while i < options.len() {
                let option = options[i].to_ascii_uppercase();
                match option.as_slice() {
                    b"NX" => nx = true,
                    b"XX" => xx = true,
                    b"KEEPTTL" => keepttl = true,
                    b"EX" | b"PX" => {
                        i += 1;
                        let Some(amount) = options.get(i).and_then(parse_i64) else {
                            return err("ERR value is not an integer or out of range");
                        };
                        expire = Some(if option == b"EX" {
                            Duration::from_secs(amount as u64)
                        } else {
                            Duration::from_millis(amount as u64)
                        });
                    }
                    _ => return err("ERR syntax error"),
                }
                i += 1;
            }
            let exists = store.contains(key);
            if (nx && exists) || (xx && !exists) {
                return Frame::Null;
            }
            if keepttl {
                store.replace(key.clone(), Entry::Str(value.clone()));
            } else {
                store.insert(key.clone(), Entry::Str(value.clone()));
            }
            if let Some(ttl) = expire {
                store.set_expiry(key, Instant::now() + ttl);
            }
            ok()
        }
        b"GET" => match store.get(&args[0]) {
            Some(Entry::Str(value)) => Frame::Bulk(value.clone()),
            Some(_) => wrongtype(),
            None => Frame::Null,
        },
        b"GETDEL" => match store.remove(&args[0]) {
            Some(Entry::Str(value)) => Frame::Bulk(value),
            Some(_) => wrongtype(),
            None => Frame::Null,
        },
        b"APPEND" => {
            let [key, suffix] = args else {
                return err("ERR wrong number of arguments for 'append' command");
            };
            let mut value = match store.get(key) {
                Some(Entry::Str(value)) => value.to_vec(),
                Some(_) => return wrongtype(),
                None => Vec::new(),
            };
            value.extend_from_slice(suffix);
            let len = value.len();
            store.replace(key.clone(), Entry::Str(Bytes::from(value)));
            int(len as i64)
        }
        b"STRLEN" => match store.get(&args[0]) {
            Some(Entry::Str(value)) => int(value.len() as i64),
            Some(_) => wrongtype(),
            None => int(0),
        },
        b"INCR" | b"DECR" | b"INCRBY" => {
            let key = &args[0];
            let delta = match name {
                b"INCR" => 1,
                b"DECR" => -1,
                _ => match args.get(1).and_then(parse_i64) {
                    Some(delta) => delta,
                    None => return err("ERR value is not an integer or out of range"),
                },
            };
            let current = match store.get(key) {
                Some(Entry::Str(value)) => match parse_i64(value) {
                    Some(current) => current,
                    None => return err("ERR value is not an integer or out of range"),
                },
                Some(_) => return wrongtype(),
                None => 0,
            };
            let next = current + delta;
            store.replace(key.clone(), Entry::Str(Bytes::from(next.to_string())));
            int(next)
        }
        b"MGET" => Frame::Array(
            args.iter()
                .map(|key| match store.get(key) {
                    Some(Entry::Str(value)) => Frame::Bulk(value.clone()),
                    _ => Frame::Null,
                })
                .collect(),
        ),
        b"MSET" => {
            for pair in args.chunks_exact(2) {
                store.insert(pair[0].clone(), Entry::Str(pair[1].clone()));
            }
            ok()
        }
        b"DEL" => int(args.iter().filter(|key| store.remove(key).is_some()).count() as i64),
        b"EXISTS" => int(args.iter().filter(|key| store.contains(key)).count() as i64),
        b"EXPIRE" | b"PEXPIRE" => {
            let [key, amount] = args else {
                return err("ERR wrong number of arguments");
            };
            let Some(amount) = parse_i64(amount) else {
                return err("ERR value is not an integer or out of range");
            };
            let ttl = if name == b"EXPIRE" {
                Duration::from_secs(amount.max(0) as u64)
            } else {
                Duration::from_millis(amount.max(0) as u64)
            };
            bool_reply(ctx, store.set_expiry(key, Instant::now() + ttl))
        }
        b"TTL" => int(store.ttl_secs(&args[0])),
        b"PTTL" => match store.ttl_secs(&args[0]) {
            -2 => int(-2),
            -1 => int(-1),
            secs => int(secs * 1000),
        },
        b"PERSIST" => bool_reply(ctx, store.contains(&args[0]) && store.clear_expiry(&args[0])),
        b"TYPE" => match store.get(&args[0]) {
            Some(entry) => Frame::simple(match entry.type_name() {
                "string" => "string",
                "list" => "list",
                "hash" => "hash",
                "set" => "set",
                _ => "zset",
            }),
            None => Frame::simple("none"),
        },
        b"DUMP" => match store.get(&args[0]) {
            Some(entry) => Frame::Bulk(dump_entry(entry)),
            None => Frame::Null,
        },
        b"RESTORE" => {
            let [key, _ttl, payload, rest @ ..] = args else {
                return err("ERR wrong number of arguments for 'restore' command");
            };
            let replace = rest
                .first()
                .map(|opt| opt.eq_ignore_ascii_case(b"REPLACE"))
                .unwrap_or(false);
            if store.contains(key) && !replace {
                return err("BUSYKEY Target key name already exists.");
            }
            match restore_entry(payload) {
                Some(entry) => {
                    store.insert(key.clone(), entry);
                    ok()
                }
                None => err("ERR Bad data format"),
            }
        }
        _ => hash_list_set_command(store, ctx, name, args),
    }
}

fn hash_list_set_command(
    store: &mut crate::store::Store,
    ctx: &mut ConnCtx,
    name: &[u8],
    args: &[Bytes],
) -> Frame {
    match name {
        b"HSET" => {
            let [key, fields @ ..] = args else {
                return err("ERR wrong number of arguments for 'hset' command");
            };
            if fields.is_empty() || fields.len() % 2 != 0 {
                return err("ERR wrong number of arguments for 'hset' command");
            }
            let mut pairs = match store.get(key) {
                Some(Entry::Hash(pairs)) => pairs.clone(),
                Some(_) => return wrongtype(),
                None => Vec::new(),
            };
            let mut added = 0;
            for chunk in fields.chunks_exact(2) {
                match pairs.iter_mut().find(|(f, _)| *f == chunk[0]) {
                    Some(pair) => pair.1 = chunk[1].clone(),
                    None => {
                        pairs.push((chunk[0].clone(), chunk[1].clone()));
                        added += 1;
                    }
                }
            }
            store.replace(key.clone(), Entry::Hash(pairs));
            int(added)
        }
        b"HGET" => match store.get(&args[0]) {
            Some(Entry::Hash(pairs)) => pairs
                .iter()
                .find(|(f, _)| *f == args[1])
                .map(|(_, v)| Frame::Bulk(v.clone()))
                .unwrap_or(Frame::Null),
            Some(_) => wrongtype(),
            None => Frame::Null,
        },
        b"HDEL" => {
            let [key, fields @ ..] = args else {
                return err("ERR wrong number of arguments");
            };
            let mut pairs = match store.get(key) {
                Some(Entry::Hash(pairs)) => pairs.clone(),
                Some(_) => return wrongtype(),
                None => return int(0),
            };
            let before = pairs.len();
            pairs.retain(|(f, _)| !fields.contains(f));
            let removed = before - pairs.len();
            if pairs.is_empty() {
                store.remove(key);
            } else {
                store.replace(key.clone(), Entry::Hash(pairs));
            }
            int(removed as i64)
        }
        b"HEXISTS" => match store.get(&args[0]) {
            Some(Entry::Hash(pairs)) => {
                let found = pairs.iter().any(|(f, _)| *f == args[1]);
                bool_reply(ctx, found)
            }
            Some(_) => wrongtype(),
            None => bool_reply(ctx, false),
        },
        b"HGETALL" => match store.get(&args[0]) {
            Some(Entry::Hash(pairs)) => {
                if ctx.resp3 {
                    Frame::Map(
                        pairs
                            .iter()
                            .map(|(f, v)| (Frame::Bulk(f.clone()), Frame::Bulk(v.clone())))
                            .collect(),
                    )
                } else {
                    Frame::Array(
                        pairs
                            .iter()
                            .flat_map(|(f, v)| [Frame::Bulk(f.clone()), Frame::Bulk(v.clone())])
                            .collect(),
                    )
                }
            }
            Some(_) => wrongtype(),
            None => {
                if ctx.resp3 {
                    Frame::Map(Vec::new())
                } else {
                    Frame::Array(Vec::new())
                }
            }
        },
        b"HKEYS" => match store.get(&args[0]) {
            Some(Entry::Hash(pairs)) => {
                Frame::Array(pairs.iter().map(|(f, _)| Frame::Bulk(f.clone())).collect())
            }
            Some(_) => wrongtype(),
            None => Frame::Array(Vec::new()),
        },
        b"HVALS" => match store.get(&args[0]) {
            Some(Entry::Hash(pairs)) => {
                Frame::Array(pairs.iter().map(|(_, v)| Frame::Bulk(v.clone())).collect())
            }
            Some(_) => wrongtype(),
            None => Frame::Array(Vec::new()),
        },
        b"HLEN" => match store.get(&args[0]) {
            Some(Entry::Hash(pairs)) => int(pairs.len() as i64),
            Some(_) => wrongtype(),
            None => int(0),
        },
        b"HINCRBY" => {
            let [key, field, delta] = args else {
                return err("ERR wrong number of arguments");
            };
            let Some(delta) = parse_i64(delta) else {
                return err("ERR value is not an integer or out of range");
            };
            let mut pairs = match store.get(key) {
                Some(Entry::Hash(pairs)) => pairs.clone(),
                Some(_) => return wrongtype(),
                None => Vec::new(),
            };
            let next = match pairs.iter_mut().find(|(f, _)| f == field) {
                Some(pair) => {
                    let Some(current) = parse_i64(&pair.1) else {
                        return err("ERR hash value is not an integer");
                    };
                    let next = current + delta;
                    pair.1 = Bytes::from(next.to_string());
                    next
                }
                None => {
                    pairs.push((field.clone(), Bytes::from(delta.to_string())));
                    delta
                }
            };
            store.replace(key.clone(), Entry::Hash(pairs));
            int(next)
        }
        b"LPUSH" | b"RPUSH" => {
            let [key, values @ ..] = args else {
                return err("ERR wrong number of arguments");
            };
            let mut items = match store.get(key) {
                Some(Entry::List(items)) => items.clone(),
                Some(_) => return wrongtype(),
                None => Vec::new(),
            };
            for value in values {
                if name == b"LPUSH" {
                    items.insert(0, value.clone());
                } else {
                    items.push(value.clone());
                }
            }
            let len = items.len();
            store.replace(key.clone(), Entry::List(items));
            int(len as i64)
        }
        b"LPOP" | b"RPOP" => {
            let mut items = match store.get(&args[0]) {
                Some(Entry::List(items)) => items.clone(),
                Some(_) => return wrongtype(),
                None => return Frame::Null,
            };
            if items.is_empty() {
                return Frame::Null;
            }
            let value = if name == b"LPOP" {
                items.remove(0)
            } else {
                items.pop().expect("non-empty")
            };
            if items.is_empty() {
                store.remove(&args[0]);
            } else {
                store.replace(args[0].clone(), Entry::List(items));
            }
            Frame::Bulk(value)
        }
        b"LRANGE" => {
            let [key, start, stop] = args else {
                return err("ERR wrong number of arguments");
            };
            let (Some(start), Some(stop)) = (parse_i64(start), parse_i64(stop)) else {
                return err("ERR value is not an integer or out of range");
            };
            let items = match store.get(key) {
                Some(Entry::List(items)) => items.clone(),
                Some(_) => return wrongtype(),
                None => Vec::new(),
            };
            Frame::Array(
                slice_range(items.len(), start, stop)
                    .map(|range| items[range].iter().map(|i| Frame::Bulk(i.clone())).collect())
                    .unwrap_or_default(),
            )
        }
        b"LLEN" => match store.get(&args[0]) {
            Some(Entry::List(items)) => int(items.len() as i64),
            Some(_) => wrongtype(),
            None => int(0),
        },
        b"LINDEX" => {
            let [key, index] = args else {
                return err("ERR wrong number of arguments");
            };
            let Some(index) = parse_i64(index) else {
                return err("ERR value is not an integer or out of range");
            };
            match store.get(key) {
                Some(Entry::List(items)) => {
                    let len = items.len() as i64;
                    let index = if index < 0 { len + index } else { index };
                    if (0..len).contains(&index) {
                        Frame::Bulk(items[index as usize].clone())
                    } else {
                        Frame::Null
                    }
                }
                Some(_) => wrongtype(),
                None => Frame::Null,
            }
        }
        b"LREM" => {
            let [key, _count, value] = args else {
                return err("ERR wrong number of arguments");
            };
            let mut items = match store.get(key) {
                Some(Entry::List(items)) => items.clone(),
                Some(_) => return wrongtype(),
                None => return int(0),
            };
            let before = items.len();
            items.retain(|item| item != value);
            let removed = before - items.len();
            store.replace(key.clone(), Entry::List(items));
            int(removed as i64)
        }
        b"SADD" => {
            let [key, members @ ..] = args else {
                return err("ERR wrong number of arguments");
            };
            let mut set = match store.get(key) {
                Some(Entry::Set(members)) => members.clone(),
                Some(_) => return wrongtype(),
                None => Vec::new(),
            };
            let mut added = 0;
            for member in members {
                if !set.contains(member) {
                    set.push(member.clone());
                    added += 1;
                }
            }
            store.replace(key.clone(), Entry::Set(set));
            int(added)
        }
        b"SREM" => {
            let [key, members @ ..] = args else {
                return err("ERR wrong number of arguments");
            };
            let mut set = match store.get(key) {
                Some(Entry::Set(members)) => members.clone(),
                Some(_) => return wrongtype(),
                None => return int(0),
            };
            let before = set.len();
            set.retain(|member| !members.contains(member));
            let removed = before - set.len();
            store.replace(key.clone(), Entry::Set(set));
            int(removed as i64)
        }
        b"SMEMBERS" => match store.get(&args[0]) {
            Some(Entry::Set(members)) => {
                let items = members.iter().map(|m| Frame::Bulk(m.clone())).collect();
                if ctx.resp3 {
                    Frame::Set(items)
                } else {
                    Frame::Array(items)
                }
            }
            Some(_) => wrongtype(),
            None if ctx.resp3 => Frame::Set(Vec::new()),
            None => Frame::Array(Vec::new()),
        },
        b"SISMEMBER" => match store.get(&args[0]) {
            Some(Entry::Set(members)) => bool_reply(ctx, members.contains(&args[1])),
            Some(_) => wrongtype(),
            None => bool_reply(ctx, false),
        },
        b"SCARD" => match store.get(&args[0]) {
            Some(Entry::Set(members)) => int(members.len() as i64),
            Some(_) => wrongtype(),
            None => int(0),
        },
        b"SPOP" => {
            let mut set = match store.get(&args[0]) {
                Some(Entry::Set(members)) => members.clone(),
                Some(_) => return wrongtype(),
                None => return Frame::Null,
            };
            if set.is_empty() {
                return Frame::Null;
            }
            let member = set.remove(0);
            store.replace(args[0].clone(), Entry::Set(set));
            Frame::Bulk(member)
        }
        _ => zset_command(store, ctx, name, args),
    }
}

fn zset_command(
    store: &mut crate::store::Store,
    ctx: &mut ConnCtx,
    name: &[u8],
    args: &[Bytes],
) -> Frame {
    match name {
        b"ZADD" => {
            let [key, rest @ ..] = args else {
                return err("ERR wrong number of arguments for 'zadd' command");
            };
            let mut nx = false;
            let mut xx = false;
            let mut ch = false;
            let mut i = 0;
            while i < rest.len() {
                match rest[i].to_ascii_uppercase().as_slice() {
                    b"NX" => nx = true,
                    b"XX" => xx = true,
                    b"CH" => ch = true,
                    b"GT" | b"LT" => {}
                    _ => break,
                }
                i += 1;
            }
            let pairs = &rest[i..];
            if pairs.is_empty() || pairs.len() % 2 != 0 {
                return err("ERR syntax error");
            }
            let mut zset = match store.get(key) {
                Some(Entry::ZSet(pairs)) => pairs.clone(),
                Some(_) => return wrongtype(),
                None => Vec::new(),
            };
            let mut added = 0i64;
            let mut changed = 0i64;
            for chunk in pairs.chunks_exact(2) {
                let Some(score) = parse_f64(&chunk[0]) else {
                    return err("ERR value is not a valid float");
                };
                let member = chunk[1].clone();
                match zset.iter_mut().find(|(m, _)| *m == member) {
                    Some(existing) => {
                        if !nx && existing.1 != score {
                            existing.1 = score;
                            changed += 1;
                        }
                    }
                    None => {
                        if !xx {
                            zset.push((member, score));
                            added += 1;
                            changed += 1;
                        }
                    }
                }
            }
            zset.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0)));
            store.replace(key.clone(), Entry::ZSet(zset));
            int(if ch { changed } else { added })
        }
        b"ZSCORE" => match store.get(&args[0]) {
            Some(Entry::ZSet(pairs)) => pairs
                .iter()
                .find(|(m, _)| *m == args[1])
                .map(|(_, score)| {
                    if ctx.resp3 {
                        Frame::Double(*score)
                    } else {
                        Frame::Bulk(Bytes::from(format_score(*score)))
                    }
                })
                .unwrap_or(Frame::Null),
            Some(_) => wrongtype(),
            None => Frame::Null,
        },
        b"ZRANGE" => {
            let [key, start, stop, options @ ..] = args else {
                return err("ERR wrong number of arguments for 'zrange' command");
            };
            let byscore = options
                .iter()
                .any(|opt| opt.eq_ignore_ascii_case(b"BYSCORE"));
            let withscores = options
                .iter()
                .any(|opt| opt.eq_ignore_ascii_case(b"WITHSCORES"));
            let pairs = match store.get(key) {
                Some(Entry::ZSet(pairs)) => pairs.clone(),
                Some(_) => return wrongtype(),
                None => Vec::new(),
            };
            let selected: Vec<(Bytes, f64)> = if byscore {
                let (Some(min), Some(max)) = (parse_f64(start), parse_f64(stop)) else {
                    return err("ERR min or max is not a float");
                };
                pairs
                    .into_iter()
                    .filter(|(_, score)| *score >= min && *score <= max)
                    .collect()
            } else {
                let (Some(start), Some(stop)) = (parse_i64(start), parse_i64(stop)) else {
                    return err("ERR value is not an integer or out of range");
                };
                slice_range(pairs.len(), start, stop)
                    .map(|range| pairs[range].to_vec())
                    .unwrap_or_default()
            };
            let mut items = Vec::new();
            for (member, score) in selected {
                items.push(Frame::Bulk(member));
                if withscores {
                    items.push(if ctx.resp3 {
                        Frame::Double(score)
                    } else {
                        Frame::Bulk(Bytes::from(format_score(score)))
                    });
                }
            }
            Frame::Array(items)
        }
        b"ZREM" => {
            let [key, members @ ..] = args else {
                return err("ERR wrong number of arguments");
            };
            let mut pairs = match store.get(key) {
                Some(Entry::ZSet(pairs)) => pairs.clone(),
                Some(_) => return wrongtype(),
                None => return int(0),
            };
            let before = pairs.len();
            pairs.retain(|(m, _)| !members.contains(m));
            let removed = before - pairs.len();
            store.replace(key.clone(), Entry::ZSet(pairs));
            int(removed as i64)
        }
        b"ZCARD" => match store.get(&args[0]) {
            Some(Entry::ZSet(pairs)) => int(pairs.len() as i64),
            Some(_) => wrongtype(),
            None => int(0),
        },
        b"ZINCRBY" => {
            let [key, delta, member] = args else {
                return err("ERR wrong number of arguments");
            };
            let Some(delta) = parse_f64(delta) else {
                return err("ERR value is not a valid float");
            };
            let mut pairs = match store.get(key) {
                Some(Entry::ZSet(pairs)) => pairs.clone(),
                Some(_) => return wrongtype(),
                None => Vec::new(),
            };
            let score = match pairs.iter_mut().find(|(m, _)| m == member) {
                Some(pair) => {
                    pair.1 += delta;
                    pair.1
                }
                None => {
                    pairs.push((member.clone(), delta));
                    delta
                }
            };
            store.replace(key.clone(), Entry::ZSet(pairs));
            if ctx.resp3 {
                Frame::Double(score)
            } else {
                Frame::Bulk(Bytes::from(format_score(score)))
            }
        }
        b"ZRANK" => match store.get(&args[0]) {
            Some(Entry::ZSet(pairs)) => pairs
                .iter()
                .position(|(m, _)| *m == args[1])
                .map(|rank| int(rank as i64))
                .unwrap_or(Frame::Null),
            Some(_) => wrongtype(),
            None => Frame::Null,
        },
        _ => err(format!(
            "ERR unknown command '{}'",
            String::from_utf8_lossy(name)
        )),
    }
}

fn format_score(score: f64) -> String {
    if score == score.trunc() && score.is_finite() {
        format!("{}", score as i64)
    } else {
        format!("{score}")
    }
}

/// Normalize a start/stop index pair the way list and zset range commands
/// do. Returns `None` when the range is empty.
fn slice_range(len: usize, start: i64, stop: i64) -> Option<std::ops::Range<usize>> {
    let len = len as i64;
    let mut start = if start < 0 { len + start } else { start };
    let mut stop = if stop < 0 { len + stop } else { stop };
    start = start.max(0);
    stop = stop.min(len - 1);
    if start > stop || len == 0 {
        return None;
    }
    Some(start as usize..(stop + 1) as usize)
}
