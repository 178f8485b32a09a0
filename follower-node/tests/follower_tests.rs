//! Follower tests against a real leader, and against a scripted leader for
//! control-channel failures.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use follower_node::{
    ControlChannel, DemuxTable, FollowerConfig, FollowerError, FollowerServer, ReplicaCache,
};
use futures_util::{SinkExt, StreamExt};
use leader_node::{LeaderConfig, LeaderServer};
use locksmith_common::connection::{dial, next_message, MessageChannel};
use locksmith_common::{LockClient, Message, WireCodec};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::bytes::Bytes;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

const WAIT: Duration = Duration::from_secs(5);

async fn start_leader() -> SocketAddr {
    let mut config = LeaderConfig::default();
    config.override_listen(Some("127.0.0.1".to_string()), Some(0));
    let server = LeaderServer::bind(&config).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(async move { server.run().await });
    addr
}

fn follower_config(leader: SocketAddr) -> FollowerConfig {
    let mut config = FollowerConfig::default();
    config.override_with(
        Some("127.0.0.1".to_string()),
        Some(0),
        Some(leader.to_string()),
    );
    config.leader.connect_timeout_ms = 2000;
    config
}

struct RunningFollower {
    addr: SocketAddr,
    cache: Arc<ReplicaCache>,
    control: Arc<ControlChannel>,
    demux: Arc<DemuxTable>,
    task: JoinHandle<follower_node::Result<()>>,
}

async fn start_follower(config: FollowerConfig) -> RunningFollower {
    let server = FollowerServer::bind(&config).await.unwrap();
    RunningFollower {
        addr: server.local_addr().unwrap(),
        cache: server.cache(),
        control: server.control(),
        demux: server.demux(),
        task: tokio::spawn(server.run()),
    }
}

async fn client(addr: SocketAddr) -> LockClient {
    LockClient::connect(addr)
        .await
        .unwrap()
        .with_reply_timeout(WAIT)
}

/// Poll `condition` until it holds, failing the test after `WAIT`.
async fn eventually<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    timeout(WAIT, async {
        while !condition().await {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Accept the follower's control connection on a scripted leader.
async fn accept_control(listener: &TcpListener, id: u64) -> MessageChannel {
    let (stream, _) = listener.accept().await.unwrap();
    let mut framed = Framed::new(stream, WireCodec::new());
    let hello = next_message(&mut framed).await.unwrap().unwrap();
    assert_eq!(hello, Message::op(0, "NewServer"));
    framed
        .send(Message::msg(id, format!("ServerId {id}")))
        .await
        .unwrap();
    framed
}

/// Accept a proxied client's upstream connection on a scripted leader.
async fn accept_upstream(listener: &TcpListener, id: u64) -> MessageChannel {
    let (stream, _) = listener.accept().await.unwrap();
    let mut framed = Framed::new(stream, WireCodec::new());
    let hello = next_message(&mut framed).await.unwrap().unwrap();
    assert_eq!(hello, Message::op(0, "NewClient"));
    framed
        .send(Message::msg(id, format!("ClientId {id}")))
        .await
        .unwrap();
    framed
}

/// A follower registered with a scripted leader, plus that leader's end of
/// the control channel.
async fn start_scripted(config_fn: impl FnOnce(&mut FollowerConfig)) -> (TcpListener, RunningFollower, MessageChannel) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut config = follower_config(listener.local_addr().unwrap());
    config_fn(&mut config);

    let (follower, control) = tokio::join!(start_follower(config), accept_control(&listener, 1));
    (listener, follower, control)
}

#[tokio::test]
async fn test_proxied_lock_lifecycle() {
    let leader = start_leader().await;
    let follower = start_follower(follower_config(leader)).await;

    let mut remote = client(follower.addr).await;
    let mut local = client(leader).await;
    assert_eq!(remote.id(), 1);
    assert_eq!(local.id(), 2);

    assert_eq!(remote.lock("foo").await.unwrap(), "PreemptLock Success");
    assert_eq!(
        local.lock("foo").await.unwrap(),
        "PreemptLock Failed, LOCK EXISTS {LOCKNAME: foo OWNER: 1}"
    );
    assert_eq!(
        remote.check("foo").await.unwrap(),
        "There is a lock named foo owned by 1"
    );
    assert_eq!(
        local.unlock("foo").await.unwrap(),
        "ReleaseLock Failed CAN'T ACCESS THIS LOCK OWNED BY CLIENT 1"
    );
    assert_eq!(remote.unlock("foo").await.unwrap(), "ReleaseLock Success");
    assert_eq!(
        remote.check("foo").await.unwrap(),
        "There doesn't exist lock named foo"
    );
    assert_eq!(
        remote.unlock("foo").await.unwrap(),
        "ReleaseLock Failed ERROR: LOCK DOESN'T EXISTS"
    );
    assert_eq!(
        remote.check("bar").await.unwrap(),
        "There doesn't exist lock named bar"
    );
}

#[tokio::test]
async fn test_replication_reaches_cache() {
    let leader = start_leader().await;
    let follower = start_follower(follower_config(leader)).await;
    assert_eq!(follower.control.follower_id(), 1);
    assert!(follower.cache.is_fresh());

    let mut holder = client(leader).await;
    assert_eq!(holder.lock("bar").await.unwrap(), "PreemptLock Success");

    let cache = Arc::clone(&follower.cache);
    let owner = holder.id();
    eventually(|| {
        let cache = Arc::clone(&cache);
        async move { cache.get("bar").await == Some(owner) }
    })
    .await;

    assert_eq!(holder.unlock("bar").await.unwrap(), "ReleaseLock Success");
    eventually(|| {
        let cache = Arc::clone(&cache);
        async move { cache.is_empty().await }
    })
    .await;
}

#[tokio::test]
async fn test_every_follower_receives_replication() {
    let leader = start_leader().await;
    let first = start_follower(follower_config(leader)).await;
    let second = start_follower(follower_config(leader)).await;
    assert_eq!(first.control.follower_id(), 1);
    assert_eq!(second.control.follower_id(), 2);

    let mut holder = client(first.addr).await;
    assert_eq!(holder.lock("foo").await.unwrap(), "PreemptLock Success");

    let caches = [Arc::clone(&first.cache), Arc::clone(&second.cache)];
    let owner = holder.id();
    eventually(|| {
        let caches = caches.clone();
        async move {
            for cache in &caches {
                if cache.get("foo").await != Some(owner) {
                    return false;
                }
            }
            true
        }
    })
    .await;

    assert_eq!(holder.unlock("foo").await.unwrap(), "ReleaseLock Success");
    eventually(|| {
        let caches = caches.clone();
        async move {
            for cache in &caches {
                if !cache.is_empty().await {
                    return false;
                }
            }
            true
        }
    })
    .await;
}

#[tokio::test]
async fn test_malformed_client_frames_are_dropped() {
    let leader = start_leader().await;
    let follower = start_follower(follower_config(leader)).await;

    let stream = TcpStream::connect(follower.addr).await.unwrap();
    let mut raw = Framed::new(stream, LengthDelimitedCodec::new());

    // Nothing but NewClient is answered before registration.
    raw.send(Bytes::from_static(b"op::0::Check foo")).await.unwrap();
    raw.send(Bytes::from_static(b"garbage")).await.unwrap();
    raw.send(Bytes::from_static(b"op::0::NewClient")).await.unwrap();
    let frame = timeout(WAIT, raw.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(&frame[..], b"msg::1::ClientId 1");

    raw.send(Bytes::from_static(b"op::1::Fly away")).await.unwrap();
    raw.send(Bytes::from_static(b"op::1::TryLock foo 1")).await.unwrap();
    let frame = timeout(WAIT, raw.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(&frame[..], b"msg::1::PreemptLock Success");
}

#[tokio::test]
async fn test_unexpected_registration_reply_ends_session() {
    let (listener, follower, _control) = start_scripted(|_| {}).await;

    let mut remote = dial(follower.addr, 4096).await.unwrap();
    remote.send(Message::op(0, "NewClient")).await.unwrap();

    let (stream, _) = listener.accept().await.unwrap();
    let mut upstream = Framed::new(stream, WireCodec::new());
    let hello = next_message(&mut upstream).await.unwrap().unwrap();
    assert_eq!(hello, Message::op(0, "NewClient"));
    upstream
        .send(Message::msg(0, "PreemptLock Success"))
        .await
        .unwrap();

    // The reply is relayed, then both sides of the session are closed.
    let relayed = timeout(WAIT, next_message(&mut remote)).await.unwrap().unwrap();
    assert_eq!(relayed, Some(Message::msg(0, "PreemptLock Success")));
    let after = timeout(WAIT, next_message(&mut remote)).await.unwrap();
    assert!(matches!(after, Ok(None) | Err(_)));
    let upstream_after = timeout(WAIT, next_message(&mut upstream)).await.unwrap();
    assert!(matches!(upstream_after, Ok(None) | Err(_)));

    assert!(follower.demux.is_empty());
}

#[tokio::test]
async fn test_racing_clients_across_nodes_get_one_grant() {
    let leader = start_leader().await;
    let follower = start_follower(follower_config(leader)).await;

    let handles: Vec<_> = (0..12)
        .map(|i| {
            let addr = if i % 2 == 0 { follower.addr } else { leader };
            tokio::spawn(async move {
                let mut client = client(addr).await;
                client.lock("contended").await.unwrap()
            })
        })
        .collect();

    let mut granted = 0;
    for handle in handles {
        if handle.await.unwrap() == "PreemptLock Success" {
            granted += 1;
        }
    }
    assert_eq!(granted, 1);
}

#[tokio::test]
async fn test_checks_served_from_cache() {
    let leader = start_leader().await;
    let mut config = follower_config(leader);
    config.proxy.serve_checks_from_cache = true;
    let follower = start_follower(config).await;

    let mut holder = client(leader).await;
    holder.lock("baz").await.unwrap();

    let cache = Arc::clone(&follower.cache);
    eventually(|| {
        let cache = Arc::clone(&cache);
        async move { cache.get("baz").await.is_some() }
    })
    .await;

    let mut remote = client(follower.addr).await;
    assert_eq!(
        remote.check("baz").await.unwrap(),
        format!("There is a lock named baz owned by {}", holder.id())
    );
}

#[tokio::test]
async fn test_unreachable_leader_fails_startup() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = FollowerServer::bind(&follower_config(addr)).await;
    assert!(matches!(result, Err(FollowerError::LeaderUnavailable { .. })));
}

#[tokio::test]
async fn test_control_messages_are_demultiplexed_to_clients() {
    let (listener, follower, mut control) = start_scripted(|_| {}).await;

    let (mut remote, _upstream) =
        tokio::join!(client(follower.addr), accept_upstream(&listener, 7));
    assert_eq!(remote.id(), 7);

    control
        .send(Message::msg(7, "ReleaseLock Success"))
        .await
        .unwrap();
    // Addressed to nobody on this follower.
    control
        .send(Message::msg(8, "PreemptLock Success"))
        .await
        .unwrap();
    control
        .send(Message::op(0, "UpdateLock foo 7"))
        .await
        .unwrap();

    assert_eq!(
        remote.recv().await.unwrap(),
        Message::msg(7, "ReleaseLock Success")
    );

    let cache = Arc::clone(&follower.cache);
    eventually(|| {
        let cache = Arc::clone(&cache);
        async move { cache.get("foo").await == Some(7) }
    })
    .await;
}

#[tokio::test]
async fn test_control_channel_loss_fails_fast() {
    let (listener, follower, mut control) = start_scripted(|config| {
        config.control.reconnect_interval_ms = 60_000;
    })
    .await;

    control
        .send(Message::op(0, "UpdateLock foo 5"))
        .await
        .unwrap();
    let cache = Arc::clone(&follower.cache);
    eventually(|| {
        let cache = Arc::clone(&cache);
        async move { cache.get("foo").await == Some(5) }
    })
    .await;

    let (mut remote, _upstream) =
        tokio::join!(client(follower.addr), accept_upstream(&listener, 3));

    drop(control);
    let cache = Arc::clone(&follower.cache);
    eventually(|| {
        let cache = Arc::clone(&cache);
        async move { !cache.is_fresh() }
    })
    .await;

    assert_eq!(
        remote.lock("foo").await.unwrap(),
        "PreemptLock Failed, LEADER UNAVAILABLE"
    );
    assert_eq!(
        remote.unlock("foo").await.unwrap(),
        "ReleaseLock Failed ERROR: LEADER UNAVAILABLE"
    );
    assert_eq!(
        remote.check("foo").await.unwrap(),
        "There is a lock named foo owned by 5 (stale)"
    );
}

#[tokio::test]
async fn test_control_channel_reconnects() {
    let (listener, follower, control) = start_scripted(|config| {
        config.control.reconnect_interval_ms = 20;
    })
    .await;
    assert_eq!(follower.control.follower_id(), 1);

    drop(control);
    let _control = timeout(WAIT, accept_control(&listener, 2)).await.unwrap();

    let cache = Arc::clone(&follower.cache);
    let control = Arc::clone(&follower.control);
    eventually(|| {
        let cache = Arc::clone(&cache);
        let control = Arc::clone(&control);
        async move { cache.is_fresh() && control.follower_id() == 2 }
    })
    .await;
}

#[tokio::test]
async fn test_control_channel_loss_without_reconnect_stops_follower() {
    let (_listener, follower, control) = start_scripted(|config| {
        config.control.reconnect = false;
    })
    .await;

    drop(control);
    let result = timeout(WAIT, follower.task).await.unwrap().unwrap();
    assert!(matches!(
        result,
        Err(FollowerError::ControlChannelLost { attempts: 0 })
    ));
}
