//! Session supervisor - one worker process, one channel pair and one
//! receiver thread per logged-in user.
//!
//! Teardown order matters: the receiver is told to stop and joined before
//! either channel file is unlinked, so no receive is ever in flight on a
//! removed channel.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::mux::ConnectionMux;
use super::registry::{RegistryInner, SessionRegistry};
use super::GatewayEvent;
use crate::bus::{
    encode_inbound, inbound_name, outbound_name, ConnId, Reassembler, RoutedPayload, ShmChannel,
    CLOSE_CONNECTION_MSG,
};
use crate::core::config::{BrokerConfig, BusConfig, WorkerConfig};
use crate::core::types::BrokerType;
use crate::core::{Error, Result};
use crate::protocol::ReqLogin;

/// Settings every session of one gateway shares.
pub struct SessionContext {
    pub bus: BusConfig,
    pub worker: WorkerConfig,
    pub events: flume::Sender<GatewayEvent>,
}

/// What the user logged in with, kept for the lifetime of the session.
#[derive(Debug, Clone)]
pub struct SessionLogin {
    pub request: ReqLogin,
    pub broker: BrokerConfig,
}

pub fn session_key(broker: &str, user_name: &str) -> String {
    format!("{}_{}", broker, user_name)
}

pub struct Session {
    key: String,
    login: SessionLogin,
    ctx: Arc<SessionContext>,
    registry: Weak<RegistryInner>,
    child: Mutex<Option<Child>>,
    inbound: Mutex<Option<ShmChannel>>,
    receiver: Mutex<Option<JoinHandle<()>>>,
    stop_flag: Arc<AtomicBool>,
    connections: Mutex<BTreeSet<ConnId>>,
}

impl Session {
    pub(super) fn new(
        key: String,
        login: SessionLogin,
        ctx: Arc<SessionContext>,
        registry: &SessionRegistry,
    ) -> Self {
        Self {
            key,
            login,
            ctx,
            registry: registry.downgrade(),
            child: Mutex::new(None),
            inbound: Mutex::new(None),
            receiver: Mutex::new(None),
            stop_flag: Arc::new(AtomicBool::new(false)),
            connections: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn login(&self) -> &SessionLogin {
        &self.login
    }

    /// Bring up channels, worker and receiver. On `false` the caller must
    /// still call [`Session::stop`]; nothing created so far is rolled back.
    pub fn start(self: &Arc<Self>) -> bool {
        match self.try_start() {
            Ok(()) => {
                info!(key = %self.key, broker = %self.login.broker.name, "session started");
                true
            }
            Err(e) => {
                error!(key = %self.key, error = %e, "session start failed");
                false
            }
        }
    }

    fn try_start(self: &Arc<Self>) -> Result<()> {
        let registry = self.registry.upgrade();
        let _lifecycle = registry.as_ref().map(|r| r.lifecycle.lock());

        let broker_type: BrokerType = self
            .login
            .broker
            .broker_type
            .parse()
            .map_err(|_| Error::UnsupportedBroker(self.login.broker.broker_type.clone()))?;
        let program = self.ctx.worker.program_path(broker_type.worker_program());

        let bus = &self.ctx.bus;
        let inbound = ShmChannel::create(&bus.dir, &inbound_name(&self.key), bus.max_msg_nums, bus.max_msg_len)?;
        *self.inbound.lock() = Some(inbound);
        let outbound = ShmChannel::create(&bus.dir, &outbound_name(&self.key), bus.max_msg_nums, bus.max_msg_len)?;

        let child = Command::new(&program)
            .arg(&self.key)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| Error::Spawn(format!("{}: {}", program.display(), e)))?;
        debug!(key = %self.key, pid = child.id(), program = %program.display(), "worker spawned");
        *self.child.lock() = Some(child);

        self.stop_flag.store(false, Ordering::Release);
        let receiver = Receiver {
            key: self.key.clone(),
            channel: outbound,
            session: Arc::downgrade(self),
            stop: self.stop_flag.clone(),
            events: self.ctx.events.clone(),
            poll: Duration::from_millis(bus.recv_poll_ms.max(1)),
        };
        let handle = std::thread::Builder::new()
            .name(format!("bus-rx-{}", self.key))
            .spawn(move || receiver.run())
            .map_err(|e| Error::Spawn(format!("receiver thread: {}", e)))?;
        *self.receiver.lock() = Some(handle);
        Ok(())
    }

    /// Kill the worker, stop and join the receiver, remove both channels and
    /// leave the registry. Safe to call repeatedly.
    pub fn stop(&self) {
        let registry = self.registry.upgrade();
        let lifecycle = registry.as_ref().map(|r| r.lifecycle.lock());

        if let Some(mut child) = self.child.lock().take() {
            if let Err(e) = child.kill() {
                debug!(key = %self.key, error = %e, "worker already gone");
            }
            if let Err(e) = child.wait() {
                warn!(key = %self.key, error = %e, "failed to reap worker");
            }
        }

        self.stop_flag.store(true, Ordering::Release);
        if let Some(handle) = self.receiver.lock().take() {
            if handle.join().is_err() {
                error!(key = %self.key, "receiver thread panicked");
            }
        }

        self.inbound.lock().take();
        let bus = &self.ctx.bus;
        for name in [inbound_name(&self.key), outbound_name(&self.key)] {
            if let Err(e) = ShmChannel::remove(&bus.dir, &name) {
                warn!(key = %self.key, channel = %name, error = %e, "failed to remove channel");
            }
        }
        self.connections.lock().clear();

        drop(lifecycle);
        if let Some(registry) = registry {
            registry.remove_entry(&self.key, self);
        }
        info!(key = %self.key, "session stopped");
    }

    pub fn is_running(&self) -> bool {
        match self.child.lock().as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Forward a client payload to the worker. Best effort: failures are
    /// logged and the frame is dropped.
    pub fn send(&self, conn_id: ConnId, payload: &str) {
        let mut inbound = self.inbound.lock();
        let Some(channel) = inbound.as_mut() else {
            warn!(key = %self.key, conn_id, "send on a session without inbound channel");
            return;
        };
        let frame = encode_inbound(conn_id, payload);
        if let Err(e) = channel.try_send(frame.as_bytes()) {
            error!(key = %self.key, conn_id, len = frame.len(), error = %e, "dropping inbound frame");
        }
    }

    /// Tell the worker a client connection went away.
    pub fn notify_close(&self, conn_id: ConnId) {
        self.send(conn_id, CLOSE_CONNECTION_MSG);
    }

    pub fn attach(&self, conn_id: ConnId) {
        self.connections.lock().insert(conn_id);
    }

    /// Returns `true` when no connection remains attached.
    pub fn detach(&self, conn_id: ConnId) -> bool {
        let mut conns = self.connections.lock();
        conns.remove(&conn_id);
        conns.is_empty()
    }

    pub fn is_attached(&self, conn_id: ConnId) -> bool {
        self.connections.lock().contains(&conn_id)
    }

    pub fn connections(&self) -> Vec<ConnId> {
        self.connections.lock().iter().copied().collect()
    }

    /// Deliver a reassembled worker payload to the addressed connections.
    /// Only ids attached to this session and still registered receive it.
    pub fn route(&self, payload: &[u8], mux: &ConnectionMux) -> usize {
        let Ok(text) = std::str::from_utf8(payload) else {
            debug!(key = %self.key, "dropping non-utf8 payload");
            return 0;
        };
        let Some(routed) = RoutedPayload::parse(text) else {
            debug!(key = %self.key, "dropping malformed payload");
            return 0;
        };

        let mut delivered = 0;
        for id in routed.ids {
            if !self.is_attached(id) {
                continue;
            }
            if let Some(conn) = mux.resolve(id) {
                conn.send_text(routed.body);
                delivered += 1;
            }
        }
        delivered
    }
}

/// Background loop draining a session's outbound channel.
struct Receiver {
    key: String,
    channel: ShmChannel,
    session: Weak<Session>,
    stop: Arc<AtomicBool>,
    events: flume::Sender<GatewayEvent>,
    poll: Duration,
}

impl Receiver {
    fn run(mut self) {
        debug!(key = %self.key, channel = %self.channel.name(), "receiver running");
        let mut reassembler = Reassembler::new();
        while !self.stop.load(Ordering::Acquire) && self.session.strong_count() > 0 {
            let Some(frame) = self.channel.recv_timeout(self.poll) else {
                continue;
            };
            if let Some(payload) = reassembler.push(&frame) {
                let event = GatewayEvent::WorkerPayload { key: self.key.clone(), payload };
                if self.events.send(event).is_err() {
                    debug!(key = %self.key, "control plane gone, receiver exiting");
                    break;
                }
            }
        }
        debug!(key = %self.key, "receiver exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::channel::tests::scratch_dir;
    use crate::bus::split_frames;
    use crate::gateway::mux::tests::{weak, Recorder};
    use std::path::{Path, PathBuf};

    fn login(broker_type: &str) -> SessionLogin {
        SessionLogin {
            request: ReqLogin {
                bid: "simnow".to_string(),
                user_name: "alice".to_string(),
                password: String::new(),
            },
            broker: BrokerConfig { name: "simnow".to_string(), broker_type: broker_type.to_string() },
        }
    }

    fn context(dir: &Path, search_dir: Option<PathBuf>) -> (Arc<SessionContext>, flume::Receiver<GatewayEvent>) {
        let (tx, rx) = flume::unbounded();
        let ctx = SessionContext {
            bus: BusConfig {
                dir: dir.to_path_buf(),
                max_msg_len: 64,
                max_msg_nums: 16,
                recv_poll_ms: 5,
            },
            worker: WorkerConfig { search_dir },
            events: tx,
        };
        (Arc::new(ctx), rx)
    }

    #[cfg(unix)]
    fn fake_worker(dir: &Path) {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("trade-sim");
        std::fs::write(&path, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_unsupported_broker_creates_nothing() {
        let dir = scratch_dir("session");
        let (ctx, _rx) = context(&dir, None);
        let registry = SessionRegistry::new();
        let session = registry.create("simnow_alice", login("fix"), ctx);

        assert!(!session.start());
        assert!(!dir.join("simnow_alice_msg_in").exists());
        assert!(!dir.join("simnow_alice_msg_out").exists());
        assert!(!session.is_running());

        session.stop();
        assert!(registry.get("simnow_alice").is_none());
    }

    #[test]
    fn test_spawn_failure_leaves_channels_until_stop() {
        let dir = scratch_dir("session");
        let (ctx, _rx) = context(&dir, Some(dir.join("no-such-bin")));
        let registry = SessionRegistry::new();
        let session = registry.create("simnow_alice", login("sim"), ctx);

        assert!(!session.start());
        assert!(dir.join("simnow_alice_msg_in").exists());
        assert!(dir.join("simnow_alice_msg_out").exists());

        session.stop();
        assert!(!dir.join("simnow_alice_msg_in").exists());
        assert!(!dir.join("simnow_alice_msg_out").exists());
        assert!(registry.is_empty());
        // second stop is a no-op
        session.stop();
    }

    #[cfg(unix)]
    #[test]
    fn test_full_lifecycle_with_reassembly() {
        let dir = scratch_dir("session");
        fake_worker(&dir);
        let (ctx, rx) = context(&dir, Some(dir.clone()));
        let registry = SessionRegistry::new();
        let session = registry.create("simnow_alice", login("sim"), ctx);

        assert!(session.start());
        assert!(session.is_running());

        // play the worker: write a bracketed payload to the outbound channel
        let mut worker_out = ShmChannel::open(&dir, "simnow_alice_msg_out").unwrap();
        let payload = format!("1|2#{{\"aid\":\"rtn_data\",\"pad\":\"{}\"}}", "z".repeat(150));
        for frame in split_frames(payload.as_bytes(), 64) {
            worker_out.try_send(&frame).unwrap();
        }
        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            GatewayEvent::WorkerPayload { key, payload: got } => {
                assert_eq!(key, "simnow_alice");
                assert_eq!(got, payload.as_bytes());
            }
            _ => panic!("unexpected event"),
        }

        // inbound frames reach the worker side
        let mut worker_in = ShmChannel::open(&dir, "simnow_alice_msg_in").unwrap();
        session.send(3, "{\"aid\":\"peek_message\"}");
        session.notify_close(3);
        assert_eq!(worker_in.try_recv().unwrap(), b"3|{\"aid\":\"peek_message\"}");
        assert_eq!(worker_in.try_recv().unwrap(), b"3|CLOSE_CONNECTION_MSG");

        session.stop();
        assert!(!session.is_running());
        assert!(!dir.join("simnow_alice_msg_out").exists());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_send_without_channel_is_dropped() {
        let dir = scratch_dir("session");
        let (ctx, _rx) = context(&dir, None);
        let registry = SessionRegistry::new();
        let session = registry.create("k", login("sim"), ctx);
        session.send(1, "{}");
        session.notify_close(1);
    }

    #[test]
    fn test_route_only_reaches_attached_connections() {
        let dir = scratch_dir("session");
        let (ctx, _rx) = context(&dir, None);
        let registry = SessionRegistry::new();
        let session = registry.create("k", login("sim"), ctx);

        let mut mux = ConnectionMux::new();
        let one = Recorder::new(1);
        let two = Recorder::new(2);
        let foreign = Recorder::new(3);
        for conn in [&one, &two, &foreign] {
            mux.register(weak(conn));
        }
        session.attach(1);
        session.attach(2);

        assert_eq!(session.route(b"1|3|9#{\"x\":1}", &mux), 1);
        assert_eq!(one.texts(), vec!["{\"x\":1}"]);
        assert!(foreign.texts().is_empty());

        assert_eq!(session.route(b"1|2", &mux), 0);
        assert_eq!(session.route(b"#{}", &mux), 0);
        assert_eq!(session.route(&[0xff, b'#', b'x'], &mux), 0);

        assert!(!session.detach(1));
        assert!(session.detach(2));
    }
}
