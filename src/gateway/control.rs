//! Control plane - the gateway's single logical thread.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::mux::ConnectionMux;
use super::registry::SessionRegistry;
use super::session::{session_key, Session, SessionContext, SessionLogin};
use super::GatewayEvent;
use crate::bus::ConnId;
use crate::core::Config;
use crate::protocol::{rtn_brokers, AidOnly, Notice, ReqLogin};

pub struct Gateway {
    config: Config,
    ctx: Arc<SessionContext>,
    registry: SessionRegistry,
    mux: ConnectionMux,
    /// Which session each logged-in connection is bound to
    bindings: HashMap<ConnId, String>,
    notify_seq: u64,
}

impl Gateway {
    pub fn new(config: Config, events: flume::Sender<GatewayEvent>) -> Self {
        let ctx = Arc::new(SessionContext {
            bus: config.bus.clone(),
            worker: config.worker.clone(),
            events,
        });
        Self {
            config,
            ctx,
            registry: SessionRegistry::new(),
            mux: ConnectionMux::new(),
            bindings: HashMap::new(),
            notify_seq: 0,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Apply events until `Shutdown` arrives or every sender is gone.
    pub fn run(mut self, events: flume::Receiver<GatewayEvent>) {
        info!("control plane running");
        while let Ok(event) = events.recv() {
            if !self.handle(event) {
                break;
            }
        }
        self.shutdown();
    }

    /// Returns `false` once the loop should exit.
    pub fn handle(&mut self, event: GatewayEvent) -> bool {
        match event {
            GatewayEvent::Opened(conn) => {
                if let Some(conn_id) = self.mux.register(conn) {
                    debug!(conn_id, "connection registered");
                    self.send_to(conn_id, &rtn_brokers(&self.config.broker_names()));
                }
            }
            GatewayEvent::Text { conn_id, text } => self.on_text(conn_id, text),
            GatewayEvent::Closed { conn_id } => self.on_close(conn_id),
            GatewayEvent::WorkerPayload { key, payload } => match self.registry.get(&key) {
                Some(session) => {
                    session.route(&payload, &self.mux);
                }
                None => debug!(key = %key, "payload for unknown session dropped"),
            },
            GatewayEvent::Shutdown => return false,
        }
        true
    }

    pub fn shutdown(&mut self) {
        info!(sessions = self.registry.len(), "stopping all sessions");
        self.registry.stop_all();
        self.bindings.clear();
    }

    fn on_text(&mut self, conn_id: ConnId, text: String) {
        let aid = match serde_json::from_str::<AidOnly>(&text) {
            Ok(a) => a.aid,
            Err(e) => {
                debug!(conn_id, error = %e, "ignoring malformed client message");
                return;
            }
        };

        if aid == "req_login" {
            match serde_json::from_str::<ReqLogin>(&text) {
                Ok(req) => self.on_login(conn_id, req, &text),
                Err(e) => self.notify(conn_id, Notice::warning(format!("login rejected: {}", e))),
            }
            return;
        }

        let Some(session) = self.bound_session(conn_id) else {
            self.notify(conn_id, Notice::warning("please log in first"));
            return;
        };
        if !session.is_running() {
            warn!(key = %session.key(), "worker is no longer running");
            for unbound in self.teardown(&session) {
                self.notify(unbound, Notice::error("trading backend stopped, please log in again"));
            }
            return;
        }
        session.send(conn_id, &text);
    }

    fn on_login(&mut self, conn_id: ConnId, req: ReqLogin, raw: &str) {
        let Some(broker) = self.config.broker(&req.bid).cloned() else {
            self.notify(conn_id, Notice::warning(format!("login rejected: unknown broker {}", req.bid)));
            return;
        };
        let key = session_key(&req.bid, &req.user_name);

        if self.bindings.get(&conn_id).is_some_and(|bound| *bound != key) {
            self.detach(conn_id);
        }

        let session = match self.registry.get(&key) {
            Some(session) if session.is_running() => session,
            existing => {
                if let Some(dead) = existing {
                    for unbound in self.teardown(&dead) {
                        if unbound != conn_id {
                            self.notify(unbound, Notice::error("trading backend stopped, please log in again"));
                        }
                    }
                }
                let session = self.registry.create(&key, SessionLogin { request: req, broker }, self.ctx.clone());
                if !session.start() {
                    session.stop();
                    self.notify(conn_id, Notice::error("login failed: trading backend unavailable"));
                    return;
                }
                session
            }
        };

        session.attach(conn_id);
        self.bindings.insert(conn_id, key);
        session.send(conn_id, raw);
    }

    fn on_close(&mut self, conn_id: ConnId) {
        self.mux.unregister(conn_id);
        self.detach(conn_id);
        debug!(conn_id, "connection closed");
    }

    /// Unbind a connection; the session goes when its last connection does.
    fn detach(&mut self, conn_id: ConnId) {
        let Some(key) = self.bindings.remove(&conn_id) else {
            return;
        };
        if let Some(session) = self.registry.get(&key) {
            session.notify_close(conn_id);
            if session.detach(conn_id) {
                session.stop();
            }
        }
    }

    /// Stop a session whose worker died. Returns the connections it unbound.
    fn teardown(&mut self, session: &Session) -> Vec<ConnId> {
        let unbound = session.connections();
        for conn_id in &unbound {
            self.bindings.remove(conn_id);
        }
        session.stop();
        unbound
    }

    fn bound_session(&self, conn_id: ConnId) -> Option<Arc<Session>> {
        self.registry.get(self.bindings.get(&conn_id)?)
    }

    fn notify(&mut self, conn_id: ConnId, notice: Notice) {
        self.notify_seq += 1;
        self.send_to(conn_id, &notice.to_json(self.notify_seq));
    }

    fn send_to(&self, conn_id: ConnId, text: &str) {
        if let Some(conn) = self.mux.resolve(conn_id) {
            conn.send_text(text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::channel::tests::scratch_dir;
    use crate::bus::ShmChannel;
    use crate::core::config::{BrokerConfig, BusConfig, WorkerConfig};
    use crate::gateway::mux::tests::{weak, Recorder};
    use std::path::Path;

    fn gateway(dir: &Path) -> (Gateway, flume::Receiver<GatewayEvent>) {
        let mut config = Config::default();
        config.bus = BusConfig { dir: dir.to_path_buf(), max_msg_len: 256, max_msg_nums: 16, recv_poll_ms: 5 };
        config.worker = WorkerConfig { search_dir: Some(dir.to_path_buf()) };
        config.brokers = vec![BrokerConfig { name: "simnow".into(), broker_type: "sim".into() }];
        let (tx, rx) = flume::unbounded();
        (Gateway::new(config, tx), rx)
    }

    fn open(gw: &mut Gateway, id: ConnId) -> Arc<Recorder> {
        let conn = Recorder::new(id);
        assert!(gw.handle(GatewayEvent::Opened(weak(&conn))));
        conn
    }

    fn text(gw: &mut Gateway, conn_id: ConnId, text: &str) {
        gw.handle(GatewayEvent::Text { conn_id, text: text.to_string() });
    }

    const LOGIN: &str = r#"{"aid":"req_login","bid":"simnow","user_name":"alice","password":"x"}"#;

    #[test]
    fn test_new_connection_gets_broker_list() {
        let dir = scratch_dir("control");
        let (mut gw, _rx) = gateway(&dir);
        let conn = open(&mut gw, 1);
        assert!(conn.texts()[0].contains("rtn_brokers"));
        assert!(conn.texts()[0].contains("simnow"));
    }

    #[test]
    fn test_requests_before_login_are_refused() {
        let dir = scratch_dir("control");
        let (mut gw, _rx) = gateway(&dir);
        let conn = open(&mut gw, 1);
        text(&mut gw, 1, r#"{"aid":"peek_message"}"#);
        text(&mut gw, 1, "not json");
        let texts = conn.texts();
        assert_eq!(texts.len(), 2);
        assert!(texts[1].contains("please log in first"));
    }

    #[test]
    fn test_login_to_unknown_broker() {
        let dir = scratch_dir("control");
        let (mut gw, _rx) = gateway(&dir);
        let conn = open(&mut gw, 1);
        text(&mut gw, 1, r#"{"aid":"req_login","bid":"nope","user_name":"alice"}"#);
        assert!(conn.texts().last().unwrap().contains("unknown broker"));
        assert!(gw.registry().is_empty());
    }

    #[test]
    fn test_failed_start_is_cleaned_up() {
        let dir = scratch_dir("control");
        let (mut gw, _rx) = gateway(&dir);
        let conn = open(&mut gw, 1);
        // no worker executable in the search dir
        text(&mut gw, 1, LOGIN);
        assert!(conn.texts().last().unwrap().contains("login failed"));
        assert!(gw.registry().is_empty());
        assert!(!dir.join("simnow_alice_msg_in").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_login_forward_route_and_last_close() {
        use std::os::unix::fs::PermissionsExt;
        let dir = scratch_dir("control");
        let worker = dir.join("trade-sim");
        std::fs::write(&worker, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&worker, std::fs::Permissions::from_mode(0o755)).unwrap();

        let (mut gw, _rx) = gateway(&dir);
        let a = open(&mut gw, 1);
        let b = open(&mut gw, 2);
        text(&mut gw, 1, LOGIN);
        text(&mut gw, 2, LOGIN);
        assert_eq!(gw.registry().len(), 1);

        let mut worker_in = ShmChannel::open(&dir, "simnow_alice_msg_in").unwrap();
        assert_eq!(worker_in.try_recv().unwrap(), format!("1|{}", LOGIN).into_bytes());
        assert_eq!(worker_in.try_recv().unwrap(), format!("2|{}", LOGIN).into_bytes());

        text(&mut gw, 2, r#"{"aid":"peek_message"}"#);
        assert_eq!(worker_in.try_recv().unwrap(), b"2|{\"aid\":\"peek_message\"}");

        gw.handle(GatewayEvent::WorkerPayload {
            key: "simnow_alice".into(),
            payload: b"1|2#{\"aid\":\"rtn_data\"}".to_vec(),
        });
        assert_eq!(a.texts().last().unwrap(), "{\"aid\":\"rtn_data\"}");
        assert_eq!(b.texts().last().unwrap(), "{\"aid\":\"rtn_data\"}");

        gw.handle(GatewayEvent::Closed { conn_id: 1 });
        assert_eq!(worker_in.try_recv().unwrap(), b"1|CLOSE_CONNECTION_MSG");
        assert_eq!(gw.registry().len(), 1);

        gw.handle(GatewayEvent::Closed { conn_id: 2 });
        assert!(gw.registry().is_empty());
        assert!(!dir.join("simnow_alice_msg_in").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_dead_worker_notifies_every_attached_connection() {
        use std::os::unix::fs::PermissionsExt;
        use std::time::{Duration, Instant};
        let dir = scratch_dir("control");
        let worker = dir.join("trade-sim");
        let script = format!("#!/bin/sh\nwhile [ ! -e {} ]; do sleep 0.05; done\n", dir.join("die").display());
        std::fs::write(&worker, script).unwrap();
        std::fs::set_permissions(&worker, std::fs::Permissions::from_mode(0o755)).unwrap();

        let (mut gw, _rx) = gateway(&dir);
        let a = open(&mut gw, 1);
        let b = open(&mut gw, 2);
        text(&mut gw, 1, LOGIN);
        text(&mut gw, 2, LOGIN);
        let session = gw.registry().get("simnow_alice").unwrap();
        assert!(session.is_running());

        std::fs::write(dir.join("die"), "").unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while session.is_running() {
            assert!(Instant::now() < deadline, "worker did not exit");
            std::thread::sleep(Duration::from_millis(20));
        }
        drop(session);

        text(&mut gw, 1, r#"{"aid":"peek_message"}"#);
        assert!(a.texts().last().unwrap().contains("please log in again"));
        assert!(b.texts().last().unwrap().contains("please log in again"));
        assert!(gw.registry().is_empty());

        // both connections are unbound now
        text(&mut gw, 2, r#"{"aid":"peek_message"}"#);
        assert!(b.texts().last().unwrap().contains("please log in first"));
    }

    #[test]
    fn test_shutdown_event_ends_loop() {
        let dir = scratch_dir("control");
        let (mut gw, _rx) = gateway(&dir);
        assert!(!gw.handle(GatewayEvent::Shutdown));
    }
}
