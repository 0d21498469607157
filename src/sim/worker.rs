//! Simulator worker - bus loop around one [`SimEngine`]
//!
//! Attaches to the channel pair the gateway created for `key`, restores the
//! account from its snapshot file and then loops: timed receive, quote poll,
//! push attempt, save.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::engine::SimEngine;
use super::instrument::InstrumentTable;
use super::quotes::QuoteMatrix;
use super::store::SnapshotStore;
use crate::bus::{
    decode_inbound, encode_routed, inbound_name, outbound_name, split_frames, ConnId, ShmChannel,
    CLOSE_CONNECTION_MSG,
};
use crate::core::{Config, Error, Result};
use crate::protocol::{Action, Notice};

pub struct SimWorker {
    key: String,
    inbound: ShmChannel,
    outbound: ShmChannel,
    engine: SimEngine,
    store: SnapshotStore,
    quotes: Option<QuoteMatrix>,
    /// Connections that sent `req_login`; every push goes to all of them
    logged_in: BTreeSet<ConnId>,
    /// Frames waiting for room in the outbound channel, in send order
    backlog: VecDeque<Vec<u8>>,
    notify_seq: u64,
    poll: Duration,
}

impl SimWorker {
    pub fn attach(key: &str, config: &Config) -> Result<Self> {
        let bus = &config.bus;
        let inbound = ShmChannel::open(&bus.dir, &inbound_name(key))?;
        let outbound = ShmChannel::open(&bus.dir, &outbound_name(key))?;

        let sim = &config.sim;
        let instruments = InstrumentTable::load(&sim.instrument_file)?;
        info!("📋 Loaded {} instruments from {}", instruments.len(), sim.instrument_file.display());

        let store = SnapshotStore::new(&sim.user_file_path, key);
        let engine = match store.load()? {
            Some(state) => {
                info!(path = %store.path().display(), "restored account snapshot");
                SimEngine::restore(instruments, &sim.currency, state)
            }
            None => SimEngine::new(instruments, &sim.currency, sim.initial_balance),
        };

        let quotes = sim.quote_matrix.as_ref().and_then(|path| match QuoteMatrix::open(path) {
            Ok(m) => Some(m),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "quote matrix unavailable, using static quotes");
                None
            }
        });

        Ok(Self {
            key: key.to_string(),
            inbound,
            outbound,
            engine,
            store,
            quotes,
            logged_in: BTreeSet::new(),
            backlog: VecDeque::new(),
            notify_seq: 0,
            poll: Duration::from_millis(bus.recv_poll_ms.max(1)),
        })
    }

    pub fn engine(&self) -> &SimEngine {
        &self.engine
    }

    pub fn logged_in(&self) -> impl Iterator<Item = ConnId> + '_ {
        self.logged_in.iter().copied()
    }

    /// Frames queued but not yet written to the outbound channel.
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Serve until `stop` is raised, then save.
    pub fn run(&mut self, stop: &AtomicBool) {
        info!(key = %self.key, "sim worker running");
        while !stop.load(Ordering::Acquire) {
            self.step();
        }
        self.drain_backlog();
        if !self.backlog.is_empty() {
            warn!(key = %self.key, frames = self.backlog.len(), "outbound frames dropped at shutdown");
        }
        self.save();
        info!(key = %self.key, "sim worker stopped");
    }

    /// One loop iteration.
    pub fn step(&mut self) {
        if let Some(frame) = self.inbound.recv_timeout(self.poll) {
            self.handle_frame(&frame);
            while let Some(frame) = self.inbound.try_recv() {
                self.handle_frame(&frame);
            }
        }
        if let Some(quotes) = self.quotes.as_mut() {
            quotes.poll_into(self.engine.instruments_mut());
        }
        self.flush();
    }

    pub fn handle_frame(&mut self, frame: &[u8]) {
        let Some((conn_id, payload)) = decode_inbound(frame) else {
            debug!(key = %self.key, "dropping malformed inbound frame");
            return;
        };
        if payload == CLOSE_CONNECTION_MSG {
            self.logged_in.remove(&conn_id);
            debug!(key = %self.key, conn_id, "connection closed");
            return;
        }

        let action = match serde_json::from_str::<Action>(payload) {
            Ok(action) => action,
            Err(e) => {
                debug!(key = %self.key, conn_id, error = %e, "ignoring unsupported request");
                return;
            }
        };

        if let Action::ReqLogin(req) = &action {
            self.engine.bind_user(&req.user_name);
            self.logged_in.insert(conn_id);
            info!(key = %self.key, conn_id, user = %req.user_name, "client logged in");
            self.engine.refresh();
            let snapshot = self.engine.full_snapshot();
            self.send_to(&[conn_id], &snapshot);
            self.notify(&[conn_id], Notice::info("login succeeded"));
            return;
        }
        if !self.logged_in.contains(&conn_id) {
            self.notify(&[conn_id], Notice::warning("please log in first"));
            return;
        }

        match action {
            Action::InsertOrder(order) => self.engine.insert_order(order),
            Action::CancelOrder(cancel) => self.engine.cancel_order(cancel),
            Action::ReqTransfer(transfer) => self.engine.transfer(transfer),
            Action::PeekMessage => self.engine.peek(),
            Action::ReqLogin(_) => {}
        }
    }

    /// Queue pending notices and the pending push, write what fits, then
    /// save if dirty. A push is only built once earlier output has drained,
    /// so its dirty flags keep coalescing while the gateway lags behind.
    pub fn flush(&mut self) {
        self.send_notices();
        self.drain_backlog();
        if !self.logged_in.is_empty() && self.backlog.is_empty() {
            if let Some(push) = self.engine.prepare_push() {
                let ids = self.connection_ids();
                if self.send_to(&ids, &push) {
                    self.engine.ack_push();
                }
            }
            self.send_notices();
        }
        self.drain_backlog();
        if self.engine.take_unsaved() {
            self.save();
        }
    }

    fn save(&self) {
        if let Err(e) = self.store.save(&self.engine.state()) {
            error!(key = %self.key, path = %self.store.path().display(), error = %e, "snapshot save failed");
        }
    }

    fn send_notices(&mut self) {
        let notices = self.engine.take_notices();
        if notices.is_empty() {
            return;
        }
        let ids = self.connection_ids();
        for notice in notices {
            self.notify(&ids, notice);
        }
    }

    fn notify(&mut self, ids: &[ConnId], notice: Notice) {
        self.notify_seq += 1;
        let body = notice.to_json(self.notify_seq);
        self.send_to(ids, &body);
    }

    fn connection_ids(&self) -> Vec<ConnId> {
        self.logged_in.iter().copied().collect()
    }

    /// Queue every frame of the payload behind earlier output.
    fn send_to(&mut self, ids: &[ConnId], body: &str) -> bool {
        if ids.is_empty() {
            return false;
        }
        let payload = encode_routed(ids, body);
        self.backlog.extend(split_frames(payload.as_bytes(), self.outbound.max_msg_len()));
        true
    }

    /// Write queued frames until the outbound channel is full.
    fn drain_backlog(&mut self) {
        while let Some(frame) = self.backlog.front() {
            match self.outbound.try_send(frame) {
                Ok(()) => {}
                Err(Error::ChannelFull(_)) => {
                    debug!(key = %self.key, pending = self.backlog.len(), "outbound channel full, waiting");
                    return;
                }
                Err(e) => error!(key = %self.key, error = %e, "outbound frame dropped"),
            }
            self.backlog.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::channel::tests::scratch_dir;
    use crate::bus::{encode_inbound, Reassembler, RoutedPayload};
    use crate::core::config::BusConfig;
    use std::path::Path;

    const INSTRUMENTS: &str = r#"[{"symbol":"SHFE.cu2501","price_tick":10,"volume_multiple":5,
        "margin":20000,"commission":3,"upper_limit":80000,"lower_limit":70000,
        "pre_settlement":75000,"ask_price1":75010,"bid_price1":75000}]"#;

    fn config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.bus = BusConfig { dir: dir.to_path_buf(), max_msg_len: 128, max_msg_nums: 256, recv_poll_ms: 1 };
        config.sim.instrument_file = dir.join("instruments.json");
        config.sim.user_file_path = dir.join("users");
        config.sim.initial_balance = 1_000_000.0;
        std::fs::write(&config.sim.instrument_file, INSTRUMENTS).unwrap();
        config
    }

    /// Gateway ends of the channel pair.
    fn gateway_side(config: &Config, key: &str) -> (ShmChannel, ShmChannel) {
        let bus = &config.bus;
        let to_worker = ShmChannel::create(&bus.dir, &inbound_name(key), bus.max_msg_nums, bus.max_msg_len).unwrap();
        let from_worker = ShmChannel::create(&bus.dir, &outbound_name(key), bus.max_msg_nums, bus.max_msg_len).unwrap();
        (to_worker, from_worker)
    }

    fn drain(from_worker: &mut ShmChannel) -> Vec<(Vec<ConnId>, serde_json::Value)> {
        let mut reassembler = Reassembler::new();
        let mut out = Vec::new();
        while let Some(frame) = from_worker.try_recv() {
            if let Some(payload) = reassembler.push(&frame) {
                let text = String::from_utf8(payload).unwrap();
                let routed = RoutedPayload::parse(&text).unwrap();
                out.push((routed.ids.clone(), serde_json::from_str(routed.body).unwrap()));
            }
        }
        out
    }

    fn notice_texts(msgs: &[(Vec<ConnId>, serde_json::Value)]) -> Vec<String> {
        msgs.iter()
            .filter_map(|(_, v)| v["data"][0]["notify"].as_object())
            .flat_map(|n| n.values().map(|m| m["content"].as_str().unwrap_or_default().to_string()))
            .collect()
    }

    fn send(to_worker: &mut ShmChannel, conn: ConnId, payload: &str) {
        to_worker.try_send(encode_inbound(conn, payload).as_bytes()).unwrap();
    }

    const LOGIN: &str = r#"{"aid":"req_login","bid":"sim","user_name":"alice"}"#;
    const BUY: &str = r#"{"aid":"insert_order","order_id":"o1","user_id":"alice","exchange_id":"SHFE",
        "instrument_id":"cu2501","direction":"BUY","offset":"OPEN","volume":2,"price_type":"LIMIT",
        "limit_price":75010}"#;

    #[test]
    fn test_login_trade_push_and_restart() {
        let dir = scratch_dir("worker");
        let config = config(&dir);
        let (mut to_worker, mut from_worker) = gateway_side(&config, "sim_alice");
        let mut worker = SimWorker::attach("sim_alice", &config).unwrap();

        // not logged in yet
        send(&mut to_worker, 2, r#"{"aid":"peek_message"}"#);
        worker.step();
        let msgs = drain(&mut from_worker);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].0, vec![2]);
        assert_eq!(notice_texts(&msgs), vec!["please log in first"]);

        send(&mut to_worker, 1, LOGIN);
        worker.step();
        let msgs = drain(&mut from_worker);
        assert_eq!(msgs[0].0, vec![1]);
        let user = &msgs[0].1["data"][0]["trade"]["alice"];
        assert_eq!(user["accounts"]["CNY"]["balance"], 1_000_000.0);
        assert!(notice_texts(&msgs).contains(&"login succeeded".to_string()));

        send(&mut to_worker, 1, BUY);
        send(&mut to_worker, 1, r#"{"aid":"peek_message"}"#);
        worker.step();
        let msgs = drain(&mut from_worker);
        let notices = notice_texts(&msgs);
        assert!(notices.contains(&"order inserted".to_string()));
        assert!(notices.iter().any(|n| n.starts_with("trade: SHFE.cu2501")));
        let push = msgs
            .iter()
            .find(|(_, v)| v["data"][0].get("trade").is_some())
            .expect("push after peek");
        let trades = push.1["data"][0]["trade"]["alice"]["trades"].as_object().unwrap();
        assert_eq!(trades.len(), 1);
        assert!(!worker.engine().is_peeking());

        // second peek without a change: nothing
        send(&mut to_worker, 1, r#"{"aid":"peek_message"}"#);
        worker.step();
        assert!(drain(&mut from_worker).is_empty());

        send(&mut to_worker, 1, CLOSE_CONNECTION_MSG);
        worker.step();
        assert_eq!(worker.logged_in().count(), 0);
        drop(worker);

        let restarted = SimWorker::attach("sim_alice", &config).unwrap();
        let data = restarted.engine().data();
        assert_eq!(data.user_id, "alice");
        assert_eq!(data.positions["SHFE.cu2501"].volume_long_today, 2);
    }

    #[test]
    fn test_push_goes_to_every_logged_in_connection() {
        let dir = scratch_dir("worker");
        let config = config(&dir);
        let (mut to_worker, mut from_worker) = gateway_side(&config, "sim_alice");
        let mut worker = SimWorker::attach("sim_alice", &config).unwrap();

        send(&mut to_worker, 1, LOGIN);
        send(&mut to_worker, 4, LOGIN);
        worker.step();
        drain(&mut from_worker);

        send(&mut to_worker, 4, r#"{"aid":"req_transfer","amount":100}"#);
        send(&mut to_worker, 4, r#"{"aid":"peek_message"}"#);
        worker.step();
        let msgs = drain(&mut from_worker);
        assert!(!msgs.is_empty());
        assert!(msgs.iter().all(|(ids, _)| *ids == vec![1, 4]));
    }

    #[test]
    fn test_payload_larger_than_outbound_channel_is_delivered() {
        let dir = scratch_dir("worker");
        let config = config(&dir);
        let bus = &config.bus;
        let mut to_worker = ShmChannel::create(&bus.dir, &inbound_name("tiny"), 16, 512).unwrap();
        let mut from_worker = ShmChannel::create(&bus.dir, &outbound_name("tiny"), 4, 64).unwrap();
        let mut worker = SimWorker::attach("tiny", &config).unwrap();

        let mut reassembler = Reassembler::new();
        let mut pump = |worker: &mut SimWorker, from_worker: &mut ShmChannel| {
            let mut out = Vec::new();
            for _ in 0..1000 {
                worker.step();
                while let Some(frame) = from_worker.try_recv() {
                    if let Some(payload) = reassembler.push(&frame) {
                        let text = String::from_utf8(payload).unwrap();
                        let routed = RoutedPayload::parse(&text).unwrap();
                        out.push(serde_json::from_str::<serde_json::Value>(routed.body).unwrap());
                    }
                }
                if worker.backlog_len() == 0 && !worker.engine().is_peeking() {
                    break;
                }
            }
            out
        };

        send(&mut to_worker, 1, LOGIN);
        let msgs = pump(&mut worker, &mut from_worker);
        assert!(msgs.iter().any(|v| v["data"][0]["trade"]["alice"]["accounts"]["CNY"].is_object()));
        let notices: Vec<_> = msgs.iter().map(|v| (Vec::new(), v.clone())).collect();
        assert!(notice_texts(&notices).contains(&"login succeeded".to_string()));

        send(&mut to_worker, 1, BUY);
        send(&mut to_worker, 1, r#"{"aid":"peek_message"}"#);
        let msgs = pump(&mut worker, &mut from_worker);
        assert!(!worker.engine().is_peeking());
        assert_eq!(worker.backlog_len(), 0);
        assert!(msgs.iter().any(|v| v["data"][0]["trade"]["alice"]["trades"].is_object()));
    }

    #[test]
    fn test_missing_channels_fail_attach() {
        let dir = scratch_dir("worker");
        let config = config(&dir);
        assert!(SimWorker::attach("nobody", &config).is_err());
    }

    #[test]
    fn test_garbage_frames_are_ignored() {
        let dir = scratch_dir("worker");
        let config = config(&dir);
        let (_to_worker, mut from_worker) = gateway_side(&config, "k");
        let mut worker = SimWorker::attach("k", &config).unwrap();
        worker.handle_frame(b"no separator");
        worker.handle_frame(b"x|{}");
        worker.handle_frame(b"1|not json");
        worker.handle_frame(b"1|{\"aid\":\"subscribe_quote\"}");
        worker.flush();
        assert!(drain(&mut from_worker).is_empty());
    }
}
