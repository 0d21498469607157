//! Frame codec for both bus directions.
//!
//! Inbound frames are `"<conn_id>|<payload>"`. Outbound payloads are
//! `"id1|id2|...|idN#body"` and may be split across several frames between
//! `BEGIN_OF_PACKAGE` and `END_OF_PACKAGE`.

use super::{ConnId, BEGIN_OF_PACKAGE, END_OF_PACKAGE};

/// Gateway → worker frame.
pub fn encode_inbound(conn_id: ConnId, payload: &str) -> String {
    format!("{}|{}", conn_id, payload)
}

/// Worker side of `encode_inbound`.
pub fn decode_inbound(frame: &[u8]) -> Option<(ConnId, &str)> {
    let text = std::str::from_utf8(frame).ok()?;
    let (id, payload) = text.split_once('|')?;
    Some((id.trim().parse().ok()?, payload))
}

/// Worker → gateway payload addressed to a set of connections.
pub fn encode_routed(ids: &[ConnId], body: &str) -> String {
    let ids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
    format!("{}#{}", ids.join("|"), body)
}

/// A reassembled outbound payload, split into its addressees and body.
#[derive(Debug, PartialEq, Eq)]
pub struct RoutedPayload<'a> {
    pub ids: Vec<ConnId>,
    pub body: &'a str,
}

impl<'a> RoutedPayload<'a> {
    /// `None` when the `#` separator is missing, the id list is empty or
    /// the body is empty. Ids that are not numbers are skipped.
    pub fn parse(payload: &'a str) -> Option<Self> {
        let (ids, body) = payload.split_once('#')?;
        if ids.is_empty() || body.is_empty() {
            return None;
        }
        let ids = ids
            .split('|')
            .filter_map(|id| id.trim().parse::<ConnId>().ok())
            .collect();
        Some(Self { ids, body })
    }
}

/// Cut a payload into frames no longer than `max_len`. Payloads that fit
/// travel as a single frame; longer ones are bracketed.
pub fn split_frames(payload: &[u8], max_len: usize) -> Vec<Vec<u8>> {
    if payload.is_empty() || max_len == 0 {
        return Vec::new();
    }
    if payload.len() <= max_len {
        return vec![payload.to_vec()];
    }
    let mut frames = Vec::with_capacity(payload.len() / max_len + 3);
    frames.push(BEGIN_OF_PACKAGE.as_bytes().to_vec());
    frames.extend(payload.chunks(max_len).map(|c| c.to_vec()));
    frames.push(END_OF_PACKAGE.as_bytes().to_vec());
    frames
}

/// Receiver-side state for bracketed payloads.
#[derive(Debug, Default)]
pub struct Reassembler {
    buf: Vec<u8>,
    open: bool,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one frame; returns a payload once one is complete.
    pub fn push(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        if frame.is_empty() {
            return None;
        }
        if frame == BEGIN_OF_PACKAGE.as_bytes() {
            self.buf.clear();
            self.open = true;
            return None;
        }
        if frame == END_OF_PACKAGE.as_bytes() {
            self.open = false;
            let payload = std::mem::take(&mut self.buf);
            return (!payload.is_empty()).then_some(payload);
        }
        if self.open {
            self.buf.extend_from_slice(frame);
            return None;
        }
        Some(frame.to_vec())
    }

    pub fn in_package(&self) -> bool {
        self.open
    }
}
