// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An in-process link between two storage processors

use sparing_protocol::Envelope;
use tokio::sync::mpsc;

/// We only expect a handful of messages in flight per position
const PEER_CHANNEL_BOUND: usize = 1024;

/// One end of a connection to the peer storage processor
///
/// The link is considered down once either end is dropped.
#[derive(Debug)]
pub struct PeerLink {
    tx: mpsc::Sender<Envelope>,
    rx: mpsc::Receiver<Envelope>,
}

impl PeerLink {
    /// Create both ends of a link
    pub fn pair() -> (PeerLink, PeerLink) {
        let (a_tx, b_rx) = mpsc::channel(PEER_CHANNEL_BOUND);
        let (b_tx, a_rx) = mpsc::channel(PEER_CHANNEL_BOUND);
        (PeerLink { tx: a_tx, rx: a_rx }, PeerLink { tx: b_tx, rx: b_rx })
    }

    /// Returns `false` if the peer is gone
    pub(crate) async fn send(&self, envelope: Envelope) -> bool {
        self.tx.send(envelope).await.is_ok()
    }

    /// Returns `None` once the peer is gone
    pub(crate) async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }
}
