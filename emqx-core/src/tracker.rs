// Copyright 2025 The Drasi Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Bookkeeping for messages that are waiting on the other side of the
//! protocol.
//!
//! [`PacketTracker`] follows outgoing requests (publishes, subscribes). The
//! client library assigns packet ids inside its event loop and reports them
//! as `Outgoing` events in request order, so requests are registered before
//! they are handed to the client and bound to a packet id when that event
//! shows up. [`ReceiveTracker`] follows incoming QoS 1/2 publishes until
//! they are acknowledged, and suppresses QoS 2 redeliveries.

use std::collections::VecDeque;

use dashmap::DashMap;
use rumqttc::Publish;
use tokio::sync::oneshot;

use crate::config::QoS;

/// Acknowledgment state of an in-flight message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckState {
    Pending,
    Acked,
    Failed,
}

/// Opaque handle of a registered request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestToken(u64);

#[derive(Debug)]
struct Entry<T> {
    token: RequestToken,
    pkid: Option<u16>,
    qos: QoS,
    topic: String,
    state: AckState,
    waiter: Option<oneshot::Sender<T>>,
}

/// Outgoing requests awaiting their acknowledgment, in request order.
#[derive(Debug)]
pub struct PacketTracker<T> {
    entries: VecDeque<Entry<T>>,
    next_token: u64,
}

impl<T> Default for PacketTracker<T> {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
            next_token: 0,
        }
    }
}

impl<T> PacketTracker<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request about to be handed to the client.
    pub fn register(
        &mut self,
        topic: impl Into<String>,
        qos: QoS,
        waiter: Option<oneshot::Sender<T>>,
    ) -> RequestToken {
        let token = RequestToken(self.next_token);
        self.next_token += 1;
        self.entries.push_back(Entry {
            token,
            pkid: None,
            qos,
            topic: topic.into(),
            state: AckState::Pending,
            waiter,
        });
        token
    }

    /// Bind `pkid` to the oldest request that has none yet.
    ///
    /// Returns `false` for packet id 0 (QoS 0 traffic) and for ids that are
    /// already bound, which is what a retransmission looks like.
    pub fn assign(&mut self, pkid: u16) -> bool {
        if pkid == 0 || self.entries.iter().any(|e| e.pkid == Some(pkid)) {
            return false;
        }
        match self.entries.iter_mut().find(|e| e.pkid.is_none()) {
            Some(entry) => {
                entry.pkid = Some(pkid);
                true
            }
            None => false,
        }
    }

    /// Resolve the request bound to `pkid` if its QoS matches, handing
    /// `outcome` to its waiter. Returns the topic of the completed request.
    pub fn complete(&mut self, pkid: u16, qos: QoS, outcome: T) -> Option<String> {
        let index = self
            .entries
            .iter()
            .position(|e| e.pkid == Some(pkid) && e.qos == qos)?;
        let mut entry = self.entries.remove(index)?;
        if let Some(waiter) = entry.waiter.take() {
            let _ = waiter.send(outcome);
        }
        Some(entry.topic)
    }

    /// Resolve the request bound to `pkid` whatever its QoS, deriving the
    /// outcome from its topic. Used for SUBACK, which does not echo the QoS.
    pub fn resolve(&mut self, pkid: u16, outcome: impl FnOnce(&str) -> T) -> Option<String> {
        let index = self.entries.iter().position(|e| e.pkid == Some(pkid))?;
        let mut entry = self.entries.remove(index)?;
        if let Some(waiter) = entry.waiter.take() {
            let _ = waiter.send(outcome(&entry.topic));
        }
        Some(entry.topic)
    }

    /// Remove a request the client never accepted.
    pub fn withdraw(&mut self, token: RequestToken) {
        self.entries.retain(|e| e.token != token);
    }

    /// Give up on a request whose waiter timed out and return its packet id.
    ///
    /// The request stays queued as `Failed` until its ack arrives. An unbound
    /// one keeps its slot so that its `Outgoing` event still lines up; a bound
    /// one keeps its packet id, which the client retransmits after a
    /// reconnect and which must not be handed to a newer request.
    pub fn abandon(&mut self, token: RequestToken) -> Option<u16> {
        let entry = self.entries.iter_mut().find(|e| e.token == token)?;
        entry.state = AckState::Failed;
        entry.waiter = None;
        entry.pkid
    }

    /// Requests somebody is still waiting for.
    pub fn pending(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.state == AckState::Pending)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fail every request, e.g. when the connection is torn down.
    pub fn fail_all(&mut self, mut outcome: impl FnMut(&str) -> T) {
        for mut entry in self.entries.drain(..) {
            if let Some(waiter) = entry.waiter.take() {
                let _ = waiter.send(outcome(&entry.topic));
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Received {
    qos: QoS,
    state: AckState,
}

/// Incoming QoS 1/2 publishes between arrival and acknowledgment.
#[derive(Debug, Default)]
pub struct ReceiveTracker {
    in_flight: DashMap<u16, Received>,
}

impl ReceiveTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an arriving publish. Returns `false` for a QoS 2 redelivery of
    /// a packet whose PUBREL has not been seen yet; such a message must not
    /// reach the consumer a second time. A redelivery of a message whose
    /// hand-off failed is admitted again.
    pub fn admit(&self, publish: &Publish) -> bool {
        let qos = QoS::from(publish.qos);
        if !qos.requires_ack() || publish.pkid == 0 {
            return true;
        }
        if qos == QoS::ExactlyOnce
            && matches!(
                self.state(publish.pkid),
                Some(AckState::Pending | AckState::Acked)
            )
        {
            return false;
        }
        self.in_flight.insert(
            publish.pkid,
            Received {
                qos,
                state: AckState::Pending,
            },
        );
        true
    }

    /// The consumer accepted the message and the ack was sent. QoS 2 ids
    /// stay reserved until [`released`](Self::released).
    pub fn acked(&self, pkid: u16) {
        let qos2 = match self.in_flight.get_mut(&pkid) {
            Some(mut entry) => {
                entry.state = AckState::Acked;
                entry.qos == QoS::ExactlyOnce
            }
            None => return,
        };
        if !qos2 {
            self.in_flight.remove(&pkid);
        }
    }

    /// The hand-off failed; the message stays unacknowledged.
    pub fn failed(&self, pkid: u16) {
        if let Some(mut entry) = self.in_flight.get_mut(&pkid) {
            entry.state = AckState::Failed;
        }
    }

    /// PUBREL arrived: the QoS 2 exchange for `pkid` is over.
    pub fn released(&self, pkid: u16) {
        self.in_flight.remove(&pkid);
    }

    pub fn state(&self, pkid: u16) -> Option<AckState> {
        self.in_flight.get(&pkid).map(|e| e.state)
    }

    /// Messages delivered to the consumer but not yet acknowledged.
    pub fn unacked(&self) -> usize {
        self.in_flight
            .iter()
            .filter(|e| e.state == AckState::Pending)
            .count()
    }

    /// Forget everything; the broker started a fresh session.
    pub fn clear(&self) {
        self.in_flight.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publish(qos: rumqttc::QoS, pkid: u16) -> Publish {
        let mut publish = Publish::new("sensor/1", qos, b"{}".to_vec());
        publish.pkid = pkid;
        publish
    }

    #[test]
    fn test_assign_in_request_order() {
        let mut tracker: PacketTracker<()> = PacketTracker::new();
        let (a_tx, mut a_rx) = oneshot::channel();
        let (b_tx, mut b_rx) = oneshot::channel();
        tracker.register("a", QoS::AtLeastOnce, Some(a_tx));
        tracker.register("b", QoS::AtLeastOnce, Some(b_tx));

        assert!(tracker.assign(5));
        assert!(tracker.assign(6));
        assert!(!tracker.assign(5), "retransmission must not rebind");

        assert_eq!(tracker.complete(6, QoS::AtLeastOnce, ()), Some("b".into()));
        assert!(b_rx.try_recv().is_ok());
        assert!(a_rx.try_recv().is_err());
        assert_eq!(tracker.pending(), 1);
    }

    #[test]
    fn test_qos0_ids_are_ignored() {
        let mut tracker: PacketTracker<()> = PacketTracker::new();
        tracker.register("a", QoS::AtLeastOnce, None);
        assert!(!tracker.assign(0));
        assert!(tracker.assign(1));
    }

    #[test]
    fn test_complete_requires_matching_qos() {
        let mut tracker: PacketTracker<()> = PacketTracker::new();
        tracker.register("a", QoS::ExactlyOnce, None);
        tracker.assign(3);
        assert_eq!(tracker.complete(3, QoS::AtLeastOnce, ()), None);
        assert_eq!(tracker.complete(3, QoS::ExactlyOnce, ()), Some("a".into()));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_abandon_keeps_unbound_slot() {
        let mut tracker: PacketTracker<()> = PacketTracker::new();
        let first = tracker.register("a", QoS::AtLeastOnce, None);
        tracker.register("b", QoS::AtLeastOnce, None);

        assert_eq!(tracker.abandon(first), None);
        assert_eq!(tracker.pending(), 1);

        // The late outgoing event still binds to the abandoned request.
        tracker.assign(10);
        tracker.assign(11);
        assert_eq!(tracker.complete(11, QoS::AtLeastOnce, ()), Some("b".into()));
        assert_eq!(tracker.complete(10, QoS::AtLeastOnce, ()), Some("a".into()));
    }

    #[test]
    fn test_abandoned_pkid_is_not_rebound() {
        let mut tracker: PacketTracker<()> = PacketTracker::new();
        let first = tracker.register("a", QoS::AtLeastOnce, None);
        assert!(tracker.assign(5));
        assert_eq!(tracker.abandon(first), Some(5));
        assert_eq!(tracker.pending(), 0);

        let (b_tx, mut b_rx) = oneshot::channel();
        tracker.register("b", QoS::AtLeastOnce, Some(b_tx));

        // Retransmission of the abandoned packet after a reconnect.
        assert!(!tracker.assign(5));
        assert_eq!(tracker.complete(5, QoS::AtLeastOnce, ()), Some("a".into()));
        assert!(b_rx.try_recv().is_err());
        assert_eq!(tracker.pending(), 1);

        assert!(tracker.assign(6));
        assert_eq!(tracker.complete(6, QoS::AtLeastOnce, ()), Some("b".into()));
        assert!(b_rx.try_recv().is_ok());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_fail_all() {
        let mut tracker: PacketTracker<Result<(), String>> = PacketTracker::new();
        let (tx, mut rx) = oneshot::channel();
        tracker.register("a", QoS::AtLeastOnce, Some(tx));
        tracker.fail_all(|topic| Err(format!("{topic} closed")));
        assert_eq!(rx.try_recv().unwrap(), Err("a closed".to_string()));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_qos2_redelivery_suppressed_until_release() {
        let tracker = ReceiveTracker::new();
        let first = publish(rumqttc::QoS::ExactlyOnce, 9);
        let mut duplicate = first.clone();
        duplicate.dup = true;

        assert!(tracker.admit(&first));
        assert!(!tracker.admit(&duplicate));

        tracker.acked(9);
        assert_eq!(tracker.state(9), Some(AckState::Acked));
        assert!(!tracker.admit(&duplicate));

        tracker.released(9);
        assert!(tracker.admit(&first), "a released id may be reused");
    }

    #[test]
    fn test_qos1_duplicates_pass_through() {
        let tracker = ReceiveTracker::new();
        let message = publish(rumqttc::QoS::AtLeastOnce, 4);
        assert!(tracker.admit(&message));
        assert!(tracker.admit(&message));
        assert_eq!(tracker.unacked(), 1);
        tracker.acked(4);
        assert_eq!(tracker.state(4), None);
        assert_eq!(tracker.unacked(), 0);
    }

    #[test]
    fn test_failed_handoff() {
        let tracker = ReceiveTracker::new();
        assert!(tracker.admit(&publish(rumqttc::QoS::AtLeastOnce, 2)));
        tracker.failed(2);
        assert_eq!(tracker.state(2), Some(AckState::Failed));
        assert_eq!(tracker.unacked(), 0);
    }

    #[test]
    fn test_qos2_redelivery_admitted_after_failed_handoff() {
        let tracker = ReceiveTracker::new();
        let first = publish(rumqttc::QoS::ExactlyOnce, 5);
        let mut duplicate = first.clone();
        duplicate.dup = true;

        assert!(tracker.admit(&first));
        tracker.failed(5);
        assert!(tracker.admit(&duplicate));
        assert_eq!(tracker.state(5), Some(AckState::Pending));
        assert_eq!(tracker.unacked(), 1);

        // Once accepted, further copies are suppressed again.
        tracker.acked(5);
        assert!(!tracker.admit(&duplicate));
    }

    #[test]
    fn test_qos0_not_tracked() {
        let tracker = ReceiveTracker::new();
        assert!(tracker.admit(&publish(rumqttc::QoS::AtMostOnce, 0)));
        assert_eq!(tracker.unacked(), 0);
    }
}
