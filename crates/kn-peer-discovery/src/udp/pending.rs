//! Pending-reply registry.
//!
//! A single task owns the list of outstanding requests. Registrations and
//! inbound replies reach it through one FIFO channel, so a registration made
//! before a request is sent is always seen before the reply to that request.

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant};
use tracing::{debug, trace};

use super::ntp;
use crate::domain::{
    DiscoveryError, NodeId, NodeType, NTP_FAILURE_THRESHOLD, NTP_WARNING_COOLDOWN, RESP_TIMEOUT,
};
use crate::wire::{Packet, PacketType};

/// Reply acceptor. Returns `true` once the request is complete.
pub(crate) type Callback = Box<dyn FnMut(&Packet) -> bool + Send>;

/// Outcome delivered to the requester.
pub(crate) type PendingResult = Result<(), DiscoveryError>;

const QUEUE_SIZE: usize = 256;

/// An outstanding request waiting for replies.
pub(crate) struct Pending {
    from: NodeId,
    ptype: PacketType,
    /// Only consulted for NEIGHBORS.
    target_type: NodeType,
    /// Assigned by the loop on registration unless preset.
    deadline: Option<Instant>,
    callback: Callback,
    errc: oneshot::Sender<PendingResult>,
}

impl Pending {
    fn finish(self, result: PendingResult) {
        let _ = self.errc.send(result);
    }
}

/// An inbound reply offered to the registry.
pub(crate) struct Reply {
    from: NodeId,
    ptype: PacketType,
    packet: Packet,
    matched: oneshot::Sender<bool>,
}

enum Message {
    Add(Pending),
    Reply(Reply),
}

/// Handle to the registry task.
#[derive(Clone)]
pub(crate) struct PendingQueue {
    tx: mpsc::Sender<Message>,
    closing: watch::Receiver<bool>,
}

impl PendingQueue {
    /// Spawn the registry task. It stops once `closing` turns `true`.
    pub(crate) fn spawn(closing: watch::Receiver<bool>) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_SIZE);
        tokio::spawn(run(rx, closing.clone()));
        Self { tx, closing }
    }

    /// Register interest in replies of `ptype` from `from`.
    ///
    /// The returned receiver yields once `callback` accepts a reply, the
    /// request times out or the transport closes.
    pub(crate) async fn add(
        &self,
        from: NodeId,
        ptype: PacketType,
        target_type: NodeType,
        callback: Callback,
    ) -> oneshot::Receiver<PendingResult> {
        self.add_with_deadline(from, ptype, target_type, None, callback)
            .await
    }

    pub(crate) async fn add_with_deadline(
        &self,
        from: NodeId,
        ptype: PacketType,
        target_type: NodeType,
        deadline: Option<Instant>,
        callback: Callback,
    ) -> oneshot::Receiver<PendingResult> {
        let (errc, rx) = oneshot::channel();
        let p = Pending {
            from,
            ptype,
            target_type,
            deadline,
            callback,
            errc,
        };
        if *self.closing.borrow() {
            p.finish(Err(DiscoveryError::Closed));
            return rx;
        }
        if let Err(mpsc::error::SendError(Message::Add(p))) = self.tx.send(Message::Add(p)).await {
            p.finish(Err(DiscoveryError::Closed));
        }
        rx
    }

    /// Offer a reply to the registry. Returns whether any request matched.
    pub(crate) async fn handle_reply(&self, from: NodeId, ptype: PacketType, packet: Packet) -> bool {
        if *self.closing.borrow() {
            return false;
        }
        let (matched, rx) = oneshot::channel();
        let reply = Reply {
            from,
            ptype,
            packet,
            matched,
        };
        if self.tx.send(Message::Reply(reply)).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }
}

/// Wait for the outcome of a registration.
pub(crate) async fn wait(rx: oneshot::Receiver<PendingResult>) -> PendingResult {
    rx.await.unwrap_or(Err(DiscoveryError::Closed))
}

async fn run(mut rx: mpsc::Receiver<Message>, mut closing: watch::Receiver<bool>) {
    let mut plist: Vec<Pending> = Vec::new();
    let timeout = time::sleep(RESP_TIMEOUT);
    tokio::pin!(timeout);
    let mut cont_timeouts: u32 = 0;
    let mut ntp_warn_time: Option<Instant> = None;

    loop {
        let armed = reset_timeout(&mut plist, timeout.as_mut());

        tokio::select! {
            biased;

            res = closing.changed() => {
                if res.is_err() || *closing.borrow() {
                    break;
                }
            }
            msg = rx.recv() => match msg {
                Some(Message::Add(mut p)) => {
                    if p.deadline.is_none() {
                        p.deadline = Some(Instant::now() + RESP_TIMEOUT);
                    }
                    plist.push(p);
                }
                Some(Message::Reply(r)) => {
                    let matched = dispatch(&mut plist, &r);
                    if matched {
                        cont_timeouts = 0;
                    }
                    let _ = r.matched.send(matched);
                }
                None => break,
            },
            () = &mut timeout, if armed => {
                let now = Instant::now();
                let mut expired = 0;
                let mut i = 0;
                while i < plist.len() {
                    if plist[i].deadline.map_or(false, |d| d <= now) {
                        plist.remove(i).finish(Err(DiscoveryError::Timeout));
                        expired += 1;
                    } else {
                        i += 1;
                    }
                }
                cont_timeouts += expired;

                // Many timeouts in a row with no reply hint at a skewed clock.
                if cont_timeouts > NTP_FAILURE_THRESHOLD {
                    if ntp_warn_time.map_or(true, |t| now.duration_since(t) >= NTP_WARNING_COOLDOWN) {
                        ntp_warn_time = Some(now);
                        tokio::spawn(ntp::check_clock_drift());
                    }
                    cont_timeouts = 0;
                }
            }
        }
    }

    for p in plist.drain(..) {
        p.finish(Err(DiscoveryError::Closed));
    }
    // Late registrations still queued.
    rx.close();
    while let Ok(msg) = rx.try_recv() {
        match msg {
            Message::Add(p) => p.finish(Err(DiscoveryError::Closed)),
            Message::Reply(r) => {
                let _ = r.matched.send(false);
            }
        }
    }
    debug!("Pending reply loop stopped");
}

/// Arm the timer for the nearest deadline. Returns `false` if nothing waits.
///
/// Entries whose deadline lies more than twice the reply window ahead fail
/// with [`DiscoveryError::ClockWarp`].
fn reset_timeout(plist: &mut Vec<Pending>, timeout: std::pin::Pin<&mut time::Sleep>) -> bool {
    let now = Instant::now();
    while !plist.is_empty() {
        let deadline = plist[0].deadline.unwrap_or(now);
        if deadline.saturating_duration_since(now) < 2 * RESP_TIMEOUT {
            timeout.reset(deadline);
            return true;
        }
        let p = plist.remove(0);
        trace!(from = ?p.from, ptype = p.ptype.name(), "Dropping pending reply after clock warp");
        p.finish(Err(DiscoveryError::ClockWarp));
    }
    false
}

/// Feed `r` to every matching entry, completing those whose callback
/// accepts it.
fn dispatch(plist: &mut Vec<Pending>, r: &Reply) -> bool {
    let mut matched = false;
    let mut i = 0;
    while i < plist.len() {
        let p = &mut plist[i];
        if p.from != r.from || p.ptype != r.ptype {
            i += 1;
            continue;
        }
        if let Packet::Neighbors(n) = &r.packet {
            if n.target_type != p.target_type {
                i += 1;
                continue;
            }
        }
        matched = true;
        if (p.callback)(&r.packet) {
            plist.remove(i).finish(Ok(()));
        } else {
            i += 1;
        }
    }
    matched
}

#[cfg(test)]
mod tests;
