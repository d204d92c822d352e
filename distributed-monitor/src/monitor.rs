//! The peer-local state machine, dispatcher, and public API façade.

use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::config::Config;
use crate::error::Result;
use crate::message::{self, Message, Sn, Token};
use crate::state::ProcessState;
use crate::transport::Transport;

struct Inner<D> {
    rn: Vec<Sn>,
    state: ProcessState,
    token: Option<Token>,
    datum: D,
}

/// One peer's handle onto the distributed monitor.
///
/// Construct with [`Monitor::spawn`]; the returned `Arc` is cheap to clone
/// and is what the application thread and the dispatch thread both hold.
pub struct Monitor<D> {
    id: usize,
    n: usize,
    settling_delay: Duration,
    transport: Arc<dyn Transport>,
    inner: Mutex<Inner<D>>,
    cv: Condvar,
    /// Lets a message handler spawn a follow-up call (re-entrant `request_cs`
    /// from the `PULSE` handler) without the caller needing to thread an
    /// `Arc<Self>` through every handler signature.
    self_ref: OnceLock<Weak<Monitor<D>>>,
}

impl<D> Monitor<D>
where
    D: Clone + Serialize + DeserializeOwned + Send + 'static,
{
    /// Validate `config`, install the token on the bootstrap peer, subscribe
    /// to `transport`, and spawn the dispatch thread.
    pub fn spawn(config: Config, transport: Arc<dyn Transport>, datum: D) -> Result<Arc<Self>> {
        config.validate()?;

        let token = (config.peer_id == config.bootstrap_id).then(|| Token::new(config.group_size));

        let monitor = Arc::new(Self {
            id: config.peer_id,
            n: config.group_size,
            settling_delay: config.settling_delay,
            transport: transport.clone(),
            inner: Mutex::new(Inner {
                rn: vec![0; config.group_size],
                state: ProcessState::Idle,
                token,
                datum,
            }),
            cv: Condvar::new(),
            self_ref: OnceLock::new(),
        });
        let _ = monitor.self_ref.set(Arc::downgrade(&monitor));

        let rx = transport.subscribe();
        spawn_dispatch_thread(monitor.clone(), rx);

        Ok(monitor)
    }

    /// Request exclusive entry to the critical section, blocking the calling
    /// thread until it is granted.
    #[tracing::instrument(skip(self), fields(peer = self.id))]
    pub fn request_cs(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            ProcessState::InCs => {
                tracing::debug!("request_cs: already in CS, ignoring");
                return;
            }
            ProcessState::WaitingForCs => {
                tracing::debug!("request_cs: already waiting, ignoring duplicate request");
                return;
            }
            _ => {}
        }

        inner.state = ProcessState::WaitingForCs;

        if inner.token.is_some() {
            tracing::debug!("request_cs: token already held, entering CS directly");
            inner.state = ProcessState::InCs;
            self.cv.notify_all();
            return;
        }

        inner.rn[self.id] += 1;
        let sn = inner.rn[self.id];
        drop(inner);

        tracing::debug!(sn, "request_cs: token absent, broadcasting REQUEST");
        self.send(Message::Request { pid: self.id, sn });

        let mut inner = self.inner.lock().unwrap();
        while inner.state != ProcessState::InCs {
            inner = self.cv.wait(inner).unwrap();
        }
    }

    /// Release the critical section, forwarding the token to the next
    /// outstanding requester if there is one.
    #[tracing::instrument(skip(self), fields(peer = self.id))]
    pub fn leave_cs(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != ProcessState::InCs || inner.token.is_none() {
            tracing::debug!("leave_cs: not holding the CS, ignoring");
            return;
        }
        self.leave_cs_locked(&mut inner);
    }

    /// Release the CS and suspend until woken by a `PULSE`, transparently
    /// re-acquiring the CS before returning.
    #[tracing::instrument(skip(self), fields(peer = self.id))]
    pub fn wait(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != ProcessState::InCs {
            tracing::debug!("wait: not holding the CS, ignoring");
            return;
        }
        self.leave_cs_locked(&mut inner);
        inner.state = ProcessState::InCsWaiting;

        while inner.state != ProcessState::InCs {
            inner = self.cv.wait(inner).unwrap();
        }
    }

    /// Broadcast a `PULSE` targeted at peer `target`.
    pub fn pulse(&self, target: usize) {
        self.send(Message::Pulse {
            pid: self.id,
            recipient: Some(target),
        });
    }

    /// Broadcast a `PULSE` to every peer.
    pub fn pulse_all(&self) {
        self.send(Message::Pulse {
            pid: self.id,
            recipient: None,
        });
    }

    /// The current local copy of the replicated datum.
    pub fn get(&self) -> D {
        self.inner.lock().unwrap().datum.clone()
    }

    /// Update the replicated datum, broadcast it, and wait out the settling
    /// interval before returning.
    pub fn set(&self, data: D) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.datum = data.clone();
        }
        self.send(Message::Set {
            pid: self.id,
            data,
        });
        std::thread::sleep(self.settling_delay);
    }

    /// This peer's id in `[0, N)`.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Shared tail of `leave_cs` and `wait`: grant `LN[id]`, extend `Q` with
    /// any peer whose outstanding request this peer can now see, and
    /// forward the token to the head of `Q` if it is non-empty.
    fn leave_cs_locked(&self, inner: &mut Inner<D>) {
        inner.state = ProcessState::Idle;

        let id = self.id;
        let rn_id = inner.rn[id];
        {
            let token = inner.token.as_mut().expect("leave_cs_locked requires a token");
            token.ln[id] = rn_id;
            for j in 0..self.n {
                if !token.q.contains(&j) && inner.rn[j] == token.ln[j] + 1 {
                    token.q.push(j);
                }
            }
        }

        if inner.token.as_ref().unwrap().q.is_empty() {
            tracing::debug!("leave_cs: no outstanding requesters, retaining token");
            return;
        }

        let mut token = inner.token.take().unwrap();
        let next = token.q.remove(0);
        tracing::debug!(to = next, "leave_cs: forwarding token");
        self.send(Message::Token {
            pid: id,
            recipient: next,
            token,
        });
    }

    fn handle_message(&self, msg: Message<D>) {
        match msg {
            Message::Request { pid, sn } => self.handle_request(pid, sn),
            Message::Token {
                recipient, token, ..
            } => self.handle_token(recipient, token),
            Message::Pulse { recipient, .. } => self.handle_pulse(recipient),
            Message::Set { pid, data } => self.handle_set(pid, data),
        }
    }

    #[tracing::instrument(skip(self), fields(peer = self.id))]
    fn handle_request(&self, pid: usize, sn: Sn) {
        if pid == self.id {
            return;
        }

        let mut inner = self.inner.lock().unwrap();
        if sn > inner.rn[pid] {
            inner.rn[pid] = sn;
        } else if sn < inner.rn[pid] {
            tracing::debug!(from = pid, sn, observed = inner.rn[pid], "stale REQUEST dropped");
        }

        let granted = match &inner.token {
            Some(token) if inner.state != ProcessState::InCs && inner.rn[pid] == token.ln[pid] + 1 => {
                inner.token.take()
            }
            _ => None,
        };
        drop(inner);

        if let Some(token) = granted {
            tracing::debug!(to = pid, "granting token");
            self.send(Message::Token {
                pid: self.id,
                recipient: pid,
                token,
            });
        }
    }

    fn handle_token(&self, recipient: usize, token: Token) {
        if recipient != self.id {
            return;
        }
        tracing::debug!(peer = self.id, "received TOKEN, entering CS");
        let mut inner = self.inner.lock().unwrap();
        inner.token = Some(token);
        inner.state = ProcessState::InCs;
        self.cv.notify_all();
    }

    fn handle_pulse(&self, recipient: Option<usize>) {
        if let Some(r) = recipient {
            if r != self.id {
                return;
            }
        }

        let should_reacquire = {
            let inner = self.inner.lock().unwrap();
            self.cv.notify_all();
            inner.state == ProcessState::InCsWaiting
        };

        if should_reacquire {
            // Handing this off to a worker thread keeps the dispatch thread
            // free to deliver the TOKEN that will unblock request_cs below.
            if let Some(monitor) = self.self_ref.get().and_then(Weak::upgrade) {
                std::thread::spawn(move || monitor.request_cs());
            }
        }
    }

    fn handle_set(&self, pid: usize, data: D) {
        if pid == self.id {
            return;
        }
        tracing::trace!(peer = self.id, from = pid, "applying replicated SET");
        self.inner.lock().unwrap().datum = data;
    }

    fn send(&self, msg: Message<D>) {
        let bytes = message::encode(&msg).unwrap_or_else(|e| {
            tracing::error!(peer = self.id, error = %e, "failed to encode outbound message");
            panic!("message encoding is a core invariant: {e}");
        });
        self.transport.publish(bytes);
    }
}

fn spawn_dispatch_thread<D>(monitor: Arc<Monitor<D>>, mut rx: broadcast::Receiver<Vec<u8>>)
where
    D: Clone + Serialize + DeserializeOwned + Send + 'static,
{
    let peer = monitor.id;
    std::thread::Builder::new()
        .name(format!("dmon-dispatch-{peer}"))
        .spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .expect("failed to build dispatch runtime");

            let span = tracing::info_span!("dispatch", peer);
            let _guard = span.enter();

            rt.block_on(async move {
                loop {
                    match rx.recv().await {
                        Ok(bytes) => match message::decode::<D>(&bytes) {
                            Ok(msg) => monitor.handle_message(msg),
                            Err(e) => {
                                tracing::error!(error = %e, "dropping undecodable message");
                            }
                        },
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "dispatch thread lagged, messages were dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
        })
        .expect("failed to spawn dispatch thread");
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records every published message instead of putting it on a bus, so a
    /// test can decode and inspect exactly what a handler chose to send.
    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl Transport for RecordingTransport {
        fn publish(&self, bytes: Vec<u8>) {
            self.sent.lock().unwrap().push(bytes);
        }

        fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
            broadcast::channel(1).1
        }
    }

    fn monitor_with(
        transport: Arc<RecordingTransport>,
        n: usize,
        rn: Vec<Sn>,
        token: Option<Token>,
    ) -> Monitor<()> {
        Monitor {
            id: 0,
            n,
            settling_delay: Duration::from_millis(0),
            transport,
            inner: Mutex::new(Inner {
                rn,
                state: ProcessState::InCs,
                token,
                datum: (),
            }),
            cv: Condvar::new(),
            self_ref: OnceLock::new(),
        }
    }

    #[test]
    fn stale_request_does_not_regress_rn_or_grant_the_token() {
        let transport = Arc::new(RecordingTransport::default());
        let monitor = monitor_with(transport.clone(), 3, vec![0, 0, 0], Some(Token::new(3)));

        // A fresh REQUEST at sn=5 bumps RN but isn't a grant: LN[1]+1 is 1, not 5.
        monitor.handle_request(1, 5);
        assert_eq!(monitor.inner.lock().unwrap().rn[1], 5);
        assert!(transport.sent.lock().unwrap().is_empty());

        // A stale duplicate at sn=3 must not regress RN nor trigger a grant.
        monitor.handle_request(1, 3);
        assert_eq!(monitor.inner.lock().unwrap().rn[1], 5);
        assert!(transport.sent.lock().unwrap().is_empty());
        assert!(monitor.inner.lock().unwrap().token.is_some());
    }

    #[test]
    fn leave_cs_does_not_duplicate_an_already_queued_waiter() {
        let transport = Arc::new(RecordingTransport::default());
        let mut token = Token::new(3);
        // Peer 2 is already queued (e.g. carried over in a previously
        // received token) and its request is still outstanding.
        token.q.push(2);
        let monitor = monitor_with(transport.clone(), 3, vec![0, 0, 1], Some(token));

        let mut inner = monitor.inner.lock().unwrap();
        monitor.leave_cs_locked(&mut inner);
        drop(inner);

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1, "exactly one TOKEN forwarded, no duplicate send");
        let msg: Message<()> = message::decode(&sent[0]).unwrap();
        match msg {
            Message::Token { recipient, token, .. } => {
                assert_eq!(recipient, 2);
                // If the dedup guard were missing, peer 2 would have been
                // pushed a second time before being popped off as the head,
                // leaving it behind again in the forwarded queue.
                assert!(!token.q.contains(&2));
            }
            other => panic!("expected a Token message, got {other:?}"),
        }
    }
}
