//! Deciding per request between h2 and the HTTP/1.x fallback, negotiating at most one session
//! per client session and destination.

use tokio::time::Instant;
use tracing::{debug, info, trace};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use alpn_tunnel::{BoxedIo, Destination, Establish, Establisher, Negotiated};

use crate::cache::NegativeCache;
use crate::config::Config;
use crate::key::{DestKey, SessionKey};
use crate::request::{Fallback, ForwardRequest, ResponseSink};
use crate::session::SessionHandle;
use crate::utils::DurationExt;

/// Observable state of a (client session, destination) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Idle,
    /// Establishment in flight with requests waiting behind it
    Probing { queued: usize },
    Negotiated,
    NegativelyCached,
}

/// Entry point of the h2 upgrade layer
#[derive(Clone)]
pub struct Upgrader {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    establisher: Arc<dyn Establish>,
    generation: AtomicU64,
    state: Mutex<State>,
}

struct State {
    sessions: HashMap<SessionKey, SessionHandle>,
    pending: HashMap<SessionKey, Vec<Deferred>>,
    /// Number of establishments in flight per destination
    probing: HashMap<DestKey, usize>,
    not_h2: NegativeCache,
}

struct Deferred {
    request: ForwardRequest,
    sink: Box<dyn ResponseSink>,
    fallback: Fallback,
}

enum Admission {
    Dispatch(SessionHandle, Deferred),
    Fallback(Deferred),
    Queued(usize),
    Probe,
}

/// Result of one establishment attempt
enum Outcome {
    Multiplexed(h2mux::client::Control, h2mux::client::Connection<BoxedIo>),
    /// Proven not to speak h2; a downgraded socket comes along if there is one
    Refused(Option<BoxedIo>),
    /// Failed in a way that says nothing about h2 support
    Failed,
}

impl Deferred {
    fn fall_back(self, io: Option<BoxedIo>) {
        (self.fallback)(self.request, self.sink, io)
    }
}

impl Upgrader {
    /// Create an upgrader dialing upstreams with the built-in establisher.
    pub fn new(config: Config) -> Self {
        let establisher = Arc::new(Establisher::new(config.connect_timeout));
        Self::with_establisher(config, establisher)
    }

    pub fn with_establisher(config: Config, establisher: Arc<dyn Establish>) -> Self {
        let not_h2 = NegativeCache::new(config.negative_capacity, config.negative_ttl);
        Upgrader {
            inner: Arc::new(Inner {
                config,
                establisher,
                generation: AtomicU64::new(0),
                state: Mutex::new(State {
                    sessions: HashMap::new(),
                    pending: HashMap::new(),
                    probing: HashMap::new(),
                    not_h2,
                }),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Forward `request` over h2 if possible, or hand it to `fallback` otherwise.
    ///
    /// The response of a request sent over h2 goes to `sink`. A request that cannot be served
    /// right away is queued behind the establishment in progress and resolved once it completes,
    /// in which case this returns immediately.
    pub async fn forward(
        &self,
        request: ForwardRequest,
        sink: Box<dyn ResponseSink>,
        fallback: Fallback,
    ) {
        let deferred = Deferred {
            request,
            sink,
            fallback,
        };
        if !self.inner.config.enable_h2 || !deferred.request.use_h2 {
            return deferred.fall_back(None);
        }
        let dest = match deferred.request.destination.clone() {
            Some(dest) => dest,
            None => return deferred.fall_back(None),
        };
        let key = SessionKey::new(deferred.request.session_id, DestKey::derive(&dest));

        match self.inner.admit(&key, deferred) {
            Admission::Dispatch(session, deferred) => {
                session.dispatch(deferred.request, deferred.sink).await
            }
            Admission::Fallback(deferred) => {
                trace!(session = %key, "known not to speak h2, falling back");
                deferred.fall_back(None)
            }
            Admission::Queued(n) => trace!(session = %key, queued = n, "waiting for establishment"),
            Admission::Probe => {
                debug!(session = %key, "establishing h2 session");
                tokio::spawn(probe(self.inner.clone(), key, dest));
            }
        }
    }

    /// Current state of the pair identified by a client session and a destination
    pub fn state(&self, session: u64, dest: &Destination) -> KeyState {
        let key = SessionKey::new(session, DestKey::derive(dest));
        let state = self.inner.acquire_state();
        if state.sessions.get(&key).map_or(false, |s| !s.is_closed()) {
            KeyState::Negotiated
        } else if let Some(queue) = state.pending.get(&key) {
            KeyState::Probing {
                queued: queue.len(),
            }
        } else if state.is_negative(&key.dest, Instant::now()) {
            KeyState::NegativelyCached
        } else {
            KeyState::Idle
        }
    }

    /// Tear down every session opened on behalf of a client session, e.g. once the client
    /// connection is gone.
    pub fn close_client(&self, session: u64) {
        let closing: Vec<SessionHandle> = {
            let mut state = self.inner.acquire_state();
            let keys: Vec<SessionKey> = state
                .sessions
                .keys()
                .filter(|key| key.session == session)
                .cloned()
                .collect();
            keys.iter()
                .filter_map(|key| state.sessions.remove(key))
                .collect()
        };
        for handle in closing {
            handle.teardown();
        }
    }
}

impl Inner {
    fn acquire_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("acquire upgrader state")
    }

    fn admit(&self, key: &SessionKey, deferred: Deferred) -> Admission {
        let mut state = self.acquire_state();
        if let Some(session) = state.sessions.get(key) {
            if !session.is_closed() {
                return Admission::Dispatch(session.clone(), deferred);
            }
            // closed but not unregistered yet
            state.sessions.remove(key);
        }
        if state.is_negative(&key.dest, Instant::now()) {
            return Admission::Fallback(deferred);
        }
        if let Some(queue) = state.pending.get_mut(key) {
            queue.push(deferred);
            return Admission::Queued(queue.len());
        }
        state.pending.insert(key.clone(), vec![deferred]);
        *state.probing.entry(key.dest.clone()).or_default() += 1;
        Admission::Probe
    }

    async fn establish(&self, key: &SessionKey, dest: &Destination) -> Outcome {
        match self.establisher.establish(dest).await {
            Ok(Negotiated::Multiplexed(io)) => match h2mux::client::handshake(io).await {
                Ok((control, connection)) => Outcome::Multiplexed(control, connection),
                Err(error) => {
                    debug!(session = %key, %error, "h2 handshake failed");
                    Outcome::Failed
                }
            },
            Ok(Negotiated::Downgraded(io)) => {
                debug!(session = %key, "upstream did not select h2");
                Outcome::Refused(Some(io))
            }
            Ok(Negotiated::Unsupported) => Outcome::Refused(None),
            Err(error) if error.is_tls() => {
                debug!(session = %key, %error, code = error.code(), "tls failure");
                Outcome::Refused(None)
            }
            Err(error) => {
                debug!(session = %key, %error, code = error.code(), "establishment failed");
                Outcome::Failed
            }
        }
    }

    /// Settle the pending state of `key` with `outcome`, returning the requests queued behind it
    /// and the new session if any.
    fn resolve(
        self: &Arc<Self>,
        key: &SessionKey,
        outcome: Outcome,
    ) -> (Vec<Deferred>, Result<SessionHandle, Option<BoxedIo>>) {
        let mut state = self.acquire_state();
        let queue = state.pending.remove(key).unwrap_or_default();
        state.finish_probe(&key.dest);
        let resolved = match outcome {
            Outcome::Multiplexed(control, connection) => {
                state.not_h2.forget(&key.dest);
                let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                let session = SessionHandle::spawn(
                    key.clone(),
                    generation,
                    control,
                    connection,
                    unregister(Arc::downgrade(self), key.clone(), generation),
                );
                state.sessions.insert(key.clone(), session.clone());
                Ok(session)
            }
            Outcome::Refused(io) => {
                if state.has_session_to(&key.dest) {
                    debug!(session = %key, "destination serves h2 on another session, not caching");
                } else {
                    state.not_h2.mark(key.dest.clone(), Instant::now());
                }
                Err(io)
            }
            Outcome::Failed => Err(None),
        };
        (queue, resolved)
    }
}

impl State {
    /// Whether probing `dest` should be skipped
    ///
    /// A stale entry still counts while another probe for the same destination is in flight.
    fn is_negative(&self, dest: &DestKey, now: Instant) -> bool {
        self.not_h2.peek(dest).is_some()
            && (self.not_h2.is_fresh(dest, now) || self.probing.contains_key(dest))
    }

    fn finish_probe(&mut self, dest: &DestKey) {
        if let Some(n) = self.probing.get_mut(dest) {
            *n -= 1;
            if *n == 0 {
                self.probing.remove(dest);
            }
        }
    }

    fn has_session_to(&self, dest: &DestKey) -> bool {
        self.sessions
            .iter()
            .any(|(key, session)| &key.dest == dest && !session.is_closed())
    }
}

async fn probe(inner: Arc<Inner>, key: SessionKey, dest: Destination) {
    let t = Instant::now();
    let outcome = inner.establish(&key, &dest).await;
    let (queue, resolved) = inner.resolve(&key, outcome);
    match resolved {
        Ok(session) => {
            info!(
                session = %key,
                queued = queue.len(),
                "h2 session established within {}",
                t.elapsed().autofmt()
            );
            for deferred in queue {
                session.dispatch(deferred.request, deferred.sink).await;
            }
        }
        Err(mut io) => {
            debug!(
                session = %key,
                queued = queue.len(),
                socket = io.is_some(),
                "falling back after {}",
                t.elapsed().autofmt()
            );
            for deferred in queue {
                deferred.fall_back(io.take());
            }
        }
    }
}

/// Removal of a closed session from the registry, unless a newer one took its place
fn unregister(
    inner: Weak<Inner>,
    key: SessionKey,
    generation: u64,
) -> impl FnOnce() + Send + 'static {
    move || {
        let inner = match inner.upgrade() {
            Some(inner) => inner,
            None => return,
        };
        let mut state = inner.acquire_state();
        if state
            .sessions
            .get(&key)
            .map_or(false, |s| s.generation() == generation)
        {
            state.sessions.remove(&key);
            trace!(session = %key, generation, "session unregistered");
        } else if state.sessions.contains_key(&key) {
            debug!(session = %key, generation, "stale session closed after replacement");
        }
    }
}
