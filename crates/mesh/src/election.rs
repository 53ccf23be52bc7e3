use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use huddle_core::{kind, Control, Message, PeerId};

use crate::config::MeshConfig;
use crate::transport::{ControlReceiver, Transport};

/// Mutable election bookkeeping, guarded by one mutex.
///
/// Every handler runs on the single consumer task and the lock is never
/// held across an await, so lock ordering is trivial.
struct ElectionState {
    in_progress: bool,
    leader_id: Option<PeerId>,
    is_leader: bool,
    last_heartbeat: Instant,
    heartbeat_running: bool,
}

struct Inner {
    transport: Transport,
    election_timeout: Duration,
    election_check: Duration,
    heartbeat_interval: Duration,
    state: Mutex<ElectionState>,
}

/// Bully-algorithm leader election.
///
/// A node starts as a follower with no known leader. When no heartbeat or
/// coordinator claim arrives within `election_timeout`, it solicits every
/// rostered peer ranking above it and self-promotes if none answers in
/// time. The highest-ranked live peer always ends up leader; conflicting
/// claims resolve by last-writer-wins on the next coordinator or heartbeat.
///
/// Two peers holding divergent rosters can briefly both self-promote; the
/// protocol deliberately leaves that window open and lets the following
/// heartbeat exchange converge it.
#[derive(Clone)]
pub struct LeaderElection {
    inner: Arc<Inner>,
}

impl LeaderElection {
    /// Start the control-queue consumer and the heartbeat-timeout monitor.
    pub fn spawn(transport: Transport, control_rx: ControlReceiver, config: &MeshConfig) -> Self {
        let election = LeaderElection {
            inner: Arc::new(Inner {
                transport,
                election_timeout: config.election_timeout,
                election_check: config.election_check,
                heartbeat_interval: config.heartbeat_interval,
                state: Mutex::new(ElectionState {
                    in_progress: false,
                    leader_id: None,
                    is_leader: false,
                    last_heartbeat: Instant::now(),
                    heartbeat_running: false,
                }),
            }),
        };
        tokio::spawn(consume_loop(election.clone(), control_rx));
        tokio::spawn(monitor_loop(election.clone()));
        election
    }

    pub fn leader_id(&self) -> Option<PeerId> {
        self.inner.state.lock().leader_id
    }

    pub fn is_leader(&self) -> bool {
        self.inner.state.lock().is_leader
    }

    pub fn in_progress(&self) -> bool {
        self.inner.state.lock().in_progress
    }

    fn my_id(&self) -> PeerId {
        self.inner.transport.id()
    }

    /// Begin a Bully round. Concurrent triggers collapse into one attempt
    /// via the in-progress flag.
    pub fn initiate_election(&self) {
        let higher: Vec<PeerId> = {
            let mut state = self.inner.state.lock();
            if state.in_progress {
                debug!("election already in progress");
                return;
            }
            state.in_progress = true;
            // This round starts with the leader unresolved; a stale id from
            // a dead leader must not suppress self-promotion.
            state.leader_id = None;

            let my_id = self.my_id();
            let higher: Vec<PeerId> = self
                .inner
                .transport
                .roster()
                .snapshot()
                .into_iter()
                .filter(|peer| peer.id > my_id)
                .map(|peer| peer.id)
                .collect();

            if higher.is_empty() {
                info!("no higher peer known, self-promoting");
                self.declare_leader(&mut state);
                state.in_progress = false;
                return;
            }
            higher
        };

        info!(candidates = higher.len(), "challenging higher peers");
        for peer in &higher {
            self.inner
                .transport
                .send_private(*peer, Message::control(self.my_id(), kind::ELECTION));
        }

        // Self-promote after the answer window unless some higher peer
        // resolved the round in the meantime.
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.inner.election_check).await;
            let mut state = this.inner.state.lock();
            if state.leader_id.is_none() {
                info!("no answer from higher peers, self-promoting");
                this.declare_leader(&mut state);
            }
            state.in_progress = false;
        });
    }

    /// Take leadership: claim the state, notify every rostered peer, start
    /// heartbeating. Call with the state lock held.
    fn declare_leader(&self, state: &mut ElectionState) {
        let my_id = self.my_id();
        state.is_leader = true;
        state.leader_id = Some(my_id);
        info!(id = %my_id, "declaring self leader");
        for peer in self.inner.transport.roster().snapshot() {
            self.inner
                .transport
                .send_private(peer.id, Message::control(my_id, kind::COORDINATOR));
        }
        self.start_heartbeat(state);
    }

    fn start_heartbeat(&self, state: &mut ElectionState) {
        if state.heartbeat_running {
            return;
        }
        state.heartbeat_running = true;
        let this = self.clone();
        tokio::spawn(async move {
            let mut stop = this.inner.transport.stop_signal();
            let mut ticker = tokio::time::interval(this.inner.heartbeat_interval);
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = ticker.tick() => {
                        if !this.inner.state.lock().is_leader {
                            break;
                        }
                        this.inner
                            .transport
                            .send_public(Message::control(this.my_id(), kind::HEARTBEAT));
                    }
                }
            }
            this.inner.state.lock().heartbeat_running = false;
            debug!("heartbeat sender stopped");
        });
    }

    fn on_election(&self, sender: PeerId) {
        debug!(from = %sender, "election challenge received");
        self.inner
            .transport
            .send_private(sender, Message::control(self.my_id(), kind::ANSWER));
        // We outrank the challenger, so we contest the round ourselves.
        self.initiate_election();
    }

    fn on_answer(&self, sender: PeerId) {
        debug!(from = %sender, "higher peer answered, awaiting coordinator");
        // Tentative only; is_leader flips on the coordinator claim.
        self.inner.state.lock().leader_id = Some(sender);
    }

    fn on_coordinator(&self, sender: PeerId) {
        let my_id = self.my_id();
        let mut state = self.inner.state.lock();
        state.leader_id = Some(sender);
        state.is_leader = my_id == sender;
        state.last_heartbeat = Instant::now();
        if state.is_leader {
            info!("confirmed as leader");
            self.start_heartbeat(&mut state);
        } else {
            info!(leader = %sender, "accepting coordinator");
        }
    }

    fn on_heartbeat(&self, sender: PeerId) {
        let mut state = self.inner.state.lock();
        if state.leader_id != Some(sender) {
            // Last writer wins; the claim is not validated against the
            // roster or any election history.
            info!(leader = %sender, "adopting leader from heartbeat");
            state.leader_id = Some(sender);
        }
        state.last_heartbeat = Instant::now();
    }
}

/// Single consumer of the control queue; handlers never run concurrently
/// against the election state.
async fn consume_loop(election: LeaderElection, mut control_rx: ControlReceiver) {
    let mut stop = election.inner.transport.stop_signal();
    loop {
        let control = tokio::select! {
            _ = stop.changed() => break,
            control = control_rx.recv() => match control {
                Some(control) => control,
                None => break,
            },
        };
        match control {
            Control::Election { sender } => election.on_election(sender),
            Control::Answer { sender } => election.on_answer(sender),
            Control::Coordinator { sender } => election.on_coordinator(sender),
            Control::Heartbeat { sender } => election.on_heartbeat(sender),
            Control::App(message) => {
                warn!(kind = %message.kind, "application message on control queue, dropped");
            }
        }
    }
    debug!("control consumer stopped");
}

/// Followers watch for leader silence; a quiet `election_timeout` starts a
/// new round. The leader itself does not monitor.
async fn monitor_loop(election: LeaderElection) {
    let mut stop: watch::Receiver<bool> = election.inner.transport.stop_signal();
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = tokio::time::sleep(election.inner.election_check) => {
                let timed_out = {
                    let state = election.inner.state.lock();
                    !state.is_leader
                        && state.last_heartbeat.elapsed() > election.inner.election_timeout
                };
                if timed_out {
                    info!("leader went quiet, starting election");
                    election.initiate_election();
                }
            }
        }
    }
    debug!("heartbeat monitor stopped");
}
