//! TCP membership provider
//!
//! Membership is exchanged with short request/response connections: a
//! joining node sends `Join` to its remotes and merges the member lists they
//! return, then announces itself to the members it only learned indirectly.
//! User messages travel as `User` frames and must be acknowledged. The health
//! score tracks recent exchange failures.
pub mod frames;
pub mod receiver;

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::{Delegates, Member, MembershipProvider, ProviderConfig, ProviderFactory};
use crate::error::Result;
use crate::transport_error;
pub use frames::Frame;
use frames::{read_frame, write_frame};
use receiver::{TcpReceiver, TcpRequest};

pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(1);

/// Upper bound of the health score
pub const MAX_AWARENESS: u32 = 8;

const BROADCAST_LIMIT: usize = 64 * 1024;

/// Health score: +1 per failed exchange, -1 per successful one
#[derive(Debug, Default)]
pub struct Awareness {
    score: AtomicU32,
}

impl Awareness {
    pub fn score(&self) -> u32 {
        self.score.load(Ordering::Relaxed)
    }

    pub fn record_failure(&self) -> u32 {
        self.apply(|s| (s + 1).min(MAX_AWARENESS))
    }

    pub fn record_success(&self) -> u32 {
        self.apply(|s| s.saturating_sub(1))
    }

    fn apply(&self, f: impl Fn(u32) -> u32) -> u32 {
        let previous = self
            .score
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |s| Some(f(s)))
            .unwrap_or_else(|s| s);
        f(previous)
    }
}

#[derive(Clone, Debug)]
pub struct TcpProviderFactory {
    pub exchange_timeout: Duration,
}

impl Default for TcpProviderFactory {
    fn default() -> Self {
        Self {
            exchange_timeout: DEFAULT_EXCHANGE_TIMEOUT,
        }
    }
}

#[async_trait]
impl ProviderFactory for TcpProviderFactory {
    async fn create(
        &self,
        config: ProviderConfig,
        delegates: Delegates,
    ) -> Result<Arc<dyn MembershipProvider>> {
        let (request_tx, request_rx) = mpsc::channel(1024);
        let receiver = TcpReceiver::new(config.bind_address, request_tx).await?;
        let bound = receiver.local_addr;
        let advertised = match config.advertise_address {
            Some(address) if address.port() == 0 => SocketAddr::new(address.ip(), bound.port()),
            Some(address) => address,
            None => bound,
        };
        let local = Member::new(config.name, advertised);

        let mut members = IndexMap::new();
        members.insert(local.name.clone(), local.clone());
        let state = Arc::new(SharedState {
            local,
            bound,
            incarnation: rand::random(),
            delegates,
            members: RwLock::new(members),
            awareness: Awareness::default(),
            exchange_timeout: self.exchange_timeout,
        });

        let dispatcher = tokio::spawn(dispatch_requests(state.clone(), request_rx));
        receiver.start();
        info!(
            "[Node<{}>] TCP membership provider listening on {}, advertising {}",
            state.local.name, bound, state.local.address
        );

        Ok(Arc::new(TcpProvider {
            state,
            receiver,
            dispatcher: Mutex::new(Some(dispatcher)),
            shut_down: AtomicBool::new(false),
        }))
    }
}

/// Everything the dispatch task and the provider methods share
struct SharedState {
    local: Member,
    bound: SocketAddr,
    incarnation: u64,
    delegates: Delegates,
    members: RwLock<IndexMap<String, Member>>,
    awareness: Awareness,
    exchange_timeout: Duration,
}

enum Admission {
    Joined,
    Updated,
    Known,
    Conflict(Member),
}

impl SharedState {
    fn members(&self) -> Vec<Member> {
        self.members.read().values().cloned().collect()
    }

    fn admit(&self, member: &Member) -> Admission {
        let mut members = self.members.write();
        let known = members.get(&member.name).cloned();
        match known {
            None => {
                members.insert(member.name.clone(), member.clone());
                Admission::Joined
            }
            Some(known) if known.address != member.address => Admission::Conflict(known),
            Some(known) if known == *member => Admission::Known,
            Some(_) => {
                members.insert(member.name.clone(), member.clone());
                Admission::Updated
            }
        }
    }

    fn handle(&self, request: Frame, peer_addr: SocketAddr) -> Frame {
        match request {
            Frame::Join {
                mut member,
                incarnation,
                state,
            } => {
                if member.name == self.local.name && incarnation == self.incarnation {
                    return self.join_ack();
                }
                member.address = observed_address(member.address, peer_addr.ip());
                match self.admit(&member) {
                    Admission::Joined => self.delegates.events.notify_join(&member),
                    Admission::Updated | Admission::Known => {
                        self.delegates.events.notify_update(&member)
                    }
                    Admission::Conflict(existing) => {
                        warn!(
                            "[Node<{}>] Rejecting join of {} from {}: name already used by {}",
                            self.local.name, member, peer_addr, existing
                        );
                        self.delegates.conflict.notify_conflict(&existing, &member);
                        return Frame::Error(format!(
                            "member name {} is already used by {}",
                            member.name, existing.address
                        ));
                    }
                }
                self.delegates.message.merge_remote_state(&state, true);
                self.join_ack()
            }
            Frame::User(data) => {
                self.delegates.message.notify_msg(&data);
                Frame::Ack
            }
            Frame::Leave { name, address } => {
                let address = observed_address(address, peer_addr.ip());
                let removed = {
                    let mut members = self.members.write();
                    let matches = name != self.local.name
                        && members
                            .get(&name)
                            .map_or(false, |known| known.address == address);
                    if matches {
                        members.shift_remove(&name)
                    } else {
                        None
                    }
                };
                match removed {
                    Some(member) => {
                        self.delegates.events.notify_leave(&member);
                        Frame::Ack
                    }
                    None => {
                        warn!(
                            "[Node<{}>] Ignoring leave of {} at {} from {}",
                            self.local.name, name, address, peer_addr
                        );
                        Frame::Error(format!("no member {} at {}", name, address))
                    }
                }
            }
            other => Frame::Error(format!("unexpected {} request", other.kind())),
        }
    }

    fn join_ack(&self) -> Frame {
        Frame::JoinAck {
            members: self.members(),
            state: self.delegates.message.local_state(true),
            broadcasts: self.delegates.message.get_broadcasts(0, BROADCAST_LIMIT),
        }
    }

    /// One request/response exchange with `target`, counted in the health score
    async fn exchange(&self, target: SocketAddr, request: &Frame) -> Result<Frame> {
        let data = request.encode()?;
        let result = timeout(self.exchange_timeout, async {
            let mut stream = TcpStream::connect(target)
                .await
                .map_err(|e| transport_error!("Failed to connect to {}: {}", target, e))?;
            write_frame(&mut stream, &data).await?;
            let response = read_frame(&mut stream).await?;
            Frame::decode(&response)
        })
        .await
        .unwrap_or_else(|_| Err(transport_error!("Exchange with {} timed out", target)));

        match &result {
            Ok(_) => {
                self.awareness.record_success();
            }
            Err(e) => {
                let score = self.awareness.record_failure();
                debug!(
                    health_score = score,
                    "[Node<{}>] {} exchange with {} failed: {}",
                    self.local.name,
                    request.kind(),
                    target,
                    e
                );
            }
        }
        result
    }

    /// Merge a `JoinAck` from `remote`; returns members learned through it
    fn merge_join_ack(
        &self,
        remote: SocketAddr,
        members: Vec<Member>,
        state: Vec<u8>,
        broadcasts: Vec<Vec<u8>>,
    ) -> Vec<Member> {
        let mut indirect = Vec::new();
        for mut member in members {
            // the remote admitted us, so its entry under our name is us
            if member.name == self.local.name {
                continue;
            }
            member.address = observed_address(member.address, remote.ip());
            match self.admit(&member) {
                Admission::Joined => {
                    self.delegates.events.notify_join(&member);
                    if member.address != remote {
                        indirect.push(member);
                    }
                }
                Admission::Updated => self.delegates.events.notify_update(&member),
                Admission::Known => {}
                Admission::Conflict(existing) => {
                    self.delegates.conflict.notify_conflict(&existing, &member)
                }
            }
        }
        for broadcast in broadcasts {
            self.delegates.message.notify_msg(&broadcast);
        }
        self.delegates.message.merge_remote_state(&state, true);
        indirect
    }
}

/// A node bound to an unspecified IP is reachable at the IP it was observed from
fn observed_address(address: SocketAddr, observed: IpAddr) -> SocketAddr {
    if address.ip().is_unspecified() {
        SocketAddr::new(observed, address.port())
    } else {
        address
    }
}

async fn dispatch_requests(state: Arc<SharedState>, mut requests: mpsc::Receiver<TcpRequest>) {
    while let Some(request) = requests.recv().await {
        let response = match Frame::decode(&request.data) {
            Ok(frame) => state.handle(frame, request.peer_addr),
            Err(e) => {
                warn!(
                    "[Node<{}>] Undecodable frame from {}: {}",
                    state.local.name, request.peer_addr, e
                );
                Frame::Error(e.to_string())
            }
        };
        match response.encode() {
            Ok(data) => {
                let _ = request.response_tx.send(data);
            }
            Err(e) => error!(
                "[Node<{}>] Could not encode {} response: {}",
                state.local.name,
                response.kind(),
                e
            ),
        }
    }
}

pub struct TcpProvider {
    state: Arc<SharedState>,
    receiver: TcpReceiver,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for TcpProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpProvider")
            .field("local", &self.state.local)
            .field("members", &self.state.members.read().len())
            .field("health_score", &self.state.awareness.score())
            .field("receiver", &self.receiver.get_stats())
            .finish()
    }
}

impl TcpProvider {
    async fn join_one(&self, remote: SocketAddr, request: &Frame) -> Result<()> {
        match self.state.exchange(remote, request).await? {
            Frame::JoinAck {
                members,
                state,
                broadcasts,
            } => {
                let indirect = self
                    .state
                    .merge_join_ack(remote, members, state, broadcasts);
                for member in indirect {
                    // the same Join, so they admit us as well
                    match self.state.exchange(member.address, request).await {
                        Ok(Frame::JoinAck { .. }) => {}
                        Ok(other) => warn!(
                            "[Node<{}>] Unexpected {} reply from {} to join announcement",
                            self.state.local.name,
                            other.kind(),
                            member
                        ),
                        Err(e) => warn!(
                            "[Node<{}>] Could not announce join to {}: {}",
                            self.state.local.name, member, e
                        ),
                    }
                }
                Ok(())
            }
            Frame::Error(msg) => Err(transport_error!("{} rejected join: {}", remote, msg)),
            other => Err(transport_error!(
                "{} answered join with {}",
                remote,
                other.kind()
            )),
        }
    }
}

#[async_trait]
impl MembershipProvider for TcpProvider {
    async fn join(&self, remotes: &[SocketAddr]) -> Result<usize> {
        let request = Frame::Join {
            member: self.state.local.clone(),
            incarnation: self.state.incarnation,
            state: self.state.delegates.message.local_state(true),
        };
        let mut reached = 0;
        let mut last_error = None;

        for remote in remotes {
            if *remote == self.state.local.address || *remote == self.state.bound {
                reached += 1;
                continue;
            }
            match self.join_one(*remote, &request).await {
                Ok(()) => reached += 1,
                Err(e) => {
                    warn!(
                        "[Node<{}>] Failed to join through {}: {}",
                        self.state.local.name, remote, e
                    );
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if reached == 0 => Err(transport_error!(
                "no remote could be reached, last error: {}",
                e
            )),
            _ => {
                info!(
                    "[Node<{}>] Reached {} of {} remotes, {} members known",
                    self.state.local.name,
                    reached,
                    remotes.len(),
                    self.state.members.read().len()
                );
                Ok(reached)
            }
        }
    }

    async fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let request = Frame::Leave {
            name: self.state.local.name.clone(),
            address: self.state.local.address,
        };
        let peers: Vec<Member> = self
            .state
            .members()
            .into_iter()
            .filter(|m| m.name != self.state.local.name)
            .collect();
        for peer in peers {
            if let Err(e) = self.state.exchange(peer.address, &request).await {
                debug!(
                    "[Node<{}>] Leave notification to {} failed: {}",
                    self.state.local.name, peer, e
                );
            }
        }

        self.receiver.stop();
        if let Some(handle) = self.dispatcher.lock().take() {
            handle.abort();
        }
        info!("[Node<{}>] TCP membership provider stopped", self.state.local.name);
        Ok(())
    }

    fn health_score(&self) -> u32 {
        self.state.awareness.score()
    }

    fn members(&self) -> Vec<Member> {
        self.state.members()
    }

    async fn send_reliable(&self, peer: &Member, data: &[u8]) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(transport_error!("provider is shut down"));
        }
        match self
            .state
            .exchange(peer.address, &Frame::User(data.to_vec()))
            .await?
        {
            Frame::Ack => Ok(()),
            Frame::Error(msg) => Err(transport_error!("{} rejected message: {}", peer, msg)),
            other => Err(transport_error!(
                "{} answered message with {}",
                peer,
                other.kind()
            )),
        }
    }

    fn local_address(&self) -> SocketAddr {
        self.state.local.address
    }
}

impl Drop for TcpProvider {
    fn drop(&mut self) {
        if let Some(handle) = self.dispatcher.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::error::ClusterError;
    use crate::provider::{ConflictDelegate, Delegate, EventDelegate};

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<Vec<u8>>>,
        joins: AtomicUsize,
        leaves: AtomicUsize,
        updates: AtomicUsize,
        conflicts: AtomicUsize,
    }

    impl Delegate for Recorder {
        fn notify_msg(&self, msg: &[u8]) {
            self.messages.lock().push(msg.to_vec());
        }
        fn get_broadcasts(&self, _overhead: usize, _limit: usize) -> Vec<Vec<u8>> {
            Vec::new()
        }
        fn node_meta(&self, _limit: usize) -> Vec<u8> {
            Vec::new()
        }
        fn local_state(&self, _join: bool) -> Vec<u8> {
            Vec::new()
        }
        fn merge_remote_state(&self, _state: &[u8], _join: bool) {}
    }

    impl EventDelegate for Recorder {
        fn notify_join(&self, _member: &Member) {
            self.joins.fetch_add(1, Ordering::SeqCst);
        }
        fn notify_leave(&self, _member: &Member) {
            self.leaves.fetch_add(1, Ordering::SeqCst);
        }
        fn notify_update(&self, _member: &Member) {
            self.updates.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl ConflictDelegate for Recorder {
        fn notify_conflict(&self, _existing: &Member, _other: &Member) {
            self.conflicts.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn node(name: &str) -> (Arc<dyn MembershipProvider>, Arc<Recorder>) {
        node_at(name, SocketAddr::from(([127, 0, 0, 1], 0)), None).await
    }

    async fn node_at(
        name: &str,
        bind_address: SocketAddr,
        advertise_address: Option<SocketAddr>,
    ) -> (Arc<dyn MembershipProvider>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let factory = TcpProviderFactory {
            exchange_timeout: Duration::from_millis(500),
        };
        let provider = factory
            .create(
                ProviderConfig {
                    name: name.to_string(),
                    bind_address,
                    advertise_address,
                },
                Delegates::from_shared(recorder.clone()),
            )
            .await
            .unwrap();
        (provider, recorder)
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_awareness_saturates() {
        let awareness = Awareness::default();
        assert_eq!(awareness.record_success(), 0);
        for _ in 0..20 {
            awareness.record_failure();
        }
        assert_eq!(awareness.score(), MAX_AWARENESS);
        assert_eq!(awareness.record_success(), MAX_AWARENESS - 1);
    }

    #[tokio::test]
    async fn test_join_merges_members_both_ways() {
        let (a, rec_a) = node("1").await;
        let (b, rec_b) = node("2").await;
        let (c, rec_c) = node("3").await;

        assert_eq!(a.join(&[a.local_address()]).await.unwrap(), 1);
        assert_eq!(b.join(&[a.local_address()]).await.unwrap(), 1);
        assert_eq!(c.join(&[a.local_address()]).await.unwrap(), 1);

        for provider in [&a, &b, &c] {
            assert_eq!(provider.members().len(), 3);
        }
        assert_eq!(rec_a.joins.load(Ordering::SeqCst), 2);
        assert_eq!(rec_b.joins.load(Ordering::SeqCst), 2);
        assert_eq!(rec_c.joins.load(Ordering::SeqCst), 2);
        assert_eq!(a.health_score(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_remotes_fail_join() {
        let (a, _) = node("1").await;
        let (b, _) = node("2").await;
        let dead = b.local_address();
        b.shutdown().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = a.join(&[dead]).await;
        assert!(matches!(result, Err(ClusterError::Transport(_))));
        assert_eq!(a.health_score(), 1);
    }

    #[tokio::test]
    async fn test_send_reliable_is_acknowledged() {
        let (a, _) = node("1").await;
        let (b, rec_b) = node("2").await;
        b.join(&[a.local_address()]).await.unwrap();

        let target = Member::new("2", b.local_address());
        a.send_reliable(&target, b"payload").await.unwrap();
        assert_eq!(*rec_b.messages.lock(), vec![b"payload".to_vec()]);
    }

    #[tokio::test]
    async fn test_conflicting_name_is_rejected() {
        let (a, rec_a) = node("1").await;
        let (imposter, _) = node("1").await;

        let result = imposter.join(&[a.local_address()]).await;
        assert!(result.is_err());
        assert_eq!(rec_a.conflicts.load(Ordering::SeqCst), 1);
        assert_eq!(a.members().len(), 1);
    }

    #[tokio::test]
    async fn test_rejoin_is_an_update() {
        let (a, rec_a) = node("1").await;
        let (b, _) = node("2").await;
        b.join(&[a.local_address()]).await.unwrap();
        b.join(&[a.local_address()]).await.unwrap();

        assert_eq!(rec_a.joins.load(Ordering::SeqCst), 1);
        assert_eq!(rec_a.updates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_sends_leave() {
        let (a, rec_a) = node("1").await;
        let (b, _) = node("2").await;
        b.join(&[a.local_address()]).await.unwrap();

        b.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
        wait_for(|| rec_a.leaves.load(Ordering::SeqCst) == 1).await;
        assert_eq!(a.members().len(), 1);

        let target = Member::new("2", b.local_address());
        assert!(b.send_reliable(&target, b"x").await.is_err());
    }

    fn member_named(provider: &Arc<dyn MembershipProvider>, name: &str) -> Member {
        provider
            .members()
            .into_iter()
            .find(|m| m.name == name)
            .unwrap()
    }

    #[tokio::test]
    async fn test_unspecified_bind_uses_observed_address() {
        let (a, _) = node("1").await;
        let (b, rec_b) = node_at("2", SocketAddr::from(([0, 0, 0, 0], 0)), None).await;
        let (c, _) = node("3").await;
        b.join(&[a.local_address()]).await.unwrap();
        c.join(&[a.local_address()]).await.unwrap();

        let b_port = b.local_address().port();
        let seen_by_a = member_named(&a, "2");
        assert!(!seen_by_a.address.ip().is_unspecified());
        assert_eq!(seen_by_a.address, SocketAddr::from(([127, 0, 0, 1], b_port)));
        // learned indirectly through a
        assert_eq!(member_named(&c, "2").address, seen_by_a.address);
        assert_eq!(rec_b.conflicts.load(Ordering::SeqCst), 0);
        assert_eq!(b.members().len(), 3);

        a.send_reliable(&seen_by_a, b"hello").await.unwrap();
        assert_eq!(*rec_b.messages.lock(), vec![b"hello".to_vec()]);
    }

    #[tokio::test]
    async fn test_advertise_address_is_announced() {
        let advertise = SocketAddr::from(([127, 0, 0, 1], 0));
        let (a, _) = node("1").await;
        let (b, _) = node_at("2", SocketAddr::from(([0, 0, 0, 0], 0)), Some(advertise)).await;

        let advertised = b.local_address();
        assert_eq!(advertised.ip(), advertise.ip());
        assert_ne!(advertised.port(), 0);

        b.join(&[a.local_address()]).await.unwrap();
        assert_eq!(member_named(&a, "2").address, advertised);
    }

    #[tokio::test]
    async fn test_leave_for_another_address_is_ignored() {
        let (a, rec_a) = node("1").await;
        let (b, _) = node("2").await;
        b.join(&[a.local_address()]).await.unwrap();

        let forged = Frame::Leave {
            name: "2".to_string(),
            address: SocketAddr::from(([127, 0, 0, 1], 1)),
        };
        let mut stream = TcpStream::connect(a.local_address()).await.unwrap();
        write_frame(&mut stream, &forged.encode().unwrap())
            .await
            .unwrap();
        let reply = Frame::decode(&read_frame(&mut stream).await.unwrap()).unwrap();

        assert!(matches!(reply, Frame::Error(_)));
        assert_eq!(a.members().len(), 2);
        assert_eq!(rec_a.leaves.load(Ordering::SeqCst), 0);
    }
}
