//! In-process membership provider
//!
//! A `LocalNetwork` is a registry of providers keyed by address. Joins merge
//! membership lists directly and `send_reliable` calls the target's message
//! delegate on the caller's task. Used by the test-suite and for embedding
//! several nodes in one process.
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::{Delegates, Member, MembershipProvider, ProviderConfig, ProviderFactory};
use crate::error::{ClusterError, Result};
use crate::transport_error;

const FIRST_SYNTHETIC_PORT: u16 = 40000;

#[derive(Debug)]
struct NetworkInner {
    nodes: RwLock<IndexMap<SocketAddr, Arc<LocalProvider>>>,
    next_port: AtomicU16,
}

impl NetworkInner {
    fn lookup(&self, address: &SocketAddr) -> Option<Arc<LocalProvider>> {
        self.nodes.read().get(address).cloned()
    }
}

#[derive(Clone, Debug)]
pub struct LocalNetwork {
    inner: Arc<NetworkInner>,
}

impl Default for LocalNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                nodes: RwLock::new(IndexMap::new()),
                next_port: AtomicU16::new(FIRST_SYNTHETIC_PORT),
            }),
        }
    }

    /// The provider currently registered at `address`
    pub fn provider(&self, address: SocketAddr) -> Option<Arc<LocalProvider>> {
        self.inner.lookup(&address)
    }

    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.inner.nodes.read().keys().copied().collect()
    }

    fn resolve(&self, mut address: SocketAddr) -> SocketAddr {
        if address.port() != 0 {
            return address;
        }
        let nodes = self.inner.nodes.read();
        loop {
            let port = self.inner.next_port.fetch_add(1, Ordering::Relaxed);
            address.set_port(port);
            if port != 0 && !nodes.contains_key(&address) {
                return address;
            }
        }
    }
}

#[async_trait]
impl ProviderFactory for LocalNetwork {
    async fn create(
        &self,
        config: ProviderConfig,
        delegates: Delegates,
    ) -> Result<Arc<dyn MembershipProvider>> {
        let address = self.resolve(config.bind_address);
        let local = Member::new(config.name.clone(), address);

        let mut members = IndexMap::new();
        members.insert(local.name.clone(), local.clone());
        let provider = Arc::new(LocalProvider {
            local,
            network: Arc::downgrade(&self.inner),
            delegates,
            members: RwLock::new(members),
            health_score: AtomicU32::new(0),
            failing: RwLock::new(HashSet::new()),
            sent: Mutex::new(Vec::new()),
            join_attempts: AtomicUsize::new(0),
            shut_down: AtomicBool::new(false),
        });

        let mut nodes = self.inner.nodes.write();
        if nodes.contains_key(&address) {
            return Err(ClusterError::ProviderInit(format!(
                "address {} is already in use",
                address
            )));
        }
        nodes.insert(address, provider.clone());
        debug!("[Node<{}>] Local provider bound to {}", config.name, address);
        Ok(provider)
    }
}

pub struct LocalProvider {
    local: Member,
    network: Weak<NetworkInner>,
    delegates: Delegates,
    members: RwLock<IndexMap<String, Member>>,
    health_score: AtomicU32,
    failing: RwLock<HashSet<String>>,
    sent: Mutex<Vec<String>>,
    join_attempts: AtomicUsize,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for LocalProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalProvider")
            .field("local", &self.local)
            .field("members", &self.members.read().len())
            .field("shut_down", &self.shut_down.load(Ordering::Relaxed))
            .finish()
    }
}

impl LocalProvider {
    pub fn set_health_score(&self, score: u32) {
        self.health_score.store(score, Ordering::Relaxed);
    }

    /// Make every following `send_reliable` to the member called `name` fail
    pub fn fail_sends_to(&self, name: impl Into<String>) {
        self.failing.write().insert(name.into());
    }

    /// Names of the members a send was attempted to, in order
    pub fn sent_to(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub fn join_attempts(&self) -> usize {
        self.join_attempts.load(Ordering::Relaxed)
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn network(&self) -> Result<Arc<NetworkInner>> {
        self.network
            .upgrade()
            .ok_or_else(|| transport_error!("local network is gone"))
    }

    /// Merge one member into the list. Returns false when its name is taken
    /// by a member at another address.
    fn learn(&self, member: &Member) -> bool {
        let mut members = self.members.write();
        let known = members.get(&member.name).cloned();
        match known {
            None => {
                members.insert(member.name.clone(), member.clone());
                drop(members);
                self.delegates.events.notify_join(member);
                true
            }
            Some(known) if known == *member => true,
            Some(known) if known.address == member.address => {
                members.insert(member.name.clone(), member.clone());
                drop(members);
                self.delegates.events.notify_update(member);
                true
            }
            Some(known) => {
                drop(members);
                warn!(
                    "[Node<{}>] Rejecting {}: name already used by {}",
                    self.local.name, member, known
                );
                self.delegates.conflict.notify_conflict(&known, member);
                false
            }
        }
    }

    fn forget(&self, member: &Member) {
        let removed = {
            let mut members = self.members.write();
            let matches = members
                .get(&member.name)
                .map_or(false, |known| known.address == member.address);
            if matches {
                members.shift_remove(&member.name)
            } else {
                None
            }
        };
        if let Some(removed) = removed {
            self.delegates.events.notify_leave(&removed);
        }
    }
}

#[async_trait]
impl MembershipProvider for LocalProvider {
    async fn join(&self, remotes: &[SocketAddr]) -> Result<usize> {
        self.join_attempts.fetch_add(1, Ordering::Relaxed);
        let network = self.network()?;
        let mut reached = 0;

        for remote in remotes {
            if *remote == self.local.address {
                reached += 1;
                continue;
            }
            let Some(node) = network.lookup(remote).filter(|n| !n.is_shut_down()) else {
                debug!(
                    "[Node<{}>] No local node listening on {}",
                    self.local.name, remote
                );
                continue;
            };
            if !node.learn(&self.local) {
                continue;
            }
            reached += 1;
            node.delegates
                .message
                .merge_remote_state(&self.delegates.message.local_state(true), true);
            self.delegates
                .message
                .merge_remote_state(&node.delegates.message.local_state(true), true);

            let known: HashSet<String> = self.members.read().keys().cloned().collect();
            let theirs: Vec<Member> = node.members.read().values().cloned().collect();
            for member in theirs {
                let indirect = member.address != *remote && !known.contains(&member.name);
                if !self.learn(&member) || !indirect {
                    continue;
                }
                if let Some(peer) = network.lookup(&member.address) {
                    peer.learn(&self.local);
                }
            }
        }

        info!(
            "[Node<{}>] Joined local network: {} of {} remotes reached",
            self.local.name,
            reached,
            remotes.len()
        );
        Ok(reached)
    }

    async fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let Some(network) = self.network.upgrade() else {
            return Ok(());
        };
        network.nodes.write().shift_remove(&self.local.address);

        let members: Vec<Member> = self.members.read().values().cloned().collect();
        for member in members.iter().filter(|m| m.name != self.local.name) {
            if let Some(peer) = network.lookup(&member.address) {
                peer.forget(&self.local);
            }
        }
        debug!("[Node<{}>] Left local network", self.local.name);
        Ok(())
    }

    fn health_score(&self) -> u32 {
        self.health_score.load(Ordering::Relaxed)
    }

    fn members(&self) -> Vec<Member> {
        self.members.read().values().cloned().collect()
    }

    async fn send_reliable(&self, peer: &Member, data: &[u8]) -> Result<()> {
        self.sent.lock().push(peer.name.clone());
        if self.failing.read().contains(&peer.name) {
            return Err(transport_error!("send to {} failed", peer));
        }
        let node = self
            .network()?
            .lookup(&peer.address)
            .filter(|n| !n.is_shut_down())
            .ok_or_else(|| transport_error!("{} is unreachable", peer))?;
        node.delegates.message.notify_msg(data);
        Ok(())
    }

    fn local_address(&self) -> SocketAddr {
        self.local.address
    }
}
