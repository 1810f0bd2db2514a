//! What a node knows about the cluster it is part of.
//!
//! The membership protocol itself is not part of this crate. A node
//! consumes it through [`MembershipProvider`]: the current master, a
//! monotonically versioned member list, and a way to ask for the list
//! to be re-published. [`ClusterView`] is a simple shared
//! implementation used by in-process clusters and tests.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::RwLock;

use serde::Deserialize;
use serde::Serialize;

use crate::execution::JobId;

/// Network address of a cluster member.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A member is identified by its address plus a uuid, so a restarted
/// process on the same address is a different member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemberInfo {
    pub address: Address,
    pub uuid: String,
}

impl MemberInfo {
    pub fn new(address: Address, uuid: impl Into<String>) -> Self {
        Self {
            address,
            uuid: uuid.into(),
        }
    }
}

/// Black-box view of cluster membership.
pub trait MembershipProvider: Send + Sync {
    fn master_address(&self) -> Option<Address>;

    /// Increases every time the member list changes.
    fn member_list_version(&self) -> u64;

    /// Look up a member by address and identity.
    fn member(&self, address: &Address, uuid: &str) -> Option<MemberInfo>;

    /// Current members, master first.
    fn members(&self) -> Vec<MemberInfo>;

    /// Ask the master to send its member list again. Returns
    /// immediately.
    fn trigger_member_list_publish(&self);
}

#[derive(Debug, Default)]
struct ViewState {
    members: Vec<MemberInfo>,
    version: u64,
}

/// Mutable member list shared by the nodes of an in-process cluster.
///
/// The first member is the master.
#[derive(Debug, Default)]
pub struct ClusterView {
    state: RwLock<ViewState>,
    publish_requests: AtomicUsize,
}

impl ClusterView {
    pub fn new(members: Vec<MemberInfo>) -> Self {
        Self {
            state: RwLock::new(ViewState {
                members,
                version: 1,
            }),
            publish_requests: AtomicUsize::new(0),
        }
    }

    pub fn add_member(&self, member: MemberInfo) {
        let mut state = self.state.write().unwrap_or_else(|err| err.into_inner());
        state.members.push(member);
        state.version += 1;
    }

    /// Returns the removed member, if it was present.
    pub fn remove_member(&self, address: &Address) -> Option<MemberInfo> {
        let mut state = self.state.write().unwrap_or_else(|err| err.into_inner());
        let pos = state.members.iter().position(|m| &m.address == address)?;
        let member = state.members.remove(pos);
        state.version += 1;
        Some(member)
    }

    /// Force a version, used to simulate a node lagging behind.
    pub fn set_version(&self, version: u64) {
        self.state
            .write()
            .unwrap_or_else(|err| err.into_inner())
            .version = version;
    }

    /// How many times a re-publish was requested.
    pub fn publish_requests(&self) -> usize {
        self.publish_requests.load(Ordering::SeqCst)
    }
}

impl MembershipProvider for ClusterView {
    fn master_address(&self) -> Option<Address> {
        let state = self.state.read().unwrap_or_else(|err| err.into_inner());
        state.members.first().map(|m| m.address.clone())
    }

    fn member_list_version(&self) -> u64 {
        self.state
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .version
    }

    fn member(&self, address: &Address, uuid: &str) -> Option<MemberInfo> {
        let state = self.state.read().unwrap_or_else(|err| err.into_inner());
        state
            .members
            .iter()
            .find(|m| &m.address == address && m.uuid == uuid)
            .cloned()
    }

    fn members(&self) -> Vec<MemberInfo> {
        self.state
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .members
            .clone()
    }

    fn trigger_member_list_publish(&self) {
        tracing::debug!("Member list re-publish requested");
        self.publish_requests.fetch_add(1, Ordering::SeqCst);
    }
}

/// Job-scoped resources attached at submission time.
///
/// This is what processors of a job use to load code-like artifacts
/// (scripts, models, lookup tables) that are not part of the node.
/// One instance exists per job on a node, shared by all executions
/// of that job.
#[derive(Debug, Default)]
pub struct JobResources {
    pub job_id: JobId,
    attachments: HashMap<String, Vec<u8>>,
}

impl JobResources {
    pub fn new(job_id: JobId, attachments: HashMap<String, Vec<u8>>) -> Self {
        Self {
            job_id,
            attachments,
        }
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.attachments.get(name).map(Vec::as_slice)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.attachments.keys().map(String::as_str)
    }
}

#[test]
fn view_versions_bump_on_change() {
    let a = Address::new("10.0.0.1", 5701);
    let b = Address::new("10.0.0.2", 5701);
    let view = ClusterView::new(vec![
        MemberInfo::new(a.clone(), "a"),
        MemberInfo::new(b.clone(), "b"),
    ]);
    assert_eq!(view.master_address(), Some(a.clone()));
    assert_eq!(view.member_list_version(), 1);
    assert!(view.member(&b, "b").is_some());
    assert!(view.member(&b, "other").is_none());

    view.remove_member(&b);
    assert_eq!(view.member_list_version(), 2);
    assert!(view.member(&b, "b").is_none());

    view.trigger_member_list_publish();
    assert_eq!(view.publish_requests(), 1);
}
