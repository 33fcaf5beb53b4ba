//! Caller authorization for the control socket.
//!
//! The accepted socket's peer credentials stand in for pipe-client
//! impersonation: the peer's uid is resolved to an account, its group
//! memberships are enumerated, and the three-tier allow rule is applied.
//! Lookup failures for individual groups are swallowed per entry.
use std::{ffi::CString, fs, os::unix::net::UnixStream};

use nix::{
    sys::socket::{getsockopt, sockopt::PeerCredentials},
    unistd::{Gid, Group, Uid, User, getgrouplist},
};
use tracing::{debug, info};

use crate::{config::Config, constants, error::BrokerError};

/// Classification of the connection peer.
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    /// Peer uid reported by the kernel.
    pub uid: u32,
    /// Peer pid reported by the kernel.
    pub pid: i32,
    /// Account name, when the uid resolves to one.
    pub username: Option<String>,
    /// Member of an administrators group, or uid 0.
    pub is_admin: bool,
    /// Account is defined in the local user database.
    pub is_local_user: bool,
}

/// Reads and classifies the peer of an accepted control connection.
pub fn inspect_peer(stream: &UnixStream) -> Result<PeerIdentity, BrokerError> {
    let creds = getsockopt(stream, PeerCredentials)?;
    let uid = Uid::from_raw(creds.uid());
    debug!("Checking client access for uid {} (pid {})", creds.uid(), creds.pid());

    let user = User::from_uid(uid).unwrap_or(None);
    let username = user.as_ref().map(|u| u.name.clone());

    let mut is_admin = uid.is_root();
    if let Some(user) = &user {
        for gid in member_groups(user) {
            // A group the database cannot resolve is skipped, not fatal.
            let Ok(Some(group)) = Group::from_gid(gid) else {
                continue;
            };
            if constants::ADMIN_GROUPS.contains(&group.name.as_str()) {
                debug!("Client is a member of the {} group", group.name);
                is_admin = true;
            }
        }
    }

    let is_local_user = username
        .as_deref()
        .is_some_and(|name| has_local_account(name));

    Ok(PeerIdentity {
        uid: creds.uid(),
        pid: creds.pid(),
        username,
        is_admin,
        is_local_user,
    })
}

fn member_groups(user: &User) -> Vec<Gid> {
    let Ok(name) = CString::new(user.name.as_str()) else {
        return Vec::new();
    };
    getgrouplist(&name, user.gid).unwrap_or_default()
}

/// Whether the account is defined in the local user database, as opposed
/// to a directory service. Read failures classify as "not local".
fn has_local_account(name: &str) -> bool {
    fs::read_to_string("/etc/passwd")
        .map(|contents| {
            contents
                .lines()
                .any(|line| line.split(':').next() == Some(name))
        })
        .unwrap_or(false)
}

/// Applies the three-tier allow rule to a classified peer.
pub fn allowed(identity: &PeerIdentity, config: &Config) -> bool {
    if identity.is_admin {
        debug!("Client is an administrator, permission is granted");
        return true;
    }
    if config.execute_by_non_admins() {
        debug!("All users may access the service, permission is granted");
        return true;
    }
    if config.execute_by_local_users() && identity.is_local_user {
        debug!("Client is a local user, permission is granted");
        return true;
    }
    info!(
        "Permission to execute is not given to uid {} ({})",
        identity.uid,
        identity.username.as_deref().unwrap_or("unknown")
    );
    false
}

/// Inspects the peer of `stream` and applies the allow rule.
pub fn authorize(stream: &UnixStream, config: &Config) -> Result<bool, BrokerError> {
    Ok(allowed(&inspect_peer(stream)?, config))
}
