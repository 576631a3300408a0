//! Peer identity extraction and allow-list enforcement

use crate::error::{Error, Result};
use crate::spiffe_id::SpiffeId;
use crate::svid::spiffe_id_from_der;
use rustls::ServerConnection;
use tracing::{debug, warn};

/// Permitted caller identities, fixed at construction
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AllowList {
    callers: Vec<SpiffeId>,
}

impl AllowList {
    /// Build from already-parsed IDs, keeping order and dropping duplicates
    pub fn new(callers: impl IntoIterator<Item = SpiffeId>) -> Self {
        let mut list: Vec<SpiffeId> = Vec::new();
        for id in callers {
            if !list.contains(&id) {
                list.push(id);
            }
        }
        AllowList { callers: list }
    }

    /// Parse every entry; any invalid entry fails the whole list
    pub fn parse<S: AsRef<str>>(callers: impl IntoIterator<Item = S>) -> Result<Self> {
        let ids = callers
            .into_iter()
            .map(|s| SpiffeId::parse(s.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(ids))
    }

    /// No restriction configured
    pub fn is_empty(&self) -> bool {
        self.callers.is_empty()
    }

    /// Whether `id` is listed
    pub fn contains(&self, id: &SpiffeId) -> bool {
        self.callers.contains(id)
    }

    /// Listed identities, in configuration order
    pub fn callers(&self) -> &[SpiffeId] {
        &self.callers
    }
}

/// Outcome of authorizing one request. Never stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decision {
    /// The peer identity, absent when none was verified
    pub peer_id: Option<SpiffeId>,
    /// Whether the request may proceed
    pub permitted: bool,
}

impl Decision {
    /// Convert a denial into [`Error::Unauthorized`]
    pub fn into_result(self) -> Result<Option<SpiffeId>> {
        if self.permitted {
            Ok(self.peer_id)
        } else {
            Err(Error::Unauthorized {
                peer_id: self.peer_id.map(|id| id.to_string()),
            })
        }
    }
}

/// Read the peer's SPIFFE ID from a completed server-side handshake.
///
/// `None` is the single "no verified peer identity" outcome and covers: no
/// client certificate presented, a certificate that does not parse, and a
/// certificate without a `spiffe://` URI SAN.
pub fn extract_peer_id(conn: &ServerConnection) -> Option<SpiffeId> {
    let Some(leaf) = conn.peer_certificates().and_then(|certs| certs.first()) else {
        debug!("Peer presented no client certificate");
        return None;
    };

    match spiffe_id_from_der(leaf.as_ref()) {
        Ok(Some(id)) => Some(id),
        Ok(None) => {
            debug!("Peer certificate carries no SPIFFE URI SAN");
            None
        }
        Err(e) => {
            debug!(error = %e, "Peer certificate SPIFFE ID unreadable");
            None
        }
    }
}

/// Pure allow-list rule.
///
/// Permits when the list is empty, when the peer is listed, or when no peer
/// identity was verified and `dev_mode` is on.
pub fn authorize(peer_id: Option<&SpiffeId>, allow_list: &AllowList, dev_mode: bool) -> bool {
    if allow_list.is_empty() {
        return true;
    }
    match peer_id {
        Some(id) => allow_list.contains(id),
        None => dev_mode,
    }
}

/// Applies one service's allow-list to inbound requests
#[derive(Clone, Debug, Default)]
pub struct PeerAuthorizer {
    allow_list: AllowList,
    dev_mode: bool,
}

impl PeerAuthorizer {
    /// Create an authorizer
    pub fn new(allow_list: AllowList, dev_mode: bool) -> Self {
        PeerAuthorizer {
            allow_list,
            dev_mode,
        }
    }

    /// The configured allow-list
    pub fn allow_list(&self) -> &AllowList {
        &self.allow_list
    }

    /// Decide and log
    pub fn authorize(&self, peer_id: Option<&SpiffeId>) -> Decision {
        let permitted = authorize(peer_id, &self.allow_list, self.dev_mode);

        if permitted && peer_id.is_none() && !self.allow_list.is_empty() {
            warn!("DEV_MODE: allowing request without a verified peer identity");
        } else if !permitted {
            warn!(
                peer_id = peer_id.map(|id| id.as_str()).unwrap_or("none"),
                "Unauthorized caller rejected"
            );
        }

        Decision {
            peer_id: peer_id.cloned(),
            permitted,
        }
    }
}
