//! Member identity and port derivation.
//!
//! A member advertises a single base port; the membership, consensus,
//! and lock transports all derive their endpoints from it.

/// A node known to the gossip layer.
///
/// `name` is unique and stable for the process lifetime. Other
/// components treat members as read-only.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Member {
    pub name: String,
    pub addr: String,
    pub port: u16,
}

impl Member {
    pub fn new(name: impl Into<String>, addr: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            port,
        }
    }

    /// Gossip endpoint (base port).
    pub fn gossip_addr(&self) -> String {
        format!("{}:{}", self.addr, self.port)
    }

    /// Raft transport endpoint (base port + 1).
    pub fn consensus_addr(&self) -> String {
        format!("{}:{}", self.addr, self.port + 1)
    }

    /// Raft transport port (base port + 1).
    pub fn consensus_port(&self) -> u16 {
        self.port + 1
    }

    /// Bootstrap lock RPC endpoint (base port + 2).
    pub fn lock_addr(&self) -> String {
        format!("{}:{}", self.addr, self.port + 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_ports() {
        let m = Member::new("n1", "10.0.0.1", 1234);
        assert_eq!(m.gossip_addr(), "10.0.0.1:1234");
        assert_eq!(m.consensus_addr(), "10.0.0.1:1235");
        assert_eq!(m.lock_addr(), "10.0.0.1:1236");
    }
}
