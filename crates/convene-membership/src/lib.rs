//! Convene gossip membership.
//!
//! Maintains an eventually-consistent view of live nodes and delivers
//! typed join events over a channel to the orchestrator.
//!
//! - **`member`** — member identity and derived transport endpoints
//! - **`gossip`** — UDP announce/merge protocol and the join loop

pub mod gossip;
pub mod member;

pub use gossip::{Gossip, JoinEvent, MembershipError};
pub use member::Member;
