//! Implementation of the hashgraph aBFT consensus algorithm.
//!
//! Every participant grows a local gossip graph of signed events and
//! independently derives the same totally ordered sequence of blocks from
//! it. The [`core::Core`] type is the per-participant facade; [`node::Node`]
//! drives gossip between cores and pushes finalized blocks to the
//! application through [`proxy`].

pub mod block;
pub mod config;
pub mod core;
pub mod error;
pub mod event;
pub mod hash;
pub mod hashgraph;
pub mod identity;
pub mod net;
pub mod node;
pub mod peers;
pub mod proxy;
pub mod rolling;
pub mod store;

pub use crate::config::Config;
pub use crate::core::Core;
pub use crate::error::Error;
pub use crate::identity::{Identity, Participants};
pub use crate::node::Node;
pub use crate::store::InmemStore;
