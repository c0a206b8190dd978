//! The authorization decision core. Each pipeline is a pure function over
//! plain inputs; all cluster reads happen in the controller before the
//! decision is made.

pub mod client;
pub mod ratelimit;
pub mod serving;

pub use client::{authorize_node_client, client_pipeline_enabled};
pub use ratelimit::{max_pending_csrs, recently_pending_csrs};
pub use serving::{authorize_node_serving, EgressContext};
