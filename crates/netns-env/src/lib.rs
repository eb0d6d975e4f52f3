//! Disposable Linux network-namespace environments for integration tests.
//!
//! Creates isolated virtual networks (namespaces joined by veth pairs) that
//! linkrun's tc/tcpdump/iperf backends can be pointed at without touching the
//! host's real interfaces. Everything is cleaned up on drop.
//!
//! # Modules
//!
//! - [`namespace`]: Namespace and veth link management (RAII cleanup on drop)
//! - [`world`]: Two-host worlds wired with N addressed links
//! - [`test_util`]: Privilege checks and unique name generation for tests

pub mod namespace;
pub mod test_util;
pub mod world;

pub use namespace::{Namespace, VethEnd};
pub use test_util::{check_privileges, unique_name};
pub use world::TwoHostWorld;
