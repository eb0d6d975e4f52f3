use anyhow::Result;

use crate::namespace::{Namespace, VethEnd};
use crate::test_util::unique_name;

/// Two namespaces ("left" and "right") joined by N addressed veth links.
///
/// The left side plays the server/sender role in tests, the right side the
/// client/receiver role. Impairment is applied to left-side interfaces, which
/// shapes traffic flowing left-to-right.
pub struct TwoHostWorld {
    pub left: Namespace,
    pub right: Namespace,
    /// Left-side IPs, e.g. `["10.44.1.1", "10.44.2.1"]`.
    pub left_ips: Vec<String>,
    /// Right-side IPs, one per link.
    pub right_ips: Vec<String>,
    /// Left-side veth interface names (impairment targets).
    pub left_ifaces: Vec<String>,
    /// Right-side veth interface names.
    pub right_ifaces: Vec<String>,
}

impl TwoHostWorld {
    /// Create a world with `num_links` veth pairs.
    ///
    /// Addresses use `10.44.{i+1}.{1|2}/24` where `i` is the link index.
    pub fn new(test_name: &str, num_links: usize) -> Result<Self> {
        assert!(num_links > 0, "need at least one link");

        let left = Namespace::new(&unique_name(&format!("{test_name}_l")))?;
        let right = Namespace::new(&unique_name(&format!("{test_name}_r")))?;

        let mut world = Self {
            left,
            right,
            left_ips: Vec::with_capacity(num_links),
            right_ips: Vec::with_capacity(num_links),
            left_ifaces: Vec::with_capacity(num_links),
            right_ifaces: Vec::with_capacity(num_links),
        };

        for i in 0..num_links {
            let subnet = i + 1;
            let l_ip = format!("10.44.{subnet}.1");
            let r_ip = format!("10.44.{subnet}.2");
            let l_end = VethEnd::new(unique_name(&format!("wl{i}")), format!("{l_ip}/24"));
            let r_end = VethEnd::new(unique_name(&format!("wr{i}")), format!("{r_ip}/24"));

            world.left.connect(&world.right, &l_end, &r_end)?;

            world.left_ips.push(l_ip);
            world.right_ips.push(r_ip);
            world.left_ifaces.push(l_end.iface);
            world.right_ifaces.push(r_end.iface);
        }

        Ok(world)
    }
}
