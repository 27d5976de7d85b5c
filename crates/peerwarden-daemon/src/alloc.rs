// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use peerwarden_types::ClientRecord;
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::wg::WgDump;

fn record_address(record: &ClientRecord) -> Option<Ipv4Addr> {
    record
        .user_data
        .ip
        .as_deref()
        .and_then(|ip| ip.split('/').next())
        .and_then(|ip| ip.trim().parse().ok())
}

/// Addresses seen live plus addresses recorded in the registry, so a peer the
/// engine has not picked up yet still counts as taken.
pub fn used_addresses(dump: &WgDump, records: &[ClientRecord]) -> HashSet<Ipv4Addr> {
    dump.peers
        .iter()
        .filter_map(|p| p.address())
        .chain(records.iter().filter_map(record_address))
        .collect()
}

/// Lowest host address of `subnet` not in `used`, never the network address
/// or the first host (the engine's own).
pub fn first_free_address(subnet: Ipv4Network, used: &HashSet<Ipv4Addr>) -> Result<Ipv4Addr> {
    let base = u32::from(subnet.network());
    let size = 1u64 << (32 - u32::from(subnet.prefix()));

    // Offsets 0 (network) and 1 (engine) are reserved, the last is broadcast.
    let mut candidate = 2u64;
    while candidate + 1 < size {
        let addr = Ipv4Addr::from(base + candidate as u32);
        if !used.contains(&addr) {
            debug!(subnet = %subnet, address = %addr, "allocated address");
            return Ok(addr);
        }
        candidate += 1;
    }

    Err(CoreError::Capacity {
        subnet: subnet.to_string(),
    })
}
