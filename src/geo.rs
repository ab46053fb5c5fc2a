//! Coarse regional classification of collected proxies.
//!
//! This is a known-approximate heuristic, not a geo-IP lookup: a record is
//! kept when its declared country mentions one of a handful of aliases, or,
//! failing that, when its IPv4 address starts with one of the octet groups
//! below. Accuracy is deliberately kept at the level of the list itself.

use std::net::Ipv4Addr;

/// Substrings of a declared country that mark a record as in-region.
pub const COUNTRY_ALIASES: [&str; 7] = ["cn", "china", "chinese", "hong kong", "hk", "taiwan", "tw"];

/// Leading octet groups of regional allocations. Trailing zero groups in the
/// source table are dropped, so `"14"` covers `14.0.0.0/8` and `"1.0.8"`
/// covers `1.0.8.0/24`.
const REGIONAL_PREFIXES: [&[u8]; 49] = [
    &[1, 0, 1], &[1, 0, 2], &[1, 0, 8], &[1, 0, 32],
    &[14], &[27], &[36], &[39],
    &[42], &[49], &[58], &[59],
    &[60], &[61], &[101], &[103],
    &[106], &[110], &[111], &[112],
    &[113], &[114], &[115], &[116],
    &[117], &[118], &[119], &[120],
    &[121], &[122], &[123], &[124],
    &[125], &[171], &[172], &[175],
    &[180], &[182], &[183], &[202],
    &[203], &[210], &[211], &[218],
    &[219], &[220], &[221], &[222],
    &[223],
];

/// Whether a declared country names the region.
pub fn country_matches(country: &str) -> bool {
    let country = country.trim().to_lowercase();
    !country.is_empty() && COUNTRY_ALIASES.iter().any(|alias| country.contains(alias))
}

/// Whether an address falls into one of the regional prefixes.
pub fn ip_matches(ip: &str) -> bool {
    let Ok(addr) = ip.trim().parse::<Ipv4Addr>() else {
        return false;
    };
    let octets = addr.octets();
    REGIONAL_PREFIXES
        .iter()
        .any(|prefix| octets.starts_with(prefix))
}

/// Either tier is enough.
pub fn is_regional(country: &str, ip: &str) -> bool {
    country_matches(country) || ip_matches(ip)
}
