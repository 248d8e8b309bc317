//! MAC address helpers. Each hypervisor and lease file spells MACs its
//! own way; everything is converted to lowercase colon-separated
//! two-digit octets internally.

use minikit_core::{Error, Result};
use rand::RngCore;

fn invalid(mac: &str) -> Error {
    Error::InvalidConfig(format!("invalid MAC address '{mac}'"))
}

/// A random locally administered unicast address.
pub fn generate() -> String {
    let mut octets = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut octets);
    octets[0] = (octets[0] | 0x02) & 0xfe;
    format_octets(&octets)
}

fn format_octets(octets: &[u8; 6]) -> String {
    octets
        .iter()
        .map(|o| format!("{o:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Parses `:`/`-` separated octets (leading zeros optional) or twelve
/// bare hex digits.
pub fn parse(mac: &str) -> Result<[u8; 6]> {
    let mac = mac.trim();
    let mut octets = [0u8; 6];
    if !mac.contains([':', '-']) {
        if mac.len() != 12 || !mac.is_ascii() {
            return Err(invalid(mac));
        }
        for (i, octet) in octets.iter_mut().enumerate() {
            *octet = u8::from_str_radix(&mac[i * 2..i * 2 + 2], 16).map_err(|_| invalid(mac))?;
        }
        return Ok(octets);
    }
    let parts: Vec<&str> = mac.split([':', '-']).collect();
    if parts.len() != 6 {
        return Err(invalid(mac));
    }
    for (octet, part) in octets.iter_mut().zip(parts) {
        if part.is_empty() || part.len() > 2 {
            return Err(invalid(mac));
        }
        *octet = u8::from_str_radix(part, 16).map_err(|_| invalid(mac))?;
    }
    Ok(octets)
}

/// `aa:0b:cc:dd:ee:ff`
pub fn canonical(mac: &str) -> Result<String> {
    parse(mac).map(|octets| format_octets(&octets))
}

/// `aa:b:cc:dd:ee:ff`, as macOS bootpd records it.
pub fn trimmed(mac: &str) -> Result<String> {
    Ok(parse(mac)?
        .iter()
        .map(|o| format!("{o:x}"))
        .collect::<Vec<_>>()
        .join(":"))
}

/// `aa0bccddeeff`, as Parallels records it.
pub fn compact(mac: &str) -> Result<String> {
    Ok(parse(mac)?.iter().map(|o| format!("{o:02x}")).collect())
}

/// `AA-0B-CC-DD-EE-FF`, as Hyper-V expects for static addresses.
pub fn dashed_upper(mac: &str) -> Result<String> {
    Ok(parse(mac)?
        .iter()
        .map(|o| format!("{o:02X}"))
        .collect::<Vec<_>>()
        .join("-"))
}
