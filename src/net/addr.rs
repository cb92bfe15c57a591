//! Textual address detection and binary packing.

use std::net::{Ipv4Addr, Ipv6Addr};

#[derive(thiserror::Error, Debug)]
pub enum AddrError {
    #[error("invalid address: {0:?}")]
    InvalidAddress(String),
}

/// Whether `s` is a textual IPv4 address.
pub fn is_ipv4(s: &str) -> bool {
    s.parse::<Ipv4Addr>().is_ok()
}

/// Validate a textual IPv6 address and return its unbracketed form.
///
/// Accepts full, compressed, IPv4-tailed, and zone-id (`fe80::1%eth0`)
/// notations. With `bracketed`, a leading `[` / trailing `]` pair is
/// stripped before validation. Inputs without any `:` are never IPv6.
pub fn is_ipv6(s: &str, bracketed: bool) -> Option<&str> {
    let inner = if bracketed && s.starts_with('[') {
        s.strip_prefix('[')?.strip_suffix(']')?
    } else {
        s
    };

    if !inner.contains(':') {
        return None;
    }

    let address = match inner.split_once('%') {
        Some((address, zone)) if !zone.is_empty() => address,
        Some(_) => return None,
        None => inner,
    };

    address.parse::<Ipv6Addr>().ok().map(|_| inner)
}

/// Two-byte big-endian encoding.
pub fn be16(n: u16) -> [u8; 2] {
    n.to_be_bytes()
}

/// Network-order binary form of a textual IPv4 address.
pub fn pack_ipv4(s: &str) -> Result<[u8; 4], AddrError> {
    s.parse::<Ipv4Addr>()
        .map(|ip| ip.octets())
        .map_err(|_| AddrError::InvalidAddress(s.to_string()))
}

/// Network-order binary form of a textual IPv6 address, brackets and zone id
/// allowed.
pub fn pack_ipv6(s: &str) -> Result<[u8; 16], AddrError> {
    let inner = is_ipv6(s, true).ok_or_else(|| AddrError::InvalidAddress(s.to_string()))?;
    let address = inner.split_once('%').map(|(a, _)| a).unwrap_or(inner);
    address
        .parse::<Ipv6Addr>()
        .map(|ip| ip.octets())
        .map_err(|_| AddrError::InvalidAddress(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_detection() {
        assert!(is_ipv4("1.2.3.4"));
        assert!(is_ipv4("255.255.255.255"));
        assert!(!is_ipv4("1.2.3"));
        assert!(!is_ipv4("1.2.3.4.5"));
        assert!(!is_ipv4("example.org"));
        assert!(!is_ipv4("::1"));
    }

    #[test]
    fn ipv6_forms() {
        assert_eq!(is_ipv6("::1", false), Some("::1"));
        assert_eq!(
            is_ipv6("2001:db8:0:0:0:0:0:1", false),
            Some("2001:db8:0:0:0:0:0:1")
        );
        assert_eq!(is_ipv6("::ffff:192.0.2.1", false), Some("::ffff:192.0.2.1"));
        assert_eq!(is_ipv6("fe80::1%eth0", false), Some("fe80::1%eth0"));
        assert_eq!(is_ipv6("fe80::1%", false), None);
        assert_eq!(is_ipv6("1.2.3.4", false), None);
        assert_eq!(is_ipv6("not-an-address", false), None);
    }

    #[test]
    fn ipv6_brackets() {
        assert_eq!(is_ipv6("[::1]", true), Some("::1"));
        assert_eq!(is_ipv6("[2001:db8::2]", true), Some("2001:db8::2"));
        // Unbalanced bracket is rejected.
        assert_eq!(is_ipv6("[::1", true), None);
        // Without the flag, brackets fail validation.
        assert_eq!(is_ipv6("[::1]", false), None);
    }

    #[test]
    fn be16_encoding() {
        assert_eq!(be16(0), [0, 0]);
        assert_eq!(be16(443), [0x01, 0xbb]);
        assert_eq!(be16(65535), [0xff, 0xff]);
    }

    #[test]
    fn ipv4_packing_roundtrip() {
        let packed = pack_ipv4("192.0.2.7").unwrap();
        assert_eq!(packed, [192, 0, 2, 7]);
        let text = Ipv4Addr::from(packed).to_string();
        assert!(is_ipv4(&text));
        assert!(pack_ipv4("192.0.2").is_err());
    }

    #[test]
    fn ipv6_packing() {
        let packed = pack_ipv6("2001:db8::1").unwrap();
        assert_eq!(&packed[..4], &[0x20, 0x01, 0x0d, 0xb8]);
        assert_eq!(packed[15], 1);
        assert_eq!(pack_ipv6("[2001:db8::1]").unwrap(), packed);
        assert_eq!(pack_ipv6("fe80::1%eth0").unwrap()[0], 0xfe);
        assert!(pack_ipv6("1.2.3.4").is_err());
    }
}
