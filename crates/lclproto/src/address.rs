//! Transport endpoint strings: `tcp://host:port`, `ipc://path`, `inproc://name`.

use crate::channel::ChannelError;

pub const SCHEMES: [&str; 3] = ["tcp://", "ipc://", "inproc://"];

/// True if `address` starts with a supported scheme and has something after it.
pub fn has_transport_scheme(address: &str) -> bool {
    SCHEMES
        .iter()
        .any(|scheme| address.len() > scheme.len() && address.starts_with(scheme))
}

/// Shift the endpoint for the `offset`-th parallel worker.
///
/// TCP endpoints move their port up by `offset`. `ipc` and `inproc` names get
/// a `-{offset}` suffix. Offset 0 returns the address unchanged.
pub fn with_port_offset(address: &str, offset: u16) -> Result<String, ChannelError> {
    if !has_transport_scheme(address) {
        return Err(ChannelError::InvalidAddress(address.to_string()));
    }
    if offset == 0 {
        return Ok(address.to_string());
    }

    if let Some(rest) = address.strip_prefix("tcp://") {
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| ChannelError::InvalidAddress(address.to_string()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| ChannelError::InvalidAddress(address.to_string()))?;
        let shifted = port
            .checked_add(offset)
            .ok_or_else(|| ChannelError::InvalidAddress(format!("{} + {}", address, offset)))?;
        Ok(format!("tcp://{}:{}", host, shifted))
    } else {
        Ok(format!("{}-{}", address, offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_check() {
        assert!(has_transport_scheme("tcp://127.0.0.1:5000"));
        assert!(has_transport_scheme("ipc:///tmp/sock"));
        assert!(has_transport_scheme("inproc://frames"));
        assert!(!has_transport_scheme("tcp://"));
        assert!(!has_transport_scheme("http://example.com"));
        assert!(!has_transport_scheme("127.0.0.1:5000"));
    }

    #[test]
    fn test_port_offset() {
        assert_eq!(with_port_offset("tcp://sdfiana:5000", 3).unwrap(), "tcp://sdfiana:5003");
        assert_eq!(with_port_offset("tcp://[::1]:5000", 1).unwrap(), "tcp://[::1]:5001");
        assert_eq!(with_port_offset("tcp://host:5000", 0).unwrap(), "tcp://host:5000");
        assert_eq!(with_port_offset("ipc:///tmp/frames", 2).unwrap(), "ipc:///tmp/frames-2");
    }

    #[test]
    fn test_port_offset_errors() {
        assert!(with_port_offset("tcp://host", 1).is_err());
        assert!(with_port_offset("tcp://host:65535", 1).is_err());
        assert!(with_port_offset("udp://host:1", 1).is_err());
    }
}
