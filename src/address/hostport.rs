//! Canonical `<type>:<host>:<port>` grammar shared by the address parsers.

use crate::error::{Result, TransportError};

/// Split `"<type>:<host-port>"` into host and port.
///
/// IPv6 literals must be bracketed (`tcp:[::1]:443`). The brackets are not
/// part of the returned host.
pub fn parse_address_host_port(input: &str, protocol: &'static str) -> Result<(String, u16)> {
    let host_port = input
        .strip_prefix(protocol)
        .and_then(|rest| rest.strip_prefix(':'))
        .ok_or_else(|| TransportError::parse(protocol, input, format!("does not start with {protocol}:")))?;

    let (host, port) = split_host_port(host_port).map_err(|reason| TransportError::parse(protocol, input, reason))?;
    Ok((host.to_string(), port))
}

/// Split `host:port` / `[v6]:port`.
pub fn split_host_port(host_port: &str) -> std::result::Result<(&str, u16), String> {
    let (host, port) = if let Some(rest) = host_port.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| "missing ']' in address".to_string())?;
        let port = after
            .strip_prefix(':')
            .ok_or_else(|| "missing port in address".to_string())?;
        if host.is_empty() {
            return Err("empty host in brackets".to_string());
        }
        (host, port)
    } else {
        let (host, port) = host_port
            .rsplit_once(':')
            .ok_or_else(|| "missing port in address".to_string())?;
        if host.contains(':') {
            return Err("too many colons in address; bracket IPv6 hosts".to_string());
        }
        (host, port)
    };

    if host.contains('[') || host.contains(']') {
        return Err(format!("unexpected bracket in host '{host}'"));
    }

    Ok((host, parse_port(port)?))
}

fn parse_port(port: &str) -> std::result::Result<u16, String> {
    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("invalid port '{port}'"));
    }
    port.parse::<u16>()
        .map_err(|_| format!("port {port} out of range"))
}

/// Format a host and port, bracketing IPv6 literals.
pub fn host_port_string(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Like [`host_port_string`] but substitutes the wildcard address for an empty host,
/// producing something the socket layer can bind or resolve.
pub fn bindable_address(host: &str, port: u16) -> String {
    if host.is_empty() {
        format!("0.0.0.0:{port}")
    } else {
        host_port_string(host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_supported_forms() {
        let cases = [
            ("tcp:localhost:8080", "localhost", 8080),
            ("tcp:127.0.0.1:8080", "127.0.0.1", 8080),
            ("tcp:[::1]:8080", "::1", 8080),
            ("tcp:[fe80::1]:443", "fe80::1", 443),
            ("tcp::0", "", 0),
            ("tcp:localhost:65535", "localhost", 65535),
        ];
        for (input, host, port) in cases {
            let parsed = parse_address_host_port(input, "tcp").unwrap();
            assert_eq!(parsed, (host.to_string(), port), "{input}");
        }
    }

    #[test]
    fn rejects_malformed_input() {
        let cases = [
            "udp:localhost:8080",
            "tcp:localhost",
            "tcp:localhost:abc",
            "tcp:localhost:99999",
            "tcp:localhost:+80",
            "tcp:localhost:",
            "tcp:::1:80",
            "tcp:[::1:80",
            "tcp:[::1]80",
            "tcplocalhost:80",
            "TCP:localhost:80",
            "",
        ];
        for input in cases {
            assert!(parse_address_host_port(input, "tcp").is_err(), "{input} should fail");
        }
    }

    #[test]
    fn formats_hosts() {
        assert_eq!(host_port_string("localhost", 8080), "localhost:8080");
        assert_eq!(host_port_string("127.0.0.1", 8080), "127.0.0.1:8080");
        assert_eq!(host_port_string("::1", 8080), "[::1]:8080");
        assert_eq!(host_port_string("fe80::1", 443), "[fe80::1]:443");
        assert_eq!(bindable_address("", 9), "0.0.0.0:9");
    }

    #[test]
    fn format_inverts_parse() {
        for (host, port) in [("localhost", 1), ("10.0.0.1", 443), ("::1", 0), ("2001:db8::7", 65535)] {
            let text = format!("tls:{}", host_port_string(host, port));
            let (h, p) = parse_address_host_port(&text, "tls").unwrap();
            assert_eq!(format!("tls:{}", host_port_string(&h, p)), text);
        }
    }
}
