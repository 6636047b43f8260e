//! ALPN-based handler selection for the shared listener.

use std::collections::HashMap;
use std::sync::Arc;

use rustls::server::ServerConfig;

/// Identifier for clients that offer no ALPN list.
pub const NO_PROTOCOL: &str = "";

/// Pick the handler for a ClientHello.
///
/// `offered` is the client's ALPN list, `None` when the extension is absent.
/// - no list and a single registered identifier: that identifier
/// - no list otherwise: treated as offering [`NO_PROTOCOL`]
/// - else the first offered identifier that is registered, in client order
pub fn select_handler<'a, H>(
    handlers: &'a HashMap<String, H>,
    offered: Option<&[&[u8]]>,
) -> Option<(&'a str, &'a H)> {
    match offered {
        None if handlers.len() == 1 => handlers.iter().next().map(|(p, h)| (p.as_str(), h)),
        None => handlers
            .get_key_value(NO_PROTOCOL)
            .map(|(p, h)| (p.as_str(), h)),
        Some(protocols) => protocols.iter().find_map(|proto| {
            let proto = std::str::from_utf8(proto).ok()?;
            handlers.get_key_value(proto).map(|(p, h)| (p.as_str(), h))
        }),
    }
}

/// Narrow `config` so the server answers with exactly `protocol`.
pub fn config_for_protocol(config: &ServerConfig, protocol: &str) -> Arc<ServerConfig> {
    let mut narrowed = config.clone();
    narrowed.alpn_protocols = if protocol == NO_PROTOCOL {
        Vec::new()
    } else {
        vec![protocol.as_bytes().to_vec()]
    };
    Arc::new(narrowed)
}

/// Outcome of routing one handshake, filled at ClientHello time and read
/// once the handshake completes.
#[derive(Debug)]
pub struct HandshakeSlot<H> {
    selected: Option<(String, H)>,
}

impl<H> HandshakeSlot<H> {
    pub fn new() -> Self {
        Self { selected: None }
    }

    pub fn fill(&mut self, protocol: &str, handler: H) {
        self.selected = Some((protocol.to_string(), handler));
    }

    pub fn take(&mut self) -> Option<(String, H)> {
        self.selected.take()
    }
}

impl<H> Default for HandshakeSlot<H> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(entries: &[(&str, u32)]) -> HashMap<String, u32> {
        entries.iter().map(|(p, h)| (p.to_string(), *h)).collect()
    }

    #[test]
    fn single_handler_is_default_without_alpn() {
        let handlers = table(&[("foo", 1)]);
        assert_eq!(select_handler(&handlers, None), Some(("foo", &1)));
    }

    #[test]
    fn multi_tenant_routing() {
        let handlers = table(&[("foo", 1), ("bar", 2), ("", 2)]);
        assert_eq!(select_handler(&handlers, Some(&[b"foo".as_slice()])), Some(("foo", &1)));
        assert_eq!(select_handler(&handlers, Some(&[b"bar".as_slice()])), Some(("bar", &2)));
        assert_eq!(select_handler(&handlers, None), Some(("", &2)));
        assert_eq!(select_handler(&handlers, Some(&[b"baz".as_slice()])), None);
    }

    #[test]
    fn first_offered_match_wins() {
        let handlers = table(&[("foo", 1), ("bar", 2)]);
        let offered = [b"baz".as_slice(), b"bar".as_slice(), b"foo".as_slice()];
        assert_eq!(select_handler(&handlers, Some(&offered)), Some(("bar", &2)));
    }

    #[test]
    fn no_alpn_without_default_fails() {
        let handlers = table(&[("foo", 1), ("bar", 2)]);
        assert_eq!(select_handler(&handlers, None), None);
        assert_eq!(select_handler(&table(&[]), None), None);
    }

    #[test]
    fn slot_is_taken_once() {
        let mut slot = HandshakeSlot::new();
        slot.fill("foo", 7);
        assert_eq!(slot.take(), Some(("foo".to_string(), 7)));
        assert_eq!(slot.take(), None);
    }
}
