//! The owner of every registry a process needs to dial and listen.
//!
//! # Design Decisions
//! - Separate contexts share nothing: parsers and shared TLS listeners are
//!   per-context, so tests and embedders can run side by side
//! - Parsers are tried in registration order; `with_default_parsers` puts the
//!   built-in protocols in a fixed order

use std::sync::Arc;

use crate::address::{Address, AddressParser, AddressRegistry};
use crate::dtls::{DtlsAddressParser, DtlsProvider};
use crate::error::Result;
use crate::tcp::TcpAddressParser;
use crate::tls::{SharedListenerRegistry, TlsAddressParser};
use crate::transwarp::{TranswarpAddressParser, TranswarpProvider, Variant};
use crate::udp::UdpAddressParser;
use crate::ws::{WsAddressParser, WssAddressParser};

#[derive(Debug, Default)]
pub struct TransportContext {
    parsers: AddressRegistry,
    shared: Arc<SharedListenerRegistry>,
}

impl TransportContext {
    /// A context with no parsers registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// A context with the tcp, tls, udp, ws and wss parsers registered.
    ///
    /// `dtls` and the `transwarp` pair are added by
    /// [`TransportContext::with_dtls_provider`] and
    /// [`TransportContext::with_transwarp_provider`], since they need an engine.
    pub fn with_default_parsers() -> Self {
        let context = Self::new();
        let shared = context.shared.clone();
        context.register_parser(Arc::new(TcpAddressParser));
        context.register_parser(Arc::new(TlsAddressParser::new(shared.clone())));
        context.register_parser(Arc::new(UdpAddressParser));
        context.register_parser(Arc::new(WsAddressParser));
        context.register_parser(Arc::new(WssAddressParser::new(shared)));
        context
    }

    /// Register the `dtls` parser backed by `provider`.
    pub fn with_dtls_provider(self, provider: Arc<dyn DtlsProvider>) -> Self {
        self.register_parser(Arc::new(DtlsAddressParser::new(Some(provider))));
        self
    }

    /// Register the `transwarp` and `transwarptls` parsers backed by `provider`.
    pub fn with_transwarp_provider(self, provider: Arc<dyn TranswarpProvider>) -> Self {
        self.register_parser(Arc::new(TranswarpAddressParser::new(Variant::Plain, Some(provider.clone()))));
        self.register_parser(Arc::new(TranswarpAddressParser::new(Variant::Tls, Some(provider))));
        self
    }

    /// Append a parser; a parser for an already registered protocol type is ignored.
    pub fn register_parser(&self, parser: Arc<dyn AddressParser>) -> bool {
        self.parsers.register(parser)
    }

    pub fn parse_address(&self, input: &str) -> Result<Box<dyn Address>> {
        self.parsers.parse(input)
    }

    pub fn parsers(&self) -> &AddressRegistry {
        &self.parsers
    }

    /// Shared TLS listeners, for parsers that register on them.
    pub fn shared_listeners(&self) -> Arc<SharedListenerRegistry> {
        self.shared.clone()
    }
}
