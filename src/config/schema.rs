//! Configuration schema definitions.
//!
//! `Configuration` is an untyped nested document keyed by protocol name.
//! The typed option structs below are views over a single namespace; each
//! derives Serde traits so a namespace table deserializes straight into it.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::validation::{validate_dtls, validate_tls, validate_ws};
use crate::config::ConfigError;

/// Default socket buffer size for DTLS (4 MiB).
pub const DEFAULT_DTLS_BUFFER_SIZE: u64 = 4 * 1024 * 1024;

/// Untyped transport configuration, namespaced by protocol.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Configuration(toml::Table);

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_table(table: toml::Table) -> Self {
        Self(table)
    }

    /// Look up the subtree for a protocol.
    ///
    /// A missing namespace is `Ok(None)`; a namespace that is not a table is an error.
    pub fn namespace<'a>(&'a self, name: &'a str) -> Result<Option<Namespace<'a>>, ConfigError> {
        match self.0.get(name) {
            None => Ok(None),
            Some(toml::Value::Table(table)) => Ok(Some(Namespace { name, table })),
            Some(other) => Err(ConfigError::InvalidValue {
                namespace: name.to_string(),
                key: name.to_string(),
                reason: format!("expected a table, found {}", other.type_str()),
            }),
        }
    }

    /// Set `key` inside `namespace`, creating the namespace if needed.
    pub fn set(&mut self, namespace: &str, key: &str, value: impl Into<toml::Value>) {
        let entry = self
            .0
            .entry(namespace.to_string())
            .or_insert_with(|| toml::Value::Table(toml::Table::new()));
        if !entry.is_table() {
            *entry = toml::Value::Table(toml::Table::new());
        }
        if let toml::Value::Table(table) = entry {
            table.insert(key.to_string(), value.into());
        }
    }

    pub fn get_u64(&self, namespace: &str, key: &str) -> Result<Option<u64>, ConfigError> {
        match self.namespace(namespace)? {
            Some(ns) => ns.get_u64(key),
            None => Ok(None),
        }
    }

    pub fn get_i64(&self, namespace: &str, key: &str) -> Result<Option<i64>, ConfigError> {
        match self.namespace(namespace)? {
            Some(ns) => ns.get_i64(key),
            None => Ok(None),
        }
    }

    /// Deserialize one namespace into a typed view, falling back to defaults.
    fn view<T>(&self, namespace: &str) -> Result<T, ConfigError>
    where
        T: for<'de> Deserialize<'de> + Default,
    {
        match self.namespace(namespace)? {
            Some(ns) => Ok(toml::Value::Table(ns.table.clone()).try_into()?),
            None => Ok(T::default()),
        }
    }
}

impl From<toml::Table> for Configuration {
    fn from(table: toml::Table) -> Self {
        Self(table)
    }
}

/// Borrowed view of one protocol's configuration subtree.
#[derive(Debug, Clone, Copy)]
pub struct Namespace<'a> {
    name: &'a str,
    table: &'a toml::Table,
}

impl<'a> Namespace<'a> {
    pub fn name(&self) -> &str {
        self.name
    }

    pub fn contains(&self, key: &str) -> bool {
        self.table.contains_key(key)
    }

    /// The raw subtree, for engines that read their own settings.
    pub fn to_table(&self) -> toml::Table {
        self.table.clone()
    }

    pub fn get_i64(&self, key: &str) -> Result<Option<i64>, ConfigError> {
        match self.table.get(key) {
            None => Ok(None),
            Some(toml::Value::Integer(i)) => Ok(Some(*i)),
            Some(other) => Err(self.invalid(key, format!("expected an integer, found {}", other.type_str()))),
        }
    }

    pub fn get_u64(&self, key: &str) -> Result<Option<u64>, ConfigError> {
        match self.get_i64(key)? {
            None => Ok(None),
            Some(i) => u64::try_from(i)
                .map(Some)
                .map_err(|_| self.invalid(key, format!("expected a non-negative integer, found {i}"))),
        }
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        match self.table.get(key) {
            None => Ok(None),
            Some(toml::Value::Boolean(b)) => Ok(Some(*b)),
            Some(other) => Err(self.invalid(key, format!("expected a boolean, found {}", other.type_str()))),
        }
    }

    pub fn get_str(&self, key: &str) -> Result<Option<&'a str>, ConfigError> {
        match self.table.get(key) {
            None => Ok(None),
            Some(toml::Value::String(s)) => Ok(Some(s.as_str())),
            Some(other) => Err(self.invalid(key, format!("expected a string, found {}", other.type_str()))),
        }
    }

    pub fn get_str_list(&self, key: &str) -> Result<Option<Vec<String>>, ConfigError> {
        match self.table.get(key) {
            None => Ok(None),
            Some(toml::Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    toml::Value::String(s) => Ok(s.clone()),
                    other => Err(self.invalid(key, format!("expected strings, found {}", other.type_str()))),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Some),
            Some(other) => Err(self.invalid(key, format!("expected an array, found {}", other.type_str()))),
        }
    }

    fn invalid(&self, key: &str, reason: String) -> ConfigError {
        ConfigError::InvalidValue {
            namespace: self.name.to_string(),
            key: key.to_string(),
            reason,
        }
    }
}

/// Options read from the `tls` namespace.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct TlsOptions {
    /// ALPN identifiers this listener claims on the shared socket.
    pub protocols: Vec<String>,

    /// Server-side handshake timeout in seconds.
    #[serde(rename = "handshakeTimeout")]
    pub handshake_timeout_secs: u64,

    /// Optional proxy used by dialers.
    pub proxy: Option<ProxyConfig>,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            protocols: Vec::new(),
            handshake_timeout_secs: 5,
            proxy: None,
        }
    }
}

impl TlsOptions {
    pub fn load(config: &Configuration) -> Result<Self, ConfigError> {
        let options: Self = config.view("tls")?;
        validate_tls(&options).map_err(ConfigError::Validation)?;
        Ok(options)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// Proxy kinds understood by the TLS dialer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyType {
    None,
    HttpConnect,
}

/// Proxy settings from `tls.proxy`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ProxyConfig {
    /// Proxy kind ("none" or "http").
    #[serde(rename = "type")]
    pub kind: String,

    /// Proxy address as `host:port`.
    #[serde(default)]
    pub address: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

impl ProxyConfig {
    pub fn http_connect(address: impl Into<String>) -> Self {
        Self {
            kind: "http".to_string(),
            address: address.into(),
            username: None,
            password: None,
        }
    }

    pub fn proxy_type(&self) -> Result<ProxyType, ConfigError> {
        match self.kind.as_str() {
            "" | "none" => Ok(ProxyType::None),
            "http" | "http-connect" => Ok(ProxyType::HttpConnect),
            other => Err(ConfigError::UnsupportedProxyType(other.to_string())),
        }
    }

    /// Credentials for `Proxy-Authorization`, if a username was configured.
    pub fn auth(&self) -> Option<(&str, &str)> {
        self.username
            .as_deref()
            .map(|user| (user, self.password.as_deref().unwrap_or("")))
    }
}

/// Options read from the `dtls` namespace.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct DtlsOptions {
    /// Socket write buffer size in bytes.
    pub write_buffer_size: u64,

    /// Socket read buffer size in bytes.
    pub read_buffer_size: u64,

    /// Enables the write shaper when present.
    pub max_bytes_per_second: Option<u64>,

    /// Handshake timeout in seconds.
    #[serde(rename = "handshakeTimeout")]
    pub handshake_timeout_secs: u64,
}

impl Default for DtlsOptions {
    fn default() -> Self {
        Self {
            write_buffer_size: DEFAULT_DTLS_BUFFER_SIZE,
            read_buffer_size: DEFAULT_DTLS_BUFFER_SIZE,
            max_bytes_per_second: None,
            handshake_timeout_secs: 30,
        }
    }
}

impl DtlsOptions {
    pub fn load(config: &Configuration) -> Result<Self, ConfigError> {
        let options: Self = config.view("dtls")?;
        validate_dtls(&options).map_err(ConfigError::Validation)?;
        Ok(options)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// Options read from the `ws` / `wss` namespaces. Timeouts are in seconds;
/// zero disables `writeTimeout`, `readTimeout`, `pongTimeout` and `pingInterval`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct WsOptions {
    /// Limit on writing the upgrade response, then on each stalled write.
    pub write_timeout: u64,
    /// Limit on reading the upgrade request.
    pub read_timeout: u64,
    /// A peer silent for this long is dropped.
    pub pong_timeout: u64,
    pub ping_interval: u64,
    pub handshake_timeout: u64,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,

    /// Request path accepted for the upgrade.
    pub path: String,

    /// ALPN identifiers claimed on the shared TLS socket.
    pub protocols: Vec<String>,
}

impl Default for WsOptions {
    fn default() -> Self {
        Self {
            write_timeout: 10,
            read_timeout: 5,
            pong_timeout: 60,
            ping_interval: 54,
            handshake_timeout: 10,
            read_buffer_size: 4096,
            write_buffer_size: 4096,
            path: "/wss".to_string(),
            protocols: vec!["http/1.1".to_string()],
        }
    }
}

impl WsOptions {
    pub fn load(config: &Configuration, namespace: &str) -> Result<Self, ConfigError> {
        let options: Self = config.view(namespace)?;
        validate_ws(&options).map_err(ConfigError::Validation)?;
        Ok(options)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Configuration {
        Configuration::from_table(text.parse::<toml::Table>().unwrap())
    }

    #[test]
    fn namespaces_are_independent() {
        let config = parse(
            r#"
            [dtls]
            writeBufferSize = 1024
            maxBytesPerSecond = 2048

            [wss]
            path = "/edge"
            unknownKey = "ignored"
            "#,
        );

        let dtls = DtlsOptions::load(&config).unwrap();
        assert_eq!(dtls.write_buffer_size, 1024);
        assert_eq!(dtls.read_buffer_size, DEFAULT_DTLS_BUFFER_SIZE);
        assert_eq!(dtls.max_bytes_per_second, Some(2048));

        let wss = WsOptions::load(&config, "wss").unwrap();
        assert_eq!(wss.path, "/edge");
        assert_eq!(wss.ping_interval(), Duration::from_secs(54));
        assert_eq!(wss.pong_timeout(), Duration::from_secs(60));

        let tls = TlsOptions::load(&config).unwrap();
        assert_eq!(tls, TlsOptions::default());
    }

    #[test]
    fn wrong_type_is_reported() {
        let config = parse("[dtls]\nwriteBufferSize = \"big\"\n");
        assert!(DtlsOptions::load(&config).is_err());
        assert!(config.get_u64("dtls", "writeBufferSize").is_err());
        // Other namespaces are unaffected by the broken dtls subtree.
        assert!(TlsOptions::load(&config).is_ok());
    }

    #[test]
    fn non_table_namespace_is_rejected() {
        let config = parse("dtls = 5\n");
        assert!(config.namespace("dtls").is_err());
        assert!(config.namespace("tls").unwrap().is_none());
    }

    #[test]
    fn set_creates_namespace() {
        let mut config = Configuration::new();
        config.set("dtls", "maxBytesPerSecond", 100_i64);
        assert_eq!(config.get_i64("dtls", "maxBytesPerSecond").unwrap(), Some(100));
        assert_eq!(config.get_u64("udp", "anything").unwrap(), None);
    }

    #[test]
    fn negative_integer_is_not_u64() {
        let config = parse("[dtls]\nreadBufferSize = -1\n");
        assert!(config.get_u64("dtls", "readBufferSize").is_err());
    }

    #[test]
    fn proxy_types() {
        let config = parse(
            r#"
            [tls.proxy]
            type = "http"
            address = "proxy.local:3128"
            username = "user"
            "#,
        );
        let tls = TlsOptions::load(&config).unwrap();
        let proxy = tls.proxy.unwrap();
        assert_eq!(proxy.proxy_type().unwrap(), ProxyType::HttpConnect);
        assert_eq!(proxy.auth(), Some(("user", "")));

        let socks = ProxyConfig {
            kind: "socks5".into(),
            address: "p:1".into(),
            username: None,
            password: None,
        };
        assert!(matches!(
            socks.proxy_type(),
            Err(ConfigError::UnsupportedProxyType(kind)) if kind == "socks5"
        ));
    }
}
