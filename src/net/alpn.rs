//! ALPN augmentation for pure-RPC negotiation.
//!
//! Every TLS config handed out by [`AlpnNegotiator`] prefers
//! `[pure-rpc token, "h2", ...original]`, deduplicated. Inputs are never
//! mutated; a clone is returned.

use std::fmt;
use std::sync::Arc;

use rustls::server::ClientHello;
use rustls::{ClientConfig, ServerConfig};

/// Default protocol id for unmultiplexed RPC over TLS.
pub const DEFAULT_PURE_GRPC_TOKEN: &str = "pure-grpc";

/// Standard HTTP/2 protocol id.
pub const H2: &[u8] = b"h2";

/// Standard HTTP/1.1 protocol id.
pub const HTTP11: &[u8] = b"http/1.1";

/// Applies the pure-RPC protocol preference to TLS configurations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlpnNegotiator {
    token: Vec<u8>,
}

impl AlpnNegotiator {
    pub fn new(token: impl Into<Vec<u8>>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn token(&self) -> &[u8] {
        &self.token
    }

    /// `[token, h2, ...existing]` with later duplicates dropped.
    pub fn protocols(&self, existing: &[Vec<u8>]) -> Vec<Vec<u8>> {
        let mut out: Vec<Vec<u8>> = Vec::with_capacity(existing.len() + 2);
        let candidates = [self.token.as_slice(), H2]
            .into_iter()
            .chain(existing.iter().map(Vec::as_slice));
        for proto in candidates {
            if !out.iter().any(|p| p == proto) {
                out.push(proto.to_vec());
            }
        }
        out
    }

    pub fn client_config(&self, config: &ClientConfig) -> ClientConfig {
        let mut augmented = config.clone();
        augmented.alpn_protocols = self.protocols(&config.alpn_protocols);
        augmented
    }

    pub fn server_config(&self, config: &ServerConfig) -> ServerConfig {
        let mut augmented = config.clone();
        augmented.alpn_protocols = self.protocols(&config.alpn_protocols);
        augmented
    }

    /// Augment the base config and wrap any per-client selector so that the
    /// configs it picks are augmented too.
    pub fn server_settings(&self, settings: &ServerTlsSettings) -> ServerTlsSettings {
        ServerTlsSettings {
            config: Arc::new(self.server_config(&settings.config)),
            per_client: settings.per_client.as_ref().map(|inner| {
                Arc::new(AugmentingSelector {
                    inner: Arc::clone(inner),
                    negotiator: self.clone(),
                }) as Arc<dyn ConfigSelector>
            }),
        }
    }
}

impl Default for AlpnNegotiator {
    fn default() -> Self {
        Self::new(DEFAULT_PURE_GRPC_TOKEN)
    }
}

/// The parts of a TLS ClientHello a selector may inspect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientHelloInfo {
    pub server_name: Option<String>,
    pub alpn: Vec<Vec<u8>>,
}

impl ClientHelloInfo {
    pub fn from_rustls(hello: &ClientHello<'_>) -> Self {
        Self {
            server_name: hello.server_name().map(str::to_owned),
            alpn: hello
                .alpn()
                .map(|protos| protos.map(<[u8]>::to_vec).collect())
                .unwrap_or_default(),
        }
    }
}

/// Picks a server config per client hello. `None` keeps the base config.
pub trait ConfigSelector: Send + Sync {
    fn select(&self, hello: &ClientHelloInfo) -> Option<Arc<ServerConfig>>;
}

impl<F> ConfigSelector for F
where
    F: Fn(&ClientHelloInfo) -> Option<Arc<ServerConfig>> + Send + Sync,
{
    fn select(&self, hello: &ClientHelloInfo) -> Option<Arc<ServerConfig>> {
        self(hello)
    }
}

struct AugmentingSelector {
    inner: Arc<dyn ConfigSelector>,
    negotiator: AlpnNegotiator,
}

impl ConfigSelector for AugmentingSelector {
    fn select(&self, hello: &ClientHelloInfo) -> Option<Arc<ServerConfig>> {
        self.inner
            .select(hello)
            .map(|config| Arc::new(self.negotiator.server_config(&config)))
    }
}

/// Server TLS configuration plus an optional per-client selector.
#[derive(Clone)]
pub struct ServerTlsSettings {
    pub config: Arc<ServerConfig>,
    pub per_client: Option<Arc<dyn ConfigSelector>>,
}

impl ServerTlsSettings {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self {
            config,
            per_client: None,
        }
    }

    pub fn with_selector(mut self, selector: Arc<dyn ConfigSelector>) -> Self {
        self.per_client = Some(selector);
        self
    }

    /// The config to complete a handshake with.
    pub fn config_for(&self, hello: &ClientHelloInfo) -> Arc<ServerConfig> {
        self.per_client
            .as_ref()
            .and_then(|selector| selector.select(hello))
            .unwrap_or_else(|| Arc::clone(&self.config))
    }
}

impl fmt::Debug for ServerTlsSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerTlsSettings")
            .field("alpn_protocols", &self.config.alpn_protocols)
            .field("per_client", &self.per_client.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::tls::crypto_provider;
    use rustls::server::ResolvesServerCert;
    use rustls::sign::CertifiedKey;
    use rustls::RootCertStore;

    #[derive(Debug)]
    struct NoCertificate;

    impl ResolvesServerCert for NoCertificate {
        fn resolve(&self, _hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
            None
        }
    }

    fn client_config(alpn: &[&[u8]]) -> ClientConfig {
        let mut config = ClientConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(RootCertStore::empty())
            .with_no_client_auth();
        config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
        config
    }

    fn server_config(alpn: &[&[u8]]) -> ServerConfig {
        let mut config = ServerConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(NoCertificate));
        config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
        config
    }

    #[test]
    fn prepends_token_and_h2() {
        let negotiator = AlpnNegotiator::new("pure-grpc");
        let config = client_config(&[HTTP11]);
        let augmented = negotiator.client_config(&config);
        assert_eq!(
            augmented.alpn_protocols,
            vec![b"pure-grpc".to_vec(), H2.to_vec(), HTTP11.to_vec()]
        );
    }

    #[test]
    fn idempotent_and_non_mutating() {
        let negotiator = AlpnNegotiator::default();
        let original = client_config(&[H2, HTTP11]);

        let once = negotiator.client_config(&original);
        let twice = negotiator.client_config(&once);

        assert_eq!(once.alpn_protocols, twice.alpn_protocols);
        assert_eq!(twice.alpn_protocols.len(), 3);
        assert_eq!(original.alpn_protocols, vec![H2.to_vec(), HTTP11.to_vec()]);
    }

    #[test]
    fn server_config_is_augmented() {
        let negotiator = AlpnNegotiator::default();
        let augmented = negotiator.server_config(&server_config(&[]));
        assert_eq!(
            augmented.alpn_protocols,
            vec![DEFAULT_PURE_GRPC_TOKEN.as_bytes().to_vec(), H2.to_vec()]
        );
    }

    #[test]
    fn per_client_configs_are_augmented() {
        let negotiator = AlpnNegotiator::new("x-rpc");
        let picked = Arc::new(server_config(&[HTTP11]));
        let selector = {
            let picked = Arc::clone(&picked);
            move |hello: &ClientHelloInfo| {
                (hello.server_name.as_deref() == Some("special")).then(|| Arc::clone(&picked))
            }
        };
        let settings =
            ServerTlsSettings::new(Arc::new(server_config(&[]))).with_selector(Arc::new(selector));

        let augmented = negotiator.server_settings(&settings);

        let special = augmented.config_for(&ClientHelloInfo {
            server_name: Some("special".into()),
            alpn: vec![],
        });
        assert_eq!(
            special.alpn_protocols,
            vec![b"x-rpc".to_vec(), H2.to_vec(), HTTP11.to_vec()]
        );

        let base = augmented.config_for(&ClientHelloInfo::default());
        assert_eq!(base.alpn_protocols, vec![b"x-rpc".to_vec(), H2.to_vec()]);

        // The selector's own config is left alone.
        assert_eq!(picked.alpn_protocols, vec![HTTP11.to_vec()]);
    }
}
