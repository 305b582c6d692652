use std::sync::OnceLock;

/// Select the ring crypto provider for rustls once per process.
///
/// rustls 0.23 panics on the first TLS handshake when more than one provider is compiled in
/// and none was installed. An already-installed provider is left in place.
pub fn install_rustls_crypto_provider() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("rustls crypto provider already installed");
        }
    });
}
