//! 到真实目标的 TLS 连接

use anyhow::{anyhow, bail, Context, Result};
use log::{info, warn};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{
    ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider,
};
use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{self, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;

/// 接受任何上游证书，只校验握手签名本身
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// 上游 TLS 连接器
#[derive(Clone)]
pub struct UpstreamConnector {
    connector: TlsConnector,
    verify: bool,
}

impl UpstreamConnector {
    /// 按配置构建；开启校验时从 bundle 读取信任根
    pub fn from_config(verify: bool, ca_bundle: &Path) -> Result<Self> {
        if !verify {
            warn!("上游证书校验已关闭 (UPSTREAM_TLS_VERIFY=false)，代理会信任任何上游证书");
            return Self::insecure();
        }

        let pem = std::fs::read(ca_bundle)
            .with_context(|| format!("Failed to read CA bundle {}", ca_bundle.display()))?;
        let certs = CertificateDer::pem_slice_iter(&pem)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow!("failed to parse CA bundle: {e}"))?;

        let mut roots = RootCertStore::empty();
        let (added, ignored) = roots.add_parsable_certificates(certs);
        if added == 0 {
            bail!("CA bundle {} contains no usable certificates", ca_bundle.display());
        }
        info!(
            "上游证书校验已开启，信任根 {} 个 (忽略 {})",
            added, ignored
        );
        Self::with_roots(roots)
    }

    pub fn insecure() -> Result<Self> {
        let provider = Arc::new(ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }))
            .with_no_client_auth();
        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            verify: false,
        })
    }

    pub fn with_roots(roots: RootCertStore) -> Result<Self> {
        let config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            verify: true,
        })
    }

    pub fn verifies(&self) -> bool {
        self.verify
    }

    /// 建立 TCP 连接并完成 TLS 握手，SNI 为目标主机名
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        connect_timeout: Duration,
    ) -> Result<TlsStream<TcpStream>> {
        let server_name = ServerName::try_from(host.to_string())
            .with_context(|| format!("invalid server name: {}", host))?;

        let tcp = timeout(connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| anyhow!("connect to {}:{} timed out", host, port))?
            .with_context(|| format!("connect to {}:{}", host, port))?;
        let _ = tcp.set_nodelay(true);

        let tls = timeout(connect_timeout, self.connector.connect(server_name, tcp))
            .await
            .map_err(|_| anyhow!("TLS handshake with {}:{} timed out", host, port))?
            .with_context(|| format!("TLS handshake with {}:{}", host, port))?;
        Ok(tls)
    }
}
