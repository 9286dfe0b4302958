//! 根证书管理和按主机签发叶子证书

use chrono::{DateTime, Datelike, Duration, Utc};
use log::{info, warn};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SerialNumber,
};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tokio_rustls::rustls::crypto::{ring, CryptoProvider};
use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::rustls::{self, ServerConfig};

use crate::config::Config;
use crate::metrics::Metrics;

/// 叶子证书有效期，不超过根证书
const LEAF_VALIDITY_DAYS: i64 = 365;

#[derive(Debug, Error)]
pub enum CaError {
    #[error("证书生成失败: {0}")]
    Generate(#[from] rcgen::Error),
    #[error("读写 {path} 失败: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("PEM 解析失败: {0}")]
    Pem(String),
    #[error("TLS 配置失败: {0}")]
    Tls(#[from] rustls::Error),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CaError + '_ {
    move |source| CaError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// 根证书相关配置
#[derive(Debug, Clone)]
pub struct CaSettings {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub common_name: String,
    pub organization: String,
    pub validity_days: u32,
}

impl From<&Config> for CaSettings {
    fn from(config: &Config) -> Self {
        Self {
            cert_path: config.ca_cert_path(),
            key_path: config.ca_key_path(),
            common_name: config.ca_common_name.clone(),
            organization: config.ca_org.clone(),
            validity_days: config.ca_validity_days,
        }
    }
}

/// 当前的根证书和签名密钥
struct CaIdentity {
    cert_pem: String,
    cert_der: CertificateDer<'static>,
    /// 用于签发的证书对象；从磁盘加载时按原参数重建，DN 与密钥一致
    issuer: rcgen::Certificate,
    key: KeyPair,
    fingerprint: String,
    common_name: String,
    organization: String,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
}

/// 签发给某个主机的证书及其 TLS 配置
pub struct HostCertificate {
    pub host: String,
    pub cert_der: CertificateDer<'static>,
    pub server_config: Arc<ServerConfig>,
    pub not_after: DateTime<Utc>,
    /// 签发时的根证书代数
    pub generation: u64,
}

struct CaState {
    identity: Arc<CaIdentity>,
    leaves: HashMap<String, Arc<HostCertificate>>,
    generation: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaInfo {
    pub common_name: String,
    pub organization: String,
    pub fingerprint: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CaStats {
    pub certificates_issued: u64,
    pub cache_hits: u64,
    pub cached_certificates: usize,
    pub regenerations: u64,
}

/// 证书颁发机构
pub struct CaManager {
    settings: CaSettings,
    state: RwLock<CaState>,
    /// 串行化重新生成
    regen_lock: Mutex<()>,
    provider: Arc<CryptoProvider>,
    issued: AtomicU64,
    cache_hits: AtomicU64,
    regenerations: AtomicU64,
    metrics: Metrics,
}

impl CaManager {
    /// 载入磁盘上的根证书，不存在或无法解析时生成新的并写回
    pub fn load_or_create(settings: CaSettings, metrics: Metrics) -> Result<Self, CaError> {
        let identity = if settings.cert_path.exists() && settings.key_path.exists() {
            match load_identity(&settings) {
                Ok(identity) => {
                    info!(
                        "已载入 CA 证书 {} (指纹 {})",
                        settings.cert_path.display(),
                        identity.fingerprint
                    );
                    identity
                }
                Err(e) => {
                    warn!("CA 证书无法载入，重新生成: {}", e);
                    create_identity(&settings)?
                }
            }
        } else {
            info!("未找到 CA 证书，生成新的根证书");
            create_identity(&settings)?
        };

        Ok(Self {
            settings,
            state: RwLock::new(CaState {
                identity: Arc::new(identity),
                leaves: HashMap::new(),
                generation: 1,
            }),
            regen_lock: Mutex::new(()),
            provider: Arc::new(ring::default_provider()),
            issued: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            regenerations: AtomicU64::new(0),
            metrics,
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, CaState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, CaState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// 返回主机的叶子证书，首次请求时签发并缓存
    pub fn cert_for_host(&self, host: &str) -> Result<Arc<HostCertificate>, CaError> {
        let host = host.trim().trim_end_matches('.').to_ascii_lowercase();

        loop {
            let (identity, generation) = {
                let state = self.read();
                if let Some(cert) = state.leaves.get(&host) {
                    self.cache_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(cert.clone());
                }
                (state.identity.clone(), state.generation)
            };

            // 签发不持锁
            let cert = self.issue(&identity, &host, generation)?;

            let mut state = self.write();
            if state.generation != generation {
                // 期间根证书已更换，用新的重签
                continue;
            }
            if let Some(existing) = state.leaves.get(&host) {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(existing.clone());
            }
            let cert = Arc::new(cert);
            state.leaves.insert(host, cert.clone());
            self.issued.fetch_add(1, Ordering::Relaxed);
            self.metrics.ca_certificates_issued.inc();
            return Ok(cert);
        }
    }

    fn issue(
        &self,
        identity: &CaIdentity,
        host: &str,
        generation: u64,
    ) -> Result<HostCertificate, CaError> {
        let key = KeyPair::generate()?;
        let mut params = CertificateParams::new(vec![host.to_string()])?;
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, host.to_string());
        params
            .distinguished_name
            .push(DnType::OrganizationName, identity.organization.clone());
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.serial_number = Some(serial_for(host));

        let now = Utc::now();
        let not_after = (now + Duration::days(LEAF_VALIDITY_DAYS)).min(identity.not_after);
        let (y, m, d) = ymd(now - Duration::days(1));
        params.not_before = rcgen::date_time_ymd(y, m, d);
        let (y, m, d) = ymd(not_after);
        params.not_after = rcgen::date_time_ymd(y, m, d);

        let cert = params.signed_by(&key, &identity.issuer, &identity.key)?;
        let cert_der = cert.der().clone();

        let server_config = ServerConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(
                vec![cert_der.clone(), identity.cert_der.clone()],
                PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
            )?;

        Ok(HostCertificate {
            host: host.to_string(),
            cert_der,
            server_config: Arc::new(server_config),
            not_after: date_floor(not_after),
            generation,
        })
    }

    /// 生成新的根证书并清空叶子缓存；失败时保留原证书
    pub fn regenerate(&self) -> Result<CaInfo, CaError> {
        let _serial = self.regen_lock.lock().unwrap_or_else(|e| e.into_inner());

        let identity = create_identity(&self.settings)?;
        let fingerprint = identity.fingerprint.clone();

        let info = {
            let mut state = self.write();
            state.identity = Arc::new(identity);
            state.leaves.clear();
            state.generation += 1;
            Self::info_of(&state)
        };

        self.regenerations.fetch_add(1, Ordering::Relaxed);
        self.metrics.ca_regenerations.inc();
        info!("CA 已重新生成，新指纹 {}，客户端需要重新信任", fingerprint);
        Ok(info)
    }

    /// 根证书 DER 的 SHA-256，冒号分隔的大写十六进制
    pub fn fingerprint(&self) -> String {
        self.read().identity.fingerprint.clone()
    }

    pub fn cert_pem(&self) -> String {
        self.read().identity.cert_pem.clone()
    }

    pub fn cert_der(&self) -> CertificateDer<'static> {
        self.read().identity.cert_der.clone()
    }

    pub fn info(&self) -> CaInfo {
        Self::info_of(&self.read())
    }

    fn info_of(state: &CaState) -> CaInfo {
        let identity = &state.identity;
        CaInfo {
            common_name: identity.common_name.clone(),
            organization: identity.organization.clone(),
            fingerprint: identity.fingerprint.clone(),
            not_before: identity.not_before,
            not_after: identity.not_after,
            generation: state.generation,
        }
    }

    pub fn stats(&self) -> CaStats {
        CaStats {
            certificates_issued: self.issued.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cached_certificates: self.read().leaves.len(),
            regenerations: self.regenerations.load(Ordering::Relaxed),
        }
    }
}

fn fingerprint_of(der: &[u8]) -> String {
    Sha256::digest(der)
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

fn serial_for(seed: &str) -> SerialNumber {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(COUNTER.fetch_add(1, Ordering::Relaxed).to_be_bytes());
    hasher.update(
        Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default()
            .to_be_bytes(),
    );
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    // 保持正数
    bytes[0] &= 0x7F;
    SerialNumber::from_slice(&bytes)
}

/// 证书有效期精确到天
fn date_floor(dt: DateTime<Utc>) -> DateTime<Utc> {
    dt.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
        .unwrap_or(dt)
}

fn ymd(dt: DateTime<Utc>) -> (i32, u8, u8) {
    (dt.year(), dt.month() as u8, dt.day() as u8)
}

fn create_identity(settings: &CaSettings) -> Result<CaIdentity, CaError> {
    let key = KeyPair::generate()?;
    let mut params = CertificateParams::default();
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::CommonName, settings.common_name.clone());
    params
        .distinguished_name
        .push(DnType::OrganizationName, settings.organization.clone());
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(1));
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.serial_number = Some(serial_for(&settings.common_name));

    let now = Utc::now();
    let not_before = now - Duration::days(1);
    let not_after = now + Duration::days(settings.validity_days.max(1) as i64);
    let (y, m, d) = ymd(not_before);
    params.not_before = rcgen::date_time_ymd(y, m, d);
    let (y, m, d) = ymd(not_after);
    params.not_after = rcgen::date_time_ymd(y, m, d);

    let cert = params.self_signed(&key)?;
    let cert_pem = cert.pem();
    let cert_der = cert.der().clone();

    write_identity(settings, &cert_pem, &key.serialize_pem())?;
    info!(
        "已生成 CA 证书 {} (CN={}, 有效期 {} 天)",
        settings.cert_path.display(),
        settings.common_name,
        settings.validity_days
    );

    Ok(CaIdentity {
        fingerprint: fingerprint_of(&cert_der),
        cert_pem,
        cert_der,
        issuer: cert,
        key,
        common_name: settings.common_name.clone(),
        organization: settings.organization.clone(),
        not_before: date_floor(not_before),
        not_after: date_floor(not_after),
    })
}

fn load_identity(settings: &CaSettings) -> Result<CaIdentity, CaError> {
    let cert_pem = fs::read_to_string(&settings.cert_path).map_err(io_error(&settings.cert_path))?;
    let key_pem = fs::read_to_string(&settings.key_path).map_err(io_error(&settings.key_path))?;

    let key = KeyPair::from_pem(&key_pem)?;
    let params = CertificateParams::from_ca_cert_pem(&cert_pem)?;
    let cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes())
        .map_err(|e| CaError::Pem(e.to_string()))?;
    ensure_key_matches(&cert_der, &key)?;

    let dn_text = |ty: DnType| match params.distinguished_name.get(&ty) {
        Some(DnValue::Utf8String(s)) => Some(s.clone()),
        _ => None,
    };
    let common_name = dn_text(DnType::CommonName).unwrap_or_else(|| settings.common_name.clone());
    let organization =
        dn_text(DnType::OrganizationName).unwrap_or_else(|| settings.organization.clone());
    let not_before = DateTime::from_timestamp(params.not_before.unix_timestamp(), 0)
        .unwrap_or_else(Utc::now);
    let not_after = DateTime::from_timestamp(params.not_after.unix_timestamp(), 0)
        .ok_or_else(|| CaError::Pem("证书有效期无效".into()))?;

    if not_after <= Utc::now() {
        return Err(CaError::Pem(format!("CA 证书已于 {} 过期", not_after)));
    }

    let issuer = params.self_signed(&key)?;

    Ok(CaIdentity {
        fingerprint: fingerprint_of(&cert_der),
        cert_pem,
        cert_der,
        issuer,
        key,
        common_name,
        organization,
        not_before,
        not_after,
    })
}

/// 私钥必须对应证书中的公钥，否则签出的叶子证书无法链到磁盘上的根证书
fn ensure_key_matches(cert_der: &CertificateDer<'_>, key: &KeyPair) -> Result<(), CaError> {
    let (_, parsed) = x509_parser::parse_x509_certificate(cert_der.as_ref())
        .map_err(|e| CaError::Pem(format!("解析 CA 证书失败: {}", e)))?;
    if parsed.public_key().subject_public_key.data.as_ref() != key.public_key_raw() {
        return Err(CaError::Pem("CA 私钥与证书不匹配".into()));
    }
    Ok(())
}

/// 先写临时文件再替换，避免证书和密钥不一致
fn write_identity(settings: &CaSettings, cert_pem: &str, key_pem: &str) -> Result<(), CaError> {
    for path in [&settings.cert_path, &settings.key_path] {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(io_error(dir))?;
        }
    }

    let cert_tmp = settings.cert_path.with_extension("tmp");
    let key_tmp = settings.key_path.with_extension("key.tmp");
    fs::write(&cert_tmp, cert_pem).map_err(io_error(&cert_tmp))?;
    fs::write(&key_tmp, key_pem).map_err(io_error(&key_tmp))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&key_tmp, fs::Permissions::from_mode(0o600))
            .map_err(io_error(&key_tmp))?;
    }

    fs::rename(&key_tmp, &settings.key_path).map_err(io_error(&settings.key_path))?;
    fs::rename(&cert_tmp, &settings.cert_path).map_err(io_error(&settings.cert_path))?;
    Ok(())
}
