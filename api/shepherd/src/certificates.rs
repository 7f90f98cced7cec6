//! The certificate authority devices are authenticated against.
//!
//! The CA lives in a secret in the operator namespace: `ca.crt` holds one or more PEM
//! certificates, `ca.key` the private key of the first one.  The first certificate signs
//! everything issued by this process; any later ones are older roots kept so that devices they
//! issued for stay trusted until their own certificates expire.
//!
//! Three kinds of leaf are issued: a server certificate for the TLS listener, the shared
//! registration certificate (CN `register`) that lets a new device make its first call, and the
//! per-device client certificates returned from registration.

use log::{debug, info, warn};
use models::constants::{
    CA_CERT_KEY, CA_KEY_KEY, CLIENT_CERT_KEY, CLIENT_KEY_KEY, REGISTRATION_COMMON_NAME,
    REGISTRATION_SECRET_LABEL,
};
use models::{ObjectMeta, Secret};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateSigningRequestParams,
    DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
    RsaKeySize, SanType, SerialNumber, PKCS_RSA_SHA256,
};
use snafu::{ensure, OptionExt, ResultExt};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::prelude::{FromDer, X509Certificate};

use fleetstore::Repository;

const CA_COMMON_NAME: &str = "shepherd-ca";
const CA_VALIDITY_DAYS: i64 = 3650;
const CA_KEY_SIZE: RsaKeySize = RsaKeySize::_4096;
const DEVICE_VALIDITY_DAYS: i64 = 365;
const SERVER_VALIDITY_DAYS: i64 = 365;
// Allowance for clock skew between us and the devices.
const BACKDATE_MINUTES: i64 = 5;

/// The kind of caller a route admits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// A device with no identity yet, holding the shared registration certificate.
    Register,
    /// A registered device, holding its own certificate.
    Device,
}

/// An authenticated TLS peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub common_name: String,
}

impl Peer {
    pub fn role(&self) -> Role {
        if self.common_name == REGISTRATION_COMMON_NAME {
            Role::Register
        } else {
            Role::Device
        }
    }
}

/// A certificate and its private key, PEM encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientBundle {
    pub cert_pem: String,
    pub key_pem: String,
}

pub struct CertificateAuthority {
    /// DER of every trusted root, active signer first.
    roots: Vec<Vec<u8>>,
    chain_pem: String,
    signer: Certificate,
    signer_key: KeyPair,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("roots", &self.roots.len())
            .finish()
    }
}

impl CertificateAuthority {
    /// Generates a fresh self-signed root with a 4096-bit RSA key.  Leaves get ECDSA keys.
    pub fn generate() -> Result<Self> {
        let key = KeyPair::generate_rsa_for(&PKCS_RSA_SHA256, CA_KEY_SIZE)
            .context(error::GenerateKeySnafu)?;

        let mut params = CertificateParams::default();
        params.distinguished_name = common_name(CA_COMMON_NAME);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        set_validity(&mut params, CA_VALIDITY_DAYS);
        params.serial_number = Some(random_serial());

        let cert = params
            .self_signed(&key)
            .context(error::IssueSnafu { what: "CA" })?;
        Self::from_pem(&cert.pem(), &key.serialize_pem())
    }

    /// Loads a CA from its chain (active signer first) and the signer's key.
    pub fn from_pem(chain_pem: &str, key_pem: &str) -> Result<Self> {
        let roots = rustls_pemfile::certs(&mut chain_pem.as_bytes()).context(error::PemSnafu {
            what: "CA certificate chain",
        })?;
        let first = first_pem_certificate(chain_pem).context(error::EmptyChainSnafu)?;
        ensure!(!roots.is_empty(), error::EmptyChainSnafu);

        let signer_key = KeyPair::from_pem(key_pem).context(error::LoadKeySnafu)?;
        // rcgen needs the issuer as its own type; re-signing the parsed params with the same key
        // keeps the subject and key, which is all chain building looks at.
        let signer = CertificateParams::from_ca_cert_pem(first)
            .context(error::LoadCaSnafu)?
            .self_signed(&signer_key)
            .context(error::LoadCaSnafu)?;

        Ok(Self {
            roots,
            chain_pem: chain_pem.to_string(),
            signer,
            signer_key,
        })
    }

    /// Adds an older root that should stay trusted.  It goes after every existing root.
    pub fn with_retired_root(mut self, root_pem: &str) -> Result<Self> {
        let mut retired = rustls_pemfile::certs(&mut root_pem.as_bytes())
            .context(error::PemSnafu { what: "retired root" })?;
        ensure!(!retired.is_empty(), error::EmptyChainSnafu);
        self.roots.append(&mut retired);
        if !self.chain_pem.ends_with('\n') {
            self.chain_pem.push('\n');
        }
        self.chain_pem.push_str(root_pem);
        Ok(self)
    }

    pub fn chain_pem(&self) -> &str {
        &self.chain_pem
    }

    pub fn key_pem(&self) -> String {
        self.signer_key.serialize_pem()
    }

    pub fn root_count(&self) -> usize {
        self.roots.len()
    }

    /// Builds the TLS configuration for the device listener: a fresh server certificate for the
    /// given names, TLS 1.3 only, and a client certificate required and chained to one of our
    /// roots.
    pub fn server_config(
        &self,
        dns_names: &[String],
        include_loopback: bool,
    ) -> Result<rustls::ServerConfig> {
        let server_key = KeyPair::generate().context(error::GenerateKeySnafu)?;

        let mut params =
            CertificateParams::new(dns_names.to_vec()).context(error::IssueSnafu { what: "server" })?;
        params.distinguished_name = common_name("*");
        if include_loopback {
            params
                .subject_alt_names
                .push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));
            params
                .subject_alt_names
                .push(SanType::IpAddress(IpAddr::V6(Ipv6Addr::LOCALHOST)));
        }
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        set_validity(&mut params, SERVER_VALIDITY_DAYS);
        params.serial_number = Some(random_serial());
        let server_cert = params
            .signed_by(&server_key, &self.signer, &self.signer_key)
            .context(error::IssueSnafu { what: "server" })?;

        let mut client_roots = rustls::RootCertStore::empty();
        let (_, rejected) = client_roots.add_parsable_certificates(&self.roots);
        ensure!(rejected == 0, error::TrustRootSnafu { rejected });
        let verifier = rustls::server::AllowAnyAuthenticatedClient::new(client_roots);

        let config = rustls::ServerConfig::builder()
            .with_safe_default_cipher_suites()
            .with_safe_default_kx_groups()
            .with_protocol_versions(&[&rustls::version::TLS13])
            .context(error::TlsConfigSnafu)?
            .with_client_cert_verifier(Arc::new(verifier))
            .with_single_cert(
                vec![rustls::Certificate(server_cert.der().to_vec())],
                rustls::PrivateKey(server_key.serialize_der()),
            )
            .context(error::TlsConfigSnafu)?;
        Ok(config)
    }

    /// Issues the shared registration certificate, valid for the given number of hours.
    pub fn create_registration_client(&self, validity_hours: i64) -> Result<ClientBundle> {
        let key = KeyPair::generate().context(error::GenerateKeySnafu)?;

        let mut params = client_params(REGISTRATION_COMMON_NAME);
        let not_before = OffsetDateTime::now_utc() - Duration::minutes(BACKDATE_MINUTES);
        params.not_before = not_before;
        params.not_after = not_before + Duration::hours(validity_hours);

        let cert = params
            .signed_by(&key, &self.signer, &self.signer_key)
            .context(error::IssueSnafu {
                what: "registration client",
            })?;
        Ok(ClientBundle {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }

    /// Signs a device's certificate request, after [`check_device_csr`].
    pub fn sign_device_csr(&self, device_id: &str, csr_pem: &str) -> Result<String> {
        check_device_csr(device_id, csr_pem)?;
        let request =
            CertificateSigningRequestParams::from_pem(csr_pem).context(error::CsrParseSnafu)?;
        let mut params = client_params(device_id);
        set_validity(&mut params, DEVICE_VALIDITY_DAYS);
        let cert = params
            .signed_by(&request.public_key, &self.signer, &self.signer_key)
            .context(error::IssueSnafu { what: "device" })?;
        debug!("Signed certificate for device '{}'", device_id);
        Ok(cert.pem())
    }

    /// Checks a peer's certificate chain, leaf first.  The leaf must be currently valid and
    /// signed by one of our roots; intermediates aren't used.
    pub fn authenticate(&self, peer_chain: &[Vec<u8>]) -> Option<Peer> {
        let leaf_der = peer_chain.first()?;
        let (_, leaf) = X509Certificate::from_der(leaf_der).ok()?;
        if !leaf.validity().is_valid() {
            debug!("Rejecting peer certificate outside its validity window");
            return None;
        }

        let chained = self.roots.iter().any(|root_der| {
            match X509Certificate::from_der(root_der) {
                Ok((_, root)) => {
                    leaf.issuer().as_raw() == root.subject().as_raw()
                        && leaf.verify_signature(Some(root.public_key())).is_ok()
                }
                Err(_) => false,
            }
        });
        if !chained {
            debug!("Rejecting peer certificate not issued by a trusted root");
            return None;
        }

        let common_name = leaf
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())?
            .to_string();
        Some(Peer { common_name })
    }

    /// Whether the peer chain authenticates and fits the role.
    pub fn verify(&self, peer_chain: &[Vec<u8>], role: Role) -> bool {
        self.authenticate(peer_chain)
            .map(|peer| peer.role() == role)
            .unwrap_or(false)
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// Checks a device's certificate request without signing it.  The request must carry a valid
/// self-signature and ask for exactly the device's name as its common name.
pub fn check_device_csr(device_id: &str, csr_pem: &str) -> Result<()> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(csr_pem.as_bytes())
        .ok()
        .context(error::CsrMalformedSnafu {
            reason: "not a PEM block",
        })?;
    ensure!(
        pem.label == "CERTIFICATE REQUEST",
        error::CsrMalformedSnafu {
            reason: format!("unexpected PEM label '{}'", pem.label),
        }
    );
    let (_, csr) = X509CertificationRequest::from_der(&pem.contents)
        .ok()
        .context(error::CsrMalformedSnafu {
            reason: "invalid DER",
        })?;
    csr.verify_signature()
        .ok()
        .context(error::CsrMalformedSnafu {
            reason: "bad self-signature",
        })?;
    let requested = csr
        .certification_request_info
        .subject
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_string();
    ensure!(
        requested == device_id,
        error::CsrSubjectSnafu {
            requested,
            device_id,
        }
    );
    Ok(())
}

/// Loads the CA from its secret, generating and storing a new one if there isn't one yet.
pub async fn load_or_create(
    repo: &dyn Repository,
    namespace: &str,
    secret_name: &str,
) -> Result<CertificateAuthority> {
    let exists = repo
        .namespace_exists(namespace)
        .await
        .context(error::RepositorySnafu {
            op: "namespace lookup",
        })?;
    ensure!(exists, error::MissingNamespaceSnafu { namespace });

    match repo.read_secret(namespace, secret_name).await {
        Ok(secret) => {
            debug!("Loading CA from secret '{}/{}'", namespace, secret_name);
            ca_from_secret(&secret)
        }
        Err(e) if e.is_not_found() => {
            info!(
                "No CA found in '{}/{}', generating a new one",
                namespace, secret_name
            );
            let ca = CertificateAuthority::generate()?;
            let mut secret = Secret {
                metadata: ObjectMeta::new(namespace, secret_name),
                ..Default::default()
            };
            secret
                .data
                .insert(CA_CERT_KEY.to_string(), ca.chain_pem().as_bytes().to_vec());
            secret
                .data
                .insert(CA_KEY_KEY.to_string(), ca.key_pem().into_bytes());

            match repo.create_secret(&secret).await {
                Ok(_) => Ok(ca),
                // Another replica got there first; use theirs.
                Err(e) if e.is_conflict() => {
                    let stored = repo
                        .read_secret(namespace, secret_name)
                        .await
                        .context(error::RepositorySnafu { op: "CA re-read" })?;
                    ca_from_secret(&stored)
                }
                Err(e) => Err(e).context(error::RepositorySnafu { op: "CA create" }),
            }
        }
        Err(e) => Err(e).context(error::RepositorySnafu { op: "CA read" }),
    }
}

fn ca_from_secret(secret: &Secret) -> Result<CertificateAuthority> {
    let chain = secret
        .string_value(CA_CERT_KEY)
        .context(error::MissingSecretKeySnafu { key: CA_CERT_KEY })?;
    let key = secret
        .string_value(CA_KEY_KEY)
        .context(error::MissingSecretKeySnafu { key: CA_KEY_KEY })?;
    CertificateAuthority::from_pem(&chain, &key)
}

/// Loads the CA and builds the listener's TLS configuration.
pub async fn init_certificates(
    repo: &dyn Repository,
    namespace: &str,
    secret_name: &str,
    dns_names: &[String],
    include_loopback: bool,
) -> Result<(rustls::ServerConfig, Arc<CertificateAuthority>)> {
    let ca = load_or_create(repo, namespace, secret_name).await?;
    info!("Certificate authority loaded with {} trusted root(s)", ca.root_count());
    let config = ca.server_config(dns_names, include_loopback)?;
    Ok((config, Arc::new(ca)))
}

/// Makes sure the registration bundle secret holds a certificate that's still valid and issued
/// by our current signer, issuing a new one if not.
pub async fn ensure_registration_client(
    repo: &dyn Repository,
    ca: &CertificateAuthority,
    namespace: &str,
    secret_name: &str,
    validity_hours: i64,
) -> Result<ClientBundle> {
    let existing = match repo.read_secret(namespace, secret_name).await {
        Ok(secret) => Some(secret),
        Err(e) if e.is_not_found() => None,
        Err(e) => {
            return Err(e).context(error::RepositorySnafu {
                op: "registration bundle read",
            })
        }
    };

    if let Some(secret) = &existing {
        if let (Some(cert_pem), Some(key_pem)) = (
            secret.string_value(CLIENT_CERT_KEY),
            secret.string_value(CLIENT_KEY_KEY),
        ) {
            let usable = rustls_pemfile::certs(&mut cert_pem.as_bytes())
                .map(|chain| ca.verify(&chain, Role::Register))
                .unwrap_or(false);
            if usable {
                debug!("Registration bundle in '{}/{}' is current", namespace, secret_name);
                return Ok(ClientBundle { cert_pem, key_pem });
            }
        }
        warn!(
            "Registration bundle in '{}/{}' is expired or from another CA, re-issuing",
            namespace, secret_name
        );
    }

    let bundle = ca.create_registration_client(validity_hours)?;
    let mut secret = existing.unwrap_or_else(|| Secret {
        metadata: ObjectMeta::new(namespace, secret_name),
        ..Default::default()
    });
    secret
        .metadata
        .labels
        .insert(REGISTRATION_SECRET_LABEL.to_string(), "true".to_string());
    secret.data.insert(
        CLIENT_CERT_KEY.to_string(),
        bundle.cert_pem.as_bytes().to_vec(),
    );
    secret
        .data
        .insert(CLIENT_KEY_KEY.to_string(), bundle.key_pem.as_bytes().to_vec());

    let result = if secret.metadata.resource_version == 0 {
        repo.create_secret(&secret).await
    } else {
        repo.update_secret(&secret).await
    };
    result.context(error::RepositorySnafu {
        op: "registration bundle write",
    })?;
    info!("Stored registration bundle in '{}/{}'", namespace, secret_name);
    Ok(bundle)
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

fn common_name(cn: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, cn);
    dn
}

fn set_validity(params: &mut CertificateParams, days: i64) {
    let not_before = OffsetDateTime::now_utc() - Duration::minutes(BACKDATE_MINUTES);
    params.not_before = not_before;
    params.not_after = not_before + Duration::days(days);
}

fn client_params(cn: &str) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.distinguished_name = common_name(cn);
    params.is_ca = IsCa::NoCa;
    params.use_authority_key_identifier_extension = true;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
    params.serial_number = Some(random_serial());
    params
}

fn random_serial() -> SerialNumber {
    // Positive and non-zero.
    SerialNumber::from((rand::random::<u64>() >> 1).max(1))
}

/// Returns the text of the first PEM certificate block in `chain`.
fn first_pem_certificate(chain: &str) -> Option<&str> {
    const BEGIN: &str = "-----BEGIN CERTIFICATE-----";
    const END: &str = "-----END CERTIFICATE-----";
    let start = chain.find(BEGIN)?;
    let end = chain[start..].find(END)? + start + END.len();
    Some(&chain[start..end])
}

pub mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Namespace '{}' does not exist", namespace))]
        MissingNamespace { namespace: String },

        #[snafu(display("Repository error during {}: {}", op, source))]
        Repository {
            op: String,
            source: fleetstore::Error,
        },

        #[snafu(display("CA secret is missing key '{}'", key))]
        MissingSecretKey { key: String },

        #[snafu(display("Unable to read PEM in {}: {}", what, source))]
        Pem {
            what: String,
            source: std::io::Error,
        },

        #[snafu(display("CA certificate chain contains no certificates"))]
        EmptyChain,

        #[snafu(display("Unable to load CA key: {}", source))]
        LoadKey { source: rcgen::Error },

        #[snafu(display("Unable to load CA certificate: {}", source))]
        LoadCa { source: rcgen::Error },

        #[snafu(display("Unable to generate key pair: {}", source))]
        GenerateKey { source: rcgen::Error },

        #[snafu(display("Unable to issue {} certificate: {}", what, source))]
        Issue {
            what: String,
            source: rcgen::Error,
        },

        #[snafu(display("{} CA root(s) could not be used as trust anchors", rejected))]
        TrustRoot { rejected: usize },

        #[snafu(display("Unable to build TLS configuration: {}", source))]
        TlsConfig { source: rustls::Error },

        #[snafu(display("Malformed certificate request: {}", reason))]
        CsrMalformed { reason: String },

        #[snafu(display("Unable to parse certificate request: {}", source))]
        CsrParse { source: rcgen::Error },

        #[snafu(display(
            "Certificate request is for '{}' but was sent for device '{}'",
            requested,
            device_id
        ))]
        CsrSubject { requested: String, device_id: String },
    }

    impl Error {
        /// Whether the caller sent something unusable, as opposed to us failing.
        pub fn is_bad_request(&self) -> bool {
            matches!(
                self,
                Error::CsrMalformed { .. } | Error::CsrParse { .. } | Error::CsrSubject { .. }
            )
        }
    }
}
pub use error::Error;
type Result<T> = std::result::Result<T, error::Error>;
