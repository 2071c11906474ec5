use crate::attestation::{AndroidKeyRootPolicy, AttestationFormat};
use crate::certificate;
use crate::client_data::OriginPolicy;
use crate::error::{Error, Result};
use crate::verifier::CounterPolicy;
use base64::{engine::general_purpose, Engine as _};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use x509_parser::pem::Pem;

/// Name of the settings file looked up in the working and config directories
pub const SETTINGS_FILE: &str = "Verifier.toml";
/// Environment variable naming an extra directory holding `Verifier.toml`
pub const CONFIG_DIR_ENV: &str = "PASSKEY_VERIFIER_CONFIG_DIR";

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct VerifierSettings {
    pub relying_party: RelyingPartySettings,
    pub attestation: AttestationSettings,
    pub trust_roots: Vec<TrustRootSettings>,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RelyingPartySettings {
    pub id: String,
    pub name: String,
    pub origin: String,
    pub origin_policy: OriginPolicy,
    pub allow_cross_origin: bool,
    pub require_user_verification: bool,
    /// Ceremony timeout advertised to clients, in seconds
    pub timeout_seconds: u64,
    pub counter_policy: CounterPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AttestationSettings {
    /// Tolerance applied to certificate validity windows and SafetyNet timestamps
    pub clock_skew_seconds: u64,
    pub android_key_root_policy: AndroidKeyRootPolicy,
    pub android_key_require_tee: bool,
    pub safetynet_max_age_seconds: u64,
}

/// One trust root or pre-fetched intermediate for an attestation format
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrustRootSettings {
    pub format: AttestationFormat,
    /// Inline standard-base64 DER certificate
    pub certificate: Option<String>,
    /// PEM or DER certificate file
    pub path: Option<String>,
    #[serde(default)]
    pub intermediate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for RelyingPartySettings {
    fn default() -> Self {
        Self {
            id: "localhost".to_string(),
            name: "Passkey Verifier".to_string(),
            origin: "http://localhost:8080".to_string(),
            origin_policy: OriginPolicy::Strict,
            allow_cross_origin: false,
            require_user_verification: false,
            timeout_seconds: 300,
            counter_policy: CounterPolicy::Strict,
        }
    }
}

impl Default for AttestationSettings {
    fn default() -> Self {
        Self {
            clock_skew_seconds: 300,
            android_key_root_policy: AndroidKeyRootPolicy::Reject,
            android_key_require_tee: false,
            safetynet_max_age_seconds: 60,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl VerifierSettings {
    /// Load settings from configuration files and environment variables
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if a settings file cannot be read or
    /// parsed.
    pub fn load() -> Result<Self> {
        let mut settings = Self::load_base_settings()?;
        Self::apply_env_overrides(&mut settings);
        Self::initialize_logging(&settings.logging);

        Ok(settings)
    }

    /// Parse settings from TOML text
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the text is not valid settings TOML.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        basic_toml::from_str(toml).map_err(|e| Error::Configuration(format!("Invalid TOML: {e}")))
    }

    /// Logger using the configured level as its default filter; `RUST_LOG` still wins
    fn logger_builder(logging: &LoggingSettings) -> env_logger::Builder {
        env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or(logging.level.as_str()),
        )
    }

    /// Initialize logging once per process
    fn initialize_logging(logging: &LoggingSettings) {
        if Self::logger_builder(logging).try_init().is_err() {
            debug!("Logger already initialised");
        }
    }

    /// Load base settings from TOML file(s) or use defaults
    /// Settings are loaded with the following priority (highest to lowest):
    /// 1. Environment variables (applied separately after loading base settings)
    /// 2. Verifier.toml in `PASSKEY_VERIFIER_CONFIG_DIR` (if specified and exists)
    /// 3. Verifier.toml in current directory (if exists)
    /// 4. Default settings
    fn load_base_settings() -> Result<Self> {
        let mut settings = Self::default();

        let default_config_path = PathBuf::from(SETTINGS_FILE);
        if default_config_path.exists() {
            settings = Self::read_file(&default_config_path)?;
            info!(
                "✓ Loaded base settings from {}",
                default_config_path.display()
            );
        }

        if let Ok(config_dir) = std::env::var(CONFIG_DIR_ENV) {
            let config_path = Path::new(&config_dir).join(SETTINGS_FILE);
            if config_path.exists() {
                settings = Self::read_file(&config_path)?;
                info!("✓ Overriding settings from {}", config_path.display());
            } else {
                info!(
                    "ℹ {CONFIG_DIR_ENV} set but no {SETTINGS_FILE} found at: {}",
                    config_path.display()
                );
            }
        }

        Ok(settings)
    }

    fn read_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Apply environment variable overrides to settings
    fn apply_env_overrides(settings: &mut Self) {
        Self::apply_relying_party_env_overrides(&mut settings.relying_party);
        Self::apply_attestation_env_overrides(&mut settings.attestation);
        Self::apply_logging_env_overrides(&mut settings.logging);
    }

    /// Apply environment overrides for relying party settings
    fn apply_relying_party_env_overrides(rp_settings: &mut RelyingPartySettings) {
        if let Ok(rp_id) = std::env::var("RP_ID") {
            rp_settings.id = rp_id;
        }
        if let Ok(rp_origin) = std::env::var("RP_ORIGIN") {
            rp_settings.origin = rp_origin;
        }
        if let Ok(rp_name) = std::env::var("RP_NAME") {
            rp_settings.name = rp_name;
        }
        if let Ok(policy) = std::env::var("ORIGIN_POLICY") {
            match policy.to_ascii_lowercase().as_str() {
                "strict" => rp_settings.origin_policy = OriginPolicy::Strict,
                "relaxed" => rp_settings.origin_policy = OriginPolicy::Relaxed,
                other => log::warn!("⚠️ Ignoring unknown ORIGIN_POLICY '{other}'"),
            }
        }
    }

    /// Apply environment overrides for attestation settings
    fn apply_attestation_env_overrides(attestation_settings: &mut AttestationSettings) {
        Self::apply_numeric_env_override(
            "ATTESTATION_CLOCK_SKEW",
            &mut attestation_settings.clock_skew_seconds,
        );
    }

    /// Helper function to apply numeric environment variable overrides
    fn apply_numeric_env_override(env_var: &str, target: &mut u64) {
        if let Ok(value_str) = std::env::var(env_var) {
            if let Ok(value) = value_str.parse::<u64>() {
                *target = value;
            }
        }
    }

    /// Apply environment overrides for logging settings
    fn apply_logging_env_overrides(logging_settings: &mut LoggingSettings) {
        if let Ok(log_level) = std::env::var("RUST_LOG") {
            logging_settings.level = log_level;
        }
    }
}

impl TrustRootSettings {
    /// Load the DER certificates this entry names
    ///
    /// A PEM file may hold several certificates; inline values hold one.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if neither or both sources are set, the
    /// material cannot be read or decoded, or it is not an X.509 certificate.
    pub fn load_der(&self) -> Result<Vec<Vec<u8>>> {
        let certs = match (&self.certificate, &self.path) {
            (Some(inline), None) => vec![general_purpose::STANDARD
                .decode(inline.trim())
                .map_err(|e| {
                    Error::Configuration(format!(
                        "Inline {} trust root is not base64: {e}",
                        self.format
                    ))
                })?],
            (None, Some(path)) => Self::read_certificate_file(Path::new(path))?,
            _ => {
                return Err(Error::Configuration(format!(
                    "{} trust root needs exactly one of 'certificate' or 'path'",
                    self.format
                )))
            }
        };

        for der in &certs {
            certificate::parse(der).map_err(|e| {
                Error::Configuration(format!(
                    "{} trust root is not a certificate: {}",
                    self.format,
                    e.detail()
                ))
            })?;
        }
        Ok(certs)
    }

    fn read_certificate_file(path: &Path) -> Result<Vec<Vec<u8>>> {
        let bytes = fs::read(path).map_err(|e| {
            Error::Configuration(format!("Cannot read {}: {e}", path.display()))
        })?;
        if !bytes.starts_with(b"-----BEGIN") {
            return Ok(vec![bytes]);
        }

        let certs = Pem::iter_from_buffer(&bytes)
            .filter_map(|pem| match pem {
                Ok(pem) if pem.label == "CERTIFICATE" => Some(Ok(pem.contents)),
                Ok(_) => None,
                Err(e) => Some(Err(Error::Configuration(format!(
                    "Invalid PEM in {}: {e}",
                    path.display()
                )))),
            })
            .collect::<Result<Vec<_>>>()?;
        if certs.is_empty() {
            return Err(Error::Configuration(format!(
                "No certificates found in {}",
                path.display()
            )));
        }
        Ok(certs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serial_test::serial;

    // Helper function to clean all relevant environment variables for tests
    fn clean_env_vars() {
        for var in [
            "RP_ID",
            "RP_ORIGIN",
            "RP_NAME",
            "ORIGIN_POLICY",
            "ATTESTATION_CLOCK_SKEW",
            "RUST_LOG",
            CONFIG_DIR_ENV,
        ] {
            std::env::remove_var(var);
        }
    }

    fn self_signed_der() -> Vec<u8> {
        use openssl::asn1::Asn1Time;
        use openssl::ec::{EcGroup, EcKey};
        use openssl::hash::MessageDigest;
        use openssl::nid::Nid;
        use openssl::pkey::PKey;
        use openssl::x509::{X509NameBuilder, X509};

        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
        let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "Settings Test Root").unwrap();
        let name = name.build();

        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
        builder.set_not_after(&Asn1Time::days_from_now(30).unwrap()).unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        builder.build().to_der().unwrap()
    }

    #[test]
    #[serial]
    fn test_logging_level_is_default_filter() {
        clean_env_vars();
        let logging = LoggingSettings {
            level: "warn".to_string(),
        };
        let logger = VerifierSettings::logger_builder(&logging).build();
        assert_eq!(logger.filter(), log::LevelFilter::Warn);

        std::env::set_var("RUST_LOG", "debug");
        let logger = VerifierSettings::logger_builder(&logging).build();
        assert_eq!(logger.filter(), log::LevelFilter::Debug);
        clean_env_vars();
    }

    #[test]
    fn test_defaults() {
        let settings = VerifierSettings::default();
        assert_eq!(settings.relying_party.id, "localhost");
        assert_eq!(settings.relying_party.origin_policy, OriginPolicy::Strict);
        assert_eq!(settings.relying_party.counter_policy, CounterPolicy::Strict);
        assert_eq!(settings.attestation.clock_skew_seconds, 300);
        assert_eq!(
            settings.attestation.android_key_root_policy,
            AndroidKeyRootPolicy::Reject
        );
        assert!(settings.trust_roots.is_empty());
        assert_eq!(settings.logging.level, "info");
    }

    #[test]
    fn test_parse_toml() {
        let settings = VerifierSettings::from_toml_str(
            r#"
            [relying_party]
            id = "example.org"
            name = "Example"
            origin = "https://example.org"
            origin_policy = "relaxed"
            require_user_verification = true

            [attestation]
            clock_skew_seconds = 30
            android_key_root_policy = "accept_as_self"

            [[trust_roots]]
            format = "android-key"
            certificate = "MAA="

            [[trust_roots]]
            format = "tpm"
            path = "/etc/passkey/tpm-ca.pem"
            intermediate = true
            "#,
        )
        .unwrap();

        assert_eq!(settings.relying_party.id, "example.org");
        assert_eq!(settings.relying_party.origin_policy, OriginPolicy::Relaxed);
        assert!(settings.relying_party.require_user_verification);
        assert!(!settings.relying_party.allow_cross_origin);
        assert_eq!(settings.attestation.clock_skew_seconds, 30);
        assert_eq!(settings.attestation.safetynet_max_age_seconds, 60);
        assert_eq!(
            settings.attestation.android_key_root_policy,
            AndroidKeyRootPolicy::AcceptAsSelf
        );
        assert_eq!(settings.trust_roots.len(), 2);
        assert_eq!(settings.trust_roots[0].format, AttestationFormat::AndroidKey);
        assert!(!settings.trust_roots[0].intermediate);
        assert!(settings.trust_roots[1].intermediate);
        assert_eq!(settings.logging.level, "info");
    }

    #[test]
    fn test_invalid_toml() {
        let err = VerifierSettings::from_toml_str("[relying_party]\nid = 5").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let err = VerifierSettings::from_toml_str("[[trust_roots]]\nformat = \"apple\"").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clean_env_vars();
        std::env::set_var("RP_ID", "login.example.com");
        std::env::set_var("RP_ORIGIN", "https://login.example.com");
        std::env::set_var("ORIGIN_POLICY", "Relaxed");
        std::env::set_var("ATTESTATION_CLOCK_SKEW", "12");
        std::env::set_var("RUST_LOG", "debug");

        let mut settings = VerifierSettings::default();
        VerifierSettings::apply_env_overrides(&mut settings);

        assert_eq!(settings.relying_party.id, "login.example.com");
        assert_eq!(settings.relying_party.origin, "https://login.example.com");
        assert_eq!(settings.relying_party.origin_policy, OriginPolicy::Relaxed);
        assert_eq!(settings.attestation.clock_skew_seconds, 12);
        assert_eq!(settings.logging.level, "debug");

        std::env::set_var("ATTESTATION_CLOCK_SKEW", "not-a-number");
        VerifierSettings::apply_env_overrides(&mut settings);
        assert_eq!(settings.attestation.clock_skew_seconds, 12);

        clean_env_vars();
    }

    #[test]
    #[serial]
    fn test_load_from_config_dir() {
        clean_env_vars();
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(SETTINGS_FILE),
            "[relying_party]\nid = \"from-dir.example\"\norigin = \"https://from-dir.example\"\n",
        )
        .unwrap();
        std::env::set_var(CONFIG_DIR_ENV, dir.path());
        std::env::set_var("RP_NAME", "Env Name");

        let settings = VerifierSettings::load().unwrap();
        assert_eq!(settings.relying_party.id, "from-dir.example");
        assert_eq!(settings.relying_party.name, "Env Name");

        clean_env_vars();
    }

    #[test]
    #[serial]
    fn test_missing_config_dir_file_keeps_defaults() {
        clean_env_vars();
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var(CONFIG_DIR_ENV, dir.path());

        let settings = VerifierSettings::load().unwrap();
        assert_eq!(settings.relying_party, RelyingPartySettings::default());

        clean_env_vars();
    }

    #[test]
    fn test_trust_root_sources() {
        let der = self_signed_der();
        let dir = tempfile::tempdir().unwrap();

        let inline = TrustRootSettings {
            format: AttestationFormat::Packed,
            certificate: Some(general_purpose::STANDARD.encode(&der)),
            path: None,
            intermediate: false,
        };
        assert_eq!(inline.load_der().unwrap(), vec![der.clone()]);

        let der_path = dir.path().join("root.der");
        fs::write(&der_path, &der).unwrap();
        let from_der = TrustRootSettings {
            certificate: None,
            path: Some(der_path.to_string_lossy().into_owned()),
            ..inline.clone()
        };
        assert_eq!(from_der.load_der().unwrap(), vec![der.clone()]);

        let pem = openssl::x509::X509::from_der(&der).unwrap().to_pem().unwrap();
        let pem_path = dir.path().join("roots.pem");
        fs::write(&pem_path, [pem.clone(), pem].concat()).unwrap();
        let from_pem = TrustRootSettings {
            certificate: None,
            path: Some(pem_path.to_string_lossy().into_owned()),
            ..inline.clone()
        };
        assert_eq!(from_pem.load_der().unwrap(), vec![der.clone(), der]);
    }

    #[test]
    fn test_trust_root_errors() {
        let both = TrustRootSettings {
            format: AttestationFormat::Tpm,
            certificate: Some("MAA=".to_string()),
            path: Some("/nonexistent".to_string()),
            intermediate: false,
        };
        assert_eq!(both.load_der().unwrap_err().kind(), ErrorKind::Configuration);

        let garbage = TrustRootSettings {
            certificate: Some("MAA=".to_string()),
            path: None,
            ..both.clone()
        };
        assert_eq!(garbage.load_der().unwrap_err().kind(), ErrorKind::Configuration);

        let missing = TrustRootSettings {
            certificate: None,
            path: Some("/nonexistent/root.pem".to_string()),
            ..both
        };
        assert_eq!(missing.load_der().unwrap_err().kind(), ErrorKind::Configuration);
    }
}
