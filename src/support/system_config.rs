//-
// Copyright (c) 2020, 2026, Jason Lingle
//
// This file is part of Rookery.
//
// Rookery is free software: you can redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Rookery is distributed in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Rookery. If not, see <http://www.gnu.org/licenses/>.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The system-wide configuration for Rookery.
///
/// This is stored in a file named `rookery.toml` under the Rookery system
/// root, which is typically `/etc/rookery` or `/usr/local/etc/rookery`.
///
/// Relative paths anywhere in the configuration are interpreted relative to
/// the system root.
#[derive(Clone, Debug, Deserialize, Serialize, Default)]
pub struct SystemConfig {
    /// How this server names itself and which mail it considers local.
    pub identity: IdentityConfig,

    /// Where messages and metadata are kept.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Configuration for TLS.
    ///
    /// If absent, STARTTLS is not offered on any protocol.
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    #[serde(default)]
    pub smtp: SmtpConfig,

    #[serde(default)]
    pub imap: ImapConfig,

    #[serde(default)]
    pub managesieve: ManageSieveConfig,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub dkim: DkimConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub dnsbl: DnsblConfig,

    #[serde(default)]
    pub greylist: GreylistConfig,

    #[serde(default)]
    pub spam: SpamConfig,

    #[serde(default)]
    pub delivery: DeliveryConfig,

    #[serde(default)]
    pub backup: BackupConfig,
}

impl SystemConfig {
    /// Check for configurations which parse but cannot possibly work.
    pub fn validate(&self) -> Result<(), String> {
        if self.identity.domain.is_empty() {
            return Err("identity.domain must be set".to_owned());
        }

        if self.http.jwt_secret.is_empty() {
            return Err("http.jwt_secret must be set".to_owned());
        }

        if 0 == self.smtp.max_size {
            return Err("smtp.max_size must be greater than 0".to_owned());
        }

        if self.storage.db_path.as_os_str().is_empty()
            || self.storage.blob_path.as_os_str().is_empty()
        {
            return Err(
                "storage.db_path and storage.blob_path must be set".to_owned()
            );
        }

        if self.dkim.private_key.as_os_str().is_empty() {
            return Err("dkim.private_key must be set".to_owned());
        }

        Ok(())
    }

    /// Make every relative path in the configuration relative to `root`.
    pub fn resolve_paths(&mut self, root: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = root.join(&*p);
            }
        };

        resolve(&mut self.storage.db_path);
        resolve(&mut self.storage.blob_path);
        resolve(&mut self.dkim.private_key);
        resolve(&mut self.backup.location);
        if let Some(ref mut tls) = self.tls {
            resolve(&mut tls.private_key);
            resolve(&mut tls.certificate_chain);
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// The primary mail domain. Mail to this domain (and to any domain added
    /// with the domain table) is accepted for local delivery.
    pub domain: String,
    /// The host name to report in greetings and `Received` headers.
    ///
    /// If unset, the system host name is used.
    pub host_name: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// The SQLite database holding all metadata.
    pub db_path: PathBuf,
    /// The root of the date-sharded tree of compressed message bodies.
    pub blob_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: "rookery.sqlite".into(),
            blob_path: "blobs".into(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, Default)]
pub struct TlsConfig {
    /// The path to the TLS private key, which must be in PEM format.
    pub private_key: PathBuf,
    /// The path to the TLS certificate chain, which must be in PEM format.
    pub certificate_chain: PathBuf,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub port: u16,
    /// The maximum size of a message body in bytes, after dot-unstuffing.
    ///
    /// A message of exactly this size is accepted.
    pub max_size: u64,
    /// The maximum number of recipients in one transaction.
    pub max_recipients: usize,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            port: 25,
            max_size: 10 * 1024 * 1024,
            max_recipients: 50,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ImapConfig {
    pub port: u16,
    /// Whether `LOGIN` and `AUTHENTICATE` are permitted over cleartext.
    pub allow_insecure_auth: bool,
    /// The storage quota assigned to new users, in bytes.
    pub default_quota: u64,
}

impl Default for ImapConfig {
    fn default() -> Self {
        Self {
            port: 143,
            allow_insecure_auth: true,
            default_quota: 1024 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ManageSieveConfig {
    pub port: u16,
    pub max_script_size: u64,
}

impl Default for ManageSieveConfig {
    fn default() -> Self {
        Self {
            port: 4190,
            max_script_size: 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    pub port: u16,
    /// The HMAC key used to sign API tokens.
    pub jwt_secret: String,
    pub token_lifetime_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: 8443,
            jwt_secret: String::new(),
            token_lifetime_secs: 86400,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct BackupConfig {
    /// The directory under which each backup gets its own
    /// `backup-YYYYMMDD-HHMMSS` directory.
    pub location: PathBuf,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            location: "backups".into(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct DkimConfig {
    pub selector: String,
    /// PEM-encoded RSA private key used to sign outbound mail.
    pub private_key: PathBuf,
}

impl Default for DkimConfig {
    fn default() -> Self {
        Self {
            selector: "default".to_owned(),
            private_key: "dkim.pem".into(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Connections and recipients allowed per IP within one window.
    pub count: u32,
    pub window_secs: u64,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            count: 100,
            window_secs: 3600,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DnsblConfig {
    /// DNS blocklist zones, such as `zen.spamhaus.org`.
    pub zones: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct GreylistConfig {
    pub enabled: bool,
    /// How long a new triplet must wait before it is accepted.
    pub retry_delay_secs: u64,
    /// How long a triplet is remembered after it was last seen.
    pub expiration_secs: u64,
    pub prune_interval_secs: u64,
}

impl GreylistConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn expiration(&self) -> Duration {
        Duration::from_secs(self.expiration_secs)
    }
}

impl Default for GreylistConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retry_delay_secs: 300,
            expiration_secs: 86400,
            prune_interval_secs: 3600,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SpamConfig {
    pub enabled: bool,
    /// Messages scoring at least this much are refused. 0 disables.
    pub reject_score: f64,
    /// Messages scoring at least this much are marked as spam and filed
    /// into Junk. 0 disables.
    pub header_score: f64,
}

impl Default for SpamConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reject_score: 0.0,
            header_score: 5.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DaneMode {
    /// Don't look up TLSA records at all.
    Off,
    /// Look up TLSA records and log the outcome, but never block delivery.
    Advisory,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// The number of concurrent delivery workers.
    pub workers: usize,
    pub poll_interval_secs: u64,
    /// The deadline for a complete attempt against one MX.
    pub attempt_timeout_secs: u64,
    /// The remote SMTP port. Only changed for testing.
    pub port: u16,
    pub dane: DaneMode,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().max(1),
            poll_interval_secs: 5,
            attempt_timeout_secs: 120,
            port: 25,
            dane: DaneMode::Advisory,
        }
    }
}
