use std::fmt::Formatter;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use hex::FromHex;
use serde::de::{Error, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::transport::{Backoff, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_WAIT};

const CONFIG_FILE: &str = "config.toml";
const KEYS_FILE: &str = "keys.json";
const KEYSYNC_DIR: &str = ".keysync";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(serialize_with = "serialize_url")]
    #[serde(deserialize_with = "deserialize_url")]
    pub worker_url: reqwest::Url,
    pub keys_file: PathBuf,
    /// Applied to each HTTP request. Unbounded if absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout: Option<Duration>,
    #[serde(default)]
    pub retry: RetryConfig,
    pub attestation: AttestationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub max_wait: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_wait: DEFAULT_MAX_WAIT,
        }
    }
}

/// What a worker must prove it is running
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttestationConfig {
    /// Hex encoded code measurement, for the transparent backend
    #[serde(default)]
    pub measurement: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tdx: Option<TdxMeasurements>,
}

/// Hex encoded TDX measurement registers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TdxMeasurements {
    pub mrtd: String,
    pub rtmr0: String,
    pub rtmr1: String,
}

#[derive(Debug, Clone, Default, clap::Args)]
pub struct ConfigArgs {
    #[arg(
        short,
        long,
        value_name = "URL",
        help = "The attestation endpoint of the worker enclave"
    )]
    pub worker_url: Option<reqwest::Url>,
    #[arg(short, long, value_name = "PATH", help = "JSON file holding the keys to share")]
    pub keys_file: Option<PathBuf>,
    #[arg(long, help = "How often to request an attestation before giving up")]
    pub max_attempts: Option<u32>,
    #[arg(
        long,
        value_name = "SECONDS",
        help = "Upper bound on the wait between two attempts"
    )]
    pub max_wait: Option<u64>,
    #[arg(long, value_name = "MILLISECONDS", help = "Timeout of each HTTP request")]
    pub request_timeout: Option<u64>,
    #[arg(
        short,
        long,
        value_name = "HEX",
        help = "Expected code measurement of the worker"
    )]
    pub measurement: Option<String>,
    #[arg(long, value_name = "HEX", help = "Expected MRTD of a TDX worker")]
    pub mrtd: Option<String>,
    #[arg(long, value_name = "HEX", help = "Expected RTMR0 of a TDX worker")]
    pub rtmr0: Option<String>,
    #[arg(long, value_name = "HEX", help = "Expected RTMR1 of a TDX worker")]
    pub rtmr1: Option<String>,
}

impl Config {
    /// Load the config file from the keysync directory
    pub fn load() -> std::io::Result<Self> {
        Self::load_from(&keysync_dir()?.join(CONFIG_FILE))
    }

    pub fn load_from(path: &Path) -> std::io::Result<Self> {
        let conf: Self = toml::from_str(&std::fs::read_to_string(path)?).map_err(|e| {
            std::io::Error::new(
                ErrorKind::InvalidData,
                format!("Could not parse config file: {e}"),
            )
        })?;
        conf.validate()?;
        Ok(conf)
    }

    fn validate(&self) -> std::io::Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "At least one attempt must be allowed",
            ));
        }
        Ok(())
    }

    /// Build a config from CLI arguments alone. A worker URL is required,
    /// everything else falls back to defaults.
    pub fn init(args: ConfigArgs) -> std::io::Result<Self> {
        let Some(worker_url) = args.worker_url.clone() else {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "No config file found and no worker URL given",
            ));
        };
        let mut conf = Self {
            worker_url,
            keys_file: keysync_dir()?.join(KEYS_FILE),
            request_timeout: None,
            retry: RetryConfig::default(),
            attestation: AttestationConfig::default(),
        };
        conf.apply(args)?;
        Ok(conf)
    }

    /// Overwrite the config with the CLI arguments present. On error the
    /// config is left untouched.
    pub fn apply(&mut self, args: ConfigArgs) -> std::io::Result<()> {
        let mut next = self.clone();
        if let Some(url) = args.worker_url {
            next.worker_url = url;
        }
        if let Some(path) = args.keys_file {
            next.keys_file = path;
        }
        if let Some(attempts) = args.max_attempts {
            next.retry.max_attempts = attempts;
        }
        if let Some(wait) = args.max_wait {
            next.retry.max_wait = Duration::from_secs(wait);
        }
        if let Some(t) = args.request_timeout {
            next.request_timeout = Some(Duration::from_millis(t));
        }
        if let Some(m) = args.measurement {
            next.attestation.measurement = m;
        }
        match (args.mrtd, args.rtmr0, args.rtmr1) {
            (None, None, None) => {}
            (mrtd, rtmr0, rtmr1) => {
                let current = self.attestation.tdx.as_ref();
                let pick = |new: Option<String>, old: Option<&String>| {
                    new.or_else(|| old.cloned()).ok_or_else(|| {
                        std::io::Error::new(
                            ErrorKind::InvalidInput,
                            "MRTD, RTMR0 and RTMR1 must all be configured",
                        )
                    })
                };
                next.attestation.tdx = Some(TdxMeasurements {
                    mrtd: pick(mrtd, current.map(|t| &t.mrtd))?,
                    rtmr0: pick(rtmr0, current.map(|t| &t.rtmr0))?,
                    rtmr1: pick(rtmr1, current.map(|t| &t.rtmr1))?,
                });
            }
        }
        next.validate()?;
        *self = next;
        Ok(())
    }

    /// First try to load the config file. If that succeeds, overwrite the config
    /// with the CLI args present and persist it. If loading fails, create a config
    /// from the CLI args and persist it.
    ///
    /// Returns the final config.
    pub fn load_or_init(args: ConfigArgs) -> std::io::Result<Self> {
        let conf = match Self::load() {
            Ok(mut conf) => {
                conf.apply(args)?;
                conf
            }
            Err(e) => {
                tracing::warn!("Could not load config file: {e}");
                let conf = Self::init(args)?;
                tracing::info!("New config created.");
                conf
            }
        };
        conf.save()?;
        Ok(conf)
    }

    /// Save the config file
    pub fn save(&self) -> std::io::Result<()> {
        let dir = keysync_dir()?;
        std::fs::create_dir_all(&dir)?;
        self.save_to(&dir.join(CONFIG_FILE))
    }

    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        let contents = toml::to_string(self)
            .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;
        std::fs::write(path, contents)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.retry.max_attempts, self.retry.max_wait)
    }

    /// The expected code measurement of the transparent backend
    pub fn measurement(&self) -> std::io::Result<[u8; 32]> {
        <[u8; 32]>::from_hex(&self.attestation.measurement).map_err(|e| {
            std::io::Error::new(
                ErrorKind::InvalidData,
                format!("Invalid measurement in config: {e}"),
            )
        })
    }
}

pub fn keysync_dir() -> std::io::Result<PathBuf> {
    home::home_dir()
        .map(|home| home.join(KEYSYNC_DIR))
        .ok_or_else(|| std::io::Error::new(ErrorKind::NotFound, "Could not find home directory"))
}

fn serialize_url<S>(url: &reqwest::Url, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    s.serialize_str(url.as_str())
}

fn deserialize_url<'de, D>(des: D) -> Result<reqwest::Url, D::Error>
where
    D: Deserializer<'de>,
{
    struct UrlVisitor;
    impl Visitor<'_> for UrlVisitor {
        type Value = reqwest::Url;

        fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
            formatter.write_str("A valid URL")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: Error,
        {
            reqwest::Url::from_str(v).map_err(|e| E::custom(format!("Could not parse url: {e}")))
        }
    }
    des.deserialize_str(UrlVisitor)
}
