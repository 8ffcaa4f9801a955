//! Configuration handling for the multi-backend MCP server.
//!
//! Server options come from CLI arguments with environment fallbacks. Backends
//! come from two places:
//!
//! - `DB_<NAME>_*` environment variables, one group per backend;
//! - `--database name=connection_string` arguments.
//!
//! A backend whose configuration is broken is reported and skipped; the rest
//! still start.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use url::Url;

use crate::models::connection::DEFAULT_ACQUIRE_TIMEOUT_SECS;
use crate::models::query::MAX_QUERY_LENGTH;
use crate::models::{
    BackendType, ConnectionDescriptor, ConnectionDescriptorError, ConnectionTarget,
    DEFAULT_ROW_LIMIT, MAX_ROW_LIMIT, SslMode, SslOptions,
};
use crate::tools::sql_validator::QueryPolicy;

pub const ENV_PREFIX: &str = "DB_";

/// Errors raised while turning configuration into backend descriptors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Backend '{name}': unknown type '{value}' (expected postgres, mysql, sqlite or db2)")]
    UnknownType { name: String, value: String },

    #[error("Backend '{name}': missing {var}")]
    MissingField { name: String, var: String },

    #[error("Backend '{name}': invalid value '{value}' for {var}: {reason}")]
    InvalidValue {
        name: String,
        var: String,
        value: String,
        reason: String,
    },

    #[error("Backend '{name}': {source}")]
    InvalidDescriptor {
        name: String,
        #[source]
        source: ConnectionDescriptorError,
    },

    #[error("Invalid --database argument: {0}")]
    InvalidArgument(String),

    #[error("No valid backend configured. Set DB_<NAME>_TYPE and related variables, or pass --database name=connection_string")]
    NoBackends,
}

/// Configuration for the multi-backend MCP server.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "multidb-mcp-server",
    about = "MCP server giving AI assistants safe access to PostgreSQL, MySQL, SQLite and DB2",
    version,
    author
)]
pub struct Config {
    /// Additional backends as "name=connection_string".
    /// Read-only unless ?writable=true; ?pool_size= and ?pool_timeout= are also accepted.
    /// Can be specified multiple times.
    #[arg(
        short = 'd',
        long = "database",
        value_name = "NAME=URL",
        env = "MCP_DATABASE",
        value_delimiter = ','
    )]
    pub databases: Vec<String>,

    /// Row limit applied when a query does not ask for one
    #[arg(long, default_value_t = DEFAULT_ROW_LIMIT, env = "MCP_DEFAULT_ROW_LIMIT")]
    pub default_row_limit: u32,

    /// Hard ceiling on rows returned by one query
    #[arg(long, default_value_t = MAX_ROW_LIMIT, env = "MCP_MAX_ROW_LIMIT")]
    pub max_row_limit: u32,

    /// Maximum query length in characters
    #[arg(long, default_value_t = MAX_QUERY_LENGTH, env = "MCP_MAX_QUERY_LENGTH")]
    pub max_query_length: usize,

    /// Seconds to wait for a pooled connection, for backends that do not set DB_<NAME>_POOL_TIMEOUT
    #[arg(long, default_value_t = DEFAULT_ACQUIRE_TIMEOUT_SECS, env = "MCP_POOL_TIMEOUT")]
    pub pool_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "MCP_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "MCP_JSON_LOGS")]
    pub json_logs: bool,
}

impl Config {
    /// Parse configuration from command line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Create a default configuration (useful for testing).
    pub fn default_config() -> Self {
        Self {
            databases: Vec::new(),
            default_row_limit: DEFAULT_ROW_LIMIT,
            max_row_limit: MAX_ROW_LIMIT,
            max_query_length: MAX_QUERY_LENGTH,
            pool_timeout: DEFAULT_ACQUIRE_TIMEOUT_SECS,
            log_level: "info".to_string(),
            json_logs: false,
        }
    }

    pub fn pool_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.pool_timeout)
    }

    pub fn query_policy(&self) -> QueryPolicy {
        let max_row_limit = self.max_row_limit.max(1);
        QueryPolicy {
            default_row_limit: self.default_row_limit.clamp(1, max_row_limit),
            max_row_limit,
            max_query_length: self.max_query_length,
            ..QueryPolicy::default()
        }
    }

    /// Collect backends from `vars` and `--database` arguments.
    ///
    /// Returns every valid descriptor and every per-backend error.
    pub fn load_backends(
        &self,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> (Vec<ConnectionDescriptor>, Vec<ConfigError>) {
        let timeout = self.pool_timeout_duration();
        let mut descriptors = Vec::new();
        let mut errors = Vec::new();

        let from_env = load_descriptors_from_env(vars, timeout);
        let from_args = self
            .databases
            .iter()
            .map(|arg| parse_database_arg(arg, timeout));
        for result in from_env.into_iter().chain(from_args) {
            match result {
                Ok(descriptor) => descriptors.push(descriptor),
                Err(e) => errors.push(e),
            }
        }
        (descriptors, errors)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}

/// Build one descriptor per `DB_<NAME>_TYPE` variable, sorted by name.
///
/// Pure over `vars`, so callers pass `std::env::vars()` or a test map.
pub fn load_descriptors_from_env(
    vars: impl IntoIterator<Item = (String, String)>,
    default_timeout: Duration,
) -> Vec<Result<ConnectionDescriptor, ConfigError>> {
    let vars: HashMap<String, String> = vars
        .into_iter()
        .filter(|(k, _)| k.starts_with(ENV_PREFIX))
        .collect();

    let names: BTreeSet<&str> = vars
        .keys()
        .filter_map(|k| k.strip_prefix(ENV_PREFIX)?.strip_suffix("_TYPE"))
        .filter(|name| !name.is_empty())
        .collect();

    names
        .into_iter()
        .map(|name| EnvBackend { name, vars: &vars }.descriptor(default_timeout))
        .collect()
}

/// The `DB_<NAME>_*` variables of one backend.
struct EnvBackend<'a> {
    name: &'a str,
    vars: &'a HashMap<String, String>,
}

impl EnvBackend<'_> {
    fn var_name(&self, suffix: &str) -> String {
        format!("{ENV_PREFIX}{}_{suffix}", self.name)
    }

    fn get(&self, suffix: &str) -> Option<&str> {
        self.vars
            .get(&self.var_name(suffix))
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn require(&self, suffix: &str) -> Result<&str, ConfigError> {
        self.get(suffix).ok_or_else(|| ConfigError::MissingField {
            name: self.backend_name(),
            var: self.var_name(suffix),
        })
    }

    fn parse<T: FromStr>(&self, suffix: &str) -> Result<Option<T>, ConfigError>
    where
        T::Err: std::fmt::Display,
    {
        self.get(suffix)
            .map(|raw| {
                raw.parse::<T>().map_err(|e| ConfigError::InvalidValue {
                    name: self.backend_name(),
                    var: self.var_name(suffix),
                    value: raw.to_string(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    fn flag(&self, suffix: &str) -> Result<Option<bool>, ConfigError> {
        self.get(suffix)
            .map(|raw| {
                parse_bool(raw).ok_or_else(|| ConfigError::InvalidValue {
                    name: self.backend_name(),
                    var: self.var_name(suffix),
                    value: raw.to_string(),
                    reason: "expected true or false".to_string(),
                })
            })
            .transpose()
    }

    fn backend_name(&self) -> String {
        self.name.to_ascii_lowercase()
    }

    fn descriptor(&self, default_timeout: Duration) -> Result<ConnectionDescriptor, ConfigError> {
        let name = self.backend_name();
        let type_value = self.require("TYPE")?;
        let backend_type =
            BackendType::from_name(type_value).ok_or_else(|| ConfigError::UnknownType {
                name: name.clone(),
                value: type_value.to_string(),
            })?;

        let target = match self.get("CONNECTION_STRING") {
            Some(dsn) => ConnectionTarget::Dsn(dsn.to_string()),
            None if backend_type == BackendType::Sqlite => {
                let path = self
                    .get("PATH")
                    .or_else(|| self.get("DATABASE"))
                    .ok_or_else(|| ConfigError::MissingField {
                        name: name.clone(),
                        var: self.var_name("PATH"),
                    })?;
                ConnectionTarget::File {
                    path: PathBuf::from(path),
                }
            }
            None => ConnectionTarget::Network {
                host: self.get("HOST").unwrap_or("localhost").to_string(),
                port: self.parse::<u16>("PORT")?.or(backend_type.default_port()),
                database: self.require("DATABASE")?.to_string(),
            },
        };

        let mut descriptor = ConnectionDescriptor::new(&name, backend_type, target)
            .with_read_only(self.flag("READ_ONLY")?.unwrap_or(true))
            .with_acquire_timeout(
                self.parse::<u64>("POOL_TIMEOUT")?
                    .map_or(default_timeout, Duration::from_secs),
            );
        if let Some(size) = self.parse::<u32>("POOL_SIZE")? {
            descriptor = descriptor.with_pool_size(size);
        }
        if let Some(username) = self.get("USERNAME") {
            descriptor = descriptor
                .with_credentials(username, self.get("PASSWORD").map(str::to_string));
        }
        let ssl = SslOptions {
            mode: self.parse::<SslMode>("SSL_MODE")?.unwrap_or_default(),
            root_cert: self.get("SSL_ROOT_CERT").map(PathBuf::from),
        };
        descriptor = descriptor.with_ssl(ssl);
        if let Some(driver) = self.get("ODBC_DRIVER") {
            descriptor = descriptor.with_odbc_driver(driver);
        }

        descriptor
            .validate()
            .map_err(|source| ConfigError::InvalidDescriptor { name, source })?;
        Ok(descriptor)
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Option keys we extract from `--database` URL query parameters.
const ARG_OPTION_KEYS: &[&str] = &["writable", "pool_size", "pool_timeout"];

/// Parse a `--database` argument.
///
/// # Format
///
/// - `name=connection_string` - named backend, read-only by default
/// - `connection_string` - named after the database in the URL path
/// - `...?writable=true&pool_size=3&pool_timeout=10` - options, stripped before connecting
///
/// Keyword-style DB2 strings (`DATABASE=..;HOSTNAME=..;`) need an explicit
/// name and take no options.
pub fn parse_database_arg(
    arg: &str,
    default_timeout: Duration,
) -> Result<ConnectionDescriptor, ConfigError> {
    // Split name=url format (only if '=' before '://' and before any ';')
    let head_end = arg
        .find("://")
        .or_else(|| arg.find(';'))
        .unwrap_or(arg.len());
    let (explicit_name, dsn) = match arg[..head_end].find('=') {
        Some(idx) if !arg[..idx].contains(';') && is_name(&arg[..idx]) => {
            (Some(arg[..idx].trim()), arg[idx + 1..].trim())
        }
        _ => (None, arg.trim()),
    };

    let backend_type = BackendType::from_connection_string(dsn).ok_or_else(|| {
        ConfigError::InvalidArgument(format!(
            "cannot tell the backend type of '{}'",
            crate::models::connection::mask_credentials(dsn)
        ))
    })?;

    let (dsn, options, url_name) = match Url::parse(dsn) {
        Ok(mut url) => {
            let options = extract_options(&mut url, ARG_OPTION_KEYS);
            let url_name = db_name(&url);
            (url.to_string(), options, url_name)
        }
        Err(_) => (dsn.to_string(), HashMap::new(), None),
    };

    let name = explicit_name
        .map(str::to_ascii_lowercase)
        .or(url_name)
        .ok_or_else(|| {
            ConfigError::InvalidArgument("no backend name; use name=connection_string".into())
        })?;

    let invalid = |var: &str, value: &str, reason: String| ConfigError::InvalidValue {
        name: name.clone(),
        var: var.to_string(),
        value: value.to_string(),
        reason,
    };

    let mut descriptor = ConnectionDescriptor::new(&name, backend_type, ConnectionTarget::Dsn(dsn))
        .with_acquire_timeout(default_timeout);
    if let Some(raw) = options.get("writable") {
        let writable = parse_bool(raw)
            .ok_or_else(|| invalid("writable", raw, "expected true or false".into()))?;
        descriptor = descriptor.with_read_only(!writable);
    }
    if let Some(raw) = options.get("pool_size") {
        let size = raw
            .parse::<u32>()
            .map_err(|e: std::num::ParseIntError| invalid("pool_size", raw, e.to_string()))?;
        descriptor = descriptor.with_pool_size(size);
    }
    if let Some(raw) = options.get("pool_timeout") {
        let secs = raw
            .parse::<u64>()
            .map_err(|e: std::num::ParseIntError| invalid("pool_timeout", raw, e.to_string()))?;
        descriptor = descriptor.with_acquire_timeout(Duration::from_secs(secs));
    }

    descriptor
        .validate()
        .map_err(|source| ConfigError::InvalidDescriptor { name, source })?;
    Ok(descriptor)
}

fn is_name(s: &str) -> bool {
    let s = s.trim();
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Extract server options from URL query params, keeping others for the driver.
fn extract_options(url: &mut Url, keys: &[&str]) -> HashMap<String, String> {
    let mut opts = HashMap::new();
    let remaining: Vec<(String, String)> = url
        .query_pairs()
        .filter_map(|(k, v)| {
            let key_lower = k.to_ascii_lowercase();
            if keys.contains(&key_lower.as_str()) {
                opts.insert(key_lower, v.into_owned());
                None
            } else {
                Some((k.into_owned(), v.into_owned()))
            }
        })
        .collect();

    if remaining.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(remaining);
    }
    opts
}

fn db_name(url: &Url) -> Option<String> {
    url.path()
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .map(|s| s.trim_end_matches(".sqlite").trim_end_matches(".db"))
        .filter(|s| is_name(s))
        .map(str::to_ascii_lowercase)
}
