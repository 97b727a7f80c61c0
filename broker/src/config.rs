//! Layered configuration: a YAML file merged with `BROKER_`-prefixed
//! environment variables merged with CLI flags, validated as a single step
//! at startup.

use std::net::IpAddr;
use std::time::Duration;

use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

const UNSAFE_DEFAULT_PASSWORD: &str = "admin123";
const UNSAFE_DEFAULT_SECRET: &str = "change-me-in-production";

#[derive(Debug, Parser)]
#[command(name = "broker", about = "Reverse request broker")]
pub struct Args {
    /// Path to a YAML configuration file. Its absence is not an error.
    #[arg(short = 'f', long = "config", env = "BROKER_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Load and validate configuration, then exit without binding a listener.
    #[arg(long)]
    pub validate: bool,

    #[arg(long, env = "BROKER_PORT")]
    pub port: Option<u16>,

    #[arg(long, env = "BROKER_ADDRESS")]
    pub address: Option<IpAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub port: u16,
    pub address: IpAddr,

    pub require_auth: bool,
    pub admin_password: String,
    pub token_secret: String,
    #[serde(with = "humantime_serde")]
    pub token_lifetime: Duration,

    pub enable_rate_limit: bool,
    pub max_requests_per_minute: usize,
    pub max_connections_per_ip: usize,

    pub max_request_size: usize,

    pub enable_cors: bool,
    pub allowed_origins: Vec<String>,

    pub slug_whitelist: Vec<String>,

    pub log_filter: String,
    pub observability_retention_days: i64,
    pub stats_retention_days: i64,

    #[serde(with = "humantime_serde")]
    pub forward_deadline: Duration,
    #[serde(with = "humantime_serde")]
    pub queue_wait_deadline: Duration,
    #[serde(with = "humantime_serde")]
    pub shutdown_grace_period: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            address: IpAddr::from([0, 0, 0, 0]),
            require_auth: false,
            admin_password: UNSAFE_DEFAULT_PASSWORD.to_string(),
            token_secret: UNSAFE_DEFAULT_SECRET.to_string(),
            token_lifetime: Duration::from_secs(24 * 60 * 60),
            enable_rate_limit: true,
            max_requests_per_minute: 100,
            max_connections_per_ip: 10,
            max_request_size: 10 * 1024 * 1024,
            enable_cors: true,
            allowed_origins: vec!["*".to_string()],
            slug_whitelist: Vec::new(),
            log_filter: "info".to_string(),
            observability_retention_days: 7,
            stats_retention_days: 30,
            forward_deadline: Duration::from_secs(150),
            queue_wait_deadline: Duration::from_secs(30),
            shutdown_grace_period: Duration::from_secs(10),
        }
    }
}

impl Config {
    pub fn figment(args: &Args) -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Yaml::file(&args.config))
            .merge(Env::prefixed("BROKER_").split("__"))
    }

    pub fn load(args: &Args) -> std::result::Result<Self, figment::Error> {
        let mut config: Config = Self::figment(args).extract()?;

        if let Some(port) = args.port {
            config.port = port;
        }
        if let Some(address) = args.address {
            config.address = address;
        }

        config
            .validate()
            .map_err(|e| figment::Error::from(e.to_string()))?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.token_lifetime.is_zero() {
            return Err(Error::Internal("token_lifetime must be nonzero".to_string()));
        }

        if self.enable_rate_limit && (self.max_requests_per_minute == 0 || self.max_connections_per_ip == 0) {
            return Err(Error::Internal(
                "max_requests_per_minute and max_connections_per_ip must be nonzero when rate limiting is enabled"
                    .to_string(),
            ));
        }

        if self.max_request_size == 0 {
            return Err(Error::Internal("max_request_size must be nonzero".to_string()));
        }

        if self.enable_cors && self.allowed_origins.is_empty() {
            return Err(Error::Internal(
                "allowed_origins must be nonempty when CORS is enabled".to_string(),
            ));
        }

        if self.require_auth
            && (self.admin_password == UNSAFE_DEFAULT_PASSWORD || self.token_secret == UNSAFE_DEFAULT_SECRET)
        {
            return Err(Error::Internal(
                "require_auth is set but admin_password or token_secret is still at its built-in default"
                    .to_string(),
            ));
        }

        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn cors_allow_all(&self) -> bool {
        self.allowed_origins.iter().any(|o| o == "*")
    }
}
