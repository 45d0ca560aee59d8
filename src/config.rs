//! Recognised configuration shapes. Parsing the files themselves (yaml,
//! env overrides, ...) belongs to the loader around this core; these types
//! define the contract and the startup validation.

use serde::{Deserialize, Serialize};

fn default_timeout_ms() -> u64 {
    2000
}

fn default_cpu_threshold() -> i64 {
    900
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Dev,
    Test,
    Rt,
    Pre,
    #[default]
    Pro,
}

/// Common service settings shared by RPC and REST servers.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServiceConf {
    pub name: String,
    pub mode: Mode,
    pub log: LogConf,
    pub telemetry: Option<TelemetryConf>,
    pub dev_server: Option<DevServerConf>,
}

impl ServiceConf {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Missing("name"));
        }

        Ok(())
    }
}

/// Consumed by the logging setup around the core; recognised here so a
/// service file round-trips.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct LogConf {
    pub level: String,
    pub mode: String,
    pub path: String,
}

impl Default for LogConf {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            mode: "console".to_string(),
            path: "logs".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct TelemetryConf {
    pub name: String,
    pub endpoint: String,
    pub sampler: f64,
    pub batcher: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct DevServerConf {
    pub host: String,
    pub port: u16,
    pub metrics_path: String,
    pub health_path: String,
}

impl Default for DevServerConf {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 6060,
            metrics_path: "/metrics".to_string(),
            health_path: "/healthz".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct EtcdConf {
    pub hosts: Vec<String>,
    pub key: String,
    pub id: Option<i64>,
    pub user: Option<String>,
    pub pass: Option<String>,
}

impl EtcdConf {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hosts.is_empty() {
            return Err(ConfigError::Missing("etcd.hosts"));
        }
        if self.key.is_empty() {
            return Err(ConfigError::Missing("etcd.key"));
        }

        Ok(())
    }
}

/// Location of the store backing the app/token auth interceptor, which
/// itself lives outside this core.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct RedisConf {
    pub host: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub pass: Option<String>,
    pub tls: bool,
    pub key: String,
}

impl Default for RedisConf {
    fn default() -> Self {
        Self {
            host: String::new(),
            kind: "node".to_string(),
            pass: None,
            tls: false,
            key: String::new(),
        }
    }
}

impl RedisConf {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::Missing("redis.host"));
        }
        if self.key.is_empty() {
            return Err(ConfigError::Missing("redis.key"));
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RpcServerConf {
    #[serde(flatten)]
    pub service: ServiceConf,
    pub listen_on: String,
    pub etcd: Option<EtcdConf>,
    pub auth: bool,
    pub strict_control: bool,
    /// Handler deadline in milliseconds; 0 disables the timeout layer.
    pub timeout: u64,
    /// Shedding threshold in per-mille of the CPU quota; 0 disables.
    pub cpu_threshold: i64,
    pub redis: Option<RedisConf>,
    pub health: bool,
}

impl Default for RpcServerConf {
    fn default() -> Self {
        Self {
            service: ServiceConf::default(),
            listen_on: String::new(),
            etcd: None,
            auth: false,
            strict_control: false,
            timeout: default_timeout_ms(),
            cpu_threshold: default_cpu_threshold(),
            redis: None,
            health: default_true(),
        }
    }
}

impl RpcServerConf {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.service.validate()?;
        if self.listen_on.is_empty() {
            return Err(ConfigError::Missing("listenOn"));
        }
        if !(0..=1000).contains(&self.cpu_threshold) {
            return Err(ConfigError::Invalid {
                field: "cpuThreshold",
                reason: "must be within [0, 1000]",
            });
        }
        if let Some(etcd) = &self.etcd {
            etcd.validate()?;
        }
        if self.auth && self.redis.is_none() {
            return Err(ConfigError::Missing("redis"));
        }
        if let Some(redis) = &self.redis {
            redis.validate()?;
        }

        Ok(())
    }

    /// Whether the server registers itself with the coordinator.
    pub fn has_etcd(&self) -> bool {
        self.etcd.is_some()
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct RpcClientConf {
    pub etcd: Option<EtcdConf>,
    pub endpoints: Vec<String>,
    pub target: String,
    pub app: Option<String>,
    pub token: Option<String>,
    pub timeout: u64,
    /// Dial without blocking on the first resolved address set.
    pub non_block: bool,
    pub middlewares: ClientMiddlewaresConf,
}

impl Default for RpcClientConf {
    fn default() -> Self {
        Self {
            etcd: None,
            endpoints: Vec::new(),
            target: String::new(),
            app: None,
            token: None,
            timeout: default_timeout_ms(),
            non_block: false,
            middlewares: ClientMiddlewaresConf::default(),
        }
    }
}

impl RpcClientConf {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let discovery_sources = usize::from(self.etcd.is_some())
            + usize::from(!self.endpoints.is_empty())
            + usize::from(!self.target.is_empty());
        if discovery_sources == 0 {
            return Err(ConfigError::Missing("etcd | endpoints | target"));
        }
        if let Some(etcd) = &self.etcd {
            etcd.validate()?;
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct ClientMiddlewaresConf {
    pub trace: bool,
    pub duration: bool,
    pub prometheus: bool,
    pub breaker: bool,
    pub timeout: bool,
}

impl Default for ClientMiddlewaresConf {
    fn default() -> Self {
        Self {
            trace: true,
            duration: true,
            prometheus: true,
            breaker: true,
            timeout: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct MiddlewaresConf {
    pub trace: bool,
    pub log: bool,
    pub prometheus: bool,
    pub max_conns: bool,
    pub breaker: bool,
    pub shedding: bool,
    pub timeout: bool,
    pub recover: bool,
    pub metrics: bool,
    pub max_bytes: bool,
    pub gunzip: bool,
}

impl Default for MiddlewaresConf {
    fn default() -> Self {
        Self {
            trace: true,
            log: true,
            prometheus: true,
            max_conns: true,
            breaker: true,
            shedding: true,
            timeout: true,
            recover: true,
            metrics: true,
            max_bytes: true,
            gunzip: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RestConf {
    #[serde(flatten)]
    pub service: ServiceConf,
    pub host: String,
    pub port: u16,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    pub max_conns: usize,
    pub max_bytes: u64,
    pub timeout: u64,
    pub cpu_threshold: i64,
    pub middlewares: MiddlewaresConf,
    pub signature: Option<SignatureConf>,
}

impl Default for RestConf {
    fn default() -> Self {
        Self {
            service: ServiceConf::default(),
            host: "0.0.0.0".to_string(),
            port: 8080,
            cert_file: None,
            key_file: None,
            max_conns: 10000,
            max_bytes: 1 << 20,
            timeout: 3000,
            cpu_threshold: default_cpu_threshold(),
            middlewares: MiddlewaresConf::default(),
            signature: None,
        }
    }
}

impl RestConf {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.service.validate()?;
        if self.port == 0 {
            return Err(ConfigError::Missing("port"));
        }
        if self.cert_file.is_some() != self.key_file.is_some() {
            return Err(ConfigError::Invalid {
                field: "certFile/keyFile",
                reason: "both or neither must be set",
            });
        }
        if !(0..=1000).contains(&self.cpu_threshold) {
            return Err(ConfigError::Invalid {
                field: "cpuThreshold",
                reason: "must be within [0, 1000]",
            });
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct SignatureConf {
    pub strict: bool,
    pub expire: u64,
    pub private_keys: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GatewayConf {
    #[serde(flatten)]
    pub rest: RestConf,
    pub upstreams: Vec<UpstreamConf>,
}

impl Default for GatewayConf {
    fn default() -> Self {
        Self {
            rest: RestConf::default(),
            upstreams: Vec::new(),
        }
    }
}

impl GatewayConf {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rest.validate()?;
        if self.upstreams.is_empty() {
            return Err(ConfigError::Missing("upstreams"));
        }
        for upstream in &self.upstreams {
            upstream.grpc.validate()?;
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct UpstreamConf {
    pub grpc: RpcClientConf,
    pub proto_sets: Vec<String>,
    pub mappings: Vec<RouteMapping>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct RouteMapping {
    pub method: String,
    pub path: String,
    pub rpc_path: String,
}

#[derive(Clone, Copy, Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required config field: {0}")]
    Missing(&'static str),
    #[error("invalid config field {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}
