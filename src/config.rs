use std::fmt;
use std::str::FromStr;

use clap::Args;
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::version;

pub const DEFAULT_TIMEZONE: &str = "UTC";
pub const DEFAULT_INIT_CONTAINER_NAME: &str = "k8tz";
pub const DEFAULT_HOST_PATH_PREFIX: &str = "/usr/share/zoneinfo";
pub const DEFAULT_LOCAL_TIME_PATH: &str = "/etc/localtime";

const ENV_PREFIX: &str = "K8TZ_";

/// How timezone data reaches the container filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum InjectionStrategy {
    /// TZif files already exist on the nodes and are mounted with a hostPath volume.
    #[serde(rename = "hostPath")]
    HostPath,
    /// A bootstrap init container copies TZif files into a shared emptyDir volume.
    #[default]
    #[serde(rename = "initContainer")]
    InitContainer,
}

impl InjectionStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            InjectionStrategy::HostPath => "hostPath",
            InjectionStrategy::InitContainer => "initContainer",
        }
    }
}

impl fmt::Display for InjectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InjectionStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hostPath" => Ok(InjectionStrategy::HostPath),
            "initContainer" => Ok(InjectionStrategy::InitContainer),
            other => Err(Error::UnknownStrategy(other.to_string())),
        }
    }
}

fn default_init_container_image() -> String {
    version::image()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub timezone: String,
    pub strategy: InjectionStrategy,
    pub inject_by_default: bool,
    pub init_container_name: String,
    pub init_container_image: String,
    pub init_container_verbose: bool,
    /// ResourceRequirements as a JSON document, empty for none.
    pub init_container_resources: String,
    pub host_path_prefix: String,
    pub local_time_path: String,
    pub cron_job_time_zone: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            timezone: DEFAULT_TIMEZONE.to_string(),
            strategy: InjectionStrategy::default(),
            inject_by_default: true,
            init_container_name: DEFAULT_INIT_CONTAINER_NAME.to_string(),
            init_container_image: default_init_container_image(),
            init_container_verbose: false,
            init_container_resources: String::new(),
            host_path_prefix: DEFAULT_HOST_PATH_PREFIX.to_string(),
            local_time_path: DEFAULT_LOCAL_TIME_PATH.to_string(),
            cron_job_time_zone: false,
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8443".to_string()
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_tls_cert_path() -> String {
    "/run/secrets/tls/tls.crt".to_string()
}

fn default_tls_key_path() -> String {
    "/run/secrets/tls/tls.key".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
    #[serde(default = "default_tls_cert_path")]
    pub tls_cert_path: String,
    #[serde(default = "default_tls_key_path")]
    pub tls_key_path: String,
    #[serde(default)]
    pub kube_config: Option<String>,
    #[serde(default)]
    pub policy: PolicyConfig,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            metrics_addr: default_metrics_addr(),
            tls_cert_path: default_tls_cert_path(),
            tls_key_path: default_tls_key_path(),
            kube_config: None,
            policy: PolicyConfig::default(),
        }
    }
}

fn base_figment(config_path: Option<&str>) -> Figment {
    let mut figment = Figment::from(Serialized::defaults(WebhookConfig::default()));
    if let Some(path) = config_path {
        figment = figment.merge(Yaml::file(path));
    }
    figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
}

impl PolicyConfig {
    /// Configuration for the offline transformer: file, then `K8TZ_POLICY__*`, then flags.
    pub fn load(config_path: Option<&str>, flags: &InjectFlags) -> Result<Self, Box<figment::Error>> {
        base_figment(config_path)
            .merge(Serialized::default("policy", flags))
            .extract_inner("policy")
            .map_err(Box::new)
    }
}

impl WebhookConfig {
    pub fn load(
        config_path: Option<&str>,
        server: &ServerFlags,
        policy: &WebhookPolicyFlags,
    ) -> Result<Self, Box<figment::Error>> {
        base_figment(config_path)
            .merge(Serialized::defaults(server))
            .merge(Serialized::default("policy", policy))
            .extract()
            .map_err(Box::new)
    }
}

/// Policy flags of the `inject` command. Unset flags leave lower layers untouched.
#[derive(Debug, Default, Clone, Args, Serialize)]
pub struct InjectFlags {
    /// Default timezone if not specified explicitly
    #[arg(short, long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,

    /// initContainer name
    #[arg(long)]
    #[serde(rename = "init_container_name", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// initContainer bootstrap image
    #[arg(short, long)]
    #[serde(rename = "init_container_image", skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// initContainer compute resources in JSON format
    #[arg(long)]
    #[serde(rename = "init_container_resources", skip_serializing_if = "Option::is_none")]
    pub resources: Option<String>,

    /// Default injection strategy if not specified explicitly (hostPath/initContainer)
    #[arg(short, long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<InjectionStrategy>,

    /// Location of TZif files on host machines
    #[arg(long = "hostpath")]
    #[serde(rename = "host_path_prefix", skip_serializing_if = "Option::is_none")]
    pub host_path: Option<String>,

    /// Mount path for TZif file on containers
    #[arg(short, long = "mountpath")]
    #[serde(rename = "local_time_path", skip_serializing_if = "Option::is_none")]
    pub mount_path: Option<String>,

    /// Enable CronJob injection through the native spec.timeZone field
    #[arg(long = "cronJobTimeZone", num_args = 0..=1, default_missing_value = "true")]
    #[serde(rename = "cron_job_time_zone", skip_serializing_if = "Option::is_none")]
    pub cron_job_time_zone: Option<bool>,
}

#[derive(Debug, Default, Clone, Args, Serialize)]
pub struct ServerFlags {
    /// TLS certificate file
    #[arg(long = "tls-crt")]
    #[serde(rename = "tls_cert_path", skip_serializing_if = "Option::is_none")]
    pub tls_cert: Option<String>,

    /// TLS key file
    #[arg(long = "tls-key")]
    #[serde(rename = "tls_key_path", skip_serializing_if = "Option::is_none")]
    pub tls_key: Option<String>,

    /// Webhook bind address
    #[arg(long)]
    #[serde(rename = "listen_addr", skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,

    /// Health and metrics bind address
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_addr: Option<String>,

    /// Path to kubeconfig file, in-cluster configuration when omitted
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kube_config: Option<String>,
}

/// Policy flags of the `webhook` command.
#[derive(Debug, Default, Clone, Args, Serialize)]
pub struct WebhookPolicyFlags {
    /// Default timezone if not specified explicitly
    #[arg(short, long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,

    /// initContainer name
    #[arg(long)]
    #[serde(rename = "init_container_name", skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,

    /// initContainer bootstrap image
    #[arg(long)]
    #[serde(rename = "init_container_image", skip_serializing_if = "Option::is_none")]
    pub bootstrap_image: Option<String>,

    /// Print more verbose logs inside the bootstrap initContainer
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    #[serde(rename = "init_container_verbose", skip_serializing_if = "Option::is_none")]
    pub bootstrap_verbose: Option<bool>,

    /// initContainer compute resources in JSON format
    #[arg(long)]
    #[serde(rename = "init_container_resources", skip_serializing_if = "Option::is_none")]
    pub bootstrap_resources: Option<String>,

    /// Location of zoneinfo on host machines
    #[arg(long = "hostPathPrefix")]
    #[serde(rename = "host_path_prefix", skip_serializing_if = "Option::is_none")]
    pub host_path_prefix: Option<String>,

    /// Mount path for TZif file on containers
    #[arg(long = "localTimePath")]
    #[serde(rename = "local_time_path", skip_serializing_if = "Option::is_none")]
    pub local_time_path: Option<String>,

    /// Default injection strategy if not specified explicitly (hostPath/initContainer)
    #[arg(short = 's', long = "injection-strategy")]
    #[serde(rename = "strategy", skip_serializing_if = "Option::is_none")]
    pub injection_strategy: Option<InjectionStrategy>,

    /// Whether injection is enabled by default or should be requested by annotation
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    #[serde(rename = "inject_by_default", skip_serializing_if = "Option::is_none")]
    pub inject: Option<bool>,

    /// Enable CronJob injection through the native spec.timeZone field
    #[arg(long = "cronJobTimeZone", num_args = 0..=1, default_missing_value = "true")]
    #[serde(rename = "cron_job_time_zone", skip_serializing_if = "Option::is_none")]
    pub cron_job_time_zone: Option<bool>,
}
