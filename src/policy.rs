use std::collections::BTreeMap;
use std::fmt;

use tracing::info;

use crate::config::{InjectionStrategy, PolicyConfig};
use crate::error::Error;

/// Output-only marker that an object already has a timezone injected.
pub const INJECTED_ANNOTATION: &str = "k8tz.io/injected";
pub const TIMEZONE_ANNOTATION: &str = "k8tz.io/timezone";
pub const STRATEGY_ANNOTATION: &str = "k8tz.io/strategy";
pub const INJECT_ANNOTATION: &str = "k8tz.io/inject";

pub type Annotations = BTreeMap<String, String>;

/// Timezone and strategy to inject into one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectivePolicy {
    pub timezone: String,
    pub strategy: InjectionStrategy,
}

impl EffectivePolicy {
    /// Static policy used when there is no cluster context to consult.
    pub fn from_config(config: &PolicyConfig) -> Self {
        Self {
            timezone: config.timezone.clone(),
            strategy: config.strategy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyInjected,
    DisabledOnObject,
    DisabledOnNamespace,
    DisabledByDefault,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::AlreadyInjected => "already_injected",
            SkipReason::DisabledOnObject => "disabled_on_object",
            SkipReason::DisabledOnNamespace => "disabled_on_namespace",
            SkipReason::DisabledByDefault => "disabled_by_default",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SkipReason::AlreadyInjected => "object is already injected",
            SkipReason::DisabledOnObject => "injection is explicitly disabled on the object",
            SkipReason::DisabledOnNamespace => "injection is explicitly disabled on the namespace",
            SkipReason::DisabledByDefault => {
                "no other instruction and injection is disabled by default"
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Skip(SkipReason),
    Inject(EffectivePolicy),
}

/// Boolean string parsing for the injected marker: `1`, `t`, `true` in any case.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "t" | "true" => Some(true),
        "0" | "f" | "false" => Some(false),
        _ => None,
    }
}

pub fn is_injected(annotations: Option<&Annotations>) -> bool {
    annotations
        .and_then(|a| a.get(INJECTED_ANNOTATION))
        .and_then(|v| parse_bool(v))
        .unwrap_or(false)
}

fn lookup<'a>(annotations: Option<&'a Annotations>, key: &str) -> Option<&'a str> {
    annotations.and_then(|a| a.get(key)).map(String::as_str)
}

/// Computes the policy for one object from its own annotations, its namespace's
/// annotations and the configured defaults. The first explicit setting wins.
pub fn resolve(
    object: Option<&Annotations>,
    namespace: Option<&Annotations>,
    config: &PolicyConfig,
    details: &str,
) -> Result<Resolution, Error> {
    resolve_with(object, namespace, config, details, true)
}

/// Like [`resolve`], but the strategy annotation is never read: a CronJob only
/// gets `spec.timeZone`, so it always carries the configured strategy.
pub fn resolve_cron_job(
    object: Option<&Annotations>,
    namespace: Option<&Annotations>,
    config: &PolicyConfig,
    details: &str,
) -> Result<Resolution, Error> {
    resolve_with(object, namespace, config, details, false)
}

fn resolve_with(
    object: Option<&Annotations>,
    namespace: Option<&Annotations>,
    config: &PolicyConfig,
    details: &str,
    strategy_from_annotations: bool,
) -> Result<Resolution, Error> {
    if is_injected(object) {
        return Ok(Resolution::Skip(SkipReason::AlreadyInjected));
    }

    // Only the literal "false" disables injection; any other value counts as
    // an explicit request and stops the lookup chain.
    if let Some(value) = lookup(object, INJECT_ANNOTATION) {
        if value == "false" {
            return Ok(Resolution::Skip(SkipReason::DisabledOnObject));
        }
    } else if let Some(value) = lookup(namespace, INJECT_ANNOTATION) {
        if value == "false" {
            return Ok(Resolution::Skip(SkipReason::DisabledOnNamespace));
        }
    } else if !config.inject_by_default {
        return Ok(Resolution::Skip(SkipReason::DisabledByDefault));
    }

    let timezone = if let Some(value) = lookup(object, TIMEZONE_ANNOTATION) {
        info!(object = %details, timezone = %value, "explicit timezone requested on object annotation");
        value.to_string()
    } else if let Some(value) = lookup(namespace, TIMEZONE_ANNOTATION) {
        info!(object = %details, timezone = %value, "explicit timezone requested on namespace annotation");
        value.to_string()
    } else {
        config.timezone.clone()
    };

    let strategy = if !strategy_from_annotations {
        config.strategy
    } else if let Some(value) = lookup(object, STRATEGY_ANNOTATION) {
        info!(object = %details, strategy = %value, "explicit injection strategy requested on object annotation");
        value.parse()?
    } else if let Some(value) = lookup(namespace, STRATEGY_ANNOTATION) {
        info!(object = %details, strategy = %value, "explicit injection strategy requested on namespace annotation");
        value.parse()?
    } else {
        config.strategy
    };

    Ok(Resolution::Inject(EffectivePolicy { timezone, strategy }))
}
