use json_patch::jsonptr::{Pointer, PointerBuf};
use json_patch::{AddOperation, PatchOperation, RemoveOperation};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::PolicyConfig;
use crate::error::Error;
use crate::kind::{ListObject, PodSpecView, ResourceKind, TemplatedObject, Workload};
use crate::policy::{EffectivePolicy, INJECTED_ANNOTATION, TIMEZONE_ANNOTATION};

/// Builds the JSON Patch operations that inject one timezone into a workload.
///
/// Holds no state between calls; the same generator can be shared by any number
/// of concurrent requests.
pub struct PatchGenerator<'a> {
    pub(crate) config: &'a PolicyConfig,
    pub(crate) policy: &'a EffectivePolicy,
}

/// `base` extended with unescaped `tokens`.
pub(crate) fn at(base: &Pointer, tokens: &[&str]) -> PointerBuf {
    let mut path = base.to_buf();
    for token in tokens {
        path.push_back(*token);
    }
    path
}

pub(crate) fn add(path: PointerBuf, value: Value) -> PatchOperation {
    PatchOperation::Add(AddOperation { path, value })
}

pub(crate) fn remove(path: PointerBuf) -> PatchOperation {
    PatchOperation::Remove(RemoveOperation { path })
}

pub(crate) fn to_value<T: Serialize>(value: &T) -> Result<Value, Error> {
    Ok(serde_json::to_value(value)?)
}

impl<'a> PatchGenerator<'a> {
    pub fn new(config: &'a PolicyConfig, policy: &'a EffectivePolicy) -> Self {
        Self { config, policy }
    }

    /// Patches for `workload`, rooted at `prefix` inside the enclosing document.
    pub fn generate(&self, workload: &Workload, prefix: &Pointer) -> Result<Vec<PatchOperation>, Error> {
        let patches = match workload {
            Workload::Pod(pod) => {
                let empty = PodSpecView::default();
                self.for_pod_spec(
                    pod.spec.as_ref().unwrap_or(&empty),
                    &at(prefix, &["spec"]),
                    &[(at(prefix, &["metadata"]), pod.metadata.as_ref())],
                )?
            }
            Workload::Deployment(object) | Workload::StatefulSet(object) => {
                self.for_templated(object, prefix)?
            }
            Workload::CronJob(cron_job) => {
                let mut patches = Vec::new();
                if self.config.cron_job_time_zone {
                    patches.push(add(
                        at(prefix, &["spec", "timeZone"]),
                        Value::String(self.policy.timezone.clone()),
                    ));
                    self.annotation_patches(
                        &at(prefix, &["metadata"]),
                        cron_job.metadata.as_ref(),
                        &mut patches,
                    );
                }
                patches
            }
            Workload::List(list) => self.expand_list(list, prefix)?,
        };

        debug!(
            kind = %workload.kind(),
            prefix = %prefix,
            patches = patches.len(),
            timezone = %self.policy.timezone,
            strategy = %self.policy.strategy,
            "generated patches"
        );

        Ok(patches)
    }

    fn for_templated(&self, object: &TemplatedObject, prefix: &Pointer) -> Result<Vec<PatchOperation>, Error> {
        let template = object.spec.as_ref().and_then(|s| s.template.as_ref());
        let empty = PodSpecView::default();
        let spec = template.and_then(|t| t.spec.as_ref()).unwrap_or(&empty);

        self.for_pod_spec(
            spec,
            &at(prefix, &["spec", "template", "spec"]),
            &[
                (at(prefix, &["metadata"]), object.metadata.as_ref()),
                (
                    at(prefix, &["spec", "template", "metadata"]),
                    template.and_then(|t| t.metadata.as_ref()),
                ),
            ],
        )
    }

    fn for_pod_spec(
        &self,
        spec: &PodSpecView,
        spec_path: &Pointer,
        metadata: &[(PointerBuf, Option<&ObjectMeta>)],
    ) -> Result<Vec<PatchOperation>, Error> {
        let mut patches = Vec::new();

        self.strategy_patches(spec, spec_path, &mut patches)?;
        self.environment_patches(spec, spec_path, &mut patches)?;
        for (path, meta) in metadata {
            self.annotation_patches(path, *meta, &mut patches);
        }

        Ok(patches)
    }

    /// Items of unknown kind are left alone; a decode failure on any item fails the list.
    fn expand_list(&self, list: &ListObject, prefix: &Pointer) -> Result<Vec<PatchOperation>, Error> {
        let mut patches = Vec::new();

        for (index, item) in list.items.iter().flatten().enumerate() {
            let kind = ResourceKind::sniff_value(item)?;
            if !kind.is_known() {
                debug!(index, kind = %kind, "skipping list item of unsupported kind");
                continue;
            }

            let workload = Workload::decode(&kind, item)?;
            let index = index.to_string();
            patches.extend(self.generate(&workload, &at(prefix, &["items", index.as_str()]))?);
        }

        Ok(patches)
    }

    fn annotation_patches(
        &self,
        meta_path: &Pointer,
        meta: Option<&ObjectMeta>,
        patches: &mut Vec<PatchOperation>,
    ) {
        let has_annotations = meta
            .and_then(|m| m.annotations.as_ref())
            .is_some_and(|a| !a.is_empty());

        if meta.is_none() {
            patches.push(add(meta_path.to_buf(), json!({})));
        }
        if !has_annotations {
            patches.push(add(at(meta_path, &["annotations"]), json!({})));
        }

        patches.push(add(
            at(meta_path, &["annotations", INJECTED_ANNOTATION]),
            Value::String("true".to_string()),
        ));
        patches.push(add(
            at(meta_path, &["annotations", TIMEZONE_ANNOTATION]),
            Value::String(self.policy.timezone.clone()),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InjectionStrategy;
    use serde_json::json;

    fn policy(timezone: &str, strategy: InjectionStrategy) -> EffectivePolicy {
        EffectivePolicy {
            timezone: timezone.to_string(),
            strategy,
        }
    }

    fn generate(config: &PolicyConfig, policy: &EffectivePolicy, object: Value) -> Result<Value, Error> {
        let kind = ResourceKind::sniff_value(&object)?;
        let workload = Workload::decode(&kind, &object)?;
        let patches = PatchGenerator::new(config, policy).generate(&workload, Pointer::root())?;
        Ok(serde_json::to_value(patches).unwrap())
    }

    #[test]
    fn test_annotation_keys_are_escaped() {
        assert_eq!(
            at(Pointer::root(), &["metadata", "annotations", "k8tz.io/timezone"]).to_string(),
            "/metadata/annotations/k8tz.io~1timezone"
        );
        assert_eq!(
            at(Pointer::root(), &["metadata", "annotations", "~test~"]).to_string(),
            "/metadata/annotations/~0test~0"
        );
    }

    #[test]
    fn test_pod_hostpath_full_sequence() {
        let config = PolicyConfig::default();
        let policy = policy("Asia/Jerusalem", InjectionStrategy::HostPath);
        let patches = generate(
            &config,
            &policy,
            json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {"name": "test"},
                "spec": {"containers": [{"name": "app", "image": "busybox"}]}
            }),
        )
        .unwrap();

        assert_eq!(
            patches,
            json!([
                {"op": "add", "path": "/spec/containers/0/volumeMounts", "value": []},
                {"op": "add", "path": "/spec/containers/0/volumeMounts/-", "value": {
                    "name": "k8tz", "mountPath": "/etc/localtime", "readOnly": true, "subPath": "Asia/Jerusalem"
                }},
                {"op": "add", "path": "/spec/containers/0/volumeMounts/-", "value": {
                    "name": "k8tz", "mountPath": "/usr/share/zoneinfo", "readOnly": true
                }},
                {"op": "add", "path": "/spec/volumes", "value": []},
                {"op": "add", "path": "/spec/volumes/-", "value": {
                    "name": "k8tz", "hostPath": {"path": "/usr/share/zoneinfo"}
                }},
                {"op": "add", "path": "/spec/containers/0/env", "value": []},
                {"op": "add", "path": "/spec/containers/0/env/-", "value": {"name": "TZ", "value": "Asia/Jerusalem"}},
                {"op": "add", "path": "/metadata/annotations", "value": {}},
                {"op": "add", "path": "/metadata/annotations/k8tz.io~1injected", "value": "true"},
                {"op": "add", "path": "/metadata/annotations/k8tz.io~1timezone", "value": "Asia/Jerusalem"},
            ])
        );
    }

    #[test]
    fn test_deployment_annotates_object_and_template() {
        let config = PolicyConfig::default();
        let policy = policy("UTC", InjectionStrategy::HostPath);
        let patches = generate(
            &config,
            &policy,
            json!({
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": {"name": "web", "annotations": {"a": "b"}},
                "spec": {"template": {
                    "metadata": {"labels": {"app": "web"}},
                    "spec": {"containers": [{"name": "app", "env": [{"name": "X", "value": "1"}]}]}
                }}
            }),
        )
        .unwrap();

        let paths: Vec<&str> = patches
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["path"].as_str().unwrap())
            .collect();
        assert_eq!(
            paths,
            vec![
                "/spec/template/spec/containers/0/volumeMounts",
                "/spec/template/spec/containers/0/volumeMounts/-",
                "/spec/template/spec/containers/0/volumeMounts/-",
                "/spec/template/spec/volumes",
                "/spec/template/spec/volumes/-",
                "/spec/template/spec/containers/0/env/-",
                "/metadata/annotations/k8tz.io~1injected",
                "/metadata/annotations/k8tz.io~1timezone",
                "/spec/template/metadata/annotations",
                "/spec/template/metadata/annotations/k8tz.io~1injected",
                "/spec/template/metadata/annotations/k8tz.io~1timezone",
            ]
        );
    }

    #[test]
    fn test_statefulset_without_template_metadata() {
        let config = PolicyConfig::default();
        let policy = policy("UTC", InjectionStrategy::HostPath);
        let patches = generate(
            &config,
            &policy,
            json!({
                "apiVersion": "apps/v1",
                "kind": "StatefulSet",
                "metadata": {"name": "db"},
                "spec": {"template": {"spec": {"containers": []}}}
            }),
        )
        .unwrap();

        assert_eq!(
            patches,
            json!([
                {"op": "add", "path": "/metadata/annotations", "value": {}},
                {"op": "add", "path": "/metadata/annotations/k8tz.io~1injected", "value": "true"},
                {"op": "add", "path": "/metadata/annotations/k8tz.io~1timezone", "value": "UTC"},
                {"op": "add", "path": "/spec/template/metadata", "value": {}},
                {"op": "add", "path": "/spec/template/metadata/annotations", "value": {}},
                {"op": "add", "path": "/spec/template/metadata/annotations/k8tz.io~1injected", "value": "true"},
                {"op": "add", "path": "/spec/template/metadata/annotations/k8tz.io~1timezone", "value": "UTC"},
            ])
        );
    }

    #[test]
    fn test_cronjob_timezone_field() {
        let mut config = PolicyConfig::default();
        let policy = policy("Europe/Paris", InjectionStrategy::InitContainer);
        let cron_job = json!({
            "apiVersion": "batch/v1",
            "kind": "CronJob",
            "metadata": {"name": "nightly", "annotations": {"team": "a"}},
            "spec": {"schedule": "0 0 * * *", "jobTemplate": {"spec": {"template": {"spec": {"containers": []}}}}}
        });

        assert_eq!(generate(&config, &policy, cron_job.clone()).unwrap(), json!([]));

        config.cron_job_time_zone = true;
        assert_eq!(
            generate(&config, &policy, cron_job).unwrap(),
            json!([
                {"op": "add", "path": "/spec/timeZone", "value": "Europe/Paris"},
                {"op": "add", "path": "/metadata/annotations/k8tz.io~1injected", "value": "true"},
                {"op": "add", "path": "/metadata/annotations/k8tz.io~1timezone", "value": "Europe/Paris"},
            ])
        );
    }

    #[test]
    fn test_list_offsets_item_paths_and_skips_unknown() {
        let config = PolicyConfig::default();
        let policy = policy("UTC", InjectionStrategy::HostPath);
        let patches = generate(
            &config,
            &policy,
            json!({
                "apiVersion": "v1",
                "kind": "List",
                "items": [
                    {"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "cm"}},
                    {"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "p", "annotations": {"x": "y"}},
                     "spec": {"containers": []}},
                ]
            }),
        )
        .unwrap();

        assert_eq!(
            patches,
            json!([
                {"op": "add", "path": "/items/1/metadata/annotations/k8tz.io~1injected", "value": "true"},
                {"op": "add", "path": "/items/1/metadata/annotations/k8tz.io~1timezone", "value": "UTC"},
            ])
        );
    }

    #[test]
    fn test_nested_list() {
        let config = PolicyConfig::default();
        let policy = policy("UTC", InjectionStrategy::HostPath);
        let patches = generate(
            &config,
            &policy,
            json!({
                "kind": "List",
                "items": [{"kind": "List", "items": [
                    {"kind": "Pod", "metadata": {"annotations": {"x": "y"}}}
                ]}]
            }),
        )
        .unwrap();

        assert_eq!(
            patches[0]["path"],
            json!("/items/0/items/0/metadata/annotations/k8tz.io~1injected")
        );
    }

    #[test]
    fn test_list_item_decode_failure_aborts() {
        let config = PolicyConfig::default();
        let policy = policy("UTC", InjectionStrategy::HostPath);
        let result = generate(
            &config,
            &policy,
            json!({
                "kind": "List",
                "items": [
                    {"kind": "Pod", "metadata": {"name": "ok"}, "spec": {"containers": []}},
                    {"kind": "Pod", "spec": {"containers": 42}},
                ]
            }),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_list() {
        let config = PolicyConfig::default();
        let policy = policy("UTC", InjectionStrategy::HostPath);
        assert_eq!(
            generate(&config, &policy, json!({"kind": "List", "items": []})).unwrap(),
            json!([])
        );
        assert_eq!(
            generate(&config, &policy, json!({"kind": "List"})).unwrap(),
            json!([])
        );
    }
}
