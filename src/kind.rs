use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Deserialize;
use serde_json::Value;

use crate::error::Error;

/// Type discriminator of a manifest, decoded without touching the rest of the object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceKind {
    Pod,
    Deployment,
    StatefulSet,
    CronJob,
    List,
    /// Anything else, passed through untouched. Empty when the document has no kind.
    Unknown(String),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypeMeta {
    #[serde(default)]
    api_version: Option<String>,
    #[serde(default)]
    kind: Option<String>,
}

impl ResourceKind {
    fn from_type_meta(meta: Option<TypeMeta>) -> Self {
        let Some(meta) = meta else {
            return ResourceKind::Unknown(String::new());
        };
        let kind = meta.kind.unwrap_or_default();
        match kind.as_str() {
            "Pod" => ResourceKind::Pod,
            "Deployment" => ResourceKind::Deployment,
            "StatefulSet" => ResourceKind::StatefulSet,
            "CronJob" => ResourceKind::CronJob,
            "List" => ResourceKind::List,
            _ => match meta.api_version {
                Some(api_version) if !kind.is_empty() => {
                    ResourceKind::Unknown(format!("{api_version}/{kind}"))
                }
                _ => ResourceKind::Unknown(kind),
            },
        }
    }

    /// Sniffs one serialized yaml (or json) document. Fails only on malformed input;
    /// scalars, sequences and empty documents are `Unknown`.
    pub fn sniff(document: &[u8]) -> Result<Self, Error> {
        let value: serde_yaml::Value = serde_yaml::from_slice(document)?;
        if !value.is_mapping() {
            return Ok(Self::from_type_meta(None));
        }
        let meta: TypeMeta = serde_yaml::from_value(value)?;
        Ok(Self::from_type_meta(Some(meta)))
    }

    pub fn sniff_value(value: &Value) -> Result<Self, Error> {
        if !value.is_object() {
            return Ok(Self::from_type_meta(None));
        }
        let meta = TypeMeta::deserialize(value)?;
        Ok(Self::from_type_meta(Some(meta)))
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, ResourceKind::Unknown(_))
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Pod => f.write_str("Pod"),
            ResourceKind::Deployment => f.write_str("Deployment"),
            ResourceKind::StatefulSet => f.write_str("StatefulSet"),
            ResourceKind::CronJob => f.write_str("CronJob"),
            ResourceKind::List => f.write_str("List"),
            ResourceKind::Unknown(kind) if kind.is_empty() => f.write_str("<unknown>"),
            ResourceKind::Unknown(kind) => f.write_str(kind),
        }
    }
}

// Only the fields patch generation reads are decoded, everything else stays in
// the original document.

#[derive(Debug, Default, Deserialize)]
pub struct VolumeMountView {
    #[serde(default, rename = "mountPath")]
    pub mount_path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerView {
    #[serde(default)]
    pub env: Option<Vec<Value>>,
    #[serde(default)]
    pub volume_mounts: Option<Vec<VolumeMountView>>,
}

impl ContainerView {
    pub fn env_len(&self) -> usize {
        self.env.as_ref().map_or(0, Vec::len)
    }

    pub fn volume_mounts(&self) -> &[VolumeMountView] {
        self.volume_mounts.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpecView {
    #[serde(default)]
    pub containers: Option<Vec<ContainerView>>,
    #[serde(default)]
    pub init_containers: Option<Vec<Value>>,
    #[serde(default)]
    pub volumes: Option<Vec<Value>>,
}

impl PodSpecView {
    pub fn containers(&self) -> &[ContainerView] {
        self.containers.as_deref().unwrap_or_default()
    }

    pub fn has_volumes(&self) -> bool {
        self.volumes.as_ref().is_some_and(|v| !v.is_empty())
    }

    pub fn has_init_containers(&self) -> bool {
        self.init_containers.as_ref().is_some_and(|v| !v.is_empty())
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct PodObject {
    #[serde(default)]
    pub metadata: Option<ObjectMeta>,
    #[serde(default)]
    pub spec: Option<PodSpecView>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PodTemplateView {
    #[serde(default)]
    pub metadata: Option<ObjectMeta>,
    #[serde(default)]
    pub spec: Option<PodSpecView>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TemplateSpecView {
    #[serde(default)]
    pub template: Option<PodTemplateView>,
}

/// Deployment and StatefulSet share the same template-wrapping shape.
#[derive(Debug, Default, Deserialize)]
pub struct TemplatedObject {
    #[serde(default)]
    pub metadata: Option<ObjectMeta>,
    #[serde(default)]
    pub spec: Option<TemplateSpecView>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CronJobObject {
    #[serde(default)]
    pub metadata: Option<ObjectMeta>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListObject {
    #[serde(default)]
    pub items: Option<Vec<Value>>,
}

#[derive(Debug)]
pub enum Workload {
    Pod(PodObject),
    Deployment(TemplatedObject),
    StatefulSet(TemplatedObject),
    CronJob(CronJobObject),
    List(ListObject),
}

impl Workload {
    /// Fully decodes an object whose kind has already been sniffed.
    pub fn decode(kind: &ResourceKind, value: &Value) -> Result<Self, Error> {
        let workload = match kind {
            ResourceKind::Pod => Workload::Pod(PodObject::deserialize(value)?),
            ResourceKind::Deployment => Workload::Deployment(TemplatedObject::deserialize(value)?),
            ResourceKind::StatefulSet => {
                Workload::StatefulSet(TemplatedObject::deserialize(value)?)
            }
            ResourceKind::CronJob => Workload::CronJob(CronJobObject::deserialize(value)?),
            ResourceKind::List => Workload::List(ListObject::deserialize(value)?),
            ResourceKind::Unknown(kind) => return Err(Error::NotInjectable(kind.clone())),
        };
        Ok(workload)
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            Workload::Pod(_) => ResourceKind::Pod,
            Workload::Deployment(_) => ResourceKind::Deployment,
            Workload::StatefulSet(_) => ResourceKind::StatefulSet,
            Workload::CronJob(_) => ResourceKind::CronJob,
            Workload::List(_) => ResourceKind::List,
        }
    }

    /// The object's own metadata, `None` for lists.
    pub fn metadata(&self) -> Option<&ObjectMeta> {
        match self {
            Workload::Pod(pod) => pod.metadata.as_ref(),
            Workload::Deployment(o) | Workload::StatefulSet(o) => o.metadata.as_ref(),
            Workload::CronJob(cron_job) => cron_job.metadata.as_ref(),
            Workload::List(_) => None,
        }
    }
}

/// `namespace=..., name=...` for log lines, preferring generateName when set.
pub fn object_details(meta: Option<&ObjectMeta>) -> String {
    let namespace = meta.and_then(|m| m.namespace.as_deref()).unwrap_or_default();
    match meta.and_then(|m| m.generate_name.as_deref()) {
        Some(generate_name) if !generate_name.is_empty() => {
            format!("namespace={namespace}, generateName={generate_name}")
        }
        _ => {
            let name = meta.and_then(|m| m.name.as_deref()).unwrap_or_default();
            format!("namespace={namespace}, name={name}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sniff_supported_kinds() {
        assert_eq!(ResourceKind::sniff(b"apiVersion: v1\nkind: Pod\n").unwrap(), ResourceKind::Pod);
        assert_eq!(
            ResourceKind::sniff(b"apiVersion: apps/v1\nkind: Deployment\n").unwrap(),
            ResourceKind::Deployment
        );
        assert_eq!(
            ResourceKind::sniff(b"apiVersion: apps/v1\nkind: StatefulSet\n").unwrap(),
            ResourceKind::StatefulSet
        );
        assert_eq!(
            ResourceKind::sniff(b"apiVersion: batch/v1\nkind: CronJob\n").unwrap(),
            ResourceKind::CronJob
        );
        assert_eq!(ResourceKind::sniff(b"apiVersion: v1\nkind: List\nitems: []\n").unwrap(), ResourceKind::List);
        assert_eq!(
            ResourceKind::sniff(br#"{"apiVersion":"v1","kind":"Pod"}"#).unwrap(),
            ResourceKind::Pod
        );
    }

    #[test]
    fn test_sniff_unknown_does_not_fail() {
        let kind = ResourceKind::sniff(b"apiVersion: v1\nkind: Namespace\nmetadata:\n  name: test\n").unwrap();
        assert_eq!(kind, ResourceKind::Unknown("v1/Namespace".to_string()));
        assert!(!kind.is_known());

        let kind = ResourceKind::sniff(b"# only a comment\n").unwrap();
        assert_eq!(kind, ResourceKind::Unknown(String::new()));

        let kind = ResourceKind::sniff(b"foo: bar\n").unwrap();
        assert_eq!(kind, ResourceKind::Unknown(String::new()));
    }

    #[test]
    fn test_sniff_non_mapping_documents_are_unknown() {
        for document in [&b"- a\n- b\n"[..], b"just a string\n", b"42\n", b"", b"null\n"] {
            assert_eq!(
                ResourceKind::sniff(document).unwrap(),
                ResourceKind::Unknown(String::new()),
                "{}",
                String::from_utf8_lossy(document)
            );
        }
        assert_eq!(ResourceKind::sniff_value(&json!(["Pod"])).unwrap(), ResourceKind::Unknown(String::new()));
        assert_eq!(ResourceKind::sniff_value(&json!("Pod")).unwrap(), ResourceKind::Unknown(String::new()));
    }

    #[test]
    fn test_sniff_malformed_input() {
        assert!(ResourceKind::sniff(b"kind: [Pod\n").is_err());
        assert!(ResourceKind::sniff(b"kind: \"unterminated\n").is_err());
    }

    #[test]
    fn test_decode_pod() {
        let value = json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "test", "annotations": {"k8tz.io/timezone": "UTC"}},
            "spec": {
                "containers": [
                    {"name": "a", "env": [{"name": "X", "value": "1"}]},
                    {"name": "b", "volumeMounts": [{"name": "v", "mountPath": "/etc/localtime"}]},
                ],
            }
        });
        let workload = Workload::decode(&ResourceKind::Pod, &value).unwrap();
        assert_eq!(workload.kind(), ResourceKind::Pod);
        let Workload::Pod(pod) = workload else {
            panic!("expected pod");
        };
        let spec = pod.spec.unwrap();
        assert_eq!(spec.containers().len(), 2);
        assert_eq!(spec.containers()[0].env_len(), 1);
        assert_eq!(spec.containers()[1].env_len(), 0);
        assert_eq!(
            spec.containers()[1].volume_mounts()[0].mount_path.as_deref(),
            Some("/etc/localtime")
        );
        assert!(!spec.has_volumes());
    }

    #[test]
    fn test_decode_unknown_is_error() {
        let err = Workload::decode(&ResourceKind::Unknown("v1/Service".into()), &json!({})).unwrap_err();
        assert!(matches!(err, Error::NotInjectable(_)));
    }

    #[test]
    fn test_decode_rejects_wrong_field_types() {
        let value = json!({"kind": "Pod", "spec": {"containers": "nope"}});
        assert!(Workload::decode(&ResourceKind::Pod, &value).is_err());
    }

    #[test]
    fn test_object_details() {
        let meta = ObjectMeta {
            namespace: Some("default".into()),
            name: Some("web".into()),
            ..Default::default()
        };
        assert_eq!(object_details(Some(&meta)), "namespace=default, name=web");

        let meta = ObjectMeta {
            namespace: Some("default".into()),
            generate_name: Some("web-".into()),
            ..Default::default()
        };
        assert_eq!(object_details(Some(&meta)), "namespace=default, generateName=web-");
    }
}
