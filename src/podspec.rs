use json_patch::jsonptr::Pointer;
use json_patch::PatchOperation;
use k8s_openapi::api::core::v1::{
    Capabilities, Container, EmptyDirVolumeSource, EnvVar, HostPathVolumeSource,
    ResourceRequirements, SeccompProfile, SecurityContext, Volume, VolumeMount,
};
use serde_json::json;

use crate::config::InjectionStrategy;
use crate::engine::{add, at, remove, to_value, PatchGenerator};
use crate::error::Error;
use crate::kind::{ContainerView, PodSpecView};

const HOST_PATH_VOLUME_NAME: &str = "k8tz";
const ZONEINFO_MOUNT_PATH: &str = "/usr/share/zoneinfo";
pub const BOOTSTRAP_MOUNT_PATH: &str = "/mnt/zoneinfo";

/// Empty string means no constraints; anything else must be a valid ResourceRequirements document.
pub fn parse_resources(resources: &str) -> Result<ResourceRequirements, Error> {
    if resources.is_empty() {
        return Ok(ResourceRequirements::default());
    }
    serde_json::from_str(resources).map_err(Error::InvalidResources)
}

impl PatchGenerator<'_> {
    pub(crate) fn strategy_patches(
        &self,
        spec: &PodSpecView,
        spec_path: &Pointer,
        patches: &mut Vec<PatchOperation>,
    ) -> Result<(), Error> {
        match self.policy.strategy {
            InjectionStrategy::HostPath => self.host_path_patches(spec, spec_path, patches),
            InjectionStrategy::InitContainer => self.init_container_patches(spec, spec_path, patches),
        }
    }

    fn host_path_patches(
        &self,
        spec: &PodSpecView,
        spec_path: &Pointer,
        patches: &mut Vec<PatchOperation>,
    ) -> Result<(), Error> {
        let containers = spec.containers();
        if containers.is_empty() {
            return Ok(());
        }

        for (idx, container) in containers.iter().enumerate() {
            self.volume_mount_patches(container, spec_path, idx, HOST_PATH_VOLUME_NAME, patches)?;
        }

        let volume = Volume {
            name: HOST_PATH_VOLUME_NAME.to_string(),
            host_path: Some(HostPathVolumeSource {
                path: self.config.host_path_prefix.clone(),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.volume_patches(spec, spec_path, &volume, patches)
    }

    fn init_container_patches(
        &self,
        spec: &PodSpecView,
        spec_path: &Pointer,
        patches: &mut Vec<PatchOperation>,
    ) -> Result<(), Error> {
        let containers = spec.containers();
        if containers.is_empty() {
            return Ok(());
        }

        let resources = parse_resources(&self.config.init_container_resources)?;
        let name = &self.config.init_container_name;

        let volume = Volume {
            name: name.clone(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        };
        self.volume_patches(spec, spec_path, &volume, patches)?;

        for (idx, container) in containers.iter().enumerate() {
            self.volume_mount_patches(container, spec_path, idx, name, patches)?;
        }

        if !spec.has_init_containers() {
            patches.push(add(at(spec_path, &["initContainers"]), json!([])));
        }

        let mut args = vec!["bootstrap".to_string()];
        if self.config.init_container_verbose {
            args.push("--verbose".to_string());
        }

        let init_container = Container {
            name: name.clone(),
            image: Some(self.config.init_container_image.clone()),
            args: Some(args),
            resources: Some(resources),
            security_context: Some(SecurityContext {
                allow_privilege_escalation: Some(false),
                capabilities: Some(Capabilities {
                    drop: Some(vec!["ALL".to_string()]),
                    ..Default::default()
                }),
                seccomp_profile: Some(SeccompProfile {
                    type_: "RuntimeDefault".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            volume_mounts: Some(vec![VolumeMount {
                name: name.clone(),
                mount_path: BOOTSTRAP_MOUNT_PATH.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        };
        patches.push(add(at(spec_path, &["initContainers", "-"]), to_value(&init_container)?));

        Ok(())
    }

    fn volume_patches(
        &self,
        spec: &PodSpecView,
        spec_path: &Pointer,
        volume: &Volume,
        patches: &mut Vec<PatchOperation>,
    ) -> Result<(), Error> {
        if !spec.has_volumes() {
            patches.push(add(at(spec_path, &["volumes"]), json!([])));
        }
        patches.push(add(at(spec_path, &["volumes", "-"]), to_value(volume)?));
        Ok(())
    }

    /// Replaces any mount at the configured paths with read-only mounts of `volume_name`.
    fn volume_mount_patches(
        &self,
        container: &ContainerView,
        spec_path: &Pointer,
        idx: usize,
        volume_name: &str,
        patches: &mut Vec<PatchOperation>,
    ) -> Result<(), Error> {
        let idx = idx.to_string();
        let mounts = container.volume_mounts();

        if mounts.is_empty() {
            patches.push(add(at(spec_path, &["containers", idx.as_str(), "volumeMounts"]), json!([])));
        }

        // Reverse order keeps the remaining indices valid after each removal.
        for (mount_idx, mount) in mounts.iter().enumerate().rev() {
            let mount_path = mount.mount_path.as_deref();
            if mount_path == Some(self.config.local_time_path.as_str())
                || mount_path == Some(self.config.host_path_prefix.as_str())
            {
                let mount_idx = mount_idx.to_string();
                patches.push(remove(at(
                    spec_path,
                    &["containers", idx.as_str(), "volumeMounts", mount_idx.as_str()],
                )));
            }
        }

        let localtime = VolumeMount {
            name: volume_name.to_string(),
            read_only: Some(true),
            mount_path: self.config.local_time_path.clone(),
            sub_path: Some(self.policy.timezone.clone()),
            ..Default::default()
        };
        let zoneinfo = VolumeMount {
            name: volume_name.to_string(),
            read_only: Some(true),
            mount_path: ZONEINFO_MOUNT_PATH.to_string(),
            ..Default::default()
        };

        let append = at(spec_path, &["containers", idx.as_str(), "volumeMounts", "-"]);
        patches.push(add(append.clone(), to_value(&localtime)?));
        patches.push(add(append, to_value(&zoneinfo)?));

        Ok(())
    }

    pub(crate) fn environment_patches(
        &self,
        spec: &PodSpecView,
        spec_path: &Pointer,
        patches: &mut Vec<PatchOperation>,
    ) -> Result<(), Error> {
        let tz = EnvVar {
            name: "TZ".to_string(),
            value: Some(self.policy.timezone.clone()),
            ..Default::default()
        };
        let tz = to_value(&tz)?;

        for (idx, container) in spec.containers().iter().enumerate() {
            let idx = idx.to_string();
            if container.env_len() == 0 {
                patches.push(add(at(spec_path, &["containers", idx.as_str(), "env"]), json!([])));
            }
            patches.push(add(at(spec_path, &["containers", idx.as_str(), "env", "-"]), tz.clone()));
        }

        Ok(())
    }
}
