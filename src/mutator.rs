use std::sync::Arc;

use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMapVolumeSource, Container, EnvVar, Pod, PodDNSConfig, PodDNSConfigOption,
    SecurityContext, Volume, VolumeMount,
};
use kube::{core::DynamicObject, ResourceExt};
use log::{debug, info, warn};

use crate::{
    config::MutatorConfig,
    gating::should_mutate,
    lookup::{resolve_host, resolve_list, NameResolver},
    resolv::HostResolver,
    Error,
};

pub const GATEWAY_INIT_CONTAINER_NAME: &str = "gateway-init";
pub const GATEWAY_SIDECAR_CONTAINER_NAME: &str = "gateway-sidecar";
pub const GATEWAY_CONFIGMAP_VOLUME_NAME: &str = "gateway-configmap";
pub const GATEWAY_CONFIGMAP_VOLUME_MODE: i32 = 0o777;

const DNS_POLICY_NONE: &str = "None";
const CAPABILITIES: &[&str] = &["NET_ADMIN", "NET_RAW"];

/// Object handed over by the admission request.
#[derive(Clone, Debug)]
pub enum AdmittedObject {
    Pod(Box<Pod>),
    /// Anything that is not a pod passes through untouched.
    Other(DynamicObject),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutationOutcome {
    Unchanged,
    Mutated,
}

pub struct GatewayMutator {
    config: Arc<MutatorConfig>,
    host: HostResolver,
    resolver: Arc<dyn NameResolver>,
}

impl GatewayMutator {
    /// Validates `config` and resolves the configured gateway and DNS servers once.
    pub async fn new(
        config: Arc<MutatorConfig>,
        host: HostResolver,
        resolver: Arc<dyn NameResolver>,
    ) -> Result<Self, Error> {
        config.validate()?;

        if !config.gateway.is_empty() {
            let ip = resolve_host(&*resolver, &config.gateway)
                .await
                .map_err(|e| Error::ConfigValidation(format!("gateway: {e}")))?;
            info!("gateway {} resolves to {ip}", config.gateway);
        }
        if !config.dns.is_empty() {
            let ips = resolve_list(&*resolver, &config.dns)
                .await
                .map_err(|e| Error::ConfigValidation(format!("DNS: {e}")))?;
            info!("DNS {} resolves to {}", config.dns, ips.join(","));
        }
        if config.configmap_name.is_empty()
            && !(config.init_mount_point.is_empty() && config.sidecar_mount_point.is_empty())
        {
            warn!("a configmap mount point is set but configmapName is empty, the mount will reference a missing volume");
        }

        Ok(Self {
            config,
            host,
            resolver,
        })
    }

    pub fn config(&self) -> &MutatorConfig {
        &self.config
    }

    /// Applies the gateway settings to `obj` in place.
    ///
    /// Every fallible step runs before the pod is touched, so an error leaves the
    /// object exactly as it was received.
    pub async fn mutate(
        &self,
        obj: &mut AdmittedObject,
        request_namespace: Option<&str>,
    ) -> Result<MutationOutcome, Error> {
        let pod = match obj {
            AdmittedObject::Pod(pod) => pod,
            AdmittedObject::Other(other) => {
                debug!(
                    "passing through non-pod object {:?}",
                    other.types.as_ref().map(|x| &x.kind)
                );
                return Ok(MutationOutcome::Unchanged);
            }
        };

        if !should_mutate(pod.labels(), pod.annotations(), &self.config)? {
            return Ok(MutationOutcome::Unchanged);
        }

        let config = &*self.config;
        if config.dns.is_empty()
            && config.dns_policy.is_empty()
            && config.init_image.is_empty()
            && config.sidecar_image.is_empty()
        {
            debug!("pod selected but no DNS, policy or image configured");
            return Ok(MutationOutcome::Mutated);
        }

        let dns_ips = resolve_list(&*self.resolver, &config.dns).await?;
        let namespace = pod
            .metadata
            .namespace
            .clone()
            .filter(|x| !x.is_empty())
            .or_else(|| request_namespace.map(str::to_string));

        let spec = pod.spec.get_or_insert_with(Default::default);

        if !config.dns.is_empty() {
            let mut dns_config = PodDNSConfig {
                nameservers: Some(dns_ips.clone()),
                ..Default::default()
            };
            if config.dns_policy == DNS_POLICY_NONE {
                dns_config.searches = Some(self.host.searches_for_namespace(namespace.as_deref()));
                dns_config.options = Some(
                    self.host
                        .options
                        .iter()
                        .map(|option| PodDNSConfigOption {
                            name: Some(option.name.clone()),
                            value: option.value.clone(),
                        })
                        .collect(),
                );
            }
            spec.dns_config = Some(dns_config);
        }

        if !config.dns_policy.is_empty() {
            spec.dns_policy = Some(config.dns_policy.clone());
        }

        let mut added = false;
        if !config.init_image.is_empty() {
            let container = self.container(
                GATEWAY_INIT_CONTAINER_NAME,
                &config.init_image,
                &config.init_cmd,
                &config.init_pull_policy,
                &config.init_mount_point,
                &dns_ips,
            );
            let init_containers = spec.init_containers.get_or_insert_with(Vec::new);
            if config.init_prepend {
                init_containers.insert(0, container);
            } else {
                init_containers.push(container);
            }
            added = true;
        }

        if !config.sidecar_image.is_empty() {
            spec.containers.push(self.container(
                GATEWAY_SIDECAR_CONTAINER_NAME,
                &config.sidecar_image,
                &config.sidecar_cmd,
                &config.sidecar_pull_policy,
                &config.sidecar_mount_point,
                &dns_ips,
            ));
            added = true;
        }

        if added && !config.configmap_name.is_empty() {
            spec.volumes.get_or_insert_with(Vec::new).push(Volume {
                name: GATEWAY_CONFIGMAP_VOLUME_NAME.to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: Some(config.configmap_name.clone()),
                    default_mode: Some(GATEWAY_CONFIGMAP_VOLUME_MODE),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }

        Ok(MutationOutcome::Mutated)
    }

    fn container(
        &self,
        name: &str,
        image: &str,
        cmd: &str,
        pull_policy: &str,
        mount_point: &str,
        dns_ips: &[String],
    ) -> Container {
        let env = [
            ("gateway", self.config.gateway.clone()),
            ("DNS", self.config.dns.clone()),
            ("DNS_ips", dns_ips.join(",")),
            ("K8S_DNS_ips", self.host.nameservers.join(" ")),
        ]
        .into_iter()
        .map(|(name, value)| EnvVar {
            name: name.to_string(),
            value: Some(value),
            ..Default::default()
        })
        .collect();

        Container {
            name: name.to_string(),
            image: Some(image.to_string()),
            command: (!cmd.is_empty()).then(|| vec![cmd.to_string()]),
            env: Some(env),
            image_pull_policy: (!pull_policy.is_empty()).then(|| pull_policy.to_string()),
            volume_mounts: (!mount_point.is_empty()).then(|| {
                vec![VolumeMount {
                    name: GATEWAY_CONFIGMAP_VOLUME_NAME.to_string(),
                    mount_path: mount_point.to_string(),
                    read_only: Some(true),
                    ..Default::default()
                }]
            }),
            security_context: Some(SecurityContext {
                capabilities: Some(Capabilities {
                    add: Some(CAPABILITIES.iter().map(|x| x.to_string()).collect()),
                    drop: None,
                }),
                run_as_user: Some(0),
                run_as_non_root: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}
