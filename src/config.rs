use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::Parser;

use crate::{resolv::RESOLV_CONF_PATH, Error};

const DNS_POLICIES: &[&str] = &["ClusterFirstWithHostNet", "ClusterFirst", "Default", "None"];

#[derive(Parser, Debug)]
#[command(
    name = "gateway-admission-controller",
    version,
    about = "Kubernetes admission controller webhook to change the POD default gateway and DNS"
)]
pub struct Args {
    #[arg(long, env = "DEBUG", help = "Enable debug logging")]
    pub debug: bool,

    #[arg(
        long = "webhook-listen-address",
        env = "WEBHOOK_LISTEN_ADDRESS",
        default_value = "0.0.0.0:8080",
        help = "The address where the HTTPS server will be listening to serve the webhooks"
    )]
    pub webhook_listen_addr: SocketAddr,

    #[arg(
        long = "tls-cert-file-path",
        env = "TLS_CERT_FILE_PATH",
        help = "The path for the webhook HTTPS server TLS cert file"
    )]
    pub tls_cert_file_path: Option<PathBuf>,

    #[arg(
        long = "tls-key-file-path",
        env = "TLS_KEY_FILE_PATH",
        help = "The path for the webhook HTTPS server TLS key file"
    )]
    pub tls_key_file_path: Option<PathBuf>,

    #[arg(
        long = "resolv-conf",
        env = "RESOLV_CONF",
        default_value = RESOLV_CONF_PATH,
        help = "Resolver configuration used as template for pod DNS search domains"
    )]
    pub resolv_conf: PathBuf,

    #[arg(
        long = "mutation-timeout",
        env = "MUTATION_TIMEOUT",
        default_value = "5s",
        value_parser = humantime::parse_duration,
        help = "Upper bound for a single mutation, including name resolution"
    )]
    pub mutation_timeout: Duration,

    #[command(flatten)]
    pub mutator: MutatorConfig,
}

impl Args {
    /// Returns the cert and key paths when TLS is configured.
    pub fn tls_paths(&self) -> Option<(&PathBuf, &PathBuf)> {
        self.tls_cert_file_path
            .as_ref()
            .zip(self.tls_key_file_path.as_ref())
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.tls_cert_file_path.is_some() != self.tls_key_file_path.is_some() {
            return Err(Error::ConfigValidation(
                "--tls-cert-file-path and --tls-key-file-path must be set together".to_string(),
            ));
        }
        if self.mutation_timeout.is_zero() {
            return Err(Error::ConfigValidation(
                "--mutation-timeout must be greater than zero".to_string(),
            ));
        }
        self.mutator.validate()
    }
}

/// Static mutation settings. Built once at startup and shared read-only by every request.
#[derive(clap::Args, Clone, Debug, Default, PartialEq, Eq)]
pub struct MutatorConfig {
    #[arg(long = "gateway", env = "GATEWAY", default_value_t, help = "Name/IP of the gateway pod")]
    pub gateway: String,

    #[arg(
        long = "DNS",
        env = "DNS",
        default_value_t,
        help = "Comma separated names/IPs of the DNS servers (might be the same as the gateway pod)"
    )]
    pub dns: String,

    #[arg(long = "DNSPolicy", env = "DNS_POLICY", default_value_t, help = "Set DNSPolicy")]
    pub dns_policy: String,

    #[arg(
        long = "setGatewayDefault",
        env = "SET_GATEWAY_DEFAULT",
        help = "Set gateway by default in absence of label/annotation"
    )]
    pub gate_by_default: bool,

    #[arg(
        long = "setGatewayLabel",
        env = "SET_GATEWAY_LABEL",
        default_value_t,
        help = "Set gateway for pods with this label set to 'true'"
    )]
    pub gating_label: String,

    #[arg(
        long = "setGatewayLabelValue",
        env = "SET_GATEWAY_LABEL_VALUE",
        default_value_t,
        help = "Set gateway for pods with label set to this value"
    )]
    pub gating_label_value: String,

    #[arg(
        long = "setGatewayAnnotation",
        env = "SET_GATEWAY_ANNOTATION",
        default_value_t,
        help = "Set gateway for pods with this annotation set to 'true'"
    )]
    pub gating_annotation: String,

    #[arg(
        long = "setGatewayAnnotationValue",
        env = "SET_GATEWAY_ANNOTATION_VALUE",
        default_value_t,
        help = "Set gateway for pods with annotation set to this value"
    )]
    pub gating_annotation_value: String,

    #[arg(long = "initImage", env = "INIT_IMAGE", default_value_t, help = "Init container image")]
    pub init_image: String,

    #[arg(
        long = "initImagePullPol",
        env = "INIT_IMAGE_PULL_POL",
        default_value_t,
        help = "Init container pull policy"
    )]
    pub init_pull_policy: String,

    #[arg(
        long = "initCmd",
        env = "INIT_CMD",
        default_value_t,
        help = "Init command to execute instead of container default"
    )]
    pub init_cmd: String,

    #[arg(
        long = "initMountPoint",
        env = "INIT_MOUNT_POINT",
        default_value_t,
        help = "Mountpoint for configmap in init container"
    )]
    pub init_mount_point: String,

    #[arg(
        long = "initImagePrepend",
        env = "INIT_IMAGE_PREPEND",
        help = "Prepend the init container instead of appending it"
    )]
    pub init_prepend: bool,

    #[arg(
        long = "sidecarImage",
        env = "SIDECAR_IMAGE",
        default_value_t,
        help = "Sidecar container image"
    )]
    pub sidecar_image: String,

    #[arg(
        long = "sidecarImagePullPol",
        env = "SIDECAR_IMAGE_PULL_POL",
        default_value_t,
        help = "Sidecar container pull policy"
    )]
    pub sidecar_pull_policy: String,

    #[arg(
        long = "sidecarCmd",
        env = "SIDECAR_CMD",
        default_value_t,
        help = "Sidecar command to execute instead of container default"
    )]
    pub sidecar_cmd: String,

    #[arg(
        long = "sidecarMountPoint",
        env = "SIDECAR_MOUNT_POINT",
        default_value_t,
        help = "Mountpoint for configmap in sidecar container"
    )]
    pub sidecar_mount_point: String,

    #[arg(
        long = "configmapName",
        env = "CONFIGMAP_NAME",
        default_value_t,
        help = "Name of the configmap to attach to containers"
    )]
    pub configmap_name: String,
}

impl MutatorConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if !self.dns_policy.is_empty() && !DNS_POLICIES.contains(&self.dns_policy.as_str()) {
            return Err(Error::ConfigValidation(format!(
                "unknown DNSPolicy '{}', expected one of {}",
                self.dns_policy,
                DNS_POLICIES.join(", ")
            )));
        }
        if self.gating_label.is_empty() && !self.gating_label_value.is_empty() {
            return Err(Error::ConfigValidation(
                "setGatewayLabelValue requires setGatewayLabel".to_string(),
            ));
        }
        if self.gating_annotation.is_empty() && !self.gating_annotation_value.is_empty() {
            return Err(Error::ConfigValidation(
                "setGatewayAnnotationValue requires setGatewayAnnotation".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("gateway-admission-controller").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn defaults() {
        let args = parse(&[]);
        assert!(!args.debug);
        assert_eq!(args.webhook_listen_addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(args.resolv_conf, PathBuf::from("/etc/resolv.conf"));
        assert_eq!(args.mutation_timeout, Duration::from_secs(5));
        assert!(args.tls_paths().is_none());
        assert_eq!(args.mutator, MutatorConfig::default());
        args.validate().unwrap();
    }

    #[test]
    fn original_flag_names() {
        let args = parse(&[
            "--gateway",
            "gateway.vpn",
            "--DNS",
            "5.6.7.8,9.10.11.12",
            "--DNSPolicy",
            "None",
            "--setGatewayDefault",
            "--setGatewayLabel",
            "setGateway",
            "--setGatewayLabelValue",
            "foo",
            "--initImage",
            "ghcr.io/k8s-at-home/gateway-init",
            "--initCmd",
            "/bin/client_init.sh",
            "--initImagePrepend",
            "--configmapName",
            "gateway-settings",
            "--mutation-timeout",
            "1500ms",
        ]);
        let m = &args.mutator;
        assert_eq!(m.gateway, "gateway.vpn");
        assert_eq!(m.dns, "5.6.7.8,9.10.11.12");
        assert_eq!(m.dns_policy, "None");
        assert!(m.gate_by_default);
        assert_eq!(m.gating_label, "setGateway");
        assert_eq!(m.gating_label_value, "foo");
        assert_eq!(m.init_cmd, "/bin/client_init.sh");
        assert!(m.init_prepend);
        assert_eq!(m.configmap_name, "gateway-settings");
        assert_eq!(args.mutation_timeout, Duration::from_millis(1500));
        args.validate().unwrap();
    }

    #[test]
    fn tls_paths_must_be_paired() {
        let args = parse(&["--tls-cert-file-path", "/certs/tls.crt"]);
        assert!(matches!(args.validate(), Err(Error::ConfigValidation(_))));

        let args = parse(&[
            "--tls-cert-file-path",
            "/certs/tls.crt",
            "--tls-key-file-path",
            "/certs/tls.key",
        ]);
        args.validate().unwrap();
        assert!(args.tls_paths().is_some());
    }

    #[test]
    fn unknown_dns_policy() {
        let config = MutatorConfig {
            dns_policy: "Nope".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::ConfigValidation(_))));
    }

    #[test]
    fn required_value_without_name() {
        let config = MutatorConfig {
            gating_annotation_value: "foo".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::ConfigValidation(_))));
    }
}
