use std::{convert::Infallible, path::Path, sync::Arc, time::Duration};

use json_patch::{AddOperation, Patch, PatchOperation};
use k8s_openapi::api::core::v1::{Pod, PodSpec};
use kube::{
    core::{
        admission::{AdmissionRequest, AdmissionResponse, AdmissionReview},
        DynamicObject, GroupVersionKind,
    },
    ResourceExt,
};
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::{json, Value};
use warp::{
    reply::{self, Reply},
    Filter, Rejection,
};

use crate::{
    config::Args,
    mutator::{AdmittedObject, GatewayMutator, MutationOutcome},
    Error,
};

pub async fn run_webhook(args: &Args, mutator: Arc<GatewayMutator>) -> Result<(), Error> {
    let routes = routes(mutator, args.mutation_timeout).with(warp::log::log("webhook"));
    let bind = args.webhook_listen_addr;

    match args.tls_paths() {
        Some((cert, key)) => {
            let cert = read_file(cert).await?;
            let key = read_file(key).await?;
            info!("webhook listening on https://{bind}");
            warp::serve(routes)
                .tls()
                .cert(&cert)
                .key(&key)
                .run(bind)
                .await;
        }
        None => {
            warn!("no TLS cert/key configured, serving plain HTTP");
            info!("webhook listening on http://{bind}");
            warp::serve(routes).run(bind).await;
        }
    }

    Ok(())
}

async fn read_file(path: &Path) -> Result<Vec<u8>, Error> {
    tokio::fs::read(path)
        .await
        .map_err(|source| Error::FileAccess {
            path: path.to_path_buf(),
            source,
        })
}

fn routes(
    mutator: Arc<GatewayMutator>,
    timeout: Duration,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::post()
        .and(
            warp::path!("wh" / "mutating" / "setgateway")
                .and(warp::body::json())
                .and(warp::any().map(move || mutator.clone()))
                .and(warp::any().map(move || timeout))
                .and_then(mutate_handler),
        )
        .or(warp::get().and(
            warp::path!("wh" / "health").map(|| reply::json(&json!({ "ok": true }))),
        ))
}

async fn mutate_handler(
    body: AdmissionReview<DynamicObject>,
    mutator: Arc<GatewayMutator>,
    timeout: Duration,
) -> Result<impl Reply, Infallible> {
    let req: AdmissionRequest<_> = match body.try_into() {
        Ok(req) => req,
        Err(err) => {
            error!("invalid request: {}", err);
            return Ok(reply::json(&AdmissionResponse::invalid(err).into_review()));
        }
    };

    let mut res = AdmissionResponse::from(&req);
    if let Some(obj) = req.object {
        let name = obj.name_any();
        let namespace = req.namespace.as_deref();
        res = match mutate(res.clone(), &mutator, &req.kind, obj, namespace, timeout).await {
            Ok(res) => {
                info!("accepted: {:?} on {} {}", req.operation, req.kind.kind, name);
                res
            }
            Err(err) => {
                warn!("denied: {:?} on {} {} ({})", req.operation, req.kind.kind, name, err);
                res.deny(err.to_string())
            }
        };
    };
    Ok(reply::json(&res.into_review()))
}

fn admitted(kind: &GroupVersionKind, obj: DynamicObject) -> Result<AdmittedObject, Error> {
    if kind.group.is_empty() && kind.version == "v1" && kind.kind == "Pod" {
        let pod: Pod = serde_json::from_value(serde_json::to_value(obj)?)?;
        Ok(AdmittedObject::Pod(Box::new(pod)))
    } else {
        Ok(AdmittedObject::Other(obj))
    }
}

/// Runs the mutator and records what it added as a JSON patch on `res`.
async fn mutate(
    mut res: AdmissionResponse,
    mutator: &GatewayMutator,
    kind: &GroupVersionKind,
    obj: DynamicObject,
    namespace: Option<&str>,
    timeout: Duration,
) -> Result<AdmissionResponse, Error> {
    let raw = serde_json::to_value(&obj)?;
    let mut obj = admitted(kind, obj)?;
    let original = match &obj {
        AdmittedObject::Pod(pod) => Some(pod.clone()),
        AdmittedObject::Other(_) => None,
    };

    let outcome = tokio::time::timeout(timeout, mutator.mutate(&mut obj, namespace))
        .await
        .map_err(|_| Error::Timeout(timeout))??;

    match (outcome, &obj, original) {
        (MutationOutcome::Mutated, AdmittedObject::Pod(pod), Some(original)) => {
            let patches = gateway_patches(&raw, &original, pod, mutator.config().init_prepend)?;
            if !patches.is_empty() {
                res = res.with_patch(Patch(patches))?;
            }
        }
        _ => debug!("nothing to patch"),
    }

    Ok(res)
}

/// Builds add operations for everything the mutator changed on `mutated`.
///
/// The operations target `raw`, the object as the apiserver sent it, so fields
/// the typed `Pod` does not know about stay on the containers and volumes that
/// carried them.
fn gateway_patches(
    raw: &Value,
    original: &Pod,
    mutated: &Pod,
    init_prepend: bool,
) -> Result<Vec<PatchOperation>, Error> {
    let Some(spec) = &mutated.spec else {
        return Ok(vec![]);
    };
    let Some(raw_spec) = raw.get("spec").filter(|x| x.is_object()) else {
        return Ok(vec![PatchOperation::Add(AddOperation {
            path: "/spec".to_string(),
            value: serde_json::to_value(spec)?,
        })]);
    };
    let empty = PodSpec::default();
    let before = original.spec.as_ref().unwrap_or(&empty);

    let mut patches = vec![];
    if spec.dns_config != before.dns_config {
        if let Some(dns_config) = &spec.dns_config {
            patches.push(PatchOperation::Add(AddOperation {
                path: "/spec/dnsConfig".to_string(),
                value: serde_json::to_value(dns_config)?,
            }));
        }
    }
    if spec.dns_policy != before.dns_policy {
        if let Some(dns_policy) = &spec.dns_policy {
            patches.push(PatchOperation::Add(AddOperation {
                path: "/spec/dnsPolicy".to_string(),
                value: Value::String(dns_policy.clone()),
            }));
        }
    }

    let init_containers = spec.init_containers.as_deref().unwrap_or_default();
    if init_containers.len() > before.init_containers.as_deref().unwrap_or_default().len() {
        let added = if init_prepend {
            init_containers.first()
        } else {
            init_containers.last()
        };
        if let Some(added) = added {
            patches.push(insert(raw_spec, "initContainers", added, init_prepend)?);
        }
    }
    if spec.containers.len() > before.containers.len() {
        if let Some(added) = spec.containers.last() {
            patches.push(insert(raw_spec, "containers", added, false)?);
        }
    }
    let volumes = spec.volumes.as_deref().unwrap_or_default();
    if volumes.len() > before.volumes.as_deref().unwrap_or_default().len() {
        if let Some(added) = volumes.last() {
            patches.push(insert(raw_spec, "volumes", added, false)?);
        }
    }

    Ok(patches)
}

/// Adds `value` to the `field` list of the pod spec, creating the list when the
/// request has none.
fn insert<T: Serialize>(
    raw_spec: &Value,
    field: &str,
    value: &T,
    prepend: bool,
) -> Result<PatchOperation, Error> {
    let value = serde_json::to_value(value)?;
    let op = match raw_spec.get(field) {
        Some(Value::Array(_)) => AddOperation {
            path: format!("/spec/{field}/{}", if prepend { "0" } else { "-" }),
            value,
        },
        _ => AddOperation {
            path: format!("/spec/{field}"),
            value: Value::Array(vec![value]),
        },
    };
    Ok(PatchOperation::Add(op))
}
