//! Remediation request materialisation.
//!
//! Remediation CRs are arbitrary user-defined kinds, so everything here
//! works on `DynamicObject` + `ApiResource` rather than typed structs. A
//! template's `spec.template` becomes the new object's `spec`; the kind is
//! the template's kind minus the `Template` suffix; the object is named
//! after the unhealthy node and owned (non-controller) by the policy.

use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, ObjectMeta,
    Patch, PatchParams, PostParams,
};
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, info, warn};

use crate::crd::{NodeHealthCheck, RemediationTemplateRef};
use crate::error::{Error, Result};

/// Field manager / controller identity.
pub const CONTROLLER_NAME: &str = "nodehealth-operator";

/// Label applied to every materialised remediation CR.
pub const PART_OF_LABEL: &str = "app.kubernetes.io/part-of";

/// Annotation set on a remediation CR when its escalation step times out.
pub const TIMED_OUT_ANNOTATION: &str = "nodehealth.io/nhc-timed-out";

/// Annotation set once on a remediation CR that outlived the stale
/// threshold without its node recovering.
pub const OLD_REMEDIATION_ANNOTATION: &str = "nodehealth.io/old-remediation-cr-flag";
pub const OLD_REMEDIATION_FLAG: &str = "flagon";

/// Node annotation naming the backing machine as `<namespace>/<name>`.
pub const MACHINE_ANNOTATION: &str = "machine.openshift.io/machine";
const MACHINE_API_VERSION: &str = "machine.openshift.io/v1beta1";
const MACHINE_KIND: &str = "Machine";

/// Template kind pinned to the platform machine-api namespace.
const METAL3_TEMPLATE_KIND: &str = "Metal3RemediationTemplate";
/// The namespace Metal3 templates must live in.
const MACHINE_API_NAMESPACE: &str = "openshift-machine-api";

/// Load the referenced template object.
pub async fn load_template(
    client: &Client,
    template_ref: &RemediationTemplateRef,
) -> Result<DynamicObject> {
    let api: Api<DynamicObject> = Api::namespaced_with(
        client.clone(),
        &template_ref.namespace,
        &template_ref.template_api_resource(),
    );
    match api.get_opt(&template_ref.name).await? {
        Some(template) => Ok(template),
        None => Err(Error::TemplateNotFound {
            kind: template_ref.kind.clone(),
            name: template_ref.name.clone(),
            namespace: template_ref.namespace.clone(),
        }),
    }
}

/// Enforce platform constraints on the template reference itself.
pub fn validate_template_constraints(template_ref: &RemediationTemplateRef) -> Result<()> {
    if template_ref.kind == METAL3_TEMPLATE_KIND && template_ref.namespace != MACHINE_API_NAMESPACE
    {
        return Err(Error::TemplateInvalid(format!(
            "{} must be referenced in the {} namespace, not {}",
            METAL3_TEMPLATE_KIND, MACHINE_API_NAMESPACE, template_ref.namespace
        )));
    }
    Ok(())
}

/// Build the remediation request object from a loaded template.
///
/// `node_name` is empty for the validation probe; the probe exercises the
/// whole path except the create.
pub fn build_request(
    template: &DynamicObject,
    template_ref: &RemediationTemplateRef,
    check: &NodeHealthCheck,
    node_name: &str,
    machine_owner: Option<OwnerReference>,
) -> Result<DynamicObject> {
    validate_template_constraints(template_ref)?;

    let spec = template
        .data
        .get("spec")
        .and_then(|spec| spec.get("template"))
        .cloned()
        .ok_or_else(|| Error::TemplateMalformed {
            name: template_ref.name.clone(),
            namespace: template_ref.namespace.clone(),
        })?;

    let mut owner_references = vec![check_owner_ref(check)];
    owner_references.extend(machine_owner);

    let resource = template_ref.remediation_api_resource();
    let mut request = DynamicObject::new(node_name, &resource);
    request.metadata = ObjectMeta {
        name: Some(node_name.to_string()),
        namespace: Some(template_ref.namespace.clone()),
        labels: Some(
            [(PART_OF_LABEL.to_string(), CONTROLLER_NAME.to_string())]
                .into_iter()
                .collect(),
        ),
        owner_references: Some(owner_references),
        ..Default::default()
    };
    request.data = serde_json::json!({ "spec": spec });
    Ok(request)
}

/// Non-controller owner reference to the policy; cascade deletion of the
/// policy sweeps its request objects, nothing blocks.
pub fn check_owner_ref(check: &NodeHealthCheck) -> OwnerReference {
    OwnerReference {
        api_version: NodeHealthCheck::api_version(&()).to_string(),
        kind: NodeHealthCheck::kind(&()).to_string(),
        name: check.name_any(),
        uid: check.uid().unwrap_or_default(),
        controller: None,
        block_owner_deletion: None,
    }
}

/// Whether an owner reference points at this policy: name + kind +
/// apiVersion + UID, or just name + kind while UIDs are not yet populated.
pub fn owner_ref_matches(owner: &OwnerReference, check: &NodeHealthCheck) -> bool {
    if owner.kind != NodeHealthCheck::kind(&()) || owner.name != check.name_any() {
        return false;
    }
    match (owner.uid.is_empty(), check.uid()) {
        (false, Some(uid)) => {
            owner.api_version == NodeHealthCheck::api_version(&()) && owner.uid == uid
        }
        _ => true,
    }
}

/// Resolve the node-backing machine into an owner reference, when the node
/// carries the machine annotation and the machine still exists.
pub async fn machine_owner_ref(client: &Client, node: &Node) -> Result<Option<OwnerReference>> {
    let Some(annotation) = node.annotations().get(MACHINE_ANNOTATION) else {
        return Ok(None);
    };
    let Some((namespace, name)) = annotation.split_once('/') else {
        warn!(
            node = %node.name_any(),
            "malformed machine annotation {annotation:?}, expected namespace/name"
        );
        return Ok(None);
    };

    let gvk = GroupVersionKind::gvk("machine.openshift.io", "v1beta1", MACHINE_KIND);
    let api: Api<DynamicObject> =
        Api::namespaced_with(client.clone(), namespace, &ApiResource::from_gvk(&gvk));

    match api.get_opt(name).await? {
        Some(machine) => Ok(Some(OwnerReference {
            api_version: MACHINE_API_VERSION.to_string(),
            kind: MACHINE_KIND.to_string(),
            name: machine.name_any(),
            uid: machine.uid().unwrap_or_default(),
            controller: None,
            block_owner_deletion: None,
        })),
        None => {
            warn!(
                node = %node.name_any(),
                machine = annotation.as_str(),
                "machine referenced by node annotation does not exist"
            );
            Ok(None)
        }
    }
}

/// Probe a template reference without creating anything: the reconciler's
/// template-validation gate.
pub async fn validate_template(
    client: &Client,
    check: &NodeHealthCheck,
    template_ref: &RemediationTemplateRef,
) -> Result<()> {
    let template = load_template(client, template_ref).await?;
    build_request(&template, template_ref, check, "", None).map(|_| ())
}

/// Get or create the remediation request for a node under the given
/// template. Returns the object and whether it was created by this call.
pub async fn ensure_request(
    client: &Client,
    check: &NodeHealthCheck,
    template_ref: &RemediationTemplateRef,
    node: &Node,
) -> Result<(DynamicObject, bool)> {
    let resource = template_ref.remediation_api_resource();
    let api: Api<DynamicObject> =
        Api::namespaced_with(client.clone(), &template_ref.namespace, &resource);
    let node_name = node.name_any();

    if let Some(existing) = api.get_opt(&node_name).await? {
        return Ok((existing, false));
    }

    let template = load_template(client, template_ref).await?;
    let machine_owner = if template_ref.kind == METAL3_TEMPLATE_KIND {
        machine_owner_ref(client, node).await?
    } else {
        None
    };
    let request = build_request(&template, template_ref, check, &node_name, machine_owner)?;

    match api.create(&PostParams::default(), &request).await {
        Ok(created) => {
            info!(
                node = %node_name,
                kind = %template_ref.remediation_kind(),
                "created remediation request"
            );
            Ok((created, true))
        }
        // Someone else created it between our get and create.
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            debug!(node = %node_name, "remediation request create raced");
            match api.get_opt(&node_name).await? {
                Some(existing) => Ok((existing, false)),
                None => Err(Error::KubeError(kube::Error::Api(ae))),
            }
        }
        Err(e) => Err(Error::KubeError(e)),
    }
}

/// Fetch the current request object for a node under a template, if any.
pub async fn get_request(
    client: &Client,
    template_ref: &RemediationTemplateRef,
    node_name: &str,
) -> Result<Option<DynamicObject>> {
    let api: Api<DynamicObject> = Api::namespaced_with(
        client.clone(),
        &template_ref.namespace,
        &template_ref.remediation_api_resource(),
    );
    Ok(api.get_opt(node_name).await?)
}

/// List the request objects of a template's kind that are owned by this
/// policy.
pub async fn list_owned_requests(
    client: &Client,
    check: &NodeHealthCheck,
    template_ref: &RemediationTemplateRef,
) -> Result<Vec<DynamicObject>> {
    let api: Api<DynamicObject> = Api::namespaced_with(
        client.clone(),
        &template_ref.namespace,
        &template_ref.remediation_api_resource(),
    );
    let params = ListParams::default().labels(&format!("{PART_OF_LABEL}={CONTROLLER_NAME}"));
    let objects = api.list(&params).await?;
    Ok(objects
        .items
        .into_iter()
        .filter(|obj| {
            obj.metadata
                .owner_references
                .as_deref()
                .unwrap_or_default()
                .iter()
                .any(|owner| owner_ref_matches(owner, check))
        })
        .collect())
}

/// Delete every request object this policy owns for a node, across all of
/// its referenced templates. Returns whether anything was deleted.
pub async fn delete_requests_for_node(
    client: &Client,
    check: &NodeHealthCheck,
    node_name: &str,
) -> Result<bool> {
    let mut deleted = false;
    for template_ref in check.spec.template_refs() {
        let api: Api<DynamicObject> = Api::namespaced_with(
            client.clone(),
            &template_ref.namespace,
            &template_ref.remediation_api_resource(),
        );
        let Some(existing) = api.get_opt(node_name).await? else {
            continue;
        };
        let owned = existing
            .metadata
            .owner_references
            .as_deref()
            .unwrap_or_default()
            .iter()
            .any(|owner| owner_ref_matches(owner, check));
        if !owned {
            continue;
        }
        match api.delete(node_name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(
                    node = node_name,
                    kind = %template_ref.remediation_kind(),
                    "deleted remediation request"
                );
                deleted = true;
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(Error::KubeError(e)),
        }
    }
    Ok(deleted)
}

/// Merge an annotation onto a request object.
pub async fn annotate_request(
    client: &Client,
    template_ref: &RemediationTemplateRef,
    name: &str,
    key: &str,
    value: &str,
) -> Result<()> {
    let api: Api<DynamicObject> = Api::namespaced_with(
        client.clone(),
        &template_ref.namespace,
        &template_ref.remediation_api_resource(),
    );
    let mut annotations = serde_json::Map::new();
    annotations.insert(key.to_string(), serde_json::Value::String(value.to_string()));
    let patch = serde_json::json!({
        "metadata": { "annotations": annotations }
    });
    api.patch(name, &PatchParams::apply(CONTROLLER_NAME), &Patch::Merge(&patch))
        .await?;
    Ok(())
}
