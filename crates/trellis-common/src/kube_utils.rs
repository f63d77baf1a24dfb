//! Kubernetes utility functions shared by the eventing controllers
//!
//! Naming, ownership and dynamic-resource helpers. Everything here is pure;
//! API access lives behind the controllers' client traits.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::discovery::ApiResource;

/// Maximum length of a Kubernetes object name we generate
pub const MAX_NAME_LENGTH: usize = 63;

/// Length of the hex digest appended to shortened names
const NAME_HASH_LENGTH: usize = 16;

/// Build an ApiResource from an apiVersion and kind.
///
/// Useful for working with `DynamicObject` when the kind is only known at
/// runtime (channel templates, subscriber and dependency references).
///
/// # Example
///
/// ```ignore
/// let ar = build_api_resource("messaging.trellis.dev/v1", "InMemoryChannel");
/// let api: Api<DynamicObject> = Api::namespaced_with(client, "default", &ar);
/// ```
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Split an apiVersion into group and version.
///
/// ```ignore
/// let (group, version) = parse_api_version("messaging.trellis.dev/v1");
/// assert_eq!(group, "messaging.trellis.dev");
///
/// let (group, version) = parse_api_version("v1");
/// assert_eq!(group, "");
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Known kinds whose plural isn't produced by the simple rules below
const KIND_PLURALS: &[(&str, &str)] = &[
    ("inmemorychannel", "inmemorychannels"),
    ("kafkachannel", "kafkachannels"),
    ("channel", "channels"),
    ("subscription", "subscriptions"),
    ("broker", "brokers"),
    ("trigger", "triggers"),
    ("endpoints", "endpoints"),
    ("service", "services"),
    ("pingsource", "pingsources"),
    ("apiserversource", "apiserversources"),
    ("containersource", "containersources"),
    ("sinkbinding", "sinkbindings"),
    ("parallel", "parallels"),
    ("sequence", "sequences"),
];

/// Pluralize a Kubernetes resource kind
///
/// Uses a lookup table for known eventing/Kubernetes types, falling back to
/// simple pluralization rules for unknown types.
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();

    if let Some((_, plural)) = KIND_PLURALS.iter().find(|(singular, _)| *singular == lower) {
        return (*plural).to_string();
    }

    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// Compute a deterministic hash of the input string, returning a 16-char hex digest.
///
/// Uses truncated SHA-256 for stability across Rust toolchain versions.
/// `DefaultHasher` is NOT guaranteed stable across Rust releases, so this
/// function should be used whenever the hash ends up in an object name.
pub fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..NAME_HASH_LENGTH / 2]
        .iter()
        .fold(String::with_capacity(NAME_HASH_LENGTH), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// Derive a valid child object name from a prefix.
///
/// Prefixes that fit are used as-is. Longer prefixes are cut to leave room
/// for a hash of the full prefix, so distinct long prefixes stay distinct and
/// the same prefix always maps to the same name.
pub fn child_name(prefix: &str) -> String {
    if prefix.len() <= MAX_NAME_LENGTH {
        return prefix.to_string();
    }

    let keep = MAX_NAME_LENGTH - NAME_HASH_LENGTH;
    let mut head: String = prefix.chars().take(keep).collect();
    while head.ends_with('-') || head.ends_with('.') {
        head.pop();
    }
    format!("{}{}", head, deterministic_hash(prefix))
}

/// Whether `meta` has a controller owner reference pointing at `owner_uid`.
pub fn is_controlled_by(meta: &ObjectMeta, owner_uid: &str) -> bool {
    meta.owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|r| r.controller == Some(true) && r.uid == owner_uid)
}

/// `namespace/name` key used in logs and event notes
pub fn namespaced_name(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

/// API-server style not-found message for an object of a runtime-known kind.
///
/// `pingsources.sources.trellis.dev "x" not found`, or `services "x" not found`
/// for the core group.
pub fn not_found_message(api_version: &str, kind: &str, name: &str) -> String {
    let (group, _) = parse_api_version(api_version);
    let plural = pluralize_kind(kind);
    if group.is_empty() {
        format!("{} \"{}\" not found", plural, name)
    } else {
        format!("{}.{} \"{}\" not found", plural, group, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    fn owner_ref(uid: &str, controller: bool) -> OwnerReference {
        OwnerReference {
            api_version: "eventing.trellis.dev/v1".to_string(),
            kind: "Trigger".to_string(),
            name: "my-trigger".to_string(),
            uid: uid.to_string(),
            controller: Some(controller),
            block_owner_deletion: Some(true),
        }
    }

    #[test]
    fn api_resource_for_channel_kind() {
        let ar = build_api_resource("messaging.trellis.dev/v1", "InMemoryChannel");
        assert_eq!(ar.group, "messaging.trellis.dev");
        assert_eq!(ar.version, "v1");
        assert_eq!(ar.plural, "inmemorychannels");
    }

    #[test]
    fn api_resource_for_core_kind() {
        let ar = build_api_resource("v1", "Service");
        assert_eq!(ar.group, "");
        assert_eq!(ar.version, "v1");
        assert_eq!(ar.plural, "services");
    }

    #[test]
    fn pluralize_fallback_rules() {
        assert_eq!(pluralize_kind("KafkaSource"), "kafkasources");
        assert_eq!(pluralize_kind("Gateway"), "gateways");
        assert_eq!(pluralize_kind("Policy"), "policies");
        assert_eq!(pluralize_kind("Endpoints"), "endpoints");
    }

    #[test]
    fn deterministic_hash_is_stable_and_short() {
        let a = deterministic_hash("default-orders-1234");
        let b = deterministic_hash("default-orders-1234");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, deterministic_hash("default-orders-5678"));
    }

    /// Story: short names pass through unchanged
    #[test]
    fn story_child_name_keeps_short_prefixes() {
        assert_eq!(child_name("default-orders"), "default-orders");
        let exact = "a".repeat(MAX_NAME_LENGTH);
        assert_eq!(child_name(&exact), exact);
    }

    /// Story: long names are shortened deterministically and stay unique
    #[test]
    fn story_child_name_shortens_long_prefixes() {
        let long = format!("{}-{}-{}", "b".repeat(30), "t".repeat(30), "uid-1234");
        let name = child_name(&long);
        assert!(name.len() <= MAX_NAME_LENGTH);
        assert_eq!(name, child_name(&long));
        assert!(name.ends_with(&deterministic_hash(&long)));

        let other = format!("{}-{}-{}", "b".repeat(30), "t".repeat(30), "uid-5678");
        assert_ne!(child_name(&other), name);
    }

    #[test]
    fn child_name_trims_trailing_separator_before_hash() {
        let long = format!("{}-{}", "a".repeat(46), "b".repeat(40));
        let name = child_name(&long);
        assert!(name.starts_with(&"a".repeat(46)));
        assert!(!name[..46].ends_with('-'));
        assert_eq!(&name[46..], deterministic_hash(&long));
    }

    #[test]
    fn controller_owner_reference_is_required() {
        let mut meta = ObjectMeta::default();
        assert!(!is_controlled_by(&meta, "uid-1"));

        meta.owner_references = Some(vec![owner_ref("uid-1", false)]);
        assert!(!is_controlled_by(&meta, "uid-1"));

        meta.owner_references = Some(vec![owner_ref("uid-2", true)]);
        assert!(!is_controlled_by(&meta, "uid-1"));

        meta.owner_references = Some(vec![owner_ref("uid-2", false), owner_ref("uid-1", true)]);
        assert!(is_controlled_by(&meta, "uid-1"));
    }

    #[test]
    fn not_found_message_names_group_and_plural() {
        assert_eq!(
            not_found_message("sources.trellis.dev/v1", "PingSource", "test-ping-source"),
            "pingsources.sources.trellis.dev \"test-ping-source\" not found"
        );
        assert_eq!(
            not_found_message("v1", "Service", "subscriber"),
            "services \"subscriber\" not found"
        );
    }

    #[test]
    fn namespaced_name_format() {
        assert_eq!(namespaced_name("tenant-a", "default"), "tenant-a/default");
    }
}
