//! Type and attribute naming.
//!
//! Kubernetes uses camelCase field names and dotted API groups; schema
//! attribute and type names are lowercase snake_case identifiers.

/// The suffix appended to a type name for its manifest data source.
pub const MANIFEST_SUFFIX: &str = "_manifest";

/// Convert a camelCase field name or a dotted group into snake_case.
///
/// Runs of capitals are kept together (`podIP` → `pod_ip`,
/// `HTTPRoute` → `http_route`) and any non-alphanumeric character becomes a
/// single `_`.
pub fn snake_case(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if !c.is_ascii_alphanumeric() {
            if !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
            continue;
        }

        if c.is_ascii_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_is_lower = chars.get(i + 1).is_some_and(|n| n.is_ascii_lowercase());
            let boundary = prev.is_ascii_lowercase()
                || prev.is_ascii_digit()
                || (prev.is_ascii_uppercase() && next_is_lower);
            if boundary && !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
        }
        out.push(c.to_ascii_lowercase());
    }

    while out.ends_with('_') {
        out.pop();
    }
    out
}

/// The `apiVersion` of objects in `group`/`version`; the core group has no prefix.
pub fn api_version(group: &str, version: &str) -> String {
    if group.is_empty() {
        version.to_string()
    } else {
        format!("{}/{}", group, version)
    }
}

/// The resource and data source type name for a kind.
///
/// ```
/// use kubecrd_provider::naming::type_name;
///
/// assert_eq!(
///     type_name("k8s", "cert-manager.io", "Certificate", "v1"),
///     "k8s_cert_manager_io_certificate_v1"
/// );
/// assert_eq!(type_name("k8s", "", "ConfigMap", "v1"), "k8s_config_map_v1");
/// ```
pub fn type_name(prefix: &str, group: &str, kind: &str, version: &str) -> String {
    [prefix, group, kind, version]
        .iter()
        .map(|part| snake_case(part))
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

/// The manifest data source type name for a kind.
pub fn manifest_type_name(prefix: &str, group: &str, kind: &str, version: &str) -> String {
    format!("{}{}", type_name(prefix, group, kind, version), MANIFEST_SUFFIX)
}
