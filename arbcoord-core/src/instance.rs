//! Instance identity for lock ownership and consumer-group membership.

/// Resolve the unique id for this coordinator instance.
///
/// Precedence: explicit `consumer_id` config, then the `POD_NAME`
/// environment variable (Kubernetes downward API gives stable pod names),
/// then hostname plus a random suffix.
#[must_use]
pub fn resolve_instance_id(configured: &str) -> String {
    if !configured.is_empty() {
        return configured.to_string();
    }

    if let Ok(pod_name) = std::env::var("POD_NAME") {
        if !pod_name.is_empty() {
            return pod_name;
        }
    }

    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    format!("{host}-{}", nanoid::nanoid!(8))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_id_wins() {
        assert_eq!(resolve_instance_id("coord-7"), "coord-7");
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = resolve_instance_id("");
        let b = resolve_instance_id("");
        assert_ne!(a, b);
    }
}
