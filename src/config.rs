//! Webhook configuration, read once from the environment at startup.

use anyhow::{bail, Context};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

const DEFAULT_VIRTIOFS_IMAGE: &str = "quay.io/kubevirt/virt-launcher:v1.5.1";
const DEFAULT_ROLE_ANNOTATION: &str = "eks.amazonaws.com/role-arn";

const DEFAULT_REQUESTS_CPU: &str = "10m";
const DEFAULT_REQUESTS_MEMORY: &str = "1M";
const DEFAULT_LIMITS_CPU: &str = "100m";
const DEFAULT_LIMITS_MEMORY: &str = "128Mi";

#[derive(Debug, Clone)]
pub struct ResourcePair {
    pub cpu: Quantity,
    pub memory: Quantity,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Image used for the injected virtiofs sidecar.
    pub virtiofs_image: String,
    /// ServiceAccount annotation that carries the IAM role ARN.
    pub role_annotation: String,
    pub resource_requests: ResourcePair,
    pub resource_limits: ResourcePair,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an environment lookup. Injected so tests can
    /// run without touching process-global environment variables.
    pub fn load_from(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get_or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        Ok(Config {
            virtiofs_image: get_or("VIRTIOFS_IMAGE", DEFAULT_VIRTIOFS_IMAGE),
            role_annotation: get_or("IRSA_ROLE_ANNOTATION", DEFAULT_ROLE_ANNOTATION),
            resource_requests: ResourcePair {
                cpu: parse_quantity(&get_or("RESOURCE_REQUESTS_CPU", DEFAULT_REQUESTS_CPU))
                    .context("RESOURCE_REQUESTS_CPU")?,
                memory: parse_quantity(&get_or("RESOURCE_REQUESTS_MEMORY", DEFAULT_REQUESTS_MEMORY))
                    .context("RESOURCE_REQUESTS_MEMORY")?,
            },
            resource_limits: ResourcePair {
                cpu: parse_quantity(&get_or("RESOURCE_LIMITS_CPU", DEFAULT_LIMITS_CPU))
                    .context("RESOURCE_LIMITS_CPU")?,
                memory: parse_quantity(&get_or("RESOURCE_LIMITS_MEMORY", DEFAULT_LIMITS_MEMORY))
                    .context("RESOURCE_LIMITS_MEMORY")?,
            },
        })
    }
}

/// Validate a Kubernetes resource quantity ("100m", "128Mi", "1", ...).
/// `Quantity` itself is an opaque string wrapper, so a malformed value would
/// otherwise only surface when the API server rejects a patched pod.
fn parse_quantity(value: &str) -> anyhow::Result<Quantity> {
    const SUFFIXES: &[&str] = &[
        "", "m", "k", "M", "G", "T", "P", "E", "Ki", "Mi", "Gi", "Ti", "Pi", "Ei",
    ];

    let number: &str = value.trim_end_matches(|c: char| c.is_ascii_alphabetic());
    let suffix = &value[number.len()..];

    if number.is_empty() || !SUFFIXES.contains(&suffix) {
        bail!("invalid quantity {:?}", value);
    }
    number
        .parse::<f64>()
        .with_context(|| format!("invalid quantity {:?}", value))?;

    Ok(Quantity(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::load_from(|_| None).unwrap();

        assert_eq!(config.virtiofs_image, "quay.io/kubevirt/virt-launcher:v1.5.1");
        assert_eq!(config.role_annotation, "eks.amazonaws.com/role-arn");
        assert_eq!(config.resource_requests.cpu, Quantity("10m".to_string()));
        assert_eq!(config.resource_requests.memory, Quantity("1M".to_string()));
        assert_eq!(config.resource_limits.cpu, Quantity("100m".to_string()));
        assert_eq!(config.resource_limits.memory, Quantity("128Mi".to_string()));
    }

    #[test]
    fn test_overrides() {
        let env = |key: &str| match key {
            "VIRTIOFS_IMAGE" => Some("quay.io/kubevirt/virt-launcher:v1.6.0".to_string()),
            "RESOURCE_LIMITS_MEMORY" => Some("256Mi".to_string()),
            "IRSA_ROLE_ANNOTATION" => Some("example.com/role".to_string()),
            _ => None,
        };
        let config = Config::load_from(env).unwrap();

        assert_eq!(config.virtiofs_image, "quay.io/kubevirt/virt-launcher:v1.6.0");
        assert_eq!(config.role_annotation, "example.com/role");
        assert_eq!(config.resource_limits.memory, Quantity("256Mi".to_string()));
        // Untouched keys keep their defaults.
        assert_eq!(config.resource_limits.cpu, Quantity("100m".to_string()));
    }

    #[test]
    fn test_bad_quantity_fails_load() {
        let env = |key: &str| match key {
            "RESOURCE_REQUESTS_CPU" => Some("lots".to_string()),
            _ => None,
        };
        let err = Config::load_from(env).unwrap_err();
        assert!(err.to_string().contains("RESOURCE_REQUESTS_CPU"));
    }

    #[test]
    fn test_parse_quantity() {
        assert!(parse_quantity("100m").is_ok());
        assert!(parse_quantity("1").is_ok());
        assert!(parse_quantity("128Mi").is_ok());
        assert!(parse_quantity("1.5G").is_ok());

        assert!(parse_quantity("").is_err());
        assert!(parse_quantity("Mi").is_err());
        assert!(parse_quantity("128Zi").is_err());
        assert!(parse_quantity("many").is_err());
    }
}
