//! Endpoint manifest: the YAML file declaring what to harvest
//!
//! The manifest is the single authority on which endpoints exist, how each
//! paginates, and which fields land in the output. Endpoints whose payloads
//! need more than a field projection can still be registered in code with a
//! bespoke [`RecordMapper`](super::RecordMapper).

use super::{EndpointDescriptor, FieldMapper, FieldSpec, PaginationMode, Registry};
use crate::config::HarvestConfig;
use eyre::{Context, Result, bail};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Parsed `endpoints.yml`.
///
/// ```yaml
/// harvest:
///   rate_limit_calls: 100
///   rate_limit_period_secs: 60
/// endpoints:
///   - id: customers
///     category: crm
///     path: /v2/customers
///     mode: paged
///     page_size: 100
///     records_key: items
///     fields:
///       - id
///       - column: email
///         path: contact.email
/// ```
#[derive(Debug, Deserialize)]
pub struct HarvestManifest {
    #[serde(default)]
    harvest: HarvestConfig,
    endpoints: Vec<EndpointEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EndpointEntry {
    id: String,
    category: String,
    /// Output file basename; defaults to the id
    #[serde(default)]
    output: Option<String>,
    path: String,
    mode: ModeTag,
    #[serde(default)]
    page_size: Option<u32>,
    /// Documented implicit result cap for single-shot endpoints
    #[serde(default)]
    cap: Option<u32>,
    #[serde(default)]
    records_key: Option<String>,
    #[serde(default)]
    last_page_key: Option<String>,
    #[serde(default)]
    cursor_key: Option<String>,
    #[serde(default)]
    assume_complete_on_full_final_page: bool,
    #[serde(default)]
    params: BTreeMap<String, String>,
    fields: Vec<FieldEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ModeTag {
    Paged,
    SingleShot,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FieldEntry {
    /// Plain path; column name derived from it
    Path(String),
    Full {
        column: String,
        path: String,
    },
}

impl HarvestManifest {
    /// Read and parse a manifest file.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest: {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse manifest: {}", path.display()))
    }

    /// Parse a manifest from a YAML string.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse manifest")
    }

    /// Validate every entry and build the registry.
    pub fn into_registry(self) -> Result<(HarvestConfig, Registry)> {
        let mut registry = Registry::new();

        for entry in self.endpoints {
            let (descriptor, mapper) = entry.build()?;
            registry.register(descriptor, Arc::new(mapper));
        }

        if registry.is_empty() {
            bail!("Manifest declares no endpoints");
        }

        log::debug!("Manifest loaded: {} endpoint(s)", registry.len());
        Ok((self.harvest, registry))
    }
}

impl EndpointEntry {
    fn build(self) -> Result<(EndpointDescriptor, FieldMapper)> {
        if self.id.is_empty() {
            bail!("Endpoint with empty id");
        }
        if self.fields.is_empty() {
            bail!("Endpoint '{}' declares no fields", self.id);
        }

        let mode = match self.mode {
            ModeTag::Paged => match self.page_size {
                Some(page_size) if page_size > 0 => PaginationMode::Paged { page_size },
                _ => bail!("Endpoint '{}' is paged but has no page_size", self.id),
            },
            ModeTag::SingleShot => match self.cap {
                Some(cap) if cap > 0 => PaginationMode::SingleShot { cap },
                _ => bail!("Endpoint '{}' is single_shot but has no cap", self.id),
            },
        };

        let fields = self
            .fields
            .into_iter()
            .map(|field| match field {
                FieldEntry::Path(path) => FieldSpec::named(path),
                FieldEntry::Full { column, path } => FieldSpec::new(column, path),
            })
            .collect();

        let mut mapper = FieldMapper::new(fields);
        if let Some(key) = self.records_key {
            mapper = mapper.with_records_key(key);
        }
        if let Some(key) = self.last_page_key {
            mapper = mapper.with_last_page_key(key);
        }
        if let Some(key) = self.cursor_key {
            mapper = mapper.with_cursor_key(key);
        }

        let descriptor = EndpointDescriptor {
            output_name: self.output.unwrap_or_else(|| self.id.clone()),
            id: self.id,
            category: self.category,
            path: self.path,
            mode,
            params: self.params,
            assume_complete_on_full_final_page: self.assume_complete_on_full_final_page,
        };

        Ok((descriptor, mapper))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::RecordMapper;

    const MANIFEST: &str = r#"
harvest:
  rate_limit_calls: 50
  concurrency: 2
endpoints:
  - id: customers
    category: crm
    path: /v2/customers
    mode: paged
    page_size: 100
    records_key: items
    last_page_key: is_last
    fields:
      - id
      - column: email
        path: contact.email
  - id: plans
    category: billing
    output: subscription_plans
    path: /v2/plans
    mode: single_shot
    cap: 2000
    fields:
      - id
      - name
"#;

    #[test]
    fn test_parse_and_build_registry() {
        let manifest = HarvestManifest::from_yaml_str(MANIFEST).unwrap();
        let (config, registry) = manifest.into_registry().unwrap();

        assert_eq!(config.rate_limit_calls, 50);
        assert_eq!(config.concurrency, 2);
        assert_eq!(registry.len(), 2);

        let customers = registry.get("customers").unwrap();
        assert_eq!(
            customers.descriptor.mode,
            PaginationMode::Paged { page_size: 100 }
        );
        assert_eq!(customers.mapper.columns(), ["id", "email"]);

        let plans = registry.get("plans").unwrap();
        assert_eq!(plans.descriptor.output_name, "subscription_plans");
        assert_eq!(
            plans.descriptor.mode,
            PaginationMode::SingleShot { cap: 2000 }
        );
    }

    #[test]
    fn test_paged_without_page_size_is_rejected() {
        let manifest = HarvestManifest::from_yaml_str(
            r#"
endpoints:
  - id: broken
    category: crm
    path: /v2/broken
    mode: paged
    fields: [id]
"#,
        )
        .unwrap();

        let err = manifest.into_registry().unwrap_err();
        assert!(err.to_string().contains("page_size"));
    }

    #[test]
    fn test_single_shot_without_cap_is_rejected() {
        let manifest = HarvestManifest::from_yaml_str(
            r#"
endpoints:
  - id: broken
    category: crm
    path: /v2/broken
    mode: single_shot
    fields: [id]
"#,
        )
        .unwrap();

        assert!(manifest.into_registry().is_err());
    }

    #[test]
    fn test_empty_manifest_is_rejected() {
        let manifest = HarvestManifest::from_yaml_str("endpoints: []").unwrap();
        assert!(manifest.into_registry().is_err());
    }
}
