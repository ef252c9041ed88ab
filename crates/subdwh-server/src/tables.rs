//! Output file to warehouse table mapping
//!
//! Each output file belongs to exactly one destination table. The mapping is
//! an ordered list of regex rules over the object key; the first matching
//! rule's template, expanded with the rule's capture groups, names the table.
//!
//! ```toml
//! [[rules]]
//! pattern = '^substreams/(?P<package>[^/]+)/(?P<table>[^/]+)/[^/]+\.parquet$'
//! table = "${package}_${table}"
//! ```
//!
//! Rules are validated when the mapper is built so a bad deployment fails at
//! startup rather than on the first upload tick.

use anyhow::{bail, Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub trait TableMapper: Send + Sync {
    /// Destination table for `file_key`, or `None` when no rule applies.
    fn table_for(&self, file_key: &str) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRule {
    pub pattern: String,
    pub table: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMappingConfig {
    #[serde(default)]
    pub rules: Vec<TableRule>,
}

impl TableMappingConfig {
    /// Load rules from an optional TOML file, then `TABLE_MAPPING_*` env.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(path) = path {
            if !path.exists() {
                bail!("TABLE_MAPPING_FILE {} does not exist", path.display());
            }
            figment = figment.merge(Toml::file(path));
        }

        figment
            .merge(Env::prefixed("TABLE_MAPPING_").only(&["rules"]))
            .extract()
            .context("Failed to load table mapping rules")
    }
}

/// The rule used when a deployment configures none
pub fn default_rule(output_prefix: &str) -> TableRule {
    TableRule {
        pattern: format!(
            r"^{}/(?P<package>[^/]+)/(?P<table>[^/]+)/[^/]+\.parquet$",
            regex::escape(output_prefix.trim_end_matches('/'))
        ),
        table: "${package}_${table}".to_string(),
    }
}

struct CompiledRule {
    regex: Regex,
    template: String,
}

pub struct RuleTableMapper {
    rules: Vec<CompiledRule>,
}

impl RuleTableMapper {
    /// Compile and validate `config`, falling back to [`default_rule`].
    pub fn new(config: &TableMappingConfig, output_prefix: &str) -> Result<Self> {
        let rules = if config.rules.is_empty() {
            vec![default_rule(output_prefix)]
        } else {
            config.rules.clone()
        };

        let compiled = rules
            .iter()
            .map(compile_rule)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { rules: compiled })
    }
}

fn compile_rule(rule: &TableRule) -> Result<CompiledRule> {
    let regex = Regex::new(&rule.pattern)
        .with_context(|| format!("Invalid table rule pattern '{}'", rule.pattern))?;

    if rule.table.trim().is_empty() {
        bail!("Table rule '{}' has an empty table template", rule.pattern);
    }

    let reference = Regex::new(r"\$\{?([A-Za-z0-9_]+)\}?")?;
    for caps in reference.captures_iter(&rule.table) {
        let name = &caps[1];
        let known = match name.parse::<usize>() {
            Ok(index) => index < regex.captures_len(),
            Err(_) => regex.capture_names().flatten().any(|n| n == name),
        };
        if !known {
            bail!(
                "Table template '{}' references group '{}' missing from pattern '{}'",
                rule.table,
                name,
                rule.pattern
            );
        }
    }

    Ok(CompiledRule {
        regex,
        template: rule.table.clone(),
    })
}

/// Upper-case and replace anything outside `[A-Z0-9_]` with `_`.
pub fn normalize_identifier(raw: &str) -> Option<String> {
    let mut ident: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();

    if ident.trim_matches('_').is_empty() {
        return None;
    }
    if ident.starts_with(|c: char| c.is_ascii_digit()) {
        ident.insert(0, '_');
    }
    Some(ident)
}

impl TableMapper for RuleTableMapper {
    fn table_for(&self, file_key: &str) -> Option<String> {
        self.rules.iter().find_map(|rule| {
            let caps = rule.regex.captures(file_key)?;
            let mut expanded = String::new();
            caps.expand(&rule.template, &mut expanded);
            normalize_identifier(&expanded)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rule_maps_package_and_table() {
        let mapper = RuleTableMapper::new(&TableMappingConfig::default(), "substreams").unwrap();

        assert_eq!(
            mapper.table_for("substreams/uniswap-v3/swaps/0001.parquet").as_deref(),
            Some("UNISWAP_V3_SWAPS")
        );
        assert_eq!(mapper.table_for("substreams/loose.parquet"), None);
        assert_eq!(mapper.table_for("other/uniswap-v3/swaps/0001.parquet"), None);
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let config = TableMappingConfig {
            rules: vec![
                TableRule {
                    pattern: r"^substreams/erc20/(?P<t>[^/]+)/".into(),
                    table: "token_${t}".into(),
                },
                TableRule {
                    pattern: r"^substreams/".into(),
                    table: "catch_all".into(),
                },
            ],
        };
        let mapper = RuleTableMapper::new(&config, "substreams").unwrap();

        assert_eq!(
            mapper.table_for("substreams/erc20/transfers/a.parquet").as_deref(),
            Some("TOKEN_TRANSFERS")
        );
        assert_eq!(
            mapper.table_for("substreams/ens/names/a.parquet").as_deref(),
            Some("CATCH_ALL")
        );
    }

    #[test]
    fn test_unknown_template_group_is_rejected() {
        let config = TableMappingConfig {
            rules: vec![TableRule {
                pattern: r"^substreams/(?P<package>[^/]+)/".into(),
                table: "${package}_${table}".into(),
            }],
        };
        assert!(RuleTableMapper::new(&config, "substreams").is_err());
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let config = TableMappingConfig {
            rules: vec![TableRule {
                pattern: "^substreams/(".into(),
                table: "x".into(),
            }],
        };
        assert!(RuleTableMapper::new(&config, "substreams").is_err());
    }

    #[test]
    fn test_normalize_identifier() {
        assert_eq!(normalize_identifier("aave-v2.deposits").as_deref(), Some("AAVE_V2_DEPOSITS"));
        assert_eq!(normalize_identifier("2024_blocks").as_deref(), Some("_2024_BLOCKS"));
        assert_eq!(normalize_identifier("--"), None);
    }

    #[test]
    fn test_load_rules_from_toml_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tables.toml");
        std::fs::write(
            &path,
            r#"
[[rules]]
pattern = '^substreams/(?P<package>[^/]+)/'
table = "${package}"
"#,
        )
        .unwrap();

        let config = TableMappingConfig::load(Some(&path)).unwrap();
        assert_eq!(config.rules.len(), 1);
        assert_eq!(config.rules[0].table, "${package}");
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(TableMappingConfig::load(Some(Path::new("/nonexistent/tables.toml"))).is_err());
    }
}
