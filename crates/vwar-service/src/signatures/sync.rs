//! Remote rule catalog sync.
//!
//! The catalog is a flat list of `{categoryname, rulename, conditions}`
//! entries; each maps to `<category>/<rulename>.rule` under the rules root.
//! Merge is incremental: absent files are written (new), differing files
//! are overwritten (updated), identical files are left alone. The caller
//! recompiles and swaps the match handle afterwards.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::debug;
use vwar_core::config::Endpoints;

#[derive(Debug, Deserialize)]
struct CatalogRule {
    #[serde(default)]
    categoryname: String,
    #[serde(default)]
    rulename: String,
    #[serde(default)]
    conditions: Vec<RuleCondition>,
}

#[derive(Debug, Deserialize)]
struct RuleCondition {
    #[serde(default)]
    string: String,
}

#[derive(Debug, Default, Clone)]
pub struct MergeReport {
    pub added: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub total: usize,
}

/// Keep catalog-supplied names from escaping the rules root.
fn sanitize_component(raw: &str, fallback: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        fallback.to_string()
    } else {
        cleaned
    }
}

pub async fn fetch_and_merge(
    client: &reqwest::Client,
    endpoints: &Endpoints,
    rules_dir: &Path,
) -> Result<MergeReport> {
    let response = client
        .get(&endpoints.rule_fetch_url)
        .header("X-API-Key", &endpoints.rule_fetch_key)
        .send()
        .await
        .map_err(|e| anyhow!("rule fetch: {e}"))?;
    if !response.status().is_success() {
        return Err(anyhow!("rule fetch failed with status {}", response.status()));
    }
    let catalog: Vec<CatalogRule> = response
        .json()
        .await
        .map_err(|e| anyhow!("rule catalog decode: {e}"))?;

    let mut report = MergeReport {
        total: catalog.len(),
        ..Default::default()
    };

    for rule in &catalog {
        let category = sanitize_component(&rule.categoryname, "uncategorized");
        let name = sanitize_component(&rule.rulename, "unknown_rule");
        let content = rule
            .conditions
            .first()
            .map(|c| c.string.as_str())
            .unwrap_or_default();
        if content.trim().is_empty() {
            debug!(rule = %name, "skipping catalog entry with empty pattern");
            continue;
        }

        let category_dir = rules_dir.join(&category);
        fs::create_dir_all(&category_dir)
            .with_context(|| format!("create {}", category_dir.display()))?;
        let path = category_dir.join(format!("{name}.rule"));

        match fs::read(&path) {
            Ok(existing) if existing == content.as_bytes() => report.unchanged += 1,
            Ok(_) => {
                fs::write(&path, content)?;
                report.updated += 1;
            }
            Err(_) => {
                fs::write(&path, content)?;
                report.added += 1;
            }
        }
    }

    Ok(report)
}

pub async fn insert_rule(
    client: &reqwest::Client,
    endpoints: &Endpoints,
    category: &str,
    rule: &str,
    strings: &str,
) -> Result<bool> {
    let response = client
        .post(&endpoints.rule_insert_url)
        .header("API-Key", &endpoints.rule_insert_key)
        .json(&serde_json::json!({
            "category": category,
            "rule": rule,
            "strings": strings,
        }))
        .send()
        .await
        .map_err(|e| anyhow!("rule insert: {e}"))?;
    Ok(response.status().is_success())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_traversal() {
        let cleaned = sanitize_component("../../etc", "x");
        assert!(!cleaned.contains('/') && !cleaned.contains('\\'));
        assert!(!cleaned.starts_with('.'));
        assert_eq!(sanitize_component("", "uncategorized"), "uncategorized");
        assert_eq!(sanitize_component("trojan.generic", "x"), "trojan.generic");
        assert_eq!(sanitize_component("a/b\\c", "x"), "a_b_c");
    }
}
