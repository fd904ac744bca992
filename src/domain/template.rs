//! Template substitution for namespaces and release names
//!
//! Artifacts specs address a whitelisted context only; anything else left in
//! the pattern after substitution is rejected rather than silently shipped
//! into a Kubernetes resource name.

use regex::Regex;
use std::sync::OnceLock;

use crate::error::{CoreError, CoreResult};

/// Whitelisted variables available to namespace and release-name templates
///
/// Supported placeholders:
/// - `{app_name}`, `{app_type}`, `{project}`, `{env}`, `{cluster}`
/// - `{repo.namespace}`, `{repo.name}`, `{repo.full_name}`, `{repo.app_count}`
/// - `{build.image_tag}`
#[derive(Debug, Clone)]
pub struct RenderContext {
    pub app_name: String,
    pub app_type: String,
    pub project: String,
    pub env: String,
    pub cluster: String,
    pub repo_namespace: String,
    pub repo_name: String,
    pub repo_full_name: String,
    pub repo_app_count: i32,
    pub image_tag: String,
}

impl RenderContext {
    /// Expand a pattern by substituting template variables
    pub fn expand(&self, pattern: &str) -> CoreResult<String> {
        let expanded = pattern
            .replace("{app_name}", &self.app_name)
            .replace("{app_type}", &self.app_type)
            .replace("{project}", &self.project)
            .replace("{env}", &self.env)
            .replace("{cluster}", &self.cluster)
            .replace("{repo.namespace}", &self.repo_namespace)
            .replace("{repo.name}", &self.repo_name)
            .replace("{repo.full_name}", &self.repo_full_name)
            .replace("{repo.app_count}", &self.repo_app_count.to_string())
            .replace("{build.image_tag}", &self.image_tag);

        if let Some(found) = placeholder_re().find(&expanded) {
            return Err(CoreError::Template(format!(
                "unknown placeholder {} in pattern '{}'",
                found.as_str(),
                pattern
            )));
        }
        Ok(expanded)
    }
}

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{[A-Za-z0-9_.]+\}").expect("static regex"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RenderContext {
        RenderContext {
            app_name: "cart".into(),
            app_type: "backend".into(),
            project: "shop".into(),
            env: "pre".into(),
            cluster: "eu-1".into(),
            repo_namespace: "pleme".into(),
            repo_name: "cart".into(),
            repo_full_name: "pleme/cart".into(),
            repo_app_count: 3,
            image_tag: "v1.4.2".into(),
        }
    }

    #[test]
    fn expands_namespace_pattern() {
        let out = ctx().expand("{project}-{env}").unwrap();
        assert_eq!(out, "shop-pre");
    }

    #[test]
    fn expands_repo_and_build_vars() {
        let out = ctx()
            .expand("{repo.namespace}/{repo.name}:{build.image_tag}")
            .unwrap();
        assert_eq!(out, "pleme/cart:v1.4.2");
    }

    #[test]
    fn rejects_unknown_placeholder() {
        let err = ctx().expand("{project}-{team}").unwrap_err();
        assert!(matches!(err, CoreError::Template(_)));
    }

    #[test]
    fn literal_text_passes_through() {
        assert_eq!(ctx().expand("static-ns").unwrap(), "static-ns");
    }
}
