//! Runtime tool path resolution
//!
//! External binaries (helm) are resolved through the
//! derivation-to-environment-variable pattern: check `{TOOL}_BIN` first,
//! fall back to PATH-based invocation. Nix environments export exact
//! derivation paths via the envvar; everywhere else the PATH wins.

use std::env;

/// Get the path to an external tool
///
/// Checks for an environment variable `{TOOL}_BIN` (uppercase tool name +
/// "_BIN"). Falls back to the tool name itself, which relies on PATH.
pub fn get_tool_path(tool: &str) -> String {
    let envvar = format!("{}_BIN", tool.to_uppercase());
    env::var(&envvar).unwrap_or_else(|_| tool.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_tool_name() {
        assert_eq!(get_tool_path("definitely-not-set"), "definitely-not-set");
    }

    #[test]
    fn prefers_env_override() {
        env::set_var("FAKETOOL_BIN", "/nix/store/abc/bin/faketool");
        assert_eq!(get_tool_path("faketool"), "/nix/store/abc/bin/faketool");
        env::remove_var("FAKETOOL_BIN");
    }
}
