use schemars::JsonSchema;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct GitCloneArgs {
    /// Repository URL (https, http, git, ssh or `user@host:path`).
    pub url:       String,
    /// Target directory relative to the workspace root. Defaults to the repository name.
    #[serde(default)]
    pub directory: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ListFilesArgs {
    /// Directory path relative to the workspace root. Defaults to ".".
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ReadFileArgs {
    /// File path relative to the workspace root.
    pub path:       String,
    /// First line to return (1-based, inclusive).
    #[serde(default)]
    pub start_line: Option<usize>,
    /// Last line to return (1-based, inclusive).
    #[serde(default)]
    pub end_line:   Option<usize>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SearchFilesArgs {
    /// Rust-style regular expression, matched per line.
    pub pattern: String,
    /// Optional directory to scope the search. Defaults to the workspace root.
    #[serde(default)]
    pub path:    Option<String>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct BashArgs {
    /// Shell command, run with `sh -c` from the workspace root.
    pub command: String,
}
