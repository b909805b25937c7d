use std::path::{Path, PathBuf};

use serde_json::{Value, json};

use super::{
    ToolError,
    args::{BashArgs, GitCloneArgs, ListFilesArgs, ReadFileArgs, SearchFilesArgs},
    paths::confine,
};
use crate::{
    config::ToolSettings,
    sandbox::{ExecRequest, OperationError, ProviderError, Sandbox},
};

fn display(path: &Path) -> String {
    path.display().to_string()
}

pub(super) async fn git_clone(
    sandbox: &Sandbox,
    settings: &ToolSettings,
    args: GitCloneArgs,
) -> Result<Value, ToolError> {
    let url = args.url.trim();
    validate_clone_url(url)?;

    let directory = match args.directory.as_deref() {
        Some(dir) if !dir.trim().is_empty() => dir.to_string(),
        _ => repository_name(url),
    };
    let target = confine(sandbox.workspace_path(), &directory)?;
    if target == Path::new(".") {
        return Err(ToolError::CloneError(
            "target directory must not be the workspace root".into(),
        ));
    }

    let request = ExecRequest {
        program:          "git".to_string(),
        args:             vec![
            "clone".to_string(),
            "--depth".to_string(),
            "1".to_string(),
            "--".to_string(),
            url.to_string(),
            display(&target),
        ],
        cwd:              PathBuf::from("."),
        timeout:          settings.bash_timeout,
        max_output_bytes: settings.max_output_bytes,
    };

    let output = match sandbox.exec(&request).await {
        Ok(output) => output,
        Err(OperationError::Provider(ProviderError::Timeout(after))) => {
            return Err(ToolError::CloneError(format!("timed out after {after:?}")));
        }
        Err(err) => return Err(err.into()),
    };

    if output.exit_code != Some(0) {
        let stderr = output.stderr.trim();
        return Err(ToolError::CloneError(if stderr.is_empty() {
            format!("git exited with status {:?}", output.exit_code)
        } else {
            stderr.to_string()
        }));
    }

    Ok(json!({
        "url": url,
        "directory": display(&target),
    }))
}

/// Accept the URL forms git understands over the network; reject option injection.
pub(super) fn validate_clone_url(url: &str) -> Result<(), ToolError> {
    let invalid = |reason: &str| Err(ToolError::CloneError(format!("invalid URL `{url}`: {reason}")));

    if url.is_empty() {
        return invalid("empty");
    }
    if url.starts_with('-') {
        return invalid("must not start with '-'");
    }
    if url.chars().any(char::is_whitespace) {
        return invalid("contains whitespace");
    }

    let scheme_ok = ["https://", "http://", "git://", "ssh://"]
        .iter()
        .any(|scheme| url.starts_with(scheme) && url.len() > scheme.len());
    let scp_like = url
        .split_once(':')
        .is_some_and(|(host, path)| host.contains('@') && !host.contains('/') && !path.is_empty());

    if scheme_ok || scp_like {
        Ok(())
    } else {
        invalid("expected https://, http://, git://, ssh:// or user@host:path")
    }
}

/// Last path segment of the URL without a trailing `.git`.
pub(super) fn repository_name(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    let last = trimmed
        .rsplit(['/', ':'])
        .next()
        .unwrap_or_default()
        .trim_end_matches(".git");
    if last.is_empty() {
        "repo".to_string()
    } else {
        last.to_string()
    }
}

pub(super) async fn list_files(sandbox: &Sandbox, args: ListFilesArgs) -> Result<Value, ToolError> {
    let path = confine(sandbox.workspace_path(), args.path.as_deref().unwrap_or("."))?;
    let entries = sandbox.list_dir(&path).await?;
    let rendered = entries
        .into_iter()
        .map(|entry| {
            json!({
                "name": entry.name,
                "path": display(&entry.path),
                "kind": entry.kind.as_str(),
                "size": entry.size,
            })
        })
        .collect::<Vec<_>>();
    Ok(json!({ "path": display(&path), "entries": rendered }))
}

pub(super) async fn read_file(
    sandbox: &Sandbox,
    settings: &ToolSettings,
    args: ReadFileArgs,
) -> Result<Value, ToolError> {
    let path = confine(sandbox.workspace_path(), &args.path)?;

    if args.start_line.is_none() && args.end_line.is_none() {
        let content = sandbox.read_file(&path, settings.max_file_bytes).await?;
        return Ok(json!({
            "path": display(&path),
            "content": content,
        }));
    }

    let start_line = args.start_line.unwrap_or(1);
    let end_line = args.end_line.unwrap_or(usize::MAX);
    if start_line == 0 {
        return Err(ToolError::InvalidArguments("start_line must be >= 1".into()));
    }
    if end_line < start_line {
        return Err(ToolError::InvalidArguments("end_line must be >= start_line".into()));
    }

    let slice = sandbox
        .read_lines(&path, start_line, end_line, settings.max_file_bytes)
        .await?;
    let Some((first, last)) = slice.range else {
        return Err(ToolError::InvalidArguments(format!(
            "requested range {start_line}-{end_line} is past the end of the file ({} lines)",
            slice.lines_seen
        )));
    };
    Ok(json!({
        "path": display(&path),
        "start_line": first,
        "end_line": last,
        "content": slice.text,
    }))
}

pub(super) async fn search_files(
    sandbox: &Sandbox,
    settings: &ToolSettings,
    args: SearchFilesArgs,
) -> Result<Value, ToolError> {
    if args.pattern.is_empty() {
        return Err(ToolError::InvalidQuery("pattern must not be empty".into()));
    }
    let scope = confine(sandbox.workspace_path(), args.path.as_deref().unwrap_or("."))?;
    let results = sandbox
        .search(&scope, &args.pattern, settings.max_search_matches)
        .await?;

    let rendered = results
        .matches
        .into_iter()
        .map(|m| {
            json!({
                "path": display(&m.path),
                "line_number": m.line_number,
                "line": m.line,
            })
        })
        .collect::<Vec<_>>();
    Ok(json!({ "matches": rendered, "truncated": results.truncated }))
}

pub(super) async fn bash(
    sandbox: &Sandbox,
    settings: &ToolSettings,
    args: BashArgs,
) -> Result<Value, ToolError> {
    if args.command.trim().is_empty() {
        return Err(ToolError::InvalidArguments("command must not be empty".into()));
    }

    let request = ExecRequest::shell(&args.command, settings.bash_timeout, settings.max_output_bytes);
    let output = sandbox.exec(&request).await?;

    match output.exit_code {
        Some(0) => Ok(json!({
            "exit_code": 0,
            "stdout": output.stdout,
            "stderr": output.stderr,
            "truncated": output.output_truncated,
        })),
        code => Err(ToolError::NonZeroExit {
            code:   code.unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        }),
    }
}
