use serde::Serialize;
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::{CommandContext, CommandError, CommandResult, parse_ps_output, run_with_timeout};
use crate::security::command_allowed;

/// Window used by `getosinfo` when `time` is absent or unusable
const DEFAULT_OSINFO_SECONDS: i64 = 3600;

fn to_content<T: Serialize>(value: &T) -> CommandResult {
    serde_json::to_value(value).map_err(|e| CommandError::Internal(e.to_string()))
}

/// A number of seconds given as a JSON number or a numeric string
pub(super) fn seconds_arg(args: &Value, key: &str) -> Option<i64> {
    match args.get(key)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f as i64))
        }
        _ => None,
    }
}

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, CommandError> {
    match args.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s),
        Some(_) => Err(CommandError::BadRequest(format!(
            "'{}' must be a non-empty string",
            key
        ))),
        None => Err(CommandError::BadRequest(format!("missing '{}' argument", key))),
    }
}

/// Program arguments given as strings or numbers
pub(super) fn program_args(args: &Value) -> Result<Vec<String>, CommandError> {
    match args.get("args") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                Value::Number(n) => Ok(n.to_string()),
                other => Err(CommandError::BadRequest(format!(
                    "'args' entries must be strings or numbers, got {}",
                    other
                ))),
            })
            .collect(),
        Some(_) => Err(CommandError::BadRequest("'args' must be an array".to_string())),
    }
}

pub(super) async fn getosinfo(ctx: Arc<CommandContext>, args: Value) -> CommandResult {
    let seconds = seconds_arg(&args, "time")
        .filter(|s| *s > 0)
        .unwrap_or(DEFAULT_OSINFO_SECONDS);
    to_content(&ctx.sampler.get(seconds))
}

pub(super) async fn watch(ctx: Arc<CommandContext>, args: Value) -> CommandResult {
    let path = required_str(&args, "path")?;
    let started = ctx
        .watches
        .start_watch(Path::new(path), seconds_arg(&args, "time"))?;
    to_content(&started)
}

/// Run a watch-store query on the blocking pool
async fn off_runtime<F>(query: F) -> CommandResult
where
    F: FnOnce() -> CommandResult + Send + 'static,
{
    tokio::task::spawn_blocking(query)
        .await
        .map_err(|e| CommandError::Internal(format!("store query failed: {}", e)))?
}

pub(super) async fn getwatches(ctx: Arc<CommandContext>, args: Value) -> CommandResult {
    let watches = ctx.watches.clone();
    let list_all = args.get("all").and_then(Value::as_bool).unwrap_or(false)
        || matches!(
            args.get("watchId").and_then(Value::as_str),
            Some("-a" | "--all")
        );
    if list_all {
        return off_runtime(move || Ok(json!({ "watchIds": watches.list_watch_ids()? }))).await;
    }

    let watch_id = required_str(&args, "watchId")?.to_string();
    if args.get("record").and_then(Value::as_bool).unwrap_or(false) {
        return off_runtime(move || to_content(&watches.get_record(&watch_id)?)).await;
    }
    off_runtime(move || to_content(&watches.get_events(&watch_id)?)).await
}

pub(super) async fn ps(ctx: Arc<CommandContext>, _args: Value) -> CommandResult {
    let args = ["-eo", "pid,comm,pcpu,pmem", "--no-headers"].map(String::from);
    let output = run_with_timeout("ps", &args, ctx.command_timeout).await?;
    if !output.status.success() {
        return Err(CommandError::Internal(failure_message("ps", &output)));
    }
    let processes = parse_ps_output(&String::from_utf8_lossy(&output.stdout));
    debug!("ps listed {} processes", processes.len());
    to_content(&processes)
}

pub(super) async fn oscmd(ctx: Arc<CommandContext>, args: Value) -> CommandResult {
    let cmd = required_str(&args, "cmd")?;
    if !command_allowed(cmd, &ctx.oscmd_whitelist) {
        return Err(CommandError::Forbidden(format!("command not allowed: {}", cmd)));
    }
    let program_args = program_args(&args)?;

    info!("Running whitelisted command {} {:?}", cmd, program_args);
    let output = run_with_timeout(cmd, &program_args, ctx.command_timeout).await?;
    if !output.status.success() {
        return Err(CommandError::Internal(failure_message(cmd, &output)));
    }
    Ok(json!({ "stdout": String::from_utf8_lossy(&output.stdout).trim() }))
}

pub(super) async fn quit(_ctx: Arc<CommandContext>, _args: Value) -> CommandResult {
    Ok(json!({ "status": "bye" }))
}

/// stderr of a failed run, or its exit status when stderr is empty
fn failure_message(program: &str, output: &std::process::Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        format!("{} failed: {}", program, output.status)
    } else {
        stderr.to_string()
    }
}
