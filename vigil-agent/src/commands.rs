//! Command registry and dispatch.
//!
//! Every command an authenticated connection may run is registered here by
//! name, with a short description and usage line that feed the generated
//! `help` output. Handlers are async functions taking the shared
//! [`CommandContext`] and the request's `args`.

mod handlers;
mod process;

pub use process::{ProcessInfo, parse_ps_output, run_with_timeout};

use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use vigil_protocol::protocol::codes;

use crate::sampler::Sampler;
use crate::watcher::{WatchError, WatchManager};

/// Handler failure. Each variant maps to the wire `code` of the error envelope.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    InvalidPath(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Internal(String),
}

impl CommandError {
    pub fn code(&self) -> &'static str {
        match self {
            CommandError::BadRequest(_) => codes::BAD_REQUEST,
            CommandError::Forbidden(_) => codes::FORBIDDEN,
            CommandError::InvalidPath(_) => codes::INVALID_PATH,
            CommandError::NotFound(_) => codes::NOT_FOUND,
            CommandError::Internal(_) => codes::INTERNAL_ERROR,
        }
    }
}

impl From<WatchError> for CommandError {
    fn from(e: WatchError) -> Self {
        match e {
            WatchError::InvalidPath(msg) => CommandError::InvalidPath(msg),
            WatchError::NotFound(id) => CommandError::NotFound(format!("watch not found: {}", id)),
            other => CommandError::Internal(other.to_string()),
        }
    }
}

pub type CommandResult = std::result::Result<Value, CommandError>;

type HandlerFuture = Pin<Box<dyn Future<Output = CommandResult> + Send>>;
type Handler = Arc<dyn Fn(Arc<CommandContext>, Value) -> HandlerFuture + Send + Sync>;

/// Shared state handlers operate on
pub struct CommandContext {
    pub sampler: Arc<Sampler>,
    pub watches: Arc<WatchManager>,
    /// Program names `oscmd` may run
    pub oscmd_whitelist: Vec<String>,
    /// Bound on `ps` and `oscmd`
    pub command_timeout: Duration,
}

struct CommandEntry {
    desc: &'static str,
    usage: &'static str,
    closes_connection: bool,
    handler: Handler,
}

/// Builder for [`CommandRegistry`]
#[derive(Default)]
pub struct CommandRegistryBuilder {
    entries: HashMap<&'static str, CommandEntry>,
}

impl CommandRegistryBuilder {
    /// Register a handler under `name`, replacing any previous one
    pub fn register<F, Fut>(
        mut self,
        name: &'static str,
        desc: &'static str,
        usage: &'static str,
        handler: F,
    ) -> Self
    where
        F: Fn(Arc<CommandContext>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CommandResult> + Send + 'static,
    {
        self.entries.insert(
            name,
            CommandEntry {
                desc,
                usage,
                closes_connection: false,
                handler: Arc::new(move |ctx: Arc<CommandContext>, args: Value| -> HandlerFuture {
                    Box::pin(handler(ctx, args))
                }),
            },
        );
        self
    }

    /// Mark an already registered command as ending the connection after its reply
    pub fn closes_connection(mut self, name: &'static str) -> Self {
        if let Some(entry) = self.entries.get_mut(name) {
            entry.closes_connection = true;
        }
        self
    }

    /// Finish the registry, adding a `help` command describing every entry
    pub fn build(mut self) -> CommandRegistry {
        let mut commands = Map::new();
        commands.insert(
            "help".to_string(),
            json!({"desc": "List available commands", "usage": "help"}),
        );
        for (name, entry) in &self.entries {
            commands.insert(
                name.to_string(),
                json!({"desc": entry.desc, "usage": entry.usage}),
            );
        }
        let help = Arc::new(json!({ "commands": commands }));

        self.entries.insert(
            "help",
            CommandEntry {
                desc: "List available commands",
                usage: "help",
                closes_connection: false,
                handler: Arc::new(move |_ctx: Arc<CommandContext>, _args: Value| -> HandlerFuture {
                    let help = help.clone();
                    Box::pin(async move { Ok((*help).clone()) })
                }),
            },
        );

        CommandRegistry {
            entries: self.entries,
        }
    }
}

/// Name to handler table consulted for every authenticated request
pub struct CommandRegistry {
    entries: HashMap<&'static str, CommandEntry>,
}

impl CommandRegistry {
    pub fn builder() -> CommandRegistryBuilder {
        CommandRegistryBuilder::default()
    }

    /// Registry holding every built-in command
    pub fn standard() -> Self {
        Self::builder()
            .register(
                "getosinfo",
                "Recent load average and free memory samples",
                "getosinfo [time=<seconds>]",
                handlers::getosinfo,
            )
            .register(
                "watch",
                "Watch a directory for changes for a limited time",
                "watch path=<dir> [time=<seconds>]",
                handlers::watch,
            )
            .register(
                "getwatches",
                "Events of one watch, or every watch id",
                "getwatches watchId=<id> [record=true] | getwatches all=true",
                handlers::getwatches,
            )
            .register(
                "ps",
                "List running processes",
                "ps",
                handlers::ps,
            )
            .register(
                "oscmd",
                "Run a whitelisted command",
                "oscmd cmd=<name> [args=<arg>...]",
                handlers::oscmd,
            )
            .register("quit", "Close the connection", "quit", handlers::quit)
            .closes_connection("quit")
            .build()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn closes_connection(&self, name: &str) -> bool {
        self.entries
            .get(name)
            .is_some_and(|entry| entry.closes_connection)
    }

    /// Registered command names, sorted
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.entries.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Run `name` with `args`. Unknown names are a bad request.
    pub async fn dispatch(&self, ctx: &Arc<CommandContext>, name: &str, args: Value) -> CommandResult {
        let Some(entry) = self.entries.get(name) else {
            return Err(CommandError::BadRequest(format!("unknown command: {}", name)));
        };
        let future = (entry.handler)(ctx.clone(), args);
        future.await
    }
}
