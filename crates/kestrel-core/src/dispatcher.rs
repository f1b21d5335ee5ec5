//! Command dispatch.
//!
//! The [`Dispatcher`] owns the command-name lookup across all attached
//! containers. For each command it binds parameters, invokes the handler and
//! drains the produced responses according to the command's
//! [`ReturnShape`]. Handler failures, panics included, are converted into
//! [`DispatchError`]s at this boundary.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{Instrument, debug, error, info_span, warn};
use uuid::Uuid;

use crate::command::{BoundArgs, CommandLine, bind};
use crate::container::ModuleContainer;
use crate::error::{DispatchError, DispatchResult};
use crate::invocation::Invocation;
use crate::message::{Authority, ConversationId, MessageContext, Response};
use crate::plugin::decl::{Deferred, ErasedOutput};
use crate::plugin::descriptor::{CommandDescriptor, PluginDescriptor, ReturnShape};
use crate::response::ResponseStream;
use crate::transport::BoxedTransport;
use crate::waiter::{Conversation, WaiterRegistry};

// ─── Command table ────────────────────────────────────────────────────────────

#[derive(Clone)]
struct Route {
    container: Arc<ModuleContainer>,
    plugin: Arc<PluginDescriptor>,
    command: Arc<CommandDescriptor>,
}

/// A listing entry for one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandSummary {
    pub name: String,
    pub plugin: String,
    pub container: String,
    pub description: Option<String>,
    pub usage: String,
    pub authority: Authority,
}

/// Read-mostly command-name lookup.
///
/// Lookups take a snapshot of the current map; load and unload publish a new
/// map, so readers never see a half-updated table.
#[derive(Default)]
pub struct CommandTable {
    routes: RwLock<Arc<HashMap<String, Route>>>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> Arc<HashMap<String, Route>> {
        Arc::clone(&self.routes.read())
    }

    fn update(&self, f: impl FnOnce(&mut HashMap<String, Route>)) {
        let mut guard = self.routes.write();
        let mut next = HashMap::clone(&guard);
        f(&mut next);
        *guard = Arc::new(next);
    }

    fn route(&self, name: &str) -> Option<Route> {
        self.snapshot().get(name).cloned()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CommandDescriptor>> {
        self.snapshot().get(name).map(|r| Arc::clone(&r.command))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.snapshot().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All commands, sorted by name.
    pub fn summaries(&self) -> Vec<CommandSummary> {
        let snapshot = self.snapshot();
        let mut list: Vec<_> = snapshot
            .values()
            .map(|r| CommandSummary {
                name: r.command.name.clone(),
                plugin: r.plugin.metadata.name.clone(),
                container: r.container.name().to_string(),
                description: r.command.description.clone(),
                usage: r.command.usage(),
                authority: r.command.authority,
            })
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }
}

impl std::fmt::Debug for CommandTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        let mut names: Vec<_> = snapshot.keys().collect();
        names.sort();
        f.debug_tuple("CommandTable").field(&names).finish()
    }
}

// ─── Dispatcher ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Send a failure response to the conversation when a dispatch fails.
    pub reply_errors: bool,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self { reply_errors: true }
    }
}

pub struct Dispatcher {
    containers: RwLock<Vec<Arc<ModuleContainer>>>,
    /// Plugins skipped at attach because their identifier was taken,
    /// keyed by container name.
    shadowed: RwLock<HashSet<(String, Uuid)>>,
    commands: Arc<CommandTable>,
    waiters: Arc<WaiterRegistry>,
    transport: BoxedTransport,
    options: DispatchOptions,
}

impl Dispatcher {
    pub fn new(
        transport: BoxedTransport,
        commands: Arc<CommandTable>,
        waiters: Arc<WaiterRegistry>,
        options: DispatchOptions,
    ) -> Self {
        Self {
            containers: RwLock::new(Vec::new()),
            shadowed: RwLock::new(HashSet::new()),
            commands,
            waiters,
            transport,
            options,
        }
    }

    pub fn commands(&self) -> &Arc<CommandTable> {
        &self.commands
    }

    pub fn waiters(&self) -> &Arc<WaiterRegistry> {
        &self.waiters
    }

    pub fn transport(&self) -> &BoxedTransport {
        &self.transport
    }

    pub fn containers(&self) -> Vec<Arc<ModuleContainer>> {
        self.containers.read().clone()
    }

    pub fn container(&self, name: &str) -> Option<Arc<ModuleContainer>> {
        self.containers
            .read()
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    /// Publishes a container's commands. Returns the number of commands added.
    ///
    /// A plugin whose identifier is already attached is skipped, and a command
    /// name already taken by another container keeps its first owner.
    pub fn attach(&self, container: Arc<ModuleContainer>) -> usize {
        let attached: Vec<_> = self
            .containers
            .read()
            .iter()
            .flat_map(|c| c.plugins())
            .map(|p| p.metadata.id)
            .collect();

        let mut added = 0;
        self.commands.update(|table| {
            for plugin in container.plugins() {
                if attached.contains(&plugin.metadata.id) {
                    self.shadowed
                        .write()
                        .insert((container.name().to_string(), plugin.metadata.id));
                    warn!(
                        container = container.name(),
                        plugin    = %plugin.metadata.name,
                        id        = %plugin.metadata.id,
                        "Plugin identifier already attached, skipping"
                    );
                    continue;
                }
                for command in &plugin.commands {
                    if let Some(existing) = table.get(&command.name) {
                        warn!(
                            command  = %command.name,
                            plugin   = %plugin.metadata.name,
                            owner    = %existing.plugin.metadata.name,
                            "Command name already registered, skipping"
                        );
                        continue;
                    }
                    table.insert(
                        command.name.clone(),
                        Route {
                            container: Arc::clone(&container),
                            plugin: Arc::clone(&plugin),
                            command: Arc::clone(command),
                        },
                    );
                    added += 1;
                }
            }
        });
        self.containers.write().push(container);
        added
    }

    /// Withdraws a container and all of its commands.
    pub fn detach(&self, name: &str) -> Option<Arc<ModuleContainer>> {
        let container = {
            let mut containers = self.containers.write();
            let index = containers.iter().position(|c| c.name() == name)?;
            containers.remove(index)
        };
        self.commands
            .update(|table| table.retain(|_, r| r.container.name() != name));
        self.shadowed.write().retain(|(owner, _)| owner != name);
        Some(container)
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<CommandDescriptor>> {
        self.commands.get(name)
    }

    /// Runs one command. Returns the number of responses produced.
    ///
    /// On failure a failure response is sent (when enabled) and the error is
    /// returned.
    pub async fn dispatch_command(
        &self,
        context: MessageContext,
        line: &CommandLine,
    ) -> DispatchResult<usize> {
        let span = info_span!(
            "dispatch",
            conversation = %context.conversation(),
            command      = %line.command,
        );
        let conversation = context.conversation().clone();
        let reply_to = context.message.message_id.clone();

        let result = self.run_command(context, line).instrument(span).await;

        if let Err(e) = &result
            && self.options.reply_errors
        {
            let response = Response::reply(e.user_message(), reply_to);
            self.send(&conversation, &response).await;
        }
        result
    }

    async fn run_command(
        &self,
        context: MessageContext,
        line: &CommandLine,
    ) -> DispatchResult<usize> {
        let route = self
            .commands
            .route(&line.command)
            .ok_or_else(|| DispatchError::CommandNotFound(line.command.clone()))?;
        let Route {
            container,
            plugin,
            command,
        } = route;

        let scope = Arc::new(container.registry().create_scope());
        let args = bind(&command, line, context.authority, &scope).inspect_err(|e| {
            warn!(plugin = %plugin.metadata.name, error = %e, "Command binding failed");
        })?;

        let instance = container
            .instance(&plugin, &scope)
            .map_err(|e| handler_error(&plugin, &command.name, &e))?;
        let hooks = plugin.plugin_type.view(&instance);

        if let Some(p) = &hooks {
            p.on_executing(&context).await;
        }

        let invocation = Invocation::new(
            instance,
            args,
            context.clone(),
            Conversation::new(context.conversation().clone(), Arc::clone(&self.waiters)),
            scope,
        );
        let invoker = Arc::clone(&command.invoker);
        let result = match std::panic::catch_unwind(AssertUnwindSafe(|| invoker(invocation))) {
            Ok(Ok(output)) => {
                self.drain(command.return_shape, output, &context, &plugin, &command.name)
                    .await
            }
            Ok(Err(e)) => Err(convert_error(&plugin, &command.name, e)),
            Err(panic) => Err(panic_error(&plugin, &command.name, panic)),
        };

        if let Some(p) = &hooks {
            p.on_executed(&context).await;
        }
        result
    }

    /// Offers a non-command message to every attached plugin's message hook,
    /// in ascending plugin index order. Returns the number of responses sent.
    pub async fn dispatch_message(&self, context: MessageContext) -> usize {
        let shadowed = self.shadowed.read().clone();
        let mut hooked: Vec<(Arc<ModuleContainer>, Arc<PluginDescriptor>)> = self
            .containers()
            .into_iter()
            .flat_map(|c| {
                c.plugins()
                    .into_iter()
                    .filter(|p| p.has_message_hook())
                    .filter(|p| !shadowed.contains(&(c.name().to_string(), p.metadata.id)))
                    .map(|p| (Arc::clone(&c), p))
                    .collect::<Vec<_>>()
            })
            .collect();
        hooked.sort_by_key(|(_, p)| p.metadata.index);

        let mut sent = 0;
        for (container, plugin) in hooked {
            let span = info_span!(
                "message_hook",
                conversation = %context.conversation(),
                plugin       = %plugin.metadata.name,
            );
            match self
                .run_hook(&container, &plugin, context.clone())
                .instrument(span)
                .await
            {
                Ok(n) => sent += n,
                Err(DispatchError::ConversationTimeout(t)) => {
                    debug!(plugin = %plugin.metadata.name, timeout = ?t, "Message hook gave up waiting");
                }
                Err(e) => {
                    warn!(plugin = %plugin.metadata.name, error = %e, "Message hook failed");
                }
            }
        }
        sent
    }

    async fn run_hook(
        &self,
        container: &ModuleContainer,
        plugin: &PluginDescriptor,
        context: MessageContext,
    ) -> DispatchResult<usize> {
        const HOOK: &str = "<message>";
        let Some(hook) = plugin.message_hook.clone() else {
            return Ok(0);
        };
        let scope = Arc::new(container.registry().create_scope());
        let instance = container
            .instance(plugin, &scope)
            .map_err(|e| handler_error(plugin, HOOK, &e))?;

        let invocation = Invocation::new(
            instance,
            BoundArgs::new(),
            context.clone(),
            Conversation::new(context.conversation().clone(), Arc::clone(&self.waiters)),
            scope,
        );
        match std::panic::catch_unwind(AssertUnwindSafe(|| hook(invocation))) {
            Ok(Ok(stream)) => self.drain_stream(stream, &context, plugin, HOOK).await,
            Ok(Err(e)) => Err(convert_error(plugin, HOOK, e)),
            Err(panic) => Err(panic_error(plugin, HOOK, panic)),
        }
    }

    async fn drain(
        &self,
        shape: ReturnShape,
        output: ErasedOutput,
        context: &MessageContext,
        plugin: &PluginDescriptor,
        command: &str,
    ) -> DispatchResult<usize> {
        let conversation = context.conversation();
        let mismatch = || DispatchError::Handler {
            plugin: plugin.metadata.name.clone(),
            command: command.to_string(),
            reason: format!("handler output does not match return shape {shape:?}"),
        };

        match shape {
            ReturnShape::NoResult => Ok(0),
            ReturnShape::DeferredUnit => {
                let fut = output.downcast::<Deferred<()>>().map_err(|_| mismatch())?;
                self.await_deferred(*fut, plugin, command).await?;
                Ok(0)
            }
            ReturnShape::DeferredResponse => {
                let fut = output
                    .downcast::<Deferred<Response>>()
                    .map_err(|_| mismatch())?;
                let response = self.await_deferred(*fut, plugin, command).await?;
                self.send(conversation, &response).await;
                Ok(1)
            }
            ReturnShape::Response => {
                let response = output.downcast::<Response>().map_err(|_| mismatch())?;
                self.send(conversation, &response).await;
                Ok(1)
            }
            ReturnShape::EagerSequence => {
                let responses = output
                    .downcast::<Vec<Response>>()
                    .map_err(|_| mismatch())?;
                for response in responses.iter() {
                    self.send(conversation, response).await;
                }
                Ok(responses.len())
            }
            ReturnShape::LazySequence => {
                let stream = output
                    .downcast::<ResponseStream>()
                    .map_err(|_| mismatch())?;
                self.drain_stream(*stream, context, plugin, command).await
            }
            ReturnShape::Dynamic => {
                match self.transport.forward_dynamic(conversation, output).await {
                    Ok(()) => Ok(1),
                    Err(e) => {
                        error!(plugin = %plugin.metadata.name, command, error = %e, "Failed to forward dynamic result");
                        Ok(0)
                    }
                }
            }
        }
    }

    async fn await_deferred<T>(
        &self,
        fut: Deferred<T>,
        plugin: &PluginDescriptor,
        command: &str,
    ) -> DispatchResult<T> {
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(convert_error(plugin, command, e)),
            Err(panic) => Err(panic_error(plugin, command, panic)),
        }
    }

    /// Pulls one value at a time and sends it before pulling the next.
    async fn drain_stream(
        &self,
        mut stream: ResponseStream,
        context: &MessageContext,
        plugin: &PluginDescriptor,
        command: &str,
    ) -> DispatchResult<usize> {
        let mut sent = 0;
        loop {
            match AssertUnwindSafe(stream.next()).catch_unwind().await {
                Ok(None) => return Ok(sent),
                Ok(Some(Ok(response))) => {
                    self.send(context.conversation(), &response).await;
                    sent += 1;
                }
                Ok(Some(Err(e))) => return Err(convert_error(plugin, command, e)),
                Err(panic) => return Err(panic_error(plugin, command, panic)),
            }
        }
    }

    async fn send(&self, conversation: &ConversationId, response: &Response) {
        if let Err(e) = self.transport.send(conversation, response).await {
            error!(conversation = %conversation, error = %e, "Failed to send response");
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("containers", &self.containers.read().len())
            .field("commands", &self.commands)
            .field("options", &self.options)
            .finish()
    }
}

fn handler_error(
    plugin: &PluginDescriptor,
    command: &str,
    reason: &dyn std::fmt::Display,
) -> DispatchError {
    error!(
        plugin  = %plugin.metadata.name,
        command,
        error   = %reason,
        "Command handler failed"
    );
    DispatchError::Handler {
        plugin: plugin.metadata.name.clone(),
        command: command.to_string(),
        reason: reason.to_string(),
    }
}

/// Keeps dispatch errors raised inside handler code (such as a conversation
/// timeout) and wraps everything else as a handler failure.
fn convert_error(plugin: &PluginDescriptor, command: &str, err: anyhow::Error) -> DispatchError {
    match err.downcast::<DispatchError>() {
        Ok(e) => e,
        Err(other) => handler_error(plugin, command, &format!("{other:#}")),
    }
}

fn panic_error(
    plugin: &PluginDescriptor,
    command: &str,
    panic: Box<dyn std::any::Any + Send>,
) -> DispatchError {
    let reason = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    handler_error(plugin, command, &format!("panicked: {reason}"))
}
