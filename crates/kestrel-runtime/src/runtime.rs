//! The Kestrel runtime host.
//!
//! [`KestrelRuntime`] owns the dispatcher, the containers loaded from the
//! plugin directory and the background tasks. Transports hand every inbound
//! message to [`KestrelRuntime::deliver`] (or await
//! [`KestrelRuntime::handle_message`] directly).
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use kestrel_runtime::KestrelRuntime;
//!
//! let runtime = KestrelRuntime::builder()
//!     .config_file("kestrel.toml")
//!     .transport(my_transport)
//!     .artifact(Artifact::new("dice", "1.0.0").plugin::<DicePlugin>())
//!     .build()?;
//!
//! runtime.run().await?;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tokio::signal;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use kestrel_core::{
    Artifact, ArtifactCatalog, BoxedTransport, CommandLine, CommandTable, ContactsProvider,
    ConversationId, DispatchOptions, DispatchResult, Dispatcher, HOST_CONTAINER, InboundMessage,
    LoadError, MemoryContacts, MessageContext, ModuleContainer, ServiceRegistration, Transport,
    WaiterRegistry, enrich,
};

use crate::config::{ConfigLoader, KestrelConfig};
use crate::error::{RuntimeError, RuntimeResult};
use crate::logging;
use crate::scan::{self, ContainerSource};
use crate::settings::PluginSettings;

type Gate = Arc<AsyncMutex<()>>;

/// What happened to one inbound message.
#[derive(Debug)]
pub enum Routed {
    /// Handed to a handler waiting on this conversation.
    Resumed,
    /// Dispatched as a command.
    Command {
        name: String,
        result: DispatchResult<usize>,
    },
    /// Offered to message hooks; `responses` were sent.
    Message { responses: usize },
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeStats {
    pub containers: usize,
    pub plugins: usize,
    pub commands: usize,
    pub pending_waiters: usize,
    pub resolved_waiters: u64,
    pub timed_out_waiters: u64,
}

pub struct KestrelRuntime {
    config: KestrelConfig,
    catalog: ArtifactCatalog,
    host_artifacts: Vec<Artifact>,
    host_services: Vec<ServiceRegistration>,
    contacts: Arc<dyn ContactsProvider>,
    dispatcher: Arc<Dispatcher>,
    host: RwLock<Option<Arc<ModuleContainer>>>,
    /// One async mutex per conversation with a message in flight.
    gates: Mutex<HashMap<ConversationId, Gate>>,
    /// Serializes start, load, unload and shutdown.
    lifecycle: AsyncMutex<()>,
    started: AtomicBool,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl KestrelRuntime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    pub fn config(&self) -> &KestrelConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn commands(&self) -> &Arc<CommandTable> {
        self.dispatcher.commands()
    }

    pub fn waiters(&self) -> &Arc<WaiterRegistry> {
        self.dispatcher.waiters()
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.cancel.is_cancelled()
    }

    /// Names of the loaded containers, host first.
    pub fn containers(&self) -> Vec<String> {
        self.dispatcher
            .containers()
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    pub fn stats(&self) -> RuntimeStats {
        let containers = self.dispatcher.containers();
        let waiters = self.waiters();
        RuntimeStats {
            containers: containers.len(),
            plugins: containers.iter().map(|c| c.plugins().len()).sum(),
            commands: self.commands().len(),
            pending_waiters: waiters.len(),
            resolved_waiters: waiters.resolved_count(),
            timed_out_waiters: waiters.timed_out_count(),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Loads the host container, then every container under the plugin
    /// directory, and starts the contacts refresh task.
    ///
    /// A container that fails to load is logged and skipped.
    pub async fn start(&self) -> RuntimeResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(RuntimeError::AlreadyStarted);
        }
        let started_at = Instant::now();
        info!(
            plugins = %self.config.plugins.directory.display(),
            builtin = self.config.plugins.builtin,
            "Starting Kestrel runtime"
        );

        let host = match self.load_host() {
            Ok(host) => Arc::new(host),
            Err(e) => {
                self.started.store(false, Ordering::Release);
                return Err(e);
            }
        };
        for failed in host.initialize().await {
            warn!(container = HOST_CONTAINER, plugin = %failed, "Host plugin disabled");
        }
        let commands = self.dispatcher.attach(Arc::clone(&host));
        debug!(container = HOST_CONTAINER, commands, "Host container attached");
        *self.host.write() = Some(host);

        let sources = scan::scan_root(&self.config.plugins.directory, &self.catalog)
            .unwrap_or_else(|e| {
                error!(error = %e, "Plugin directory unavailable; running host plugins only");
                Vec::new()
            });
        for source in sources {
            let name = source.name.clone();
            if let Err(e) = self.attach_source(source).await {
                error!(container = %name, error = %e, "Failed to load container");
            }
        }

        if let Err(e) = self.contacts.refresh().await {
            warn!(error = %format!("{e:#}"), "Initial contacts refresh failed");
        }
        self.spawn_contacts_refresh();

        info!(
            "Plugin initialization done in {:.3}s",
            started_at.elapsed().as_secs_f64()
        );
        Ok(())
    }

    fn load_host(&self) -> RuntimeResult<ModuleContainer> {
        let mut artifacts = Vec::new();
        if self.config.plugins.builtin {
            artifacts.extend(ArtifactCatalog::builtin());
        }
        artifacts.extend(self.host_artifacts.iter().cloned());

        let transport: BoxedTransport = Arc::clone(self.dispatcher.transport());
        let mut shared = vec![
            ServiceRegistration::instance::<dyn Transport>(transport),
            ServiceRegistration::instance::<dyn ContactsProvider>(Arc::clone(&self.contacts)),
            ServiceRegistration::instance(Arc::new(PluginSettings::new(
                self.config.plugins.settings.clone(),
            ))),
            ServiceRegistration::instance(Arc::clone(self.dispatcher.commands())),
        ];
        shared.extend(self.host_services.iter().cloned());

        Ok(ModuleContainer::load_host(artifacts, shared)?)
    }

    fn host(&self) -> RuntimeResult<Arc<ModuleContainer>> {
        self.host.read().clone().ok_or(RuntimeError::NotStarted)
    }

    async fn attach_source(&self, source: ContainerSource) -> RuntimeResult<usize> {
        let host = self.host()?;
        if self.dispatcher.container(&source.name).is_some() {
            return Err(LoadError::ContainerExists(source.name).into());
        }

        let started_at = Instant::now();
        let container = ModuleContainer::load(&source.name, source.artifacts, &host)?;
        let failed = container.initialize().await;
        let container = Arc::new(container);
        let plugins = container.plugins().len();
        let commands = self.dispatcher.attach(container);

        info!(
            container  = %source.name,
            path       = %source.path.display(),
            plugins,
            commands,
            failed     = failed.len(),
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "Container loaded"
        );
        Ok(commands)
    }

    /// Loads `<plugin directory>/<name>` as a new container.
    /// Returns the number of commands it published.
    pub async fn load_container(&self, name: &str) -> RuntimeResult<usize> {
        let _lifecycle = self.lifecycle.lock().await;
        self.load_container_locked(name).await
    }

    async fn load_container_locked(&self, name: &str) -> RuntimeResult<usize> {
        if name == HOST_CONTAINER {
            return Err(LoadError::ContainerExists(name.to_string()).into());
        }
        let dir = self.config.plugins.directory.join(name);
        let source = scan::scan_container(&dir, &self.catalog)?;
        self.attach_source(source).await
    }

    /// Withdraws a container's commands, runs its plugins' teardown and
    /// drops it. The host container cannot be unloaded.
    pub async fn unload_container(&self, name: &str) -> RuntimeResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        self.unload_container_locked(name).await
    }

    async fn unload_container_locked(&self, name: &str) -> RuntimeResult<()> {
        if name == HOST_CONTAINER {
            return Err(LoadError::HostContainer.into());
        }
        let container = self
            .dispatcher
            .detach(name)
            .ok_or_else(|| LoadError::ContainerNotFound(name.to_string()))?;
        container.unload().await?;
        Ok(())
    }

    /// Unloads and loads a container again from its directory.
    pub async fn reload_container(&self, name: &str) -> RuntimeResult<usize> {
        let _lifecycle = self.lifecycle.lock().await;
        self.unload_container_locked(name).await?;
        self.load_container_locked(name).await
    }

    /// Stops background tasks and tears down every container, host last.
    pub async fn shutdown(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if !self.started.load(Ordering::Acquire) || self.cancel.is_cancelled() {
            return;
        }
        info!("Stopping Kestrel runtime");
        self.cancel.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        let mut containers = self.dispatcher.containers();
        containers.reverse();
        for container in containers {
            self.dispatcher.detach(container.name());
            container.shutdown().await;
        }
        self.host.write().take();
        info!("Runtime stopped");
    }

    /// Starts, waits for Ctrl+C (or SIGTERM on unix), then shuts down.
    pub async fn run(&self) -> RuntimeResult<()> {
        self.run_until(wait_for_signal()).await
    }

    pub async fn run_until<F>(&self, shutdown: F) -> RuntimeResult<()>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        info!("Kestrel runtime is now running");
        shutdown.await;
        self.shutdown().await;
        Ok(())
    }

    fn spawn_contacts_refresh(&self) {
        let contacts = Arc::clone(&self.contacts);
        let period = self.config.contacts.refresh_interval();
        let cancel = self.cancel.child_token();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match contacts.refresh().await {
                            Ok(()) => debug!("Contacts refreshed"),
                            Err(e) => warn!(error = %format!("{e:#}"), "Contacts refresh failed"),
                        }
                    }
                }
            }
            debug!("Contacts refresh task stopped");
        });
        self.tasks.lock().push(handle);
    }

    // =========================================================================
    // Inbound routing
    // =========================================================================

    /// Routes one inbound message on a spawned task.
    pub fn deliver(self: &Arc<Self>, message: InboundMessage) -> JoinHandle<Routed> {
        let runtime = Arc::clone(self);
        tokio::spawn(async move { runtime.handle_message(message).await })
    }

    /// Routes one inbound message and waits until it is fully handled.
    ///
    /// A handler waiting on the message's conversation gets the message.
    /// Otherwise the message waits for its conversation's gate and is then
    /// dispatched as a command or offered to message hooks. Messages of
    /// different conversations never wait on each other.
    pub async fn handle_message(&self, message: InboundMessage) -> Routed {
        let context = enrich(
            message,
            self.contacts.as_ref(),
            &self.config.dispatch.root_users,
        );
        let conversation = context.conversation().clone();
        let waiters = Arc::clone(self.waiters());

        let context = match waiters.try_resolve(context) {
            Ok(()) => return Routed::Resumed,
            Err(context) => context,
        };

        let gate = self.gate(&conversation);
        let (guard, context) = match acquire_gate(&gate, &waiters, context).await {
            Some(acquired) => acquired,
            None => {
                self.release_gate(&conversation, gate);
                return Routed::Resumed;
            }
        };

        let routed = self.dispatch(context).await;

        drop(guard);
        self.release_gate(&conversation, gate);
        routed
    }

    async fn dispatch(&self, context: MessageContext) -> Routed {
        let prefix = &self.config.dispatch.command_prefix;
        match CommandLine::parse(context.text(), prefix) {
            Some(line) => {
                debug!(
                    conversation = %context.conversation(),
                    command      = %line.command,
                    "Command received"
                );
                let result = self.dispatcher.dispatch_command(context, &line).await;
                Routed::Command {
                    name: line.command,
                    result,
                }
            }
            None => Routed::Message {
                responses: self.dispatcher.dispatch_message(context).await,
            },
        }
    }

    fn gate(&self, conversation: &ConversationId) -> Gate {
        Arc::clone(self.gates.lock().entry(conversation.clone()).or_default())
    }

    fn release_gate(&self, conversation: &ConversationId, gate: Gate) {
        let mut gates = self.gates.lock();
        // The map's handle and ours.
        if Arc::strong_count(&gate) <= 2 {
            gates.remove(conversation);
        }
    }
}

impl std::fmt::Debug for KestrelRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KestrelRuntime")
            .field("containers", &self.containers())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Waits for the conversation gate. A waiter registered on the same
/// conversation meanwhile takes the message instead (`None`).
async fn acquire_gate(
    gate: &Gate,
    waiters: &WaiterRegistry,
    mut context: MessageContext,
) -> Option<(tokio::sync::OwnedMutexGuard<()>, MessageContext)> {
    loop {
        let registered = waiters.registered();
        tokio::pin!(registered);
        registered.as_mut().enable();

        context = waiters.try_resolve(context).err()?;

        tokio::select! {
            guard = Arc::clone(gate).lock_owned() => {
                let context = waiters.try_resolve(context).err()?;
                return Some((guard, context));
            }
            () = &mut registered => {}
        }
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                }
                return;
            }
            Err(e) => warn!(error = %e, "Cannot listen for SIGTERM"),
        }
    }

    if let Err(e) = signal::ctrl_c().await {
        error!(error = %e, "Cannot listen for Ctrl+C, shutting down");
        return;
    }
    info!("Received Ctrl+C, shutting down");
}

// =============================================================================
// RuntimeBuilder
// =============================================================================

pub struct RuntimeBuilder {
    config_loader: ConfigLoader,
    config: Option<KestrelConfig>,
    transport: Option<BoxedTransport>,
    contacts: Option<Arc<dyn ContactsProvider>>,
    catalog: ArtifactCatalog,
    host_artifacts: Vec<Artifact>,
    host_services: Vec<ServiceRegistration>,
    init_logging: bool,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            config_loader: ConfigLoader::new().with_current_dir(),
            config: None,
            transport: None,
            contacts: None,
            catalog: ArtifactCatalog::new(),
            host_artifacts: Vec::new(),
            host_services: Vec::new(),
            init_logging: true,
        }
    }

    pub fn config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.file(path);
        self
    }

    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.config_loader = self.config_loader.profile(profile);
        self
    }

    pub fn search_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.search_path(path);
        self
    }

    pub fn without_env(mut self) -> Self {
        self.config_loader = self.config_loader.without_env();
        self
    }

    pub fn merge(mut self, config: KestrelConfig) -> Self {
        self.config_loader = self.config_loader.merge(config);
        self
    }

    /// Uses `config` as is instead of loading one.
    pub fn config(mut self, config: KestrelConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn transport<T: Transport + 'static>(mut self, transport: Arc<T>) -> Self {
        self.transport = Some(transport as BoxedTransport);
        self
    }

    /// Roster used for enrichment. Defaults to an empty [`MemoryContacts`].
    pub fn contacts<C: ContactsProvider + 'static>(mut self, contacts: Arc<C>) -> Self {
        self.contacts = Some(contacts as Arc<dyn ContactsProvider>);
        self
    }

    /// Makes an artifact available to plugin directory manifests.
    pub fn artifact(mut self, artifact: Artifact) -> Self {
        self.catalog.insert(artifact);
        self
    }

    pub fn catalog(mut self, catalog: ArtifactCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Loads an artifact into the permanent host container.
    pub fn host_artifact(mut self, artifact: Artifact) -> Self {
        self.host_artifacts.push(artifact);
        self
    }

    /// Registers a shared service on the host, visible to every container.
    pub fn host_service(mut self, registration: ServiceRegistration) -> Self {
        self.host_services.push(registration);
        self
    }

    /// Leaves the global tracing subscriber alone.
    pub fn without_logging(mut self) -> Self {
        self.init_logging = false;
        self
    }

    pub fn build(self) -> RuntimeResult<Arc<KestrelRuntime>> {
        let config = match self.config {
            Some(config) => {
                crate::config::validate_config(&config)?;
                config
            }
            None => self.config_loader.load()?,
        };
        if self.init_logging {
            logging::init_from_config(&config.logging);
        }
        let transport = self.transport.ok_or(RuntimeError::MissingTransport)?;
        let contacts = self
            .contacts
            .unwrap_or_else(|| Arc::new(MemoryContacts::new()));

        let dispatcher = Arc::new(Dispatcher::new(
            transport,
            Arc::new(CommandTable::new()),
            Arc::new(WaiterRegistry::new()),
            DispatchOptions {
                reply_errors: config.dispatch.reply_errors,
            },
        ));

        info!(
            log_level      = %config.logging.level,
            command_prefix = %config.dispatch.command_prefix,
            artifacts      = self.catalog.names().count(),
            "Runtime initialized from configuration"
        );

        Ok(Arc::new(KestrelRuntime {
            config,
            catalog: self.catalog,
            host_artifacts: self.host_artifacts,
            host_services: self.host_services,
            contacts,
            dispatcher,
            host: RwLock::new(None),
            gates: Mutex::new(HashMap::new()),
            lifecycle: AsyncMutex::new(()),
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }))
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;

    use kestrel_core::prelude::*;
    use kestrel_core::{ChannelInfo, DispatchError, MemberInfo, TransportError};

    use super::*;

    #[derive(Default)]
    struct Capture(Mutex<Vec<String>>);

    impl Capture {
        fn texts(&self) -> Vec<String> {
            self.0.lock().clone()
        }
    }

    #[async_trait]
    impl Transport for Capture {
        async fn send(&self, _: &ConversationId, response: &Response) -> Result<(), TransportError> {
            self.0.lock().push(response.text.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingContacts {
        refreshes: AtomicUsize,
    }

    #[async_trait]
    impl ContactsProvider for CountingContacts {
        fn try_resolve_member(&self, _: &str, _: &str, _: Option<&str>) -> Option<MemberInfo> {
            None
        }

        fn try_resolve_channel(&self, _: &str, _: Option<&str>) -> Option<ChannelInfo> {
            None
        }

        async fn refresh(&self) -> anyhow::Result<()> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Quiz;

    impl Plugin for Quiz {
        fn describe() -> PluginTypeDecl {
            PluginTypeDecl::basic::<Self>()
                .identifier("c3f1a2b4-6d5e-4f70-8a9b-0c1d2e3f4a5b")
                .lifetime(Lifetime::Singleton)
                .method(MethodDecl::new("ask").command_handler().invoke(|inv| {
                    let conversation = inv.conversation();
                    Ok(ResponseStream::new(move |y| async move {
                        y.reply("name?").await;
                        let next = conversation.next_message(Duration::from_secs(30)).await?;
                        y.reply(format!("hi {}", next.text())).await;
                        Ok(())
                    }))
                }))
                .method(MethodDecl::new("slow_ask").command_handler().invoke(|inv| {
                    let conversation = inv.conversation();
                    Ok(ResponseStream::new(move |y| async move {
                        y.reply("thinking").await;
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        let next = conversation.next_message(Duration::from_secs(30)).await?;
                        y.reply(format!("hi {}", next.text())).await;
                        Ok(())
                    }))
                }))
                .method(
                    MethodDecl::new("shutdown_all")
                        .authority(Authority::Root)
                        .invoke(|_| Ok(Response::text("bye"))),
                )
                .on_message(|inv| {
                    let pong = (inv.context().text() == "ping").then(|| Response::text("pong"));
                    Ok(ResponseStream::from_responses(pong))
                })
        }

        fn construct(_: &ServiceScope) -> anyhow::Result<Self> {
            Ok(Quiz)
        }
    }

    fn conv(user: &str) -> ConversationId {
        ConversationId::new("group", user)
    }

    fn msg(user: &str, text: &str) -> InboundMessage {
        InboundMessage::new(conv(user), text)
    }

    fn build(
        root: &Path,
        edit: impl FnOnce(&mut KestrelConfig),
    ) -> (Arc<Capture>, Arc<KestrelRuntime>) {
        fs::create_dir_all(root.join("quiz")).unwrap();
        fs::write(root.join("quiz/quiz.toml"), "").unwrap();

        let mut config = KestrelConfig::default();
        config.plugins.directory = root.to_path_buf();
        edit(&mut config);

        let transport = Arc::new(Capture::default());
        let runtime = KestrelRuntime::builder()
            .config(config)
            .transport(Arc::clone(&transport))
            .artifact(Artifact::new("quiz", "1.0.0").plugin::<Quiz>())
            .without_logging()
            .build()
            .unwrap();
        (transport, runtime)
    }

    async fn started(root: &Path) -> (Arc<Capture>, Arc<KestrelRuntime>) {
        let (transport, runtime) = build(root, |_| {});
        runtime.start().await.unwrap();
        (transport, runtime)
    }

    #[tokio::test]
    async fn test_start_loads_host_and_plugin_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let (_, runtime) = started(tmp.path()).await;

        assert_eq!(runtime.containers(), vec!["host", "quiz"]);
        assert!(runtime.commands().contains("help"));
        assert!(runtime.commands().contains("ask"));
        assert!(runtime.commands().contains("slowask"));
        assert_eq!(runtime.stats().containers, 2);
        assert!(runtime.is_running());
        assert!(matches!(
            runtime.start().await,
            Err(RuntimeError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn test_builtin_can_be_disabled() {
        let tmp = tempfile::tempdir().unwrap();
        let (_, runtime) = build(tmp.path(), |c| c.plugins.builtin = false);
        runtime.start().await.unwrap();
        assert!(!runtime.commands().contains("help"));
        assert!(runtime.commands().contains("ask"));
    }

    #[test]
    fn test_transport_is_required() {
        let err = KestrelRuntime::builder()
            .config(KestrelConfig::default())
            .without_logging()
            .build()
            .unwrap_err();
        assert!(matches!(err, RuntimeError::MissingTransport));
    }

    #[tokio::test]
    async fn test_waiting_handler_receives_next_message() {
        let tmp = tempfile::tempdir().unwrap();
        let (transport, runtime) = started(tmp.path()).await;

        let ask = runtime.deliver(msg("alice", "/ask"));
        while !runtime.waiters().is_pending(&conv("alice")) {
            tokio::task::yield_now().await;
        }

        // Another user's message in the same channel is a separate conversation.
        assert!(matches!(
            runtime.handle_message(msg("bob", "Bob")).await,
            Routed::Message { responses: 0 }
        ));
        assert!(matches!(
            runtime.handle_message(msg("alice", "Alice")).await,
            Routed::Resumed
        ));

        match ask.await.unwrap() {
            Routed::Command { name, result } => {
                assert_eq!(name, "ask");
                assert_eq!(result, Ok(2));
            }
            other => panic!("unexpected routing: {other:?}"),
        }
        assert_eq!(transport.texts(), vec!["name?", "hi Alice"]);
        assert_eq!(runtime.stats().resolved_waiters, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_queued_behind_handler_goes_to_its_waiter() {
        let tmp = tempfile::tempdir().unwrap();
        let (transport, runtime) = started(tmp.path()).await;

        let slow = runtime.deliver(msg("alice", "/slowask"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let reply = runtime.deliver(msg("alice", "Bob"));

        assert!(matches!(reply.await.unwrap(), Routed::Resumed));
        assert!(matches!(
            slow.await.unwrap(),
            Routed::Command { result: Ok(2), .. }
        ));
        assert_eq!(transport.texts(), vec!["thinking", "hi Bob"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_timeout_releases_conversation() {
        let tmp = tempfile::tempdir().unwrap();
        let (transport, runtime) = started(tmp.path()).await;

        let routed = runtime.handle_message(msg("alice", "/ask")).await;
        assert!(matches!(
            routed,
            Routed::Command {
                result: Err(DispatchError::ConversationTimeout(_)),
                ..
            }
        ));
        assert_eq!(
            transport.texts(),
            vec!["name?", "Timed out waiting for your reply."]
        );
        assert!(matches!(
            runtime.handle_message(msg("alice", "ping")).await,
            Routed::Message { responses: 1 }
        ));
        assert_eq!(runtime.stats().timed_out_waiters, 1);
    }

    #[tokio::test]
    async fn test_plain_text_goes_to_message_hooks() {
        let tmp = tempfile::tempdir().unwrap();
        let (transport, runtime) = started(tmp.path()).await;

        assert!(matches!(
            runtime.handle_message(msg("alice", "ping")).await,
            Routed::Message { responses: 1 }
        ));
        assert!(matches!(
            runtime.handle_message(msg("alice", "/")).await,
            Routed::Message { responses: 0 }
        ));
        assert_eq!(transport.texts(), vec!["pong"]);
    }

    #[tokio::test]
    async fn test_unknown_command_replies_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let (transport, runtime) = started(tmp.path()).await;

        let routed = runtime.handle_message(msg("alice", "/nope")).await;
        assert!(matches!(
            routed,
            Routed::Command {
                result: Err(DispatchError::CommandNotFound(_)),
                ..
            }
        ));
        assert_eq!(transport.texts(), vec!["Unknown command: nope"]);
    }

    #[tokio::test]
    async fn test_root_users_get_root_authority() {
        let tmp = tempfile::tempdir().unwrap();
        let (transport, runtime) = build(tmp.path(), |c| {
            c.dispatch.root_users = vec!["boss".into()];
            c.dispatch.reply_errors = false;
        });
        runtime.start().await.unwrap();

        let denied = runtime.handle_message(msg("alice", "/shutdownall")).await;
        assert!(matches!(
            denied,
            Routed::Command {
                result: Err(DispatchError::AuthorityDenied { .. }),
                ..
            }
        ));
        let allowed = runtime.handle_message(msg("boss", "/shutdownall")).await;
        assert!(matches!(allowed, Routed::Command { result: Ok(1), .. }));
        assert_eq!(transport.texts(), vec!["bye"]);
    }

    #[tokio::test]
    async fn test_unload_reload_and_host_protection() {
        let tmp = tempfile::tempdir().unwrap();
        let (_, runtime) = started(tmp.path()).await;

        runtime.unload_container("quiz").await.unwrap();
        assert!(!runtime.commands().contains("ask"));
        assert!(matches!(
            runtime.handle_message(msg("alice", "/ask")).await,
            Routed::Command {
                result: Err(DispatchError::CommandNotFound(_)),
                ..
            }
        ));

        assert!(matches!(
            runtime.unload_container("quiz").await,
            Err(RuntimeError::Load(LoadError::ContainerNotFound(_)))
        ));
        assert!(matches!(
            runtime.unload_container(HOST_CONTAINER).await,
            Err(RuntimeError::Load(LoadError::HostContainer))
        ));

        assert_eq!(runtime.load_container("quiz").await.unwrap(), 3);
        assert!(matches!(
            runtime.load_container("quiz").await,
            Err(RuntimeError::Load(LoadError::ContainerExists(_)))
        ));
        assert_eq!(runtime.reload_container("quiz").await.unwrap(), 3);
        assert_eq!(runtime.containers(), vec!["host", "quiz"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_contacts_refresh_runs_until_shutdown() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("quiz")).unwrap();
        fs::write(tmp.path().join("quiz/quiz.toml"), "").unwrap();
        let mut config = KestrelConfig::default();
        config.plugins.directory = tmp.path().to_path_buf();
        config.contacts.refresh_interval_secs = 60;

        let contacts = Arc::new(CountingContacts::default());
        let runtime = KestrelRuntime::builder()
            .config(config)
            .transport(Arc::new(Capture::default()))
            .contacts(Arc::clone(&contacts))
            .artifact(Artifact::new("quiz", "1.0.0").plugin::<Quiz>())
            .without_logging()
            .build()
            .unwrap();

        runtime.start().await.unwrap();
        assert_eq!(contacts.refreshes.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(contacts.refreshes.load(Ordering::SeqCst), 2);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(contacts.refreshes.load(Ordering::SeqCst), 3);

        runtime.shutdown().await;
        assert!(runtime.containers().is_empty());
        assert!(!runtime.is_running());

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(contacts.refreshes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreadable_plugin_root_still_starts_host() {
        let tmp = tempfile::tempdir().unwrap();
        let not_a_dir = tmp.path().join("plugins");
        fs::write(&not_a_dir, "").unwrap();
        let mut config = KestrelConfig::default();
        config.plugins.directory = not_a_dir;

        let contacts = Arc::new(CountingContacts::default());
        let runtime = KestrelRuntime::builder()
            .config(config)
            .transport(Arc::new(Capture::default()))
            .contacts(Arc::clone(&contacts))
            .without_logging()
            .build()
            .unwrap();

        runtime.start().await.unwrap();
        assert!(runtime.is_running());
        assert_eq!(runtime.containers(), vec!["host"]);
        assert!(runtime.commands().contains("help"));
        assert_eq!(contacts.refreshes.load(Ordering::SeqCst), 1);
        runtime.shutdown().await;
    }
}
