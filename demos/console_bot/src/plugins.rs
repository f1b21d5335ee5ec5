//! The demo plugin set.
//!
//! `DemoPlugin` covers every handler return shape and a two-step
//! conversation on plain messages; `Counter` is a service plugin it depends on.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use kestrel::prelude::*;
use tracing::debug;

/// How long the conversation hook waits for each follow-up message.
const FOLLOW_UP_TIMEOUT: Duration = Duration::from_secs(30);

pub fn artifact() -> Artifact {
    Artifact::new("demo", env!("CARGO_PKG_VERSION"))
        .plugin::<Counter>()
        .plugin::<DemoPlugin>()
}

/// Dynamic handler result, rendered by the transport.
#[derive(Debug)]
pub struct Uptime(pub Duration);

// ============================================================================
// Counter
// ============================================================================

/// Counts command invocations on [`DemoPlugin`].
#[derive(Default)]
pub struct Counter {
    hits: AtomicU64,
}

impl Counter {
    pub fn bump(&self) -> u64 {
        self.hits.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }
}

impl Plugin for Counter {
    fn describe() -> PluginTypeDecl {
        PluginTypeDecl::service::<Self>()
            .identifier("3c5e9a70-2b41-4d8e-a6f1-0d9c7b2e4f18")
            .description("Counts demo commands.")
            .version("0.1.0")
            .author("kestrel")
            .method(
                MethodDecl::new("hits")
                    .command_handler()
                    .description("How many demo commands ran.")
                    .invoke(|inv| {
                        let counter = inv.plugin::<Counter>()?;
                        Ok(inv.reply(format!("{} demo commands so far", counter.hits())))
                    }),
            )
    }

    fn construct(_: &ServiceScope) -> anyhow::Result<Self> {
        Ok(Self::default())
    }
}

// ============================================================================
// DemoPlugin
// ============================================================================

pub struct DemoPlugin {
    counter: Arc<Counter>,
    started: Instant,
}

/// Options and an argument bound as one value: `model --name x --age 3 text`.
#[derive(Debug)]
pub struct Profile {
    pub name: String,
    pub age: i32,
    pub description: String,
}

impl BindingModel for Profile {
    fn fields() -> Vec<ParamDecl> {
        vec![
            ParamDecl::value::<String>("name").option("name").default("anonymous"),
            ParamDecl::value::<i32>("age").option("age").default("14"),
            ParamDecl::value::<String>("description")
                .argument()
                .default("no description"),
        ]
    }

    fn bind(args: &mut BoundArgs) -> anyhow::Result<Self> {
        Ok(Self {
            name: args.take("name")?,
            age: args.take("age")?,
            description: args.take("description")?,
        })
    }
}

#[async_trait]
impl Plugin for DemoPlugin {
    fn describe() -> PluginTypeDecl {
        PluginTypeDecl::basic::<Self>()
            .identifier("1e1e623a-d89d-49ad-b801-f93dd94cf2d7")
            .index(1)
            .lifetime(Lifetime::Singleton)
            .description("Shows what a plugin can do.")
            .version("0.1.0")
            .author("kestrel")
            .method(
                MethodDecl::new("echo_root1")
                    .named("hello")
                    .param(
                        ParamDecl::value::<String>("content")
                            .argument()
                            .default("world")
                            .authority(Authority::Admin),
                    )
                    .invoke(|mut inv| {
                        let content: String = inv.take("content")?;
                        Ok(inv.reply(format!("hello {content}")))
                    }),
            )
            .method(
                MethodDecl::new("echo_root")
                    .authority(Authority::Admin)
                    .param(ParamDecl::value::<String>("content").argument())
                    .invoke(|mut inv| {
                        let content: String = inv.take("content")?;
                        Ok(inv.reply(content))
                    }),
            )
            .method(
                MethodDecl::new("echo")
                    .command_handler()
                    .param(ParamDecl::value::<String>("content").argument())
                    .invoke(|mut inv| {
                        let content: String = inv.take("content")?;
                        Ok(inv.reply(content))
                    }),
            )
            .method(
                MethodDecl::new("model_binding")
                    .named("model")
                    .description("Echo all of your contents.")
                    .param(ParamDecl::model::<Profile>("profile"))
                    .invoke(|mut inv| -> anyhow::Result<Deferred<Response>> {
                        let profile: Profile = inv.take("profile")?;
                        let reply_to = inv.context().message.message_id.clone();
                        Ok(Box::pin(async move {
                            let json = serde_json::json!({
                                "name": profile.name,
                                "age": profile.age,
                                "description": profile.description,
                            });
                            anyhow::Ok(Response::reply(json.to_string(), reply_to))
                        }))
                    }),
            )
            .method(
                MethodDecl::new("option")
                    .command_handler()
                    .description("Adds one to a byte.")
                    .param(ParamDecl::value::<u8>("option").option_abbr("option", 'o'))
                    .invoke(|mut inv| {
                        let option: u8 = inv.take("option")?;
                        Ok(inv.reply(option.wrapping_add(1).to_string()))
                    }),
            )
            .method(
                MethodDecl::new("arguments")
                    .named("arg")
                    .description("Echoes a word and an authority name.")
                    .param(ParamDecl::value::<String>("arguments").argument())
                    .param(
                        ParamDecl::value::<Authority>("authority")
                            .argument()
                            .default("unspecified"),
                    )
                    .invoke(|mut inv| {
                        let arguments: String = inv.take("arguments")?;
                        let authority: Authority = inv.take("authority")?;
                        let reply = inv.reply(format!("{arguments} {authority}"));
                        Ok(ResponseStream::new(move |y| async move {
                            y.reply(reply).await;
                            Ok(())
                        }))
                    }),
            )
            .method(
                MethodDecl::new("stats")
                    .command_handler()
                    .description("Plugin statistics.")
                    .invoke(|inv| {
                        let demo = inv.plugin::<DemoPlugin>()?;
                        Ok(vec![
                            Response::text(format!("commands: {}", demo.counter.hits())),
                            Response::text(format!(
                                "uptime: {}s",
                                demo.started.elapsed().as_secs()
                            )),
                        ])
                    }),
            )
            .method(
                MethodDecl::new("uptime")
                    .command_handler()
                    .invoke(|inv| Ok(Uptime(inv.plugin::<DemoPlugin>()?.started.elapsed()))),
            )
            .method(
                MethodDecl::new("touch")
                    .command_handler()
                    .description("Counts once more, silently.")
                    .param(ParamDecl::service::<Counter>("counter"))
                    .invoke(|mut inv| -> anyhow::Result<Deferred<()>> {
                        let counter: Arc<Counter> = inv.take("counter")?;
                        Ok(Box::pin(async move {
                            let hits = counter.bump();
                            debug!(hits, "Touched");
                            anyhow::Ok(())
                        }))
                    }),
            )
            .on_message(|inv| {
                let conversation = inv.conversation();
                let first = inv.reply("Not this one! Wait for your next message!");
                Ok(ResponseStream::new(move |y| async move {
                    y.reply(first).await;
                    let next = conversation.next_message(FOLLOW_UP_TIMEOUT).await?;
                    y.reply(format!("OK! Your first message is: {}", next.text()))
                        .await;
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    y.reply("Wait for your next message!").await;
                    let next = conversation.next_message(FOLLOW_UP_TIMEOUT).await?;
                    y.reply(format!("OK! Your second message is: {}", next.text()))
                        .await;
                    Ok(())
                }))
            })
    }

    fn construct(services: &ServiceScope) -> anyhow::Result<Self> {
        Ok(Self {
            counter: services.resolve::<Counter>()?,
            started: Instant::now(),
        })
    }

    async fn on_initialized(&self) -> anyhow::Result<()> {
        debug!("Demo plugin ready");
        Ok(())
    }

    async fn on_executing(&self, _context: &MessageContext) {
        self.counter.bump();
    }
}

#[cfg(test)]
mod tests {
    use kestrel::core::{
        CommandLine, CommandTable, DispatchOptions, DispatchResult, Dispatcher, DynamicValue,
        ModuleContainer, WaiterRegistry,
    };
    use parking_lot::Mutex;

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

        async fn forward_dynamic(
            &self,
            _: &ConversationId,
            value: DynamicValue,
        ) -> Result<(), TransportError> {
            let uptime = value
                .downcast::<Uptime>()
                .map_err(|_| TransportError::Unsupported("not uptime".into()))?;
            self.0.lock().push(format!("uptime {:?}", uptime.0));
            Ok(())
        }
    }

    fn setup() -> (Arc<Capture>, Arc<Dispatcher>) {
        let transport = Arc::new(Capture::default());
        let dispatcher = Arc::new(Dispatcher::new(
            transport.clone(),
            Arc::new(CommandTable::new()),
            Arc::new(WaiterRegistry::new()),
            DispatchOptions::default(),
        ));
        let host = ModuleContainer::load_host(Vec::new(), Vec::new()).unwrap();
        let demo = ModuleContainer::load("demo", vec![artifact()], &host).unwrap();
        dispatcher.attach(Arc::new(demo));
        (transport, dispatcher)
    }

    fn conversation() -> ConversationId {
        ConversationId::new("console", "tester")
    }

    fn ctx(text: &str, authority: Authority) -> MessageContext {
        MessageContext::public(InboundMessage::new(conversation(), text)).with_authority(authority)
    }

    async fn command(
        dispatcher: &Dispatcher,
        text: &str,
        authority: Authority,
    ) -> DispatchResult<usize> {
        let line = CommandLine::parse(text, "/").unwrap();
        dispatcher.dispatch_command(ctx(text, authority), &line).await
    }

    #[tokio::test]
    async fn test_demo_commands_are_published() {
        let (_, dispatcher) = setup();
        let names = [
            "hello", "echoroot", "echo", "model", "option", "arg", "stats", "uptime", "touch",
            "hits",
        ];
        for name in names {
            assert!(dispatcher.commands().contains(name), "missing {name}");
        }
    }

    #[tokio::test]
    async fn test_hello_and_echo_root_authority() {
        let (transport, dispatcher) = setup();
        command(&dispatcher, "/hello", Authority::Public).await.unwrap();
        assert!(matches!(
            command(&dispatcher, "/hello there", Authority::Public).await,
            Err(DispatchError::AuthorityDenied { .. })
        ));
        command(&dispatcher, "/hello there", Authority::Admin).await.unwrap();
        assert!(command(&dispatcher, "/echoroot hi", Authority::Public).await.is_err());
        command(&dispatcher, "/echoroot hi", Authority::Root).await.unwrap();

        let texts = transport.texts();
        assert_eq!(texts[0], "hello world");
        assert_eq!(texts[2], "hello there");
        assert_eq!(texts.last().unwrap(), "hi");
    }

    #[tokio::test]
    async fn test_model_binding_uses_defaults() {
        let (transport, dispatcher) = setup();
        command(&dispatcher, "/model --name kes", Authority::Public).await.unwrap();
        command(&dispatcher, "/model --age 3 \"a small bird\"", Authority::Public).await.unwrap();

        let texts = transport.texts();
        let first: serde_json::Value = serde_json::from_str(&texts[0]).unwrap();
        assert_eq!(first["name"], "kes");
        assert_eq!(first["age"], 14);
        assert_eq!(first["description"], "no description");
        let second: serde_json::Value = serde_json::from_str(&texts[1]).unwrap();
        assert_eq!(second["name"], "anonymous");
        assert_eq!(second["age"], 3);
        assert_eq!(second["description"], "a small bird");
    }

    #[tokio::test]
    async fn test_option_and_arg() {
        let (transport, dispatcher) = setup();
        command(&dispatcher, "/option -o 41", Authority::Public).await.unwrap();
        command(&dispatcher, "/option --option 255", Authority::Public).await.unwrap();
        command(&dispatcher, "/arg word", Authority::Public).await.unwrap();
        command(&dispatcher, "/arg word Admin", Authority::Public).await.unwrap();
        assert!(command(&dispatcher, "/option -o 256", Authority::Public).await.is_err());

        let texts = transport.texts();
        assert_eq!(texts[..4], ["42", "0", "word unspecified", "word admin"]);
    }

    #[tokio::test]
    async fn test_counter_is_shared_and_dynamic_result_is_forwarded() {
        let (transport, dispatcher) = setup();
        assert_eq!(command(&dispatcher, "/touch", Authority::Public).await.unwrap(), 0);
        assert_eq!(command(&dispatcher, "/stats", Authority::Public).await.unwrap(), 2);
        assert_eq!(command(&dispatcher, "/uptime", Authority::Public).await.unwrap(), 1);
        command(&dispatcher, "/hits", Authority::Public).await.unwrap();

        let texts = transport.texts();
        // touch: executing hook plus its own bump; stats: executing hook
        assert_eq!(texts[0], "commands: 3");
        assert!(texts[2].starts_with("uptime "));
        assert_eq!(texts[3], "4 demo commands so far");
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_step_conversation() {
        let (transport, dispatcher) = setup();
        let task = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                dispatcher
                    .dispatch_message(ctx("hi", Authority::Public))
                    .await
            })
        };

        for text in ["one", "two"] {
            while !dispatcher.waiters().is_pending(&conversation()) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            dispatcher
                .waiters()
                .try_resolve(ctx(text, Authority::Public))
                .unwrap();
        }

        assert_eq!(task.await.unwrap(), 4);
        assert_eq!(
            transport.texts(),
            vec![
                "Not this one! Wait for your next message!",
                "OK! Your first message is: one",
                "Wait for your next message!",
                "OK! Your second message is: two",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_conversation_gives_up_after_timeout() {
        let (transport, dispatcher) = setup();
        let sent = dispatcher.dispatch_message(ctx("hi", Authority::Public)).await;
        assert_eq!(sent, 0);
        assert_eq!(transport.texts(), vec!["Not this one! Wait for your next message!"]);
        assert_eq!(dispatcher.waiters().timed_out_count(), 1);
    }
}
