mod terminal;

use std::io::Stdout;

use anyhow::{Context, Result};
use flume::{unbounded, Receiver};
use parley_backend::collaborators::ConversationStore;
use parley_backend::config::ParleyConfig;
use parley_backend::runtime::ParleyRuntime;
use parley_backend::ChatEvent;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use terminal::{Command, TerminalRenderer, HELP};

const LIST_LIMIT: usize = 20;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parley=debug,parley_backend=debug")),
        )
        .init();

    tracing::info!("Parley starting...");

    let config = ParleyConfig::load();
    let rt = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    rt.block_on(run(config))
}

struct Session {
    runtime: ParleyRuntime,
    events: Receiver<ChatEvent>,
    renderer: TerminalRenderer<Stdout>,
    conversation_id: String,
}

async fn run(config: ParleyConfig) -> Result<()> {
    let (event_tx, event_rx) = unbounded();
    let runtime = ParleyRuntime::bootstrap(config, event_tx)
        .await
        .context("failed to bootstrap runtime")?;

    tracing::info!(
        "Model {} at {}",
        runtime.config.llm_model,
        runtime.config.llm_api_url
    );

    let conversation = runtime
        .database
        .create_conversation(None, &runtime.config.llm_model)?;
    let mut session = Session {
        runtime,
        events: event_rx,
        renderer: TerminalRenderer::new(std::io::stdout()),
        conversation_id: conversation.id,
    };
    session.renderer.line(HELP)?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    session.renderer.prompt()?;
    while let Some(line) = lines.next_line().await? {
        match Command::parse(&line) {
            Command::Empty => {}
            Command::Quit => break,
            Command::Help => session.renderer.line(HELP)?,
            Command::New => session.new_conversation()?,
            Command::List => session.list()?,
            Command::Load(id) => session.load(&id).await?,
            Command::Page(id) => session.page(&id)?,
            Command::Delete(id) => session.delete(&id)?,
            Command::Say(text) => session.turn(&text).await?,
            Command::Unknown(raw) => session
                .renderer
                .line(&format!("Unknown command {}. Try /help.", raw))?,
        }
        session.renderer.prompt()?;
    }

    tracing::info!("Parley shutting down");
    Ok(())
}

impl Session {
    fn new_conversation(&mut self) -> Result<()> {
        let conversation = self
            .runtime
            .database
            .create_conversation(None, &self.runtime.config.llm_model)?;
        self.switch_to(conversation.id);
        self.renderer
            .line(&format!("Started {}", conversation.title))?;
        Ok(())
    }

    fn list(&mut self) -> Result<()> {
        let conversations = self.runtime.database.list_conversations(LIST_LIMIT)?;
        self.renderer.conversation_list(&conversations)?;
        Ok(())
    }

    async fn load(&mut self, conversation_id: &str) -> Result<()> {
        let Some(mut conversation) = self.runtime.database.load_conversation(conversation_id)?
        else {
            self.renderer
                .line(&format!("No conversation with id {}", conversation_id))?;
            return Ok(());
        };

        let report = self
            .runtime
            .rehydrator
            .rehydrate_conversation(&mut conversation)
            .await;
        if report.messages_touched > 0 {
            self.renderer.line(&format!(
                "Restored {} search result(s) and {} image(s)",
                report.searches_rerun, report.images_regenerated
            ))?;
        }

        self.switch_to(conversation.id.clone());
        self.renderer.transcript(&conversation)?;
        Ok(())
    }

    fn page(&mut self, page_id: &str) -> Result<()> {
        match self.runtime.database.get_page(page_id)? {
            Some(page) => self.renderer.page(&page)?,
            None => self.renderer.line(&format!("No page with id {}", page_id))?,
        }
        Ok(())
    }

    fn delete(&mut self, conversation_id: &str) -> Result<()> {
        self.runtime.database.delete_conversation(conversation_id)?;
        self.renderer
            .line(&format!("Deleted {}", conversation_id))?;
        if conversation_id == self.conversation_id {
            self.new_conversation()?;
        }
        Ok(())
    }

    fn switch_to(&mut self, conversation_id: String) {
        self.conversation_id = conversation_id;
        self.renderer.reset();
        self.events.drain().for_each(drop);
    }

    async fn turn(&mut self, text: &str) -> Result<()> {
        let cancel = CancellationToken::new();
        let orchestrator = self.runtime.orchestrator.clone();
        let turn = orchestrator.run_turn(&self.conversation_id, text, cancel.clone());
        tokio::pin!(turn);

        let mut interrupted = false;
        let outcome = loop {
            tokio::select! {
                outcome = &mut turn => break outcome,
                Ok(event) = self.events.recv_async() => self.renderer.render(&event)?,
                _ = tokio::signal::ctrl_c(), if !interrupted => {
                    interrupted = true;
                    cancel.cancel();
                    self.renderer.line("Cancelling...")?;
                }
            }
        };

        for event in self.events.drain() {
            self.renderer.render(&event)?;
        }
        if let Err(e) = outcome {
            tracing::error!("Turn failed: {:#}", e);
            self.renderer.line(&format!("error: {:#}", e))?;
        }
        Ok(())
    }
}
