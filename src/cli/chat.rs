//! The `chat` command: one-shot or interactive turns against a session.

use std::error::Error;
use std::future::Future;
use std::io::{self, Write};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::cli::{servers_for_bot, ChatArgs, CliContext};
use crate::core::bot::Bot;
use crate::core::message::{ToolCallRequest, ToolCallResult};
use crate::core::providers::{resolve_session, ResolveSessionError, SystemCredentials};
use crate::core::store::SessionStore;
use crate::core::turn::{
    ToolApprover, TurnError, TurnEvent, TurnOrchestrator, TurnPolicy, TurnRequest, TurnState,
};
use crate::mcp::{RegistryTimeouts, ToolRegistry};
use crate::provider::OpenAiCompatibleProvider;

const RESULT_PREVIEW_CHARS: usize = 120;

pub async fn run_chat(context: &CliContext, args: ChatArgs) -> Result<(), Box<dyn Error>> {
    let store = Arc::clone(&context.store);
    let existing = match args.session.as_deref() {
        Some(id) => Some(store.load(id).await?),
        None => None,
    };
    let bot_id = args
        .bot
        .as_deref()
        .or_else(|| existing.as_ref().and_then(|session| session.bot_id.as_deref()));
    let mut bot = context.load_bot(bot_id).await?;

    let provider_override = args
        .provider
        .as_deref()
        .or_else(|| bot.as_ref().and_then(|bot| bot.provider.as_deref()));
    let model_override = args
        .model
        .as_deref()
        .or_else(|| bot.as_ref().and_then(|bot| bot.model.as_deref()));
    let provider_session = match resolve_session(
        &SystemCredentials,
        &context.config,
        provider_override,
        model_override,
    ) {
        Ok(session) => session,
        Err(ResolveSessionError::Provider(err)) => {
            eprintln!("❌ {err}");
            let fixes = err.quick_fixes();
            if !fixes.is_empty() {
                eprintln!();
                eprintln!("💡 Quick fixes:");
                for fix in fixes {
                    eprintln!("  • {fix}");
                }
            }
            std::process::exit(err.exit_code());
        }
        Err(err) => return Err(err.into()),
    };
    if let Some(bot) = bot.as_mut() {
        bot.model = Some(provider_session.model.clone());
    }

    let session = match existing {
        Some(session) => session,
        None => {
            store
                .create(bot.as_ref().map(|bot| bot.id.as_str()))
                .await?
        }
    };
    eprintln!(
        "💬 Session {} · {} · {}",
        session.id, provider_session.provider_display_name, provider_session.model
    );

    let registry = ToolRegistry::new(RegistryTimeouts::from(&context.config.turn));
    registry
        .connect_all(&servers_for_bot(&context.config, bot.as_ref()))
        .await;
    for status in registry.server_statuses() {
        if let Some(err) = &status.last_error {
            eprintln!("⚠️  MCP server '{}' unavailable: {err}", status.server_id);
        }
    }

    let input: SharedLines<BufReader<Stdin>> =
        Arc::new(Mutex::new(BufReader::new(tokio::io::stdin()).lines()));
    let mut orchestrator = TurnOrchestrator::new(
        store,
        registry.clone(),
        Arc::new(OpenAiCompatibleProvider::new(provider_session)),
        TurnPolicy::from(&context.config.turn),
    );
    if context.config.turn.confirm_tools() {
        orchestrator = orchestrator.with_approver(Arc::new(PromptApprover::new(
            Arc::clone(&input),
            io::stderr,
        )));
    }
    let mut interrupts = Interrupts::new()?;

    let message = args.message.join(" ");
    let result = if message.trim().is_empty() {
        interactive_loop(
            &orchestrator,
            &session.id,
            bot.as_ref(),
            &input,
            &mut interrupts,
        )
        .await
    } else {
        let request = TurnRequest {
            session_id: session.id.clone(),
            user_text: message,
            bot: bot.clone(),
        };
        match run_one_turn(&orchestrator, request, &mut interrupts).await {
            Ok(()) => Ok(()),
            Err(err) => {
                report_turn_error(&err);
                registry.close_all().await;
                std::process::exit(1);
            }
        }
    };

    registry.close_all().await;
    result
}

/// Ctrl-C presses, buffered from the moment the listener is installed so
/// none is lost between turns.
struct Interrupts {
    #[cfg(unix)]
    signal: tokio::signal::unix::Signal,
    #[cfg(windows)]
    signal: tokio::signal::windows::CtrlC,
}

impl Interrupts {
    fn new() -> io::Result<Self> {
        #[cfg(unix)]
        let signal = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
        #[cfg(windows)]
        let signal = tokio::signal::windows::ctrl_c()?;
        Ok(Self { signal })
    }

    async fn recv(&mut self) {
        self.signal.recv().await;
    }
}

/// Stdin lines shared by the prompt loop and the tool approver.
pub type SharedLines<R> = Arc<Mutex<Lines<R>>>;

async fn interactive_loop(
    orchestrator: &TurnOrchestrator,
    session_id: &str,
    bot: Option<&Bot>,
    input: &SharedLines<BufReader<Stdin>>,
    interrupts: &mut Interrupts,
) -> Result<(), Box<dyn Error>> {
    loop {
        print!("> ");
        io::stdout().flush()?;
        let Some(line) = next_prompt_line(input, interrupts.recv()).await? else {
            println!();
            return Ok(());
        };
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if matches!(text, "/exit" | "/quit") {
            return Ok(());
        }

        let request = TurnRequest {
            session_id: session_id.to_string(),
            user_text: text.to_string(),
            bot: bot.cloned(),
        };
        if let Err(err) = run_one_turn(orchestrator, request, interrupts).await {
            report_turn_error(&err);
        }
    }
}

/// Reads the next prompt line. An interrupt while waiting reads as end of
/// input.
pub async fn next_prompt_line<R, I>(
    input: &SharedLines<R>,
    interrupt: I,
) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
    I: Future<Output = ()>,
{
    let mut lines = input.lock().await;
    tokio::select! {
        line = lines.next_line() => line,
        _ = interrupt => Ok(None),
    }
}

/// Runs one turn, rendering its events as they arrive. Ctrl-C cancels the
/// turn.
async fn run_one_turn(
    orchestrator: &TurnOrchestrator,
    request: TurnRequest,
    interrupts: &mut Interrupts,
) -> Result<(), TurnError> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let mut printer = TurnPrinter::new(io::stdout(), io::stderr());

    let turn = orchestrator.run_turn(request, tx, cancel.clone());
    tokio::pin!(turn);
    let result = loop {
        tokio::select! {
            result = &mut turn => break result,
            Some(event) = rx.recv() => printer.render(&event),
            _ = interrupts.recv(), if !cancel.is_cancelled() => {
                cancel.cancel();
            }
        }
    };
    while let Ok(event) = rx.try_recv() {
        printer.render(&event);
    }
    result.map(|_| ())
}

/// Asks on the terminal before a tool runs. End of input counts as "no".
pub struct PromptApprover<R, P> {
    lines: SharedLines<R>,
    prompt_out: P,
}

impl<R, P, W> PromptApprover<R, P>
where
    P: Fn() -> W,
    W: Write,
{
    pub fn new(lines: SharedLines<R>, prompt_out: P) -> Self {
        Self { lines, prompt_out }
    }

    fn say(&self, text: &str) {
        let mut out = (self.prompt_out)();
        let _ = write!(out, "{text}");
        let _ = out.flush();
    }
}

#[async_trait]
impl<R, P, W> ToolApprover for PromptApprover<R, P>
where
    R: AsyncBufRead + Unpin + Send,
    P: Fn() -> W + Send + Sync,
    W: Write,
{
    async fn approve(&self, call: &ToolCallRequest) -> bool {
        let mut lines = self.lines.lock().await;
        loop {
            self.say(&format!("\n{}\nRun this tool? (y/n): ", describe_call(call)));
            match lines.next_line().await {
                Ok(Some(answer)) => match parse_confirmation(&answer) {
                    Some(approved) => return approved,
                    None => self.say("Please answer 'y' or 'n'\n"),
                },
                Ok(None) | Err(_) => return false,
            }
        }
    }
}

pub fn parse_confirmation(answer: &str) -> Option<bool> {
    match answer.trim().to_lowercase().as_str() {
        "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        _ => None,
    }
}

fn report_turn_error(err: &TurnError) {
    match err {
        TurnError::Cancelled => eprintln!("⏹️  Turn cancelled"),
        TurnError::TurnLimitExceeded { limit } => {
            eprintln!("⚠️  Stopped after {limit} tool rounds; ask again to continue")
        }
        other => eprintln!("❌ {other}"),
    }
}

/// Writes assistant text to `out` and tool activity to `diag`. Output
/// errors are ignored so a closed pipe cannot fail a turn.
pub struct TurnPrinter<O: Write, D: Write> {
    out: O,
    diag: D,
    mid_line: bool,
}

impl<O: Write, D: Write> TurnPrinter<O, D> {
    pub fn new(out: O, diag: D) -> Self {
        Self {
            out,
            diag,
            mid_line: false,
        }
    }

    pub fn into_parts(self) -> (O, D) {
        (self.out, self.diag)
    }

    pub fn render(&mut self, event: &TurnEvent) {
        match event {
            TurnEvent::Text(chunk) => {
                let _ = write!(self.out, "{chunk}");
                let _ = self.out.flush();
                self.mid_line = !chunk.ends_with('\n');
            }
            TurnEvent::Retry { attempt, error } => {
                self.end_line();
                let _ = writeln!(
                    self.diag,
                    "⚠️  {error}; retrying (attempt {attempt}), partial reply discarded"
                );
            }
            TurnEvent::ToolCall(call) => {
                self.end_line();
                let _ = writeln!(self.diag, "{}", describe_call(call));
            }
            TurnEvent::ToolResult(result) => {
                let _ = writeln!(self.diag, "{}", describe_result(result));
            }
            TurnEvent::State(TurnState::Done | TurnState::Failed) => self.end_line(),
            TurnEvent::State(_) => {}
        }
    }

    fn end_line(&mut self) {
        if self.mid_line {
            let _ = writeln!(self.out);
            let _ = self.out.flush();
            self.mid_line = false;
        }
    }
}

pub fn describe_call(call: &ToolCallRequest) -> String {
    format!("🔧 {} {}", call.name, call.arguments)
}

pub fn describe_result(result: &ToolCallResult) -> String {
    let preview = preview(&result.content);
    match (result.success, result.failure) {
        (true, _) => format!("   ✅ {}: {preview}", result.call_id),
        (false, Some(kind)) => format!("   ❌ {} ({}): {preview}", result.call_id, kind.as_str()),
        (false, None) => format!("   ❌ {}: {preview}", result.call_id),
    }
}

fn preview(content: &str) -> String {
    let single_line = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if single_line.chars().count() <= RESULT_PREVIEW_CHARS {
        single_line
    } else {
        let truncated: String = single_line.chars().take(RESULT_PREVIEW_CHARS).collect();
        format!("{truncated}…")
    }
}
