use std::sync::Arc;

use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::chat::{ChatController, MessageId, MessageStatus};
use crate::settings::{ChatSettings, SettingsStore};

pub const HELP_TEXT: &str = "Type a question and press Enter. Commands: \
/clear resets the chat, /model <id> switches the model, /reload re-reads settings, /quit exits.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    Ask(String),
    Clear,
    Model(String),
    Reload,
    Help,
    Quit,
}

impl ShellCommand {
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        let Some(command) = trimmed.strip_prefix('/') else {
            return Self::Ask(line.to_string());
        };

        let (name, argument) = command
            .split_once(char::is_whitespace)
            .map(|(name, argument)| (name, argument.trim()))
            .unwrap_or((command, ""));

        match name {
            "clear" => Self::Clear,
            "model" if !argument.is_empty() => Self::Model(argument.to_string()),
            "reload" => Self::Reload,
            "quit" | "exit" => Self::Quit,
            "help" | "model" => Self::Help,
            // Unknown slash words are ordinary questions.
            _ => Self::Ask(line.to_string()),
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ShellError {
    #[snafu(display("failed to read input on `{stage}`: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("failed to write output on `{stage}`: {source}"))]
    WriteOutput {
        stage: &'static str,
        source: std::io::Error,
    },
}

pub type ShellResult<T> = Result<T, ShellError>;

/// Terminal stand-in for the browser UI: reads questions, prints replies as they are typed.
pub struct Shell<W> {
    controller: ChatController,
    settings: Arc<SettingsStore>,
    output: W,
}

impl<W> Shell<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(controller: ChatController, settings: Arc<SettingsStore>, output: W) -> Self {
        Self {
            controller,
            settings,
            output,
        }
    }

    pub fn controller(&self) -> &ChatController {
        &self.controller
    }

    pub async fn run<R>(&mut self, input: R) -> ShellResult<()>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let mut lines = BufReader::new(input).lines();
        self.write_line(HELP_TEXT).await?;
        if let Some(notice) = self.controller.notice().map(str::to_string) {
            self.write_line(&format!("! {notice}")).await?;
        }

        loop {
            self.write("> ").await?;
            let Some(line) = lines.next_line().await.context(ReadInputSnafu {
                stage: "read-line",
            })?
            else {
                break;
            };

            if !self.handle_command(ShellCommand::parse(&line)).await? {
                break;
            }
        }

        self.controller.clear();
        Ok(())
    }

    /// Returns `false` when the shell should exit.
    pub async fn handle_command(&mut self, command: ShellCommand) -> ShellResult<bool> {
        match command {
            ShellCommand::Ask(question) => self.ask(&question).await?,
            ShellCommand::Clear => {
                self.controller.clear();
                self.write_line("Chat cleared.").await?;
            }
            ShellCommand::Model(model_id) => self.switch_model(model_id).await?,
            ShellCommand::Reload => {
                let settings = self.settings.reload();
                self.write_line(&format!(
                    "Settings reloaded (model {}). API key changes apply after restart.",
                    settings.model_id
                ))
                .await?;
            }
            ShellCommand::Help => self.write_line(HELP_TEXT).await?,
            ShellCommand::Quit => return Ok(false),
        }
        Ok(true)
    }

    async fn ask(&mut self, question: &str) -> ShellResult<()> {
        let receipt = match self.controller.submit(question) {
            Ok(receipt) => receipt,
            Err(error) => return self.write_line(&error.to_string()).await,
        };

        let mut printed = self.render_new_chars(receipt.assistant_message_id, 0).await?;
        while self.controller.step().await {
            printed = self
                .render_new_chars(receipt.assistant_message_id, printed)
                .await?;
        }
        self.render_new_chars(receipt.assistant_message_id, printed)
            .await?;

        let failure = self
            .controller
            .conversation()
            .get(receipt.assistant_message_id)
            .and_then(|message| match &message.status {
                MessageStatus::Failed(error) => Some(error.clone()),
                MessageStatus::Done | MessageStatus::Streaming | MessageStatus::Cancelled => None,
            });

        match failure {
            Some(error) => self.write_line(&format!("! {error}")).await,
            None => self.write_line("").await,
        }
    }

    async fn switch_model(&mut self, model_id: String) -> ShellResult<()> {
        let settings = ChatSettings {
            model_id,
            ..(*self.settings.settings()).clone()
        };

        let message = match self.settings.update(settings) {
            Ok(()) => format!("Model set to {}.", self.settings.settings().model_id),
            Err(error) => {
                tracing::warn!(error = %error, "failed to persist model change");
                format!("! Could not save settings: {error}")
            }
        };
        self.write_line(&message).await
    }

    /// Writes characters typed since `printed` and returns the new count.
    async fn render_new_chars(
        &mut self,
        message_id: MessageId,
        printed: usize,
    ) -> ShellResult<usize> {
        let fresh = self
            .controller
            .conversation()
            .get(message_id)
            .map(|message| message.content.chars().skip(printed).collect::<String>())
            .unwrap_or_default();

        if fresh.is_empty() {
            return Ok(printed);
        }

        self.write(&fresh).await?;
        Ok(printed + fresh.chars().count())
    }

    async fn write(&mut self, text: &str) -> ShellResult<()> {
        self.output
            .write_all(text.as_bytes())
            .await
            .context(WriteOutputSnafu { stage: "write" })?;
        self.output
            .flush()
            .await
            .context(WriteOutputSnafu { stage: "flush" })
    }

    async fn write_line(&mut self, text: &str) -> ShellResult<()> {
        self.write(&format!("{text}\n")).await
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use studymate_llm::{
        ProviderResult, ProviderStreamHandle, ProviderWorker, StreamClient, StreamEvent,
        StreamRequest, make_event_stream,
    };

    use super::*;

    /// Replies to every request with a fixed sequence of fragments.
    struct CannedClient {
        fragments: Vec<&'static str>,
    }

    impl StreamClient for CannedClient {
        fn id(&self) -> &str {
            "canned"
        }

        fn is_configured(&self) -> bool {
            true
        }

        fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
            let (event_tx, stream, _cancel_rx) = make_event_stream(request.target);
            let target = request.target;
            let fragments = self.fragments.clone();
            let worker: ProviderWorker = Box::pin(async move {
                for fragment in fragments {
                    let _ = event_tx.send(StreamEvent::fragment(target, fragment));
                }
                let _ = event_tx.send(StreamEvent::done(target));
            });
            Ok(ProviderStreamHandle { stream, worker })
        }
    }

    fn shell(fragments: Vec<&'static str>) -> Shell<Vec<u8>> {
        let settings = Arc::new(SettingsStore::with_settings(
            PathBuf::from("unused-settings.json"),
            ChatSettings {
                typing_delay_ms: 1,
                ..ChatSettings::default()
            },
        ));
        let client = Arc::new(CannedClient { fragments });
        let controller = ChatController::new(client, settings.clone());
        Shell::new(controller, settings, Vec::new())
    }

    #[test]
    fn parses_commands_and_questions() {
        assert_eq!(ShellCommand::parse("/clear"), ShellCommand::Clear);
        assert_eq!(
            ShellCommand::parse("/model  gemini-2.5-pro "),
            ShellCommand::Model("gemini-2.5-pro".to_string())
        );
        assert_eq!(ShellCommand::parse("/model"), ShellCommand::Help);
        assert_eq!(ShellCommand::parse(" /quit"), ShellCommand::Quit);
        assert_eq!(
            ShellCommand::parse("/etc/hosts is what?"),
            ShellCommand::Ask("/etc/hosts is what?".to_string())
        );
        assert_eq!(
            ShellCommand::parse("What is osmosis?"),
            ShellCommand::Ask("What is osmosis?".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn session_prints_typed_reply_and_handles_clear() {
        let mut shell = shell(vec!["Water ", "moves."]);
        let input: &[u8] = b"What is osmosis?\n   \n/clear\n/quit\n";

        shell.run(input).await.expect("shell run");

        let output = String::from_utf8(shell.output.clone()).expect("utf8 output");
        assert!(output.contains("Water moves.\n"));
        assert!(output.contains("Please enter a question."));
        assert!(output.contains("Chat cleared."));
        assert!(shell.controller().conversation().is_empty());
        assert!(!shell.controller().is_busy());
    }
}
