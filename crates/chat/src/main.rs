use std::sync::Arc;

use studymate::chat::ChatController;
use studymate::settings::SettingsStore;
use studymate::shell::Shell;
use tracing_subscriber::EnvFilter;

/// Terminal entry point.
///
/// Logs go to stderr so the typed reply on stdout stays readable; set `RUST_LOG` to tune them.
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let settings = Arc::new(SettingsStore::load());
    let client = match studymate_llm::create_client(settings.settings().to_provider_config()) {
        Ok(client) => client,
        Err(error) => {
            tracing::error!(error = %error, "failed to create stream client");
            eprintln!("{error}");
            std::process::exit(1);
        }
    };
    tracing::info!(
        provider_id = %client.id(),
        config_path = ?settings.config_path(),
        "stream client ready"
    );

    let controller = ChatController::new(client, settings.clone());
    let mut shell = Shell::new(controller, settings, tokio::io::stdout());

    if let Err(error) = shell.run(tokio::io::stdin()).await {
        tracing::error!(error = %error, "shell terminated");
        std::process::exit(1);
    }
}
