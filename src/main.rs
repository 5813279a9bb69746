use std::path::PathBuf;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use voice_agent_client::console::{parse_command, ConsolePresenter, HELP};
use voice_agent_client::settings::{self, ClientSettings};
use voice_agent_client::{
    Persona, Runtime, RuntimeOptions, Session, SessionController, SessionId, SystemDevices,
    UserCommand,
};

/// Talk to a voice agent from the terminal
#[derive(Debug, Parser)]
#[command(name = "voice-agent", version, about)]
struct Cli {
    /// WebSocket endpoint for the audio stream
    #[arg(long)]
    server: Option<String>,

    /// Base URL for the REST endpoints
    #[arg(long)]
    http: Option<String>,

    /// Session id to resume (also accepted as a page URL carrying ?session_id=)
    #[arg(long)]
    session: Option<String>,

    /// Persona tag for the handshake
    #[arg(long)]
    persona: Option<String>,

    /// Do not restore saved history at startup
    #[arg(long)]
    no_history: bool,

    /// Also write captured audio to this WAV file
    #[arg(long)]
    record: Option<PathBuf>,

    /// Emit JSON lines instead of text
    #[arg(long)]
    json: bool,

    /// Start streaming immediately
    #[arg(long)]
    start: bool,

    /// Persist the effective settings and exit
    #[arg(long)]
    save_settings: bool,
}

impl Cli {
    fn apply(&self, settings: &mut ClientSettings) {
        if let Some(server) = &self.server {
            settings.server_url = server.clone();
        }
        if let Some(http) = &self.http {
            settings.http_base_url = http.clone();
        }
        if let Some(persona) = &self.persona {
            settings.default_persona = persona.clone();
        }
        if self.no_history {
            settings.load_history = false;
        }
        if let Some(record) = &self.record {
            settings.record_path = Some(record.clone());
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Load .env file if present (for development convenience)
    let _ = dotenvy::dotenv();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    // CLI > env > settings file
    let mut settings = settings::load_settings();
    settings.apply_env(|key| std::env::var(key).ok());
    cli.apply(&mut settings);

    if cli.save_settings {
        match settings::save_settings(&settings) {
            Ok(path) => println!("Settings saved to {}", path.display()),
            Err(e) => {
                eprintln!("Failed to save settings: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    let session_id = match cli.session.as_deref() {
        Some(value) if value.contains("://") => SessionId::resolve(None, Some(value)),
        other => SessionId::resolve(other, None),
    };
    let persona = Persona::from_tag(&settings.default_persona);
    log::info!("Session {} with persona {}", session_id, persona.tag());

    let options = RuntimeOptions {
        server_url: settings.server_url.clone(),
        http_base_url: Some(settings.http_base_url.clone()).filter(|u| !u.trim().is_empty()),
        load_history: settings.load_history,
        capture: settings.capture_config(),
        scheduler: settings.scheduler_config(),
        record_path: settings.record_path.clone(),
    };

    let controller = SessionController::new(Session::new(session_id, persona));
    let presenter = ConsolePresenter::stdout(cli.json);
    let runtime = Runtime::new(options, controller, presenter, SystemDevices);

    let (tx, rx) = mpsc::channel::<UserCommand>(16);
    if cli.start {
        let _ = tx.send(UserCommand::Start).await;
    }
    if !cli.json {
        println!("{}", HELP);
    }
    tokio::spawn(read_commands(tx));

    let controller = runtime.run(rx).await;
    log::info!(
        "Session {} ended with {} turns",
        controller.session().id(),
        controller.conversation().len()
    );
}

/// Forward stdin lines as commands until EOF or `quit`
async fn read_commands(tx: mpsc::Sender<UserCommand>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match parse_command(&line) {
                    Some(command) => {
                        let quit = command == UserCommand::Quit;
                        if tx.send(command).await.is_err() || quit {
                            return;
                        }
                    }
                    None => eprintln!("Unknown command: {}\n{}", line.trim(), HELP),
                }
            }
            Ok(None) => return,
            Err(e) => {
                log::warn!("Console: failed to read stdin: {}", e);
                return;
            }
        }
    }
}
