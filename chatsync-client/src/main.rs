use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io::{self, Write},
    path::Path,
    process::ExitCode,
    sync::{Arc, Mutex},
};

use chatsync_client::{
    ChatClient, ClientError, ConnectionState, HttpChatApi, IdentityStore,
    config::{ClientArgs, ClientConfig, LoginPlan},
};
use chatsync_core::{DeliveryState, Identity, MessageBody, MessageId};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::{StreamExt, wrappers::WatchStream};
use tracing::{error, info, warn};
use tracing_subscriber::fmt::MakeWriter;

type Client = ChatClient<HttpChatApi>;

#[derive(Clone)]
struct FileMakeWriter {
    file: Arc<Mutex<File>>,
}

struct FileWriterGuard {
    file: Arc<Mutex<File>>,
}

impl Write for FileWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.flush()
    }
}

impl<'a> MakeWriter<'a> for FileMakeWriter {
    type Writer = FileWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        FileWriterGuard {
            file: Arc::clone(&self.file),
        }
    }
}

/// Logs go to `log_file` when given, stderr otherwise. stdout stays for the chat.
fn init_logging(log_file: Option<&Path>) {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();

    let Some(log_path) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(io::stderr)
            .init();
        return;
    };
    let file = match OpenOptions::new().create(true).append(true).open(log_path) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("failed to open log file {}: {err}", log_path.display());
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(io::stderr)
                .init();
            return;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(false)
        .with_writer(FileMakeWriter {
            file: Arc::new(Mutex::new(file)),
        })
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match ClientArgs::parse().into_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("chatsync: {err}");
            return ExitCode::from(2);
        }
    };
    init_logging(config.log_file.as_deref());

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            eprintln!("chatsync: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: ClientConfig) -> Result<(), ClientError> {
    let api = HttpChatApi::new(config.api_url.clone(), config.request_timeout)
        .map_err(|err| ClientError::RequestFailure(err.message))?;
    let persistence = config
        .session_path
        .clone()
        .map_or_else(IdentityStore::ephemeral, IdentityStore::at);
    let client = Arc::new(ChatClient::new(api, config.connection.clone(), persistence));

    let identity = authenticate(&client, &config).await?;
    println!("logged in as {} ({})", identity.display_name, identity.id);

    let _errors = client.connection().on_error(|err| {
        if err.is_fatal() {
            eprintln!("! realtime connection gave up: {err}");
        }
    });
    client.messages().subscribe();
    tokio::spawn(print_connection_state(Arc::clone(&client)));
    tokio::spawn(print_presence(Arc::clone(&client)));
    tokio::spawn(print_messages(Arc::clone(&client), identity.id.clone()));

    if let Some(peer) = &config.peer {
        open_conversation(&client, peer).await;
    }

    let result = tokio::select! {
        result = read_commands(&client) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            Ok(())
        }
    };
    client.messages().unsubscribe();
    client.connection().close();
    result
}

async fn authenticate(client: &Client, config: &ClientConfig) -> Result<Identity, ClientError> {
    match client.session().persisted_identity() {
        Ok(Some(previous)) => info!(user_id = %previous.id, "found persisted session, validating"),
        Ok(None) => {}
        Err(err) => warn!("ignoring unreadable session file: {}", err),
    }
    if let Some(identity) = client.session().check_session().await {
        return Ok(identity);
    }
    match &config.login {
        Some(LoginPlan::Login(credentials)) => client.session().login(credentials).await,
        Some(LoginPlan::Signup(request)) => client.session().create_account(request).await,
        None => Err(ClientError::NotAuthenticated),
    }
}

async fn open_conversation(client: &Client, peer: &str) {
    match client.messages().select_conversation(peer).await {
        Ok(()) => {
            let online = if client.presence().is_online(peer) {
                "online"
            } else {
                "offline"
            };
            println!("-- conversation with {peer} ({online})");
        }
        Err(err) => eprintln!("! could not open conversation with {peer}: {err}"),
    }
}

async fn read_commands(client: &Client) -> Result<(), ClientError> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return Ok(()),
            Err(err) => {
                warn!("stdin read failed: {}", err);
                return Ok(());
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();
        match command {
            "/quit" => return Ok(()),
            "/logout" => {
                client.logout().await;
                println!("-- logged out");
                return Ok(());
            }
            "/peer" if !rest.is_empty() => open_conversation(client, rest).await,
            "/online" => {
                let users = client.presence().online_users();
                println!("-- online ({}): {}", users.len(), users.join(", "));
            }
            "/me" => match client.session().identity() {
                Some(identity) => println!("-- {} ({})", identity.display_name, identity.id),
                None => println!("-- not logged in"),
            },
            "/image" if !rest.is_empty() => send(client, MessageBody::image(rest)).await,
            _ if command.starts_with('/') => {
                println!("-- commands: /peer <id>, /online, /me, /image <url>, /logout, /quit");
            }
            _ => send(client, MessageBody::text(line)).await,
        }
    }
}

async fn send(client: &Client, body: MessageBody) {
    if let Err(err) = client.messages().send_message(body).await {
        match err {
            ClientError::SessionExpired => eprintln!("! {err}; restart to log in again"),
            other => eprintln!("! message not sent: {other}"),
        }
    }
}

async fn print_connection_state(client: Arc<Client>) {
    let mut states = WatchStream::new(client.connection().watch_state());
    while let Some(state) = states.next().await {
        match state {
            ConnectionState::Connected => println!("-- connected"),
            ConnectionState::Connecting => println!("-- connecting..."),
            ConnectionState::Disconnected => println!("-- disconnected"),
        }
    }
}

async fn print_presence(client: Arc<Client>) {
    let mut revisions = WatchStream::new(client.presence().watch_revision());
    while revisions.next().await.is_some() {
        info!(online = client.presence().online_count(), "presence changed");
    }
}

/// Prints new messages as they land and delivery progress of our own.
async fn print_messages(client: Arc<Client>, local_id: String) {
    let mut seen: HashMap<MessageId, DeliveryState> = HashMap::new();
    let mut peer = client.messages().selected_peer();
    let mut revisions = WatchStream::new(client.messages().watch_revision());
    while revisions.next().await.is_some() {
        let current_peer = client.messages().selected_peer();
        if current_peer != peer {
            seen.clear();
            peer = current_peer;
        }

        for message in client.messages().messages() {
            if message.is_pending() {
                continue;
            }
            let previous = seen.insert(message.id.clone(), message.delivery_state);
            let mine = message.is_from(&local_id);
            match previous {
                None => {
                    let who = if mine { "me" } else { message.sender_id.as_str() };
                    let text = message
                        .body
                        .text
                        .as_deref()
                        .or(message.body.image.as_deref())
                        .unwrap_or_default();
                    println!(
                        "[{}] {who}: {text}",
                        message.created_at.format("%H:%M")
                    );
                }
                Some(state) if mine && state != message.delivery_state => {
                    println!("   ({}) {}", message.id, message.delivery_state);
                }
                Some(_) => {}
            }
        }
    }
}
