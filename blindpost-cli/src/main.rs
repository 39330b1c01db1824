use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use blindpost_core::{Address, Handle, HandshakePolicy, IdentityKeypair, PublicKey};
use blindpost_transport::nym::DEFAULT_NYM_CLIENT_URL;
use blindpost_transport::{Client, ClientConfig, Event, NymClientTransport, TransportError};
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

#[derive(Debug, Parser)]
#[command(name = "blindpost", version, about = "Anonymous directory-relayed messaging")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate an identity key and write its seed to a file.
    Keygen {
        /// Where to write the hex seed. Must not exist.
        #[arg(long, short)]
        out: PathBuf,
    },
    /// Claim a handle at the directory.
    Register(Connection),
    /// Prove ownership of a handle and refresh the reply route.
    Login(Connection),
    /// Print a peer's public key.
    Lookup {
        #[command(flatten)]
        connection: Connection,
        /// Handle to look up.
        peer: String,
    },
    /// Interactive chat.
    Chat {
        #[command(flatten)]
        connection: Connection,
        /// Register instead of logging in.
        #[arg(long)]
        register: bool,
        /// Switch to direct transport as soon as both sides have shaken hands.
        #[arg(long)]
        auto_promote: bool,
    },
}

#[derive(Debug, Args)]
struct Connection {
    /// Our handle.
    #[arg(long, env = "BLINDPOST_HANDLE")]
    handle: String,
    /// File holding the hex identity seed.
    #[arg(long, env = "BLINDPOST_KEY_FILE")]
    key: PathBuf,
    /// Directory's anonymous-network address.
    #[arg(long, env = "BLINDPOST_DIRECTORY")]
    directory: String,
    /// Directory's public key (hex). Unsigned or forged replies are dropped when set.
    #[arg(long, env = "BLINDPOST_DIRECTORY_PUBLIC_KEY")]
    directory_key: Option<String>,
    /// Local Nym client websocket.
    #[arg(long, env = "BLINDPOST_NYM_CLIENT_URL", default_value = DEFAULT_NYM_CLIENT_URL)]
    nym_url: String,
    /// Seconds to wait for the directory.
    #[arg(long, default_value_t = 30)]
    timeout: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    match Cli::parse().command {
        Command::Keygen { out } => keygen(&out),
        Command::Register(connection) => {
            let mut client = connect(&connection, HandshakePolicy::Manual).await?;
            client.register().await.context("registration failed")?;
            println!("registered {}", client.session().handle());
            Ok(())
        }
        Command::Login(connection) => {
            let mut client = connect(&connection, HandshakePolicy::Manual).await?;
            client.login().await.context("login failed")?;
            println!("logged in as {}", client.session().handle());
            Ok(())
        }
        Command::Lookup { connection, peer } => {
            let mut client = connect(&connection, HandshakePolicy::Manual).await?;
            let peer = Handle::new(peer)?;
            match client.lookup(&peer).await? {
                Some(key) => println!("{peer} {key} ({})", key.fingerprint()),
                None => bail!("{peer} is not registered"),
            }
            Ok(())
        }
        Command::Chat {
            connection,
            register,
            auto_promote,
        } => {
            let policy = if auto_promote {
                HandshakePolicy::AutoPromote
            } else {
                HandshakePolicy::Manual
            };
            let mut client = connect(&connection, policy).await?;
            if register {
                client.register().await.context("registration failed")?;
            } else {
                client.login().await.context("login failed")?;
            }
            chat(client).await
        }
    }
}

fn keygen(out: &Path) -> anyhow::Result<()> {
    let identity = IdentityKeypair::generate();
    let seed = Zeroizing::new(hex::encode(identity.seed().as_slice()));

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(out)
        .with_context(|| format!("creating {}", out.display()))?;
    file.write_all(seed.as_bytes())?;
    file.write_all(b"\n")?;

    let public = identity.public_key();
    println!("public key  {public}");
    println!("fingerprint {}", public.fingerprint());
    Ok(())
}

fn load_identity(path: &Path) -> anyhow::Result<IdentityKeypair> {
    let seed = Zeroizing::new(
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?,
    );
    IdentityKeypair::from_hex_seed(&seed).map_err(|e| anyhow!("{}: {e}", path.display()))
}

async fn connect(
    connection: &Connection,
    policy: HandshakePolicy,
) -> anyhow::Result<Client<NymClientTransport>> {
    let handle = Handle::new(connection.handle.as_str())?;
    let identity = load_identity(&connection.key)?;

    let wait = Duration::from_secs(connection.timeout);
    let mut config = ClientConfig::new(Address::new(connection.directory.as_str())?)
        .with_request_timeout(wait)
        .with_receive_timeout(wait)
        .with_policy(policy);
    match &connection.directory_key {
        Some(hex) => config = config.with_directory_key(PublicKey::from_hex(hex)?),
        None => eprintln!("warning: no directory key pinned, directory replies are not authenticated"),
    }

    let transport = NymClientTransport::connect(&connection.nym_url)
        .await
        .with_context(|| format!("connecting to nym client at {}", connection.nym_url))?;
    Ok(Client::new(transport, handle, identity, config))
}

const HELP: &str = "\
/msg <handle> <text>   send a message (plain lines go to the last peer)
/lookup <handle>       fetch a peer's key
/handshake <handle>    disclose our direct address to a peer
/direct <handle>       stop relaying traffic for a peer
/quit                  leave";

enum Input {
    Line(Option<String>),
    Event(Result<Event, TransportError>),
}

async fn chat(mut client: Client<NymClientTransport>) -> anyhow::Result<()> {
    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut peer: Option<Handle> = None;

    loop {
        let input = tokio::select! {
            line = lines.next_line() => Input::Line(line?),
            event = client.next_event() => Input::Event(event),
        };

        match input {
            Input::Line(None) => break,
            Input::Line(Some(line)) => match run_command(&mut client, &mut peer, line.trim()).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => eprintln!("error: {e:#}"),
            },
            Input::Event(Ok(event)) => print_event(event),
            Input::Event(Err(TransportError::Timeout)) => {}
            Input::Event(Err(e)) => return Err(e).context("connection lost"),
        }
    }
    Ok(())
}

/// Run one REPL line. `Ok(false)` means quit.
async fn run_command(
    client: &mut Client<NymClientTransport>,
    peer: &mut Option<Handle>,
    line: &str,
) -> anyhow::Result<bool> {
    if line.is_empty() {
        return Ok(true);
    }
    let Some(command) = line.strip_prefix('/') else {
        let to = peer.clone().ok_or_else(|| anyhow!("no peer yet, use /msg <handle> <text>"))?;
        client.send_text(&to, line).await?;
        return Ok(true);
    };

    let (verb, rest) = command.split_once(' ').unwrap_or((command, ""));
    let rest = rest.trim();
    match verb {
        "quit" | "q" => return Ok(false),
        "help" => println!("{HELP}"),
        "msg" => {
            let (to, text) = rest
                .split_once(' ')
                .ok_or_else(|| anyhow!("usage: /msg <handle> <text>"))?;
            let to = Handle::new(to)?;
            client.send_text(&to, text.trim()).await?;
            *peer = Some(to);
        }
        "lookup" => {
            let who = Handle::new(rest)?;
            match client.lookup(&who).await? {
                Some(key) => println!("* {who} has key {}", key.fingerprint()),
                None => println!("* {who} is not registered"),
            }
        }
        "handshake" => {
            let who = Handle::new(rest)?;
            client.initiate_handshake(&who).await?;
            println!("* sent our address to {who}");
        }
        "direct" => {
            let who = Handle::new(rest)?;
            client.promote_to_direct(&who)?;
            println!("* talking to {who} directly");
        }
        other => println!("unknown command /{other}, try /help"),
    }
    Ok(true)
}

fn print_event(event: Event) {
    match event {
        Event::Message { from, message } => println!("<{from}> {}", message.as_str()),
        Event::Handshake {
            from,
            address,
            promoted,
        } => {
            if promoted {
                println!("* {from} shook hands, now direct via {address}");
            } else {
                println!("* {from} offered a direct route ({address}), /handshake {from} to accept");
            }
        }
        Event::DeliveryReport {
            recipient,
            delivered: false,
        } => println!("* {recipient} could not be reached"),
        Event::DeliveryReport { .. } => {}
    }
}
