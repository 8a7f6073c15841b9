use clap::{Parser, Subcommand};
use opflex_server::error::ClientError;
use opflex_server::network::message::{methods, Envelope, MessageKind};
use opflex_server::network::{PeerClient, Role};
use opflex_server::security::TlsSecureChannel;
use serde_json::{json, Value};
use std::net::SocketAddr;

/// opflex-ctl: a small agent for poking a running policy server by hand.
///
/// Connects, performs the identity handshake with the given roles and then
/// runs one command, printing every message it receives as JSON.
#[derive(Parser, Debug)]
#[command(name = "opflex-ctl", version, about = "Manual test agent for opflex-server")]
struct Cli {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:8009")]
    addr: SocketAddr,

    /// Agent name sent in the handshake
    #[arg(long, default_value = "opflex-ctl")]
    name: String,

    /// Roles announced in the handshake
    #[arg(long, value_delimiter = ',', default_value = "policy_element")]
    roles: Vec<String>,

    /// CA store (directory or PEM); enables TLS
    #[arg(long)]
    ca: Option<String>,

    /// PEM with client certificate chain and key, for servers verifying peers
    #[arg(long, requires = "ca")]
    identity: Option<String>,

    /// Name expected in the server certificate
    #[arg(long, default_value = "localhost")]
    server_name: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Handshake only and print the server identity
    Identify,
    /// Resolve policy objects by subject and URI
    Resolve { subject: String, uri: String },
    /// Resolve, then print pushed updates until interrupted
    Watch { subject: String, uri: String },
    /// Round-trip an echo request
    Echo {
        #[arg(default_value = "ping")]
        text: String,
    },
}

fn print_envelope(env: &Envelope) {
    let doc = json!({
        "kind": format!("{:?}", env.kind),
        "method": env.method,
        "id": env.id,
        "payload": env.payload,
    });
    match serde_json::to_string_pretty(&doc) {
        Ok(s) => println!("{}", s),
        Err(_) => println!("{:?}", env),
    }
}

async fn connect(cli: &Cli) -> Result<PeerClient, ClientError> {
    match &cli.ca {
        Some(ca) => {
            let channel = TlsSecureChannel::client(ca, cli.identity.as_deref(), &cli.server_name)
                .map_err(opflex_server::error::TransportError::from)?;
            PeerClient::connect_with(cli.addr, &channel).await
        }
        None => PeerClient::connect(cli.addr).await,
    }
}

fn resolve_params(subject: &str, uri: &str) -> Value {
    json!({ "subject": subject, "policy_uri": uri })
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let roles = Role::from_names(&cli.roles[..]).map_err(anyhow::Error::msg)?;
    let mut client = connect(&cli).await?;
    let identity = client.identify(&cli.name, roles).await?;
    if identity.kind == MessageKind::ErrorResponse {
        print_envelope(&identity);
        anyhow::bail!("handshake rejected");
    }

    match cli.command {
        Commands::Identify => print_envelope(&identity),
        Commands::Resolve { subject, uri } => {
            let reply = client
                .call(methods::POLICY_RESOLVE, resolve_params(&subject, &uri))
                .await?;
            print_envelope(&reply);
        }
        Commands::Watch { subject, uri } => {
            let reply = client
                .call(methods::POLICY_RESOLVE, resolve_params(&subject, &uri))
                .await?;
            print_envelope(&reply);
            loop {
                let env = client.next_envelope().await?;
                print_envelope(&env);
                if env.kind == MessageKind::Request && env.id.is_some() {
                    let result = match env.method.as_deref() {
                        Some(methods::ECHO) => Value::Array(env.params().to_vec()),
                        _ => json!({}),
                    };
                    client.respond(&env, result).await?;
                }
            }
        }
        Commands::Echo { text } => {
            let reply = client.call(methods::ECHO, json!(text)).await?;
            print_envelope(&reply);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("❌ {}", e);
        std::process::exit(1);
    }
}
