use anyhow::Result;
use clap::{Parser, Subcommand};
use pnet_base::MacAddr;
use portauth_ipc::{Command, Response};
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Control socket of the running authenticator
    #[clap(short, long, value_parser, default_value = "/var/run/portauth.sock")]
    socket: PathBuf,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List known stations
    List,
    /// Deauthenticate a station and drop its state
    Disconnect {
        #[clap(value_parser)]
        mac: MacAddr,
    },
    /// Start a new authentication of a station
    Reauth {
        #[clap(value_parser)]
        mac: MacAddr,
    },
}

async fn send_command(path: &PathBuf, command: Command) -> Result<Response> {
    let mut stream = UnixStream::connect(path).await?;
    let serialized = serde_json::to_vec(&command)?;

    stream.write_all(&serialized).await?;
    stream.shutdown().await?;

    let mut buffer = Vec::new();
    stream.read_to_end(&mut buffer).await?;

    Ok(serde_json::from_slice(&buffer)?)
}

fn report(response: Response, what: &str) {
    match response {
        Response::Success => println!("{}: done", what),
        Response::Error(e) => eprintln!("{}: {}", what, e),
        _ => eprintln!("Unexpected response from server"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::List => match send_command(&cli.socket, Command::List).await? {
            Response::Stations(stations) => {
                println!(
                    "{:<17} {:<5} {:<4} {:<20} {:<6} {:<15} {:<10}",
                    "MAC Address", "AID", "BSS", "Identity", "Port", "AUTH_PAE", "BE_AUTH"
                );
                println!("{:-<83}", "");
                for sta in stations {
                    println!(
                        "{:<17} {:<5} {:<4} {:<20} {:<6} {:<15} {:<10}",
                        sta.addr.to_string(),
                        sta.aid,
                        sta.bss,
                        sta.identity.as_deref().unwrap_or("-"),
                        if sta.authorized { "AUTH" } else { "NOAUTH" },
                        format!("{:?}", sta.auth_pae),
                        format!("{:?}", sta.be_auth),
                    );
                }
            }
            Response::Error(e) => eprintln!("Server error: {}", e),
            _ => eprintln!("Unexpected response from server"),
        },
        Commands::Disconnect { mac } => {
            let response = send_command(&cli.socket, Command::Disconnect { mac }).await?;
            report(response, &format!("Disconnect {}", mac));
        }
        Commands::Reauth { mac } => {
            let response = send_command(&cli.socket, Command::Reauthenticate { mac }).await?;
            report(response, &format!("Reauthenticate {}", mac));
        }
    }

    Ok(())
}
