use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use prox_proto::{decode_server_frame, encode, ClientFrame, ServerFrame};
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, warn};

#[derive(Parser, Debug)]
#[command(name = "prox-road", version)]
#[command(about = "ProxCity signaling server and probe client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Address to bind the websocket listener to.
    #[arg(long, env = "PROX_ROAD_LISTEN_ADDR", default_value = "0.0.0.0:3000")]
    pub listen_addr: String,

    /// Seconds between liveness pings sent to each session.
    #[arg(long, env = "PROX_ROAD_PROBE_INTERVAL_SECS", default_value_t = 5)]
    pub probe_interval_secs: u64,

    /// Seconds without a pong after which a session is reaped.
    #[arg(long, env = "PROX_ROAD_DEAD_AFTER_SECS", default_value_t = 12)]
    pub dead_after_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "PROX_ROAD_SHUTDOWN_GRACE_SECS", default_value_t = 1)]
    pub shutdown_grace_secs: u64,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Join a running server under an identity and print what it sends back
    Probe {
        /// Signaling server URL
        #[arg(short, long, default_value = "ws://127.0.0.1:3000/ws")]
        url: String,

        /// Identity to join with
        #[arg(short = 'k', long)]
        public_key: String,

        /// Request the roster after joining
        #[arg(long)]
        list: bool,

        /// How long to keep printing frames
        #[arg(long, default_value_t = 10)]
        listen_secs: u64,
    },
}

pub async fn run_probe_client(
    url: String,
    public_key: String,
    list: bool,
    listen_secs: u64,
) -> Result<()> {
    debug!("Connecting to {} as {}", url, public_key);

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(url.as_str())).await
    {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("Failed to connect to {}: {}", url, e);
            return Err(anyhow!("Connection failed: {}", e));
        }
        Err(_) => {
            error!("Connection timeout after 5 seconds");
            return Err(anyhow!(
                "Connection timeout - is the signaling server running?"
            ));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let join = encode(&ClientFrame::Join { public_key })?;
    write.send(Message::Text(join)).await?;
    if list {
        write.send(Message::Text(encode(&ClientFrame::List)?)).await?;
    }

    let deadline = Instant::now() + Duration::from_secs(listen_secs);
    loop {
        let next = match timeout(deadline.saturating_duration_since(Instant::now()), read.next())
            .await
        {
            Ok(next) => next,
            Err(_) => break,
        };
        let Some(msg) = next else {
            return Err(anyhow!("Connection closed by server"));
        };
        match msg.context("websocket read failed")? {
            Message::Text(text) => match decode_server_frame(&text) {
                Ok(frame) => print_frame(&frame),
                Err(err) => warn!("Unrecognised frame {}: {}", text, err),
            },
            Message::Close(frame) => {
                println!("server closed connection: {:?}", frame);
                return Ok(());
            }
            _ => {}
        }
    }

    write.send(Message::Close(None)).await?;
    Ok(())
}

fn print_frame(frame: &ServerFrame) {
    match frame {
        ServerFrame::Peers { peers, session_id } => {
            println!(
                "PEERS ({}) session={}",
                peers.len(),
                session_id.as_deref().unwrap_or("-")
            );
            for peer in peers {
                println!("  {}", peer);
            }
        }
        ServerFrame::Join {
            public_key,
            session_id,
        } => println!(
            "JOIN  {} session={}",
            public_key,
            session_id.as_deref().unwrap_or("-")
        ),
        ServerFrame::Leave {
            public_key,
            session_id,
        } => println!(
            "LEAVE {} session={}",
            public_key,
            session_id.as_deref().unwrap_or("-")
        ),
        ServerFrame::Signal(signal) => {
            println!("SIGNAL {} from {}", signal.signal.kind(), signal.from)
        }
        ServerFrame::Trust { to, .. } => println!("TRUST to {}", to),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn serve_is_the_default_mode() {
        let cli = Cli::try_parse_from(["prox-road", "--probe-interval-secs", "2"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.serve.probe_interval_secs, 2);
        assert_eq!(cli.serve.dead_after_secs, 12);
    }

    #[test_timeout::timeout]
    fn probe_requires_identity() {
        assert!(Cli::try_parse_from(["prox-road", "probe"]).is_err());
        let cli = Cli::try_parse_from(["prox-road", "probe", "-k", "pk-a", "--list"]).unwrap();
        match cli.command {
            Some(Commands::Probe {
                public_key, list, ..
            }) => {
                assert_eq!(public_key, "pk-a");
                assert!(list);
            }
            None => panic!("expected probe subcommand"),
        }
    }
}
