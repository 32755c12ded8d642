use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::{Parser, Subcommand};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use shared::{
    domain::RobotId,
    protocol::{WireFrame, COMMAND_EVENT},
};
use storage::{OwnershipStore, StateCache, Storage};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/relay.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Grant an operator access to a robot.
    AssignRobot {
        email: String,
        robot_id: String,
        #[arg(long)]
        ui_type: Option<String>,
    },
    UnassignRobot {
        email: String,
        robot_id: String,
    },
    ListRobots {
        email: String,
    },
    /// Print the cached state document for a robot.
    RobotState {
        robot_id: String,
    },
    /// Connect to a running relay as a robot and answer commands.
    SimulateRobot {
        #[arg(long, default_value = "http://127.0.0.1:8000")]
        url: String,
        #[arg(long)]
        robot_id: String,
        /// Send a synthetic camera frame every N seconds.
        #[arg(long)]
        image_every: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let database_url = cli.database_url;

    match cli.command {
        Command::AssignRobot {
            email,
            robot_id,
            ui_type,
        } => {
            let storage = Storage::new(&database_url).await?;
            storage
                .assign_robot(&email, &RobotId::new(robot_id.clone()), ui_type.as_deref())
                .await?;
            println!("assigned robot_id={robot_id} to {email}");
        }
        Command::UnassignRobot { email, robot_id } => {
            let storage = Storage::new(&database_url).await?;
            let removed = storage
                .unassign_robot(&email, &RobotId::new(robot_id.clone()))
                .await?;
            if removed {
                println!("unassigned robot_id={robot_id} from {email}");
            } else {
                println!("{email} did not own robot_id={robot_id}");
            }
        }
        Command::ListRobots { email } => {
            let storage = Storage::new(&database_url).await?;
            for robot in storage.robots_for_owner(&email).await? {
                println!("{}\t{}", robot.robot_id, robot.ui_type);
            }
        }
        Command::RobotState { robot_id } => {
            let storage = Storage::new(&database_url).await?;
            let robot_id = RobotId::new(robot_id);
            match storage.get(&robot_id).await? {
                Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
                None => bail!("no cached state for robot_id={robot_id}"),
            }
        }
        Command::SimulateRobot {
            url,
            robot_id,
            image_every,
        } => {
            simulate_robot(
                &url,
                RobotId::new(robot_id),
                image_every.map(Duration::from_secs),
            )
            .await?;
        }
    }

    Ok(())
}

fn websocket_url(server_url: &str) -> Result<Url> {
    let mut url = Url::parse(server_url).with_context(|| format!("invalid url: {server_url}"))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(anyhow!("unsupported url scheme: {other}")),
    };
    url.set_scheme(scheme)
        .map_err(|()| anyhow!("cannot use scheme {scheme} for {server_url}"))?;
    url.set_path("/ws");
    Ok(url)
}

fn frame(event: &str, data: serde_json::Value) -> Message {
    Message::Text(json!({ "event": event, "data": data }).to_string())
}

async fn simulate_robot(
    server_url: &str,
    robot_id: RobotId,
    image_every: Option<Duration>,
) -> Result<()> {
    let ws_url = websocket_url(server_url)?;
    let (ws_stream, _) = connect_async(ws_url.as_str())
        .await
        .with_context(|| format!("failed to connect websocket: {ws_url}"))?;
    let (mut writer, mut reader) = ws_stream.split();

    writer
        .send(frame("register_robot", json!({ "robot_id": robot_id })))
        .await?;
    info!(%robot_id, %ws_url, "registered simulated robot");

    let mut camera = image_every.map(tokio::time::interval);
    let mut frames_sent: u64 = 0;

    loop {
        let tick = async {
            match camera.as_mut() {
                Some(interval) => {
                    interval.tick().await;
                }
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            incoming = reader.next() => {
                let Some(message) = incoming else {
                    info!("relay closed the connection");
                    break;
                };
                match message? {
                    Message::Text(text) => {
                        let Ok(received) = serde_json::from_str::<WireFrame>(&text) else {
                            warn!(%text, "ignoring undecodable frame");
                            continue;
                        };
                        if received.event != COMMAND_EVENT {
                            continue;
                        }
                        let Some(command) = received.data.get("command").and_then(|c| c.as_str()) else {
                            warn!(data = %received.data, "command frame without a command");
                            continue;
                        };
                        info!(%command, "command received");
                        writer
                            .send(frame(
                                "status_update",
                                json!({ "robot_id": robot_id, "status": format!("{command} complete") }),
                            ))
                            .await?;
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            _ = tick => {
                frames_sent += 1;
                let image = STANDARD.encode(format!("{robot_id} frame {frames_sent}"));
                writer
                    .send(frame(
                        "robot_image",
                        json!({ "robot_id": robot_id, "image_base64": image }),
                    ))
                    .await?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down simulated robot");
                let _ = writer.send(Message::Close(None)).await;
                break;
            }
        }
    }

    Ok(())
}
