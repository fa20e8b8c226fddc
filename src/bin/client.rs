//! Demo client: joins a room with silent tracks and logs what happens.
//! Real deployments plug a device-backed capture source in instead.

use anyhow::Result;
use meshcall::{RoomClient, SilentCapture};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://127.0.0.1:8080".to_string());
    let room_id = std::env::args().nth(2).unwrap_or_else(|| "lobby".to_string());

    let client = RoomClient::join(&url, &room_id, &SilentCapture).await?;
    info!(%room_id, "joined; waiting for peers (ctrl-c to leave)");

    let mut states = client.link_states();
    let mut slots = client.view_slots();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                client.leave();
                break;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                for (peer, state) in states.borrow().iter() {
                    info!(%peer, %state, "link");
                }
            }
            changed = slots.changed() => {
                if changed.is_err() {
                    break;
                }
                for (idx, slot) in slots.borrow().iter().enumerate() {
                    match slot {
                        Some(binding) => info!(
                            slot = idx,
                            peer = %binding.participant,
                            tracks = binding.tracks.len(),
                            "display slot bound"
                        ),
                        None => info!(slot = idx, "display slot empty"),
                    }
                }
            }
        }
    }

    client.wait().await?;
    Ok(())
}
