//! WebSocket endpoint for live viewers. A connection joins and leaves groups
//! with JSON commands and receives every event published to its groups.

use crate::publisher::{building_group, Hub, LiveEvent, DASHBOARD_GROUP};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_stream::StreamMap;
use tracing::{debug, warn};

type Subscriptions = StreamMap<String, BroadcastStream<Arc<LiveEvent>>>;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientCommand {
    JoinDashboard,
    JoinBuilding { building: String },
    LeaveBuilding { building: String },
}

pub fn router(hub: Arc<Hub>) -> Router {
    Router::new().route("/ws", get(ws_handler)).with_state(hub)
}

async fn ws_handler(ws: WebSocketUpgrade, State(hub): State<Arc<Hub>>) -> Response {
    ws.on_upgrade(move |socket| session(socket, hub))
}

async fn session(socket: WebSocket, hub: Arc<Hub>) {
    let (mut outgoing, mut incoming) = socket.split();
    let mut subscriptions = Subscriptions::new();

    loop {
        tokio::select! {
            message = incoming.next() => match message {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientCommand>(&text) {
                    Ok(command) => apply(&hub, &mut subscriptions, command),
                    Err(e) => debug!(error = %e, "Ignoring unknown live command"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "Live connection error");
                    break;
                }
            },
            Some((group, event)) = subscriptions.next(), if !subscriptions.is_empty() => match event {
                Ok(event) => {
                    let text = match serde_json::to_string(event.as_ref()) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, "Failed to encode live event");
                            continue;
                        }
                    };
                    if outgoing.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(group = %group, skipped, "Live viewer lagging, events dropped");
                }
            },
        }
    }
    debug!(groups = subscriptions.len(), "Live connection closed");
}

fn apply(hub: &Hub, subscriptions: &mut Subscriptions, command: ClientCommand) {
    let (group, join) = match command {
        ClientCommand::JoinDashboard => (DASHBOARD_GROUP.to_string(), true),
        ClientCommand::JoinBuilding { building } => (building_group(&building), true),
        ClientCommand::LeaveBuilding { building } => (building_group(&building), false),
    };
    if join {
        if !subscriptions.contains_key(&group) {
            let receiver = hub.join(&group);
            subscriptions.insert(group, BroadcastStream::new(receiver));
        }
    } else {
        subscriptions.remove(&group);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commands_decode() {
        let join: ClientCommand =
            serde_json::from_str(r#"{"action":"join_building","building":"HQ"}"#).unwrap();
        let dashboard: ClientCommand = serde_json::from_str(r#"{"action":"join_dashboard"}"#).unwrap();

        assert_eq!(
            join,
            ClientCommand::JoinBuilding {
                building: "HQ".to_string()
            }
        );
        assert_eq!(dashboard, ClientCommand::JoinDashboard);
        assert!(serde_json::from_str::<ClientCommand>(r#"{"action":"shout"}"#).is_err());
    }

    #[tokio::test]
    async fn test_join_and_leave_track_hub_membership() {
        let hub = Hub::new(8);
        let mut subscriptions = Subscriptions::new();
        let join = ClientCommand::JoinBuilding {
            building: "HQ".to_string(),
        };

        apply(&hub, &mut subscriptions, join.clone());
        apply(&hub, &mut subscriptions, join);
        assert_eq!(hub.subscriber_count("building:HQ"), 1);

        apply(
            &hub,
            &mut subscriptions,
            ClientCommand::LeaveBuilding {
                building: "HQ".to_string(),
            },
        );
        assert_eq!(hub.subscriber_count("building:HQ"), 0);
    }
}
