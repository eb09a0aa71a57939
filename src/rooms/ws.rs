use axum::{
    debug_handler,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use tokio::sync::mpsc;
use tower_sessions::Session;
use tracing::{debug, warn};

use crate::{
    AppResult,
    rooms::{
        channel::Signaling,
        msg::{ClientEvent, ServerEvent},
    },
    session::{self, SessionIdentity},
};

#[debug_handler(state = crate::AppState)]
pub async fn room_ws(
    State(signaling): State<Signaling>,
    session: Session,

    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    let identity = session::identity(&session).await?;

    Ok(ws.on_upgrade(async move |stream| serve_channel(signaling, identity, stream).await))
}

async fn serve_channel(signaling: Signaling, identity: Option<SessionIdentity>, stream: WebSocket) {
    let (mut ctx, rx) = signaling.connect(identity);
    let conn_id = ctx.conn_id();
    let (sender, mut receiver) = stream.split();

    let mut writer = tokio::spawn(forward_events(rx, sender));

    loop {
        tokio::select! {
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientEvent>(text.as_str()) {
                    Ok(event) => signaling.handle(&mut ctx, event).await,
                    Err(err) => warn!(%conn_id, error = %err, "dropping malformed frame"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(%conn_id, error = %err, "channel read failed");
                    break;
                }
            },
            _ = &mut writer => {
                debug!(%conn_id, "channel writer stopped");
                break;
            }
        }
    }

    signaling.disconnect(&mut ctx).await;
    writer.abort();
}

async fn forward_events(mut rx: mpsc::Receiver<ServerEvent>, mut sender: SplitSink<WebSocket, Message>) {
    while let Some(event) = rx.recv().await {
        let text = match serde_json::to_string(&event) {
            Ok(text) => text,
            Err(err) => {
                warn!(event = event.name(), error = %err, "could not encode event");
                continue;
            }
        };
        if sender.send(Message::Text(text.into())).await.is_err() {
            break;
        }
    }
}
