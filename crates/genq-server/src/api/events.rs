use super::AppState;
use crate::{Frame, Notifier, Subscription};
use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default, rename = "taskId", alias = "task_id")]
    task_id: Option<String>,
}

/// Unregisters the client when the response stream is dropped.
struct Registration {
    notifier: Arc<Notifier>,
    client_id: String,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.notifier.disconnect_client(&self.client_id);
    }
}

fn to_event(frame: Frame) -> Event {
    match frame {
        Frame::Connected { client_id } => Event::default()
            .event("connected")
            .data(json!({ "clientId": client_id }).to_string()),
        Frame::TaskUpdate(task) => match serde_json::to_string(&task) {
            Ok(data) => Event::default().event("task_update").data(data),
            Err(_) => Event::default().comment("unencodable task update"),
        },
        Frame::Heartbeat => Event::default().comment("heartbeat"),
    }
}

pub async fn stream(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = match query.task_id.filter(|id| !id.is_empty()) {
        Some(id) => Subscription::Task(id),
        None => Subscription::All,
    };

    let handle = state.notifier.subscribe(subscription.clone());
    if let Subscription::Task(task_id) = &subscription {
        if let Ok(Some(current)) = state.store.get_safe(task_id) {
            state
                .notifier
                .send_to(&handle.client_id, Frame::TaskUpdate(current));
        }
    }
    state
        .metrics
        .sse_clients
        .set(state.notifier.client_count() as i64);

    let registration = Registration {
        notifier: state.notifier.clone(),
        client_id: handle.client_id,
    };
    let events = ReceiverStream::new(handle.frames).map(move |frame| {
        let _registered = &registration;
        Ok(to_event(frame))
    });

    Sse::new(events).keep_alive(KeepAlive::default())
}
