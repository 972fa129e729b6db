//! Phoenix-protocol realtime client over one websocket.
//!
//! Messages use the v1 JSON object framing:
//! `{"topic", "event", "payload", "ref", "join_ref"}`. Every joined channel
//! owns a topic on the shared socket; replies and pushes are routed back to
//! it by topic. Reconnecting is left to the caller.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use super::channel::{
  Channel, ChangeEvent, ChangeKind, ChannelConfig, ChannelControl, ChannelEvent, ChannelStatus,
  PresenceMap, PresenceMeta, RealtimeTransport,
};

const PROTOCOL_VERSION: &str = "1.0.0";

/// One frame of the Phoenix protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoenixMessage {
  pub topic: String,
  pub event: String,
  #[serde(default)]
  pub payload: Value,
  #[serde(rename = "ref", default)]
  pub reference: Option<String>,
  #[serde(default)]
  pub join_ref: Option<String>,
}

/// Websocket URL for a backend base URL.
pub fn socket_url(base_url: &str, api_key: &str) -> Result<Url> {
  let mut url = Url::parse(base_url).map_err(|e| eyre!("Invalid backend URL {}: {}", base_url, e))?;
  let scheme = match url.scheme() {
    "https" | "wss" => "wss",
    "http" | "ws" => "ws",
    other => return Err(eyre!("Unsupported backend URL scheme: {}", other)),
  };
  url
    .set_scheme(scheme)
    .map_err(|_| eyre!("Failed to set websocket scheme on {}", base_url))?;
  url.set_path("/realtime/v1/websocket");
  url
    .query_pairs_mut()
    .clear()
    .append_pair("apikey", api_key)
    .append_pair("vsn", PROTOCOL_VERSION);
  Ok(url)
}

/// `phx_join` payload for a channel config.
pub fn join_payload(config: &ChannelConfig, access_token: Option<&str>) -> Value {
  let changes: Vec<Value> = config
    .changes
    .iter()
    .map(|filter| {
      let mut change = json!({
        "event": filter.event.as_wire(),
        "schema": filter.schema,
        "table": filter.table,
      });
      if let Some(expr) = filter.wire_filter() {
        change["filter"] = Value::String(expr);
      }
      change
    })
    .collect();

  let mut payload = json!({
    "config": {
      "broadcast": {"self": false, "ack": false},
      "presence": {"key": config.presence_key.clone().unwrap_or_default()},
      "postgres_changes": changes,
    }
  });
  if let Some(token) = access_token {
    payload["access_token"] = Value::String(token.to_string());
  }
  payload
}

fn parse_presence(raw: &Value) -> PresenceMap {
  let Some(entries) = raw.as_object() else {
    return PresenceMap::new();
  };
  entries
    .iter()
    .filter_map(|(key, entry)| {
      let metas: Vec<PresenceMeta> = entry
        .get("metas")?
        .as_array()?
        .iter()
        .filter_map(|meta| serde_json::from_value(meta.clone()).ok())
        .collect();
      (!metas.is_empty()).then(|| (key.clone(), metas))
    })
    .collect()
}

fn parse_change(data: &Value) -> Option<ChangeEvent> {
  let kind: ChangeKind = serde_json::from_value(data.get("type")?.clone()).ok()?;
  let text = |field: &str| data.get(field).and_then(Value::as_str).map(String::from);
  let object = |field: &str| {
    data
      .get(field)
      .filter(|v| v.is_object())
      .cloned()
      .unwrap_or_else(|| Value::Object(Default::default()))
  };

  Some(ChangeEvent {
    schema: text("schema")?,
    table: text("table")?,
    kind,
    record: object("record"),
    old_record: object("old_record"),
    commit_timestamp: text("commit_timestamp"),
  })
}

/// Translate one inbound frame for a channel joined under `join_ref`.
pub fn decode_event(message: &PhoenixMessage, join_ref: &str) -> Option<ChannelEvent> {
  let payload = &message.payload;
  match message.event.as_str() {
    "phx_reply" => {
      if message.reference.as_deref() != Some(join_ref) {
        return None;
      }
      match payload.get("status").and_then(Value::as_str) {
        Some("ok") => Some(ChannelEvent::Status(ChannelStatus::Joined)),
        _ => {
          let reason = payload
            .pointer("/response/reason")
            .and_then(Value::as_str)
            .unwrap_or("join refused");
          Some(ChannelEvent::Status(ChannelStatus::Errored(reason.to_string())))
        }
      }
    }
    "postgres_changes" => parse_change(payload.get("data")?).map(ChannelEvent::Change),
    "presence_state" => Some(ChannelEvent::PresenceState(parse_presence(payload))),
    "presence_diff" => Some(ChannelEvent::PresenceDiff {
      joins: parse_presence(payload.get("joins").unwrap_or(&Value::Null)),
      leaves: parse_presence(payload.get("leaves").unwrap_or(&Value::Null)),
    }),
    "system" => match payload.get("status").and_then(Value::as_str) {
      Some("error") => {
        let reason = payload
          .get("message")
          .and_then(Value::as_str)
          .unwrap_or("subscription failed");
        Some(ChannelEvent::Status(ChannelStatus::Errored(reason.to_string())))
      }
      _ => None,
    },
    "phx_close" => Some(ChannelEvent::Status(ChannelStatus::Closed)),
    "phx_error" => Some(ChannelEvent::Status(ChannelStatus::Errored(
      "channel crashed".to_string(),
    ))),
    _ => None,
  }
}

struct Slot {
  join_ref: String,
  tx: mpsc::UnboundedSender<ChannelEvent>,
}

struct Socket {
  outbound: mpsc::UnboundedSender<Message>,
  slots: Mutex<HashMap<String, Slot>>,
  next_ref: AtomicU64,
  access_token: Option<String>,
}

impl Socket {
  fn new(outbound: mpsc::UnboundedSender<Message>, access_token: Option<String>) -> Self {
    Self {
      outbound,
      slots: Mutex::new(HashMap::new()),
      next_ref: AtomicU64::new(1),
      access_token,
    }
  }

  fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Slot>>> {
    self.slots.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn make_ref(&self) -> String {
    self.next_ref.fetch_add(1, Ordering::Relaxed).to_string()
  }

  fn push(&self, topic: &str, event: &str, payload: Value, join_ref: Option<&str>) -> Result<()> {
    let message = PhoenixMessage {
      topic: topic.to_string(),
      event: event.to_string(),
      payload,
      reference: Some(self.make_ref()),
      join_ref: join_ref.map(String::from),
    };
    let text =
      serde_json::to_string(&message).map_err(|e| eyre!("Failed to encode {}: {}", event, e))?;
    self
      .outbound
      .send(Message::Text(text))
      .map_err(|_| eyre!("Realtime connection closed"))
  }

  /// Route an inbound frame to its channel.
  fn dispatch(&self, message: PhoenixMessage) {
    let Ok(mut slots) = self.lock() else {
      return;
    };
    let Some(slot) = slots.get(&message.topic) else {
      if message.topic != "phoenix" {
        debug!(topic = %message.topic, event = %message.event, "Frame for unknown topic");
      }
      return;
    };
    if let Some(join_ref) = &message.join_ref {
      if *join_ref != slot.join_ref {
        return;
      }
    }

    let Some(event) = decode_event(&message, &slot.join_ref) else {
      return;
    };
    let ended = matches!(
      event,
      ChannelEvent::Status(ChannelStatus::Closed | ChannelStatus::Errored(_))
    );
    let _ = slot.tx.send(event);
    if ended {
      slots.remove(&message.topic);
    }
  }

  /// Fail every channel after the connection went away.
  fn fail_all(&self, reason: &str) {
    let Ok(mut slots) = self.lock() else {
      return;
    };
    for (_, slot) in slots.drain() {
      let _ = slot
        .tx
        .send(ChannelEvent::Status(ChannelStatus::Errored(reason.to_string())));
    }
  }

  /// First free topic for a channel name.
  fn claim_topic(slots: &HashMap<String, Slot>, name: &str) -> String {
    let base = format!("realtime:{}", name);
    if !slots.contains_key(&base) {
      return base;
    }
    let free = (2..)
      .map(|n| format!("{}-{}", base, n))
      .find(|topic| !slots.contains_key(topic));
    free.unwrap_or(base)
  }
}

/// Realtime transport over a Phoenix websocket.
#[derive(Clone)]
pub struct PhoenixTransport {
  socket: Arc<Socket>,
}

impl PhoenixTransport {
  /// Open the websocket and start the writer, reader and heartbeat tasks.
  pub async fn connect(
    base_url: &str,
    api_key: &str,
    access_token: Option<String>,
    heartbeat: Duration,
  ) -> Result<Self> {
    let url = socket_url(base_url, api_key)?;
    let (stream, _) = tokio_tungstenite::connect_async(url.as_str())
      .await
      .map_err(|e| eyre!("Failed to connect to realtime at {}: {}", url.host_str().unwrap_or(""), e))?;
    info!(host = url.host_str().unwrap_or(""), "Realtime connected");

    let (mut sink, mut source) = stream.split();
    let (outbound, mut queued) = mpsc::unbounded_channel::<Message>();
    let socket = Arc::new(Socket::new(outbound, access_token));

    tokio::spawn(async move {
      while let Some(message) = queued.recv().await {
        if let Err(e) = sink.send(message).await {
          warn!(error = %e, "Realtime write failed");
          break;
        }
      }
      let _ = sink.send(Message::Close(None)).await;
    });

    let reader: Weak<Socket> = Arc::downgrade(&socket);
    tokio::spawn(async move {
      while let Some(frame) = source.next().await {
        let text = match frame {
          Ok(Message::Text(text)) => text,
          Ok(Message::Close(_)) => break,
          Ok(_) => continue,
          Err(e) => {
            warn!(error = %e, "Realtime read failed");
            break;
          }
        };
        let Some(socket) = reader.upgrade() else {
          break;
        };
        match serde_json::from_str::<PhoenixMessage>(&text) {
          Ok(message) => socket.dispatch(message),
          Err(e) => debug!(error = %e, "Ignoring undecodable realtime frame"),
        }
      }
      info!("Realtime connection closed");
      if let Some(socket) = reader.upgrade() {
        socket.fail_all("connection closed");
      }
    });

    let beat: Weak<Socket> = Arc::downgrade(&socket);
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(heartbeat);
      interval.tick().await;
      loop {
        interval.tick().await;
        let Some(socket) = beat.upgrade() else {
          break;
        };
        if socket.push("phoenix", "heartbeat", json!({}), None).is_err() {
          break;
        }
      }
    });

    Ok(Self { socket })
  }
}

#[async_trait]
impl RealtimeTransport for PhoenixTransport {
  async fn join(&self, config: ChannelConfig) -> Result<Channel> {
    let (tx, rx) = mpsc::unbounded_channel();
    let join_ref = self.socket.make_ref();
    let payload = join_payload(&config, self.socket.access_token.as_deref());

    let topic = {
      let mut slots = self.socket.lock()?;
      let topic = Socket::claim_topic(&slots, &config.name);
      slots.insert(
        topic.clone(),
        Slot {
          join_ref: join_ref.clone(),
          tx,
        },
      );
      topic
    };

    let message = PhoenixMessage {
      topic: topic.clone(),
      event: "phx_join".to_string(),
      payload,
      reference: Some(join_ref.clone()),
      join_ref: Some(join_ref.clone()),
    };
    let text = serde_json::to_string(&message)
      .map_err(|e| eyre!("Failed to encode join for {}: {}", topic, e))?;
    if self.socket.outbound.send(Message::Text(text)).is_err() {
      self.socket.lock()?.remove(&topic);
      return Err(eyre!("Failed to join {}: realtime connection closed", topic));
    }
    debug!(topic = %topic, "Sent join");

    Ok(Channel {
      topic: topic.clone(),
      events: rx,
      control: Arc::new(PhoenixChannel {
        socket: Arc::clone(&self.socket),
        topic,
        join_ref,
      }),
    })
  }
}

struct PhoenixChannel {
  socket: Arc<Socket>,
  topic: String,
  join_ref: String,
}

#[async_trait]
impl ChannelControl for PhoenixChannel {
  async fn track(&self, meta: PresenceMeta) -> Result<()> {
    let meta =
      serde_json::to_value(&meta).map_err(|e| eyre!("Failed to encode presence: {}", e))?;
    self.socket.push(
      &self.topic,
      "presence",
      json!({"type": "presence", "event": "track", "payload": meta}),
      Some(&self.join_ref),
    )
  }

  async fn untrack(&self) -> Result<()> {
    self.socket.push(
      &self.topic,
      "presence",
      json!({"type": "presence", "event": "untrack"}),
      Some(&self.join_ref),
    )
  }

  async fn leave(&self) -> Result<()> {
    let slot = {
      let mut slots = self.socket.lock()?;
      let ours = slots
        .get(&self.topic)
        .is_some_and(|slot| slot.join_ref == self.join_ref);
      if ours {
        slots.remove(&self.topic)
      } else {
        None
      }
    };
    let Some(slot) = slot else {
      return Ok(());
    };

    let _ = slot.tx.send(ChannelEvent::Status(ChannelStatus::Closed));
    self
      .socket
      .push(&self.topic, "phx_leave", json!({}), Some(&self.join_ref))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::realtime::channel::{ChangeFilter, ChangeKind};

  fn frame(topic: &str, event: &str, payload: Value, reference: Option<&str>) -> PhoenixMessage {
    PhoenixMessage {
      topic: topic.to_string(),
      event: event.to_string(),
      payload,
      reference: reference.map(String::from),
      join_ref: None,
    }
  }

  fn detached() -> (PhoenixTransport, mpsc::UnboundedReceiver<Message>) {
    let (outbound, queued) = mpsc::unbounded_channel();
    let transport = PhoenixTransport {
      socket: Arc::new(Socket::new(outbound, Some("jwt".to_string()))),
    };
    (transport, queued)
  }

  fn sent(queued: &mut mpsc::UnboundedReceiver<Message>) -> Vec<PhoenixMessage> {
    let mut frames = Vec::new();
    while let Ok(Message::Text(text)) = queued.try_recv() {
      frames.push(serde_json::from_str(&text).unwrap());
    }
    frames
  }

  #[test]
  fn test_socket_url() {
    let url = socket_url("https://abc.supabase.co", "anon").unwrap();
    assert_eq!(
      url.as_str(),
      "wss://abc.supabase.co/realtime/v1/websocket?apikey=anon&vsn=1.0.0"
    );

    let local = socket_url("http://localhost:54321/", "k").unwrap();
    assert_eq!(local.scheme(), "ws");
    assert_eq!(local.port(), Some(54321));
    assert!(socket_url("ftp://nope", "k").is_err());
  }

  #[test]
  fn test_join_payload() {
    let filter = ChangeFilter::table("mcard_reviews").eq("mcard_id", "m1");
    let config = ChannelConfig {
      name: filter.channel_name(),
      changes: vec![filter, ChangeFilter::table("mcards").only(ChangeKind::Delete)],
      presence_key: None,
    };

    let payload = join_payload(&config, Some("jwt"));
    let changes = &payload["config"]["postgres_changes"];
    assert_eq!(changes[0]["table"], "mcard_reviews");
    assert_eq!(changes[0]["event"], "*");
    assert_eq!(changes[0]["filter"], "mcard_id=eq.m1");
    assert_eq!(changes[1]["event"], "DELETE");
    assert!(changes[1].get("filter").is_none());
    assert_eq!(payload["config"]["presence"]["key"], "");
    assert_eq!(payload["access_token"], "jwt");
  }

  #[test]
  fn test_decode_join_reply() {
    let ok = frame("realtime:x", "phx_reply", json!({"status": "ok", "response": {}}), Some("1"));
    assert_eq!(
      decode_event(&ok, "1"),
      Some(ChannelEvent::Status(ChannelStatus::Joined))
    );
    // Replies to other pushes are not join acknowledgements.
    assert_eq!(decode_event(&ok, "7"), None);

    let refused = frame(
      "realtime:x",
      "phx_reply",
      json!({"status": "error", "response": {"reason": "unauthorized"}}),
      Some("1"),
    );
    assert_eq!(
      decode_event(&refused, "1"),
      Some(ChannelEvent::Status(ChannelStatus::Errored("unauthorized".into())))
    );
  }

  #[test]
  fn test_decode_postgres_change() {
    let message = frame(
      "realtime:x",
      "postgres_changes",
      json!({
        "ids": [1],
        "data": {
          "schema": "public",
          "table": "mcard_statuses",
          "type": "DELETE",
          "commit_timestamp": "2026-01-01T00:00:00Z",
          "old_record": {"id": "s1", "mcard_id": "m1"}
        }
      }),
      None,
    );

    let Some(ChannelEvent::Change(change)) = decode_event(&message, "1") else {
      panic!("expected a change");
    };
    assert_eq!(change.kind, ChangeKind::Delete);
    assert_eq!(change.table, "mcard_statuses");
    assert_eq!(change.old_record["mcard_id"], "m1");
    assert!(change.record.as_object().unwrap().is_empty());
    assert!(ChangeFilter::table("mcard_statuses")
      .eq("mcard_id", "m1")
      .matches(&change));
  }

  #[test]
  fn test_decode_presence() {
    let state = frame(
      "realtime:online-users",
      "presence_state",
      json!({
        "k1": {"metas": [{"phx_ref": "F1", "user_id": "alice", "online_at": "2026-01-01T00:00:00Z"}]},
        "k2": {"metas": [{"phx_ref": "F2", "garbage": true}]}
      }),
      None,
    );
    let Some(ChannelEvent::PresenceState(map)) = decode_event(&state, "1") else {
      panic!("expected presence state");
    };
    assert_eq!(map.len(), 1);
    assert_eq!(map["k1"][0].user_id, "alice");

    let diff = frame(
      "realtime:online-users",
      "presence_diff",
      json!({
        "joins": {},
        "leaves": {"k1": {"metas": [{"user_id": "alice", "online_at": "2026-01-01T00:00:00Z"}]}}
      }),
      None,
    );
    let Some(ChannelEvent::PresenceDiff { joins, leaves }) = decode_event(&diff, "1") else {
      panic!("expected presence diff");
    };
    assert!(joins.is_empty());
    assert!(leaves.contains_key("k1"));
  }

  #[test]
  fn test_decode_close_and_errors() {
    let close = frame("realtime:x", "phx_close", json!({}), None);
    assert_eq!(
      decode_event(&close, "1"),
      Some(ChannelEvent::Status(ChannelStatus::Closed))
    );
    let system = frame(
      "realtime:x",
      "system",
      json!({"status": "error", "message": "bad filter"}),
      None,
    );
    assert_eq!(
      decode_event(&system, "1"),
      Some(ChannelEvent::Status(ChannelStatus::Errored("bad filter".into())))
    );
    let ok_system = frame("realtime:x", "system", json!({"status": "ok"}), None);
    assert_eq!(decode_event(&ok_system, "1"), None);
  }

  #[tokio::test]
  async fn test_join_track_and_leave_frames() {
    let (transport, mut queued) = detached();
    let mut channel = transport
      .join(ChannelConfig {
        name: "online-users".into(),
        changes: vec![],
        presence_key: Some("me".into()),
      })
      .await
      .unwrap();

    let frames = sent(&mut queued);
    assert_eq!(frames.len(), 1);
    let join = &frames[0];
    assert_eq!(join.topic, "realtime:online-users");
    assert_eq!(join.event, "phx_join");
    assert_eq!(join.payload["config"]["presence"]["key"], "me");
    assert_eq!(join.payload["access_token"], "jwt");

    let join_ref = join.reference.clone().unwrap();
    transport.socket.dispatch(frame(
      "realtime:online-users",
      "phx_reply",
      json!({"status": "ok"}),
      Some(&join_ref),
    ));
    assert_eq!(
      channel.events.try_recv().unwrap(),
      ChannelEvent::Status(ChannelStatus::Joined)
    );

    channel
      .control
      .track(PresenceMeta::now("alice"))
      .await
      .unwrap();
    let frames = sent(&mut queued);
    let track = &frames[0];
    assert_eq!(track.event, "presence");
    assert_eq!(track.payload["event"], "track");
    assert_eq!(track.payload["payload"]["user_id"], "alice");
    assert_eq!(track.join_ref.as_deref(), Some(join_ref.as_str()));

    channel.control.leave().await.unwrap();
    assert_eq!(sent(&mut queued)[0].event, "phx_leave");
    assert_eq!(
      channel.events.try_recv().unwrap(),
      ChannelEvent::Status(ChannelStatus::Closed)
    );
    // Leaving twice sends nothing more.
    channel.control.leave().await.unwrap();
    assert!(sent(&mut queued).is_empty());
  }

  #[tokio::test]
  async fn test_same_name_gets_distinct_topics() {
    let (transport, mut queued) = detached();
    let config = ChannelConfig {
      name: "mcards-abc".into(),
      ..Default::default()
    };
    let a = transport.join(config.clone()).await.unwrap();
    let b = transport.join(config).await.unwrap();
    assert_eq!(a.topic, "realtime:mcards-abc");
    assert_eq!(b.topic, "realtime:mcards-abc-2");
    assert_eq!(sent(&mut queued).len(), 2);
  }

  #[tokio::test]
  async fn test_connection_loss_fails_channels() {
    let (transport, _queued) = detached();
    let mut channel = transport
      .join(ChannelConfig {
        name: "x".into(),
        ..Default::default()
      })
      .await
      .unwrap();

    transport.socket.fail_all("connection closed");
    assert_eq!(
      channel.events.try_recv().unwrap(),
      ChannelEvent::Status(ChannelStatus::Errored("connection closed".into()))
    );
  }
}
