//! Entities mirrored from the server, and their merge rules.

use serde::Serialize;

use htsp_protocol::{Message, ProtocolError, Value};

/// An entity kept up to date by push notifications.
pub trait Mirrored: Clone {
    /// Name of the field carrying the entity id.
    const ID_FIELD: &'static str;

    /// Empty entity with the given id.
    fn new(id: u32) -> Self;

    /// Overwrite every field present in `msg`; absent fields keep their value.
    fn merge(&mut self, msg: &Message) -> Result<(), ProtocolError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Channel {
    pub id: u32,
    pub name: String,
    pub number: u32,
    pub radio: bool,
    pub icon: String,
    /// Conditional-access system id, 0 for free-to-air.
    pub caid: u32,
    /// Currently running event, 0 if none.
    pub event_id: u32,
}

impl Mirrored for Channel {
    const ID_FIELD: &'static str = "channelId";

    fn new(id: u32) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    fn merge(&mut self, msg: &Message) -> Result<(), ProtocolError> {
        if let Some(name) = msg.opt_str("channelName")? {
            self.name = name.to_string();
        }
        if let Some(number) = msg.opt_u32("channelNumber")? {
            self.number = number;
        }
        if let Some(icon) = msg.opt_str("channelIcon")? {
            self.icon = icon.to_string();
        }
        if let Some(event_id) = msg.opt_u32("eventId")? {
            self.event_id = event_id;
        }
        if let Some(services) = msg.opt_list("services")? {
            self.radio = false;
            self.caid = 0;
            for service in services {
                let service = match service {
                    Value::Map(service) => service,
                    _ => {
                        return Err(ProtocolError::TypeMismatch {
                            field: "services".to_string(),
                            expected: "list of map",
                        })
                    }
                };
                if service.opt_str("type")? == Some("Radio") {
                    self.radio = true;
                }
                if self.caid == 0 {
                    self.caid = service.opt_u32("caid")?.unwrap_or(0);
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Tag {
    pub id: u32,
    pub name: String,
    pub icon: String,
    /// Member channel ids in server order. May reference missing channels.
    pub members: Vec<u32>,
}

impl Mirrored for Tag {
    const ID_FIELD: &'static str = "tagId";

    fn new(id: u32) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    fn merge(&mut self, msg: &Message) -> Result<(), ProtocolError> {
        if let Some(name) = msg.opt_str("tagName")? {
            self.name = name.to_string();
        }
        if let Some(icon) = msg.opt_str("tagIcon")? {
            self.icon = icon.to_string();
        }
        if let Some(members) = msg.opt_list("members")? {
            self.members = members
                .iter()
                .map(|member| {
                    member.as_u32().ok_or_else(|| ProtocolError::TypeMismatch {
                        field: "members".to_string(),
                        expected: "list of u32",
                    })
                })
                .collect::<Result<_, _>>()?;
        }
        Ok(())
    }
}

/// Lifecycle of a DVR entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingState {
    #[default]
    Scheduled,
    Recording,
    Completed,
    Aborted,
}

impl RecordingState {
    /// Map the server's `state` string. A completed entry that carries an
    /// error counts as aborted; unknown states are treated the same way.
    pub fn from_server(state: &str, error: Option<&str>) -> Self {
        match state {
            "scheduled" => RecordingState::Scheduled,
            "recording" => RecordingState::Recording,
            "completed" if error.map_or(true, str::is_empty) => RecordingState::Completed,
            _ => RecordingState::Aborted,
        }
    }

    /// Scheduled or recording: shown as a timer.
    pub fn is_timer(self) -> bool {
        matches!(self, RecordingState::Scheduled | RecordingState::Recording)
    }

    /// Completed or aborted: shown as a recording.
    pub fn is_recorded(self) -> bool {
        !self.is_timer()
    }
}

/// A DVR entry. Timers and recordings are both views of this type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Recording {
    pub id: u32,
    /// Weak reference; the channel may no longer exist.
    pub channel: u32,
    pub title: String,
    pub description: String,
    pub start: i64,
    pub stop: i64,
    pub state: RecordingState,
    pub error: Option<String>,
}

impl Recording {
    pub fn duration(&self) -> i64 {
        self.stop - self.start
    }
}

impl Mirrored for Recording {
    const ID_FIELD: &'static str = "id";

    fn new(id: u32) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    fn merge(&mut self, msg: &Message) -> Result<(), ProtocolError> {
        if let Some(channel) = msg.opt_u32("channel")? {
            self.channel = channel;
        }
        if let Some(start) = msg.opt_s64("start")? {
            self.start = start;
        }
        if let Some(stop) = msg.opt_s64("stop")? {
            self.stop = stop;
        }
        if let Some(title) = msg.opt_str("title")? {
            self.title = title.to_string();
        }
        if let Some(description) = msg.opt_str("description")? {
            self.description = description.to_string();
        }
        if let Some(error) = msg.opt_str("error")? {
            self.error = Some(error.to_string()).filter(|e| !e.is_empty());
        }
        if let Some(state) = msg.opt_str("state")? {
            self.state = RecordingState::from_server(state, self.error.as_deref());
        }
        Ok(())
    }
}

/// An EPG entry, fetched on demand with `getEvent`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Event {
    pub id: u32,
    /// Owning channel, if the server reported one.
    pub channel_id: Option<u32>,
    pub title: String,
    pub description: String,
    pub start: i64,
    pub stop: i64,
    /// Raw DVB content nibble pair.
    pub content: u32,
    /// Following event on the same channel, 0 at the end of the chain.
    pub next: u32,
}

impl Event {
    /// Parse a `getEvent` reply. `start`, `stop` and `title` are required.
    pub fn from_message(id: u32, msg: &Message) -> Result<Self, ProtocolError> {
        Ok(Self {
            id,
            channel_id: msg.opt_u32("channelId")?,
            title: msg.str("title")?.to_string(),
            description: msg.opt_str("description")?.unwrap_or_default().to_string(),
            start: msg.s64("start")?,
            stop: msg.s64("stop")?,
            content: msg.opt_u32("contentType")?.unwrap_or(0),
            next: msg.opt_u32("nextEventId")?.unwrap_or(0),
        })
    }
}

/// Parameters of a new timer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimerRequest {
    pub channel_id: u32,
    /// EPG event to record, 0 for a manual timer.
    pub event_id: u32,
    pub title: String,
    pub description: String,
    pub start: i64,
    pub stop: i64,
    pub priority: u32,
}

/// Recording storage, in KiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DriveSpace {
    pub total: i64,
    pub used: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ServerTime {
    /// Server wall clock shifted into its local zone.
    pub local_time: i64,
    /// Offset to add to local time to get UTC, in minutes.
    pub gmt_offset: i32,
}
