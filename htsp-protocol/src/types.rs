//! Message and value definitions for the HTSP protocol.

use crate::error::ProtocolError;

/// Protocol version announced in `hello`.
pub const HTSP_PROTO_VERSION: u32 = 5;

/// Oldest server protocol version this client can talk to.
pub const MIN_PROTOCOL_VERSION: u32 = 2;

/// Maximum frame body size (16 MB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Field type tags of the binary encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldType {
    /// Nested map of named fields.
    Map = 1,
    /// Signed 64-bit integer (all integers travel as S64).
    S64 = 2,
    /// UTF-8 string.
    Str = 3,
    /// Opaque binary blob.
    Bin = 4,
    /// List of unnamed fields.
    List = 5,
}

impl TryFrom<u8> for FieldType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FieldType::Map),
            2 => Ok(FieldType::S64),
            3 => Ok(FieldType::Str),
            4 => Ok(FieldType::Bin),
            5 => Ok(FieldType::List),
            v => Err(v),
        }
    }
}

impl From<FieldType> for u8 {
    fn from(value: FieldType) -> Self {
        value as u8
    }
}

/// A typed field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Map(Message),
    S64(i64),
    Str(String),
    Bin(Vec<u8>),
    List(Vec<Value>),
}

impl Value {
    pub fn field_type(&self) -> FieldType {
        match self {
            Value::Map(_) => FieldType::Map,
            Value::S64(_) => FieldType::S64,
            Value::Str(_) => FieldType::Str,
            Value::Bin(_) => FieldType::Bin,
            Value::List(_) => FieldType::List,
        }
    }

    pub fn as_s64(&self) -> Option<i64> {
        match self {
            Value::S64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        self.as_s64().and_then(|v| u32::try_from(v).ok())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Message> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }
}

/// An ordered mapping from field names to typed values.
///
/// Field order is preserved on the wire. Setting an existing name replaces
/// the value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    fields: Vec<(String, Value)>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a request carrying the given `method`.
    pub fn method(name: &str) -> Self {
        Self::new().with_str("method", name)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    /// Insert or replace a field.
    pub fn set(&mut self, name: &str, value: Value) {
        match self.fields.iter_mut().find(|(k, _)| k == name) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((name.to_string(), value)),
        }
    }

    pub(crate) fn push_field(&mut self, name: String, value: Value) {
        self.fields.push((name, value));
    }

    pub fn with(mut self, name: &str, value: Value) -> Self {
        self.set(name, value);
        self
    }

    pub fn with_str(self, name: &str, value: impl Into<String>) -> Self {
        self.with(name, Value::Str(value.into()))
    }

    pub fn with_s64(self, name: &str, value: i64) -> Self {
        self.with(name, Value::S64(value))
    }

    pub fn with_u32(self, name: &str, value: u32) -> Self {
        self.with(name, Value::S64(value as i64))
    }

    pub fn with_bin(self, name: &str, value: impl Into<Vec<u8>>) -> Self {
        self.with(name, Value::Bin(value.into()))
    }

    /// The `method` field, if present and a string.
    pub fn method_name(&self) -> Option<&str> {
        self.get("method").and_then(Value::as_str)
    }

    /// The `seq` field, if present and in `u32` range.
    pub fn seq(&self) -> Option<u32> {
        self.get("seq").and_then(Value::as_u32)
    }

    fn require(&self, name: &str) -> Result<&Value, ProtocolError> {
        self.get(name)
            .ok_or_else(|| ProtocolError::FieldMissing(name.to_string()))
    }

    fn mismatch(name: &str, expected: &'static str) -> ProtocolError {
        ProtocolError::TypeMismatch {
            field: name.to_string(),
            expected,
        }
    }

    pub fn s64(&self, name: &str) -> Result<i64, ProtocolError> {
        self.require(name)?
            .as_s64()
            .ok_or_else(|| Self::mismatch(name, "s64"))
    }

    pub fn u64(&self, name: &str) -> Result<u64, ProtocolError> {
        u64::try_from(self.s64(name)?).map_err(|_| Self::mismatch(name, "u64"))
    }

    pub fn u32(&self, name: &str) -> Result<u32, ProtocolError> {
        u32::try_from(self.s64(name)?).map_err(|_| Self::mismatch(name, "u32"))
    }

    pub fn s32(&self, name: &str) -> Result<i32, ProtocolError> {
        i32::try_from(self.s64(name)?).map_err(|_| Self::mismatch(name, "s32"))
    }

    pub fn str(&self, name: &str) -> Result<&str, ProtocolError> {
        self.require(name)?
            .as_str()
            .ok_or_else(|| Self::mismatch(name, "str"))
    }

    pub fn bin(&self, name: &str) -> Result<&[u8], ProtocolError> {
        match self.require(name)? {
            Value::Bin(b) => Ok(b),
            _ => Err(Self::mismatch(name, "bin")),
        }
    }

    pub fn map(&self, name: &str) -> Result<&Message, ProtocolError> {
        self.require(name)?
            .as_map()
            .ok_or_else(|| Self::mismatch(name, "map"))
    }

    pub fn list(&self, name: &str) -> Result<&[Value], ProtocolError> {
        match self.require(name)? {
            Value::List(items) => Ok(items),
            _ => Err(Self::mismatch(name, "list")),
        }
    }

    /// Like [`Message::u32`], but an absent field is `Ok(None)`.
    pub fn opt_u32(&self, name: &str) -> Result<Option<u32>, ProtocolError> {
        if self.contains(name) {
            self.u32(name).map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn opt_s64(&self, name: &str) -> Result<Option<i64>, ProtocolError> {
        if self.contains(name) {
            self.s64(name).map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn opt_str(&self, name: &str) -> Result<Option<&str>, ProtocolError> {
        if self.contains(name) {
            self.str(name).map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn opt_list(&self, name: &str) -> Result<Option<&[Value]>, ProtocolError> {
        if self.contains(name) {
            self.list(name).map(Some)
        } else {
            Ok(None)
        }
    }
}

/// Entity kinds mirrored by push notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Channel,
    Tag,
    DvrEntry,
}

/// Mutation carried by a push notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mutation {
    Add,
    Update,
    Delete,
}

/// The fixed push-notification vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PushMethod {
    Entity(EntityKind, Mutation),
    /// End of the initial state dump after `enableAsyncMetadata`.
    InitialSyncCompleted,
}

impl PushMethod {
    /// Look up a method name. Unknown names yield `None`.
    pub fn parse(method: &str) -> Option<Self> {
        use EntityKind::*;
        use Mutation::*;

        let entity = |kind, mutation| Some(PushMethod::Entity(kind, mutation));
        match method {
            "channelAdd" => entity(Channel, Add),
            "channelUpdate" => entity(Channel, Update),
            "channelDelete" => entity(Channel, Delete),
            "tagAdd" => entity(Tag, Add),
            "tagUpdate" => entity(Tag, Update),
            "tagDelete" => entity(Tag, Delete),
            "dvrEntryAdd" => entity(DvrEntry, Add),
            "dvrEntryUpdate" => entity(DvrEntry, Update),
            "dvrEntryDelete" => entity(DvrEntry, Delete),
            "initialSyncCompleted" => Some(PushMethod::InitialSyncCompleted),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        use EntityKind::*;
        use Mutation::*;

        match self {
            PushMethod::Entity(Channel, Add) => "channelAdd",
            PushMethod::Entity(Channel, Update) => "channelUpdate",
            PushMethod::Entity(Channel, Delete) => "channelDelete",
            PushMethod::Entity(Tag, Add) => "tagAdd",
            PushMethod::Entity(Tag, Update) => "tagUpdate",
            PushMethod::Entity(Tag, Delete) => "tagDelete",
            PushMethod::Entity(DvrEntry, Add) => "dvrEntryAdd",
            PushMethod::Entity(DvrEntry, Update) => "dvrEntryUpdate",
            PushMethod::Entity(DvrEntry, Delete) => "dvrEntryDelete",
            PushMethod::InitialSyncCompleted => "initialSyncCompleted",
        }
    }
}

/// Classification of an inbound frame, made once at decode time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Frame carries a `seq` and may answer an outstanding request.
    Reply { seq: u32, message: Message },
    /// Frame carries a `method` and no `seq`.
    Notification { method: String, message: Message },
    /// Frame carries neither.
    Unlabelled(Message),
}

impl Inbound {
    pub fn classify(message: Message) -> Self {
        if let Some(seq) = message.seq() {
            return Inbound::Reply { seq, message };
        }
        match message.method_name().map(str::to_string) {
            Some(method) => Inbound::Notification { method, message },
            None => Inbound::Unlabelled(message),
        }
    }
}
