// Shared data model for chat messages, presence and notifications
// Wire names follow the backend's camelCase JSON

use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: i64,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    #[serde(with = "timestamp")]
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
}

impl Message {
    /// The participant on the other side of this message, seen from `self_id`.
    pub fn counterpart<'a>(&'a self, self_id: &str) -> &'a str {
        if self.sender_id == self_id {
            &self.receiver_id
        } else {
            &self.sender_id
        }
    }
}

/// Messages exchanged with one counterpart, derived from the flat message list.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub counterpart_id: String,
    pub last_message: Message,
    pub message_count: usize,
    pub unread_count: usize,
}

/// Group a message sequence by counterpart. The conversation whose last message
/// arrived latest comes first.
pub fn group_conversations(self_id: &str, messages: &[Message]) -> Vec<Conversation> {
    let mut grouped: HashMap<&str, (usize, Conversation)> = HashMap::new();

    for (position, msg) in messages.iter().enumerate() {
        let counterpart = msg.counterpart(self_id);
        let unread = usize::from(msg.sender_id == counterpart && msg.sender_id != self_id && !msg.is_read);

        match grouped.get_mut(counterpart) {
            Some((last_position, conversation)) => {
                *last_position = position;
                conversation.last_message = msg.clone();
                conversation.message_count += 1;
                conversation.unread_count += unread;
            }
            None => {
                grouped.insert(counterpart, (position, Conversation {
                    counterpart_id: counterpart.to_string(),
                    last_message: msg.clone(),
                    message_count: 1,
                    unread_count: unread,
                }));
            }
        }
    }

    let mut conversations: Vec<(usize, Conversation)> = grouped.into_values().collect();
    conversations.sort_by(|a, b| b.0.cmp(&a.0));
    conversations.into_iter().map(|(_, conversation)| conversation).collect()
}

/// A provider's self-reported availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AvailabilityStatus {
    Available,
    Busy,
    Away,
    Offline,
}

impl AvailabilityStatus {
    pub const ALL: [AvailabilityStatus; 4] = [
        AvailabilityStatus::Available,
        AvailabilityStatus::Busy,
        AvailabilityStatus::Away,
        AvailabilityStatus::Offline,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AvailabilityStatus::Available => "Available",
            AvailabilityStatus::Busy => "Busy",
            AvailabilityStatus::Away => "Away",
            AvailabilityStatus::Offline => "Offline",
        }
    }

    fn from_ordinal(value: u64) -> Option<Self> {
        Self::ALL.get(usize::try_from(value).ok()?).copied()
    }
}

impl fmt::Display for AvailabilityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AvailabilityStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Ok(ordinal) = trimmed.parse::<u64>() {
            return Self::from_ordinal(ordinal).ok_or_else(|| format!("unknown status ordinal {}", ordinal));
        }
        Self::ALL
            .iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(trimmed))
            .copied()
            .ok_or_else(|| format!("unknown status '{}'", trimmed))
    }
}

impl Serialize for AvailabilityStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for AvailabilityStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // The hub may serialize the enum either by name or by ordinal
        match serde_json::Value::deserialize(deserializer)? {
            serde_json::Value::String(name) => name.parse().map_err(de::Error::custom),
            serde_json::Value::Number(n) => n
                .as_u64()
                .and_then(Self::from_ordinal)
                .ok_or_else(|| de::Error::custom(format!("unknown status ordinal {}", n))),
            other => Err(de::Error::custom(format!("unexpected status value {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NotificationStatus {
    Read,
    #[default]
    NotRead,
}

/// Category of a notification event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationKind {
    NewBooking,
    NewReview,
    BookingStatusChange,
    PaymentStatusChange,
    NewMessage,
    Other(String),
}

impl NotificationKind {
    pub fn from_name(name: &str) -> Self {
        match name {
            "NewBooking" => NotificationKind::NewBooking,
            "NewReview" => NotificationKind::NewReview,
            "BookingStatusChange" => NotificationKind::BookingStatusChange,
            "PaymentStatusChange" => NotificationKind::PaymentStatusChange,
            "NewMessage" => NotificationKind::NewMessage,
            other => NotificationKind::Other(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            NotificationKind::NewBooking => "NewBooking",
            NotificationKind::NewReview => "NewReview",
            NotificationKind::BookingStatusChange => "BookingStatusChange",
            NotificationKind::PaymentStatusChange => "PaymentStatusChange",
            NotificationKind::NewMessage => "NewMessage",
            NotificationKind::Other(name) => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingStatus {
    Pending,
    Approved,
    Rejected,
    Completed,
    Confirmed,
    Other(String),
}

impl BookingStatus {
    pub fn from_name(name: &str) -> Self {
        match name {
            "Pending" => BookingStatus::Pending,
            "Approved" => BookingStatus::Approved,
            "Rejected" => BookingStatus::Rejected,
            "Completed" => BookingStatus::Completed,
            "Confirmed" => BookingStatus::Confirmed,
            other => BookingStatus::Other(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            BookingStatus::Pending => "Pending",
            BookingStatus::Approved => "Approved",
            BookingStatus::Rejected => "Rejected",
            BookingStatus::Completed => "Completed",
            BookingStatus::Confirmed => "Confirmed",
            BookingStatus::Other(name) => name,
        }
    }
}

macro_rules! named_enum_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.name())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let name = string_or_number(deserializer)?;
                Ok(<$ty>::from_name(&name))
            }
        }
    };
}

named_enum_serde!(NotificationKind);
named_enum_serde!(BookingStatus);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub message: String,
    #[serde(with = "timestamp")]
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub status: NotificationStatus,
    #[serde(rename = "type", default)]
    pub kind: Option<NotificationKind>,
    #[serde(default, deserialize_with = "optional_string_or_number")]
    pub booking_id: Option<String>,
    #[serde(default)]
    pub booking_status: Option<BookingStatus>,
    #[serde(default)]
    pub icon: String,
}

impl Notification {
    pub fn is_unread(&self) -> bool {
        self.status == NotificationStatus::NotRead
    }
}

/// Accept an identifier that the backend may send as a JSON string or number.
pub(crate) fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!("expected a string or number, got {}", other))),
    }
}

pub(crate) fn optional_string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::String(s) if s.is_empty() => Ok(None),
        serde_json::Value::String(s) => Ok(Some(s)),
        serde_json::Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(de::Error::custom(format!("expected a string or number, got {}", other))),
    }
}

/// Timestamps arrive either as RFC 3339 or as a naive ISO-8601 date-time in UTC.
pub(crate) mod timestamp {
    use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| de::Error::custom(format!("invalid timestamp '{}'", raw)))
    }

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Some(parsed.with_timezone(&Utc));
        }
        ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"]
            .iter()
            .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
            .map(|naive| Utc.from_utc_datetime(&naive))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn message(id: i64, from: &str, to: &str, is_read: bool) -> Message {
        Message {
            id,
            sender_id: from.to_string(),
            receiver_id: to.to_string(),
            content: format!("message {}", id),
            sent_at: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, id as u32).unwrap(),
            is_read,
        }
    }

    #[test]
    fn test_message_wire_format() {
        let msg: Message = serde_json::from_value(json!({
            "id": 7,
            "senderId": "u1",
            "receiverId": "u2",
            "content": "hi",
            "sentAt": "2024-05-01T10:15:30.123",
            "isRead": false
        }))
        .unwrap();

        assert_eq!(msg.id, 7);
        assert_eq!(msg.sender_id, "u1");
        assert_eq!(msg.sent_at, Utc.with_ymd_and_hms(2024, 5, 1, 10, 15, 30).unwrap() + chrono::Duration::milliseconds(123));

        let back = serde_json::to_value(&msg).unwrap();
        assert_eq!(back["receiverId"], "u2");
        assert_eq!(back["isRead"], false);
    }

    #[test]
    fn test_timestamp_with_offset() {
        let parsed = timestamp::parse("2024-05-01T12:00:00+02:00").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap());
        assert!(timestamp::parse("yesterday").is_none());
    }

    #[test]
    fn test_availability_status_decoding() {
        let by_name: AvailabilityStatus = serde_json::from_value(json!("busy")).unwrap();
        assert_eq!(by_name, AvailabilityStatus::Busy);

        let by_ordinal: AvailabilityStatus = serde_json::from_value(json!(2)).unwrap();
        assert_eq!(by_ordinal, AvailabilityStatus::Away);

        assert!(serde_json::from_value::<AvailabilityStatus>(json!(9)).is_err());
        assert!(serde_json::from_value::<AvailabilityStatus>(json!("Sleeping")).is_err());
        assert_eq!(serde_json::to_value(AvailabilityStatus::Offline).unwrap(), json!("Offline"));
    }

    #[test]
    fn test_notification_backlog_item() {
        let item: Notification = serde_json::from_value(json!({
            "id": 12,
            "message": "Your booking #4 has been approved",
            "date": "2024-05-01T09:00:00Z",
            "status": "read",
            "type": "BookingStatusChange",
            "bookingId": 4,
            "bookingStatus": "Approved",
            "icon": "clipboard-check"
        }))
        .unwrap();

        assert_eq!(item.id, "12");
        assert_eq!(item.status, NotificationStatus::Read);
        assert_eq!(item.kind, Some(NotificationKind::BookingStatusChange));
        assert_eq!(item.booking_id.as_deref(), Some("4"));
        assert_eq!(item.booking_status, Some(BookingStatus::Approved));
        assert!(!item.is_unread());
    }

    #[test]
    fn test_notification_defaults() {
        let item: Notification = serde_json::from_value(json!({
            "id": "n-1",
            "date": "2024-05-01T09:00:00",
            "type": "SomethingNew",
            "bookingId": null
        }))
        .unwrap();

        assert_eq!(item.status, NotificationStatus::NotRead);
        assert_eq!(item.kind, Some(NotificationKind::Other("SomethingNew".to_string())));
        assert_eq!(item.booking_id, None);
        assert!(item.message.is_empty());
    }

    #[test]
    fn test_group_conversations() {
        let messages = vec![
            message(1, "u2", "me", false),
            message(2, "me", "u3", false),
            message(3, "u2", "me", true),
            message(4, "me", "u2", false),
            message(5, "u3", "me", false),
        ];

        let conversations = group_conversations("me", &messages);
        assert_eq!(conversations.len(), 2);

        // u3 holds the latest message
        assert_eq!(conversations[0].counterpart_id, "u3");
        assert_eq!(conversations[0].message_count, 2);
        assert_eq!(conversations[0].unread_count, 1);

        assert_eq!(conversations[1].counterpart_id, "u2");
        assert_eq!(conversations[1].last_message.id, 4);
        assert_eq!(conversations[1].unread_count, 1);
    }
}
