//! Conversion between the messaging envelope and AMQP frames.

use lapin::types::{AMQPValue, ByteArray, FieldTable, LongString, ShortString};
use lapin::BasicProperties;
use messaging::{Header, HeaderValue, Message};

const PERSISTENT: u8 = 2;

/// Field table to header.
///
/// Integer kinds widen to `Int`, long strings become `Str`, byte arrays stay
/// bytes. Anything else is rendered to a string.
pub fn header_from_table(table: Option<&FieldTable>) -> Header {
    let Some(table) = table else {
        return Header::new();
    };

    table
        .inner()
        .iter()
        .map(|(key, value)| (key.as_str().to_string(), value_from_amqp(value)))
        .collect()
}

fn value_from_amqp(value: &AMQPValue) -> HeaderValue {
    match value {
        AMQPValue::Boolean(b) => HeaderValue::Bool(*b),
        AMQPValue::ShortShortInt(i) => HeaderValue::Int(i64::from(*i)),
        AMQPValue::ShortShortUInt(i) => HeaderValue::Int(i64::from(*i)),
        AMQPValue::ShortInt(i) => HeaderValue::Int(i64::from(*i)),
        AMQPValue::ShortUInt(i) => HeaderValue::Int(i64::from(*i)),
        AMQPValue::LongInt(i) => HeaderValue::Int(i64::from(*i)),
        AMQPValue::LongUInt(i) => HeaderValue::Int(i64::from(*i)),
        AMQPValue::LongLongInt(i) => HeaderValue::Int(*i),
        AMQPValue::Timestamp(t) => match i64::try_from(*t) {
            Ok(t) => HeaderValue::Int(t),
            Err(_) => HeaderValue::Str(t.to_string()),
        },
        AMQPValue::ShortString(s) => HeaderValue::Str(s.as_str().to_string()),
        AMQPValue::LongString(s) => {
            HeaderValue::Str(String::from_utf8_lossy(s.as_bytes()).into_owned())
        }
        AMQPValue::ByteArray(b) => HeaderValue::Bytes(b.as_slice().to_vec()),
        AMQPValue::Float(f) => HeaderValue::Str(f.to_string()),
        AMQPValue::Double(f) => HeaderValue::Str(f.to_string()),
        other => HeaderValue::Str(format!("{other:?}")),
    }
}

/// Header to field table.
pub fn header_to_table(header: &Header) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in header {
        let value = match value {
            HeaderValue::Str(s) => AMQPValue::LongString(LongString::from(s.as_str())),
            HeaderValue::Bytes(b) => AMQPValue::ByteArray(ByteArray::from(b.clone())),
            HeaderValue::Int(i) => AMQPValue::LongLongInt(*i),
            HeaderValue::Bool(b) => AMQPValue::Boolean(*b),
        };
        table.insert(ShortString::from(key.as_str()), value);
    }
    table
}

/// Build the inbound envelope from a delivery's parts.
pub fn message_from_parts(routing_key: &str, properties: &BasicProperties, body: Vec<u8>) -> Message {
    let mut message = Message::new(body)
        .with_topic(routing_key)
        .with_headers(header_from_table(properties.headers().as_ref()));
    message.id = properties
        .message_id()
        .as_ref()
        .map(|id| id.as_str().to_string())
        .filter(|id| !id.is_empty());
    message
}

/// Publish properties for an outgoing envelope.
pub fn publish_properties(message: &Message, persistent: bool) -> BasicProperties {
    let mut properties = BasicProperties::default();
    if persistent {
        properties = properties.with_delivery_mode(PERSISTENT);
    }
    if message.no_header {
        return properties;
    }
    if let Some(id) = message.id.as_deref().filter(|id| !id.is_empty()) {
        properties = properties.with_message_id(ShortString::from(id));
    }
    properties.with_headers(header_to_table(&message.headers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use messaging::keys;

    #[test]
    fn test_field_table_kinds() {
        let mut table = FieldTable::default();
        table.insert("s".into(), AMQPValue::LongString("text".into()));
        table.insert("short".into(), AMQPValue::ShortString("short".into()));
        table.insert("i32".into(), AMQPValue::LongInt(-7));
        table.insert("u8".into(), AMQPValue::ShortShortUInt(200));
        table.insert("flag".into(), AMQPValue::Boolean(true));
        table.insert("raw".into(), AMQPValue::ByteArray(vec![1u8, 2, 3].into()));
        table.insert("ratio".into(), AMQPValue::Double(0.5));

        let header = header_from_table(Some(&table));
        assert_eq!(header.get_value("s"), Some(&HeaderValue::Str("text".to_string())));
        assert_eq!(header.get_value("short"), Some(&HeaderValue::Str("short".to_string())));
        assert_eq!(header.get_value("i32"), Some(&HeaderValue::Int(-7)));
        assert_eq!(header.get_value("u8"), Some(&HeaderValue::Int(200)));
        assert_eq!(header.get_value("flag"), Some(&HeaderValue::Bool(true)));
        assert_eq!(header.get_value("raw"), Some(&HeaderValue::Bytes(vec![1, 2, 3])));
        assert_eq!(header.get("ratio"), "0.5");
    }

    #[test]
    fn test_header_to_table_keeps_types() {
        let mut header = Header::new();
        header.set("s", "x");
        header.set("n", 42i64);
        header.set("b", false);

        let table = header_to_table(&header);
        let back = header_from_table(Some(&table));
        assert_eq!(back, header);
        assert!(matches!(
            table.inner().get(&ShortString::from("n")),
            Some(AMQPValue::LongLongInt(42))
        ));
    }

    #[test]
    fn test_message_from_parts() {
        let mut headers = Header::new();
        headers.set(keys::CORRELATION_ID, "cid-1");
        let properties = BasicProperties::default()
            .with_message_id("msg-1".into())
            .with_headers(header_to_table(&headers));

        let message = message_from_parts("orders", &properties, b"body".to_vec());
        assert_eq!(message.topic, "orders");
        assert_eq!(message.id.as_deref(), Some("msg-1"));
        assert_eq!(message.headers.get(keys::CORRELATION_ID), "cid-1");

        let bare = message_from_parts("orders", &BasicProperties::default(), Vec::new());
        assert!(bare.id.is_none());
        assert!(bare.headers.is_empty());
    }

    #[test]
    fn test_publish_properties() {
        let message = Message::new("x").with_id("id-9").with_header("k", "v");
        let properties = publish_properties(&message, true);
        assert_eq!(*properties.delivery_mode(), Some(PERSISTENT));
        assert_eq!(properties.message_id().as_ref().map(|s| s.as_str()), Some("id-9"));
        assert!(properties.headers().is_some());

        let bare = publish_properties(&message.clone().without_headers(), false);
        assert!(bare.headers().is_none());
        assert!(bare.message_id().is_none());
        assert!(bare.delivery_mode().is_none());
    }
}
