//! Unit tests for the relay data model

#[cfg(test)]
mod tests {
    use super::super::model::*;
    use crate::ValidationError;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn test_monitor_id_parse_valid() {
        assert_eq!("7".parse::<MonitorId>().unwrap(), MonitorId::new(7));
        assert_eq!("0".parse::<MonitorId>().unwrap(), MonitorId::new(0));
        assert_eq!(" 42 ".parse::<MonitorId>().unwrap().get(), 42);
    }

    #[test]
    fn test_monitor_id_parse_invalid() {
        for raw in ["abc", "-1", "+3", "1.5", "7abc", "", "99999999999999999999999"] {
            assert_matches!(
                raw.parse::<MonitorId>(),
                Err(ValidationError::InvalidMonitorId(_)),
                "input {raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_monitor_id_from_param() {
        assert_eq!(
            MonitorId::from_param(None),
            Err(ValidationError::MissingMonitorId)
        );
        assert_eq!(
            MonitorId::from_param(Some("  ")),
            Err(ValidationError::MissingMonitorId)
        );
        assert_eq!(MonitorId::from_param(Some("12")), Ok(MonitorId::new(12)));
        assert_matches!(
            MonitorId::from_param(Some("abc")),
            Err(ValidationError::InvalidMonitorId(raw)) if raw == "abc"
        );
    }

    #[test]
    fn test_heartbeat_status_accepts_codes_and_names() {
        let from_code: HeartbeatStatus = serde_json::from_value(json!(1)).unwrap();
        let from_name: HeartbeatStatus = serde_json::from_value(json!("up")).unwrap();
        assert_eq!(from_code, HeartbeatStatus::Up);
        assert_eq!(from_name, HeartbeatStatus::Up);

        assert!(serde_json::from_value::<HeartbeatStatus>(json!(9)).is_err());
        assert!(serde_json::from_value::<HeartbeatStatus>(json!("sideways")).is_err());
    }

    #[test]
    fn test_heartbeat_status_serializes_as_code() {
        assert_eq!(serde_json::to_value(HeartbeatStatus::Down).unwrap(), json!(0));
        assert_eq!(
            serde_json::to_value(HeartbeatStatus::Maintenance).unwrap(),
            json!(3)
        );
    }

    #[test]
    fn test_heartbeat_event_from_kuma_payload() {
        let payload = json!({
            "monitorID": 7,
            "status": 1,
            "msg": "200 - OK",
            "time": "2024-05-01 10:00:00.000",
            "ping": 42,
            "duration": 60,
            "important": true,
            "down_count": 0
        });

        let event: HeartbeatEvent = serde_json::from_value(payload).unwrap();
        assert_eq!(event.monitor_id, MonitorId::new(7));
        assert_eq!(event.status, HeartbeatStatus::Up);
        assert_eq!(event.msg, "200 - OK");
        assert_eq!(event.ping, Some(42.0));
        assert!(event.is_important());
        assert_eq!(event.extra["duration"], json!(60));
        assert_eq!(event.extra["down_count"], json!(0));
    }

    #[test]
    fn test_heartbeat_event_forwards_unknown_fields() {
        let event: HeartbeatEvent = serde_json::from_value(json!({
            "monitorID": 9,
            "status": "down",
            "timestamp": 101,
            "important": 0
        }))
        .unwrap();

        assert_eq!(event.msg, "");
        assert!(!event.is_important());

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["monitorID"], json!(9));
        assert_eq!(value["status"], json!(0));
        assert_eq!(value["timestamp"], json!(101));
        assert!(value.get("time").is_none());
    }

    #[test]
    fn test_heartbeat_event_null_ping() {
        let event: HeartbeatEvent =
            serde_json::from_value(json!({"monitorID": 1, "status": 2, "ping": null})).unwrap();
        assert_eq!(event.ping, None);
        assert_eq!(event.status, HeartbeatStatus::Pending);
    }

    #[test]
    fn test_heartbeat_event_null_msg_is_kept() {
        let event: HeartbeatEvent =
            serde_json::from_value(json!({"monitorID": 7, "status": 1, "msg": null})).unwrap();
        assert_eq!(event.monitor_id, MonitorId::new(7));
        assert_eq!(event.status, HeartbeatStatus::Up);
        assert_eq!(event.msg, "");
    }

    #[test]
    fn test_connection_status() {
        let status = ConnectionStatus::new(ConnectionState::Connected, true);
        assert!(status.connected);
        assert!(status.is_active());

        let disconnected = ConnectionStatus::disconnected();
        assert!(!disconnected.connected);
        assert!(!disconnected.authenticated);
        assert!(!disconnected.is_active());

        let connecting = ConnectionStatus::new(ConnectionState::Connecting, false);
        assert!(!connecting.connected);
        assert!(connecting.is_active());

        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["state"], json!("connected"));
        assert_eq!(value["connected"], json!(true));
        assert_eq!(value["authenticated"], json!(true));
        assert_eq!(value["reconnectAttempts"], json!(0));
        assert!(value.get("lastHeartbeatAt").is_none());
    }

    #[test]
    fn test_stream_message_shapes() {
        let id = MonitorId::new(7);

        assert_eq!(
            serde_json::to_value(StreamMessage::connected(id)).unwrap(),
            json!({"type": "connected", "monitorId": 7})
        );

        assert_eq!(
            serde_json::to_value(StreamMessage::error(id, "Connection refused")).unwrap(),
            json!({"type": "error", "monitorId": 7, "error": "Connection refused"})
        );

        let heartbeat = StreamMessage::heartbeat(
            HeartbeatEvent::new(id, HeartbeatStatus::Up).with_field("timestamp", json!(100)),
        );
        let value = serde_json::to_value(&heartbeat).unwrap();
        assert_eq!(value["type"], json!("heartbeat"));
        assert_eq!(value["monitorId"], json!(7));
        assert_eq!(value["data"]["monitorID"], json!(7));
        assert_eq!(value["data"]["status"], json!(1));
        assert_eq!(value["data"]["timestamp"], json!(100));

        let status = StreamMessage::status(id, ConnectionStatus::disconnected());
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["status"]["state"], json!("disconnected"));
    }

    #[test]
    fn test_ping_timestamp_is_recent_millis() {
        let before = chrono::Utc::now().timestamp_millis();
        let ping = StreamMessage::ping();
        let after = chrono::Utc::now().timestamp_millis();

        assert_matches!(ping, StreamMessage::Ping { timestamp } if timestamp >= before && timestamp <= after);
        assert_eq!(ping.kind(), "ping");
    }

    #[test]
    fn test_json_is_single_line() {
        let heartbeat = StreamMessage::heartbeat(
            HeartbeatEvent::new(MonitorId::new(3), HeartbeatStatus::Down).with_msg("line one\nline two"),
        );
        let json = heartbeat.to_json().unwrap();
        assert!(!json.contains('\n'));
    }

    #[test]
    fn test_stream_message_parses_back() {
        let message = StreamMessage::error(MonitorId::new(5), "boom");
        let json = message.to_json().unwrap();
        let parsed: StreamMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.kind(), "error");
        assert_eq!(parsed, message);
    }
}
