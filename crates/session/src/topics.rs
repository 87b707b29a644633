//! Per-device topic names and transient telemetry messages.

use crate::error::PublishError;

/// Topics owned by one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTopics {
    events: String,
    state: String,
    config: String,
    commands: String,
}

impl DeviceTopics {
    pub fn new(device_id: &str) -> Self {
        Self {
            events: format!("/devices/{device_id}/events"),
            state: format!("/devices/{device_id}/state"),
            config: format!("/devices/{device_id}/config"),
            commands: format!("/devices/{device_id}/commands/#"),
        }
    }

    pub fn events(&self) -> &str {
        &self.events
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn config(&self) -> &str {
        &self.config
    }

    /// Wildcard filter covering every command subfolder.
    pub fn commands(&self) -> &str {
        &self.commands
    }

    /// Telemetry topic, optionally below a subfolder of the events topic.
    pub fn telemetry_topic(&self, subfolder: Option<&str>) -> Result<String, PublishError> {
        match subfolder {
            None => Ok(self.events.clone()),
            Some(sub) => {
                validate_subfolder(sub)?;
                Ok(format!("{}/{}", self.events, sub))
            }
        }
    }
}

fn validate_subfolder(subfolder: &str) -> Result<(), PublishError> {
    let invalid = subfolder.is_empty()
        || subfolder.starts_with('/')
        || subfolder.ends_with('/')
        || subfolder.contains("//")
        || subfolder
            .chars()
            .any(|c| c == '#' || c == '+' || c.is_control());

    if invalid {
        return Err(PublishError::InvalidSubfolder(subfolder.to_string()));
    }
    Ok(())
}

/// One telemetry publish, alive only for the duration of the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetryMessage<'a> {
    subfolder: Option<&'a str>,
    payload: &'a [u8],
}

impl<'a> TelemetryMessage<'a> {
    pub fn new(subfolder: Option<&'a str>, payload: &'a [u8]) -> Self {
        Self { subfolder, payload }
    }

    pub fn subfolder(&self) -> Option<&'a str> {
        self.subfolder
    }

    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_topics() {
        let topics = DeviceTopics::new("sensor-7");

        assert_eq!(topics.events(), "/devices/sensor-7/events");
        assert_eq!(topics.state(), "/devices/sensor-7/state");
        assert_eq!(topics.config(), "/devices/sensor-7/config");
        assert_eq!(topics.commands(), "/devices/sensor-7/commands/#");
    }

    #[test]
    fn test_telemetry_topic_with_subfolder() {
        let topics = DeviceTopics::new("sensor-7");

        assert_eq!(
            topics.telemetry_topic(None).unwrap(),
            "/devices/sensor-7/events"
        );
        assert_eq!(
            topics.telemetry_topic(Some("status")).unwrap(),
            "/devices/sensor-7/events/status"
        );
        assert_eq!(
            topics.telemetry_topic(Some("env/temperature")).unwrap(),
            "/devices/sensor-7/events/env/temperature"
        );
    }

    #[test]
    fn test_invalid_subfolders_rejected() {
        let topics = DeviceTopics::new("sensor-7");

        for bad in ["", "/status", "status/", "a//b", "#", "a/+/b"] {
            assert_eq!(
                topics.telemetry_topic(Some(bad)),
                Err(PublishError::InvalidSubfolder(bad.to_string())),
                "subfolder {bad:?}"
            );
        }
    }

    #[test]
    fn test_message_length() {
        let message = TelemetryMessage::new(Some("status"), b"LAN: 99 db");

        assert_eq!(message.len(), 10);
        assert!(!message.is_empty());
        assert_eq!(message.subfolder(), Some("status"));
    }
}
