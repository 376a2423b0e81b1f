//! XML snapshot of the event log.
//!
//! One `<event>` element per record. Temperatures are stored as a
//! `;`-separated list so the document stays flat.

use std::io::Write;

use serde::{Deserialize, Serialize};

use crate::{Error, Event, EventKind, Result};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "event_log")]
struct EventLogDoc {
    #[serde(rename = "event", default)]
    events: Vec<XmlEvent>,
}

#[derive(Debug, Serialize, Deserialize)]
struct XmlEvent {
    kind: String,
    timestamp_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    temperatures: Option<String>,
}

const KIND_TRIAL_INCREMENT: &str = "trial_increment";
const KIND_TRIAL_RESET: &str = "trial_reset";
const KIND_MESSAGE: &str = "message";
const KIND_TEMPERATURE: &str = "temperature_check";

impl From<&Event> for XmlEvent {
    fn from(event: &Event) -> Self {
        let (kind, message, temperatures) = match &event.kind {
            EventKind::TrialIncrement => (KIND_TRIAL_INCREMENT, None, None),
            EventKind::TrialReset => (KIND_TRIAL_RESET, None, None),
            EventKind::Message(text) => (KIND_MESSAGE, Some(text.clone()), None),
            EventKind::TemperatureCheck(temps) => {
                let joined = temps
                    .iter()
                    .map(|t| t.to_string())
                    .collect::<Vec<_>>()
                    .join(";");
                (KIND_TEMPERATURE, None, Some(joined))
            }
        };
        XmlEvent {
            kind: kind.to_string(),
            timestamp_ms: event.timestamp_ms,
            message,
            temperatures,
        }
    }
}

impl TryFrom<XmlEvent> for Event {
    type Error = Error;

    fn try_from(xml: XmlEvent) -> Result<Event> {
        let kind = match xml.kind.as_str() {
            KIND_TRIAL_INCREMENT => EventKind::TrialIncrement,
            KIND_TRIAL_RESET => EventKind::TrialReset,
            KIND_MESSAGE => EventKind::Message(xml.message.unwrap_or_default()),
            KIND_TEMPERATURE => {
                let raw = xml.temperatures.unwrap_or_default();
                let temps = raw
                    .split(';')
                    .filter(|s| !s.is_empty())
                    .map(|s| {
                        s.parse::<f64>()
                            .map_err(|_| Error::MalformedEntry(format!("temperature {s:?}")))
                    })
                    .collect::<Result<Vec<f64>>>()?;
                EventKind::TemperatureCheck(temps)
            }
            other => return Err(Error::MalformedEntry(format!("unknown kind {other:?}"))),
        };
        Ok(Event {
            timestamp_ms: xml.timestamp_ms,
            kind,
        })
    }
}

pub(crate) fn save(events: &[Event], path: &std::path::Path) -> Result<()> {
    let doc = EventLogDoc {
        events: events.iter().map(XmlEvent::from).collect(),
    };
    let body = serde_xml_rs::to_string(&doc)?;
    let mut f = std::fs::File::create(path)?;
    f.write_all(body.as_bytes())?;
    f.sync_all()?;
    Ok(())
}

pub(crate) fn load(path: &std::path::Path) -> Result<Vec<Event>> {
    let reader = std::io::BufReader::new(std::fs::File::open(path)?);
    let doc: EventLogDoc = serde_xml_rs::from_reader(reader)?;
    doc.events.into_iter().map(Event::try_from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventTracker;

    #[test]
    fn round_trip_preserves_trial_queries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offline_event_log.xml");

        let tracker = EventTracker::new();
        tracker.add_trial_increment(100);
        tracker.add_message(150, "gray screen");
        tracker.add_trial_increment(200);
        tracker.add_temperature_check(210, &[40.0, 38.5]);
        assert_eq!(tracker.reset_trial_counter(300), crate::ResetOutcome::Accepted);
        tracker.add_trial_increment(400);

        tracker.save_offline_log(0, 1000, &path).unwrap();

        let restored = EventTracker::new();
        restored.load_offline_log(&path).unwrap();
        assert_eq!(restored.len(), tracker.len());
        for t in [0, 100, 150, 199, 200, 299, 300, 400, 500] {
            assert_eq!(
                restored.trial_number_at(t),
                tracker.trial_number_at(t),
                "at t={t}"
            );
        }
    }

    #[test]
    fn save_window_excludes_outside_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.xml");

        let tracker = EventTracker::new();
        tracker.add_trial_increment(100);
        tracker.add_trial_increment(200);
        tracker.add_trial_increment(300);
        tracker.save_offline_log(150, 250, &path).unwrap();

        let events = load(&path).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].timestamp_ms, 200);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let xml = XmlEvent {
            kind: "coffee_break".to_string(),
            timestamp_ms: 0,
            message: None,
            temperatures: None,
        };
        assert!(Event::try_from(xml).is_err());
    }
}
