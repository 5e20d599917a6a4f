//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Inbound message model, routing, and event sources."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use tracing::info;

use crate::types::{parse_watts, InboundEvent, Reading};
use crate::{MessagingError, Result};

/// Outcome of routing one inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    /// The event carried a valid power reading.
    Reading(Reading),
    /// The event was on another topic and is not integrated.
    Passthrough,
}

/// Picks power readings out of the subscription stream.
///
/// Only an exact match on the power topic is integrated. Everything else is
/// traced when `verbose` is set and otherwise dropped.
#[derive(Debug, Clone)]
pub struct TopicRouter {
    power_topic: String,
    verbose: bool,
}

impl TopicRouter {
    /// Build a router for `power_topic`.
    pub fn new(power_topic: impl Into<String>, verbose: bool) -> Self {
        Self {
            power_topic: power_topic.into(),
            verbose,
        }
    }

    /// The topic whose payloads are integrated.
    pub fn power_topic(&self) -> &str {
        &self.power_topic
    }

    /// Route an event. A malformed payload on the power topic is an error and
    /// must not reach the accumulator.
    pub fn route(&self, event: &InboundEvent) -> Result<Routed> {
        if event.topic != self.power_topic {
            if self.verbose {
                info!(topic = %event.topic, payload = %event.payload_lossy(), "message");
            }
            return Ok(Routed::Passthrough);
        }

        let watts = parse_watts(&event.payload).map_err(|reason| MessagingError::InvalidPayload {
            topic: event.topic.clone(),
            reason,
        })?;
        Ok(Routed::Reading(Reading::new(watts, event.arrival)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn exact_topic_match_yields_reading() {
        let router = TopicRouter::new("emon/emonesp/W", false);
        let now = Utc::now();
        let routed = router
            .route(&InboundEvent::new("emon/emonesp/W", "512.25", now))
            .unwrap();
        assert_eq!(routed, Routed::Reading(Reading::new(512.25, now)));
    }

    #[test]
    fn other_topics_pass_through() {
        let router = TopicRouter::new("emon/emonesp/W", true);
        let now = Utc::now();
        for topic in ["emon/emonesp/V", "emon/emonesp/W/extra", "emon/emonesp/w"] {
            let routed = router.route(&InboundEvent::new(topic, "1", now)).unwrap();
            assert_eq!(routed, Routed::Passthrough);
        }
    }

    #[test]
    fn malformed_power_payload_is_rejected() {
        let router = TopicRouter::new("emon/emonesp/W", false);
        let err = router
            .route(&InboundEvent::new("emon/emonesp/W", "n/a", Utc::now()))
            .unwrap_err();
        assert!(matches!(err, MessagingError::InvalidPayload { .. }));
    }
}
