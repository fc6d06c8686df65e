//! Topic addressing for device traffic.
//!
//! Every message a gateway relays is addressed to a device identity.
//! The namespace is partitioned strictly by device id:
//! `/devices/{device_id}/{suffix}`. Commands are grouped under a single
//! wildcard filter so one subscription receives every command sub-topic.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of message exchanged for a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageClass {
    /// Telemetry published by the device
    Events,
    /// Device state reports
    State,
    /// Configuration pushed to the device
    Config,
    /// Commands sent to the device
    Commands,
    /// Register the device with the gateway connection
    Attach,
    /// Deregister the device from the gateway connection
    Detach,
}

impl MessageClass {
    pub const ALL: [MessageClass; 6] = [
        MessageClass::Events,
        MessageClass::State,
        MessageClass::Config,
        MessageClass::Commands,
        MessageClass::Attach,
        MessageClass::Detach,
    ];

    /// Topic suffix under the device prefix
    pub fn suffix(&self) -> &'static str {
        match self {
            MessageClass::Events => "events",
            MessageClass::State => "state",
            MessageClass::Config => "config",
            MessageClass::Commands => "commands/#",
            MessageClass::Attach => "attach",
            MessageClass::Detach => "detach",
        }
    }

    /// Delivery class used for this kind of message. Not caller-selectable.
    pub fn qos(&self) -> QoS {
        match self {
            MessageClass::Commands => QoS::AtMostOnce,
            _ => QoS::AtLeastOnce,
        }
    }
}

impl fmt::Display for MessageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageClass::Events => "events",
            MessageClass::State => "state",
            MessageClass::Config => "config",
            MessageClass::Commands => "commands",
            MessageClass::Attach => "attach",
            MessageClass::Detach => "detach",
        };
        f.write_str(name)
    }
}

/// Broker delivery guarantee
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
}

impl QoS {
    pub fn level(&self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
        }
    }
}

/// Build the topic for a device and message class.
///
/// ```
/// # use brickd_core::topics::{address, MessageClass};
/// assert_eq!(address("sensor-1", MessageClass::Events), "/devices/sensor-1/events");
/// assert_eq!(address("sensor-1", MessageClass::Commands), "/devices/sensor-1/commands/#");
/// ```
pub fn address(device_id: &str, class: MessageClass) -> String {
    format!("/devices/{}/{}", device_id, class.suffix())
}

/// Whether `topic` is matched by the subscription `filter`.
///
/// `+` matches exactly one level, a trailing `#` matches the parent level
/// and everything below it. Wildcards never match topics starting with `$`.
///
/// ```
/// # use brickd_core::topics::topic_matches;
/// assert!(topic_matches("/devices/a/commands/#", "/devices/a/commands/reboot"));
/// assert!(topic_matches("/devices/+/config", "/devices/a/config"));
/// assert!(!topic_matches("/devices/a/commands/#", "/devices/b/commands/reboot"));
/// ```
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_distinct_devices_never_collide() {
        let ids = ["a", "b", "ab", "a-b", "sensor-1", "sensor-10", "gw"];
        for class in MessageClass::ALL {
            for d1 in ids {
                for d2 in ids {
                    if d1 != d2 {
                        assert_ne!(address(d1, class), address(d2, class), "{class}: {d1} vs {d2}");
                    }
                }
            }
        }
    }

    #[rstest]
    #[case("/devices/sensor-1/commands")]
    #[case("/devices/sensor-1/commands/reboot")]
    #[case("/devices/sensor-1/commands/firmware/apply")]
    fn test_commands_filter_covers_every_subtopic(#[case] topic: &str) {
        let filter = address("sensor-1", MessageClass::Commands);
        assert!(topic_matches(&filter, topic));
    }

    #[rstest]
    #[case("/devices/sensor-10/commands/reboot")]
    #[case("/devices/sensor-1/config")]
    #[case("/devices/sensor-1/commandsx")]
    fn test_commands_filter_stays_within_device(#[case] topic: &str) {
        let filter = address("sensor-1", MessageClass::Commands);
        assert!(!topic_matches(&filter, topic));
    }

    #[test]
    fn test_single_level_wildcard() {
        assert!(topic_matches("/devices/+/state", "/devices/x/state"));
        assert!(!topic_matches("/devices/+/state", "/devices/x/y/state"));
        assert!(!topic_matches("+/x", "$SYS/x"));
    }

    #[test]
    fn test_qos_is_fixed_per_class() {
        assert_eq!(MessageClass::Commands.qos(), QoS::AtMostOnce);
        assert_eq!(MessageClass::Config.qos(), QoS::AtLeastOnce);
        assert_eq!(MessageClass::Events.qos(), QoS::AtLeastOnce);
        assert_eq!(MessageClass::Attach.qos(), QoS::AtLeastOnce);
    }
}
