//! Event bus topic builders and parsers.
//!
//! Device topics follow the edge event-bus layout:
//!
//! ```text
//! hw/events/device/<id>/twin/update/delta   (cloud -> mapper)
//! hw/events/device/<id>/twin/update         (mapper -> cloud)
//! hw/events/device/<id>/data/update         (mapper -> cloud)
//! hw/events/device/<id>/state/update        (mapper -> cloud)
//! hw/events/device/<id>/notice              (mapper -> cloud)
//! ```

/// Root of every per-device topic.
pub const DEVICE_TOPIC_ROOT: &str = "hw/events/device";

const DELTA_SUFFIX: &str = "/twin/update/delta";

/// Builder for the topics belonging to one device.
#[derive(Debug, Clone)]
pub struct DeviceTopics {
    root: String,
    device_id: String,
}

impl DeviceTopics {
    /// Create topic builders for a device under the default root.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self::with_root(DEVICE_TOPIC_ROOT, device_id)
    }

    /// Create topic builders with a custom root.
    pub fn with_root(root: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            device_id: device_id.into(),
        }
    }

    /// The device this builder addresses.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Inbound desired-state deltas.
    ///
    /// # Example
    /// ```
    /// use mapper_common::topics::DeviceTopics;
    ///
    /// let topics = DeviceTopics::new("pump1");
    /// assert_eq!(topics.twin_delta(), "hw/events/device/pump1/twin/update/delta");
    /// ```
    pub fn twin_delta(&self) -> String {
        format!("{}/{}{}", self.root, self.device_id, DELTA_SUFFIX)
    }

    /// Reported twin values.
    pub fn twin_update(&self) -> String {
        format!("{}/{}/twin/update", self.root, self.device_id)
    }

    /// Aggregate sensor readings.
    pub fn data_update(&self) -> String {
        format!("{}/{}/data/update", self.root, self.device_id)
    }

    /// Reachability state.
    pub fn state_update(&self) -> String {
        format!("{}/{}/state/update", self.root, self.device_id)
    }

    /// Unreachable-device notices.
    pub fn notice(&self) -> String {
        format!("{}/{}/notice", self.root, self.device_id)
    }
}

/// Build the mapper status key for a key prefix.
///
/// # Example
/// ```
/// use mapper_common::topics::status_key;
///
/// assert_eq!(status_key("mapper/modbus"), "mapper/modbus/@/status");
/// ```
pub fn status_key(prefix: &str) -> String {
    format!("{}/@/status", prefix)
}

/// Extract the device ID from a twin delta topic.
///
/// Returns `None` when the topic is not a delta topic or the ID is empty.
/// A leading `$` (the MQTT event-bus spelling) is tolerated.
pub fn parse_delta_topic(topic: &str) -> Option<&str> {
    let topic = topic.strip_prefix('$').unwrap_or(topic);
    let rest = topic.strip_prefix(DEVICE_TOPIC_ROOT)?.strip_prefix('/')?;
    let id = rest.strip_suffix(DELTA_SUFFIX)?;
    if id.is_empty() { None } else { Some(id) }
}
