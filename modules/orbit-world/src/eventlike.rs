/// Trait shared by every event payload layer.
///
/// Lets the reducer and the logs name an event without matching on it.
pub trait Eventlike: std::fmt::Debug + Send + Sync {
    /// The snake_case event type string (matches the serde `type` tag).
    fn event_type(&self) -> &'static str;
}
