use chrono::{DateTime, Utc};

/// A published fact about committed ledger state.
///
/// Events are immutable and versioned (schema evolution). They describe
/// what already happened; consumers must never treat them as commands.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "ledger.balance.updated").
    fn event_type(&self) -> &'static str;

    /// Schema revision of the payload.
    fn version(&self) -> u32;

    /// Business time of the underlying change.
    fn occurred_at(&self) -> DateTime<Utc>;
}
