use thiserror::Error;

/// Errors returned by the record cache and its daemon.
///
/// Lookup outcomes (hit, negative hit, miss) are not errors, see
/// [`crate::daemon::FindOutcome`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// Invalid configuration or argument.
    #[error("bad parameter: {0}")]
    BadParam(String),

    /// A string field does not fit its 1-byte length prefix.
    #[error("{field} is {len} bytes long, at most 255 bytes can be cached")]
    FieldTooLong { field: &'static str, len: usize },

    /// The answer carries a record type the cache does not store.
    #[error("unexpected record type {0}")]
    UnexpectedType(u16),

    /// A status answer other than NXDOMAIN / NODATA.
    #[error("unexpected status answer for {owner}")]
    UnexpectedStatus { owner: String },

    /// An answer of a different type was fed into an open insertion session.
    #[error("session caches type {expected}, got type {got}")]
    TypeMismatch { expected: u16, got: u16 },

    /// An answer for another owner name was fed into an open insertion session.
    #[error("session caches {expected}, got an answer for {got}")]
    OwnerMismatch { expected: String, got: String },

    /// The serialized record set can never fit on a page.
    #[error("record set is too big ({size} bytes), unable to cache")]
    RecordTooLarge { size: usize },

    /// TTL below the configured minimum, the record set is not cached.
    #[error("ttl {ttl} is below the minimal cacheable ttl {min}")]
    TtlTooLow { ttl: u32, min: u32 },

    /// No page could be obtained from any allocation source.
    #[error("no free pages left, out of resources")]
    OutOfResources,

    /// On-page bytes could not be decoded.
    #[error("corrupted record: {0}")]
    Corrupted(&'static str),

    /// The query id is neither queued nor in callback.
    #[error("query {qid} not found")]
    NotFound { qid: u32 },

    /// The query is being delivered on another thread right now.
    #[error("query {qid} is in callback")]
    InCallback { qid: u32 },

    /// CNAME chase exceeded the maximal chain length.
    #[error("cname chain for {name} is longer than {limit} links")]
    CnameChainTooLong { name: String, limit: usize },

    /// Returned by a record callback whose receiver is gone; stops delivery.
    #[error("callback receiver destructed")]
    Destructed,
}

pub type CacheResult<T> = Result<T, CacheError>;
