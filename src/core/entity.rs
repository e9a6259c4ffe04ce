use serde::Serialize;
use serde::de::DeserializeOwned;

/// Row type that can be migrated between the two stores.
///
/// Every validator, fixer and store in this crate is generic over an
/// `Entity`, so none of them needs to know the concrete table it is working
/// on.
pub trait Entity: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Primary key. Identical in both stores after a successful write.
    fn id(&self) -> i64;

    /// Last modification time (unix milliseconds), used for watermark
    /// filtering during scans.
    fn update_time(&self) -> i64;

    /// Field-by-field equality for migration purposes.
    ///
    /// Must be reflexive and stable across repeated calls for the same id.
    fn compare_to(&self, other: &Self) -> bool;
}
