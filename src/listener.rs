use crate::model::ServiceInstance;
use crate::Result;

/// Receives discovery deltas for imported services.
///
/// Calls may arrive concurrently from watch notifications and the
/// reconciliation sweep. Implementations should tolerate a repeated `add`
/// for an instance they already hold and a `delete` for one they do not.
pub trait ImportListener: Send + Sync {
    fn add(&self, instance: &ServiceInstance) -> Result<()>;
    fn change(&self, old: &ServiceInstance, new: &ServiceInstance) -> Result<()>;
    fn delete(&self, instance: &ServiceInstance) -> Result<()>;
}
