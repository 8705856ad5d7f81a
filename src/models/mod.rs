//! Domain model module declarations.

pub mod attachments;
pub mod context;
pub mod execution;
pub mod ids;
pub mod result;
pub mod value;

pub use attachments::{Attachment, Attachments};
pub use context::Context;
pub use execution::Execution;
pub use ids::Ids;
pub use result::TaskResult;
pub use value::{
    ExceptionValue, NamedTupleType, ObjectValue, SerializableValue, Tuple, Value,
};
