pub mod error;
pub mod form;
pub mod path;
pub mod schema;
pub mod validators;
pub mod value;

pub use error::{FormError, FormResult, SubmitError, ValidationError, ValidationFailed};
pub use form::{
    AsyncRejection, BoxValidationFuture, Form, FormId, NodeSnapshot, SubmitState, Subscription,
    ValidationCtx,
};
pub use path::{Path, Segment};
pub use schema::{Schema, SchemaError};
pub use value::{Value, ValueKind};
