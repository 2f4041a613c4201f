mod behavior;
mod controller;
mod settle;
mod subscription;
mod tree;
mod validation;

#[cfg(test)]
mod tests;

pub use controller::{Form, FormId, NodeSnapshot, SubmitState};
pub use subscription::Subscription;
pub use validation::{AsyncRejection, BoxValidationFuture, ValidationCtx};
