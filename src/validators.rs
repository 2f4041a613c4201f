//! Built-in validator constructors. All of them share one emptiness rule:
//! null, the empty string, and the empty list count as empty, and only
//! `required` reports it. The others pass on empty values so that a single
//! missing input never stacks multiple errors.

use rust_decimal::Decimal;

use crate::error::ValidationError;
use crate::form::ValidationCtx;
use crate::value::Value;

pub fn required(
    message: impl Into<String>,
) -> impl Fn(&Value, &ValidationCtx) -> Option<ValidationError> + Send + Sync + 'static {
    let message = message.into();
    move |value, _ctx| {
        value
            .is_empty()
            .then(|| ValidationError::new("required", message.clone()))
    }
}

pub fn email(
    message: impl Into<String>,
) -> impl Fn(&Value, &ValidationCtx) -> Option<ValidationError> + Send + Sync + 'static {
    let message = message.into();
    move |value, _ctx| {
        if value.is_empty() {
            return None;
        }
        let ok = value.as_text().is_some_and(|text| {
            let mut parts = text.splitn(2, '@');
            let local = parts.next().unwrap_or_default();
            let domain = parts.next().unwrap_or_default();
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.')
        });
        (!ok).then(|| ValidationError::new("email", message.clone()))
    }
}

pub fn min(
    limit: Decimal,
    message: impl Into<String>,
) -> impl Fn(&Value, &ValidationCtx) -> Option<ValidationError> + Send + Sync + 'static {
    let message = message.into();
    move |value, _ctx| {
        value
            .as_number()
            .is_some_and(|number| number < limit)
            .then(|| ValidationError::new("min", message.clone()))
    }
}

pub fn max(
    limit: Decimal,
    message: impl Into<String>,
) -> impl Fn(&Value, &ValidationCtx) -> Option<ValidationError> + Send + Sync + 'static {
    let message = message.into();
    move |value, _ctx| {
        value
            .as_number()
            .is_some_and(|number| number > limit)
            .then(|| ValidationError::new("max", message.clone()))
    }
}

pub fn min_length(
    limit: usize,
    message: impl Into<String>,
) -> impl Fn(&Value, &ValidationCtx) -> Option<ValidationError> + Send + Sync + 'static {
    let message = message.into();
    move |value, _ctx| {
        if value.is_empty() {
            return None;
        }
        value
            .as_text()
            .is_some_and(|text| text.chars().count() < limit)
            .then(|| ValidationError::new("min_length", message.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn ctx() -> ValidationCtx {
        ValidationCtx::new(Value::Null)
    }

    #[test]
    fn required_flags_all_empty_shapes() {
        let check = required("needed");
        assert!(check(&Value::Null, &ctx()).is_some());
        assert!(check(&Value::from(""), &ctx()).is_some());
        assert!(check(&Value::list([]), &ctx()).is_some());
        assert!(check(&Value::from(0), &ctx()).is_none());
    }

    #[test]
    fn email_passes_on_empty_and_rejects_bad_shapes() {
        let check = email("bad email");
        assert!(check(&Value::from(""), &ctx()).is_none());
        assert!(check(&Value::from("not-an-email"), &ctx()).is_some());
        assert!(check(&Value::from("a@b"), &ctx()).is_some());
        assert!(check(&Value::from("a@b.com"), &ctx()).is_none());
    }

    #[test]
    fn numeric_bounds_ignore_non_numbers() {
        let check = min(Decimal::from(18), "too small");
        assert!(check(&Value::from(17), &ctx()).is_some());
        assert!(check(&Value::from(18), &ctx()).is_none());
        assert!(check(&Value::from("x"), &ctx()).is_none());
    }
}
