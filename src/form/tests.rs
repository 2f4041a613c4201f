use super::*;
use crate::error::{FormError, SubmitError, ValidationError};
use crate::path::Path;
use crate::schema::Schema;
use crate::validators;
use crate::value::Value;

use futures::executor::block_on;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

fn credit_schema() -> Schema {
    Schema::group([
        (
            "applicant",
            Schema::group([
                ("email", Schema::field(Value::Null)),
                ("income", Schema::field(0)),
                ("payment", Schema::field(0)),
                ("employed", Schema::field(true)),
                ("employer", Schema::field(Value::Null)),
            ]),
        ),
        ("qty", Schema::field(1)),
        ("price", Schema::field(0)),
        ("total", Schema::field(0)),
        (
            "debts",
            Schema::array(Schema::group([
                ("amount", Schema::field(0)),
                ("holder", Schema::field("")),
            ])),
        ),
        ("comment", Schema::field("")),
    ])
}

fn form() -> Form {
    Form::new(credit_schema()).expect("schema must be valid")
}

fn email() -> Path {
    Path::root().key("applicant").key("email")
}

fn income() -> Path {
    Path::root().key("applicant").key("income")
}

fn payment() -> Path {
    Path::root().key("applicant").key("payment")
}

fn employed() -> Path {
    Path::root().key("applicant").key("employed")
}

fn employer() -> Path {
    Path::root().key("applicant").key("employer")
}

fn qty() -> Path {
    Path::root().key("qty")
}

fn price() -> Path {
    Path::root().key("price")
}

fn total() -> Path {
    Path::root().key("total")
}

fn debts() -> Path {
    Path::root().key("debts")
}

fn comment() -> Path {
    Path::root().key("comment")
}

fn product(values: &[Value]) -> Value {
    let a = values[0].as_number().unwrap_or_default();
    let b = values[1].as_number().unwrap_or_default();
    Value::Number(a * b)
}

fn codes(errors: &[ValidationError]) -> Vec<&str> {
    errors.iter().map(|error| error.code.as_str()).collect()
}

#[test]
fn set_value_updates_tree_and_dirty_state() {
    let form = form();
    form.set_value(&email(), "user@example.com")
        .expect("set must succeed");

    let snapshot = form.node(&email()).expect("email snapshot");
    assert_eq!(snapshot.value, Value::from("user@example.com"));
    assert!(snapshot.dirty);
    assert!(!snapshot.touched);
    assert!(form.node(&Path::root()).expect("root snapshot").dirty);
    assert!(!form.node(&qty()).expect("qty snapshot").dirty);
}

#[test]
fn group_writes_are_partial() {
    let form = form();
    form.set_value(
        &Path::root().key("applicant"),
        Value::record([("income", Value::from(1200))]),
    )
    .expect("group write");

    assert_eq!(
        form.value_at(&income()).expect("income"),
        Value::from(1200)
    );
    assert_eq!(form.value_at(&email()).expect("email"), Value::Null);
    assert!(form.node(&income()).expect("income snapshot").dirty);
}

#[test]
fn writes_are_type_checked() {
    let form = form();
    let error = form.set_value(&qty(), "five").expect_err("kind mismatch");
    assert!(matches!(error, FormError::TypeMismatch { .. }));

    let error = form
        .set_value(&Path::root().key("nope"), 1)
        .expect_err("unknown path");
    assert!(matches!(error, FormError::UnknownPath { .. }));

    let error = form
        .set_value(&debts().each(), 1)
        .expect_err("wildcard write");
    assert!(matches!(error, FormError::WildcardPath { .. }));
}

#[test]
fn with_initial_overrides_and_keeps_clean_baseline() {
    let initial = Value::record([
        ("qty", Value::from(3)),
        (
            "debts",
            Value::list([Value::record([("amount", Value::from(5))])]),
        ),
    ]);
    let form = Form::with_initial(credit_schema(), initial).expect("initial must fit");

    assert_eq!(form.value_at(&qty()).expect("qty"), Value::from(3));
    assert_eq!(form.len(&debts()).expect("debts length"), 1);
    assert!(!form.is_dirty().expect("dirtiness"));

    let error = Form::with_initial(
        credit_schema(),
        Value::record([("qty", Value::from("three"))]),
    )
    .expect_err("shape mismatch");
    assert!(matches!(error, crate::schema::SchemaError::InitialShape { .. }));

    let error = Form::with_initial(credit_schema(), Value::record([("nope", Value::from(1))]))
        .expect_err("unknown field");
    assert!(matches!(error, crate::schema::SchemaError::UnknownField { .. }));
}

#[test]
fn computed_field_follows_its_sources() {
    let first = form();
    first.computed(&total(), &[qty(), price()], product)
        .expect("register computed");

    first.set_value(&price(), 10).expect("set price");
    first.set_value(&qty(), 5).expect("set qty");
    assert_eq!(first.value_at(&total()).expect("total"), Value::from(50));

    // Same result regardless of write order.
    let other = form();
    other
        .computed(&total(), &[qty(), price()], product)
        .expect("register computed");
    other.set_value(&qty(), 5).expect("set qty");
    other.set_value(&price(), 10).expect("set price");
    assert_eq!(other.value_at(&total()).expect("total"), Value::from(50));

    // Computed writes do not mark the target dirty or touched.
    let snapshot = first.node(&total()).expect("total snapshot");
    assert!(!snapshot.dirty);
    assert!(!snapshot.touched);
}

#[test]
fn computed_chain_runs_in_dependency_order_once_each() {
    let schema = Schema::group([
        ("a", Schema::field(0)),
        ("b", Schema::field(0)),
        ("c", Schema::field(0)),
    ]);
    let form = Form::new(schema).expect("schema must be valid");
    let a = Path::root().key("a");
    let b = Path::root().key("b");
    let c = Path::root().key("c");

    let b_runs = Arc::new(AtomicUsize::new(0));
    let c_runs = Arc::new(AtomicUsize::new(0));
    {
        let b_runs = b_runs.clone();
        form.computed(&b, &[a.clone()], move |values| {
            b_runs.fetch_add(1, Ordering::SeqCst);
            Value::Number(values[0].as_number().unwrap_or_default() + Decimal::ONE)
        })
        .expect("register b");
    }
    {
        let c_runs = c_runs.clone();
        form.computed(&c, &[b.clone()], move |values| {
            c_runs.fetch_add(1, Ordering::SeqCst);
            Value::Number(values[0].as_number().unwrap_or_default() * Decimal::from(2))
        })
        .expect("register c");
    }

    let b_before = b_runs.load(Ordering::SeqCst);
    let c_before = c_runs.load(Ordering::SeqCst);
    form.set_value(&a, 10).expect("set a");

    assert_eq!(form.value_at(&b).expect("b"), Value::from(11));
    assert_eq!(form.value_at(&c).expect("c"), Value::from(22));
    assert_eq!(b_runs.load(Ordering::SeqCst), b_before + 1);
    assert_eq!(c_runs.load(Ordering::SeqCst), c_before + 1);
}

#[test]
fn diamond_dependencies_settle_in_one_pass() {
    let schema = Schema::group([
        ("a", Schema::field(1)),
        ("b", Schema::field(0)),
        ("c", Schema::field(0)),
        ("d", Schema::field(0)),
    ]);
    let form = Form::new(schema).expect("schema must be valid");
    let a = Path::root().key("a");
    let b = Path::root().key("b");
    let c = Path::root().key("c");
    let d = Path::root().key("d");

    form.computed(&b, &[a.clone()], |values| {
        Value::Number(values[0].as_number().unwrap_or_default() + Decimal::ONE)
    })
    .expect("register b");
    form.computed(&c, &[a.clone()], |values| {
        Value::Number(values[0].as_number().unwrap_or_default() * Decimal::from(2))
    })
    .expect("register c");

    let d_runs = Arc::new(AtomicUsize::new(0));
    {
        let d_runs = d_runs.clone();
        form.computed(&d, &[b.clone(), c.clone()], move |values| {
            d_runs.fetch_add(1, Ordering::SeqCst);
            let b = values[0].as_number().unwrap_or_default();
            let c = values[1].as_number().unwrap_or_default();
            Value::Number(b + c)
        })
        .expect("register d");
    }

    let before = d_runs.load(Ordering::SeqCst);
    form.set_value(&a, 10).expect("set a");
    assert_eq!(form.value_at(&d).expect("d"), Value::from(31));
    assert_eq!(d_runs.load(Ordering::SeqCst), before + 1);
}

#[test]
fn computed_cycles_are_rejected_at_registration() {
    let schema = Schema::group([("x", Schema::field(0)), ("y", Schema::field(0))]);
    let form = Form::new(schema).expect("schema must be valid");
    let x = Path::root().key("x");
    let y = Path::root().key("y");

    form.computed(&x, &[y.clone()], |values| values[0].clone())
        .expect("first registration is acyclic");
    let error = form
        .computed(&y, &[x.clone()], |values| values[0].clone())
        .expect_err("closing the cycle must fail");
    assert!(matches!(error, FormError::DependencyCycle { .. }));

    let error = form
        .computed(&y, &[y.clone()], |values| values[0].clone())
        .expect_err("self-reference must fail");
    assert!(matches!(error, FormError::DependencyCycle { .. }));

    // The rejected registrations must not have been installed.
    form.set_value(&x, 4).expect("set x still works");
    assert_eq!(form.value_at(&y).expect("y"), Value::from(0));
}

#[test]
fn computed_over_wildcard_source_aggregates_elements() {
    let schema = Schema::group([
        (
            "debts",
            Schema::array(Schema::group([("amount", Schema::field(0))])),
        ),
        ("debt_total", Schema::field(0)),
    ]);
    let form = Form::new(schema).expect("schema must be valid");
    let debts = Path::root().key("debts");
    let debt_total = Path::root().key("debt_total");

    form.computed(
        &debt_total,
        &[debts.clone().each().key("amount")],
        |values| {
            let sum = values[0]
                .as_list()
                .map(|items| items.iter().filter_map(Value::as_number).sum::<Decimal>())
                .unwrap_or_default();
            Value::Number(sum)
        },
    )
    .expect("register aggregate");

    form.push(&debts, Some(Value::record([("amount", Value::from(10))])))
        .expect("push first debt");
    form.push(&debts, Some(Value::record([("amount", Value::from(20))])))
        .expect("push second debt");
    assert_eq!(
        form.value_at(&debt_total).expect("debt total"),
        Value::from(30)
    );

    form.set_value(&debts.clone().index(0).key("amount"), 15)
        .expect("update first debt");
    assert_eq!(
        form.value_at(&debt_total).expect("debt total"),
        Value::from(35)
    );

    form.remove_at(&debts, 1).expect("remove second debt");
    assert_eq!(
        form.value_at(&debt_total).expect("debt total"),
        Value::from(15)
    );
}

#[test]
fn required_and_email_validators_replace_each_other() {
    let form = form();
    form.register_sync(&email(), validators::required("Email is required"))
        .expect("register required");
    form.register_sync(&email(), validators::email("Invalid email"))
        .expect("register email");

    form.set_value(&email(), "").expect("set empty");
    assert_eq!(
        codes(&form.node(&email()).expect("snapshot").errors),
        vec!["required"]
    );

    form.set_value(&email(), "not-an-email").expect("set invalid");
    assert_eq!(
        codes(&form.node(&email()).expect("snapshot").errors),
        vec!["email"]
    );

    form.set_value(&email(), "a@b.com").expect("set valid");
    assert!(form.node(&email()).expect("snapshot").errors.is_empty());
    assert!(form.is_valid().expect("validity"));
}

#[test]
fn multiple_errors_keep_registration_order() {
    let form = form();
    form.register_sync(&comment(), |_value, _ctx| {
        Some(ValidationError::new("first", "first check"))
    })
    .expect("register first");
    form.register_sync(&comment(), |_value, _ctx| {
        Some(ValidationError::new("second", "second check"))
    })
    .expect("register second");

    form.set_value(&comment(), "x").expect("set comment");
    assert_eq!(
        codes(&form.node(&comment()).expect("snapshot").errors),
        vec!["first", "second"]
    );
}

#[test]
fn cross_validator_reruns_on_declared_dependencies() {
    let form = form();
    let payment_path = payment();
    let income_path = income();
    form.register_cross(
        &payment(),
        &[payment(), income()],
        move |ctx| {
            let payment = ctx
                .value_at(&payment_path)
                .and_then(Value::as_number)
                .unwrap_or_default();
            let income = ctx
                .value_at(&income_path)
                .and_then(Value::as_number)
                .unwrap_or_default();
            (payment * Decimal::from(2) > income).then(|| {
                ValidationError::new("payment_limit", "payment must stay under half the income")
            })
        },
    )
    .expect("register cross validator");

    form.set_value(&income(), 1000).expect("set income");
    form.set_value(&payment(), 600).expect("set payment");
    assert_eq!(
        codes(&form.node(&payment()).expect("snapshot").errors),
        vec!["payment_limit"]
    );

    // The rule clears when the other field moves, without touching payment.
    form.set_value(&income(), 2000).expect("raise income");
    assert!(form.node(&payment()).expect("snapshot").errors.is_empty());
}

#[test]
fn revalidate_when_forces_reruns_from_other_paths() {
    let form = form();
    let income_path = income();
    form.register_sync(&payment(), move |value, ctx| {
        let payment = value.as_number().unwrap_or_default();
        let income = ctx
            .value_at(&income_path)
            .and_then(Value::as_number)
            .unwrap_or_default();
        (payment * Decimal::from(2) > income)
            .then(|| ValidationError::new("payment_limit", "payment too high"))
    })
    .expect("register payment validator");
    form.revalidate_when(&payment(), &[income()])
        .expect("register revalidation rule");

    form.set_value(&income(), 1000).expect("set income");
    form.set_value(&payment(), 600).expect("set payment");
    assert_eq!(
        codes(&form.node(&payment()).expect("snapshot").errors),
        vec!["payment_limit"]
    );

    form.set_value(&income(), 2000).expect("raise income");
    assert!(form.node(&payment()).expect("snapshot").errors.is_empty());
}

#[test]
fn global_cross_validator_runs_on_any_change() {
    let form = form();
    let runs = Arc::new(AtomicUsize::new(0));
    {
        let runs = runs.clone();
        form.register_cross_global(&comment(), move |_ctx| {
            runs.fetch_add(1, Ordering::SeqCst);
            None
        })
        .expect("register global validator");
    }

    form.set_value(&qty(), 2).expect("set qty");
    form.set_value(&price(), 3).expect("set price");
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[test]
fn hidden_nodes_are_suppressed_and_revalidate_on_return() {
    let form = form();
    form.register_sync(&employer(), validators::required("Employer is required"))
        .expect("register required");
    form.visible_when(&employer(), &[employed()], |values| {
        values[0].as_bool().unwrap_or(false)
    })
    .expect("register visibility");

    form.set_value(&employer(), "").expect("set empty employer");
    assert!(!form.is_valid().expect("validity"));

    form.set_value(&employed(), false).expect("hide employer");
    let snapshot = form.node(&employer()).expect("snapshot");
    assert!(!snapshot.visible);
    // Stored errors are retained but stop counting against the form.
    assert_eq!(codes(&snapshot.errors), vec!["required"]);
    assert!(form.is_valid().expect("validity"));
    assert!(!form.error_map().expect("error map").contains_key(&employer()));

    form.set_value(&employed(), true).expect("show employer");
    let snapshot = form.node(&employer()).expect("snapshot");
    assert!(snapshot.visible);
    assert_eq!(codes(&snapshot.errors), vec!["required"]);
    assert!(!form.is_valid().expect("validity"));
}

#[test]
fn disabled_nodes_keep_readable_values_but_leave_the_submit_value() {
    let form = form();
    form.computed(&total(), &[qty(), price()], product)
        .expect("register computed");
    form.disable_when(&total(), |_ctx| true)
        .expect("register disable");

    form.set_value(&price(), 10).expect("set price");
    assert_eq!(form.value_at(&total()).expect("total"), Value::from(10));

    let emitted = form.submit_value().expect("submit value");
    let record = emitted.as_record().expect("submit record");
    assert!(!record.contains_key("total"));
    let full = form.value().expect("full value");
    assert!(full.as_record().expect("full record").contains_key("total"));
}

#[test]
fn enable_when_toggles_with_the_whole_form() {
    let form = form();
    let employed_path = employed();
    form.enable_when(&employer(), move |ctx| {
        ctx.value_at(&employed_path)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    })
    .expect("register enable rule");

    assert!(!form.node(&employer()).expect("snapshot").disabled);
    form.set_value(&employed(), false).expect("unset employed");
    assert!(form.node(&employer()).expect("snapshot").disabled);
    form.set_value(&employed(), true).expect("set employed");
    assert!(!form.node(&employer()).expect("snapshot").disabled);
}

#[test]
fn wildcard_validators_apply_to_current_and_future_elements() {
    let form = form();
    form.register_sync(
        &debts().each().key("amount"),
        validators::min(Decimal::ONE, "amount must be positive"),
    )
    .expect("register wildcard validator");

    form.push(&debts(), Some(Value::record([("amount", Value::from(0))])))
        .expect("push invalid debt");
    assert_eq!(
        codes(
            &form
                .node(&debts().index(0).key("amount"))
                .expect("snapshot")
                .errors
        ),
        vec!["min"]
    );
    assert!(!form.is_valid().expect("validity"));

    form.push(&debts(), Some(Value::record([("amount", Value::from(5))])))
        .expect("push valid debt");
    assert!(
        form.node(&debts().index(1).key("amount"))
            .expect("snapshot")
            .errors
            .is_empty()
    );

    // Removing the invalid element removes its errors from the aggregate.
    form.remove_at(&debts(), 0).expect("remove invalid debt");
    assert!(form.is_valid().expect("validity"));
    assert_eq!(form.len(&debts()).expect("length"), 1);
}

#[test]
fn register_each_validates_whole_elements() {
    let form = form();
    form.register_each(&debts(), |value, _ctx| {
        let holder = value
            .as_record()
            .and_then(|record| record.get("holder"))
            .and_then(Value::as_text)
            .unwrap_or_default();
        holder
            .is_empty()
            .then(|| ValidationError::new("holder_required", "holder is required"))
    })
    .expect("register element validator");

    let error = form
        .register_each(&qty(), |_value, _ctx| None)
        .expect_err("qty is not an array");
    assert!(matches!(error, FormError::NotAnArray { .. }));

    form.push(&debts(), None).expect("push empty element");
    assert_eq!(
        codes(&form.node(&debts().index(0)).expect("snapshot").errors),
        vec!["holder_required"]
    );

    form.set_value(&debts().index(0).key("holder"), "ACME Bank")
        .expect("set holder");
    assert!(
        form.node(&debts().index(0))
            .expect("snapshot")
            .errors
            .is_empty()
    );
}

#[test]
fn array_mutations_are_bounds_checked() {
    let form = form();
    form.push(&debts(), None).expect("push");
    form.insert_at(&debts(), 0, Some(Value::record([("amount", Value::from(9))])))
        .expect("insert at head");
    assert_eq!(form.len(&debts()).expect("length"), 2);
    assert_eq!(
        form.value_at(&debts().index(0).key("amount")).expect("amount"),
        Value::from(9)
    );

    let error = form.remove_at(&debts(), 5).expect_err("out of bounds");
    assert!(matches!(error, FormError::IndexOutOfBounds { .. }));
    let error = form.push(&qty(), None).expect_err("not an array");
    assert!(matches!(error, FormError::NotAnArray { .. }));

    form.clear(&debts()).expect("clear");
    assert_eq!(form.len(&debts()).expect("length"), 0);
    form.clear(&debts()).expect("clearing an empty array is a no-op");
}

#[test]
fn settle_is_idempotent_for_equal_writes() {
    let form = form();
    let watched = Arc::new(AtomicUsize::new(0));
    {
        let watched = watched.clone();
        form.watch(&qty(), move |_value| {
            watched.fetch_add(1, Ordering::SeqCst);
        })
        .expect("register watcher");
    }
    let notified = Arc::new(AtomicUsize::new(0));
    let _guard = {
        let notified = notified.clone();
        form.subscribe(&qty(), move |_snapshot| {
            notified.fetch_add(1, Ordering::SeqCst);
        })
        .expect("subscribe")
    };

    form.set_value(&qty(), 5).expect("first write");
    assert_eq!(watched.load(Ordering::SeqCst), 1);
    assert_eq!(notified.load(Ordering::SeqCst), 1);

    form.set_value(&qty(), 5).expect("equal write");
    assert_eq!(watched.load(Ordering::SeqCst), 1);
    assert_eq!(notified.load(Ordering::SeqCst), 1);
}

#[test]
fn watchers_observe_settled_computed_values() {
    let form = form();
    form.computed(&total(), &[qty(), price()], product)
        .expect("register computed");
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        form.watch(&total(), move |value| {
            seen.lock().expect("seen lock").push(value.clone());
        })
        .expect("register watcher");
    }

    form.set_value(&price(), 10).expect("set price");
    form.set_value(&qty(), 5).expect("set qty");
    let seen = seen.lock().expect("seen lock");
    assert_eq!(*seen, vec![Value::from(10), Value::from(50)]);
}

#[test]
fn subscribers_get_snapshots_and_stop_after_drop() {
    let form = form();
    let snapshots = Arc::new(Mutex::new(Vec::<NodeSnapshot>::new()));
    let guard = {
        let snapshots = snapshots.clone();
        form.subscribe(&Path::root().key("applicant"), move |snapshot| {
            snapshots.lock().expect("snapshot lock").push(snapshot.clone());
        })
        .expect("subscribe to the group")
    };

    form.set_value(&email(), "a@b.com").expect("set email");
    {
        let seen = snapshots.lock().expect("snapshot lock");
        assert_eq!(seen.len(), 1);
        let record = seen[0].value.as_record().expect("group record");
        assert_eq!(record.get("email"), Some(&Value::from("a@b.com")));
        assert!(seen[0].dirty);
    }

    guard.unsubscribe();
    form.set_value(&email(), "b@c.com").expect("set email again");
    assert_eq!(snapshots.lock().expect("snapshot lock").len(), 1);

    let error = form
        .subscribe(&debts().each(), |_snapshot| {})
        .expect_err("wildcard subscription");
    assert!(matches!(error, FormError::WildcardPath { .. }));
}

#[test]
fn touch_is_tracked_without_validation() {
    let form = form();
    form.register_sync(&email(), validators::required("Email is required"))
        .expect("register required");

    form.mark_as_touched(&email()).expect("touch email");
    let snapshot = form.node(&email()).expect("snapshot");
    assert!(snapshot.touched);
    assert!(snapshot.errors.is_empty());

    form.mark_all_as_touched().expect("touch everything");
    assert!(form.node(&qty()).expect("snapshot").touched);
    assert!(form.node(&debts()).expect("snapshot").touched);
}

#[test]
fn server_errors_can_be_injected_and_cleared() {
    let form = form();
    form.push(&debts(), None).expect("push element");
    let target = debts().index(0).key("amount");

    form.set_errors(
        &target,
        vec![ValidationError::new("server", "rejected upstream")],
    )
    .expect("inject server error");
    assert!(!form.is_valid().expect("validity"));
    assert_eq!(
        form.error_map().expect("error map").get(&target),
        Some(&vec![ValidationError::new("server", "rejected upstream")])
    );

    form.clear_errors(&target).expect("clear one node");
    assert!(form.is_valid().expect("validity"));

    form.set_errors(&comment(), vec![ValidationError::new("server", "nope")])
        .expect("inject again");
    form.clear_all_errors().expect("clear tree-wide");
    assert!(form.is_valid().expect("validity"));
}

#[test]
fn panicking_validators_surface_implementation_errors() {
    let form = form();
    form.register_sync(&email(), |_value, _ctx| -> Option<ValidationError> {
        panic!("validator bug")
    })
    .expect("register panicking validator");

    let error = form
        .set_value(&email(), "x")
        .expect_err("panic must surface");
    match error {
        FormError::ValidatorImplementation { path, message } => {
            assert_eq!(path, email());
            assert!(message.contains("validator bug"));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // The tree stays usable afterwards.
    form.set_value(&qty(), 2).expect("set qty still works");
    assert_eq!(form.value_at(&qty()).expect("qty"), Value::from(2));
}

#[test]
fn validate_node_scopes_to_a_subtree() {
    let form = form();
    form.register_sync(&email(), validators::required("Email is required"))
        .expect("register required");

    let applicant_valid =
        block_on(form.validate_node(&Path::root().key("applicant"))).expect("validate applicant");
    assert!(!applicant_valid);
    assert_eq!(
        codes(&form.node(&email()).expect("snapshot").errors),
        vec!["required"]
    );

    let qty_valid = block_on(form.validate_node(&qty())).expect("validate qty");
    assert!(qty_valid);
}

#[test]
fn submit_rejects_with_the_error_map_and_skips_the_handler() {
    let form = form();
    form.register_sync(&email(), validators::required("Email is required"))
        .expect("register required");

    let calls = Arc::new(AtomicUsize::new(0));
    let result = {
        let calls = calls.clone();
        block_on(form.submit(move |_value| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<i32, String>(1)
            }
        }))
    };

    match result {
        Err(SubmitError::Rejected(failed)) => {
            assert_eq!(codes(&failed.errors[&email()]), vec!["required"]);
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        form.submit_state().expect("submit state"),
        SubmitState::Failed
    );
    assert!(form.node(&email()).expect("snapshot").touched);

    form.set_value(&email(), "a@b.com").expect("fix email");
    let result = {
        let calls = calls.clone();
        block_on(form.submit(move |value| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let record = value.as_record().expect("payload record");
                let applicant = record["applicant"].as_record().expect("applicant record");
                assert_eq!(applicant.get("email"), Some(&Value::from("a@b.com")));
                Ok::<i32, String>(7)
            }
        }))
    };
    assert_eq!(result.expect("submit succeeds"), 7);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        form.submit_state().expect("submit state"),
        SubmitState::Succeeded
    );
    assert_eq!(form.submit_count().expect("submit count"), 2);
}

#[test]
fn submit_propagates_handler_failures_unchanged() {
    let form = form();
    let result = block_on(form.submit(|_value| async { Err::<i32, String>("boom".into()) }));
    match result {
        Err(SubmitError::Handler(message)) => assert_eq!(message, "boom"),
        other => panic!("expected handler failure, got {other:?}"),
    }
    assert_eq!(
        form.submit_state().expect("submit state"),
        SubmitState::Failed
    );
}

#[test]
fn reset_restores_initials_and_resettles_computed_fields() {
    let form = form();
    form.computed(&total(), &[qty(), price()], product)
        .expect("register computed");

    form.set_value(&price(), 10).expect("set price");
    form.set_value(&qty(), 5).expect("set qty");
    form.mark_all_as_touched().expect("touch everything");
    assert_eq!(form.value_at(&total()).expect("total"), Value::from(50));

    form.reset_to_initial().expect("reset");
    assert_eq!(form.value_at(&qty()).expect("qty"), Value::from(1));
    assert_eq!(form.value_at(&total()).expect("total"), Value::from(0));
    assert!(!form.is_dirty().expect("dirtiness"));
    assert!(!form.node(&qty()).expect("snapshot").touched);
    assert_eq!(form.submit_state().expect("submit state"), SubmitState::Idle);

    form.set_value(&qty(), 9).expect("set qty");
    form.set_value(&price(), 2).expect("set price");
    form.reset_field(&qty()).expect("reset one field");
    assert_eq!(form.value_at(&qty()).expect("qty"), Value::from(1));
    assert_eq!(form.value_at(&total()).expect("total"), Value::from(2));
    assert_eq!(form.value_at(&price()).expect("price"), Value::from(2));
}

#[test]
fn async_validator_debounce_keeps_only_the_final_call() {
    let form = form();
    let invocations = Arc::new(AtomicUsize::new(0));
    {
        let invocations = invocations.clone();
        form.register_async(&email(), 300, move |value| {
            let invocations = invocations.clone();
            Box::pin(async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                let text = value.as_text().unwrap_or_default().to_owned();
                Ok(Some(ValidationError::new("taken", text)))
            })
        })
        .expect("register async validator");
    }

    let mut workers = Vec::new();
    for index in 1..=5 {
        let form = form.clone();
        workers.push(thread::spawn(move || {
            block_on(form.set_value_async(&email(), format!("name-{index}")))
                .expect("async set must succeed");
        }));
        thread::sleep(Duration::from_millis(10));
    }
    for worker in workers {
        worker.join().expect("worker joins");
    }

    // Only the final value's debounce window elapsed; the superseded calls
    // never reached the validator.
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    let snapshot = form.node(&email()).expect("snapshot");
    assert_eq!(snapshot.errors, vec![ValidationError::new("taken", "name-5")]);
    assert!(!snapshot.validating);
}

#[test]
fn stale_async_results_never_overwrite_newer_ones() {
    let form = form();
    form.register_async(&email(), 0, |value| {
        Box::pin(async move {
            let text = value.as_text().unwrap_or_default().to_owned();
            if text.contains("slow") {
                thread::sleep(Duration::from_millis(80));
                Ok(Some(ValidationError::new("taken", text)))
            } else {
                thread::sleep(Duration::from_millis(5));
                Ok(None)
            }
        })
    })
    .expect("register async validator");

    let slow = {
        let form = form.clone();
        thread::spawn(move || {
            block_on(form.set_value_async(&email(), "slow-bad@example.com"))
                .expect("slow async set");
        })
    };
    thread::sleep(Duration::from_millis(20));
    let fast = {
        let form = form.clone();
        thread::spawn(move || {
            block_on(form.set_value_async(&email(), "good@example.com")).expect("fast async set");
        })
    };

    slow.join().expect("slow thread joins");
    fast.join().expect("fast thread joins");

    let snapshot = form.node(&email()).expect("snapshot");
    assert!(snapshot.errors.is_empty());
    assert_eq!(snapshot.value, Value::from("good@example.com"));
    assert!(!snapshot.validating);
}

#[test]
fn validating_flag_is_observable_while_a_call_is_in_flight() {
    let form = form();
    form.register_async(&email(), 0, |_value| {
        Box::pin(async move {
            thread::sleep(Duration::from_millis(20));
            Ok(Some(ValidationError::new("taken", "already registered")))
        })
    })
    .expect("register async validator");

    let flags = Arc::new(Mutex::new(Vec::new()));
    let _guard = {
        let flags = flags.clone();
        form.subscribe(&email(), move |snapshot| {
            flags.lock().expect("flag lock").push(snapshot.validating);
        })
        .expect("subscribe")
    };

    block_on(form.set_value_async(&email(), "user@example.com")).expect("async set");

    let flags = flags.lock().expect("flag lock");
    assert!(flags.contains(&true));
    assert_eq!(flags.last(), Some(&false));
    assert_eq!(
        codes(&form.node(&email()).expect("snapshot").errors),
        vec!["taken"]
    );
}

#[test]
fn rejected_async_validators_fail_open() {
    let form = form();
    form.register_async(&email(), 0, |_value| {
        Box::pin(async move { Err("lookup service unavailable".into()) })
    })
    .expect("register async validator");

    block_on(form.set_value_async(&email(), "user@example.com")).expect("async set");
    let snapshot = form.node(&email()).expect("snapshot");
    assert!(snapshot.errors.is_empty());
    assert!(!snapshot.validating);
}

#[test]
fn validate_all_runs_async_validators_without_the_debounce() {
    let form = form();
    form.register_async(&email(), 60_000, |value| {
        Box::pin(async move {
            if value.is_empty() {
                Ok(Some(ValidationError::new("required", "Email is required")))
            } else {
                Ok(None)
            }
        })
    })
    .expect("register async validator");

    let valid = block_on(form.validate_all()).expect("validate all");
    assert!(!valid);
    assert_eq!(
        codes(&form.node(&email()).expect("snapshot").errors),
        vec!["required"]
    );

    form.set_value(&email(), "a@b.com").expect("fix email");
    let valid = block_on(form.validate_all()).expect("validate all again");
    assert!(valid);
}

#[test]
fn mutations_from_callbacks_are_queued_as_fresh_passes() {
    let form = form();
    // A subscriber that echoes qty into comment; the nested write must not
    // re-enter the running pass.
    let _guard = {
        let form_handle = form.clone();
        form.subscribe(&qty(), move |snapshot| {
            let text = format!("qty is {:?}", snapshot.value.as_number());
            let _ = form_handle.set_value(&Path::root().key("comment"), text);
        })
        .expect("subscribe")
    };

    form.set_value(&qty(), 3).expect("set qty");
    let comment_value = form.value_at(&comment()).expect("comment");
    assert!(
        comment_value
            .as_text()
            .is_some_and(|text| text.contains('3'))
    );
}
