use crate::conditions::{CondSpec, CondState, CondStore};

fn spec(name: &str) -> CondSpec {
    CondSpec {
        name: name.to_string(),
        negated: false,
    }
}

fn negated(name: &str) -> CondSpec {
    CondSpec {
        name: name.to_string(),
        negated: true,
    }
}

#[test]
fn test_unknown_condition_is_off() {
    let conds = CondStore::new();
    assert_eq!(conds.get("net/eth0/up"), CondState::Off);
}

#[test]
fn test_assert_deassert() {
    let mut conds = CondStore::new();
    assert!(conds.assert("net/eth0/up"));
    assert_eq!(conds.get("net/eth0/up"), CondState::On);
    // asserting again is not a change
    assert!(!conds.assert("net/eth0/up"));
    assert!(conds.deassert("net/eth0/up"));
    assert_eq!(conds.get("net/eth0/up"), CondState::Off);
}

#[test]
fn test_empty_list_aggregates_on() {
    let conds = CondStore::new();
    assert_eq!(conds.aggregate(&[]), CondState::On);
}

#[test]
fn test_aggregate_is_minimum() {
    let mut conds = CondStore::new();
    conds.assert("a");
    conds.assert("b");
    assert_eq!(conds.aggregate(&[spec("a"), spec("b")]), CondState::On);

    conds.set_flux("b");
    assert_eq!(conds.aggregate(&[spec("a"), spec("b")]), CondState::Flux);

    conds.deassert("b");
    assert_eq!(conds.aggregate(&[spec("a"), spec("b")]), CondState::Off);

    // Off beats Flux
    conds.set_flux("a");
    assert_eq!(conds.aggregate(&[spec("a"), spec("b")]), CondState::Off);
}

#[test]
fn test_negation_inverts_on_off_keeps_flux() {
    let mut conds = CondStore::new();
    assert_eq!(conds.aggregate(&[negated("missing")]), CondState::On);

    conds.assert("missing");
    assert_eq!(conds.aggregate(&[negated("missing")]), CondState::Off);

    conds.set_flux("missing");
    assert_eq!(conds.aggregate(&[negated("missing")]), CondState::Flux);
}

#[test]
fn test_reload_flips_to_flux() {
    let mut conds = CondStore::new();
    conds.assert("a");
    conds.deassert("b");
    assert!(conds.reload());
    assert_eq!(conds.get("a"), CondState::Flux);
    assert_eq!(conds.get("b"), CondState::Flux);
}

#[test]
fn test_oneshot_is_pinned() {
    let mut conds = CondStore::new();
    conds.set_oneshot("int/bootstrap");
    assert_eq!(conds.get("int/bootstrap"), CondState::On);

    // neither deassert, flux nor reload touches a pinned condition
    assert!(!conds.deassert("int/bootstrap"));
    assert_eq!(conds.get("int/bootstrap"), CondState::On);
    assert!(!conds.set_flux("int/bootstrap"));
    assert_eq!(conds.get("int/bootstrap"), CondState::On);
    conds.assert("other");
    conds.reload();
    assert_eq!(conds.get("int/bootstrap"), CondState::On);
    assert_eq!(conds.get("other"), CondState::Flux);
}
