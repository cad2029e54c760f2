//! Global state machine scenarios: bootstrap, runlevel change, reload.

use std::path::PathBuf;

use crate::conf::ConfDir;
use crate::services::{ServiceKind, SvcState, INIT_LEVEL};
use crate::sm::{self, Sm, SmState};

use super::{add_service, assert_pid_state_invariant, reap_one, test_supervisor};

fn temp_confdir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("rustyinit-{name}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).expect("creating temp confdir");
    dir
}

#[test]
fn test_happy_boot() {
    let mut sup = test_supervisor();
    sup.runlevel = INIT_LEVEL;
    sup.cfglevel = 2;
    sup.sm = Sm::new();

    let task = add_service(&mut sup, "/bin/true", ServiceKind::Task, &[INIT_LEVEL]);
    let sleeper = add_service(&mut sup, "/bin/sleep", ServiceKind::Service, &[2, 3, 4, 5]);
    sup.registry.get_mut(&sleeper).unwrap().args = vec!["30".to_string()];

    sm::sm_init(&mut sup);
    sm::sm_step(&mut sup);
    assert_eq!(sup.sm.state, SmState::BootstrapWait);

    // the bootstrap task was started, the daemon waits for its runlevel
    let task_pid = sup.registry.get(&task).unwrap().pid.expect("task started");
    assert!(sup.registry.get(&sleeper).unwrap().pid.is_none());

    reap_one(&mut sup, task_pid);
    assert_eq!(sup.registry.get(&task).unwrap().state, SvcState::Done);
    assert!(sup.registry.bootstrap_pending().is_none());

    // the tick observes completion and finalizes bootstrap
    sm::sm_check_bootstrap(&mut sup);

    assert_eq!(sup.sm.state, SmState::Running);
    assert_eq!(sup.runlevel, 2);
    assert_eq!(sup.prevlevel, Some(INIT_LEVEL));
    assert_eq!(
        sup.conds.get("int/bootstrap"),
        crate::conditions::CondState::On
    );

    let svc = sup.registry.get(&sleeper).unwrap();
    assert_eq!(svc.state, SvcState::Running);
    let pid = svc.pid.expect("daemon running after bootstrap");
    assert_pid_state_invariant(&sup);

    let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL);
    let _ = nix::sys::wait::waitpid(pid, None);
}

#[test]
fn test_bootstrap_watchdog_gives_up_eventually() {
    let mut sup = test_supervisor();
    sup.runlevel = INIT_LEVEL;
    sup.cfglevel = 3;
    sup.sm = Sm::new();

    // a bootstrap task whose binary is missing never completes
    add_service(
        &mut sup,
        "/no/such/bootstrap-task",
        ServiceKind::Task,
        &[INIT_LEVEL],
    );

    sm::sm_init(&mut sup);
    sm::sm_step(&mut sup);
    assert_eq!(sup.sm.state, SmState::BootstrapWait);

    // drive the one-second ticks until the 120 tick budget runs dry
    for _ in 0..200 {
        sm::sm_check_bootstrap(&mut sup);
        if sup.sm.state == SmState::Running {
            break;
        }
    }

    assert_eq!(sup.sm.state, SmState::Running);
    assert_eq!(sup.runlevel, 3);
}

#[test]
fn test_runlevel_change_waits_for_stopping_children() {
    let mut sup = test_supervisor();
    let key = add_service(&mut sup, "/bin/sleep", ServiceKind::Service, &[2]);
    sup.registry.get_mut(&key).unwrap().args = vec!["30".to_string()];

    crate::services::service_step(&mut sup, &key);
    let pid = sup.registry.get(&key).unwrap().pid.expect("daemon started");

    sup.service_runlevel(3);

    // the daemon is not in [3]: SIGTERMed, and the machine holds in the
    // wait state until the child is collected
    assert_eq!(sup.sm.state, SmState::RunlevelWait);
    assert!(sup.sm.in_teardown);
    assert_eq!(sup.registry.get(&key).unwrap().state, SvcState::Stopping);
    assert_eq!(sup.runlevel, 3);

    // a second stimulus while waiting changes nothing
    sm::sm_step(&mut sup);
    assert_eq!(sup.sm.state, SmState::RunlevelWait);

    reap_one(&mut sup, pid);

    // the monitor re-stepped the machine through wait and clean
    assert_eq!(sup.sm.state, SmState::Running);
    assert!(!sup.sm.in_teardown);
    assert_eq!(sup.registry.get(&key).unwrap().state, SvcState::Halted);
    assert_pid_state_invariant(&sup);
}

#[test]
fn test_runlevel_change_to_same_level_is_a_noop() {
    let mut sup = test_supervisor();
    sup.service_runlevel(2);
    assert_eq!(sup.sm.state, SmState::Running);
    assert_eq!(sup.runlevel, 2);
    assert_eq!(sup.prevlevel, None);
}

#[test]
fn test_reload_restarts_changed_stop_start_service_only() {
    let dir = temp_confdir("reload");
    let conf_path = dir.join("sleepers.conf");
    std::fs::write(
        &conf_path,
        "service <!> [2] :1 /bin/sleep 30 -- first sleeper\n\
         service [2] :2 /bin/sleep 31 -- second sleeper\n",
    )
    .expect("writing service config");

    let mut sup = test_supervisor();
    sup.confdir = ConfDir::new(&dir);
    sup.load_services();

    let one = sup.registry.key_by_name("sleep:1").expect("first registered");
    let two = sup.registry.key_by_name("sleep:2").expect("second registered");

    sup.step_all(crate::services::kind_mask::ANY);
    let pid_one = sup.registry.get(&one).unwrap().pid.expect("first running");
    let pid_two = sup.registry.get(&two).unwrap().pid.expect("second running");

    // change only the first service's argv; the first is declared <!>
    // (no SIGHUP) so the reload must stop and start it
    std::fs::write(
        &conf_path,
        "service <!> [2] :1 /bin/sleep 32 -- first sleeper\n\
         service [2] :2 /bin/sleep 31 -- second sleeper\n",
    )
    .expect("rewriting service config");

    sup.service_reload_dynamic();
    assert_eq!(sup.sm.state, SmState::ReloadWait);
    assert_eq!(sup.registry.get(&one).unwrap().state, SvcState::Stopping);

    reap_one(&mut sup, pid_one);

    assert_eq!(sup.sm.state, SmState::Running);
    let svc_one = sup.registry.get(&one).unwrap();
    assert_eq!(svc_one.state, SvcState::Running);
    let new_pid = svc_one.pid.expect("first restarted");
    assert_ne!(new_pid, pid_one, "changed service must get a fresh process");
    assert_eq!(svc_one.args, vec!["32".to_string()]);

    // the unchanged service was left completely alone
    let svc_two = sup.registry.get(&two).unwrap();
    assert_eq!(svc_two.state, SvcState::Running);
    assert_eq!(svc_two.pid, Some(pid_two));

    for pid in [new_pid, pid_two] {
        let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL);
        let _ = nix::sys::wait::waitpid(pid, None);
    }
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_reload_collects_vanished_services() {
    let dir = temp_confdir("vanish");
    let conf_path = dir.join("svc.conf");
    std::fs::write(&conf_path, "task [2] /bin/true -- short job\n")
        .expect("writing service config");

    let mut sup = test_supervisor();
    sup.confdir = ConfDir::new(&dir);
    sup.load_services();
    let key = sup.registry.key_by_name("true").expect("registered");

    sup.step_all(crate::services::kind_mask::ANY);
    let pid = sup.registry.get(&key).unwrap().pid.expect("task started");
    reap_one(&mut sup, pid);
    assert_eq!(sup.registry.get(&key).unwrap().state, SvcState::Done);

    // drop the declaration; reload must mark and then prune the record
    std::fs::write(&conf_path, "# nothing left\n").expect("rewriting service config");
    sup.service_reload_dynamic();

    assert_eq!(sup.sm.state, SmState::Running);
    assert!(
        sup.registry.get(&key).is_none(),
        "vanished record should be pruned in the clean phase"
    );

    let _ = std::fs::remove_dir_all(&dir);
}
