use std::path::PathBuf;

use crate::registry::ServiceRegistry;
use crate::services::{Dirty, RunlevelMask, Service, ServiceKind, SvcKey};

fn record(cmd: &str, id: u32, kind: ServiceKind) -> Service {
    let mut svc = Service::new(SvcKey::new(cmd, id), kind);
    svc.args = vec!["-n".to_string()];
    svc
}

#[test]
fn test_register_is_idempotent_on_unchanged_input() {
    let mut registry = ServiceRegistry::new();
    registry.register(record("/sbin/ntpd", 1, ServiceKind::Service), None);

    // settle the initial New marker as a started service would
    registry
        .get_mut(&SvcKey::new("/sbin/ntpd", 1))
        .unwrap()
        .mark_clean();

    registry.mark_all_unseen();
    registry.register(record("/sbin/ntpd", 1, ServiceKind::Service), None);
    registry.finish_reload();

    let svc = registry.get(&SvcKey::new("/sbin/ntpd", 1)).unwrap();
    assert_eq!(svc.dirty, Dirty::Clean);
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_register_marks_changed_on_new_argv() {
    let mut registry = ServiceRegistry::new();
    registry.register(record("/sbin/ntpd", 1, ServiceKind::Service), None);
    registry
        .get_mut(&SvcKey::new("/sbin/ntpd", 1))
        .unwrap()
        .mark_clean();

    let mut changed = record("/sbin/ntpd", 1, ServiceKind::Service);
    changed.args = vec!["-n".to_string(), "-g".to_string()];
    registry.mark_all_unseen();
    registry.register(changed, None);
    registry.finish_reload();

    let svc = registry.get(&SvcKey::new("/sbin/ntpd", 1)).unwrap();
    assert_eq!(svc.dirty, Dirty::Changed);
    assert_eq!(svc.args.len(), 2);
}

#[test]
fn test_vanished_records_are_marked_removed_and_pruned() {
    let mut registry = ServiceRegistry::new();
    registry.register(record("/sbin/ntpd", 1, ServiceKind::Service), None);
    registry.register(record("/sbin/crond", 1, ServiceKind::Service), None);

    registry.mark_all_unseen();
    registry.register(record("/sbin/crond", 1, ServiceKind::Service), None);
    registry.finish_reload();

    let ntpd = registry.get(&SvcKey::new("/sbin/ntpd", 1)).unwrap();
    assert_eq!(ntpd.dirty, Dirty::Removed);

    let pruned = registry.prune_removed();
    assert_eq!(pruned.len(), 1);
    assert_eq!(pruned[0].key.cmd, PathBuf::from("/sbin/ntpd"));
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_prune_never_frees_live_records() {
    let mut registry = ServiceRegistry::new();
    let mut svc = record("/sbin/ntpd", 1, ServiceKind::Service);
    svc.dirty = Dirty::Removed;
    svc.pid = Some(nix::unistd::Pid::from_raw(4711));
    registry.insert(svc);

    assert!(registry.prune_removed().is_empty());

    // pid collected but a timer is still armed: also kept
    let svc = registry.get_mut(&SvcKey::new("/sbin/ntpd", 1)).unwrap();
    svc.pid = None;
    svc.timer = Some({
        let mut timers = crate::eventloop::Timers::new();
        timers.after(
            std::time::Duration::from_millis(100),
            crate::eventloop::TimerEvent::BootstrapTick,
        )
    });
    assert!(registry.prune_removed().is_empty());

    registry.get_mut(&SvcKey::new("/sbin/ntpd", 1)).unwrap().timer = None;
    assert_eq!(registry.prune_removed().len(), 1);
}

#[test]
fn test_pid_lookup_finds_at_most_one() {
    let mut registry = ServiceRegistry::new();
    let mut one = record("/sbin/udhcpc", 1, ServiceKind::Service);
    one.pid = Some(nix::unistd::Pid::from_raw(100));
    let mut two = record("/sbin/udhcpc", 2, ServiceKind::Service);
    two.pid = Some(nix::unistd::Pid::from_raw(200));
    registry.insert(one);
    registry.insert(two);

    let key = registry.key_by_pid(nix::unistd::Pid::from_raw(200)).unwrap();
    assert_eq!(key.id, 2);
    assert!(registry.key_by_pid(nix::unistd::Pid::from_raw(300)).is_none());
}

#[test]
fn test_name_lookup() {
    let mut registry = ServiceRegistry::new();
    registry.insert(record("/sbin/udhcpc", 1, ServiceKind::Service));
    registry.insert(record("/sbin/udhcpc", 2, ServiceKind::Service));

    assert_eq!(registry.key_by_name("udhcpc").unwrap().id, 1);
    assert_eq!(registry.key_by_name("udhcpc:2").unwrap().id, 2);
    assert_eq!(registry.key_by_name("/sbin/udhcpc").unwrap().id, 1);
    assert!(registry.key_by_name("dnsmasq").is_none());
    assert!(registry.key_by_name("udhcpc:7").is_none());
}

#[test]
fn test_next_id() {
    let mut registry = ServiceRegistry::new();
    assert_eq!(registry.next_id(std::path::Path::new("/sbin/udhcpc")), 1);
    registry.insert(record("/sbin/udhcpc", 1, ServiceKind::Service));
    registry.insert(record("/sbin/udhcpc", 5, ServiceKind::Service));
    assert_eq!(registry.next_id(std::path::Path::new("/sbin/udhcpc")), 6);
}

#[test]
fn test_kind_mask_iteration() {
    use crate::services::kind_mask;

    let mut registry = ServiceRegistry::new();
    registry.insert(record("/bin/daemon", 1, ServiceKind::Service));
    registry.insert(record("/bin/job", 1, ServiceKind::Task));
    registry.insert(record("/bin/boot", 1, ServiceKind::Run));

    assert_eq!(registry.keys_by_kind(kind_mask::ANY).len(), 3);
    assert_eq!(registry.keys_by_kind(kind_mask::RUNTASK).len(), 2);
    assert_eq!(registry.keys_by_kind(kind_mask::SERVICE).len(), 1);
}

#[test]
fn test_bootstrap_pending() {
    use crate::services::INIT_LEVEL;

    let mut registry = ServiceRegistry::new();
    let mut task = record("/bin/boot-task", 1, ServiceKind::Task);
    let mut mask = RunlevelMask::EMPTY;
    mask.set(INIT_LEVEL);
    task.runlevels = mask;
    registry.insert(task);

    // never started: pending
    assert!(registry.bootstrap_pending().is_some());

    // started and running: still pending
    let svc = registry.get_mut(&SvcKey::new("/bin/boot-task", 1)).unwrap();
    svc.started_once = true;
    svc.pid = Some(nix::unistd::Pid::from_raw(42));
    assert!(registry.bootstrap_pending().is_some());

    // collected: done
    registry
        .get_mut(&SvcKey::new("/bin/boot-task", 1))
        .unwrap()
        .pid = None;
    assert!(registry.bootstrap_pending().is_none());
}
