use std::path::PathBuf;

use crate::conf::{parse_cmdline, parse_conds, parse_line, parse_runlevels, ConfError};
use crate::services::{RunlevelMask, ServiceKind, INIT_LEVEL};

#[test]
fn test_parse_full_service_line() {
    let line = parse_line(
        "service @ntp:ntp [2345] <net/eth0/up,!sys/pwr/fail> :2 log /sbin/ntpd -n -- NTP daemon",
    )
    .unwrap();
    assert_eq!(line.kind, ServiceKind::Service);
    assert_eq!(line.username.as_deref(), Some("ntp"));
    assert_eq!(line.group.as_deref(), Some("ntp"));
    assert!(line.runlevels.contains(2));
    assert!(line.runlevels.contains(5));
    assert!(!line.runlevels.contains(1));
    assert_eq!(line.conds.len(), 2);
    assert_eq!(line.conds[0].name, "net/eth0/up");
    assert!(!line.conds[0].negated);
    assert_eq!(line.conds[1].name, "sys/pwr/fail");
    assert!(line.conds[1].negated);
    assert!(line.sighup);
    assert_eq!(line.id, Some(2));
    assert!(line.log);
    assert_eq!(line.cmd, PathBuf::from("/sbin/ntpd"));
    assert_eq!(line.args, vec!["-n".to_string()]);
    assert_eq!(line.desc, "NTP daemon");
}

#[test]
fn test_parse_minimal_lines() {
    let line = parse_line("task /bin/true -- a one-shot").unwrap();
    assert_eq!(line.kind, ServiceKind::Task);
    assert_eq!(line.runlevels, RunlevelMask::DEFAULT);
    assert!(line.conds.is_empty());
    assert_eq!(line.id, None);
    assert!(!line.log);

    let line = parse_line("run [S] /sbin/fsck -a").unwrap();
    assert_eq!(line.kind, ServiceKind::Run);
    assert!(line.runlevels.contains(INIT_LEVEL));
    assert!(!line.runlevels.contains(2));
    assert_eq!(line.desc, "");

    let line = parse_line("sysv /etc/init.d/legacy start").unwrap();
    assert_eq!(line.kind, ServiceKind::Sysv);
    assert_eq!(line.args, vec!["start".to_string()]);
}

#[test]
fn test_parse_bare_bang_disables_sighup() {
    let line = parse_line("service <!> /sbin/dropbear -- ssh").unwrap();
    assert!(!line.sighup);
    assert!(line.conds.is_empty());

    let line = parse_line("service <!,net/eth0/up> /sbin/dropbear -- ssh").unwrap();
    assert!(!line.sighup);
    assert_eq!(line.conds.len(), 1);
    assert!(!line.conds[0].negated);

    // plain conditions keep SIGHUP support
    let line = parse_line("service <net/eth0/up> /sbin/dropbear -- ssh").unwrap();
    assert!(line.sighup);
}

#[test]
fn test_parse_inetd_line() {
    let line =
        parse_line("inetd ssh/tcp@eth0,!eth1 nowait [2345] @root /sbin/sshd -i -- SSH").unwrap();
    assert_eq!(line.kind, ServiceKind::Inetd);
    let inetd = line.inetd.unwrap();
    assert_eq!(inetd.port, 22);
    assert!(!inetd.wait);
    assert_eq!(inetd.allow, vec!["eth0".to_string()]);
    assert_eq!(inetd.deny, vec!["eth1".to_string()]);

    let line = parse_line("inetd 2222/tcp wait /sbin/sshd -i -- SSH alt port").unwrap();
    let inetd = line.inetd.unwrap();
    assert_eq!(inetd.port, 2222);
    assert!(inetd.wait);
    assert!(inetd.allow.is_empty());
}

#[test]
fn test_parse_rejects_garbage() {
    assert!(matches!(
        parse_line("service"),
        Err(ConfError::Incomplete(_))
    ));
    assert!(matches!(
        parse_line("frobnicate /bin/x"),
        Err(ConfError::UnknownKind(_))
    ));
    assert!(matches!(
        parse_line("service :0 /bin/x"),
        Err(ConfError::BadId(_))
    ));
    assert!(matches!(
        parse_line("inetd nowait /sbin/sshd"),
        Err(ConfError::BadInetd(_))
    ));
    // udp inetd services are not supported
    assert!(matches!(
        parse_line("inetd time/udp nowait /sbin/timed"),
        Err(ConfError::BadInetd(_))
    ));
}

#[test]
fn test_parse_runlevel_masks() {
    let mask = parse_runlevels("[2345]").unwrap();
    for level in [2, 3, 4, 5] {
        assert!(mask.contains(level));
    }
    for level in [0, 1, 6, 9, INIT_LEVEL] {
        assert!(!mask.contains(level));
    }

    let mask = parse_runlevels("[S]").unwrap();
    assert!(mask.contains(INIT_LEVEL));
    assert!(!mask.contains(2));

    // range notation
    let mask = parse_runlevels("[0-6,S]").unwrap();
    for level in 0..=6 {
        assert!(mask.contains(level));
    }
    assert!(mask.contains(INIT_LEVEL));
    assert!(!mask.contains(7));

    // inverted: everything except 0-6 and S
    let mask = parse_runlevels("[!0-6,S]").unwrap();
    for level in 0..=6 {
        assert!(!mask.contains(level));
    }
    assert!(!mask.contains(INIT_LEVEL));
    for level in 7..=9 {
        assert!(mask.contains(level));
    }

    assert!(parse_runlevels("2345").is_err());
    assert!(parse_runlevels("[2x]").is_err());
    assert!(parse_runlevels("[6-2]").is_err());
}

#[test]
fn test_parse_conds_entries() {
    let (conds, sighup) = parse_conds("<a,!b,c>");
    assert!(sighup);
    assert_eq!(conds.len(), 3);
    assert!(!conds[0].negated);
    assert!(conds[1].negated);
    assert_eq!(conds[1].name, "b");

    let (conds, sighup) = parse_conds("<>");
    assert!(sighup);
    assert!(conds.is_empty());
}

#[test]
fn test_parse_kernel_cmdline() {
    let opts = parse_cmdline("BOOT_IMAGE=/vmlinuz root=/dev/sda1 ro 3 rustyinit.debug");
    assert_eq!(opts.cmdlevel, Some(3));
    assert!(opts.debug);

    let opts = parse_cmdline("root=/dev/sda1 quiet");
    assert_eq!(opts.cmdlevel, None);
    assert!(!opts.debug);
}
