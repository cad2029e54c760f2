//! The service registry: every known record lives in exactly one of these,
//! keyed by (command path, instance id), with reverse lookup by pid and
//! filtered iteration by kind mask.

use std::collections::BTreeMap;
use std::time::SystemTime;

use log::{debug, trace};

use crate::services::{kind_mask, Dirty, Service, ServiceKind, SvcKey, SvcState, INIT_LEVEL};

#[derive(Default)]
pub struct ServiceRegistry {
    services: BTreeMap<SvcKey, Service>,
}

impl ServiceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.services.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    #[must_use]
    pub fn get(&self, key: &SvcKey) -> Option<&Service> {
        self.services.get(key)
    }

    pub fn get_mut(&mut self, key: &SvcKey) -> Option<&mut Service> {
        self.services.get_mut(key)
    }

    /// Insert a freshly built record. The caller owns key uniqueness; an
    /// existing record under the same key is replaced wholesale (only used
    /// for programmatic registration, config reloads go through
    /// `register`).
    pub fn insert(&mut self, svc: Service) {
        self.services.insert(svc.key.clone(), svc);
    }

    pub fn remove(&mut self, key: &SvcKey) -> Option<Service> {
        self.services.remove(key)
    }

    /// At most one record can hold any given pid.
    #[must_use]
    pub fn key_by_pid(&self, pid: nix::unistd::Pid) -> Option<SvcKey> {
        self.services
            .values()
            .find(|svc| svc.pid == Some(pid))
            .map(|svc| svc.key.clone())
    }

    /// Resolve a control-plane name: command basename or full path,
    /// optionally suffixed `:id`.
    #[must_use]
    pub fn key_by_name(&self, name: &str) -> Option<SvcKey> {
        let (name, id) = match name.rsplit_once(':') {
            Some((base, id_str)) => match id_str.parse::<u32>() {
                Ok(id) => (base, Some(id)),
                Err(_) => (name, None),
            },
            None => (name, None),
        };
        self.services
            .values()
            .find(|svc| {
                if let Some(id) = id {
                    if svc.key.id != id {
                        return false;
                    }
                }
                svc.key.cmd == std::path::Path::new(name)
                    || svc
                        .key
                        .cmd
                        .file_name()
                        .map(|f| f.to_str() == Some(name))
                        .unwrap_or(false)
            })
            .map(|svc| svc.key.clone())
    }

    pub fn keys(&self) -> Vec<SvcKey> {
        self.services.keys().cloned().collect()
    }

    /// Keys of all records matching the kind mask, in registry order.
    pub fn keys_by_kind(&self, mask: u32) -> Vec<SvcKey> {
        self.services
            .values()
            .filter(|svc| svc.kind.mask() & mask != 0)
            .map(|svc| svc.key.clone())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Service> {
        self.services.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Service> {
        self.services.values_mut()
    }

    /// Next unused instance id for a command, for records registered
    /// without an explicit `:id`.
    #[must_use]
    pub fn next_id(&self, cmd: &std::path::Path) -> u32 {
        self.services
            .values()
            .filter(|svc| svc.key.cmd == cmd)
            .map(|svc| svc.key.id)
            .max()
            .map_or(1, |max| max + 1)
    }

    /// Begin a re-parse: every config-born record becomes a removal
    /// candidate until `register` sees it again. Inetd connection children
    /// are runtime-born and never candidates.
    pub fn mark_all_unseen(&mut self) {
        for svc in self.services.values_mut() {
            if svc.kind != ServiceKind::InetdConn {
                svc.seen = false;
            }
        }
    }

    /// Finish a re-parse: records whose config line vanished are marked
    /// Removed. They stay in the registry until the clean phase collects
    /// them.
    pub fn finish_reload(&mut self) {
        for svc in self.services.values_mut() {
            if !svc.seen {
                debug!("Service {} vanished from config, marking removed", svc.key);
                svc.dirty = Dirty::Removed;
            }
        }
    }

    /// Register a parsed service line. Idempotent on unchanged input:
    /// an existing record whose attributes match stays Clean; differing
    /// argv/user/conditions/runlevels mark it Changed; an unknown key
    /// creates a New record.
    pub fn register(&mut self, mut fresh: Service, mtime: Option<SystemTime>) {
        fresh.mtime = mtime;
        match self.services.get_mut(&fresh.key) {
            Some(existing) => {
                existing.seen = true;
                let changed = existing.args != fresh.args
                    || existing.username != fresh.username
                    || existing.group != fresh.group
                    || existing.conds != fresh.conds
                    || existing.runlevels != fresh.runlevels
                    || existing.sighup != fresh.sighup
                    || existing.log != fresh.log
                    || existing.kind != fresh.kind
                    || existing.inetd != fresh.inetd;
                if changed {
                    trace!("Service {} changed on reload", fresh.key);
                    existing.args = fresh.args;
                    existing.username = fresh.username;
                    existing.group = fresh.group;
                    existing.conds = fresh.conds;
                    existing.runlevels = fresh.runlevels;
                    existing.sighup = fresh.sighup;
                    existing.log = fresh.log;
                    existing.kind = fresh.kind;
                    existing.desc = fresh.desc;
                    existing.inetd = fresh.inetd;
                    existing.mtime = mtime;
                    existing.dirty = Dirty::Changed;
                } else {
                    existing.desc = fresh.desc;
                    existing.mtime = mtime;
                    if existing.dirty != Dirty::New {
                        existing.dirty = Dirty::Clean;
                    }
                }
            }
            None => {
                trace!("Creating new service record for {}", fresh.key);
                self.insert(fresh);
            }
        }
    }

    /// First service still tearing down: in Stopping with a live pid. The
    /// global state machine stays in its wait state while any exists.
    #[must_use]
    pub fn stop_completed(&self) -> Option<&Service> {
        self.services
            .values()
            .find(|svc| svc.state == SvcState::Stopping && svc.pid.is_some())
    }

    /// First record still holding a pid past teardown (e.g. an inetd
    /// connection draining); the clean phase waits for these to be reaped.
    #[must_use]
    pub fn clean_completed(&self) -> Option<&Service> {
        self.services
            .values()
            .find(|svc| svc.state == SvcState::Done && svc.pid.is_some())
    }

    /// First bootstrap run/task that has not completed yet: in runlevel S,
    /// not yet started or still running. None once bootstrap may finish.
    #[must_use]
    pub fn bootstrap_pending(&self) -> Option<&Service> {
        self.services.values().find(|svc| {
            svc.kind.mask() & kind_mask::RUNTASK != 0
                && svc.runlevels.contains(INIT_LEVEL)
                && !(svc.started_once && svc.pid.is_none())
        })
    }

    /// Reset completed one-shot records so they run again in the new
    /// runlevel, if its mask includes them.
    pub fn runtask_clean(&mut self) {
        for svc in self.services.values_mut() {
            if svc.kind.is_oneshot() && svc.state == SvcState::Done {
                svc.state = SvcState::Halted;
                svc.started_once = false;
            }
        }
    }

    /// Drop Removed records. Never frees a record that still holds a pid
    /// or an armed timer; those come back around after the next reap.
    pub fn prune_removed(&mut self) -> Vec<Service> {
        let keys: Vec<SvcKey> = self
            .services
            .values()
            .filter(|svc| svc.is_removed() && svc.pid.is_none() && svc.timer.is_none())
            .map(|svc| svc.key.clone())
            .collect();
        let mut pruned = Vec::new();
        for key in keys {
            debug!("Pruning removed service {key}");
            if let Some(svc) = self.services.remove(&key) {
                pruned.push(svc);
            }
        }
        pruned
    }
}
