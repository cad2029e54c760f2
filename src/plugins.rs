//! Hook phases and the plugin capability set.
//!
//! External collaborators (TTY bring-up, filesystem helpers, pidfile
//! watchers) attach to well-defined phases of the boot and runlevel
//! cycle. The core holds a vector of capability objects and calls out at
//! each phase; it knows nothing about what the plugins do.

use std::collections::HashMap;
use std::os::unix::io::RawFd;

use log::trace;

use crate::supervisor::Supervisor;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum HookPhase {
    /// Base filesystem mounted, before any service starts.
    BasefsUp,
    /// Bootstrap finished, configured runlevel reached.
    SystemUp,
    /// All services of the configured runlevel have been stepped.
    SvcUp,
    /// A service process was just forked.
    SvcStart,
    /// A service process was just collected.
    SvcLost,
    /// Configuration reload completed.
    SvcReconf,
    /// Outgoing runlevel stopped, before the incoming one starts.
    RunlevelChange,
    /// Entering runlevel 0 or 6.
    Shutdown,
    /// SIGPWR received.
    PowerFail,
}

pub trait Plugin {
    fn name(&self) -> &str;
    fn hook(&self, phase: HookPhase, sup: &mut Supervisor);
}

/// Callback for a built-in inetd service provided by a plugin instead of
/// an external binary; gets the connection socket, returns an exit code.
pub type InetdCallback = fn(RawFd) -> i32;

#[derive(Default)]
pub struct Hooks {
    plugins: Vec<Box<dyn Plugin>>,
    inetd_builtins: HashMap<String, InetdCallback>,
}

impl Hooks {
    pub fn register(&mut self, plugin: Box<dyn Plugin>) {
        trace!("Registered plugin {}", plugin.name());
        self.plugins.push(plugin);
    }

    pub fn register_inetd(&mut self, name: &str, callback: InetdCallback) {
        self.inetd_builtins.insert(name.to_string(), callback);
    }

    #[must_use]
    pub fn inetd_builtin(&self, name: &str) -> Option<InetdCallback> {
        self.inetd_builtins.get(name).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

/// Run every plugin's hook for a phase. The hook set is moved out for the
/// duration so plugins may operate on the supervisor; registrations made
/// from inside a hook are merged back afterwards.
pub fn run_hooks(sup: &mut Supervisor, phase: HookPhase) {
    if sup.hooks.is_empty() && sup.hooks.inetd_builtins.is_empty() {
        return;
    }
    let hooks = std::mem::take(&mut sup.hooks);
    for plugin in &hooks.plugins {
        trace!("Hook {phase:?}: {}", plugin.name());
        plugin.hook(phase, sup);
    }
    let late = std::mem::replace(&mut sup.hooks, hooks);
    for plugin in late.plugins {
        sup.hooks.plugins.push(plugin);
    }
    for (name, callback) in late.inetd_builtins {
        sup.hooks.inetd_builtins.insert(name, callback);
    }
}
