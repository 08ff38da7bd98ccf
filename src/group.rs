//! Emulation group: owns processes keyed by pid, issues pids, and drives
//! the round-robin run loop across processes.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use libc::pid_t;

use crate::errors::{ArionError, Result};
use crate::process::ProcessSharedPtr;

pub type ArionGroupSharedPtr = Rc<RefCell<ArionGroup>>;
pub type ArionGroupSharedWeakPtr = Weak<RefCell<ArionGroup>>;

pub struct ArionGroup {
    instances: BTreeMap<pid_t, ProcessSharedPtr>,
    next_pid: pid_t,
    curr_pid: pid_t,
    trigger_stop: bool,
    weak_self: ArionGroupSharedWeakPtr,
}

impl ArionGroup {
    pub fn new() -> ArionGroupSharedPtr {
        let group = Rc::new(RefCell::new(ArionGroup {
            instances: BTreeMap::new(),
            next_pid: 1,
            curr_pid: 0,
            trigger_stop: false,
            weak_self: Weak::new(),
        }));
        group.borrow_mut().weak_self = Rc::downgrade(&group);
        group
    }

    pub fn count(&self) -> usize {
        self.instances.len()
    }

    pub fn has_instance(&self, pid: pid_t) -> bool {
        self.instances.contains_key(&pid)
    }

    pub fn instance(&self, pid: pid_t) -> Result<ProcessSharedPtr> {
        self.instances
            .get(&pid)
            .cloned()
            .ok_or(ArionError::NoProcessWithPid(pid))
    }

    pub fn instances(&self) -> Vec<(pid_t, ProcessSharedPtr)> {
        self.instances
            .iter()
            .map(|(&pid, p)| (pid, p.clone()))
            .collect()
    }

    /// A process's pgid without keeping any borrow alive. `None` when the
    /// pid is unknown or the process is currently borrowed elsewhere.
    pub fn instance_pgid(&self, pid: pid_t) -> Option<pid_t> {
        let instance = self.instances.get(&pid)?;
        let pgid = instance.try_borrow().ok()?.state().pgid;
        Some(pgid)
    }

    /// Registers a process. Without an explicit pid, a pid already set on
    /// the process (e.g. by a coredump loader) is honored; otherwise the
    /// next free pid is issued. Without an explicit pgid, the process
    /// leads its own group.
    pub fn add_instance(
        &mut self,
        process: ProcessSharedPtr,
        pid: Option<pid_t>,
        pgid: Option<pid_t>,
    ) {
        let mut proc_ref = process.borrow_mut();
        let pid_val = match pid {
            Some(p) => {
                proc_ref.state_mut().pid = p;
                p
            }
            None => {
                let mut p = proc_ref.state().pid;
                if p == 0 {
                    p = self.next_pid;
                    self.next_pid += 1;
                    proc_ref.state_mut().pid = p;
                }
                // Keep issuance monotonic past externally chosen pids.
                if p >= self.next_pid {
                    self.next_pid = p + 1;
                }
                let state = proc_ref.state_mut();
                for thread in state.threads.threads.values_mut() {
                    thread.tgid = p;
                }
                p
            }
        };
        let pgid_val = match pgid {
            Some(g) => g,
            None => {
                let g = proc_ref.state().pgid;
                if g == 0 {
                    pid_val
                } else {
                    g
                }
            }
        };
        proc_ref.state_mut().pgid = pgid_val;
        proc_ref.state_mut().group = self.weak_self.clone();
        drop(proc_ref);
        self.instances.insert(pid_val, process);
    }

    pub fn remove_instance(&mut self, pid: pid_t) -> Result<()> {
        let instance = self.instance(pid)?;
        self.instances.remove(&pid);
        instance.borrow_mut().state_mut().group = Weak::new();
        Ok(())
    }

    /// Swaps a fresh process in at an existing pid (execve).
    pub fn replace_instance(&mut self, pid: pid_t, process: ProcessSharedPtr) {
        self.add_instance(process, Some(pid), None);
    }

    pub fn curr_pid(&self) -> pid_t {
        self.curr_pid
    }

    pub fn set_curr_pid(&mut self, pid: pid_t) {
        self.curr_pid = pid;
    }

    pub fn next_pid(&self) -> pid_t {
        self.next_pid
    }

    pub fn set_next_pid(&mut self, pid: pid_t) {
        self.next_pid = pid;
    }

    pub fn stop(&mut self) -> Result<()> {
        self.trigger_stop = true;
        self.stop_curr()
    }

    pub fn stop_curr(&self) -> Result<()> {
        let instance = self.instance(self.curr_pid)?;
        let mut instance = instance.borrow_mut();
        crate::process::stop(&mut instance.uc)
    }

    /// Drives every live process round-robin until the group is empty or a
    /// stop is requested. A process that terminates with a live parent
    /// becomes a zombie and raises SIGCHLD on the parent; an orphaned
    /// terminated process is collected immediately.
    pub fn run(group: &ArionGroupSharedPtr) -> Result<()> {
        group.borrow_mut().trigger_stop = false;
        loop {
            let snapshot = {
                let g = group.borrow();
                if g.trigger_stop || g.instances.is_empty() {
                    return Ok(());
                }
                g.instances()
            };
            for (pid, process) in snapshot {
                if group.borrow().trigger_stop {
                    return Ok(());
                }
                // The table may have changed under us (execve, reaping).
                let current = match group.borrow().instances.get(&pid) {
                    Some(p) if Rc::ptr_eq(p, &process) => p.clone(),
                    _ => continue,
                };

                let (zombie, stopped, parent) = {
                    let p = current.borrow();
                    let state = p.state();
                    (state.run.zombie, state.run.stopped, state.parent)
                };
                let parent_alive = parent
                    .map(|ppid| group.borrow().has_instance(ppid))
                    .unwrap_or(false);

                if !zombie && !stopped {
                    group.borrow_mut().set_curr_pid(pid);
                    let multi_process = group.borrow().count() > 1;
                    let more_work = current.borrow_mut().run_current(multi_process)?;
                    if !more_work {
                        if parent_alive {
                            current.borrow_mut().state_mut().run.zombie = true;
                            let parent_proc = group.borrow().instance(parent.unwrap())?;
                            let mut parent_proc = parent_proc.borrow_mut();
                            crate::process::send_signal(&mut parent_proc.uc, pid, libc::SIGCHLD)?;
                        } else {
                            ArionGroup::orphan_children(group, &current);
                            group.borrow_mut().remove_instance(pid)?;
                            continue;
                        }
                    }
                    current.borrow_mut().state_mut().run.start = None;
                } else if !parent_alive {
                    ArionGroup::orphan_children(group, &current);
                    group.borrow_mut().remove_instance(pid)?;
                }
            }
        }
    }

    /// Detaches every child of a process being collected.
    fn orphan_children(group: &ArionGroupSharedPtr, process: &ProcessSharedPtr) {
        let children: Vec<pid_t> = {
            let p = process.borrow();
            p.state().children.clone()
        };
        for child_pid in children {
            if let Ok(child) = group.borrow().instance(child_pid) {
                if let Ok(mut child) = child.try_borrow_mut() {
                    child.state_mut().parent = None;
                }
            }
        }
        process.borrow_mut().state_mut().children.clear();
    }
}

/// Registers a parent/child relation between two processes in the group.
pub fn link_parent_child(parent: &ProcessSharedPtr, child: &ProcessSharedPtr) -> pid_t {
    let parent_pid = parent.borrow().pid();
    let child_pid = child.borrow().pid();
    child.borrow_mut().state_mut().parent = Some(parent_pid);
    parent.borrow_mut().state_mut().children.push(child_pid);
    child_pid
}

/// Convenience: builds a group, adds `process` and runs to completion.
pub fn run_single(process: ProcessSharedPtr) -> Result<()> {
    let group = ArionGroup::new();
    group.borrow_mut().add_instance(process, None, None);
    ArionGroup::run(&group)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_issuance_is_monotonic() {
        let group = ArionGroup::new();
        let mut g = group.borrow_mut();
        assert_eq!(g.next_pid(), 1);
        g.set_next_pid(41);
        assert_eq!(g.next_pid(), 41);
        assert!(!g.has_instance(1));
        assert!(g.instance(1).is_err());
    }
}
