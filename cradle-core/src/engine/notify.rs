//! Notify hooks for dump/restore invocations.
//!
//! Collaborators (middleware, plugins, the daemon itself) register
//! callbacks keyed by lifecycle point. Callbacks run in registration
//! order, synchronously with the operation; the first failure aborts the
//! remaining hooks and becomes the operation's error. A hook is part of
//! the operation contract, not a side channel.

use std::path::Path;

use crate::error::CradleResult;

pub type InitHook = Box<dyn FnMut() -> CradleResult<()> + Send>;
pub type DirHook = Box<dyn FnMut(&Path) -> CradleResult<()> + Send>;
/// Post-dump hooks also receive whether the dump succeeded.
pub type PostDumpHook = Box<dyn FnMut(&Path, bool) -> CradleResult<()> + Send>;
pub type PidHook = Box<dyn FnMut(u32) -> CradleResult<()> + Send>;

/// Ordered hook lists, one per lifecycle point.
#[derive(Default)]
pub struct NotifyHooks {
    on_initialize: Vec<InitHook>,
    pre_dump: Vec<DirHook>,
    post_dump: Vec<PostDumpHook>,
    pre_restore: Vec<DirHook>,
    post_restore: Vec<PidHook>,
}

impl NotifyHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_initialize(&mut self, hook: impl FnMut() -> CradleResult<()> + Send + 'static) {
        self.on_initialize.push(Box::new(hook));
    }

    pub fn pre_dump(&mut self, hook: impl FnMut(&Path) -> CradleResult<()> + Send + 'static) {
        self.pre_dump.push(Box::new(hook));
    }

    pub fn post_dump(&mut self, hook: impl FnMut(&Path, bool) -> CradleResult<()> + Send + 'static) {
        self.post_dump.push(Box::new(hook));
    }

    pub fn pre_restore(&mut self, hook: impl FnMut(&Path) -> CradleResult<()> + Send + 'static) {
        self.pre_restore.push(Box::new(hook));
    }

    pub fn post_restore(&mut self, hook: impl FnMut(u32) -> CradleResult<()> + Send + 'static) {
        self.post_restore.push(Box::new(hook));
    }

    pub fn run_initialize(&mut self) -> CradleResult<()> {
        for hook in &mut self.on_initialize {
            hook()?;
        }
        Ok(())
    }

    pub fn run_pre_dump(&mut self, dir: &Path) -> CradleResult<()> {
        for hook in &mut self.pre_dump {
            hook(dir)?;
        }
        Ok(())
    }

    pub fn run_post_dump(&mut self, dir: &Path, success: bool) -> CradleResult<()> {
        for hook in &mut self.post_dump {
            hook(dir, success)?;
        }
        Ok(())
    }

    pub fn run_pre_restore(&mut self, dir: &Path) -> CradleResult<()> {
        for hook in &mut self.pre_restore {
            hook(dir)?;
        }
        Ok(())
    }

    pub fn run_post_restore(&mut self, pid: u32) -> CradleResult<()> {
        for hook in &mut self.post_restore {
            hook(pid)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CradleError;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_hooks_run_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut hooks = NotifyHooks::new();

        for i in 0..3 {
            let order = Arc::clone(&order);
            hooks.pre_dump(move |_| {
                order.lock().unwrap().push(i);
                Ok(())
            });
        }

        hooks.run_pre_dump(Path::new("/tmp")).unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_hook_failure_aborts_remaining() {
        let ran = Arc::new(Mutex::new(Vec::new()));
        let mut hooks = NotifyHooks::new();

        {
            let ran = Arc::clone(&ran);
            hooks.post_restore(move |pid| {
                ran.lock().unwrap().push(pid);
                Err(CradleError::Unavailable {
                    reason: "boom".to_string(),
                })
            });
        }
        {
            let ran = Arc::clone(&ran);
            hooks.post_restore(move |pid| {
                ran.lock().unwrap().push(pid + 1000);
                Ok(())
            });
        }

        assert!(hooks.run_post_restore(7).is_err());
        // Only the first hook ran.
        assert_eq!(*ran.lock().unwrap(), vec![7]);
    }

    #[test]
    fn test_post_dump_receives_outcome() {
        let seen = Arc::new(Mutex::new(None));
        let mut hooks = NotifyHooks::new();
        {
            let seen = Arc::clone(&seen);
            hooks.post_dump(move |_, success| {
                *seen.lock().unwrap() = Some(success);
                Ok(())
            });
        }
        hooks.run_post_dump(Path::new("/tmp"), false).unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(false));
    }
}
