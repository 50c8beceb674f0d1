//! Run-once initialization.

use std::cell::Cell;

/// Runs a closure at most once.
///
/// Tasks only switch at await points, so a synchronous closure can never
/// be observed half-done by another task.
#[derive(Debug, Default)]
pub struct Once {
    done: Cell<bool>,
}

impl Once {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls `f` if no earlier call has. Returns true if `f` ran.
    pub fn call_once<F: FnOnce()>(&self, f: F) -> bool {
        if self.done.replace(true) {
            return false;
        }
        f();
        true
    }

    pub fn is_completed(&self) -> bool {
        self.done.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::run;
    use std::rc::Rc;

    #[test]
    fn test_call_once_runs_single_time_across_tasks() {
        run(|sim| async move {
            let once = Rc::new(Once::new());
            let calls = Rc::new(Cell::new(0));
            for _ in 0..4 {
                let (once, calls) = (once.clone(), calls.clone());
                sim.spawn(async move {
                    once.call_once(|| calls.set(calls.get() + 1));
                });
            }
            sim.wait().await;
            assert_eq!(calls.get(), 1);
            assert!(once.is_completed());
        })
        .unwrap();
    }

    #[test]
    fn test_second_call_reports_skip() {
        let once = Once::new();
        assert!(once.call_once(|| {}));
        assert!(!once.call_once(|| unreachable!()));
    }
}
