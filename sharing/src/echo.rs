//! Echo detection for synchronously observable backends
//!
//! While a cell is inside a synchronous call into its backend it holds an
//! [`EchoScope`]. A subscription push that arrives on the same thread during
//! that call was caused by the cell itself and must not be applied again.

use std::cell::RefCell;

thread_local! {
    static ACTIVE: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Marks `token` as "calling into its backend" on this thread until dropped
pub(crate) struct EchoScope {
    token: usize,
}

impl EchoScope {
    pub(crate) fn enter(token: usize) -> Self {
        ACTIVE.with(|active| active.borrow_mut().push(token));
        Self { token }
    }
}

impl Drop for EchoScope {
    fn drop(&mut self) {
        ACTIVE.with(|active| {
            let mut active = active.borrow_mut();
            if let Some(index) = active.iter().rposition(|token| *token == self.token) {
                active.remove(index);
            }
        });
    }
}

/// Whether a push for `token` on this thread is an echo of its own call
pub(crate) fn is_echo(token: usize) -> bool {
    ACTIVE.with(|active| active.borrow().contains(&token))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_is_thread_local_and_nested() {
        assert!(!is_echo(7));
        let outer = EchoScope::enter(7);
        {
            let _inner = EchoScope::enter(7);
            assert!(is_echo(7));
        }
        assert!(is_echo(7));
        std::thread::spawn(|| assert!(!is_echo(7))).join().unwrap();
        drop(outer);
        assert!(!is_echo(7));
    }
}
