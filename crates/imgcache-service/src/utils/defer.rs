/// Runs the wrapped closure exactly once, when dropped.
pub struct CallOnDrop<F: FnOnce()> {
    f: Option<F>,
}

impl<F: FnOnce()> Drop for CallOnDrop<F> {
    fn drop(&mut self) {
        if let Some(f) = self.f.take() {
            f();
        }
    }
}

/// Schedules `f` to run when the returned guard goes out of scope.
///
/// The closure also runs when the owning future is dropped before completion, which makes this
/// the tool of choice for releasing registrations on every exit path.
pub fn defer<F: FnOnce()>(f: F) -> CallOnDrop<F> {
    CallOnDrop { f: Some(f) }
}
