/// A guard that runs a cleanup function when dropped.
///
/// Cleanup runs on every exit path: normal return, early `?`, panic, or the
/// owning future being cancelled.
///
/// # Examples
///
/// ```
/// use hostgate::utils::guard::Guard;
///
/// let _guard = Guard::with(|| {
///     println!("Cleanup executed!");
/// });
/// ```
pub struct Guard<AtExit: FnOnce()> {
    exit_cb: Option<AtExit>,
}

impl<F: FnOnce()> Guard<F> {
    /// Creates a guard that runs `f` when dropped.
    pub fn with(f: F) -> Self {
        Self { exit_cb: Some(f) }
    }

    /// Drop the guard without running its cleanup.
    pub fn disarm(mut self) {
        self.exit_cb = None;
    }
}

impl<F: FnOnce()> Drop for Guard<F> {
    fn drop(&mut self) {
        if let Some(f) = self.exit_cb.take() {
            f()
        }
    }
}
