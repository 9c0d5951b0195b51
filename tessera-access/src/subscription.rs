// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::resolver::AccessSet;

/// Registered callback on the access set of a controller.
///
/// The callback stops being invoked once this is unsubscribed or dropped.
#[derive(Debug)]
pub struct Subscription {
    token: CancellationToken,
}

impl Subscription {
    /// Invoke the callback with the current value right away, then from a background task after
    /// every change.
    pub(crate) fn spawn<T, F>(
        mut rx: watch::Receiver<Arc<AccessSet>>,
        project: fn(&AccessSet) -> &T,
        mut callback: F,
    ) -> Self
    where
        T: 'static,
        F: FnMut(&T) + Send + 'static,
    {
        let token = CancellationToken::new();

        let current = rx.borrow_and_update().clone();
        callback(project(&current));

        let task_token = token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = task_token.cancelled() => break,
                    changed = rx.changed() => {
                        // Sender is gone when the controller's index was dropped.
                        if changed.is_err() {
                            break;
                        }
                        let current = rx.borrow_and_update().clone();
                        callback(project(&current));
                    }
                }
            }
        });

        Self { token }
    }

    pub fn unsubscribe(self) {
        self.token.cancel();
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
