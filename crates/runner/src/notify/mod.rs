//! Operator notification contract.  The delivery transport (a Slack webhook
//! in production deployments) stays outside this crate; the pipeline only
//! ever talks to the [`Notifier`] trait.

/// Fire-and-forget operator notifications.  `dest` is the per-experiment
/// destination override and may be empty, in which case the implementation's
/// configured default applies.
pub trait Notifier: Send + Sync {
    fn info(&self, dest: &str, msg: &str);
    fn warning(&self, dest: &str, msg: &str);
}

/// Default notifier that mirrors messages into the process log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn info(&self, _dest: &str, msg: &str) {
        log::info!("{msg}");
    }

    fn warning(&self, _dest: &str, msg: &str) {
        log::warn!("{msg}");
    }
}

#[cfg(test)]
pub mod test_support {
    use super::Notifier;
    use std::sync::Mutex;

    /// Captures notifications for assertions.
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub messages: Mutex<Vec<(String, String)>>,
    }

    impl Notifier for RecordingNotifier {
        fn info(&self, _dest: &str, msg: &str) {
            self.messages
                .lock()
                .unwrap()
                .push(("info".to_string(), msg.to_string()));
        }

        fn warning(&self, _dest: &str, msg: &str) {
            self.messages
                .lock()
                .unwrap()
                .push(("warning".to_string(), msg.to_string()));
        }
    }
}
