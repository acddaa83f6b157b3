//! The bearer-token collaborator.

use std::future::Future;
use std::pin::Pin;

/// Supplies the bearer token used on every outbound request, and is told
/// when a token has been rejected by the gateway so it can refresh it.
pub trait AuthDelegate: Send + Sync {
    /// Fetch the current token. Expected to be fast; called inline before
    /// every downchannel/message/ping request is created.
    fn token(&self) -> Pin<Box<dyn Future<Output = String> + Send + '_>>;

    /// Called when a `403` response names `token` as the rejected credential.
    fn on_auth_failure(&self, token: &str);
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// An `AuthDelegate` double that returns a fixed token and records
    /// rejected tokens for assertions.
    pub(crate) struct StaticAuthDelegate {
        token: Mutex<String>,
        rejected: Mutex<Vec<String>>,
    }

    impl StaticAuthDelegate {
        pub(crate) fn new(token: impl Into<String>) -> StaticAuthDelegate {
            StaticAuthDelegate {
                token: Mutex::new(token.into()),
                rejected: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn rejected_tokens(&self) -> Vec<String> {
            self.rejected.lock().unwrap().clone()
        }

        pub(crate) fn set_token(&self, token: impl Into<String>) {
            *self.token.lock().unwrap() = token.into();
        }
    }

    impl AuthDelegate for StaticAuthDelegate {
        fn token(&self) -> Pin<Box<dyn Future<Output = String> + Send + '_>> {
            let token = self.token.lock().unwrap().clone();
            Box::pin(async move { token })
        }

        fn on_auth_failure(&self, token: &str) {
            self.rejected.lock().unwrap().push(token.to_owned());
        }
    }
}
