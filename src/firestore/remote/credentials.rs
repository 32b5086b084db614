use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::firestore::core::User;
use crate::firestore::error::FirestoreResult;

pub type CredentialChangeListener = Arc<dyn Fn(User) + Send + Sync>;

/// An auth token and the user it was minted for.
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    pub value: String,
    pub user: User,
}

impl Debug for Token {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("value", &"<redacted>")
            .field("user", &self.user)
            .finish()
    }
}

/// Supplies auth tokens for stream connections.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait CredentialsProvider: Send + Sync + 'static {
    /// The current token; `None` when signed out.
    async fn get_token(&self) -> FirestoreResult<Option<Token>>;

    /// Forces the next [`Self::get_token`] to refresh instead of using a cached token.
    fn invalidate_token(&self);

    /// Registers the callback invoked with the initial user and on every user change.
    fn set_change_listener(&self, listener: CredentialChangeListener);

    fn remove_change_listener(&self);
}

/// Credentials for an unauthenticated client.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyCredentialsProvider;

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl CredentialsProvider for EmptyCredentialsProvider {
    async fn get_token(&self) -> FirestoreResult<Option<Token>> {
        Ok(None)
    }

    fn invalidate_token(&self) {}

    fn set_change_listener(&self, listener: CredentialChangeListener) {
        listener(User::unauthenticated());
    }

    fn remove_change_listener(&self) {}
}

/// A fixed token for a user that can be switched at runtime. Counts forced refreshes.
#[derive(Default)]
pub struct StaticCredentialsProvider {
    user: Mutex<User>,
    token: Mutex<Option<String>>,
    force_refresh: AtomicBool,
    refresh_count: AtomicUsize,
    listener: Mutex<Option<CredentialChangeListener>>,
}

impl Debug for StaticCredentialsProvider {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticCredentialsProvider")
            .field("refresh_count", &self.refresh_count())
            .finish()
    }
}

impl StaticCredentialsProvider {
    pub fn new(user: User, token: impl Into<String>) -> Self {
        Self {
            user: Mutex::new(user),
            token: Mutex::new(Some(token.into())),
            ..Self::default()
        }
    }

    /// Switches to `user` and notifies the registered listener.
    pub fn change_user(&self, user: User, token: Option<String>) {
        *self.user.lock().unwrap_or_else(|poison| poison.into_inner()) = user.clone();
        *self.token.lock().unwrap_or_else(|poison| poison.into_inner()) = token;
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone();
        if let Some(listener) = listener {
            listener(user);
        }
    }

    /// How many tokens were fetched after an invalidation.
    pub fn refresh_count(&self) -> usize {
        self.refresh_count.load(Ordering::SeqCst)
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl CredentialsProvider for StaticCredentialsProvider {
    async fn get_token(&self) -> FirestoreResult<Option<Token>> {
        if self.force_refresh.swap(false, Ordering::SeqCst) {
            self.refresh_count.fetch_add(1, Ordering::SeqCst);
        }
        let user = self.user.lock().unwrap_or_else(|poison| poison.into_inner()).clone();
        let token = self.token.lock().unwrap_or_else(|poison| poison.into_inner()).clone();
        Ok(token.map(|value| Token { value, user }))
    }

    fn invalidate_token(&self) {
        self.force_refresh.store(true, Ordering::SeqCst);
    }

    fn set_change_listener(&self, listener: CredentialChangeListener) {
        let user = self.user.lock().unwrap_or_else(|poison| poison.into_inner()).clone();
        *self.listener.lock().unwrap_or_else(|poison| poison.into_inner()) = Some(Arc::clone(&listener));
        listener(user);
    }

    fn remove_change_listener(&self) {
        self.listener
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .take();
    }
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn invalidation_forces_one_refresh() {
        let provider = StaticCredentialsProvider::new(User::new("alice"), "token-1");
        assert_eq!(provider.get_token().await.unwrap().unwrap().value, "token-1");
        provider.invalidate_token();
        provider.get_token().await.unwrap();
        provider.get_token().await.unwrap();
        assert_eq!(provider.refresh_count(), 1);
    }

    #[tokio::test]
    async fn listener_sees_initial_and_changed_users() {
        let provider = StaticCredentialsProvider::new(User::new("alice"), "token-1");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        provider.set_change_listener(Arc::new(move |user: User| sink.lock().unwrap().push(user)));
        provider.change_user(User::new("bob"), None);

        assert_eq!(*seen.lock().unwrap(), vec![User::new("alice"), User::new("bob")]);
        assert_eq!(provider.get_token().await.unwrap(), None);
    }
}
